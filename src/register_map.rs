//! Static decode tables for the supported meter types
//!
//! Every meter type maps a contiguous block of holding registers onto named
//! quantities. Each quantity is an IEEE-754 float spread over two 16-bit
//! registers; meters disagree on which word comes first.
//!
//! Addresses here are protocol addresses (the `4xxxx` register number minus
//! 40001), which is what goes on the wire.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::PollError;
use crate::util::round_milli;

/// Values beyond this magnitude are treated as garbage from the meter
const MAX_PLAUSIBLE: f64 = 1e10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    /// Most significant word in the first register
    HighFirst,
    /// Least significant word in the first register
    LowFirst,
}

#[derive(Debug, Clone, Copy)]
pub struct RegisterSpec {
    pub name: &'static str,
    pub address: u16,
    pub word_order: WordOrder,
    pub scale: f64,
    pub min: f64,
    pub max: f64,
}

const fn dmf(name: &'static str, address: u16, max: f64) -> RegisterSpec {
    RegisterSpec {
        name,
        address,
        word_order: WordOrder::LowFirst,
        scale: 1.0,
        min: 0.0,
        max,
    }
}

const fn basic(name: &'static str, address: u16, max: f64) -> RegisterSpec {
    RegisterSpec {
        name,
        address,
        word_order: WordOrder::HighFirst,
        scale: 1.0,
        min: 0.0,
        max,
    }
}

const POWER: f64 = 1_000_000.0;
const CURRENT: f64 = 1000.0;
const LINE_VOLTAGE: f64 = 500.0;
const PHASE_VOLTAGE: f64 = 300.0;
const ENERGY: f64 = f64::INFINITY;

static DMF_REGISTERS: [RegisterSpec; 38] = [
    dmf("watts_total", 100, POWER),
    dmf("watts_r", 102, POWER),
    dmf("watts_y", 104, POWER),
    dmf("watts_b", 106, POWER),
    dmf("var_total", 108, POWER),
    dmf("var_r", 110, POWER),
    dmf("var_y", 112, POWER),
    dmf("var_b", 114, POWER),
    dmf("pf_avg_instant", 116, 1.0),
    dmf("pf_r", 118, 1.0),
    dmf("pf_y", 120, 1.0),
    dmf("pf_b", 122, 1.0),
    dmf("va_total", 124, POWER),
    dmf("va_r", 126, POWER),
    dmf("va_y", 128, POWER),
    dmf("va_b", 130, POWER),
    dmf("vll_avg", 132, LINE_VOLTAGE),
    dmf("v_ry", 134, LINE_VOLTAGE),
    dmf("v_yb", 136, LINE_VOLTAGE),
    dmf("v_br", 138, LINE_VOLTAGE),
    dmf("vln_avg", 140, PHASE_VOLTAGE),
    dmf("v_r", 142, PHASE_VOLTAGE),
    dmf("v_y", 144, PHASE_VOLTAGE),
    dmf("v_b", 146, PHASE_VOLTAGE),
    dmf("current_total", 148, CURRENT),
    dmf("current_r", 150, CURRENT),
    dmf("current_y", 152, CURRENT),
    dmf("current_b", 154, CURRENT),
    dmf("frequency", 156, 60.0),
    dmf("wh_import", 158, ENERGY),
    dmf("vah_import", 160, ENERGY),
    dmf("varh_ind_import", 162, ENERGY),
    dmf("varh_cap_import", 164, ENERGY),
    dmf("wh_export", 166, ENERGY),
    dmf("vah_export", 168, ENERGY),
    dmf("varh_ind_export", 170, ENERGY),
    dmf("varh_cap_export", 172, ENERGY),
    dmf("pf_avg_import", 174, 1.0),
];

static BASIC_REGISTERS: [RegisterSpec; 6] = [
    basic("voltage", 0, PHASE_VOLTAGE),
    basic("current", 2, CURRENT),
    basic("active_power", 4, POWER),
    basic("power_factor", 6, 1.0),
    basic("frequency", 8, 70.0),
    basic("energy_total", 10, ENERGY),
];

/// Supported meter models
///
/// Adding a model means adding a variant and its register table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterType {
    /// Three-phase multifunction meter (38 quantities, low word first)
    Dmf,
    /// Single-phase meter (6 quantities, high word first)
    Basic,
}

impl MeterType {
    pub fn registers(&self) -> &'static [RegisterSpec] {
        match self {
            MeterType::Dmf => &DMF_REGISTERS,
            MeterType::Basic => &BASIC_REGISTERS,
        }
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &'static str> {
        self.registers().iter().map(|spec| spec.name)
    }

    /// First register and register count covering the whole map
    pub fn span(&self) -> (u16, u16) {
        let registers = self.registers();
        let start = registers.iter().map(|r| r.address).min().unwrap_or(0);
        let end = registers.iter().map(|r| r.address + 2).max().unwrap_or(start);
        (start, end - start)
    }

    /// Decode the register block returned for [`MeterType::span`]
    ///
    /// Small negative values are clamped to zero. Anything else outside the
    /// validation range fails the whole reading.
    pub fn decode(&self, registers: &[u16]) -> Result<BTreeMap<String, f64>, PollError> {
        let (start, quantity) = self.span();
        if registers.len() != quantity as usize {
            return Err(PollError::MalformedFrame(format!(
                "expected {quantity} registers, got {}",
                registers.len()
            )));
        }

        let mut values = BTreeMap::new();
        for spec in self.registers() {
            let offset = (spec.address - start) as usize;
            let raw = words_to_f32(registers[offset], registers[offset + 1], spec.word_order);
            let mut value = raw as f64 * spec.scale;

            if !value.is_finite() || value.abs() > MAX_PLAUSIBLE {
                return Err(PollError::DecodeOutOfRange {
                    parameter: spec.name.to_string(),
                    value,
                });
            }

            if value < 0.0 && spec.min >= 0.0 {
                debug!("clamping negative {} ({value}) to zero", spec.name);
                value = 0.0;
            }

            if value < spec.min || value > spec.max {
                return Err(PollError::DecodeOutOfRange {
                    parameter: spec.name.to_string(),
                    value,
                });
            }

            values.insert(spec.name.to_string(), round_milli(value));
        }

        Ok(values)
    }

    /// Build the register image a meter of this type would answer with.
    ///
    /// Parameters missing from `values` are encoded as zero. Used by meter
    /// simulators and tests.
    pub fn encode(&self, values: &BTreeMap<String, f64>) -> Vec<u16> {
        let (start, quantity) = self.span();
        let mut registers = vec![0u16; quantity as usize];

        for spec in self.registers() {
            let value = values.get(spec.name).copied().unwrap_or(0.0) / spec.scale;
            let (first, second) = f32_to_words(value as f32, spec.word_order);
            let offset = (spec.address - start) as usize;
            registers[offset] = first;
            registers[offset + 1] = second;
        }

        registers
    }
}

fn words_to_f32(first: u16, second: u16, order: WordOrder) -> f32 {
    let bits = match order {
        WordOrder::HighFirst => ((first as u32) << 16) | second as u32,
        WordOrder::LowFirst => ((second as u32) << 16) | first as u32,
    };
    f32::from_bits(bits)
}

fn f32_to_words(value: f32, order: WordOrder) -> (u16, u16) {
    let bits = value.to_bits();
    let high = (bits >> 16) as u16;
    let low = bits as u16;
    match order {
        WordOrder::HighFirst => (high, low),
        WordOrder::LowFirst => (low, high),
    }
}
