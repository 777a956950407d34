pub mod actors;
pub mod alerts;
pub mod config;
pub mod detector;
pub mod link;
pub mod pipeline;
pub mod register_map;
pub mod storage;
pub mod util;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded sample of a meter
///
/// Readings are immutable once produced by the poller and shared as
/// `Arc<Reading>` between storage and the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub meter_id: u32,

    /// Sample time, truncated to whole seconds (UTC)
    pub timestamp: DateTime<Utc>,

    /// Parameter name → value, in the units of the register map
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    pub fn get(&self, parameter: &str) -> Option<f64> {
        self.values.get(parameter).copied()
    }
}

/// Why a single meter poll failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PollError {
    #[error("no response within {timeout_ms} ms")]
    TransportTimeout { timeout_ms: u64 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("checksum mismatch (computed {computed:#06x}, received {received:#06x})")]
    ChecksumMismatch { computed: u16, received: u16 },

    #[error("meter answered with exception code {0:#04x}")]
    Exception(u8),

    #[error("{parameter} out of range: {value}")]
    DecodeOutOfRange { parameter: String, value: f64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("clock went backwards ({previous} -> {current})")]
    ClockSkew {
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },
}

impl PollError {
    /// Whether the meter link should try the same request again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PollError::TransportTimeout { .. }
                | PollError::MalformedFrame(_)
                | PollError::ChecksumMismatch { .. }
                | PollError::Transport(_)
        )
    }

    /// Whether the failure says the meter could not be talked to
    ///
    /// An exception reply counts; a bad value or a clock step does not.
    pub fn is_link_failure(&self) -> bool {
        self.is_retryable() || matches!(self, PollError::Exception(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollFailure {
    pub error: PollError,

    /// Number of request attempts made before giving up
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Reading(Arc<Reading>),
    Failed(PollFailure),
}

/// Outcome of polling one meter once
///
/// Every poll round yields exactly one of these per enabled meter.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    pub meter_id: u32,
    pub attempted_at: DateTime<Utc>,
    pub outcome: PollOutcome,
}

impl PollResult {
    pub fn reading(&self) -> Option<&Arc<Reading>> {
        match &self.outcome {
            PollOutcome::Reading(reading) => Some(reading),
            PollOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&PollFailure> {
        match &self.outcome {
            PollOutcome::Reading(_) => None,
            PollOutcome::Failed(failure) => Some(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, PollOutcome::Reading(_))
    }
}
