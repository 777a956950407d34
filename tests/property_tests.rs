//! Property-based tests for invariants using proptest
//!
//! These tests verify that certain properties hold true for all inputs:
//! - Daily aggregates do not depend on the order readings arrive in
//! - A single flipped bit in a response frame is always detected
//! - An alert key never fires twice within its suppression window

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use proptest::prelude::*;
use substation_monitor::Reading;
use substation_monitor::alerts::suppression::{AlertDeliveryState, Decision};
use substation_monitor::detector::{Anomaly, Rule, Severity};
use substation_monitor::link::frame;
use substation_monitor::storage::AggregateRecord;

fn reading(offset_secs: i64, voltage: f64, current: f64) -> Reading {
    Reading {
        meter_id: 1,
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs),
        values: BTreeMap::from([
            ("v_r".to_string(), voltage),
            ("current_r".to_string(), current),
        ]),
    }
}

// Property: Aggregating a permutation of the same readings gives the same record
proptest! {
    #[test]
    fn prop_aggregate_order_independent(
        samples in prop::collection::vec((180.0f64..280.0, 0.0f64..100.0), 1..50)
            .prop_flat_map(|samples| {
                let shuffled = Just(samples.clone()).prop_shuffle();
                (Just(samples), shuffled)
            })
    ) {
        let (ordered, shuffled) = samples;
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

        let build = |values: &[(f64, f64)]| {
            let readings: Vec<Reading> = values
                .iter()
                .enumerate()
                .map(|(i, (v, c))| reading(i as i64 * 30, *v, *c))
                .collect();
            AggregateRecord::from_readings(1, day, &readings)
        };

        let a = build(&ordered);
        let b = build(&shuffled);

        prop_assert_eq!(a.sample_count, b.sample_count);
        prop_assert_eq!(a.parameters, b.parameters);
    }
}

// Property: Any single-bit corruption of a valid response is rejected
proptest! {
    #[test]
    fn prop_single_bit_flip_rejected(
        registers in prop::collection::vec(any::<u16>(), 1..40),
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let mut response = frame::build_read_response(5, &registers);
        let byte = position.index(response.len());
        response[byte] ^= 1 << bit;

        prop_assert!(frame::parse_read_response(&response, 5, registers.len() as u16).is_err());
    }
}

// Property: Two sends for the same key are always at least one window apart
proptest! {
    #[test]
    fn prop_no_send_within_window(
        gaps in prop::collection::vec(0i64..400, 1..60),
        window in 60u64..900,
    ) {
        let mut state = AlertDeliveryState::new(window, 1);
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();

        let mut at = start;
        let mut last_sent = None;
        let mut suppressed_since_send = 0u32;

        for gap in gaps {
            at += Duration::seconds(gap);
            let anomaly = Anomaly {
                meter_id: 2,
                parameter: "v_b".to_string(),
                observed: Some(200.0),
                rule: Rule::ThresholdViolation,
                detail: "below minimum 216.00".to_string(),
                timestamp: at,
                severity: Severity::Warning,
            };

            match state.observe(&anomaly) {
                Decision::Send { suppressed } => {
                    if let Some(previous) = last_sent {
                        prop_assert!(at - previous >= Duration::seconds(window as i64));
                    }
                    prop_assert_eq!(suppressed, suppressed_since_send);
                    last_sent = Some(at);
                    suppressed_since_send = 0;
                }
                Decision::Suppress { count } => {
                    suppressed_since_send += 1;
                    prop_assert_eq!(count, suppressed_since_send);
                }
                Decision::Duplicate => {
                    prop_assert_eq!(gap, 0);
                }
            }
        }
    }
}
