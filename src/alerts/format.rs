use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, FixedOffset, Utc};

use crate::detector::{Anomaly, Severity};
use crate::{PollOutcome, PollResult};

fn meter_label(names: &BTreeMap<u32, String>, meter_id: u32) -> String {
    names
        .get(&meter_id)
        .cloned()
        .unwrap_or_else(|| format!("Unknown ({meter_id})"))
}

fn value(result: Option<f64>) -> String {
    format!("{:.2}", result.unwrap_or(0.0))
}

/// One message for a batch of anomalies that passed suppression
///
/// Each entry carries the number of anomalies suppressed for its key since
/// the previous message.
pub fn format_anomalies(batch: &[(Anomaly, u32)], names: &BTreeMap<u32, String>) -> String {
    let mut message = String::from("⚠️ Substation anomalies detected\n");

    for (anomaly, suppressed) in batch {
        let icon = match anomaly.severity {
            Severity::Critical => "🔴",
            Severity::Warning => "🟠",
        };
        let _ = write!(
            message,
            "\n{icon} {} (ID: {}) - {}",
            meter_label(names, anomaly.meter_id),
            anomaly.meter_id,
            anomaly.rule
        );
        if let Some(observed) = anomaly.observed {
            let _ = write!(message, ": {} = {observed:.2}", anomaly.parameter);
        }
        let _ = write!(
            message,
            " ({}) at {}",
            anomaly.detail,
            anomaly.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        if *suppressed > 0 {
            let _ = write!(message, " [{suppressed} similar suppressed]");
        }
    }

    message
}

/// Summary of the latest poll result of every meter
pub fn format_digest(
    now: DateTime<Utc>,
    utc_offset_minutes: i32,
    latest: &BTreeMap<u32, PollResult>,
    names: &BTreeMap<u32, String>,
) -> String {
    let local = FixedOffset::east_opt(utc_offset_minutes * 60)
        .map(|offset| now.with_timezone(&offset).naive_local())
        .unwrap_or_else(|| now.naive_utc());

    let mut lines = vec![
        "⚡ Substation Monitoring System ⚡".to_string(),
        format!(
            "⚡ Latest Meter Readings date: {} time {} ⚡",
            local.format("%d/%m/%Y"),
            local.format("%H.%M")
        ),
        String::new(),
    ];

    if names.is_empty() {
        lines.push("No meter readings available to report.".to_string());
    }

    for (meter_id, name) in names {
        let result = latest.get(meter_id);
        let reading = result.and_then(|r| r.reading());

        let status = match result.map(|r| &r.outcome) {
            None => "No Data".to_string(),
            Some(PollOutcome::Failed(_)) => "Communication Failed".to_string(),
            Some(PollOutcome::Reading(reading)) => {
                let totals = ["watts_total", "current_total", "va_total", "var_total"];
                let present: Vec<f64> = totals.iter().filter_map(|p| reading.get(p)).collect();
                if !present.is_empty() && present.iter().all(|v| *v == 0.0) {
                    "POWER_FAIL".to_string()
                } else {
                    "OK".to_string()
                }
            }
        };
        lines.push(format!("* {name} (ID: {meter_id}) - Status: {status} *"));

        let get = |parameter: &str| reading.and_then(|r| r.get(parameter));

        if get("v_ry").is_some() {
            lines.push(format!(
                "  Line Voltage: {}/{}/{}",
                value(get("v_ry")),
                value(get("v_yb")),
                value(get("v_br"))
            ));
            lines.push(format!(
                "  Phase voltage: {}/{}/{}",
                value(get("v_r")),
                value(get("v_y")),
                value(get("v_b"))
            ));
        }
        lines.push(format!(
            "  Current: {}/{}/{}",
            value(get("current_r").or(get("current"))),
            value(get("current_y")),
            value(get("current_b"))
        ));
        lines.push(format!(
            "  KW Total: {}",
            value(get("watts_total").or(get("active_power")))
        ));
        lines.push(format!(
            "  KWh: {}",
            value(get("wh_import").or(get("energy_total")))
        ));
        lines.push(format!(
            "  PF: {}",
            value(get("pf_avg_import").or(get("power_factor")))
        ));
        lines.push(String::new());
    }

    lines.join("\n")
}
