use std::fmt::Write;

use crate::metrics::Rollup;
use crate::models::{MetricType, MetricValue, Scope, TopArrivalsRecord};

pub fn format_seconds(seconds: f64) -> String {
    let total = seconds.round() as i64;
    let (hours, minutes, secs) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m {secs:02}s")
    }
}

/// Campus rows (all-time or one month) sorted by activity, busiest first.
pub fn campus_rows(rollup: &Rollup, month: Option<&str>) -> Vec<(String, i64, f64)> {
    let mut rows: Vec<(String, i64, f64)> = rollup
        .metrics
        .iter()
        .filter(|(key, _)| {
            key.metric_type == MetricType::CampusActivity
                && key.scope.campus.is_some()
                && key.scope.month.as_deref() == month
        })
        .filter_map(|(key, value)| {
            let MetricValue::CampusActivity { total_events } = value else {
                return None;
            };
            let campus = key.scope.campus.clone()?;
            let avg_wait = match rollup.metric(MetricType::AvgWaitTime, &key.scope) {
                Some(MetricValue::AvgWaitTime {
                    avg_wait_seconds, ..
                }) => *avg_wait_seconds,
                _ => 0.0,
            };
            Some((campus, *total_events, avg_wait))
        })
        .collect();

    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    rows
}

pub fn build_report(
    campus: Option<&str>,
    month: Option<&str>,
    rollup: &Rollup,
    top_arrivals: &[TopArrivalsRecord],
) -> String {
    let scope = Scope {
        campus: campus.map(str::to_string),
        month: month.map(str::to_string),
    };

    let mut output = String::new();
    let _ = writeln!(output, "# Dismissal Dashboard");
    let _ = writeln!(output, "Generated for {scope}");
    let _ = writeln!(output);
    let _ = writeln!(output, "## Activity");

    match rollup.metric(MetricType::CampusActivity, &scope) {
        Some(MetricValue::CampusActivity { total_events }) => {
            let _ = writeln!(output, "- Dismissals: {total_events}");
        }
        _ => {
            let _ = writeln!(output, "No dismissals recorded for this scope.");
        }
    }
    if let Some(MetricValue::AvgWaitTime {
        record_count,
        avg_wait_seconds,
        ..
    }) = rollup.metric(MetricType::AvgWaitTime, &scope)
    {
        let _ = writeln!(
            output,
            "- Average wait: {} across {} pickups",
            format_seconds(*avg_wait_seconds),
            record_count
        );
    }
    match rollup.metric(MetricType::SessionDuration, &scope) {
        Some(MetricValue::SessionDuration {
            days_count,
            avg_session_seconds,
            ..
        }) => {
            let _ = writeln!(
                output,
                "- Average session: {} over {} days",
                format_seconds(*avg_session_seconds),
                days_count
            );
        }
        _ => {
            let _ = writeln!(output, "- Average session: no closed sessions yet");
        }
    }

    if campus.is_none() {
        let rows = campus_rows(rollup, month);
        let _ = writeln!(output);
        let _ = writeln!(output, "## Campuses");
        if rows.is_empty() {
            let _ = writeln!(output, "No campus activity for this scope.");
        } else {
            for (campus, events, avg_wait) in rows.iter() {
                let _ = writeln!(
                    output,
                    "- {}: {} dismissals (avg wait {})",
                    campus,
                    events,
                    format_seconds(*avg_wait)
                );
            }
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Top Arrivals");
    let relevant: Vec<&TopArrivalsRecord> = top_arrivals
        .iter()
        .filter(|record| campus.map_or(true, |campus| record.campus == campus))
        .filter(|record| !record.arrivals.is_empty())
        .collect();

    if relevant.is_empty() {
        let _ = writeln!(output, "No arrivals ranked yet.");
    } else {
        for record in relevant {
            let _ = writeln!(output, "### {} ({})", record.campus, record.month);
            for arrival in record.arrivals.iter().take(5) {
                let _ = writeln!(
                    output,
                    "{}. Car {} at {} ({} visits)",
                    arrival.rank,
                    arrival.car_number,
                    arrival.arrival_time.format("%H:%M:%S"),
                    arrival.visits
                );
            }
        }
    }

    output
}
