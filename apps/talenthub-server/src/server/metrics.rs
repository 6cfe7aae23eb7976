use std::{collections::HashMap, fmt::Write as _};

use super::core::{MetricsState, METRICS_STATE};

pub(crate) const REALTIME_DROP_REASON_OVERSIZED_OUTBOUND: &str = "oversized_outbound";
pub(crate) const REALTIME_DROP_REASON_SERIALIZE_ERROR: &str = "serialize_error";

pub(crate) fn metrics_state() -> &'static MetricsState {
    METRICS_STATE.get_or_init(MetricsState::default)
}

fn snapshot<K: Clone>(counters: &std::sync::Mutex<HashMap<K, u64>>) -> HashMap<K, u64> {
    counters
        .lock()
        .map_or_else(|_| HashMap::new(), |guard| guard.clone())
}

fn write_family(output: &mut String, name: &str, help: &str, mut rows: Vec<(String, u64)>) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    rows.sort();
    for (labels, value) in rows {
        let _ = writeln!(output, "{name}{{{labels}}} {value}");
    }
}

pub(crate) fn render_metrics() -> String {
    let state = metrics_state();
    let mut output = String::new();

    write_family(
        &mut output,
        "talenthub_auth_failures_total",
        "Count of auth-related failures by reason",
        snapshot(&state.auth_failures)
            .into_iter()
            .map(|(reason, value)| (format!("reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_rate_limit_hits_total",
        "Count of rate-limit rejections by surface",
        snapshot(&state.rate_limit_hits)
            .into_iter()
            .map(|((surface, reason), value)| {
                (format!("surface=\"{surface}\",reason=\"{reason}\""), value)
            })
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_ws_disconnects_total",
        "Count of websocket disconnect events by reason",
        snapshot(&state.ws_disconnects)
            .into_iter()
            .map(|(reason, value)| (format!("reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_realtime_events_emitted_total",
        "Count of delivered realtime events by scope and type",
        snapshot(&state.realtime_events_emitted)
            .into_iter()
            .map(|((scope, event_type), value)| {
                (
                    format!("scope=\"{scope}\",event_type=\"{event_type}\""),
                    value,
                )
            })
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_realtime_events_dropped_total",
        "Count of dropped realtime events by scope, type, and reason",
        snapshot(&state.realtime_events_dropped)
            .into_iter()
            .map(|((scope, event_type, reason), value)| {
                (
                    format!("scope=\"{scope}\",event_type=\"{event_type}\",reason=\"{reason}\""),
                    value,
                )
            })
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_realtime_events_parse_rejected_total",
        "Count of inbound realtime frames rejected during parsing by scope and reason",
        snapshot(&state.realtime_events_parse_rejected)
            .into_iter()
            .map(|((scope, reason), value)| (format!("scope=\"{scope}\",reason=\"{reason}\""), value))
            .collect(),
    );
    write_family(
        &mut output,
        "talenthub_side_effect_failures_total",
        "Count of best-effort side effects that failed by collaborator and operation",
        snapshot(&state.side_effect_failures)
            .into_iter()
            .map(|((collaborator, operation), value)| {
                (
                    format!("collaborator=\"{collaborator}\",operation=\"{operation}\""),
                    value,
                )
            })
            .collect(),
    );

    output
}

pub(crate) fn record_auth_failure(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().auth_failures.lock() {
        *counters.entry(reason).or_insert(0) += 1;
    }
}

pub(crate) fn record_rate_limit_hit(surface: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().rate_limit_hits.lock() {
        *counters.entry((surface, reason)).or_insert(0) += 1;
    }
}

pub(crate) fn record_ws_disconnect(reason: &'static str) {
    if let Ok(mut counters) = metrics_state().ws_disconnects.lock() {
        *counters.entry(reason).or_insert(0) += 1;
    }
}

pub(crate) fn record_realtime_event_emitted(scope: &'static str, event_type: &str) {
    if let Ok(mut counters) = metrics_state().realtime_events_emitted.lock() {
        *counters
            .entry((scope.to_owned(), event_type.to_owned()))
            .or_insert(0) += 1;
    }
}

pub(crate) fn record_realtime_event_dropped(
    scope: &'static str,
    event_type: &str,
    reason: &'static str,
) {
    if let Ok(mut counters) = metrics_state().realtime_events_dropped.lock() {
        *counters
            .entry((scope.to_owned(), event_type.to_owned(), reason.to_owned()))
            .or_insert(0) += 1;
    }
}

pub(crate) fn record_realtime_event_serialize_error(scope: &'static str, event_type: &str) {
    record_realtime_event_dropped(scope, event_type, REALTIME_DROP_REASON_SERIALIZE_ERROR);
}

pub(crate) fn record_realtime_event_oversized_outbound(scope: &'static str, event_type: &str) {
    record_realtime_event_dropped(scope, event_type, REALTIME_DROP_REASON_OVERSIZED_OUTBOUND);
}

pub(crate) fn record_realtime_event_parse_rejected(scope: &'static str, reason: &'static str) {
    if let Ok(mut counters) = metrics_state().realtime_events_parse_rejected.lock() {
        *counters
            .entry((scope.to_owned(), reason.to_owned()))
            .or_insert(0) += 1;
    }
}

/// Counts a failed best-effort side effect (publish, mail, storage cleanup).
pub(crate) fn record_side_effect_failure(collaborator: &'static str, operation: &'static str) {
    if let Ok(mut counters) = metrics_state().side_effect_failures.lock() {
        *counters.entry((collaborator, operation)).or_insert(0) += 1;
    }
}
