use crate::server::metrics::record_realtime_event_emitted;

pub(crate) fn emit_realtime_delivery_metrics(
    scope: &'static str,
    event_type: &'static str,
    delivered: usize,
) -> usize {
    if delivered == 0 {
        return 0;
    }

    tracing::debug!(event = "realtime.event.emit", scope, event_type, delivered);
    for _ in 0..delivered {
        record_realtime_event_emitted(scope, event_type);
    }

    delivered
}

#[cfg(test)]
mod tests {
    use super::emit_realtime_delivery_metrics;

    #[test]
    fn reports_delivered_count() {
        assert_eq!(emit_realtime_delivery_metrics("conversation", "message:new", 0), 0);
        assert_eq!(emit_realtime_delivery_metrics("conversation", "message:new", 3), 3);
    }
}
