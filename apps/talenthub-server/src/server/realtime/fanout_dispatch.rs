use uuid::Uuid;

use crate::server::{
    core::ConnectionSubscriptions,
    gateway_events::GatewayEvent,
    metrics::{record_realtime_event_dropped, record_realtime_event_oversized_outbound},
};

const SCOPE: &str = "conversation";

/// Result of queueing one event on a conversation's listeners.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Fanout {
    pub(crate) delivered: usize,
    pub(crate) slow_consumers: Vec<Uuid>,
}

/// Queues `event` on every listener of one conversation without waiting.
///
/// Listeners whose receiver is gone are pruned. Listeners with a full queue are
/// pruned and returned as slow consumers for the caller to disconnect.
pub(crate) fn fan_out(
    listeners: &mut ConnectionSubscriptions,
    event: &GatewayEvent,
    max_frame_bytes: usize,
) -> Fanout {
    let mut fanout = Fanout::default();
    if event.payload.len() > max_frame_bytes {
        record_realtime_event_oversized_outbound(SCOPE, event.event_type);
        return fanout;
    }

    listeners.retain(|connection_id, sender| {
        match sender.try_send(event.payload.clone()) {
            Ok(()) => {
                fanout.delivered += 1;
                true
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                record_realtime_event_dropped(SCOPE, event.event_type, "closed");
                false
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                record_realtime_event_dropped(SCOPE, event.event_type, "full_queue");
                fanout.slow_consumers.push(*connection_id);
                false
            }
        }
    });
    fanout
}
