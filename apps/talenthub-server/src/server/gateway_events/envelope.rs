use anyhow::anyhow;
use serde::Serialize;
use talenthub_protocol::{
    realtime_event_manifest, ChannelName, Envelope, EventType, PROTOCOL_VERSION,
};

/// Serialized realtime frame ready for fan-out.
#[derive(Debug, Clone)]
pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

pub(super) fn try_build_event<T: Serialize>(
    event_type: &'static str,
    channel: Option<&ChannelName>,
    payload: T,
) -> anyhow::Result<GatewayEvent> {
    let manifest = realtime_event_manifest().map_err(|e| anyhow!("realtime manifest: {e}"))?;
    if manifest.get(event_type).is_none() {
        return Err(anyhow!("event type {event_type} is not declared in the manifest"));
    }
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: EventType::try_from(event_type.to_owned())
            .map_err(|e| anyhow!("invalid event type {event_type}: {e}"))?,
        ch: channel.cloned(),
        d: serde_json::to_value(payload)?,
    };
    Ok(GatewayEvent {
        event_type,
        payload: serde_json::to_string(&envelope)?,
    })
}

#[cfg(test)]
mod tests {
    use serde::Serialize;
    use serde_json::Value;
    use talenthub_protocol::ChannelName;

    use super::try_build_event;

    #[derive(Serialize)]
    struct EnvelopeTestPayload<'a> {
        value: &'a str,
    }

    #[test]
    fn events_wrap_payload_in_versioned_envelope() {
        let channel = ChannelName::for_conversation("c1");
        let event = try_build_event("message:new", Some(&channel), EnvelopeTestPayload { value: "ok" })
            .expect("event should build");
        let envelope: Value = serde_json::from_str(&event.payload).expect("valid json");
        assert_eq!(envelope["v"], Value::from(1));
        assert_eq!(envelope["t"], Value::from("message:new"));
        assert_eq!(envelope["ch"], Value::from("private-conv-c1"));
        assert_eq!(envelope["d"]["value"], Value::from("ok"));
    }

    #[test]
    fn invalid_event_types_are_rejected() {
        assert!(try_build_event("Bad Type", None, EnvelopeTestPayload { value: "x" }).is_err());
    }

    #[test]
    fn undeclared_event_types_are_rejected() {
        assert!(try_build_event("typing_started", None, EnvelopeTestPayload { value: "x" }).is_err());
    }
}
