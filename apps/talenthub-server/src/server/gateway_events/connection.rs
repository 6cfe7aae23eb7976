use serde::Serialize;
use talenthub_protocol::{
    ChannelName, CONNECTION_ESTABLISHED_EVENT, SUBSCRIPTION_ERROR_EVENT,
    SUBSCRIPTION_SUCCEEDED_EVENT,
};

use super::{envelope::try_build_event, GatewayEvent};

#[derive(Serialize)]
struct ConnectionEstablishedPayload<'a> {
    socket_id: &'a str,
    activity_timeout: u64,
}

#[derive(Serialize)]
struct SubscriptionSucceededPayload<'a> {
    channel: &'a str,
}

#[derive(Serialize)]
struct SubscriptionErrorPayload<'a> {
    channel: Option<&'a str>,
    reason: &'a str,
}

pub(crate) fn try_connection_established(
    socket_id: &str,
    activity_timeout_secs: u64,
) -> anyhow::Result<GatewayEvent> {
    try_build_event(
        CONNECTION_ESTABLISHED_EVENT,
        None,
        ConnectionEstablishedPayload {
            socket_id,
            activity_timeout: activity_timeout_secs,
        },
    )
}

pub(crate) fn try_subscription_succeeded(channel: &ChannelName) -> anyhow::Result<GatewayEvent> {
    try_build_event(
        SUBSCRIPTION_SUCCEEDED_EVENT,
        Some(channel),
        SubscriptionSucceededPayload {
            channel: channel.as_str(),
        },
    )
}

/// `channel` is `None` when the requested name could not be parsed.
pub(crate) fn try_subscription_error(
    channel: Option<&str>,
    reason: &str,
) -> anyhow::Result<GatewayEvent> {
    try_build_event(
        SUBSCRIPTION_ERROR_EVENT,
        None,
        SubscriptionErrorPayload { channel, reason },
    )
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use talenthub_protocol::ChannelName;

    use super::{try_connection_established, try_subscription_error, try_subscription_succeeded};

    fn parse(payload: &str) -> Value {
        serde_json::from_str(payload).expect("event payload should be valid json")
    }

    #[test]
    fn connection_frames_carry_socket_and_channel() {
        let established = parse(
            &try_connection_established("123.456", 30)
                .expect("event should build")
                .payload,
        );
        assert_eq!(established["t"], "connection_established");
        assert_eq!(established["d"]["socket_id"], "123.456");
        assert!(established.get("ch").is_none());

        let channel = ChannelName::for_conversation("c9");
        let succeeded = parse(
            &try_subscription_succeeded(&channel)
                .expect("event should build")
                .payload,
        );
        assert_eq!(succeeded["d"]["channel"], "private-conv-c9");

        let error = parse(
            &try_subscription_error(None, "invalid_channel")
                .expect("event should build")
                .payload,
        );
        assert!(error["d"]["channel"].is_null());
        assert_eq!(error["d"]["reason"], "invalid_channel");
    }
}
