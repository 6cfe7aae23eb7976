#![forbid(unsafe_code)]

mod events;

use serde::{Deserialize, Serialize};

pub use events::{
    parse_realtime_event_manifest, realtime_event_manifest, RealtimeEventLifecycle,
    RealtimeEventManifest, RealtimeEventManifestEntry, RealtimeEventManifestError,
    RealtimeEventScope,
};

/// Current realtime envelope version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Maximum allowed realtime payload bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Prefix of every conversation-scoped realtime channel.
pub const CONVERSATION_CHANNEL_PREFIX: &str = "private-conv-";

pub const MESSAGE_NEW_EVENT: &str = "message:new";
pub const MESSAGE_EDITED_EVENT: &str = "message:edited";
pub const MESSAGE_DELETED_EVENT: &str = "message:deleted";
pub const CONNECTION_ESTABLISHED_EVENT: &str = "connection_established";
pub const SUBSCRIPTION_SUCCEEDED_EVENT: &str = "subscription_succeeded";
pub const SUBSCRIPTION_ERROR_EVENT: &str = "subscription_error";
pub const SUBSCRIBE_COMMAND: &str = "subscribe";
pub const UNSUBSCRIBE_COMMAND: &str = "unsubscribe";

/// Response body shared by every HTTP endpoint.
///
/// `data` is omitted when absent; endpoints that answer with an explicit
/// `null` use `ApiEnvelope<Option<T>>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
    #[must_use]
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    #[must_use]
    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

impl ApiEnvelope<()> {
    #[must_use]
    pub fn done(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: None,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message.into()),
        }
    }
}

/// Versioned realtime envelope: `{ v, t, ch?, d }`.
///
/// `ch` names the channel an event was published on and is absent on
/// connection-level frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ch: Option<ChannelName>,
    pub d: T,
}

/// Event type identifier with a strict character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Realtime channel name, e.g. `private-conv-01J...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelName(String);

impl ChannelName {
    /// Channel carrying the live events of one conversation.
    #[must_use]
    pub fn for_conversation(conversation_id: &str) -> Self {
        Self(format!("{CONVERSATION_CHANNEL_PREFIX}{conversation_id}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conversation id addressed by this channel, if it is a conversation channel.
    #[must_use]
    pub fn conversation_id(&self) -> Option<&str> {
        self.0
            .strip_prefix(CONVERSATION_CHANNEL_PREFIX)
            .filter(|id| !id.is_empty())
    }
}

impl TryFrom<String> for ChannelName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_channel_name(&value)?;
        Ok(Self(value))
    }
}

impl From<ChannelName> for String {
    fn from(value: ChannelName) -> Self {
        value.0
    }
}

/// Parse and validate an incoming envelope at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds limits, is malformed JSON,
/// contains an unsupported version, or has an invalid event type.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: envelope.v,
        });
    }

    Ok(envelope)
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | ':'))
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

fn validate_channel_name(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 164;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidChannelName);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '='))
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidChannelName)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("unsupported envelope version: expected={expected} actual={actual}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid event type")]
    InvalidEventType,
    #[error("invalid channel name")]
    InvalidChannelName,
    #[error("invalid json payload")]
    InvalidJson,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

#[cfg(test)]
mod tests {
    use super::{
        parse_envelope, ApiEnvelope, ChannelName, EventType, ProtocolError, PROTOCOL_VERSION,
    };

    #[test]
    fn event_type_accepts_namespaced_identifier() {
        let event_type = EventType::try_from(String::from("message:new")).unwrap();
        assert_eq!(event_type.as_str(), "message:new");
    }

    #[test]
    fn event_type_rejects_invalid_identifier() {
        let error = EventType::try_from(String::from("Message-New")).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidEventType);
    }

    #[test]
    fn conversation_channel_names_round_trip() {
        let channel = ChannelName::for_conversation("01HZX3");
        assert_eq!(channel.as_str(), "private-conv-01HZX3");
        assert_eq!(channel.conversation_id(), Some("01HZX3"));

        let parsed = ChannelName::try_from(String::from("private-conv-01HZX3")).unwrap();
        assert_eq!(parsed, channel);
        assert_eq!(
            ChannelName::try_from(String::from("private-conv-")).unwrap().conversation_id(),
            None
        );
        assert_eq!(
            ChannelName::try_from(String::from("presence users")).unwrap_err(),
            ProtocolError::InvalidChannelName
        );
    }

    #[test]
    fn api_envelope_omits_absent_fields() {
        let ok = serde_json::to_value(ApiEnvelope::ok(serde_json::json!({"id": "x"}))).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": {"id": "x"}}));

        let failure = serde_json::to_value(ApiEnvelope::failure("Not authenticated")).unwrap();
        assert_eq!(
            failure,
            serde_json::json!({"success": false, "message": "Not authenticated"})
        );

        let empty: ApiEnvelope<Option<u8>> = ApiEnvelope::ok(None);
        assert_eq!(
            serde_json::to_value(empty).unwrap(),
            serde_json::json!({"success": true, "data": null})
        );
    }

    #[test]
    fn parse_rejects_unsupported_version() {
        let payload = br#"{"v":99,"t":"subscribe","d":{}}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(
            error,
            ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: 99,
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let payload = br#"{"v":1,"t":"subscribe","d":{},"extra":1}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidJson);
    }

    #[test]
    fn parse_accepts_channel_scoped_payload() {
        let payload = br#"{"v":1,"t":"message:new","ch":"private-conv-abc","d":{"id":"m1"}}"#;
        let envelope = parse_envelope(payload).unwrap();

        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.t.as_str(), "message:new");
        assert_eq!(envelope.ch.unwrap().conversation_id(), Some("abc"));
        assert_eq!(envelope.d["id"], "m1");
    }
}
