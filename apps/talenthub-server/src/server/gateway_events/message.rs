use serde::Serialize;
use talenthub_protocol::{
    ChannelName, MESSAGE_DELETED_EVENT, MESSAGE_EDITED_EVENT, MESSAGE_NEW_EVENT,
};

use super::{envelope::try_build_event, GatewayEvent};
use crate::server::types::MessageResponse;

#[derive(Serialize)]
struct MessageEditedPayload<'a> {
    message_id: &'a str,
    content: &'a str,
    edited_at: i64,
}

#[derive(Serialize)]
struct MessageDeletedPayload<'a> {
    message_id: &'a str,
    deleted_at: i64,
}

pub(crate) fn try_message_new(message: &MessageResponse) -> anyhow::Result<GatewayEvent> {
    let channel = ChannelName::for_conversation(&message.conversation_id);
    try_build_event(MESSAGE_NEW_EVENT, Some(&channel), message)
}

pub(crate) fn try_message_edited(
    conversation_id: &str,
    message_id: &str,
    content: &str,
    edited_at: i64,
) -> anyhow::Result<GatewayEvent> {
    let channel = ChannelName::for_conversation(conversation_id);
    try_build_event(
        MESSAGE_EDITED_EVENT,
        Some(&channel),
        MessageEditedPayload {
            message_id,
            content,
            edited_at,
        },
    )
}

pub(crate) fn try_message_deleted(
    conversation_id: &str,
    message_id: &str,
    deleted_at: i64,
) -> anyhow::Result<GatewayEvent> {
    let channel = ChannelName::for_conversation(conversation_id);
    try_build_event(
        MESSAGE_DELETED_EVENT,
        Some(&channel),
        MessageDeletedPayload {
            message_id,
            deleted_at,
        },
    )
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use talenthub_core::MessageKind;

    use super::{try_message_deleted, try_message_edited, try_message_new};
    use crate::server::types::MessageResponse;

    fn parse(payload: &str) -> Value {
        serde_json::from_str(payload).expect("event payload should be valid json")
    }

    #[test]
    fn message_new_carries_hydrated_message() {
        let message = MessageResponse {
            id: String::from("m1"),
            conversation_id: String::from("c1"),
            sender_id: String::from("u1"),
            sender: None,
            content: String::from("hello"),
            kind: MessageKind::Text,
            reply_to_message_id: None,
            attachments: Vec::new(),
            edited_at: None,
            deleted_at: None,
            created_at: 1_700,
        };
        let event = try_message_new(&message).expect("event should build");
        let value = parse(&event.payload);
        assert_eq!(value["t"], "message:new");
        assert_eq!(value["ch"], "private-conv-c1");
        assert_eq!(value["d"]["content"], "hello");
        assert_eq!(value["d"]["kind"], "text");
        assert!(value["d"]["sender"].is_null());
    }

    #[test]
    fn edit_and_delete_payloads_name_the_message() {
        let edited = parse(
            &try_message_edited("c1", "m1", "fixed", 10)
                .expect("event should build")
                .payload,
        );
        assert_eq!(edited["d"]["message_id"], "m1");
        assert_eq!(edited["d"]["content"], "fixed");
        assert_eq!(edited["d"]["edited_at"], 10);

        let deleted = parse(
            &try_message_deleted("c1", "m1", 11)
                .expect("event should build")
                .payload,
        );
        assert_eq!(deleted["t"], "message:deleted");
        assert_eq!(deleted["d"]["deleted_at"], 11);
    }
}
