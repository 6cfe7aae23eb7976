use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use talenthub_core::{FriendRequestStatus, FriendshipStatus, MessageKind, PageCursor};

use super::{
    core::{
        ChannelRecord, MessageRecord, PortfolioRecord, ServerRecord, UserRecord,
        METRICS_TEXT_CONTENT_TYPE,
    },
    metrics::render_metrics,
    storage::ObjectStorage,
};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

// Identity

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CheckUsernameRequest {
    pub(crate) username: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct UsernameAvailabilityResponse {
    pub(crate) available: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SignupRequest {
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignupResponse {
    pub(crate) email: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct VerifyOtpRequest {
    pub(crate) email: String,
    pub(crate) otp: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SigninRequest {
    pub(crate) email: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ChangePasswordRequest {
    pub(crate) current_password: String,
    pub(crate) new_password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ChangeDisplayNameRequest {
    pub(crate) display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ChangeUsernameRequest {
    pub(crate) username: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DeleteAccountRequest {
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ProfileRequest {
    pub(crate) username: String,
}

/// The caller's own account.
#[derive(Debug, Serialize)]
pub(crate) struct UserResponse {
    pub(crate) id: String,
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) created_at: i64,
}

impl UserResponse {
    pub(crate) fn from_record(user: &UserRecord, storage: &ObjectStorage) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_key.as_deref().map(|key| storage.public_url(key)),
            created_at: user.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct SessionResponse {
    pub(crate) token: String,
    pub(crate) user: UserResponse,
}

/// Public view of another user.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct UserSummary {
    pub(crate) id: String,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) created_at: i64,
}

impl UserSummary {
    pub(crate) fn from_record(user: &UserRecord, storage: &ObjectStorage) -> Self {
        Self {
            id: user.id.to_string(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            avatar_url: user.avatar_key.as_deref().map(|key| storage.public_url(key)),
            created_at: user.created_at_ms,
        }
    }
}

// Social graph

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FriendSendRequest {
    pub(crate) query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FriendAction {
    Accept,
    Deny,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FriendRespondRequest {
    pub(crate) request_id: String,
    pub(crate) action: FriendAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum FriendRequestDirection {
    Received,
    Sent,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FriendRequestsRequest {
    #[serde(rename = "type")]
    pub(crate) direction: FriendRequestDirection,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FriendRemoveRequest {
    pub(crate) friend_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct FriendStatusRequest {
    pub(crate) other_user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendRequestResponse {
    pub(crate) id: String,
    pub(crate) sender_id: String,
    pub(crate) receiver_id: String,
    pub(crate) sender: Option<UserSummary>,
    pub(crate) receiver: Option<UserSummary>,
    pub(crate) status: FriendRequestStatus,
    pub(crate) created_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendResponse {
    pub(crate) user: UserSummary,
    pub(crate) since: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct FriendStatusResponse {
    pub(crate) status: FriendshipStatus,
}

// Servers and channels

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateServerRequest {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) is_public: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdateServerRequest {
    pub(crate) server_id: String,
    pub(crate) name: Option<String>,
    pub(crate) is_public: Option<bool>,
    #[serde(default)]
    pub(crate) remove_icon: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerIdRequest {
    pub(crate) server_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerIdQuery {
    pub(crate) server_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DiscoverServersRequest {
    pub(crate) query: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InviteKeyRequest {
    pub(crate) invite_key: String,
}

/// Join by invite key, or by id when the server is public.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct JoinServerRequest {
    pub(crate) invite_key: Option<String>,
    pub(crate) server_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct InviteKeyResponse {
    pub(crate) invite_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerMemberTargetRequest {
    pub(crate) server_id: String,
    pub(crate) user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct BanMemberRequest {
    pub(crate) server_id: String,
    pub(crate) user_id: String,
    pub(crate) reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MuteMemberRequest {
    pub(crate) server_id: String,
    pub(crate) user_id: String,
    pub(crate) muted: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerResponse {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) icon_url: Option<String>,
    pub(crate) owner_id: String,
    pub(crate) is_public: bool,
    pub(crate) invite_key: String,
    pub(crate) created_at: i64,
}

impl ServerResponse {
    pub(crate) fn from_record(server: &ServerRecord, storage: &ObjectStorage) -> Self {
        Self {
            id: server.server_id.clone(),
            name: server.name.clone(),
            icon_url: server.icon_key.as_deref().map(|key| storage.public_url(key)),
            owner_id: server.owner_id.to_string(),
            is_public: server.is_public,
            invite_key: server.invite_key.clone(),
            created_at: server.created_at_ms,
        }
    }
}

/// Server card shown to non-members; never carries the invite key.
#[derive(Debug, Serialize)]
pub(crate) struct ServerPreviewResponse {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) icon_url: Option<String>,
    pub(crate) is_public: bool,
    pub(crate) member_count: u64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerWithChannelsResponse {
    pub(crate) server: ServerResponse,
    pub(crate) channels: Vec<ChannelResponse>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServerMemberResponse {
    pub(crate) user_id: String,
    pub(crate) user: Option<UserSummary>,
    pub(crate) roles: Vec<String>,
    pub(crate) muted: bool,
    pub(crate) joined_at: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateChannelRequest {
    pub(crate) server_id: String,
    pub(crate) name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChannelResponse {
    pub(crate) id: String,
    pub(crate) server_id: String,
    pub(crate) name: String,
    pub(crate) kind: &'static str,
    pub(crate) channel_key: Option<String>,
    pub(crate) created_at: i64,
}

impl From<&ChannelRecord> for ChannelResponse {
    fn from(channel: &ChannelRecord) -> Self {
        Self {
            id: channel.channel_id.clone(),
            server_id: channel.server_id.clone(),
            name: channel.name.clone(),
            kind: talenthub_core::ChannelKind::Text.as_str(),
            channel_key: channel.channel_key.clone(),
            created_at: channel.created_at_ms,
        }
    }
}

// Conversations

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ChannelByKeyRequest {
    pub(crate) channel_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConversationFromChannelRequest {
    pub(crate) server_id: String,
    pub(crate) channel_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DmUpsertRequest {
    pub(crate) other_user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ChannelConversationResponse {
    pub(crate) conversation_id: String,
    pub(crate) server_id: String,
    pub(crate) channel_id: String,
    pub(crate) channel_key: String,
    pub(crate) channel_name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct DmConversationResponse {
    pub(crate) conversation_id: String,
    pub(crate) dm_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct MarkReadRequest {
    pub(crate) conversation_id: String,
    pub(crate) message_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReadMarkResponse {
    pub(crate) conversation_id: String,
    pub(crate) last_read_message_id: String,
    pub(crate) last_read_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConversationSummaryResponse {
    pub(crate) conversation_id: String,
    pub(crate) kind: &'static str,
    pub(crate) title: String,
    pub(crate) avatar_url: Option<String>,
    pub(crate) other_user_id: Option<String>,
    pub(crate) server_id: Option<String>,
    pub(crate) channel_id: Option<String>,
    pub(crate) last_message_id: Option<String>,
    pub(crate) last_message_at: Option<i64>,
    pub(crate) unread: bool,
}

// Messages

/// Descriptor of a stored file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AttachmentPayload {
    pub(crate) url: String,
    pub(crate) name: String,
    pub(crate) mime_type: String,
    pub(crate) size: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SendMessageRequest {
    pub(crate) conversation_id: String,
    #[serde(default)]
    pub(crate) content: String,
    pub(crate) reply_to_message_id: Option<String>,
    #[serde(default)]
    pub(crate) attachments: Vec<AttachmentPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ListMessagesRequest {
    pub(crate) conversation_id: String,
    pub(crate) limit: Option<usize>,
    pub(crate) cursor: Option<PageCursor>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct EditMessageRequest {
    pub(crate) message_id: String,
    pub(crate) content: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct DeleteMessageRequest {
    pub(crate) message_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadQuery {
    pub(crate) filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct MessageResponse {
    pub(crate) id: String,
    pub(crate) conversation_id: String,
    pub(crate) sender_id: String,
    pub(crate) sender: Option<UserSummary>,
    pub(crate) content: String,
    pub(crate) kind: MessageKind,
    pub(crate) reply_to_message_id: Option<String>,
    pub(crate) attachments: Vec<AttachmentPayload>,
    pub(crate) edited_at: Option<i64>,
    pub(crate) deleted_at: Option<i64>,
    pub(crate) created_at: i64,
}

impl MessageResponse {
    /// `sender` is `None` once the sender's account is gone.
    pub(crate) fn from_record(message: &MessageRecord, sender: Option<UserSummary>) -> Self {
        Self {
            id: message.message_id.clone(),
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.to_string(),
            sender,
            content: message.content.clone(),
            kind: message.kind,
            reply_to_message_id: message.reply_to_message_id.clone(),
            attachments: message.attachments.clone(),
            edited_at: message.edited_at_ms,
            deleted_at: message.deleted_at_ms,
            created_at: message.created_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageEditResponse {
    pub(crate) message_id: String,
    pub(crate) conversation_id: String,
    pub(crate) content: String,
    pub(crate) edited_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageDeleteResponse {
    pub(crate) message_id: String,
    pub(crate) conversation_id: String,
    pub(crate) deleted_at: i64,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessagePageResponse {
    pub(crate) messages: Vec<MessageResponse>,
    pub(crate) next_cursor: Option<PageCursor>,
}

// Realtime

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RealtimeAuthRequest {
    pub(crate) socket_id: String,
    pub(crate) channel_name: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RealtimeAuthResponse {
    pub(crate) auth: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}

// Portfolios

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreatePortfolioRequest {
    pub(crate) name: String,
    pub(crate) title: String,
    #[serde(default)]
    pub(crate) summary: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdatePortfolioRequest {
    pub(crate) portfolio_id: String,
    pub(crate) name: Option<String>,
    pub(crate) title: Option<String>,
    pub(crate) summary: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PortfolioIdRequest {
    pub(crate) portfolio_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PortfolioSlugRequest {
    pub(crate) slug: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct PortfolioResponse {
    pub(crate) id: String,
    pub(crate) slug: String,
    pub(crate) name: String,
    pub(crate) title: String,
    pub(crate) summary: String,
    pub(crate) created_at: i64,
    pub(crate) updated_at: i64,
}

impl From<&PortfolioRecord> for PortfolioResponse {
    fn from(portfolio: &PortfolioRecord) -> Self {
        Self {
            id: portfolio.portfolio_id.clone(),
            slug: portfolio.slug.clone(),
            name: portfolio.name.clone(),
            title: portfolio.title.clone(),
            summary: portfolio.summary.clone(),
            created_at: portfolio.created_at_ms,
            updated_at: portfolio.updated_at_ms,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct PublicPortfolioResponse {
    #[serde(flatten)]
    pub(crate) portfolio: PortfolioResponse,
    pub(crate) owner: Option<UserSummary>,
}

// Files

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct SignedUrlRequest {
    pub(crate) key: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct SignedUrlResponse {
    pub(crate) url: String,
    pub(crate) expires_at: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SignedFileQuery {
    pub(crate) expires: i64,
    pub(crate) signature: String,
}
