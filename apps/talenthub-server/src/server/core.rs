use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::PathBuf,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::anyhow;
use argon2::password_hash::rand_core::{OsRng, RngCore};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use pasetors::{keys::SymmetricKey, version4::V4};
use sqlx::{postgres::PgPoolOptions, PgPool};
use talenthub_core::{ConversationScope, FriendRequestStatus, MessageKind, UserId};
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use uuid::Uuid;

use super::{auth::hash_password, mailer::Mailer, storage::ObjectStorage, types::AttachmentPayload};

pub(crate) type ConnectionSubscriptions = HashMap<Uuid, mpsc::Sender<String>>;
pub(crate) type Subscriptions = HashMap<String, ConnectionSubscriptions>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 120;
pub const DEFAULT_REALTIME_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_REALTIME_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_REALTIME_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_REALTIME_EVENT_BYTES: usize = talenthub_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_MAX_ATTACHMENT_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;
pub const DEFAULT_SIGNED_URL_TTL_SECS: u64 = 60;
pub const SESSION_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const VERIFICATION_CODE_TTL_SECS: i64 = 5 * 60;
pub(crate) const MAX_MIME_SNIFF_BYTES: usize = 8192;
pub(crate) const MAX_LISTED_CONVERSATIONS: usize = 100;
pub(crate) const MAX_DISCOVERED_SERVERS: usize = 50;
pub(crate) const MAX_SLUG_ATTEMPTS: usize = 5;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";
pub(crate) const ATTACHMENT_MIME_ALLOWLIST: [&str; 5] = [
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "application/pdf",
];
pub(crate) const IMAGE_MIME_ALLOWLIST: [&str; 4] =
    ["image/jpeg", "image/png", "image/gif", "image/webp"];

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) realtime_events_emitted: Mutex<HashMap<(String, String), u64>>,
    pub(crate) realtime_events_dropped: Mutex<HashMap<(String, String, String), u64>>,
    pub(crate) realtime_events_parse_rejected: Mutex<HashMap<(String, String), u64>>,
    pub(crate) side_effect_failures: Mutex<HashMap<(&'static str, &'static str), u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub realtime_ingress_events_per_window: u32,
    pub realtime_ingress_window: Duration,
    pub realtime_outbound_queue: usize,
    pub max_realtime_event_bytes: usize,
    pub max_attachment_bytes: usize,
    pub max_image_bytes: usize,
    pub signed_url_ttl: Duration,
    pub trusted_proxy_ips: Vec<IpAddr>,
    pub storage_root: PathBuf,
    pub public_base_url: String,
    pub storage_signing_key: Option<String>,
    pub token_key: Option<String>,
    pub realtime_app_key: String,
    pub realtime_secret: Option<String>,
    pub mail_api_url: Option<String>,
    pub mail_api_key: Option<String>,
    pub mail_from: String,
    pub log_verification_codes: bool,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            realtime_ingress_events_per_window: DEFAULT_REALTIME_INGRESS_EVENTS_PER_WINDOW,
            realtime_ingress_window: Duration::from_secs(DEFAULT_REALTIME_INGRESS_WINDOW_SECS),
            realtime_outbound_queue: DEFAULT_REALTIME_OUTBOUND_QUEUE,
            max_realtime_event_bytes: DEFAULT_MAX_REALTIME_EVENT_BYTES,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            signed_url_ttl: Duration::from_secs(DEFAULT_SIGNED_URL_TTL_SECS),
            trusted_proxy_ips: vec![
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(Ipv6Addr::LOCALHOST),
            ],
            storage_root: PathBuf::from("./data/storage"),
            public_base_url: String::from("http://127.0.0.1:3000"),
            storage_signing_key: None,
            token_key: None,
            realtime_app_key: String::from("talenthub"),
            realtime_secret: None,
            mail_api_url: None,
            mail_api_key: None,
            mail_from: String::from("TalentHub <no-reply@talenthub.local>"),
            log_verification_codes: false,
            database_url: None,
        }
    }
}

pub(crate) struct RuntimeConfig {
    pub(crate) realtime_ingress_events_per_window: u32,
    pub(crate) realtime_ingress_window: Duration,
    pub(crate) realtime_outbound_queue: usize,
    pub(crate) max_realtime_event_bytes: usize,
    pub(crate) max_attachment_bytes: usize,
    pub(crate) max_image_bytes: usize,
    pub(crate) signed_url_ttl: Duration,
    pub(crate) trusted_proxy_ips: Vec<IpAddr>,
    pub(crate) realtime_app_key: String,
    pub(crate) realtime_secret: Vec<u8>,
}

/// Server, membership, ban and channel tables.
#[derive(Default)]
pub(crate) struct WorkspaceStore {
    pub(crate) servers: HashMap<String, ServerRecord>,
    pub(crate) members: HashMap<String, HashMap<UserId, ServerMemberRecord>>,
    pub(crate) bans: HashMap<String, HashMap<UserId, ServerBanRecord>>,
    pub(crate) channels: HashMap<String, ChannelRecord>,
}

/// Conversation, membership and message tables.
///
/// Held behind a single lock so that find-or-create and append stay atomic
/// without a database.
#[derive(Default)]
pub(crate) struct MessengerStore {
    pub(crate) conversations: HashMap<String, ConversationRecord>,
    pub(crate) channel_index: HashMap<String, String>,
    pub(crate) dm_index: HashMap<String, String>,
    pub(crate) members: HashMap<String, HashMap<UserId, ConversationMemberRecord>>,
    pub(crate) messages: HashMap<String, MessageRecord>,
    pub(crate) timeline: HashMap<String, Vec<String>>,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<UserId, UserRecord>>>,
    pub(crate) pending_verifications: Arc<RwLock<HashMap<String, PendingVerificationRecord>>>,
    pub(crate) friend_requests: Arc<RwLock<HashMap<String, FriendRequestRecord>>>,
    pub(crate) workspace: Arc<RwLock<WorkspaceStore>>,
    pub(crate) messenger: Arc<RwLock<MessengerStore>>,
    pub(crate) portfolios: Arc<RwLock<HashMap<String, PortfolioRecord>>>,
    pub(crate) subscriptions: Arc<RwLock<Subscriptions>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) storage: ObjectStorage,
    pub(crate) mailer: Mailer,
    pub(crate) runtime: Arc<RuntimeConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let token_key_bytes = secret_bytes(config.token_key.as_deref(), "token key", 32)?;
        if token_key_bytes.len() != 32 {
            return Err(anyhow!("token key must decode to exactly 32 bytes"));
        }
        let token_key = SymmetricKey::<V4>::from(&token_key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let realtime_secret =
            secret_bytes(config.realtime_secret.as_deref(), "realtime secret", 32)?;
        let storage_signing_key = secret_bytes(
            config.storage_signing_key.as_deref(),
            "storage signing key",
            32,
        )?;
        let dummy_password_hash = hash_password("talenthub-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };
        let storage = ObjectStorage::new(
            &config.storage_root,
            &config.public_base_url,
            storage_signing_key,
        )?;
        let mailer = Mailer::new(config)?;

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            pending_verifications: Arc::new(RwLock::new(HashMap::new())),
            friend_requests: Arc::new(RwLock::new(HashMap::new())),
            workspace: Arc::new(RwLock::new(WorkspaceStore::default())),
            messenger: Arc::new(RwLock::new(MessengerStore::default())),
            portfolios: Arc::new(RwLock::new(HashMap::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            storage,
            mailer,
            runtime: Arc::new(RuntimeConfig {
                realtime_ingress_events_per_window: config.realtime_ingress_events_per_window,
                realtime_ingress_window: config.realtime_ingress_window,
                realtime_outbound_queue: config.realtime_outbound_queue,
                max_realtime_event_bytes: config.max_realtime_event_bytes,
                max_attachment_bytes: config.max_attachment_bytes,
                max_image_bytes: config.max_image_bytes,
                signed_url_ttl: config.signed_url_ttl,
                trusted_proxy_ips: config.trusted_proxy_ips.clone(),
                realtime_app_key: config.realtime_app_key.clone(),
                realtime_secret,
            }),
        })
    }
}

/// Decodes a configured base64url secret, or draws a process-local random one.
fn secret_bytes(configured: Option<&str>, label: &str, min_len: usize) -> anyhow::Result<Vec<u8>> {
    let Some(encoded) = configured else {
        let mut bytes = vec![0_u8; min_len];
        OsRng.fill_bytes(&mut bytes);
        return Ok(bytes);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("{label} must be base64url without padding: {e}"))?;
    if bytes.len() < min_len {
        return Err(anyhow!("{label} must decode to at least {min_len} bytes"));
    }
    Ok(bytes)
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) password_hash: String,
    pub(crate) avatar_key: Option<String>,
    pub(crate) session_epoch: i64,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingVerificationRecord {
    pub(crate) email: String,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) password_hash: String,
    pub(crate) code: String,
    pub(crate) expires_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct FriendRequestRecord {
    pub(crate) request_id: String,
    pub(crate) sender_id: UserId,
    pub(crate) receiver_id: UserId,
    pub(crate) pair_key: String,
    pub(crate) status: FriendRequestStatus,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerRecord {
    pub(crate) server_id: String,
    pub(crate) name: String,
    pub(crate) icon_key: Option<String>,
    pub(crate) owner_id: UserId,
    pub(crate) is_public: bool,
    pub(crate) invite_key: String,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerMemberRecord {
    pub(crate) roles: Vec<String>,
    pub(crate) muted: bool,
    pub(crate) joined_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ServerBanRecord {
    pub(crate) banned_by_user_id: UserId,
    pub(crate) reason: Option<String>,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ChannelRecord {
    pub(crate) channel_id: String,
    pub(crate) server_id: String,
    pub(crate) name: String,
    pub(crate) channel_key: Option<String>,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct ConversationRecord {
    pub(crate) conversation_id: String,
    pub(crate) scope: ConversationScope,
    pub(crate) last_message_id: Option<String>,
    pub(crate) last_message_at_ms: Option<i64>,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ConversationMemberRecord {
    pub(crate) last_read_message_id: Option<String>,
    pub(crate) last_read_at_ms: Option<i64>,
    pub(crate) muted: bool,
    pub(crate) pinned: bool,
    pub(crate) joined_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) message_id: String,
    pub(crate) conversation_id: String,
    pub(crate) sender_id: UserId,
    pub(crate) content: String,
    pub(crate) kind: MessageKind,
    pub(crate) reply_to_message_id: Option<String>,
    pub(crate) attachments: Vec<AttachmentPayload>,
    pub(crate) edited_at_ms: Option<i64>,
    pub(crate) deleted_at_ms: Option<i64>,
    pub(crate) created_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct PortfolioRecord {
    pub(crate) portfolio_id: String,
    pub(crate) user_id: UserId,
    pub(crate) slug: String,
    pub(crate) name: String,
    pub(crate) title: String,
    pub(crate) summary: String,
    pub(crate) created_at_ms: i64,
    pub(crate) updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
    pub(crate) display_name: String,
    pub(crate) password_hash: String,
    pub(crate) session_epoch: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}
