#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 100;
pub const MAX_MESSAGE_CHARS: usize = 4_000;
pub const MIN_PASSWORD_BYTES: usize = 8;
pub const MAX_PASSWORD_BYTES: usize = 128;
pub const PORTFOLIO_SLUG_HEX_LEN: usize = 32;
pub const DEFAULT_CHANNEL_NAMES: [&str; 2] = ["general", "random"];

/// Returns the project code name.
#[must_use]
pub const fn project_name() -> &'static str {
    "talenthub"
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("name is invalid")]
    InvalidName,
    #[error("username is invalid")]
    InvalidUsername,
    #[error("email is invalid")]
    InvalidEmail,
    #[error("display name is invalid")]
    InvalidDisplayName,
    #[error("password is invalid")]
    InvalidPassword,
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("conversation requires two distinct participants")]
    SelfConversation,
    #[error("dm key is invalid")]
    InvalidDmKey,
    #[error("message is empty")]
    EmptyMessage,
    #[error("message is too long")]
    MessageTooLong,
    #[error("message kind is invalid")]
    InvalidMessageKind,
    #[error("friend request status is invalid")]
    InvalidFriendRequestStatus,
    #[error("portfolio slug is invalid")]
    InvalidPortfolioSlug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Login handle. Stored lowercase, matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Username(String);

impl Username {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Username {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        validate_username(value)?;
        Ok(Self(value.to_ascii_lowercase()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Email(String);

impl Email {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_lowercase();
        validate_email(&value)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        let chars = value.chars().count();
        if !(1..=50).contains(&chars) || value.chars().any(char::is_control) {
            return Err(DomainError::InvalidDisplayName);
        }
        Ok(Self(value.to_owned()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerName(String);

impl ServerName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ServerName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        validate_name(value, 1, 100)?;
        Ok(Self(value.to_owned()))
    }
}

/// Channel names are trimmed and lowercased before storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelName(String);

impl ChannelName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Label shown for a channel conversation in conversation lists.
    #[must_use]
    pub fn conversation_title(&self) -> String {
        format!("#{}", self.0)
    }
}

impl TryFrom<String> for ChannelName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_lowercase();
        validate_name(&value, 1, 100)?;
        Ok(Self(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
}

impl ChannelKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerRole {
    Owner,
    Member,
}

impl ServerRole {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Member => "member",
        }
    }
}

/// Canonical key of an unordered user pair: both ids sorted ascending, joined with `_`.
///
/// # Errors
/// Returns [`DomainError::SelfConversation`] when both ids are equal.
pub fn pair_key(a: UserId, b: UserId) -> Result<String, DomainError> {
    if a == b {
        return Err(DomainError::SelfConversation);
    }
    let (low, high) = if a < b { (a, b) } else { (b, a) };
    Ok(format!("{low}_{high}"))
}

/// Identity of a direct conversation between exactly two users.
///
/// Derived deterministically so that both participants resolve the same key
/// regardless of who initiates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DmKey {
    key: String,
    low: UserId,
    high: UserId,
}

impl DmKey {
    /// # Errors
    /// Returns [`DomainError::SelfConversation`] when `a == b`.
    pub fn from_pair(a: UserId, b: UserId) -> Result<Self, DomainError> {
        let key = pair_key(a, b)?;
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        Ok(Self { key, low, high })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn participants(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    #[must_use]
    pub fn contains(&self, user_id: UserId) -> bool {
        self.low == user_id || self.high == user_id
    }

    /// Returns the participant that is not `viewer`, or `None` if `viewer` is not a participant.
    #[must_use]
    pub fn other_participant(&self, viewer: UserId) -> Option<UserId> {
        if viewer == self.low {
            Some(self.high)
        } else if viewer == self.high {
            Some(self.low)
        } else {
            None
        }
    }
}

impl TryFrom<String> for DmKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (left, right) = value.split_once('_').ok_or(DomainError::InvalidDmKey)?;
        let left = UserId::try_from(left.to_owned()).map_err(|_| DomainError::InvalidDmKey)?;
        let right = UserId::try_from(right.to_owned()).map_err(|_| DomainError::InvalidDmKey)?;
        let key = Self::from_pair(left, right).map_err(|_| DomainError::InvalidDmKey)?;
        if key.key != value {
            return Err(DomainError::InvalidDmKey);
        }
        Ok(key)
    }
}

impl core::fmt::Display for DmKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.key)
    }
}

/// Variant-specific identity of a conversation.
///
/// A channel conversation may temporarily lack its `channel_id` (legacy rows);
/// such orphans are adopted on resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationScope {
    Channel {
        server_id: String,
        channel_id: Option<String>,
    },
    Direct {
        dm_key: DmKey,
    },
}

impl ConversationScope {
    #[must_use]
    pub const fn kind(&self) -> ConversationKind {
        match self {
            Self::Channel { .. } => ConversationKind::Channel,
            Self::Direct { .. } => ConversationKind::Direct,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Channel,
    Direct,
}

impl ConversationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Channel => "channel",
            Self::Direct => "dm",
        }
    }

    #[must_use]
    pub const fn as_i16(self) -> i16 {
        match self {
            Self::Channel => 1,
            Self::Direct => 2,
        }
    }

    #[must_use]
    pub const fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::Channel),
            2 => Some(Self::Direct),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Deleted,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
            Self::Deleted => "deleted",
        }
    }

    /// Kind of a freshly sent message. Only the first attachment decides.
    #[must_use]
    pub fn for_first_attachment(mime_type: Option<&str>) -> Self {
        match mime_type {
            None => Self::Text,
            Some(mime) if mime.starts_with("image/") => Self::Image,
            Some(_) => Self::File,
        }
    }
}

impl TryFrom<String> for MessageKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "text" => Ok(Self::Text),
            "image" => Ok(Self::Image),
            "file" => Ok(Self::File),
            "deleted" => Ok(Self::Deleted),
            _ => Err(DomainError::InvalidMessageKind),
        }
    }
}

/// Trims outgoing message content and rejects messages with neither text nor attachments.
///
/// # Errors
/// Returns [`DomainError::EmptyMessage`] or [`DomainError::MessageTooLong`].
pub fn normalize_message_content(
    content: &str,
    has_attachments: bool,
) -> Result<String, DomainError> {
    let trimmed = content.trim();
    if trimmed.is_empty() && !has_attachments {
        return Err(DomainError::EmptyMessage);
    }
    if trimmed.chars().count() > MAX_MESSAGE_CHARS {
        return Err(DomainError::MessageTooLong);
    }
    Ok(trimmed.to_owned())
}

/// Effective page size. Missing or zero selects the default; larger values are capped.
#[must_use]
pub fn clamp_page_limit(requested: Option<usize>) -> usize {
    match requested {
        None | Some(0) => DEFAULT_PAGE_LIMIT,
        Some(limit) => limit.min(MAX_PAGE_LIMIT),
    }
}

/// Cursor for the next (older) page of a newest-first message listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub before_created_at: i64,
}

/// Splits rows fetched with `limit + 1` into the visible page and the cursor for the next one.
///
/// `created_at` reads the timestamp of a row; the cursor points at the last visible row.
pub fn split_page<T>(
    mut rows: Vec<T>,
    limit: usize,
    created_at: impl Fn(&T) -> i64,
) -> (Vec<T>, Option<PageCursor>) {
    if rows.len() <= limit {
        return (rows, None);
    }
    rows.truncate(limit);
    let cursor = rows.last().map(|row| PageCursor {
        before_created_at: created_at(row),
    });
    (rows, cursor)
}

/// A member has unread messages when the conversation has activity newer than their read mark.
#[must_use]
pub fn is_unread(last_message_at: Option<i64>, last_read_at: Option<i64>) -> bool {
    match (last_message_at, last_read_at) {
        (Some(message_at), Some(read_at)) => message_at > read_at,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Denied,
}

impl FriendRequestStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Denied => "denied",
        }
    }
}

impl TryFrom<String> for FriendRequestStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "denied" => Ok(Self::Denied),
            _ => Err(DomainError::InvalidFriendRequestStatus),
        }
    }
}

/// Relationship between a viewer and another user as seen by the viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendshipStatus {
    None,
    Friends,
    PendingSent,
    PendingReceived,
}

impl FriendshipStatus {
    /// Derives the viewer's status from the request linking the pair, if any.
    #[must_use]
    pub fn derive(
        viewer: UserId,
        request: Option<(UserId, FriendRequestStatus)>,
    ) -> Self {
        match request {
            Some((_, FriendRequestStatus::Accepted)) => Self::Friends,
            Some((sender, FriendRequestStatus::Pending)) if sender == viewer => Self::PendingSent,
            Some((_, FriendRequestStatus::Pending)) => Self::PendingReceived,
            Some((_, FriendRequestStatus::Denied)) | None => Self::None,
        }
    }
}

/// Public handle of a portfolio: 32 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortfolioSlug(String);

impl PortfolioSlug {
    /// Encodes 16 random bytes.
    #[must_use]
    pub fn from_random_bytes(bytes: [u8; 16]) -> Self {
        use core::fmt::Write as _;
        let mut out = String::with_capacity(PORTFOLIO_SLUG_HEX_LEN);
        for byte in bytes {
            let _ = write!(out, "{byte:02x}");
        }
        Self(out)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PortfolioSlug {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_ascii_lowercase();
        if value.len() == PORTFOLIO_SLUG_HEX_LEN && value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(Self(value));
        }
        Err(DomainError::InvalidPortfolioSlug)
    }
}

/// # Errors
/// Returns [`DomainError::InvalidPassword`] when outside the accepted length.
pub fn validate_password(value: &str) -> Result<(), DomainError> {
    if (MIN_PASSWORD_BYTES..=MAX_PASSWORD_BYTES).contains(&value.len()) {
        return Ok(());
    }
    Err(DomainError::InvalidPassword)
}

fn validate_username(value: &str) -> Result<(), DomainError> {
    if !(3..=20).contains(&value.len()) {
        return Err(DomainError::InvalidUsername);
    }

    if value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Ok(());
    }

    Err(DomainError::InvalidUsername)
}

fn validate_email(value: &str) -> Result<(), DomainError> {
    if !(3..=254).contains(&value.len()) || value.chars().any(char::is_whitespace) {
        return Err(DomainError::InvalidEmail);
    }
    match value.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            Ok(())
        }
        _ => Err(DomainError::InvalidEmail),
    }
}

fn validate_name(value: &str, min: usize, max: usize) -> Result<(), DomainError> {
    if !(min..=max).contains(&value.chars().count()) {
        return Err(DomainError::InvalidName);
    }

    if value.chars().any(char::is_control) {
        return Err(DomainError::InvalidName);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        clamp_page_limit, is_unread, normalize_message_content, pair_key, project_name,
        split_page, validate_password, ChannelName, ConversationKind, DisplayName, DmKey,
        DomainError, Email, FriendRequestStatus, FriendshipStatus, MessageKind, PageCursor,
        PortfolioSlug, ServerName, UserId, Username, MAX_PAGE_LIMIT,
    };

    #[test]
    fn project_name_is_stable() {
        assert_eq!(project_name(), "talenthub");
    }

    #[test]
    fn username_invariants_enforced() {
        let valid = Username::try_from(String::from("Alice_1")).unwrap();
        assert_eq!(valid.as_str(), "alice_1");
        assert_eq!(
            Username::try_from(String::from("ab")).unwrap_err(),
            DomainError::InvalidUsername
        );
        assert_eq!(
            Username::try_from(String::from("bad-name")).unwrap_err(),
            DomainError::InvalidUsername
        );
        assert!(Username::try_from("a".repeat(21)).is_err());
    }

    #[test]
    fn email_is_trimmed_and_lowercased() {
        let email = Email::try_from(String::from("  Alice@Example.COM ")).unwrap();
        assert_eq!(email.as_str(), "alice@example.com");
        assert!(Email::try_from(String::from("no-at-sign")).is_err());
        assert!(Email::try_from(String::from("a@b@c")).is_err());
        assert!(Email::try_from(String::from("@example.com")).is_err());
    }

    #[test]
    fn display_name_bounds() {
        assert_eq!(
            DisplayName::try_from(String::from("  Alice  ")).unwrap().as_str(),
            "Alice"
        );
        assert!(DisplayName::try_from(String::from("   ")).is_err());
        assert!(DisplayName::try_from("x".repeat(51)).is_err());
        assert!(DisplayName::try_from("é".repeat(50)).is_ok());
    }

    #[test]
    fn server_and_channel_names_are_normalized() {
        assert_eq!(
            ServerName::try_from(String::from(" Design Crew ")).unwrap().as_str(),
            "Design Crew"
        );
        let channel = ChannelName::try_from(String::from(" Announcements ")).unwrap();
        assert_eq!(channel.as_str(), "announcements");
        assert_eq!(channel.conversation_title(), "#announcements");
        assert_eq!(
            ChannelName::try_from(String::new()).unwrap_err(),
            DomainError::InvalidName
        );
    }

    #[test]
    fn password_length_bounds() {
        assert!(validate_password("1234567").is_err());
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password(&"p".repeat(129)).is_err());
    }

    #[test]
    fn dm_key_is_order_independent() {
        let a = UserId::new();
        let b = UserId::new();
        let forward = DmKey::from_pair(a, b).unwrap();
        let backward = DmKey::from_pair(b, a).unwrap();
        assert_eq!(forward, backward);
        assert_eq!(forward.as_str(), pair_key(b, a).unwrap());
        assert_eq!(forward.other_participant(a), Some(b));
        assert_eq!(forward.other_participant(b), Some(a));
        assert_eq!(forward.other_participant(UserId::new()), None);

        let parsed = DmKey::try_from(forward.as_str().to_owned()).unwrap();
        assert_eq!(parsed, forward);
    }

    #[test]
    fn dm_key_rejects_self_and_unsorted_text() {
        let a = UserId::new();
        assert_eq!(
            DmKey::from_pair(a, a).unwrap_err(),
            DomainError::SelfConversation
        );
        let b = UserId::new();
        let (low, high) = if a < b { (a, b) } else { (b, a) };
        assert_eq!(
            DmKey::try_from(format!("{high}_{low}")).unwrap_err(),
            DomainError::InvalidDmKey
        );
    }

    #[test]
    fn conversation_kind_storage_codes_round_trip() {
        for kind in [ConversationKind::Channel, ConversationKind::Direct] {
            assert_eq!(ConversationKind::from_i16(kind.as_i16()), Some(kind));
        }
        assert_eq!(ConversationKind::from_i16(9), None);
    }

    #[test]
    fn first_attachment_decides_message_kind() {
        assert_eq!(MessageKind::for_first_attachment(None), MessageKind::Text);
        assert_eq!(
            MessageKind::for_first_attachment(Some("image/png")),
            MessageKind::Image
        );
        assert_eq!(
            MessageKind::for_first_attachment(Some("application/pdf")),
            MessageKind::File
        );
        assert!(MessageKind::try_from(String::from("sticker")).is_err());
    }

    #[test]
    fn message_content_requires_text_or_attachments() {
        assert_eq!(
            normalize_message_content("   ", false).unwrap_err(),
            DomainError::EmptyMessage
        );
        assert_eq!(normalize_message_content("   ", true).unwrap(), "");
        assert_eq!(normalize_message_content("  hi \n", false).unwrap(), "hi");
        assert_eq!(
            normalize_message_content(&"x".repeat(4_001), false).unwrap_err(),
            DomainError::MessageTooLong
        );
    }

    #[test]
    fn page_limit_defaults_and_caps() {
        assert_eq!(clamp_page_limit(None), 50);
        assert_eq!(clamp_page_limit(Some(0)), 50);
        assert_eq!(clamp_page_limit(Some(7)), 7);
        assert_eq!(clamp_page_limit(Some(10_000)), MAX_PAGE_LIMIT);
    }

    #[test]
    fn split_page_emits_cursor_only_when_more_rows_exist() {
        let rows = vec![50_i64, 40, 30];
        let (page, cursor) = split_page(rows.clone(), 3, |row| *row);
        assert_eq!(page, rows);
        assert!(cursor.is_none());

        let (page, cursor) = split_page(vec![50_i64, 40, 30], 2, |row| *row);
        assert_eq!(page, vec![50, 40]);
        assert_eq!(
            cursor,
            Some(PageCursor {
                before_created_at: 40
            })
        );
    }

    #[test]
    fn unread_rule_matches_read_marks() {
        assert!(!is_unread(None, None));
        assert!(!is_unread(None, Some(5)));
        assert!(is_unread(Some(5), None));
        assert!(is_unread(Some(6), Some(5)));
        assert!(!is_unread(Some(5), Some(5)));
        assert!(!is_unread(Some(4), Some(5)));
    }

    #[test]
    fn friendship_status_is_viewer_relative() {
        let me = UserId::new();
        let them = UserId::new();
        assert_eq!(FriendshipStatus::derive(me, None), FriendshipStatus::None);
        assert_eq!(
            FriendshipStatus::derive(me, Some((me, FriendRequestStatus::Pending))),
            FriendshipStatus::PendingSent
        );
        assert_eq!(
            FriendshipStatus::derive(me, Some((them, FriendRequestStatus::Pending))),
            FriendshipStatus::PendingReceived
        );
        assert_eq!(
            FriendshipStatus::derive(me, Some((them, FriendRequestStatus::Accepted))),
            FriendshipStatus::Friends
        );
        assert_eq!(
            FriendshipStatus::derive(me, Some((them, FriendRequestStatus::Denied))),
            FriendshipStatus::None
        );
    }

    #[test]
    fn portfolio_slug_is_lowercase_hex() {
        let slug = PortfolioSlug::from_random_bytes([0xAB; 16]);
        assert_eq!(slug.as_str(), "ab".repeat(16));
        assert_eq!(
            PortfolioSlug::try_from("AB".repeat(16)).unwrap().as_str(),
            "ab".repeat(16)
        );
        assert!(PortfolioSlug::try_from(String::from("short")).is_err());
        assert!(PortfolioSlug::try_from("zz".repeat(16)).is_err());
    }
}
