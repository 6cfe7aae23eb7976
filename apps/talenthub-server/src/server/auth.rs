use std::{
    fmt::Write as _,
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use talenthub_core::UserId;

use super::{
    core::{AppState, AuthContext, SESSION_TOKEN_TTL_SECS},
    errors::ApiFailure,
    user_repository::{UserPersistence, UserRepository},
};

const MAX_X_FORWARDED_FOR_HEADER_CHARS: usize = 512;
const MAX_X_FORWARDED_FOR_ENTRY_CHARS: usize = 64;
const SESSION_EPOCH_CLAIM: &str = "epoch";

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

/// Mints a session token bound to the user's current session epoch.
pub(crate) fn issue_session_token(
    state: &AppState,
    user_id: UserId,
    session_epoch: i64,
) -> anyhow::Result<String> {
    let mut claims = Claims::new_expires_in(&Duration::from_secs(SESSION_TOKEN_TTL_SECS))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional(SESSION_EPOCH_CLAIM, session_epoch)
        .map_err(|e| anyhow!("claim epoch failed: {e}"))?;

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("session token mint failed: {e}"))
}

pub(crate) fn verify_session_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    authenticate_with_token(state, token).await
}

/// Resolves the caller when a token is present; a missing or stale token yields `None`.
pub(crate) async fn authenticate_optional(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<AuthContext>, ApiFailure> {
    match authenticate(state, headers).await {
        Ok(auth) => Ok(Some(auth)),
        Err(ApiFailure::Unauthorized) => Ok(None),
        Err(other) => Err(other),
    }
}

pub(crate) async fn authenticate_with_token(
    state: &AppState,
    token: &str,
) -> Result<AuthContext, ApiFailure> {
    let claims = verify_session_token(state, token).map_err(|_| ApiFailure::Unauthorized)?;
    let subject = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ApiFailure::Unauthorized)?;
    let token_epoch = claims
        .get_claim(SESSION_EPOCH_CLAIM)
        .and_then(serde_json::Value::as_i64)
        .ok_or(ApiFailure::Unauthorized)?;
    let user_id = UserId::try_from(subject.to_owned()).map_err(|_| ApiFailure::Unauthorized)?;

    let user = UserRepository::from_state(state)
        .find_by_id(user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    if user.session_epoch != token_epoch {
        tracing::info!(event = "auth.session", outcome = "stale_epoch", user_id = %user_id);
        return Err(ApiFailure::Unauthorized);
    }

    Ok(AuthContext {
        user_id,
        username: user.username,
        display_name: user.display_name,
        password_hash: user.password_hash,
        session_epoch: user.session_epoch,
    })
}

/// Invalidates every outstanding token of the user and returns the new epoch.
pub(crate) async fn invalidate_all_sessions(
    state: &AppState,
    user_id: UserId,
) -> Result<i64, ApiFailure> {
    let epoch = UserRepository::from_state(state)
        .bump_session_epoch(user_id)
        .await?
        .ok_or(ApiFailure::Unauthorized)?;
    tracing::info!(event = "auth.sessions.invalidate", user_id = %user_id, epoch);
    Ok(epoch)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub(crate) fn now_unix_ms() -> i64 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

pub(crate) fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0_u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Opaque random token used for invite keys and channel keys.
pub(crate) fn random_token() -> String {
    hex_encode(&random_bytes::<16>())
}

/// Six decimal digits, zero padded.
pub(crate) fn generate_verification_code() -> String {
    let value = OsRng.next_u32() % 1_000_000;
    format!("{value:06}")
}

/// Client address used for rate limiting and logs.
///
/// `x-forwarded-for` is honored only when the direct peer is a trusted proxy.
pub(crate) fn resolve_client_ip(
    headers: &HeaderMap,
    peer_ip: Option<IpAddr>,
    trusted_proxy_ips: &[IpAddr],
) -> Option<IpAddr> {
    let peer_ip = peer_ip?;
    if trusted_proxy_ips.contains(&peer_ip) {
        if let Some(forwarded_ip) = parse_forwarded_ip(headers) {
            return Some(forwarded_ip);
        }
    }
    Some(peer_ip)
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.len() <= MAX_X_FORWARDED_FOR_HEADER_CHARS)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_X_FORWARDED_FOR_ENTRY_CHARS)
        .and_then(|value| value.parse::<IpAddr>().ok())
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use axum::http::HeaderMap;
    use talenthub_core::UserId;

    use super::{
        bearer_token, generate_verification_code, hash_password, hex_encode,
        issue_session_token, resolve_client_ip, verify_password, verify_session_token,
    };
    use crate::server::core::{AppConfig, AppState};

    #[test]
    fn client_ip_defaults_to_peer_when_proxy_is_untrusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.21".parse().expect("valid header"),
        );
        let peer: IpAddr = "10.10.0.4".parse().expect("valid ip");
        let resolved = resolve_client_ip(&headers, Some(peer), &[]);
        assert_eq!(resolved, Some(peer));
    }

    #[test]
    fn client_ip_uses_forwarded_value_when_peer_proxy_is_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44, 203.0.113.10".parse().expect("valid header"),
        );
        let peer: IpAddr = "10.2.0.8".parse().expect("valid ip");
        let resolved = resolve_client_ip(&headers, Some(peer), &[peer]);
        assert_eq!(
            resolved.expect("forwarded ip should be present").to_string(),
            "198.51.100.44"
        );
    }

    #[test]
    fn password_hash_round_trips() {
        let hash = hash_password("correct horse battery").expect("hash should succeed");
        assert!(verify_password(&hash, "correct horse battery"));
        assert!(!verify_password(&hash, "wrong password"));
        assert!(!verify_password("not-a-phc-string", "anything"));
    }

    #[test]
    fn session_token_carries_subject_and_epoch() {
        let state = AppState::new(&AppConfig::default()).expect("app state should initialize");
        let user_id = UserId::new();
        let token = issue_session_token(&state, user_id, 3).expect("token should mint");
        let claims = verify_session_token(&state, &token).expect("token should verify");
        assert_eq!(
            claims.get_claim("sub").and_then(serde_json::Value::as_str),
            Some(user_id.to_string().as_str())
        );
        assert_eq!(
            claims.get_claim("epoch").and_then(serde_json::Value::as_i64),
            Some(3)
        );
        assert!(verify_session_token(&state, "v4.local.garbage").is_err());
    }

    #[test]
    fn bearer_prefix_is_required() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Token abc".parse().expect("valid header"));
        assert!(bearer_token(&headers).is_none());
        headers.insert("authorization", "Bearer abc".parse().expect("valid header"));
        assert_eq!(bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn verification_codes_are_six_digits() {
        for _ in 0..32 {
            let code = generate_verification_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(hex_encode(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
