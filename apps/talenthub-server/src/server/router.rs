use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use axum::{
    extract::ConnectInfo,
    extract::DefaultBodyLimit,
    http::{request::Request, HeaderName, StatusCode},
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    auth::resolve_client_ip,
    core::{AppConfig, AppState},
    handlers::{
        auth::{
            change_display_name, change_password, change_username, check_username,
            delete_account, delete_avatar, me, signin, signout, signup, upload_avatar, verify_otp,
        },
        channels::{channel_by_key, create_server_channel, list_server_channels},
        conversations::{
            conversation_from_channel, list_conversations, mark_conversation_read, upsert_dm,
        },
        files::{issue_signed_url, public_file, signed_file},
        friends::{
            friend_status, list_friend_requests, list_friends, remove_friend,
            respond_friend_request, send_friend_request,
        },
        messages::{delete_message, edit_message, list_messages, send_message, upload_attachment},
        portfolios::{
            create_portfolio, delete_portfolio, list_portfolios, portfolio_by_slug,
            update_portfolio,
        },
        realtime_auth::realtime_auth,
        servers::{
            ban_member, create_server, delete_server, discover_servers, invite_info, join_server,
            kick_member, leave_server, list_server_members, list_servers, mute_member,
            regenerate_invite, update_server, upload_server_icon,
        },
        users::user_profile,
    },
    realtime::realtime_ws,
    types::{health, metrics},
};

#[derive(Clone)]
struct TrustedClientIpKeyExtractor {
    trusted_proxy_ips: Arc<Vec<IpAddr>>,
}

impl TrustedClientIpKeyExtractor {
    fn new(trusted_proxy_ips: Arc<Vec<IpAddr>>) -> Self {
        Self { trusted_proxy_ips }
    }
}

impl KeyExtractor for TrustedClientIpKeyExtractor {
    type Key = IpAddr;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        Ok(
            resolve_client_ip(req.headers(), peer_ip, self.trusted_proxy_ips.as_slice())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        )
    }
}

fn validate_limits(config: &AppConfig) -> anyhow::Result<()> {
    if config.max_realtime_event_bytes == 0
        || config.max_realtime_event_bytes > talenthub_protocol::MAX_EVENT_BYTES
    {
        return Err(anyhow!(
            "realtime event limit must be between 1 and the protocol max of {} bytes",
            talenthub_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!("rate limit must be at least 1 request per minute"));
    }
    if config.realtime_outbound_queue == 0 {
        return Err(anyhow!(
            "realtime outbound queue must hold at least 1 event"
        ));
    }
    if config.realtime_ingress_events_per_window == 0 || config.realtime_ingress_window.is_zero() {
        return Err(anyhow!(
            "realtime ingress limit must allow at least 1 event per non-empty window"
        ));
    }
    if config.max_attachment_bytes == 0 {
        return Err(anyhow!("max attachment bytes must be at least 1 byte"));
    }
    if config.max_image_bytes == 0 {
        return Err(anyhow!("max image bytes must be at least 1 byte"));
    }
    if config.signed_url_ttl.is_zero() {
        return Err(anyhow!("signed url ttl must be at least 1 second"));
    }
    Ok(())
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured limits are invalid or a collaborator
/// cannot be constructed.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    validate_limits(config)?;

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(TrustedClientIpKeyExtractor::new(Arc::new(
                config.trusted_proxy_ips.clone(),
            )))
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/realtime/ws", get(realtime_ws))
        .route("/files/public/{*key}", get(public_file))
        .route("/files/signed/{*key}", get(signed_file))
        .route("/api/auth/check-username", post(check_username))
        .route("/api/auth/signup", post(signup))
        .route("/api/auth/verify-otp", post(verify_otp))
        .route("/api/auth/signin", post(signin))
        .route("/api/auth/signout", post(signout))
        .route("/api/auth/me", post(me))
        .route("/api/auth/change-password", post(change_password))
        .route("/api/auth/change-display-name", post(change_display_name))
        .route("/api/auth/change-username", post(change_username))
        .route("/api/auth/delete-account", post(delete_account))
        .route("/api/auth/delete-avatar", post(delete_avatar))
        .route("/api/users/profile", post(user_profile))
        .route("/api/friends/send", post(send_friend_request))
        .route("/api/friends/respond", post(respond_friend_request))
        .route("/api/friends/requests", post(list_friend_requests))
        .route("/api/friends/list", post(list_friends))
        .route("/api/friends/remove", post(remove_friend))
        .route("/api/friends/status", post(friend_status))
        .route("/api/servers/create", post(create_server))
        .route("/api/servers/list", post(list_servers))
        .route("/api/servers/update", post(update_server))
        .route("/api/servers/delete", post(delete_server))
        .route("/api/servers/discover", post(discover_servers))
        .route("/api/servers/invite-info", post(invite_info))
        .route("/api/servers/join", post(join_server))
        .route("/api/servers/leave", post(leave_server))
        .route("/api/servers/members", post(list_server_members))
        .route("/api/servers/kick", post(kick_member))
        .route("/api/servers/ban", post(ban_member))
        .route("/api/servers/mute", post(mute_member))
        .route("/api/servers/regenerate-invite", post(regenerate_invite))
        .route("/api/channels/list", post(list_server_channels))
        .route("/api/channels/create", post(create_server_channel))
        .route("/api/channels/by-key", post(channel_by_key))
        .route(
            "/api/conversations/from-channel",
            post(conversation_from_channel),
        )
        .route("/api/conversations/read", post(mark_conversation_read))
        .route("/api/conversations/list", post(list_conversations))
        .route("/api/dms/upsert", post(upsert_dm))
        .route("/api/messages/send", post(send_message))
        .route("/api/messages/list", post(list_messages))
        .route("/api/messages/edit", post(edit_message))
        .route("/api/messages/delete", post(delete_message))
        .route("/api/realtime/auth", post(realtime_auth))
        .route("/api/portfolios/list", post(list_portfolios))
        .route("/api/portfolios/create", post(create_portfolio))
        .route("/api/portfolios/update", post(update_portfolio))
        .route("/api/portfolios/delete", post(delete_portfolio))
        .route("/api/portfolios/get-by-slug", post(portfolio_by_slug))
        .route("/api/files/signed-url", post(issue_signed_url));

    let upload_route = Router::new()
        .route("/api/messages/upload", post(upload_attachment))
        .route("/api/auth/upload-avatar", post(upload_avatar))
        .route("/api/servers/upload-icon", post(upload_server_icon))
        .layer(DefaultBodyLimit::disable());

    Ok(routes
        .merge(upload_route)
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::validate_limits;
    use crate::server::core::AppConfig;

    #[test]
    fn default_limits_are_valid() {
        assert!(validate_limits(&AppConfig::default()).is_ok());
    }

    #[test]
    fn zero_or_oversized_limits_are_rejected() {
        let oversized = AppConfig {
            max_realtime_event_bytes: talenthub_protocol::MAX_EVENT_BYTES + 1,
            ..AppConfig::default()
        };
        assert!(validate_limits(&oversized).is_err());
        let no_ttl = AppConfig {
            signed_url_ttl: Duration::ZERO,
            ..AppConfig::default()
        };
        assert!(validate_limits(&no_ttl).is_err());
        let no_queue = AppConfig {
            realtime_outbound_queue: 0,
            ..AppConfig::default()
        };
        assert!(validate_limits(&no_queue).is_err());
    }
}
