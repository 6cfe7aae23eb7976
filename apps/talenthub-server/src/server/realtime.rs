mod connection_control;
mod connection_subscriptions;
mod emit_metrics;
mod fanout_dispatch;
mod ingress_rate_limit;
mod subscription_signature;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use talenthub_core::UserId;
use talenthub_protocol::{
    parse_envelope, ChannelName, CONNECTION_ESTABLISHED_EVENT, SUBSCRIBE_COMMAND,
    SUBSCRIPTION_ERROR_EVENT, SUBSCRIPTION_SUCCEEDED_EVENT, UNSUBSCRIBE_COMMAND,
};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use self::{
    connection_control::close_connections,
    connection_subscriptions::{
        insert_subscription, remove_connection_from_subscriptions, remove_subscription,
    },
    emit_metrics::emit_realtime_delivery_metrics,
    fanout_dispatch::{fan_out, Fanout},
    ingress_rate_limit::IngressWindow,
    subscription_signature::{
        is_valid_socket_id, new_socket_id, sign_subscription, verify_subscription,
    },
};
use super::{
    auth::{authenticate_with_token, bearer_token},
    core::{AppState, AuthContext, ConnectionControl},
    domain::authorize_conversation,
    errors::ApiFailure,
    gateway_events::{
        try_connection_established, try_subscription_error, try_subscription_succeeded,
        GatewayEvent,
    },
    metrics::{
        record_rate_limit_hit, record_realtime_event_dropped, record_realtime_event_emitted,
        record_realtime_event_parse_rejected, record_realtime_event_serialize_error,
        record_side_effect_failure, record_ws_disconnect,
    },
    types::GatewayAuthQuery,
};

const PING_INTERVAL: Duration = Duration::from_secs(30);
const ACTIVITY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SubscribeCommand {
    channel: String,
    auth: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnsubscribeCommand {
    channel: String,
}

/// Issues the auth string a connection presents when subscribing to a
/// conversation channel. The caller must pass the conversation gate.
pub(crate) async fn authorize_subscription(
    state: &AppState,
    user_id: UserId,
    socket_id: &str,
    channel_name: String,
) -> Result<String, ApiFailure> {
    if !is_valid_socket_id(socket_id) {
        return Err(ApiFailure::InvalidRequest("Invalid socket id"));
    }
    let channel = ChannelName::try_from(channel_name)
        .map_err(|_| ApiFailure::InvalidRequest("Invalid channel name"))?;
    let conversation_id = channel
        .conversation_id()
        .ok_or(ApiFailure::InvalidRequest("Invalid channel name"))?;
    authorize_conversation(state, user_id, conversation_id).await?;

    sign_subscription(
        &state.runtime.realtime_app_key,
        &state.runtime.realtime_secret,
        socket_id,
        channel.as_str(),
    )
    .map_err(|error| {
        tracing::error!(event = "realtime.auth", error = %error);
        ApiFailure::Internal
    })
}

/// Best-effort publish of a conversation event; failures are logged and
/// counted, never surfaced to the caller.
pub(crate) async fn publish_conversation_event(
    state: &AppState,
    conversation_id: &str,
    event_type: &'static str,
    event: anyhow::Result<GatewayEvent>,
) -> usize {
    let event = match event {
        Ok(event) => event,
        Err(error) => {
            record_realtime_event_serialize_error("conversation", event_type);
            record_side_effect_failure("realtime", "publish");
            tracing::warn!(
                event = "realtime.publish",
                conversation_id = %conversation_id,
                event_type,
                error = %error,
            );
            return 0;
        }
    };
    broadcast_conversation_event(state, conversation_id, &event).await
}

pub(crate) async fn broadcast_conversation_event(
    state: &AppState,
    conversation_id: &str,
    event: &GatewayEvent,
) -> usize {
    let channel = ChannelName::for_conversation(conversation_id);
    let mut subscriptions = state.subscriptions.write().await;
    let fanout = match subscriptions.get_mut(channel.as_str()) {
        Some(listeners) => {
            let fanout = fan_out(listeners, event, state.runtime.max_realtime_event_bytes);
            if listeners.is_empty() {
                subscriptions.remove(channel.as_str());
            }
            fanout
        }
        None => Fanout::default(),
    };
    drop(subscriptions);

    if !fanout.slow_consumers.is_empty() {
        let controls = state.connection_controls.read().await;
        close_connections(&controls, &fanout.slow_consumers);
    }
    emit_realtime_delivery_metrics("conversation", event.event_type, fanout.delivered)
}

pub(crate) async fn realtime_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiFailure> {
    let token = query
        .access_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ApiFailure::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_realtime_connection(state, socket, auth).await;
    }))
}

/// Queues a connection-level frame. Returns `false` when the outbound queue
/// is full and the connection should be dropped.
fn queue_connection_event(
    outbound_tx: &mpsc::Sender<String>,
    event_type: &'static str,
    event: anyhow::Result<GatewayEvent>,
) -> bool {
    let event = match event {
        Ok(event) => event,
        Err(error) => {
            record_realtime_event_serialize_error("connection", event_type);
            tracing::warn!(event = "realtime.connection.frame", event_type, error = %error);
            return true;
        }
    };
    if outbound_tx.try_send(event.payload).is_err() {
        record_realtime_event_dropped("connection", event.event_type, "full_queue");
        return false;
    }
    record_realtime_event_emitted("connection", event.event_type);
    true
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_realtime_connection(
    state: AppState,
    socket: WebSocket,
    auth: AuthContext,
) {
    let connection_id = Uuid::new_v4();
    let socket_id = new_socket_id();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.realtime_outbound_queue);
    let (control_tx, mut control_rx) = watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);
    tracing::debug!(
        event = "realtime.connect",
        user_id = %auth.user_id,
        socket_id = %socket_id,
    );

    queue_connection_event(
        &outbound_tx,
        CONNECTION_ESTABLISHED_EVENT,
        try_connection_established(&socket_id, ACTIVITY_TIMEOUT_SECS),
    );

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let mut ingress = IngressWindow::new(
        state.runtime.realtime_ingress_events_per_window,
        state.runtime.realtime_ingress_window,
    );
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_realtime_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_realtime_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !ingress.admit(Instant::now()) {
            record_rate_limit_hit("realtime", "ingress");
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        let Ok(envelope) = parse_envelope(&payload) else {
            record_realtime_event_parse_rejected("ingress", "invalid_envelope");
            disconnect_reason = "invalid_envelope";
            break;
        };

        match envelope.t.as_str() {
            SUBSCRIBE_COMMAND => {
                let Ok(command) = serde_json::from_value::<SubscribeCommand>(envelope.d) else {
                    record_realtime_event_parse_rejected("ingress", "invalid_subscribe_payload");
                    disconnect_reason = "invalid_subscribe_payload";
                    break;
                };
                let Some(channel) = ChannelName::try_from(command.channel)
                    .ok()
                    .filter(|channel| channel.conversation_id().is_some())
                else {
                    if !queue_connection_event(
                        &outbound_tx,
                        SUBSCRIPTION_ERROR_EVENT,
                        try_subscription_error(None, "invalid_channel"),
                    ) {
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                    continue;
                };
                if !verify_subscription(
                    &state.runtime.realtime_app_key,
                    &state.runtime.realtime_secret,
                    &socket_id,
                    channel.as_str(),
                    &command.auth,
                ) {
                    tracing::info!(
                        event = "realtime.subscribe",
                        outcome = "rejected",
                        user_id = %auth.user_id,
                        channel = %channel.as_str(),
                    );
                    if !queue_connection_event(
                        &outbound_tx,
                        SUBSCRIPTION_ERROR_EVENT,
                        try_subscription_error(Some(channel.as_str()), "invalid_auth"),
                    ) {
                        disconnect_reason = "outbound_queue_full";
                        break;
                    }
                    continue;
                }

                insert_subscription(
                    &mut *state.subscriptions.write().await,
                    channel.as_str(),
                    connection_id,
                    outbound_tx.clone(),
                );
                if !queue_connection_event(
                    &outbound_tx,
                    SUBSCRIPTION_SUCCEEDED_EVENT,
                    try_subscription_succeeded(&channel),
                ) {
                    disconnect_reason = "outbound_queue_full";
                    break;
                }
            }
            UNSUBSCRIBE_COMMAND => {
                let Ok(command) = serde_json::from_value::<UnsubscribeCommand>(envelope.d) else {
                    record_realtime_event_parse_rejected(
                        "ingress",
                        "invalid_unsubscribe_payload",
                    );
                    disconnect_reason = "invalid_unsubscribe_payload";
                    break;
                };
                remove_subscription(
                    &mut *state.subscriptions.write().await,
                    &command.channel,
                    connection_id,
                );
            }
            _ => {
                record_realtime_event_parse_rejected("ingress", "unknown_event");
                disconnect_reason = "unknown_event";
                break;
            }
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id).await;
    send_task.abort();
}

pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid) {
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);
    remove_connection_from_subscriptions(&mut *state.subscriptions.write().await, connection_id);
}

#[cfg(test)]
mod tests {
    use talenthub_protocol::MESSAGE_DELETED_EVENT;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::{broadcast_conversation_event, publish_conversation_event, remove_connection};
    use crate::server::{
        core::{AppConfig, AppState, ConnectionControl},
        gateway_events,
    };

    fn test_state() -> AppState {
        AppState::new(&AppConfig {
            storage_root: std::env::temp_dir()
                .join(format!("talenthub-realtime-{}", ulid::Ulid::new())),
            ..AppConfig::default()
        })
        .expect("state should build")
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_and_disconnects_slow_ones() {
        let state = test_state();
        let fast = Uuid::new_v4();
        let slow = Uuid::new_v4();
        let (fast_tx, mut fast_rx) = mpsc::channel::<String>(4);
        let (slow_tx, _slow_rx) = mpsc::channel::<String>(1);
        slow_tx
            .try_send(String::from("backlog"))
            .expect("queue should accept first message");
        let (control_tx, control_rx) = watch::channel(ConnectionControl::Open);
        state.connection_controls.write().await.insert(slow, control_tx);
        {
            let mut subscriptions = state.subscriptions.write().await;
            let listeners = subscriptions
                .entry(String::from("private-conv-c1"))
                .or_default();
            listeners.insert(fast, fast_tx);
            listeners.insert(slow, slow_tx);
        }

        let event = gateway_events::try_message_deleted("c1", "m1", 42);
        let delivered =
            publish_conversation_event(&state, "c1", MESSAGE_DELETED_EVENT, event).await;

        assert_eq!(delivered, 1);
        let frame = fast_rx.recv().await.expect("fast subscriber receives frame");
        assert!(frame.contains("message:deleted"));
        assert_eq!(*control_rx.borrow(), ConnectionControl::Close);
        let subscriptions = state.subscriptions.read().await;
        let listeners = subscriptions
            .get("private-conv-c1")
            .expect("channel keeps its healthy listener");
        assert!(!listeners.contains_key(&slow));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_a_no_op() {
        let state = test_state();
        let event = gateway_events::try_message_deleted("nobody", "m1", 1)
            .expect("event should build");
        assert_eq!(broadcast_conversation_event(&state, "nobody", &event).await, 0);
    }

    #[tokio::test]
    async fn removing_a_connection_clears_controls_and_subscriptions() {
        let state = test_state();
        let connection_id = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel::<String>(1);
        let (control_tx, _control_rx) = watch::channel(ConnectionControl::Open);
        state
            .connection_controls
            .write()
            .await
            .insert(connection_id, control_tx);
        state
            .subscriptions
            .write()
            .await
            .entry(String::from("private-conv-c2"))
            .or_default()
            .insert(connection_id, tx);

        remove_connection(&state, connection_id).await;

        assert!(state.connection_controls.read().await.is_empty());
        assert!(state.subscriptions.read().await.is_empty());
    }
}
