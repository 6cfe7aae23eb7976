#[cfg(test)]
mod tests {
    use std::{collections::HashSet, time::Duration};

    use axum::{body::Body, http::Request, http::StatusCode, Router};
    use futures_util::future::join_all;
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::mpsc,
    };
    use tower::ServiceExt;

    use super::super::{core::AppConfig, router::build_router};

    struct Session {
        token: String,
        user_id: String,
    }

    fn code_in(buffer: &[u8]) -> Option<String> {
        let marker = b"code is ";
        let start = buffer
            .windows(marker.len())
            .position(|window| window == marker)?
            + marker.len();
        let digits = buffer.get(start..start + 6)?;
        digits
            .iter()
            .all(u8::is_ascii_digit)
            .then(|| String::from_utf8_lossy(digits).into_owned())
    }

    /// Mail API stand-in that forwards every verification code it receives.
    async fn spawn_mail_stub() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (codes_tx, codes_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut request = Vec::new();
                let mut chunk = [0_u8; 4096];
                loop {
                    let read = stream.read(&mut chunk).await.unwrap_or(0);
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&chunk[..read]);
                    if let Some(code) = code_in(&request) {
                        let _ = codes_tx.send(code);
                        break;
                    }
                }
                let body = r#"{"id":"mail"}"#;
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });
        (format!("http://127.0.0.1:{}/emails", addr.port()), codes_rx)
    }

    async fn test_app() -> (Router, mpsc::UnboundedReceiver<String>) {
        let (mail_url, codes) = spawn_mail_stub().await;
        let app = build_router(&AppConfig {
            rate_limit_requests_per_minute: 10_000,
            storage_root: std::env::temp_dir()
                .join(format!("talenthub-server-tests-{}", ulid::Ulid::new())),
            mail_api_url: Some(mail_url),
            ..AppConfig::default()
        })
        .unwrap();
        (app, codes)
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        token: Option<&str>,
        body: Value,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn signup(
        app: &Router,
        codes: &mut mpsc::UnboundedReceiver<String>,
        username: &str,
    ) -> Session {
        let email = format!("{username}@example.com");
        let (status, body) = post_json(
            app,
            "/api/auth/signup",
            None,
            json!({
                "email": email,
                "username": username,
                "display_name": format!("{username} display"),
                "password": "super-secure-password",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let code = tokio::time::timeout(Duration::from_secs(10), codes.recv())
            .await
            .unwrap()
            .unwrap();

        let (status, body) = post_json(
            app,
            "/api/auth/verify-otp",
            None,
            json!({"email": email, "otp": code}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        Session {
            token: body["data"]["token"].as_str().unwrap().to_owned(),
            user_id: body["data"]["user"]["id"].as_str().unwrap().to_owned(),
        }
    }

    /// Server owned by `owner`, returning (server_id, invite_key, general channel id).
    async fn create_server(app: &Router, owner: &Session, name: &str) -> (String, String, String) {
        let (status, body) = post_json(
            app,
            "/api/servers/create",
            Some(&owner.token),
            json!({"name": name}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let general = body["data"]["channels"]
            .as_array()
            .unwrap()
            .iter()
            .find(|channel| channel["name"] == "general")
            .unwrap();
        (
            body["data"]["server"]["id"].as_str().unwrap().to_owned(),
            body["data"]["server"]["invite_key"]
                .as_str()
                .unwrap()
                .to_owned(),
            general["id"].as_str().unwrap().to_owned(),
        )
    }

    async fn channel_conversation(
        app: &Router,
        session: &Session,
        server_id: &str,
        channel_id: &str,
    ) -> String {
        let (status, body) = post_json(
            app,
            "/api/conversations/from-channel",
            Some(&session.token),
            json!({"server_id": server_id, "channel_id": channel_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["data"]["conversation_id"].as_str().unwrap().to_owned()
    }

    async fn send_text(app: &Router, session: &Session, conversation_id: &str, text: &str) -> Value {
        let (status, body) = post_json(
            app,
            "/api/messages/send",
            Some(&session.token),
            json!({"conversation_id": conversation_id, "content": text}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["data"].clone()
    }

    async fn unread_flag(app: &Router, session: &Session, conversation_id: &str) -> bool {
        let (status, body) =
            post_json(app, "/api/conversations/list", Some(&session.token), json!({})).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|entry| entry["conversation_id"] == conversation_id)
            .unwrap()["unread"]
            .as_bool()
            .unwrap()
    }

    #[tokio::test]
    async fn server_invite_and_channel_messaging_flow() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_1").await;
        let bob = signup(&app, &mut codes, "bob_1").await;

        let (server_id, invite_key, general_id) = create_server(&app, &alice, "Guild One").await;
        let (status, body) =
            post_json(&app, "/api/channels/list", Some(&alice.token), json!({"server_id": server_id}))
                .await;
        assert_eq!(status, StatusCode::OK);
        let names: HashSet<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|channel| channel["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, HashSet::from(["general", "random"]));

        let (status, body) = post_json(
            &app,
            "/api/servers/invite-info",
            Some(&bob.token),
            json!({"invite_key": invite_key}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["member_count"], 1);

        let (status, body) = post_json(
            &app,
            "/api/servers/join",
            Some(&bob.token),
            json!({"invite_key": invite_key}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Joined server");
        let (status, body) =
            post_json(&app, "/api/conversations/list", Some(&bob.token), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].as_array().unwrap().is_empty());

        let bob_view = channel_conversation(&app, &bob, &server_id, &general_id).await;
        let (status, body) =
            post_json(&app, "/api/conversations/list", Some(&bob.token), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let listed = body["data"].as_array().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["conversation_id"], bob_view.as_str());
        assert_eq!(listed[0]["title"], "#general");
        let (status, body) = post_json(
            &app,
            "/api/messages/list",
            Some(&bob.token),
            json!({"conversation_id": bob_view}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["messages"].as_array().unwrap().is_empty());
        assert!(body["data"]["next_cursor"].is_null());

        let alice_view = channel_conversation(&app, &alice, &server_id, &general_id).await;
        assert_eq!(bob_view, alice_view);

        let sent = send_text(&app, &bob, &bob_view, "  hello guild  ").await;
        assert_eq!(sent["content"], "hello guild");
        assert_eq!(sent["kind"], "text");
        assert_eq!(sent["sender"]["username"], "bob_1");

        let (status, body) = post_json(
            &app,
            "/api/messages/list",
            Some(&alice.token),
            json!({"conversation_id": alice_view}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["messages"].as_array().unwrap().len(), 1);
        assert!(body["data"]["next_cursor"].is_null());

        assert!(unread_flag(&app, &alice, &alice_view).await);
        let (status, _) = post_json(
            &app,
            "/api/conversations/read",
            Some(&alice.token),
            json!({"conversation_id": alice_view, "message_id": sent["id"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!unread_flag(&app, &alice, &alice_view).await);

        tokio::time::sleep(Duration::from_millis(2)).await;
        send_text(&app, &bob, &bob_view, "are you there?").await;
        assert!(unread_flag(&app, &alice, &alice_view).await);
    }

    #[tokio::test]
    async fn concurrent_dm_upserts_share_one_conversation() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_2").await;
        let bob = signup(&app, &mut codes, "bob_2").await;

        let attempts = (0..8).map(|attempt| {
            let (caller, other) = if attempt % 2 == 0 {
                (&alice, &bob)
            } else {
                (&bob, &alice)
            };
            post_json(
                &app,
                "/api/dms/upsert",
                Some(&caller.token),
                json!({"other_user_id": other.user_id}),
            )
        });
        let conversation_ids: HashSet<String> = join_all(attempts)
            .await
            .into_iter()
            .map(|(status, body)| {
                assert_eq!(status, StatusCode::OK, "{body}");
                body["data"]["conversation_id"].as_str().unwrap().to_owned()
            })
            .collect();
        assert_eq!(conversation_ids.len(), 1);

        let (status, _) = post_json(
            &app,
            "/api/dms/upsert",
            Some(&alice.token),
            json!({"other_user_id": alice.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn concurrent_channel_resolution_yields_one_conversation() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_3").await;
        let (server_id, _, general_id) = create_server(&app, &alice, "Busy").await;

        let attempts = (0..8).map(|_| channel_conversation(&app, &alice, &server_id, &general_id));
        let conversation_ids: HashSet<String> = join_all(attempts).await.into_iter().collect();
        assert_eq!(conversation_ids.len(), 1);

        let (_, body) =
            post_json(&app, "/api/channels/list", Some(&alice.token), json!({"server_id": server_id}))
                .await;
        let channel_key = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .find(|channel| channel["id"] == general_id.as_str())
            .unwrap()["channel_key"]
            .as_str()
            .unwrap()
            .to_owned();
        let (status, body) = post_json(
            &app,
            "/api/channels/by-key",
            Some(&alice.token),
            json!({"channel_key": channel_key}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(conversation_ids.contains(body["data"]["conversation_id"].as_str().unwrap()));
    }

    #[tokio::test]
    async fn cursor_pages_return_every_message_once() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_4").await;
        let (server_id, _, general_id) = create_server(&app, &alice, "Archive").await;
        let conversation_id = channel_conversation(&app, &alice, &server_id, &general_id).await;

        let mut sent = Vec::new();
        for index in 0..7 {
            let message = send_text(&app, &alice, &conversation_id, &format!("m{index}")).await;
            sent.push(message["id"].as_str().unwrap().to_owned());
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut seen = Vec::new();
        let mut cursor = Value::Null;
        loop {
            let (status, body) = post_json(
                &app,
                "/api/messages/list",
                Some(&alice.token),
                json!({"conversation_id": conversation_id, "limit": 3, "cursor": cursor}),
            )
            .await;
            assert_eq!(status, StatusCode::OK, "{body}");
            for message in body["data"]["messages"].as_array().unwrap() {
                seen.push(message["id"].as_str().unwrap().to_owned());
            }
            cursor = body["data"]["next_cursor"].clone();
            if cursor.is_null() {
                break;
            }
        }
        sent.reverse();
        assert_eq!(seen, sent);
    }

    #[tokio::test]
    async fn repeated_deletes_keep_the_first_tombstone() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_5").await;
        let (server_id, _, general_id) = create_server(&app, &alice, "Erasers").await;
        let conversation_id = channel_conversation(&app, &alice, &server_id, &general_id).await;
        let message = send_text(&app, &alice, &conversation_id, "oops").await;
        let message_id = message["id"].as_str().unwrap();

        let (first_status, first) = post_json(
            &app,
            "/api/messages/delete",
            Some(&alice.token),
            json!({"message_id": message_id}),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let (second_status, second) = post_json(
            &app,
            "/api/messages/delete",
            Some(&alice.token),
            json!({"message_id": message_id}),
        )
        .await;
        assert_eq!(first_status, StatusCode::OK);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["data"]["deleted_at"], second["data"]["deleted_at"]);

        let (status, _) = post_json(
            &app,
            "/api/messages/edit",
            Some(&alice.token),
            json!({"message_id": message_id, "content": "fixed"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = post_json(
            &app,
            "/api/messages/list",
            Some(&alice.token),
            json!({"conversation_id": conversation_id}),
        )
        .await;
        let listed = &body["data"]["messages"][0];
        assert_eq!(listed["kind"], "deleted");
        assert_eq!(listed["content"], "");
    }

    #[tokio::test]
    async fn outsiders_are_refused_by_the_membership_gate() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_6").await;
        let bob = signup(&app, &mut codes, "bob_6").await;
        let carol = signup(&app, &mut codes, "carol_6").await;
        let (server_id, _, general_id) = create_server(&app, &alice, "Private").await;
        let channel_conversation_id =
            channel_conversation(&app, &alice, &server_id, &general_id).await;
        let (_, dm) = post_json(
            &app,
            "/api/dms/upsert",
            Some(&alice.token),
            json!({"other_user_id": bob.user_id}),
        )
        .await;
        let dm_id = dm["data"]["conversation_id"].as_str().unwrap().to_owned();
        let message = send_text(&app, &alice, &dm_id, "just us").await;

        for conversation_id in [&channel_conversation_id, &dm_id] {
            let (status, _) = post_json(
                &app,
                "/api/messages/list",
                Some(&carol.token),
                json!({"conversation_id": conversation_id}),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            let (status, _) = post_json(
                &app,
                "/api/messages/send",
                Some(&carol.token),
                json!({"conversation_id": conversation_id, "content": "hi"}),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            let (status, _) = post_json(
                &app,
                "/api/realtime/auth",
                Some(&carol.token),
                json!({
                    "socket_id": "1234.5678",
                    "channel_name": format!("private-conv-{conversation_id}"),
                }),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
        }
        let (status, _) = post_json(
            &app,
            "/api/conversations/read",
            Some(&carol.token),
            json!({"conversation_id": dm_id, "message_id": message["id"]}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = post_json(
            &app,
            "/api/conversations/from-channel",
            Some(&carol.token),
            json!({"server_id": server_id, "channel_id": general_id}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = post_json(
            &app,
            "/api/messages/list",
            None,
            json!({"conversation_id": dm_id}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);

        let (status, body) = post_json(
            &app,
            "/api/realtime/auth",
            Some(&bob.token),
            json!({"socket_id": "1234.5678", "channel_name": format!("private-conv-{dm_id}")}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["auth"]
            .as_str()
            .unwrap()
            .starts_with("talenthub:"));
    }

    #[tokio::test]
    async fn bans_and_mutes_are_enforced() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_7").await;
        let bob = signup(&app, &mut codes, "bob_7").await;
        let (server_id, invite_key, general_id) = create_server(&app, &alice, "Moderated").await;
        post_json(
            &app,
            "/api/servers/join",
            Some(&bob.token),
            json!({"invite_key": invite_key}),
        )
        .await;
        let conversation_id = channel_conversation(&app, &bob, &server_id, &general_id).await;

        let (status, _) = post_json(
            &app,
            "/api/servers/mute",
            Some(&alice.token),
            json!({"server_id": server_id, "user_id": bob.user_id, "muted": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(
            &app,
            "/api/messages/send",
            Some(&bob.token),
            json!({"conversation_id": conversation_id, "content": "let me speak"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = post_json(
            &app,
            "/api/servers/kick",
            Some(&bob.token),
            json!({"server_id": server_id, "user_id": alice.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = post_json(
            &app,
            "/api/servers/ban",
            Some(&alice.token),
            json!({"server_id": server_id, "user_id": alice.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(
            &app,
            "/api/servers/ban",
            Some(&alice.token),
            json!({"server_id": server_id, "user_id": bob.user_id, "reason": " spam "}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(
            &app,
            "/api/servers/join",
            Some(&bob.token),
            json!({"invite_key": invite_key}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, body) = post_json(
            &app,
            "/api/servers/regenerate-invite",
            Some(&alice.token),
            json!({"server_id": server_id}),
        )
        .await;
        assert_ne!(body["data"]["invite_key"], invite_key.as_str());
        let (status, _) = post_json(
            &app,
            "/api/servers/invite-info",
            Some(&alice.token),
            json!({"invite_key": invite_key}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn removed_members_lose_channel_conversations_from_their_list() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_11").await;
        let bob = signup(&app, &mut codes, "bob_11").await;
        let carol = signup(&app, &mut codes, "carol_11").await;
        let (server_id, invite_key, general_id) = create_server(&app, &alice, "Shrinking").await;
        for member in [&bob, &carol] {
            let (status, _) = post_json(
                &app,
                "/api/servers/join",
                Some(&member.token),
                json!({"invite_key": invite_key}),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let conversation_id = channel_conversation(&app, &bob, &server_id, &general_id).await;
        channel_conversation(&app, &carol, &server_id, &general_id).await;
        let dm = post_json(
            &app,
            "/api/dms/upsert",
            Some(&bob.token),
            json!({"other_user_id": alice.user_id}),
        )
        .await
        .1["data"]["conversation_id"]
            .as_str()
            .unwrap()
            .to_owned();

        let (status, _) = post_json(
            &app,
            "/api/servers/kick",
            Some(&alice.token),
            json!({"server_id": server_id, "user_id": bob.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(
            &app,
            "/api/servers/ban",
            Some(&alice.token),
            json!({"server_id": server_id, "user_id": carol.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        send_text(&app, &alice, &conversation_id, "secret plans").await;

        for removed in [&bob, &carol] {
            let (status, _) = post_json(
                &app,
                "/api/messages/list",
                Some(&removed.token),
                json!({"conversation_id": conversation_id}),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN);
            let (status, body) =
                post_json(&app, "/api/conversations/list", Some(&removed.token), json!({}))
                    .await;
            assert_eq!(status, StatusCode::OK);
            assert!(body["data"]
                .as_array()
                .unwrap()
                .iter()
                .all(|entry| entry["conversation_id"] != conversation_id.as_str()));
        }

        let (_, body) =
            post_json(&app, "/api/conversations/list", Some(&bob.token), json!({})).await;
        let listed: Vec<&str> = body["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["conversation_id"].as_str().unwrap())
            .collect();
        assert_eq!(listed, vec![dm.as_str()]);
    }

    #[tokio::test]
    async fn friend_requests_move_through_their_states() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_8").await;
        let bob = signup(&app, &mut codes, "bob_8").await;

        let (status, _) = post_json(
            &app,
            "/api/friends/send",
            Some(&alice.token),
            json!({"query": "alice_8"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post_json(
            &app,
            "/api/friends/send",
            Some(&alice.token),
            json!({"query": "bob_8@example.com"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let request_id = body["data"]["id"].as_str().unwrap().to_owned();

        let (status, _) = post_json(
            &app,
            "/api/friends/send",
            Some(&bob.token),
            json!({"query": "alice_8"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) = post_json(
            &app,
            "/api/friends/status",
            Some(&bob.token),
            json!({"other_user_id": alice.user_id}),
        )
        .await;
        assert_eq!(body["data"]["status"], "pending_received");

        let (_, body) = post_json(
            &app,
            "/api/friends/requests",
            Some(&bob.token),
            json!({"type": "received"}),
        )
        .await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, _) = post_json(
            &app,
            "/api/friends/respond",
            Some(&alice.token),
            json!({"request_id": request_id, "action": "accept"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = post_json(
            &app,
            "/api/friends/respond",
            Some(&bob.token),
            json!({"request_id": request_id, "action": "accept"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = post_json(&app, "/api/friends/list", Some(&alice.token), json!({})).await;
        assert_eq!(body["data"][0]["user"]["username"], "bob_8");

        let (status, _) = post_json(
            &app,
            "/api/friends/remove",
            Some(&alice.token),
            json!({"friend_id": bob.user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = post_json(
            &app,
            "/api/friends/status",
            Some(&alice.token),
            json!({"other_user_id": bob.user_id}),
        )
        .await;
        assert_eq!(body["data"]["status"], "none");
    }

    #[tokio::test]
    async fn portfolios_are_owner_managed_and_publicly_readable() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_9").await;
        let bob = signup(&app, &mut codes, "bob_9").await;

        let (status, body) = post_json(
            &app,
            "/api/portfolios/create",
            Some(&alice.token),
            json!({"name": " Alice ", "title": "Engineer", "summary": "Builds things"}),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        let portfolio_id = body["data"]["id"].as_str().unwrap().to_owned();
        let slug = body["data"]["slug"].as_str().unwrap().to_owned();
        assert_eq!(slug.len(), 32);
        assert!(slug.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(body["data"]["name"], "Alice");

        let (status, body) = post_json(
            &app,
            "/api/portfolios/get-by-slug",
            None,
            json!({"slug": slug.to_ascii_uppercase()}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["owner"]["display_name"], "alice_9 display");

        let (status, _) = post_json(
            &app,
            "/api/portfolios/update",
            Some(&bob.token),
            json!({"portfolio_id": portfolio_id, "title": "Hijacked"}),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = post_json(
            &app,
            "/api/portfolios/update",
            Some(&alice.token),
            json!({"portfolio_id": portfolio_id, "title": "Staff Engineer"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["title"], "Staff Engineer");

        let (_, body) = post_json(&app, "/api/portfolios/list", Some(&bob.token), json!({})).await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let (status, _) = post_json(
            &app,
            "/api/portfolios/delete",
            Some(&alice.token),
            json!({"portfolio_id": portfolio_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            post_json(&app, "/api/portfolios/get-by-slug", None, json!({"slug": slug})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_end_on_signout_and_password_change() {
        let (app, mut codes) = test_app().await;
        let alice = signup(&app, &mut codes, "alice_10").await;

        let (status, body) = post_json(&app, "/api/auth/me", None, json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"].is_null());

        let (status, _) = post_json(
            &app,
            "/api/auth/signin",
            None,
            json!({"email": "alice_10@example.com", "password": "wrong-password"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = post_json(
            &app,
            "/api/auth/change-password",
            Some(&alice.token),
            json!({
                "current_password": "super-secure-password",
                "new_password": "even-more-secure-password",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let fresh = body["data"]["token"].as_str().unwrap().to_owned();

        let (_, body) = post_json(&app, "/api/auth/me", Some(&alice.token), json!({})).await;
        assert!(body["data"].is_null());
        let (_, body) = post_json(&app, "/api/auth/me", Some(&fresh), json!({})).await;
        assert_eq!(body["data"]["username"], "alice_10");

        let (status, _) = post_json(&app, "/api/auth/signout", Some(&fresh), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post_json(&app, "/api/servers/list", Some(&fresh), json!({})).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
