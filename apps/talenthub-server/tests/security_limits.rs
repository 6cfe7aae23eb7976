use std::time::Duration;

use axum::{body::Body, http::Request, http::StatusCode, Router};
use talenthub_server::{build_router, AppConfig};
use tower::ServiceExt;

fn app(config: AppConfig) -> Router {
    build_router(&AppConfig {
        storage_root: std::env::temp_dir()
            .join(format!("talenthub-security-{}", ulid::Ulid::new())),
        ..config
    })
    .unwrap()
}

#[tokio::test]
async fn rejects_body_over_limit() {
    let app = app(AppConfig {
        max_body_bytes: 32,
        request_timeout: Duration::from_secs(1),
        rate_limit_requests_per_minute: 60,
        ..AppConfig::default()
    });

    let request = Request::builder()
        .method("POST")
        .uri("/api/auth/signin")
        .header("content-type", "application/json")
        .body(Body::from(
            r#"{"email":"someone@example.com","password":"this payload is definitely too large"}"#,
        ))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn upload_routes_are_not_bound_by_json_limit() {
    let app = app(AppConfig {
        max_body_bytes: 32,
        rate_limit_requests_per_minute: 60,
        ..AppConfig::default()
    });

    let request = Request::builder()
        .method("POST")
        .uri("/api/messages/upload?filename=cv.pdf")
        .header("content-type", "application/pdf")
        .body(Body::from(vec![b'x'; 4096]))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limits_per_client_ip() {
    let app = app(AppConfig {
        max_body_bytes: 1024,
        request_timeout: Duration::from_secs(1),
        rate_limit_requests_per_minute: 2,
        ..AppConfig::default()
    });

    let request = || {
        Request::builder()
            .method("GET")
            .uri("/health")
            .body(Body::empty())
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    let second = app.clone().oneshot(request()).await.unwrap();
    let third = app.oneshot(request()).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn file_routes_refuse_private_and_unsigned_keys() {
    let app = app(AppConfig {
        rate_limit_requests_per_minute: 60,
        ..AppConfig::default()
    });

    let private = Request::builder()
        .method("GET")
        .uri("/files/public/private/secret.pdf")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(private).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let forged = Request::builder()
        .method("GET")
        .uri("/files/signed/attachments/a.pdf?expires=99999999999&signature=AAAA")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(forged).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[test]
fn invalid_limits_fail_router_construction() {
    let result = build_router(&AppConfig {
        max_attachment_bytes: 0,
        ..AppConfig::default()
    });
    assert!(result.is_err());

    let result = build_router(&AppConfig {
        rate_limit_requests_per_minute: 0,
        ..AppConfig::default()
    });
    assert!(result.is_err());
}
