//! HTTP target service against a stub server

use festload_engine::target::{
    BodyField, EnqueueResult, HttpTargetConfig, HttpTargetService, LoginRequest, LoginResult,
    PositionResult, TargetService,
};
use festload_engine::TargetError;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(server: &MockServer) -> HttpTargetService {
    HttpTargetService::new(HttpTargetConfig::new(server.uri())).unwrap()
}

#[tokio::test]
async fn test_login_reads_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .and(body_json(json!({
            "email": "loadtest_user_1@test.com",
            "nickname": "LoadTestUser1",
            "role": "VISITOR",
            "managedBoothId": null
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "abc" })))
        .expect(1)
        .mount(&server)
        .await;

    let result = service(&server)
        .login(&LoginRequest::visitor("loadtest_user_1@test.com", "LoadTestUser1"))
        .await
        .unwrap();

    assert_eq!(result, LoginResult::Issued { token: "abc".to_string() });
}

#[tokio::test]
async fn test_login_falls_back_to_token_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "xyz" })))
        .mount(&server)
        .await;

    let result = service(&server)
        .login(&LoginRequest::visitor("a@test.com", "A"))
        .await
        .unwrap();

    assert_eq!(result, LoginResult::Issued { token: "xyz".to_string() });
}

#[tokio::test]
async fn test_login_without_token_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "user": "a" })))
        .mount(&server)
        .await;

    let target = service(&server);
    let result = target
        .login(&LoginRequest::visitor("a@test.com", "A"))
        .await
        .unwrap();

    assert_eq!(result, LoginResult::Malformed);
}

#[tokio::test]
async fn test_login_rejected_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = service(&server)
        .login(&LoginRequest::visitor("a@test.com", "A"))
        .await
        .unwrap();

    assert_eq!(result, LoginResult::Rejected { status: 401 });
}

#[tokio::test]
async fn test_enqueue_created_with_position() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/waitings"))
        .and(header("authorization", "Bearer tok"))
        .and(body_json(json!({ "boothId": 7 })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "position": 3 })))
        .expect(1)
        .mount(&server)
        .await;

    let result = service(&server).enqueue("tok", 7).await.unwrap();

    assert_eq!(result, EnqueueResult::Created { position: 3.into() });
}

#[tokio::test]
async fn test_enqueue_conflict_and_server_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/waitings"))
        .and(header("authorization", "Bearer dup"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/waitings"))
        .and(header("authorization", "Bearer broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let target = service(&server);

    assert_eq!(target.enqueue("dup", 1).await.unwrap(), EnqueueResult::Conflict);
    assert_eq!(
        target.enqueue("broken", 1).await.unwrap(),
        EnqueueResult::Error { status: 500 }
    );
}

#[tokio::test]
async fn test_position_and_cancel() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/waitings/booth/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "position": 12, "message": "waiting" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/waitings/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let target = service(&server);

    let position = target.position("tok", 1).await.unwrap();
    assert_eq!(
        position,
        PositionResult::Found {
            position: 12.into(),
            message: "waiting".to_string().into(),
        }
    );
    assert!(position.has_position_field());

    let cancel = target.cancel("tok", 1).await.unwrap();
    assert_eq!(cancel.status, 204);
    assert!(cancel.is_success());
}

/// Bodies whose `position` key is present but null, a string, or next to a
/// mistyped `message`.
fn irregular_position_bodies() -> Vec<serde_json::Value> {
    vec![
        json!({ "position": null }),
        json!({ "position": "3" }),
        json!({ "position": 2, "message": { "k": 1 } }),
    ]
}

#[tokio::test]
async fn test_enqueue_position_key_counts_whatever_its_value() {
    for body in irregular_position_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/waitings"))
            .respond_with(ResponseTemplate::new(201).set_body_json(body.clone()))
            .mount(&server)
            .await;

        let result = service(&server).enqueue("tok", 1).await.unwrap();

        match result {
            EnqueueResult::Created { position } => {
                assert!(position.is_present(), "body {}", body);
            }
            other => panic!("unexpected {:?} for {}", other, body),
        }
    }
}

#[tokio::test]
async fn test_position_key_counts_whatever_its_value() {
    for body in irregular_position_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/waitings/booth/1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
            .mount(&server)
            .await;

        let result = service(&server).position("tok", 1).await.unwrap();

        assert!(result.has_position_field(), "body {}", body);
    }
}

#[tokio::test]
async fn test_valid_position_survives_mistyped_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/waitings/booth/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "position": 2, "message": { "k": 1 } })),
        )
        .mount(&server)
        .await;

    let result = service(&server).position("tok", 1).await.unwrap();

    assert_eq!(
        result,
        PositionResult::Found {
            position: 2.into(),
            message: BodyField::Present(None),
        }
    );
}

#[tokio::test]
async fn test_body_without_position_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/waitings/booth/1"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let result = service(&server).position("tok", 1).await.unwrap();

    assert!(!result.has_position_field());
}

#[tokio::test]
async fn test_slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/waitings"))
        .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let target = HttpTargetService::new(
        HttpTargetConfig::new(server.uri()).with_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let err = target.enqueue("tok", 1).await.unwrap_err();

    assert!(err.is_timeout());
    assert!(matches!(err, TargetError::Timeout { operation: "enqueue", .. }));
}

#[tokio::test]
async fn test_refused_connection_is_transport_error() {
    // Nothing listens on port 1.
    let target = HttpTargetService::new(HttpTargetConfig::new("http://127.0.0.1:1")).unwrap();
    let err = target.cancel("tok", 1).await.unwrap_err();

    assert!(matches!(err, TargetError::Transport { operation: "cancel", .. }));
}
