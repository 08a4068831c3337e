//! HTTP adapter tests against a mock relationship API.

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reciprocity::api::HttpAccountClient;
use reciprocity::source::SessionToken;
use reciprocity::{
    event_channel, AccountClient, Collector, Direction, ItemSource, LoginError, RetryPolicy,
    SourceError,
};

fn client(server: &MockServer) -> HttpAccountClient {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    HttpAccountClient::new(&server.uri(), http, 2)
}

async fn drain_ids(source: &mut dyn ItemSource) -> Vec<Result<String, String>> {
    let mut items = Vec::new();
    while let Some(item) = source.next_item().await {
        items.push(item.map(|e| e.id).map_err(|e| e.to_string()));
    }
    items
}

#[tokio::test]
async fn test_login_then_profile_uses_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({ "username": "alice", "password": "pw" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-1" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/alice"))
        .and(header("authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "username": "alice",
            "following_count": 12,
            "followers_count": 34
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let token = client.login("alice", "pw").await.unwrap();
    assert_eq!(token.expose(), "tok-1");

    let profile = client.profile("alice").await.unwrap();
    assert_eq!(profile.following_count, Some(12));
    assert_eq!(profile.total_for(Direction::Followers), Some(34));
}

#[tokio::test]
async fn test_login_rejections() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({ "username": "wrong" })))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "message": "bad password" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({ "username": "held" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "checkpoint_required",
            "message": "confirm it was you"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_partial_json(json!({ "username": "busy" })))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(
        client.login("wrong", "pw").await,
        Err(LoginError::BadCredentials(msg)) if msg == "bad password"
    ));
    assert!(matches!(
        client.login("held", "pw").await,
        Err(LoginError::Blocked(_))
    ));
    assert!(matches!(
        client.login("busy", "pw").await,
        Err(LoginError::Source(SourceError::RateLimited {
            retry_after: Some(d)
        })) if d == Duration::from_secs(30)
    ));
}

#[tokio::test]
async fn test_two_factor_login() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "two_factor_required",
            "two_factor_identifier": "ident-9"
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/two-factor"))
        .and(body_partial_json(json!({ "identifier": "ident-9", "code": "111111" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "message": "wrong code" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/two-factor"))
        .and(body_partial_json(json!({ "identifier": "ident-9", "code": "123456" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-2fa" })))
        .mount(&server)
        .await;

    let client = client(&server);
    assert!(matches!(
        client.login("alice", "pw").await,
        Err(LoginError::TwoFactorRequired)
    ));
    assert!(matches!(
        client.two_factor_login("alice", "111111").await,
        Err(LoginError::BadCredentials(_))
    ));
    let token = client.two_factor_login("alice", "123456").await.unwrap();
    assert_eq!(token.expose(), "tok-2fa");
}

#[tokio::test]
async fn test_two_factor_without_pending_login() {
    let server = MockServer::start().await;
    let client = client(&server);
    assert!(matches!(
        client.two_factor_login("alice", "123456").await,
        Err(LoginError::Other(_))
    ));
}

#[tokio::test]
async fn test_expired_session_on_profile() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client(&server);
    client
        .restore_session("alice", &SessionToken::new("old"))
        .await
        .unwrap();
    assert!(matches!(
        client.profile("alice").await,
        Err(LoginError::SessionExpired(_))
    ));
}

#[tokio::test]
async fn test_pages_follow_cursor_and_report_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice/following"))
        .and(query_param("cursor", "c1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{ "username": "c" }],
            "next_cursor": null
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/alice/following"))
        .and(query_param("count", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [
                { "username": "a", "full_name": "Ann" },
                { "username": "b" }
            ],
            "unavailable": [{ "username": "ghost", "reason": "account deleted" }],
            "next_cursor": "c1"
        })))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut source = client.relations("alice", Direction::Following, Some(4), false);
    assert_eq!(source.expected_total(), Some(4));

    let first = source.next_item().await.unwrap().unwrap();
    assert_eq!(first.id, "a");
    assert_eq!(first.display_name, "Ann");
    assert_eq!(first.avatar_ref, None);

    let rest = drain_ids(source.as_mut()).await;
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0], Ok("b".to_string()));
    assert!(rest[1].as_ref().unwrap_err().contains("ghost"));
    assert_eq!(rest[2], Ok("c".to_string()));
}

#[tokio::test]
async fn test_throttled_page_is_retried_in_place() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice/followers"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/alice/followers"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/alice/followers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{ "username": "z" }]
        })))
        .with_priority(3)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut source = client.relations("alice", Direction::Followers, None, false);

    let throttled = source.next_item().await.unwrap().unwrap_err();
    assert!(matches!(
        throttled,
        SourceError::RateLimited { retry_after: Some(d) } if d == Duration::from_secs(7)
    ));
    let dropped = source.next_item().await.unwrap().unwrap_err();
    assert!(matches!(dropped, SourceError::Connectivity(_)));

    assert_eq!(source.next_item().await.unwrap().unwrap().id, "z");
    assert!(source.next_item().await.is_none());
}

#[tokio::test]
async fn test_avatars_are_shrunk_when_requested() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice/following"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{
                "username": "a",
                "profile_pic_url": "https://cdn.example/p/s150x150/a.jpg"
            }]
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let mut source = client.relations("alice", Direction::Following, None, true);
    let entity = source.next_item().await.unwrap().unwrap();
    assert_eq!(
        entity.avatar_ref.as_deref(),
        Some("https://cdn.example/p/s100x100/a.jpg")
    );
}

#[tokio::test]
async fn test_unreachable_api_is_connectivity() {
    // nothing listens on the port once the server is dropped
    let uri = {
        let server = MockServer::start().await;
        server.uri()
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .unwrap();
    let client = HttpAccountClient::new(&uri, http, 10);
    let mut source = client.relations("alice", Direction::Following, None, false);
    assert!(matches!(
        source.next_item().await,
        Some(Err(SourceError::Connectivity(_)))
    ));
}

#[tokio::test]
async fn test_rejected_page_stops_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice/following"))
        .and(query_param("cursor", "c1"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({ "message": "invalid cursor" })),
        )
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/alice/following"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "users": [{ "username": "a" }],
            "next_cursor": "c1"
        })))
        .with_priority(2)
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut source = client.relations("alice", Direction::Following, Some(5), false);
    let (events, _rx) = event_channel("alice");
    let outcome = Collector::new(RetryPolicy::default())
        .collect(source.as_mut(), "following", &events)
        .await;

    assert!(!outcome.is_complete());
    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.collection.len(), 1);
    let fatal = outcome.fatal.unwrap();
    assert!(matches!(fatal, SourceError::Request(_)));
    assert!(fatal.to_string().contains("invalid cursor"), "{fatal}");
}

#[tokio::test]
async fn test_malformed_page_stops_collection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/alice/followers"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"users\": [oops"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let mut source = client.relations("alice", Direction::Followers, None, false);
    let (events, _rx) = event_channel("alice");
    let outcome = Collector::new(RetryPolicy::default())
        .collect(source.as_mut(), "followers", &events)
        .await;

    assert!(outcome.skipped.is_empty());
    assert_eq!(outcome.observed, 0);
    assert!(matches!(outcome.fatal, Some(SourceError::Request(_))));
}
