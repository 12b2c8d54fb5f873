//! Router-level tests driven through tower::ServiceExt::oneshot

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use parallizer::config::ServerConfig;
use parallizer::feed::FeedService;
use parallizer::http::{HttpState, router};
use parallizer::merge::MergePolicy;
use parallizer::producers::{PlaceholderProducer, ProducerRegistry};
use parallizer::store::UserCacheStore;
use serde_json::{Value, json};
use tower::ServiceExt;

fn app_with(config: ServerConfig) -> Router {
    let registry = ProducerRegistry::new().with(Arc::new(PlaceholderProducer::new()));
    let store = UserCacheStore::new(MergePolicy::default(), Duration::from_secs(3600), 64);
    let feed = Arc::new(FeedService::new(registry, store));
    router(HttpState::new(feed, config))
}

fn app() -> Router {
    app_with(ServerConfig::default())
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn trigger_body(user_id: &str, cursor: Value) -> Value {
    json!({
        "user_id": user_id,
        "document_text": "# Plan\nAdd retries\n",
        "cursor_position": cursor,
        "global_context": {"scope_root": "/tmp/project", "plan_path": null}
    })
}

#[tokio::test]
async fn trigger_then_poll_until_idle() {
    let app = app();
    let (status, body) = send(&app, post_json("/trigger", trigger_body("u1", json!([1, 3])))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processing"], true);
    assert!(body["cards"].as_array().unwrap().is_empty());

    let mut polled = Value::Null;
    for _ in 0..100 {
        let (status, body) = send(&app, post_json("/poll", json!({"user_id": "u1"}))).await;
        assert_eq!(status, StatusCode::OK);
        polled = body;
        if polled["processing"] == false {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(polled["processing"], false);
    let cards = polled["cards"].as_array().unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0]["metadata"]["source"], "placeholder");
    assert!(polled["last_updated"].as_f64().unwrap() > 0.0);
}

#[tokio::test]
async fn fulfill_is_an_alias_of_trigger() {
    let app = app();
    let (status, body) = send(&app, post_json("/fulfill", trigger_body("u2", json!([0, 0])))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processing"], true);
}

#[tokio::test]
async fn malformed_trigger_is_a_validation_error() {
    let app = app();

    let (status, body) = send(&app, post_json("/trigger", trigger_body("u1", json!([1])))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], 400);

    let (status, _) = send(&app, post_json("/trigger", trigger_body("u1", json!([-1, 2])))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json("/trigger", json!({"user_id": "u1"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, post_json("/trigger", trigger_body("", json!([0, 0])))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // nothing was created for the rejected requests
    let (_, root) = send(&app, get("/")).await;
    assert_eq!(root["users"], 0);
}

#[tokio::test]
async fn unknown_user_polls_empty() {
    let app = app();
    let (status, body) = send(&app, get("/poll/nobody")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processing"], false);
    assert!(body["cards"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn push_then_clear() {
    let app = app();
    let cards = json!([
        {"header": "Tip", "text": "Consider adding type hints", "type": "context", "metadata": {}},
        {"header": "Tip", "text": "Consider adding type annotations", "type": "context"},
        {"header": "Q", "text": "Which database?", "type": "question"}
    ]);
    let (status, body) = send(&app, post_json("/cards", json!({"user_id": "u1", "cards": cards}))).await;
    assert_eq!(status, StatusCode::OK);
    let kinds: Vec<_> = body["cards"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(kinds, vec!["question", "context"]);

    let req = Request::builder()
        .method("DELETE")
        .uri("/user/u1/feed")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (_, body) = send(&app, post_json("/clear", json!({"user_id": "u1"}))).await;
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn unknown_card_type_is_rejected() {
    let app = app();
    let cards = json!([{"header": "h", "text": "t", "type": "weather"}]);
    let (status, _) = send(&app, post_json("/cards", json!({"user_id": "u1", "cards": cards}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_reports_producers_and_interval() {
    let app = app();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["poll_interval_seconds"], 3);
    assert_eq!(body["producers"][0]["name"], "placeholder");
    assert_eq!(body["producers"][0]["available"], true);
}

#[tokio::test]
async fn health_is_degraded_without_an_available_producer() {
    let store = UserCacheStore::new(MergePolicy::default(), Duration::from_secs(3600), 64);
    let feed = Arc::new(FeedService::new(ProducerRegistry::new(), store));
    let app = router(HttpState::new(feed, ServerConfig::default()));

    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert!(body["producers"].as_array().unwrap().is_empty());
    assert_eq!(body["runs_in_flight"], 0);
}

#[tokio::test]
async fn bearer_token_guards_everything_but_health() {
    let app = app_with(ServerConfig {
        bearer_token: Some("secret".into()),
        ..ServerConfig::default()
    });

    let (status, body) = send(&app, get("/poll/u1")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], 401);

    let (status, _) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);

    let req = Request::builder()
        .uri("/poll/u1")
        .header(header::AUTHORIZATION, "Bearer secret")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
}
