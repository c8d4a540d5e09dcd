//! Operator routes: event inspection and dead-letter replay.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    response::Response,
    Router,
};
use hookline_api::{create_router, AppState, SignatureVerifier, SigningScheme};
use hookline_core::{Clock, EventState};
use hookline_testing::{ScriptedHandler, TestEnv};
use serde_json::Value;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "op-token";

fn app(env: &TestEnv, admin_token: Option<&str>) -> Router {
    let mut state = AppState::new(
        Arc::new(env.store().clone()),
        SignatureVerifier::new("s3cr3t", SigningScheme::Body),
        env.queue(),
        Arc::new(env.clock.clone()) as Arc<dyn Clock>,
    );
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }
    create_router(state, Duration::from_secs(5))
}

fn admin_request(method: Method, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn dead_env() -> Result<TestEnv> {
    let env = TestEnv::builder()
        .handler(ScriptedHandler::rejecting("unknown event type"))
        .build()
        .await?;
    env.ingest("evt_dead", r#"{"id":"evt_dead"}"#).await?;
    env.run_delivery_cycle().await?;
    assert_eq!(env.record("evt_dead").await?.state, EventState::Dead);
    Ok(env)
}

#[tokio::test]
async fn operator_routes_are_absent_without_admin_token() -> Result<()> {
    let env = TestEnv::new().await?;
    env.ingest("evt_1", "{}").await?;
    let app = app(&env, None);

    let response = app.oneshot(admin_request(Method::GET, "/events/evt_1")).await?;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn operator_routes_require_bearer_token() -> Result<()> {
    let env = TestEnv::new().await?;
    env.ingest("evt_1", "{}").await?;
    let app = app(&env, Some(ADMIN_TOKEN));

    let missing = Request::builder().uri("/events/evt_1").body(Body::empty())?;
    let response = app.clone().oneshot(missing).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"]["code"], "unauthorized");

    let wrong = Request::builder()
        .uri("/events/evt_1")
        .header(AUTHORIZATION, "Bearer guess")
        .body(Body::empty())?;
    let response = app.clone().oneshot(wrong).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app.oneshot(admin_request(Method::GET, "/events/evt_1")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn event_view_includes_attempt_history() -> Result<()> {
    let env = TestEnv::builder()
        .handler(ScriptedHandler::failing_then_succeeding(1, "503 from upstream"))
        .build()
        .await?;
    env.ingest("evt_flaky", r#"{"id":"evt_flaky"}"#).await?;
    env.run_delivery_cycle().await?;
    env.advance_and_deliver().await?;
    let app = app(&env, Some(ADMIN_TOKEN));

    let response = app.clone().oneshot(admin_request(Method::GET, "/events/evt_flaky")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["state"], "DELIVERED");
    assert_eq!(body["attempt_count"], 2);
    assert_eq!(body["payload"], r#"{"id":"evt_flaky"}"#);
    let attempts = body["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0]["outcome"], "retryable");
    assert_eq!(attempts[0]["error"], "503 from upstream");
    assert_eq!(attempts[1]["outcome"], "success");

    let response = app.oneshot(admin_request(Method::GET, "/events/evt_missing")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"]["code"], "not_found");
    Ok(())
}

#[tokio::test]
async fn dead_letters_can_be_listed_and_inspected() -> Result<()> {
    let env = dead_env().await?;
    let app = app(&env, Some(ADMIN_TOKEN));

    let response = app.clone().oneshot(admin_request(Method::GET, "/dead-letters")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let list = json_body(response).await;
    let entries = list["dead_letters"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["dedup_key"], "evt_dead");
    assert_eq!(entries[0]["reason"], "permanent");

    let response = app.clone().oneshot(admin_request(Method::GET, "/dead-letters/evt_dead")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let entry = json_body(response).await;
    assert_eq!(entry["payload"], r#"{"id":"evt_dead"}"#);
    assert_eq!(entry["attempt_count"], 1);
    assert_eq!(entry["last_error"], "unknown event type");
    assert_eq!(entry["attempts"].as_array().unwrap().len(), 1);

    let response = app.oneshot(admin_request(Method::GET, "/dead-letters/evt_other")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn replay_returns_dead_event_to_the_queue() -> Result<()> {
    let env = dead_env().await?;
    let app = app(&env, Some(ADMIN_TOKEN));

    let response =
        app.clone().oneshot(admin_request(Method::POST, "/dead-letters/evt_dead/replay")).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["state"], "PENDING");
    assert_eq!(body["attempt_count"], 0);
    assert!(body["last_error"].is_null());

    // Due immediately: the next cycle hands it to the handler again
    assert_eq!(env.run_delivery_cycle().await?, 1);
    assert_eq!(env.handler.calls_for("evt_dead").await, 2);

    // Replaying something that is not dead is a conflict
    env.ingest("evt_live", "{}").await?;
    let response =
        app.clone().oneshot(admin_request(Method::POST, "/dead-letters/evt_live/replay")).await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert_eq!(json_body(response).await["error"]["code"], "invalid_state");

    let response =
        app.oneshot(admin_request(Method::POST, "/dead-letters/evt_nope/replay")).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}
