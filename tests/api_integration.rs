use std::sync::Arc;

use actionflow::AppState;
use actionflow::config::AppConfig;
use actionflow::engine::domain::identity::User;
use actionflow::engine::persistence::providers::memory::MemoryStore;
use actionflow::engine::queue::memory::MemoryQueue;
use actionflow::engine::runtime::manager::RunManager;
use actionflow::engine::security::claims::UserClaims;
use actionflow::engine::tools::ToolRegistry;
use actionflow::server::build_app;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tower::ServiceExt;

struct TestApp {
    app: Router,
    queue: Arc<MemoryQueue>,
    secret: String,
    worker_secret: String,
}

async fn test_app() -> TestApp {
    let config = Arc::new(AppConfig::defaults().unwrap());
    let store = Arc::new(MemoryStore::new());
    store
        .insert_user(User {
            id: 1,
            subject: "alice".into(),
            email: None,
            timezone: None,
        })
        .await;
    let queue = Arc::new(MemoryQueue::new());
    let run_manager = Arc::new(RunManager::new(&config, store, queue.clone(), ToolRegistry::new()));
    let state = AppState {
        run_manager,
        config: Arc::clone(&config),
        metrics: None,
    };
    TestApp {
        app: build_app(state),
        queue,
        secret: config.security.jwt_secret.clone(),
        worker_secret: config.security.worker_secret.clone(),
    }
}

fn user_token(secret: &str, sub: &str) -> String {
    let claims = UserClaims {
        sub: sub.into(),
        name: None,
        roles: None,
        exp: 4_102_444_800,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, token: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let t = test_app().await;
    let response = t
        .app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_metrics_absent_without_recorder() {
    let t = test_app().await;
    let response = t
        .app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_requires_bearer_token() {
    let t = test_app().await;
    let response = t
        .app
        .clone()
        .oneshot(Request::builder().uri("/api/runs/x").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let forged = user_token("wrong-secret", "alice");
    let response = t
        .app
        .oneshot(
            Request::builder()
                .uri("/api/runs/x")
                .header(header::AUTHORIZATION, format!("Bearer {forged}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_fetch_and_report_over_http() {
    let t = test_app().await;
    let token = user_token(&t.secret, "alice");

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/api/runs",
            &token,
            &json!({ "prompt": "Draft the weekly report", "mode": "approval" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let run = body_json(response).await;
    assert_eq!(run["status"], "AWAITING_APPROVAL");
    let run_id = run["id"].as_str().unwrap().to_string();

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/runs/{run_id}"))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["id"], run_id.as_str());

    // Worker callbacks authenticate with the job token, not the user JWT.
    let rejected = t
        .app
        .clone()
        .oneshot(post_json(
            &format!("/internal/runs/{run_id}/status"),
            &token,
            &json!({ "status": "RUNNING" }),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    let job_token = t.queue.pending()[0].payload["token"].as_str().unwrap().to_string();
    let response = t
        .app
        .clone()
        .oneshot(post_json(
            &format!("/internal/runs/{run_id}/status"),
            &job_token,
            &json!({ "status": "RUNNING" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "RUNNING");

    let response = t
        .app
        .oneshot(post_json(
            &format!("/api/runs/{run_id}/approve"),
            &token,
            &json!({ "approvedSteps": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_blank_prompt_is_rejected() {
    let t = test_app().await;
    let token = user_token(&t.secret, "alice");
    let response = t
        .app
        .oneshot(post_json("/api/runs", &token, &json!({ "prompt": "   " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(t.queue.pending().is_empty());
}

#[tokio::test]
async fn test_worker_claims_and_finishes_jobs() {
    let t = test_app().await;
    let token = user_token(&t.secret, "alice");
    let response = t
        .app
        .clone()
        .oneshot(post_json("/api/runs", &token, &json!({ "prompt": "Tidy my inbox" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let rejected = t
        .app
        .clone()
        .oneshot(post_json("/internal/jobs/claim", &token, &json!({})))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);

    let response = t
        .app
        .clone()
        .oneshot(post_json("/internal/jobs/claim", &t.worker_secret, &json!({ "limit": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let jobs = body_json(response).await;
    let jobs = jobs.as_array().unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0]["payload"]["token"].is_string());
    assert!(t.queue.pending().is_empty());

    let job_id = jobs[0]["handle"]["id"].as_str().unwrap().to_string();
    let finish = format!("/internal/jobs/{job_id}/finish");
    let response = t
        .app
        .clone()
        .oneshot(post_json(&finish, &t.worker_secret, &json!({ "outcome": "completed" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let again = t
        .app
        .oneshot(post_json(&finish, &t.worker_secret, &json!({ "outcome": "completed" })))
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::NOT_FOUND);
}
