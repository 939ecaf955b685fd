use crate::config::Config;
use crate::ingest::{Ingestor, Rejection};
use crate::stats;
use crate::store::SharedStore;
use crate::windows::{ReopenWindows, UserAction};
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bridge_core::signatures::verify_bearer_token;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub ingestor: Ingestor,
    pub windows: ReopenWindows,
    pub worker_alive: Arc<AtomicBool>,
}

/// Routes without the per-IP governor, which needs connection info and is
/// layered on in `main`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats_handler))
        .route("/users/{user_id}/reopenable", get(list_reopenable))
        .route("/users/{user_id}/tasks/{task_id}/reopen", post(reopen_task))
        .route("/users/{user_id}/tasks/{task_id}/close", post(close_task))
        .layer(DefaultBodyLimit::max(state.config.max_payload_bytes))
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match state.ingestor.receive(&headers, &body).await {
        Ok(event) => (StatusCode::OK, Json(json!({"status": "ok", "id": event.id}))),
        Err(rejection) => {
            if let Rejection::Unauthorized(reason) = rejection {
                warn!(reason, "webhook authentication failed");
            }
            (
                rejection.status(),
                Json(json!({"error": rejection.message()})),
            )
        }
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.worker_alive.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "event worker not running"})),
        );
    }

    if let Err(error) = state.store.ping().await {
        warn!(error = %error, "coordination store unreachable");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "not_ready", "reason": "coordination store unreachable"})),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "bind": state.config.bind_addr,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match stats::snapshot(&state.store).await {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(error) => {
            error!(error = %error, "failed to read stats");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "stats unavailable"})),
            )
        }
    }
}

async fn list_reopenable(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(denied) = authorize_frontend(&state.config, &headers) {
        return denied;
    }
    match state.windows.list_for_user(user_id).await {
        Ok(tasks) => (StatusCode::OK, Json(json!({"user_id": user_id, "tasks": tasks}))),
        Err(error) => {
            error!(user_id, error = %error, "failed to list reopen windows");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "coordination store unavailable"})),
            )
        }
    }
}

async fn reopen_task(
    State(state): State<Arc<AppState>>,
    Path((user_id, task_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(denied) = authorize_frontend(&state.config, &headers) {
        return denied;
    }
    let result = state.windows.reopen(user_id, task_id, epoch_seconds()).await;
    action_response(result, "no reopen window for this ticket")
}

async fn close_task(
    State(state): State<Arc<AppState>>,
    Path((user_id, task_id)): Path<(i64, i64)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(denied) = authorize_frontend(&state.config, &headers) {
        return denied;
    }
    let result = state.windows.close(user_id, task_id, epoch_seconds()).await;
    action_response(result, "ticket not found for this user")
}

/// The user routes act on behalf of whichever user id is in the path, so
/// only the front end holding the shared key may call them.
fn authorize_frontend(config: &Config, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let unauthorized = |reason: &'static str| {
        warn!(reason, "front end authentication failed");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized"})),
        )
    };

    let Some(expected) = config.frontend_api_key.as_deref() else {
        return Err(unauthorized("front end key not configured"));
    };
    let Some(provided) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return Err(unauthorized("missing authorization header"));
    };
    if !verify_bearer_token(expected, provided) {
        return Err(unauthorized("invalid bearer token"));
    }
    Ok(())
}

fn action_response(
    result: anyhow::Result<UserAction>,
    not_found: &'static str,
) -> (StatusCode, Json<Value>) {
    match result {
        Ok(UserAction::Done { task_id }) => {
            (StatusCode::OK, Json(json!({"status": "ok", "task_id": task_id})))
        }
        Ok(UserAction::Cooldown) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": "please wait before trying again"})),
        ),
        Ok(UserAction::NotFound) => (StatusCode::NOT_FOUND, Json(json!({"error": not_found}))),
        Ok(UserAction::RemoteFailed) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "workflow system did not accept the request"})),
        ),
        Err(error) => {
            error!(error = %error, "user action failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "coordination store unavailable"})),
            )
        }
    }
}

fn epoch_seconds() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchGroup;
    use crate::keys;
    use crate::notify::SharedNotifier;
    use crate::store::{CoordinationStore, MemoryStore};
    use crate::test_support::{
        FRONTEND_KEY, RecordingNotifier, seeded_client, signed_headers, test_config, webhook_body,
    };
    use crate::worker::{EventWorker, Outcome, ScanStop};
    use axum::body::Body;
    use axum::http::Request;
    use bridge_core::model::QueuedEvent;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        router: Router,
        store: MemoryStore,
        notifier: RecordingNotifier,
        worker: EventWorker,
    }

    async fn harness() -> Harness {
        let config = test_config("http://127.0.0.1:1", "http://127.0.0.1:1");
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let notifier = RecordingNotifier::default();
        let shared_notifier: SharedNotifier = Arc::new(notifier.clone());
        let client = seeded_client("http://127.0.0.1:1", &store).await;

        let state = Arc::new(AppState {
            ingestor: Ingestor::new(&config, shared.clone()),
            windows: ReopenWindows::new(&config, client, shared.clone()),
            worker_alive: Arc::new(AtomicBool::new(true)),
            store: shared.clone(),
            config: config.clone(),
        });

        Harness {
            router: build_router(state),
            worker: EventWorker::new(&config, shared, shared_notifier),
            store,
            notifier,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    fn webhook_request(body: &[u8]) -> Request<Body> {
        let mut builder = Request::builder().method("POST").uri("/webhook");
        for (name, value) in signed_headers(body).iter() {
            builder = builder.header(name, value);
        }
        builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_vec()))
            .expect("request")
    }

    async fn pop_event(store: &MemoryStore) -> QueuedEvent {
        let raw = store
            .blocking_pop(keys::EVENT_QUEUE, Duration::from_millis(100))
            .await
            .expect("pop")
            .expect("queued event");
        serde_json::from_str(&raw).expect("event json")
    }

    #[tokio::test]
    async fn redelivered_webhook_notifies_once() {
        let harness = harness().await;
        let body = webhook_body(42, Some(1001), &[(7, "Your printer is fixed", None)]);

        let (status, response) = send(&harness.router, webhook_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "ok");

        let event = pop_event(&harness.store).await;
        assert_eq!(event.task_id, 42);
        let mut dispatches = DispatchGroup::new();
        let first = harness.worker.process_event(&event, &mut dispatches).await;
        dispatches.drain(Duration::from_secs(1)).await;
        assert_eq!(
            first,
            Outcome::Scanned {
                notified: vec![7],
                stop: ScanStop::Exhausted
            }
        );

        let sent = harness.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].user_id, 1001);
        assert_eq!(sent[0].text, "Your printer is fixed");
        assert!(
            harness
                .store
                .get(&keys::comment_marker_key(7))
                .await
                .expect("get")
                .is_some()
        );

        let (status, _) = send(&harness.router, webhook_request(&body)).await;
        assert_eq!(status, StatusCode::OK);
        let event = pop_event(&harness.store).await;
        let second = harness.worker.process_event(&event, &mut dispatches).await;
        dispatches.drain(Duration::from_secs(1)).await;

        assert_eq!(
            second,
            Outcome::Scanned {
                notified: vec![],
                stop: ScanStop::AlreadyNotified
            }
        );
        assert_eq!(harness.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn unsigned_webhook_is_rejected() {
        let harness = harness().await;
        let body = webhook_body(42, Some(1001), &[(7, "hello", None)]);
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .body(Body::from(body))
            .expect("request");

        let (status, response) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["error"], "missing pyrus signature");
        assert_eq!(
            harness.store.list_len(keys::EVENT_QUEUE).await.expect("len"),
            0
        );
    }

    #[tokio::test]
    async fn oversized_webhook_is_rejected() {
        let harness = harness().await;
        let body = vec![b'x'; 2 * 1_048_576];

        let (status, _) = send(&harness.router, webhook_request(&body)).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn ready_reflects_worker_liveness() {
        let config = test_config("http://127.0.0.1:1", "http://127.0.0.1:1");
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let client = seeded_client("http://127.0.0.1:1", &store).await;
        let worker_alive = Arc::new(AtomicBool::new(false));
        let router = build_router(Arc::new(AppState {
            ingestor: Ingestor::new(&config, shared.clone()),
            windows: ReopenWindows::new(&config, client, shared.clone()),
            worker_alive: worker_alive.clone(),
            store: shared,
            config,
        }));

        let get = |uri: &str| Request::builder().uri(uri).body(Body::empty()).expect("request");
        let (status, _) = send(&router, get("/ready")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        worker_alive.store(true, Ordering::SeqCst);
        let (status, response) = send(&router, get("/ready")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["status"], "ready");

        let (status, _) = send(&router, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_reports_accepted_events() {
        let harness = harness().await;
        let body = webhook_body(42, Some(1001), &[(7, "hello", None)]);
        send(&harness.router, webhook_request(&body)).await;

        let request = Request::builder()
            .uri("/stats")
            .body(Body::empty())
            .expect("request");
        let (status, response) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["queue_depth"], 1);
        assert_eq!(response["counters"]["events:accepted"], 1);
    }

    fn user_request(method: &str, uri: &str, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::empty()).expect("request")
    }

    #[tokio::test]
    async fn user_routes_map_window_state_to_status() {
        let harness = harness().await;

        let request = user_request("GET", "/users/1001/reopenable", Some(FRONTEND_KEY));
        let (status, response) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["tasks"], json!([]));

        let request = user_request("POST", "/users/1001/tasks/42/reopen", Some(FRONTEND_KEY));
        let (status, _) = send(&harness.router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn user_routes_reject_callers_without_front_end_key() {
        let harness = harness().await;
        let window = keys::reopen_window_key(1001, 42);
        harness
            .store
            .set(&window, "{\"task_id\":42,\"fields\":[]}", Some(Duration::from_secs(600)))
            .await
            .expect("seed window");

        for token in [None, Some("guessed-key")] {
            for (method, uri) in [
                ("GET", "/users/1001/reopenable"),
                ("POST", "/users/1001/tasks/42/reopen"),
                ("POST", "/users/1001/tasks/42/close"),
            ] {
                let (status, response) =
                    send(&harness.router, user_request(method, uri, token)).await;
                assert_eq!(status, StatusCode::UNAUTHORIZED, "{method} {uri}");
                assert_eq!(response["error"], "unauthorized");
            }
        }

        assert!(harness.store.get(&window).await.expect("get").is_some());
        assert!(
            harness
                .store
                .get(&keys::cooldown_key("reopen", 1001))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn user_routes_stay_closed_without_configured_key() {
        let mut config = test_config("http://127.0.0.1:1", "http://127.0.0.1:1");
        config.frontend_api_key = None;
        let store = MemoryStore::new();
        let shared: SharedStore = Arc::new(store.clone());
        let client = seeded_client("http://127.0.0.1:1", &store).await;
        let router = build_router(Arc::new(AppState {
            ingestor: Ingestor::new(&config, shared.clone()),
            windows: ReopenWindows::new(&config, client, shared.clone()),
            worker_alive: Arc::new(AtomicBool::new(true)),
            store: shared,
            config,
        }));

        let request = user_request("GET", "/users/1001/reopenable", Some(FRONTEND_KEY));
        let (status, _) = send(&router, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
