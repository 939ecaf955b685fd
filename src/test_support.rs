use crate::config::{Config, FieldIds, PyrusConfig, StoreBackend};
use crate::keys;
use crate::notify::Notifier;
use crate::pyrus::PyrusClient;
use crate::store::{CoordinationStore, MemoryStore};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::http::HeaderMap;
use bridge_core::model::{ActionButton, QueuedEvent, Task};
use bridge_core::signatures::compute_hmac_sha1_hex;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

pub const WEBHOOK_SECRET: &str = "webhook-secret";
pub const FRONTEND_KEY: &str = "frontend-secret";

pub fn pyrus_config(server_uri: &str) -> PyrusConfig {
    PyrusConfig {
        auth_url: format!("{server_uri}/auth"),
        api_base: format!("{server_uri}/v4"),
        login: "bot@example.com".to_string(),
        security_key: "key".to_string(),
        person_id: "1".to_string(),
        http_timeout_seconds: 2,
        auth_timeout_seconds: 2,
        token_refresh_interval_seconds: 0,
    }
}

pub fn test_config(pyrus_uri: &str, telegram_uri: &str) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        store_backend: StoreBackend::Memory,
        redis_url: "redis://127.0.0.1:6379".to_string(),
        pyrus: pyrus_config(pyrus_uri),
        form_tasks_id: 321,
        fields: FieldIds::default(),
        webhook_security_key: Some(WEBHOOK_SECRET.to_string()),
        webhook_verify_signature: true,
        frontend_api_key: Some(FRONTEND_KEY.to_string()),
        idempotency_ttl_seconds: 86_400,
        ticket_lock_ttl_seconds: 30,
        queue_pop_timeout_seconds: 1,
        poll_interval_seconds: 10,
        closed_lookback_seconds: 30,
        reopen_grace_seconds: 3_600,
        cooldown_seconds: 30,
        bot_token: "bot-token".to_string(),
        telegram_api_base: telegram_uri.to_string(),
        max_payload_bytes: 1_048_576,
        ip_limit_per_minute: 300,
        shutdown_drain_seconds: 1,
    }
}

/// Client against `server_uri` with a credential already cached, so tests
/// only need to mock the API calls they exercise.
pub async fn seeded_client(server_uri: &str, store: &MemoryStore) -> PyrusClient {
    store
        .set(
            keys::ACCESS_TOKEN,
            &json!({"access_token": "cached-token"}).to_string(),
            None,
        )
        .await
        .expect("seed credential");
    PyrusClient::new(pyrus_config(server_uri), Arc::new(store.clone())).expect("pyrus client")
}

/// `(comment_id, text, action)` triples, oldest first, each posted through
/// the chat channel.
pub type CommentSpec<'a> = (i64, &'a str, Option<&'a str>);

pub fn task_json(task_id: i64, user_id: Option<i64>, comments: &[CommentSpec<'_>]) -> Value {
    let mut fields = vec![json!({"id": 1, "value": "Printer"})];
    if let Some(user_id) = user_id {
        fields.push(json!({"id": 72, "value": user_id.to_string()}));
    }
    let comments: Vec<Value> = comments
        .iter()
        .map(|(id, text, action)| {
            json!({
                "id": id,
                "text": text,
                "action": action,
                "channel": {"type": "telegram"},
            })
        })
        .collect();

    json!({"id": task_id, "fields": fields, "comments": comments})
}

pub fn webhook_body(task_id: i64, user_id: Option<i64>, comments: &[CommentSpec<'_>]) -> Vec<u8> {
    json!({
        "event": "comment",
        "task_id": task_id,
        "task": task_json(task_id, user_id, comments),
    })
    .to_string()
    .into_bytes()
}

pub fn signed_headers(body: &[u8]) -> HeaderMap {
    let signature = compute_hmac_sha1_hex(WEBHOOK_SECRET, body).expect("signature");
    let mut headers = HeaderMap::new();
    headers.insert(
        crate::ingest::SIGNATURE_HEADER,
        signature.parse().expect("signature header"),
    );
    headers
}

pub fn queued_event(task_id: i64, user_id: Option<i64>, comments: &[CommentSpec<'_>]) -> QueuedEvent {
    QueuedEvent {
        id: format!("event-{task_id}"),
        task_id,
        event_kind: "comment".to_string(),
        user_id,
        received_at: "2026-01-01T10:00:00Z".to_string(),
        payload: json!({
            "event": "comment",
            "task_id": task_id,
            "task": task_json(task_id, user_id, comments),
        }),
    }
}

pub fn closed_task(task_id: i64, user_id: Option<i64>, close_date: Option<&str>) -> Task {
    let mut task: Task = serde_json::from_value(task_json(task_id, user_id, &[])).expect("task");
    task.close_date = close_date.map(ToString::to_string);
    task
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub user_id: i64,
    pub text: String,
    pub actions: Vec<ActionButton>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<SentMessage>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Arc::default(),
            fail: true,
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("recorded messages").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user_id: i64, text: &str, actions: &[ActionButton]) -> Result<()> {
        if self.fail {
            return Err(anyhow!("chat channel unavailable"));
        }
        self.sent.lock().expect("recorded messages").push(SentMessage {
            user_id,
            text: text.to_string(),
            actions: actions.to_vec(),
        });
        Ok(())
    }
}
