use crate::config::{Config, FieldIds};
use crate::keys;
use crate::store::SharedStore;
use axum::http::{HeaderMap, StatusCode};
use bridge_core::fields;
use bridge_core::model::{QueuedEvent, WebhookPayload};
use bridge_core::signatures::verify_pyrus_signature;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "X-Pyrus-Sig";
pub const RETRY_HEADER: &str = "X-Pyrus-Retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BadRequest(&'static str),
    Unauthorized(&'static str),
    Unavailable(&'static str),
}

impl Rejection {
    pub fn status(self) -> StatusCode {
        match self {
            Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Rejection::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Rejection::BadRequest(message)
            | Rejection::Unauthorized(message)
            | Rejection::Unavailable(message) => message,
        }
    }
}

/// Accepts webhook deliveries and hands them to the event queue without
/// touching the remote ticket.
#[derive(Clone)]
pub struct Ingestor {
    store: SharedStore,
    fields: FieldIds,
    identity_ttl: Duration,
    security_key: Option<String>,
    verify_signature: bool,
}

impl Ingestor {
    pub fn new(config: &Config, store: SharedStore) -> Self {
        Self {
            store,
            fields: config.fields,
            identity_ttl: config.idempotency_ttl(),
            security_key: config.webhook_security_key.clone(),
            verify_signature: config.webhook_verify_signature,
        }
    }

    pub async fn receive(&self, headers: &HeaderMap, body: &[u8]) -> Result<QueuedEvent, Rejection> {
        self.validate_signature(headers, body)?;

        let raw: Value = serde_json::from_slice(body)
            .map_err(|_| Rejection::BadRequest("invalid json payload"))?;
        let payload: WebhookPayload = serde_json::from_value(raw.clone())
            .map_err(|_| Rejection::BadRequest("payload must carry event, task_id and task"))?;

        let user_id = self.resolve_user(&payload).await;
        let event = build_event(&payload, user_id, raw);
        let serialized = serde_json::to_string(&event)
            .map_err(|_| Rejection::Unavailable("failed to serialize event"))?;

        if let Err(error) = self.store.push(keys::EVENT_QUEUE, &serialized).await {
            warn!(task_id = event.task_id, error = %error, "failed to enqueue webhook event");
            return Err(Rejection::Unavailable("event queue unavailable"));
        }

        if let Err(error) = self.store.increment(keys::STAT_EVENTS_ACCEPTED, 1).await {
            debug!(error = %error, "failed to bump accepted counter");
        }

        info!(
            event_id = %event.id,
            task_id = event.task_id,
            event = %event.event_kind,
            user_id = ?event.user_id,
            retry = header_string(headers, RETRY_HEADER).as_deref().unwrap_or("0"),
            "webhook event queued"
        );
        Ok(event)
    }

    fn validate_signature(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), Rejection> {
        if !self.verify_signature {
            return Ok(());
        }

        let secret = self
            .security_key
            .as_deref()
            .ok_or(Rejection::Unauthorized("webhook secret is not configured"))?;
        let signature = header_string(headers, SIGNATURE_HEADER)
            .ok_or(Rejection::Unauthorized("missing pyrus signature"))?;

        if verify_pyrus_signature(secret, body, &signature) {
            Ok(())
        } else {
            Err(Rejection::Unauthorized("invalid pyrus signature"))
        }
    }

    /// Owning end user of the ticket, cached per ticket for the idempotency
    /// window. Store failures fall back to the payload.
    async fn resolve_user(&self, payload: &WebhookPayload) -> Option<i64> {
        let cache_key = keys::user_identity_key(payload.task_id);
        match self.store.get(&cache_key).await {
            Ok(Some(cached)) => {
                if let Ok(user_id) = cached.trim().parse::<i64>() {
                    return Some(user_id);
                }
                warn!(task_id = payload.task_id, cached = %cached, "ignoring unreadable cached user id");
            }
            Ok(None) => {}
            Err(error) => {
                warn!(task_id = payload.task_id, error = %error, "user identity cache unavailable");
            }
        }

        let user_id = fields::user_id(&payload.task.fields, self.fields.user_id)?;
        if let Err(error) = self
            .store
            .set(&cache_key, &user_id.to_string(), Some(self.identity_ttl))
            .await
        {
            warn!(task_id = payload.task_id, error = %error, "failed to cache user identity");
        }
        Some(user_id)
    }
}

fn build_event(payload: &WebhookPayload, user_id: Option<i64>, raw: Value) -> QueuedEvent {
    QueuedEvent {
        id: Uuid::new_v4().to_string(),
        task_id: payload.task_id,
        event_kind: payload.event.clone(),
        user_id,
        received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        payload: raw,
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}
