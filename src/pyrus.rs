//! Token-guarded client for the Pyrus workflow API.
//!
//! Every call reads the bearer credential from the coordination store,
//! fetching one from the auth endpoint when the cache is empty. A 401
//! invalidates the cached credential, fetches exactly one replacement and
//! retries the original request once; a second 401 is terminal. Any other
//! failure is logged with its context and surfaced as an [`ApiError`], which
//! callers treat as "no result".

use crate::config::PyrusConfig;
use crate::keys;
use crate::store::SharedStore;
use anyhow::Context;
use bridge_core::model::{ACTION_FINISHED, ACTION_REOPENED, Task};
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

const LOGGED_BODY_MAX_BYTES: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(flatten)]
    pub issued_fields: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApiBody {
    Json(Value),
    Text(String),
}

impl ApiBody {
    pub fn into_json(self) -> Option<Value> {
        match self {
            ApiBody::Json(value) => Some(value),
            ApiBody::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// No credential could be obtained from the auth endpoint.
    Authentication(String),
    /// The request was still rejected with 401 after one refresh.
    Unauthorized,
    Status { status: u16, body: String },
    Transport(String),
    /// A typed call got a body it could not interpret.
    Decode(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Authentication(message) => write!(f, "authentication failed: {message}"),
            ApiError::Unauthorized => write!(f, "unauthorized after credential refresh"),
            ApiError::Status { status, body } => write!(f, "pyrus returned {status}: {body}"),
            ApiError::Transport(message) => write!(f, "transport error: {message}"),
            ApiError::Decode(message) => write!(f, "unexpected response: {message}"),
        }
    }
}

impl std::error::Error for ApiError {}

#[derive(Clone)]
pub struct PyrusClient {
    http: Client,
    auth_http: Client,
    config: PyrusConfig,
    store: SharedStore,
}

impl PyrusClient {
    pub fn new(config: PyrusConfig, store: SharedStore) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_seconds))
            .build()
            .context("build pyrus http client")?;
        let auth_http = Client::builder()
            .timeout(Duration::from_secs(config.auth_timeout_seconds))
            .build()
            .context("build pyrus auth client")?;

        Ok(Self {
            http,
            auth_http,
            config,
            store,
        })
    }

    pub async fn request(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<ApiBody, ApiError> {
        let credential = self.credential().await?;
        let response = self
            .send(endpoint, &method, body, &credential.access_token)
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return self.handle_response(response, endpoint, body).await;
        }

        info!(endpoint, "pyrus credential rejected; refreshing");
        self.invalidate_credential().await;
        let fresh = self.refresh_credential().await?;
        let retry = self
            .send(endpoint, &method, body, &fresh.access_token)
            .await?;

        if retry.status() == StatusCode::UNAUTHORIZED {
            error!(endpoint, "pyrus rejected refreshed credential");
            return Err(ApiError::Unauthorized);
        }

        self.handle_response(retry, endpoint, body).await
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Task, ApiError> {
        let body = self
            .request(&format!("/tasks/{task_id}"), Method::GET, None)
            .await?;
        decode_field(body, "task")
    }

    /// Tasks of `form_id` closed after `closed_after`.
    pub async fn closed_tasks(
        &self,
        form_id: i64,
        closed_after: DateTime<Utc>,
    ) -> Result<Vec<Task>, ApiError> {
        let payload = json!({
            "closed_after": closed_after.to_rfc3339_opts(SecondsFormat::Secs, true),
        });
        let body = self
            .request(
                &format!("/forms/{form_id}/register"),
                Method::POST,
                Some(&payload),
            )
            .await?;
        decode_field(body, "tasks")
    }

    pub async fn post_comment(&self, task_id: i64, payload: &Value) -> Result<ApiBody, ApiError> {
        self.request(
            &format!("/tasks/{task_id}/comments"),
            Method::POST,
            Some(payload),
        )
        .await
    }

    pub async fn mark_field(
        &self,
        task_id: i64,
        field_id: i64,
        value: Value,
    ) -> Result<(), ApiError> {
        let payload = json!({
            "field_updates": [{"id": field_id, "value": value}],
        });
        self.post_comment(task_id, &payload).await.map(|_| ())
    }

    pub async fn reopen_task(&self, task_id: i64, text: &str) -> Result<i64, ApiError> {
        self.comment_with_action(task_id, text, ACTION_REOPENED).await
    }

    pub async fn close_task(&self, task_id: i64, text: &str) -> Result<i64, ApiError> {
        self.comment_with_action(task_id, text, ACTION_FINISHED).await
    }

    async fn comment_with_action(
        &self,
        task_id: i64,
        text: &str,
        action: &str,
    ) -> Result<i64, ApiError> {
        let payload = json!({"text": text, "action": action});
        let body = self.post_comment(task_id, &payload).await?;
        let task: Task = decode_field(body, "task")?;
        Ok(task.id)
    }

    /// Fetches a new credential and caches it without expiry. Concurrent
    /// refreshes race; the last write wins.
    pub async fn refresh_credential(&self) -> Result<Credential, ApiError> {
        let credential = self.fetch_credential().await?;
        match serde_json::to_string(&credential) {
            Ok(serialized) => {
                if let Err(error) = self.store.set(keys::ACCESS_TOKEN, &serialized, None).await {
                    warn!(error = %error, "failed to cache pyrus credential");
                }
            }
            Err(error) => warn!(error = %error, "failed to serialize pyrus credential"),
        }
        Ok(credential)
    }

    /// Periodically replaces the cached credential until shutdown.
    pub async fn run_token_refresh(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.refresh_credential().await {
                Ok(_) => info!("pyrus credential refreshed"),
                Err(error) => warn!(error = %error, "periodic pyrus credential refresh failed"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval) => {}
            }
        }
    }

    async fn credential(&self) -> Result<Credential, ApiError> {
        match self.store.get(keys::ACCESS_TOKEN).await {
            Ok(Some(raw)) => match serde_json::from_str::<Credential>(&raw) {
                Ok(credential) => return Ok(credential),
                Err(error) => warn!(error = %error, "cached pyrus credential is unreadable"),
            },
            Ok(None) => {}
            Err(error) => warn!(error = %error, "failed to read cached pyrus credential"),
        }
        self.refresh_credential().await
    }

    async fn invalidate_credential(&self) {
        if let Err(error) = self.store.delete(keys::ACCESS_TOKEN).await {
            warn!(error = %error, "failed to drop cached pyrus credential");
        }
    }

    async fn fetch_credential(&self) -> Result<Credential, ApiError> {
        let payload = json!({
            "login": self.config.login,
            "security_key": self.config.security_key,
            "person_id": self.config.person_id,
        });

        let response = self
            .auth_http
            .post(&self.config.auth_url)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                error!(error = %error, "pyrus auth request failed");
                ApiError::Authentication(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                status = status.as_u16(),
                response = %truncate(&body, LOGGED_BODY_MAX_BYTES),
                "pyrus auth rejected credentials"
            );
            return Err(ApiError::Authentication(format!("auth returned {status}")));
        }

        let credential = response.json::<Credential>().await.map_err(|error| {
            error!(error = %error, "pyrus auth returned an unreadable credential");
            ApiError::Authentication(error.to_string())
        })?;
        if credential.access_token.trim().is_empty() {
            return Err(ApiError::Authentication("empty access token".to_string()));
        }

        Ok(credential)
    }

    async fn send(
        &self,
        endpoint: &str,
        method: &Method,
        body: Option<&Value>,
        token: &str,
    ) -> Result<Response, ApiError> {
        let url = format!("{}{endpoint}", self.config.api_base.trim_end_matches('/'));
        let mut request = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(token)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|error| {
            error!(
                endpoint,
                method = %method,
                error = %error,
                payload = %logged_payload(body),
                "pyrus request failed"
            );
            ApiError::Transport(error.to_string())
        })
    }

    async fn handle_response(
        &self,
        response: Response,
        endpoint: &str,
        request_body: Option<&Value>,
    ) -> Result<ApiBody, ApiError> {
        let status = response.status();
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.contains("application/json"));

        let text = response.text().await.map_err(|error| {
            error!(endpoint, error = %error, "failed to read pyrus response body");
            ApiError::Transport(error.to_string())
        })?;

        if status.is_success() {
            if !is_json {
                return Ok(ApiBody::Text(text));
            }
            return match serde_json::from_str::<Value>(&text) {
                Ok(value) => Ok(ApiBody::Json(value)),
                Err(error) => {
                    warn!(endpoint, error = %error, "pyrus sent malformed json; keeping text");
                    Ok(ApiBody::Text(text))
                }
            };
        }

        error!(
            endpoint,
            status = status.as_u16(),
            response = %truncate(&text, LOGGED_BODY_MAX_BYTES),
            payload = %logged_payload(request_body),
            "pyrus request rejected"
        );
        Err(ApiError::Status {
            status: status.as_u16(),
            body: truncate(&text, LOGGED_BODY_MAX_BYTES),
        })
    }
}

fn decode_field<T: for<'de> Deserialize<'de>>(body: ApiBody, field: &str) -> Result<T, ApiError> {
    let mut value = body
        .into_json()
        .ok_or_else(|| ApiError::Decode(format!("expected json with `{field}`")))?;
    let inner = value
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| ApiError::Decode(format!("missing `{field}`")))?;
    serde_json::from_value(inner).map_err(|error| {
        debug!(field, error = %error, "pyrus response did not match the expected shape");
        ApiError::Decode(error.to_string())
    })
}

fn logged_payload(body: Option<&Value>) -> String {
    body.map(|body| truncate(&body.to_string(), LOGGED_BODY_MAX_BYTES))
        .unwrap_or_default()
}

pub(crate) fn truncate(text: &str, limit_bytes: usize) -> String {
    if text.len() <= limit_bytes {
        return text.to_string();
    }

    let mut output = String::new();
    for character in text.chars() {
        if output.len() + character.len_utf8() > limit_bytes.saturating_sub(3) {
            break;
        }
        output.push(character);
    }
    output.push_str("...");
    output
}
