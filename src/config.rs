use anyhow::{Context, Result, anyhow};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(StoreBackend::Redis),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow!("unsupported COORDINATION_STORE: {other}")),
        }
    }
}

/// Remote workflow API access.
#[derive(Debug, Clone)]
pub struct PyrusConfig {
    pub auth_url: String,
    pub api_base: String,
    pub login: String,
    pub security_key: String,
    pub person_id: String,
    pub http_timeout_seconds: u64,
    pub auth_timeout_seconds: u64,
    pub token_refresh_interval_seconds: u64,
}

/// Ids of the task fields the bridge reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldIds {
    pub user_id: i64,
    pub notified: i64,
    pub notify_choice: i64,
    pub notify_opt_out_choice: i64,
    pub problem_type: i64,
}

impl Default for FieldIds {
    fn default() -> Self {
        Self {
            user_id: 72,
            notified: 111,
            notify_choice: 71,
            notify_opt_out_choice: 2,
            problem_type: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub store_backend: StoreBackend,
    pub redis_url: String,
    pub pyrus: PyrusConfig,
    pub form_tasks_id: i64,
    pub fields: FieldIds,
    pub webhook_security_key: Option<String>,
    pub webhook_verify_signature: bool,
    /// Bearer token the front end presents on the `/users` routes. Unset
    /// keeps those routes closed.
    pub frontend_api_key: Option<String>,
    pub idempotency_ttl_seconds: u64,
    pub ticket_lock_ttl_seconds: u64,
    pub queue_pop_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub closed_lookback_seconds: u64,
    pub reopen_grace_seconds: u64,
    pub cooldown_seconds: u64,
    pub bot_token: String,
    pub telegram_api_base: String,
    pub max_payload_bytes: usize,
    pub ip_limit_per_minute: u32,
    pub shutdown_drain_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let webhook_verify_signature = env_bool("WEBHOOK_VERIFY_SIGNATURE", true);
        let webhook_security_key = env::var("WEBHOOK_SECURITY_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty());

        let config = Self {
            bind_addr: env::var("BRIDGE_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            store_backend: env::var("COORDINATION_STORE")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|value| value.parse::<StoreBackend>())
                .transpose()?
                .unwrap_or(StoreBackend::Redis),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            pyrus: PyrusConfig {
                auth_url: env::var("PYRUS_AUTH_URL")
                    .unwrap_or_else(|_| "https://accounts.pyrus.com/api/v4/auth".to_string()),
                api_base: env::var("PYRUS_API_BASE")
                    .unwrap_or_else(|_| "https://api.pyrus.com/v4".to_string()),
                login: required_env("PYRUS_LOGIN")?,
                security_key: required_env("PYRUS_SECURITY_KEY")?,
                person_id: required_env("PYRUS_PERSON_ID")?,
                http_timeout_seconds: env_u64("PYRUS_HTTP_TIMEOUT_SECONDS", 5)?,
                auth_timeout_seconds: env_u64("PYRUS_AUTH_TIMEOUT_SECONDS", 10)?,
                token_refresh_interval_seconds: env_u64("PYRUS_TOKEN_REFRESH_INTERVAL_SECONDS", 0)?,
            },
            form_tasks_id: required_env("FORM_TASKS_ID")?
                .trim()
                .parse::<i64>()
                .context("invalid i64 for FORM_TASKS_ID")?,
            fields: FieldIds {
                user_id: env_i64("FIELD_USER_ID", FieldIds::default().user_id)?,
                notified: env_i64("FIELD_NOTIFIED", FieldIds::default().notified)?,
                notify_choice: env_i64("FIELD_NOTIFY_CHOICE", FieldIds::default().notify_choice)?,
                notify_opt_out_choice: env_i64(
                    "NOTIFY_OPT_OUT_CHOICE_ID",
                    FieldIds::default().notify_opt_out_choice,
                )?,
                problem_type: env_i64("FIELD_PROBLEM_TYPE", FieldIds::default().problem_type)?,
            },
            webhook_security_key,
            webhook_verify_signature,
            frontend_api_key: env::var("FRONTEND_API_KEY")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            idempotency_ttl_seconds: env_u64("IDEMPOTENCY_TTL_SECONDS", 86_400)?,
            ticket_lock_ttl_seconds: env_u64("TICKET_LOCK_TTL_SECONDS", 30)?,
            queue_pop_timeout_seconds: env_u64("QUEUE_POP_TIMEOUT_SECONDS", 5)?,
            poll_interval_seconds: env_u64("POLL_INTERVAL_SECONDS", 10)?,
            closed_lookback_seconds: env_u64("CLOSED_LOOKBACK_SECONDS", 30)?,
            reopen_grace_seconds: env_u64("REOPEN_GRACE_SECONDS", 3_600)?,
            cooldown_seconds: env_u64("COOLDOWN_SECONDS", 30)?,
            bot_token: required_env("BOT_TOKEN")?,
            telegram_api_base: env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
            max_payload_bytes: env_usize("MAX_PAYLOAD_BYTES", 1_048_576)?,
            ip_limit_per_minute: env_u32("IP_RATE_PER_MINUTE", 300)?,
            shutdown_drain_seconds: env_u64("SHUTDOWN_DRAIN_SECONDS", 10)?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.webhook_verify_signature && self.webhook_security_key.is_none() {
            return Err(anyhow!(
                "WEBHOOK_SECURITY_KEY is required while WEBHOOK_VERIFY_SIGNATURE is enabled"
            ));
        }

        for (name, value) in [
            ("IDEMPOTENCY_TTL_SECONDS", self.idempotency_ttl_seconds),
            ("TICKET_LOCK_TTL_SECONDS", self.ticket_lock_ttl_seconds),
            ("QUEUE_POP_TIMEOUT_SECONDS", self.queue_pop_timeout_seconds),
            ("POLL_INTERVAL_SECONDS", self.poll_interval_seconds),
            ("REOPEN_GRACE_SECONDS", self.reopen_grace_seconds),
            ("PYRUS_HTTP_TIMEOUT_SECONDS", self.pyrus.http_timeout_seconds),
            ("PYRUS_AUTH_TIMEOUT_SECONDS", self.pyrus.auth_timeout_seconds),
        ] {
            if value == 0 {
                return Err(anyhow!("{name} must be greater than 0"));
            }
        }

        if self.closed_lookback_seconds < self.poll_interval_seconds {
            return Err(anyhow!(
                "CLOSED_LOOKBACK_SECONDS must be at least POLL_INTERVAL_SECONDS"
            ));
        }

        Ok(())
    }

    pub fn idempotency_ttl(&self) -> Duration {
        Duration::from_secs(self.idempotency_ttl_seconds)
    }

    pub fn ticket_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.ticket_lock_ttl_seconds)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_seconds)
    }
}

fn required_env(name: &str) -> Result<String> {
    let value = env::var(name).with_context(|| format!("missing required env var: {name}"))?;
    if value.trim().is_empty() {
        return Err(anyhow!("required env var {name} cannot be empty"));
    }
    Ok(value)
}

fn env_parsed<T: FromStr>(name: &str, default: T, kind: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .with_context(|| format!("invalid {kind} for {name}"))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    env_parsed(name, default, "u32")
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    env_parsed(name, default, "u64")
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    env_parsed(name, default, "i64")
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    env_parsed(name, default, "usize")
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}
