use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use bridge_core::model::ActionButton;
use reqwest::Client;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delivers a message to an end user of the chat front end.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: i64, text: &str, actions: &[ActionButton]) -> Result<()>;
}

pub type SharedNotifier = Arc<dyn Notifier>;

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    send_url: String,
}

impl TelegramNotifier {
    pub fn new(api_base: &str, bot_token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build telegram http client")?;

        Ok(Self {
            client,
            send_url: format!(
                "{}/bot{bot_token}/sendMessage",
                api_base.trim_end_matches('/')
            ),
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, user_id: i64, text: &str, actions: &[ActionButton]) -> Result<()> {
        let response = self
            .client
            .post(&self.send_url)
            .json(&message_body(user_id, text, actions))
            .send()
            .await
            .context("telegram sendMessage request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "telegram sendMessage returned {status}: {}",
                crate::pyrus::truncate(&body, 500)
            ));
        }

        debug!(user_id, "telegram message delivered");
        Ok(())
    }
}

fn message_body(user_id: i64, text: &str, actions: &[ActionButton]) -> Value {
    let mut body = json!({"chat_id": user_id, "text": text});
    if !actions.is_empty() {
        let rows: Vec<Value> = actions
            .iter()
            .map(|action| json!([{"text": action.text, "callback_data": action.callback_data}]))
            .collect();
        body["reply_markup"] = json!({"inline_keyboard": rows});
    }
    body
}
