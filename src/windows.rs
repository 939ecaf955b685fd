use crate::config::{Config, FieldIds};
use crate::cooldown::{Cooldown, CooldownDecision};
use crate::keys;
use crate::pyrus::PyrusClient;
use crate::store::SharedStore;
use anyhow::{Context, Result};
use bridge_core::fields;
use bridge_core::model::{Field, TaskSnapshot};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

const REOPEN_COMMENT: &str = "Reopened by the customer.";
const CLOSE_COMMENT: &str = "Closed by the customer.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReopenableTask {
    pub task_id: i64,
    pub ttl_seconds: Option<u64>,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    Done { task_id: i64 },
    Cooldown,
    NotFound,
    RemoteFailed,
}

/// User-facing view over the reopen windows written by the scheduler.
#[derive(Clone)]
pub struct ReopenWindows {
    client: PyrusClient,
    store: SharedStore,
    cooldown: Cooldown,
    fields: FieldIds,
}

impl ReopenWindows {
    pub fn new(config: &Config, client: PyrusClient, store: SharedStore) -> Self {
        Self {
            cooldown: Cooldown::new(store.clone(), config.cooldown()),
            client,
            store,
            fields: config.fields,
        }
    }

    /// Tickets the user may still reopen. Each window is re-checked against
    /// the live ticket; windows of tickets that staff already reopened are
    /// deleted.
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<ReopenableTask>> {
        let keys = self
            .store
            .scan(&keys::reopen_window_user_pattern(user_id))
            .await
            .context("scan reopen windows")?;

        let checked = join_all(keys.iter().map(|key| self.check_window(key))).await;
        let mut tasks: Vec<ReopenableTask> = checked.into_iter().flatten().collect();
        tasks.sort_by_key(|task| task.task_id);
        Ok(tasks)
    }

    async fn check_window(&self, key: &str) -> Option<ReopenableTask> {
        let (_, task_id) = keys::parse_reopen_window_key(key)?;
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(error) => {
                warn!(key, error = %error, "failed to read reopen window");
                return None;
            }
        };
        let snapshot: TaskSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(error) => {
                warn!(key, error = %error, "unreadable reopen window snapshot");
                return None;
            }
        };

        let live = match self.client.get_task(task_id).await {
            Ok(task) => task,
            Err(error) => {
                warn!(task_id, error = %error, "could not re-check ticket; hiding window");
                return None;
            }
        };
        let still_closed = live
            .close_date
            .as_deref()
            .is_some_and(|date| !date.trim().is_empty());
        if !still_closed {
            info!(task_id, "ticket reopened elsewhere; dropping reopen window");
            if let Err(error) = self.store.delete(key).await {
                warn!(key, error = %error, "failed to drop stale reopen window");
            }
            return None;
        }

        let ttl_seconds = self
            .store
            .ttl(key)
            .await
            .ok()
            .flatten()
            .map(|ttl| ttl.as_secs());
        Some(ReopenableTask {
            task_id,
            ttl_seconds,
            fields: snapshot.fields,
        })
    }

    pub async fn reopen(&self, user_id: i64, task_id: i64, now_epoch: i64) -> Result<UserAction> {
        let key = keys::reopen_window_key(user_id, task_id);
        if self
            .store
            .get(&key)
            .await
            .context("read reopen window")?
            .is_none()
        {
            return Ok(UserAction::NotFound);
        }

        if self.cooldown.try_acquire("reopen", user_id, now_epoch).await == CooldownDecision::Cooldown {
            return Ok(UserAction::Cooldown);
        }

        if let Err(error) = self.client.reopen_task(task_id, REOPEN_COMMENT).await {
            warn!(task_id, user_id, error = %error, "reopen request failed");
            self.cooldown.release("reopen", user_id, now_epoch).await;
            return Ok(UserAction::RemoteFailed);
        }

        if let Err(error) = self.store.delete(&key).await {
            warn!(key = %key, error = %error, "failed to drop used reopen window");
        }
        info!(task_id, user_id, "ticket reopened by user");
        Ok(UserAction::Done { task_id })
    }

    /// Closes a ticket the user owns.
    pub async fn close(&self, user_id: i64, task_id: i64, now_epoch: i64) -> Result<UserAction> {
        let task = match self.client.get_task(task_id).await {
            Ok(task) => task,
            Err(error) => {
                warn!(task_id, user_id, error = %error, "could not load ticket to close");
                return Ok(UserAction::RemoteFailed);
            }
        };
        if fields::user_id(&task.fields, self.fields.user_id) != Some(user_id) {
            return Ok(UserAction::NotFound);
        }

        if self.cooldown.try_acquire("close", user_id, now_epoch).await == CooldownDecision::Cooldown {
            return Ok(UserAction::Cooldown);
        }

        if let Err(error) = self.client.close_task(task_id, CLOSE_COMMENT).await {
            warn!(task_id, user_id, error = %error, "close request failed");
            self.cooldown.release("close", user_id, now_epoch).await;
            return Ok(UserAction::RemoteFailed);
        }
        info!(task_id, user_id, "ticket closed by user");
        Ok(UserAction::Done { task_id })
    }
}
