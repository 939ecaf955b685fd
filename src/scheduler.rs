//! Periodic poller for recently closed tickets.
//!
//! Every tick asks the workflow system for tickets closed within the
//! lookback slice. The slice overlaps the poll interval on purpose; the
//! window write rule and the remote "notified" field absorb the duplicates.

use crate::config::{Config, FieldIds};
use crate::keys;
use crate::notify::SharedNotifier;
use crate::pyrus::PyrusClient;
use crate::store::SharedStore;
use anyhow::{Context, Result};
use bridge_core::fields;
use bridge_core::model::{ActionButton, Task, TaskSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowWrite {
    Opened { user_id: i64, ttl: Duration },
    /// An existing window already lives at least as long.
    Kept,
    Expired,
    NoCloseDate,
    NoUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Sent,
    AlreadyNotified,
    OptedOut,
    NoUser,
    MarkFailed,
    /// The ticket is marked notified remotely but the message was lost.
    SendFailed,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub closed_tasks: usize,
    pub windows_opened: usize,
    pub completions_sent: usize,
}

#[derive(Clone)]
pub struct ReopenWindowScheduler {
    client: PyrusClient,
    store: SharedStore,
    notifier: SharedNotifier,
    form_id: i64,
    fields: FieldIds,
    grace: TimeDelta,
    lookback: TimeDelta,
    interval: Duration,
}

impl ReopenWindowScheduler {
    pub fn new(
        config: &Config,
        client: PyrusClient,
        store: SharedStore,
        notifier: SharedNotifier,
    ) -> Self {
        Self {
            client,
            store,
            notifier,
            form_id: config.form_tasks_id,
            fields: config.fields,
            grace: TimeDelta::seconds(config.reopen_grace_seconds as i64),
            lookback: TimeDelta::seconds(config.closed_lookback_seconds as i64),
            interval: Duration::from_secs(config.poll_interval_seconds),
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_seconds = self.interval.as_secs(), "reopen window scheduler started");
        while !*shutdown.borrow() {
            let report = self.tick(Utc::now()).await;
            if report.closed_tasks > 0 {
                info!(
                    closed_tasks = report.closed_tasks,
                    windows_opened = report.windows_opened,
                    completions_sent = report.completions_sent,
                    "closed tickets processed"
                );
            }

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("reopen window scheduler stopped");
    }

    /// One poll. Failures stay inside the tick.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let tasks = match self.client.closed_tasks(self.form_id, now - self.lookback).await {
            Ok(tasks) => tasks,
            Err(error) => {
                warn!(form_id = self.form_id, error = %error, "failed to poll closed tickets");
                return report;
            }
        };
        report.closed_tasks = tasks.len();

        for task in &tasks {
            // Neither a window nor a completion message without a usable close date.
            if task
                .close_date
                .as_deref()
                .and_then(fields::parse_close_date)
                .is_none()
            {
                warn!(
                    task_id = task.id,
                    close_date = ?task.close_date,
                    "closed ticket has no usable close date; skipping"
                );
                continue;
            }

            match self.open_window(task, now).await {
                Ok(WindowWrite::Opened { user_id, ttl }) => {
                    report.windows_opened += 1;
                    debug!(task_id = task.id, user_id, ttl_seconds = ttl.as_secs(), "reopen window opened");
                }
                Ok(skipped) => debug!(task_id = task.id, outcome = ?skipped, "reopen window unchanged"),
                Err(error) => warn!(task_id = task.id, error = %error, "failed to write reopen window"),
            }

            if self.notify_completion(task).await == Completion::Sent {
                report.completions_sent += 1;
            }
        }

        if tracing::enabled!(Level::DEBUG) {
            self.log_window_ttls().await;
        }
        report
    }

    /// Writes the reopen window for a closed ticket unless that would shorten
    /// a window that already exists.
    pub async fn open_window(&self, task: &Task, now: DateTime<Utc>) -> Result<WindowWrite> {
        let Some(closed_at) = task.close_date.as_deref().and_then(fields::parse_close_date) else {
            return Ok(WindowWrite::NoCloseDate);
        };

        let remaining_seconds = (closed_at + self.grace - now).num_seconds();
        if remaining_seconds <= 0 {
            return Ok(WindowWrite::Expired);
        }
        let remaining = Duration::from_secs(remaining_seconds as u64);

        let Some(user_id) = fields::user_id(&task.fields, self.fields.user_id) else {
            return Ok(WindowWrite::NoUser);
        };

        let key = keys::reopen_window_key(user_id, task.id);
        if let Some(existing) = self.store.ttl(&key).await.context("read reopen window ttl")?
            && existing >= remaining
        {
            return Ok(WindowWrite::Kept);
        }

        let snapshot = TaskSnapshot {
            task_id: task.id,
            fields: task.fields.clone(),
        };
        let serialized = serde_json::to_string(&snapshot).context("serialize task snapshot")?;
        self.store
            .set(&key, &serialized, Some(remaining))
            .await
            .context("write reopen window")?;

        if let Err(error) = self.store.increment(keys::STAT_WINDOWS_OPENED, 1).await {
            debug!(error = %error, "failed to bump windows counter");
        }
        Ok(WindowWrite::Opened {
            user_id,
            ttl: remaining,
        })
    }

    /// Sends the completion message at most once per ticket: the remote
    /// "notified" field is set before the message goes out.
    pub async fn notify_completion(&self, task: &Task) -> Completion {
        if fields::is_checked(&task.fields, self.fields.notified) {
            return Completion::AlreadyNotified;
        }
        if fields::choice_id(&task.fields, self.fields.notify_choice)
            == Some(self.fields.notify_opt_out_choice)
        {
            return Completion::OptedOut;
        }
        let Some(user_id) = fields::user_id(&task.fields, self.fields.user_id) else {
            return Completion::NoUser;
        };

        if let Err(error) = self
            .client
            .mark_field(task.id, self.fields.notified, json!(fields::CHECKED))
            .await
        {
            warn!(task_id = task.id, error = %error, "failed to mark ticket notified; will retry next poll");
            return Completion::MarkFailed;
        }

        let text = completion_text(task, self.fields.problem_type);
        let actions = [ActionButton {
            text: "Rate this ticket".to_string(),
            callback_data: format!("give_mark_{}", task.id),
        }];
        match self.notifier.send(user_id, &text, &actions).await {
            Ok(()) => {
                if let Err(error) = self.store.increment(keys::STAT_COMPLETIONS_SENT, 1).await {
                    debug!(error = %error, "failed to bump completions counter");
                }
                info!(task_id = task.id, user_id, "completion notification sent");
                Completion::Sent
            }
            Err(error) => {
                error!(
                    task_id = task.id,
                    user_id,
                    error = %error,
                    "ticket marked notified but completion message failed"
                );
                Completion::SendFailed
            }
        }
    }

    async fn log_window_ttls(&self) {
        let keys = match self.store.scan(keys::REOPEN_WINDOW_PATTERN).await {
            Ok(keys) => keys,
            Err(error) => {
                debug!(error = %error, "failed to scan reopen windows");
                return;
            }
        };
        for key in keys {
            if let Ok(Some(ttl)) = self.store.ttl(&key).await {
                debug!(key = %key, ttl_seconds = ttl.as_secs(), "reopen window");
            }
        }
    }
}

fn completion_text(task: &Task, problem_type_field: i64) -> String {
    match fields::text_value(&task.fields, problem_type_field) {
        Some(problem) => format!("Ticket #{} ({problem}) has been completed.", task.id),
        None => format!("Ticket #{} has been completed.", task.id),
    }
}
