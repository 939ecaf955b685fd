//! Queue consumer that turns webhook events into user notifications.
//!
//! Each event is handled under a per-ticket lock. Relevant comments are
//! scanned newest first; the scan stops at a reopen action or at the first
//! comment that already carries a marker, so only the new suffix of the
//! comment history is notified. Markers are written before the notification
//! is dispatched.

use crate::config::Config;
use crate::dispatch::DispatchGroup;
use crate::keys;
use crate::notify::SharedNotifier;
use crate::store::SharedStore;
use anyhow::{Context, Result};
use bridge_core::model::QueuedEvent;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    Reopened,
    AlreadyNotified,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    LockDenied,
    NoRelevantComments,
    NoUser,
    Scanned { notified: Vec<i64>, stop: ScanStop },
    Failed,
}

#[derive(Clone)]
pub struct EventWorker {
    store: SharedStore,
    notifier: SharedNotifier,
    lock_ttl: Duration,
    marker_ttl: Duration,
    pop_timeout: Duration,
    drain_timeout: Duration,
}

impl EventWorker {
    pub fn new(config: &Config, store: SharedStore, notifier: SharedNotifier) -> Self {
        Self {
            store,
            notifier,
            lock_ttl: config.ticket_lock_ttl(),
            marker_ttl: config.idempotency_ttl(),
            pop_timeout: Duration::from_secs(config.queue_pop_timeout_seconds),
            drain_timeout: Duration::from_secs(config.shutdown_drain_seconds),
        }
    }

    /// Drains the event queue until shutdown is signalled. The pop is
    /// bounded, so shutdown is observed between pops and never interrupts
    /// one.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut dispatches = DispatchGroup::new();
        info!("event worker started");

        while !*shutdown.borrow() {
            dispatches.reap();

            let raw = match self
                .store
                .blocking_pop(keys::EVENT_QUEUE, self.pop_timeout)
                .await
            {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(error) => {
                    error!(error = %error, "event queue pop failed");
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            match serde_json::from_str::<QueuedEvent>(&raw) {
                Ok(event) => {
                    self.process_event(&event, &mut dispatches).await;
                }
                Err(error) => {
                    warn!(error = %error, "dropping unreadable queued event");
                }
            }
        }

        info!(in_flight = dispatches.len(), "event worker stopping");
        dispatches.drain(self.drain_timeout).await;
    }

    pub async fn process_event(&self, event: &QueuedEvent, dispatches: &mut DispatchGroup) -> Outcome {
        let lock_key = keys::ticket_lock_key(event.task_id);
        match self
            .store
            .set_if_absent(&lock_key, &event.id, self.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = event.task_id, event_id = %event.id, "ticket locked elsewhere; skipping");
                if let Err(error) = self.store.increment(keys::STAT_EVENTS_SKIPPED_LOCKED, 1).await {
                    debug!(error = %error, "failed to bump skipped counter");
                }
                return Outcome::LockDenied;
            }
            Err(error) => {
                warn!(task_id = event.task_id, error = %error, "ticket lock unavailable; skipping");
                return Outcome::Failed;
            }
        }

        let outcome = match self.scan(event, dispatches).await {
            Ok(outcome) => outcome,
            Err(error) => {
                error!(task_id = event.task_id, event_id = %event.id, error = %error, "event processing failed");
                Outcome::Failed
            }
        };

        // Past the lock TTL another worker may own the key; only our value is removed.
        match self.store.delete_if_equals(&lock_key, &event.id).await {
            Ok(true) => {}
            Ok(false) => warn!(
                task_id = event.task_id,
                event_id = %event.id,
                "ticket lock expired before release; processing overran the lock ttl"
            ),
            Err(error) => {
                warn!(task_id = event.task_id, error = %error, "failed to release ticket lock");
            }
        }

        info!(task_id = event.task_id, event_id = %event.id, outcome = ?outcome, "event processed");
        outcome
    }

    async fn scan(&self, event: &QueuedEvent, dispatches: &mut DispatchGroup) -> Result<Outcome> {
        let task = event.task().context("decode queued task")?;
        let relevant = task.relevant_comments_newest_first();
        if relevant.is_empty() {
            return Ok(Outcome::NoRelevantComments);
        }

        let Some(user_id) = event.user_id else {
            warn!(task_id = event.task_id, "owning user unresolved; not scanning comments");
            return Ok(Outcome::NoUser);
        };

        let mut notified = Vec::new();
        let mut stop = ScanStop::Exhausted;
        for comment in relevant {
            if comment.is_reopen() {
                stop = ScanStop::Reopened;
                break;
            }

            let marked = self
                .store
                .set_if_absent(
                    &keys::comment_marker_key(comment.id),
                    &event.id,
                    self.marker_ttl,
                )
                .await
                .with_context(|| format!("write marker for comment {}", comment.id))?;
            if !marked {
                stop = ScanStop::AlreadyNotified;
                break;
            }

            notified.push(comment.id);
            let text = comment.text.clone().unwrap_or_default();
            if text.trim().is_empty() {
                debug!(task_id = task.id, comment_id = comment.id, "comment has no text to forward");
                continue;
            }
            self.dispatch(dispatches, task.id, comment.id, user_id, text);
        }

        Ok(Outcome::Scanned { notified, stop })
    }

    fn dispatch(
        &self,
        dispatches: &mut DispatchGroup,
        task_id: i64,
        comment_id: i64,
        user_id: i64,
        text: String,
    ) {
        let notifier = self.notifier.clone();
        let store = self.store.clone();
        dispatches.spawn(async move {
            match notifier.send(user_id, &text, &[]).await {
                Ok(()) => {
                    debug!(task_id, comment_id, user_id, "comment notification sent");
                    if let Err(error) = store.increment(keys::STAT_NOTIFICATIONS_DISPATCHED, 1).await {
                        debug!(error = %error, "failed to bump dispatched counter");
                    }
                }
                Err(error) => {
                    warn!(task_id, comment_id, user_id, error = %error, "comment notification failed");
                }
            }
        });
    }
}
