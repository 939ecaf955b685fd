use crate::keys;
use crate::store::SharedStore;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CooldownDecision {
    Accept,
    Cooldown,
}

/// Per-user rate limit for user-triggered destructive actions.
#[derive(Clone)]
pub struct Cooldown {
    store: SharedStore,
    ttl: Duration,
}

impl Cooldown {
    pub fn new(store: SharedStore, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Claims the cooldown marker for `action` and `user_id`. A store
    /// failure denies the action.
    pub async fn try_acquire(&self, action: &str, user_id: i64, now_epoch: i64) -> CooldownDecision {
        if self.ttl.is_zero() {
            return CooldownDecision::Accept;
        }

        let key = keys::cooldown_key(action, user_id);
        match self
            .store
            .set_if_absent(&key, &now_epoch.to_string(), self.ttl)
            .await
        {
            Ok(true) => CooldownDecision::Accept,
            Ok(false) => CooldownDecision::Cooldown,
            Err(error) => {
                warn!(action, user_id, error = %error, "cooldown check failed; denying action");
                CooldownDecision::Cooldown
            }
        }
    }

    /// Gives back a marker claimed by [`Cooldown::try_acquire`] when the
    /// action itself did not go through. A marker from a later claim stays.
    pub async fn release(&self, action: &str, user_id: i64, now_epoch: i64) {
        if self.ttl.is_zero() {
            return;
        }

        let key = keys::cooldown_key(action, user_id);
        if let Err(error) = self
            .store
            .delete_if_equals(&key, &now_epoch.to_string())
            .await
        {
            warn!(action, user_id, error = %error, "failed to release cooldown marker");
        }
    }
}
