pub const EVENT_QUEUE: &str = "pyrus:event:queue";
pub const ACCESS_TOKEN: &str = "pyrus:access_token";
pub const REOPEN_WINDOW_PATTERN: &str = "available_task:*";
pub const STATS_PATTERN: &str = "stats:*";

pub const STAT_EVENTS_ACCEPTED: &str = "stats:events:accepted";
pub const STAT_EVENTS_SKIPPED_LOCKED: &str = "stats:events:skipped_locked";
pub const STAT_NOTIFICATIONS_DISPATCHED: &str = "stats:notifications:dispatched";
pub const STAT_COMPLETIONS_SENT: &str = "stats:completions:sent";
pub const STAT_WINDOWS_OPENED: &str = "stats:windows:opened";

const REOPEN_WINDOW_PREFIX: &str = "available_task";

pub fn ticket_lock_key(task_id: i64) -> String {
    format!("lock:task:{task_id}")
}

pub fn comment_marker_key(comment_id: i64) -> String {
    format!("comment:{comment_id}")
}

pub fn user_identity_key(task_id: i64) -> String {
    format!("webhook_user_id_{task_id}")
}

pub fn reopen_window_key(user_id: i64, task_id: i64) -> String {
    format!("{REOPEN_WINDOW_PREFIX}:{user_id}:{task_id}")
}

pub fn reopen_window_user_pattern(user_id: i64) -> String {
    format!("{REOPEN_WINDOW_PREFIX}:{user_id}:*")
}

/// `(user_id, task_id)` of a reopen window key.
pub fn parse_reopen_window_key(key: &str) -> Option<(i64, i64)> {
    let mut parts = key.split(':');
    if parts.next()? != REOPEN_WINDOW_PREFIX {
        return None;
    }
    let user_id = parts.next()?.parse().ok()?;
    let task_id = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((user_id, task_id))
}

pub fn cooldown_key(action: &str, user_id: i64) -> String {
    format!("cooldown:{action}:{user_id}")
}
