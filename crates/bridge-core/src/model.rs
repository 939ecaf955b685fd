use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comment action the workflow system records when a ticket is reopened.
pub const ACTION_REOPENED: &str = "reopened";
/// Comment action the workflow system records when a ticket is closed.
pub const ACTION_FINISHED: &str = "finished";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub channel: Option<Value>,
    #[serde(default)]
    pub create_date: Option<String>,
}

impl Comment {
    pub fn is_reopen(&self) -> bool {
        self.action.as_deref() == Some(ACTION_REOPENED)
    }

    /// A channel marker counts only when it carries something: `null`, `""`
    /// and `{}` are treated as absent.
    pub fn has_channel(&self) -> bool {
        match &self.channel {
            None | Some(Value::Null) => false,
            Some(Value::String(text)) => !text.trim().is_empty(),
            Some(Value::Object(map)) => !map.is_empty(),
            Some(Value::Array(items)) => !items.is_empty(),
            Some(_) => true,
        }
    }

    /// Comments the worker may act on: anything posted through a channel,
    /// plus reopen markers which bound the scan.
    pub fn is_relevant(&self) -> bool {
        self.has_channel() || self.is_reopen()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    #[serde(default)]
    pub close_date: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

impl Task {
    pub fn field(&self, field_id: i64) -> Option<&Field> {
        self.fields.iter().find(|field| field.id == field_id)
    }

    /// Relevant comments ordered newest first. The workflow system lists
    /// comments oldest first.
    pub fn relevant_comments_newest_first(&self) -> Vec<&Comment> {
        self.comments
            .iter()
            .rev()
            .filter(|comment| comment.is_relevant())
            .collect()
    }
}

/// Body of an inbound webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub task_id: i64,
    pub task: Task,
}

/// Immutable snapshot of one accepted webhook delivery, as stored on the
/// event queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: String,
    pub task_id: i64,
    pub event_kind: String,
    pub user_id: Option<i64>,
    pub received_at: String,
    pub payload: Value,
}

impl QueuedEvent {
    pub fn task(&self) -> Result<Task, serde_json::Error> {
        let payload: WebhookPayload = serde_json::from_value(self.payload.clone())?;
        Ok(payload.task)
    }
}

/// Snapshot stored in a reopen window entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: i64,
    pub fields: Vec<Field>,
}

/// Action button attached to an outbound user notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub text: String,
    pub callback_data: String,
}
