use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Conversational stage of a session. Transitions are monotonic:
/// `Emotional → Rational → Solution`, with `Solution` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Phase {
    Emotional,
    Rational,
    Solution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SessionStatus {
    Ongoing,
    Crisis,
    Resolved,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub phase: Phase,
    pub round_count: i64,
    pub status: SessionStatus,
}

/// One message within a session. Rows are append-only; `id` is the
/// autoincrement insert order and doubles as the creation-order tiebreak.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Message {
    pub id: i64,
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub agent_type: Option<String>,
    pub model_used: Option<String>,
    pub is_privacy_issue: bool,
    pub is_complex_issue: bool,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: Uuid,
    pub role: String,
    pub content: String,
    pub agent_type: Option<String>,
    pub model_used: Option<String>,
    pub is_privacy_issue: bool,
    pub is_complex_issue: bool,
}

impl NewMessage {
    pub fn user(session_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            session_id,
            role: "user".to_string(),
            content: content.into(),
            agent_type: None,
            model_used: None,
            is_privacy_issue: false,
            is_complex_issue: false,
        }
    }

    pub fn assistant(
        session_id: Uuid,
        content: impl Into<String>,
        agent_type: &str,
        model_used: &str,
        is_privacy_issue: bool,
        is_complex_issue: bool,
    ) -> Self {
        Self {
            session_id,
            role: "assistant".to_string(),
            content: content.into(),
            agent_type: Some(agent_type.to_string()),
            model_used: Some(model_used.to_string()),
            is_privacy_issue,
            is_complex_issue,
        }
    }
}
