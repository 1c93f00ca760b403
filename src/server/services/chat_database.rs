use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::server::models::chat::{Message, NewMessage, Phase, Session, SessionStatus, User};

pub struct ChatDatabaseService {
    pool: SqlitePool,
}

impl ChatDatabaseService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                token TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                created_at TEXT NOT NULL,
                last_active TEXT NOT NULL,
                phase TEXT NOT NULL DEFAULT 'emotional',
                round_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'ongoing'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create sessions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                agent_type TEXT,
                model_used TEXT,
                is_privacy_issue INTEGER NOT NULL DEFAULT 0,
                is_complex_issue INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create messages table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)")
            .execute(&self.pool)
            .await
            .context("Failed to create message index")?;

        Ok(())
    }

    pub async fn create_user(&self, username: &str, token: &str) -> Result<User> {
        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, token, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING id, username, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(token)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("Failed to create user")?;

        Ok(user)
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT id, username, created_at FROM users WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up user by token")?;

        Ok(user)
    }

    pub async fn create_session(&self, user_id: Uuid) -> Result<Session> {
        let now = Utc::now();
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (id, user_id, created_at, last_active, phase, round_count, status)
            VALUES (?, ?, ?, ?, 'emotional', 0, 'ongoing')
            RETURNING id, user_id, created_at, last_active, phase, round_count, status
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create session")?;

        Ok(session)
    }

    pub async fn session(&self, id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, created_at, last_active, phase, round_count, status
            FROM sessions
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch session")?;

        Ok(session)
    }

    /// The caller's session, but only while it is still accepting turns.
    pub async fn ongoing_session(&self, id: Uuid, user_id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, created_at, last_active, phase, round_count, status
            FROM sessions
            WHERE id = ? AND user_id = ? AND status = 'ongoing'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch ongoing session")?;

        Ok(session)
    }

    pub async fn latest_ongoing_for_user(&self, user_id: Uuid) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            SELECT id, user_id, created_at, last_active, phase, round_count, status
            FROM sessions
            WHERE user_id = ? AND status = 'ongoing'
            ORDER BY last_active DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch active session")?;

        Ok(session)
    }

    /// Counts the new user turn and touches the activity timestamp, returning
    /// the updated round count.
    pub async fn begin_round(&self, session_id: Uuid) -> Result<i64> {
        let round_count = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE sessions
            SET round_count = round_count + 1, last_active = ?
            WHERE id = ?
            RETURNING round_count
            "#,
        )
        .bind(Utc::now())
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to increment round count")?;

        Ok(round_count)
    }

    pub async fn update_phase(&self, session_id: Uuid, phase: Phase) -> Result<()> {
        sqlx::query("UPDATE sessions SET phase = ? WHERE id = ?")
            .bind(phase)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to update session phase")?;

        Ok(())
    }

    pub async fn set_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ? WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .context("Failed to update session status")?;

        Ok(())
    }

    pub async fn create_message(&self, request: &NewMessage) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages
                (session_id, role, content, created_at, agent_type, model_used,
                 is_privacy_issue, is_complex_issue)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, session_id, role, content, created_at, agent_type, model_used,
                      is_privacy_issue, is_complex_issue
            "#,
        )
        .bind(request.session_id)
        .bind(&request.role)
        .bind(&request.content)
        .bind(Utc::now())
        .bind(&request.agent_type)
        .bind(&request.model_used)
        .bind(request.is_privacy_issue)
        .bind(request.is_complex_issue)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create message")?;

        Ok(message)
    }

    /// The most recent `limit` messages of a session, oldest-first.
    pub async fn recent_messages(&self, session_id: Uuid, limit: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, session_id, role, content, created_at, agent_type, model_used,
                   is_privacy_issue, is_complex_issue
            FROM (
                SELECT * FROM messages
                WHERE session_id = ?
                ORDER BY id DESC
                LIMIT ?
            )
            ORDER BY id ASC
            "#,
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch session messages")?;

        Ok(messages)
    }

    /// Full history wipe for one user: every session and every message in it.
    /// Returns the number of sessions removed.
    pub async fn clear_user_history(&self, user_id: Uuid) -> Result<u64> {
        sqlx::query(
            "DELETE FROM messages WHERE session_id IN (SELECT id FROM sessions WHERE user_id = ?)",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("Failed to delete user messages")?;

        let result = sqlx::query("DELETE FROM sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete user sessions")?;

        Ok(result.rows_affected())
    }
}
