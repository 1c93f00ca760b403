use std::sync::Arc;

use axum::http::{header, HeaderMap};
use thiserror::Error;

use super::chat_database::ChatDatabaseService;
use crate::server::models::chat::User;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error(transparent)]
    Database(#[from] anyhow::Error),
}

/// Maps a bearer token to an active user. Token issuance lives outside this
/// service; it only verifies.
pub struct AuthService {
    db: Arc<ChatDatabaseService>,
}

impl AuthService {
    pub fn new(db: Arc<ChatDatabaseService>) -> Self {
        Self { db }
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<User, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;

        self.db
            .user_by_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)
    }
}
