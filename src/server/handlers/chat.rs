use std::convert::Infallible;

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::error;
use uuid::Uuid;

use crate::server::{
    config::AppState,
    models::chat::User,
    services::{auth::AuthError, coordinator::ChatEvent},
};

const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: String,
    pub session_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct ClearHistoryResponse {
    pub success: bool,
    pub message: String,
}

fn reject(err: AuthError) -> (StatusCode, String) {
    match err {
        AuthError::Database(e) => {
            error!("auth lookup failed: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, "认证服务不可用".to_string())
        }
        other => (StatusCode::UNAUTHORIZED, other.to_string()),
    }
}

async fn current_user(state: &AppState, headers: &HeaderMap) -> Result<User, (StatusCode, String)> {
    state.auth.authenticate(headers).await.map_err(reject)
}

/// Submits one user turn and streams the resulting events back as SSE.
/// The turn always terminates with an `end` event, even on failure.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SendMessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let user = current_user(&state, &headers).await?;

    let length = request.message.chars().count();
    if length == 0 || length > MAX_MESSAGE_CHARS {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("消息长度需在 1-{MAX_MESSAGE_CHARS} 字符之间"),
        ));
    }

    let (tx, rx) = mpsc::channel::<ChatEvent>(32);
    let coordinator = state.coordinator.clone();

    tokio::spawn(async move {
        if let Err(e) = coordinator
            .process_turn(&user, &request.message, request.session_id, &tx)
            .await
        {
            error!("turn processing failed: {e:?}");
            let _ = tx
                .send(ChatEvent::Error {
                    content: format!("处理失败: {e}"),
                })
                .await;
            let _ = tx.send(ChatEvent::End).await;
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|_| r#"{"type":"error","content":"序列化失败"}"#.to_string());
        Ok(Event::default().data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// The caller's most recently active ongoing session, if any.
pub async fn active_session(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let user = current_user(&state, &headers).await?;

    let session = state
        .db
        .latest_ongoing_for_user(user.id)
        .await
        .map_err(|e| {
            error!("failed to fetch active session: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    let body = match session {
        Some(session) => json!({
            "session_id": session.id,
            "phase": session.phase,
            "round_count": session.round_count,
            "status": session.status,
        }),
        None => json!({
            "session_id": null,
            "phase": null,
            "round_count": 0,
        }),
    };

    Ok(Json(body))
}

/// User-initiated full history wipe: deletes every session and message the
/// caller owns, answering with a randomly chosen farewell line.
pub async fn clear_history(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClearHistoryResponse>, (StatusCode, String)> {
    let user = current_user(&state, &headers).await?;

    state.db.clear_user_history(user.id).await.map_err(|e| {
        error!("failed to clear history: {e:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let message = state
        .catalog
        .farewell_lines
        .choose(&mut rand::thread_rng())
        .cloned()
        .unwrap_or_default();

    Ok(Json(ClearHistoryResponse {
        success: true,
        message,
    }))
}
