use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::server::content::ContentCatalog;
use crate::server::models::chat::{NewMessage, Phase, Session, SessionStatus, User};
use crate::server::services::chat_database::ChatDatabaseService;
use crate::server::services::gateway::{ChatMessage, StreamUpdate};
use crate::server::services::model_router::{self, ModelRouter};
use crate::server::services::perception::PerceptionService;
use crate::server::services::phase::PhaseManager;

/// How much stored history a turn carries into classification and generation.
const HISTORY_WINDOW: i64 = 20;

pub const CONVERSATION_AGENT: &str = "ConversationAgent";
pub const SAFETY_AGENT: &str = "SafetyAgent";

/// Ordered event stream of one turn. A turn emits either
/// `crisis` + `end`, or `metadata`, zero-or-more `chunk`s, then `end`;
/// an `error` may replace the chunk sequence but is still followed by `end`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Metadata {
        session_id: Uuid,
        phase: Phase,
        round_count: i64,
        is_privacy: bool,
        is_complex: bool,
        model_used: String,
    },
    Chunk {
        content: String,
    },
    Crisis {
        content: String,
        session_id: Uuid,
    },
    Error {
        content: String,
    },
    End,
}

/// Sequences one user turn end to end: session resolution, user-turn
/// persistence, perception, crisis short-circuit, phase transition, backend
/// routing, streamed generation, assistant-turn persistence.
pub struct ChatCoordinator {
    db: Arc<ChatDatabaseService>,
    perception: Arc<PerceptionService>,
    phases: PhaseManager,
    router: ModelRouter,
    catalog: Arc<ContentCatalog>,
}

impl ChatCoordinator {
    pub fn new(
        db: Arc<ChatDatabaseService>,
        perception: Arc<PerceptionService>,
        phases: PhaseManager,
        router: ModelRouter,
        catalog: Arc<ContentCatalog>,
    ) -> Self {
        Self {
            db,
            perception,
            phases,
            router,
            catalog,
        }
    }

    /// Runs the turn, emitting events into `tx`. A closed receiver means the
    /// caller disconnected: the in-flight generation is abandoned and the
    /// assistant turn is not persisted. Returning `Err` signals a failure the
    /// transport layer should surface as a terminal `error` event.
    pub async fn process_turn(
        &self,
        user: &User,
        message: &str,
        session_id: Option<Uuid>,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<()> {
        let session = self.resolve_session(user, session_id).await?;

        self.db
            .create_message(&NewMessage::user(session.id, message))
            .await?;
        let round_count = self.db.begin_round(session.id).await?;

        let history: Vec<ChatMessage> = self
            .db
            .recent_messages(session.id, HISTORY_WINDOW)
            .await?
            .into_iter()
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content,
            })
            .collect();

        let perception = self.perception.execute(message, &history).await;

        if perception.is_crisis {
            info!(session_id = %session.id, "crisis language detected, short-circuiting turn");
            return self.handle_crisis(&session, tx).await;
        }

        let mut phase = session.phase;
        if let Some(next) = self.phases.evaluate(phase, round_count, message) {
            info!(session_id = %session.id, ?phase, ?next, "phase transition");
            self.db.update_phase(session.id, next).await?;
            phase = next;
        }

        let choice = model_router::choose(perception.is_privacy_issue, perception.is_complex_issue);
        let model_used = choice.display_name();
        info!(
            session_id = %session.id,
            round_count,
            is_privacy = perception.is_privacy_issue,
            is_complex = perception.is_complex_issue,
            privacy_reason = %perception.privacy_reason,
            complexity_reason = %perception.complexity_reason,
            model_used,
            "routing turn"
        );

        let sent = tx
            .send(ChatEvent::Metadata {
                session_id: session.id,
                phase,
                round_count,
                is_privacy: perception.is_privacy_issue,
                is_complex: perception.is_complex_issue,
                model_used: model_used.to_string(),
            })
            .await;
        if sent.is_err() {
            warn!(session_id = %session.id, "caller gone before generation, abandoning turn");
            return Ok(());
        }

        let system_prompt = self.catalog.phase_prompts.prompt_for(phase);
        let mut updates = self
            .router
            .service(choice)
            .generate(system_prompt, &history, message, true)
            .await;

        let mut full_response = String::new();
        while let Some(update) = updates.recv().await {
            match update {
                StreamUpdate::Content(fragment) | StreamUpdate::Error(fragment) => {
                    full_response.push_str(&fragment);
                    if tx.send(ChatEvent::Chunk { content: fragment }).await.is_err() {
                        warn!(
                            session_id = %session.id,
                            "caller disconnected mid-stream, dropping partial response"
                        );
                        return Ok(());
                    }
                }
                StreamUpdate::Done => break,
            }
        }

        self.db
            .create_message(&NewMessage::assistant(
                session.id,
                full_response,
                CONVERSATION_AGENT,
                model_used,
                perception.is_privacy_issue,
                perception.is_complex_issue,
            ))
            .await?;

        let _ = tx.send(ChatEvent::End).await;
        Ok(())
    }

    /// Crisis branch: freeze the session, deliver the fixed resource text,
    /// record it, and terminate the turn without any backend call.
    async fn handle_crisis(&self, session: &Session, tx: &mpsc::Sender<ChatEvent>) -> Result<()> {
        self.db.set_status(session.id, SessionStatus::Crisis).await?;

        let _ = tx
            .send(ChatEvent::Crisis {
                content: self.catalog.crisis_response.clone(),
                session_id: session.id,
            })
            .await;

        self.db
            .create_message(&NewMessage::assistant(
                session.id,
                self.catalog.crisis_response.clone(),
                SAFETY_AGENT,
                "local",
                false,
                false,
            ))
            .await?;

        let _ = tx.send(ChatEvent::End).await;
        Ok(())
    }

    /// Reuses the caller's session only when it is theirs and still ongoing;
    /// anything else silently becomes a fresh session rather than an error.
    async fn resolve_session(&self, user: &User, session_id: Option<Uuid>) -> Result<Session> {
        if let Some(id) = session_id {
            if let Some(session) = self.db.ongoing_session(id, user.id).await? {
                return Ok(session);
            }
            info!(session_id = %id, user_id = %user.id, "requested session unavailable, creating new");
        }
        self.db.create_session(user.id).await
    }
}
