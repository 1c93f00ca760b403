use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Fragment of a generation stream. `Error` carries human-readable failure
/// text delivered in-band; the stream always terminates with `Done`.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Content(String),
    Error(String),
    Done,
}

/// Common contract over the two generation backends. The receiver is a lazy,
/// single-pass stream of fragments; concatenating every `Content`/`Error`
/// payload yields the full response. Non-stream mode yields exactly one
/// fragment.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_input: &str,
        stream: bool,
    ) -> mpsc::Receiver<StreamUpdate>;
}

pub fn build_messages(
    system_prompt: &str,
    history: &[ChatMessage],
    user_input: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::new("system", system_prompt));
    messages.extend_from_slice(history);
    messages.push(ChatMessage::new("user", user_input));
    messages
}
