use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use super::gateway::{build_messages, ChatMessage, ChatModel, StreamUpdate};

/// Locally hosted small model behind the Ollama chat API. Also serves the
/// perception classifier through [`OllamaService::complete`].
pub struct OllamaService {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    #[serde(default)]
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Default, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl OllamaService {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    /// One-shot, non-streamed completion. Used by the perception classifier,
    /// which needs a whole answer to parse and a low temperature for stable
    /// verdicts. Errors propagate so the caller can degrade to heuristics.
    pub async fn complete(&self, prompt: &str, temperature: f32) -> Result<String> {
        let messages = vec![ChatMessage::new("user", prompt)];
        let request = OllamaChatRequest {
            model: &self.model,
            messages: &messages,
            stream: false,
            options: Some(OllamaOptions { temperature }),
        };

        let response = self
            .client
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .context("ollama request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("ollama returned {}: {}", status, body));
        }

        let body: OllamaChatResponse = response
            .json()
            .await
            .context("malformed ollama response")?;
        Ok(body.message.content)
    }

    fn parse_line(line: &str) -> Option<OllamaChatResponse> {
        if line.is_empty() {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

#[async_trait]
impl ChatModel for OllamaService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        system_prompt: &str,
        history: &[ChatMessage],
        user_input: &str,
        stream: bool,
    ) -> mpsc::Receiver<StreamUpdate> {
        let (tx, rx) = mpsc::channel(100);
        let client = self.client.clone();
        let endpoint = self.endpoint();
        let model = self.model.clone();
        let messages = build_messages(system_prompt, history, user_input);

        tokio::spawn(async move {
            let request = OllamaChatRequest {
                model: &model,
                messages: &messages,
                stream,
                options: None,
            };

            let response = client.post(&endpoint).json(&request).send().await;
            match response {
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let _ = tx
                        .send(StreamUpdate::Error(format!(
                            "[错误] 本地模型调用失败: {} {}",
                            status, body
                        )))
                        .await;
                }
                Ok(response) if !stream => match response.json::<OllamaChatResponse>().await {
                    Ok(body) => {
                        let _ = tx.send(StreamUpdate::Content(body.message.content)).await;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(StreamUpdate::Error(format!("[错误] 本地模型调用失败: {}", e)))
                            .await;
                    }
                },
                Ok(response) => {
                    // Streamed mode: newline-delimited JSON frames, terminated
                    // by a frame with `done: true`. Malformed frames are skipped.
                    let mut body = response.bytes_stream();
                    let mut buffer = String::new();

                    'outer: while let Some(chunk) = body.next().await {
                        let chunk = match chunk {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                let _ = tx
                                    .send(StreamUpdate::Error(format!(
                                        "[错误] 本地模型调用失败: {}",
                                        e
                                    )))
                                    .await;
                                break;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);

                            if let Some(frame) = Self::parse_line(&line) {
                                if !frame.message.content.is_empty()
                                    && tx
                                        .send(StreamUpdate::Content(frame.message.content))
                                        .await
                                        .is_err()
                                {
                                    break 'outer;
                                }
                                if frame.done {
                                    break 'outer;
                                }
                            } else {
                                debug!("skipping malformed ollama frame: {}", line);
                            }
                        }
                    }

                    // A final frame without a trailing newline still counts.
                    if let Some(frame) = Self::parse_line(buffer.trim()) {
                        if !frame.message.content.is_empty() {
                            let _ = tx.send(StreamUpdate::Content(frame.message.content)).await;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(StreamUpdate::Error(format!("[错误] 本地模型调用失败: {}", e)))
                        .await;
                }
            }

            let _ = tx.send(StreamUpdate::Done).await;
        });

        rx
    }
}
