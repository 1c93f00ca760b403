use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::gateway::{build_messages, ChatMessage, ChatModel, StreamUpdate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Cloud-hosted large model behind the ModelScope inference API
/// (OpenAI-compatible chat completions with SSE streaming). All failures are
/// converted to in-band error fragments so the stream always completes.
pub struct ModelScopeService {
    client: Client,
    api_key: Secret<String>,
    base_url: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

impl ModelScopeService {
    pub fn new(
        api_key: Secret<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        // Construction-time failure here means a broken TLS backend; a client
        // without the request timeout would violate the remote contract.
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build http client");
        Self {
            client,
            api_key,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn describe_failure(e: &reqwest::Error) -> String {
        if e.is_timeout() {
            "错误：云端模型响应超时，请稍后重试".to_string()
        } else {
            format!("错误：云端模型调用异常 - {}", e)
        }
    }
}

#[async_trait]
impl ChatModel for ModelScopeService {
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

        if self.api_key.expose_secret().is_empty() {
            // No credential configured: explain and terminate immediately.
            let _ = tx
                .try_send(StreamUpdate::Error(
                    "错误：云端模型未配置 API Key，请联系管理员。".to_string(),
                ))
                .ok();
            let _ = tx.try_send(StreamUpdate::Done).ok();
            return rx;
        }

        let client = self.client.clone();
        let endpoint = self.endpoint();
        let api_key = self.api_key.expose_secret().clone();
        let model = self.model.clone();
        let messages = build_messages(system_prompt, history, user_input);

        tokio::spawn(async move {
            let request = CompletionRequest {
                model: &model,
                messages: &messages,
                stream,
                max_tokens: 2000,
                temperature: 0.7,
                top_p: 0.8,
            };

            let response = client
                .post(&endpoint)
                .bearer_auth(&api_key)
                .json(&request)
                .send()
                .await;

            match response {
                Ok(response) if !response.status().is_success() => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    error!("modelscope call failed ({}): {}", status, body);
                    let _ = tx
                        .send(StreamUpdate::Error(format!(
                            "错误：云端模型调用失败 ({}): {}",
                            status.as_u16(),
                            body
                        )))
                        .await;
                }
                Ok(response) if !stream => match response.json::<CompletionResponse>().await {
                    Ok(body) => {
                        if let Some(choice) = body.choices.first() {
                            let _ = tx
                                .send(StreamUpdate::Content(choice.message.content.clone()))
                                .await;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(StreamUpdate::Error(Self::describe_failure(&e))).await;
                    }
                },
                Ok(response) => {
                    // Server-sent `data:` frames ending with a [DONE] sentinel.
                    // Individual malformed frames are skipped, not fatal.
                    let mut body = response.bytes_stream();
                    let mut buffer = String::new();

                    'outer: while let Some(chunk) = body.next().await {
                        let chunk = match chunk {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                let _ = tx
                                    .send(StreamUpdate::Error(Self::describe_failure(&e)))
                                    .await;
                                break;
                            }
                        };
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(pos) = buffer.find('\n') {
                            let line = buffer[..pos].trim().to_string();
                            buffer.drain(..=pos);

                            let Some(data) = line.strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();
                            if data == "[DONE]" {
                                break 'outer;
                            }

                            match serde_json::from_str::<StreamResponse>(data) {
                                Ok(frame) => {
                                    let content = frame
                                        .choices
                                        .first()
                                        .and_then(|c| c.delta.content.clone())
                                        .unwrap_or_default();
                                    if !content.is_empty()
                                        && tx.send(StreamUpdate::Content(content)).await.is_err()
                                    {
                                        break 'outer;
                                    }
                                }
                                Err(_) => debug!("skipping malformed stream frame: {}", data),
                            }
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(StreamUpdate::Error(Self::describe_failure(&e))).await;
                }
            }

            let _ = tx.send(StreamUpdate::Done).await;
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    #[tokio::test]
    async fn missing_credential_yields_single_error_then_done() {
        let service = ModelScopeService::new(
            Secret::new(String::new()),
            "http://localhost:9",
            "Qwen/Qwen3-Next-80B-A3B-Instruct",
        );

        let mut rx = service.generate("prompt", &[], "你好", true).await;
        match rx.recv().await {
            Some(StreamUpdate::Error(message)) => assert!(message.contains("API Key")),
            other => panic!("expected error fragment, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(StreamUpdate::Done)));
        assert!(rx.recv().await.is_none());
    }
}
