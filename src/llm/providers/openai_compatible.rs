use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::provider::{is_transient, ModelProvider, MAX_RETRY_ATTEMPTS, RETRY_INTERVAL_SECS};
use crate::llm::sse::{parse_sse_line, SseChunk};
use crate::llm::types::{ChatMessage, ModelParams};

pub struct OpenAiCompatibleProvider {
    id: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(id: String, api_base: String, api_key: String) -> Self {
        Self {
            id,
            api_base,
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }

    fn build_body(&self, messages: &[ChatMessage], params: &ModelParams, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": params.model,
            "messages": messages,
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
            "top_p": params.top_p,
            "stream": stream,
        })
    }

    async fn send(&self, body: &serde_json::Value) -> DeskPilotResult<reqwest::Response> {
        if self.api_key.is_empty() {
            return Err(DeskPilotError::Provider(format!(
                "API key not configured for provider '{}'",
                self.id
            )));
        }

        tracing::debug!(
            provider = %self.id,
            body = %sanitized_body(body),
            "sending chat completion request (base64 omitted)"
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retryable = status.is_server_error();
                    let err_body = response.text().await.unwrap_or_default();
                    if retryable && attempt < MAX_RETRY_ATTEMPTS {
                        tracing::warn!(
                            provider = %self.id,
                            status = %status,
                            attempt,
                            "transient provider error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(RETRY_INTERVAL_SECS)).await;
                        continue;
                    }
                    return Err(DeskPilotError::Provider(format!("{status}: {err_body}")));
                }
                Err(e) if is_transient(&e) && attempt < MAX_RETRY_ATTEMPTS => {
                    tracing::warn!(provider = %self.id, error = %e, attempt, "request failed, retrying");
                    tokio::time::sleep(Duration::from_secs(RETRY_INTERVAL_SECS)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> DeskPilotResult<String> {
        let body = self.build_body(messages, params, false);
        let response = self.send(&body).await?;
        let json: serde_json::Value = response.json().await?;

        let text = extract_text(&json);
        if text.is_empty() {
            return Err(DeskPilotError::Provider("response missing content".into()));
        }
        tracing::info!(provider = %self.id, content_len = text.len(), "chat completion received");
        Ok(text)
    }

    async fn stream_complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> DeskPilotResult<mpsc::Receiver<String>> {
        let body = self.build_body(messages, params, true);
        let response = self.send(&body).await?;

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut line_buf = String::new();

            'stream: while let Some(result) = byte_stream.next().await {
                let Ok(bytes) = result else { break };
                for ch in String::from_utf8_lossy(&bytes).chars() {
                    if ch != '\n' {
                        line_buf.push(ch);
                        continue;
                    }
                    let line = line_buf.trim().to_string();
                    line_buf.clear();
                    match parse_sse_line(&line) {
                        Ok(Some(SseChunk::Content(text))) => {
                            if tx.send(text).await.is_err() {
                                break 'stream;
                            }
                        }
                        Ok(Some(SseChunk::Done)) => break 'stream,
                        Ok(None) => {}
                        Err(e) => tracing::debug!("SSE parse skipped: {e}"),
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Response content can be a plain string or a list of typed parts; prefer the
/// concatenated text chunks.
fn extract_text(json: &serde_json::Value) -> String {
    let Some(choices) = json["choices"].as_array() else {
        return String::new();
    };
    for choice in choices {
        let content = &choice["message"]["content"];
        if let Some(text) = content.as_str() {
            return text.to_string();
        }
        if let Some(parts) = content.as_array() {
            let joined: String = parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect();
            if !joined.is_empty() {
                return joined;
            }
        }
    }
    String::new()
}

/// Clone the body with image payloads elided so debug logs stay readable.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.pointer_mut("/image_url/url") {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_plain_string_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        });
        assert_eq!(extract_text(&json), "hello");
    }

    #[test]
    fn extracts_part_list_content() {
        let json = serde_json::json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "a"},
                {"type": "text", "text": "b"}
            ]}}]
        });
        assert_eq!(extract_text(&json), "ab");
    }

    #[test]
    fn empty_on_missing_choices() {
        assert_eq!(extract_text(&serde_json::json!({})), "");
    }

    #[test]
    fn sanitizer_elides_image_payloads() {
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
            ]}]
        });
        let logged = sanitized_body(&body);
        assert!(logged.contains("<omitted_base64_image>"));
        assert!(!logged.contains("AAAA"));
    }
}
