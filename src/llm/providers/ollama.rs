use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::errors::{DeskPilotError, DeskPilotResult};
use crate::llm::provider::{is_transient, ModelProvider, MAX_RETRY_ATTEMPTS, RETRY_INTERVAL_SECS};
use crate::llm::types::{ChatMessage, ContentPart, ModelParams, Role};

/// Local Ollama chat provider. Multimodal content is collapsed into plain text
/// plus a dedicated `images` array of raw base64 payloads, which is the only
/// shape the Ollama chat API accepts.
pub struct OllamaProvider {
    id: String,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

impl OllamaProvider {
    pub fn new(id: String, api_base: String) -> Self {
        Self {
            id,
            api_base,
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.id
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &ModelParams,
    ) -> DeskPilotResult<String> {
        let body = serde_json::json!({
            "model": params.model,
            "messages": normalize_messages(messages),
            "stream": false,
            "options": {
                "temperature": params.temperature,
                "top_p": params.top_p,
                "num_predict": params.max_tokens,
            },
        });

        tracing::debug!(provider = %self.id, url = %self.endpoint(), model = %params.model, "sending Ollama chat request");

        let mut attempt = 0u32;
        let response = loop {
            attempt += 1;
            match self.client.post(self.endpoint()).json(&body).send().await {
                Ok(response) if response.status().is_success() => break response,
                Ok(response) => {
                    let status = response.status();
                    let err_body = response.text().await.unwrap_or_default();
                    if status.is_server_error() && attempt < MAX_RETRY_ATTEMPTS {
                        tracing::warn!(provider = %self.id, status = %status, attempt, "transient Ollama error, retrying");
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
        };

        let json: serde_json::Value = response.json().await?;
        let text = extract_text(&json);
        if text.is_empty() {
            return Err(DeskPilotError::Provider("Ollama response missing content".into()));
        }
        Ok(text)
    }
}

fn normalize_messages(messages: &[ChatMessage]) -> Vec<OllamaMessage> {
    messages
        .iter()
        .map(|message| {
            let role = match message.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let mut texts: Vec<&str> = Vec::new();
            let mut images: Vec<String> = Vec::new();
            for part in &message.content {
                match part {
                    ContentPart::Text { text } => texts.push(text),
                    ContentPart::ImageUrl { image_url } => {
                        images.push(strip_data_url(&image_url.url))
                    }
                }
            }
            let mut content = texts.join("\n\n").trim().to_string();
            if content.is_empty() && message.role == Role::User {
                content = "Interpret the attached screenshot to continue the task.".to_string();
            }
            OllamaMessage { role, content, images }
        })
        .collect()
}

/// Ollama only needs the base64 payload; strip a data-URL prefix if present.
fn strip_data_url(reference: &str) -> String {
    if let Some(rest) = reference.strip_prefix("data:") {
        if let Some((_, payload)) = rest.split_once(',') {
            if !payload.is_empty() {
                return payload.to_string();
            }
        }
    }
    reference.to_string()
}

fn extract_text(payload: &serde_json::Value) -> String {
    if let Some(text) = payload["message"]["content"].as_str() {
        return text.trim().to_string();
    }
    payload["response"]
        .as_str()
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ImageUrl;

    #[test]
    fn strips_data_url_prefix() {
        assert_eq!(strip_data_url("data:image/png;base64,QUJD"), "QUJD");
        assert_eq!(strip_data_url("QUJD"), "QUJD");
    }

    #[test]
    fn collapses_multimodal_message() {
        let msg = ChatMessage {
            role: Role::User,
            content: vec![
                ContentPart::Text { text: "open the app".into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl { url: "data:image/png;base64,QUJD".into() },
                },
            ],
        };
        let out = normalize_messages(&[msg]);
        assert_eq!(out[0].content, "open the app");
        assert_eq!(out[0].images, vec!["QUJD".to_string()]);
    }

    #[test]
    fn empty_user_text_gets_hint() {
        let msg = ChatMessage {
            role: Role::User,
            content: vec![ContentPart::ImageUrl {
                image_url: ImageUrl { url: "QUJD".into() },
            }],
        };
        let out = normalize_messages(&[msg]);
        assert!(!out[0].content.is_empty());
    }

    #[test]
    fn extracts_chat_and_generate_shapes() {
        let chat = serde_json::json!({"message": {"content": " hi "}});
        assert_eq!(extract_text(&chat), "hi");
        let generate = serde_json::json!({"response": "yo"});
        assert_eq!(extract_text(&generate), "yo");
    }
}
