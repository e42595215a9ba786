use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{Value, json};

use super::{ChatMessage, ChatModel, LlmError, TextStream};

/// Client for any server speaking the OpenAI chat-completions protocol.
pub struct OpenAiCompatClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatClient {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn post_completion(&self, payload: Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

pub(crate) fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }
    serde_json::from_str::<Value>(data)
        .ok()
        .and_then(|parsed| parsed["choices"][0]["delta"]["content"].as_str().map(String::from))
        .filter(|s| !s.is_empty())
        .map(SseLine::Delta)
        .unwrap_or(SseLine::Skip)
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn stream_chat(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> Result<TextStream, LlmError> {
        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
            "stream": true,
        });
        let resp = self.post_completion(payload).await?;
        let mut bytes = resp.bytes_stream();

        let stream = async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(LlmError::from)?;
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_sse_line(&String::from_utf8_lossy(&line)) {
                        SseLine::Delta(delta) => yield delta,
                        SseLine::Done => break 'read,
                        SseLine::Skip => {}
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> Result<Option<String>, LlmError> {
        let payload = json!({
            "model": model,
            "messages": messages,
            "temperature": temperature,
        });
        let resp = self.post_completion(payload).await?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| LlmError::Malformed(e.to_string()))?;
        Ok(body["choices"][0]["message"]["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_delta_is_extracted() {
        let line = r#"data: {"choices":[{"delta":{"content":"<think>"}}]}"#;
        assert_eq!(parse_sse_line(line), SseLine::Delta("<think>".to_string()));
    }

    #[test]
    fn sse_done_and_noise() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive"), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseLine::Skip
        );
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = OpenAiCompatClient::new(Client::new(), "http://localhost:8000/v1/", "k");
        assert_eq!(client.base_url, "http://localhost:8000/v1");
    }
}
