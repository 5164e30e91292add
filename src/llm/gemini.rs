//! Gemini client over the OpenAI-compatible chat completions endpoint
//!
//! Uses a long-lived reqwest::Client for connection pooling. Streamed turns
//! arrive as SSE `data:` lines; non-streamed completions are used for the
//! summarization pass.

use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::error::AgentError;
use crate::llm::{CompletionClient, DeltaStream, ModelDelta, ToolCallFragment};
use crate::models::{ConversationTurn, Role};

/// Gemini's OpenAI-compatibility endpoint. Shared with the settings module
/// so the default cannot drift.
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Reusable Gemini client (connection-pooled).
pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    system_prompt: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String, system_prompt: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            system_prompt,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn transcript_messages(&self, transcript: &ConversationTurn) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(transcript.utterances().len() + 1);
        messages.push(ChatMessage {
            role: "system",
            content: self.system_prompt.clone(),
        });
        for utterance in transcript.utterances() {
            messages.push(ChatMessage {
                role: match utterance.role {
                    Role::User => "user",
                    Role::Agent => "assistant",
                },
                content: utterance.text.clone(),
            });
        }
        messages
    }

    async fn post_chat(&self, request: &ChatRequest<'_>) -> crate::Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Model API request failed: {}", e);
                AgentError::UpstreamModel(format!("request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Model API error response: {}", error_text);
            return Err(AgentError::UpstreamModel(format!(
                "status {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait::async_trait]
impl CompletionClient for GeminiClient {
    async fn stream_turn(
        &self,
        transcript: &ConversationTurn,
        tools: &[serde_json::Value],
    ) -> crate::Result<DeltaStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: self.transcript_messages(transcript),
            tools: if tools.is_empty() { None } else { Some(tools) },
            stream: true,
        };

        debug!(model = %self.model, tool_count = tools.len(), "Starting streamed completion");

        let response = self.post_chat(&request).await?;
        let mut bytes = response.bytes_stream();
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut lines = SseLineBuffer::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(AgentError::UpstreamModel(format!(
                                "stream transport failed: {}",
                                e
                            ))))
                            .await;
                        return;
                    }
                };

                for line in lines.push(&chunk) {
                    match parse_sse_line(line.trim()) {
                        Ok(SseLine::Done) => return,
                        Ok(SseLine::Skip) => {}
                        Ok(SseLine::Delta(delta)) => {
                            // Receiver dropped means the turn was cancelled.
                            if tx.send(Ok(delta)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = tx
                                .send(Err(AgentError::UpstreamModel(format!(
                                    "malformed stream chunk: {}",
                                    e
                                ))))
                                .await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn complete(&self, system: &str, user: &str) -> crate::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            tools: None,
            stream: false,
        };

        let response = self.post_chat(&request).await?;
        let completion: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse completion response: {}", e);
            AgentError::UpstreamModel(format!("completion parse error: {}", e))
        })?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AgentError::UpstreamModel("empty completion".to_string()))
    }
}

//
// ================= Wire Types =================
//

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [serde_json::Value]>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Splits raw transport chunks into complete SSE lines. Bytes are buffered
/// and only whole lines are decoded, so a multi-byte UTF-8 character split
/// across two HTTP chunks arrives intact.
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            raw.pop();
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }
}

enum SseLine {
    Delta(ModelDelta),
    Done,
    Skip,
}

/// Classify one SSE line. Non-`data:` lines (keep-alives, blanks) are
/// skipped; `data: [DONE]` terminates the stream.
fn parse_sse_line(line: &str) -> Result<SseLine, serde_json::Error> {
    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let payload = payload.trim();

    if payload.is_empty() {
        return Ok(SseLine::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(SseLine::Skip);
    };

    let tool_call = choice
        .delta
        .tool_calls
        .and_then(|calls| calls.into_iter().next())
        .map(|call| {
            let function = call.function.unwrap_or(FunctionDelta {
                name: None,
                arguments: None,
            });
            ToolCallFragment {
                id: call.id,
                name: function.name,
                arguments: function.arguments,
            }
        });

    let delta = ModelDelta {
        content: choice.delta.content,
        tool_call,
    };

    if delta.content.is_none() && delta.tool_call.is_none() {
        return Ok(SseLine::Skip);
    }

    Ok(SseLine::Delta(delta))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = ChatRequest {
            model: "gemini-2.5-flash",
            messages: vec![ChatMessage {
                role: "user",
                content: "How is AAPL doing?".to_string(),
            }],
            tools: None,
            stream: true,
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("How is AAPL doing?"));
        assert!(json.contains("\"stream\":true"));
        assert!(!json.contains("tools"));
    }

    #[test]
    fn test_parse_text_delta_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        match parse_sse_line(line).unwrap() {
            SseLine::Delta(delta) => {
                assert_eq!(delta.content.as_deref(), Some("Hello"));
                assert!(delta.tool_call.is_none());
            }
            _ => panic!("expected a delta"),
        }
    }

    #[test]
    fn test_parse_tool_call_delta_line() {
        let line = concat!(
            r#"data: {"choices":[{"delta":{"tool_calls":[{"id":"call_1","#,
            r#""function":{"name":"buy_stock","arguments":"{\"userid\""}}]}}]}"#,
        );
        match parse_sse_line(line).unwrap() {
            SseLine::Delta(delta) => {
                let call = delta.tool_call.unwrap();
                assert_eq!(call.id.as_deref(), Some("call_1"));
                assert_eq!(call.name.as_deref(), Some("buy_stock"));
                assert_eq!(call.arguments.as_deref(), Some("{\"userid\""));
            }
            _ => panic!("expected a tool-call delta"),
        }
    }

    #[test]
    fn test_parse_control_lines() {
        assert!(matches!(parse_sse_line("data: [DONE]"), Ok(SseLine::Done)));
        assert!(matches!(parse_sse_line(""), Ok(SseLine::Skip)));
        assert!(matches!(parse_sse_line(": keep-alive"), Ok(SseLine::Skip)));
        assert!(matches!(
            parse_sse_line(r#"data: {"choices":[]}"#),
            Ok(SseLine::Skip)
        ));
    }

    #[test]
    fn test_malformed_data_line_is_an_error() {
        assert!(parse_sse_line("data: {not json").is_err());
    }

    #[test]
    fn test_line_buffer_keeps_partial_lines() {
        let mut buffer = SseLineBuffer::new();

        assert!(buffer.push(b"data: {\"a\"").is_empty());
        let lines = buffer.push(b": 1}\ndata: ");
        assert_eq!(lines, vec!["data: {\"a\": 1}".to_string()]);

        let lines = buffer.push(b"[DONE]\r\n");
        assert_eq!(lines, vec!["data: [DONE]".to_string()]);
    }

    #[test]
    fn test_line_buffer_reassembles_split_multibyte_characters() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"caf\u{e9} \u{20ac}5\"}}]}\n";
        let bytes = line.as_bytes();

        // Split in the middle of the three-byte euro sign.
        let split = line.find('\u{20ac}').unwrap() + 1;
        let mut buffer = SseLineBuffer::new();
        assert!(buffer.push(&bytes[..split]).is_empty());
        let lines = buffer.push(&bytes[split..]);

        assert_eq!(lines.len(), 1);
        assert!(!lines[0].contains('\u{fffd}'));
        match parse_sse_line(lines[0].trim()).unwrap() {
            SseLine::Delta(delta) => {
                assert_eq!(delta.content.as_deref(), Some("caf\u{e9} \u{20ac}5"));
            }
            _ => panic!("expected a delta"),
        }
    }
}
