use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::llm::{ChatMessage, ChatModel, ChatRequest, DeltaStream, StreamDelta};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";

#[derive(Debug, Clone)]
pub struct OpenAiCompatConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Chat client for OpenAI-compatible `/chat/completions` endpoints (Groq by default).
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    config: OpenAiCompatConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: OpenAiCompatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .context("failed to create model endpoint HTTP client")?;
        Ok(Self { http, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            bail!("model API key is not set (export GROQ_API_KEY or pass --model-api-key-env)");
        };

        let body = CompletionBody {
            model: &request.model,
            messages: &request.messages,
            stream,
            temperature: request.temperature,
            reasoning_effort: request.reasoning_effort.as_deref(),
            include_reasoning: request.include_reasoning,
            response_format: request
                .json_response
                .then(|| json!({ "type": "json_object" })),
        };

        let mut builder = self.http.post(self.endpoint()).bearer_auth(api_key).json(&body);
        if !stream {
            builder = builder.timeout(Duration::from_secs(self.config.timeout_secs.max(1)));
        }
        let response = builder
            .send()
            .await
            .with_context(|| format!("model endpoint request failed (model={})", request.model))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<unavailable>".to_string());
            bail!("model endpoint returned HTTP {status}: {text}");
        }
        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    include_reasoning: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Decodes one SSE `data:` payload into a delta. Empty deltas yield `None`.
pub fn parse_stream_payload(payload: &str) -> Result<Option<StreamDelta>> {
    let chunk = serde_json::from_str::<StreamChunk>(payload)
        .with_context(|| format!("invalid model stream chunk: {payload}"))?;
    if let Some(error) = chunk.error {
        return Err(anyhow!("model endpoint stream error: {error}"));
    }
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };
    let delta = StreamDelta {
        reasoning: choice.delta.reasoning.filter(|text| !text.is_empty()),
        content: choice.delta.content.filter(|text| !text.is_empty()),
    };
    if delta.reasoning.is_none() && delta.content.is_none() {
        return Ok(None);
    }
    Ok(Some(delta))
}

/// Incremental server-sent-events decoder. Bytes go in as they arrive off
/// the wire; complete `data:` payloads come out.
#[derive(Debug, Default)]
pub struct SseBuffer {
    pending: Vec<u8>,
    data_lines: Vec<String>,
    done: bool,
}

impl SseBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline).collect::<Vec<u8>>();
            let line = String::from_utf8_lossy(&line);
            self.accept_line(line.trim_end_matches(['\r', '\n']), &mut payloads);
        }
        payloads
    }

    /// Flushes whatever is buffered once the byte stream ends.
    pub fn finish(&mut self) -> Vec<String> {
        let mut payloads = Vec::new();
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let rest = String::from_utf8_lossy(&rest);
            self.accept_line(rest.trim_end_matches('\r'), &mut payloads);
        }
        self.accept_line("", &mut payloads);
        payloads
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn accept_line(&mut self, line: &str, payloads: &mut Vec<String>) {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return;
            }
            let payload = self.data_lines.join("\n");
            self.data_lines.clear();
            if payload.trim() == "[DONE]" {
                self.done = true;
            } else if !self.done {
                payloads.push(payload);
            }
            return;
        }
        if let Some(data) = line.strip_prefix("data:") {
            self.data_lines
                .push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
    }
}

struct StreamState<S> {
    bytes: S,
    buffer: SseBuffer,
    queued: VecDeque<Result<StreamDelta>>,
    finished: bool,
}

impl<S> StreamState<S> {
    fn enqueue(&mut self, payloads: Vec<String>) {
        for payload in payloads {
            match parse_stream_payload(&payload) {
                Ok(Some(delta)) => self.queued.push_back(Ok(delta)),
                Ok(None) => {}
                Err(err) => {
                    self.queued.push_back(Err(err));
                    self.finished = true;
                    return;
                }
            }
        }
        if self.buffer.is_done() {
            self.finished = true;
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        let response = self.send(&request, false).await?;
        let payload = response
            .json::<CompletionResponse>()
            .await
            .context("invalid model endpoint response payload")?;
        payload
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content.unwrap_or_default())
            .ok_or_else(|| anyhow!("model endpoint returned no choices"))
    }

    async fn stream(&self, request: ChatRequest) -> Result<DeltaStream> {
        let response = self.send(&request, true).await?;
        let state = StreamState {
            bytes: Box::pin(response.bytes_stream()),
            buffer: SseBuffer::default(),
            queued: VecDeque::new(),
            finished: false,
        };

        let stream = futures_util::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(item) = state.queued.pop_front() {
                    return Some((item, state));
                }
                if state.finished {
                    return None;
                }
                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        let payloads = state.buffer.push(&chunk);
                        state.enqueue(payloads);
                    }
                    Some(Err(err)) => {
                        state.finished = true;
                        state
                            .queued
                            .push_back(Err(anyhow!(err).context("model stream interrupted")));
                    }
                    None => {
                        let payloads = state.buffer.finish();
                        state.enqueue(payloads);
                        state.finished = true;
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
