use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use kode_core::{
    ChatMessage, CompletionRequest, CompletionResponse, Content, ContentPart, Error, FinishReason,
    Provider, StreamChunk, StreamResult, ToolCall, ToolDefinition, Usage,
};

use crate::retry::{backoff, RetryPolicy};
use crate::sse::{SseDecoder, SseLine};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Client for OpenAI-compatible `/chat/completions` endpoints.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: Option<String>,
    retry: RetryPolicy,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        // Configure client for proper SSE streaming:
        // - Use HTTP/1.1 to avoid HTTP/2 framing issues
        // - Disable automatic decompression which can buffer entire response
        let client = Client::builder()
            .http1_only()
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: None,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_request(&self, request: &CompletionRequest) -> OpenAIChatRequest {
        // Model priority: request > provider default
        // If neither is set, don't send model field (let API use its default)
        let model = request
            .model
            .clone()
            .or_else(|| self.default_model.clone());

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(self.convert_message(&ChatMessage::system(system.as_str())));
        }
        messages.extend(request.messages.iter().map(|m| self.convert_message(m)));

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(request.tools.iter().map(|t| self.convert_tool(t)).collect())
        };

        OpenAIChatRequest {
            model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: Some(request.stream),
            tools,
            stream_options: if request.stream {
                Some(StreamOptions {
                    include_usage: true,
                })
            } else {
                None
            },
            extra: request.extra.clone(),
        }
    }

    fn convert_message(&self, message: &ChatMessage) -> OpenAIMessage {
        let content = match &message.content {
            Content::Text(s) if s.is_empty() && !message.tool_calls.is_empty() => None,
            Content::Text(s) => Some(Value::String(s.clone())),
            Content::Parts(parts) => Some(Value::Array(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text { text } => json!({"type": "text", "text": text}),
                        ContentPart::ImageUrl { url } => {
                            json!({"type": "image_url", "image_url": {"url": url}})
                        }
                    })
                    .collect(),
            )),
        };

        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                message
                    .tool_calls
                    .iter()
                    .map(|tc| OpenAIToolCall {
                        id: tc.id.clone(),
                        r#type: "function".to_string(),
                        function: OpenAIFunctionCall {
                            name: tc.name.clone(),
                            arguments: tc.arguments.clone(),
                        },
                    })
                    .collect(),
            )
        };

        OpenAIMessage {
            role: message.role.to_string(),
            content,
            name: message.name.clone(),
            tool_calls,
            tool_call_id: message.tool_call_id.clone(),
        }
    }

    fn convert_tool(&self, tool: &ToolDefinition) -> OpenAITool {
        OpenAITool {
            r#type: "function".to_string(),
            function: OpenAIFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: serde_json::to_value(&tool.parameters).unwrap_or_default(),
            },
        }
    }

    fn parse_response(&self, response: OpenAIChatResponse) -> Result<CompletionResponse, Error> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::protocol("No choices in response"))?;

        let tool_calls: Vec<ToolCall> = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ToolCall::new(tc.id, tc.function.name, tc.function.arguments))
            .collect();

        let content = choice
            .message
            .content
            .as_ref()
            .map(content_text)
            .unwrap_or_default();

        let message = if tool_calls.is_empty() {
            ChatMessage::assistant(content)
        } else {
            ChatMessage::assistant_with_tool_calls(content, tool_calls)
        };

        Ok(CompletionResponse {
            message,
            usage: response.usage.map(OpenAIUsage::into_usage).unwrap_or_default(),
            model: response.model.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map(FinishReason::parse)
                .unwrap_or(FinishReason::Stop),
        })
    }

    /// POST the request, retrying only rate-limited (429) responses.
    async fn send_with_retry(
        &self,
        body: &OpenAIChatRequest,
        cancel: &CancellationToken,
    ) -> Result<Response, Error> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut attempt = 0u32;

        loop {
            let mut builder = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json");
            if body.stream == Some(true) {
                builder = builder
                    .header("Accept", "text/event-stream")
                    .header("Accept-Encoding", "identity")
                    .header("Cache-Control", "no-cache");
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                sent = builder.json(body).send() => sent.map_err(|e| Error::network(e.to_string()))?,
            };

            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            let error_text = response.text().await.unwrap_or_default();
            let error = self.parse_error(status.as_u16(), &error_text);
            if error.is_retryable() && attempt < self.retry.max_retries {
                attempt += 1;
                let delay = self.retry.delay_for(attempt);
                warn!(
                    attempt,
                    max_retries = self.retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, retrying"
                );
                backoff(delay, cancel).await?;
                continue;
            }
            return Err(error);
        }
    }

    fn parse_error(&self, status: u16, body: &str) -> Error {
        #[derive(Deserialize)]
        struct ErrorResponse {
            error: ErrorDetail,
        }

        #[derive(Deserialize)]
        struct ErrorDetail {
            message: String,
        }

        let message = serde_json::from_str::<ErrorResponse>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());

        match status {
            401 | 403 => Error::auth(message),
            429 => Error::rate_limit(message),
            400 => Error::invalid_request(message),
            _ => Error::api(status, message),
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, Error> {
        let mut req = request;
        req.stream = false;

        let api_request = self.build_request(&req);
        debug!(model = ?api_request.model, messages = api_request.messages.len(), "OpenAI request");

        let response = self.send_with_retry(&api_request, &cancel).await?;
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            body = response.text() => body.map_err(|e| Error::network(e.to_string()))?,
        };
        let api_response: OpenAIChatResponse = serde_json::from_str(&body)?;

        self.parse_response(api_response)
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<StreamResult, Error> {
        let mut req = request;
        req.stream = true;

        let api_request = self.build_request(&req);
        debug!(model = ?api_request.model, messages = api_request.messages.len(), "OpenAI stream request");

        let response = self.send_with_retry(&api_request, &cancel).await?;
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, Error>>(100);

        tokio::spawn(read_event_stream(response, tx, cancel));

        let stream = ReceiverStream::new(rx);
        Ok(Box::pin(stream) as StreamResult)
    }
}

/// Text of a response `content` field, which may be a string or a part array.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Tracks what the stream has produced so far.
#[derive(Default)]
struct StreamState {
    started: bool,
    usage: Option<Usage>,
    malformed: usize,
    first_malformed: Option<String>,
}

/// Pump the response body into `tx` until `[DONE]`, end of body or cancellation.
///
/// Malformed payloads do not stop the stream; they are reported as a single
/// protocol error in place of the final `Done`.
async fn read_event_stream(
    mut response: Response,
    tx: mpsc::Sender<Result<StreamChunk, Error>>,
    cancel: CancellationToken,
) {
    let mut decoder = SseDecoder::new();
    let mut state = StreamState::default();
    let mut byte_count = 0usize;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(byte_count, "SSE: cancelled");
                return;
            }
            chunk = response.chunk() => chunk,
        };

        let bytes = match chunk {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(Error::network(e.to_string()))).await;
                return;
            }
        };
        byte_count += bytes.len();

        for line in decoder.feed(&bytes) {
            if !forward_line(line, &mut state, &tx).await {
                return;
            }
        }
        if decoder.is_done() {
            break;
        }
    }

    if let Some(line) = decoder.finish() {
        if !forward_line(line, &mut state, &tx).await {
            return;
        }
    }
    debug!(byte_count, malformed = state.malformed, "SSE: stream ended");

    let last = if state.malformed > 0 {
        Err(Error::protocol(format!(
            "{} malformed stream event(s); first: {}",
            state.malformed,
            state.first_malformed.unwrap_or_default()
        )))
    } else {
        Ok(StreamChunk::Done { usage: state.usage })
    };
    let _ = tx.send(last).await;
}

/// Returns false once the receiver is gone.
async fn forward_line(
    line: SseLine,
    state: &mut StreamState,
    tx: &mpsc::Sender<Result<StreamChunk, Error>>,
) -> bool {
    let data = match line {
        SseLine::Done => return true,
        SseLine::Data(data) => data,
    };

    let event = match serde_json::from_str::<OpenAIStreamResponse>(&data) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "Malformed SSE payload");
            state.malformed += 1;
            if state.first_malformed.is_none() {
                state.first_malformed = Some(format!("{} in {:?}", e, data));
            }
            return true;
        }
    };

    let mut chunks = Vec::new();
    if !state.started {
        state.started = true;
        chunks.push(StreamChunk::Start {
            model: event.model.clone().unwrap_or_default(),
        });
    }
    if let Some(usage) = event.usage {
        state.usage = Some(usage.into_usage());
    }

    if let Some(choice) = event.choices.into_iter().next() {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                chunks.push(StreamChunk::Delta { content });
            }
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let (name, arguments) = match tc.function {
                Some(f) => (f.name, f.arguments.unwrap_or_default()),
                None => (None, String::new()),
            };
            chunks.push(StreamChunk::ToolCallDelta {
                index: tc.index,
                id: tc.id,
                name,
                arguments,
            });
        }
    }

    for chunk in chunks {
        if tx.send(Ok(chunk)).await.is_err() {
            return false;
        }
    }
    true
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    /// Model to use. Optional for servers that have a default model.
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(flatten)]
    extra: std::collections::HashMap<String, Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    /// A string, or an array of typed content parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OpenAIFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    r#type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    /// Anthropic-style cache accounting reported by some compatible gateways.
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

impl OpenAIUsage {
    fn into_usage(self) -> Usage {
        let cache_read = self
            .cache_read_input_tokens
            .or_else(|| self.prompt_tokens_details.as_ref().map(|d| d.cached_tokens))
            .unwrap_or(0);
        Usage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
            cache_read_tokens: cache_read,
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    #[serde(default)]
    delta: OpenAIStreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIStreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAIStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamToolCall {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<OpenAIStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}
