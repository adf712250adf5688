//! Test utilities shared across the workspace.
//! Only compiled when running tests or with the `testing` feature.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::compaction::ContextCompressor;
use crate::error::Error;
use crate::message::{ChatMessage, StreamChunk, ToolCall, Usage};
use crate::provider::{CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult};

enum ScriptedStream {
    Chunks {
        items: Vec<Result<StreamChunk, Error>>,
        hang: bool,
    },
    Fail(Error),
}

/// A mock provider that replays pre-configured streams and responses.
///
/// Streams and responses are returned in FIFO order. With nothing queued a
/// stream yields a single `Done` without usage.
pub struct MockProvider {
    streams: Mutex<VecDeque<ScriptedStream>>,
    responses: Mutex<VecDeque<Result<CompletionResponse, Error>>>,
    /// Captured requests (for assertion).
    pub captured_requests: Mutex<Vec<CompletionRequest>>,
    pub name: String,
    pub default_model: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            responses: Mutex::new(VecDeque::new()),
            captured_requests: Mutex::new(Vec::new()),
            name: "mock".to_string(),
            default_model: Some("mock-model".to_string()),
        }
    }

    /// Queue chunks for the next stream() call.
    pub fn queue_stream(&self, chunks: Vec<StreamChunk>) {
        self.queue_stream_results(chunks.into_iter().map(Ok).collect());
    }

    /// Queue raw stream items, including mid-stream errors.
    pub fn queue_stream_results(&self, items: Vec<Result<StreamChunk, Error>>) {
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::Chunks { items, hang: false });
    }

    /// Queue chunks after which the stream stays open until cancelled.
    pub fn queue_hanging_stream(&self, chunks: Vec<StreamChunk>) {
        self.streams.lock().unwrap().push_back(ScriptedStream::Chunks {
            items: chunks.into_iter().map(Ok).collect(),
            hang: true,
        });
    }

    /// Make the next stream() call fail before any chunk is produced.
    pub fn queue_stream_error(&self, error: Error) {
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::Fail(error));
    }

    /// Queue a text response for the next complete() call.
    pub fn queue_response(&self, content: &str) {
        self.queue_raw_response(CompletionResponse {
            message: ChatMessage::assistant(content),
            usage: Usage::new(0, 0),
            model: "mock-model".to_string(),
            finish_reason: FinishReason::Stop,
        });
    }

    pub fn queue_raw_response(&self, response: CompletionResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn queue_response_error(&self, error: Error) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.captured_requests.lock().unwrap().len()
    }

    /// Get the last captured request.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.captured_requests.lock().unwrap().last().cloned()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.captured_requests.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    async fn complete(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<CompletionResponse, Error> {
        self.captured_requests.lock().unwrap().push(request);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.responses.lock().unwrap().pop_front() {
            Some(response) => response,
            None => Err(Error::Unknown("No mock response queued".to_string())),
        }
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<StreamResult, Error> {
        self.captured_requests.lock().unwrap().push(request);
        let script = self.streams.lock().unwrap().pop_front();

        let (items, hang) = match script {
            Some(ScriptedStream::Fail(error)) => return Err(error),
            Some(ScriptedStream::Chunks { items, hang }) => (items, hang),
            None => (vec![Ok(StreamChunk::Done { usage: None })], false),
        };

        let replay = futures::stream::iter(items);
        let stream = if hang {
            replay.chain(futures::stream::pending()).boxed()
        } else {
            replay.boxed()
        };
        Ok(Box::pin(stream.take_until(cancel.cancelled_owned())))
    }
}

/// Chunks for a plain text answer.
pub fn text_chunks(text: &str, usage: Option<Usage>) -> Vec<StreamChunk> {
    vec![
        StreamChunk::Start {
            model: "mock-model".to_string(),
        },
        StreamChunk::Delta {
            content: text.to_string(),
        },
        StreamChunk::Done { usage },
    ]
}

/// Chunks announcing `calls` in order, each with its arguments split in two.
pub fn tool_call_chunks(calls: &[ToolCall], usage: Option<Usage>) -> Vec<StreamChunk> {
    let mut chunks = vec![StreamChunk::Start {
        model: "mock-model".to_string(),
    }];
    for (index, call) in calls.iter().enumerate() {
        let split = call.arguments.len() / 2;
        let split = (0..=split)
            .rev()
            .find(|i| call.arguments.is_char_boundary(*i))
            .unwrap_or(0);
        let (head, tail) = call.arguments.split_at(split);
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            arguments: head.to_string(),
        });
        chunks.push(StreamChunk::ToolCallDelta {
            index,
            id: None,
            name: None,
            arguments: tail.to_string(),
        });
    }
    chunks.push(StreamChunk::Done { usage });
    chunks
}

/// A mock history compressor.
pub struct MockCompressor {
    responses: Mutex<VecDeque<Result<String, Error>>>,
    pub calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl MockCompressor {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a result for the next compress() call (FIFO).
    pub fn queue(&self, response: Result<String, Error>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockCompressor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContextCompressor for MockCompressor {
    async fn compress(
        &self,
        messages: &[ChatMessage],
        _cancel: CancellationToken,
    ) -> Result<String, Error> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(Error::Unknown(
                "No mock summary queued".to_string(),
            )))
    }
}
