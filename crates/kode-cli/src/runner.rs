//! Agent runner: the generate / dispatch tools / regenerate loop.
//!
//! The runner holds no conversation state of its own. Every visible effect is
//! a mutation of the shared [`ConversationStore`]; the runner only tracks the
//! phase of the active turn and the two cancellation handles for it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kode_core::partial_json::{compact_params, extract};
use kode_core::projection::last_compression_index;
use kode_core::{
    to_chat_messages, Block, CompletionRequest, ContextCompressor, ConversationStore,
    DeltaAccumulator, Error, MemoryBlock, MemoryType, Provider, SessionPersister, StreamChunk,
    ToolBlockUpdate, ToolCall, ToolExecutionBridge, Usage,
};
use kode_tools::{MemoryStore, ShellCommandRunner};

/// Token limit used when neither the environment nor the config sets one.
pub const DEFAULT_TOKEN_LIMIT: u64 = 64_000;

/// Environment variable overriding the token limit, read once per turn.
pub const TOKEN_LIMIT_ENV: &str = "KODE_TOKEN_LIMIT";

/// Error recorded on tool blocks that were never dispatched.
const CANCELLED: &str = "cancelled";

/// Configuration for the AgentRunner.
pub struct RunnerConfig {
    /// Model to use for completions.
    pub model: Option<String>,

    /// Temperature for generation.
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// Extra parameters to pass to the API.
    pub extra_params: HashMap<String, Value>,

    /// Sent as the leading system message of every request.
    pub system_prompt: Option<String>,

    /// Use the streaming endpoint.
    pub stream: bool,

    /// Token limit from the config file. The environment takes precedence.
    pub token_limit: Option<u64>,

    /// Messages left untouched by history compression.
    pub keep_recent: usize,

    /// Maximum model calls in one chain of tool calls.
    pub max_iterations: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: None,
            max_tokens: None,
            extra_params: HashMap::new(),
            system_prompt: None,
            stream: true,
            token_limit: None,
            keep_recent: 7,
            max_iterations: 100,
        }
    }
}

/// What `send_message` did with an input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Nothing to send.
    Ignored,
    /// A `#` memory directive. Nothing was recorded; the caller picks a
    /// memory type and calls [`AgentRunner::save_memory`].
    MemoryPending(String),
    /// A `!` shell directive ran without involving the model.
    Shell { exit_code: i32 },
    /// A model turn ran to completion, error or cancellation.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Generating,
    Dispatching,
}

#[derive(Clone)]
struct TurnHandles {
    model: CancellationToken,
    tools: CancellationToken,
}

impl TurnHandles {
    fn new() -> Self {
        Self {
            model: CancellationToken::new(),
            tools: CancellationToken::new(),
        }
    }

    fn any_cancelled(&self) -> bool {
        self.model.is_cancelled() || self.tools.is_cancelled()
    }
}

/// Execution context for one model call and the tool calls it returns.
struct TurnContext {
    turn: u64,
    depth: u32,
    handles: TurnHandles,
}

struct RunnerState {
    phase: Phase,
    turn: u64,
    aborted: bool,
    handles: Option<TurnHandles>,
}

/// Returns the runner to idle when a turn ends, unless a newer turn took over.
struct TurnGuard<'a> {
    state: &'a Mutex<RunnerState>,
    turn: u64,
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.turn == self.turn {
            state.phase = Phase::Idle;
            state.handles = None;
        }
    }
}

pub struct AgentRunner {
    store: Arc<ConversationStore>,
    provider: Arc<dyn Provider>,
    bridge: Arc<dyn ToolExecutionBridge>,
    compressor: Arc<dyn ContextCompressor>,
    shell: ShellCommandRunner,
    memory: MemoryStore,
    config: RunnerConfig,
    state: Mutex<RunnerState>,
}

impl AgentRunner {
    pub fn new(
        store: Arc<ConversationStore>,
        provider: Arc<dyn Provider>,
        bridge: Arc<dyn ToolExecutionBridge>,
        compressor: Arc<dyn ContextCompressor>,
        config: RunnerConfig,
    ) -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            shell: ShellCommandRunner::new(store.clone()),
            memory: MemoryStore::for_project(&cwd),
            store,
            provider,
            bridge,
            compressor,
            config,
            state: Mutex::new(RunnerState {
                phase: Phase::Idle,
                turn: 0,
                aborted: false,
                handles: None,
            }),
        }
    }

    pub fn with_memory_store(mut self, memory: MemoryStore) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shell = ShellCommandRunner::new(self.store.clone()).with_working_dir(dir);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.bridge.definitions().into_iter().map(|d| d.name).collect()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase() != Phase::Idle
    }

    /// Handle one user input.
    ///
    /// A single-line `#` input is a memory directive and a single-line `!`
    /// input a shell directive; anything else starts a model turn. Fails with
    /// [`Error::Busy`] while another turn (or shell command) is active.
    pub async fn send_message(
        &self,
        content: &str,
        images: &[PathBuf],
    ) -> Result<SendOutcome, Error> {
        let trimmed = content.trim();
        if trimmed.is_empty() && images.is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let single_line = !trimmed.contains('\n');
        if single_line && trimmed.starts_with('#') {
            return Ok(SendOutcome::MemoryPending(trimmed.to_string()));
        }

        if single_line && trimmed.starts_with('!') {
            self.store.add_to_input_history(content);
            let command = trimmed.strip_prefix('!').unwrap_or(trimmed).trim();
            let exit_code = self.shell.execute(command).await?;
            return Ok(SendOutcome::Shell { exit_code });
        }

        let turn = {
            let mut state = self.lock();
            if state.phase != Phase::Idle {
                return Err(Error::Busy);
            }
            state.turn += 1;
            state.phase = Phase::Generating;
            state.aborted = false;
            state.turn
        };
        let _guard = TurnGuard {
            state: &self.state,
            turn,
        };

        if !trimmed.is_empty() {
            self.store.add_to_input_history(trimmed);
        }
        self.store.add_user_message(trimmed, images);

        self.run_agent_turn(turn).await;
        Ok(SendOutcome::Completed)
    }

    /// Cancel the model call and tool dispatch of the active turn.
    pub fn abort_ai_message(&self) {
        let mut state = self.lock();
        state.aborted = true;
        state.phase = Phase::Idle;
        if let Some(handles) = state.handles.take() {
            handles.model.cancel();
            handles.tools.cancel();
        }
        info!(turn = state.turn, "Turn aborted");
    }

    /// Cancel the active turn and kill any running shell command.
    pub fn abort_message(&self) {
        self.abort_ai_message();
        self.shell.abort();
    }

    /// Persist a memory note chosen after a `#` directive and record the outcome.
    pub fn save_memory(&self, content: &str, memory_type: MemoryType) -> MemoryBlock {
        let note = content.trim().trim_start_matches('#').trim().to_string();
        let block = match self.memory.append(content, memory_type) {
            Ok(path) => MemoryBlock {
                content: note,
                is_success: true,
                memory_type,
                storage_path: path,
            },
            Err(e) => {
                warn!(error = %e, memory_type = %memory_type, "Failed to save memory");
                MemoryBlock {
                    content: note,
                    is_success: false,
                    memory_type,
                    storage_path: self.memory.path_for(memory_type).to_path_buf(),
                }
            }
        };
        self.store.add_memory_block(block.clone());
        block
    }

    /// Stop all work and hand the session to `persister`.
    pub fn shutdown(&self, persister: &dyn SessionPersister) -> Result<(), Error> {
        self.abort_message();
        let session = self.store.snapshot();
        info!(session_id = %session.id, messages = session.messages.len(), "Persisting session");
        persister.persist(&session)
    }

    /// Token limit for this turn: environment, then config, then the default.
    fn token_limit(&self) -> u64 {
        std::env::var(TOKEN_LIMIT_ENV)
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .or(self.config.token_limit)
            .unwrap_or(DEFAULT_TOKEN_LIMIT)
    }

    /// Allocate fresh handles for the next model call, unless the turn was
    /// aborted or superseded.
    fn begin_iteration(&self, turn: u64, depth: u32) -> Option<TurnContext> {
        let mut state = self.lock();
        if state.turn != turn || state.aborted {
            return None;
        }
        let handles = TurnHandles::new();
        state.handles = Some(handles.clone());
        state.phase = Phase::Generating;
        Some(TurnContext {
            turn,
            depth,
            handles,
        })
    }

    fn set_phase(&self, ctx: &TurnContext, phase: Phase) {
        let mut state = self.lock();
        if state.turn == ctx.turn && !state.aborted {
            state.phase = phase;
        }
    }

    /// Clear the handles of a finished iteration. False if the chain should stop.
    fn end_iteration(&self, ctx: &TurnContext) -> bool {
        let mut state = self.lock();
        if state.turn != ctx.turn {
            return false;
        }
        state.handles = None;
        !state.aborted && !ctx.handles.any_cancelled()
    }

    async fn run_agent_turn(&self, turn: u64) {
        let mut depth = 0;
        loop {
            if depth >= self.config.max_iterations {
                warn!(max_iterations = self.config.max_iterations, "Max iterations reached");
                self.store.add_error_block(&format!(
                    "Stopped after {} model calls without a final answer",
                    self.config.max_iterations
                ));
                return;
            }

            let Some(ctx) = self.begin_iteration(turn, depth) else {
                debug!(turn, depth, "Turn stopped before model call");
                return;
            };

            let processed = self.run_iteration(&ctx).await;
            if processed == 0 || !self.end_iteration(&ctx) {
                debug!(turn, depth, processed, "Turn finished");
                return;
            }
            depth += 1;
        }
    }

    /// One model call plus the tool calls it returned. Returns the number of
    /// tool calls that were dispatched.
    async fn run_iteration(&self, ctx: &TurnContext) -> usize {
        let request = self.build_request();
        self.store.add_assistant_message();
        debug!(
            depth = ctx.depth,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "Requesting completion"
        );

        let result = if self.config.stream {
            self.stream_response(request, ctx).await
        } else {
            self.complete_response(request, ctx).await
        };

        let calls = match result {
            Ok(calls) => calls,
            Err(e) if e.is_cancelled() || ctx.handles.model.is_cancelled() => {
                debug!("Model call cancelled");
                self.settle_running_tools(CANCELLED);
                return 0;
            }
            Err(e) => {
                warn!(error = %e, "Model call failed");
                self.settle_running_tools(&e.to_string());
                self.store.add_error_block(&e.to_string());
                return 0;
            }
        };

        if calls.is_empty() {
            return 0;
        }

        self.set_phase(ctx, Phase::Dispatching);
        self.dispatch_tool_calls(&calls, ctx).await
    }

    fn build_request(&self) -> CompletionRequest {
        let messages = to_chat_messages(&self.store.messages());
        let mut request = CompletionRequest::new(messages).with_stream(self.config.stream);

        if let Some(ref system) = self.config.system_prompt {
            request = request.with_system(system);
        }

        if let Some(ref m) = self.config.model {
            request = request.with_model(m);
        }

        if let Some(temp) = self.config.temperature {
            request = request.with_temperature(temp);
        }

        if let Some(max_tokens) = self.config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }

        if !self.config.extra_params.is_empty() {
            request = request.with_extra(self.config.extra_params.clone());
        }

        let tools = self.bridge.definitions();
        if !tools.is_empty() {
            request = request.with_tools(tools);
        }

        request
    }

    async fn stream_response(
        &self,
        request: CompletionRequest,
        ctx: &TurnContext,
    ) -> Result<Vec<ToolCall>, Error> {
        let cancel = &ctx.handles.model;
        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.provider.stream(request, cancel.clone()) => result?,
        };

        let mut acc = DeltaAccumulator::new();
        let mut previewed: HashMap<usize, String> = HashMap::new();
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            let touched = acc.apply(&chunk);
            match &chunk {
                StreamChunk::Delta { .. } => {
                    self.store.update_answer_text(acc.content());
                }
                StreamChunk::ToolCallDelta { .. } => {
                    if let Some(index) = touched {
                        self.preview_tool_call(&acc, index, &mut previewed);
                    }
                }
                StreamChunk::Done { usage: Some(usage) } => {
                    self.record_usage(usage, ctx).await;
                }
                StreamChunk::Error { message } => {
                    return Err(Error::stream(message.clone()));
                }
                _ => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(acc.tool_calls())
    }

    async fn complete_response(
        &self,
        request: CompletionRequest,
        ctx: &TurnContext,
    ) -> Result<Vec<ToolCall>, Error> {
        let cancel = &ctx.handles.model;
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.provider.complete(request, cancel.clone()) => result?,
        };

        let text = response.message.content.to_string_lossy();
        if !text.is_empty() {
            self.store.update_answer_text(&text);
        }
        for call in &response.message.tool_calls {
            self.store.upsert_tool_block(
                &call.id,
                &call.name,
                &call.arguments,
                compact_params(&extract(&call.arguments)),
            );
        }
        if response.usage.comprehensive_total() > 0 {
            self.record_usage(&response.usage, ctx).await;
        }

        Ok(response.message.tool_calls)
    }

    /// Show a tool call while its arguments are still streaming.
    ///
    /// `previewed` maps stream index to the block id shown so far, so a block
    /// opened under a placeholder id is re-keyed once the real id arrives.
    fn preview_tool_call(
        &self,
        acc: &DeltaAccumulator,
        index: usize,
        previewed: &mut HashMap<usize, String>,
    ) {
        let Some(call) = acc.tool_call(index) else {
            return;
        };
        let id = call.id_or(index);
        if let Some(shown) = previewed.insert(index, id.clone()) {
            if shown != id {
                self.store.rename_tool_block(&shown, &id);
            }
        }
        let preview = compact_params(&extract(&call.arguments));
        self.store.upsert_tool_block(
            &id,
            call.name.as_deref().unwrap_or_default(),
            &call.arguments,
            preview,
        );
    }

    async fn record_usage(&self, usage: &Usage, ctx: &TurnContext) {
        let total = usage.comprehensive_total();
        self.store.set_total_tokens(total);

        let limit = self.token_limit();
        if total <= limit {
            return;
        }

        info!(total, limit, "Token limit exceeded, compressing history");
        if let Err(e) = self.compress_history(&ctx.handles.model).await {
            if !e.is_cancelled() {
                warn!(error = %e, "History compression failed");
            }
        }
    }

    /// Summarize everything before the most recent `keep_recent` messages.
    ///
    /// Compressed messages stay in the store; the summary is inserted where
    /// the retained messages begin and later requests start from it.
    async fn compress_history(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let messages = self.store.messages();
        let boundary = messages.len().saturating_sub(self.config.keep_recent);
        let window_start = last_compression_index(&messages).unwrap_or(0);

        let has_content = messages
            .get(window_start..boundary)
            .is_some_and(|prefix| prefix.iter().any(|m| !m.is_compression()));
        if !has_content {
            debug!(boundary, "Nothing to compress");
            return Ok(());
        }

        let prefix = to_chat_messages(&messages[..boundary]);
        let summary = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.compressor.compress(&prefix, cancel.clone()) => result?,
        };

        self.store.add_compress_block(boundary, &summary);
        info!(
            compressed = boundary - window_start,
            summary_len = summary.len(),
            "History compressed"
        );
        Ok(())
    }

    /// Run tool calls one at a time, in order.
    async fn dispatch_tool_calls(&self, calls: &[ToolCall], ctx: &TurnContext) -> usize {
        let mut processed = 0;

        for (i, call) in calls.iter().enumerate() {
            if ctx.handles.any_cancelled() {
                debug!(remaining = calls.len() - i, "Tool dispatch cancelled");
                for pending in &calls[i..] {
                    self.store
                        .update_tool_block(&pending.id, ToolBlockUpdate::failed(CANCELLED));
                }
                return processed;
            }

            self.store.upsert_tool_block(
                &call.id,
                &call.name,
                &call.arguments,
                compact_params(&extract(&call.arguments)),
            );

            let arguments = match parse_arguments(call) {
                Ok(arguments) => arguments,
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Unparseable tool arguments");
                    self.store
                        .update_tool_block(&call.id, ToolBlockUpdate::failed(e.to_string()));
                    self.store.add_error_block(&format!(
                        "Failed to parse arguments for tool {}: {}",
                        call.name, e
                    ));
                    continue;
                }
            };

            info!(tool = %call.name, id = %call.id, "Executing tool");
            let update = match self
                .bridge
                .execute(&call.name, arguments, ctx.handles.tools.clone())
                .await
            {
                Ok(output) if output.success => {
                    if let Some(diff) = output.diff {
                        self.store.add_diff_block(diff.into_block());
                    }
                    ToolBlockUpdate::succeeded(output.content, output.short_result)
                        .with_images(output.images)
                }
                Ok(output) => {
                    debug!(tool = %call.name, "Tool reported failure");
                    ToolBlockUpdate::failed(output.error.unwrap_or(output.content))
                }
                Err(e) => {
                    debug!(tool = %call.name, error = %e, "Tool execution failed");
                    ToolBlockUpdate::failed(e.to_string())
                }
            };
            self.store.update_tool_block(&call.id, update);
            processed += 1;
        }

        processed
    }

    /// Finalize tool blocks of the current assistant message that are still running.
    fn settle_running_tools(&self, error: &str) {
        let messages = self.store.messages();
        let Some(last) = messages.iter().rev().find(|m| m.is_assistant()) else {
            return;
        };
        let running: Vec<String> = last
            .blocks
            .iter()
            .filter_map(|b| match b {
                Block::Tool(t) if t.is_running => Some(t.id.clone()),
                _ => None,
            })
            .collect();
        for id in running {
            self.store.update_tool_block(&id, ToolBlockUpdate::failed(error));
        }
    }
}

/// Strictly parse a tool call's complete argument text. Empty text is `{}`.
fn parse_arguments(call: &ToolCall) -> Result<Map<String, Value>, Error> {
    if call.arguments.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&call.arguments) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::invalid_arguments(
            &call.name,
            "arguments must be a JSON object",
        )),
        Err(e) => Err(Error::invalid_arguments(&call.name, e.to_string())),
    }
}
