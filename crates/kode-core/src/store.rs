//! Conversation store: the single owner of the message list and session state.
//!
//! Mutations go through the pure operations in [`crate::ops`]; each one
//! replaces the current snapshot and publishes a [`StoreEvent`] on an ordered
//! broadcast channel that presentation layers subscribe to.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::block::{Block, DiffBlock, MemoryBlock, Message, TextSource};
use crate::error::Error;
use crate::ops::{self, ToolBlockUpdate};

/// Maximum number of entries kept in the input history.
pub const INPUT_HISTORY_LIMIT: usize = 100;

const EVENT_CAPACITY: usize = 1024;

/// Immutable view of the message list at one point in time.
pub type Snapshot = Arc<Vec<Message>>;

/// State-change notifications, delivered in mutation order.
///
/// Message events carry the full snapshot, so a subscriber that lags behind
/// only needs the most recent one.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Messages(Snapshot),
    TokensChanged(u64),
    InputHistoryChanged(Vec<String>),
    SessionReset { session_id: Uuid },
}

/// Serializable session state handed to and from persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub messages: Vec<Message>,
    pub total_tokens: u64,
}

/// Receives the session when an engine shuts down.
pub trait SessionPersister: Send + Sync {
    fn persist(&self, session: &SessionSnapshot) -> Result<(), Error>;
}

struct StoreState {
    session_id: Uuid,
    messages: Snapshot,
    total_tokens: u64,
    input_history: Vec<String>,
}

pub struct ConversationStore {
    state: Mutex<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(StoreState {
                session_id: Uuid::new_v4(),
                messages: Arc::new(Vec::new()),
                total_tokens: 0,
                input_history: Vec::new(),
            }),
            events,
        }
    }

    /// Subscribe to state changes from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // A panic while holding the lock cannot leave a half-applied snapshot,
        // since snapshots are replaced wholesale.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: StoreEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.events.send(event);
    }

    pub fn messages(&self) -> Snapshot {
        Arc::clone(&self.lock().messages)
    }

    pub fn session_id(&self) -> Uuid {
        self.lock().session_id
    }

    pub fn total_tokens(&self) -> u64 {
        self.lock().total_tokens
    }

    pub fn input_history(&self) -> Vec<String> {
        self.lock().input_history.clone()
    }

    /// Apply a pure operation to the current messages and publish the result.
    pub fn apply<F>(&self, op: F) -> Snapshot
    where
        F: FnOnce(&[Message]) -> Vec<Message>,
    {
        let mut state = self.lock();
        let next = Arc::new(op(&state.messages));
        state.messages = Arc::clone(&next);
        // Published under the lock so events keep mutation order.
        self.publish(StoreEvent::Messages(Arc::clone(&next)));
        next
    }

    pub fn add_user_message(&self, content: &str, images: &[PathBuf]) -> Snapshot {
        self.apply(|m| ops::add_user_message(m, content, images, None))
    }

    pub fn add_hook_message(&self, content: &str) -> Snapshot {
        self.apply(|m| ops::add_user_message(m, content, &[], Some(TextSource::Hook)))
    }

    pub fn add_assistant_message(&self) -> Snapshot {
        self.apply(ops::add_assistant_message)
    }

    pub fn update_answer_text(&self, content: &str) -> Snapshot {
        self.apply(|m| ops::update_answer_text(m, content))
    }

    pub fn upsert_tool_block(
        &self,
        id: &str,
        name: &str,
        parameters: &str,
        compact_params: Option<String>,
    ) -> Snapshot {
        self.apply(|m| ops::upsert_tool_block(m, id, name, parameters, compact_params))
    }

    pub fn rename_tool_block(&self, from: &str, to: &str) -> Snapshot {
        self.apply(|m| ops::rename_tool_block(m, from, to))
    }

    pub fn update_tool_block(&self, id: &str, update: ToolBlockUpdate) -> Snapshot {
        self.apply(|m| ops::update_tool_block(m, id, update))
    }

    pub fn add_diff_block(&self, diff: DiffBlock) -> Snapshot {
        self.apply(|m| ops::add_diff_block(m, diff))
    }

    pub fn add_error_block(&self, content: &str) -> Snapshot {
        self.apply(|m| ops::add_error_block(m, content))
    }

    pub fn add_compress_block(&self, insert_index: usize, content: &str) -> Snapshot {
        self.apply(|m| ops::add_compress_block(m, insert_index, content))
    }

    pub fn add_memory_block(&self, memory: MemoryBlock) -> Snapshot {
        self.apply(|m| ops::add_memory_block(m, memory))
    }

    pub fn add_command_output_message(&self, command: &str) -> Snapshot {
        self.apply(|m| ops::add_command_output_message(m, command))
    }

    pub fn update_command_output(&self, command: &str, output: &str) -> Snapshot {
        self.apply(|m| ops::update_command_output(m, command, output))
    }

    pub fn complete_command_output(&self, command: &str, exit_code: i32) -> Snapshot {
        self.apply(|m| ops::complete_command_output(m, command, exit_code))
    }

    /// Replace the cumulative token count with the latest comprehensive total.
    pub fn set_total_tokens(&self, total: u64) {
        let mut state = self.lock();
        state.total_tokens = total;
        self.publish(StoreEvent::TokensChanged(total));
    }

    /// Record an input unless it repeats the previous entry.
    pub fn add_to_input_history(&self, input: &str) {
        let mut state = self.lock();
        let next = push_input_history(&state.input_history, input);
        if next != state.input_history {
            state.input_history = next;
            self.publish(StoreEvent::InputHistoryChanged(state.input_history.clone()));
        }
    }

    /// Start a new session identity; messages are kept.
    pub fn reset_session(&self) {
        let mut state = self.lock();
        Self::reset_locked(&mut state);
        self.publish(StoreEvent::SessionReset {
            session_id: state.session_id,
        });
        self.publish(StoreEvent::TokensChanged(0));
    }

    fn reset_locked(state: &mut StoreState) {
        state.session_id = Uuid::new_v4();
        state.total_tokens = 0;
        state.input_history.clear();
    }

    pub fn clear_messages(&self) {
        let mut state = self.lock();
        state.messages = Arc::new(Vec::new());
        Self::reset_locked(&mut state);
        self.publish(StoreEvent::Messages(Arc::clone(&state.messages)));
        self.publish(StoreEvent::SessionReset {
            session_id: state.session_id,
        });
        self.publish(StoreEvent::TokensChanged(0));
    }

    /// Bulk-load a persisted session and rebuild input history from it.
    pub fn initialize_from_session(&self, session: SessionSnapshot) {
        let mut state = self.lock();
        state.input_history = derive_input_history(&session.messages);
        state.session_id = session.id;
        state.total_tokens = session.total_tokens;
        state.messages = Arc::new(session.messages);

        self.publish(StoreEvent::SessionReset {
            session_id: state.session_id,
        });
        self.publish(StoreEvent::Messages(Arc::clone(&state.messages)));
        self.publish(StoreEvent::TokensChanged(state.total_tokens));
        self.publish(StoreEvent::InputHistoryChanged(state.input_history.clone()));
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock();
        SessionSnapshot {
            id: state.session_id,
            messages: state.messages.as_ref().clone(),
            total_tokens: state.total_tokens,
        }
    }
}

/// Append `input` unless it equals the last entry, keeping the newest 100.
pub fn push_input_history(history: &[String], input: &str) -> Vec<String> {
    let mut next = history.to_vec();
    if next.last().map(String::as_str) != Some(input) {
        next.push(input.to_string());
    }
    if next.len() > INPUT_HISTORY_LIMIT {
        next.drain(..next.len() - INPUT_HISTORY_LIMIT);
    }
    next
}

/// Input history implied by the user-typed text of a conversation.
pub fn derive_input_history(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.is_user())
        .flat_map(|m| m.blocks.iter())
        .filter_map(|b| match b {
            Block::Text(text) if !text.is_hook() && !text.content.is_empty() => {
                Some(text.content.as_str())
            }
            _ => None,
        })
        .fold(Vec::new(), |history, input| push_input_history(&history, input))
}
