//! kode-core: Core types and traits for kode
//!
//! This crate holds the conversation model shared by the rest of the
//! workspace: the block-based message store, the pure operations that mutate
//! it, the projection into wire messages, and the provider and tool traits the
//! agent loop is written against.

pub mod block;
pub mod compaction;
pub mod delta;
pub mod error;
pub mod message;
pub mod ops;
pub mod partial_json;
pub mod projection;
pub mod provider;
pub mod store;
pub mod tool;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use block::{
    Block, CommandOutputBlock, CompressBlock, DiffBlock, DiffLine, ErrorBlock, ImageBlock,
    MemoryBlock, MemoryType, Message, MessageRole, TextBlock, TextSource, ToolBlock, ToolImage,
};
pub use compaction::ContextCompressor;
pub use delta::{DeltaAccumulator, PartialToolCall};
pub use error::Error;
pub use message::{ChatMessage, Content, ContentPart, Role, StreamChunk, ToolCall, Usage};
pub use ops::ToolBlockUpdate;
pub use projection::to_chat_messages;
pub use provider::{CompletionRequest, CompletionResponse, FinishReason, Provider, StreamResult};
pub use store::{ConversationStore, SessionPersister, SessionSnapshot, Snapshot, StoreEvent};
pub use tool::{
    FileDiff, PropertySchema, Tool, ToolDefinition, ToolExecutionBridge, ToolOutput,
    ToolParameters, ToolRegistry,
};

pub type Result<T> = std::result::Result<T, Error>;
