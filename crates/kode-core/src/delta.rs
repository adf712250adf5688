//! Reassembly of streamed deltas into a complete assistant response.

use std::collections::BTreeMap;

use crate::message::{StreamChunk, ToolCall, Usage};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialToolCall {
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

impl PartialToolCall {
    /// The call id, or a stable placeholder derived from the stream index.
    pub fn id_or(&self, index: usize) -> String {
        self.id.clone().unwrap_or_else(|| format!("call_{}", index))
    }
}

/// Merges [`StreamChunk`]s in arrival order.
///
/// Text is concatenated; tool-call fragments are merged by index, keeping the
/// first id and name seen for each index and concatenating argument text.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    content: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    usage: Option<Usage>,
    model: Option<String>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one chunk. Returns the index of the tool call it touched, if any.
    pub fn apply(&mut self, chunk: &StreamChunk) -> Option<usize> {
        match chunk {
            StreamChunk::Start { model } => {
                if self.model.is_none() && !model.is_empty() {
                    self.model = Some(model.clone());
                }
                None
            }
            StreamChunk::Delta { content } => {
                self.content.push_str(content);
                None
            }
            StreamChunk::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            } => {
                let call = self.tool_calls.entry(*index).or_default();
                if call.id.is_none() {
                    call.id = id.clone().filter(|s| !s.is_empty());
                }
                if call.name.is_none() {
                    call.name = name.clone().filter(|s| !s.is_empty());
                }
                call.arguments.push_str(arguments);
                Some(*index)
            }
            StreamChunk::Done { usage } => {
                if usage.is_some() {
                    self.usage = usage.clone();
                }
                None
            }
            StreamChunk::Error { .. } => None,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn tool_call(&self, index: usize) -> Option<&PartialToolCall> {
        self.tool_calls.get(&index)
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    /// Completed tool calls in index order.
    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.tool_calls
            .iter()
            .map(|(index, call)| {
                ToolCall::new(
                    call.id_or(*index),
                    call.name.clone().unwrap_or_default(),
                    call.arguments.clone(),
                )
            })
            .collect()
    }
}
