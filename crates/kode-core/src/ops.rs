//! Pure conversation mutations.
//!
//! Every operation takes the current message list and returns a new one; the
//! input is never modified. Update operations that cannot find a still-running
//! target return the messages unchanged. Duplicate or late completion
//! notifications are expected when a turn is cancelled, so a miss is not an
//! error.

use std::path::PathBuf;

use crate::block::{
    Block, CommandOutputBlock, CompressBlock, DiffBlock, ErrorBlock, ImageBlock, MemoryBlock,
    Message, MessageRole, TextBlock, TextSource, ToolBlock, ToolImage,
};

/// Field-wise patch for a running [`ToolBlock`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolBlockUpdate {
    pub parameters: Option<String>,
    pub compact_params: Option<String>,
    pub result: Option<String>,
    pub short_result: Option<String>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub images: Option<Vec<ToolImage>>,
    pub is_running: Option<bool>,
}

impl ToolBlockUpdate {
    /// Finalize the block as succeeded.
    pub fn succeeded(result: impl Into<String>, short_result: Option<String>) -> Self {
        Self {
            result: Some(result.into()),
            short_result,
            success: Some(true),
            is_running: Some(false),
            ..Default::default()
        }
    }

    /// Finalize the block as failed.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: Some(false),
            error: Some(error.into()),
            is_running: Some(false),
            ..Default::default()
        }
    }

    pub fn with_images(mut self, images: Vec<ToolImage>) -> Self {
        if !images.is_empty() {
            self.images = Some(images);
        }
        self
    }

    fn apply(self, block: &mut ToolBlock) {
        if let Some(parameters) = self.parameters {
            block.parameters = parameters;
        }
        if let Some(compact) = self.compact_params {
            block.compact_params = Some(compact);
        }
        if let Some(result) = self.result {
            block.result = Some(result);
        }
        if let Some(short) = self.short_result {
            block.short_result = Some(short);
        }
        if let Some(success) = self.success {
            block.success = Some(success);
        }
        if let Some(error) = self.error {
            block.error = Some(error);
        }
        if let Some(images) = self.images {
            block.images = images;
        }
        if let Some(running) = self.is_running {
            block.is_running = running;
        }
    }
}

fn last_index_of(messages: &[Message], role: MessageRole) -> Option<usize> {
    messages.iter().rposition(|m| m.role == role)
}

/// Append a user message. Empty text is omitted; images become one block.
pub fn add_user_message(
    messages: &[Message],
    content: &str,
    images: &[PathBuf],
    source: Option<TextSource>,
) -> Vec<Message> {
    let mut message = Message::new(MessageRole::User);
    if !content.is_empty() {
        message.blocks.push(Block::Text(TextBlock {
            content: content.to_string(),
            source,
        }));
    }
    if !images.is_empty() {
        message.blocks.push(Block::Image(ImageBlock {
            image_urls: images.to_vec(),
        }));
    }

    let mut next = messages.to_vec();
    next.push(message);
    next
}

/// Start a new assistant message with an empty answer text block.
pub fn add_assistant_message(messages: &[Message]) -> Vec<Message> {
    let mut next = messages.to_vec();
    next.push(Message::new(MessageRole::Assistant).with_block(Block::Text(TextBlock::new(""))));
    next
}

/// Replace the answer text of the last assistant message.
pub fn update_answer_text(messages: &[Message], content: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    let Some(idx) = last_index_of(&next, MessageRole::Assistant) else {
        return next;
    };

    let message = &mut next[idx];
    let text = message.blocks.iter_mut().rev().find_map(|b| match b {
        Block::Text(text) => Some(text),
        _ => None,
    });
    match text {
        Some(text) => text.content = content.to_string(),
        None => message.blocks.push(Block::Text(TextBlock::new(content))),
    }
    next
}

/// Create the pending tool block for `id`, or refresh its streamed
/// parameters while it is still running. Finished blocks are left alone.
pub fn upsert_tool_block(
    messages: &[Message],
    id: &str,
    name: &str,
    parameters: &str,
    compact_params: Option<String>,
) -> Vec<Message> {
    let mut next = messages.to_vec();
    let Some(idx) = last_index_of(&next, MessageRole::Assistant) else {
        return next;
    };

    let message = &mut next[idx];
    let existing = message.blocks.iter_mut().find_map(|b| match b {
        Block::Tool(tool) if tool.id == id => Some(tool),
        _ => None,
    });

    match existing {
        Some(tool) if tool.is_running => {
            if !name.is_empty() {
                tool.name = name.to_string();
            }
            tool.parameters = parameters.to_string();
            if compact_params.is_some() {
                tool.compact_params = compact_params;
            }
        }
        Some(_) => {}
        None => {
            let mut tool = ToolBlock::pending(id, name, parameters);
            tool.compact_params = compact_params;
            message.blocks.push(Block::Tool(tool));
        }
    }
    next
}

/// Re-key the running tool block `from` as `to`, for a call whose id
/// arrived after its first fragment. No-op if `to` already exists.
pub fn rename_tool_block(messages: &[Message], from: &str, to: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    let Some(idx) = last_index_of(&next, MessageRole::Assistant) else {
        return next;
    };

    let message = &mut next[idx];
    let taken = message
        .blocks
        .iter()
        .any(|b| matches!(b, Block::Tool(tool) if tool.id == to));
    if taken {
        return next;
    }
    for block in message.blocks.iter_mut() {
        if let Block::Tool(tool) = block {
            if tool.id == from && tool.is_running {
                tool.id = to.to_string();
                break;
            }
        }
    }
    next
}

/// Patch the running tool block with `id`.
pub fn update_tool_block(messages: &[Message], id: &str, update: ToolBlockUpdate) -> Vec<Message> {
    let mut next = messages.to_vec();
    let target = next.iter_mut().rev().find_map(|m| {
        m.blocks.iter_mut().find_map(|b| match b {
            Block::Tool(tool) if tool.id == id && tool.is_running => Some(tool),
            _ => None,
        })
    });
    if let Some(tool) = target {
        update.apply(tool);
    }
    next
}

fn push_to_trailing_assistant(messages: &[Message], block: Block) -> Vec<Message> {
    let mut next = messages.to_vec();
    match next.last_mut() {
        Some(last) if last.is_assistant() => last.blocks.push(block),
        _ => next.push(Message::new(MessageRole::Assistant).with_block(block)),
    }
    next
}

pub fn add_diff_block(messages: &[Message], diff: DiffBlock) -> Vec<Message> {
    push_to_trailing_assistant(messages, Block::Diff(diff))
}

/// Append an error, creating a trailing assistant message if needed.
pub fn add_error_block(messages: &[Message], content: &str) -> Vec<Message> {
    push_to_trailing_assistant(
        messages,
        Block::Error(ErrorBlock {
            content: content.to_string(),
        }),
    )
}

/// Insert a summary message at `insert_index` (clamped to the end).
pub fn add_compress_block(messages: &[Message], insert_index: usize, content: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    let at = insert_index.min(next.len());
    next.insert(
        at,
        Message::new(MessageRole::Assistant).with_block(Block::Compress(CompressBlock {
            content: content.to_string(),
        })),
    );
    next
}

pub fn add_memory_block(messages: &[Message], memory: MemoryBlock) -> Vec<Message> {
    let mut next = messages.to_vec();
    next.push(Message::new(MessageRole::Assistant).with_block(Block::Memory(memory)));
    next
}

pub fn add_command_output_message(messages: &[Message], command: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    next.push(
        Message::new(MessageRole::Assistant)
            .with_block(Block::CommandOutput(CommandOutputBlock::running(command))),
    );
    next
}

fn running_command_block<'a>(
    messages: &'a mut [Message],
    command: &str,
) -> Option<&'a mut CommandOutputBlock> {
    messages.iter_mut().rev().find_map(|m| {
        m.blocks.iter_mut().rev().find_map(|b| match b {
            Block::CommandOutput(out) if out.command == command && out.is_running => Some(out),
            _ => None,
        })
    })
}

/// Replace the output of the most recent running block for `command`.
pub fn update_command_output(messages: &[Message], command: &str, output: &str) -> Vec<Message> {
    let mut next = messages.to_vec();
    if let Some(block) = running_command_block(&mut next, command) {
        block.output = output.to_string();
    }
    next
}

pub fn complete_command_output(messages: &[Message], command: &str, exit_code: i32) -> Vec<Message> {
    let mut next = messages.to_vec();
    if let Some(block) = running_command_block(&mut next, command) {
        block.is_running = false;
        block.exit_code = Some(exit_code);
    }
    next
}
