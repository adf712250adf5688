//! Conversation data model: messages made of ordered, typed blocks.
//!
//! This is the conversation truth and the render source for the UI.
//! Only the last message of a role ever receives new or updated blocks.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub blocks: Vec<Block>,
}

impl Message {
    pub fn new(role: MessageRole) -> Self {
        Self {
            role,
            blocks: Vec::new(),
        }
    }

    pub fn with_block(mut self, block: Block) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn is_user(&self) -> bool {
        self.role == MessageRole::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == MessageRole::Assistant
    }

    /// True when the message carries a history summary.
    pub fn is_compression(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b, Block::Compress(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text(TextBlock),
    Image(ImageBlock),
    Tool(ToolBlock),
    Diff(DiffBlock),
    Error(ErrorBlock),
    Compress(CompressBlock),
    Memory(MemoryBlock),
    CommandOutput(CommandOutputBlock),
}

/// Where a user text block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextSource {
    User,
    Hook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<TextSource>,
}

impl TextBlock {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: None,
        }
    }

    pub fn is_hook(&self) -> bool {
        self.source == Some(TextSource::Hook)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub image_urls: Vec<PathBuf>,
}

/// Base64 image returned by a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolImage {
    pub data: String,
    pub media_type: String,
}

impl ToolImage {
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolBlock {
    pub id: String,
    pub name: String,
    /// Raw JSON text of the arguments, possibly still incomplete while streaming.
    pub parameters: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub is_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compact_params: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ToolImage>,
}

impl ToolBlock {
    pub fn pending(id: impl Into<String>, name: impl Into<String>, parameters: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parameters: parameters.into(),
            result: None,
            success: None,
            error: None,
            is_running: true,
            short_result: None,
            compact_params: None,
            images: Vec::new(),
        }
    }
}

/// One line of a file diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "lowercase")]
pub enum DiffLine {
    Added(String),
    Removed(String),
    Unchanged(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffBlock {
    pub path: PathBuf,
    pub diff_result: Vec<DiffLine>,
    pub original: String,
    pub modified: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBlock {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressBlock {
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    Project,
    User,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Project => write!(f, "project"),
            MemoryType::User => write!(f, "user"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub content: String,
    pub is_success: bool,
    pub memory_type: MemoryType,
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutputBlock {
    pub command: String,
    pub output: String,
    pub is_running: bool,
    pub exit_code: Option<i32>,
}

impl CommandOutputBlock {
    pub fn running(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            output: String::new(),
            is_running: true,
            exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_serializes_with_type_tag() {
        let block = Block::Error(ErrorBlock {
            content: "boom".to_string(),
        });
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["content"], "boom");
    }

    #[test]
    fn test_pending_tool_block_is_running() {
        let block = ToolBlock::pending("call_1", "read_file", "{\"path\":");
        assert!(block.is_running);
        assert!(block.result.is_none());
    }

    #[test]
    fn test_tool_image_data_url() {
        let image = ToolImage {
            data: "iVBORw0K".to_string(),
            media_type: "image/png".to_string(),
        };
        assert_eq!(image.data_url(), "data:image/png;base64,iVBORw0K");
    }

    #[test]
    fn test_compression_message() {
        let msg = Message::new(MessageRole::Assistant).with_block(Block::Compress(CompressBlock {
            content: "summary".to_string(),
        }));
        assert!(msg.is_compression());
        assert!(msg.is_assistant());
    }
}
