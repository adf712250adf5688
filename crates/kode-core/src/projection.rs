//! Projection of the conversation into wire messages for the model.
//!
//! Only the history from the most recent summary onward is sent; earlier
//! messages stay in the store for display but are shadowed by the summary.

use std::path::Path;

use base64::Engine;
use tracing::warn;

use crate::block::{Block, Message, MessageRole, ToolBlock};
use crate::error::Error;
use crate::message::{ChatMessage, Content, ContentPart, ToolCall};

/// Read an image file and encode it as a base64 `data:` URL.
pub fn image_data_url(path: &Path) -> Result<String, Error> {
    let bytes = std::fs::read(path)?;
    let mime_type = infer::get(&bytes)
        .map(|kind| kind.mime_type())
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or("image/png");
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{};base64,{}", mime_type, encoded))
}

/// Index of the most recent summary message, if any.
pub fn last_compression_index(messages: &[Message]) -> Option<usize> {
    messages.iter().rposition(Message::is_compression)
}

pub fn to_chat_messages(messages: &[Message]) -> Vec<ChatMessage> {
    let start = last_compression_index(messages).unwrap_or(0);
    let mut out = Vec::new();

    for message in &messages[start..] {
        if message.is_compression() {
            for block in &message.blocks {
                if let Block::Compress(summary) = block {
                    out.push(ChatMessage::system(format!(
                        "Summary of the earlier conversation:\n{}",
                        summary.content
                    )));
                }
            }
            continue;
        }

        match message.role {
            MessageRole::User => {
                if let Some(projected) = project_user(message) {
                    out.push(projected);
                }
            }
            MessageRole::Assistant => project_assistant(message, &mut out),
        }
    }

    out
}

fn project_user(message: &Message) -> Option<ChatMessage> {
    let mut parts = Vec::new();
    for block in &message.blocks {
        match block {
            Block::Text(text) if !text.content.is_empty() => {
                parts.push(ContentPart::text(&text.content));
            }
            Block::Image(images) => {
                for path in &images.image_urls {
                    match image_data_url(path) {
                        Ok(url) => parts.push(ContentPart::image_url(url)),
                        Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable image"),
                    }
                }
            }
            _ => {}
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(ChatMessage::user(Content::Parts(parts)))
    }
}

fn project_assistant(message: &Message, out: &mut Vec<ChatMessage>) {
    let text: Vec<&str> = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::Text(t) if !t.content.is_empty() => Some(t.content.as_str()),
            _ => None,
        })
        .collect();

    // Blocks still running have no result yet and are left out entirely.
    let tools: Vec<&ToolBlock> = message
        .blocks
        .iter()
        .filter_map(|b| match b {
            Block::Tool(t) if !t.is_running => Some(t),
            _ => None,
        })
        .collect();

    if text.is_empty() && tools.is_empty() {
        return;
    }

    let content = text.join("\n");
    if tools.is_empty() {
        out.push(ChatMessage::assistant(content));
        return;
    }

    let calls = tools
        .iter()
        .map(|t| {
            let arguments = if t.parameters.trim().is_empty() {
                "{}".to_string()
            } else {
                t.parameters.clone()
            };
            ToolCall::new(&t.id, &t.name, arguments)
        })
        .collect();
    out.push(ChatMessage::assistant_with_tool_calls(content, calls));

    for tool in tools {
        let result = tool_result_text(tool);
        if tool.images.is_empty() {
            out.push(ChatMessage::tool_result(&tool.id, result));
        } else {
            // No wire primitive for a tool result with images.
            let mut parts = vec![ContentPart::text(format!(
                "Result of tool {} ({}):\n{}",
                tool.name, tool.id, result
            ))];
            parts.extend(tool.images.iter().map(|i| ContentPart::image_url(i.data_url())));
            out.push(ChatMessage::user(Content::Parts(parts)));
        }
    }
}

fn tool_result_text(tool: &ToolBlock) -> String {
    if tool.success == Some(false) {
        if let Some(error) = &tool.error {
            return format!("Error: {}", error);
        }
    }
    tool.result.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{ToolImage, TextSource};
    use crate::message::Role;
    use crate::ops::{self, ToolBlockUpdate};

    fn finished_tool(messages: &[Message], id: &str, name: &str, result: &str) -> Vec<Message> {
        let messages = ops::upsert_tool_block(messages, id, name, "{\"a\":1}", None);
        ops::update_tool_block(&messages, id, ToolBlockUpdate::succeeded(result, None))
    }

    #[test]
    fn test_user_text_becomes_text_part() {
        let messages = ops::add_user_message(&[], "hello", &[], None);
        let projected = to_chat_messages(&messages);
        assert_eq!(projected.len(), 1);
        assert_eq!(projected[0].role, Role::User);
        assert_eq!(
            projected[0].content,
            Content::Parts(vec![ContentPart::text("hello")])
        );
    }

    #[test]
    fn test_hook_text_is_projected() {
        let messages = ops::add_user_message(&[], "hook says hi", &[], Some(TextSource::Hook));
        assert_eq!(to_chat_messages(&messages).len(), 1);
    }

    #[test]
    fn test_error_blocks_excluded() {
        let messages = ops::add_user_message(&[], "hi", &[], None);
        let messages = ops::add_assistant_message(&messages);
        let messages = ops::add_error_block(&messages, "API error: boom");
        let projected = to_chat_messages(&messages);
        assert_eq!(projected.len(), 1);
        assert!(projected
            .iter()
            .all(|m| !m.content.to_string_lossy().contains("boom")));
    }

    #[test]
    fn test_assistant_text_is_bare_string() {
        let messages = ops::add_assistant_message(&[]);
        let messages = ops::update_answer_text(&messages, "answer");
        let projected = to_chat_messages(&messages);
        assert_eq!(projected[0].content, Content::Text("answer".to_string()));
    }

    #[test]
    fn test_tool_block_produces_call_and_result() {
        let messages = ops::add_assistant_message(&[]);
        let messages = finished_tool(&messages, "call_1", "read_file", "file contents");
        let projected = to_chat_messages(&messages);

        assert_eq!(projected.len(), 2);
        assert_eq!(projected[0].tool_calls.len(), 1);
        assert_eq!(projected[0].tool_calls[0].name, "read_file");
        assert_eq!(projected[1].role, Role::Tool);
        assert_eq!(projected[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(projected[1].content.as_text(), Some("file contents"));
    }

    #[test]
    fn test_failed_tool_projects_error() {
        let messages = ops::add_assistant_message(&[]);
        let messages = ops::upsert_tool_block(&messages, "call_1", "bash", "{}", None);
        let messages =
            ops::update_tool_block(&messages, "call_1", ToolBlockUpdate::failed("exit 2"));
        let projected = to_chat_messages(&messages);
        assert_eq!(projected[1].content.as_text(), Some("Error: exit 2"));
    }

    #[test]
    fn test_tool_images_become_user_message() {
        let messages = ops::add_assistant_message(&[]);
        let messages = ops::upsert_tool_block(&messages, "call_1", "screenshot", "{}", None);
        let update = ToolBlockUpdate::succeeded("captured", None).with_images(vec![ToolImage {
            data: "AAAA".to_string(),
            media_type: "image/png".to_string(),
        }]);
        let messages = ops::update_tool_block(&messages, "call_1", update);
        let projected = to_chat_messages(&messages);

        assert_eq!(projected.len(), 2);
        assert_eq!(projected[1].role, Role::User);
        match &projected[1].content {
            Content::Parts(parts) => {
                assert_eq!(parts.len(), 2);
                assert_eq!(parts[1], ContentPart::image_url("data:image/png;base64,AAAA"));
            }
            other => panic!("Expected parts, got {:?}", other),
        }
    }

    #[test]
    fn test_running_tool_blocks_skipped() {
        let messages = ops::add_assistant_message(&[]);
        let messages = ops::upsert_tool_block(&messages, "call_1", "bash", "{\"com", None);
        assert!(to_chat_messages(&messages).is_empty());
    }

    #[test]
    fn test_projection_starts_at_last_summary() {
        let mut messages = Vec::new();
        for i in 0..4 {
            messages = ops::add_user_message(&messages, &format!("question {}", i), &[], None);
        }
        let messages = ops::add_compress_block(&messages, 2, "earlier stuff");
        let projected = to_chat_messages(&messages);

        assert_eq!(projected.len(), 3);
        assert_eq!(projected[0].role, Role::System);
        assert!(projected[0].content.to_string_lossy().contains("earlier stuff"));
        assert_eq!(projected[1].content.to_string_lossy(), "question 2");
    }

    #[test]
    fn test_image_paths_become_data_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pixel.png");
        // PNG signature is enough for type detection.
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").unwrap();

        let messages = ops::add_user_message(&[], "", &[path, dir.path().join("missing.png")], None);
        let projected = to_chat_messages(&messages);

        match &projected[0].content {
            Content::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                match &parts[0] {
                    ContentPart::ImageUrl { url } => assert!(url.starts_with("data:image/png;base64,")),
                    other => panic!("Expected image part, got {:?}", other),
                }
            }
            other => panic!("Expected parts, got {:?}", other),
        }
    }
}
