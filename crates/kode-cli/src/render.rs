//! Plain terminal rendering of conversation snapshots.
//!
//! The store publishes a full snapshot on every mutation. The renderer
//! remembers how much of each block it has already printed and only writes
//! what is new, so streamed text and command output appear incrementally.

use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

use kode_core::projection::last_compression_index;
use kode_core::{Block, DiffLine, Message, ToolBlock};

/// (message index, block index)
type BlockKey = (usize, usize);

pub struct Renderer<W: Write> {
    out: W,
    /// Bytes of growing text already written.
    progress: HashMap<BlockKey, usize>,
    /// Blocks that reached a final state and were written.
    done: HashSet<BlockKey>,
    compressions: usize,
    len: usize,
    at_line_start: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            progress: HashMap::new(),
            done: HashSet::new(),
            compressions: 0,
            len: 0,
            at_line_start: true,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.out
    }

    fn reset(&mut self) {
        self.progress.clear();
        self.done.clear();
        self.compressions = 0;
        self.len = 0;
    }

    /// Record `messages` as already shown, e.g. after loading a session.
    pub fn mark_seen(&mut self, messages: &[Message]) {
        self.reset();
        self.track_structure(messages);
        for (mi, message) in messages.iter().enumerate() {
            for (bi, block) in message.blocks.iter().enumerate() {
                let key = (mi, bi);
                match block {
                    Block::Text(t) => {
                        self.progress.insert(key, t.content.len());
                    }
                    Block::CommandOutput(c) => {
                        self.progress.insert(key, c.output.len());
                        if !c.is_running {
                            self.done.insert(key);
                        }
                    }
                    Block::Tool(t) if t.is_running => {}
                    _ => {
                        self.done.insert(key);
                    }
                }
            }
        }
    }

    /// Follow structural changes: a cleared list starts over and an inserted
    /// summary shifts everything after it by one message.
    fn track_structure(&mut self, messages: &[Message]) {
        if messages.len() < self.len {
            self.reset();
        }

        let compressions = messages.iter().filter(|m| m.is_compression()).count();
        if compressions > self.compressions {
            if let Some(at) = last_compression_index(messages) {
                self.progress = self
                    .progress
                    .drain()
                    .map(|(key, written)| (shifted(key, at), written))
                    .collect();
                self.done = self.done.drain().map(|key| shifted(key, at)).collect();
            }
            self.compressions = compressions;
        }
        self.len = messages.len();
    }

    /// Write everything in `messages` not written yet.
    pub fn render(&mut self, messages: &[Message]) -> io::Result<()> {
        self.track_structure(messages);

        for (mi, message) in messages.iter().enumerate() {
            if message.is_user() {
                continue;
            }
            for (bi, block) in message.blocks.iter().enumerate() {
                let key = (mi, bi);
                if self.done.contains(&key) {
                    continue;
                }
                match block {
                    Block::Text(t) => self.write_growing(key, &t.content)?,
                    Block::Tool(t) if !t.is_running => {
                        self.line(&tool_line(t))?;
                        self.done.insert(key);
                    }
                    Block::Diff(d) => {
                        self.line(&format!("  --- {}", d.path.display()))?;
                        for change in &d.diff_result {
                            match change {
                                DiffLine::Added(l) => self.line(&format!("  + {}", l))?,
                                DiffLine::Removed(l) => self.line(&format!("  - {}", l))?,
                                DiffLine::Unchanged(_) => {}
                            }
                        }
                        self.done.insert(key);
                    }
                    Block::Error(e) => {
                        self.line(&format!("Error: {}", e.content))?;
                        self.done.insert(key);
                    }
                    Block::Compress(_) => {
                        self.line("[earlier conversation summarized]")?;
                        self.done.insert(key);
                    }
                    Block::Memory(m) => {
                        let status = if m.is_success { "saved" } else { "failed to save" };
                        self.line(&format!(
                            "[{} memory {} to {}]",
                            m.memory_type,
                            status,
                            m.storage_path.display()
                        ))?;
                        self.done.insert(key);
                    }
                    Block::CommandOutput(c) => {
                        if !self.progress.contains_key(&key) {
                            self.line(&format!("$ {}", c.command))?;
                        }
                        self.write_growing(key, &c.output)?;
                        if !c.is_running {
                            self.line(&format!("[exit code {}]", c.exit_code.unwrap_or(0)))?;
                            self.done.insert(key);
                        }
                    }
                    Block::Tool(_) | Block::Image(_) => {}
                }
            }
        }

        self.out.flush()
    }

    /// End the current line, if one is open.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.at_line_start {
            writeln!(self.out)?;
            self.at_line_start = true;
        }
        self.out.flush()
    }

    fn write_growing(&mut self, key: BlockKey, content: &str) -> io::Result<()> {
        let written = self.progress.get(&key).copied().unwrap_or(0);
        let Some(suffix) = content.get(written..) else {
            return Ok(());
        };
        self.progress.insert(key, content.len());
        if suffix.is_empty() {
            return Ok(());
        }
        write!(self.out, "{}", suffix)?;
        self.at_line_start = suffix.ends_with('\n');
        Ok(())
    }

    fn line(&mut self, text: &str) -> io::Result<()> {
        self.finish()?;
        writeln!(self.out, "{}", text)
    }
}

fn shifted(key: BlockKey, from: usize) -> BlockKey {
    if key.0 >= from {
        (key.0 + 1, key.1)
    } else {
        key
    }
}

fn tool_line(tool: &ToolBlock) -> String {
    let params = tool.compact_params.as_deref().unwrap_or("");
    let outcome = match (tool.success, &tool.error) {
        (Some(true), _) => tool
            .short_result
            .clone()
            .unwrap_or_else(|| "done".to_string()),
        (_, Some(error)) => format!("failed: {}", error),
        _ => "failed".to_string(),
    };
    format!("  [{}] {} -> {}", tool.name, params, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kode_core::ops;
    use kode_core::ToolBlockUpdate;

    fn output(renderer: Renderer<Vec<u8>>) -> String {
        String::from_utf8(renderer.into_inner()).unwrap()
    }

    #[test]
    fn test_streamed_text_written_once() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_user_message(&[], "hi", &[], None);
        let msgs = ops::add_assistant_message(&msgs);
        let msgs = ops::update_answer_text(&msgs, "Hel");
        r.render(&msgs).unwrap();
        let msgs = ops::update_answer_text(&msgs, "Hello");
        r.render(&msgs).unwrap();
        r.render(&msgs).unwrap();
        r.finish().unwrap();

        assert_eq!(output(r), "Hello\n");
    }

    #[test]
    fn test_tool_written_when_finished() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_assistant_message(&[]);
        let msgs = ops::upsert_tool_block(&msgs, "c1", "read_file", "{}", Some("path: a.rs".into()));
        r.render(&msgs).unwrap();
        let msgs = ops::update_tool_block(
            &msgs,
            "c1",
            ToolBlockUpdate::succeeded("fn main() {}", Some("1 line".into())),
        );
        r.render(&msgs).unwrap();
        r.render(&msgs).unwrap();

        assert_eq!(output(r), "  [read_file] path: a.rs -> 1 line\n");
    }

    #[test]
    fn test_command_output_streams() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_command_output_message(&[], "ls");
        let msgs = ops::update_command_output(&msgs, "ls", "a\n");
        r.render(&msgs).unwrap();
        let msgs = ops::update_command_output(&msgs, "ls", "a\nb\n");
        let msgs = ops::complete_command_output(&msgs, "ls", 0);
        r.render(&msgs).unwrap();

        assert_eq!(output(r), "$ ls\na\nb\n[exit code 0]\n");
    }

    #[test]
    fn test_compression_insert_does_not_repeat() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_user_message(&[], "q1", &[], None);
        let msgs = ops::add_assistant_message(&msgs);
        let msgs = ops::update_answer_text(&msgs, "a1");
        let msgs = ops::add_user_message(&msgs, "q2", &[], None);
        let msgs = ops::add_assistant_message(&msgs);
        let msgs = ops::update_answer_text(&msgs, "a2");
        r.render(&msgs).unwrap();

        let msgs = ops::add_compress_block(&msgs, 2, "summary");
        r.render(&msgs).unwrap();
        r.finish().unwrap();

        assert_eq!(output(r), "a1a2\n[earlier conversation summarized]\n");
    }

    #[test]
    fn test_mark_seen_skips_history() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_assistant_message(&[]);
        let msgs = ops::update_answer_text(&msgs, "old answer");
        let msgs = ops::add_error_block(&msgs, "old error");
        r.mark_seen(&msgs);
        r.render(&msgs).unwrap();

        let msgs = ops::add_user_message(&msgs, "next", &[], None);
        let msgs = ops::add_assistant_message(&msgs);
        let msgs = ops::update_answer_text(&msgs, "new");
        r.render(&msgs).unwrap();
        r.finish().unwrap();

        assert_eq!(output(r), "new\n");
    }

    #[test]
    fn test_cleared_messages_start_over() {
        let mut r = Renderer::new(Vec::new());
        let msgs = ops::add_assistant_message(&[]);
        let msgs = ops::update_answer_text(&msgs, "first");
        r.render(&msgs).unwrap();
        r.render(&[]).unwrap();

        let msgs = ops::add_assistant_message(&[]);
        let msgs = ops::update_answer_text(&msgs, "second");
        r.render(&msgs).unwrap();
        r.finish().unwrap();

        assert_eq!(output(r), "firstsecond\n");
    }
}
