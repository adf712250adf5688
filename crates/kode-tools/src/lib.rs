//! kode-tools: peripheral tools driven directly by user directives
//!
//! - Shell: run a `!` command as a child process, one at a time
//! - Memory: persist `#` notes to project or user memory files

pub mod memory;
pub mod shell;

pub use memory::MemoryStore;
pub use shell::ShellCommandRunner;
