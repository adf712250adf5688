//! Persistent memory notes saved through `#` directives.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::info;

use kode_core::{Error, MemoryType};

/// File name of the project memory, kept in the working directory.
pub const PROJECT_MEMORY_FILE: &str = "KODE.md";

/// Appends memory notes as markdown bullets to a per-project or per-user file.
pub struct MemoryStore {
    project_path: PathBuf,
    user_path: PathBuf,
}

impl MemoryStore {
    pub fn new(project_path: impl Into<PathBuf>, user_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            user_path: user_path.into(),
        }
    }

    /// Project memory in `project_dir`, user memory under the config directory.
    pub fn for_project(project_dir: &Path) -> Self {
        let user_path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kode")
            .join("memory.md");
        Self::new(project_dir.join(PROJECT_MEMORY_FILE), user_path)
    }

    pub fn path_for(&self, memory_type: MemoryType) -> &Path {
        match memory_type {
            MemoryType::Project => &self.project_path,
            MemoryType::User => &self.user_path,
        }
    }

    /// Append `content` as a bullet and return the file written.
    ///
    /// A leading `#` (the directive marker) is stripped.
    pub fn append(&self, content: &str, memory_type: MemoryType) -> Result<PathBuf, Error> {
        let note = content.trim().trim_start_matches('#').trim();
        if note.is_empty() {
            return Err(Error::tool("memory", "Memory content is empty"));
        }

        let path = self.path_for(memory_type).to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::tool("memory", format!("Failed to create directory: {}", e)))?;
            }
        }

        let needs_newline = std::fs::read(&path)
            .map(|existing| !existing.is_empty() && !existing.ends_with(b"\n"))
            .unwrap_or(false);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::tool("memory", format!("Failed to open {}: {}", path.display(), e)))?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "- {}", note)?;

        info!(path = %path.display(), memory_type = %memory_type, "Saved memory");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_project_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("KODE.md"), dir.path().join("user/memory.md"));

        let path = store.append("# use tabs for indentation", MemoryType::Project).unwrap();
        store.append("#run tests with --release", MemoryType::Project).unwrap();

        assert_eq!(path, dir.path().join("KODE.md"));
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "- use tabs for indentation\n- run tests with --release\n");
    }

    #[test]
    fn test_append_user_memory_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path().join("KODE.md"), dir.path().join("nested/memory.md"));

        let path = store.append("prefers short answers", MemoryType::User).unwrap();
        assert!(path.ends_with("nested/memory.md"));
        assert!(std::fs::read_to_string(path).unwrap().contains("- prefers short answers"));
    }

    #[test]
    fn test_append_after_unterminated_line() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("KODE.md");
        std::fs::write(&project, "# Notes").unwrap();
        let store = MemoryStore::new(&project, dir.path().join("memory.md"));

        store.append("one", MemoryType::Project).unwrap();
        assert_eq!(std::fs::read_to_string(&project).unwrap(), "# Notes\n- one\n");
    }

    #[test]
    fn test_empty_memory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::for_project(dir.path());
        assert!(store.append("#   ", MemoryType::Project).is_err());
    }
}
