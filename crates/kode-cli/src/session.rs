//! JSON session files under the config directory.

use std::path::PathBuf;

use tracing::debug;

use kode_core::{Error, SessionPersister, SessionSnapshot};

pub struct JsonSessionPersister {
    dir: PathBuf,
}

impl JsonSessionPersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn load(&self, id: &str) -> Result<SessionSnapshot, Error> {
        let content = std::fs::read_to_string(self.path_for(id))?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl SessionPersister for JsonSessionPersister {
    fn persist(&self, session: &SessionSnapshot) -> Result<(), Error> {
        if session.messages.is_empty() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&session.id.to_string());
        std::fs::write(&path, serde_json::to_string_pretty(session)?)?;
        debug!(path = %path.display(), "Session saved");
        Ok(())
    }
}
