//! Intermediate files of a profiling run

use std::{
    io,
    path::{Path, PathBuf},
};

/// Lifecycle of an intermediate file
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ArtifactState {
    /// Not written yet
    Pending,

    /// Written by the stage that produces it
    Populated,

    /// Read by the stage that needs it
    Consumed,

    /// Removed from disk (or never created)
    Deleted,
}

/// Intermediate file that is deleted exactly once, whatever ends its life
///
/// Deletion happens either explicitly or when the artifact is dropped.
///
#[derive(Debug)]
pub struct StageArtifact {
    /// Location of the file
    path: PathBuf,

    /// Where the file is in its lifecycle
    state: ArtifactState,
}
//
impl StageArtifact {
    /// Track a file that has not been written yet
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: ArtifactState::Pending,
        }
    }

    /// Location of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state
    pub fn state(&self) -> ArtifactState {
        self.state
    }

    /// Record that the file has been written
    pub fn mark_populated(&mut self) {
        if self.state == ArtifactState::Pending {
            self.state = ArtifactState::Populated;
        }
    }

    /// Record that the file has been read
    pub fn mark_consumed(&mut self) {
        if self.state != ArtifactState::Deleted {
            self.state = ArtifactState::Consumed;
        }
    }

    /// Delete the file
    ///
    /// Files that do not exist are not an error, so this may be called any
    /// number of times.
    ///
    pub fn delete(&mut self) -> io::Result<()> {
        if self.state == ArtifactState::Deleted {
            return Ok(());
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::trace!("Deleted {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.state = ArtifactState::Deleted;
        Ok(())
    }
}
//
impl Drop for StageArtifact {
    fn drop(&mut self) {
        if let Err(e) = self.delete() {
            log::warn!("Failed to delete {} ({e})", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn lifecycle() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unit.instrumented");
        let mut artifact = StageArtifact::new(&path);
        assert_eq!(artifact.path(), path);
        assert_eq!(artifact.state(), ArtifactState::Pending);

        std::fs::write(&path, "int x;").unwrap();
        artifact.mark_populated();
        assert_eq!(artifact.state(), ArtifactState::Populated);
        artifact.mark_consumed();
        assert_eq!(artifact.state(), ArtifactState::Consumed);

        artifact.delete().unwrap();
        assert_eq!(artifact.state(), ArtifactState::Deleted);
        assert!(!path.exists());
        artifact.delete().unwrap();
        artifact.mark_populated();
        artifact.mark_consumed();
        assert_eq!(artifact.state(), ArtifactState::Deleted);
    }

    #[test]
    fn never_written() {
        let dir = TempDir::new().unwrap();
        let mut artifact = StageArtifact::new(dir.path().join("missing"));
        artifact.delete().unwrap();
        assert_eq!(artifact.state(), ArtifactState::Deleted);
    }

    #[test]
    fn deleted_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("unit.template.profile");
        {
            let mut artifact = StageArtifact::new(&path);
            std::fs::write(&path, "").unwrap();
            artifact.mark_populated();
        }
        assert!(!path.exists());
    }
}
