use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::PersistenceLayer;
use crate::error::{StateError, StateResult};

/// Stores the slot as a single local file.
///
/// Writes go to a temporary file in the same directory which is synced and
/// then renamed over the target, so a crash mid-write leaves either the old
/// or the new contents and never a torn file.
#[derive(Debug, Clone)]
pub struct FileSystemPersistence {
    path: PathBuf,
}

impl FileSystemPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl PersistenceLayer<Vec<u8>> for FileSystemPersistence {
    async fn get(&self) -> StateResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn set(&self, value: &Vec<u8>) -> StateResult<()> {
        let path = self.path.clone();
        let data = value.clone();
        tokio::task::spawn_blocking(move || replace_file(&path, &data))
            .await
            .map_err(|e| self.io_error(std::io::Error::other(e)))?
            .map_err(|e| self.io_error(e))?;
        debug!(path = %self.path.display(), bytes = value.len(), "state file written");
        Ok(())
    }
}

fn replace_file(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    #[cfg(unix)]
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let slot = FileSystemPersistence::new(dir.path().join("state.json"));
        assert_eq!(slot.get().await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_creates_parent_directories_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/state.json");
        let slot = FileSystemPersistence::new(&path);

        slot.set(&b"first".to_vec()).await.unwrap();
        slot.set(&b"second".to_vec()).await.unwrap();
        assert_eq!(slot.get().await.unwrap(), Some(b"second".to_vec()));
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        FileSystemPersistence::new(&path)
            .set(&b"durable".to_vec())
            .await
            .unwrap();

        let reopened = FileSystemPersistence::new(&path);
        assert_eq!(reopened.get().await.unwrap(), Some(b"durable".to_vec()));
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let slot = FileSystemPersistence::new(dir.path().join("state.json"));
        slot.set(&b"x".to_vec()).await.unwrap();
        slot.set(&b"y".to_vec()).await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("state.json")]);
    }

    #[tokio::test]
    async fn unreadable_path_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let slot = FileSystemPersistence::new(dir.path());
        assert!(matches!(slot.get().await, Err(StateError::Io { .. })));
    }
}
