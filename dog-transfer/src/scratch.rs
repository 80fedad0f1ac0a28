use std::path::{Path, PathBuf};

use crate::{TransferError, TransferResult};

/// Local file holding the payload while it is uploaded
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    /// Write `contents` to `dir/name`, creating `dir` if needed
    pub async fn create(dir: &Path, name: &str, contents: &[u8]) -> TransferResult<Self> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name.replace(['/', '\\'], "_"));
        tokio::fs::write(&path, contents).await?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(self) -> TransferResult<()> {
        tokio::fs::remove_file(&self.path).await.map_err(|err| {
            TransferError::cleanup(format!("Could not remove {}: {}", self.path.display(), err))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::create(dir.path(), "nested/name", b"payload").await.unwrap();

        assert_eq!(scratch.path().parent(), Some(dir.path()));
        assert_eq!(tokio::fs::read(scratch.path()).await.unwrap(), b"payload");

        let path = scratch.path().to_path_buf();
        scratch.remove().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn removing_a_missing_file_is_a_cleanup_error() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = ScratchFile::create(dir.path(), "gone", b"x").await.unwrap();
        std::fs::remove_file(scratch.path()).unwrap();

        assert!(matches!(scratch.remove().await, Err(TransferError::Cleanup { .. })));
    }
}
