//! Logical-filesystem client abstraction.
//!
//! Runs are bound to a logical filesystem identified by `fs-<user>-<name>`.
//! The core only needs a few read-side operations; the full adapter stack
//! (HDFS/S3/SFTP) lives behind this trait.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Compose the filesystem id from its owner and name.
pub fn fs_id(user_name: &str, fs_name: &str) -> String {
    format!("fs-{}-{}", user_name, fs_name)
}

/// Read-side filesystem operations the core depends on.
#[async_trait]
pub trait FsClient: Send + Sync {
    async fn read_file(&self, fs_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Modification time in seconds since the epoch.
    async fn mtime(&self, fs_id: &str, path: &str) -> Result<i64>;

    async fn is_dir(&self, fs_id: &str, path: &str) -> Result<bool>;

    async fn is_empty_dir(&self, fs_id: &str, path: &str) -> Result<bool>;
}

/// Local-disk filesystem: every fs id maps to a directory under one root.
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFs { root: root.into() }
    }

    fn resolve(&self, fs_id: &str, path: &str) -> PathBuf {
        self.root.join(fs_id).join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl FsClient for LocalFs {
    async fn read_file(&self, fs_id: &str, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(fs_id, path);
        tokio::fs::read(&full)
            .await
            .map_err(|e| io_failure("read", &full, e))
    }

    async fn mtime(&self, fs_id: &str, path: &str) -> Result<i64> {
        let full = self.resolve(fs_id, path);
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| io_failure("stat", &full, e))?;
        let modified = meta
            .modified()
            .map_err(|e| io_failure("stat", &full, e))?
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| Error::IoOperationFailure(format!("mtime before epoch: {}", e)))?;
        Ok(modified.as_secs() as i64)
    }

    async fn is_dir(&self, fs_id: &str, path: &str) -> Result<bool> {
        let full = self.resolve(fs_id, path);
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_failure("stat", &full, e)),
        }
    }

    async fn is_empty_dir(&self, fs_id: &str, path: &str) -> Result<bool> {
        let full = self.resolve(fs_id, path);
        let mut entries = tokio::fs::read_dir(&full)
            .await
            .map_err(|e| io_failure("readdir", &full, e))?;
        Ok(entries
            .next_entry()
            .await
            .map_err(|e| io_failure("readdir", &full, e))?
            .is_none())
    }
}

fn io_failure(op: &str, path: &Path, err: std::io::Error) -> Error {
    Error::IoOperationFailure(format!("{} {}: {}", op, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_id_format() {
        assert_eq!(fs_id("root", "sample"), "fs-root-sample");
    }

    #[tokio::test]
    async fn test_local_fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        let fsid = fs_id("root", "sample");

        let file_dir = dir.path().join(&fsid).join("data");
        tokio::fs::create_dir_all(&file_dir).await.unwrap();
        tokio::fs::write(file_dir.join("run.yaml"), b"name: x")
            .await
            .unwrap();

        let bytes = fs.read_file(&fsid, "data/run.yaml").await.unwrap();
        assert_eq!(bytes, b"name: x");
        assert!(fs.mtime(&fsid, "data/run.yaml").await.unwrap() > 0);
        assert!(fs.is_dir(&fsid, "data").await.unwrap());
        assert!(!fs.is_dir(&fsid, "nope").await.unwrap());
        assert!(!fs.is_empty_dir(&fsid, "data").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_fs_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(dir.path());
        let err = fs.read_file("fs-root-x", "missing").await.unwrap_err();
        assert_eq!(err.code(), "IO_OPERATION_FAILURE");
    }
}
