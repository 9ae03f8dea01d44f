use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;

use crate::error::StorageError;
use crate::storage_traits::{CasStore, ContentDigest, StorageResult};

/// Filesystem-backed content-addressed store with git-style 2-char sharding.
///
/// Layout: `<root>/objects/<first 2 hex chars>/<remaining hex chars>`
pub struct FsCasStore {
    objects_dir: PathBuf,
}

impl FsCasStore {
    /// Create a new `FsCasStore` rooted at `root`. Creates `root/objects/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let objects_dir = root.as_ref().join("objects");
        fs::create_dir_all(&objects_dir)?;
        Ok(Self { objects_dir })
    }

    fn blob_path(&self, digest: &ContentDigest) -> PathBuf {
        let hex = digest.as_str();
        self.objects_dir.join(&hex[..2]).join(&hex[2..])
    }
}

#[async_trait]
impl CasStore for FsCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let path = self.blob_path(&digest);

        if path.exists() {
            return Ok(digest);
        }

        let shard_dir = self.objects_dir.join(&digest.as_str()[..2]);
        fs::create_dir_all(&shard_dir)?;

        // Write to a temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;

        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound {
                    digest: digest.as_str().to_string(),
                }
            } else {
                StorageError::Io(e)
            }
        })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(self.blob_path(digest).exists())
    }
}
