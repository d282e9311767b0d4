//! Filesystem-backed artifact object store.
//!
//! Versions reference immutable `.tar.gz` objects under keys of the form
//! `{app_id}/{uuid}.tar.gz`. The core only reads and streams them; upload and
//! packaging live with external collaborators.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Fresh object key for an app's next version.
    pub fn object_key(app_id: i64) -> String {
        format!("{app_id}/{}.tar.gz", Uuid::new_v4())
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await
    }

    pub async fn get(&self, key: &str) -> io::Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await
    }

    /// Keys are relative paths; anything that could escape the root is
    /// rejected.
    fn path_for(&self, key: &str) -> io::Result<PathBuf> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid artifact key {key:?}"),
            ));
        }
        Ok(self.root.join(rel))
    }
}

/// Hex SHA-256 of an artifact body, as recorded on the version row.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
