//! Single-page application bundle.

use axum::body::Bytes;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{PorticoError, Result};

const INDEX_FILE: &str = "index.html";

/// The SPA bundle served by the gateway.
///
/// The entry document is read once at startup and served from memory;
/// everything else under the root is served from disk at `/dist`.
#[derive(Debug, Clone)]
pub struct SpaAssets {
    root: PathBuf,
    index: Bytes,
}

impl SpaAssets {
    /// Load the bundle rooted at `root`. Fails if `index.html` is missing.
    pub fn load(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let index_path = root.join(INDEX_FILE);

        let index = std::fs::read(&index_path).map_err(|e| {
            PorticoError::Assets(format!("failed to read {}: {}", index_path.display(), e))
        })?;

        info!(root = %root.display(), index_bytes = index.len(), "Loaded SPA assets");

        Ok(Self {
            root,
            index: Bytes::from(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The SPA entry document.
    pub fn index(&self) -> Bytes {
        self.index.clone()
    }
}
