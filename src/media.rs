//! Directory-backed store for temporary media blobs.
//!
//! Inbound uploads and fetched results live here as opaque files addressed by
//! [`MediaHandle`]. Handles are owned by exactly one conversation instance
//! until cleanup; removal is idempotent so racing cleanup paths are harmless.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dialogue::{MediaClass, UserId};

/// Opaque reference to a stored blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaHandle(PathBuf);

impl MediaHandle {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for MediaHandle {
    fn from(path: PathBuf) -> Self {
        Self(path)
    }
}

pub struct MediaStore {
    root: PathBuf,
    http: reqwest::Client,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create media dir {}", root.display()))?;
        Ok(Self {
            root,
            http: reqwest::Client::new(),
        })
    }

    /// Persist raw bytes and return a handle to them.
    pub async fn store(&self, user: UserId, extension: &str, bytes: &[u8]) -> Result<MediaHandle> {
        let name = format!("{}_{}.{}", user, Uuid::new_v4(), extension);
        let path = self.root.join(name);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("failed to write blob {}", path.display()))?;
        debug!(user_id = user, path = %path.display(), "stored media blob");
        Ok(MediaHandle(path))
    }

    /// Download a remote result into the store.
    pub async fn fetch_remote(
        &self,
        user: UserId,
        url: &str,
        fallback_extension: &str,
    ) -> Result<MediaHandle> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("failed to fetch result from {url}"))?;
        let bytes = response
            .bytes()
            .await
            .context("failed to read result body")?;

        let extension = url_extension(url).unwrap_or_else(|| fallback_extension.to_string());
        self.store(user, &extension, &bytes).await
    }

    /// Delete a blob. Missing files are not an error.
    pub fn remove(&self, handle: &MediaHandle) {
        match std::fs::remove_file(handle.path()) {
            Ok(()) => debug!(path = %handle.path().display(), "removed media blob"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %handle.path().display(), error = %e, "failed to remove media blob"),
        }
    }
}

/// Pick a file extension for inbound media from its class and mime type.
pub fn extension_for(class: MediaClass, mime_type: Option<&str>) -> String {
    match class {
        MediaClass::Video => "mp4".to_string(),
        MediaClass::Photo => mime_type
            .and_then(|m| m.strip_prefix("image/"))
            .filter(|s| !s.is_empty())
            .unwrap_or("png")
            .to_string(),
    }
}

fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let (_, ext) = path.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 4 || ext.contains('/') {
        return None;
    }
    Some(ext.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_follows_mime_for_photos() {
        assert_eq!(extension_for(MediaClass::Photo, Some("image/jpeg")), "jpeg");
        assert_eq!(extension_for(MediaClass::Photo, Some("image/webp")), "webp");
        assert_eq!(extension_for(MediaClass::Photo, None), "png");
        assert_eq!(extension_for(MediaClass::Video, Some("video/quicktime")), "mp4");
    }

    #[test]
    fn url_extension_strips_queries() {
        assert_eq!(
            url_extension("https://cdn.example.com/out/abc.mp4?sig=123"),
            Some("mp4".to_string())
        );
        assert_eq!(url_extension("https://cdn.example.com/out/abc"), None);
    }

    #[tokio::test]
    async fn store_and_remove_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = MediaStore::new(dir.path()).expect("store");

        let handle = store.store(7, "png", b"fake-bytes").await.expect("store blob");
        assert!(handle.path().exists());

        store.remove(&handle);
        assert!(!handle.path().exists());

        // A second removal of the same handle is a no-op.
        store.remove(&handle);
    }
}
