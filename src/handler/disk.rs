//! Disk Cache Handler
//!
//! Filesystem-backed, single node cache.
//!
//! # Layout
//!
//! Each character of the key becomes one directory level, the leaf file is
//! the key plus [`CACHE_FILE_SUFFIX`]:
//!
//! ```text
//! key "abcd"  →  <root>/a/b/c/d/abcd.cache
//! ```
//!
//! Entries carry no expiry metadata. A read passes an `expires` window and
//! the entry is fresh while `mtime + expires > now`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::fs;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suffix of every cache file
pub const CACHE_FILE_SUFFIX: &str = ".cache";

/// Filesystem-backed cache rooted at one directory
#[derive(Debug, Clone)]
pub struct DiskCacheHandler {
    root: PathBuf,
}

impl DiskCacheHandler {
    /// Open (and create if needed) a cache rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that stores `key`
    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(Error::InvalidKey("empty key".to_string()));
        }
        if key.contains(['/', '\\', '\0']) {
            return Err(Error::InvalidKey(format!(
                "'{}' contains a path separator or NUL",
                key
            )));
        }

        let mut path = self.root.clone();
        let mut segment = [0u8; 4];
        for c in key.chars() {
            path.push(&*c.encode_utf8(&mut segment));
        }
        path.push(format!("{}{}", key, CACHE_FILE_SUFFIX));
        Ok(path)
    }

    fn stored_path(&self, key: &str) -> Option<PathBuf> {
        match self.path_for(key) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(key, error = %e, "Key has no disk mapping");
                None
            }
        }
    }

    /// Contents of `key` if written less than `expires` seconds ago.
    ///
    /// A key with no path mapping can never have been stored, so it reads as
    /// a miss.
    pub async fn get(&self, key: &str, expires: u32) -> Result<Option<Bytes>> {
        let Some(path) = self.stored_path(key) else {
            return Ok(None);
        };

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if !is_fresh(metadata.modified()?, expires, SystemTime::now()) {
            debug!(key, expires, "Disk cache entry is stale");
            return Ok(None);
        }

        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite `key`; a temporary sibling is renamed over the target
    pub async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::Internal(format!("cache path {:?} has no parent", path)))?;
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&temp, &value).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove `key`; absent and unmappable keys are fine
    pub async fn delete(&self, key: &str) -> Result<()> {
        let Some(path) = self.stored_path(key) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove everything under the root, keeping the root itself
    pub async fn flush(&self) -> Result<()> {
        let mut children = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            children.push(entry.path());
        }
        if children.is_empty() {
            return Ok(());
        }

        if bulk_remove(&children).await {
            return Ok(());
        }

        for child in children {
            let result = match fs::symlink_metadata(&child).await {
                Ok(m) if m.is_dir() => fs::remove_dir_all(&child).await,
                Ok(_) => fs::remove_file(&child).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Root must still exist and be a directory
    pub async fn verify_root(&self) -> Result<()> {
        let metadata = fs::metadata(&self.root).await?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Write, read back and remove a probe file in the root
    pub async fn check_service(&self, identifier: &str) -> Result<()> {
        let probe = self
            .root
            .join(format!(".probe-{}", uuid::Uuid::new_v4().simple()));
        let token = uuid::Uuid::new_v4().to_string();

        for _ in 0..2 {
            fs::write(&probe, token.as_bytes()).await?;
            let read = fs::read(&probe).await;
            if matches!(&read, Ok(data) if data.as_slice() == token.as_bytes()) {
                fs::remove_file(&probe).await?;
                return Ok(());
            }
        }

        let _ = fs::remove_file(&probe).await;
        Err(Error::HealthProbeFailed {
            identifier: identifier.to_string(),
        })
    }
}

/// `mtime + expires > now`
fn is_fresh(modified: SystemTime, expires: u32, now: SystemTime) -> bool {
    match modified.checked_add(Duration::from_secs(expires as u64)) {
        Some(deadline) => deadline > now,
        None => true,
    }
}

#[cfg(unix)]
async fn bulk_remove(paths: &[PathBuf]) -> bool {
    let status = tokio::process::Command::new("rm")
        .arg("-rf")
        .arg("--")
        .args(paths)
        .status()
        .await;

    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!(%status, "Bulk remove failed; falling back to directory walk");
            false
        }
        Err(e) => {
            debug!(error = %e, "Bulk remove unavailable; falling back to directory walk");
            false
        }
    }
}

#[cfg(not(unix))]
async fn bulk_remove(_paths: &[PathBuf]) -> bool {
    false
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use tokio_test::assert_ok;

    async fn handler() -> (DiskCacheHandler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let handler = DiskCacheHandler::open(dir.path().join("cache")).await.unwrap();
        (handler, dir)
    }

    fn backdate(path: &Path, age: Duration) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_path_layout() {
        let (handler, _dir) = handler().await;
        let path = handler.path_for("abcd").unwrap();
        assert_eq!(
            path,
            handler.root().join("a").join("b").join("c").join("d").join("abcd.cache")
        );
    }

    #[tokio::test]
    async fn test_rejects_unmappable_keys() {
        let (handler, _dir) = handler().await;
        assert_matches!(handler.path_for(""), Err(Error::InvalidKey(_)));
        assert_matches!(handler.path_for("../etc"), Err(Error::InvalidKey(_)));
        assert_matches!(handler.path_for("a\\b"), Err(Error::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_unmappable_key_is_miss_but_cannot_be_written() {
        let (handler, _dir) = handler().await;
        assert_eq!(handler.get("user/42", 60).await.unwrap(), None);
        assert_ok!(handler.delete("user/42").await);
        assert_matches!(
            handler.set("user/42", Bytes::from_static(b"v")).await,
            Err(Error::InvalidKey(_))
        );
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (handler, _dir) = handler().await;
        assert_ok!(handler.set("page:home", Bytes::from_static(b"<html>")).await);
        assert_eq!(
            handler.get("page:home", 60).await.unwrap(),
            Some(Bytes::from_static(b"<html>"))
        );

        assert_ok!(handler.set("page:home", Bytes::from_static(b"v2")).await);
        assert_eq!(
            handler.get("page:home", 60).await.unwrap(),
            Some(Bytes::from_static(b"v2"))
        );
    }

    #[tokio::test]
    async fn test_expiry_window_boundary() {
        let (handler, _dir) = handler().await;
        handler.set("k", Bytes::from_static(b"v")).await.unwrap();
        let path = handler.path_for("k").unwrap();

        backdate(&path, Duration::from_secs(9));
        assert!(handler.get("k", 10).await.unwrap().is_some());

        backdate(&path, Duration::from_secs(11));
        assert!(handler.get("k", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_expires_is_stale() {
        let (handler, _dir) = handler().await;
        handler.set("k", Bytes::from_static(b"v")).await.unwrap();
        backdate(&handler.path_for("k").unwrap(), Duration::from_secs(1));
        assert!(handler.get("k", 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_value_is_found() {
        let (handler, _dir) = handler().await;
        handler.set("k", Bytes::new()).await.unwrap();
        assert_eq!(handler.get("k", 60).await.unwrap(), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (handler, _dir) = handler().await;
        assert_ok!(handler.delete("missing").await);

        handler.set("k", Bytes::from_static(b"v")).await.unwrap();
        assert_ok!(handler.delete("k").await);
        assert_ok!(handler.delete("k").await);
        assert!(handler.get("k", 60).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_keeps_root() {
        let (handler, _dir) = handler().await;
        for key in ["alpha", "beta", "gamma"] {
            handler.set(key, Bytes::from_static(b"v")).await.unwrap();
        }

        handler.flush().await.unwrap();

        assert!(handler.root().is_dir());
        assert_eq!(std::fs::read_dir(handler.root()).unwrap().count(), 0);
        assert!(handler.get("alpha", 60).await.unwrap().is_none());

        // Flushing an empty cache is fine
        handler.flush().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_service_and_verify_root() {
        let (handler, _dir) = handler().await;
        assert_ok!(handler.check_service("pages").await);
        assert_eq!(std::fs::read_dir(handler.root()).unwrap().count(), 0);
        assert_ok!(handler.verify_root().await);

        std::fs::remove_dir_all(handler.root()).unwrap();
        assert_matches!(handler.verify_root().await, Err(Error::Io(_)));
    }

    #[test]
    fn test_is_fresh() {
        let now = SystemTime::now();
        let written = now - Duration::from_secs(5);
        assert!(is_fresh(written, 6, now));
        assert!(!is_fresh(written, 5, now));
        assert!(!is_fresh(written, 0, now));
    }

    proptest! {
        #[test]
        fn prop_path_nests_one_level_per_char(key in "[a-zA-Z0-9:_-]{1,24}") {
            let handler = DiskCacheHandler { root: PathBuf::from("/cache") };
            let path = handler.path_for(&key).unwrap();
            let relative = path.strip_prefix("/cache").unwrap();

            let file_name = format!("{}{}", key, CACHE_FILE_SUFFIX);
            prop_assert_eq!(relative.file_name().and_then(|f| f.to_str()), Some(file_name.as_str()));
            prop_assert_eq!(relative.components().count(), key.chars().count() + 1);
            for (component, c) in relative.components().zip(key.chars()) {
                let expected = c.to_string();
                prop_assert_eq!(component.as_os_str().to_str(), Some(expected.as_str()));
            }
        }
    }
}
