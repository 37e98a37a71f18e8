//! Safe-resume validation: a JSON sidecar recording the resource metadata a
//! buffer directory's chunk files were downloaded against, so a later run can
//! tell whether the origin's resource has changed underneath it.
//!
//! Trimmed down from the grounding crate's `safe_resume` module, which
//! compares against a cross-job database; here there is exactly one buffer
//! directory per download, so the comparison is against a single sidecar
//! file instead.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DownloadError;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeMeta {
    pub content_length: u64,
    pub etag: Option<String>,
}

impl ResumeMeta {
    pub fn new(content_length: u64, etag: Option<String>) -> Self {
        Self { content_length, etag }
    }

    fn sidecar_path(buffer_path: &Path, hash: &str, ext: &str) -> PathBuf {
        buffer_path.join(format!("{hash}{ext}.meta.json"))
    }

    /// Loads the sidecar next to `hash`/`ext`'s chunk files, if present.
    pub fn load(buffer_path: &Path, hash: &str, ext: &str) -> Result<Option<Self>, DownloadError> {
        let path = Self::sidecar_path(buffer_path, hash, ext);
        match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(meta) => Ok(Some(meta)),
                Err(_) => Ok(None), // corrupt sidecar: treat as absent, not fatal
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::fs(path, e)),
        }
    }

    /// Writes (or overwrites) the sidecar for `hash`/`ext`.
    pub fn save(&self, buffer_path: &Path, hash: &str, ext: &str) -> Result<(), DownloadError> {
        let path = Self::sidecar_path(buffer_path, hash, ext);
        let bytes = serde_json::to_vec_pretty(self).expect("ResumeMeta is always serializable");
        fs::write(&path, bytes).map_err(|e| DownloadError::fs(path, e))
    }

    /// Removes the sidecar, ignoring a missing file.
    pub fn remove(buffer_path: &Path, hash: &str, ext: &str) -> Result<(), DownloadError> {
        let path = Self::sidecar_path(buffer_path, hash, ext);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::fs(path, e)),
        }
    }

    /// Compares `self` (the stored sidecar) with a fresh HEAD result.
    /// `true` means the resource has not changed and the buffer can be
    /// trusted for resume.
    pub fn matches(&self, content_length: u64, etag: &Option<String>) -> bool {
        self.content_length == content_length && &self.etag == etag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sidecar_loads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = ResumeMeta::load(dir.path(), "abc", ".bin").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let meta = ResumeMeta::new(1024, Some("\"etag-value\"".to_string()));
        meta.save(dir.path(), "abc", ".bin").unwrap();

        let loaded = ResumeMeta::load(dir.path(), "abc", ".bin").unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[test]
    fn matches_detects_size_or_etag_drift() {
        let meta = ResumeMeta::new(1024, Some("v1".to_string()));
        assert!(meta.matches(1024, &Some("v1".to_string())));
        assert!(!meta.matches(2048, &Some("v1".to_string())));
        assert!(!meta.matches(1024, &Some("v2".to_string())));
        assert!(!meta.matches(1024, &None));
    }

    #[test]
    fn corrupt_sidecar_is_treated_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc.bin.meta.json");
        fs::write(&path, b"not json").unwrap();
        let loaded = ResumeMeta::load(dir.path(), "abc", ".bin").unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn remove_is_idempotent_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        ResumeMeta::remove(dir.path(), "abc", ".bin").unwrap();
        ResumeMeta::remove(dir.path(), "abc", ".bin").unwrap();
    }
}
