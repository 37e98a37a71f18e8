//! Chunk file naming: hashing the URL, extracting the extension, and parsing
//! chunk filenames back into offsets for buffer recovery.

use sha2::{Digest, Sha256};
use std::path::Path;

const DOWNLOADING_SUFFIX: &str = "downloading";

/// Lowercase hex SHA-256 of `input`, used as the stable per-URL identifier.
pub fn sha256_str(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extracts the extension (including leading dot) from a URL's path, or an
/// empty string if there is none.
pub fn ext_from_url(url: &str) -> String {
    let path = match url::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    match Path::new(&path).extension() {
        Some(ext) => format!(".{}", ext.to_string_lossy()),
        None => String::new(),
    }
}

/// Name of the final merged file: `{sha256(url)}{ext}`.
pub fn target_file_name(hash: &str, ext: &str) -> String {
    format!("{hash}{ext}")
}

/// Name of a chunk file: `{hash}.{offset}{ext}.downloading`.
pub fn chunk_file_name(hash: &str, ext: &str, offset: u64) -> String {
    format!("{hash}.{offset}{ext}.{DOWNLOADING_SUFFIX}")
}

/// Parses a chunk filename, returning the offset if it matches `hash`/`ext`
/// and the `.downloading` marker.
///
/// Matches the exact shape [`chunk_file_name`] produces: `{hash}.` as prefix,
/// `{ext}.downloading` as suffix (works whether or not `ext` is empty, unlike
/// a naive split on `.` which would miscount cells for an extension-less URL).
pub fn parse_chunk_file_name(file_name: &str, hash: &str, ext: &str) -> Option<u64> {
    let prefix = format!("{hash}.");
    let suffix = format!("{ext}.{DOWNLOADING_SUFFIX}");
    let offset_text = file_name.strip_prefix(&prefix)?.strip_suffix(&suffix)?;
    offset_text.parse::<u64>().ok()
}
