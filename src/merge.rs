//! Concatenates per-segment chunk files into the final target file.
//!
//! A single-segment download is merged with a rename (no copy). A
//! multi-segment download is streamed chunk-by-chunk into the target,
//! verifying each chunk is exactly as long as its segment expects.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::DownloadError;

const STEP_SIZE: usize = 8192;

/// One chunk file's place in the final layout.
struct ChunkInfo {
    path: PathBuf,
    offset: u64,
    next_offset: u64,
}

fn chunk_infos(
    offsets: &[u64],
    content_length: u64,
    chunk_path_for: impl Fn(u64) -> PathBuf,
) -> Vec<ChunkInfo> {
    let mut infos = Vec::with_capacity(offsets.len());
    for (i, &offset) in offsets.iter().enumerate() {
        let next_offset = offsets.get(i + 1).copied().unwrap_or(content_length);
        infos.push(ChunkInfo {
            path: chunk_path_for(offset),
            offset,
            next_offset,
        });
    }
    infos
}

/// Merges the chunk files named by `offsets` into `target_path`.
///
/// `chunk_path_for` maps a segment's starting offset to its chunk file's
/// path. Returns `true` if the chunk file(s) were consumed in place (so the
/// caller need not clean them up separately), mirroring the move-vs-copy
/// split this is grounded on.
pub fn merge_chunks(
    offsets: &[u64],
    content_length: u64,
    target_path: &Path,
    chunk_path_for: impl Fn(u64) -> PathBuf,
) -> Result<bool, DownloadError> {
    assert!(!offsets.is_empty(), "segment table must not be empty at merge time");

    let infos = chunk_infos(offsets, content_length, chunk_path_for);

    if infos.len() == 1 {
        let only = &infos[0];
        fs::rename(&only.path, target_path).map_err(|e| DownloadError::fs(target_path, e))?;
        return Ok(true);
    }

    let mut output = File::create(target_path).map_err(|e| DownloadError::fs(target_path, e))?;
    let mut buf = [0u8; STEP_SIZE];

    for info in &infos {
        let mut input = File::open(&info.path).map_err(|e| DownloadError::fs(&info.path, e))?;
        let target_count = info.next_offset - info.offset;
        let mut written = 0u64;
        while written < target_count {
            let want = std::cmp::min(STEP_SIZE as u64, target_count - written) as usize;
            let n = input
                .read(&mut buf[..want])
                .map_err(|e| DownloadError::fs(&info.path, e))?;
            if n == 0 {
                return Err(DownloadError::Integrity {
                    path: info.path.clone(),
                    expected: target_count,
                    actual: written,
                });
            }
            output
                .write_all(&buf[..n])
                .map_err(|e| DownloadError::fs(target_path, e))?;
            written += n as u64;
        }
    }
    Ok(false)
}

/// Removes every chunk file named by `offsets`, ignoring already-missing files.
pub fn remove_chunks(offsets: &[u64], chunk_path_for: impl Fn(u64) -> PathBuf) {
    for &offset in offsets {
        let path = chunk_path_for(offset);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove chunk file");
            }
        }
    }
}
