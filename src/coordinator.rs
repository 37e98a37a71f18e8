//! DownloadCoordinator: the per-URL coordinator owning the segment table,
//! handing `SegmentTask`s to workers, and reconciling mid-flight splits.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::chunk;
use crate::error::DownloadError;
use crate::head;
use crate::retry::RetryPolicy;
use crate::segment::Segment;
use crate::task::SegmentTask;

pub struct DownloadCoordinator {
    pub url: String,
    pub hash: String,
    pub ext: String,
    pub buffer_path: PathBuf,
    pub content_length: u64,
    pub etag: Option<String>,
    pub accept_ranges: bool,
    pub content_disposition: Option<String>,
    headers: HashMap<String, String>,
    cookie_header: Option<String>,
    min_task_length: u64,
    table: Mutex<Vec<Segment>>,
}

impl DownloadCoordinator {
    /// Performs the HEAD probe (through `policy`) and fails immediately with
    /// a metadata error if `Content-Length` is missing or zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        buffer_path: PathBuf,
        headers: HashMap<String, String>,
        cookie_header: Option<String>,
        min_task_length: u64,
        policy: &RetryPolicy,
        connect_timeout: Duration,
        total_timeout: Duration,
    ) -> Result<Self, DownloadError> {
        let head_result = head::probe(&url, &headers, policy, connect_timeout, total_timeout).map_err(|e| {
            DownloadError::Metadata {
                url: url.clone(),
                reason: e.to_string(),
            }
        })?;

        let content_length = match head_result.content_length {
            Some(n) if n > 0 => n,
            _ => {
                return Err(DownloadError::Metadata {
                    url: url.clone(),
                    reason: "missing or zero Content-Length".to_string(),
                })
            }
        };

        let hash = chunk::sha256_str(&url);
        let ext = chunk::ext_from_url(&url);

        Ok(Self {
            hash,
            ext,
            buffer_path,
            content_length,
            etag: head_result.etag,
            accept_ranges: head_result.accept_ranges,
            content_disposition: head_result.content_disposition,
            headers,
            cookie_header,
            min_task_length: min_task_length.max(1),
            table: Mutex::new(Vec::new()),
            url,
        })
    }

    pub fn chunk_path(&self, offset: u64) -> PathBuf {
        self.buffer_path.join(chunk::chunk_file_name(&self.hash, &self.ext, offset))
    }

    pub fn target_path(&self) -> PathBuf {
        self.buffer_path.join(chunk::target_file_name(&self.hash, &self.ext))
    }

    /// Final segment offsets in ascending order, for the merge stage.
    pub fn offsets(&self) -> Vec<u64> {
        self.table.lock().unwrap().iter().map(|s| s.offset).collect()
    }

    /// Reconstructs the segment table from chunk files already on disk.
    pub fn load_buffer(&self) -> Result<(), DownloadError> {
        let mut discovered: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&self.buffer_path).map_err(|e| DownloadError::fs(&self.buffer_path, e))? {
            let entry = entry.map_err(|e| DownloadError::fs(&self.buffer_path, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(offset) = chunk::parse_chunk_file_name(name, &self.hash, &self.ext) {
                discovered.push(offset);
            }
        }

        let mut table = self.table.lock().unwrap();
        table.clear();

        if !self.accept_ranges {
            for offset in &discovered {
                let _ = fs::remove_file(self.chunk_path(*offset));
            }
            table.push(Segment::new(0, self.content_length, 0));
            info!(content_length = self.content_length, "range-unaware buffer load: single fresh segment");
            return Ok(());
        }

        discovered.sort_unstable();
        let mut segments: Vec<Segment> = Vec::with_capacity(discovered.len());
        for offset in &discovered {
            let path = self.chunk_path(*offset);
            let len = fs::metadata(&path).map_err(|e| DownloadError::fs(&path, e))?.len();
            segments.push(Segment::new(*offset, 0, len));
        }
        let n = segments.len();
        for i in 0..n {
            let next_offset = if i + 1 < n {
                segments[i + 1].offset
            } else {
                self.content_length
            };
            segments[i].target_length = next_offset - segments[i].offset;
        }
        if segments.is_empty() {
            segments.push(Segment::new(0, self.content_length, 0));
        }
        info!(segments = segments.len(), "buffer loaded from disk");
        *table = segments;
        Ok(())
    }

    /// Hands a worker its next `SegmentTask`, or `None` when there is no more
    /// work (the worker should exit).
    pub fn next_task(&self) -> Option<Arc<SegmentTask>> {
        let mut table = self.table.lock().unwrap();

        if !self.accept_ranges {
            let idx = table
                .iter()
                .position(|s| s.task.is_none() && s.completed_length < s.target_length)?;
            return Some(self.assign(&mut table, idx, false));
        }

        let mut candidates: Vec<usize> = (0..table.len())
            .filter(|&i| table[i].is_usable(self.min_task_length))
            .collect();
        candidates.sort_by_key(|&i| {
            let s = &table[i];
            (s.rank(), std::cmp::Reverse(s.target_length.saturating_sub(s.completed_length)))
        });

        for idx in candidates {
            // Re-check: nothing can have changed since we hold the table lock
            // continuously through ordering and dispatch, but keep the check
            // for clarity and to mirror the two-phase design this scheduler
            // is grounded on.
            if !table[idx].is_usable(self.min_task_length) {
                continue;
            }
            if table[idx].task.is_none() {
                return Some(self.assign(&mut table, idx, false));
            }
            if table[idx].rank() == 1 {
                if let Some(new_idx) = self.split_locked(&mut table, idx) {
                    return Some(self.assign(&mut table, new_idx, true));
                }
            }
        }
        None
    }

    fn assign(&self, table: &mut [Segment], idx: usize, assert_can_use_range: bool) -> Arc<SegmentTask> {
        let seg = &mut table[idx];
        let task = Arc::new(SegmentTask::new(
            self.url.clone(),
            self.headers.clone(),
            self.cookie_header.clone(),
            seg.offset,
            seg.offset + seg.target_length - 1,
            seg.completed_length,
            self.content_length,
            assert_can_use_range,
        ));
        seg.task = Some(Arc::clone(&task));
        task
    }

    /// Splits a live segment whose current task has proved range capability.
    /// Returns the new trailing segment's table index, or `None` if the task
    /// has already consumed the segment's tail.
    fn split_locked(&self, table: &mut Vec<Segment>, idx: usize) -> Option<usize> {
        let seg_offset = table[idx].offset;
        let seg_target_length = table[idx].target_length;
        let task = table[idx].task.clone()?;

        let splitted_end = proposed_split_end(seg_offset, seg_target_length, task.completed_length());
        let e = task.update_end(splitted_end);
        let old_end = seg_offset + seg_target_length; // exclusive upper bound

        // `e + 1 == old_end` would leave a zero-length tail segment (no chunk
        // file ever gets created for it, since nothing is ever assigned to
        // write there) — reject that case too, not just an out-of-range one.
        if e + 1 >= old_end {
            return None;
        }

        // Invariant (§3): offset + target_length must equal the next
        // segment's offset — the new end `e` is inclusive, so the shrunk
        // segment's target_length is `(e + 1) - offset`, not `e - offset`.
        table[idx].target_length = (e + 1) - seg_offset;

        let new_offset = e + 1;
        let new_target_length = old_end - new_offset;
        let mut new_segment = Segment::new(new_offset, new_target_length, 0);
        new_segment.task = None;
        table.push(new_segment);
        table.sort_by_key(|s| s.offset);
        let new_idx = table.iter().position(|s| s.offset == new_offset)?;
        debug!(parent_offset = seg_offset, new_offset, "segment split");
        Some(new_idx)
    }

    /// Called by the worker after a `SegmentTask` terminates (success,
    /// stopped, or failure), recording the bytes it wrote and freeing the
    /// segment's task slot for reassignment.
    pub fn on_task_finished(&self, offset: u64, bytes_written: u64) {
        let mut table = self.table.lock().unwrap();
        if let Some(seg) = table.iter_mut().find(|s| s.offset == offset) {
            seg.completed_length += bytes_written;
            seg.task = None;
        }
    }

    /// Signals every live task's stop flag; does not clear `segment.task`
    /// (the finishing task does that itself via `on_task_finished`).
    pub fn stop_tasks(&self) {
        let table = self.table.lock().unwrap();
        for seg in table.iter() {
            if let Some(t) = &seg.task {
                t.stop();
            }
        }
    }

    /// Recovery path when an origin that advertised ranges refuses them at
    /// GET time: promotes an eligible in-flight task to cover the whole file,
    /// stops and discards every other segment, or falls back to one fresh
    /// full-file segment if no promotion was possible.
    pub fn promote_to_full_file(&self) -> Result<(), DownloadError> {
        let mut table = self.table.lock().unwrap();

        // Only a segment starting at byte 0 can be promoted to cover the
        // whole file — `promise_is_full_task` only proves the task's *end*
        // reaches the last byte, not that it started at the first one.
        let promoted_idx = table.iter().position(|seg| {
            seg.offset == 0
                && seg
                    .task
                    .as_ref()
                    .map(|t| t.must_use_range() && t.promise_is_full_task())
                    .unwrap_or(false)
        });

        let mut to_remove: Vec<PathBuf> = Vec::new();
        for (i, seg) in table.iter().enumerate() {
            if Some(i) == promoted_idx {
                continue;
            }
            if let Some(t) = &seg.task {
                t.stop();
            }
            to_remove.push(self.chunk_path(seg.offset));
        }

        let new_table = match promoted_idx {
            Some(i) => {
                let seg = &table[i];
                let mut full = Segment::new(seg.offset, self.content_length - seg.offset, seg.completed_length);
                full.task = seg.task.clone();
                info!(offset = seg.offset, "promoted in-flight task to full-file mode");
                vec![full]
            }
            None => {
                info!("no task eligible for promotion; restarting with a fresh full-file segment");
                vec![Segment::new(0, self.content_length, 0)]
            }
        };
        *table = new_table;
        drop(table);

        for path in to_remove {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove stale chunk during full-file promotion");
                }
            }
        }
        Ok(())
    }
}

/// The midpoint of a segment's remaining (not-yet-written) bytes, in
/// absolute file offsets.
fn proposed_split_end(seg_offset: u64, seg_target_length: u64, task_completed: u64) -> u64 {
    let task_offset = seg_offset + task_completed;
    let remaining = seg_target_length.saturating_sub(task_completed);
    task_offset + remaining / 2
}
