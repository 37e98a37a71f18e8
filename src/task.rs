//! SegmentTask: the per-segment HTTP range stream executor.
//!
//! One Task owns one open HTTP GET for one half-open byte interval
//! `[start, end]`, writing into one append-mode chunk file. Its `end` and
//! `hold_offset` are guarded by `end_lock` so a concurrent split (driven by
//! the coordinator, from another worker thread) can shrink the remaining
//! work without racing the in-flight write.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::DownloadError;
use crate::retry::{classify, ErrorKind, RetryDecision, RetryPolicy, SegmentError};

struct EndState {
    end: u64,
    hold_offset: u64,
}

/// The in-flight executor for one segment.
pub struct SegmentTask {
    url: String,
    headers: HashMap<String, String>,
    cookie_header: Option<String>,
    start: u64,
    total_bytes: u64,
    end_state: Mutex<EndState>,
    offset: AtomicU64,
    written_this_run: AtomicU64,
    stopped: AtomicBool,
    must_use_range: bool,
    disable_update_end: AtomicBool,
    know_range: Mutex<Option<bool>>,
    know_range_cv: Condvar,
}

enum AttemptOutcome {
    Success,
    Stopped,
}

enum AttemptError {
    Retryable(SegmentError),
    RangeUnsupported,
    Storage(std::io::Error),
}

impl SegmentTask {
    /// `assert_can_use_range` seeds the know-range latch as already-proved
    /// true — used for the tail segment produced by a split, whose sibling
    /// already demonstrated the origin honours ranges.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        headers: HashMap<String, String>,
        cookie_header: Option<String>,
        start: u64,
        end: u64,
        completed_bytes: u64,
        total_bytes: u64,
        assert_can_use_range: bool,
    ) -> Self {
        let must_use_range = (start + completed_bytes) > 0 || end < total_bytes.saturating_sub(1);
        Self {
            url,
            headers,
            cookie_header,
            start,
            total_bytes,
            end_state: Mutex::new(EndState {
                end,
                hold_offset: start.saturating_sub(1),
            }),
            offset: AtomicU64::new(start + completed_bytes),
            written_this_run: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            must_use_range,
            disable_update_end: AtomicBool::new(false),
            know_range: Mutex::new(if assert_can_use_range { Some(true) } else { None }),
            know_range_cv: Condvar::new(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end_state.lock().unwrap().end
    }

    pub fn completed_length(&self) -> u64 {
        self.offset.load(Ordering::Relaxed) - self.start
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Atomically sets `end := max(proposed, hold_offset)` and returns the
    /// effective new end. A no-op once the task has been promoted to full-file
    /// mode (`disable_update_end`).
    pub fn update_end(&self, proposed: u64) -> u64 {
        let mut st = self.end_state.lock().unwrap();
        if self.disable_update_end.load(Ordering::Relaxed) {
            return st.end;
        }
        let new_end = proposed.max(st.hold_offset);
        st.end = new_end;
        new_end
    }

    /// Checks `end == total_bytes - 1`; if so, latches `disable_update_end`
    /// and returns true. Used by the coordinator's full-file recovery path.
    pub fn promise_is_full_task(&self) -> bool {
        let st = self.end_state.lock().unwrap();
        if st.end == self.total_bytes.saturating_sub(1) {
            drop(st);
            self.disable_update_end.store(true, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    pub fn must_use_range(&self) -> bool {
        self.must_use_range
    }

    /// Non-blocking read of the know-range latch, for scheduler ranking.
    pub fn know_can_use_range(&self) -> Option<bool> {
        *self.know_range.lock().unwrap()
    }

    /// Blocks until the latch is set (the response has been received, or the
    /// task finished without ever discovering it). Used only by a split probe
    /// from another worker.
    pub fn wait_can_use_range(&self) -> bool {
        let mut guard = self.know_range.lock().unwrap();
        while guard.is_none() {
            guard = self.know_range_cv.wait(guard).unwrap();
        }
        guard.unwrap()
    }

    fn set_know_can_use_range(&self, value: bool) {
        let mut guard = self.know_range.lock().unwrap();
        if guard.is_none() {
            *guard = Some(value);
        }
        self.know_range_cv.notify_all();
    }

    /// Runs the streaming GET through the retry wrapper, writing to `file`
    /// (opened by the caller in append mode). Returns the number of bytes
    /// written during this invocation, whether the run succeeded outright or
    /// was cooperatively stopped. `on_finished` is always invoked exactly
    /// once, with that same count, even on failure.
    #[allow(clippy::too_many_arguments)]
    pub fn run<F>(
        &self,
        file: &File,
        chunk_path: &std::path::Path,
        chunk_size: usize,
        policy: &RetryPolicy,
        connect_timeout: Duration,
        total_timeout: Duration,
        mut on_finished: F,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(u64),
    {
        self.written_this_run.store(0, Ordering::Relaxed);
        let result = self.run_retrying(file, chunk_path, chunk_size, policy, connect_timeout, total_timeout);
        let written = self.written_this_run.load(Ordering::Relaxed);
        // Finally clause: unblock any split-probe waiter even if the request
        // died before range capability was ever discovered.
        self.set_know_can_use_range(false);
        on_finished(written);
        result.map(|_| written)
    }

    fn run_retrying(
        &self,
        file: &File,
        chunk_path: &std::path::Path,
        chunk_size: usize,
        policy: &RetryPolicy,
        connect_timeout: Duration,
        total_timeout: Duration,
    ) -> Result<(), DownloadError> {
        let mut attempt = 1u32;
        loop {
            match self.run_once(file, chunk_size, connect_timeout, total_timeout) {
                Ok(AttemptOutcome::Success) | Ok(AttemptOutcome::Stopped) => return Ok(()),
                Err(AttemptError::RangeUnsupported) => {
                    return Err(DownloadError::RangeUnsupported {
                        url: self.url.clone(),
                    })
                }
                Err(AttemptError::Storage(e)) => {
                    return Err(DownloadError::fs(chunk_path, e));
                }
                Err(AttemptError::Retryable(seg_err)) => {
                    if self.is_stopped() {
                        return Ok(());
                    }
                    let kind = classify(&seg_err);
                    match policy.decide(attempt, kind) {
                        RetryDecision::NoRetry => return Err(segment_error_to_download(seg_err, &self.url)),
                        RetryDecision::RetryAfter(d) => {
                            std::thread::sleep(d);
                            attempt += 1;
                        }
                    }
                }
            }
        }
    }

    fn run_once(
        &self,
        file: &File,
        chunk_size: usize,
        connect_timeout: Duration,
        total_timeout: Duration,
    ) -> Result<AttemptOutcome, AttemptError> {
        let (offset, end) = {
            let st = self.end_state.lock().unwrap();
            (self.offset.load(Ordering::Relaxed), st.end)
        };

        let mut easy = curl::easy::Easy::new();
        easy.url(&self.url).map_err(curl_retryable)?;
        easy.follow_location(true).map_err(curl_retryable)?;
        easy.connect_timeout(connect_timeout).map_err(curl_retryable)?;
        easy.timeout(total_timeout).map_err(curl_retryable)?;
        easy.range(&format!("{offset}-{end}")).map_err(curl_retryable)?;
        let _ = easy.buffer_size(chunk_size);

        let mut list = curl::easy::List::new();
        for (k, v) in &self.headers {
            list.append(&format!("{}: {}", k.trim(), v.trim())).map_err(curl_retryable)?;
        }
        if let Some(cookie) = &self.cookie_header {
            list.append(&format!("Cookie: {cookie}")).map_err(curl_retryable)?;
        }
        if !self.headers.is_empty() || self.cookie_header.is_some() {
            easy.http_headers(list).map_err(curl_retryable)?;
        }

        let header_lines: RefCell<Vec<String>> = RefCell::new(Vec::new());
        let range_known_once = Cell::new(false);
        let range_unsupported = Cell::new(false);
        let stopped_flag = Cell::new(false);
        let storage_error: RefCell<Option<std::io::Error>> = RefCell::new(None);

        {
            let mut transfer = easy.transfer();
            transfer
                .header_function(|data| {
                    if let Ok(s) = std::str::from_utf8(data) {
                        header_lines.borrow_mut().push(s.trim_end().to_string());
                    }
                    true
                })
                .map_err(curl_retryable)?;

            transfer
                .write_function(|data| {
                    if data.is_empty() {
                        return Ok(0);
                    }
                    if !range_known_once.get() {
                        range_known_once.set(true);
                        let status = parse_status_code(&header_lines.borrow()).unwrap_or(0);
                        let capable = check_range_capable(&header_lines.borrow(), offset, end, self.total_bytes, status);
                        self.set_know_can_use_range(capable);
                        if self.must_use_range && !capable {
                            range_unsupported.set(true);
                            return Ok(0);
                        }
                    }
                    if self.is_stopped() {
                        stopped_flag.set(true);
                        return Ok(0);
                    }
                    let begin = self.offset.load(Ordering::Relaxed);
                    let tentative_end = begin + data.len() as u64 - 1;
                    let (end_offset, is_last) = {
                        let mut st = self.end_state.lock().unwrap();
                        let e = tentative_end.min(st.end);
                        st.hold_offset = e;
                        (e, e >= st.end)
                    };
                    let written = if end_offset + 1 > begin { end_offset - begin + 1 } else { 0 };
                    if written > 0 {
                        let slice = &data[..written as usize];
                        if let Err(e) = file.write_all(slice) {
                            *storage_error.borrow_mut() = Some(e);
                            return Ok(0);
                        }
                        self.written_this_run.fetch_add(written, Ordering::Relaxed);
                        self.offset.store(end_offset + 1, Ordering::Relaxed);
                    }
                    if is_last || written == 0 {
                        return Ok(0);
                    }
                    Ok(data.len())
                })
                .map_err(curl_retryable)?;

            if let Err(e) = transfer.perform() {
                if !e.is_write_error() {
                    return Err(AttemptError::Retryable(SegmentError::Curl(e)));
                }
            }
        }

        if let Some(e) = storage_error.into_inner() {
            return Err(AttemptError::Storage(e));
        }

        let code = easy.response_code().map_err(curl_retryable)?;
        if !(200..300).contains(&code) {
            return Err(AttemptError::Retryable(SegmentError::Http(code)));
        }

        if range_unsupported.get() {
            return Err(AttemptError::RangeUnsupported);
        }

        if !range_known_once.get() {
            let capable = check_range_capable(&header_lines.borrow(), offset, end, self.total_bytes, code);
            self.set_know_can_use_range(capable);
            if self.must_use_range && !capable {
                return Err(AttemptError::RangeUnsupported);
            }
        }

        let _ = file.flush();

        if stopped_flag.get() || self.is_stopped() {
            return Ok(AttemptOutcome::Stopped);
        }
        Ok(AttemptOutcome::Success)
    }
}

fn curl_retryable(e: curl::Error) -> AttemptError {
    AttemptError::Retryable(SegmentError::Curl(e))
}

fn segment_error_to_download(e: SegmentError, url: &str) -> DownloadError {
    match e {
        SegmentError::Curl(ce) => DownloadError::Transport(ce),
        SegmentError::Http(status) => DownloadError::Http {
            url: url.to_string(),
            status,
        },
    }
}

/// The response must be a genuine `206 Partial Content` — a `200` carries the
/// full body regardless of what its `Content-Range`/`Content-Length` headers
/// say, and a range request answered with `200` means the origin ignored the
/// range (spec's adopted interpretation: "an honest 206 always satisfies
/// this; a 200 full-body response never does"). `Content-Range` must match
/// the exact requested interval and `Content-Length` must match the *full
/// resource total* (not the chunk size — see the open-question resolution in
/// the design notes).
fn check_range_capable(headers: &[String], offset: u64, end: u64, total_bytes: u64, status: u32) -> bool {
    if status != 206 {
        return false;
    }
    let expected_range = format!("bytes {offset}-{end}/{total_bytes}");
    let mut content_range_ok = false;
    let mut content_length_ok = false;
    for line in headers {
        if let Some((name, value)) = line.trim().split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-range") && value.eq_ignore_ascii_case(&expected_range) {
                content_range_ok = true;
            }
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    if n == total_bytes {
                        content_length_ok = true;
                    }
                }
            }
        }
    }
    content_range_ok && content_length_ok
}

/// Extracts the status code from the last `HTTP/...` status line seen (the
/// final one after any redirects `follow_location` has already chased).
fn parse_status_code(headers: &[String]) -> Option<u32> {
    headers.iter().rev().find_map(|line| {
        let line = line.trim();
        if !line.starts_with("HTTP/") {
            return None;
        }
        line.split_whitespace().nth(1)?.parse::<u32>().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn must_use_range_false_for_whole_file_from_start() {
        let task = SegmentTask::new(
            "http://x/a".into(),
            HashMap::new(),
            None,
            0,
            99,
            0,
            100,
            false,
        );
        assert!(!task.must_use_range());
    }

    #[test]
    fn must_use_range_true_for_non_initial_segment() {
        let task = SegmentTask::new(
            "http://x/a".into(),
            HashMap::new(),
            None,
            50,
            99,
            0,
            100,
            false,
        );
        assert!(task.must_use_range());
    }

    #[test]
    fn update_end_never_goes_below_hold_offset() {
        let task = SegmentTask::new("http://x/a".into(), HashMap::new(), None, 0, 99, 0, 100, false);
        {
            let mut st = task.end_state.lock().unwrap();
            st.hold_offset = 40;
        }
        let e = task.update_end(10);
        assert_eq!(e, 40);
    }

    #[test]
    fn update_end_is_noop_after_promotion() {
        let task = SegmentTask::new("http://x/a".into(), HashMap::new(), None, 0, 99, 0, 100, false);
        task.update_end(99);
        assert!(task.promise_is_full_task());
        let e = task.update_end(10);
        assert_eq!(e, 99);
    }

    #[test]
    fn promise_is_full_task_false_when_end_short() {
        let task = SegmentTask::new("http://x/a".into(), HashMap::new(), None, 0, 49, 0, 100, false);
        assert!(!task.promise_is_full_task());
    }

    #[test]
    fn assert_can_use_range_seeds_latch() {
        let task = SegmentTask::new("http://x/a".into(), HashMap::new(), None, 50, 99, 0, 100, true);
        assert_eq!(task.know_can_use_range(), Some(true));
    }

    #[test]
    fn wait_can_use_range_unblocks_once_latch_is_set() {
        use std::sync::Arc;

        let task = Arc::new(SegmentTask::new(
            "http://x/a".into(),
            HashMap::new(),
            None,
            0,
            99,
            0,
            100,
            false,
        ));
        let waiter = Arc::clone(&task);
        let handle = std::thread::spawn(move || waiter.wait_can_use_range());

        std::thread::sleep(Duration::from_millis(20));
        task.set_know_can_use_range(true);

        assert!(handle.join().unwrap());
    }

    #[test]
    fn check_range_capable_requires_both_headers() {
        let headers = vec![
            "Content-Range: bytes 0-49/100".to_string(),
            "Content-Length: 100".to_string(),
        ];
        assert!(check_range_capable(&headers, 0, 49, 100, 206));
        let headers_wrong_length = vec![
            "Content-Range: bytes 0-49/100".to_string(),
            "Content-Length: 50".to_string(),
        ];
        assert!(!check_range_capable(&headers_wrong_length, 0, 49, 100, 206));
    }

    #[test]
    fn check_range_capable_rejects_200_even_with_matching_headers() {
        // A whole-file request's matching Content-Range/Content-Length can
        // coincide with an origin that actually ignored the Range header and
        // answered 200; only a genuine 206 proves range support.
        let headers = vec![
            "Content-Range: bytes 0-99/100".to_string(),
            "Content-Length: 100".to_string(),
        ];
        assert!(check_range_capable(&headers, 0, 99, 100, 206));
        assert!(!check_range_capable(&headers, 0, 99, 100, 200));
    }

    #[test]
    fn parse_status_code_picks_final_status_line() {
        let headers = vec![
            "HTTP/1.1 302 Found".to_string(),
            "Location: https://example.com/x".to_string(),
            "HTTP/1.1 206 Partial Content".to_string(),
            "Content-Range: bytes 0-49/100".to_string(),
        ];
        assert_eq!(parse_status_code(&headers), Some(206));
    }

    #[test]
    fn parse_status_code_none_when_absent() {
        let headers = vec!["Content-Length: 100".to_string()];
        assert_eq!(parse_status_code(&headers), None);
    }
}
