//! Top-level orchestration: probe, resume, dispatch workers, merge.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::chunk;
use crate::config::DownloadConfig;
use crate::coordinator::DownloadCoordinator;
use crate::error::DownloadError;
use crate::merge;
use crate::pool::WorkerPool;
use crate::resume_meta::ResumeMeta;
use crate::retry::RetryPolicy;

/// Per-call inputs to [`download`]; `cfg` supplies everything else
/// (concurrency, retry, timeouts).
pub struct DownloadOptions {
    pub url: String,
    pub buffer_path: PathBuf,
    pub headers: HashMap<String, String>,
    pub cookie_header: Option<String>,
}

/// Downloads `opts.url` into `opts.buffer_path`, returning the path of the
/// merged target file. Idempotent: if the target already exists, returns
/// immediately without issuing any HTTP requests.
pub fn download(opts: DownloadOptions, cfg: &DownloadConfig) -> Result<PathBuf, DownloadError> {
    let hash = chunk::sha256_str(&opts.url);
    let ext = chunk::ext_from_url(&opts.url);
    let target_path = opts.buffer_path.join(chunk::target_file_name(&hash, &ext));
    if target_path.exists() {
        return Ok(target_path);
    }

    fs::create_dir_all(&opts.buffer_path).map_err(|e| DownloadError::fs(&opts.buffer_path, e))?;

    let policy = RetryPolicy::new(cfg.retry_times, Duration::from_secs_f64(cfg.retry_sleep));
    let connect_timeout = Duration::from_secs(cfg.connect_timeout_secs);
    let total_timeout = Duration::from_secs(cfg.total_timeout_secs);

    let coordinator = DownloadCoordinator::new(
        opts.url.clone(),
        opts.buffer_path.clone(),
        opts.headers,
        opts.cookie_header,
        cfg.min_task_length,
        &policy,
        connect_timeout,
        total_timeout,
    )?;

    let stale = match ResumeMeta::load(&opts.buffer_path, &coordinator.hash, &coordinator.ext)? {
        Some(prev) => !prev.matches(coordinator.content_length, &coordinator.etag),
        None => false,
    };
    if stale {
        warn!(url = %opts.url, "resource changed since last run; discarding stale chunk buffer");
        discard_stale_chunks(&opts.buffer_path, &coordinator.hash, &coordinator.ext)?;
    }
    ResumeMeta::new(coordinator.content_length, coordinator.etag.clone())
        .save(&opts.buffer_path, &coordinator.hash, &coordinator.ext)?;

    coordinator.load_buffer()?;

    let coordinator = Arc::new(coordinator);
    let worker_coordinator = Arc::clone(&coordinator);
    let n = cfg.threads_count.max(1);
    let chunk_size = cfg.chunk_size;

    let mut pool: WorkerPool<()> = WorkerPool::spawn(n, move |_worker_id, _sender| {
        worker_loop(&worker_coordinator, chunk_size, &policy, connect_timeout, total_timeout)
    });

    let mut first_error: Option<DownloadError> = None;
    while let Some(ev) = pool.recv() {
        if let crate::pool::PoolEvent::WorkerDone(Some(e)) = ev {
            if first_error.is_none() {
                coordinator.stop_tasks();
                first_error = Some(e);
            }
        }
    }
    pool.join();
    if let Some(e) = first_error {
        return Err(e);
    }

    let offsets = coordinator.offsets();
    let content_length = coordinator.content_length;
    let chunk_path_for = |offset: u64| coordinator.chunk_path(offset);

    match merge::merge_chunks(&offsets, content_length, &target_path, chunk_path_for) {
        Ok(consumed) => {
            if !consumed {
                merge::remove_chunks(&offsets, chunk_path_for);
            }
        }
        Err(e) => {
            let _ = fs::remove_file(&target_path);
            return Err(e);
        }
    }

    let _ = ResumeMeta::remove(&opts.buffer_path, &coordinator.hash, &coordinator.ext);
    info!(url = %opts.url, target = %target_path.display(), "download complete");
    Ok(target_path)
}

/// One worker's loop: pull a task, run it to completion, repeat until the
/// coordinator has no more work or the task reports `Stopped`.
fn worker_loop(
    coordinator: &DownloadCoordinator,
    chunk_size: usize,
    policy: &RetryPolicy,
    connect_timeout: Duration,
    total_timeout: Duration,
) -> Result<(), DownloadError> {
    loop {
        let task = match coordinator.next_task() {
            Some(t) => t,
            None => return Ok(()),
        };
        let chunk_path = coordinator.chunk_path(task.start());
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&chunk_path)
            .map_err(|e| DownloadError::fs(&chunk_path, e))?;

        let result = task.run(&file, &chunk_path, chunk_size, policy, connect_timeout, total_timeout, |written| {
            coordinator.on_task_finished(task.start(), written);
        });

        match result {
            Ok(_) => {
                if task.is_stopped() {
                    return Ok(());
                }
            }
            Err(DownloadError::RangeUnsupported { .. }) => {
                coordinator.promote_to_full_file()?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Removes every chunk file under `buffer_path` belonging to `(hash, ext)`.
fn discard_stale_chunks(buffer_path: &std::path::Path, hash: &str, ext: &str) -> Result<(), DownloadError> {
    for entry in fs::read_dir(buffer_path).map_err(|e| DownloadError::fs(buffer_path, e))? {
        let entry = entry.map_err(|e| DownloadError::fs(buffer_path, e))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if chunk::parse_chunk_file_name(name, hash, ext).is_some() {
            let _ = fs::remove_file(entry.path());
        }
    }
    Ok(())
}
