//! HTTP HEAD metadata probe.

use std::collections::HashMap;
use std::str;
use std::time::Duration;

use crate::retry::{run_with_retry, RetryPolicy, SegmentError};

/// Result of a HEAD request: the metadata the coordinator needs to build its
/// segment table, plus a few fields carried only for filename derivation and
/// resume-safety comparison.
#[derive(Debug, Clone)]
pub struct HeadResult {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
}

/// Performs a HEAD request (retried per `policy`) and returns parsed metadata.
pub fn probe(
    url: &str,
    custom_headers: &HashMap<String, String>,
    policy: &RetryPolicy,
    connect_timeout: Duration,
    total_timeout: Duration,
) -> Result<HeadResult, SegmentError> {
    run_with_retry(policy, || {
        probe_once(url, custom_headers, connect_timeout, total_timeout)
    })
}

fn probe_once(
    url: &str,
    custom_headers: &HashMap<String, String>,
    connect_timeout: Duration,
    total_timeout: Duration,
) -> Result<HeadResult, SegmentError> {
    let mut headers: Vec<String> = Vec::new();

    let mut easy = curl::easy::Easy::new();
    easy.url(url).map_err(SegmentError::Curl)?;
    easy.nobody(true).map_err(SegmentError::Curl)?;
    easy.follow_location(true).map_err(SegmentError::Curl)?;
    easy.connect_timeout(connect_timeout)
        .map_err(SegmentError::Curl)?;
    easy.timeout(total_timeout).map_err(SegmentError::Curl)?;

    let mut list = curl::easy::List::new();
    for (k, v) in custom_headers {
        list.append(&format!("{}: {}", k.trim(), v.trim()))
            .map_err(SegmentError::Curl)?;
    }
    if !custom_headers.is_empty() {
        easy.http_headers(list).map_err(SegmentError::Curl)?;
    }

    {
        let mut transfer = easy.transfer();
        transfer
            .header_function(|data| {
                if let Ok(s) = str::from_utf8(data) {
                    headers.push(s.trim_end().to_string());
                }
                true
            })
            .map_err(SegmentError::Curl)?;
        transfer.perform().map_err(SegmentError::Curl)?;
    }

    let code = easy.response_code().map_err(SegmentError::Curl)?;
    if code < 200 || code >= 300 {
        return Err(SegmentError::Http(code));
    }

    Ok(parse_headers(&headers))
}

fn parse_headers(lines: &[String]) -> HeadResult {
    let mut content_length = None;
    let mut accept_ranges = false;
    let mut etag = None;
    let mut last_modified = None;
    let mut content_disposition = None;

    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("content-length") {
                if let Ok(n) = value.parse::<u64>() {
                    content_length = Some(n);
                }
            }
            if name.eq_ignore_ascii_case("accept-ranges") {
                accept_ranges = value.eq_ignore_ascii_case("bytes");
            }
            if name.eq_ignore_ascii_case("etag") {
                etag = Some(value.trim_matches('"').to_string());
            }
            if name.eq_ignore_ascii_case("last-modified") {
                last_modified = Some(value.to_string());
            }
            if name.eq_ignore_ascii_case("content-disposition") {
                content_disposition = Some(value.to_string());
            }
        }
    }

    HeadResult {
        content_length,
        accept_ranges,
        etag,
        last_modified,
        content_disposition,
    }
}
