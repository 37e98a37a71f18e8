//! Classify HTTP status and curl errors into retry policy error kinds.

use super::error::SegmentError;
use super::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
///
/// Only {408, 429, 502, 503, 504} are retryable, matching the set this spec
/// adopted from the system it was distilled from; other 5xx statuses are not
/// retried, only surfaced.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        408 | 502 | 504 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Classify a segment/probe error (curl or HTTP) into an ErrorKind.
pub fn classify(e: &SegmentError) -> ErrorKind {
    match e {
        SegmentError::Curl(ce) => classify_curl_error(ce),
        SegmentError::Http(code) => classify_http_status(*code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_429_and_503_throttled() {
        assert_eq!(classify_http_status(429), ErrorKind::Throttled);
        assert_eq!(classify_http_status(503), ErrorKind::Throttled);
    }

    #[test]
    fn http_retryable_statuses() {
        assert!(matches!(classify_http_status(408), ErrorKind::Http5xx(408)));
        assert!(matches!(classify_http_status(502), ErrorKind::Http5xx(502)));
        assert!(matches!(classify_http_status(504), ErrorKind::Http5xx(504)));
    }

    #[test]
    fn http_4xx_and_non_retryable_5xx_other() {
        assert_eq!(classify_http_status(404), ErrorKind::Other);
        assert_eq!(classify_http_status(403), ErrorKind::Other);
        assert_eq!(classify_http_status(500), ErrorKind::Other);
        assert_eq!(classify_http_status(501), ErrorKind::Other);
    }
}
