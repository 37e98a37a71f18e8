//! Human-friendly filename derivation (supplemented feature: the on-disk
//! `{hash}{ext}` naming in [`crate::chunk`] is what the coordinator and merge
//! stage rely on for resumption; this module only helps a caller choose a
//! display name, and never affects that naming scheme).

/// Default filename when URL path and Content-Disposition yield nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Derives a safe filename for presenting a download to a user.
///
/// Prefers the filename from `content_disposition` (if present and parseable),
/// otherwise uses the last path segment of `url`. The result is sanitized for
/// Linux (no `/`, NUL, or control chars; no leading/trailing dots or spaces).
pub fn derive_filename(url: &str, content_disposition: Option<&str>) -> String {
    let candidate = content_disposition
        .and_then(parse_content_disposition_filename)
        .filter(|s| !s.is_empty())
        .or_else(|| filename_from_url_path(url));

    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };

    let sanitized = sanitize_filename_for_linux(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Extracts the last path segment from a URL for use as a filename hint.
fn filename_from_url_path(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let path = parsed.path();
    let segment = path.split('/').filter(|s| !s.is_empty()).last()?;
    if segment.is_empty() || segment == "." || segment == ".." {
        return None;
    }
    Some(segment.to_string())
}

/// Sanitizes a candidate filename for safe use on Linux.
fn sanitize_filename_for_linux(name: &str) -> String {
    const NAME_MAX: usize = 255;

    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = false;

    for c in name.chars() {
        let replacement = if c == '\0' || c == '/' || c == '\\' || c.is_control() {
            '_'
        } else if c == ' ' || c == '\t' {
            '_'
        } else {
            c
        };

        if replacement == '_' {
            if !prev_underscore {
                out.push('_');
            }
            prev_underscore = true;
        } else {
            out.push(replacement);
            prev_underscore = false;
        }
    }

    let trimmed = out.trim_matches(|c| c == ' ' || c == '\t' || c == '.' || c == '_');

    if trimmed.len() > NAME_MAX {
        let mut take = NAME_MAX;
        while take > 0 && !trimmed.is_char_boundary(take) {
            take -= 1;
        }
        trimmed[..take].to_string()
    } else {
        trimmed.to_string()
    }
}

/// Extracts the filename from a raw Content-Disposition header value.
fn parse_content_disposition_filename(header_value: &str) -> Option<String> {
    let value = header_value.trim();
    let mut filename_from_token: Option<String> = None;

    for param in value.split(';') {
        let param = param.trim();
        if let Some((name, v)) = param.split_once('=') {
            let name = name.trim().to_ascii_lowercase();
            let v = v.trim();

            if name == "filename*" {
                if let Some(rest) = v.strip_prefix("utf-8''").or_else(|| v.strip_prefix("UTF-8''")) {
                    let decoded = decode_quoted_filename(&percent_decode(rest));
                    if !decoded.is_empty() {
                        return Some(decoded);
                    }
                }
            }

            if name == "filename" {
                let unquoted = if v.starts_with('"') && v.ends_with('"') && v.len() >= 2 {
                    decode_quoted_filename(&v[1..v.len() - 1])
                } else {
                    v.to_string()
                };
                if !unquoted.is_empty() {
                    filename_from_token = Some(unquoted);
                }
            }
        }
    }

    filename_from_token
}

fn decode_quoted_filename(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(&next) = chars.peek() {
                if next == '"' || next == '\\' {
                    out.push(chars.next().unwrap());
                    continue;
                }
            }
            out.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

fn percent_decode(input: &str) -> String {
    let mut out = Vec::new();
    let mut bytes = input.as_bytes().iter().cloned();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let h = bytes.next().and_then(hex_digit);
            let l = bytes.next().and_then(hex_digit);
            match (h, l) {
                (Some(high), Some(low)) => out.push(high << 4 | low),
                _ => {
                    out.push(b'%');
                    if let Some(x) = h {
                        out.push(x);
                    }
                    if let Some(x) = l {
                        out.push(x);
                    }
                }
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_filename_from_url_path() {
        assert_eq!(
            derive_filename("https://example.com/archive.zip", None),
            "archive.zip"
        );
    }

    #[test]
    fn derive_filename_from_content_disposition() {
        assert_eq!(
            derive_filename(
                "https://example.com/",
                Some("attachment; filename=\"report.pdf\"")
            ),
            "report.pdf"
        );
    }

    #[test]
    fn derive_filename_content_disposition_overrides_url() {
        assert_eq!(
            derive_filename(
                "https://example.com/archive.zip",
                Some("attachment; filename=\"real-name.tar.gz\"")
            ),
            "real-name.tar.gz"
        );
    }

    #[test]
    fn derive_filename_empty_url_path_fallback() {
        assert_eq!(
            derive_filename("https://example.com/", None),
            "download.bin"
        );
    }

    #[test]
    fn derive_filename_filename_star_precedence() {
        let r = derive_filename(
            "https://example.com/x",
            Some("attachment; filename=\"fallback.bin\"; filename*=UTF-8''real%20name.dat"),
        );
        assert_eq!(r, "real_name.dat");
    }

    #[test]
    fn sanitize_removes_slash_and_control_chars() {
        assert_eq!(sanitize_filename_for_linux("a/b\\c.txt"), "a_b_c.txt");
        assert_eq!(sanitize_filename_for_linux("file\x00name.txt"), "file_name.txt");
    }
}
