//! Byte-range handling for download resume and "web accelerators".
//!
//! Only single `bytes=` ranges are honored. An empty start bound
//! defaults to zero and an empty end bound to the last byte, so
//! `bytes=-500` reads as "0 through 500" here, not as an RFC 9110
//! suffix range. A range value with no `-` at all is ignored and the
//! full body served.

use tracing::debug;

use crate::error::{OffloadError, OffloadResult};

/// The window of the cached body to send: inclusive bounds, plus
/// whether this is a partial (`206`) reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: i64,
    pub end: i64,
    pub partial: bool,
}

impl ByteWindow {
    pub fn full(total: i64) -> Self {
        Self {
            start: 0,
            end: total - 1,
            partial: false,
        }
    }

    /// The `Content-Length` of the reply.
    pub fn length(&self) -> i64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a partial reply.
    pub fn content_range(&self, total: i64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Resolve the client's `Range` header against a body of `total` bytes.
/// `If-Range` is observed and ignored; the range is treated as absent.
pub fn resolve(
    range: Option<&str>,
    if_range: Option<&str>,
    total: i64,
) -> OffloadResult<ByteWindow> {
    let mut window = ByteWindow::full(total);

    if if_range.is_some() {
        debug!(if_range = ?if_range, "client set If-Range; unsupported, ignoring range");
        return validated(window, total);
    }

    let Some(range) = range else {
        return validated(window, total);
    };

    debug!(range = %range, "client requested a range");
    let bytes_unit = range.get(..6).is_some_and(|u| u.eq_ignore_ascii_case("bytes="));
    if !bytes_unit {
        return Err(OffloadError::BadRequest(
            "Only ranges of 'bytes' accepted.".to_string(),
        ));
    }
    if range.contains(',') {
        return Err(OffloadError::BadRequest(
            "Multiple ranges not currently supported".to_string(),
        ));
    }

    let spec = &range[6..];
    if let Some((start_str, end_str)) = spec.split_once('-') {
        window.start = parse_bound(start_str, 0)?;
        window.end = parse_bound(end_str, total - 1)?;
        window.partial = true;
    }

    validated(window, total)
}

fn parse_bound(text: &str, default: i64) -> OffloadResult<i64> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(default);
    }
    text.parse()
        .map_err(|_| OffloadError::BadRequest("Bad content range requested.".to_string()))
}

fn validated(mut window: ByteWindow, total: i64) -> OffloadResult<ByteWindow> {
    // apparently it's legal to request past the end
    if window.end >= total {
        window.end = total - 1;
    }

    let invalid = window.start < 0
        || window.start >= total
        || window.end < 0
        || window.end >= total
        || window.start > window.end;
    if invalid {
        return Err(OffloadError::BadRequest(
            "Bad content range requested.".to_string(),
        ));
    }
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_range_is_full_window() {
        let w = resolve(None, None, 1024).unwrap();
        assert_eq!(w, ByteWindow { start: 0, end: 1023, partial: false });
        assert_eq!(w.length(), 1024);
    }

    #[test]
    fn test_explicit_range() {
        let w = resolve(Some("bytes=100-199"), None, 1024).unwrap();
        assert_eq!(w, ByteWindow { start: 100, end: 199, partial: true });
        assert_eq!(w.length(), 100);
        assert_eq!(w.content_range(1024), "bytes 100-199/1024");
    }

    #[test]
    fn test_open_ended_range() {
        let w = resolve(Some("bytes=500-"), None, 1024).unwrap();
        assert_eq!(w, ByteWindow { start: 500, end: 1023, partial: true });
    }

    #[test]
    fn test_empty_start_defaults_to_zero() {
        // not a suffix range: empty start means "from byte 0"
        let w = resolve(Some("bytes=-500"), None, 1024).unwrap();
        assert_eq!(w, ByteWindow { start: 0, end: 500, partial: true });
    }

    #[test]
    fn test_end_clamped_to_body() {
        let w = resolve(Some("bytes=0-9999"), None, 1024).unwrap();
        assert_eq!(w.end, 1023);
    }

    #[test]
    fn test_dashless_range_serves_full_body() {
        let w = resolve(Some("bytes=123"), None, 1024).unwrap();
        assert!(!w.partial);
        assert_eq!(w.length(), 1024);
    }

    #[test]
    fn test_non_bytes_unit_rejected() {
        let err = resolve(Some("chapters=1-2"), None, 1024).unwrap_err();
        assert!(matches!(err, OffloadError::BadRequest(_)));
    }

    #[test]
    fn test_multi_range_rejected() {
        let err = resolve(Some("bytes=0-100,200-300"), None, 1024).unwrap_err();
        assert!(matches!(err, OffloadError::BadRequest(_)));
    }

    #[test]
    fn test_inverted_and_overlong_ranges_rejected() {
        assert!(resolve(Some("bytes=500-100"), None, 1024).is_err());
        assert!(resolve(Some("bytes=2000-"), None, 1024).is_err());
        assert!(resolve(Some("bytes=-1-5"), None, 1024).is_err());
    }

    #[test]
    fn test_garbage_bound_rejected() {
        assert!(resolve(Some("bytes=abc-def"), None, 1024).is_err());
    }

    #[test]
    fn test_zero_length_body_rejected() {
        // the window over an empty body can never be satisfied
        assert!(resolve(None, None, 0).is_err());
    }

    #[test]
    fn test_if_range_disables_range() {
        let w = resolve(Some("bytes=100-199"), Some("\"x\""), 1024).unwrap();
        assert!(!w.partial);
        assert_eq!(w.length(), 1024);
    }
}
