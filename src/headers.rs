use chrono::Utc;
use indexmap::IndexMap;

/// Synthetic key holding the full status line of an origin response.
pub const RESPONSE_KEY: &str = "response";
/// Synthetic key holding the numeric status code of an origin response.
pub const RESPONSE_CODE_KEY: &str = "response_code";

/// Header spellings that the usual hyphen-segment capitalization gets wrong,
/// plus the synthetic status entries, which stay lowercase.
const SPECIAL_NAMES: &[(&str, &str)] = &[
    ("etag", "ETag"),
    ("www-authenticate", "WWW-Authenticate"),
    ("x-offload-orig-etag", "X-Offload-Orig-ETag"),
    ("x-offload-orig-url", "X-Offload-Orig-URL"),
    ("x-offload-caching-pid", "X-Offload-Caching-PID"),
    (RESPONSE_KEY, RESPONSE_KEY),
    (RESPONSE_CODE_KEY, RESPONSE_CODE_KEY),
];

/// Canonical spelling for a header name. Lookup and insertion both
/// normalize through this, so comparisons are effectively
/// case-insensitive while the stored form stays stable.
pub fn canonical_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if let Some((_, spelled)) = SPECIAL_NAMES.iter().find(|(k, _)| *k == lower) {
        return (*spelled).to_string();
    }

    let mut out = String::with_capacity(name.len());
    for (i, segment) in lower.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars);
        }
    }
    out
}

/// An ordered header table: insertion order is preserved, duplicate keys
/// are last-write-wins, and names are canonicalized on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderTable {
    entries: IndexMap<String, String>,
}

impl HeaderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.entries
            .insert(canonical_name(name), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&canonical_name(name)).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&canonical_name(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record the origin status line under the synthetic `response` and
    /// `response_code` keys.
    pub fn set_status(&mut self, version: &str, code: u16, reason: &str) {
        let line = if reason.is_empty() {
            format!("{version} {code}")
        } else {
            format!("{version} {code} {reason}")
        };
        self.set(RESPONSE_KEY, &line);
        self.set(RESPONSE_CODE_KEY, &code.to_string());
    }

    pub fn status_line(&self) -> Option<&str> {
        self.get(RESPONSE_KEY)
    }

    pub fn response_code(&self) -> Option<u16> {
        self.get(RESPONSE_CODE_KEY)?.parse().ok()
    }
}

/// RFC 7231 IMF-fixdate, e.g. `Mon, 01 Jan 2024 00:00:00 GMT`.
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("content-length"), "Content-Length");
        assert_eq!(canonical_name("CONTENT-TYPE"), "Content-Type");
        assert_eq!(canonical_name("etag"), "ETag");
        assert_eq!(canonical_name("ETAG"), "ETag");
        assert_eq!(canonical_name("www-authenticate"), "WWW-Authenticate");
        assert_eq!(canonical_name("x-offload-is-weak"), "X-Offload-Is-Weak");
        assert_eq!(
            canonical_name("x-offload-caching-pid"),
            "X-Offload-Caching-PID"
        );
        assert_eq!(canonical_name("response"), "response");
        assert_eq!(canonical_name("response_code"), "response_code");
    }

    #[test]
    fn test_last_write_wins_keeps_position() {
        let mut t = HeaderTable::new();
        t.set("ETag", "\"a\"");
        t.set("Content-Length", "10");
        t.set("etag", "\"b\"");

        assert_eq!(t.get("ETag"), Some("\"b\""));
        let keys: Vec<&str> = t.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["ETag", "Content-Length"]);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let mut t = HeaderTable::new();
        t.set("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT");
        assert_eq!(
            t.get("last-modified"),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
    }

    #[test]
    fn test_status_line() {
        let mut t = HeaderTable::new();
        t.set_status("HTTP/1.1", 200, "OK");
        assert_eq!(t.status_line(), Some("HTTP/1.1 200 OK"));
        assert_eq!(t.response_code(), Some(200));
    }

    #[test]
    fn test_empty_value_preserved() {
        let mut t = HeaderTable::new();
        t.set("X-Empty", "");
        assert_eq!(t.get("X-Empty"), Some(""));
    }
}
