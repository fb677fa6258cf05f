//! Small helpers shared across modules.

use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

/// Expand a leading `~` to `$HOME`.
///
/// - `"~"` → `"/home/user"`
/// - `"~/foo"` → `"/home/user/foo"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Whether `id` is a lowercase-hex v4-style UUID (`8-4-4-4-12`).
///
/// Session ids double as file names under the gateway root, so anything that
/// fails this check is rejected before touching the filesystem.
pub fn is_valid_session_id(id: &str) -> bool {
    let groups = [8usize, 4, 4, 4, 12];
    let mut parts = id.split('-');
    for len in groups {
        let Some(part) = parts.next() else {
            return false;
        };
        if part.len() != len
            || !part
                .bytes()
                .all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        {
            return false;
        }
    }
    parts.next().is_none()
}

/// Whether `id` is acceptable as a terminal session name.
///
/// The id is passed verbatim to the process muxer as `-s <id>`, so only a
/// conservative character set is allowed.
pub fn is_valid_terminal_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
}

/// Truncate `s` to at most `max` characters (not bytes).
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_session_id() {
        assert!(is_valid_session_id("0b7c46e5-8f2a-4c1d-9e3f-5a6b7c8d9e0f"));
    }

    #[test]
    fn test_invalid_session_ids() {
        assert!(!is_valid_session_id(""));
        assert!(!is_valid_session_id("not-a-uuid"));
        assert!(!is_valid_session_id("0B7C46E5-8F2A-4C1D-9E3F-5A6B7C8D9E0F"));
        assert!(!is_valid_session_id("0b7c46e5-8f2a-4c1d-9e3f-5a6b7c8d9e0"));
        assert!(!is_valid_session_id(
            "0b7c46e5-8f2a-4c1d-9e3f-5a6b7c8d9e0f-extra"
        ));
        assert!(!is_valid_session_id("../../../../etc/passwd"));
    }

    #[test]
    fn test_terminal_id() {
        assert!(is_valid_terminal_id("default"));
        assert!(is_valid_terminal_id("work_2.phone-a"));
        assert!(!is_valid_terminal_id(""));
        assert!(!is_valid_terminal_id("has space"));
        assert!(!is_valid_terminal_id("semi;colon"));
        assert!(!is_valid_terminal_id(&"x".repeat(65)));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 120), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Multi-byte chars count as one
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
