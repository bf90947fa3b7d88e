//! Small helpers shared by config, HTTP clients and models.

use crate::{Error, Result};

/// Trim optional text; blank values become `None`.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Validate an http(s) base URL and strip trailing slashes so paths can be
/// appended with [`join_url`].
pub fn normalize_http_url(raw: String, field: &str) -> Result<String> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::InvalidInput(format!("{field} must not be empty")))?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::InvalidInput(format!(
            "{field} must include http:// or https://"
        )));
    }
    Ok(url.trim_end_matches('/').to_string())
}

pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Server error bodies end up in queue rows and logs; keep them short.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A local edit always moves `updated_at` forward, even when the clock did not.
pub fn next_timestamp(previous: i64) -> i64 {
    now_ms().max(previous + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blank_text_is_dropped() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some(" \t ".to_string())), None);
        assert_eq!(
            normalize_text_option(Some("  Groceries ".to_string())),
            Some("Groceries".to_string())
        );
    }

    #[test]
    fn http_urls_are_validated_and_trimmed() {
        assert_eq!(
            normalize_http_url(" https://api.example.com/ ".to_string(), "api_base_url").unwrap(),
            "https://api.example.com"
        );
        assert!(normalize_http_url("api.example.com".to_string(), "api_base_url").is_err());
        assert!(normalize_http_url("ftp://example.com".to_string(), "api_base_url").is_err());
        assert!(normalize_http_url("   ".to_string(), "api_base_url").is_err());
    }

    #[test]
    fn join_url_uses_single_separator() {
        assert_eq!(join_url("http://srv/", "/health"), "http://srv/health");
        assert_eq!(join_url("http://srv", "notes/1"), "http://srv/notes/1");
    }

    #[test]
    fn compact_text_limits_length() {
        assert_eq!(compact_text(&"x".repeat(500)).len(), 180);
    }

    #[test]
    fn next_timestamp_never_goes_backwards() {
        let far_future = now_ms() + 60_000;
        assert_eq!(next_timestamp(far_future), far_future + 1);
        assert!(next_timestamp(0) > 0);
    }
}
