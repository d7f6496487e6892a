// Shared helpers used across the risk-control fabric, converters, and relay.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in whole seconds.
pub fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Truncate a string to `max_chars` Unicode scalar values, appending `...` if truncated.
/// Used for tool descriptions (9216 char cap) and similar oversized free-text fields.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let char_count = text.chars().count();
    if char_count <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

/// Placeholder text substituted for images older than the retained-turn window.
pub fn image_omitted_placeholder(count: usize) -> String {
    format!("[此消息包含 {count} 张图片，已在历史记录中省略]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_epoch_secs_is_positive() {
        assert!(now_epoch_secs() > 0);
    }

    #[test]
    fn test_truncate_with_ellipsis_short_text() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_with_ellipsis_long_text() {
        let text = "a".repeat(20);
        let result = truncate_with_ellipsis(&text, 5);
        assert_eq!(result, format!("{}...", "a".repeat(5)));
    }

    #[test]
    fn test_truncate_with_ellipsis_exact_length() {
        let text = "a".repeat(10);
        assert_eq!(truncate_with_ellipsis(&text, 10), text);
    }

    #[test]
    fn test_image_omitted_placeholder() {
        assert_eq!(
            image_omitted_placeholder(3),
            "[此消息包含 3 张图片，已在历史记录中省略]"
        );
    }
}
