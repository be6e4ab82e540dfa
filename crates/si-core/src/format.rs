//! Formatting utilities

use chrono::{DateTime, Utc};

/// Format a timestamp relative to `now` (e.g., "2m ago")
pub fn relative_time_from(dt: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let diff = now.signed_duration_since(dt);

    if diff.num_seconds() < 0 {
        "just now".to_string()
    } else if diff.num_seconds() < 60 {
        format!("{}s ago", diff.num_seconds())
    } else if diff.num_minutes() < 60 {
        format!("{}m ago", diff.num_minutes())
    } else if diff.num_hours() < 24 {
        format!("{}h ago", diff.num_hours())
    } else {
        format!("{}d ago", diff.num_days())
    }
}

/// Format a timestamp as relative to the current time
pub fn relative_time(dt: DateTime<Utc>) -> String {
    relative_time_from(dt, Utc::now())
}

/// Truncate a string to max chars with ellipsis
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Shorten an age recipient for display (age1abcd…wxyz)
pub fn short_recipient(recipient: &str) -> String {
    let chars: Vec<char> = recipient.chars().collect();
    if chars.len() <= 16 {
        return recipient.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 6..].iter().collect();
    format!("{}...{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_relative_time() {
        let now = Utc::now();
        assert_eq!(relative_time_from(now - Duration::seconds(5), now), "5s ago");
        assert_eq!(relative_time_from(now - Duration::minutes(3), now), "3m ago");
        assert_eq!(relative_time_from(now - Duration::hours(2), now), "2h ago");
        assert_eq!(relative_time_from(now - Duration::days(4), now), "4d ago");
        assert_eq!(relative_time_from(now + Duration::days(1), now), "just now");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a longer string", 8), "a lon...");
        assert_eq!(truncate("abcdef", 2), "...");
    }

    #[test]
    fn test_short_recipient() {
        assert_eq!(short_recipient("age1short"), "age1short");
        let long = "age1qyqszqgpqyqszqgpqyqszqgpqyqszqgp";
        assert_eq!(short_recipient(long), "age1qyqs...qszqgp");
    }
}
