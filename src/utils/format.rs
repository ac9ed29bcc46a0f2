use chrono::{DateTime, Utc};

/// Format a cent amount as dollars for display: 45000 -> "$450.00"
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("{}${}.{:02}", sign, cents / 100, cents % 100)
}

/// Format a phone number for display
/// Handles various input formats and normalizes to (XXX) XXX-XXXX
pub fn format_phone(phone: &str) -> String {
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    let local = match digits.len() {
        10 => digits.as_str(),
        11 => match digits.strip_prefix('1') {
            Some(local) => local,
            None => return phone.to_string(),
        },
        _ => return phone.to_string(), // Return original if can't format
    };
    format!("({}) {}-{}", &local[0..3], &local[3..6], &local[6..10])
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

/// Date for list views: "Mar 02, 2026"
pub fn format_date(at: DateTime<Utc>) -> String {
    at.format("%b %d, %Y").to_string()
}

/// Date and time for detail views: "Mar 02, 2026 @ 02:30 PM"
pub fn format_datetime(at: DateTime<Utc>) -> String {
    at.format("%b %d, %Y @ %I:%M %p").to_string()
}
