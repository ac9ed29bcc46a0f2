//! Utility functions for string and value formatting.

pub mod format;

// Re-export commonly used functions at module level
pub use format::{format_cents, format_date, format_datetime, format_phone, truncate};
