//! Cache keys for the query engine.
//!
//! A [`QueryKey`] is an ordered sequence of primitive segments naming one
//! cached query: `orders`, `orders/count`, `appointments/42`. Keys compare
//! and hash over the whole sequence. Invalidation matches on prefixes, so
//! invalidating `orders` also covers `orders/count` and `orders/17`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One segment of a [`QueryKey`]: a text label or a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Id(i64),
    Text(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySegment::Id(id) => write!(f, "{}", id),
            KeySegment::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(s: &str) -> Self {
        KeySegment::Text(s.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(s: String) -> Self {
        KeySegment::Text(s)
    }
}

impl From<i64> for KeySegment {
    fn from(id: i64) -> Self {
        KeySegment::Id(id)
    }
}

/// Ordered key identifying one cached query.
///
/// Build with [`QueryKey::root`] and extend with [`QueryKey::join`]:
///
/// ```
/// use shopsync::cache::QueryKey;
///
/// let key = QueryKey::root("appointments").join(42);
/// assert_eq!(key.to_string(), "appointments/42");
/// assert!(key.starts_with(&QueryKey::root("appointments")));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
    /// Single-segment key.
    pub fn root(name: impl Into<KeySegment>) -> Self {
        QueryKey(vec![name.into()])
    }

    /// Appends a segment, consuming and returning the key.
    pub fn join(mut self, segment: impl Into<KeySegment>) -> Self {
        self.0.push(segment.into());
        self
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when `prefix` matches the leading segments of this key.
    ///
    /// Every key starts with the empty key, and with itself.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl From<Vec<KeySegment>> for QueryKey {
    fn from(segments: Vec<KeySegment>) -> Self {
        QueryKey(segments)
    }
}

impl From<&str> for QueryKey {
    fn from(name: &str) -> Self {
        QueryKey::root(name)
    }
}
