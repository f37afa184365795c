use serde::{Deserialize, Serialize};
use std::fmt;

/// A commit id in the bisected history.
///
/// Revisions are referenced, never created or mutated. Once resolved through
/// the VCS they hold the full hex object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated id for log lines and banners.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(idx, _)| idx);
        &self.0[..end]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl AsRef<str> for Revision {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_truncates_long_ids_only() {
        let full = Revision::new("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(full.short(), "0123456789ab");
        assert_eq!(Revision::new("abc").short(), "abc");
    }

    #[test]
    fn new_trims_surrounding_whitespace() {
        assert_eq!(Revision::new(" deadbeef\n").as_str(), "deadbeef");
    }
}
