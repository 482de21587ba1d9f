//! Versioned records and compare-and-swap expectations.

/// Version a record carries after its first write.
pub const INITIAL_VERSION: u64 = 1;

/// A record the stores write with compare-and-swap.
///
/// The store owns the version: it stamps [`INITIAL_VERSION`] on insert and adds
/// one on every accepted update. Domain code only reads it.
pub trait AggregateRoot {
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    fn id(&self) -> &Self::Id;

    fn version(&self) -> u64;
}

/// What the caller believes the stored version to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Overwrite whatever is stored. Only for repair paths.
    Any,
    /// The version the caller read; a newer stored version is a conflict.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    /// The pinned version, if any (for SQL `WHERE version = $n` clauses).
    pub fn exact(self) -> Option<u64> {
        match self {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v),
        }
    }
}

impl core::fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("any version"),
            ExpectedVersion::Exact(v) => write!(f, "version {v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_matches_every_version() {
        assert!(ExpectedVersion::Any.matches(INITIAL_VERSION));
        assert!(ExpectedVersion::Any.matches(42));
        assert_eq!(ExpectedVersion::Any.exact(), None);
    }

    #[test]
    fn exact_rejects_stale_version() {
        assert!(ExpectedVersion::Exact(3).matches(3));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert_eq!(ExpectedVersion::Exact(3).to_string(), "version 3");
    }
}
