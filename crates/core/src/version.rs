//! Optimistic concurrency for stored entities.
//!
//! Every save bumps an entity's version; a save that names the version it
//! loaded turns "load, validate, save" into a compare-and-swap.

use crate::error::{EngineError, EngineResult};

/// Version expectation attached to a save.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stored entity to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> EngineResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(EngineError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_only_matches_same_version() {
        assert!(ExpectedVersion::Exact(3).check(3).is_ok());
        assert!(matches!(
            ExpectedVersion::Exact(3).check(4),
            Err(EngineError::Conflict(_))
        ));
        assert!(ExpectedVersion::Any.matches(42));
    }
}
