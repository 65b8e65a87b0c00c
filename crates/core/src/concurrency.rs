//! Optimistic concurrency expectations.

use crate::error::{DomainError, DomainResult};

/// Expected current value for a compare-and-set write.
///
/// Seats are guarded by their full state (status + holding cart), payments by
/// their status. A write that finds anything other than the expectation must fail
/// rather than overwrite.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Expected<T> {
    /// Skip the check (blind write). Only used for reference-data loading.
    Any,
    /// Require the stored value to equal this one.
    Exact(T),
}

impl<T> Expected<T>
where
    T: PartialEq + core::fmt::Debug,
{
    pub fn matches(&self, actual: &T) -> bool {
        match self {
            Expected::Any => true,
            Expected::Exact(expected) => expected == actual,
        }
    }

    pub fn check(&self, actual: &T) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "compare-and-set failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}
