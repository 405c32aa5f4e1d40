//! Positional row slicing.

use std::cmp::min;
use std::fmt;

use crate::error::Result;
use crate::relation::{Relation, RelationNode};

use super::{build_unary, UnaryOperation};

/// A row filter that keeps rows whose positional index falls in
/// `[start, stop)`.
///
/// A slice is both order-dependent and count-dependent, so the optimizer
/// never moves it, and almost nothing moves past it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    start: u64,
    stop: Option<u64>,
}

impl Slice {
    pub fn new(start: u64, stop: Option<u64>) -> Self {
        Slice { start, stop }
    }

    /// First index to include.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last index to include; `None` for no upper bound.
    pub fn stop(&self) -> Option<u64> {
        self.stop
    }

    /// The maximum number of rows to include.
    pub fn limit(&self) -> Option<u64> {
        self.stop.map(|stop| stop.saturating_sub(self.start))
    }

    /// Return a new relation with only the rows inside the range.
    ///
    /// `slice[0:]` is a no-op. Slicing a sliced relation composes the
    /// ranges: the outer slice is relative to the inner slice's output.
    pub fn apply(&self, target: &Relation, lock: bool) -> Result<Relation> {
        if self.start == 0 && self.stop.is_none() {
            return Ok(target.clone());
        }
        if let RelationNode::Unary(rel) = target.node() {
            if let UnaryOperation::Slice(inner) = &rel.operation {
                let new_start = inner.start + self.start;
                let new_stop = match (inner.stop, self.stop) {
                    (None, None) => None,
                    (None, Some(stop)) => Some(stop + inner.start),
                    (Some(inner_stop), None) => Some(inner_stop),
                    (Some(inner_stop), Some(stop)) => Some(min(inner_stop, stop + inner.start)),
                };
                return Slice::new(new_start, new_stop).apply(&rel.target, lock);
            }
        }
        Ok(build_unary(UnaryOperation::Slice(*self), target, lock))
    }

    pub(crate) fn applied_min_rows(&self, target: &Relation) -> u64 {
        match self.limit() {
            Some(limit) => min(limit, target.min_rows()),
            None => target.min_rows(),
        }
    }

    pub(crate) fn applied_max_rows(&self, target: &Relation) -> Option<u64> {
        match (self.limit(), target.max_rows()) {
            (Some(limit), Some(max)) => Some(min(limit, max)),
            (Some(limit), None) => Some(limit),
            (None, max) => max,
        }
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stop {
            Some(stop) => write!(f, "slice[{}:{}]", self.start, stop),
            None => write!(f, "slice[{}:]", self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit() {
        assert_eq!(Slice::new(2, Some(10)).limit(), Some(8));
        assert_eq!(Slice::new(2, None).limit(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Slice::new(1, Some(5)).to_string(), "slice[1:5]");
        assert_eq!(Slice::new(3, None).to_string(), "slice[3:]");
    }
}
