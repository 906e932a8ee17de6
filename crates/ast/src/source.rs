//! Source location tracking

use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte range of the original source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn empty(pos: u32) -> Self {
        Self { start: pos, end: pos }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn merge(&self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_covers_both() {
        let a = Span::new(4, 9);
        let b = Span::new(1, 6);
        assert_eq!(a.merge(b), Span::new(1, 9));
        assert_eq!(a.merge(b).len(), 8);
        assert!(Span::empty(3).is_empty());
    }
}
