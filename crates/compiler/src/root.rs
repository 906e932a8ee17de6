//! Literal pool shared by every function of one compilation.
//!
//! Literals are interned by kind and source text; the pool is materialized
//! at run time as the context object the root register points at.

use indexmap::IndexSet;
use marlin_runtime::{Constant, ConstantKind};
use std::borrow::Cow;
use std::fmt;

/// A canonical pool entry. Literals referencing the same slot are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootSlot {
    pub index: u32,
    pub kind: ConstantKind,
    /// Set when the literal is a small integer encodable without the pool.
    pub immediate: Option<i64>,
}

impl RootSlot {
    pub fn is_immediate(&self) -> bool {
        self.immediate.is_some()
    }
}

impl fmt::Display for RootSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.immediate {
            Some(value) => write!(f, "#{}", value),
            None => write!(f, "root[{}]", self.index),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct Root {
    constants: IndexSet<Constant>,
}

impl Root {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, kind: ConstantKind, text: &str) -> RootSlot {
        let constant = Constant::new(kind, text);
        let immediate = constant.as_immediate();
        let (index, _) = self.constants.insert_full(constant);
        RootSlot {
            index: index as u32,
            kind,
            immediate,
        }
    }

    pub fn get(&self, slot: RootSlot) -> Option<&Constant> {
        self.constants.get_index(slot.index as usize)
    }

    pub fn len(&self) -> usize {
        self.constants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constants.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Constant> {
        self.constants.iter().cloned().collect()
    }
}

const SMALL_INTS: [&str; 10] = ["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"];

/// Decimal text of `value`, without formatting for 0-9.
pub fn small_int_text(value: usize) -> Cow<'static, str> {
    match SMALL_INTS.get(value) {
        Some(text) => Cow::Borrowed(text),
        None => Cow::Owned(value.to_string()),
    }
}

fn round_up(value: u32, to: u32) -> u32 {
    value.div_ceil(to) * to
}

/// Capacity hint for an object literal with `entries` keys.
pub fn object_size(entries: usize) -> u32 {
    round_up((entries as u32 + 1).next_power_of_two(), 64)
}

/// Capacity hint for an array literal with `items` elements.
pub fn array_size(items: usize) -> u32 {
    round_up((items as u32 + 1).next_power_of_two(), 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_is_by_kind_and_text() {
        let mut root = Root::new();
        let a = root.intern(ConstantKind::Number, "1");
        let b = root.intern(ConstantKind::Number, "1");
        let c = root.intern(ConstantKind::String, "1");
        assert_eq!(a, b);
        assert_ne!(a.index, c.index);
        assert_eq!(a.immediate, Some(1));
        assert_eq!(c.immediate, None);
        assert_eq!(root.len(), 2);
    }

    #[test]
    fn test_small_int_cache() {
        assert!(matches!(small_int_text(7), Cow::Borrowed("7")));
        assert_eq!(small_int_text(12), "12");
    }

    #[test]
    fn test_literal_sizes() {
        assert_eq!(object_size(0), 64);
        assert_eq!(object_size(70), 128);
        assert_eq!(array_size(3), 16);
        assert_eq!(array_size(20), 32);
    }
}
