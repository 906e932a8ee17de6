//! Resolved variable storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a resolved variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    /// A slot in the current function's stack frame. Never visible to
    /// nested functions.
    Stack,
    /// A slot in a heap-allocated context object, shared with closures.
    Context,
}

/// A variable's resolved storage location.
///
/// `depth` is only meaningful for [`SlotKind::Context`]: it counts how many
/// function levels up the owning context is (0 is the current function's
/// own context).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeSlot {
    pub kind: SlotKind,
    pub index: u32,
    #[serde(default)]
    pub depth: u32,
    /// The resolver proved this slot only ever holds a constant small integer.
    #[serde(default)]
    pub immediate: bool,
}

impl ScopeSlot {
    pub fn stack(index: u32) -> Self {
        Self {
            kind: SlotKind::Stack,
            index,
            depth: 0,
            immediate: false,
        }
    }

    pub fn context(index: u32) -> Self {
        Self {
            kind: SlotKind::Context,
            index,
            depth: 0,
            immediate: false,
        }
    }

    /// The same context slot seen from a function nested `levels` deeper.
    pub fn outer(self, levels: u32) -> Self {
        Self {
            depth: self.depth + levels,
            ..self
        }
    }

    pub fn is_stack(&self) -> bool {
        self.kind == SlotKind::Stack
    }

    pub fn is_context(&self) -> bool {
        self.kind == SlotKind::Context
    }
}

impl fmt::Display for ScopeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            SlotKind::Stack => write!(f, "s{}", self.index),
            SlotKind::Context => write!(f, "c{}@{}", self.index, self.depth),
        }
    }
}
