//! # Tagged Values and Object Layout
//!
//! A value is one machine word:
//!
//! - `0` is nil
//! - odd words are small integers, `(n << 1) | 1`
//! - any other word is the address of a heap object, aligned to the pointer
//!   size, whose first word holds its [`HeapTag`]
//!
//! Field offsets are expressed in bytes through [`Layout`], so the same
//! contract serves both the 8-byte and the 4-byte target.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Word = i64;

pub const NIL: Word = 0;

pub fn tag_smi(value: i64) -> Word {
    (value << 1) | 1
}

pub fn untag_smi(word: Word) -> i64 {
    word >> 1
}

pub fn is_smi(word: Word) -> bool {
    word & 1 == 1
}

pub fn is_heap_pointer(word: Word) -> bool {
    word != NIL && word & 1 == 0
}

/// Whether `value` survives tagging on a target with the given pointer size.
pub fn smi_fits(value: i64, pointer_size: u32) -> bool {
    let payload_bits = pointer_size * 8 - 1;
    let max = (1i64 << (payload_bits - 1)) - 1;
    let min = -(1i64 << (payload_bits - 1));
    (min..=max).contains(&value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HeapTag {
    Context = 1,
    Function = 2,
    Number = 3,
    String = 4,
    Boolean = 5,
    Object = 6,
    Array = 7,
}

impl HeapTag {
    pub fn from_word(word: Word) -> Option<HeapTag> {
        Some(match word {
            1 => HeapTag::Context,
            2 => HeapTag::Function,
            3 => HeapTag::Number,
            4 => HeapTag::String,
            5 => HeapTag::Boolean,
            6 => HeapTag::Object,
            7 => HeapTag::Array,
            _ => return None,
        })
    }

    pub fn type_name(self) -> &'static str {
        match self {
            HeapTag::Context => "context",
            HeapTag::Function => "function",
            HeapTag::Number => "number",
            HeapTag::String => "string",
            HeapTag::Boolean => "boolean",
            HeapTag::Object => "object",
            HeapTag::Array => "array",
        }
    }
}

/// Byte offsets of every field the generated code reads or writes.
///
/// | Object   | Fields after the tag word          |
/// |----------|------------------------------------|
/// | context  | parent, slot 0, slot 1, ...        |
/// | function | parent context, code label, argc   |
/// | number   | f64 bits                           |
/// | boolean  | 0 or 1                             |
/// | string, object, array | side-table handle     |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub pointer_size: u32,
}

impl Layout {
    pub const TAG_WORDS: u32 = 1;
    pub const CONTEXT_HEADER_WORDS: u32 = 2;
    pub const FUNCTION_WORDS: u32 = 4;
    pub const BOXED_WORDS: u32 = 2;

    /// Frame slots below the saved frame pointer, before any spill slot.
    pub const FRAME_ARG_BYTES: u32 = 0;
    pub const FRAME_ARGC: u32 = 1;
    pub const FRAME_CONTEXT: u32 = 2;
    pub const FRAME_MOVE_TEMP: u32 = 3;
    pub const FRAME_FIXED_SLOTS: u32 = 4;

    pub fn new(pointer_size: u32) -> Self {
        Self { pointer_size }
    }

    pub fn field(&self, index: u32) -> i32 {
        (index * self.pointer_size) as i32
    }

    pub fn tag_offset(&self) -> i32 {
        0
    }

    pub fn context_parent(&self) -> i32 {
        self.field(1)
    }

    pub fn context_slot(&self, index: u32) -> i32 {
        self.field(Self::CONTEXT_HEADER_WORDS + index)
    }

    pub fn function_parent(&self) -> i32 {
        self.field(1)
    }

    pub fn function_code(&self) -> i32 {
        self.field(2)
    }

    pub fn function_argc(&self) -> i32 {
        self.field(3)
    }

    /// Payload of numbers, booleans and handle-backed objects.
    pub fn value_field(&self) -> i32 {
        self.field(1)
    }

    /// The constant root is a context whose slots hold the literal pool.
    pub fn root_slot(&self, index: u32) -> i32 {
        self.context_slot(index)
    }

    /// Frame-pointer relative offset of fixed frame slot `index`.
    pub fn frame_slot(&self, index: u32) -> i32 {
        -(((index + 1) * self.pointer_size) as i32)
    }

    pub fn spill_slot(&self, index: u32) -> i32 {
        self.frame_slot(Self::FRAME_FIXED_SLOTS + index)
    }

    /// Frame-pointer relative offset of incoming argument `index`, above the
    /// saved frame pointer and return address.
    pub fn argument(&self, index: u32) -> i32 {
        self.field(2 + index)
    }

    pub fn pointer_shift(&self) -> u8 {
        self.pointer_size.trailing_zeros() as u8
    }
}

/// Host-side view of a value, for embedders and tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Smi(i64),
    Number(f64),
    Boolean(bool),
    String(String),
    Array(Vec<Value>),
    Object(Vec<(String, Value)>),
    Function { argc: i64 },
    Context,
    /// Nesting cut off while describing a cyclic or very deep structure.
    Elided,
}

impl Value {
    pub fn as_smi(&self) -> Option<i64> {
        match self {
            Value::Smi(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("nil"),
            Value::Smi(n) => write!(f, "{}", n),
            Value::Number(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
            Value::Object(entries) => {
                f.write_str("{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                f.write_str("}")
            }
            Value::Function { argc } => write!(f, "[function/{}]", argc),
            Value::Context => f.write_str("[context]"),
            Value::Elided => f.write_str("..."),
        }
    }
}
