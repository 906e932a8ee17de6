//! Failures raised while executing compiled code.

use thiserror::Error;

use crate::value::Word;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Out of memory: could not allocate {requested} words")]
    OutOfMemory { requested: u32 },

    #[error("Stack overflow")]
    StackOverflow,

    #[error("Invalid memory access at address {0:#x}")]
    InvalidAddress(Word),

    #[error("Called a value that is not a function: {0:#x}")]
    NotAFunction(Word),

    #[error("Jump to unbound label L{0}")]
    UnboundLabel(u32),

    #[error("Invalid instruction: {0}")]
    InvalidInstruction(String),

    #[error("Invalid constant literal: {0}")]
    InvalidConstant(String),

    #[error("Stub {stub} failed: {message}")]
    StubFailure { stub: String, message: String },

    #[error("Execution exceeded {0} steps")]
    StepLimitExceeded(u64),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
