//! # Marlin Runtime
//!
//! Everything compiled Marlin code touches at run time, and nothing the
//! compiler itself needs to reason about beyond a layout contract:
//!
//! - [`value`]: tagged-word encoding and the object header layout
//! - [`heap`]: `allocate(tag, size)` and the per-type side tables
//! - [`asm`]: the abstract [`MacroAssembler`] the code generator drives, and a
//!   recording [`Assembler`] implementing it
//! - [`stubs`]: the catalogue of named runtime stubs that call-bearing code
//!   jumps into
//! - [`module`]: the installable artifact produced by the compiler
//! - [`machine`]: a reference machine executing recorded code under either
//!   target's register file
//!
//! ## Design Goals
//!
//! - The compiler sees only [`Layout`] offsets and [`Stub`] names
//! - Emitted code runs deterministically so tests can check real results
//! - Caller-saved registers are poisoned after every stub call, so allocator
//!   mistakes surface as failures instead of silently working

pub mod asm;
pub mod error;
pub mod heap;
pub mod machine;
pub mod module;
pub mod stubs;
pub mod value;

pub use asm::{Assembler, Condition, Instruction, Label, MacroAssembler, Operand, Reg};
pub use error::{RuntimeError, RuntimeResult};
pub use heap::{Heap, PropertyKey};
pub use machine::Machine;
pub use module::{Code, CompiledModule, Constant, ConstantKind, FunctionInfo, MachineConfig};
pub use stubs::Stub;
pub use value::{HeapTag, Layout, Value, Word, NIL};
