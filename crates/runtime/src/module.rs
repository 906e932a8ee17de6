//! # Compiled Artifact
//!
//! What the compiler hands to whoever installs the code: the recorded
//! instruction stream, per-function metadata, the literal pool and the
//! register conventions the code was generated for.

use serde::{Deserialize, Serialize};

use crate::asm::{Instruction, Label, Reg};
use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
}

impl Code {
    pub fn new(instructions: Vec<Instruction>, labels: Vec<Option<usize>>) -> Self {
        Self { instructions, labels }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn resolve(&self, label: Label) -> RuntimeResult<usize> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(RuntimeError::UnboundLabel(label.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstantKind {
    Number,
    String,
    Property,
    True,
    False,
}

/// One entry of the literal pool, by source text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constant {
    pub kind: ConstantKind,
    pub text: String,
}

impl Constant {
    pub fn new(kind: ConstantKind, text: impl Into<String>) -> Self {
        Self { kind, text: text.into() }
    }

    /// Integer value of a number literal that fits a tagged word on every target.
    pub fn as_immediate(&self) -> Option<i64> {
        if self.kind != ConstantKind::Number {
            return None;
        }
        let value: i64 = self.text.parse().ok()?;
        crate::value::smi_fits(value, 4).then_some(value)
    }
}

/// Metadata for one compiled function body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub entry: Label,
    pub arg_count: u32,
    pub stack_slots: u32,
    pub context_slots: u32,
    pub spill_slots: u32,
}

/// Register roles of the target the code was generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    pub pointer_size: u32,
    pub register_count: u8,
    pub stack_pointer: Reg,
    pub frame_pointer: Reg,
    pub context: Reg,
    pub root: Reg,
    /// Stub argument registers; the first also carries results and argc.
    pub stub_args: [Reg; 3],
    pub caller_saved: Vec<Reg>,
}

impl MachineConfig {
    pub fn result(&self) -> Reg {
        self.stub_args[0]
    }

    /// Register the callee leaves its argument byte count in on return.
    pub fn arg_pop(&self) -> Reg {
        self.stub_args[2]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledModule {
    pub code: Code,
    /// Entry 0 is the top-level function.
    pub functions: Vec<FunctionInfo>,
    pub constants: Vec<Constant>,
    pub machine: MachineConfig,
}

impl CompiledModule {
    pub fn entry(&self) -> Option<&FunctionInfo> {
        self.functions.first()
    }
}
