//! # Abstract Code Emitter
//!
//! [`MacroAssembler`] is the surface the code generator drives: register and
//! memory moves, integer arithmetic, compares, branches, pushes, stub calls
//! and function calls, plus label management. It is deliberately narrower
//! than a real ISA. Memory operands are always `[base + disp]`, and at most
//! one operand of an instruction may be in memory.
//!
//! [`Assembler`] records the stream as [`Instruction`]s, which is what the
//! reference [`Machine`](crate::machine::Machine) executes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::module::Code;
use crate::stubs::Stub;
use crate::value::Word;

/// A physical register, numbered by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reg(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operand {
    Reg(Reg),
    Imm(Word),
    Mem { base: Reg, disp: i32 },
}

impl Operand {
    pub fn mem(base: Reg, disp: i32) -> Self {
        Operand::Mem { base, disp }
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Operand::Mem { .. })
    }
}

impl From<Reg> for Operand {
    fn from(reg: Reg) -> Self {
        Operand::Reg(reg)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "r{}", r.0),
            Operand::Imm(v) => write!(f, "#{}", v),
            Operand::Mem { base, disp } => write!(f, "[r{}{:+}]", base.0, disp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Overflow,
    NoOverflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Mov { dst: Operand, src: Operand },
    Alu { op: AluOp, dst: Reg, src: Operand },
    Shl { dst: Reg, amount: u8 },
    Sar { dst: Reg, amount: u8 },
    Cmp { lhs: Operand, rhs: Operand },
    Jmp(Label),
    Jcc(Condition, Label),
    Push(Operand),
    Pop(Reg),
    /// Load the code address of a label, as stored in function objects.
    LoadLabel { dst: Reg, label: Label },
    CallStub(Stub),
    Call(Reg),
    Ret,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Mov { dst, src } => write!(f, "mov {}, {}", dst, src),
            Instruction::Alu { op, dst, src } => write!(f, "{:?} r{}, {}", op, dst.0, src),
            Instruction::Shl { dst, amount } => write!(f, "shl r{}, {}", dst.0, amount),
            Instruction::Sar { dst, amount } => write!(f, "sar r{}, {}", dst.0, amount),
            Instruction::Cmp { lhs, rhs } => write!(f, "cmp {}, {}", lhs, rhs),
            Instruction::Jmp(label) => write!(f, "jmp {}", label),
            Instruction::Jcc(cond, label) => write!(f, "j{:?} {}", cond, label),
            Instruction::Push(src) => write!(f, "push {}", src),
            Instruction::Pop(dst) => write!(f, "pop r{}", dst.0),
            Instruction::LoadLabel { dst, label } => write!(f, "lea r{}, {}", dst.0, label),
            Instruction::CallStub(stub) => write!(f, "call <{}>", stub.name()),
            Instruction::Call(reg) => write!(f, "call r{}", reg.0),
            Instruction::Ret => f.write_str("ret"),
        }
    }
}

/// Register-addressed emitter used by code generation.
pub trait MacroAssembler {
    fn new_label(&mut self) -> Label;
    fn bind(&mut self, label: Label);
    /// Index of the next emitted instruction.
    fn offset(&self) -> usize;

    fn mov(&mut self, dst: Operand, src: Operand);
    fn alu(&mut self, op: AluOp, dst: Reg, src: Operand);
    fn shl(&mut self, dst: Reg, amount: u8);
    fn sar(&mut self, dst: Reg, amount: u8);
    fn cmp(&mut self, lhs: Operand, rhs: Operand);
    fn jmp(&mut self, target: Label);
    fn jcc(&mut self, cond: Condition, target: Label);
    fn push(&mut self, src: Operand);
    fn pop(&mut self, dst: Reg);
    fn load_label(&mut self, dst: Reg, label: Label);
    fn call_stub(&mut self, stub: Stub);
    fn call(&mut self, function: Reg);
    fn ret(&mut self);

    fn add(&mut self, dst: Reg, src: Operand) {
        self.alu(AluOp::Add, dst, src)
    }

    fn sub(&mut self, dst: Reg, src: Operand) {
        self.alu(AluOp::Sub, dst, src)
    }

    fn and(&mut self, dst: Reg, src: Operand) {
        self.alu(AluOp::And, dst, src)
    }
}

/// Recording assembler.
#[derive(Debug, Default)]
pub struct Assembler {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn finish(self) -> Code {
        Code::new(self.instructions, self.labels)
    }

    fn emit(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }
}

impl MacroAssembler for Assembler {
    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label((self.labels.len() - 1) as u32)
    }

    fn bind(&mut self, label: Label) {
        let position = self.instructions.len();
        if let Some(slot) = self.labels.get_mut(label.0 as usize) {
            *slot = Some(position);
        }
    }

    fn offset(&self) -> usize {
        self.instructions.len()
    }

    fn mov(&mut self, dst: Operand, src: Operand) {
        if dst != src {
            self.emit(Instruction::Mov { dst, src });
        }
    }

    fn alu(&mut self, op: AluOp, dst: Reg, src: Operand) {
        self.emit(Instruction::Alu { op, dst, src });
    }

    fn shl(&mut self, dst: Reg, amount: u8) {
        self.emit(Instruction::Shl { dst, amount });
    }

    fn sar(&mut self, dst: Reg, amount: u8) {
        self.emit(Instruction::Sar { dst, amount });
    }

    fn cmp(&mut self, lhs: Operand, rhs: Operand) {
        self.emit(Instruction::Cmp { lhs, rhs });
    }

    fn jmp(&mut self, target: Label) {
        self.emit(Instruction::Jmp(target));
    }

    fn jcc(&mut self, cond: Condition, target: Label) {
        self.emit(Instruction::Jcc(cond, target));
    }

    fn push(&mut self, src: Operand) {
        self.emit(Instruction::Push(src));
    }

    fn pop(&mut self, dst: Reg) {
        self.emit(Instruction::Pop(dst));
    }

    fn load_label(&mut self, dst: Reg, label: Label) {
        self.emit(Instruction::LoadLabel { dst, label });
    }

    fn call_stub(&mut self, stub: Stub) {
        self.emit(Instruction::CallStub(stub));
    }

    fn call(&mut self, function: Reg) {
        self.emit(Instruction::Call(function));
    }

    fn ret(&mut self) {
        self.emit(Instruction::Ret);
    }
}
