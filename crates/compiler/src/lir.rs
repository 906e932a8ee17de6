//! # Low-level Intermediate Representation (LIR)
//!
//! HIR lowered for one target: every operand is an interval, either virtual
//! (placed by the allocator) or fixed to a physical register. Instructions
//! sit at even positions (`2 * index`); an input used at `p` is live up to
//! `p + 1`, temps occupy `[p, p + 1)` and a result is born at `p + 1`, so an
//! instruction's result may reuse an input's register but never a temp's
//! before the temp dies.
//!
//! Phis become intervals defined at their block start; the moves feeding
//! them are recorded on each predecessor as gap moves and executed in
//! parallel before its final jump.

use marlin_ast::{BinOpKind, ScopeSlot};
use marlin_runtime::Reg;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;

use crate::hir::{BlockId, FunctionId, InstrId};
use crate::root::RootSlot;
use crate::target::RegisterFile;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalId(pub u32);

impl fmt::Display for IntervalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    Virtual,
    Fixed(Reg),
}

/// What a use needs from the value's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UseKind {
    Register,
    /// A stack slot will do (pushes, moves).
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsePosition {
    pub position: u32,
    pub kind: UseKind,
}

/// Half-open `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(Reg),
    /// Spill slot index.
    Stack(u32),
}

#[derive(Debug, Clone)]
pub struct LInterval {
    pub id: IntervalId,
    pub kind: IntervalKind,
    /// Sorted, non-overlapping, non-adjacent.
    pub ranges: Vec<LiveRange>,
    pub uses: Vec<UsePosition>,
    pub hint: Option<Reg>,
    /// Lives within a single instruction; must get a register.
    pub temp: bool,
    pub location: Option<Location>,
}

impl LInterval {
    pub fn new(id: IntervalId, kind: IntervalKind) -> Self {
        let location = match kind {
            IntervalKind::Fixed(reg) => Some(Location::Register(reg)),
            IntervalKind::Virtual => None,
        };
        Self {
            id,
            kind,
            ranges: Vec::new(),
            uses: Vec::new(),
            hint: None,
            temp: false,
            location,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.kind, IntervalKind::Fixed(_))
    }

    pub fn start(&self) -> u32 {
        self.ranges.first().map_or(u32::MAX, |r| r.start)
    }

    pub fn end(&self) -> u32 {
        self.ranges.last().map_or(0, |r| r.end)
    }

    pub fn covers(&self, position: u32) -> bool {
        self.ranges.iter().any(|r| r.start <= position && position < r.end)
    }

    pub fn intersects(&self, other: &LInterval) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.start < b.end && b.start < a.end {
                return true;
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Whether the value must survive the instruction at `position`.
    pub fn crosses(&self, position: u32) -> bool {
        self.covers(position) && self.covers(position + 1)
    }

    pub fn add_range(&mut self, start: u32, end: u32) {
        if start >= end {
            return;
        }
        let mut merged = LiveRange { start, end };
        let mut kept = Vec::with_capacity(self.ranges.len() + 1);
        for range in self.ranges.drain(..) {
            if range.end < merged.start || merged.end < range.start {
                kept.push(range);
            } else {
                merged.start = merged.start.min(range.start);
                merged.end = merged.end.max(range.end);
            }
        }
        let at = kept.iter().position(|r| r.start > merged.start).unwrap_or(kept.len());
        kept.insert(at, merged);
        self.ranges = kept;
    }

    /// Shorten the first range to begin at the definition.
    pub fn set_from(&mut self, position: u32) {
        match self.ranges.first_mut() {
            Some(first) if first.end > position => first.start = position,
            _ => self.add_range(position, position + 1),
        }
    }

    pub fn add_use(&mut self, position: u32, kind: UseKind) {
        self.uses.push(UsePosition { position, kind });
    }
}

impl fmt::Display for LInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if self.temp {
            f.write_str(" temp")?;
        }
        for range in &self.ranges {
            write!(f, " [{},{})", range.start, range.end)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LUse {
    pub interval: IntervalId,
    pub kind: UseKind,
}

impl LUse {
    pub fn register(interval: IntervalId) -> Self {
        Self {
            interval,
            kind: UseKind::Register,
        }
    }

    pub fn any(interval: IntervalId) -> Self {
        Self {
            interval,
            kind: UseKind::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LOpcode {
    Entry { context_slots: u32 },
    Return,
    Nil,
    Literal(RootSlot),
    Move,
    Goto,
    /// `coerce` runs the boolean coercion stub before testing.
    Branch { coerce: bool },
    /// `smi_fast` emits the inline tagged-integer path ahead of the stub.
    BinOp { op: BinOpKind, smi_fast: bool },
    Not,
    Typeof,
    Sizeof,
    Keysof,
    Clone,
    LoadProperty,
    StoreProperty,
    DeleteProperty,
    AllocateObject { size: u32 },
    AllocateArray { size: u32 },
    LoadContext(ScopeSlot),
    StoreContext(ScopeSlot),
    LoadArg,
    LoadVarArg,
    StoreArg,
    StoreVarArg,
    AlignStack,
    Call,
    Function { body: FunctionId, arg_count: u32 },
    CollectGarbage,
    GetStackTrace,
}

impl fmt::Display for LOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LOpcode::Entry { context_slots } => write!(f, "Entry[{}]", context_slots),
            LOpcode::Literal(slot) => write!(f, "Literal[{}]", slot),
            LOpcode::Branch { coerce } => write!(f, "Branch{}", if *coerce { "[coerce]" } else { "" }),
            LOpcode::BinOp { op, smi_fast } => write!(f, "BinOp[{}{}]", op, if *smi_fast { ",smi" } else { "" }),
            LOpcode::AllocateObject { size } => write!(f, "AllocateObject[{}]", size),
            LOpcode::AllocateArray { size } => write!(f, "AllocateArray[{}]", size),
            LOpcode::LoadContext(slot) => write!(f, "LoadContext[{}]", slot),
            LOpcode::StoreContext(slot) => write!(f, "StoreContext[{}]", slot),
            LOpcode::Function { body, arg_count } => write!(f, "Function[{}/{}]", body, arg_count),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LInstruction {
    pub position: u32,
    pub op: LOpcode,
    pub hir: Option<InstrId>,
    pub inputs: SmallVec<[LUse; 3]>,
    pub temps: SmallVec<[IntervalId; 1]>,
    pub result: Option<LUse>,
    /// Enters a runtime stub; caller-saved registers die here.
    pub has_call: bool,
}

impl LInstruction {
    pub fn new(position: u32, op: LOpcode, hir: Option<InstrId>) -> Self {
        Self {
            position,
            op,
            hir,
            inputs: SmallVec::new(),
            temps: SmallVec::new(),
            result: None,
            has_call: false,
        }
    }

    pub fn mark_has_call(&mut self) -> &mut Self {
        self.has_call = true;
        self
    }

    pub fn add_arg(&mut self, arg: LUse) -> &mut Self {
        self.inputs.push(arg);
        self
    }

    pub fn add_scratch(&mut self, temp: IntervalId) -> &mut Self {
        self.temps.push(temp);
        self
    }

    pub fn set_result(&mut self, result: LUse) -> &mut Self {
        self.result = Some(result);
        self
    }

    /// Calls into compiled code, which preserves no allocatable register.
    pub fn clobbers_all(&self) -> bool {
        self.op == LOpcode::Call
    }
}

#[derive(Debug, Clone)]
pub struct LBlock {
    pub hir: BlockId,
    /// Indices into [`LirFunction::instructions`], in order.
    pub instructions: Vec<usize>,
    /// `(source, phi)` pairs executed in parallel before the final jump.
    pub gap_moves: Vec<(IntervalId, IntervalId)>,
    pub phis: Vec<IntervalId>,
    pub successors: SmallVec<[usize; 2]>,
    pub predecessors: SmallVec<[usize; 2]>,
    /// First position of the block; `end` is one past its last instruction.
    pub start: u32,
    pub end: u32,
}

impl LBlock {
    pub fn new(hir: BlockId) -> Self {
        Self {
            hir,
            instructions: Vec::new(),
            gap_moves: Vec::new(),
            phis: Vec::new(),
            successors: SmallVec::new(),
            predecessors: SmallVec::new(),
            start: 0,
            end: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LirFunction {
    pub hir: FunctionId,
    pub blocks: Vec<LBlock>,
    pub instructions: Vec<LInstruction>,
    pub intervals: Vec<LInterval>,
    /// Interval holding each lowered HIR value.
    pub values: FxHashMap<InstrId, IntervalId>,
    pub arg_count: u32,
    pub stack_slots: u32,
    pub context_slots: u32,
    /// Filled in by the allocator.
    pub spill_slots: u32,
}

impl LirFunction {
    pub fn new(hir: FunctionId, arg_count: u32, stack_slots: u32, context_slots: u32) -> Self {
        Self {
            hir,
            blocks: Vec::new(),
            instructions: Vec::new(),
            intervals: Vec::new(),
            values: FxHashMap::default(),
            arg_count,
            stack_slots,
            context_slots,
            spill_slots: 0,
        }
    }

    pub fn interval(&self, id: IntervalId) -> &LInterval {
        &self.intervals[id.0 as usize]
    }

    pub fn interval_mut(&mut self, id: IntervalId) -> &mut LInterval {
        &mut self.intervals[id.0 as usize]
    }

    pub fn add_interval(&mut self, kind: IntervalKind) -> IntervalId {
        let id = IntervalId(self.intervals.len() as u32);
        self.intervals.push(LInterval::new(id, kind));
        id
    }

    /// Every call-bearing instruction.
    pub fn call_sites(&self) -> impl Iterator<Item = &LInstruction> + '_ {
        self.instructions.iter().filter(|i| i.has_call)
    }

    pub fn display<'a>(&'a self, registers: &'a RegisterFile) -> LirDisplay<'a> {
        LirDisplay {
            function: self,
            registers: Some(registers),
        }
    }
}

pub struct LirDisplay<'a> {
    function: &'a LirFunction,
    registers: Option<&'a RegisterFile>,
}

impl LirDisplay<'_> {
    fn location(&self, interval: IntervalId) -> String {
        let located = self.function.interval(interval).location;
        match (located, self.registers) {
            (Some(Location::Register(reg)), Some(file)) => format!("{}:{}", interval, file.name(reg)),
            (Some(Location::Register(reg)), None) => format!("{}:r{}", interval, reg.0),
            (Some(Location::Stack(slot)), _) => format!("{}:[s{}]", interval, slot),
            (None, _) => interval.to_string(),
        }
    }
}

impl fmt::Display for LirDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let function = self.function;
        writeln!(
            f,
            "# {} args={} context={} spills={}",
            function.hir, function.arg_count, function.context_slots, function.spill_slots
        )?;
        for (index, block) in function.blocks.iter().enumerate() {
            write!(f, "L{} ({})", index, block.hir)?;
            if !block.phis.is_empty() {
                let phis: Vec<String> = block.phis.iter().map(|p| self.location(*p)).collect();
                write!(f, " phis {}", phis.join(", "))?;
            }
            writeln!(f)?;
            for index in &block.instructions {
                let instr = &function.instructions[*index];
                write!(f, "  {:>4}: ", instr.position)?;
                if let Some(result) = instr.result {
                    write!(f, "{} = ", self.location(result.interval))?;
                }
                write!(f, "{}", instr.op)?;
                for (i, input) in instr.inputs.iter().enumerate() {
                    f.write_str(if i == 0 { " " } else { ", " })?;
                    write!(f, "{}", self.location(input.interval))?;
                }
                if !instr.temps.is_empty() {
                    let temps: Vec<String> = instr.temps.iter().map(|t| self.location(*t)).collect();
                    write!(f, " temps({})", temps.join(", "))?;
                }
                if instr.has_call {
                    f.write_str(" {call}")?;
                }
                writeln!(f)?;
            }
            for (source, phi) in &block.gap_moves {
                writeln!(f, "        gap {} <- {}", self.location(*phi), self.location(*source))?;
            }
        }
        for interval in &function.intervals {
            writeln!(f, "  {}", interval)?;
        }
        Ok(())
    }
}

/// Every function reachable from the top level, top level first.
#[derive(Debug, Clone, Default)]
pub struct LirProgram {
    pub functions: Vec<LirFunction>,
}

impl LirProgram {
    pub fn function(&self, id: FunctionId) -> Option<&LirFunction> {
        self.functions.iter().find(|f| f.hir == id)
    }
}

impl fmt::Display for LirProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in &self.functions {
            let view = LirDisplay {
                function,
                registers: None,
            };
            write!(f, "{}", view)?;
        }
        Ok(())
    }
}
