//! # High-level Intermediate Representation (HIR)
//!
//! A CFG in SSA form, held in one arena per compilation. Blocks, instructions
//! and functions are addressed by index ([`BlockId`], [`InstrId`],
//! [`FunctionId`]); argument lists, use lists, predecessor and successor
//! edges and dominator-tree links are all plain indices, so cycles (loop phis,
//! back edges) need no ownership tricks.
//!
//! Every block carries an environment mapping each stack slot to its current
//! SSA value. Merging a second predecessor inserts phis where the incoming
//! environments disagree, which is all the renaming SSA construction needs.

use marlin_ast::{BinOpKind, ScopeSlot, Span};
use marlin_runtime::ConstantKind;
use smallvec::SmallVec;
use std::fmt;

use crate::root::{Root, RootSlot};
use crate::{CompilerError, CompilerResult, StructuralFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// Arena index of an instruction. Displayed with its even instruction number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstrId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl InstrId {
    pub fn number(self) -> u32 {
        self.0 * 2
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl fmt::Display for InstrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "i{}", self.number())
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}", self.0)
    }
}

// ====== REPRESENTATION LATTICE ======

/// Set of value kinds an instruction may produce.
///
/// `HOLE` is the "not computed yet" top element; intersecting with it is the
/// identity. `UNKNOWN` (the empty set) is what an inconclusive inference
/// settles on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Representation(pub u16);

impl Representation {
    pub const UNKNOWN: Self = Self(0);
    pub const NIL: Self = Self(0x01);
    pub const SMI: Self = Self(0x02);
    pub const HEAP_NUMBER: Self = Self(0x04);
    pub const NUMBER: Self = Self(0x06);
    pub const STRING: Self = Self(0x08);
    pub const BOOLEAN: Self = Self(0x10);
    pub const OBJECT: Self = Self(0x20);
    pub const ARRAY: Self = Self(0x40);
    pub const FUNCTION: Self = Self(0x80);
    pub const ANY: Self = Self(0xff);
    pub const HOLE: Self = Self(0x100);

    pub fn is(self, other: Representation) -> bool {
        self == other
    }

    pub fn intersects(self, other: Representation) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_hole(self) -> bool {
        self == Self::HOLE
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::UNKNOWN => "unknown",
            Self::NIL => "nil",
            Self::SMI => "smi",
            Self::HEAP_NUMBER => "heapnum",
            Self::NUMBER => "number",
            Self::STRING => "string",
            Self::BOOLEAN => "boolean",
            Self::OBJECT => "object",
            Self::ARRAY => "array",
            Self::FUNCTION => "function",
            Self::ANY => "any",
            Self::HOLE => "hole",
            _ => "mixed",
        }
    }
}

impl std::ops::BitAnd for Representation {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for Representation {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#x})", self.name(), self.0)
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ====== OPCODES ======

/// The closed set of HIR operations. Payload equality is the per-opcode part
/// of GVN equality: literals compare by pool slot, binary ops by operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HirOpcode {
    Nil,
    Literal(RootSlot),
    /// Function prologue; allocates a context with `context_slots` slots.
    Entry { context_slots: u32 },
    Return,
    Goto,
    If,
    BinOp(BinOpKind),
    Not,
    Typeof,
    Sizeof,
    Keysof,
    Clone,
    LoadContext(ScopeSlot),
    StoreContext(ScopeSlot),
    LoadProperty,
    StoreProperty,
    DeleteProperty,
    AllocateObject { size: u32 },
    AllocateArray { size: u32 },
    LoadArg,
    /// `(offset, rest, array)`: fill `array` with the trailing arguments.
    LoadVarArg,
    StoreArg,
    StoreVarArg,
    AlignStack,
    /// `(function, argc)`
    Call,
    Function { body: FunctionId, arg_count: u32 },
    Phi,
    CollectGarbage,
    GetStackTrace,
}

impl HirOpcode {
    pub fn name(&self) -> &'static str {
        match self {
            HirOpcode::Nil => "Nil",
            HirOpcode::Literal(_) => "Literal",
            HirOpcode::Entry { .. } => "Entry",
            HirOpcode::Return => "Return",
            HirOpcode::Goto => "Goto",
            HirOpcode::If => "If",
            HirOpcode::BinOp(_) => "BinOp",
            HirOpcode::Not => "Not",
            HirOpcode::Typeof => "Typeof",
            HirOpcode::Sizeof => "Sizeof",
            HirOpcode::Keysof => "Keysof",
            HirOpcode::Clone => "Clone",
            HirOpcode::LoadContext(_) => "LoadContext",
            HirOpcode::StoreContext(_) => "StoreContext",
            HirOpcode::LoadProperty => "LoadProperty",
            HirOpcode::StoreProperty => "StoreProperty",
            HirOpcode::DeleteProperty => "DeleteProperty",
            HirOpcode::AllocateObject { .. } => "AllocateObject",
            HirOpcode::AllocateArray { .. } => "AllocateArray",
            HirOpcode::LoadArg => "LoadArg",
            HirOpcode::LoadVarArg => "LoadVarArg",
            HirOpcode::StoreArg => "StoreArg",
            HirOpcode::StoreVarArg => "StoreVarArg",
            HirOpcode::AlignStack => "AlignStack",
            HirOpcode::Call => "Call",
            HirOpcode::Function { .. } => "Function",
            HirOpcode::Phi => "Phi",
            HirOpcode::CollectGarbage => "CollectGarbage",
            HirOpcode::GetStackTrace => "GetStackTrace",
        }
    }

    /// Fixed argument count; `None` for phis, which grow with predecessors.
    pub fn arity(&self) -> Option<usize> {
        Some(match self {
            HirOpcode::Nil
            | HirOpcode::Literal(_)
            | HirOpcode::Entry { .. }
            | HirOpcode::Goto
            | HirOpcode::LoadContext(_)
            | HirOpcode::AllocateObject { .. }
            | HirOpcode::AllocateArray { .. }
            | HirOpcode::Function { .. }
            | HirOpcode::CollectGarbage
            | HirOpcode::GetStackTrace => 0,
            HirOpcode::Return
            | HirOpcode::If
            | HirOpcode::Not
            | HirOpcode::Typeof
            | HirOpcode::Sizeof
            | HirOpcode::Keysof
            | HirOpcode::Clone
            | HirOpcode::StoreContext(_)
            | HirOpcode::LoadArg
            | HirOpcode::StoreArg
            | HirOpcode::StoreVarArg
            | HirOpcode::AlignStack => 1,
            HirOpcode::BinOp(_) | HirOpcode::LoadProperty | HirOpcode::DeleteProperty | HirOpcode::Call => 2,
            HirOpcode::StoreProperty | HirOpcode::LoadVarArg => 3,
            HirOpcode::Phi => return None,
        })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, HirOpcode::Return | HirOpcode::Goto | HirOpcode::If)
    }

    /// Whether two structurally equal instructions may NOT be merged.
    pub fn has_gvn_side_effects(&self) -> bool {
        match self {
            HirOpcode::Nil | HirOpcode::Literal(_) | HirOpcode::BinOp(_) | HirOpcode::Not | HirOpcode::Typeof => false,
            HirOpcode::LoadArg => false,
            HirOpcode::Entry { .. }
            | HirOpcode::Return
            | HirOpcode::Goto
            | HirOpcode::If
            | HirOpcode::Sizeof
            | HirOpcode::Keysof
            | HirOpcode::Clone
            | HirOpcode::LoadContext(_)
            | HirOpcode::StoreContext(_)
            | HirOpcode::LoadProperty
            | HirOpcode::StoreProperty
            | HirOpcode::DeleteProperty
            | HirOpcode::AllocateObject { .. }
            | HirOpcode::AllocateArray { .. }
            | HirOpcode::LoadVarArg
            | HirOpcode::StoreArg
            | HirOpcode::StoreVarArg
            | HirOpcode::AlignStack
            | HirOpcode::Call
            | HirOpcode::Function { .. }
            | HirOpcode::Phi
            | HirOpcode::CollectGarbage
            | HirOpcode::GetStackTrace => true,
        }
    }

    /// Stable per-opcode number mixed into the GVN hash.
    pub fn tag(&self) -> u32 {
        match self {
            HirOpcode::Nil => 0,
            HirOpcode::Literal(_) => 1,
            HirOpcode::Entry { .. } => 2,
            HirOpcode::Return => 3,
            HirOpcode::Goto => 4,
            HirOpcode::If => 5,
            HirOpcode::BinOp(_) => 6,
            HirOpcode::Not => 7,
            HirOpcode::Typeof => 8,
            HirOpcode::Sizeof => 9,
            HirOpcode::Keysof => 10,
            HirOpcode::Clone => 11,
            HirOpcode::LoadContext(_) => 12,
            HirOpcode::StoreContext(_) => 13,
            HirOpcode::LoadProperty => 14,
            HirOpcode::StoreProperty => 15,
            HirOpcode::DeleteProperty => 16,
            HirOpcode::AllocateObject { .. } => 17,
            HirOpcode::AllocateArray { .. } => 18,
            HirOpcode::LoadArg => 19,
            HirOpcode::LoadVarArg => 20,
            HirOpcode::StoreArg => 21,
            HirOpcode::StoreVarArg => 22,
            HirOpcode::AlignStack => 23,
            HirOpcode::Call => 24,
            HirOpcode::Function { .. } => 25,
            HirOpcode::Phi => 26,
            HirOpcode::CollectGarbage => 27,
            HirOpcode::GetStackTrace => 28,
        }
    }

    /// Payload contribution to the GVN hash.
    pub fn payload_hash(&self) -> u32 {
        match self {
            HirOpcode::Literal(slot) => slot.index,
            HirOpcode::BinOp(op) => *op as u32,
            HirOpcode::Entry { context_slots } => *context_slots,
            HirOpcode::LoadContext(slot) | HirOpcode::StoreContext(slot) => slot.index | (slot.depth << 16),
            HirOpcode::AllocateObject { size } | HirOpcode::AllocateArray { size } => *size,
            HirOpcode::Function { body, .. } => body.0,
            HirOpcode::Nil
            | HirOpcode::Return
            | HirOpcode::Goto
            | HirOpcode::If
            | HirOpcode::Not
            | HirOpcode::Typeof
            | HirOpcode::Sizeof
            | HirOpcode::Keysof
            | HirOpcode::Clone
            | HirOpcode::LoadProperty
            | HirOpcode::StoreProperty
            | HirOpcode::DeleteProperty
            | HirOpcode::LoadArg
            | HirOpcode::LoadVarArg
            | HirOpcode::StoreArg
            | HirOpcode::StoreVarArg
            | HirOpcode::AlignStack
            | HirOpcode::Call
            | HirOpcode::Phi
            | HirOpcode::CollectGarbage
            | HirOpcode::GetStackTrace => 0,
        }
    }
}

impl fmt::Display for HirOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HirOpcode::Literal(slot) => write!(f, "Literal[{}]", slot),
            HirOpcode::Entry { context_slots } => write!(f, "Entry[{}]", context_slots),
            HirOpcode::BinOp(op) => write!(f, "BinOp[{}]", op),
            HirOpcode::LoadContext(slot) => write!(f, "LoadContext[{}]", slot),
            HirOpcode::StoreContext(slot) => write!(f, "StoreContext[{}]", slot),
            HirOpcode::AllocateObject { size } => write!(f, "AllocateObject[{}]", size),
            HirOpcode::AllocateArray { size } => write!(f, "AllocateArray[{}]", size),
            HirOpcode::Function { body, arg_count } => write!(f, "Function[{}/{}]", body, arg_count),
            other => f.write_str(other.name()),
        }
    }
}

// ====== INSTRUCTIONS ======

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum HashState {
    #[default]
    Empty,
    InProgress,
    Done(u32),
}

/// GVN hash memo, valid only while `epoch` matches the running pass.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HashCache {
    pub epoch: u32,
    pub state: HashState,
}

#[derive(Debug, Clone)]
pub struct HirInstruction {
    pub id: InstrId,
    pub block: BlockId,
    pub opcode: HirOpcode,
    pub args: SmallVec<[InstrId; 3]>,
    /// One entry per argument occurrence in a consumer.
    pub uses: Vec<InstrId>,
    pub representation: Representation,
    pub span: Option<Span>,
    /// Variable this value was last bound to, for dumps.
    pub slot: Option<ScopeSlot>,
    pub removed: bool,
    /// Excluded from scheduling.
    pub pinned: bool,
    pub(crate) hash: HashCache,
    pub(crate) gcm_epoch: u32,
}

impl HirInstruction {
    pub fn is_phi(&self) -> bool {
        self.opcode == HirOpcode::Phi
    }

    pub fn literal_kind(&self) -> Option<ConstantKind> {
        match self.opcode {
            HirOpcode::Literal(slot) => Some(slot.kind),
            _ => None,
        }
    }
}

impl fmt::Display for HirInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.id, self.opcode)?;
        for (index, arg) in self.args.iter().enumerate() {
            f.write_str(if index == 0 { " " } else { ", " })?;
            write!(f, "{}", arg)?;
        }
        if !self.representation.is_hole() {
            write!(f, " : {}", self.representation)?;
        }
        if let Some(slot) = self.slot {
            write!(f, " ({})", slot)?;
        }
        Ok(())
    }
}

// ====== BLOCKS ======

/// Current SSA value and owning phi of every stack slot, plus the slot
/// short-circuit operators merge their result through.
#[derive(Debug, Clone, Default)]
pub struct HirEnvironment {
    values: Vec<Option<InstrId>>,
    phis: Vec<Option<InstrId>>,
}

impl HirEnvironment {
    pub fn new(stack_slots: u32) -> Self {
        let len = stack_slots as usize + 1;
        Self {
            values: vec![None; len],
            phis: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn logic_slot(&self) -> usize {
        self.values.len() - 1
    }

    pub fn at(&self, index: usize) -> Option<InstrId> {
        self.values.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, value: InstrId) {
        if let Some(entry) = self.values.get_mut(index) {
            *entry = Some(value);
        }
    }

    pub fn phi_at(&self, index: usize) -> Option<InstrId> {
        self.phis.get(index).copied().flatten()
    }

    pub fn set_phi(&mut self, index: usize, phi: InstrId) {
        if let Some(entry) = self.phis.get_mut(index) {
            *entry = Some(phi);
        }
    }

    /// Values only; phi ownership stays with the block that created them.
    fn copy_values_from(&mut self, other: &HirEnvironment) {
        self.values.clone_from(&other.values);
    }
}

/// Lengauer–Tarjan working state and results.
#[derive(Debug, Clone)]
pub struct DominatorInfo {
    pub parent: Option<BlockId>,
    pub ancestor: Option<BlockId>,
    pub label: BlockId,
    pub semi: u32,
    pub dominator: Option<BlockId>,
    /// Memoized tree depth; `-1` until computed.
    pub depth: i32,
    pub dominates: Vec<BlockId>,
}

impl DominatorInfo {
    fn new(block: BlockId) -> Self {
        Self {
            parent: None,
            ancestor: None,
            label: block,
            semi: 0,
            dominator: None,
            depth: -1,
            dominates: Vec::new(),
        }
    }

    pub(crate) fn reset(&mut self, block: BlockId) {
        *self = Self::new(block);
    }
}

#[derive(Debug, Clone)]
pub struct HirBlock {
    pub id: BlockId,
    pub function: FunctionId,
    /// Entry block of the enclosing function.
    pub root: BlockId,
    pub predecessors: SmallVec<[BlockId; 2]>,
    pub successors: SmallVec<[BlockId; 2]>,
    pub ended: bool,
    pub loop_header: bool,
    /// Join of a short-circuit operator; the only merge of the logic slot.
    pub logic_join: bool,
    pub loop_depth: u32,
    pub dfs_id: Option<u32>,
    pub dom: DominatorInfo,
    pub env: HirEnvironment,
    pub instructions: Vec<InstrId>,
    pub phis: Vec<InstrId>,
}

impl HirBlock {
    pub fn is_loop(&self) -> bool {
        self.loop_header
    }

    pub fn is_root(&self) -> bool {
        self.root == self.id
    }

    /// No predecessor and not a function entry: nothing can reach it.
    pub fn is_unreachable(&self) -> bool {
        self.predecessors.is_empty() && !self.is_root()
    }
}

#[derive(Debug, Clone)]
pub struct HirFunction {
    pub id: FunctionId,
    pub root: BlockId,
    /// Every block of the function; reverse postorder once dominators ran.
    pub blocks: Vec<BlockId>,
    pub arg_count: u32,
    pub variadic: bool,
    pub stack_slots: u32,
    pub context_slots: u32,
    pub span: Span,
}

// ====== GRAPH ======

#[derive(Debug, Clone, Default)]
pub struct HirGraph {
    pub blocks: Vec<HirBlock>,
    pub instructions: Vec<HirInstruction>,
    pub functions: Vec<HirFunction>,
    pub root: Root,
}

impl HirGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, id: BlockId) -> &HirBlock {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut HirBlock {
        &mut self.blocks[id.0 as usize]
    }

    pub fn instr(&self, id: InstrId) -> &HirInstruction {
        &self.instructions[id.0 as usize]
    }

    pub fn instr_mut(&mut self, id: InstrId) -> &mut HirInstruction {
        &mut self.instructions[id.0 as usize]
    }

    pub fn function(&self, id: FunctionId) -> &HirFunction {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut HirFunction {
        &mut self.functions[id.0 as usize]
    }

    /// Register a function and create its entry block.
    pub fn create_function(&mut self, arg_count: u32, variadic: bool, stack_slots: u32, context_slots: u32, span: Span) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        let root = BlockId(self.blocks.len() as u32);
        self.functions.push(HirFunction {
            id,
            root,
            blocks: Vec::new(),
            arg_count,
            variadic,
            stack_slots,
            context_slots,
            span,
        });
        self.push_block(id, root, 0);
        id
    }

    /// `CreateBlock(n)`: a fresh block with room for every stack slot of
    /// `function`, registered in its block list.
    pub fn create_block(&mut self, function: FunctionId, loop_depth: u32) -> BlockId {
        let root = self.function(function).root;
        self.push_block(function, root, loop_depth)
    }

    fn push_block(&mut self, function: FunctionId, root: BlockId, loop_depth: u32) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let stack_slots = self.function(function).stack_slots;
        self.blocks.push(HirBlock {
            id,
            function,
            root,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            ended: false,
            loop_header: false,
            logic_join: false,
            loop_depth,
            dfs_id: None,
            dom: DominatorInfo::new(id),
            env: HirEnvironment::new(stack_slots),
            instructions: Vec::new(),
            phis: Vec::new(),
        });
        self.function_mut(function).blocks.push(id);
        id
    }

    fn push_instruction(&mut self, block: BlockId, opcode: HirOpcode, args: &[InstrId], span: Option<Span>) -> InstrId {
        let id = InstrId(self.instructions.len() as u32);
        for arg in args {
            self.instr_mut(*arg).uses.push(id);
        }
        self.instructions.push(HirInstruction {
            id,
            block,
            opcode,
            args: SmallVec::from_slice(args),
            uses: Vec::new(),
            representation: Representation::HOLE,
            span,
            slot: None,
            removed: false,
            pinned: opcode.has_gvn_side_effects(),
            hash: HashCache::default(),
            gcm_epoch: 0,
        });
        id
    }

    fn check_arity(opcode: HirOpcode, args: &[InstrId]) -> CompilerResult<()> {
        match opcode.arity() {
            Some(expected) if expected != args.len() => Err(StructuralFault::ArityMismatch {
                opcode: opcode.name(),
                expected,
                actual: args.len(),
            }
            .into()),
            None if args.len() > 2 => Err(StructuralFault::ArityMismatch {
                opcode: opcode.name(),
                expected: 2,
                actual: args.len(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Append a non-terminator to `block`.
    pub fn add_instruction(&mut self, block: BlockId, opcode: HirOpcode, args: &[InstrId], span: Option<Span>) -> CompilerResult<InstrId> {
        Self::check_arity(opcode, args)?;
        if opcode.is_terminator() || opcode == HirOpcode::Phi {
            return Err(CompilerError::Lowering(format!(
                "{} is placed through goto/branch/ret/create_phi",
                opcode.name()
            )));
        }
        if self.block(block).ended {
            return Err(StructuralFault::BlockEnded {
                block: block.0,
                opcode: opcode.name(),
            }
            .into());
        }
        let id = self.push_instruction(block, opcode, args, span);
        self.block_mut(block).instructions.push(id);
        Ok(id)
    }

    /// Append `terminator` and mark `block` ended. No-op on an ended block;
    /// returns whether the terminator was placed.
    fn terminate(&mut self, block: BlockId, terminator: HirOpcode, args: &[InstrId]) -> CompilerResult<bool> {
        Self::check_arity(terminator, args)?;
        if self.block(block).ended {
            return Ok(false);
        }
        let id = self.push_instruction(block, terminator, args, None);
        let b = self.block_mut(block);
        b.instructions.push(id);
        b.ended = true;
        Ok(true)
    }

    fn add_successor(&mut self, block: BlockId, target: BlockId) -> CompilerResult<()> {
        if self.block(block).successors.len() >= 2 {
            return Err(StructuralFault::TooManySuccessors { block: block.0 }.into());
        }
        self.block_mut(block).successors.push(target);
        self.add_predecessor(target, block)
    }

    pub fn goto(&mut self, block: BlockId, target: BlockId) -> CompilerResult<()> {
        if !self.terminate(block, HirOpcode::Goto, &[])? || self.block(block).is_unreachable() {
            return Ok(());
        }
        self.add_successor(block, target)
    }

    pub fn branch(&mut self, block: BlockId, condition: InstrId, on_true: BlockId, on_false: BlockId) -> CompilerResult<()> {
        if !self.terminate(block, HirOpcode::If, &[condition])? || self.block(block).is_unreachable() {
            return Ok(());
        }
        self.add_successor(block, on_true)?;
        self.add_successor(block, on_false)
    }

    pub fn ret(&mut self, block: BlockId, value: InstrId) -> CompilerResult<()> {
        self.terminate(block, HirOpcode::Return, &[value])?;
        Ok(())
    }

    /// Wire `pred` into `block` and merge its environment.
    fn add_predecessor(&mut self, block: BlockId, pred: BlockId) -> CompilerResult<()> {
        let count = self.block(block).predecessors.len();
        if count >= 2 {
            return Err(StructuralFault::TooManyPredecessors { block: block.0 }.into());
        }
        self.block_mut(block).predecessors.push(pred);

        if count == 0 {
            let incoming = self.block(pred).env.clone();
            self.block_mut(block).env.copy_values_from(&incoming);
            return Ok(());
        }

        let incoming = self.block(pred).env.clone();
        let (logic_join, loop_header) = {
            let b = self.block(block);
            (b.logic_join, b.loop_header)
        };
        let logic_slot = incoming.logic_slot();
        for slot in 0..incoming.len() {
            if slot == logic_slot && !logic_join {
                continue;
            }
            let Some(value) = incoming.at(slot) else {
                continue;
            };
            let env = &self.block(block).env;
            let current = env.at(slot);
            let owned_phi = env.phi_at(slot).filter(|phi| self.instr(*phi).block == block);
            if let Some(phi) = owned_phi {
                self.add_phi_input(phi, value)?;
                continue;
            }
            if current == Some(value) {
                continue;
            }
            if loop_header {
                return Err(StructuralFault::MissingLoopPhi { block: block.0, slot }.into());
            }
            let phi = self.create_phi(block, slot);
            if let Some(current) = current {
                self.add_phi_input(phi, current)?;
            }
            self.add_phi_input(phi, value)?;
        }
        Ok(())
    }

    /// Create a phi for environment `slot` of `block` and rebind the slot to
    /// it immediately.
    pub fn create_phi(&mut self, block: BlockId, slot: usize) -> InstrId {
        let id = self.push_instruction(block, HirOpcode::Phi, &[], None);
        let logic_slot = self.block(block).env.logic_slot();
        if slot != logic_slot {
            self.instr_mut(id).slot = Some(ScopeSlot::stack(slot as u32));
        }
        let b = self.block_mut(block);
        b.phis.push(id);
        b.env.set(slot, id);
        b.env.set_phi(slot, id);
        id
    }

    pub fn add_phi_input(&mut self, phi: InstrId, input: InstrId) -> CompilerResult<()> {
        let block = self.instr(phi).block;
        let inputs = self.instr(phi).args.len();
        let limit = self.block(block).predecessors.len().max(1);
        if inputs >= 2 || inputs >= limit {
            return Err(StructuralFault::PhiInputOverflow { phi: phi.number() }.into());
        }
        self.instr_mut(phi).args.push(input);
        self.instr_mut(input).uses.push(phi);
        Ok(())
    }

    // ====== EDITING ======

    /// Redirect every occurrence of `old` in `user`'s arguments to `new`.
    pub fn replace_arg(&mut self, user: InstrId, old: InstrId, new: InstrId) {
        let mut replaced = 0;
        for arg in self.instr_mut(user).args.iter_mut() {
            if *arg == old {
                *arg = new;
                replaced += 1;
            }
        }
        if replaced == 0 {
            return;
        }
        self.instr_mut(old).uses.retain(|u| *u != user);
        for _ in 0..replaced {
            self.instr_mut(new).uses.push(user);
        }
        let user = self.instr_mut(user);
        user.representation = Representation::HOLE;
        user.hash = HashCache::default();
    }

    pub fn replace_all_uses(&mut self, old: InstrId, new: InstrId) {
        let mut users = self.instr(old).uses.clone();
        users.dedup();
        for user in users {
            self.replace_arg(user, old, new);
        }
    }

    /// Mark `id` removed and detach it from its arguments' use lists. The
    /// block keeps the id until [`HirGraph::compact`].
    pub fn remove_instruction(&mut self, id: InstrId) {
        let args = self.instr(id).args.clone();
        for arg in args {
            let uses = &mut self.instr_mut(arg).uses;
            if let Some(position) = uses.iter().position(|u| *u == id) {
                uses.swap_remove(position);
            }
        }
        self.instr_mut(id).removed = true;
    }

    pub fn compact(&mut self, block: BlockId) {
        let mut instructions = std::mem::take(&mut self.block_mut(block).instructions);
        instructions.retain(|i| !self.instr(*i).removed);
        self.block_mut(block).instructions = instructions;
    }

    /// Move `id` to the end of `target`, ahead of its terminator.
    pub fn move_to_end(&mut self, id: InstrId, target: BlockId) {
        let from = self.instr(id).block;
        self.block_mut(from).instructions.retain(|i| *i != id);
        let terminated = self
            .block(target)
            .instructions
            .last()
            .is_some_and(|last| self.instr(*last).opcode.is_terminator());
        let b = self.block_mut(target);
        if terminated {
            let at = b.instructions.len() - 1;
            b.instructions.insert(at, id);
        } else {
            b.instructions.push(id);
        }
        self.instr_mut(id).block = target;
    }

    pub fn terminator(&self, block: BlockId) -> Option<&HirInstruction> {
        self.block(block)
            .instructions
            .last()
            .map(|id| self.instr(*id))
            .filter(|instr| instr.opcode.is_terminator())
    }

    /// Live instructions of `block`, phis first.
    pub fn block_values(&self, block: BlockId) -> impl Iterator<Item = InstrId> + '_ {
        let b = self.block(block);
        b.phis
            .iter()
            .chain(b.instructions.iter())
            .copied()
            .filter(|id| !self.instr(*id).removed)
    }

    /// Every block must end in exactly one terminator, as its last instruction.
    pub fn verify_termination(&self, function: FunctionId) -> CompilerResult<()> {
        for block in &self.function(function).blocks {
            let b = self.block(*block);
            let terminators = b
                .instructions
                .iter()
                .filter(|id| self.instr(**id).opcode.is_terminator())
                .count();
            if !b.ended || terminators != 1 || self.terminator(*block).is_none() {
                return Err(StructuralFault::MissingTerminator { block: block.0 }.into());
            }
        }
        Ok(())
    }

    /// Graphviz rendering of `function`'s CFG.
    pub fn cfg_dot(&self, function: FunctionId) -> String {
        let (graph, _) = crate::dominance::cfg_graph(self, function);
        format!("{:?}", petgraph::dot::Dot::with_config(&graph, &[petgraph::dot::Config::EdgeNoLabel]))
    }
}

impl fmt::Display for HirGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for function in &self.functions {
            writeln!(
                f,
                "# {} args={} stack={} context={}",
                function.id, function.arg_count, function.stack_slots, function.context_slots
            )?;
            for block in &function.blocks {
                let b = self.block(*block);
                write!(f, "{}", b.id)?;
                if b.loop_header {
                    f.write_str(" (loop)")?;
                }
                if !b.predecessors.is_empty() {
                    let preds: Vec<String> = b.predecessors.iter().map(|p| p.to_string()).collect();
                    write!(f, " <- {}", preds.join(", "))?;
                }
                writeln!(f)?;
                for id in self.block_values(*block) {
                    writeln!(f, "  {}", self.instr(id))?;
                }
                if !b.successors.is_empty() {
                    let succs: Vec<String> = b.successors.iter().map(|s| s.to_string()).collect();
                    writeln!(f, "  -> {}", succs.join(", "))?;
                }
            }
        }
        Ok(())
    }
}
