//! # LIR Lowering
//!
//! Turns each optimized HIR function into LIR for one target. Bodies are
//! lowered lazily: the top-level function first, then every function body a
//! `Function` instruction refers to, each exactly once.
//!
//! The per-opcode rules live in [`x64`] and [`ia32`] behind
//! [`LoweringRules`]; this module holds the machinery they share:
//! interval creation, moves into fixed registers, results handed back from
//! fixed registers, and the phi gap moves added once every block is lowered.

mod ia32;
mod x64;

use marlin_runtime::Reg;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;

use crate::hir::{BlockId, FunctionId, HirGraph, HirInstruction, InstrId, Representation};
use crate::lir::{IntervalId, IntervalKind, LBlock, LInstruction, LOpcode, LUse, LirFunction, LirProgram};
use crate::target::{RegisterFile, Target};
use crate::{CompilerError, CompilerResult, StructuralFault};

pub use ia32::Ia32Rules;
pub use x64::X64Rules;

/// One lowering rule per HIR opcode for a target.
pub trait LoweringRules {
    fn lower(&self, cx: &mut FunctionLowering<'_>, id: InstrId) -> CompilerResult<()>;
}

pub struct LirBuilder<'g> {
    graph: &'g HirGraph,
    target: Target,
}

impl<'g> LirBuilder<'g> {
    pub fn new(graph: &'g HirGraph, target: Target) -> Self {
        Self { graph, target }
    }

    pub fn build(self, root: FunctionId) -> CompilerResult<LirProgram> {
        let rules: Box<dyn LoweringRules> = match self.target {
            Target::X64 => Box::new(X64Rules),
            Target::Ia32 => Box::new(Ia32Rules),
        };
        let registers = self.target.registers();

        let mut program = LirProgram::default();
        let mut queue = VecDeque::from([root]);
        let mut seen = FxHashSet::default();
        seen.insert(root);

        while let Some(id) = queue.pop_front() {
            let mut cx = FunctionLowering::new(self.graph, registers, id);
            cx.lower_function(rules.as_ref())?;
            for body in cx.referenced.drain(..) {
                if seen.insert(body) {
                    queue.push_back(body);
                }
            }
            log::debug!(
                "[LIR] {} on {}: {} blocks, {} instructions, {} intervals",
                id,
                self.target,
                cx.function.blocks.len(),
                cx.function.instructions.len(),
                cx.function.intervals.len()
            );
            program.functions.push(cx.function);
        }
        Ok(program)
    }
}

/// Lowering state for one function body.
pub struct FunctionLowering<'g> {
    graph: &'g HirGraph,
    registers: &'static RegisterFile,
    function: LirFunction,
    block_index: FxHashMap<BlockId, usize>,
    current: usize,
    referenced: Vec<FunctionId>,
}

impl<'g> FunctionLowering<'g> {
    fn new(graph: &'g HirGraph, registers: &'static RegisterFile, id: FunctionId) -> Self {
        let hir = graph.function(id);
        Self {
            graph,
            registers,
            function: LirFunction::new(id, hir.arg_count, hir.stack_slots, hir.context_slots),
            block_index: FxHashMap::default(),
            current: 0,
            referenced: Vec::new(),
        }
    }

    fn lower_function(&mut self, rules: &dyn LoweringRules) -> CompilerResult<()> {
        let graph = self.graph;
        let blocks = &graph.function(self.function.hir).blocks;
        for (index, block) in blocks.iter().enumerate() {
            self.block_index.insert(*block, index);
            self.function.blocks.push(LBlock::new(*block));
        }

        // Phi intervals exist before any block is lowered so back-edge
        // inputs can refer to them.
        for (index, block) in blocks.iter().enumerate() {
            let hir_block = graph.block(*block);
            for phi in hir_block.phis.iter().filter(|p| !graph.instr(**p).removed) {
                let interval = self.function.add_interval(IntervalKind::Virtual);
                self.function.values.insert(*phi, interval);
                self.function.blocks[index].phis.push(interval);
            }
            let successors = hir_block.successors.iter().filter_map(|s| self.block_index.get(s).copied()).collect();
            let predecessors = hir_block
                .predecessors
                .iter()
                .filter_map(|p| self.block_index.get(p).copied())
                .collect();
            let lblock = &mut self.function.blocks[index];
            lblock.successors = successors;
            lblock.predecessors = predecessors;
        }

        for (index, block) in blocks.iter().enumerate() {
            self.current = index;
            let start = self.position();
            for id in &graph.block(*block).instructions {
                if !graph.instr(*id).removed {
                    rules.lower(self, *id)?;
                }
            }
            let end = self.position();
            let lblock = &mut self.function.blocks[index];
            lblock.start = start;
            lblock.end = end;
        }

        self.resolve_phis()
    }

    /// Record, on every predecessor of a phi block, the moves that feed the
    /// phis along that edge.
    fn resolve_phis(&mut self) -> CompilerResult<()> {
        let graph = self.graph;
        let blocks = &graph.function(self.function.hir).blocks;
        for block in blocks {
            let hir_block = graph.block(*block);
            let phis: Vec<InstrId> = hir_block.phis.iter().copied().filter(|p| !graph.instr(*p).removed).collect();
            if phis.is_empty() {
                continue;
            }
            for (k, pred) in hir_block.predecessors.iter().enumerate() {
                let Some(&pred_index) = self.block_index.get(pred) else {
                    continue;
                };
                let ends_in_goto = self.function.blocks[pred_index]
                    .instructions
                    .last()
                    .is_some_and(|last| self.function.instructions[*last].op == LOpcode::Goto);
                if !ends_in_goto {
                    return Err(StructuralFault::BranchIntoPhiBlock { block: block.0 }.into());
                }
                for phi in &phis {
                    let Some(input) = graph.instr(*phi).args.get(k) else {
                        continue;
                    };
                    let source = self.value(*input)?;
                    let target = self.value(*phi)?;
                    self.function.blocks[pred_index].gap_moves.push((source, target));
                }
            }
        }
        Ok(())
    }

    fn position(&self) -> u32 {
        self.function.instructions.len() as u32 * 2
    }

    // ====== HELPERS FOR LOWERING RULES ======

    pub fn registers(&self) -> &'static RegisterFile {
        self.registers
    }

    pub fn instr(&self, id: InstrId) -> &'g HirInstruction {
        self.graph.instr(id)
    }

    /// Interval of an already lowered HIR value.
    pub fn value(&self, id: InstrId) -> CompilerResult<IntervalId> {
        self.function
            .values
            .get(&id)
            .copied()
            .ok_or_else(|| StructuralFault::UndefinedValue(id.number()).into())
    }

    fn hir_arg(&self, id: InstrId, index: usize) -> CompilerResult<InstrId> {
        let instr = self.graph.instr(id);
        instr.args.get(index).copied().ok_or_else(|| {
            StructuralFault::ArityMismatch {
                opcode: instr.opcode.name(),
                expected: index + 1,
                actual: instr.args.len(),
            }
            .into()
        })
    }

    pub fn arg(&self, id: InstrId, index: usize) -> CompilerResult<IntervalId> {
        self.value(self.hir_arg(id, index)?)
    }

    pub fn arg_representation(&self, id: InstrId, index: usize) -> CompilerResult<Representation> {
        Ok(self.graph.instr(self.hir_arg(id, index)?).representation)
    }

    pub fn new_virtual(&mut self) -> IntervalId {
        self.function.add_interval(IntervalKind::Virtual)
    }

    pub fn new_fixed(&mut self, reg: Reg) -> IntervalId {
        self.function.add_interval(IntervalKind::Fixed(reg))
    }

    /// Allocator-placed register living for one instruction.
    pub fn new_temp(&mut self) -> IntervalId {
        let id = self.function.add_interval(IntervalKind::Virtual);
        self.function.interval_mut(id).temp = true;
        id
    }

    pub fn emit(&mut self, op: LOpcode, hir: Option<InstrId>) -> &mut LInstruction {
        let index = self.function.instructions.len();
        let position = self.position();
        self.function.instructions.push(LInstruction::new(position, op, hir));
        self.function.blocks[self.current].instructions.push(index);
        &mut self.function.instructions[index]
    }

    pub fn use_register(&self, id: InstrId, index: usize) -> CompilerResult<LUse> {
        Ok(LUse::register(self.arg(id, index)?))
    }

    pub fn use_any(&self, id: InstrId, index: usize) -> CompilerResult<LUse> {
        Ok(LUse::any(self.arg(id, index)?))
    }

    /// Move argument `index` of `id` into a fresh interval fixed to `reg`.
    pub fn to_fixed(&mut self, id: InstrId, index: usize, reg: Reg) -> CompilerResult<IntervalId> {
        let source = self.arg(id, index)?;
        let fixed = self.new_fixed(reg);
        self.emit(LOpcode::Move, None)
            .add_arg(LUse::any(source))
            .set_result(LUse::register(fixed));
        Ok(fixed)
    }

    /// A fresh virtual interval as the value of `id`.
    pub fn result_virtual(&mut self, id: InstrId) -> IntervalId {
        let interval = self.new_virtual();
        self.function.values.insert(id, interval);
        interval
    }

    /// Copy a result delivered in `fixed` into a virtual interval that
    /// becomes the value of `id`, preferring the same register.
    pub fn define_from_fixed(&mut self, id: InstrId, fixed: IntervalId, reg: Reg) {
        let value = self.result_virtual(id);
        self.function.interval_mut(value).hint = Some(reg);
        self.emit(LOpcode::Move, None)
            .add_arg(LUse::any(fixed))
            .set_result(LUse::any(value));
    }

    /// `id` evaluates to its argument `index`.
    pub fn alias(&mut self, id: InstrId, index: usize) -> CompilerResult<()> {
        let value = self.arg(id, index)?;
        self.function.values.insert(id, value);
        Ok(())
    }

    /// A call-bearing instruction whose arguments are bound, in order, to
    /// `inputs` and whose result, if any, comes back in `result`.
    ///
    /// No allocator temp is requested. Code generation falls back to the
    /// target's reserved scratch register, which is never a stub argument or
    /// result register and is never allocated.
    pub fn stub(&mut self, id: InstrId, op: LOpcode, inputs: &[Reg], result: Option<Reg>) -> CompilerResult<()> {
        let mut uses = Vec::with_capacity(inputs.len());
        for (index, reg) in inputs.iter().enumerate() {
            uses.push(LUse::register(self.to_fixed(id, index, *reg)?));
        }
        let fixed = result.map(|reg| (self.new_fixed(reg), reg));
        let instr = self.emit(op, Some(id));
        instr.mark_has_call();
        for input in uses {
            instr.add_arg(input);
        }
        if let Some((interval, _)) = fixed {
            instr.set_result(LUse::register(interval));
        }
        if let Some((interval, reg)) = fixed {
            self.define_from_fixed(id, interval, reg);
        }
        Ok(())
    }

    /// Queue `body` for lowering.
    pub fn reference(&mut self, body: FunctionId) {
        self.referenced.push(body);
    }

    /// A value-less instruction with no operands.
    pub fn bare(&mut self, id: InstrId, op: LOpcode) {
        self.emit(op, Some(id));
    }

    pub fn lowering_error(&self, id: InstrId, message: &str) -> CompilerError {
        CompilerError::Lowering(format!("{} ({}): {}", id, self.graph.instr(id).opcode, message))
    }
}

/// `+` and `-` get an inline tagged-integer path when both sides are known
/// small integers.
pub(crate) fn smi_fast_path(cx: &FunctionLowering<'_>, id: InstrId, op: marlin_ast::BinOpKind) -> CompilerResult<bool> {
    use marlin_ast::BinOpKind;
    if !matches!(op, BinOpKind::Add | BinOpKind::Sub) {
        return Ok(false);
    }
    Ok(cx.arg_representation(id, 0)? == Representation::SMI && cx.arg_representation(id, 1)? == Representation::SMI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::HirOpcode;
    use marlin_ast::{BinOpKind, Span};
    use marlin_runtime::ConstantKind;

    fn add_function() -> HirGraph {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 0, Span::default());
        let root = graph.function(f).root;
        graph.add_instruction(root, HirOpcode::Entry { context_slots: 0 }, &[], None).unwrap();
        let one = graph.root.intern(ConstantKind::Number, "1");
        let one = graph.add_instruction(root, HirOpcode::Literal(one), &[], None).unwrap();
        let sum = graph
            .add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[one, one], None)
            .unwrap();
        graph.ret(root, sum).unwrap();
        crate::dominance::compute_dominators(&mut graph, f).unwrap();
        graph
    }

    #[test]
    fn test_binop_binds_stub_registers() {
        for target in [Target::X64, Target::Ia32] {
            let graph = add_function();
            let program = LirBuilder::new(&graph, target).build(FunctionId(0)).unwrap();
            let function = &program.functions[0];
            let binop = function
                .instructions
                .iter()
                .find(|i| matches!(i.op, LOpcode::BinOp { .. }))
                .unwrap();
            assert!(binop.has_call);
            let regs: Vec<_> = binop
                .inputs
                .iter()
                .map(|u| function.interval(u.interval).kind)
                .collect();
            let file = target.registers();
            assert_eq!(
                regs,
                vec![IntervalKind::Fixed(file.stub_args[0]), IntervalKind::Fixed(file.stub_args[1])]
            );
        }
    }

    #[test]
    fn test_use_before_lowering_is_fault() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 0, Span::default());
        let root = graph.function(f).root;
        let other = graph.create_function(0, false, 0, 0, Span::default());
        let other_root = graph.function(other).root;
        let foreign = graph.add_instruction(other_root, HirOpcode::Nil, &[], None).unwrap();
        graph.ret(root, foreign).unwrap();
        let err = LirBuilder::new(&graph, Target::X64).build(f).unwrap_err();
        assert!(matches!(err, CompilerError::Structural(StructuralFault::UndefinedValue(_))));
    }

    #[test]
    fn test_store_property_scratch_is_disjoint_from_stub_registers() {
        for target in [Target::X64, Target::Ia32] {
            let mut graph = HirGraph::new();
            let f = graph.create_function(0, false, 0, 0, Span::default());
            let root = graph.function(f).root;
            graph.add_instruction(root, HirOpcode::Entry { context_slots: 0 }, &[], None).unwrap();
            let object = graph
                .add_instruction(root, HirOpcode::AllocateObject { size: 64 }, &[], None)
                .unwrap();
            let key = graph.root.intern(ConstantKind::Property, "k");
            let key = graph.add_instruction(root, HirOpcode::Literal(key), &[], None).unwrap();
            let one = graph.root.intern(ConstantKind::Number, "1");
            let one = graph.add_instruction(root, HirOpcode::Literal(one), &[], None).unwrap();
            let store = graph
                .add_instruction(root, HirOpcode::StoreProperty, &[object, key, one], None)
                .unwrap();
            graph.ret(root, store).unwrap();
            crate::dominance::compute_dominators(&mut graph, f).unwrap();

            let program = LirBuilder::new(&graph, target).build(FunctionId(0)).unwrap();
            let function = &program.functions[0];
            let file = target.registers();
            assert!(!file.stub_args.contains(&file.scratch));

            let instr = function
                .instructions
                .iter()
                .find(|i| i.op == LOpcode::StoreProperty)
                .unwrap();
            assert!(instr.has_call);
            assert!(instr.temps.is_empty());
            let fixed: Vec<_> = instr
                .inputs
                .iter()
                .chain(instr.result.iter())
                .map(|u| function.interval(u.interval).kind)
                .collect();
            assert_eq!(fixed.len(), 4);
            for kind in fixed {
                assert_ne!(kind, IntervalKind::Fixed(file.scratch), "{}", target);
            }
        }
    }
}

