//! # HIR Builder
//!
//! One walk over the resolved AST per function body produces its CFG in SSA
//! form. Stack variables never become memory: reads take the block
//! environment's current value, writes rebind it, and merges insert phis.
//! Context variables go through `LoadContext`/`StoreContext`.
//!
//! Nested function literals are queued and built after the enclosing body,
//! each into its own root block of the same graph.

use marlin_ast::{BinOpKind, FunctionLiteral, Node, NodeKind, ScopeSlot, SlotKind, Span, UnaryOp};
use marlin_runtime::ConstantKind;
use std::collections::{BTreeSet, VecDeque};

use crate::hir::{BlockId, FunctionId, HirGraph, HirOpcode, InstrId};
use crate::root::{array_size, object_size, small_int_text};
use crate::{CompilerResult, StructuralFault};

/// Blocks leaving the innermost loop early.
#[derive(Debug, Default)]
struct LoopTargets {
    breaks: Vec<BlockId>,
    continues: Vec<BlockId>,
}

pub struct HirBuilder<'ast> {
    graph: HirGraph,
    function: FunctionId,
    current: BlockId,
    loops: Vec<LoopTargets>,
    pending: VecDeque<(FunctionId, &'ast FunctionLiteral)>,
}

impl<'ast> Default for HirBuilder<'ast> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'ast> HirBuilder<'ast> {
    pub fn new() -> Self {
        Self {
            graph: HirGraph::new(),
            function: FunctionId(0),
            current: BlockId(0),
            loops: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    /// Build `program` as function 0 plus every nested literal it contains.
    pub fn build(mut self, program: &'ast FunctionLiteral) -> CompilerResult<HirGraph> {
        self.declare_function(program);
        while let Some((id, literal)) = self.pending.pop_front() {
            self.build_function(id, literal)?;
        }
        log::debug!(
            "[HIR] built {} functions, {} blocks, {} instructions",
            self.graph.functions.len(),
            self.graph.blocks.len(),
            self.graph.instructions.len()
        );
        Ok(self.graph)
    }

    fn declare_function(&mut self, literal: &'ast FunctionLiteral) -> FunctionId {
        let id = self.graph.create_function(
            literal.arg_count(),
            literal.is_variadic(),
            literal.stack_slots,
            literal.context_slots,
            literal.span,
        );
        self.pending.push_back((id, literal));
        id
    }

    fn build_function(&mut self, id: FunctionId, literal: &'ast FunctionLiteral) -> CompilerResult<()> {
        self.function = id;
        self.current = self.graph.function(id).root;
        self.loops.clear();
        log::debug!(
            "[HIR] building {} ({} params, {} stack slots, {} context slots)",
            id,
            literal.params.len(),
            literal.stack_slots,
            literal.context_slots
        );

        self.add_spanned(
            HirOpcode::Entry {
                context_slots: literal.context_slots,
            },
            &[],
            Some(literal.span),
        )?;
        let nil = self.add(HirOpcode::Nil, &[])?;
        let env = &mut self.graph.block_mut(self.current).env;
        for slot in 0..env.len() {
            env.set(slot, nil);
        }

        for (index, param) in literal.params.iter().enumerate() {
            let value = if param.variadic {
                if index + 1 != literal.params.len() {
                    return Err(StructuralFault::VariadicNotLast("variadic parameter").into());
                }
                let offset = self.number(index)?;
                let rest = self.number(0)?;
                let array = self.add(HirOpcode::AllocateArray { size: array_size(0) }, &[])?;
                self.add(HirOpcode::LoadVarArg, &[offset, rest, array])?
            } else {
                let position = self.number(index)?;
                self.add(HirOpcode::LoadArg, &[position])?
            };
            self.assign_slot(param.slot, value)?;
        }

        self.visit_statements(&literal.body)?;

        if !self.graph.block(self.current).ended {
            let nil = self.add(HirOpcode::Nil, &[])?;
            self.graph.ret(self.current, nil)?;
        }
        Ok(())
    }

    // ====== EMISSION HELPERS ======

    fn add(&mut self, opcode: HirOpcode, args: &[InstrId]) -> CompilerResult<InstrId> {
        self.graph.add_instruction(self.current, opcode, args, None)
    }

    fn add_spanned(&mut self, opcode: HirOpcode, args: &[InstrId], span: Option<Span>) -> CompilerResult<InstrId> {
        self.graph.add_instruction(self.current, opcode, args, span)
    }

    fn literal(&mut self, kind: ConstantKind, text: &str, span: Option<Span>) -> CompilerResult<InstrId> {
        let slot = self.graph.root.intern(kind, text);
        self.add_spanned(HirOpcode::Literal(slot), &[], span)
    }

    fn number(&mut self, value: usize) -> CompilerResult<InstrId> {
        let text = small_int_text(value);
        self.literal(ConstantKind::Number, &text, None)
    }

    fn create_block(&mut self) -> BlockId {
        self.create_block_at(self.loops.len() as u32)
    }

    fn create_block_at(&mut self, loop_depth: u32) -> BlockId {
        self.graph.create_block(self.function, loop_depth)
    }

    /// `Join(a, b)`: a new block both inputs jump to.
    fn join(&mut self, a: BlockId, b: BlockId, logic: bool) -> CompilerResult<BlockId> {
        let depth = self.graph.block(a).loop_depth.min(self.graph.block(b).loop_depth);
        let block = self.create_block_at(depth);
        self.graph.block_mut(block).logic_join = logic;
        self.graph.goto(a, block)?;
        self.graph.goto(b, block)?;
        Ok(block)
    }

    /// Ended or unreachable: nothing emitted here can run.
    fn block_closed(&self) -> bool {
        let block = self.graph.block(self.current);
        block.ended || block.is_unreachable()
    }

    fn stack_index(&self, slot: ScopeSlot) -> CompilerResult<usize> {
        let slots = self.graph.function(self.function).stack_slots;
        if slot.index >= slots {
            return Err(StructuralFault::SlotOutOfRange { slot, slots }.into());
        }
        Ok(slot.index as usize)
    }

    fn load_slot(&mut self, slot: ScopeSlot, span: Option<Span>) -> CompilerResult<InstrId> {
        match slot.kind {
            SlotKind::Stack => {
                let index = self.stack_index(slot)?;
                match self.graph.block(self.current).env.at(index) {
                    Some(value) => Ok(value),
                    None => {
                        let nil = self.add(HirOpcode::Nil, &[])?;
                        self.graph.block_mut(self.current).env.set(index, nil);
                        Ok(nil)
                    }
                }
            }
            SlotKind::Context => self.add_spanned(HirOpcode::LoadContext(slot), &[], span),
        }
    }

    fn assign_slot(&mut self, slot: ScopeSlot, value: InstrId) -> CompilerResult<()> {
        match slot.kind {
            SlotKind::Stack => {
                let index = self.stack_index(slot)?;
                self.graph.block_mut(self.current).env.set(index, value);
                self.graph.instr_mut(value).slot.get_or_insert(slot);
            }
            SlotKind::Context => {
                self.add(HirOpcode::StoreContext(slot), &[value])?;
            }
        }
        Ok(())
    }

    // ====== STATEMENTS ======

    fn visit_statements(&mut self, body: &'ast [Node]) -> CompilerResult<()> {
        for node in body {
            if self.block_closed() {
                log::trace!("[HIR] skipping unreachable statements in {}", self.current);
                break;
            }
            self.visit_statement(node)?;
        }
        Ok(())
    }

    fn visit_statement(&mut self, node: &'ast Node) -> CompilerResult<()> {
        match &node.kind {
            NodeKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.visit_if(condition, then_branch, else_branch.as_deref()),
            NodeKind::While { condition, body } => self.visit_while(condition, body),
            NodeKind::Block(body) => self.visit_statements(body),
            NodeKind::Break => {
                let current = self.current;
                let targets = self.loops.last_mut().ok_or(StructuralFault::BreakOutsideLoop)?;
                targets.breaks.push(current);
                self.current = self.create_block();
                Ok(())
            }
            NodeKind::Continue => {
                let current = self.current;
                let targets = self.loops.last_mut().ok_or(StructuralFault::ContinueOutsideLoop)?;
                targets.continues.push(current);
                self.current = self.create_block();
                Ok(())
            }
            NodeKind::Return(value) => {
                let value = match value {
                    Some(value) => self.visit_expression(value)?,
                    None => self.add(HirOpcode::Nil, &[])?,
                };
                self.graph.ret(self.current, value)
            }
            _ => self.visit_expression(node).map(|_| ()),
        }
    }

    fn visit_if(&mut self, condition: &'ast Node, then_branch: &'ast [Node], else_branch: Option<&'ast [Node]>) -> CompilerResult<()> {
        let condition = self.visit_expression(condition)?;
        let on_true = self.create_block();
        let on_false = self.create_block();
        self.graph.branch(self.current, condition, on_true, on_false)?;

        self.current = on_true;
        self.visit_statements(then_branch)?;
        let true_end = self.current;

        self.current = on_false;
        if let Some(else_branch) = else_branch {
            self.visit_statements(else_branch)?;
        }
        let false_end = self.current;

        self.current = self.join(true_end, false_end, false)?;
        Ok(())
    }

    fn visit_while(&mut self, condition: &'ast Node, body: &'ast [Node]) -> CompilerResult<()> {
        let depth = self.loops.len() as u32;
        let header = self.create_block_at(depth + 1);
        self.graph.block_mut(header).loop_header = true;
        self.graph.goto(self.current, header)?;

        // Every slot the loop may reassign gets its phi up front; the back
        // edge fills in the second input.
        if !self.graph.block(header).predecessors.is_empty() {
            let mut assigned = BTreeSet::new();
            collect_assigned(condition, &mut assigned);
            for node in body {
                collect_assigned(node, &mut assigned);
            }
            for index in assigned {
                let index = index as usize;
                if let Some(input) = self.graph.block(header).env.at(index) {
                    let phi = self.graph.create_phi(header, index);
                    self.graph.add_phi_input(phi, input)?;
                }
            }
        }

        self.loops.push(LoopTargets::default());
        self.current = header;
        let condition = self.visit_expression(condition)?;
        let body_block = self.create_block();
        let exit = self.create_block_at(depth);
        self.graph.branch(self.current, condition, body_block, exit)?;

        self.current = body_block;
        self.visit_statements(body)?;
        let targets = self.loops.pop().unwrap_or_default();

        let mut latch = self.current;
        for continued in targets.continues {
            latch = self.join(latch, continued, false)?;
        }
        self.graph.goto(latch, header)?;

        let mut end = exit;
        for broken in targets.breaks {
            end = self.join(end, broken, false)?;
        }
        self.current = end;
        Ok(())
    }

    // ====== EXPRESSIONS ======

    fn visit_expression(&mut self, node: &'ast Node) -> CompilerResult<InstrId> {
        let span = Some(node.span);
        match &node.kind {
            NodeKind::Value(slot) => self.load_slot(*slot, span),
            NodeKind::Number(text) => self.literal(ConstantKind::Number, text, span),
            NodeKind::String(text) => self.literal(ConstantKind::String, text, span),
            NodeKind::Property(text) => self.literal(ConstantKind::Property, text, span),
            NodeKind::True => self.literal(ConstantKind::True, "true", span),
            NodeKind::False => self.literal(ConstantKind::False, "false", span),
            NodeKind::Nil => self.add_spanned(HirOpcode::Nil, &[], span),
            NodeKind::Assign { target, value } => self.visit_assign(target, value),
            NodeKind::Member { object, property } => {
                let object = self.visit_expression(object)?;
                let key = self.visit_expression(property)?;
                self.add_spanned(HirOpcode::LoadProperty, &[object, key], span)
            }
            NodeKind::Binary { op, lhs, rhs } if op.is_bool_logic() => self.visit_logic(*op, lhs, rhs),
            NodeKind::Binary { op, lhs, rhs } => {
                let lhs = self.visit_expression(lhs)?;
                let rhs = self.visit_expression(rhs)?;
                self.add_spanned(HirOpcode::BinOp(*op), &[lhs, rhs], span)
            }
            NodeKind::Unary { op, operand } => self.visit_unary(*op, operand, span),
            NodeKind::Call { callee, args } => {
                let callee = self.visit_expression(callee)?;
                self.emit_call(callee, None, args, span)
            }
            NodeKind::MethodCall { receiver, method, args } => {
                let receiver = self.visit_expression(receiver)?;
                let key = self.literal(ConstantKind::Property, method, None)?;
                let callee = self.add(HirOpcode::LoadProperty, &[receiver, key])?;
                self.emit_call(callee, Some(receiver), args, span)
            }
            NodeKind::Spread(_) => Err(StructuralFault::VariadicNotLast("spread argument").into()),
            NodeKind::Function(literal) => {
                let body = self.declare_function(literal);
                let function = self.add_spanned(
                    HirOpcode::Function {
                        body,
                        arg_count: literal.arg_count(),
                    },
                    &[],
                    span,
                )?;
                if let Some(name) = literal.name {
                    self.assign_slot(name, function)?;
                }
                Ok(function)
            }
            NodeKind::ObjectLiteral(entries) => {
                let object = self.add_spanned(
                    HirOpcode::AllocateObject {
                        size: object_size(entries.len()),
                    },
                    &[],
                    span,
                )?;
                for (key, value) in entries {
                    let key = self.literal(ConstantKind::Property, key, None)?;
                    let value = self.visit_expression(value)?;
                    self.add(HirOpcode::StoreProperty, &[object, key, value])?;
                }
                Ok(object)
            }
            NodeKind::ArrayLiteral(items) => {
                let array = self.add_spanned(
                    HirOpcode::AllocateArray {
                        size: array_size(items.len()),
                    },
                    &[],
                    span,
                )?;
                for (index, item) in items.iter().enumerate() {
                    let key = self.number(index)?;
                    let value = self.visit_expression(item)?;
                    self.add(HirOpcode::StoreProperty, &[array, key, value])?;
                }
                Ok(array)
            }
            NodeKind::CollectGarbage => {
                self.add_spanned(HirOpcode::CollectGarbage, &[], span)?;
                self.add(HirOpcode::Nil, &[])
            }
            NodeKind::StackTrace => self.add_spanned(HirOpcode::GetStackTrace, &[], span),
            NodeKind::If { .. }
            | NodeKind::While { .. }
            | NodeKind::Block(_)
            | NodeKind::Break
            | NodeKind::Continue
            | NodeKind::Return(_) => Err(StructuralFault::UnexpectedStatement.into()),
        }
    }

    fn visit_assign(&mut self, target: &'ast Node, value: &'ast Node) -> CompilerResult<InstrId> {
        match &target.kind {
            NodeKind::Value(slot) => {
                let value = self.visit_expression(value)?;
                self.assign_slot(*slot, value)?;
                Ok(value)
            }
            NodeKind::Member { object, property } => {
                let object = self.visit_expression(object)?;
                let key = self.visit_expression(property)?;
                let value = self.visit_expression(value)?;
                self.add_spanned(HirOpcode::StoreProperty, &[object, key, value], Some(target.span))
            }
            _ => Err(StructuralFault::InvalidAssignmentTarget.into()),
        }
    }

    fn visit_unary(&mut self, op: UnaryOp, operand: &'ast Node, span: Option<Span>) -> CompilerResult<InstrId> {
        let opcode = match op {
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                return self.visit_update(op, operand, span);
            }
            UnaryOp::Neg => {
                let zero = self.number(0)?;
                let value = self.visit_expression(operand)?;
                return self.add_spanned(HirOpcode::BinOp(BinOpKind::Sub), &[zero, value], span);
            }
            UnaryOp::Delete => {
                let NodeKind::Member { object, property } = &operand.kind else {
                    return Err(StructuralFault::InvalidAssignmentTarget.into());
                };
                let object = self.visit_expression(object)?;
                let key = self.visit_expression(property)?;
                self.add_spanned(HirOpcode::DeleteProperty, &[object, key], span)?;
                return self.add(HirOpcode::Nil, &[]);
            }
            UnaryOp::Not => HirOpcode::Not,
            UnaryOp::Typeof => HirOpcode::Typeof,
            UnaryOp::Sizeof => HirOpcode::Sizeof,
            UnaryOp::Keysof => HirOpcode::Keysof,
            UnaryOp::Clone => HirOpcode::Clone,
        };
        let value = self.visit_expression(operand)?;
        self.add_spanned(opcode, &[value], span)
    }

    /// `++x`, `x--` and friends: read, add or subtract one, write back.
    fn visit_update(&mut self, op: UnaryOp, operand: &'ast Node, span: Option<Span>) -> CompilerResult<InstrId> {
        let kind = match op {
            UnaryOp::PreInc | UnaryOp::PostInc => BinOpKind::Add,
            _ => BinOpKind::Sub,
        };
        let prefix = matches!(op, UnaryOp::PreInc | UnaryOp::PreDec);
        match &operand.kind {
            NodeKind::Value(slot) => {
                let old = self.load_slot(*slot, span)?;
                let one = self.number(1)?;
                let new = self.add_spanned(HirOpcode::BinOp(kind), &[old, one], span)?;
                self.assign_slot(*slot, new)?;
                Ok(if prefix { new } else { old })
            }
            NodeKind::Member { object, property } => {
                let object = self.visit_expression(object)?;
                let key = self.visit_expression(property)?;
                let old = self.add(HirOpcode::LoadProperty, &[object, key])?;
                let one = self.number(1)?;
                let new = self.add_spanned(HirOpcode::BinOp(kind), &[old, one], span)?;
                self.add(HirOpcode::StoreProperty, &[object, key, new])?;
                Ok(if prefix { new } else { old })
            }
            _ => Err(StructuralFault::InvalidAssignmentTarget.into()),
        }
    }

    /// `a && b` / `a || b`: both arms leave their result in the logic slot
    /// and the join merges it with a phi.
    fn visit_logic(&mut self, op: BinOpKind, lhs: &'ast Node, rhs: &'ast Node) -> CompilerResult<InstrId> {
        let left = self.visit_expression(lhs)?;
        let logic_slot = self.graph.block(self.current).env.logic_slot();
        let on_true = self.create_block();
        let on_false = self.create_block();
        self.graph.branch(self.current, left, on_true, on_false)?;

        let evaluate_rhs_on_true = op == BinOpKind::LAnd;

        self.current = on_true;
        let value = if evaluate_rhs_on_true { self.visit_expression(rhs)? } else { left };
        self.graph.block_mut(self.current).env.set(logic_slot, value);
        let true_end = self.current;

        self.current = on_false;
        let value = if evaluate_rhs_on_true { left } else { self.visit_expression(rhs)? };
        self.graph.block_mut(self.current).env.set(logic_slot, value);
        let false_end = self.current;

        self.current = self.join(true_end, false_end, true)?;
        match self.graph.block(self.current).env.at(logic_slot) {
            Some(value) => Ok(value),
            None => self.add(HirOpcode::Nil, &[]),
        }
    }

    /// Push arguments and call. The receiver of a method call goes first.
    fn emit_call(&mut self, callee: InstrId, receiver: Option<InstrId>, args: &'ast [Node], span: Option<Span>) -> CompilerResult<InstrId> {
        let mut values: Vec<InstrId> = receiver.into_iter().collect();
        let mut spread = None;
        for (index, arg) in args.iter().enumerate() {
            match &arg.kind {
                NodeKind::Spread(inner) => {
                    if index + 1 != args.len() {
                        return Err(StructuralFault::VariadicNotLast("spread argument").into());
                    }
                    spread = Some(self.visit_expression(inner)?);
                }
                _ => values.push(self.visit_expression(arg)?),
            }
        }

        let fixed = self.number(values.len())?;
        let argc = match spread {
            Some(spread) => {
                let size = self.add(HirOpcode::Sizeof, &[spread])?;
                self.add(HirOpcode::BinOp(BinOpKind::Add), &[fixed, size])?
            }
            None => fixed,
        };

        self.add(HirOpcode::AlignStack, &[argc])?;
        if let Some(spread) = spread {
            self.add(HirOpcode::StoreVarArg, &[spread])?;
        }
        for value in values.iter().rev() {
            self.add(HirOpcode::StoreArg, &[*value])?;
        }
        self.add_spanned(HirOpcode::Call, &[callee, argc], span)
    }
}

/// Stack slots `node` may write, not looking into nested function bodies.
fn collect_assigned(node: &Node, out: &mut BTreeSet<u32>) {
    match &node.kind {
        NodeKind::Assign { target, value } => {
            if let NodeKind::Value(slot) = &target.kind {
                if slot.is_stack() {
                    out.insert(slot.index);
                }
            } else {
                collect_assigned(target, out);
            }
            collect_assigned(value, out);
        }
        NodeKind::Unary { op, operand } => {
            if op.is_update() {
                if let NodeKind::Value(slot) = &operand.kind {
                    if slot.is_stack() {
                        out.insert(slot.index);
                    }
                }
            }
            collect_assigned(operand, out);
        }
        NodeKind::Function(literal) => {
            if let Some(name) = literal.name.filter(|slot| slot.is_stack()) {
                out.insert(name.index);
            }
        }
        NodeKind::Member { object, property } => {
            collect_assigned(object, out);
            collect_assigned(property, out);
        }
        NodeKind::Binary { lhs, rhs, .. } => {
            collect_assigned(lhs, out);
            collect_assigned(rhs, out);
        }
        NodeKind::Call { callee, args } => {
            collect_assigned(callee, out);
            args.iter().for_each(|arg| collect_assigned(arg, out));
        }
        NodeKind::MethodCall { receiver, args, .. } => {
            collect_assigned(receiver, out);
            args.iter().for_each(|arg| collect_assigned(arg, out));
        }
        NodeKind::Spread(inner) => collect_assigned(inner, out),
        NodeKind::ObjectLiteral(entries) => entries.iter().for_each(|(_, value)| collect_assigned(value, out)),
        NodeKind::ArrayLiteral(items) | NodeKind::Block(items) => items.iter().for_each(|item| collect_assigned(item, out)),
        NodeKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            collect_assigned(condition, out);
            then_branch.iter().for_each(|n| collect_assigned(n, out));
            else_branch.iter().flatten().for_each(|n| collect_assigned(n, out));
        }
        NodeKind::While { condition, body } => {
            collect_assigned(condition, out);
            body.iter().for_each(|n| collect_assigned(n, out));
        }
        NodeKind::Return(Some(value)) => collect_assigned(value, out),
        NodeKind::Value(_)
        | NodeKind::Number(_)
        | NodeKind::String(_)
        | NodeKind::Property(_)
        | NodeKind::True
        | NodeKind::False
        | NodeKind::Nil
        | NodeKind::Break
        | NodeKind::Continue
        | NodeKind::Return(None)
        | NodeKind::CollectGarbage
        | NodeKind::StackTrace => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompilerError;
    use marlin_ast::{AstBuilder, FunctionBuilder};

    fn build(literal: &FunctionLiteral) -> CompilerResult<HirGraph> {
        HirBuilder::new().build(literal)
    }

    fn count(graph: &HirGraph, function: FunctionId, pred: impl Fn(&HirOpcode) -> bool) -> usize {
        graph
            .function(function)
            .blocks
            .iter()
            .flat_map(|b| graph.block_values(*b))
            .filter(|i| pred(&graph.instr(*i).opcode))
            .count()
    }

    #[test]
    fn test_statements_after_return_are_skipped() {
        let mut ast = AstBuilder::new();
        let mut f = FunctionBuilder::new();
        let a = f.stack_slot();
        let one = ast.int(1);
        let two = ast.int(2);
        let body = vec![ast.ret(one), ast.set(a, two)];
        let graph = build(&f.build(body)).unwrap();
        assert_eq!(count(&graph, FunctionId(0), |op| *op == HirOpcode::Return), 1);
        assert_eq!(graph.blocks.len(), 1);
    }

    #[test]
    fn test_break_outside_loop_is_fault() {
        let mut ast = AstBuilder::new();
        let body = vec![ast.brk()];
        let err = build(&FunctionBuilder::new().build(body)).unwrap_err();
        assert!(matches!(err, CompilerError::Structural(StructuralFault::BreakOutsideLoop)));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let mut ast = AstBuilder::new();
        let one = ast.int(1);
        let two = ast.int(2);
        let assign = ast.assign(one, two);
        let err = build(&FunctionBuilder::new().build(vec![assign])).unwrap_err();
        assert!(matches!(
            err,
            CompilerError::Structural(StructuralFault::InvalidAssignmentTarget)
        ));
    }

    #[test]
    fn test_variadic_parameter_must_be_last() {
        let mut f = FunctionBuilder::new();
        f.variadic_param();
        f.param();
        let err = build(&f.build(Vec::new())).unwrap_err();
        assert!(matches!(err, CompilerError::Structural(StructuralFault::VariadicNotLast(_))));
    }

    #[test]
    fn test_spread_argument_counts_with_sizeof() {
        let mut ast = AstBuilder::new();
        let mut f = FunctionBuilder::new();
        let g = f.stack_slot();
        let rest = f.stack_slot();
        let callee = ast.var(g);
        let one = ast.int(1);
        let items = ast.var(rest);
        let spread = ast.spread(items);
        let call = ast.call(callee, vec![one, spread]);
        let graph = build(&f.build(vec![call])).unwrap();
        let main = FunctionId(0);
        assert_eq!(count(&graph, main, |op| *op == HirOpcode::Sizeof), 1);
        assert_eq!(count(&graph, main, |op| *op == HirOpcode::StoreVarArg), 1);
        assert_eq!(count(&graph, main, |op| *op == HirOpcode::StoreArg), 1);
        assert_eq!(count(&graph, main, |op| *op == HirOpcode::AlignStack), 1);
    }

    #[test]
    fn test_nested_functions_are_queued() {
        let mut ast = AstBuilder::new();
        let mut outer = FunctionBuilder::new();
        let name = outer.stack_slot();
        let inner_body = vec![ast.ret_nil()];
        let inner = FunctionBuilder::new().named(name).build(inner_body);
        let function = ast.function(inner);
        let graph = build(&outer.build(vec![function])).unwrap();
        assert_eq!(graph.functions.len(), 2);
        let main = FunctionId(0);
        let value = count(&graph, main, |op| matches!(op, HirOpcode::Function { .. }));
        assert_eq!(value, 1);
        let root = graph.function(main).root;
        let exit = *graph.function(main).blocks.last().unwrap();
        let bound = graph.block(exit).env.at(0).or(graph.block(root).env.at(0)).unwrap();
        assert!(matches!(graph.instr(bound).opcode, HirOpcode::Function { .. }));
    }

    #[test]
    fn test_logical_and_merges_through_logic_slot() {
        let mut ast = AstBuilder::new();
        let mut f = FunctionBuilder::new();
        let a = f.param();
        let b = f.param();
        let lhs = ast.var(a);
        let rhs = ast.var(b);
        let and = ast.binary(BinOpKind::LAnd, lhs, rhs);
        let body = vec![ast.ret(and)];
        let graph = build(&f.build(body)).unwrap();
        let join = graph
            .blocks
            .iter()
            .find(|b| b.logic_join)
            .expect("logic join block");
        assert_eq!(join.phis.len(), 1);
        assert!(graph.instr(join.phis[0]).slot.is_none());
    }
}
