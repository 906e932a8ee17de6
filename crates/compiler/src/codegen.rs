//! # Code Generation
//!
//! Walks allocated LIR and drives a [`MacroAssembler`]. Every function gets
//! its entry label up front so `Function` instructions can refer to bodies
//! that are emitted later.
//!
//! ## Frame
//!
//! ```text
//! [fp + argument(i)]      incoming arguments, first one closest
//! [fp + ptr]              return address
//! [fp]                    caller's fp
//! [fp + frame_slot(0..4)] arg bytes, argc, context, move temp
//! [fp + spill_slot(k)]    spill slots
//! ```
//!
//! Callers pop their own arguments: a callee leaves the byte count of its
//! arguments (padding included) in the last stub register on return.

use indexmap::IndexMap;
use marlin_ast::BinOpKind;
use marlin_runtime::asm::AluOp;
use marlin_runtime::value::tag_smi;
use marlin_runtime::{
    Assembler, CompiledModule, Condition, FunctionInfo, Label, Layout, MacroAssembler, Operand, Reg, Stub,
};
use rustc_hash::FxHashMap;

use crate::hir::FunctionId;
use crate::lir::{IntervalId, LInstruction, LOpcode, LirFunction, LirProgram, Location};
use crate::root::Root;
use crate::target::RegisterFile;
use crate::{CompilerError, CompilerResult};

/// Emit every function of `program` into one module.
pub fn generate(program: &LirProgram, root: &Root, registers: &'static RegisterFile) -> CompilerResult<CompiledModule> {
    let mut masm = Assembler::new();
    let functions = emit_program(&mut masm, program, registers)?;
    Ok(CompiledModule {
        code: masm.finish(),
        functions,
        constants: root.to_vec(),
        machine: registers.machine_config(),
    })
}

/// Emit through any assembler; returns per-function metadata in program
/// order.
pub fn emit_program<M: MacroAssembler>(
    masm: &mut M,
    program: &LirProgram,
    registers: &'static RegisterFile,
) -> CompilerResult<Vec<FunctionInfo>> {
    let entries: FxHashMap<FunctionId, Label> = program.functions.iter().map(|f| (f.hir, masm.new_label())).collect();

    let mut infos = Vec::with_capacity(program.functions.len());
    for function in &program.functions {
        let entry = entries[&function.hir];
        let mut codegen = FunctionCodegen {
            masm: &mut *masm,
            function,
            registers,
            layout: Layout::new(registers.pointer_size),
            entries: &entries,
            block_labels: Vec::new(),
        };
        codegen.emit(entry)?;
        infos.push(FunctionInfo {
            entry,
            arg_count: function.arg_count,
            stack_slots: function.stack_slots,
            context_slots: function.context_slots,
            spill_slots: function.spill_slots,
        });
    }
    Ok(infos)
}

struct FunctionCodegen<'a, M: MacroAssembler> {
    masm: &'a mut M,
    function: &'a LirFunction,
    registers: &'static RegisterFile,
    layout: Layout,
    entries: &'a FxHashMap<FunctionId, Label>,
    block_labels: Vec<Label>,
}

impl<M: MacroAssembler> FunctionCodegen<'_, M> {
    fn emit(&mut self, entry: Label) -> CompilerResult<()> {
        self.masm.bind(entry);
        self.block_labels = (0..self.function.blocks.len()).map(|_| self.masm.new_label()).collect();

        let function = self.function;
        for (index, block) in function.blocks.iter().enumerate() {
            self.masm.bind(self.block_labels[index]);
            for instr_index in &block.instructions {
                self.emit_instruction(index, &function.instructions[*instr_index])?;
            }
        }
        log::debug!(
            "[CODEGEN] {}: {} blocks up to offset {}",
            self.function.hir,
            self.function.blocks.len(),
            self.masm.offset()
        );
        Ok(())
    }

    // ====== OPERANDS ======

    fn fp(&self) -> Reg {
        self.registers.frame_pointer
    }

    fn frame(&self, slot: u32) -> Operand {
        Operand::mem(self.fp(), self.layout.frame_slot(slot))
    }

    fn location(&self, id: IntervalId) -> CompilerResult<Operand> {
        match self.function.interval(id).location {
            Some(Location::Register(reg)) => Ok(Operand::Reg(reg)),
            Some(Location::Stack(slot)) => Ok(Operand::mem(self.fp(), self.layout.spill_slot(slot))),
            None => Err(CompilerError::CodeGen(format!(
                "{} in {} has no location",
                id, self.function.hir
            ))),
        }
    }

    fn input(&self, instr: &LInstruction, index: usize) -> CompilerResult<Operand> {
        let input = instr
            .inputs
            .get(index)
            .ok_or_else(|| CompilerError::CodeGen(format!("{} is missing input {}", instr.op, index)))?;
        self.location(input.interval)
    }

    fn result(&self, instr: &LInstruction) -> CompilerResult<Operand> {
        let result = instr
            .result
            .ok_or_else(|| CompilerError::CodeGen(format!("{} has no result", instr.op)))?;
        self.location(result.interval)
    }

    /// The instruction's allocator temp, or the scratch register.
    fn temp(&self, instr: &LInstruction) -> CompilerResult<Reg> {
        match instr.temps.first() {
            Some(temp) => match self.location(*temp)? {
                Operand::Reg(reg) => Ok(reg),
                other => Err(CompilerError::CodeGen(format!("temp {} placed at {}", temp, other))),
            },
            None => Ok(self.registers.scratch),
        }
    }

    fn move_to(&mut self, dst: Operand, src: Operand) {
        if dst == src {
            return;
        }
        if dst.is_mem() && src.is_mem() {
            let scratch = self.registers.scratch;
            self.masm.mov(Operand::Reg(scratch), src);
            self.masm.mov(dst, Operand::Reg(scratch));
        } else {
            self.masm.mov(dst, src);
        }
    }

    /// Execute `(destination, source)` moves as if simultaneously, breaking
    /// cycles through the frame's move temp.
    fn parallel_moves(&mut self, moves: &[(Operand, Operand)]) -> CompilerResult<()> {
        let mut pending: IndexMap<Operand, Operand> = IndexMap::new();
        for (dst, src) in moves {
            if dst != src {
                pending.insert(*dst, *src);
            }
        }
        let temp = self.frame(Layout::FRAME_MOVE_TEMP);

        while !pending.is_empty() {
            // A destination nobody still reads can be written right away.
            while let Some((dst, src)) = pending
                .iter()
                .find(|(dst, _)| !pending.values().any(|src| src == *dst))
                .map(|(d, s)| (*d, *s))
            {
                self.move_to(dst, src);
                pending.shift_remove(&dst);
            }
            // Only disjoint cycles are left.
            let Some((&start, _)) = pending.first() else {
                break;
            };
            self.move_to(temp, start);
            let mut dst = start;
            loop {
                let src = pending
                    .shift_remove(&dst)
                    .ok_or_else(|| CompilerError::CodeGen(format!("broken move cycle at {}", dst)))?;
                if src == start {
                    self.move_to(dst, temp);
                    break;
                }
                self.move_to(dst, src);
                dst = src;
            }
        }
        Ok(())
    }

    // ====== INSTRUCTIONS ======

    fn emit_instruction(&mut self, block: usize, instr: &LInstruction) -> CompilerResult<()> {
        let (function, regs) = (self.function, self.registers);
        let [a0, a1, a2] = regs.stub_args;
        let fp = self.fp();
        match instr.op {
            LOpcode::Entry { context_slots } => self.prologue(context_slots),
            LOpcode::Return => {
                let arg_bytes = self.frame(Layout::FRAME_ARG_BYTES);
                self.masm.mov(Operand::Reg(a2), arg_bytes);
                self.masm.mov(Operand::Reg(regs.stack_pointer), Operand::Reg(fp));
                self.masm.pop(fp);
                self.masm.ret();
            }
            LOpcode::Nil => {
                let dst = self.result(instr)?;
                self.move_to(dst, Operand::Imm(0));
            }
            LOpcode::Literal(slot) => {
                let dst = self.result(instr)?;
                let src = match slot.immediate {
                    Some(value) => Operand::Imm(tag_smi(value)),
                    None => Operand::mem(regs.root, self.layout.root_slot(slot.index)),
                };
                self.move_to(dst, src);
            }
            LOpcode::Move => {
                let (dst, src) = (self.result(instr)?, self.input(instr, 0)?);
                self.move_to(dst, src);
            }
            LOpcode::Goto => {
                let lblock = &function.blocks[block];
                let mut moves = Vec::with_capacity(lblock.gap_moves.len());
                for (source, phi) in &lblock.gap_moves {
                    moves.push((self.location(*phi)?, self.location(*source)?));
                }
                self.parallel_moves(&moves)?;
                let target = *lblock
                    .successors
                    .first()
                    .ok_or_else(|| CompilerError::CodeGen(format!("goto without successor in block {}", block)))?;
                if target != block + 1 {
                    self.masm.jmp(self.block_labels[target]);
                }
            }
            LOpcode::Branch { coerce } => {
                let successors = &function.blocks[block].successors;
                let (&on_true, &on_false) = successors
                    .first()
                    .zip(successors.get(1))
                    .ok_or_else(|| CompilerError::CodeGen(format!("branch needs two successors in block {}", block)))?;
                if coerce {
                    self.masm.call_stub(Stub::CoerceToBoolean);
                }
                let scratch = regs.scratch;
                self.masm
                    .mov(Operand::Reg(scratch), Operand::mem(a0, self.layout.value_field()));
                self.masm.cmp(Operand::Reg(scratch), Operand::Imm(0));
                self.masm.jcc(Condition::Eq, self.block_labels[on_false]);
                if on_true != block + 1 {
                    self.masm.jmp(self.block_labels[on_true]);
                }
            }
            LOpcode::BinOp { op, smi_fast } => {
                let done = self.masm.new_label();
                if smi_fast {
                    let temp = self.temp(instr)?;
                    self.smi_fast_path(op, temp, done);
                }
                self.masm.call_stub(Stub::BinOp(op));
                self.masm.bind(done);
            }
            LOpcode::Not => self.masm.call_stub(Stub::Not),
            LOpcode::Typeof => self.masm.call_stub(Stub::Typeof),
            LOpcode::Sizeof => self.masm.call_stub(Stub::Sizeof),
            LOpcode::Keysof => self.masm.call_stub(Stub::Keysof),
            LOpcode::Clone => self.masm.call_stub(Stub::CloneObject),
            LOpcode::LoadProperty => self.masm.call_stub(Stub::LookupProperty),
            LOpcode::StoreProperty => self.masm.call_stub(Stub::StoreProperty),
            LOpcode::DeleteProperty => self.masm.call_stub(Stub::DeleteProperty),
            LOpcode::LoadVarArg => self.masm.call_stub(Stub::LoadVarArg),
            LOpcode::StoreVarArg => self.masm.call_stub(Stub::StoreVarArg),
            LOpcode::CollectGarbage => self.masm.call_stub(Stub::CollectGarbage),
            LOpcode::GetStackTrace => self.masm.call_stub(Stub::StackTrace),
            LOpcode::AllocateObject { size } => {
                self.masm.mov(Operand::Reg(a0), Operand::Imm(tag_smi(size as i64)));
                self.masm.call_stub(Stub::AllocateObject);
            }
            LOpcode::AllocateArray { size } => {
                self.masm.mov(Operand::Reg(a0), Operand::Imm(tag_smi(size as i64)));
                self.masm.call_stub(Stub::AllocateArray);
            }
            LOpcode::Function { body, arg_count } => {
                let label = *self
                    .entries
                    .get(&body)
                    .ok_or_else(|| CompilerError::CodeGen(format!("{} was never lowered", body)))?;
                self.masm.load_label(a0, label);
                self.masm.mov(Operand::Reg(a1), Operand::Imm(tag_smi(arg_count as i64)));
                self.masm.call_stub(Stub::AllocateFunction);
            }
            LOpcode::LoadContext(slot) => {
                let temp = self.temp(instr)?;
                self.walk_context(temp, slot.depth);
                let dst = self.result(instr)?;
                self.move_to(dst, Operand::mem(temp, self.layout.context_slot(slot.index)));
            }
            LOpcode::StoreContext(slot) => {
                let temp = self.temp(instr)?;
                let mut value = self.input(instr, 0)?;
                if value.is_mem() {
                    if temp == regs.scratch {
                        return Err(CompilerError::CodeGen(format!("{} needs its value in a register", instr.op)));
                    }
                    self.masm.mov(Operand::Reg(regs.scratch), value);
                    value = Operand::Reg(regs.scratch);
                }
                self.walk_context(temp, slot.depth);
                self.masm.mov(Operand::mem(temp, self.layout.context_slot(slot.index)), value);
            }
            LOpcode::LoadArg => {
                let temp = self.temp(instr)?;
                let index = self.input(instr, 0)?;
                let dst = self.result(instr)?;
                let argc = self.frame(Layout::FRAME_ARGC);
                let (missing, done) = (self.masm.new_label(), self.masm.new_label());
                self.masm.mov(Operand::Reg(temp), index);
                self.masm.cmp(Operand::Reg(temp), argc);
                self.masm.jcc(Condition::Ge, missing);
                self.masm.sar(temp, 1);
                self.masm.shl(temp, self.layout.pointer_shift());
                self.masm.add(temp, Operand::Reg(fp));
                self.masm
                    .mov(Operand::Reg(temp), Operand::mem(temp, self.layout.argument(0)));
                self.move_to(dst, Operand::Reg(temp));
                self.masm.jmp(done);
                self.masm.bind(missing);
                self.move_to(dst, Operand::Imm(0));
                self.masm.bind(done);
            }
            LOpcode::StoreArg => {
                let value = self.input(instr, 0)?;
                self.masm.push(value);
            }
            LOpcode::AlignStack => {
                let temp = self.temp(instr)?;
                let argc = self.input(instr, 0)?;
                let aligned = self.masm.new_label();
                self.masm.mov(Operand::Reg(temp), argc);
                self.masm.sar(temp, 1);
                self.masm.and(temp, Operand::Imm(1));
                self.masm.cmp(Operand::Reg(temp), Operand::Imm(0));
                self.masm.jcc(Condition::Eq, aligned);
                self.masm.push(Operand::Imm(0));
                self.masm.bind(aligned);
            }
            LOpcode::Call => {
                let saved_context = self.frame(Layout::FRAME_CONTEXT);
                self.masm.call(a1);
                self.masm.add(regs.stack_pointer, Operand::Reg(a2));
                self.masm.mov(Operand::Reg(regs.context), saved_context);
            }
        }
        Ok(())
    }

    fn prologue(&mut self, context_slots: u32) {
        let regs = self.registers;
        let (fp, sp, argc) = (self.fp(), regs.stack_pointer, regs.stub_args[0]);
        let scratch = regs.scratch;
        let frame_bytes = (Layout::FRAME_FIXED_SLOTS + self.function.spill_slots) * regs.pointer_size;
        let (argc_slot, arg_bytes_slot, context_slot) = (
            self.frame(Layout::FRAME_ARGC),
            self.frame(Layout::FRAME_ARG_BYTES),
            self.frame(Layout::FRAME_CONTEXT),
        );

        self.masm.push(Operand::Reg(fp));
        self.masm.mov(Operand::Reg(fp), Operand::Reg(sp));
        self.masm.sub(sp, Operand::Imm(frame_bytes as i64));
        self.masm.mov(argc_slot, Operand::Reg(argc));

        // Arguments plus alignment padding, in bytes.
        self.masm.mov(Operand::Reg(scratch), Operand::Reg(argc));
        self.masm.add(scratch, Operand::Imm(1));
        self.masm.sar(scratch, 1);
        self.masm.and(scratch, Operand::Imm(-2));
        self.masm.shl(scratch, self.layout.pointer_shift());
        self.masm.mov(arg_bytes_slot, Operand::Reg(scratch));

        self.masm.mov(Operand::Reg(argc), Operand::Imm(tag_smi(context_slots as i64)));
        self.masm.call_stub(Stub::AllocateContext);
        self.masm.mov(Operand::Reg(regs.context), Operand::Reg(argc));
        self.masm.mov(context_slot, Operand::Reg(regs.context));
    }

    /// Leave the context `depth` levels up in `temp`.
    fn walk_context(&mut self, temp: Reg, depth: u32) {
        self.masm.mov(Operand::Reg(temp), Operand::Reg(self.registers.context));
        for _ in 0..depth {
            self.masm
                .mov(Operand::Reg(temp), Operand::mem(temp, self.layout.context_parent()));
        }
    }

    /// Inline `+`/`-` on two tagged small integers; falls through to the
    /// stub call when either side is not one or the result overflows.
    fn smi_fast_path(&mut self, op: BinOpKind, temp: Reg, done: Label) {
        let [lhs, rhs, _] = self.registers.stub_args;
        let slow = self.masm.new_label();
        self.masm.mov(Operand::Reg(temp), Operand::Reg(lhs));
        self.masm.alu(AluOp::And, temp, Operand::Reg(rhs));
        self.masm.and(temp, Operand::Imm(1));
        self.masm.cmp(Operand::Reg(temp), Operand::Imm(0));
        self.masm.jcc(Condition::Eq, slow);

        self.masm.mov(Operand::Reg(temp), Operand::Reg(lhs));
        if op == BinOpKind::Sub {
            self.masm.sub(temp, Operand::Reg(rhs));
            self.masm.jcc(Condition::Overflow, slow);
            self.masm.add(temp, Operand::Imm(1));
        } else {
            self.masm.sub(temp, Operand::Imm(1));
            self.masm.add(temp, Operand::Reg(rhs));
            self.masm.jcc(Condition::Overflow, slow);
        }
        self.masm.mov(Operand::Reg(lhs), Operand::Reg(temp));
        self.masm.jmp(done);
        self.masm.bind(slow);
    }
}
