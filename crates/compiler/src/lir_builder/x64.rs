//! Lowering rules for the 64-bit target.
//!
//! Stub operands go through `rax`/`rbx`/`rcx`; inline sequences (the
//! tagged-integer fast path, argument loads, context walks, stack
//! alignment) ask the allocator for a temporary register instead of
//! borrowing the scratch register.

use crate::hir::{HirOpcode, InstrId, Representation};
use crate::lir::{LOpcode, LUse};
use crate::target::x64::{RAX, RBX, RCX};
use crate::CompilerResult;

use super::{smi_fast_path, FunctionLowering, LoweringRules};

pub struct X64Rules;

impl LoweringRules for X64Rules {
    fn lower(&self, cx: &mut FunctionLowering<'_>, id: InstrId) -> CompilerResult<()> {
        let opcode = cx.instr(id).opcode;
        match opcode {
            HirOpcode::Entry { context_slots } => {
                cx.emit(LOpcode::Entry { context_slots }, Some(id)).mark_has_call();
            }
            HirOpcode::Return => {
                let value = cx.to_fixed(id, 0, RAX)?;
                cx.emit(LOpcode::Return, Some(id)).add_arg(LUse::register(value));
            }
            HirOpcode::Goto => cx.bare(id, LOpcode::Goto),
            HirOpcode::If => {
                let coerce = cx.arg_representation(id, 0)? != Representation::BOOLEAN;
                let condition = cx.to_fixed(id, 0, RAX)?;
                cx.emit(LOpcode::Branch { coerce }, Some(id))
                    .mark_has_call()
                    .add_arg(LUse::register(condition));
            }
            HirOpcode::Nil => {
                let result = cx.result_virtual(id);
                cx.emit(LOpcode::Nil, Some(id)).set_result(LUse::any(result));
            }
            HirOpcode::Literal(slot) => {
                let result = cx.result_virtual(id);
                cx.emit(LOpcode::Literal(slot), Some(id)).set_result(LUse::any(result));
            }
            HirOpcode::BinOp(op) => {
                let smi_fast = smi_fast_path(cx, id, op)?;
                let lhs = cx.to_fixed(id, 0, RAX)?;
                let rhs = cx.to_fixed(id, 1, RBX)?;
                let result = cx.new_fixed(RAX);
                let temp = smi_fast.then(|| cx.new_temp());
                let instr = cx.emit(LOpcode::BinOp { op, smi_fast }, Some(id));
                instr
                    .mark_has_call()
                    .add_arg(LUse::register(lhs))
                    .add_arg(LUse::register(rhs))
                    .set_result(LUse::register(result));
                if let Some(temp) = temp {
                    instr.add_scratch(temp);
                }
                cx.define_from_fixed(id, result, RAX);
            }
            HirOpcode::Not => cx.stub(id, LOpcode::Not, &[RAX], Some(RAX))?,
            HirOpcode::Typeof => cx.stub(id, LOpcode::Typeof, &[RAX], Some(RAX))?,
            HirOpcode::Sizeof => cx.stub(id, LOpcode::Sizeof, &[RAX], Some(RAX))?,
            HirOpcode::Keysof => cx.stub(id, LOpcode::Keysof, &[RAX], Some(RAX))?,
            HirOpcode::Clone => cx.stub(id, LOpcode::Clone, &[RAX], Some(RAX))?,
            HirOpcode::LoadProperty => cx.stub(id, LOpcode::LoadProperty, &[RAX, RBX], Some(RAX))?,
            HirOpcode::StoreProperty => cx.stub(id, LOpcode::StoreProperty, &[RAX, RBX, RCX], Some(RCX))?,
            HirOpcode::DeleteProperty => cx.stub(id, LOpcode::DeleteProperty, &[RAX, RBX], None)?,
            HirOpcode::AllocateObject { size } => cx.stub(id, LOpcode::AllocateObject { size }, &[], Some(RAX))?,
            HirOpcode::AllocateArray { size } => cx.stub(id, LOpcode::AllocateArray { size }, &[], Some(RAX))?,
            HirOpcode::LoadContext(slot) => {
                let temp = cx.new_temp();
                let result = cx.result_virtual(id);
                cx.emit(LOpcode::LoadContext(slot), Some(id))
                    .add_scratch(temp)
                    .set_result(LUse::any(result));
            }
            HirOpcode::StoreContext(slot) => {
                let value = cx.use_register(id, 0)?;
                let temp = cx.new_temp();
                cx.emit(LOpcode::StoreContext(slot), Some(id))
                    .add_arg(value)
                    .add_scratch(temp);
                cx.alias(id, 0)?;
            }
            HirOpcode::LoadArg => {
                let index = cx.use_register(id, 0)?;
                let temp = cx.new_temp();
                let result = cx.result_virtual(id);
                cx.emit(LOpcode::LoadArg, Some(id))
                    .add_arg(index)
                    .add_scratch(temp)
                    .set_result(LUse::any(result));
            }
            HirOpcode::LoadVarArg => cx.stub(id, LOpcode::LoadVarArg, &[RAX, RBX, RCX], Some(RCX))?,
            HirOpcode::StoreArg => {
                let value = cx.use_any(id, 0)?;
                cx.emit(LOpcode::StoreArg, Some(id)).add_arg(value);
            }
            HirOpcode::StoreVarArg => cx.stub(id, LOpcode::StoreVarArg, &[RAX], None)?,
            HirOpcode::AlignStack => {
                let argc = cx.use_register(id, 0)?;
                let temp = cx.new_temp();
                cx.emit(LOpcode::AlignStack, Some(id)).add_arg(argc).add_scratch(temp);
            }
            HirOpcode::Call => cx.stub(id, LOpcode::Call, &[RBX, RAX], Some(RAX))?,
            HirOpcode::Function { body, arg_count } => {
                cx.reference(body);
                cx.stub(id, LOpcode::Function { body, arg_count }, &[], Some(RAX))?;
            }
            HirOpcode::CollectGarbage => cx.stub(id, LOpcode::CollectGarbage, &[], None)?,
            HirOpcode::GetStackTrace => cx.stub(id, LOpcode::GetStackTrace, &[], Some(RAX))?,
            HirOpcode::Phi => return Err(cx.lowering_error(id, "phi outside the phi list")),
        }
        Ok(())
    }
}
