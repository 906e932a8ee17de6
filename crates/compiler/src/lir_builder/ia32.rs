//! Lowering rules for the 32-bit target.
//!
//! Only `eax`, `ebx` and `ecx` are allocatable, so inline sequences use the
//! reserved scratch register `edx` rather than an allocator temp, and
//! operands those sequences address are pinned to `eax`.

use crate::hir::{HirOpcode, InstrId, Representation};
use crate::lir::{LOpcode, LUse};
use crate::target::ia32::{EAX, EBX, ECX};
use crate::CompilerResult;

use super::{smi_fast_path, FunctionLowering, LoweringRules};

pub struct Ia32Rules;

impl LoweringRules for Ia32Rules {
    fn lower(&self, cx: &mut FunctionLowering<'_>, id: InstrId) -> CompilerResult<()> {
        let opcode = cx.instr(id).opcode;
        match opcode {
            HirOpcode::Entry { context_slots } => {
                cx.emit(LOpcode::Entry { context_slots }, Some(id)).mark_has_call();
            }
            HirOpcode::Return => {
                let value = cx.to_fixed(id, 0, EAX)?;
                cx.emit(LOpcode::Return, Some(id)).add_arg(LUse::register(value));
            }
            HirOpcode::Goto => cx.bare(id, LOpcode::Goto),
            HirOpcode::If => {
                let coerce = cx.arg_representation(id, 0)? != Representation::BOOLEAN;
                let condition = cx.to_fixed(id, 0, EAX)?;
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
                cx.stub(id, LOpcode::BinOp { op, smi_fast }, &[EAX, EBX], Some(EAX))?;
            }
            HirOpcode::Not => cx.stub(id, LOpcode::Not, &[EAX], Some(EAX))?,
            HirOpcode::Typeof => cx.stub(id, LOpcode::Typeof, &[EAX], Some(EAX))?,
            HirOpcode::Sizeof => cx.stub(id, LOpcode::Sizeof, &[EAX], Some(EAX))?,
            HirOpcode::Keysof => cx.stub(id, LOpcode::Keysof, &[EAX], Some(EAX))?,
            HirOpcode::Clone => cx.stub(id, LOpcode::Clone, &[EAX], Some(EAX))?,
            HirOpcode::LoadProperty => cx.stub(id, LOpcode::LoadProperty, &[EAX, EBX], Some(EAX))?,
            HirOpcode::StoreProperty => cx.stub(id, LOpcode::StoreProperty, &[EAX, EBX, ECX], Some(ECX))?,
            HirOpcode::DeleteProperty => cx.stub(id, LOpcode::DeleteProperty, &[EAX, EBX], None)?,
            HirOpcode::AllocateObject { size } => cx.stub(id, LOpcode::AllocateObject { size }, &[], Some(EAX))?,
            HirOpcode::AllocateArray { size } => cx.stub(id, LOpcode::AllocateArray { size }, &[], Some(EAX))?,
            HirOpcode::LoadContext(slot) => {
                let result = cx.result_virtual(id);
                cx.emit(LOpcode::LoadContext(slot), Some(id)).set_result(LUse::any(result));
            }
            HirOpcode::StoreContext(slot) => {
                let value = cx.to_fixed(id, 0, EAX)?;
                cx.emit(LOpcode::StoreContext(slot), Some(id)).add_arg(LUse::register(value));
                cx.alias(id, 0)?;
            }
            HirOpcode::LoadArg => {
                let index = cx.to_fixed(id, 0, EAX)?;
                let result = cx.new_fixed(EAX);
                cx.emit(LOpcode::LoadArg, Some(id))
                    .add_arg(LUse::register(index))
                    .set_result(LUse::register(result));
                cx.define_from_fixed(id, result, EAX);
            }
            HirOpcode::LoadVarArg => cx.stub(id, LOpcode::LoadVarArg, &[EAX, EBX, ECX], Some(ECX))?,
            HirOpcode::StoreArg => {
                let value = cx.use_any(id, 0)?;
                cx.emit(LOpcode::StoreArg, Some(id)).add_arg(value);
            }
            HirOpcode::StoreVarArg => cx.stub(id, LOpcode::StoreVarArg, &[EAX], None)?,
            HirOpcode::AlignStack => {
                let argc = cx.to_fixed(id, 0, EAX)?;
                cx.emit(LOpcode::AlignStack, Some(id)).add_arg(LUse::register(argc));
            }
            HirOpcode::Call => cx.stub(id, LOpcode::Call, &[EBX, EAX], Some(EAX))?,
            HirOpcode::Function { body, arg_count } => {
                cx.reference(body);
                cx.stub(id, LOpcode::Function { body, arg_count }, &[], Some(EAX))?;
            }
            HirOpcode::CollectGarbage => cx.stub(id, LOpcode::CollectGarbage, &[], None)?,
            HirOpcode::GetStackTrace => cx.stub(id, LOpcode::GetStackTrace, &[], Some(EAX))?,
            HirOpcode::Phi => return Err(cx.lowering_error(id, "phi outside the phi list")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{FunctionId, HirGraph};
    use crate::lir::IntervalKind;
    use crate::lir_builder::LirBuilder;
    use crate::target::Target;
    use marlin_ast::{ScopeSlot, Span};

    #[test]
    fn test_context_store_pins_value_to_eax() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 1, Span::default());
        let root = graph.function(f).root;
        let nil = graph.add_instruction(root, HirOpcode::Nil, &[], None).unwrap();
        let store = graph
            .add_instruction(root, HirOpcode::StoreContext(ScopeSlot::context(0)), &[nil], None)
            .unwrap();
        graph.ret(root, store).unwrap();

        let program = LirBuilder::new(&graph, Target::Ia32).build(FunctionId(0)).unwrap();
        let function = &program.functions[0];
        let instr = function
            .instructions
            .iter()
            .find(|i| matches!(i.op, LOpcode::StoreContext(_)))
            .unwrap();
        assert!(instr.temps.is_empty());
        assert_eq!(function.interval(instr.inputs[0].interval).kind, IntervalKind::Fixed(EAX));
        // The store evaluates to the stored value.
        assert_eq!(function.values[&store], function.values[&nil]);
    }
}
