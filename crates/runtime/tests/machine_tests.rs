//! Reference machine tests with hand-assembled code.

use marlin_ast::BinOpKind;
use marlin_runtime::machine::POISON;
use marlin_runtime::value::tag_smi;
use marlin_runtime::{
    Assembler, CompiledModule, Condition, Constant, ConstantKind, FunctionInfo, Layout, Machine, MachineConfig,
    MacroAssembler, Operand, Reg, RuntimeError, Stub, Value,
};

const R0: Reg = Reg(0);
const R1: Reg = Reg(1);
const R2: Reg = Reg(2);
const ROOT: Reg = Reg(6);

fn config() -> MachineConfig {
    MachineConfig {
        name: "test64".to_string(),
        pointer_size: 8,
        register_count: 16,
        stack_pointer: Reg(14),
        frame_pointer: Reg(15),
        context: Reg(7),
        root: ROOT,
        stub_args: [R0, R1, R2],
        caller_saved: vec![R0, R1, R2, Reg(3)],
    }
}

fn module(build: impl FnOnce(&mut Assembler), constants: Vec<Constant>) -> CompiledModule {
    let mut masm = Assembler::new();
    let entry = masm.new_label();
    masm.bind(entry);
    build(&mut masm);
    CompiledModule {
        code: masm.finish(),
        functions: vec![FunctionInfo {
            entry,
            arg_count: 0,
            stack_slots: 0,
            context_slots: 0,
            spill_slots: 0,
        }],
        constants,
        machine: config(),
    }
}

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_stub_call_returns_in_result_register() {
    init_logger();
    let module = module(
        |masm| {
            masm.mov(Operand::Reg(R0), Operand::Imm(tag_smi(2)));
            masm.mov(Operand::Reg(R1), Operand::Imm(tag_smi(3)));
            masm.call_stub(Stub::BinOp(BinOpKind::Add));
            masm.ret();
        },
        Vec::new(),
    );
    let mut machine = Machine::new(&module).unwrap();
    let result = machine.run(&[]).unwrap();
    assert_eq!(result, tag_smi(5));
}

#[test]
fn test_caller_saved_registers_are_poisoned() {
    let module = module(
        |masm| {
            masm.mov(Operand::Reg(R1), Operand::Imm(tag_smi(1)));
            masm.mov(Operand::Reg(Reg(9)), Operand::Imm(tag_smi(4)));
            masm.call_stub(Stub::CollectGarbage);
            // r1 is caller-saved and must not survive; r9 is not.
            masm.mov(Operand::Reg(R0), Operand::Reg(R1));
            masm.cmp(Operand::Reg(R0), Operand::Imm(POISON));
            let ok = masm.new_label();
            masm.jcc(Condition::Eq, ok);
            masm.mov(Operand::Reg(Reg(9)), Operand::Imm(0));
            masm.bind(ok);
            masm.mov(Operand::Reg(R0), Operand::Reg(Reg(9)));
            masm.ret();
        },
        Vec::new(),
    );
    let mut machine = Machine::new(&module).unwrap();
    assert_eq!(machine.run(&[]).unwrap(), tag_smi(4));
}

#[test]
fn test_root_constants_are_materialized() {
    let layout = Layout::new(8);
    let module = module(
        |masm| {
            masm.mov(Operand::Reg(R0), Operand::mem(ROOT, layout.root_slot(1)));
            masm.ret();
        },
        vec![
            Constant::new(ConstantKind::Number, "1"),
            Constant::new(ConstantKind::String, "hello"),
        ],
    );
    let mut machine = Machine::new(&module).unwrap();
    let result = machine.run(&[]).unwrap();
    assert_eq!(machine.describe(result).unwrap(), Value::String("hello".into()));
}

#[test]
fn test_calling_a_non_function_fails() {
    let module = module(
        |masm| {
            masm.mov(Operand::Reg(R1), Operand::Imm(tag_smi(1)));
            masm.call(R1);
            masm.ret();
        },
        Vec::new(),
    );
    let mut machine = Machine::new(&module).unwrap();
    assert_eq!(machine.run(&[]), Err(RuntimeError::NotAFunction(tag_smi(1))));
}

#[test]
fn test_memory_to_memory_move_is_rejected() {
    let module = module(
        |masm| {
            masm.mov(Operand::mem(ROOT, 8), Operand::mem(ROOT, 16));
            masm.ret();
        },
        Vec::new(),
    );
    let mut machine = Machine::new(&module).unwrap();
    assert!(matches!(machine.run(&[]), Err(RuntimeError::InvalidInstruction(_))));
}

#[test]
fn test_step_limit() {
    let module = module(
        |masm| {
            let top = masm.new_label();
            masm.bind(top);
            masm.jmp(top);
        },
        Vec::new(),
    );
    let mut machine = Machine::new(&module).unwrap().with_step_limit(100);
    assert_eq!(machine.run(&[]), Err(RuntimeError::StepLimitExceeded(100)));
}

#[test]
fn test_overflow_flag_on_narrow_target() {
    let mut config = config();
    config.pointer_size = 4;
    let mut masm = Assembler::new();
    let entry = masm.new_label();
    let overflow = masm.new_label();
    masm.bind(entry);
    masm.mov(Operand::Reg(R0), Operand::Imm(i32::MAX as i64));
    masm.add(R0, Operand::Imm(1));
    masm.jcc(Condition::Overflow, overflow);
    masm.mov(Operand::Reg(R0), Operand::Imm(tag_smi(0)));
    masm.ret();
    masm.bind(overflow);
    masm.mov(Operand::Reg(R0), Operand::Imm(tag_smi(1)));
    masm.ret();
    let module = CompiledModule {
        code: masm.finish(),
        functions: vec![FunctionInfo {
            entry,
            arg_count: 0,
            stack_slots: 0,
            context_slots: 0,
            spill_slots: 0,
        }],
        constants: Vec::new(),
        machine: config,
    };
    let mut machine = Machine::new(&module).unwrap();
    assert_eq!(machine.run(&[]).unwrap(), tag_smi(1));
}
