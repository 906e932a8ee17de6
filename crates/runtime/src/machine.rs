//! # Reference Machine
//!
//! Executes a [`CompiledModule`] instruction by instruction with the register
//! file and calling convention recorded in its [`MachineConfig`].
//!
//! Frame protocol shared with the code generator:
//!
//! - the caller pushes an alignment pad when argc is odd, then the arguments
//!   last-to-first, puts the tagged argc in the result register and calls
//! - `Call` installs the callee's parent context and pushes the return address
//! - on return the callee leaves its result in the result register and the
//!   number of argument bytes to drop in [`MachineConfig::arg_pop`]
//!
//! After every stub call the caller-saved registers the stub does not return
//! through are overwritten with [`POISON`], a word that is neither a small
//! integer nor a valid address.

use crate::asm::{AluOp, Condition, Instruction, Operand, Reg};
use crate::error::{RuntimeError, RuntimeResult};
use crate::heap::Heap;
use crate::module::{CompiledModule, ConstantKind, MachineConfig};
use crate::stubs;
use crate::value::{tag_smi, HeapTag, Layout, Value, Word, NIL};

pub const POISON: Word = 2;

const RETURN_SENTINEL: Word = -2;

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    zero: bool,
    less: bool,
    overflow: bool,
}

pub struct Machine<'m> {
    module: &'m CompiledModule,
    layout: Layout,
    heap: Heap,
    registers: Vec<Word>,
    flags: Flags,
    pc: usize,
    root: Word,
    steps: u64,
    step_limit: u64,
}

impl<'m> Machine<'m> {
    pub const DEFAULT_HEAP_WORDS: u32 = 1 << 18;
    pub const DEFAULT_STACK_WORDS: u32 = 1 << 14;
    pub const DEFAULT_STEP_LIMIT: u64 = 10_000_000;

    pub fn new(module: &'m CompiledModule) -> RuntimeResult<Self> {
        let config = &module.machine;
        let mut heap = Heap::new(config.pointer_size, Self::DEFAULT_HEAP_WORDS, Self::DEFAULT_STACK_WORDS)?;
        let root = Self::materialize_root(&mut heap, module)?;
        Ok(Self {
            module,
            layout: Layout::new(config.pointer_size),
            heap,
            registers: vec![NIL; config.register_count as usize],
            flags: Flags::default(),
            pc: 0,
            root,
            steps: 0,
            step_limit: Self::DEFAULT_STEP_LIMIT,
        })
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Build the literal pool as a context object the root register points at.
    fn materialize_root(heap: &mut Heap, module: &CompiledModule) -> RuntimeResult<Word> {
        let root = heap.context(NIL, module.constants.len() as u32)?;
        let layout = heap.layout();
        for (index, constant) in module.constants.iter().enumerate() {
            let value = match constant.kind {
                ConstantKind::Number => match constant.text.parse::<i64>() {
                    Ok(int) => heap.integer(int)?,
                    Err(_) => {
                        let float: f64 = constant
                            .text
                            .parse()
                            .map_err(|_| RuntimeError::InvalidConstant(constant.text.clone()))?;
                        heap.number(float)?
                    }
                },
                ConstantKind::String | ConstantKind::Property => heap.string(&constant.text)?,
                ConstantKind::True => heap.boolean(true),
                ConstantKind::False => heap.boolean(false),
            };
            heap.write_field(root, layout.root_slot(index as u32), value)?;
        }
        Ok(root)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.module.machine
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn describe(&self, value: Word) -> RuntimeResult<Value> {
        self.heap.describe(value, 16)
    }

    /// Run the top-level function with `args` and return its result word.
    pub fn run(&mut self, args: &[Word]) -> RuntimeResult<Word> {
        let module = self.module;
        let entry = module
            .entry()
            .ok_or_else(|| RuntimeError::InvalidInstruction("module has no functions".into()))?;
        let config = &module.machine;

        self.registers.iter_mut().for_each(|r| *r = NIL);
        self.set_reg(config.stack_pointer, self.heap.stack_top());
        self.set_reg(config.frame_pointer, NIL);

        if args.len() % 2 == 1 {
            self.push_word(NIL)?;
        }
        for arg in args.iter().rev() {
            self.push_word(*arg)?;
        }
        self.set_reg(config.result(), tag_smi(args.len() as i64));
        self.set_reg(config.context, NIL);
        self.set_reg(config.root, self.root);
        self.push_word(RETURN_SENTINEL)?;
        self.pc = module.code.resolve(entry.entry)?;

        log::debug!("[MACHINE] run {} with {} args", config.name, args.len());
        loop {
            if self.steps >= self.step_limit {
                return Err(RuntimeError::StepLimitExceeded(self.step_limit));
            }
            self.steps += 1;
            if self.step()? {
                break;
            }
        }
        Ok(self.reg(config.result()))
    }

    // ====== STATE ACCESS (shared with stubs) ======

    pub(crate) fn reg(&self, reg: Reg) -> Word {
        self.registers.get(reg.0 as usize).copied().unwrap_or(NIL)
    }

    pub(crate) fn set_reg(&mut self, reg: Reg, value: Word) {
        if let Some(slot) = self.registers.get_mut(reg.0 as usize) {
            *slot = value;
        }
    }

    pub(crate) fn stub_arg(&self, index: usize) -> Word {
        self.reg(self.module.machine.stub_args[index])
    }

    pub(crate) fn set_stub_arg(&mut self, index: usize, value: Word) {
        let reg = self.module.machine.stub_args[index];
        self.set_reg(reg, value);
    }

    pub(crate) fn layout(&self) -> Layout {
        self.layout
    }

    pub(crate) fn push_word(&mut self, value: Word) -> RuntimeResult<()> {
        let sp_reg = self.module.machine.stack_pointer;
        let sp = self.reg(sp_reg) - self.layout.pointer_size as Word;
        if sp < self.heap.stack_limit() {
            return Err(RuntimeError::StackOverflow);
        }
        self.heap.write(sp, value)?;
        self.set_reg(sp_reg, sp);
        Ok(())
    }

    fn pop_word(&mut self) -> RuntimeResult<Word> {
        let sp_reg = self.module.machine.stack_pointer;
        let sp = self.reg(sp_reg);
        let value = self.heap.read(sp)?;
        self.set_reg(sp_reg, sp + self.layout.pointer_size as Word);
        Ok(value)
    }

    // ====== EXECUTION ======

    /// Wrap `value` to the target word width, reporting signed overflow.
    fn normalize(&self, value: i128) -> (Word, bool) {
        if self.layout.pointer_size == 4 {
            let wrapped = value as i32;
            (wrapped as Word, wrapped as i128 != value)
        } else {
            let wrapped = value as i64;
            (wrapped, wrapped as i128 != value)
        }
    }

    fn read_operand(&self, operand: Operand) -> RuntimeResult<Word> {
        match operand {
            Operand::Reg(reg) => Ok(self.reg(reg)),
            Operand::Imm(value) => Ok(value),
            Operand::Mem { base, disp } => self.heap.read(self.reg(base) + disp as Word),
        }
    }

    fn write_operand(&mut self, operand: Operand, value: Word) -> RuntimeResult<()> {
        match operand {
            Operand::Reg(reg) => {
                self.set_reg(reg, value);
                Ok(())
            }
            Operand::Mem { base, disp } => {
                let address = self.reg(base) + disp as Word;
                self.heap.write(address, value)
            }
            Operand::Imm(_) => Err(RuntimeError::InvalidInstruction("immediate destination".into())),
        }
    }

    fn condition_holds(&self, cond: Condition) -> bool {
        let Flags { zero, less, overflow } = self.flags;
        match cond {
            Condition::Eq => zero,
            Condition::Ne => !zero,
            Condition::Lt => less,
            Condition::Le => less || zero,
            Condition::Gt => !less && !zero,
            Condition::Ge => !less,
            Condition::Overflow => overflow,
            Condition::NoOverflow => !overflow,
        }
    }

    fn set_result_flags(&mut self, result: Word, overflow: bool) {
        self.flags = Flags {
            zero: result == 0,
            less: result < 0,
            overflow,
        };
    }

    fn jump(&mut self, label: crate::asm::Label) -> RuntimeResult<()> {
        self.pc = self.module.code.resolve(label)?;
        Ok(())
    }

    /// Execute one instruction. Returns `true` once the top-level frame returns.
    fn step(&mut self) -> RuntimeResult<bool> {
        let module = self.module;
        let instruction = module
            .code
            .instructions()
            .get(self.pc)
            .ok_or_else(|| RuntimeError::InvalidInstruction(format!("pc {} out of range", self.pc)))?;
        self.pc += 1;

        match instruction {
            Instruction::Mov { dst, src } => {
                if dst.is_mem() && src.is_mem() {
                    return Err(RuntimeError::InvalidInstruction(format!("{}", instruction)));
                }
                let value = self.read_operand(*src)?;
                self.write_operand(*dst, value)?;
            }
            Instruction::Alu { op, dst, src } => {
                let lhs = self.reg(*dst);
                let rhs = self.read_operand(*src)?;
                let (result, overflow) = match op {
                    AluOp::Add => self.normalize(lhs as i128 + rhs as i128),
                    AluOp::Sub => self.normalize(lhs as i128 - rhs as i128),
                    AluOp::And => (self.normalize((lhs & rhs) as i128).0, false),
                    AluOp::Or => (self.normalize((lhs | rhs) as i128).0, false),
                    AluOp::Xor => (self.normalize((lhs ^ rhs) as i128).0, false),
                };
                self.set_reg(*dst, result);
                self.set_result_flags(result, overflow);
            }
            Instruction::Shl { dst, amount } => {
                let value = self.reg(*dst);
                let (result, _) = self.normalize((value as i128) << *amount);
                self.set_reg(*dst, result);
                self.set_result_flags(result, false);
            }
            Instruction::Sar { dst, amount } => {
                let result = self.reg(*dst) >> *amount;
                self.set_reg(*dst, result);
                self.set_result_flags(result, false);
            }
            Instruction::Cmp { lhs, rhs } => {
                let a = self.read_operand(*lhs)?;
                let b = self.read_operand(*rhs)?;
                self.flags = Flags {
                    zero: a == b,
                    less: a < b,
                    overflow: false,
                };
            }
            Instruction::Jmp(label) => self.jump(*label)?,
            Instruction::Jcc(cond, label) => {
                if self.condition_holds(*cond) {
                    self.jump(*label)?;
                }
            }
            Instruction::Push(src) => {
                let value = self.read_operand(*src)?;
                self.push_word(value)?;
            }
            Instruction::Pop(dst) => {
                let value = self.pop_word()?;
                self.set_reg(*dst, value);
            }
            Instruction::LoadLabel { dst, label } => {
                self.set_reg(*dst, label.0 as Word);
            }
            Instruction::CallStub(stub) => {
                log::trace!("[MACHINE] stub {}", stub);
                stubs::invoke(self, *stub)?;
                let config = &module.machine;
                for reg in &config.caller_saved {
                    let preserved = stub.outputs().iter().any(|i| config.stub_args[*i] == *reg);
                    if !preserved {
                        self.set_reg(*reg, POISON);
                    }
                }
            }
            Instruction::Call(reg) => {
                let function = self.reg(*reg);
                if self.heap.tag_of(function)? != Some(HeapTag::Function) {
                    return Err(RuntimeError::NotAFunction(function));
                }
                let code = self.heap.read_field(function, self.layout.function_code())?;
                let parent = self.heap.read_field(function, self.layout.function_parent())?;
                self.set_reg(module.machine.context, parent);
                self.push_word(self.pc as Word)?;
                self.jump(crate::asm::Label(code as u32))?;
            }
            Instruction::Ret => {
                let address = self.pop_word()?;
                if address == RETURN_SENTINEL {
                    return Ok(true);
                }
                self.pc = address as usize;
            }
        }
        Ok(false)
    }
}
