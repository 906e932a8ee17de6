//! Target descriptions: register files and the roles lowering and code
//! generation assign to individual registers.

use marlin_runtime::{MachineConfig, Reg};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    X64,
    Ia32,
}

impl Target {
    /// The variant matching the host pointer width.
    pub fn host() -> Self {
        if cfg!(target_pointer_width = "32") {
            Target::Ia32
        } else {
            Target::X64
        }
    }

    pub fn pointer_size(self) -> u32 {
        self.registers().pointer_size
    }

    pub fn registers(self) -> &'static RegisterFile {
        match self {
            Target::X64 => &X64,
            Target::Ia32 => &IA32,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Target::X64 => "x64",
            Target::Ia32 => "ia32",
        })
    }
}

#[derive(Debug)]
pub struct RegisterFile {
    pub target: Target,
    pub pointer_size: u32,
    pub names: &'static [&'static str],
    /// Registers the allocator may hand out, in preference order.
    pub allocatable: &'static [Reg],
    /// Allocatable registers that survive stub calls.
    pub callee_saved: &'static [Reg],
    pub caller_saved: &'static [Reg],
    /// Stub argument registers; the first one also returns results.
    pub stub_args: [Reg; 3],
    /// Reserved for code generation; never allocated.
    pub scratch: Reg,
    pub context: Reg,
    pub root: Reg,
    pub stack_pointer: Reg,
    pub frame_pointer: Reg,
}

impl RegisterFile {
    pub fn name(&self, reg: Reg) -> &'static str {
        self.names.get(reg.0 as usize).copied().unwrap_or("?")
    }

    pub fn result(&self) -> Reg {
        self.stub_args[0]
    }

    pub fn is_caller_saved(&self, reg: Reg) -> bool {
        self.caller_saved.contains(&reg)
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            name: self.target.to_string(),
            pointer_size: self.pointer_size,
            register_count: self.names.len() as u8,
            stack_pointer: self.stack_pointer,
            frame_pointer: self.frame_pointer,
            context: self.context,
            root: self.root,
            stub_args: self.stub_args,
            caller_saved: self.caller_saved.to_vec(),
        }
    }
}

pub mod x64 {
    use marlin_runtime::Reg;

    pub const RAX: Reg = Reg(0);
    pub const RBX: Reg = Reg(1);
    pub const RCX: Reg = Reg(2);
    pub const RDX: Reg = Reg(3);
    pub const RSI: Reg = Reg(4);
    pub const RDI: Reg = Reg(5);
    pub const R8: Reg = Reg(6);
    pub const R9: Reg = Reg(7);
    pub const R10: Reg = Reg(8);
    pub const R11: Reg = Reg(9);
    pub const R12: Reg = Reg(10);
    pub const R13: Reg = Reg(11);
    pub const R14: Reg = Reg(12);
    pub const R15: Reg = Reg(13);
    pub const RSP: Reg = Reg(14);
    pub const RBP: Reg = Reg(15);
}

pub mod ia32 {
    use marlin_runtime::Reg;

    pub const EAX: Reg = Reg(0);
    pub const EBX: Reg = Reg(1);
    pub const ECX: Reg = Reg(2);
    pub const EDX: Reg = Reg(3);
    pub const ESI: Reg = Reg(4);
    pub const EDI: Reg = Reg(5);
    pub const ESP: Reg = Reg(6);
    pub const EBP: Reg = Reg(7);
}

pub static X64: RegisterFile = RegisterFile {
    target: Target::X64,
    pointer_size: 8,
    names: &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15", "rsp", "rbp",
    ],
    allocatable: &[
        x64::RAX,
        x64::RBX,
        x64::RCX,
        x64::RDX,
        x64::R8,
        x64::R9,
        x64::R10,
        x64::R11,
        x64::R12,
        x64::R13,
        x64::R14,
    ],
    callee_saved: &[x64::R12, x64::R13, x64::R14],
    caller_saved: &[x64::RAX, x64::RBX, x64::RCX, x64::RDX, x64::R8, x64::R9, x64::R10, x64::R11],
    stub_args: [x64::RAX, x64::RBX, x64::RCX],
    scratch: x64::R15,
    context: x64::RDI,
    root: x64::RSI,
    stack_pointer: x64::RSP,
    frame_pointer: x64::RBP,
};

pub static IA32: RegisterFile = RegisterFile {
    target: Target::Ia32,
    pointer_size: 4,
    names: &["eax", "ebx", "ecx", "edx", "esi", "edi", "esp", "ebp"],
    allocatable: &[ia32::EAX, ia32::EBX, ia32::ECX],
    callee_saved: &[],
    caller_saved: &[ia32::EAX, ia32::EBX, ia32::ECX, ia32::EDX],
    stub_args: [ia32::EAX, ia32::EBX, ia32::ECX],
    scratch: ia32::EDX,
    context: ia32::EDI,
    root: ia32::ESI,
    stack_pointer: ia32::ESP,
    frame_pointer: ia32::EBP,
};
