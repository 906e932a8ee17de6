//! # Marlin Compiler
//!
//! Middle and back end for Marlin: turns a scope-resolved AST into machine
//! code for either the 64-bit or the 32-bit target.
//!
//! ## Architecture
//!
//! - **HIR**: CFG plus SSA, built in one AST walk with per-block
//!   environments and phis ([`hir_builder`])
//! - **Analysis**: Lengauer–Tarjan dominators ([`dominance`])
//! - **Optimization**: GVN, representation inference and dominance-based
//!   scheduling, each run to a fixed point ([`optimization`])
//! - **LIR**: register-constrained lowering per target ([`lir_builder`]),
//!   live intervals and a linear-scan allocator ([`regalloc`])
//! - **Code generation** through the runtime's `MacroAssembler` ([`codegen`])
//!
//! ## Design Principles
//!
//! - One arena per compilation; every cross reference is an index
//! - Every opcode-dependent operation is an exhaustive match
//! - Structural faults abort compilation; capacity pressure never surfaces

pub mod codegen;
pub mod dominance;
pub mod gcm;
pub mod gvn;
pub mod hir;
pub mod hir_builder;
pub mod lir;
pub mod lir_builder;
pub mod optimization;
pub mod regalloc;
pub mod representation;
pub mod root;
pub mod target;

pub use hir::{BlockId, FunctionId, HirBlock, HirGraph, HirInstruction, HirOpcode, InstrId, Representation};
pub use hir_builder::HirBuilder;
pub use lir::{IntervalId, LInstruction, LInterval, LOpcode, LirFunction, LirProgram, Location};
pub use optimization::{OptLevel, OptimizationPass, OptimizationPipeline};
pub use root::{Root, RootSlot};
pub use target::{RegisterFile, Target};

use marlin_ast::{FunctionLiteral, ScopeSlot};
use marlin_runtime::CompiledModule;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Malformed input or an internal invariant violation. Always fatal to the
/// compilation that observed it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StructuralFault {
    #[error("block {block} already ended; cannot append {opcode}")]
    BlockEnded { block: u32, opcode: &'static str },

    #[error("block {block} would get a third predecessor")]
    TooManyPredecessors { block: u32 },

    #[error("block {block} would get a third successor")]
    TooManySuccessors { block: u32 },

    #[error("phi {phi} has more inputs than its block has predecessors")]
    PhiInputOverflow { phi: u32 },

    #[error("{opcode} expects {expected} arguments, got {actual}")]
    ArityMismatch {
        opcode: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid assignment target")]
    InvalidAssignmentTarget,

    #[error("{0} must be in the last position")]
    VariadicNotLast(&'static str),

    #[error("stack slot {slot} out of range for a frame of {slots} slots")]
    SlotOutOfRange { slot: ScopeSlot, slots: u32 },

    #[error("break outside of a loop")]
    BreakOutsideLoop,

    #[error("continue outside of a loop")]
    ContinueOutsideLoop,

    #[error("statement found in expression position")]
    UnexpectedStatement,

    #[error("loop header {block} merges slot {slot} without a phi")]
    MissingLoopPhi { block: u32, slot: usize },

    #[error("block {block} has no terminator")]
    MissingTerminator { block: u32 },

    #[error("value {0} was used before being lowered")]
    UndefinedValue(u32),

    #[error("branch into block {block}, which has phis")]
    BranchIntoPhiBlock { block: u32 },
}

#[derive(Error, Debug)]
pub enum CompilerError {
    #[error("Structural fault: {0}")]
    Structural(#[from] StructuralFault),

    #[error("Lowering error: {0}")]
    Lowering(String),

    #[error("Allocation error: {0}")]
    Allocation(String),

    #[error("Code generation error: {0}")]
    CodeGen(String),
}

pub type CompilerResult<T> = Result<T, CompilerError>;

/// Compilation pipeline configuration. Missing fields take their defaults
/// when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilationConfig {
    pub target: Target,
    pub opt_level: OptLevel,
    /// Dump the optimized HIR at `info` level
    pub print_hir: bool,
    /// Dump allocated LIR at `info` level
    pub print_lir: bool,
    /// Upper bound on the sweeps of every fixed-point pass
    pub max_fixpoint_iterations: usize,
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            target: Target::host(),
            opt_level: OptLevel::Default,
            print_hir: false,
            print_lir: false,
            max_fixpoint_iterations: 64,
        }
    }
}

impl CompilationConfig {
    pub fn for_target(target: Target) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    pub fn with_opt_level(mut self, opt_level: OptLevel) -> Self {
        self.opt_level = opt_level;
        self
    }
}

/// Explicit compilation context threaded through every stage.
pub struct Compiler {
    config: CompilationConfig,
}

impl Compiler {
    pub fn new(config: CompilationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CompilationConfig {
        &self.config
    }

    /// Build the HIR of `program` and every function nested in it, then
    /// compute dominators and drop unreachable blocks.
    pub fn build_hir(&self, program: &FunctionLiteral) -> CompilerResult<HirGraph> {
        let mut graph = HirBuilder::new().build(program)?;
        for index in 0..graph.functions.len() {
            dominance::compute_dominators(&mut graph, FunctionId(index as u32))?;
        }
        Ok(graph)
    }

    pub fn optimize(&self, graph: &mut HirGraph) -> CompilerResult<()> {
        let mut pipeline = OptimizationPipeline::new(self.config.opt_level, self.config.max_fixpoint_iterations);
        for index in 0..graph.functions.len() {
            pipeline.run(graph, FunctionId(index as u32))?;
        }
        if self.config.print_hir {
            log::info!("[HIR]\n{}", graph);
        }
        Ok(())
    }

    /// Lower starting from the top-level function; nested bodies follow
    /// lazily as they are referenced.
    pub fn lower(&self, graph: &HirGraph) -> CompilerResult<LirProgram> {
        lir_builder::LirBuilder::new(graph, self.config.target).build(FunctionId(0))
    }

    pub fn allocate(&self, program: &mut LirProgram) -> CompilerResult<()> {
        let registers = self.config.target.registers();
        for function in &mut program.functions {
            regalloc::allocate(function, registers)?;
        }
        if self.config.print_lir {
            log::info!("[LIR]\n{}", program);
        }
        Ok(())
    }

    pub fn emit(&self, program: &LirProgram, graph: &HirGraph) -> CompilerResult<CompiledModule> {
        codegen::generate(program, &graph.root, self.config.target.registers())
    }

    pub fn compile(&self, program: &FunctionLiteral) -> CompilerResult<CompiledModule> {
        let mut graph = self.build_hir(program)?;
        self.optimize(&mut graph)?;
        let mut lir = self.lower(&graph)?;
        self.allocate(&mut lir)?;
        let module = self.emit(&lir, &graph)?;
        log::debug!(
            "[CODEGEN] {} functions, {} instructions for {}",
            module.functions.len(),
            module.code.len(),
            module.machine.name
        );
        Ok(module)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new(CompilationConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_fills_missing_fields() {
        let config: CompilationConfig = serde_json::from_str(r#"{"target": "ia32", "opt_level": "less"}"#).unwrap();
        assert_eq!(config.target, Target::Ia32);
        assert_eq!(config.opt_level, OptLevel::Less);
        assert!(!config.print_hir);
        assert_eq!(config.max_fixpoint_iterations, 64);

        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"ia32\""));
    }
}
