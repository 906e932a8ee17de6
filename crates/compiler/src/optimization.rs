//! # HIR Optimization Pipeline
//!
//! Three passes, each driven to its own fixed point and run in a fixed
//! order with no interleaving: GVN, representation inference, then
//! dominance-based scheduling. Representation always runs because lowering
//! consults it.

use crate::gcm::GlobalCodeMotion;
use crate::gvn::GlobalValueNumbering;
use crate::hir::{FunctionId, HirGraph};
use crate::representation::RepresentationInference;
use crate::CompilerResult;
use serde::{Deserialize, Serialize};

/// Optimization pass trait
pub trait OptimizationPass {
    /// Name of this optimization
    fn name(&self) -> &'static str;

    /// Run the pass over one function; returns whether anything changed.
    fn run(&mut self, graph: &mut HirGraph, function: FunctionId) -> CompilerResult<bool>;
}

/// Optimization level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptLevel {
    /// Representation inference only
    None,
    /// Scheduling without value numbering
    Less,
    #[default]
    Default,
}

pub struct OptimizationPipeline {
    passes: Vec<Box<dyn OptimizationPass>>,
    level: OptLevel,
    max_iterations: usize,
}

impl OptimizationPipeline {
    pub fn new(level: OptLevel, max_iterations: usize) -> Self {
        let mut pipeline = Self {
            passes: Vec::new(),
            level,
            max_iterations: max_iterations.max(1),
        };
        pipeline.add_default_passes();
        pipeline
    }

    fn add_default_passes(&mut self) {
        let max = self.max_iterations;
        if self.level == OptLevel::Default {
            self.passes.push(Box::new(GlobalValueNumbering::new(max)));
        }
        self.passes.push(Box::new(RepresentationInference::new(max)));
        if self.level != OptLevel::None {
            self.passes.push(Box::new(GlobalCodeMotion::new()));
        }
    }

    pub fn level(&self) -> OptLevel {
        self.level
    }

    pub fn pass_names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every pass until a sweep reports no change, or the iteration
    /// bound is hit.
    pub fn run(&mut self, graph: &mut HirGraph, function: FunctionId) -> CompilerResult<()> {
        for pass in &mut self.passes {
            let mut iterations = 0;
            while iterations < self.max_iterations && pass.run(graph, function)? {
                iterations += 1;
            }
            log::debug!("[{}] {} settled after {} sweeps", pass.name(), function, iterations);
        }
        Ok(())
    }
}
