//! # Global Code Motion
//!
//! Schedule-early placement of floating instructions: every unpinned value
//! moves to the deepest dominator-tree block among its arguments' blocks,
//! which is the highest point where all of its inputs are available. Values
//! without arguments float to the function entry.
//!
//! Running after GVN, this restores "definitions dominate uses" for
//! canonical instructions whose consumers were redirected from a sibling
//! block.

use crate::dominance::dominator_depth;
use crate::hir::{BlockId, FunctionId, HirGraph, InstrId};
use crate::optimization::OptimizationPass;
use crate::CompilerResult;

#[derive(Default)]
pub struct GlobalCodeMotion {
    epoch: u32,
    moved: usize,
}

impl GlobalCodeMotion {
    pub fn new() -> Self {
        Self::default()
    }

    fn floats(graph: &HirGraph, id: InstrId) -> bool {
        let instr = graph.instr(id);
        !instr.pinned && !instr.removed && !instr.is_phi()
    }

    /// Place `id` after its arguments; returns the block it ends up in.
    fn schedule_early(&mut self, graph: &mut HirGraph, root: BlockId, id: InstrId) -> BlockId {
        if !Self::floats(graph, id) || graph.instr(id).gcm_epoch == self.epoch {
            return graph.instr(id).block;
        }
        graph.instr_mut(id).gcm_epoch = self.epoch;

        let mut target = root;
        let mut depth = 0;
        let args = graph.instr(id).args.clone();
        for arg in args {
            let block = self.schedule_early(graph, root, arg);
            let arg_depth = dominator_depth(graph, block);
            if arg_depth > depth {
                target = block;
                depth = arg_depth;
            }
        }

        let current = graph.instr(id).block;
        if target != current {
            log::trace!("[GCM] {} {} -> {}", id, current, target);
            graph.move_to_end(id, target);
            self.moved += 1;
        }
        target
    }
}

impl OptimizationPass for GlobalCodeMotion {
    fn name(&self) -> &'static str {
        "GCM"
    }

    fn run(&mut self, graph: &mut HirGraph, function: FunctionId) -> CompilerResult<bool> {
        self.epoch = self.epoch.wrapping_add(1);
        self.moved = 0;
        let root = graph.function(function).root;
        for block in graph.function(function).blocks.clone() {
            for id in graph.block(block).instructions.clone() {
                self.schedule_early(graph, root, id);
            }
        }
        if self.moved > 0 {
            log::debug!("[GCM] {}: moved {} instructions", function, self.moved);
        }
        Ok(self.moved > 0)
    }
}
