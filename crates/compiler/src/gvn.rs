//! # Global Value Numbering
//!
//! Hash-consing over side-effect-free instructions in reverse postorder.
//! The first instruction seen with a given shape becomes canonical; later
//! duplicates have their consumers redirected to it and are removed.
//! Duplicates may live in sibling blocks, so scheduling must run afterwards
//! to restore "definitions dominate uses".
//!
//! Hashes are memoized per instruction and invalidated by bumping the pass
//! epoch. An instruction reached again while its own hash is in progress (a
//! phi cycle) contributes a fixed sentinel. Where the sentinel lands depends
//! on which member of the cycle was hashed first, so two equal values in a
//! cycle can hash apart. That only loses a merge: [`GlobalValueNumbering::equal`]
//! compares argument identities and never accepts a wrong one.

use rustc_hash::FxHashMap;

use crate::hir::{FunctionId, HashState, HirGraph, InstrId};
use crate::optimization::OptimizationPass;
use crate::CompilerResult;

const IN_PROGRESS: u32 = 0xffff;

/// One step of Bob Jenkins' one-at-a-time hash.
fn mix(hash: u32, value: u32) -> u32 {
    let mut h = hash.wrapping_add(value);
    h = h.wrapping_add(h << 10);
    h ^ (h >> 6)
}

fn finish(hash: u32) -> u32 {
    let mut h = hash.wrapping_add(hash << 3);
    h ^= h >> 11;
    h.wrapping_add(h << 15)
}

pub struct GlobalValueNumbering {
    epoch: u32,
    max_iterations: usize,
    merged: usize,
}

impl GlobalValueNumbering {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            epoch: 0,
            max_iterations: max_iterations.max(1),
            merged: 0,
        }
    }

    /// Merges performed by the last [`OptimizationPass::run`].
    pub fn merged(&self) -> usize {
        self.merged
    }

    pub fn hash(&self, graph: &mut HirGraph, id: InstrId) -> u32 {
        let cache = graph.instr(id).hash;
        if cache.epoch == self.epoch {
            match cache.state {
                HashState::Done(hash) => return hash,
                HashState::InProgress => return IN_PROGRESS,
                HashState::Empty => {}
            }
        }
        graph.instr_mut(id).hash.epoch = self.epoch;
        graph.instr_mut(id).hash.state = HashState::InProgress;

        let instr = graph.instr(id);
        let opcode = instr.opcode;
        let args = instr.args.clone();
        let mut hash = mix(0, opcode.tag());
        hash = mix(hash, opcode.payload_hash());
        for arg in args {
            let arg_hash = self.hash(graph, arg);
            hash = mix(hash, arg_hash);
            hash = mix(hash, arg.number());
        }
        let hash = finish(hash);

        graph.instr_mut(id).hash.state = HashState::Done(hash);
        hash
    }

    /// Same opcode and payload, identical argument identities.
    pub fn equal(graph: &HirGraph, a: InstrId, b: InstrId) -> bool {
        let (a, b) = (graph.instr(a), graph.instr(b));
        a.opcode == b.opcode && a.args == b.args
    }

    /// One numbering sweep; returns the number of merges.
    fn sweep(&mut self, graph: &mut HirGraph, function: FunctionId) -> usize {
        self.epoch = self.epoch.wrapping_add(1);
        let mut table: FxHashMap<u32, Vec<InstrId>> = FxHashMap::default();
        let mut merged = 0;

        let blocks = graph.function(function).blocks.clone();
        for block in &blocks {
            let instructions = graph.block(*block).instructions.clone();
            for id in instructions {
                let instr = graph.instr(id);
                if instr.removed || instr.opcode.has_gvn_side_effects() {
                    continue;
                }
                let hash = self.hash(graph, id);
                let bucket = table.entry(hash).or_default();
                match bucket.iter().copied().find(|c| Self::equal(graph, *c, id)) {
                    Some(canonical) => {
                        log::trace!("[GVN] {} duplicates {}", id, canonical);
                        graph.replace_all_uses(id, canonical);
                        graph.remove_instruction(id);
                        merged += 1;
                    }
                    None => bucket.push(id),
                }
            }
        }
        for block in &blocks {
            graph.compact(*block);
        }
        merged
    }
}

impl OptimizationPass for GlobalValueNumbering {
    fn name(&self) -> &'static str {
        "GVN"
    }

    /// Repeat sweeps until one merges nothing; merging can make consumers
    /// identical in turn.
    fn run(&mut self, graph: &mut HirGraph, function: FunctionId) -> CompilerResult<bool> {
        self.merged = 0;
        for _ in 0..self.max_iterations {
            let merged = self.sweep(graph, function);
            self.merged += merged;
            if merged == 0 {
                break;
            }
        }
        if self.merged > 0 {
            log::debug!("[GVN] {}: merged {} instructions", function, self.merged);
        }
        Ok(self.merged > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::HirOpcode;
    use marlin_ast::{BinOpKind, Span};
    use marlin_runtime::ConstantKind;

    #[test]
    fn test_phi_cycle_hash_terminates() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 1, 0, Span::default());
        let root = graph.function(f).root;
        let nil = graph.add_instruction(root, HirOpcode::Nil, &[], None).unwrap();
        graph.block_mut(root).env.set(0, nil);
        let header = graph.create_block(f, 1);
        graph.block_mut(header).loop_header = true;
        graph.goto(root, header).unwrap();
        let phi = graph.create_phi(header, 0);
        graph.add_phi_input(phi, nil).unwrap();
        let one = graph.root.intern(ConstantKind::Number, "1");
        let one = graph.add_instruction(header, HirOpcode::Literal(one), &[], None).unwrap();
        let next = graph
            .add_instruction(header, HirOpcode::BinOp(BinOpKind::Add), &[phi, one], None)
            .unwrap();
        graph.block_mut(header).env.set(0, next);
        graph.goto(header, header).unwrap();
        assert_eq!(graph.instr(phi).args.as_slice(), &[nil, next]);

        let mut gvn = GlobalValueNumbering::new(4);
        gvn.epoch = 1;
        let first = gvn.hash(&mut graph, next);
        assert_eq!(gvn.hash(&mut graph, next), first);
    }

    #[test]
    fn test_side_effects_are_never_merged() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 0, Span::default());
        let root = graph.function(f).root;
        let a = graph.add_instruction(root, HirOpcode::AllocateObject { size: 64 }, &[], None).unwrap();
        let b = graph.add_instruction(root, HirOpcode::AllocateObject { size: 64 }, &[], None).unwrap();
        let nil = graph.add_instruction(root, HirOpcode::Nil, &[], None).unwrap();
        graph.ret(root, nil).unwrap();

        let mut gvn = GlobalValueNumbering::new(4);
        assert!(!gvn.run(&mut graph, f).unwrap());
        assert!(!graph.instr(a).removed);
        assert!(!graph.instr(b).removed);
    }

    #[test]
    fn test_loop_carried_values_merge_by_identity() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 2, 0, Span::default());
        let root = graph.function(f).root;
        let nil = graph.add_instruction(root, HirOpcode::Nil, &[], None).unwrap();
        graph.block_mut(root).env.set(0, nil);
        graph.block_mut(root).env.set(1, nil);
        let header = graph.create_block(f, 1);
        graph.block_mut(header).loop_header = true;
        graph.goto(root, header).unwrap();
        let first = graph.create_phi(header, 0);
        graph.add_phi_input(first, nil).unwrap();
        let second = graph.create_phi(header, 1);
        graph.add_phi_input(second, nil).unwrap();

        let one = graph.root.intern(ConstantKind::Number, "1");
        let one = graph.add_instruction(header, HirOpcode::Literal(one), &[], None).unwrap();
        let add = HirOpcode::BinOp(BinOpKind::Add);
        let x = graph.add_instruction(header, add, &[first, one], None).unwrap();
        let y = graph.add_instruction(header, add, &[second, one], None).unwrap();
        let again = graph.add_instruction(header, add, &[first, one], None).unwrap();
        graph.block_mut(header).env.set(0, x);
        graph.block_mut(header).env.set(1, y);
        graph.goto(header, header).unwrap();

        let mut gvn = GlobalValueNumbering::new(4);
        assert!(gvn.run(&mut graph, f).unwrap());
        assert_eq!(gvn.merged(), 1);
        assert!(graph.instr(again).removed);
        // Same shape, different phi: the two cycles stay apart.
        assert!(!graph.instr(x).removed);
        assert!(!graph.instr(y).removed);
        assert_eq!(graph.instr(first).args.as_slice(), &[nil, x]);
        assert_eq!(graph.instr(second).args.as_slice(), &[nil, y]);
    }
}

