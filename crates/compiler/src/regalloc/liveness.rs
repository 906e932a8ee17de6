//! Live intervals from block-level liveness.
//!
//! Block live sets come from the usual backward dataflow, iterated to a
//! fixed point so loop-carried values stay live around the back edge. Ranges
//! are then built one block at a time, walking instructions backwards: live
//! out values cover the whole block, a definition trims its value's first
//! range and a use extends it back to the block start.

use std::collections::BTreeSet;

use crate::lir::{IntervalId, LirFunction, UseKind};

#[derive(Debug, Default, Clone)]
struct BlockLiveness {
    gen: BTreeSet<IntervalId>,
    kill: BTreeSet<IntervalId>,
    live_in: BTreeSet<IntervalId>,
    live_out: BTreeSet<IntervalId>,
}

fn local_sets(function: &LirFunction) -> Vec<BlockLiveness> {
    function
        .blocks
        .iter()
        .map(|block| {
            let mut sets = BlockLiveness::default();
            sets.kill.extend(block.phis.iter().copied());
            for index in &block.instructions {
                let instr = &function.instructions[*index];
                for input in &instr.inputs {
                    if !sets.kill.contains(&input.interval) {
                        sets.gen.insert(input.interval);
                    }
                }
                if let Some(result) = instr.result {
                    sets.kill.insert(result.interval);
                }
            }
            // Phi inputs are read at the end of the predecessor.
            for (source, _) in &block.gap_moves {
                if !sets.kill.contains(source) {
                    sets.gen.insert(*source);
                }
            }
            sets
        })
        .collect()
}

fn solve(function: &LirFunction) -> Vec<BlockLiveness> {
    let mut sets = local_sets(function);
    let mut changed = true;
    let mut rounds = 0;
    while changed {
        changed = false;
        rounds += 1;
        for index in (0..function.blocks.len()).rev() {
            let block = &function.blocks[index];
            let mut live_out: BTreeSet<IntervalId> = block.gap_moves.iter().map(|(source, _)| *source).collect();
            for successor in &block.successors {
                live_out.extend(sets[*successor].live_in.iter().copied());
            }
            let mut live_in = sets[index].gen.clone();
            live_in.extend(live_out.difference(&sets[index].kill).copied());

            let entry = &mut sets[index];
            if live_in != entry.live_in || live_out != entry.live_out {
                entry.live_in = live_in;
                entry.live_out = live_out;
                changed = true;
            }
        }
    }
    log::trace!("[REGALLOC] {}: liveness settled after {} rounds", function.hir, rounds);
    sets
}

/// Fill in ranges and use positions of every interval of `function`.
pub fn build_intervals(function: &mut LirFunction) {
    for interval in &mut function.intervals {
        interval.ranges.clear();
        interval.uses.clear();
    }
    let sets = solve(function);

    for index in (0..function.blocks.len()).rev() {
        let (start, end) = (function.blocks[index].start, function.blocks[index].end);
        let mut live = sets[index].live_out.clone();
        for value in &live {
            function.interval_mut(*value).add_range(start, end);
        }
        // Gap moves write the phis just before the block is left.
        let gap_moves = function.blocks[index].gap_moves.clone();
        for (_, phi) in gap_moves {
            function.interval_mut(phi).add_range(end.saturating_sub(1), end);
        }

        let instructions = function.blocks[index].instructions.clone();
        for instr_index in instructions.into_iter().rev() {
            let instr = function.instructions[instr_index].clone();
            let position = instr.position;

            if let Some(result) = instr.result {
                let interval = function.interval_mut(result.interval);
                if live.remove(&result.interval) {
                    interval.set_from(position + 1);
                } else {
                    interval.add_range(position + 1, position + 2);
                }
                interval.add_use(position + 1, result.kind);
            }
            for temp in &instr.temps {
                let interval = function.interval_mut(*temp);
                interval.add_range(position, position + 1);
                interval.add_use(position, UseKind::Register);
            }
            for input in &instr.inputs {
                let interval = function.interval_mut(input.interval);
                interval.add_range(start, position + 1);
                interval.add_use(position, input.kind);
                live.insert(input.interval);
            }
        }

        let phis = function.blocks[index].phis.clone();
        for phi in phis {
            if !live.remove(&phi) {
                function.interval_mut(phi).add_range(start, start + 1);
            }
        }
    }

    for interval in &mut function.intervals {
        interval.uses.sort_by_key(|u| u.position);
    }
}
