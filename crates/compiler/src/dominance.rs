//! # Dominator Analysis
//!
//! Lengauer–Tarjan over one function's CFG:
//!
//! 1. iterative depth-first numbering of reachable blocks (`dfs_id` in
//!    discovery order); the function's block list becomes reverse postorder
//!    and unreachable blocks are dropped
//! 2. semidominators in reverse discovery order, using the `ancestor`/`label`
//!    forest with path compression ([`compress`] / [`evaluate`])
//! 3. immediate dominators, filling each dominator's `dominates` list
//!
//! `depth` is memoized lazily through [`dominator_depth`].

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use crate::hir::{BlockId, FunctionId, HirGraph};
use crate::CompilerResult;

pub fn compute_dominators(graph: &mut HirGraph, function: FunctionId) -> CompilerResult<()> {
    graph.verify_termination(function)?;

    let blocks = graph.function(function).blocks.clone();
    for block in &blocks {
        let b = graph.block_mut(*block);
        b.dfs_id = None;
        b.dom.reset(*block);
    }

    let root = graph.function(function).root;
    let (vertex, postorder) = number_blocks(graph, root);
    prune_unreachable(graph, function, &blocks, postorder);

    let mut bucket: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
    for &w in vertex.iter().skip(1).rev() {
        let preds = graph.block(w).predecessors.clone();
        for v in preds {
            if graph.block(v).dfs_id.is_none() {
                continue;
            }
            let u = evaluate(graph, v);
            let semi_u = graph.block(u).dom.semi;
            if semi_u < graph.block(w).dom.semi {
                graph.block_mut(w).dom.semi = semi_u;
            }
        }
        let semi = vertex[graph.block(w).dom.semi as usize];
        bucket.entry(semi).or_default().push(w);

        let Some(parent) = graph.block(w).dom.parent else {
            continue;
        };
        graph.block_mut(w).dom.ancestor = Some(parent);

        for v in bucket.remove(&parent).unwrap_or_default() {
            let u = evaluate(graph, v);
            let idom = if graph.block(u).dom.semi < graph.block(v).dom.semi { u } else { parent };
            graph.block_mut(v).dom.dominator = Some(idom);
        }
    }

    for &w in vertex.iter().skip(1) {
        let semi = vertex[graph.block(w).dom.semi as usize];
        let Some(mut idom) = graph.block(w).dom.dominator else {
            continue;
        };
        if idom != semi {
            if let Some(next) = graph.block(idom).dom.dominator {
                idom = next;
            }
            graph.block_mut(w).dom.dominator = Some(idom);
        }
        graph.block_mut(idom).dom.dominates.push(w);
    }

    graph.block_mut(root).dom.depth = 0;
    for block in graph.function(function).blocks.clone() {
        dominator_depth(graph, block);
    }
    log::debug!("[DOM] {}: {} reachable blocks", function, vertex.len());
    Ok(())
}

/// Depth-first numbering without recursion. Returns blocks by `dfs_id` and
/// the postorder.
fn number_blocks(graph: &mut HirGraph, root: BlockId) -> (Vec<BlockId>, Vec<BlockId>) {
    fn discover(graph: &mut HirGraph, block: BlockId, parent: Option<BlockId>, vertex: &mut Vec<BlockId>) {
        let id = vertex.len() as u32;
        let b = graph.block_mut(block);
        b.dfs_id = Some(id);
        b.dom.semi = id;
        b.dom.label = block;
        b.dom.parent = parent;
        vertex.push(block);
    }

    let mut vertex = Vec::new();
    let mut postorder = Vec::new();
    let mut stack: Vec<(BlockId, usize)> = vec![(root, 0)];
    discover(graph, root, None, &mut vertex);

    while let Some((block, next)) = stack.last().copied() {
        match graph.block(block).successors.get(next).copied() {
            Some(succ) => {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                if graph.block(succ).dfs_id.is_none() {
                    discover(graph, succ, Some(block), &mut vertex);
                    stack.push((succ, 0));
                }
            }
            None => {
                postorder.push(block);
                stack.pop();
            }
        }
    }
    (vertex, postorder)
}

/// Reorder the function's blocks to reverse postorder and detach whatever
/// the walk never reached.
fn prune_unreachable(graph: &mut HirGraph, function: FunctionId, blocks: &[BlockId], postorder: Vec<BlockId>) {
    for block in blocks {
        if graph.block(*block).dfs_id.is_some() {
            continue;
        }
        log::trace!("[DOM] dropping unreachable {}", block);
        let values: Vec<_> = graph.block_values(*block).collect();
        for id in values {
            graph.remove_instruction(id);
        }
    }
    graph.function_mut(function).blocks = postorder.into_iter().rev().collect();
}

/// Path compression on the `ancestor` forest, keeping in `label` the block
/// with the smallest semidominator along the compressed path.
///
/// The path is collected first and then compressed from its top down, so
/// long ancestor chains need no recursion.
pub fn compress(graph: &mut HirGraph, block: BlockId) {
    let mut path = Vec::new();
    let mut current = block;
    while let Some(ancestor) = graph.block(current).dom.ancestor {
        if graph.block(ancestor).dom.ancestor.is_none() {
            break;
        }
        path.push(current);
        current = ancestor;
    }

    for block in path.into_iter().rev() {
        let Some(ancestor) = graph.block(block).dom.ancestor else {
            continue;
        };
        let ancestor_label = graph.block(ancestor).dom.label;
        let label = graph.block(block).dom.label;
        if graph.block(ancestor_label).dom.semi < graph.block(label).dom.semi {
            graph.block_mut(block).dom.label = ancestor_label;
        }
        let next = graph.block(ancestor).dom.ancestor;
        graph.block_mut(block).dom.ancestor = next;
    }
}

pub fn evaluate(graph: &mut HirGraph, block: BlockId) -> BlockId {
    if graph.block(block).dom.ancestor.is_none() {
        return block;
    }
    compress(graph, block);
    graph.block(block).dom.label
}

/// `dominator_depth(B) = dominator_depth(idom(B)) + 1`, memoized.
pub fn dominator_depth(graph: &mut HirGraph, block: BlockId) -> i32 {
    let mut chain = Vec::new();
    let mut current = block;
    let mut depth = loop {
        let dom = &graph.block(current).dom;
        if dom.depth >= 0 {
            break dom.depth;
        }
        match dom.dominator {
            Some(idom) => {
                chain.push(current);
                current = idom;
            }
            None => break 0,
        }
    };
    for b in chain.into_iter().rev() {
        depth += 1;
        graph.block_mut(b).dom.depth = depth;
    }
    graph.block(block).dom.depth.max(0)
}

/// Whether `a` dominates `b` (reflexive).
pub fn dominates(graph: &HirGraph, a: BlockId, b: BlockId) -> bool {
    let mut current = Some(b);
    while let Some(block) = current {
        if block == a {
            return true;
        }
        current = graph.block(block).dom.dominator;
    }
    false
}

/// `function`'s reachable CFG as a petgraph graph, for dot output and for
/// cross-checking against petgraph's own dominator algorithm.
pub fn cfg_graph(graph: &HirGraph, function: FunctionId) -> (DiGraph<BlockId, ()>, FxHashMap<BlockId, NodeIndex>) {
    let mut cfg = DiGraph::new();
    let mut nodes = FxHashMap::default();
    let blocks = &graph.function(function).blocks;
    for block in blocks {
        nodes.insert(*block, cfg.add_node(*block));
    }
    for block in blocks {
        for succ in &graph.block(*block).successors {
            if let (Some(from), Some(to)) = (nodes.get(block), nodes.get(succ)) {
                cfg.add_edge(*from, *to, ());
            }
        }
    }
    (cfg, nodes)
}
