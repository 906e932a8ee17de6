//! # Representation Inference
//!
//! Forward propagation over the [`Representation`] lattice. Every value
//! starts at `HOLE`; sweeps in reverse postorder recompute each instruction
//! from its arguments until nothing moves. Whatever is still a hole after
//! the last sweep (values only reachable through phi cycles) settles on
//! `UNKNOWN`. If the sweep budget runs out first, values still moving and
//! their consumers are widened to `ANY`.

use marlin_ast::BinOpKind;
use marlin_runtime::ConstantKind;

use crate::hir::{FunctionId, HirGraph, HirOpcode, InstrId, Representation};
use crate::optimization::OptimizationPass;
use crate::CompilerResult;

pub struct RepresentationInference {
    max_iterations: usize,
}

impl RepresentationInference {
    pub fn new(max_iterations: usize) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
        }
    }
}

/// Representation of `id` given the current representations of its
/// arguments.
pub fn infer(graph: &HirGraph, id: InstrId) -> Representation {
    let instr = graph.instr(id);
    let arg = |index: usize| {
        instr
            .args
            .get(index)
            .map_or(Representation::UNKNOWN, |a| graph.instr(*a).representation)
    };

    match instr.opcode {
        HirOpcode::Phi => {
            let mut result = Representation::ANY;
            let mut seen = false;
            for input in &instr.args {
                let repr = graph.instr(*input).representation;
                if repr.is_hole() {
                    continue;
                }
                result = result & repr;
                seen = true;
            }
            if seen {
                result
            } else {
                Representation::HOLE
            }
        }
        HirOpcode::Literal(slot) => match slot.kind {
            ConstantKind::Number if slot.is_immediate() => Representation::SMI,
            ConstantKind::Number => Representation::HEAP_NUMBER,
            ConstantKind::String | ConstantKind::Property => Representation::STRING,
            ConstantKind::True | ConstantKind::False => Representation::BOOLEAN,
        },
        HirOpcode::Nil => Representation::NIL,
        HirOpcode::BinOp(op) => {
            let (lhs, rhs) = (arg(0), arg(1));
            if lhs.is_hole() || rhs.is_hole() {
                return Representation::HOLE;
            }
            binary(op, lhs, rhs)
        }
        HirOpcode::StoreContext(_) => arg(0),
        HirOpcode::StoreProperty => arg(2),
        HirOpcode::Function { .. } => Representation::FUNCTION,
        HirOpcode::AllocateObject { .. } | HirOpcode::Clone => Representation::OBJECT,
        HirOpcode::AllocateArray { .. } | HirOpcode::LoadVarArg | HirOpcode::Keysof => Representation::ARRAY,
        HirOpcode::Sizeof => Representation::SMI,
        HirOpcode::Typeof => Representation::STRING,
        HirOpcode::Not => Representation::BOOLEAN,
        HirOpcode::Entry { .. }
        | HirOpcode::Return
        | HirOpcode::Goto
        | HirOpcode::If
        | HirOpcode::LoadContext(_)
        | HirOpcode::LoadProperty
        | HirOpcode::DeleteProperty
        | HirOpcode::LoadArg
        | HirOpcode::StoreArg
        | HirOpcode::StoreVarArg
        | HirOpcode::AlignStack
        | HirOpcode::Call
        | HirOpcode::CollectGarbage
        | HirOpcode::GetStackTrace => Representation::UNKNOWN,
    }
}

fn binary(op: BinOpKind, lhs: Representation, rhs: Representation) -> Representation {
    if op.is_binary() {
        Representation::SMI
    } else if op.is_logic() {
        Representation::BOOLEAN
    } else if op == BinOpKind::Add {
        // `+` concatenates as soon as either side may be a string.
        if (lhs | rhs).intersects(Representation::STRING) {
            Representation::STRING
        } else {
            lhs & rhs & (Representation::SMI | Representation::HEAP_NUMBER | Representation::NIL)
        }
    } else if op.is_math() {
        Representation::NUMBER
    } else {
        Representation::UNKNOWN
    }
}

/// Set `unsettled` and everything computed from them to `ANY`, so no
/// consumer keeps a fact derived from a value that was still moving.
fn widen(graph: &mut HirGraph, unsettled: Vec<InstrId>) {
    let mut worklist = unsettled;
    while let Some(id) = worklist.pop() {
        if graph.instr(id).representation == Representation::ANY {
            continue;
        }
        graph.instr_mut(id).representation = Representation::ANY;
        worklist.extend(graph.instr(id).uses.iter().copied());
    }
}

impl OptimizationPass for RepresentationInference {
    fn name(&self) -> &'static str {
        "REPR"
    }

    fn run(&mut self, graph: &mut HirGraph, function: FunctionId) -> CompilerResult<bool> {
        let blocks = graph.function(function).blocks.clone();
        let values: Vec<InstrId> = blocks.iter().flat_map(|b| graph.block_values(*b)).collect();

        let previous: Vec<Representation> = values.iter().map(|v| graph.instr(*v).representation).collect();
        for value in &values {
            graph.instr_mut(*value).representation = Representation::HOLE;
        }

        let mut sweeps = 0;
        let unsettled = loop {
            sweeps += 1;
            let mut moved = Vec::new();
            for value in &values {
                let repr = infer(graph, *value);
                if graph.instr(*value).representation != repr {
                    graph.instr_mut(*value).representation = repr;
                    moved.push(*value);
                }
            }
            if moved.is_empty() || sweeps >= self.max_iterations {
                break moved;
            }
        };
        if !unsettled.is_empty() {
            log::warn!(
                "[REPR] {}: no fixed point after {} sweeps, widening {} values",
                function,
                sweeps,
                unsettled.len()
            );
            widen(graph, unsettled);
        }

        let mut changed = false;
        for (value, before) in values.iter().zip(previous) {
            let instr = graph.instr_mut(*value);
            if instr.representation.is_hole() {
                instr.representation = Representation::UNKNOWN;
            }
            changed |= instr.representation != before;
        }
        log::debug!("[REPR] {}: {} values after {} sweeps", function, values.len(), sweeps);
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gvn::GlobalValueNumbering;
    use marlin_ast::Span;

    fn literal(graph: &mut HirGraph, block: crate::hir::BlockId, kind: ConstantKind, text: &str) -> InstrId {
        let slot = graph.root.intern(kind, text);
        graph.add_instruction(block, HirOpcode::Literal(slot), &[], None).unwrap()
    }

    #[test]
    fn test_add_rules() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 0, Span::default());
        let root = graph.function(f).root;
        let one = literal(&mut graph, root, ConstantKind::Number, "1");
        let two = literal(&mut graph, root, ConstantKind::Number, "2");
        let text = literal(&mut graph, root, ConstantKind::String, "x");
        let half = literal(&mut graph, root, ConstantKind::Number, "0.5");
        let smi_sum = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[one, two], None).unwrap();
        let concat = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[one, text], None).unwrap();
        let mixed = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[one, half], None).unwrap();
        let product = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Mul), &[one, two], None).unwrap();
        let less = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Lt), &[one, two], None).unwrap();
        graph.ret(root, smi_sum).unwrap();

        let mut pass = RepresentationInference::new(8);
        assert!(pass.run(&mut graph, f).unwrap());
        assert_eq!(graph.instr(smi_sum).representation, Representation::SMI);
        assert_eq!(graph.instr(concat).representation, Representation::STRING);
        assert_eq!(graph.instr(mixed).representation, Representation::UNKNOWN);
        assert_eq!(graph.instr(product).representation, Representation::NUMBER);
        assert_eq!(graph.instr(less).representation, Representation::BOOLEAN);
        assert!(!pass.run(&mut graph, f).unwrap());
    }

    #[test]
    fn test_store_reports_stored_value() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 1, Span::default());
        let root = graph.function(f).root;
        let text = literal(&mut graph, root, ConstantKind::String, "s");
        let store = graph
            .add_instruction(root, HirOpcode::StoreContext(marlin_ast::ScopeSlot::context(0)), &[text], None)
            .unwrap();
        graph.ret(root, store).unwrap();
        RepresentationInference::new(4).run(&mut graph, f).unwrap();
        assert_eq!(graph.instr(store).representation, Representation::STRING);
    }

    #[test]
    fn test_argument_swap_recomputes_consumer() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 0, 0, Span::default());
        let root = graph.function(f).root;
        let one = literal(&mut graph, root, ConstantKind::Number, "1");
        let two = literal(&mut graph, root, ConstantKind::Number, "2");
        let text = literal(&mut graph, root, ConstantKind::String, "x");
        let sum = graph.add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[one, two], None).unwrap();
        graph.ret(root, sum).unwrap();

        let mut pass = RepresentationInference::new(8);
        pass.run(&mut graph, f).unwrap();
        assert_eq!(graph.instr(sum).representation, Representation::SMI);

        graph.replace_all_uses(two, text);
        assert!(graph.instr(sum).representation.is_hole());
        assert!(pass.run(&mut graph, f).unwrap());
        assert_eq!(graph.instr(sum).representation, Representation::STRING);
    }

    #[test]
    fn test_gvn_merge_then_inference_settles() {
        let mut graph = HirGraph::new();
        let f = graph.create_function(0, false, 1, 0, Span::default());
        let root = graph.function(f).root;
        let one = literal(&mut graph, root, ConstantKind::Number, "1");
        let two = literal(&mut graph, root, ConstantKind::Number, "2");
        let cond = graph.add_instruction(root, HirOpcode::Nil, &[], None).unwrap();
        let kind = graph.add_instruction(root, HirOpcode::Typeof, &[one], None).unwrap();
        let duplicate = graph.add_instruction(root, HirOpcode::Typeof, &[one], None).unwrap();
        let concat = graph
            .add_instruction(root, HirOpcode::BinOp(BinOpKind::Add), &[two, duplicate], None)
            .unwrap();

        let left = graph.create_block(f, 0);
        let right = graph.create_block(f, 0);
        let join = graph.create_block(f, 0);
        graph.branch(root, cond, left, right).unwrap();
        let sum = graph.add_instruction(left, HirOpcode::BinOp(BinOpKind::Add), &[one, two], None).unwrap();
        graph.goto(left, join).unwrap();
        graph.goto(right, join).unwrap();
        let phi = graph.create_phi(join, 0);
        graph.add_phi_input(phi, sum).unwrap();
        graph.add_phi_input(phi, concat).unwrap();
        graph.ret(join, phi).unwrap();
        crate::dominance::compute_dominators(&mut graph, f).unwrap();

        let mut repr = RepresentationInference::new(16);
        repr.run(&mut graph, f).unwrap();

        let mut gvn = GlobalValueNumbering::new(8);
        assert!(gvn.run(&mut graph, f).unwrap());
        assert_eq!(graph.instr(concat).args[1], kind);
        assert!(graph.instr(concat).representation.is_hole());

        repr.run(&mut graph, f).unwrap();
        assert_eq!(graph.instr(concat).representation, Representation::STRING);
        assert_eq!(graph.instr(sum).representation, Representation::SMI);

        // A phi never holds a kind none of its inputs produce.
        let inputs = graph.instr(sum).representation | graph.instr(concat).representation;
        let merged = graph.instr(phi).representation;
        assert_eq!(merged & inputs, merged);

        let values: Vec<InstrId> = graph
            .function(f)
            .blocks
            .iter()
            .flat_map(|b| graph.block_values(*b))
            .collect();
        let settled: Vec<Representation> = values.iter().map(|v| graph.instr(*v).representation).collect();
        assert!(!repr.run(&mut graph, f).unwrap());
        let again: Vec<Representation> = values.iter().map(|v| graph.instr(*v).representation).collect();
        assert_eq!(settled, again);
    }

    #[test]
    fn test_exhausted_budget_widens_to_any() {
        let build = || {
            let mut graph = HirGraph::new();
            let f = graph.create_function(0, false, 0, 0, Span::default());
            let root = graph.function(f).root;
            let one = literal(&mut graph, root, ConstantKind::Number, "1");
            let not = graph.add_instruction(root, HirOpcode::Not, &[one], None).unwrap();
            graph.ret(root, not).unwrap();
            (graph, f, not)
        };

        let (mut graph, f, not) = build();
        RepresentationInference::new(1).run(&mut graph, f).unwrap();
        assert_eq!(graph.instr(not).representation, Representation::ANY);

        let (mut graph, f, not) = build();
        RepresentationInference::new(4).run(&mut graph, f).unwrap();
        assert_eq!(graph.instr(not).representation, Representation::BOOLEAN);
    }
}
