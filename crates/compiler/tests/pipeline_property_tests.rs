// Property-based tests for the compilation pipeline
//
// Random structured programs (assignments, branches, counted loops) are
// built through the AST builder, compiled, and checked against properties of
// the intermediate graphs and against a direct evaluation of the program.

use marlin_ast::{AstBuilder, BinOpKind, FunctionBuilder, FunctionLiteral, Node, ScopeSlot};
use marlin_compiler::dominance::{cfg_graph, dominator_depth};
use marlin_compiler::gvn::GlobalValueNumbering;
use marlin_compiler::{
    CompilationConfig, Compiler, FunctionId, HirGraph, Location, OptLevel, OptimizationPass, Target,
};
use marlin_runtime::{Machine, Value};
use petgraph::algo::dominators;
use proptest::prelude::*;

/// Data variables; loop counters live in the slots after them.
const VARS: usize = 3;
const MAX_LOOP_DEPTH: usize = 3;

#[derive(Debug, Clone)]
enum Stmt {
    /// `vars[target] = vars[source] +/- delta`
    Assign {
        target: usize,
        source: usize,
        delta: i64,
        subtract: bool,
    },
    /// `if (vars[lhs] < vars[rhs]) { .. } else { .. }`
    If {
        lhs: usize,
        rhs: usize,
        then_branch: Vec<Stmt>,
        else_branch: Vec<Stmt>,
    },
    /// Runs its body `times` times through a dedicated counter slot.
    Repeat { times: i64, body: Vec<Stmt> },
}

fn stmt_strategy() -> impl Strategy<Value = Stmt> {
    let leaf = (0..VARS, 0..VARS, 0i64..6, any::<bool>()).prop_map(|(target, source, delta, subtract)| {
        Stmt::Assign {
            target,
            source,
            delta,
            subtract,
        }
    });
    leaf.prop_recursive(MAX_LOOP_DEPTH as u32, 24, 4, |inner| {
        prop_oneof![
            (
                0..VARS,
                0..VARS,
                prop::collection::vec(inner.clone(), 0..3),
                prop::collection::vec(inner.clone(), 0..3),
            )
                .prop_map(|(lhs, rhs, then_branch, else_branch)| Stmt::If {
                    lhs,
                    rhs,
                    then_branch,
                    else_branch,
                }),
            (0i64..4, prop::collection::vec(inner, 1..3)).prop_map(|(times, body)| Stmt::Repeat { times, body }),
        ]
    })
}

fn program_strategy() -> impl Strategy<Value = (Vec<Stmt>, usize)> {
    (prop::collection::vec(stmt_strategy(), 1..6), 0..VARS)
}

fn evaluate(statements: &[Stmt], vars: &mut [i64]) {
    for statement in statements {
        match statement {
            Stmt::Assign {
                target,
                source,
                delta,
                subtract,
            } => {
                vars[*target] = if *subtract {
                    vars[*source] - delta
                } else {
                    vars[*source] + delta
                };
            }
            Stmt::If {
                lhs,
                rhs,
                then_branch,
                else_branch,
            } => {
                if vars[*lhs] < vars[*rhs] {
                    evaluate(then_branch, vars);
                } else {
                    evaluate(else_branch, vars);
                }
            }
            Stmt::Repeat { times, body } => {
                for _ in 0..*times {
                    evaluate(body, vars);
                }
            }
        }
    }
}

fn expected_result(statements: &[Stmt], result: usize) -> i64 {
    let mut vars: Vec<i64> = (0..VARS as i64).collect();
    evaluate(statements, &mut vars);
    vars[result]
}

struct Lowering<'a> {
    ast: &'a mut AstBuilder,
    slots: &'a [ScopeSlot],
}

impl Lowering<'_> {
    fn statements(&mut self, statements: &[Stmt], depth: usize) -> Vec<Node> {
        statements.iter().flat_map(|s| self.statement(s, depth)).collect()
    }

    fn statement(&mut self, statement: &Stmt, depth: usize) -> Vec<Node> {
        match statement {
            Stmt::Assign {
                target,
                source,
                delta,
                subtract,
            } => {
                let value = self.ast.var(self.slots[*source]);
                let delta = self.ast.int(*delta);
                let op = if *subtract { BinOpKind::Sub } else { BinOpKind::Add };
                let value = self.ast.binary(op, value, delta);
                vec![self.ast.set(self.slots[*target], value)]
            }
            Stmt::If {
                lhs,
                rhs,
                then_branch,
                else_branch,
            } => {
                let lhs = self.ast.var(self.slots[*lhs]);
                let rhs = self.ast.var(self.slots[*rhs]);
                let condition = self.ast.binary(BinOpKind::Lt, lhs, rhs);
                let then_branch = self.statements(then_branch, depth);
                let else_branch = self.statements(else_branch, depth);
                vec![self.ast.if_else(condition, then_branch, else_branch)]
            }
            Stmt::Repeat { times, body } => {
                let counter = self.slots[VARS + depth];
                let zero = self.ast.int(0);
                let init = self.ast.set(counter, zero);
                let current = self.ast.var(counter);
                let limit = self.ast.int(*times);
                let condition = self.ast.binary(BinOpKind::Lt, current, limit);
                let mut body = self.statements(body, depth + 1);
                let current = self.ast.var(counter);
                let one = self.ast.int(1);
                let next = self.ast.add(current, one);
                body.push(self.ast.set(counter, next));
                let repeat = self.ast.while_loop(condition, body);
                vec![init, repeat]
            }
        }
    }
}

fn build_program(statements: &[Stmt], result: usize) -> FunctionLiteral {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let slots: Vec<ScopeSlot> = (0..VARS + MAX_LOOP_DEPTH + 1).map(|_| f.stack_slot()).collect();

    let mut body = Vec::new();
    for (index, slot) in slots.iter().take(VARS).enumerate() {
        let value = ast.int(index as i64);
        body.push(ast.set(*slot, value));
    }
    let mut lowering = Lowering {
        ast: &mut ast,
        slots: &slots,
    };
    body.extend(lowering.statements(statements, 0));
    let value = ast.var(slots[result]);
    body.push(ast.ret(value));
    f.build(body)
}

fn compiler(target: Target, level: OptLevel) -> Compiler {
    Compiler::new(CompilationConfig::for_target(target).with_opt_level(level))
}

fn check_dominators(graph: &mut HirGraph, function: FunctionId) -> Result<(), TestCaseError> {
    let root = graph.function(function).root;
    let (cfg, nodes) = cfg_graph(graph, function);
    let oracle = dominators::simple_fast(&cfg, nodes[&root]);
    let blocks = graph.function(function).blocks.clone();

    for block in blocks {
        let expected = oracle.immediate_dominator(nodes[&block]).map(|n| cfg[n]);
        prop_assert_eq!(graph.block(block).dom.dominator, expected);

        // Following dominators reaches the root within the block count.
        let mut current = block;
        let mut steps = 0;
        while let Some(idom) = graph.block(current).dom.dominator {
            current = idom;
            steps += 1;
            prop_assert!(steps <= graph.function(function).blocks.len());
        }
        prop_assert_eq!(current, root);

        if let Some(idom) = expected {
            let depth = dominator_depth(graph, block);
            prop_assert_eq!(depth, dominator_depth(graph, idom) + 1);
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn dominators_match_petgraph((statements, result) in program_strategy()) {
        let literal = build_program(&statements, result);
        let mut graph = compiler(Target::X64, OptLevel::Default).build_hir(&literal).unwrap();
        for block in &graph.function(FunctionId(0)).blocks {
            let b = graph.block(*block);
            prop_assert!(b.ended);
            prop_assert!(graph.terminator(*block).is_some());
        }
        check_dominators(&mut graph, FunctionId(0))?;
    }

    #[test]
    fn gvn_is_idempotent((statements, result) in program_strategy()) {
        let literal = build_program(&statements, result);
        let mut graph = compiler(Target::X64, OptLevel::Default).build_hir(&literal).unwrap();
        let mut gvn = GlobalValueNumbering::new(64);
        while gvn.run(&mut graph, FunctionId(0)).unwrap() {}
        prop_assert!(!gvn.run(&mut graph, FunctionId(0)).unwrap());
        prop_assert_eq!(gvn.merged(), 0);
    }

    #[test]
    fn values_across_calls_avoid_caller_saved_registers((statements, result) in program_strategy()) {
        let literal = build_program(&statements, result);
        for target in [Target::X64, Target::Ia32] {
            let compiler = compiler(target, OptLevel::Default);
            let mut graph = compiler.build_hir(&literal).unwrap();
            compiler.optimize(&mut graph).unwrap();
            let mut program = compiler.lower(&graph).unwrap();
            compiler.allocate(&mut program).unwrap();

            let registers = target.registers();
            for function in &program.functions {
                for call in function.call_sites() {
                    for interval in &function.intervals {
                        if interval.is_fixed() || !interval.crosses(call.position) {
                            continue;
                        }
                        match interval.location {
                            Some(Location::Register(reg)) => {
                                prop_assert!(!call.clobbers_all());
                                prop_assert!(!registers.is_caller_saved(reg), "{} kept in {}", interval, registers.name(reg));
                            }
                            Some(Location::Stack(_)) => {}
                            None => prop_assert!(false, "{} has no location", interval),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn every_target_and_level_agrees_with_evaluation((statements, result) in program_strategy()) {
        let literal = build_program(&statements, result);
        let expected = Value::Smi(expected_result(&statements, result));
        for target in [Target::X64, Target::Ia32] {
            for level in [OptLevel::None, OptLevel::Less, OptLevel::Default] {
                let module = compiler(target, level).compile(&literal).unwrap();
                let mut machine = Machine::new(&module).unwrap();
                let word = machine.run(&[]).unwrap();
                prop_assert_eq!(machine.describe(word).unwrap(), expected.clone(), "{:?} at {:?}", target, level);
            }
        }
    }
}
