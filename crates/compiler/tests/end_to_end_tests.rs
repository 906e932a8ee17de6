//! End-to-End Execution Tests
//!
//! Every program is compiled for both targets at every optimization level and
//! run on the reference machine; all six runs must agree with the expected
//! value. The machine poisons caller-saved registers after each stub call, so
//! a value the allocator left in the wrong register shows up as a wrong
//! result or a runtime error.

use marlin_ast::{AstBuilder, BinOpKind, FunctionBuilder, FunctionLiteral, UnaryOp};
use marlin_compiler::{CompilationConfig, Compiler, OptLevel, Target};
use marlin_runtime::value::tag_smi;
use marlin_runtime::{Machine, Value, Word};

const TARGETS: [Target; 2] = [Target::X64, Target::Ia32];
const LEVELS: [OptLevel; 3] = [OptLevel::None, OptLevel::Less, OptLevel::Default];

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run(target: Target, level: OptLevel, literal: &FunctionLiteral, args: &[i64]) -> (Word, Value) {
    let compiler = Compiler::new(CompilationConfig::for_target(target).with_opt_level(level));
    let module = compiler
        .compile(literal)
        .unwrap_or_else(|e| panic!("{:?} at {:?} failed to compile: {}", target, level, e));
    let mut machine = Machine::new(&module).unwrap();
    let args: Vec<Word> = args.iter().map(|a| tag_smi(*a)).collect();
    let word = machine
        .run(&args)
        .unwrap_or_else(|e| panic!("{:?} at {:?} failed to run: {}", target, level, e));
    let value = machine.describe(word).unwrap();
    (word, value)
}

/// Run on every target and level and check each result.
fn expect(literal: &FunctionLiteral, args: &[i64], expected: Value) {
    init_logger();
    for target in TARGETS {
        for level in LEVELS {
            let (_, value) = run(target, level, literal, args);
            assert_eq!(value, expected, "{:?} at {:?}", target, level);
        }
    }
}

#[test]
fn test_branch_and_phi_returns_two() {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let a = f.stack_slot();
    let one = ast.int(1);
    let init = ast.set(a, one);
    let two = ast.int(2);
    let then_assign = ast.set(a, two);
    let three = ast.int(3);
    let else_assign = ast.set(a, three);
    let condition = ast.var(a);
    let branch = ast.if_else(condition, vec![then_assign], vec![else_assign]);
    let result = ast.var(a);
    let ret = ast.ret(result);
    let literal = f.build(vec![init, branch, ret]);

    init_logger();
    for target in TARGETS {
        let (word, value) = run(target, OptLevel::Default, &literal, &[]);
        assert_eq!(word, tag_smi(2), "{:?}", target);
        assert_eq!(value, Value::Smi(2));
    }
    expect(&literal, &[], Value::Smi(2));
}

#[test]
fn test_arguments_reach_the_body() {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let p = f.param();
    let q = f.param();
    let lhs = ast.var(p);
    let rhs = ast.var(q);
    let sum = ast.add(lhs, rhs);
    let ret = ast.ret(sum);
    let literal = f.build(vec![ret]);

    expect(&literal, &[20, 22], Value::Smi(42));
    expect(&literal, &[-5, 3], Value::Smi(-2));
}

#[test]
fn test_missing_argument_is_nil() {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let _p = f.param();
    let q = f.param();
    let value = ast.var(q);
    let ret = ast.ret(value);
    let literal = f.build(vec![ret]);

    expect(&literal, &[7], Value::Nil);
}

#[test]
fn test_falling_off_the_end_returns_nil() {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let i = f.stack_slot();
    let zero = ast.int(0);
    let init = ast.set(i, zero);
    let current = ast.var(i);
    let one = ast.int(1);
    let next = ast.add(current, one);
    let step = ast.set(i, next);
    let condition = ast.var(i);
    let body = ast.while_loop(condition, vec![step]);
    let literal = f.build(vec![init, body]);

    expect(&literal, &[], Value::Nil);
}

#[test]
fn test_loop_with_break_and_continue() {
    // i = 0; s = 0
    // while (i < 10) { i = i + 1; if (i == 3) continue; if (i == 6) break; s = s + i }
    // return s
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let i = f.stack_slot();
    let s = f.stack_slot();

    let zero = ast.int(0);
    let init_i = ast.set(i, zero);
    let zero = ast.int(0);
    let init_s = ast.set(s, zero);

    let vi = ast.var(i);
    let ten = ast.int(10);
    let condition = ast.binary(BinOpKind::Lt, vi, ten);

    let vi = ast.var(i);
    let one = ast.int(1);
    let next = ast.add(vi, one);
    let step = ast.set(i, next);

    let vi = ast.var(i);
    let three = ast.int(3);
    let is_three = ast.binary(BinOpKind::Eq, vi, three);
    let cont = ast.cont();
    let skip = ast.if_then(is_three, vec![cont]);

    let vi = ast.var(i);
    let six = ast.int(6);
    let is_six = ast.binary(BinOpKind::Eq, vi, six);
    let brk = ast.brk();
    let stop = ast.if_then(is_six, vec![brk]);

    let vs = ast.var(s);
    let vi = ast.var(i);
    let total = ast.add(vs, vi);
    let accumulate = ast.set(s, total);

    let body = ast.while_loop(condition, vec![step, skip, stop, accumulate]);
    let result = ast.var(s);
    let ret = ast.ret(result);
    let literal = f.build(vec![init_i, init_s, body, ret]);

    expect(&literal, &[], Value::Smi(1 + 2 + 4 + 5));
}

#[test]
fn test_nested_loops() {
    // s = 0; i = 0
    // while (i < 4) { j = 0; while (j < 3) { s = s + i + j; j = j + 1 } i = i + 1 }
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let s = f.stack_slot();
    let i = f.stack_slot();
    let j = f.stack_slot();

    let zero = ast.int(0);
    let init_s = ast.set(s, zero);
    let zero = ast.int(0);
    let init_i = ast.set(i, zero);

    let zero = ast.int(0);
    let init_j = ast.set(j, zero);
    let vj = ast.var(j);
    let three = ast.int(3);
    let inner_condition = ast.binary(BinOpKind::Lt, vj, three);
    let vs = ast.var(s);
    let vi = ast.var(i);
    let partial = ast.add(vs, vi);
    let vj = ast.var(j);
    let total = ast.add(partial, vj);
    let accumulate = ast.set(s, total);
    let vj = ast.var(j);
    let one = ast.int(1);
    let next_j = ast.add(vj, one);
    let step_j = ast.set(j, next_j);
    let inner = ast.while_loop(inner_condition, vec![accumulate, step_j]);

    let vi = ast.var(i);
    let one = ast.int(1);
    let next_i = ast.add(vi, one);
    let step_i = ast.set(i, next_i);
    let vi = ast.var(i);
    let four = ast.int(4);
    let outer_condition = ast.binary(BinOpKind::Lt, vi, four);
    let outer = ast.while_loop(outer_condition, vec![init_j, inner, step_i]);

    let result = ast.var(s);
    let ret = ast.ret(result);
    let literal = f.build(vec![init_s, init_i, outer, ret]);

    expect(&literal, &[], Value::Smi(30));
}

#[test]
fn test_closure_reads_enclosing_context() {
    // c = 10; f = function (x) { return x + c }; return f(32)
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let c = outer.context_slot();
    let f = outer.stack_slot();

    let mut inner = FunctionBuilder::new();
    let x = inner.param();
    let vx = ast.var(x);
    let vc = ast.var(c.outer(1));
    let sum = ast.add(vx, vc);
    let inner_ret = ast.ret(sum);
    let inner = inner.build(vec![inner_ret]);

    let ten = ast.int(10);
    let init_c = ast.set(c, ten);
    let closure = ast.function(inner);
    let init_f = ast.set(f, closure);
    let callee = ast.var(f);
    let arg = ast.int(32);
    let call = ast.call(callee, vec![arg]);
    let ret = ast.ret(call);
    let literal = outer.build(vec![init_c, init_f, ret]);

    expect(&literal, &[], Value::Smi(42));
}

#[test]
fn test_closure_updates_shared_counter() {
    // count = 0; bump = function () { count = count + 1; return count }
    // bump(); bump(); return bump()
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let count = outer.context_slot();
    let bump = outer.stack_slot();

    let shared = count.outer(1);
    let current = ast.var(shared);
    let one = ast.int(1);
    let next = ast.add(current, one);
    let store = ast.set(shared, next);
    let read = ast.var(shared);
    let inner_ret = ast.ret(read);
    let inner = FunctionBuilder::new().build(vec![store, inner_ret]);

    let zero = ast.int(0);
    let init = ast.set(count, zero);
    let closure = ast.function(inner);
    let init_bump = ast.set(bump, closure);
    let mut body = vec![init, init_bump];
    for _ in 0..2 {
        let callee = ast.var(bump);
        body.push(ast.call(callee, Vec::new()));
    }
    let callee = ast.var(bump);
    let last = ast.call(callee, Vec::new());
    body.push(ast.ret(last));
    let literal = outer.build(body);

    expect(&literal, &[], Value::Smi(3));
}

#[test]
fn test_recursive_named_function() {
    // function fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2) }
    // return fib(10)
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let fib = outer.context_slot();

    let mut inner = FunctionBuilder::new().named(fib);
    let n = inner.param();
    let self_ref = fib.outer(1);

    let vn = ast.var(n);
    let two = ast.int(2);
    let small = ast.binary(BinOpKind::Lt, vn, two);
    let vn = ast.var(n);
    let early = ast.ret(vn);
    let base = ast.if_then(small, vec![early]);

    let recurse = |ast: &mut AstBuilder, delta: i64| {
        let callee = ast.var(self_ref);
        let vn = ast.var(n);
        let d = ast.int(delta);
        let arg = ast.sub(vn, d);
        ast.call(callee, vec![arg])
    };
    let first = recurse(&mut ast, 1);
    let second = recurse(&mut ast, 2);
    let sum = ast.add(first, second);
    let inner_ret = ast.ret(sum);
    let inner = inner.build(vec![base, inner_ret]);

    let declaration = ast.function(inner);
    let callee = ast.var(fib);
    let ten = ast.int(10);
    let call = ast.call(callee, vec![ten]);
    let ret = ast.ret(call);
    let literal = outer.build(vec![declaration, ret]);

    expect(&literal, &[], Value::Smi(55));
}

#[test]
fn test_values_survive_calls() {
    // id = function (v) { return v }
    // a..f = 1..6; g = id(a); __$gc(); return a + b + c + d + e + f + g
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let id = outer.stack_slot();
    let slots: Vec<_> = (0..6).map(|_| outer.stack_slot()).collect();
    let g = outer.stack_slot();

    let mut inner = FunctionBuilder::new();
    let v = inner.param();
    let vv = ast.var(v);
    let inner_ret = ast.ret(vv);
    let inner = inner.build(vec![inner_ret]);

    let mut body = Vec::new();
    let closure = ast.function(inner);
    body.push(ast.set(id, closure));
    for (index, slot) in slots.iter().enumerate() {
        let value = ast.int(index as i64 + 1);
        body.push(ast.set(*slot, value));
    }
    let callee = ast.var(id);
    let arg = ast.var(slots[0]);
    let call = ast.call(callee, vec![arg]);
    body.push(ast.set(g, call));
    body.push(ast.collect_garbage());

    let mut total = ast.var(g);
    for slot in &slots {
        let value = ast.var(*slot);
        total = ast.add(total, value);
    }
    body.push(ast.ret(total));
    let literal = outer.build(body);

    expect(&literal, &[], Value::Smi(22));
}

#[test]
fn test_object_properties() {
    // o = { x: 40 }; o.y = 2; return o.x + o.y
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let o = f.stack_slot();

    let forty = ast.int(40);
    let object = ast.object(vec![("x", forty)]);
    let init = ast.set(o, object);
    let vo = ast.var(o);
    let target = ast.member(vo, "y");
    let two = ast.int(2);
    let store = ast.assign(target, two);
    let vo = ast.var(o);
    let x = ast.member(vo, "x");
    let vo = ast.var(o);
    let y = ast.member(vo, "y");
    let sum = ast.add(x, y);
    let ret = ast.ret(sum);
    let literal = f.build(vec![init, store, ret]);

    expect(&literal, &[], Value::Smi(42));
}

#[test]
fn test_delete_and_keysof() {
    // o = { a: 1, b: 2, c: 3 }; delete o.b; return sizeof keysof o
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let o = f.stack_slot();

    let entries = vec![("a", ast.int(1)), ("b", ast.int(2)), ("c", ast.int(3))];
    let object = ast.object(entries);
    let init = ast.set(o, object);
    let vo = ast.var(o);
    let member = ast.member(vo, "b");
    let delete = ast.unary(UnaryOp::Delete, member);
    let vo = ast.var(o);
    let keys = ast.unary(UnaryOp::Keysof, vo);
    let size = ast.unary(UnaryOp::Sizeof, keys);
    let ret = ast.ret(size);
    let literal = f.build(vec![init, delete, ret]);

    expect(&literal, &[], Value::Smi(2));
}

#[test]
fn test_array_index_and_size() {
    // a = [5, 6, 7]; return a[1] + sizeof a
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let a = f.stack_slot();

    let items = vec![ast.int(5), ast.int(6), ast.int(7)];
    let array = ast.array(items);
    let init = ast.set(a, array);
    let va = ast.var(a);
    let one = ast.int(1);
    let element = ast.index(va, one);
    let va = ast.var(a);
    let size = ast.unary(UnaryOp::Sizeof, va);
    let sum = ast.add(element, size);
    let ret = ast.ret(sum);
    let literal = f.build(vec![init, ret]);

    expect(&literal, &[], Value::Smi(9));
}

#[test]
fn test_variadic_parameter_and_spread() {
    // f = function (first, ...rest) { return first + sizeof rest }
    // items = [1, 2, 3]; return f(10, items...)
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let f = outer.stack_slot();
    let items = outer.stack_slot();

    let mut inner = FunctionBuilder::new();
    let first = inner.param();
    let rest = inner.variadic_param();
    let vfirst = ast.var(first);
    let vrest = ast.var(rest);
    let size = ast.unary(UnaryOp::Sizeof, vrest);
    let sum = ast.add(vfirst, size);
    let inner_ret = ast.ret(sum);
    let inner = inner.build(vec![inner_ret]);

    let closure = ast.function(inner);
    let init_f = ast.set(f, closure);
    let values = vec![ast.int(1), ast.int(2), ast.int(3)];
    let array = ast.array(values);
    let init_items = ast.set(items, array);
    let callee = ast.var(f);
    let ten = ast.int(10);
    let vitems = ast.var(items);
    let spread = ast.spread(vitems);
    let call = ast.call(callee, vec![ten, spread]);
    let ret = ast.ret(call);
    let literal = outer.build(vec![init_f, init_items, ret]);

    expect(&literal, &[], Value::Smi(13));
}

#[test]
fn test_method_call_passes_receiver() {
    // o = { base: 40, get: function (self, k) { return self.base + k } }
    // return o:get(2)
    let mut ast = AstBuilder::new();
    let mut outer = FunctionBuilder::new();
    let o = outer.stack_slot();

    let mut method = FunctionBuilder::new();
    let this = method.param();
    let k = method.param();
    let vthis = ast.var(this);
    let base = ast.member(vthis, "base");
    let vk = ast.var(k);
    let sum = ast.add(base, vk);
    let method_ret = ast.ret(sum);
    let method = method.build(vec![method_ret]);

    let forty = ast.int(40);
    let getter = ast.function(method);
    let object = ast.object(vec![("base", forty), ("get", getter)]);
    let init = ast.set(o, object);
    let vo = ast.var(o);
    let two = ast.int(2);
    let call = ast.method_call(vo, "get", vec![two]);
    let ret = ast.ret(call);
    let literal = outer.build(vec![init, ret]);

    expect(&literal, &[], Value::Smi(42));
}

#[test]
fn test_short_circuit_operators() {
    // a = 0; b = 5; return (a || b) * 10 + (b && a)
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let a = f.stack_slot();
    let b = f.stack_slot();

    let zero = ast.int(0);
    let init_a = ast.set(a, zero);
    let five = ast.int(5);
    let init_b = ast.set(b, five);
    let va = ast.var(a);
    let vb = ast.var(b);
    let either = ast.binary(BinOpKind::LOr, va, vb);
    let ten = ast.int(10);
    let scaled = ast.binary(BinOpKind::Mul, either, ten);
    let vb = ast.var(b);
    let va = ast.var(a);
    let both = ast.binary(BinOpKind::LAnd, vb, va);
    let sum = ast.add(scaled, both);
    let ret = ast.ret(sum);
    let literal = f.build(vec![init_a, init_b, ret]);

    expect(&literal, &[], Value::Smi(50));
}

#[test]
fn test_update_operators() {
    // x = 5; y = x++; return y * 10 + x
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let x = f.stack_slot();
    let y = f.stack_slot();

    let five = ast.int(5);
    let init = ast.set(x, five);
    let vx = ast.var(x);
    let post = ast.unary(UnaryOp::PostInc, vx);
    let init_y = ast.set(y, post);
    let vy = ast.var(y);
    let ten = ast.int(10);
    let scaled = ast.binary(BinOpKind::Mul, vy, ten);
    let vx = ast.var(x);
    let sum = ast.add(scaled, vx);
    let ret = ast.ret(sum);
    let literal = f.build(vec![init, init_y, ret]);

    expect(&literal, &[], Value::Smi(56));
}

#[test]
fn test_negation_and_not() {
    // x = 7; if (!x) return 1; return -x
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let x = f.stack_slot();

    let seven = ast.int(7);
    let init = ast.set(x, seven);
    let vx = ast.var(x);
    let not = ast.not(vx);
    let one = ast.int(1);
    let early = ast.ret(one);
    let guard = ast.if_then(not, vec![early]);
    let vx = ast.var(x);
    let negated = ast.unary(UnaryOp::Neg, vx);
    let ret = ast.ret(negated);
    let literal = f.build(vec![init, guard, ret]);

    expect(&literal, &[], Value::Smi(-7));
}

#[test]
fn test_strings_and_typeof() {
    let mut ast = AstBuilder::new();
    let f = FunctionBuilder::new();
    let one = ast.int(1);
    let kind = ast.unary(UnaryOp::Typeof, one);
    let ret = ast.ret(kind);
    let literal = f.build(vec![ret]);
    expect(&literal, &[], Value::String("number".to_string()));

    let lhs = ast.string("ab");
    let rhs = ast.string("cd");
    let joined = ast.add(lhs, rhs);
    let ret = ast.ret(joined);
    let literal = FunctionBuilder::new().build(vec![ret]);
    expect(&literal, &[], Value::String("abcd".to_string()));
}

#[test]
fn test_comparison_returns_boolean() {
    let mut ast = AstBuilder::new();
    let mut f = FunctionBuilder::new();
    let p = f.param();
    let vp = ast.var(p);
    let limit = ast.int(3);
    let below = ast.binary(BinOpKind::Lt, vp, limit);
    let ret = ast.ret(below);
    let literal = f.build(vec![ret]);

    expect(&literal, &[2], Value::Boolean(true));
    expect(&literal, &[4], Value::Boolean(false));
}
