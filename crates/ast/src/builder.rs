//! # AST Builder
//!
//! Fluent helpers for constructing resolved trees without a parser. Used by
//! the compiler's tests and by embedders that generate code directly.
//!
//! Spans are synthesized from a running cursor so every node gets a distinct,
//! increasing location.

use crate::ast::{BinOpKind, FunctionLiteral, Node, NodeKind, Parameter, UnaryOp};
use crate::scope::ScopeSlot;
use crate::source::Span;

/// Node factory.
#[derive(Debug, Default)]
pub struct AstBuilder {
    cursor: u32,
}

impl AstBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn span(&mut self) -> Span {
        let start = self.cursor;
        self.cursor += 1;
        Span::new(start, start + 1)
    }

    fn node(&mut self, kind: NodeKind) -> Node {
        let span = self.span();
        Node::new(kind, span)
    }

    // ====== LITERALS ======

    pub fn number(&mut self, text: &str) -> Node {
        self.node(NodeKind::Number(text.to_string()))
    }

    pub fn int(&mut self, value: i64) -> Node {
        self.node(NodeKind::Number(value.to_string()))
    }

    pub fn string(&mut self, text: &str) -> Node {
        self.node(NodeKind::String(text.to_string()))
    }

    pub fn property(&mut self, name: &str) -> Node {
        self.node(NodeKind::Property(name.to_string()))
    }

    pub fn boolean(&mut self, value: bool) -> Node {
        self.node(if value { NodeKind::True } else { NodeKind::False })
    }

    pub fn nil(&mut self) -> Node {
        self.node(NodeKind::Nil)
    }

    // ====== EXPRESSIONS ======

    pub fn var(&mut self, slot: ScopeSlot) -> Node {
        self.node(NodeKind::Value(slot))
    }

    pub fn assign(&mut self, target: Node, value: Node) -> Node {
        self.node(NodeKind::Assign {
            target: Box::new(target),
            value: Box::new(value),
        })
    }

    /// `slot = value`
    pub fn set(&mut self, slot: ScopeSlot, value: Node) -> Node {
        let target = self.var(slot);
        self.assign(target, value)
    }

    pub fn binary(&mut self, op: BinOpKind, lhs: Node, rhs: Node) -> Node {
        self.node(NodeKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    pub fn add(&mut self, lhs: Node, rhs: Node) -> Node {
        self.binary(BinOpKind::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Node, rhs: Node) -> Node {
        self.binary(BinOpKind::Sub, lhs, rhs)
    }

    pub fn unary(&mut self, op: UnaryOp, operand: Node) -> Node {
        self.node(NodeKind::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    pub fn not(&mut self, operand: Node) -> Node {
        self.unary(UnaryOp::Not, operand)
    }

    /// `object.name`
    pub fn member(&mut self, object: Node, name: &str) -> Node {
        let property = self.property(name);
        self.index(object, property)
    }

    /// `object[property]`
    pub fn index(&mut self, object: Node, property: Node) -> Node {
        self.node(NodeKind::Member {
            object: Box::new(object),
            property: Box::new(property),
        })
    }

    pub fn call(&mut self, callee: Node, args: Vec<Node>) -> Node {
        self.node(NodeKind::Call {
            callee: Box::new(callee),
            args,
        })
    }

    pub fn method_call(&mut self, receiver: Node, method: &str, args: Vec<Node>) -> Node {
        self.node(NodeKind::MethodCall {
            receiver: Box::new(receiver),
            method: method.to_string(),
            args,
        })
    }

    pub fn spread(&mut self, value: Node) -> Node {
        self.node(NodeKind::Spread(Box::new(value)))
    }

    pub fn function(&mut self, literal: FunctionLiteral) -> Node {
        self.node(NodeKind::Function(Box::new(literal)))
    }

    pub fn object(&mut self, entries: Vec<(&str, Node)>) -> Node {
        let entries = entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        self.node(NodeKind::ObjectLiteral(entries))
    }

    pub fn array(&mut self, items: Vec<Node>) -> Node {
        self.node(NodeKind::ArrayLiteral(items))
    }

    pub fn collect_garbage(&mut self) -> Node {
        self.node(NodeKind::CollectGarbage)
    }

    pub fn stack_trace(&mut self) -> Node {
        self.node(NodeKind::StackTrace)
    }

    // ====== STATEMENTS ======

    pub fn if_then(&mut self, condition: Node, then_branch: Vec<Node>) -> Node {
        self.node(NodeKind::If {
            condition: Box::new(condition),
            then_branch,
            else_branch: None,
        })
    }

    pub fn if_else(&mut self, condition: Node, then_branch: Vec<Node>, else_branch: Vec<Node>) -> Node {
        self.node(NodeKind::If {
            condition: Box::new(condition),
            then_branch,
            else_branch: Some(else_branch),
        })
    }

    pub fn while_loop(&mut self, condition: Node, body: Vec<Node>) -> Node {
        self.node(NodeKind::While {
            condition: Box::new(condition),
            body,
        })
    }

    pub fn block(&mut self, body: Vec<Node>) -> Node {
        self.node(NodeKind::Block(body))
    }

    pub fn brk(&mut self) -> Node {
        self.node(NodeKind::Break)
    }

    pub fn cont(&mut self) -> Node {
        self.node(NodeKind::Continue)
    }

    pub fn ret(&mut self, value: Node) -> Node {
        self.node(NodeKind::Return(Some(Box::new(value))))
    }

    pub fn ret_nil(&mut self) -> Node {
        self.node(NodeKind::Return(None))
    }
}

/// Allocates scope slots for one function and assembles its literal.
///
/// ```
/// use marlin_ast::{AstBuilder, FunctionBuilder};
///
/// let mut ast = AstBuilder::new();
/// let mut f = FunctionBuilder::new();
/// let a = f.stack_slot();
/// let one = ast.int(1);
/// let body = vec![ast.set(a, one)];
/// let literal = f.build(body);
/// assert_eq!(literal.stack_slots, 1);
/// ```
#[derive(Debug, Default)]
pub struct FunctionBuilder {
    name: Option<ScopeSlot>,
    params: Vec<Parameter>,
    stack_slots: u32,
    context_slots: u32,
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_slot(&mut self) -> ScopeSlot {
        let slot = ScopeSlot::stack(self.stack_slots);
        self.stack_slots += 1;
        slot
    }

    pub fn context_slot(&mut self) -> ScopeSlot {
        let slot = ScopeSlot::context(self.context_slots);
        self.context_slots += 1;
        slot
    }

    /// A parameter stored on the stack.
    pub fn param(&mut self) -> ScopeSlot {
        let slot = self.stack_slot();
        self.params.push(Parameter { slot, variadic: false });
        slot
    }

    /// A parameter captured by a nested function.
    pub fn context_param(&mut self) -> ScopeSlot {
        let slot = self.context_slot();
        self.params.push(Parameter { slot, variadic: false });
        slot
    }

    /// A trailing `...rest` parameter.
    pub fn variadic_param(&mut self) -> ScopeSlot {
        let slot = self.stack_slot();
        self.params.push(Parameter { slot, variadic: true });
        slot
    }

    /// Bind the function value to `slot` in the enclosing scope.
    pub fn named(mut self, slot: ScopeSlot) -> Self {
        self.name = Some(slot);
        self
    }

    pub fn build(self, body: Vec<Node>) -> FunctionLiteral {
        FunctionLiteral {
            name: self.name,
            params: self.params,
            body,
            stack_slots: self.stack_slots,
            context_slots: self.context_slots,
            span: Span::default(),
        }
    }
}
