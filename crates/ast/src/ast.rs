//! # Resolved Syntax Tree
//!
//! Node types produced by the front end after scope resolution. Statements and
//! expressions share one [`Node`] type, as in the surface language where
//! assignment and calls appear in both positions; the compiler rejects
//! statement-only nodes found in expression position.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::scope::ScopeSlot;
use crate::source::Span;

/// A function body together with its resolved frame requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionLiteral {
    /// Set for `fn name() {}` declarations; the function value is assigned here.
    #[serde(default)]
    pub name: Option<ScopeSlot>,
    pub params: Vec<Parameter>,
    pub body: Vec<Node>,
    /// Number of stack slots the resolver assigned inside this function.
    pub stack_slots: u32,
    /// Number of slots in this function's own context object.
    pub context_slots: u32,
    #[serde(default)]
    pub span: Span,
}

impl FunctionLiteral {
    /// Declared argument count, not counting a trailing variadic parameter.
    pub fn arg_count(&self) -> u32 {
        self.params.iter().filter(|p| !p.variadic).count() as u32
    }

    pub fn is_variadic(&self) -> bool {
        self.params.iter().any(|p| p.variadic)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub slot: ScopeSlot,
    /// `...rest` parameter collecting the remaining arguments into an array.
    #[serde(default)]
    pub variadic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub kind: NodeKind,
    #[serde(default)]
    pub span: Span,
}

impl Node {
    pub fn new(kind: NodeKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// Whether this node can appear on the left of `=`.
    pub fn is_lvalue(&self) -> bool {
        matches!(self.kind, NodeKind::Value(_) | NodeKind::Member { .. })
    }

    /// Whether this node only makes sense as a statement.
    pub fn is_statement(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::If { .. }
                | NodeKind::While { .. }
                | NodeKind::Block(_)
                | NodeKind::Break
                | NodeKind::Continue
                | NodeKind::Return(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Read of a resolved variable.
    Value(ScopeSlot),

    // Literals
    Number(String),
    String(String),
    /// Property name in `a.b` position.
    Property(String),
    True,
    False,
    Nil,

    Assign {
        target: Box<Node>,
        value: Box<Node>,
    },
    /// `object.property` or `object[property]`.
    Member {
        object: Box<Node>,
        property: Box<Node>,
    },
    Binary {
        op: BinOpKind,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    Call {
        callee: Box<Node>,
        args: Vec<Node>,
    },
    /// `receiver:method(args)`; the receiver is passed as the first argument.
    MethodCall {
        receiver: Box<Node>,
        method: String,
        args: Vec<Node>,
    },
    /// `args...` in the last argument position of a call.
    Spread(Box<Node>),
    Function(Box<FunctionLiteral>),
    ObjectLiteral(Vec<(String, Node)>),
    ArrayLiteral(Vec<Node>),

    If {
        condition: Box<Node>,
        then_branch: Vec<Node>,
        else_branch: Option<Vec<Node>>,
    },
    While {
        condition: Box<Node>,
        body: Vec<Node>,
    },
    Block(Vec<Node>),
    Break,
    Continue,
    Return(Option<Box<Node>>),

    /// `__$gc()`
    CollectGarbage,
    /// `__$trace()`
    StackTrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    UShr,
    Eq,
    StrictEq,
    Ne,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    LAnd,
    LOr,
}

impl BinOpKind {
    pub const ALL: [BinOpKind; 21] = [
        BinOpKind::Add,
        BinOpKind::Sub,
        BinOpKind::Mul,
        BinOpKind::Div,
        BinOpKind::Mod,
        BinOpKind::BAnd,
        BinOpKind::BOr,
        BinOpKind::BXor,
        BinOpKind::Shl,
        BinOpKind::Shr,
        BinOpKind::UShr,
        BinOpKind::Eq,
        BinOpKind::StrictEq,
        BinOpKind::Ne,
        BinOpKind::StrictNe,
        BinOpKind::Lt,
        BinOpKind::Gt,
        BinOpKind::Le,
        BinOpKind::Ge,
        BinOpKind::LAnd,
        BinOpKind::LOr,
    ];

    /// `+ - * /`
    pub fn is_math(self) -> bool {
        matches!(self, BinOpKind::Add | BinOpKind::Sub | BinOpKind::Mul | BinOpKind::Div)
    }

    /// Integer-only operators: bitwise, shifts and `%`.
    pub fn is_binary(self) -> bool {
        matches!(
            self,
            BinOpKind::Mod
                | BinOpKind::BAnd
                | BinOpKind::BOr
                | BinOpKind::BXor
                | BinOpKind::Shl
                | BinOpKind::Shr
                | BinOpKind::UShr
        )
    }

    /// Comparisons.
    pub fn is_logic(self) -> bool {
        matches!(
            self,
            BinOpKind::Eq
                | BinOpKind::StrictEq
                | BinOpKind::Ne
                | BinOpKind::StrictNe
                | BinOpKind::Lt
                | BinOpKind::Gt
                | BinOpKind::Le
                | BinOpKind::Ge
        )
    }

    /// Short-circuit `&&` and `||`.
    pub fn is_bool_logic(self) -> bool {
        matches!(self, BinOpKind::LAnd | BinOpKind::LOr)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOpKind::Add => "+",
            BinOpKind::Sub => "-",
            BinOpKind::Mul => "*",
            BinOpKind::Div => "/",
            BinOpKind::Mod => "%",
            BinOpKind::BAnd => "&",
            BinOpKind::BOr => "|",
            BinOpKind::BXor => "^",
            BinOpKind::Shl => "<<",
            BinOpKind::Shr => ">>",
            BinOpKind::UShr => ">>>",
            BinOpKind::Eq => "==",
            BinOpKind::StrictEq => "===",
            BinOpKind::Ne => "!=",
            BinOpKind::StrictNe => "!==",
            BinOpKind::Lt => "<",
            BinOpKind::Gt => ">",
            BinOpKind::Le => "<=",
            BinOpKind::Ge => ">=",
            BinOpKind::LAnd => "&&",
            BinOpKind::LOr => "||",
        }
    }
}

impl fmt::Display for BinOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    PreInc,
    PreDec,
    PostInc,
    PostDec,
    Typeof,
    Sizeof,
    Keysof,
    Clone,
    Delete,
}

impl UnaryOp {
    /// Operators that write back to their operand.
    pub fn is_update(self) -> bool {
        matches!(
            self,
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec
        )
    }
}
