//! # Marlin AST
//!
//! The scope-resolved syntax tree handed to the Marlin compiler.
//!
//! Parsing and scope resolution happen before this crate's types are built:
//! every variable reference already carries a [`ScopeSlot`] naming its storage
//! (a stack slot of the current function, or a slot of a captured context
//! some number of function levels up), and every [`FunctionLiteral`] knows how
//! many stack and context slots it needs.
//!
//! ## Design Goals
//!
//! - Plain owned tree, cheap to build by hand in tests
//! - Serializable, so front ends in other processes can ship an AST as JSON
//! - No name resolution left for the compiler to do

pub mod ast;
pub mod builder;
pub mod scope;
pub mod source;

pub use ast::{BinOpKind, FunctionLiteral, Node, NodeKind, Parameter, UnaryOp};
pub use builder::{AstBuilder, FunctionBuilder};
pub use scope::{ScopeSlot, SlotKind};
pub use source::Span;
