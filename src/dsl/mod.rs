//! Query DSL front end
//!
//! Lexing and parsing of query text into an AST.

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::{
    AggregateFunc, BinaryOperator, Expr, Literal, OrderByItem, Query, SelectItem, UnaryOperator,
};
pub use parser::{parse, Parser};
