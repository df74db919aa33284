//! Arkiv catalogue query expression language.
//!
//! A small typed query language used to select, aggregate and summarize
//! catalogued products. The pipeline is:
//!
//! ```text
//! query text ──lex──► tokens ──parse──► untyped AST ──analyze──► typed AST
//! ```
//!
//! The typed AST is what a catalogue backend consumes, typically by
//! translating it into its native query language. Names resolve against
//! namespace schemas supplied by the caller, `@name` parameters against a
//! value map, and function calls against a fixed process-wide overload
//! table.

pub mod analyze;
pub mod ast;
pub mod function;
pub mod geometry;
pub mod parser;
pub mod token;
pub mod types;

pub use analyze::{analyze, parse_and_analyze};
pub use ast::{Expr, TypedExpr, TypedExprKind};
pub use function::{function_table, FunctionTable, Prototype};
pub use parser::parse;
pub use types::{DataType, NamespaceSchema, NamespaceSchemas, Parameters, Value};

use thiserror::Error;

/// Errors raised by the expression engine.
///
/// `Parse` and `Analysis` are user errors: bad query text or references
/// that do not resolve. `Internal` indicates an inconsistency in the
/// static registration tables and should never occur for well-formed
/// tables.
#[derive(Debug, Error)]
pub enum ExprError {
    /// Syntax error with a 1-based character offset into the query text.
    #[error("char {position}: {message}")]
    Parse { position: usize, message: String },

    /// Semantic error: undefined namespace/property/function, missing
    /// parameter value, invalid property name.
    #[error("{0}")]
    Analysis(String),

    /// Defect in the static registration tables.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ExprError {
    /// Whether this error indicates an internal defect rather than bad
    /// caller input.
    pub fn is_internal(&self) -> bool {
        matches!(self, ExprError::Internal(_))
    }
}
