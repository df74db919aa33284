//! Abstract syntax trees for query expressions.
//!
//! The parser produces an untyped [`Expr`]; semantic analysis produces a
//! fresh [`TypedExpr`] without touching the parser's tree. Ownership is
//! strictly hierarchical, argument order is significant and preserved.

use std::fmt;

use crate::function::Prototype;
use crate::types::{DataType, Value};

/// Untyped expression node as produced by the parser.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A (possibly namespace-qualified) property reference, e.g. `size` or
    /// `core.size`.
    Name(String),
    /// A `@name` reference into the supplied parameter map.
    Parameter(String),
    FunctionCall { name: String, arguments: Vec<Expr> },
}

impl Expr {
    pub fn call(name: impl Into<String>, arguments: Vec<Expr>) -> Self {
        Expr::FunctionCall {
            name: name.into(),
            arguments,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(value) => write!(f, "(Literal {value})"),
            Expr::Name(name) => write!(f, "(Name {name})"),
            Expr::Parameter(name) => write!(f, "(ParameterReference {name})"),
            Expr::FunctionCall { name, arguments } => {
                write!(f, "(FunctionCall {name}")?;
                for argument in arguments {
                    write!(f, " {argument}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Expression node annotated with its resolved type.
///
/// Parameter references do not survive analysis: their values are
/// substituted as literals.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedExpr {
    pub kind: TypedExprKind,
    pub data_type: DataType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypedExprKind {
    Literal(Value),
    /// Fully qualified `namespace.property` reference.
    Name(String),
    FunctionCall {
        prototype: Prototype,
        arguments: Vec<TypedExpr>,
    },
}

impl TypedExpr {
    pub fn as_call(&self) -> Option<(&Prototype, &[TypedExpr])> {
        match &self.kind {
            TypedExprKind::FunctionCall {
                prototype,
                arguments,
            } => Some((prototype, arguments)),
            _ => None,
        }
    }
}
