//! Registry of polymorphic function and operator signatures.
//!
//! The table is built once, on first use, and is immutable afterwards.
//! Overload resolution is by exact argument-type match: the numeric
//! promotion pairings are registered as separate explicit prototypes, not
//! implicit coercions.

use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use crate::types::DataType;
use crate::ExprError;

use DataType::{Boolean, Geometry, Integer, Long, Real, Text, Timestamp, Uuid};

/// A single function/operator signature. Equality and hashing are
/// value-based over the name and argument types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Prototype {
    pub name: String,
    pub argument_types: Vec<DataType>,
    pub return_type: DataType,
}

impl Prototype {
    pub fn new(name: &str, argument_types: &[DataType], return_type: DataType) -> Self {
        Self {
            name: name.to_string(),
            argument_types: argument_types.to_vec(),
            return_type,
        }
    }
}

impl fmt::Display for Prototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arguments: Vec<String> = self
            .argument_types
            .iter()
            .map(|data_type| data_type.to_string())
            .collect();
        write!(f, "{}({})", self.name, arguments.join(", "))
    }
}

/// Candidate prototypes indexed by `(name, arity)`.
#[derive(Debug, Default)]
pub struct FunctionTable {
    prototypes: HashMap<(String, usize), Vec<Prototype>>,
}

impl FunctionTable {
    fn add(&mut self, name: &str, argument_types: &[DataType], return_type: DataType) {
        self.prototypes
            .entry((name.to_string(), argument_types.len()))
            .or_default()
            .push(Prototype::new(name, argument_types, return_type));
    }

    /// Resolve a call site against the table. Zero matches is a user error
    /// ("undefined function"); more than one match indicates an
    /// inconsistency in the static registration and is an internal error.
    pub fn resolve(&self, name: &str, argument_types: &[DataType]) -> Result<&Prototype, ExprError> {
        let call = Prototype::new(name, argument_types, Boolean);
        let candidates = self
            .prototypes
            .get(&(name.to_string(), argument_types.len()));

        let matches: Vec<&Prototype> = candidates
            .into_iter()
            .flatten()
            .filter(|prototype| prototype.argument_types == argument_types)
            .collect();

        match matches.as_slice() {
            [] => Err(ExprError::Analysis(format!(
                "undefined function: \"{call}\""
            ))),
            [prototype] => Ok(prototype),
            _ => Err(ExprError::Internal(format!(
                "cannot uniquely resolve function: \"{call}\""
            ))),
        }
    }
}

/// The process-wide function table with the fixed operator/function set.
pub fn function_table() -> &'static FunctionTable {
    &FUNCTION_TABLE
}

static FUNCTION_TABLE: LazyLock<FunctionTable> = LazyLock::new(|| {
    let mut table = FunctionTable::default();

    // Numeric promotion grid: operand pairing to promoted result type.
    let numeric: [(DataType, DataType, DataType); 9] = [
        (Long, Long, Long),
        (Long, Integer, Long),
        (Integer, Long, Long),
        (Integer, Integer, Integer),
        (Real, Real, Real),
        (Real, Long, Real),
        (Long, Real, Real),
        (Real, Integer, Real),
        (Integer, Real, Real),
    ];

    // Logical operators.
    table.add("not", &[Boolean], Boolean);
    table.add("and", &[Boolean, Boolean], Boolean);
    table.add("or", &[Boolean, Boolean], Boolean);

    // Comparison operators.
    for operator in ["==", "!=", "<", ">", "<=", ">="] {
        for (lhs, rhs, _) in numeric {
            table.add(operator, &[lhs, rhs], Boolean);
        }
        table.add(operator, &[Text, Text], Boolean);
        table.add(operator, &[Timestamp, Timestamp], Boolean);
    }
    for operator in ["==", "!="] {
        table.add(operator, &[Boolean, Boolean], Boolean);
        table.add(operator, &[Uuid, Uuid], Boolean);
    }

    // Text pattern match.
    table.add("~=", &[Text, Text], Boolean);

    // Unary and binary arithmetic.
    for operator in ["+", "-"] {
        table.add(operator, &[Long], Long);
        table.add(operator, &[Integer], Integer);
        table.add(operator, &[Real], Real);
    }
    for operator in ["+", "-", "*", "/"] {
        for (lhs, rhs, result) in numeric {
            table.add(operator, &[lhs, rhs], result);
        }
    }

    // Timestamp subtraction yields elapsed seconds.
    table.add("-", &[Timestamp, Timestamp], Real);

    // Functions.
    table.add("covers", &[Geometry, Geometry], Boolean);
    table.add("covers", &[Timestamp, Timestamp, Timestamp, Timestamp], Boolean);
    table.add("intersects", &[Geometry, Geometry], Boolean);
    table.add(
        "intersects",
        &[Timestamp, Timestamp, Timestamp, Timestamp],
        Boolean,
    );
    for data_type in [Long, Integer, Real, Boolean, Text, Timestamp, Uuid, Geometry] {
        table.add("is_defined", &[data_type], Boolean);
    }
    table.add("is_source_of", &[Uuid], Boolean);
    table.add("is_derived_from", &[Uuid], Boolean);
    table.add("has_tag", &[Text], Boolean);
    table.add("now", &[], Timestamp);

    table
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_integer_long_comparison_resolves_both_ways() {
        let table = function_table();
        let forward = table.resolve("==", &[Integer, Long]).unwrap();
        let backward = table.resolve("==", &[Long, Integer]).unwrap();
        assert_eq!(forward.return_type, Boolean);
        assert_eq!(backward.return_type, Boolean);
    }

    #[test]
    fn unregistered_function_is_a_user_error() {
        let err = function_table().resolve("sum", &[Text]).unwrap_err();
        assert_eq!(err.to_string(), "undefined function: \"sum(text)\"");
    }

    #[test]
    fn timestamp_subtraction_returns_real() {
        let prototype = function_table()
            .resolve("-", &[Timestamp, Timestamp])
            .unwrap();
        assert_eq!(prototype.return_type, Real);
    }

    #[test]
    fn now_takes_no_arguments() {
        let prototype = function_table().resolve("now", &[]).unwrap();
        assert_eq!(prototype.return_type, Timestamp);
        assert!(function_table().resolve("now", &[Integer]).is_err());
    }
}
