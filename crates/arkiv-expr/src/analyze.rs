//! Semantic analysis: annotate an untyped AST with resolved types.
//!
//! Analysis is a pure recursive function over the expression variants. It
//! never mutates the parser's tree; it builds a fresh [`TypedExpr`].
//! Parameter references are substituted with their literal values, names
//! are qualified against the registered namespace schemas, and function
//! calls are resolved against the process-wide function table.

use crate::ast::{Expr, TypedExpr, TypedExprKind};
use crate::function::function_table;
use crate::parser::parse;
use crate::types::{NamespaceSchemas, Parameters};
use crate::ExprError;

/// Analyze an expression against the given namespace schemas and
/// parameter values.
pub fn analyze(
    expression: &Expr,
    namespace_schemas: &NamespaceSchemas,
    parameters: &Parameters,
) -> Result<TypedExpr, ExprError> {
    match expression {
        Expr::Literal(value) => Ok(TypedExpr {
            data_type: value.literal_type()?,
            kind: TypedExprKind::Literal(value.clone()),
        }),

        Expr::Name(name) => {
            let (namespace, property) = match name.split('.').collect::<Vec<_>>().as_slice() {
                [property] => ("core", *property),
                [namespace, property] => (*namespace, *property),
                _ => {
                    return Err(ExprError::Analysis(format!(
                        "invalid property name: \"{name}\""
                    )))
                }
            };

            let schema = namespace_schemas.get(namespace).ok_or_else(|| {
                ExprError::Analysis(format!("undefined namespace: \"{namespace}\""))
            })?;
            let data_type = schema.get(property).copied().ok_or_else(|| {
                ExprError::Analysis(format!(
                    "no property: \"{property}\" defined within namespace: \"{namespace}\""
                ))
            })?;

            Ok(TypedExpr {
                kind: TypedExprKind::Name(format!("{namespace}.{property}")),
                data_type,
            })
        }

        Expr::Parameter(name) => {
            let value = parameters.get(name).ok_or_else(|| {
                ExprError::Analysis(format!("no value for parameter: \"{name}\""))
            })?;
            Ok(TypedExpr {
                data_type: value.literal_type()?,
                kind: TypedExprKind::Literal(value.clone()),
            })
        }

        Expr::FunctionCall { name, arguments } => {
            let arguments: Vec<TypedExpr> = arguments
                .iter()
                .map(|argument| analyze(argument, namespace_schemas, parameters))
                .collect::<Result<_, _>>()?;
            let argument_types: Vec<_> = arguments
                .iter()
                .map(|argument| argument.data_type)
                .collect();

            let prototype = function_table().resolve(name, &argument_types)?;
            Ok(TypedExpr {
                data_type: prototype.return_type,
                kind: TypedExprKind::FunctionCall {
                    prototype: prototype.clone(),
                    arguments,
                },
            })
        }
    }
}

/// Parse and analyze in one step.
pub fn parse_and_analyze(
    text: &str,
    namespace_schemas: &NamespaceSchemas,
    parameters: &Parameters,
) -> Result<TypedExpr, ExprError> {
    analyze(&parse(text)?, namespace_schemas, parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataType, NamespaceSchema, Value};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn schemas() -> NamespaceSchemas {
        let mut core = NamespaceSchema::new();
        core.insert("uuid".to_string(), DataType::Uuid);
        core.insert("size".to_string(), DataType::Integer);
        core.insert("product_name".to_string(), DataType::Text);
        core.insert("validity_start".to_string(), DataType::Timestamp);

        let mut station = NamespaceSchema::new();
        station.insert("elevation".to_string(), DataType::Real);

        HashMap::from([("core".to_string(), core), ("station".to_string(), station)])
    }

    #[test]
    fn bare_name_qualifies_to_core() {
        let typed = parse_and_analyze("size", &schemas(), &Parameters::new()).unwrap();
        assert_eq!(typed.kind, TypedExprKind::Name("core.size".to_string()));
        assert_eq!(typed.data_type, DataType::Integer);
    }

    #[test]
    fn explicit_namespace_is_respected() {
        let typed = parse_and_analyze("station.elevation", &schemas(), &Parameters::new()).unwrap();
        assert_eq!(typed.kind, TypedExprKind::Name("station.elevation".to_string()));
        assert_eq!(typed.data_type, DataType::Real);
    }

    #[test]
    fn three_dot_name_is_invalid() {
        let err = parse_and_analyze("a.b.c.d", &schemas(), &Parameters::new()).unwrap_err();
        assert_eq!(err.to_string(), "invalid property name: \"a.b.c.d\"");
    }

    #[test]
    fn undefined_namespace_is_reported() {
        let err = parse_and_analyze("nope.size", &schemas(), &Parameters::new()).unwrap_err();
        assert_eq!(err.to_string(), "undefined namespace: \"nope\"");
    }

    #[test]
    fn undefined_property_is_reported() {
        let err = parse_and_analyze("height", &schemas(), &Parameters::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no property: \"height\" defined within namespace: \"core\""
        );
    }

    #[test]
    fn parameter_substitutes_as_literal() {
        let uuid = Uuid::new_v4();
        let parameters = Parameters::from([("uuid".to_string(), Value::Uuid(uuid))]);
        let typed = parse_and_analyze("uuid == @uuid", &schemas(), &parameters).unwrap();
        assert_eq!(typed.data_type, DataType::Boolean);
        let (prototype, arguments) = typed.as_call().unwrap();
        assert_eq!(prototype.name, "==");
        assert_eq!(arguments[1].kind, TypedExprKind::Literal(Value::Uuid(uuid)));
    }

    #[test]
    fn missing_parameter_is_reported() {
        let err = parse_and_analyze("uuid == @uuid", &schemas(), &Parameters::new()).unwrap_err();
        assert_eq!(err.to_string(), "no value for parameter: \"uuid\"");
    }

    #[test]
    fn mixed_numeric_comparison_types_as_boolean() {
        let typed = parse_and_analyze("size + 1 == 2", &schemas(), &Parameters::new()).unwrap();
        assert_eq!(typed.data_type, DataType::Boolean);
    }

    #[test]
    fn undefined_function_is_reported() {
        let err =
            parse_and_analyze("frobnicate(size)", &schemas(), &Parameters::new()).unwrap_err();
        assert_eq!(err.to_string(), "undefined function: \"frobnicate(integer)\"");
    }

    #[test]
    fn analysis_does_not_touch_the_input_tree() {
        let parsed = parse("size == 10").unwrap();
        let before = parsed.clone();
        let _ = analyze(&parsed, &schemas(), &Parameters::new()).unwrap();
        assert_eq!(parsed, before);
    }
}
