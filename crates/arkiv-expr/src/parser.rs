//! Recursive-descent parser for the query expression grammar.
//!
//! One function per precedence level, lowest binding first; every level
//! consumes through the [`TokenStream`] lookahead-1 primitives. Binary
//! operators associate to the right. The reserved geometry keywords take
//! priority over the function-call and property-name readings of a name.

use crate::ast::Expr;
use crate::geometry::{
    Geometry, LineString, LinearRing, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon,
};
use crate::token::{Token, TokenKind, TokenStream};
use crate::types::Value;
use crate::ExprError;

/// Parse a complete expression, rejecting trailing input.
pub fn parse(text: &str) -> Result<Expr, ExprError> {
    let mut stream = TokenStream::new(text)?;
    let expression = parse_expression(&mut stream)?;
    if !stream.test(TokenKind::End) {
        return Err(stream.syntax_error(format!(
            "extra characters after expression: \"{}\"",
            stream.remainder()
        )));
    }
    Ok(expression)
}

fn parse_expression(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    parse_or_expression(stream)
}

fn parse_or_expression(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    let lhs = parse_and_expression(stream)?;
    if stream.accept_name("or")? {
        let rhs = parse_or_expression(stream)?;
        return Ok(Expr::call("or", vec![lhs, rhs]));
    }
    Ok(lhs)
}

fn parse_and_expression(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    let lhs = parse_not_expression(stream)?;
    if stream.accept_name("and")? {
        let rhs = parse_and_expression(stream)?;
        return Ok(Expr::call("and", vec![lhs, rhs]));
    }
    Ok(lhs)
}

fn parse_not_expression(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    if stream.accept_name("not")? {
        let operand = parse_not_expression(stream)?;
        return Ok(Expr::call("not", vec![operand]));
    }
    parse_comparison(stream)
}

const COMPARISON_OPERATORS: &[&str] = &["<", ">", "==", ">=", "<=", "!=", "~="];

fn parse_comparison(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    let lhs = parse_arithmetic_expression(stream)?;
    if stream.test_operator(COMPARISON_OPERATORS) {
        let operator = stream.expect_operator(COMPARISON_OPERATORS)?;
        let rhs = parse_comparison(stream)?;
        return Ok(Expr::call(operator, vec![lhs, rhs]));
    }
    Ok(lhs)
}

const ARITHMETIC_OPERATORS: &[&str] = &["+", "-", "*", "/"];

fn parse_arithmetic_expression(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    let lhs = parse_term(stream)?;
    if stream.test_operator(ARITHMETIC_OPERATORS) {
        let operator = stream.expect_operator(ARITHMETIC_OPERATORS)?;
        let rhs = parse_arithmetic_expression(stream)?;
        return Ok(Expr::call(operator, vec![lhs, rhs]));
    }
    Ok(lhs)
}

fn parse_term(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    if stream.test_operator(&["+", "-"]) {
        let operator = stream.expect_operator(&["+", "-"])?;
        let operand = parse_term(stream)?;
        return Ok(Expr::call(operator, vec![operand]));
    }
    parse_atom(stream)
}

fn parse_atom(stream: &mut TokenStream) -> Result<Expr, ExprError> {
    // Sub-expression.
    if stream.accept_operator("(")? {
        let sub_expression = parse_expression(stream)?;
        stream.expect_operator(&[")"])?;
        return Ok(sub_expression);
    }

    // Parameter reference.
    if stream.accept_operator("@")? {
        let name = stream.expect_name()?;
        return Ok(Expr::Parameter(name));
    }

    // Geometry literal, function call, or name.
    if stream.test(TokenKind::Name) {
        let name = stream.expect_name()?;

        let geometry = match name.as_str() {
            "POINT" => Some(Geometry::Point(parse_point(stream)?)),
            "LINESTRING" => Some(Geometry::LineString(parse_line_string(stream)?)),
            "POLYGON" => Some(Geometry::Polygon(parse_polygon(stream)?)),
            "MULTIPOINT" => Some(Geometry::MultiPoint(parse_multi_point(stream)?)),
            "MULTILINESTRING" => {
                Some(Geometry::MultiLineString(parse_multi_line_string(stream)?))
            }
            "MULTIPOLYGON" => Some(Geometry::MultiPolygon(parse_multi_polygon(stream)?)),
            _ => None,
        };
        if let Some(geometry) = geometry {
            return Ok(Expr::Literal(Value::Geometry(geometry)));
        }

        // Function call.
        if stream.test_operator(&["("]) {
            let arguments = parse_sequence(stream, parse_expression)?;
            return Ok(Expr::call(name, arguments));
        }

        // Name, possibly namespace-qualified.
        let mut parts = vec![name];
        while stream.accept_operator(".")? {
            parts.push(stream.expect_name()?);
        }
        return Ok(Expr::Name(parts.join(".")));
    }

    // Literal.
    let token = stream.expect_any(&[
        TokenKind::Text,
        TokenKind::Timestamp,
        TokenKind::Uuid,
        TokenKind::Real,
        TokenKind::Integer,
        TokenKind::Boolean,
    ])?;
    let value = match token {
        Token::Text(text) => Value::Text(text),
        Token::Timestamp(timestamp) => Value::Timestamp(timestamp),
        Token::Uuid(uuid) => Value::Uuid(uuid),
        Token::Real(real) => Value::Real(real),
        Token::Integer(integer) => Value::Integer(integer),
        Token::Boolean(boolean) => Value::Boolean(boolean),
        _ => unreachable!(),
    };
    Ok(Expr::Literal(value))
}

/// `( item ("," item)* )` or the empty sequence `( )`.
fn parse_sequence<T>(
    stream: &mut TokenStream,
    parse_item: impl Fn(&mut TokenStream) -> Result<T, ExprError>,
) -> Result<Vec<T>, ExprError> {
    stream.expect_operator(&["("])?;
    if stream.accept_operator(")")? {
        return Ok(Vec::new());
    }

    let mut sequence = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        sequence.push(parse_item(stream)?);
    }
    stream.expect_operator(&[")"])?;
    Ok(sequence)
}

/// Like [`parse_sequence`], but accepting the `EMPTY` keyword for an empty
/// sequence instead of `( )`.
fn parse_geometry_sequence<T>(
    stream: &mut TokenStream,
    parse_item: impl Fn(&mut TokenStream) -> Result<T, ExprError>,
) -> Result<Vec<T>, ExprError> {
    if stream.accept_name("EMPTY")? {
        return Ok(Vec::new());
    }

    stream.expect_operator(&["("])?;
    let mut sequence = vec![parse_item(stream)?];
    while stream.accept_operator(",")? {
        sequence.push(parse_item(stream)?);
    }
    stream.expect_operator(&[")"])?;
    Ok(sequence)
}

fn parse_signed_coordinate(stream: &mut TokenStream) -> Result<f64, ExprError> {
    let negative = stream.accept_operator("-")?;
    if !negative {
        stream.accept_operator("+")?;
    }
    let token = stream.expect_any(&[TokenKind::Integer, TokenKind::Real])?;
    let value = match token {
        Token::Integer(integer) => integer as f64,
        Token::Real(real) => real,
        _ => unreachable!(),
    };
    Ok(if negative { -value } else { value })
}

fn parse_point_raw(stream: &mut TokenStream) -> Result<Point, ExprError> {
    let x = parse_signed_coordinate(stream)?;
    let y = parse_signed_coordinate(stream)?;
    Ok(Point::new(x, y))
}

fn parse_point(stream: &mut TokenStream) -> Result<Point, ExprError> {
    stream.expect_operator(&["("])?;
    let point = parse_point_raw(stream)?;
    stream.expect_operator(&[")"])?;
    Ok(point)
}

fn parse_line_string(stream: &mut TokenStream) -> Result<LineString, ExprError> {
    Ok(LineString(parse_geometry_sequence(stream, parse_point_raw)?))
}

fn parse_linear_ring(stream: &mut TokenStream) -> Result<LinearRing, ExprError> {
    let mut points = parse_geometry_sequence(stream, parse_point_raw)?;
    if points.is_empty() {
        return Ok(LinearRing::default());
    }

    if points.len() < 4 {
        return Err(
            stream.syntax_error("linear ring should be empty or should contain >= 4 points")
        );
    }
    if points.first() != points.last() {
        return Err(stream.syntax_error("linear ring should be closed"));
    }

    points.pop();
    Ok(LinearRing(points))
}

fn parse_polygon(stream: &mut TokenStream) -> Result<Polygon, ExprError> {
    Ok(Polygon(parse_geometry_sequence(stream, parse_linear_ring)?))
}

fn parse_multi_point(stream: &mut TokenStream) -> Result<MultiPoint, ExprError> {
    Ok(MultiPoint(parse_geometry_sequence(stream, parse_point)?))
}

fn parse_multi_line_string(stream: &mut TokenStream) -> Result<MultiLineString, ExprError> {
    Ok(MultiLineString(parse_geometry_sequence(
        stream,
        parse_line_string,
    )?))
}

fn parse_multi_polygon(stream: &mut TokenStream) -> Result<MultiPolygon, ExprError> {
    Ok(MultiPolygon(parse_geometry_sequence(stream, parse_polygon)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_is_right_associative() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr.to_string(),
            "(FunctionCall + (Literal 1) (FunctionCall * (Literal 2) (Literal 3)))"
        );
    }

    #[test]
    fn not_binds_tighter_than_and() {
        let expr = parse("not a and b").unwrap();
        assert_eq!(
            expr.to_string(),
            "(FunctionCall and (FunctionCall not (Name a)) (Name b))"
        );
    }

    #[test]
    fn or_is_weaker_than_and() {
        let expr = parse("a or b and c").unwrap();
        assert_eq!(
            expr.to_string(),
            "(FunctionCall or (Name a) (FunctionCall and (Name b) (Name c)))"
        );
    }

    #[test]
    fn point_literal() {
        let expr = parse("POINT(1 2)").unwrap();
        assert_eq!(
            expr,
            Expr::Literal(Value::Geometry(Geometry::Point(Point::new(1.0, 2.0))))
        );
    }

    #[test]
    fn point_accepts_signed_coordinates() {
        let expr = parse("POINT(-1.5 +2)").unwrap();
        assert_eq!(
            expr,
            Expr::Literal(Value::Geometry(Geometry::Point(Point::new(-1.5, 2.0))))
        );
    }

    #[test]
    fn linestring_empty_keyword() {
        let expr = parse("LINESTRING EMPTY").unwrap();
        assert_eq!(
            expr,
            Expr::Literal(Value::Geometry(Geometry::LineString(LineString::default())))
        );
    }

    #[test]
    fn polygon_ring_closure_is_checked_and_stripped() {
        let expr = parse("POLYGON((0 0, 0 1, 1 1, 0 0))").unwrap();
        let Expr::Literal(Value::Geometry(Geometry::Polygon(polygon))) = expr else {
            panic!("expected polygon literal");
        };
        assert_eq!(polygon.0.len(), 1);
        assert_eq!(polygon.0[0].0.len(), 3);
    }

    #[test]
    fn open_linear_ring_is_rejected() {
        let err = parse("POLYGON((0 0, 0 1, 1 1, 1 0))").unwrap_err();
        assert!(err.to_string().contains("linear ring should be closed"));
    }

    #[test]
    fn short_linear_ring_is_rejected() {
        let err = parse("POLYGON((0 0, 0 1, 0 0))").unwrap_err();
        assert!(err
            .to_string()
            .contains("linear ring should be empty or should contain >= 4 points"));
    }

    #[test]
    fn qualified_name_joins_on_dots() {
        assert_eq!(parse("core.size").unwrap(), Expr::Name("core.size".to_string()));
        assert_eq!(parse("a.b.c.d").unwrap(), Expr::Name("a.b.c.d".to_string()));
    }

    #[test]
    fn function_call_with_arguments() {
        let expr = parse("covers(validity_start, validity_stop, @start, @stop)").unwrap();
        let Expr::FunctionCall { name, arguments } = expr else {
            panic!("expected function call");
        };
        assert_eq!(name, "covers");
        assert_eq!(arguments.len(), 4);
    }

    #[test]
    fn parameter_reference() {
        assert_eq!(parse("@uuid").unwrap(), Expr::Parameter("uuid".to_string()));
    }

    #[test]
    fn trailing_input_is_rejected() {
        let err = parse("1 + 2 3").unwrap_err();
        assert!(err
            .to_string()
            .contains("extra characters after expression"));
    }

    #[test]
    fn expected_token_message_names_alternatives() {
        let err = parse("covers(1,").unwrap_err();
        assert_eq!(err.to_string(), "char 10: unexpected end of input");
    }

    #[test]
    fn unbalanced_parenthesis_reports_expectation() {
        let err = parse("(1 + 2").unwrap_err();
        assert!(err.to_string().contains("unexpected end of input"));
    }
}
