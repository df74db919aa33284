//! Tokenizer for the catalogue query expression language.
//!
//! The lexer runs a single combined pattern at each position; the order of
//! the alternates encodes priority among equal-length matches (a boolean
//! literal never lexes as a name, a timestamp never lexes as arithmetic on
//! integers). All error positions are 1-based character offsets into the
//! query text.

use std::fmt;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveDateTime};
use regex::Regex;
use uuid::Uuid;

use crate::ExprError;

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    // One capture group per token class, tried in priority order.
    let pattern = concat!(
        r#"\A(?:"#,
        r#"("(?:[^\\"]|\\.)*")"#,                            // text literals
        r"|(\d{4}-\d{2}-\d{2}(?:T\d{2}:\d{2}:\d{2}(?:\.\d{0,6})?)?)", // timestamps
        r"|([0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12})", // uuids
        r"|(\d+(?:\.\d*(?:[eE][+-]?\d+)?|[eE][+-]?\d+))",    // real literals
        r"|(\d+)",                                           // integer literals
        r"|(true|false)",                                    // boolean literals
        r"|([a-zA-Z]\w*)",                                   // names
        r"|(<=|>=|==|!=|~=|[*<>@(),.+\-/])",                 // operators and delimiters
        r")",
    );
    Regex::new(pattern).expect("token pattern")
});

static DATE_MIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0000-00-00(?:T00:00:00(?:\.0{0,6})?)?$").expect("date-min pattern"));
static DATE_MAX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^9999-99-99(?:T99:99:99(?:\.9{0,6})?)?$").expect("date-max pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Text,
    Uuid,
    Timestamp,
    Real,
    Integer,
    Boolean,
    Name,
    Operator,
    End,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TokenKind::Text => "TEXT",
            TokenKind::Uuid => "UUID",
            TokenKind::Timestamp => "TIMESTAMP",
            TokenKind::Real => "REAL",
            TokenKind::Integer => "INTEGER",
            TokenKind::Boolean => "BOOLEAN",
            TokenKind::Name => "NAME",
            TokenKind::Operator => "OPERATOR",
            TokenKind::End => "END",
        };
        f.write_str(name)
    }
}

/// A single lexed token, carrying its decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(String),
    Uuid(Uuid),
    Timestamp(NaiveDateTime),
    Real(f64),
    Integer(i64),
    Boolean(bool),
    Name(String),
    Operator(String),
    End,
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::Text(_) => TokenKind::Text,
            Token::Uuid(_) => TokenKind::Uuid,
            Token::Timestamp(_) => TokenKind::Timestamp,
            Token::Real(_) => TokenKind::Real,
            Token::Integer(_) => TokenKind::Integer,
            Token::Boolean(_) => TokenKind::Boolean,
            Token::Name(_) => TokenKind::Name,
            Token::Operator(_) => TokenKind::Operator,
            Token::End => TokenKind::End,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Text(v) => f.write_str(v),
            Token::Uuid(v) => write!(f, "{v}"),
            Token::Timestamp(v) => write!(f, "{v}"),
            Token::Real(v) => write!(f, "{v}"),
            Token::Integer(v) => write!(f, "{v}"),
            Token::Boolean(v) => write!(f, "{v}"),
            Token::Name(v) => f.write_str(v),
            Token::Operator(v) => f.write_str(v),
            Token::End => f.write_str("END"),
        }
    }
}

/// Restartable token stream with single-token lookahead.
///
/// The parser drives it through `test` (peek), `accept` (consume on match)
/// and the `expect_*` primitives (consume or raise a positioned syntax
/// error).
#[derive(Debug)]
pub struct TokenStream<'a> {
    text: &'a str,
    token: Token,
    token_start: usize,
    token_end: usize,
    at_end: bool,
}

impl<'a> TokenStream<'a> {
    pub fn new(text: &'a str) -> Result<Self, ExprError> {
        let mut stream = Self {
            text,
            token: Token::End,
            token_start: 0,
            token_end: 0,
            at_end: text.is_empty(),
        };
        stream.advance()?;
        Ok(stream)
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// 1-based character offset of the current token.
    pub fn position(&self) -> usize {
        char_position(self.text, self.token_start)
    }

    /// Remaining input starting at the current token.
    pub fn remainder(&self) -> &str {
        &self.text[self.token_start..]
    }

    /// Lex the next token. Requesting a token past `End` is an error.
    pub fn advance(&mut self) -> Result<(), ExprError> {
        if self.at_end {
            return Err(self.unexpected_end());
        }
        self.token = self.next_token()?;
        Ok(())
    }

    pub fn test(&self, kind: TokenKind) -> bool {
        self.token.kind() == kind
    }

    pub fn test_operator(&self, operators: &[&str]) -> bool {
        matches!(&self.token, Token::Operator(op) if operators.contains(&op.as_str()))
    }

    pub fn test_name(&self, name: &str) -> bool {
        matches!(&self.token, Token::Name(value) if value == name)
    }

    /// Consume the current token if it is the given operator.
    pub fn accept_operator(&mut self, operator: &str) -> Result<bool, ExprError> {
        if self.test_operator(&[operator]) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume the current token if it is the given keyword name.
    pub fn accept_name(&mut self, name: &str) -> Result<bool, ExprError> {
        if self.test_name(name) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consume an operator drawn from `operators`, or fail naming them.
    pub fn expect_operator(&mut self, operators: &[&str]) -> Result<String, ExprError> {
        if !self.test_operator(operators) {
            let expected = quoted_list(operators);
            return Err(self.mismatch(&expected));
        }
        let Token::Operator(op) = self.token.clone() else {
            unreachable!()
        };
        self.advance()?;
        Ok(op)
    }

    /// Consume a name token and return its value.
    pub fn expect_name(&mut self) -> Result<String, ExprError> {
        if !self.test(TokenKind::Name) {
            return Err(self.mismatch(&TokenKind::Name.to_string()));
        }
        let Token::Name(name) = self.token.clone() else {
            unreachable!()
        };
        self.advance()?;
        Ok(name)
    }

    /// Consume a token whose kind is one of `kinds` and return it.
    pub fn expect_any(&mut self, kinds: &[TokenKind]) -> Result<Token, ExprError> {
        if !kinds.contains(&self.token.kind()) {
            let strings: Vec<String> = kinds.iter().map(|kind| kind.to_string()).collect();
            let expected = one_of(&strings);
            return Err(self.mismatch(&expected));
        }
        let token = self.token.clone();
        self.advance()?;
        Ok(token)
    }

    pub fn syntax_error(&self, message: impl Into<String>) -> ExprError {
        ExprError::Parse {
            position: self.position(),
            message: message.into(),
        }
    }

    fn unexpected_end(&self) -> ExprError {
        self.syntax_error("unexpected end of input")
    }

    fn mismatch(&self, expected: &str) -> ExprError {
        if self.token.kind() == TokenKind::End {
            return self.unexpected_end();
        }
        self.syntax_error(format!("expected {}, got \"{}\"", expected, self.token))
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        self.token_start = skip_whitespace(self.text, self.token_end);

        if self.token_start == self.text.len() {
            self.at_end = true;
            return Ok(Token::End);
        }

        let rest = &self.text[self.token_start..];
        let captures = TOKEN_RE.captures(rest).ok_or_else(|| ExprError::Parse {
            position: self.position(),
            message: format!("syntax error: \"{rest}\""),
        })?;
        self.token_end = self.token_start + captures.get(0).expect("whole match").end();

        if let Some(text) = captures.get(1) {
            let inner = &text.as_str()[1..text.as_str().len() - 1];
            return Ok(Token::Text(string_unescape(inner)));
        }
        if let Some(timestamp) = captures.get(2) {
            return Ok(Token::Timestamp(self.parse_timestamp(timestamp.as_str())?));
        }
        if let Some(uuid) = captures.get(3) {
            let value = Uuid::parse_str(uuid.as_str()).map_err(|err| ExprError::Parse {
                position: self.position(),
                message: format!("invalid uuid: \"{}\" ({err})", uuid.as_str()),
            })?;
            return Ok(Token::Uuid(value));
        }
        if let Some(real) = captures.get(4) {
            let value: f64 = real.as_str().parse().map_err(|_| ExprError::Parse {
                position: self.position(),
                message: format!("invalid real: \"{}\"", real.as_str()),
            })?;
            return Ok(Token::Real(value));
        }
        if let Some(integer) = captures.get(5) {
            let value: i64 = integer.as_str().parse().map_err(|_| ExprError::Parse {
                position: self.position(),
                message: format!("invalid integer: \"{}\"", integer.as_str()),
            })?;
            return Ok(Token::Integer(value));
        }
        if let Some(boolean) = captures.get(6) {
            return Ok(Token::Boolean(boolean.as_str() == "true"));
        }
        if let Some(name) = captures.get(7) {
            return Ok(Token::Name(name.as_str().to_string()));
        }
        if let Some(operator) = captures.get(8) {
            return Ok(Token::Operator(operator.as_str().to_string()));
        }

        Err(ExprError::Parse {
            position: self.position(),
            message: format!("syntax error: \"{rest}\""),
        })
    }

    fn parse_timestamp(&self, text: &str) -> Result<NaiveDateTime, ExprError> {
        if DATE_MIN_RE.is_match(text) {
            return Ok(NaiveDateTime::MIN);
        }
        if DATE_MAX_RE.is_match(text) {
            return Ok(NaiveDateTime::MAX);
        }

        if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            return Ok(date.and_hms_opt(0, 0, 0).expect("midnight"));
        }
        for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(timestamp) = NaiveDateTime::parse_from_str(text, format) {
                return Ok(timestamp);
            }
        }

        Err(ExprError::Parse {
            position: self.position(),
            message: format!("invalid timestamp: \"{text}\""),
        })
    }
}

fn skip_whitespace(text: &str, mut start: usize) -> usize {
    while let Some(c) = text[start..].chars().next() {
        if !c.is_whitespace() {
            break;
        }
        start += c.len_utf8();
    }
    start
}

fn char_position(text: &str, byte_offset: usize) -> usize {
    text[..byte_offset].chars().count() + 1
}

fn quoted_list(values: &[&str]) -> String {
    let strings: Vec<String> = values.iter().map(|value| format!("\"{value}\"")).collect();
    one_of(&strings)
}

fn one_of(strings: &[String]) -> String {
    if strings.len() == 1 {
        strings[0].clone()
    } else {
        format!("one of: {}", strings.join(", "))
    }
}

/// Unescape a quoted text literal. Recognized two-character escapes:
/// `\\ \' \" \a \b \f \n \r \t \v`; any other backslash sequence passes
/// through untouched.
pub fn string_unescape(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => result.push('\\'),
            Some('\'') => result.push('\''),
            Some('"') => result.push('"'),
            Some('a') => result.push('\x07'),
            Some('b') => result.push('\x08'),
            Some('f') => result.push('\x0c'),
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some('v') => result.push('\x0b'),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn lex_kinds(text: &str) -> Result<Vec<TokenKind>, ExprError> {
        let mut stream = TokenStream::new(text)?;
        let mut kinds = Vec::new();
        while !stream.test(TokenKind::End) {
            kinds.push(stream.token().kind());
            stream.advance()?;
        }
        Ok(kinds)
    }

    #[test]
    fn booleans_never_lex_as_names() {
        let kinds = lex_kinds("true and false").unwrap();
        assert_eq!(
            kinds,
            vec![TokenKind::Boolean, TokenKind::Name, TokenKind::Boolean]
        );
    }

    #[test]
    fn sentinel_timestamps_map_to_extremes() {
        let mut stream = TokenStream::new("0000-00-00").unwrap();
        assert_eq!(stream.token(), &Token::Timestamp(NaiveDateTime::MIN));
        stream = TokenStream::new("9999-99-99T99:99:99.999999").unwrap();
        assert_eq!(stream.token(), &Token::Timestamp(NaiveDateTime::MAX));
    }

    #[test]
    fn timestamp_wins_over_arithmetic_reading() {
        let kinds = lex_kinds("2010-01-01T00:00:00.5").unwrap();
        assert_eq!(kinds, vec![TokenKind::Timestamp]);
    }

    #[test]
    fn uuid_literal() {
        let mut stream = TokenStream::new("32a61528-a712-427a-b28f-8ebd5cd6b4f5").unwrap();
        assert_eq!(stream.token().kind(), TokenKind::Uuid);
        stream.advance().unwrap();
        assert!(stream.test(TokenKind::End));
    }

    #[test]
    fn real_requires_fraction_or_exponent() {
        assert_eq!(lex_kinds("1.5").unwrap(), vec![TokenKind::Real]);
        assert_eq!(lex_kinds("1e3").unwrap(), vec![TokenKind::Real]);
        assert_eq!(lex_kinds("15").unwrap(), vec![TokenKind::Integer]);
    }

    #[test]
    fn text_escapes() {
        let mut stream = TokenStream::new(r#""a\"b\n\q""#).unwrap();
        assert_eq!(stream.token(), &Token::Text("a\"b\n\\q".to_string()));
    }

    #[test]
    fn unknown_input_reports_position() {
        let err = TokenStream::new("size == %").unwrap_err();
        assert_eq!(err.to_string(), "char 9: syntax error: \"%\"");
    }

    #[test]
    fn reading_past_end_is_an_error() {
        let mut stream = TokenStream::new("1").unwrap();
        stream.advance().unwrap();
        assert!(stream.test(TokenKind::End));
        let err = stream.advance().unwrap_err();
        assert!(err.to_string().contains("unexpected end of input"));
    }

    #[test]
    fn empty_input_is_unexpected_end() {
        let err = TokenStream::new("").unwrap_err();
        assert_eq!(err.to_string(), "char 1: unexpected end of input");
    }

    proptest! {
        #[test]
        fn names_and_integers_roundtrip(name in "[a-zA-Z][a-zA-Z0-9_]{0,10}", value in 0i64..1_000_000) {
            prop_assume!(name != "true" && name != "false");
            let text = format!("{name} {value}");
            let kinds = lex_kinds(&text).unwrap();
            prop_assert_eq!(kinds, vec![TokenKind::Name, TokenKind::Integer]);
        }

        #[test]
        fn whitespace_between_tokens_is_insignificant(padding in " {0,5}") {
            let text = format!("size{padding}=={padding}10");
            let kinds = lex_kinds(&text).unwrap();
            prop_assert_eq!(kinds, vec![TokenKind::Name, TokenKind::Operator, TokenKind::Integer]);
        }
    }
}
