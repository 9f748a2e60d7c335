//! Expression grammar
//!
//! Nom-based recursive-descent parser producing an [`Expr`] tree. Nothing here
//! executes code: the tree is evaluated by [`super::eval`] against the
//! variable map only.
//!
//! ```text
//! expr        := or
//! or          := and (("||" | "or") and)*
//! and         := equality (("&&" | "and") equality)*
//! equality    := comparison (("===" | "==" | "!==" | "!=") comparison)*
//! comparison  := additive (("<=" | ">=" | "<" | ">") additive)*
//! additive    := multiplicative (("+" | "-") multiplicative)*
//! multiplicative := unary (("*" | "/" | "%") unary)*
//! unary       := ("!" | "not" | "-") unary | primary
//! primary     := number | string | true | false | null
//!              | "${" expr "}" | "(" expr ")" | path
//! path        := ident ("." (ident | digits))*
//! ```

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, tag},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, none_of, one_of, satisfy},
    combinator::{all_consuming, cut, map, map_res, not, opt, recognize, value},
    error::{context, VerboseError},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde_json::{Number, Value};

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted variable path, one entry per segment.
    Path(Vec<String>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    }

    /// Collect every variable path referenced by this tree, in source order.
    pub fn collect_paths(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(segments) => {
                let joined = segments.join(".");
                if !out.contains(&joined) {
                    out.push(joined);
                }
            }
            Expr::Unary(_, inner) => inner.collect_paths(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

/// Parse a complete expression. Errors carry a readable nom trace.
pub fn parse_expression(input: &str) -> Result<Expr, String> {
    match all_consuming(ws(expr))(input) {
        Ok((_, e)) => Ok(e),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(nom::error::convert_error(input, e))
        }
        Err(nom::Err::Incomplete(_)) => Err("Incomplete input".to_string()),
    }
}

// ============================================================================
// Lexical helpers
// ============================================================================

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> Res<'a, O>
where
    F: FnMut(&'a str) -> Res<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// A word that must not run on into an identifier (`or` but not `order`).
fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    terminated(tag(kw), not(satisfy(is_ident_char)))
}

fn identifier(input: &str) -> Res<&str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

// ============================================================================
// Precedence levels
// ============================================================================

fn expr(input: &str) -> Res<Expr> {
    or_expr(input)
}

/// Left-associative fold of `operand (op operand)*`.
fn binary_level<'a>(
    input: &'a str,
    operand: fn(&'a str) -> Res<'a, Expr>,
    op: fn(&'a str) -> Res<'a, BinaryOp>,
) -> Res<'a, Expr> {
    let (mut input, mut lhs) = operand(input)?;
    loop {
        match ws(op)(input) {
            Ok((rest, bin_op)) => {
                let (rest, rhs) = cut(context("right-hand operand", operand))(rest)?;
                lhs = Expr::binary(bin_op, lhs, rhs);
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn or_expr(input: &str) -> Res<Expr> {
    binary_level(input, and_expr, |i| {
        value(BinaryOp::Or, alt((tag("||"), keyword("or"))))(i)
    })
}

fn and_expr(input: &str) -> Res<Expr> {
    binary_level(input, equality, |i| {
        value(BinaryOp::And, alt((tag("&&"), keyword("and"))))(i)
    })
}

fn equality(input: &str) -> Res<Expr> {
    binary_level(input, comparison, |i| {
        alt((
            value(BinaryOp::Eq, alt((tag("==="), tag("==")))),
            value(BinaryOp::Ne, alt((tag("!=="), tag("!=")))),
        ))(i)
    })
}

fn comparison(input: &str) -> Res<Expr> {
    binary_level(input, additive, |i| {
        alt((
            value(BinaryOp::Le, tag("<=")),
            value(BinaryOp::Ge, tag(">=")),
            value(BinaryOp::Lt, tag("<")),
            value(BinaryOp::Gt, tag(">")),
        ))(i)
    })
}

fn additive(input: &str) -> Res<Expr> {
    binary_level(input, multiplicative, |i| {
        alt((value(BinaryOp::Add, char('+')), value(BinaryOp::Sub, char('-'))))(i)
    })
}

fn multiplicative(input: &str) -> Res<Expr> {
    binary_level(input, unary, |i| {
        alt((
            value(BinaryOp::Mul, char('*')),
            value(BinaryOp::Div, char('/')),
            value(BinaryOp::Mod, char('%')),
        ))(i)
    })
}

fn unary(input: &str) -> Res<Expr> {
    let (input, _) = multispace0(input)?;
    alt((
        map(
            preceded(alt((terminated(tag("!"), not(char('='))), keyword("not"))), unary),
            |e| Expr::Unary(UnaryOp::Not, Box::new(e)),
        ),
        map(preceded(char('-'), unary), |e| {
            Expr::Unary(UnaryOp::Neg, Box::new(e))
        }),
        primary,
    ))(input)
}

// ============================================================================
// Primaries
// ============================================================================

fn primary(input: &str) -> Res<Expr> {
    ws(alt((
        map(number, Expr::Literal),
        map(string_literal, |s| Expr::Literal(Value::String(s))),
        value(Expr::Literal(Value::Bool(true)), keyword("true")),
        value(Expr::Literal(Value::Bool(false)), keyword("false")),
        value(Expr::Literal(Value::Null), keyword("null")),
        reference,
        group,
        path,
    )))(input)
}

/// `${ ... }` — either a plain path or a whole embedded expression.
fn reference(input: &str) -> Res<Expr> {
    preceded(
        tag("${"),
        cut(terminated(ws(expr), context("closing brace", char('}')))),
    )(input)
}

fn group(input: &str) -> Res<Expr> {
    preceded(
        char('('),
        cut(terminated(ws(expr), context("closing parenthesis", char(')')))),
    )(input)
}

fn path(input: &str) -> Res<Expr> {
    map(
        pair(identifier, many0(preceded(char('.'), alt((identifier, digit1))))),
        |(head, rest)| {
            let mut segments = Vec::with_capacity(rest.len() + 1);
            segments.push(head.to_string());
            segments.extend(rest.into_iter().map(str::to_string));
            Expr::Path(segments)
        },
    )(input)
}

fn number(input: &str) -> Res<Value> {
    map_res(
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit1)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |text: &str| -> Result<Value, String> {
            if !text.contains(['.', 'e', 'E']) {
                if let Ok(n) = text.parse::<i64>() {
                    return Ok(Value::Number(n.into()));
                }
            }
            let f: f64 = text.parse().map_err(|e| format!("{e}"))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| format!("non-finite number: {text}"))
        },
    )(input)
}

fn string_literal(input: &str) -> Res<String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> Res<'a, String> {
    let stop: &'static str = if quote == '"' { "\\\"" } else { "\\'" };
    move |input: &'a str| {
        delimited(
            char(quote),
            map(
                opt(escaped_transform(
                    none_of(stop),
                    '\\',
                    alt((
                        value("\\", tag("\\")),
                        value("\"", tag("\"")),
                        value("'", tag("'")),
                        value("\n", tag("n")),
                        value("\t", tag("t")),
                    )),
                )),
                Option::unwrap_or_default,
            ),
            cut(context("closing quote", char(quote))),
        )(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn path(p: &str) -> Expr {
        Expr::Path(p.split('.').map(str::to_string).collect())
    }

    #[test]
    fn parses_reference_and_comparison() {
        let e = parse_expression("${order.amount} > 100").unwrap();
        assert_eq!(
            e,
            Expr::binary(
                BinaryOp::Gt,
                path("order.amount"),
                Expr::Literal(Value::Number(100.into()))
            )
        );
    }

    #[test]
    fn precedence_and_binds_tighter_than_or() {
        let e = parse_expression("a || b && c").unwrap();
        assert_eq!(
            e,
            Expr::binary(
                BinaryOp::Or,
                path("a"),
                Expr::binary(BinaryOp::And, path("b"), path("c"))
            )
        );
    }

    #[test]
    fn arithmetic_is_left_associative() {
        let e = parse_expression("10 - 4 - 3").unwrap();
        assert_eq!(
            e,
            Expr::binary(
                BinaryOp::Sub,
                Expr::binary(
                    BinaryOp::Sub,
                    Expr::Literal(Value::Number(10.into())),
                    Expr::Literal(Value::Number(4.into()))
                ),
                Expr::Literal(Value::Number(3.into()))
            )
        );
    }

    #[test]
    fn keywords_do_not_swallow_identifiers() {
        let e = parse_expression("order and notes").unwrap();
        assert_eq!(e, Expr::binary(BinaryOp::And, path("order"), path("notes")));
    }

    #[test]
    fn juel_style_wrapped_expression() {
        let e = parse_expression("${approved == true}").unwrap();
        assert_eq!(
            e,
            Expr::binary(BinaryOp::Eq, path("approved"), Expr::Literal(Value::Bool(true)))
        );
    }

    #[test]
    fn string_literals_with_escapes() {
        let e = parse_expression(r#"status == 'it\'s' || s == "" "#).unwrap();
        let mut paths = Vec::new();
        e.collect_paths(&mut paths);
        assert_eq!(paths, vec!["status".to_string(), "s".to_string()]);
    }

    #[test]
    fn not_and_negation() {
        assert_eq!(
            parse_expression("!done").unwrap(),
            Expr::Unary(UnaryOp::Not, Box::new(path("done")))
        );
        assert_eq!(
            parse_expression("-x").unwrap(),
            Expr::Unary(UnaryOp::Neg, Box::new(path("x")))
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_expression("a >").is_err());
        assert!(parse_expression("(a").is_err());
        assert!(parse_expression("${a").is_err());
        assert!(parse_expression("a b").is_err());
        assert!(parse_expression("process.exit()").is_err());
    }

    #[test]
    fn numeric_literals() {
        assert_eq!(
            parse_expression("1.5").unwrap(),
            Expr::Literal(serde_json::json!(1.5))
        );
        assert_eq!(
            parse_expression("2e3").unwrap(),
            Expr::Literal(serde_json::json!(2000.0))
        );
    }
}
