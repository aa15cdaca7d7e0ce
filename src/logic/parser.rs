// Block script parser.
//
// Recursive descent over `&str` built from nom combinators. Whitespace and
// `//` / `/* */` comments are skipped before every token, so the individual
// parsers never see leading blanks.
//
// Scripts are untrusted, so recursion is bounded: expressions, blocks,
// prefix operators and `else if` arms share one nesting limit, and a single
// precedence level accepts a bounded number of chained operators.

use std::cell::Cell;

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_until, take_while},
    character::complete::{alpha1, alphanumeric1, char, digit0, digit1, multispace1, one_of, satisfy},
    combinator::{cut, map, not, opt, recognize, value, verify},
    error::{Error, ErrorKind},
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
};

use super::ast::{AssignTarget, BinaryOp, Expr, Program, Stmt, UnaryOp};
use crate::error::LogicError;

const KEYWORDS: &[&str] = &[
    "let", "const", "var", "if", "else", "while", "return", "throw", "true", "false", "null",
];

/// Deepest nesting of expressions, blocks and prefix operators.
pub const MAX_NESTING: usize = 48;

/// Most operators chained at one precedence level (`a + b + ...`).
pub const MAX_CHAIN: usize = 64;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Run `parser` one nesting level deeper, failing past `MAX_NESTING`.
fn nested<'a, O>(
    input: &'a str,
    parser: impl FnOnce(&'a str) -> IResult<&'a str, O>,
) -> IResult<&'a str, O> {
    let depth = DEPTH.with(|d| {
        d.set(d.get() + 1);
        d.get()
    });
    let result = if depth > MAX_NESTING {
        Err(nom::Err::Failure(Error::new(input, ErrorKind::TooLarge)))
    } else {
        parser(input)
    };
    DEPTH.with(|d| d.set(d.get() - 1));
    result
}

/// Parse a complete logic body.
pub fn parse_program(source: &str) -> Result<Program, LogicError> {
    match terminated(many0(statement), sp)(source) {
        Ok(("", body)) => Ok(Program { body }),
        Ok((rest, _)) => Err(parse_error(source, rest, "unexpected input")),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => {
            let message = match e.code {
                ErrorKind::TooLarge => "nesting too deep",
                ErrorKind::Count => "too many chained operators",
                _ => "invalid syntax",
            };
            Err(parse_error(source, e.input, message))
        }
        Err(nom::Err::Incomplete(_)) => Err(parse_error(source, "", "unexpected end of input")),
    }
}

fn parse_error(source: &str, rest: &str, message: &str) -> LogicError {
    let rest = rest.trim_start();
    let offset = source.len() - rest.len();
    let consumed = &source[..offset];
    let line = consumed.matches('\n').count() + 1;
    let column = offset - consumed.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
    let near: String = rest.chars().take(16).collect();

    LogicError::Parse {
        line,
        column,
        message: if near.is_empty() {
            format!("{} at end of input", message)
        } else {
            format!("{} near '{}'", message, near)
        },
    }
}

// ═══════════════════════════════════════════════════════════════════
// Tokens
// ═══════════════════════════════════════════════════════════════════

/// Skip whitespace and comments.
fn sp(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), pair(tag("//"), take_while(|c: char| c != '\n'))),
            value((), tuple((tag("/*"), take_until("*/"), tag("*/")))),
        ))),
    )(input)
}

fn symbol<'a>(s: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    preceded(sp, tag(s))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    preceded(sp, terminated(tag(kw), not(satisfy(is_ident_char))))
}

/// Identifier including reserved words (member names, map keys).
fn raw_identifier(input: &str) -> IResult<&str, String> {
    map(
        preceded(
            sp,
            recognize(pair(
                alt((alpha1, tag("_"))),
                many0(alt((alphanumeric1, tag("_")))),
            )),
        ),
        |s: &str| s.to_string(),
    )(input)
}

fn identifier(input: &str) -> IResult<&str, String> {
    verify(raw_identifier, |name: &str| !KEYWORDS.contains(&name))(input)
}

fn number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = preceded(
        sp,
        recognize(tuple((
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
    )(input)?;

    match text.parse::<f64>() {
        Ok(n) => Ok((rest, Expr::Number(n))),
        Err(_) => Err(nom::Err::Error(Error::new(input, ErrorKind::Float))),
    }
}

/// Single- or double-quoted string with backslash escapes.
fn string_lit(input: &str) -> IResult<&str, String> {
    let (input, _) = sp(input)?;
    let mut chars = input.char_indices();
    let quote = match chars.next() {
        Some((_, q @ ('"' | '\''))) => q,
        _ => return Err(nom::Err::Error(Error::new(input, ErrorKind::Char))),
    };

    let mut out = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            out.push(match c {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '0' => '\0',
                other => other,
            });
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Ok((&input[i + c.len_utf8()..], out));
        } else {
            out.push(c);
        }
    }

    // Unterminated string: nothing after this point can parse
    Err(nom::Err::Failure(Error::new(input, ErrorKind::Char)))
}

// ═══════════════════════════════════════════════════════════════════
// Expressions
// ═══════════════════════════════════════════════════════════════════

fn expression(input: &str) -> IResult<&str, Expr> {
    nested(input, ternary)
}

fn list_lit(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            symbol("["),
            separated_list0(symbol(","), expression),
            pair(opt(symbol(",")), cut(symbol("]"))),
        ),
        Expr::List,
    )(input)
}

fn map_entry(input: &str) -> IResult<&str, (String, Expr)> {
    let (input, key) = alt((raw_identifier, string_lit))(input)?;
    let (input, _) = cut(symbol(":"))(input)?;
    let (input, value) = cut(expression)(input)?;
    Ok((input, (key, value)))
}

fn map_lit(input: &str) -> IResult<&str, Expr> {
    map(
        delimited(
            symbol("{"),
            separated_list0(symbol(","), map_entry),
            pair(opt(symbol(",")), cut(symbol("}"))),
        ),
        Expr::Map,
    )(input)
}

fn call_or_ident(input: &str) -> IResult<&str, Expr> {
    let (input, name) = identifier(input)?;
    match symbol("(")(input) {
        Ok((rest, _)) => {
            let (rest, args) = separated_list0(symbol(","), expression)(rest)?;
            let (rest, _) = cut(symbol(")"))(rest)?;
            Ok((rest, Expr::Call(name, args)))
        }
        Err(_) => Ok((input, Expr::Ident(name))),
    }
}

fn primary(input: &str) -> IResult<&str, Expr> {
    alt((
        number,
        map(string_lit, Expr::Str),
        value(Expr::Bool(true), keyword("true")),
        value(Expr::Bool(false), keyword("false")),
        value(Expr::Null, keyword("null")),
        list_lit,
        map_lit,
        call_or_ident,
        delimited(symbol("("), expression, cut(symbol(")"))),
    ))(input)
}

fn postfix(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut expr) = primary(input)?;
    loop {
        match preceded(symbol("."), cut(raw_identifier))(input) {
            Ok((rest, name)) => {
                expr = Expr::Member(Box::new(expr), name);
                input = rest;
                continue;
            }
            Err(nom::Err::Error(_)) => {}
            Err(e) => return Err(e),
        }
        match delimited(symbol("["), cut(expression), cut(symbol("]")))(input) {
            Ok((rest, index)) => {
                expr = Expr::Index(Box::new(expr), Box::new(index));
                input = rest;
                continue;
            }
            Err(nom::Err::Error(_)) => {}
            Err(e) => return Err(e),
        }
        break;
    }
    Ok((input, expr))
}

fn unary(input: &str) -> IResult<&str, Expr> {
    let (input, _) = sp(input)?;
    let op = match input.chars().next() {
        Some('-') => UnaryOp::Neg,
        Some('!') => UnaryOp::Not,
        _ => return postfix(input),
    };
    let (rest, operand) = nested(&input[1..], cut(unary))?;
    Ok((rest, Expr::Unary(op, Box::new(operand))))
}

/// Whether `sym` starts `input` as a whole operator, so that `<` does not
/// match the start of `<=` and `+` does not match `+=`.
fn operator_at(input: &str, sym: &str) -> bool {
    let Some(rest) = input.strip_prefix(sym) else {
        return false;
    };
    match sym {
        "<" | ">" | "+" | "-" | "*" | "/" | "%" => !rest.starts_with('='),
        "?" => !rest.starts_with('?'),
        "??" => !rest.starts_with('='),
        _ => true,
    }
}

/// One left-associative precedence level.
fn binary_level<'a>(
    input: &'a str,
    next: fn(&'a str) -> IResult<&'a str, Expr>,
    ops: &[(&'static str, BinaryOp)],
) -> IResult<&'a str, Expr> {
    let (mut input, mut lhs) = next(input)?;
    let mut chained = 0;
    loop {
        let (rest, _) = sp(input)?;
        let Some(&(sym, op)) = ops.iter().find(|(sym, _)| operator_at(rest, sym)) else {
            break;
        };
        chained += 1;
        if chained > MAX_CHAIN {
            return Err(nom::Err::Failure(Error::new(rest, ErrorKind::Count)));
        }
        let (rest, rhs) = cut(next)(&rest[sym.len()..])?;
        lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        input = rest;
    }
    Ok((input, lhs))
}

fn multiplicative(input: &str) -> IResult<&str, Expr> {
    binary_level(
        input,
        unary,
        &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
    )
}

fn additive(input: &str) -> IResult<&str, Expr> {
    binary_level(
        input,
        multiplicative,
        &[("+", BinaryOp::Add), ("-", BinaryOp::Sub)],
    )
}

fn comparison(input: &str) -> IResult<&str, Expr> {
    binary_level(
        input,
        additive,
        &[
            ("<=", BinaryOp::Le),
            (">=", BinaryOp::Ge),
            ("<", BinaryOp::Lt),
            (">", BinaryOp::Gt),
        ],
    )
}

fn equality(input: &str) -> IResult<&str, Expr> {
    binary_level(
        input,
        comparison,
        &[
            ("===", BinaryOp::Eq),
            ("!==", BinaryOp::Ne),
            ("==", BinaryOp::Eq),
            ("!=", BinaryOp::Ne),
        ],
    )
}

fn logical_and(input: &str) -> IResult<&str, Expr> {
    binary_level(input, equality, &[("&&", BinaryOp::And)])
}

fn logical_or(input: &str) -> IResult<&str, Expr> {
    binary_level(input, logical_and, &[("||", BinaryOp::Or)])
}

fn coalesce(input: &str) -> IResult<&str, Expr> {
    binary_level(input, logical_or, &[("??", BinaryOp::Coalesce)])
}

fn ternary(input: &str) -> IResult<&str, Expr> {
    let (input, cond) = coalesce(input)?;
    let (rest, _) = sp(input)?;
    if !operator_at(rest, "?") {
        return Ok((input, cond));
    }
    let (rest, then) = cut(expression)(&rest[1..])?;
    let (rest, _) = cut(symbol(":"))(rest)?;
    let (rest, otherwise) = cut(expression)(rest)?;
    Ok((
        rest,
        Expr::Ternary(Box::new(cond), Box::new(then), Box::new(otherwise)),
    ))
}

// ═══════════════════════════════════════════════════════════════════
// Statements
// ═══════════════════════════════════════════════════════════════════

/// Optional statement terminator.
fn end(input: &str) -> IResult<&str, ()> {
    value((), opt(symbol(";")))(input)
}

fn block(input: &str) -> IResult<&str, Vec<Stmt>> {
    nested(input, |input| {
        preceded(symbol("{"), cut(terminated(many0(statement), symbol("}"))))(input)
    })
}

fn condition(input: &str) -> IResult<&str, Expr> {
    delimited(symbol("("), cut(expression), cut(symbol(")")))(input)
}

fn let_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, _) = alt((keyword("let"), keyword("const"), keyword("var")))(input)?;
    let (input, name) = cut(identifier)(input)?;
    let (input, _) = cut(symbol("="))(input)?;
    let (input, value) = cut(expression)(input)?;
    let (input, _) = end(input)?;
    Ok((input, Stmt::Let(name, value)))
}

fn if_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, _) = keyword("if")(input)?;
    let (input, cond) = cut(condition)(input)?;
    let (input, then) = cut(block)(input)?;

    let (input, otherwise) = match keyword("else")(input) {
        Ok((rest, _)) => match nested(rest, if_stmt) {
            Ok((rest, arm)) => (rest, vec![arm]),
            Err(nom::Err::Error(_)) => cut(block)(rest)?,
            Err(e) => return Err(e),
        },
        Err(nom::Err::Error(_)) => (input, Vec::new()),
        Err(e) => return Err(e),
    };

    Ok((
        input,
        Stmt::If {
            cond,
            then,
            otherwise,
        },
    ))
}

fn while_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, _) = keyword("while")(input)?;
    let (input, cond) = cut(condition)(input)?;
    let (input, body) = cut(block)(input)?;
    Ok((input, Stmt::While { cond, body }))
}

fn return_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, _) = keyword("return")(input)?;
    let (input, value) = opt(expression)(input)?;
    let (input, _) = end(input)?;
    Ok((input, Stmt::Return(value)))
}

fn throw_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, _) = keyword("throw")(input)?;
    let (input, value) = cut(expression)(input)?;
    let (input, _) = end(input)?;
    Ok((input, Stmt::Throw(value)))
}

fn assign_target(input: &str) -> IResult<&str, AssignTarget> {
    let (input, name) = identifier(input)?;
    if name != "state" {
        return Ok((input, AssignTarget::Local(name)));
    }
    let (input, key) = alt((
        preceded(symbol("."), raw_identifier),
        delimited(symbol("["), string_lit, symbol("]")),
    ))(input)?;
    Ok((input, AssignTarget::State(key)))
}

fn assign_op(input: &str) -> IResult<&str, Option<BinaryOp>> {
    let (input, _) = sp(input)?;
    for (sym, op) in [
        ("+=", BinaryOp::Add),
        ("-=", BinaryOp::Sub),
        ("*=", BinaryOp::Mul),
        ("/=", BinaryOp::Div),
        ("%=", BinaryOp::Rem),
        ("??=", BinaryOp::Coalesce),
    ] {
        if let Some(rest) = input.strip_prefix(sym) {
            return Ok((rest, Some(op)));
        }
    }
    match input.strip_prefix('=') {
        Some(rest) if !rest.starts_with('=') => Ok((rest, None)),
        _ => Err(nom::Err::Error(Error::new(input, ErrorKind::Tag))),
    }
}

fn assign_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, target) = assign_target(input)?;
    let (input, op) = assign_op(input)?;
    let (input, rhs) = cut(expression)(input)?;
    let (input, _) = end(input)?;

    let value = match op {
        Some(op) => Expr::Binary(op, Box::new(target.as_expr()), Box::new(rhs)),
        None => rhs,
    };
    Ok((input, Stmt::Assign(target, value)))
}

fn expr_stmt(input: &str) -> IResult<&str, Stmt> {
    let (input, expr) = expression(input)?;
    let (input, _) = end(input)?;
    Ok((input, Stmt::Expr(expr)))
}

fn statement(input: &str) -> IResult<&str, Stmt> {
    alt((
        let_stmt,
        if_stmt,
        while_stmt,
        return_stmt,
        throw_stmt,
        assign_stmt,
        expr_stmt,
    ))(input)
}
