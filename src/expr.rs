//! Conditional expression evaluator for `RunIf`
//!
//! A small, safely-scoped expression language over the deployment context,
//! replacing the source's dynamic `hasVar`-style conditionals with an
//! explicit tagged AST. The evaluator performs no I/O and touches no host
//! state; any parse or evaluation error degrades to `false` with a warning
//! rather than aborting the pipeline.

use crate::models::DeploymentContext;

/// A parsed `RunIf` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A bare context variable reference; resolves to its string value when
    /// evaluated as an operand, or to "non-empty" truthiness as a bare
    /// boolean.
    Var(String),
    /// `hasVar("name")`.
    HasVar(String),
    /// `left == right`, where each side is a [`Expr::Var`] or [`Expr::Lit`].
    Eq(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// A quoted string literal.
    Lit(String),
}

#[derive(Debug, PartialEq)]
pub struct ParseError(pub String);

/// Parse a `RunIf` source string into an [`Expr`].
///
/// Grammar (lowest to highest precedence): `or-expr := and-expr ("||" and-expr)*`,
/// `and-expr := unary ("&&" unary)*`, `unary := "!" unary | atom`,
/// `atom := "hasVar(" STRING ")" | STRING "==" STRING | STRING | "(" or-expr ")"`.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut pos = 0;
    let expr = parse_or(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(ParseError(format!("unexpected trailing token at position {pos}")));
    }
    Ok(expr)
}

/// Evaluate `source` against `context`, degrading to `false` with the
/// stringified parse/eval error on any failure — never panicking, never
/// touching I/O.
pub fn eval_str(source: &str, context: &DeploymentContext) -> bool {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return true;
    }
    match parse(trimmed) {
        Ok(expr) => eval(&expr, context),
        Err(e) => {
            tracing::warn!(run_if = %source, error = %e.0, "failed to parse RunIf expression, skipping step as false");
            false
        }
    }
}

/// Evaluate a parsed [`Expr`] as a boolean.
pub fn eval(expr: &Expr, context: &DeploymentContext) -> bool {
    match expr {
        Expr::Var(name) => context.has_var(name),
        Expr::HasVar(name) => context.has_var(name),
        Expr::Lit(s) => !s.is_empty(),
        Expr::Eq(left, right) => resolve(left, context) == resolve(right, context),
        Expr::And(left, right) => eval(left, context) && eval(right, context),
        Expr::Or(left, right) => eval(left, context) || eval(right, context),
        Expr::Not(inner) => !eval(inner, context),
    }
}

/// Resolve an operand to its string value: a variable reference resolves to
/// its context value when present, else the literal text "{{name}}" is not
/// applicable here — bare identifiers in `==` comparisons resolve to their
/// value or, if absent, to the identifier text itself.
fn resolve(expr: &Expr, context: &DeploymentContext) -> String {
    match expr {
        Expr::Var(name) => context.get(name).map(str::to_string).unwrap_or_else(|| name.clone()),
        Expr::Lit(s) => s.clone(),
        other => eval(other, context).to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    And,
    Or,
    Not,
    EqEq,
    HasVar,
    LParen,
    RParen,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    return Err(ParseError("unsupported operator '!='".to_string()));
                }
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err(ParseError("unterminated string literal".to_string()));
                }
                tokens.push(Token::Str(s));
            }
            _ if c.is_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word == "hasVar" {
                    tokens.push(Token::HasVar);
                } else {
                    tokens.push(Token::Ident(word));
                }
            }
            other => return Err(ParseError(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Expr, ParseError> {
    let mut left = parse_and(tokens, pos)?;
    while matches!(tokens.get(*pos), Some(Token::Or)) {
        *pos += 1;
        let right = parse_and(tokens, pos)?;
        left = Expr::Or(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Expr, ParseError> {
    let mut left = parse_unary(tokens, pos)?;
    while matches!(tokens.get(*pos), Some(Token::And)) {
        *pos += 1;
        let right = parse_unary(tokens, pos)?;
        left = Expr::And(Box::new(left), Box::new(right));
    }
    Ok(left)
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Expr, ParseError> {
    if matches!(tokens.get(*pos), Some(Token::Not)) {
        *pos += 1;
        let inner = parse_unary(tokens, pos)?;
        return Ok(Expr::Not(Box::new(inner)));
    }
    parse_atom(tokens, pos)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, ParseError> {
    match tokens.get(*pos) {
        Some(Token::LParen) => {
            *pos += 1;
            let inner = parse_or(tokens, pos)?;
            match tokens.get(*pos) {
                Some(Token::RParen) => {
                    *pos += 1;
                    Ok(inner)
                }
                _ => Err(ParseError("expected closing ')'".to_string())),
            }
        }
        Some(Token::HasVar) => {
            *pos += 1;
            match tokens.get(*pos) {
                Some(Token::LParen) => *pos += 1,
                _ => return Err(ParseError("expected '(' after hasVar".to_string())),
            }
            let name = match tokens.get(*pos) {
                Some(Token::Str(s)) => s.clone(),
                Some(Token::Ident(s)) => s.clone(),
                _ => return Err(ParseError("expected variable name in hasVar(...)".to_string())),
            };
            *pos += 1;
            match tokens.get(*pos) {
                Some(Token::RParen) => *pos += 1,
                _ => return Err(ParseError("expected ')' after hasVar argument".to_string())),
            }
            Ok(Expr::HasVar(name))
        }
        Some(Token::Str(s)) => {
            *pos += 1;
            parse_maybe_eq(tokens, pos, Expr::Lit(s.clone()))
        }
        Some(Token::Ident(name)) => {
            *pos += 1;
            parse_maybe_eq(tokens, pos, Expr::Var(name.clone()))
        }
        other => Err(ParseError(format!("unexpected token: {other:?}"))),
    }
}

fn parse_maybe_eq(tokens: &[Token], pos: &mut usize, left: Expr) -> Result<Expr, ParseError> {
    if matches!(tokens.get(*pos), Some(Token::EqEq)) {
        *pos += 1;
        let right = match tokens.get(*pos) {
            Some(Token::Str(s)) => Expr::Lit(s.clone()),
            Some(Token::Ident(s)) => Expr::Var(s.clone()),
            other => return Err(ParseError(format!("expected operand after '==', found {other:?}"))),
        };
        *pos += 1;
        return Ok(Expr::Eq(Box::new(left), Box::new(right)));
    }
    Ok(left)
}
