//! Arithmetic expressions for calculated measures, e.g.
//! `{total_amount} / {order_count} * 100`.
//!
//! Grammar:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/' | '%') unary)*
//! unary   := '-' unary | primary
//! primary := number | '{' name '}' | '(' expr ')'
//! ```
//!
//! Nothing else is accepted, so an expression can never reach the host
//! language or the database.

use crate::error::{LumenError, Result};

const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CalcExpr {
    Number(f64),
    Variable(String),
    Neg(Box<CalcExpr>),
    Binary {
        op: ArithOp,
        left: Box<CalcExpr>,
        right: Box<CalcExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Variable(String),
    Op(char),
    LParen,
    RParen,
}

impl CalcExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(invalid(input, "unexpected trailing input"));
        }
        Ok(expr)
    }

    /// Evaluate with `lookup` resolving variables. `None` means the value is
    /// unknown or not numeric; division by zero yields a non-finite float.
    pub fn eval<F>(&self, lookup: &F) -> Option<f64>
    where
        F: Fn(&str) -> Option<f64>,
    {
        match self {
            CalcExpr::Number(n) => Some(*n),
            CalcExpr::Variable(name) => lookup(name),
            CalcExpr::Neg(inner) => inner.eval(lookup).map(|v| -v),
            CalcExpr::Binary { op, left, right } => {
                let l = left.eval(lookup)?;
                let r = right.eval(lookup)?;
                Some(match op {
                    ArithOp::Add => l + r,
                    ArithOp::Sub => l - r,
                    ArithOp::Mul => l * r,
                    ArithOp::Div => l / r,
                    ArithOp::Rem => l % r,
                })
            }
        }
    }

    /// Variables referenced, in order of first appearance.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            CalcExpr::Number(_) => {}
            CalcExpr::Variable(name) => {
                if !out.contains(&name.as_str()) {
                    out.push(name);
                }
            }
            CalcExpr::Neg(inner) => inner.collect_variables(out),
            CalcExpr::Binary { left, right, .. } => {
                left.collect_variables(out);
                right.collect_variables(out);
            }
        }
    }
}

fn invalid(input: &str, reason: &str) -> LumenError {
    LumenError::Validation(format!("invalid calculated expression '{input}': {reason}"))
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' | '-' | '*' | '/' | '%' => {
                tokens.push(Token::Op(c));
                chars.next();
            }
            '(' => {
                tokens.push(Token::LParen);
                chars.next();
            }
            ')' => {
                tokens.push(Token::RParen);
                chars.next();
            }
            '{' => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                let name = name.trim();
                if !closed || name.is_empty() {
                    return Err(invalid(input, "malformed variable reference"));
                }
                tokens.push(Token::Variable(name.to_string()));
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let literal = &input[start..end];
                let n = literal
                    .parse::<f64>()
                    .map_err(|_| invalid(input, &format!("bad number '{literal}'")))?;
                tokens.push(Token::Number(n));
            }
            other => {
                return Err(invalid(input, &format!("unexpected character '{other}'")));
            }
        }
    }
    if tokens.is_empty() {
        return Err(invalid(input, "empty expression"));
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn error(&self, reason: &str) -> LumenError {
        LumenError::Validation(format!(
            "invalid calculated expression: {reason} at token {}",
            self.pos
        ))
    }

    fn expr(&mut self) -> Result<CalcExpr> {
        let mut left = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { ArithOp::Add } else { ArithOp::Sub };
            self.pos += 1;
            let right = self.term()?;
            left = CalcExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<CalcExpr> {
        let mut left = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/' | '%'))) = self.peek() {
            let op = match c {
                '*' => ArithOp::Mul,
                '/' => ArithOp::Div,
                _ => ArithOp::Rem,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = CalcExpr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<CalcExpr> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Ok(CalcExpr::Neg(Box::new(inner)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<CalcExpr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(CalcExpr::Number(n)),
            Some(Token::Variable(name)) => Ok(CalcExpr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.nested(Self::expr)?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(_) => Err(self.error("unexpected token")),
            None => Err(self.error("unexpected end of expression")),
        }
    }

    fn nested(&mut self, f: fn(&mut Self) -> Result<CalcExpr>) -> Result<CalcExpr> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        let out = f(self);
        self.depth -= 1;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(input: &str, vars: &[(&str, f64)]) -> Option<f64> {
        let expr = CalcExpr::parse(input).unwrap();
        expr.eval(&|name: &str| vars.iter().find(|(k, _)| *k == name).map(|(_, v)| *v))
    }

    #[test]
    fn respects_precedence_and_parentheses() {
        assert_eq!(eval("1 + 2 * 3", &[]), Some(7.0));
        assert_eq!(eval("(1 + 2) * 3", &[]), Some(9.0));
        assert_eq!(eval("10 % 4 - -2", &[]), Some(4.0));
        assert_eq!(eval("-(2 + 3)", &[]), Some(-5.0));
    }

    #[test]
    fn resolves_variables() {
        let v = eval(
            "{total_amount} / {order_count}",
            &[("total_amount", 1000.0), ("order_count", 4.0)],
        );
        assert_eq!(v, Some(250.0));
        assert_eq!(eval("{missing} + 1", &[]), None);
    }

    #[test]
    fn zero_denominator_is_not_finite() {
        let v = eval(
            "{total_amount} / {order_count}",
            &[("total_amount", 1000.0), ("order_count", 0.0)],
        )
        .unwrap();
        assert!(!v.is_finite());
    }

    #[test]
    fn rejects_anything_outside_the_grammar() {
        for bad in [
            "",
            "1 +",
            "(1 + 2",
            "{a} {b}",
            "{unclosed",
            "{}",
            "process.exit(1)",
            "1; DROP TABLE x",
            "2 ** 3",
        ] {
            assert!(CalcExpr::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn caps_nesting_depth() {
        let deep = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert!(CalcExpr::parse(&deep).is_err());
        let negs = format!("{}1", "-".repeat(100));
        assert!(CalcExpr::parse(&negs).is_err());
    }

    #[test]
    fn lists_variables_once() {
        let expr = CalcExpr::parse("{a} + {b} * {a}").unwrap();
        assert_eq!(expr.variables(), vec!["a", "b"]);
    }
}
