//! Label expressions.
//!
//! A template offers a set of label atoms (`"linux docker"`). A workload
//! request names a label expression over atoms:
//!
//! ```text
//! expr  := or
//! or    := and ( "||" and )*
//! and   := unary ( "&&" unary )*
//! unary := "!" unary | "(" expr ")" | atom
//! ```
//!
//! The expression matches when it evaluates to true against the atom set.
//! Chains of `&&` and `||` parse flat; `!` and parentheses may nest at most
//! [`MAX_NESTING`] levels deep.

use std::collections::HashSet;

use tracing::warn;

use crate::error::{ConfigError, ConfigResult};

/// Deepest allowed nesting of `!` and parentheses.
pub const MAX_NESTING: usize = 64;

/// Decides whether a template's labels satisfy a requested label.
///
/// Implementations must be pure predicates.
pub trait LabelMatcher: Send + Sync {
    fn matches(&self, requested: &str, offered: &str) -> bool;
}

/// Default matcher: parses `requested` as a [`LabelExpr`] and evaluates it
/// against the whitespace-separated atoms in `offered`.
///
/// A malformed expression matches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprLabelMatcher;

impl LabelMatcher for ExprLabelMatcher {
    fn matches(&self, requested: &str, offered: &str) -> bool {
        match LabelExpr::parse(requested) {
            Ok(expr) => expr.matches(offered),
            Err(e) => {
                warn!(label = %requested, error = %e, "unparseable label expression");
                false
            }
        }
    }
}

/// Parsed label expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    /// Two or more terms, all of which must hold.
    And(Vec<LabelExpr>),
    /// Two or more terms, any of which must hold.
    Or(Vec<LabelExpr>),
}

impl LabelExpr {
    pub fn parse(input: &str) -> ConfigResult<Self> {
        let tokens = tokenize(input).map_err(|reason| label_error(input, reason))?;
        if tokens.is_empty() {
            return Err(label_error(input, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or().map_err(|reason| label_error(input, reason))?;
        if parser.pos != parser.tokens.len() {
            return Err(label_error(input, "trailing tokens"));
        }
        Ok(expr)
    }

    /// Evaluate against a whitespace-separated atom set.
    pub fn matches(&self, offered: &str) -> bool {
        let atoms: HashSet<&str> = offered.split_whitespace().collect();
        self.eval(&atoms)
    }

    fn eval(&self, atoms: &HashSet<&str>) -> bool {
        match self {
            Self::Atom(a) => atoms.contains(a.as_str()),
            Self::Not(e) => !e.eval(atoms),
            Self::And(terms) => terms.iter().all(|t| t.eval(atoms)),
            Self::Or(terms) => terms.iter().any(|t| t.eval(atoms)),
        }
    }
}

fn label_error(expr: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Label {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Atom(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(format!("expected '{c}{c}'"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || "()!&|".contains(c) {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    /// Open `!` and `(` levels.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn or(&mut self) -> Result<LabelExpr, String> {
        let mut terms = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            LabelExpr::Or(terms)
        })
    }

    fn and(&mut self) -> Result<LabelExpr, String> {
        let mut terms = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            LabelExpr::And(terms)
        })
    }

    fn unary(&mut self) -> Result<LabelExpr, String> {
        match self.next() {
            Some(Token::Not) => {
                let inner = self.nested(Self::unary)?;
                Ok(LabelExpr::Not(Box::new(inner)))
            }
            Some(Token::Open) => {
                let inner = self.nested(Self::or)?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("unbalanced parenthesis".to_string()),
                }
            }
            Some(Token::Atom(a)) => Ok(LabelExpr::Atom(a)),
            Some(t) => Err(format!("unexpected token {t:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }

    /// Parse one level deeper, refusing past [`MAX_NESTING`].
    fn nested(
        &mut self,
        parse: fn(&mut Self) -> Result<LabelExpr, String>,
    ) -> Result<LabelExpr, String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".to_string());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }
}
