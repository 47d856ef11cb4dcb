//! Recursive-descent parser for the expression mini-language.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr  = or
//! or    = and ('||' and)*
//! and   = not ('&&' not)*
//! not   = '!'? cmp
//! cmp   = add (('=='|'!='|'<'|'<='|'>'|'>=') add)?
//! add   = mul (('+'|'-') mul)*
//! mul   = pipe (('*'|'/') pipe)*
//! pipe  = unary ('|' call_or_id)*
//! unary = primary ('[' index_or_slice ']' | '[]' | '.' ID)*
//! primary = INT | BOOL | STRING | '$' ID | ID | CALL | '(' expr ')'
//! ```
//!
//! Dotted identifier chains (`a.b.c`) fold into a single hierarchical id so
//! the evaluator can try longest-qualified-prefix resolution; a `.field`
//! applied to any other expression becomes a field access.

use std::fmt;

use crate::errors::{DfmError, Result};
use crate::expr::lexer::{tokenize, Tok};

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Pipe,
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "&&",
            BinOp::Or => "||",
            BinOp::Pipe => "|",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Bool(bool),
    Str(String),
    /// Bare identifier, optionally with a `:-default`
    Id {
        name: String,
        default: Option<String>,
    },
    /// Hierarchical identifier `a.b.c`, default attaches to the last part
    HId {
        parts: Vec<String>,
        default: Option<String>,
    },
    /// `$name`
    Var(String),
    Not(Box<Expr>),
    Bin {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Index {
        obj: Box<Expr>,
        index: Box<Expr>,
    },
    Slice {
        obj: Box<Expr>,
        start: Option<Box<Expr>>,
        end: Option<Box<Expr>>,
    },
    /// `obj[]`
    Iter(Box<Expr>),
    /// `.field` on a non-identifier expression
    Field {
        obj: Box<Expr>,
        name: String,
    },
}

impl Expr {
    /// Head identifier of an id/hid/var node, if any
    pub fn head(&self) -> Option<&str> {
        match self {
            Expr::Id { name, .. } => Some(name),
            Expr::HId { parts, .. } => parts.first().map(|s| s.as_str()),
            Expr::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Bool(v) => write!(f, "{}", v),
            Expr::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Expr::Id { name, default } => match default {
                Some(d) => write!(f, "{}:-{}", name, d),
                None => write!(f, "{}", name),
            },
            Expr::HId { parts, default } => {
                write!(f, "{}", parts.join("."))?;
                if let Some(d) = default {
                    write!(f, ":-{}", d)?;
                }
                Ok(())
            }
            Expr::Var(name) => write!(f, "${}", name),
            Expr::Not(e) => write!(f, "!{}", e),
            Expr::Bin { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op, rhs),
            Expr::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            Expr::Index { obj, index } => write!(f, "{}[{}]", obj, index),
            Expr::Slice { obj, start, end } => {
                write!(f, "{}[", obj)?;
                if let Some(s) = start {
                    write!(f, "{}", s)?;
                }
                write!(f, ":")?;
                if let Some(e) = end {
                    write!(f, "{}", e)?;
                }
                write!(f, "]")
            }
            Expr::Iter(obj) => write!(f, "{}[]", obj),
            Expr::Field { obj, name } => write!(f, "{}.{}", obj, name),
        }
    }
}

// ============================================================================
// PARSER
// ============================================================================

pub fn parse(src: &str) -> Result<Expr> {
    let toks = tokenize(src)?;
    let mut p = Parser { toks, pos: 0 };
    let e = p.parse_or()?;
    if p.pos != p.toks.len() {
        return Err(DfmError::syntax(format!(
            "trailing tokens in expression '{}'",
            src
        )));
    }
    Ok(e)
}

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, t: &Tok) -> bool {
        if self.peek() == Some(t) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Tok, what: &str) -> Result<()> {
        if self.eat(t) {
            Ok(())
        } else {
            Err(DfmError::syntax(format!(
                "expected {} (found {:?})",
                what,
                self.peek()
            )))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.parse_and()?;
            lhs = Expr::Bin {
                op: BinOp::Or,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_not()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.parse_not()?;
            lhs = Expr::Bin {
                op: BinOp::And,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr> {
        if self.eat(&Tok::Not) {
            let e = self.parse_cmp()?;
            Ok(Expr::Not(Box::new(e)))
        } else {
            self.parse_cmp()
        }
    }

    fn parse_cmp(&mut self) -> Result<Expr> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => Some(BinOp::Eq),
            Some(Tok::Ne) => Some(BinOp::Ne),
            Some(Tok::Lt) => Some(BinOp::Lt),
            Some(Tok::Le) => Some(BinOp::Le),
            Some(Tok::Gt) => Some(BinOp::Gt),
            Some(Tok::Ge) => Some(BinOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.parse_add()?;
            Ok(Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        } else {
            Ok(lhs)
        }
    }

    fn parse_add(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => BinOp::Add,
                Some(Tok::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_mul()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_mul(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_pipe()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => BinOp::Mul,
                Some(Tok::Slash) => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.parse_pipe()?;
            lhs = Expr::Bin {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn parse_pipe(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Tok::Pipe) {
            let rhs = self.parse_call_or_id()?;
            lhs = Expr::Bin {
                op: BinOp::Pipe,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    /// RHS of a pipe: a bare/qualified filter name or a call form
    fn parse_call_or_id(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Ident { name, default }) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else if self.peek() == Some(&Tok::Dot) {
                    let mut parts = vec![name];
                    let mut default = default;
                    while self.eat(&Tok::Dot) {
                        match self.next() {
                            Some(Tok::Ident { name, default: d }) => {
                                parts.push(name);
                                default = d;
                            }
                            other => {
                                return Err(DfmError::syntax(format!(
                                    "expected identifier after '.' (found {:?})",
                                    other
                                )))
                            }
                        }
                    }
                    Ok(Expr::HId { parts, default })
                } else {
                    Ok(Expr::Id { name, default })
                }
            }
            other => Err(DfmError::syntax(format!(
                "pipe target must be a filter name or call (found {:?})",
                other
            ))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Tok::Comma) {
                continue;
            }
            self.expect(&Tok::RParen, "')'")?;
            break;
        }
        Ok(args)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let mut e = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Tok::LBracket) => {
                    self.pos += 1;
                    if self.eat(&Tok::RBracket) {
                        e = Expr::Iter(Box::new(e));
                        continue;
                    }
                    // [expr], [expr:expr], [:expr], [expr:]
                    let start = if self.peek() == Some(&Tok::Colon) {
                        None
                    } else {
                        Some(Box::new(self.parse_or()?))
                    };
                    if self.eat(&Tok::Colon) {
                        let end = if self.peek() == Some(&Tok::RBracket) {
                            None
                        } else {
                            Some(Box::new(self.parse_or()?))
                        };
                        self.expect(&Tok::RBracket, "']'")?;
                        e = Expr::Slice {
                            obj: Box::new(e),
                            start,
                            end,
                        };
                    } else {
                        self.expect(&Tok::RBracket, "']'")?;
                        let index = start.ok_or_else(|| DfmError::syntax("empty index"))?;
                        e = Expr::Index {
                            obj: Box::new(e),
                            index,
                        };
                    }
                }
                Some(Tok::Dot) => {
                    self.pos += 1;
                    let (name, default) = match self.next() {
                        Some(Tok::Ident { name, default }) => (name, default),
                        other => {
                            return Err(DfmError::syntax(format!(
                                "expected identifier after '.' (found {:?})",
                                other
                            )))
                        }
                    };
                    // Extend identifier chains into a hierarchical id
                    e = match e {
                        Expr::Id {
                            name: head,
                            default: None,
                        } => Expr::HId {
                            parts: vec![head, name],
                            default,
                        },
                        Expr::HId {
                            mut parts,
                            default: None,
                        } => {
                            parts.push(name);
                            Expr::HId { parts, default }
                        }
                        other => Expr::Field {
                            obj: Box::new(other),
                            name,
                        },
                    };
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Tok::Int(v)) => Ok(Expr::Int(v)),
            Some(Tok::Bool(v)) => Ok(Expr::Bool(v)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Dollar) => match self.next() {
                Some(Tok::Ident { name, .. }) => Ok(Expr::Var(name)),
                other => Err(DfmError::syntax(format!(
                    "expected identifier after '$' (found {:?})",
                    other
                ))),
            },
            Some(Tok::Ident { name, default }) => {
                if self.peek() == Some(&Tok::LParen) {
                    self.pos += 1;
                    let args = self.parse_args()?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Id { name, default })
                }
            }
            Some(Tok::LParen) => {
                let e = self.parse_or()?;
                self.expect(&Tok::RParen, "')'")?;
                Ok(e)
            }
            other => Err(DfmError::syntax(format!(
                "unexpected token {:?} in expression",
                other
            ))),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
