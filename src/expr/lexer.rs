//! Tokenizer for the `${{ ... }}` expression mini-language.
//!
//! Single-pass over char indices, no regex. Identifiers may carry a
//! `:-default` suffix (e.g. `CC:-gcc`), which is captured on the token so
//! the evaluator can substitute the default when the name is unbound.

use crate::errors::{DfmError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Int(i64),
    Str(String),
    Bool(bool),
    Ident { name: String, default: Option<String> },
    Dollar,
    Dot,
    Comma,
    Colon,
    Pipe,
    LParen,
    RParen,
    LBracket,
    RBracket,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Characters that terminate a `:-` default value
fn ends_default(c: char) -> bool {
    c.is_whitespace() || matches!(c, ')' | ']' | '}' | ',' | '|' | '"' | '\'')
}

pub fn tokenize(src: &str) -> Result<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == quote {
                        closed = true;
                        break;
                    }
                    if ch == '\\' {
                        match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, esc)) => s.push(esc),
                            None => break,
                        }
                    } else {
                        s.push(ch);
                    }
                }
                if !closed {
                    return Err(DfmError::syntax(format!(
                        "unterminated string starting at offset {}",
                        i
                    )));
                }
                toks.push(Tok::Str(s));
            }
            '0'..='9' => {
                let mut n = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if d.is_ascii_digit() {
                        n.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let v = n
                    .parse::<i64>()
                    .map_err(|_| DfmError::syntax(format!("invalid integer '{}'", n)))?;
                toks.push(Tok::Int(v));
            }
            c if is_ident_start(c) => {
                let mut name = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if is_ident_char(d) {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Default-value suffix: CC:-gcc
                let mut default = None;
                let mut look = chars.clone();
                if let (Some((_, ':')), Some((_, '-'))) = {
                    let a = look.next();
                    let b = look.next();
                    (a, b)
                } {
                    chars.next();
                    chars.next();
                    let mut d = String::new();
                    while let Some(&(_, dc)) = chars.peek() {
                        if ends_default(dc) {
                            break;
                        }
                        d.push(dc);
                        chars.next();
                    }
                    default = Some(d);
                }
                match name.as_str() {
                    "true" => toks.push(Tok::Bool(true)),
                    "false" => toks.push(Tok::Bool(false)),
                    _ => toks.push(Tok::Ident { name, default }),
                }
            }
            '$' => {
                chars.next();
                toks.push(Tok::Dollar);
            }
            '.' => {
                chars.next();
                toks.push(Tok::Dot);
            }
            ',' => {
                chars.next();
                toks.push(Tok::Comma);
            }
            ':' => {
                chars.next();
                toks.push(Tok::Colon);
            }
            '(' => {
                chars.next();
                toks.push(Tok::LParen);
            }
            ')' => {
                chars.next();
                toks.push(Tok::RParen);
            }
            '[' => {
                chars.next();
                toks.push(Tok::LBracket);
            }
            ']' => {
                chars.next();
                toks.push(Tok::RBracket);
            }
            '+' => {
                chars.next();
                toks.push(Tok::Plus);
            }
            '-' => {
                chars.next();
                toks.push(Tok::Minus);
            }
            '*' => {
                chars.next();
                toks.push(Tok::Star);
            }
            '/' => {
                chars.next();
                toks.push(Tok::Slash);
            }
            '|' => {
                chars.next();
                if let Some(&(_, '|')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::OrOr);
                } else {
                    toks.push(Tok::Pipe);
                }
            }
            '&' => {
                chars.next();
                if let Some(&(_, '&')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::AndAnd);
                } else {
                    return Err(DfmError::syntax("expected '&&'"));
                }
            }
            '=' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::EqEq);
                } else {
                    return Err(DfmError::syntax("expected '=='"));
                }
            }
            '!' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::Ne);
                } else {
                    toks.push(Tok::Not);
                }
            }
            '<' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::Le);
                } else {
                    toks.push(Tok::Lt);
                }
            }
            '>' => {
                chars.next();
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    toks.push(Tok::Ge);
                } else {
                    toks.push(Tok::Gt);
                }
            }
            other => {
                return Err(DfmError::syntax(format!(
                    "unexpected character '{}' at offset {}",
                    other, i
                )));
            }
        }
    }

    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_arith() {
        let toks = tokenize("1 + 2 * 3").unwrap();
        assert_eq!(
            toks,
            vec![
                Tok::Int(1),
                Tok::Plus,
                Tok::Int(2),
                Tok::Star,
                Tok::Int(3)
            ]
        );
    }

    #[test]
    fn test_tokenize_hid_and_pipe() {
        let toks = tokenize("a.b | length").unwrap();
        assert_eq!(toks.len(), 5);
        assert_eq!(toks[1], Tok::Dot);
        assert_eq!(toks[3], Tok::Pipe);
    }

    #[test]
    fn test_tokenize_default_suffix() {
        let toks = tokenize("env.CC:-gcc").unwrap();
        assert_eq!(
            toks[2],
            Tok::Ident {
                name: "CC".to_string(),
                default: Some("gcc".to_string())
            }
        );
    }

    #[test]
    fn test_tokenize_string_escapes() {
        let toks = tokenize(r#""a\"b\n""#).unwrap();
        assert_eq!(toks, vec![Tok::Str("a\"b\n".to_string())]);
    }

    #[test]
    fn test_tokenize_bool_and_not() {
        let toks = tokenize("!true && false").unwrap();
        assert_eq!(
            toks,
            vec![Tok::Not, Tok::Bool(true), Tok::AndAnd, Tok::Bool(false)]
        );
    }

    #[test]
    fn test_tokenize_slice_colon_kept() {
        let toks = tokenize("files[1:3]").unwrap();
        assert!(toks.contains(&Tok::Colon));
    }

    #[test]
    fn test_tokenize_rejects_garbage() {
        assert!(tokenize("a ^ b").is_err());
        assert!(tokenize("\"unterminated").is_err());
    }
}
