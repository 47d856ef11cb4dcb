//! `${{ ... }}` template handling.
//!
//! Parameter values in package files are plain strings that may embed
//! expressions. A [`Template`] is the parsed form: literal runs
//! interleaved with expression segments. Single-pass scan over char
//! indices, same technique as the tokenizer.

use std::collections::HashSet;

use serde_json::Value;

use crate::errors::{DfmError, Result};
use crate::expr::eval::{to_display_string, EvalCtx};
use crate::expr::parser::{parse, BinOp, Expr};

#[derive(Debug, Clone)]
pub enum Segment {
    Lit(String),
    Expr { src: String, ast: Expr },
}

/// A string with zero or more embedded `${{ ... }}` expressions
#[derive(Debug, Clone)]
pub struct Template {
    src: String,
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(src: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = src;
        let mut lit_start = String::new();

        while let Some(open) = rest.find("${{") {
            lit_start.push_str(&rest[..open]);
            let after = &rest[open + 3..];
            let close = after.find("}}").ok_or_else(|| {
                DfmError::syntax(format!("unterminated '${{{{' in \"{}\"", src))
            })?;
            let inner = after[..close].trim().to_string();
            let ast = parse(&inner)?;
            if !lit_start.is_empty() {
                segments.push(Segment::Lit(std::mem::take(&mut lit_start)));
            }
            segments.push(Segment::Expr { src: inner, ast });
            rest = &after[close + 2..];
        }
        lit_start.push_str(rest);
        if !lit_start.is_empty() {
            segments.push(Segment::Lit(lit_start));
        }

        Ok(Self {
            src: src.to_string(),
            segments,
        })
    }

    pub fn src(&self) -> &str {
        &self.src
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_exprs(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Expr { .. }))
    }

    /// True when any embedded expression references one of `names`
    pub fn references(&self, names: &HashSet<String>) -> bool {
        self.segments.iter().any(|s| match s {
            Segment::Expr { ast, .. } => expr_references(ast, names),
            Segment::Lit(_) => false,
        })
    }

    /// Evaluate against a scope. A template that is exactly one expression
    /// yields the expression's value; otherwise segments are spliced into a
    /// string (non-strings coerced to canonical JSON).
    pub fn eval(&self, ctx: &EvalCtx) -> Result<Value> {
        if self.segments.len() == 1 {
            if let Segment::Expr { ast, .. } = &self.segments[0] {
                return ctx.eval(ast);
            }
        }
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Lit(s) => out.push_str(s),
                Segment::Expr { ast, .. } => {
                    let v = ctx.eval(ast)?;
                    out.push_str(&to_display_string(&v));
                }
            }
        }
        Ok(Value::String(out))
    }
}

/// Recursively expand `${{ ... }}` in `text` until no expressions remain
/// (expansion results may themselves contain expressions).
pub fn expand_nested(text: &str, ctx: &EvalCtx) -> Result<String> {
    let mut cur = text.to_string();
    for _ in 0..16 {
        if !cur.contains("${{") {
            return Ok(cur);
        }
        let t = Template::parse(&cur)?;
        let v = t.eval(ctx)?;
        let next = to_display_string(&v);
        if next == cur {
            return Ok(next);
        }
        cur = next;
    }
    Err(DfmError::syntax(format!(
        "expression expansion did not converge: \"{}\"",
        text
    )))
}

/// Walk an AST checking whether any identifier head resolves to one of
/// `names`. Filter names on the right of a pipe are dispatch targets, not
/// variable references, and are skipped (their arguments are still walked).
pub fn expr_references(e: &Expr, names: &HashSet<String>) -> bool {
    match e {
        Expr::Id { name, .. } => names.contains(name),
        Expr::Var(name) => names.contains(name),
        Expr::HId { parts, .. } => parts.first().is_some_and(|p| names.contains(p)),
        Expr::Not(inner) => expr_references(inner, names),
        Expr::Bin {
            op: BinOp::Pipe,
            lhs,
            rhs,
        } => {
            expr_references(lhs, names)
                || match rhs.as_ref() {
                    Expr::Call { args, .. } => args.iter().any(|a| expr_references(a, names)),
                    // Bare filter name: not a variable reference
                    Expr::Id { .. } | Expr::HId { .. } => false,
                    other => expr_references(other, names),
                }
        }
        Expr::Bin { lhs, rhs, .. } => expr_references(lhs, names) || expr_references(rhs, names),
        Expr::Call { args, .. } => args.iter().any(|a| expr_references(a, names)),
        Expr::Index { obj, index } => expr_references(obj, names) || expr_references(index, names),
        Expr::Slice { obj, start, end } => {
            expr_references(obj, names)
                || start.as_ref().is_some_and(|s| expr_references(s, names))
                || end.as_ref().is_some_and(|s| expr_references(s, names))
        }
        Expr::Iter(obj) => expr_references(obj, names),
        Expr::Field { obj, .. } => expr_references(obj, names),
        Expr::Int(_) | Expr::Bool(_) | Expr::Str(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_template_pure_literal() {
        let t = Template::parse("no expressions here").unwrap();
        assert!(!t.has_exprs());
        let v = t.eval(&EvalCtx::new()).unwrap();
        assert_eq!(v, json!("no expressions here"));
    }

    #[test]
    fn test_template_whole_expr_keeps_value_type() {
        let mut ctx = EvalCtx::new();
        ctx.set("files", json!(["a", "b"]));
        let t = Template::parse("${{ files }}").unwrap();
        assert_eq!(t.eval(&ctx).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_template_splice_coerces_json() {
        let mut ctx = EvalCtx::new();
        ctx.set("n", json!(4));
        let t = Template::parse("-j ${{ n }} --keep").unwrap();
        assert_eq!(t.eval(&ctx).unwrap(), json!("-j 4 --keep"));
    }

    #[test]
    fn test_template_unterminated_fails() {
        assert!(Template::parse("${{ oops").is_err());
    }

    #[test]
    fn test_references_runtime_names() {
        let t = Template::parse("${{ inputs | length }}").unwrap();
        assert!(t.references(&names(&["inputs", "memento", "rundir"])));

        let t = Template::parse("${{ srcdir }}/rtl").unwrap();
        assert!(!t.references(&names(&["inputs", "memento", "rundir"])));

        // Hierarchical id rooted in a runtime name
        let t = Template::parse("${{ memento.last_status }}").unwrap();
        assert!(t.references(&names(&["memento"])));
    }

    #[test]
    fn test_references_skips_filter_names() {
        // 'length' as pipe target is dispatch, not a variable reference
        let t = Template::parse("${{ x | length }}").unwrap();
        assert!(!t.references(&names(&["length"])));
        assert!(t.references(&names(&["x"])));
    }

    #[test]
    fn test_expand_nested() {
        let mut ctx = EvalCtx::new();
        ctx.set("a", json!("${{ b }}"));
        ctx.set("b", json!("done"));
        assert_eq!(expand_nested("${{ a }}", &ctx).unwrap(), "done");
    }
}
