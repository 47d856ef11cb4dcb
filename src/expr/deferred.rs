//! Deferred expressions.
//!
//! A parameter value whose embedded templates reference runtime-only names
//! (`inputs`, `memento`, `rundir`, or a dependency's `<need>.rundir`)
//! cannot be evaluated at graph-build time. The builder stores a
//! [`DeferredExpr`] instead: the raw value (strings still carrying their
//! `${{ ... }}` text) plus a snapshot of the static scope. The runner
//! evaluates it exactly once per task execution, layering the runtime
//! bindings over the snapshot.
//!
//! Values are walked element-wise: strings inside lists and maps are
//! evaluated (or trigger deferral) individually.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::errors::Result;
use crate::expr::eval::EvalCtx;
use crate::expr::template::Template;

/// Names that only exist at task run time
pub fn runtime_names(need_names: impl IntoIterator<Item = String>) -> HashSet<String> {
    let mut names: HashSet<String> = ["inputs", "memento", "rundir"]
        .into_iter()
        .map(String::from)
        .collect();
    names.extend(need_names);
    names
}

/// Does any string embedded in `v` reference one of `names`?
pub fn value_references(v: &Value, names: &HashSet<String>) -> Result<bool> {
    match v {
        Value::String(s) if s.contains("${{") => Ok(Template::parse(s)?.references(names)),
        Value::Array(items) => {
            for item in items {
                if value_references(item, names)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Object(map) => {
            for item in map.values() {
                if value_references(item, names)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

/// Evaluate every `${{ ... }}` template embedded in `v` against `ctx`,
/// element-wise. A string that is exactly one expression keeps the
/// expression's value type.
pub fn eval_embedded(v: &Value, ctx: &EvalCtx) -> Result<Value> {
    match v {
        Value::String(s) if s.contains("${{") => Template::parse(s)?.eval(ctx),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|i| eval_embedded(i, ctx))
                .collect::<Result<Vec<_>>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, item) in map {
                out.insert(k.clone(), eval_embedded(item, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[derive(Debug, Clone)]
pub struct DeferredExpr {
    raw: Value,
    statics: HashMap<String, Value>,
}

impl DeferredExpr {
    pub fn new(raw: Value, statics: HashMap<String, Value>) -> Self {
        Self { raw, statics }
    }

    /// Original source (for diagnostics and exec-data dumps)
    pub fn src(&self) -> String {
        match &self.raw {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other).unwrap_or_default(),
        }
    }

    /// Evaluate with runtime bindings; runtime wins over the snapshot.
    pub fn evaluate(&self, runtime: &EvalCtx) -> Result<Value> {
        let mut ctx = runtime.clone();
        for (k, v) in &self.statics {
            if ctx.get(k).is_none() {
                ctx.set(k.clone(), v.clone());
            }
        }
        eval_embedded(&self.raw, &ctx)
    }
}
