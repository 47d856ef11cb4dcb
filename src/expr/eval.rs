//! Expression evaluator.
//!
//! Walks a parsed [`Expr`] against a variable scope, implementing the
//! jq-style built-ins and pipe-to-filter dispatch. Values are
//! `serde_json::Value` throughout; non-string values coerce to their
//! canonical JSON encoding when spliced into strings.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::errors::{DfmError, Result};
use crate::expr::parser::{parse, BinOp, Expr};
use crate::expr::template::expand_nested;
use crate::filter::FilterRegistry;

// ============================================================================
// SCOPE
// ============================================================================

/// Evaluation scope: a flat variable map (keys may be dotted, e.g.
/// `"compile.rundir"`) plus the filter registry for pipe dispatch.
#[derive(Clone, Default)]
pub struct EvalCtx {
    vars: HashMap<String, Value>,
    pub filters: Option<Arc<FilterRegistry>>,
    pub current_package: Option<String>,
}

impl EvalCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filters(mut self, filters: Arc<FilterRegistry>, pkg: impl Into<String>) -> Self {
        self.filters = Some(filters);
        self.current_package = Some(pkg.into());
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.vars.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn vars(&self) -> &HashMap<String, Value> {
        &self.vars
    }

    /// Snapshot of the variable map (for deferred-expression capture)
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.vars.clone()
    }

    pub fn extend(&mut self, vars: &HashMap<String, Value>) {
        for (k, v) in vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Parse and evaluate an expression string
    pub fn eval_str(&self, src: &str) -> Result<Value> {
        let ast = parse(src)?;
        self.eval(&ast)
    }

    // ------------------------------------------------------------------------
    // AST walk
    // ------------------------------------------------------------------------

    pub fn eval(&self, e: &Expr) -> Result<Value> {
        match e {
            Expr::Int(v) => Ok(json!(v)),
            Expr::Bool(v) => Ok(json!(v)),
            Expr::Str(s) => Ok(json!(s)),
            Expr::Id { name, default } => self.resolve_id(name, default.as_deref()),
            Expr::HId { parts, default } => self.resolve_hid(parts, default.as_deref()),
            Expr::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| DfmError::name_not_found(format!("${}", name))),
            Expr::Not(inner) => {
                let v = self.eval(inner)?;
                Ok(json!(!truthy(&v)))
            }
            Expr::Bin { op, lhs, rhs } => self.eval_bin(*op, lhs, rhs),
            Expr::Call { name, args } => self.eval_call(name, args, None),
            Expr::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                index_value(&obj, &index)
            }
            Expr::Slice { obj, start, end } => {
                let obj = self.eval(obj)?;
                let start = start.as_ref().map(|e| self.eval(e)).transpose()?;
                let end = end.as_ref().map(|e| self.eval(e)).transpose()?;
                slice_value(&obj, start.as_ref(), end.as_ref())
            }
            Expr::Iter(obj) => {
                let obj = self.eval(obj)?;
                match obj {
                    Value::Array(_) => Ok(obj),
                    Value::Object(m) => Ok(Value::Array(m.into_iter().map(|(_, v)| v).collect())),
                    other => Err(DfmError::schema(format!(
                        "cannot iterate over {}",
                        type_name(&other)
                    ))),
                }
            }
            Expr::Field { obj, name } => {
                let obj = self.eval(obj)?;
                match obj {
                    Value::Object(m) => m.get(name).cloned().ok_or_else(|| {
                        DfmError::schema(format!("field '{}' not found in object", name))
                    }),
                    other => Err(DfmError::schema(format!(
                        "cannot access field '{}' on {}",
                        name,
                        type_name(&other)
                    ))),
                }
            }
        }
    }

    fn resolve_id(&self, name: &str, default: Option<&str>) -> Result<Value> {
        if let Some(v) = self.vars.get(name) {
            return Ok(v.clone());
        }
        if let Some(d) = default {
            return Ok(json!(d));
        }
        Err(DfmError::name_not_found_in(
            name,
            self.vars.keys().map(|s| s.as_str()),
        ))
    }

    /// Hierarchical lookup: longest qualified prefix first, then traverse
    /// the remaining parts through object fields.
    fn resolve_hid(&self, parts: &[String], default: Option<&str>) -> Result<Value> {
        for i in (1..=parts.len()).rev() {
            let key = parts[..i].join(".");
            if let Some(base) = self.vars.get(&key) {
                let mut value = base.clone();
                for part in &parts[i..] {
                    match value {
                        Value::Object(ref m) => match m.get(part) {
                            Some(v) => value = v.clone(),
                            None => {
                                if let Some(d) = default {
                                    return Ok(json!(d));
                                }
                                return Err(DfmError::name_not_found(format!(
                                    "{} (no field '{}')",
                                    parts.join("."),
                                    part
                                )));
                            }
                        },
                        // Primitives terminate traversal
                        _ => break,
                    }
                }
                return Ok(value);
            }
        }
        if let Some(d) = default {
            return Ok(json!(d));
        }
        Err(DfmError::name_not_found_in(
            parts.join("."),
            self.vars.keys().map(|s| s.as_str()),
        ))
    }

    fn eval_bin(&self, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<Value> {
        if op == BinOp::Pipe {
            let input = self.eval(lhs)?;
            return self.eval_pipe_rhs(input, rhs);
        }

        let l = self.eval(lhs)?;

        // Short-circuit logical operators
        match op {
            BinOp::And => {
                if !truthy(&l) {
                    return Ok(json!(false));
                }
                let r = self.eval(rhs)?;
                return Ok(json!(truthy(&r)));
            }
            BinOp::Or => {
                if truthy(&l) {
                    return Ok(json!(true));
                }
                let r = self.eval(rhs)?;
                return Ok(json!(truthy(&r)));
            }
            _ => {}
        }

        let r = self.eval(rhs)?;
        match op {
            BinOp::Add => add_values(&l, &r),
            BinOp::Sub => arith(&l, &r, "-", |a, b| a - b, |a, b| a.checked_sub(b)),
            BinOp::Mul => arith(&l, &r, "*", |a, b| a * b, |a, b| a.checked_mul(b)),
            BinOp::Div => div_values(&l, &r),
            BinOp::Eq => Ok(json!(l == r)),
            BinOp::Ne => Ok(json!(l != r)),
            BinOp::Lt => Ok(json!(ord(&l, &r)?.is_lt())),
            BinOp::Le => Ok(json!(ord(&l, &r)?.is_le())),
            BinOp::Gt => Ok(json!(ord(&l, &r)?.is_gt())),
            BinOp::Ge => Ok(json!(ord(&l, &r)?.is_ge())),
            BinOp::And | BinOp::Or | BinOp::Pipe => unreachable!(),
        }
    }

    /// `lhs | rhs` dispatch: built-ins first, then the filter registry
    fn eval_pipe_rhs(&self, input: Value, rhs: &Expr) -> Result<Value> {
        match rhs {
            Expr::Id { name, .. } => {
                if is_builtin(name) {
                    self.call_builtin(name, Some(input), &[])
                } else {
                    self.apply_filter(name, input, Vec::new())
                }
            }
            Expr::HId { parts, .. } => self.apply_filter(&parts.join("."), input, Vec::new()),
            Expr::Call { name, args } => {
                if is_builtin(name) {
                    self.call_builtin(name, Some(input), args)
                } else {
                    let arg_vals = args
                        .iter()
                        .map(|a| self.eval(a))
                        .collect::<Result<Vec<_>>>()?;
                    self.apply_filter(name, input, arg_vals)
                }
            }
            other => Err(DfmError::syntax(format!(
                "pipe target must be a filter name or call (found '{}')",
                other
            ))),
        }
    }

    fn eval_call(&self, name: &str, args: &[Expr], input: Option<Value>) -> Result<Value> {
        if is_builtin(name) {
            self.call_builtin(name, input, args)
        } else {
            Err(DfmError::name_not_found_in(name, BUILTINS.iter().copied()))
        }
    }

    fn apply_filter(&self, name: &str, input: Value, args: Vec<Value>) -> Result<Value> {
        let registry = self.filters.as_ref().ok_or_else(|| {
            DfmError::schema(format!(
                "filter '{}' used but no filter registry configured",
                name
            ))
        })?;
        let pkg = self.current_package.as_deref().ok_or_else(|| {
            DfmError::schema(format!(
                "filter '{}' used but current package not set",
                name
            ))
        })?;
        registry.apply(self, pkg, name, input, args)
    }

    // ------------------------------------------------------------------------
    // Built-ins
    // ------------------------------------------------------------------------

    fn call_builtin(&self, name: &str, input: Option<Value>, args: &[Expr]) -> Result<Value> {
        // map/select/group_by take an expression argument that is
        // re-evaluated per element; everything else gets values.
        match name {
            "map" => {
                let expr = one_expr_arg("map", args)?;
                let items = as_array(&require_input("map", input)?, "map")?;
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_with_item(expr, &item)?);
                }
                Ok(Value::Array(out))
            }
            "select" => {
                let expr = one_expr_arg("select", args)?;
                let input = require_input("select", input)?;
                match input {
                    Value::Array(items) => {
                        let mut out = Vec::new();
                        for item in items {
                            if truthy(&self.eval_with_item(expr, &item)?) {
                                out.push(item);
                            }
                        }
                        Ok(Value::Array(out))
                    }
                    other => {
                        if truthy(&self.eval_with_item(expr, &other)?) {
                            Ok(other)
                        } else {
                            Ok(Value::Null)
                        }
                    }
                }
            }
            "group_by" => {
                let expr = one_expr_arg("group_by", args)?;
                let items = as_array(&require_input("group_by", input)?, "group_by")?;
                // Stable group order by first-seen key
                let mut order: Vec<String> = Vec::new();
                let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
                for item in items {
                    let key_v = self.eval_with_item(expr, &item)?;
                    let key = canonical_key(&key_v);
                    if !groups.contains_key(&key) {
                        order.push(key.clone());
                    }
                    groups.entry(key).or_default().push(item);
                }
                Ok(Value::Array(
                    order
                        .into_iter()
                        .map(|k| Value::Array(groups.remove(&k).unwrap_or_default()))
                        .collect(),
                ))
            }
            _ => {
                let arg_vals = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>>>()?;
                self.call_value_builtin(name, input, arg_vals)
            }
        }
    }

    /// Per-element scope for map/select/group_by: `item` and the current
    /// pipeline value both bind to the element.
    fn eval_with_item(&self, expr: &Expr, item: &Value) -> Result<Value> {
        let mut sub = self.clone();
        sub.set("item", item.clone());
        sub.set("input", item.clone());
        sub.eval(expr)
    }

    fn call_value_builtin(
        &self,
        name: &str,
        input: Option<Value>,
        args: Vec<Value>,
    ) -> Result<Value> {
        match name {
            "length" => {
                let target = match (args.len(), input) {
                    (1, _) => args.into_iter().next().unwrap(),
                    (0, Some(v)) => v,
                    (0, None) => Value::Null,
                    _ => return Err(DfmError::schema("length() takes at most one argument")),
                };
                match &target {
                    Value::Array(a) => Ok(json!(a.len())),
                    Value::Object(m) => Ok(json!(m.len())),
                    Value::String(s) => Ok(json!(s.chars().count())),
                    Value::Null => Ok(json!(0)),
                    other => Err(DfmError::schema(format!(
                        "length() cannot be applied to {}",
                        type_name(other)
                    ))),
                }
            }
            "keys" => {
                no_args("keys", &args)?;
                match require_input("keys", input)? {
                    Value::Object(m) => {
                        let mut keys: Vec<String> = m.keys().cloned().collect();
                        keys.sort();
                        Ok(json!(keys))
                    }
                    Value::Array(a) => Ok(Value::Array(
                        (0..a.len()).map(|i| json!(i)).collect(),
                    )),
                    other => Err(DfmError::schema(format!(
                        "keys() cannot be applied to {}",
                        type_name(&other)
                    ))),
                }
            }
            "values" => {
                no_args("values", &args)?;
                match require_input("values", input)? {
                    Value::Object(m) => Ok(Value::Array(m.into_iter().map(|(_, v)| v).collect())),
                    arr @ Value::Array(_) => Ok(arr),
                    other => Err(DfmError::schema(format!(
                        "values() cannot be applied to {}",
                        type_name(&other)
                    ))),
                }
            }
            "sort" => {
                no_args("sort", &args)?;
                let mut items = as_array(&require_input("sort", input)?, "sort")?;
                let mut err = None;
                items.sort_by(|a, b| match ord(a, b) {
                    Ok(o) => o,
                    Err(e) => {
                        err.get_or_insert(e);
                        std::cmp::Ordering::Equal
                    }
                });
                match err {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(items)),
                }
            }
            "unique" => {
                no_args("unique", &args)?;
                let items = as_array(&require_input("unique", input)?, "unique")?;
                let mut seen = std::collections::HashSet::new();
                let mut out = Vec::new();
                for item in items {
                    if seen.insert(canonical_key(&item)) {
                        out.push(item);
                    }
                }
                Ok(Value::Array(out))
            }
            "reverse" => {
                no_args("reverse", &args)?;
                match require_input("reverse", input)? {
                    Value::Array(mut a) => {
                        a.reverse();
                        Ok(Value::Array(a))
                    }
                    Value::String(s) => Ok(json!(s.chars().rev().collect::<String>())),
                    other => Err(DfmError::schema(format!(
                        "reverse() requires array or string input, got {}",
                        type_name(&other)
                    ))),
                }
            }
            "first" => {
                no_args("first", &args)?;
                let items = as_array(&require_input("first", input)?, "first")?;
                Ok(items.into_iter().next().unwrap_or(Value::Null))
            }
            "last" => {
                no_args("last", &args)?;
                let items = as_array(&require_input("last", input)?, "last")?;
                Ok(items.into_iter().next_back().unwrap_or(Value::Null))
            }
            "flatten" => {
                let depth = match args.len() {
                    0 => 1,
                    1 => as_i64(&args[0]).ok_or_else(|| {
                        DfmError::schema("flatten() depth must be an integer")
                    })?,
                    _ => return Err(DfmError::schema("flatten() takes at most one argument")),
                };
                let items = as_array(&require_input("flatten", input)?, "flatten")?;
                Ok(Value::Array(flatten(items, depth)))
            }
            "type" => {
                no_args("type", &args)?;
                Ok(json!(type_name(&require_input("type", input)?)))
            }
            "split" => {
                if args.len() != 1 {
                    return Err(DfmError::schema(
                        "split() requires exactly one argument (separator)",
                    ));
                }
                let s = match require_input("split", input)? {
                    Value::String(s) => s,
                    other => {
                        return Err(DfmError::schema(format!(
                            "split() can only be applied to strings, not {}",
                            type_name(&other)
                        )))
                    }
                };
                let sep = match &args[0] {
                    Value::String(sep) => sep.clone(),
                    other => {
                        return Err(DfmError::schema(format!(
                            "split() separator must be a string, not {}",
                            type_name(other)
                        )))
                    }
                };
                Ok(json!(s.split(&sep).collect::<Vec<_>>()))
            }
            "shell" => {
                if args.len() != 1 {
                    return Err(DfmError::schema("shell() requires exactly one argument"));
                }
                let cmd = to_display_string(&args[0]);
                self.builtin_shell(&cmd)
            }
            other => Err(DfmError::name_not_found_in(other, BUILTINS.iter().copied())),
        }
    }

    /// `shell(cmd)`: expand nested `${{ ... }}` in the command, run it, and
    /// return stdout with the trailing newline stripped.
    fn builtin_shell(&self, cmd: &str) -> Result<Value> {
        let cmd = expand_nested(cmd, self)?;
        debug!(cmd = %cmd, "shell() builtin");
        let out = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .output()
            .map_err(|e| DfmError::io(format!("spawning '{}'", cmd), e))?;
        let stdout = String::from_utf8_lossy(&out.stdout).to_string();
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(DfmError::ShellFailed {
                cmd,
                status: out.status.code().unwrap_or(-1),
                output: format!("{}{}", stdout, stderr),
            });
        }
        Ok(json!(stdout.trim_end_matches('\n')))
    }
}

// ============================================================================
// VALUE HELPERS
// ============================================================================

pub const BUILTINS: &[&str] = &[
    "length", "keys", "values", "sort", "unique", "reverse", "map", "select", "first", "last",
    "flatten", "type", "split", "group_by", "shell",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Truthiness: null, false, "", 0, [], {} are false; everything else true
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

/// `null|boolean|number|string|array|object`
pub fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Strings render raw; everything else renders as canonical JSON
pub fn to_display_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Canonical key for dedup/grouping (sorted object keys)
pub fn canonical_key(v: &Value) -> String {
    fn canon(v: &Value) -> Value {
        match v {
            Value::Object(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for k in keys {
                    out.insert(k.clone(), canon(&m[k]));
                }
                Value::Object(out)
            }
            Value::Array(a) => Value::Array(a.iter().map(canon).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&canon(v)).unwrap_or_default()
}

fn as_i64(v: &Value) -> Option<i64> {
    v.as_i64()
}

fn as_array(v: &Value, what: &str) -> Result<Vec<Value>> {
    match v {
        Value::Array(a) => Ok(a.clone()),
        other => Err(DfmError::schema(format!(
            "{}() requires array input, got {}",
            what,
            type_name(other)
        ))),
    }
}

fn require_input(what: &str, input: Option<Value>) -> Result<Value> {
    input.ok_or_else(|| DfmError::schema(format!("{}() requires a piped input value", what)))
}

fn no_args(what: &str, args: &[Value]) -> Result<()> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(DfmError::schema(format!("{}() takes no arguments", what)))
    }
}

fn one_expr_arg<'a>(what: &str, args: &'a [Expr]) -> Result<&'a Expr> {
    if args.len() == 1 {
        Ok(&args[0])
    } else {
        Err(DfmError::schema(format!(
            "{}() requires exactly one argument (expression)",
            what
        )))
    }
}

fn flatten(items: Vec<Value>, depth: i64) -> Vec<Value> {
    if depth <= 0 {
        return items;
    }
    let mut out = Vec::new();
    for item in items {
        match item {
            Value::Array(inner) => out.extend(flatten(inner, depth - 1)),
            other => out.push(other),
        }
    }
    out
}

fn add_values(l: &Value, r: &Value) -> Result<Value> {
    match (l, r) {
        (Value::String(a), Value::String(b)) => Ok(json!(format!("{}{}", a, b))),
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.clone();
            out.extend(b.clone());
            Ok(Value::Array(out))
        }
        _ => arith(l, r, "+", |a, b| a + b, |a, b| a.checked_add(b)),
    }
}

fn arith(
    l: &Value,
    r: &Value,
    op: &str,
    ff: impl Fn(f64, f64) -> f64,
    fi: impl Fn(i64, i64) -> Option<i64>,
) -> Result<Value> {
    match (l.as_i64(), r.as_i64()) {
        (Some(a), Some(b)) => {
            let v = fi(a, b)
                .ok_or_else(|| DfmError::schema(format!("integer overflow in '{}'", op)))?;
            Ok(json!(v))
        }
        _ => match (l.as_f64(), r.as_f64()) {
            (Some(a), Some(b)) => Ok(json!(ff(a, b))),
            _ => Err(DfmError::schema(format!(
                "cannot apply '{}' to {} and {}",
                op,
                type_name(l),
                type_name(r)
            ))),
        },
    }
}

fn div_values(l: &Value, r: &Value) -> Result<Value> {
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        if b == 0 {
            return Err(DfmError::schema("division by zero"));
        }
        if a % b == 0 {
            return Ok(json!(a / b));
        }
        return Ok(json!(a as f64 / b as f64));
    }
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => {
            if b == 0.0 {
                return Err(DfmError::schema("division by zero"));
            }
            Ok(json!(a / b))
        }
        _ => Err(DfmError::schema(format!(
            "cannot apply '/' to {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

/// Ordering for sort/comparison; requires comparable homogeneous values
fn ord(l: &Value, r: &Value) -> Result<std::cmp::Ordering> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => {
            let a = l.as_f64().unwrap_or(f64::NAN);
            let b = r.as_f64().unwrap_or(f64::NAN);
            a.partial_cmp(&b)
                .ok_or_else(|| DfmError::schema("numbers are not comparable"))
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
        _ => Err(DfmError::schema(format!(
            "cannot compare {} and {}",
            type_name(l),
            type_name(r)
        ))),
    }
}

fn index_value(obj: &Value, index: &Value) -> Result<Value> {
    match obj {
        Value::Array(a) => {
            let i = as_i64(index)
                .ok_or_else(|| DfmError::schema("array index must be an integer"))?;
            let i = normalize_index(i, a.len());
            Ok(i.and_then(|i| a.get(i)).cloned().unwrap_or(Value::Null))
        }
        Value::Object(m) => {
            let key = match index {
                Value::String(s) => s.clone(),
                other => to_display_string(other),
            };
            Ok(m.get(&key).cloned().unwrap_or(Value::Null))
        }
        Value::String(s) => {
            let i = as_i64(index)
                .ok_or_else(|| DfmError::schema("string index must be an integer"))?;
            let chars: Vec<char> = s.chars().collect();
            let i = normalize_index(i, chars.len());
            Ok(i.and_then(|i| chars.get(i))
                .map(|c| json!(c.to_string()))
                .unwrap_or(Value::Null))
        }
        other => Err(DfmError::schema(format!(
            "cannot index {}",
            type_name(other)
        ))),
    }
}

/// Negative indices count from the end
fn normalize_index(i: i64, len: usize) -> Option<usize> {
    if i < 0 {
        let i = i + len as i64;
        (i >= 0).then_some(i as usize)
    } else {
        Some(i as usize)
    }
}

fn slice_value(obj: &Value, start: Option<&Value>, end: Option<&Value>) -> Result<Value> {
    fn bounds(start: Option<i64>, end: Option<i64>, len: usize) -> (usize, usize) {
        let clamp = |i: i64| -> usize {
            let i = if i < 0 { i + len as i64 } else { i };
            i.clamp(0, len as i64) as usize
        };
        let s = start.map(clamp).unwrap_or(0);
        let e = end.map(clamp).unwrap_or(len);
        (s, e.max(s))
    }
    let s = start.map(|v| as_i64(v).ok_or_else(|| DfmError::schema("slice bound must be an integer")))
        .transpose()?;
    let e = end
        .map(|v| as_i64(v).ok_or_else(|| DfmError::schema("slice bound must be an integer")))
        .transpose()?;
    match obj {
        Value::Array(a) => {
            let (s, e) = bounds(s, e, a.len());
            Ok(Value::Array(a[s..e].to_vec()))
        }
        Value::String(st) => {
            let chars: Vec<char> = st.chars().collect();
            let (s, e) = bounds(s, e, chars.len());
            Ok(json!(chars[s..e].iter().collect::<String>()))
        }
        other => Err(DfmError::schema(format!(
            "cannot slice {}",
            type_name(other)
        ))),
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EvalCtx {
        let mut c = EvalCtx::new();
        c.set("count", json!(3));
        c.set("name", json!("rtl"));
        c.set("files", json!(["a.sv", "b.sv", "c.sv"]));
        c.set("env", json!({"CC": "clang", "HOME": "/home/u"}));
        c.set("compile.rundir", json!("/tmp/run/compile"));
        c
    }

    #[test]
    fn test_eval_arith_precedence() {
        assert_eq!(ctx().eval_str("1 + 2 * 3").unwrap(), json!(7));
        assert_eq!(ctx().eval_str("(1 + 2) * 3").unwrap(), json!(9));
        assert_eq!(ctx().eval_str("7 / 2").unwrap(), json!(3.5));
        assert_eq!(ctx().eval_str("6 / 2").unwrap(), json!(3));
    }

    #[test]
    fn test_eval_string_concat() {
        assert_eq!(
            ctx().eval_str("\"lib\" + name").unwrap(),
            json!("librtl")
        );
    }

    #[test]
    fn test_eval_comparison_and_logic() {
        assert_eq!(ctx().eval_str("count < 5 && count > 1").unwrap(), json!(true));
        assert_eq!(ctx().eval_str("!count").unwrap(), json!(false));
        assert_eq!(ctx().eval_str("name == \"rtl\"").unwrap(), json!(true));
    }

    #[test]
    fn test_eval_truthiness_table() {
        for (src, expect) in [
            ("0 || false", false),
            ("\"\" || false", false),
            ("\"x\" && 1", true),
        ] {
            assert_eq!(ctx().eval_str(src).unwrap(), json!(expect), "{}", src);
        }
    }

    #[test]
    fn test_eval_hid_longest_prefix() {
        // "compile.rundir" is bound as a dotted key; must win over
        // traversal of a (nonexistent) "compile" object
        assert_eq!(
            ctx().eval_str("compile.rundir").unwrap(),
            json!("/tmp/run/compile")
        );
        assert_eq!(ctx().eval_str("env.CC").unwrap(), json!("clang"));
    }

    #[test]
    fn test_eval_default_value() {
        assert_eq!(ctx().eval_str("env.CXX:-g++").unwrap(), json!("g++"));
        assert_eq!(ctx().eval_str("missing:-fallback").unwrap(), json!("fallback"));
        // Bound name ignores the default
        assert_eq!(ctx().eval_str("env.CC:-gcc").unwrap(), json!("clang"));
    }

    #[test]
    fn test_eval_unknown_name_fails() {
        let err = ctx().eval_str("nonesuch").unwrap_err();
        assert!(matches!(err, DfmError::NameNotFound { .. }));
    }

    #[test]
    fn test_eval_index_slice_iter() {
        assert_eq!(ctx().eval_str("files[0]").unwrap(), json!("a.sv"));
        assert_eq!(ctx().eval_str("files[-1]").unwrap(), json!("c.sv"));
        assert_eq!(ctx().eval_str("files[1:]").unwrap(), json!(["b.sv", "c.sv"]));
        assert_eq!(ctx().eval_str("files[:2]").unwrap(), json!(["a.sv", "b.sv"]));
        assert_eq!(ctx().eval_str("files[]").unwrap(), json!(["a.sv", "b.sv", "c.sv"]));
    }

    #[test]
    fn test_builtin_length_keys_values() {
        assert_eq!(ctx().eval_str("files | length").unwrap(), json!(3));
        assert_eq!(ctx().eval_str("env | keys").unwrap(), json!(["CC", "HOME"]));
        assert_eq!(ctx().eval_str("files | keys").unwrap(), json!([0, 1, 2]));
        assert_eq!(ctx().eval_str("length(files)").unwrap(), json!(3));
    }

    #[test]
    fn test_builtin_sort_unique_reverse() {
        let mut c = ctx();
        c.set("nums", json!([3, 1, 2, 1]));
        assert_eq!(c.eval_str("nums | sort").unwrap(), json!([1, 1, 2, 3]));
        assert_eq!(c.eval_str("nums | unique").unwrap(), json!([3, 1, 2]));
        assert_eq!(c.eval_str("nums | reverse").unwrap(), json!([1, 2, 1, 3]));
        assert_eq!(c.eval_str("\"abc\" | reverse").unwrap(), json!("cba"));
    }

    #[test]
    fn test_builtin_sort_mixed_fails() {
        let mut c = ctx();
        c.set("mixed", json!([1, "a"]));
        assert!(c.eval_str("mixed | sort").is_err());
    }

    #[test]
    fn test_builtin_first_last_flatten() {
        assert_eq!(ctx().eval_str("files | first").unwrap(), json!("a.sv"));
        assert_eq!(ctx().eval_str("files | last").unwrap(), json!("c.sv"));
        let mut c = ctx();
        c.set("nested", json!([[1, [2]], [3]]));
        assert_eq!(c.eval_str("nested | flatten").unwrap(), json!([1, [2], 3]));
        assert_eq!(c.eval_str("nested | flatten(2)").unwrap(), json!([1, 2, 3]));
        c.set("empty", json!([]));
        assert_eq!(c.eval_str("empty | first").unwrap(), Value::Null);
    }

    #[test]
    fn test_builtin_type_split() {
        assert_eq!(ctx().eval_str("files | type").unwrap(), json!("array"));
        assert_eq!(ctx().eval_str("name | type").unwrap(), json!("string"));
        assert_eq!(
            ctx().eval_str("\"a,b,c\" | split(\",\")").unwrap(),
            json!(["a", "b", "c"])
        );
    }

    #[test]
    fn test_builtin_map_select() {
        let mut c = ctx();
        c.set("nums", json!([1, 2, 3, 4]));
        assert_eq!(
            c.eval_str("nums | map(item * 2)").unwrap(),
            json!([2, 4, 6, 8])
        );
        assert_eq!(
            c.eval_str("nums | select(item > 2)").unwrap(),
            json!([3, 4])
        );
    }

    #[test]
    fn test_builtin_group_by_stable() {
        let mut c = EvalCtx::new();
        c.set(
            "items",
            json!([
                {"kind": "rtl", "n": 1},
                {"kind": "tb", "n": 2},
                {"kind": "rtl", "n": 3}
            ]),
        );
        let groups = c.eval_str("items | group_by(item.kind)").unwrap();
        assert_eq!(
            groups,
            json!([
                [{"kind": "rtl", "n": 1}, {"kind": "rtl", "n": 3}],
                [{"kind": "tb", "n": 2}]
            ])
        );
    }

    #[test]
    fn test_builtin_shell() {
        let v = ctx().eval_str("shell(\"echo hello\")").unwrap();
        assert_eq!(v, json!("hello"));
    }

    #[test]
    fn test_builtin_shell_failure() {
        let err = ctx().eval_str("shell(\"exit 3\")").unwrap_err();
        assert!(matches!(err, DfmError::ShellFailed { status: 3, .. }));
    }

    #[test]
    fn test_builtin_shell_nested_expansion() {
        let mut c = ctx();
        c.set("greeting", json!("hi"));
        let v = c.eval_str("shell(\"echo ${{ greeting }}\")").unwrap();
        assert_eq!(v, json!("hi"));
    }

    #[test]
    fn test_eval_roundtrip_law() {
        // eval(expr) == eval(parse(string(parse(expr))))
        let c = ctx();
        for src in ["1 + 2 * 3", "files | length", "count > 1 && name == \"rtl\""] {
            let ast = parse(src).unwrap();
            let direct = c.eval(&ast).unwrap();
            let rt = c.eval(&parse(&ast.to_string()).unwrap()).unwrap();
            assert_eq!(direct, rt, "roundtrip for '{}'", src);
        }
    }
}
