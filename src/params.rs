//! # Parameter schemas and records
//!
//! The source of truth for a task's parameters is a schema descriptor
//! (ordered field declarations merged across the `uses` chain) plus a
//! generic record carrier holding the resolved values. A value is either a
//! concrete JSON value or a [`DeferredExpr`] awaiting task-run evaluation.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::errors::{DfmError, Result};
use crate::expr::DeferredExpr;

// ============================================================================
// SCHEMA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Int,
    Bool,
    List,
    Map,
    Any,
}

impl ParamKind {
    pub fn from_type_str(s: &str) -> Result<Self> {
        match s {
            "str" | "string" => Ok(ParamKind::Str),
            "int" => Ok(ParamKind::Int),
            "bool" => Ok(ParamKind::Bool),
            "list" => Ok(ParamKind::List),
            "map" => Ok(ParamKind::Map),
            "any" => Ok(ParamKind::Any),
            other => Err(DfmError::schema(format!(
                "unknown parameter type '{}'",
                other
            ))),
        }
    }

    pub fn accepts(&self, v: &Value) -> bool {
        match self {
            ParamKind::Str => v.is_string(),
            ParamKind::Int => v.is_i64() || v.is_u64(),
            ParamKind::Bool => v.is_boolean(),
            ParamKind::List => v.is_array(),
            ParamKind::Map => v.is_object(),
            ParamKind::Any => true,
        }
    }

    pub fn default_value(&self) -> Value {
        match self {
            ParamKind::Str => json!(""),
            ParamKind::Int => json!(0),
            ParamKind::Bool => json!(false),
            ParamKind::List => json!([]),
            ParamKind::Map => json!({}),
            ParamKind::Any => Value::Null,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldDecl {
    pub name: String,
    pub kind: ParamKind,
    pub doc: Option<String>,
}

/// Ordered field declarations; order is declaration order across the
/// `uses` chain, base first.
#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    fields: Vec<FieldDecl>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, kind: ParamKind, doc: Option<String>) {
        let name = name.into();
        if let Some(f) = self.fields.iter_mut().find(|f| f.name == name) {
            f.kind = kind;
            if doc.is_some() {
                f.doc = doc;
            }
        } else {
            self.fields.push(FieldDecl { name, kind, doc });
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

// ============================================================================
// RECORD
// ============================================================================

#[derive(Debug, Clone)]
pub enum ParamValue {
    Value(Value),
    Deferred(DeferredExpr),
}

impl ParamValue {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            ParamValue::Value(v) => Some(v),
            ParamValue::Deferred(_) => None,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, ParamValue::Deferred(_))
    }
}

/// A task's parameter record: schema plus current values. Iteration order
/// follows the schema.
#[derive(Debug, Clone, Default)]
pub struct ParamRecord {
    schema: ParamSchema,
    values: HashMap<String, ParamValue>,
}

impl ParamRecord {
    pub fn new(schema: ParamSchema) -> Self {
        Self {
            schema,
            values: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &ParamSchema {
        &self.schema
    }

    /// Set a field that must already exist on the schema
    pub fn set(&mut self, name: &str, value: ParamValue) -> Result<()> {
        let decl = self.schema.field(name).ok_or_else(|| {
            DfmError::name_not_found_in(name, self.schema.names())
        })?;
        if let ParamValue::Value(v) = &value {
            if !decl.kind.accepts(v) && !v.is_null() {
                return Err(DfmError::schema(format!(
                    "parameter '{}' expects {:?}, got {}",
                    name,
                    decl.kind,
                    crate::expr::eval::type_name(v)
                )));
            }
        }
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /// Declare-and-set for schema construction paths
    pub fn declare_set(&mut self, name: &str, kind: ParamKind, value: ParamValue) {
        self.schema.declare(name, kind, None);
        self.values.insert(name.to_string(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    pub fn get_value(&self, name: &str) -> Option<&Value> {
        self.values.get(name).and_then(|v| v.as_value())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get_value(name).and_then(|v| v.as_str())
    }

    /// Fields in schema order, filling schema defaults for unset fields
    pub fn iter(&self) -> impl Iterator<Item = (&str, ParamValue)> {
        self.schema.fields().iter().map(move |f| {
            let v = self
                .values
                .get(&f.name)
                .cloned()
                .unwrap_or(ParamValue::Value(f.kind.default_value()));
            (f.name.as_str(), v)
        })
    }

    pub fn has_deferred(&self) -> bool {
        self.values.values().any(|v| v.is_deferred())
    }

    /// All values as a JSON object; requires every field to be resolved
    pub fn resolved(&self) -> Result<Map<String, Value>> {
        let mut out = Map::new();
        for (name, value) in self.iter() {
            match value {
                ParamValue::Value(v) => {
                    out.insert(name.to_string(), v);
                }
                ParamValue::Deferred(d) => {
                    return Err(DfmError::schema(format!(
                        "parameter '{}' still deferred: {}",
                        name,
                        d.src()
                    )));
                }
            }
        }
        Ok(out)
    }

    /// JSON rendering for exec-data dumps; deferred values render as their
    /// template source.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (name, value) in self.iter() {
            let v = match value {
                ParamValue::Value(v) => v,
                ParamValue::Deferred(d) => json!(d.src()),
            };
            out.insert(name.to_string(), v);
        }
        Value::Object(out)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_declare_order_preserved() {
        let mut s = ParamSchema::new();
        s.declare("b", ParamKind::Str, None);
        s.declare("a", ParamKind::Int, None);
        let names: Vec<&str> = s.names().collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_schema_redeclare_updates_in_place() {
        let mut s = ParamSchema::new();
        s.declare("x", ParamKind::Str, None);
        s.declare("y", ParamKind::Str, None);
        s.declare("x", ParamKind::Int, None);
        let names: Vec<&str> = s.names().collect();
        assert_eq!(names, vec!["x", "y"]);
        assert_eq!(s.field("x").unwrap().kind, ParamKind::Int);
    }

    #[test]
    fn test_record_set_unknown_field_fails() {
        let mut r = ParamRecord::new(ParamSchema::new());
        let err = r.set("nope", ParamValue::Value(json!(1))).unwrap_err();
        assert!(matches!(err, DfmError::NameNotFound { .. }));
    }

    #[test]
    fn test_record_kind_check() {
        let mut s = ParamSchema::new();
        s.declare("n", ParamKind::Int, None);
        let mut r = ParamRecord::new(s);
        assert!(r.set("n", ParamValue::Value(json!("str"))).is_err());
        assert!(r.set("n", ParamValue::Value(json!(3))).is_ok());
        assert_eq!(r.get_value("n"), Some(&json!(3)));
    }

    #[test]
    fn test_record_defaults_fill_in_iter() {
        let mut s = ParamSchema::new();
        s.declare("files", ParamKind::List, None);
        let r = ParamRecord::new(s);
        let resolved = r.resolved().unwrap();
        assert_eq!(resolved["files"], json!([]));
    }

    #[test]
    fn test_resolved_rejects_deferred() {
        let mut s = ParamSchema::new();
        s.declare("x", ParamKind::Any, None);
        let mut r = ParamRecord::new(s);
        r.set(
            "x",
            ParamValue::Deferred(DeferredExpr::new(json!("${{ inputs }}"), Default::default())),
        )
        .unwrap();
        assert!(r.has_deferred());
        assert!(r.resolved().is_err());
        // exec-data rendering shows the template source instead
        assert_eq!(r.to_json()["x"], json!("${{ inputs }}"));
    }
}
