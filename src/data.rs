//! # Data items and propagation policy
//!
//! Typed data items flow along DAG edges. An item is a tagged record:
//! `type` names a Type (e.g. `std.FileSet`), `src`/`seq` identify the
//! producing task and position, and the payload carries the Type's fields.
//! Identity is `(src, seq)` - items are values, not entities.
//!
//! `consumes` filters which upstream items are delivered to a task body;
//! `passthrough` decides which upstream items are forwarded downstream.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{DfmError, Marker, Result};

// ============================================================================
// DATA ITEMS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataItem {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub src: String,
    #[serde(default)]
    pub seq: u32,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl DataItem {
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            src: String::new(),
            seq: 0,
            payload: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> (String, u32) {
        (self.src.clone(), self.seq)
    }

    /// Field access across the fixed header and the payload
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "type" => Some(Value::String(self.ty.clone())),
            "src" => Some(Value::String(self.src.clone())),
            "seq" => Some(Value::from(self.seq)),
            other => self.payload.get(other).cloned(),
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    // ------------------------------------------------------------------------
    // Typed accessors for the std item types
    // ------------------------------------------------------------------------

    pub fn is_fileset(&self) -> bool {
        self.ty == "std.FileSet"
    }

    pub fn is_env(&self) -> bool {
        self.ty == "std.Env"
    }

    pub fn is_message(&self) -> bool {
        self.ty == "std.Message"
    }

    pub fn filetype(&self) -> Option<&str> {
        self.payload.get("filetype").and_then(|v| v.as_str())
    }

    pub fn basedir(&self) -> Option<&str> {
        self.payload.get("basedir").and_then(|v| v.as_str())
    }

    pub fn files(&self) -> Vec<String> {
        self.payload
            .get("files")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `std.Env` items carry a `vals` mapping of environment overrides
    pub fn env_vals(&self) -> HashMap<String, String> {
        self.payload
            .get("vals")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let s = v.as_str().map(String::from).unwrap_or_else(|| v.to_string());
                        (k.clone(), s)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn msg(&self) -> Option<&str> {
        self.payload.get("msg").and_then(|v| v.as_str())
    }
}

// ============================================================================
// CONSUMES / PASSTHROUGH
// ============================================================================

/// Pattern records are conjunctive: an item matches a record iff every
/// named field is attribute-equal on the item.
pub type MatchRecord = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Consumes {
    #[default]
    All,
    No,
    Patterns(Vec<MatchRecord>),
}

impl Consumes {
    pub fn matches(&self, item: &DataItem) -> bool {
        match self {
            Consumes::All => true,
            Consumes::No => false,
            Consumes::Patterns(patterns) => {
                !patterns.is_empty() && patterns.iter().any(|p| matches_record(item, p))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Passthrough {
    #[default]
    Unused,
    All,
    No,
    Patterns(Vec<MatchRecord>),
}

/// An item matches a record iff all of the record's key/value pairs are
/// equal on the item; a missing field means no match.
pub fn matches_record(item: &DataItem, record: &MatchRecord) -> bool {
    record
        .iter()
        .all(|(k, v)| item.field(k).as_ref() == Some(v))
}

// ============================================================================
// TASK DATA ENVELOPES
// ============================================================================

/// Everything a task body receives
#[derive(Debug, Clone)]
pub struct TaskDataInput {
    pub name: String,
    pub changed: bool,
    pub srcdir: PathBuf,
    pub rundir: PathBuf,
    pub params: Map<String, Value>,
    pub inputs: Vec<DataItem>,
    pub memento: Option<Value>,
}

/// What a task body returns
#[derive(Debug, Clone, Default)]
pub struct TaskDataResult {
    pub status: i32,
    pub changed: bool,
    pub output: Vec<DataItem>,
    pub markers: Vec<Marker>,
    pub memento: Option<Value>,
}

impl TaskDataResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_status(status: i32) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }
}

/// Post-propagation envelope stored on a completed node. `dep_m` is the
/// dependency map downstream nodes merge and topologically sort to order
/// their inputs deterministically.
#[derive(Debug, Clone, Default)]
pub struct TaskDataOutput {
    pub changed: bool,
    pub dep_m: BTreeMap<String, Vec<String>>,
    pub output: Vec<DataItem>,
}

// ============================================================================
// ENV MERGING
// ============================================================================

/// Environment for a shell task: inherited process env, then `std.Env`
/// items in dependency order (older first, newer wins per key), then the
/// fixed task keys, then the jobserver MAKEFLAGS.
pub fn merge_env(
    base: &HashMap<String, String>,
    inputs: &[DataItem],
    srcdir: &Path,
    rundir: &Path,
    makeflags: Option<&str>,
) -> HashMap<String, String> {
    let mut env = base.clone();
    for item in inputs.iter().filter(|i| i.is_env()) {
        for (k, v) in item.env_vals() {
            env.insert(k, v);
        }
    }
    env.insert(
        "TASK_SRCDIR".to_string(),
        srcdir.to_string_lossy().to_string(),
    );
    env.insert(
        "TASK_RUNDIR".to_string(),
        rundir.to_string_lossy().to_string(),
    );
    if let Some(mf) = makeflags {
        env.insert("MAKEFLAGS".to_string(), mf.to_string());
    }
    env
}

// ============================================================================
// MEMENTO PERSISTENCE
// ============================================================================

pub const MEMENTO_FILE: &str = "memento.json";

pub fn read_memento(rundir: &Path) -> Option<Value> {
    let path = rundir.join(MEMENTO_FILE);
    let text = std::fs::read_to_string(&path).ok()?;
    serde_json::from_str(&text).ok()
}

/// Atomic write: temp file in the same directory, then rename
pub fn write_memento(rundir: &Path, memento: &Value) -> Result<()> {
    let path = rundir.join(MEMENTO_FILE);
    let tmp = rundir.join(format!(".{}.tmp", MEMENTO_FILE));
    let text = serde_json::to_string_pretty(memento)
        .map_err(|e| DfmError::schema(format!("memento not serializable: {}", e)))?;
    std::fs::write(&tmp, text).map_err(|e| DfmError::io(format!("writing {}", tmp.display()), e))?;
    std::fs::rename(&tmp, &path)
        .map_err(|e| DfmError::io(format!("renaming {}", path.display()), e))?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fileset(src: &str, seq: u32) -> DataItem {
        let mut it = DataItem::new("std.FileSet")
            .with("filetype", json!("systemVerilog"))
            .with("files", json!(["a.sv"]));
        it.src = src.to_string();
        it.seq = seq;
        it
    }

    #[test]
    fn test_item_serde_shape() {
        let it = fileset("compile", 1);
        let v = it.to_value();
        assert_eq!(v["type"], json!("std.FileSet"));
        assert_eq!(v["src"], json!("compile"));
        assert_eq!(v["seq"], json!(1));
        assert_eq!(v["filetype"], json!("systemVerilog"));

        let back: DataItem = serde_json::from_value(v).unwrap();
        assert_eq!(back, it);
    }

    #[test]
    fn test_match_record_conjunctive() {
        let it = fileset("c", 0);
        let mut rec = MatchRecord::new();
        rec.insert("type".to_string(), json!("std.FileSet"));
        assert!(matches_record(&it, &rec));

        rec.insert("filetype".to_string(), json!("vhdl"));
        assert!(!matches_record(&it, &rec));

        // Missing field on the item -> no match
        let mut rec2 = MatchRecord::new();
        rec2.insert("nonexistent".to_string(), json!("x"));
        assert!(!matches_record(&it, &rec2));
    }

    #[test]
    fn test_consumes_policies() {
        let it = fileset("c", 0);
        assert!(Consumes::All.matches(&it));
        assert!(!Consumes::No.matches(&it));
        assert!(!Consumes::Patterns(vec![]).matches(&it));

        let mut rec = MatchRecord::new();
        rec.insert("type".to_string(), json!("std.FileSet"));
        assert!(Consumes::Patterns(vec![rec]).matches(&it));
    }

    #[test]
    fn test_env_merge_order() {
        let mut older = DataItem::new("std.Env").with("vals", json!({"A": "old", "B": "keep"}));
        older.src = "t1".into();
        let mut newer = DataItem::new("std.Env").with("vals", json!({"A": "new"}));
        newer.src = "t2".into();

        let base: HashMap<String, String> =
            [("PATH".to_string(), "/bin".to_string())].into_iter().collect();
        let env = merge_env(
            &base,
            &[older, newer],
            Path::new("/src"),
            Path::new("/run"),
            Some("--jobserver-auth=fifo:/tmp/x"),
        );
        assert_eq!(env["A"], "new");
        assert_eq!(env["B"], "keep");
        assert_eq!(env["PATH"], "/bin");
        assert_eq!(env["TASK_SRCDIR"], "/src");
        assert_eq!(env["TASK_RUNDIR"], "/run");
        assert!(env["MAKEFLAGS"].contains("fifo:"));
    }

    #[test]
    fn test_memento_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_memento(dir.path()).is_none());
        write_memento(dir.path(), &json!({"hash": "abc"})).unwrap();
        assert_eq!(read_memento(dir.path()), Some(json!({"hash": "abc"})));
        // No temp file left behind
        assert!(!dir.path().join(".memento.json.tmp").exists());
    }
}
