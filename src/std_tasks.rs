//! # Bundled `std` package
//!
//! The standard task library every flow can reference: `std.Message`,
//! `std.FileSet`, `std.CreateFile`, `std.Env`, plus the null aggregator
//! used for implementation-less tasks and the shell callable backing
//! `run:` bodies.
//!
//! Implementations register through [`ExtRegistry`], the explicit
//! extension point that also carries shells and `strategy: generate`
//! generators.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::ctxt::TaskRunCtxt;
use crate::data::{DataItem, TaskDataInput, TaskDataResult};
use crate::errors::{DfmError, Result};
use crate::expr::{EvalCtx, Template};
use crate::node::TaskCallable;
use crate::package::{ParamDecl, SymbolTable, Task, TypeDef};

// ============================================================================
// EXTENSION REGISTRY
// ============================================================================

/// `strategy: generate` plugin: synthesizes subtasks for a task at build
/// time.
pub type GeneratorFn = Arc<dyn Fn(&Task) -> Result<Vec<Task>> + Send + Sync>;

/// Explicit registry of shells, task implementations, and generators.
/// Owned by the build invocation and threaded through the builder; there
/// is no process-wide singleton.
pub struct ExtRegistry {
    shells: BTreeSet<String>,
    tasks: HashMap<String, TaskCallable>,
    generators: HashMap<String, GeneratorFn>,
}

impl Default for ExtRegistry {
    fn default() -> Self {
        let mut rgy = Self {
            shells: ["bash", "sh", "zsh", "python", "python3"]
                .into_iter()
                .map(String::from)
                .collect(),
            tasks: HashMap::new(),
            generators: HashMap::new(),
        };
        rgy.register_task("std.Message", message_callable());
        rgy.register_task("std.FileSet", fileset_callable());
        rgy.register_task("std.CreateFile", create_file_callable());
        rgy.register_task("std.Env", env_callable());
        rgy
    }
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_shell(&self, name: &str) -> bool {
        self.shells.contains(name)
    }

    pub fn register_shell(&mut self, name: impl Into<String>) {
        self.shells.insert(name.into());
    }

    pub fn register_task(&mut self, name: impl Into<String>, callable: TaskCallable) {
        self.tasks.insert(name.into(), callable);
    }

    pub fn task(&self, name: &str) -> Option<TaskCallable> {
        self.tasks.get(name).cloned()
    }

    pub fn register_generator(&mut self, name: impl Into<String>, f: GeneratorFn) {
        self.generators.insert(name.into(), f);
    }

    pub fn generator(&self, name: &str) -> Option<GeneratorFn> {
        self.generators.get(name).cloned()
    }
}

// ============================================================================
// STD PACKAGE SYMBOLS
// ============================================================================

fn param(name: &str, ty: &str, value: Value) -> ParamDecl {
    ParamDecl {
        name: name.to_string(),
        ty: Some(ty.to_string()),
        value: Some(value),
        ..ParamDecl::default()
    }
}

/// Register the `std` package's symbolic tasks and types
pub fn register_std(symtab: &mut SymbolTable) -> Result<()> {
    let mut pkg = crate::package::Package {
        name: "std".to_string(),
        ..Default::default()
    };

    let types = [
        ("FileSet", vec![
            param("filetype", "str", json!("")),
            param("basedir", "str", json!("")),
            param("files", "list", json!([])),
            param("incdirs", "list", json!([])),
            param("defines", "map", json!({})),
            param("attributes", "map", json!({})),
        ]),
        ("Env", vec![param("vals", "map", json!({}))]),
        ("Message", vec![param("msg", "str", json!(""))]),
    ];
    for (name, params) in types {
        let qname = format!("std.{}", name);
        pkg.types.push(qname.clone());
        symtab.add_type(TypeDef {
            name: qname,
            shortname: name.to_string(),
            pkg: "std".to_string(),
            uses: None,
            params,
            srcinfo: Default::default(),
        })?;
    }

    let tasks: [(&str, Vec<ParamDecl>); 4] = [
        ("Message", vec![param("msg", "str", json!(""))]),
        ("FileSet", vec![
            param("base", "str", json!("")),
            param("type", "str", json!("")),
            param("include", "str", json!("")),
            param("exclude", "str", json!("")),
        ]),
        ("CreateFile", vec![
            param("filename", "str", json!("")),
            param("content", "str", json!("")),
            param("type", "str", json!("")),
        ]),
        ("Env", vec![param("vals", "map", json!({}))]),
    ];
    for (name, params) in tasks {
        let mut task = Task::new("std", name);
        task.params = params;
        pkg.tasks.push(task.name.clone());
        symtab.add_task(task)?;
    }

    symtab.add_package(pkg)
}

// ============================================================================
// CALLABLES
// ============================================================================

fn str_param<'a>(input: &'a TaskDataInput, name: &str) -> &'a str {
    input.params.get(name).and_then(|v| v.as_str()).unwrap_or("")
}

/// Implementation-less tasks: no outputs of their own; upstream items flow
/// through via the passthrough policy.
pub fn null_callable() -> TaskCallable {
    Arc::new(|_ctxt, input| {
        Box::pin(async move {
            Ok(TaskDataResult {
                changed: input.changed,
                ..TaskDataResult::ok()
            })
        })
    })
}

/// `run:` bodies. `${{ rundir }}` and `${{ <param> }}` placeholders are
/// expanded in a second pass just before execution.
pub fn shell_callable(run: String, shell: String) -> TaskCallable {
    Arc::new(move |ctxt: Arc<TaskRunCtxt>, input: TaskDataInput| {
        let run = run.clone();
        let shell = shell.clone();
        Box::pin(async move {
            let body = expand_body(&run, &input)?;
            let status = ctxt.run_shell_body(&body, &shell).await?;
            Ok(TaskDataResult {
                status,
                changed: true,
                ..TaskDataResult::ok()
            })
        })
    })
}

fn expand_body(body: &str, input: &TaskDataInput) -> Result<String> {
    if !body.contains("${{") {
        return Ok(body.to_string());
    }
    let mut ctx = EvalCtx::new();
    ctx.set("rundir", json!(input.rundir.to_string_lossy()));
    ctx.set("srcdir", json!(input.srcdir.to_string_lossy()));
    ctx.set(
        "inputs",
        Value::Array(input.inputs.iter().map(|i| i.to_value()).collect()),
    );
    if let Some(m) = &input.memento {
        ctx.set("memento", m.clone());
    }
    for (k, v) in &input.params {
        ctx.set(k.clone(), v.clone());
    }
    let v = Template::parse(body)?.eval(&ctx)?;
    Ok(match v {
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// `std.Message`: print the `msg` parameter and emit a Message item
pub fn message_callable() -> TaskCallable {
    Arc::new(|ctxt: Arc<TaskRunCtxt>, input: TaskDataInput| {
        Box::pin(async move {
            let msg = str_param(&input, "msg").to_string();
            println!("[{}] {}", input.name, msg);
            ctxt.info(msg.clone());
            Ok(TaskDataResult {
                changed: false,
                output: vec![DataItem::new("std.Message").with("msg", json!(msg))],
                ..TaskDataResult::ok()
            })
        })
    })
}

/// `std.FileSet`: glob `include` (minus `exclude`) under `base`, relative
/// to the task's srcdir. The memento records file mtimes; `changed` is
/// set when the set or any mtime differs.
pub fn fileset_callable() -> TaskCallable {
    Arc::new(|_ctxt: Arc<TaskRunCtxt>, input: TaskDataInput| {
        Box::pin(async move {
            let base = str_param(&input, "base");
            let include = str_param(&input, "include");
            let exclude = str_param(&input, "exclude");
            let filetype = str_param(&input, "type");

            let basedir = if base.is_empty() {
                input.srcdir.clone()
            } else if Path::new(base).is_absolute() {
                Path::new(base).to_path_buf()
            } else {
                input.srcdir.join(base)
            };

            let pattern = basedir.join(if include.is_empty() { "*" } else { include });
            let mut files: Vec<String> = Vec::new();
            let entries = glob::glob(&pattern.to_string_lossy())
                .map_err(|e| DfmError::schema(format!("invalid glob '{}': {}", include, e)))?;
            for entry in entries.flatten() {
                if let Ok(rel) = entry.strip_prefix(&basedir) {
                    let rel = rel.to_string_lossy().to_string();
                    if !exclude.is_empty() {
                        if let Ok(pat) = glob::Pattern::new(exclude) {
                            if pat.matches(&rel) {
                                continue;
                            }
                        }
                    }
                    files.push(rel);
                }
            }
            files.sort();

            // mtime fingerprint for change detection
            let mut stamp = serde_json::Map::new();
            for f in &files {
                let mtime = std::fs::metadata(basedir.join(f))
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                stamp.insert(f.clone(), json!(mtime));
            }
            let memento = json!({ "files": stamp });
            let changed = input.changed || input.memento.as_ref() != Some(&memento);
            debug!(task = %input.name, files = files.len(), changed, "fileset scan");

            let item = DataItem::new("std.FileSet")
                .with("filetype", json!(filetype))
                .with("basedir", json!(basedir.to_string_lossy()))
                .with("files", json!(files))
                .with("incdirs", json!([]))
                .with("defines", json!({}))
                .with("attributes", json!({}));

            Ok(TaskDataResult {
                changed,
                output: vec![item],
                memento: Some(memento),
                ..TaskDataResult::ok()
            })
        })
    })
}

/// `std.CreateFile`: write `content` to `filename` in the rundir and emit
/// a FileSet for it. Unchanged content leaves `changed` false.
pub fn create_file_callable() -> TaskCallable {
    Arc::new(|ctxt: Arc<TaskRunCtxt>, input: TaskDataInput| {
        Box::pin(async move {
            let filename = str_param(&input, "filename").to_string();
            let content = str_param(&input, "content").to_string();
            let filetype = str_param(&input, "type").to_string();
            if filename.is_empty() {
                return Err(DfmError::schema("CreateFile requires 'filename'"));
            }
            let path = input.rundir.join(&filename);
            let changed = std::fs::read_to_string(&path).ok().as_deref() != Some(&content);
            if changed {
                ctxt.create(&filename, &content)?;
            }
            let item = DataItem::new("std.FileSet")
                .with("filetype", json!(filetype))
                .with("basedir", json!(input.rundir.to_string_lossy()))
                .with("files", json!([filename]));
            Ok(TaskDataResult {
                changed,
                output: vec![item],
                ..TaskDataResult::ok()
            })
        })
    })
}

/// `std.Env`: emit the `vals` mapping as an Env item for downstream
/// environment merging.
pub fn env_callable() -> TaskCallable {
    Arc::new(|_ctxt, input: TaskDataInput| {
        Box::pin(async move {
            let vals = input
                .params
                .get("vals")
                .cloned()
                .unwrap_or_else(|| json!({}));
            Ok(TaskDataResult {
                changed: false,
                output: vec![DataItem::new("std.Env").with("vals", vals)],
                ..TaskDataResult::ok()
            })
        })
    })
}

// ============================================================================
// TESTS
// ============================================================================
