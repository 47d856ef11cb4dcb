//! # Filter definitions and registry
//!
//! Filters are reusable named transforms invocable via the pipe operator:
//! `${{ inputs | rtl_only }}`. A filter declares exactly one implementation:
//!
//! - `expr:` - an expression evaluated with the filter's declared parameter
//!   names bound to the call arguments and `input` bound to the piped value
//! - `run:` - a script; the piped value arrives as canonical JSON on stdin,
//!   parameters as uppercased environment variables, and stdout is parsed
//!   back as JSON (10 s timeout). Python shells must define a callable named
//!   `filter` that receives `(input_data, **params)`.
//!
//! The registry is package-scoped: resolution tries the requesting package
//! first (local shadowing), then its imports, enforcing visibility.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use crate::errors::{DfmError, Result};
use crate::expr::eval::{to_display_string, EvalCtx};

/// Script filters are killed after this long
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// FILTER DEFINITION
// ============================================================================

/// Who may reference a filter
#[derive(Debug, Clone, PartialEq, Default)]
pub enum FilterVisibility {
    /// Visible to the owning package and its direct importers
    #[default]
    Default,
    /// Visible to any package that can reach the owner through imports
    Export,
    /// Visible only within the owning package
    Local,
    /// Visible only to the root package
    Root,
    /// Visible only to the named packages
    Packages(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterDef {
    pub name: String,
    /// Declared parameter names, bound positionally at call sites
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(skip)]
    pub visibility: FilterVisibility,
}

impl FilterDef {
    /// A filter declares exactly one of `expr` / `run`
    pub fn validate(&self) -> Result<()> {
        match (&self.expr, &self.run) {
            (Some(_), Some(_)) => Err(DfmError::schema(format!(
                "filter '{}' declares both 'expr' and 'run'",
                self.name
            ))),
            (None, None) => Err(DfmError::schema(format!(
                "filter '{}' has no implementation",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Package-scoped store of filter definitions
#[derive(Debug, Default)]
pub struct FilterRegistry {
    /// package name -> filter name -> def
    filters: HashMap<String, HashMap<String, FilterDef>>,
    /// package name -> imported package names
    imports: HashMap<String, Vec<String>>,
    root_package: Option<String>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_root_package(&mut self, pkg: impl Into<String>) {
        self.root_package = Some(pkg.into());
    }

    pub fn register_package(
        &mut self,
        pkg: &str,
        filters: Vec<FilterDef>,
        imports: Vec<String>,
    ) -> Result<()> {
        let entry = self.filters.entry(pkg.to_string()).or_default();
        for f in filters {
            f.validate()?;
            if entry.contains_key(&f.name) {
                return Err(DfmError::DuplicateDefinition {
                    name: format!("{}.{}", pkg, f.name),
                    loc: None,
                });
            }
            debug!(pkg, filter = %f.name, "registered filter");
            entry.insert(f.name.clone(), f);
        }
        self.imports.insert(pkg.to_string(), imports);
        Ok(())
    }

    /// Resolve a filter name, qualified (`pkg.filter`) or bare, with
    /// visibility checking.
    pub fn resolve(&self, requesting_pkg: &str, name: &str) -> Result<&FilterDef> {
        if let Some((pkg, filt)) = name.rsplit_once('.') {
            if let Some(def) = self.filters.get(pkg).and_then(|m| m.get(filt)) {
                self.check_visibility(requesting_pkg, pkg, def)?;
                return Ok(def);
            }
            return Err(DfmError::name_not_found_in(name, self.all_names()));
        }

        // Own package first (local shadowing)
        if let Some(def) = self.filters.get(requesting_pkg).and_then(|m| m.get(name)) {
            return Ok(def);
        }

        // Then imports, in declaration order
        if let Some(imports) = self.imports.get(requesting_pkg) {
            for imported in imports {
                if let Some(def) = self.filters.get(imported).and_then(|m| m.get(name)) {
                    self.check_visibility(requesting_pkg, imported, def)?;
                    return Ok(def);
                }
            }
        }

        Err(DfmError::name_not_found_in(name, self.all_names()))
    }

    fn check_visibility(&self, requesting: &str, owning: &str, def: &FilterDef) -> Result<()> {
        if requesting == owning {
            return Ok(());
        }
        let visible = match &def.visibility {
            FilterVisibility::Default | FilterVisibility::Export => true,
            FilterVisibility::Local => false,
            FilterVisibility::Root => self.root_package.as_deref() == Some(requesting),
            FilterVisibility::Packages(pkgs) => pkgs.iter().any(|p| p == requesting),
        };
        if visible {
            Ok(())
        } else {
            Err(DfmError::VisibilityViolation {
                name: format!("{}.{}", owning, def.name),
                pkg: requesting.to_string(),
            })
        }
    }

    fn all_names(&self) -> impl Iterator<Item = &str> {
        self.filters
            .values()
            .flat_map(|m| m.keys().map(|s| s.as_str()))
    }

    // ------------------------------------------------------------------------
    // Application
    // ------------------------------------------------------------------------

    /// Apply a filter to a piped value. `args` are the call-site arguments
    /// in positional order; they bind to the filter's declared parameter
    /// names.
    pub fn apply(
        &self,
        caller: &EvalCtx,
        requesting_pkg: &str,
        name: &str,
        input: Value,
        args: Vec<Value>,
    ) -> Result<Value> {
        let def = self.resolve(requesting_pkg, name)?;

        if args.len() > def.params.len() {
            return Err(DfmError::schema(format!(
                "filter '{}' takes {} parameter(s), {} given",
                name,
                def.params.len(),
                args.len()
            )));
        }

        let params: Vec<(String, Value)> = def
            .params
            .iter()
            .cloned()
            .zip(args.into_iter())
            .collect();

        if let Some(expr) = &def.expr {
            self.apply_expr(caller, def, expr, input, &params)
        } else if let Some(run) = &def.run {
            apply_script(def, run, input, &params)
        } else {
            Err(DfmError::schema(format!(
                "filter '{}' has no implementation",
                name
            )))
        }
    }

    fn apply_expr(
        &self,
        caller: &EvalCtx,
        def: &FilterDef,
        expr: &str,
        input: Value,
        params: &[(String, Value)],
    ) -> Result<Value> {
        let mut ctx = caller.clone();
        for (name, value) in params {
            ctx.set(name.clone(), value.clone());
        }
        ctx.set("input", input);
        let result = ctx.eval_str(expr).map_err(|e| {
            DfmError::schema(format!("filter '{}' expr failed: {}", def.name, e))
        })?;
        // String results that are themselves JSON decode to structure
        if let Value::String(s) = &result {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                return Ok(parsed);
            }
        }
        Ok(result)
    }
}

// ============================================================================
// SCRIPT EXECUTION
// ============================================================================

static SCRIPT_SEQ: AtomicU64 = AtomicU64::new(0);

fn is_python(shell: &str) -> bool {
    shell == "python" || shell == "python3"
}

/// Driver appended to python filter scripts: decode stdin/params, invoke
/// the user's `filter` callable, emit JSON on stdout.
const PYTHON_DRIVER: &str = r#"
if __name__ == "__main__":
    import json as _json, os as _os, sys as _sys
    _params = _json.loads(_os.environ.get("DFM_FILTER_PARAMS", "{}"))
    _input = _json.load(_sys.stdin)
    _sys.stdout.write(_json.dumps(filter(_input, **_params)))
"#;

fn apply_script(
    def: &FilterDef,
    run: &str,
    input: Value,
    params: &[(String, Value)],
) -> Result<Value> {
    let shell = def.shell.as_deref().unwrap_or("bash");

    let mut script = run.to_string();
    if is_python(shell) {
        script.push_str(PYTHON_DRIVER);
    }

    let seq = SCRIPT_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "dfm-filter-{}-{}.script",
        std::process::id(),
        seq
    ));
    std::fs::write(&path, &script)
        .map_err(|e| DfmError::io(format!("writing {}", path.display()), e))?;

    let result = run_script(shell, &path, &input, params, &def.name);
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove filter script");
    }
    result
}

fn run_script(
    shell: &str,
    path: &std::path::Path,
    input: &Value,
    params: &[(String, Value)],
    name: &str,
) -> Result<Value> {
    let input_json = match input {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    };

    let params_json = serde_json::to_string(
        &params
            .iter()
            .cloned()
            .collect::<serde_json::Map<String, Value>>(),
    )
    .unwrap_or_default();

    let mut cmd = Command::new(shell);
    cmd.arg(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env("DFM_FILTER_PARAMS", &params_json);
    for (pname, pvalue) in params {
        cmd.env(pname.to_uppercase(), to_display_string(pvalue));
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| DfmError::io(format!("spawning filter '{}'", name), e))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input_json.as_bytes())
            .map_err(|e| DfmError::io(format!("writing input to filter '{}'", name), e))?;
    }

    // Drain pipes on threads so a full pipe cannot stall the child
    let mut stdout_pipe = child.stdout.take();
    let out_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(p) = stdout_pipe.as_mut() {
            let _ = p.read_to_string(&mut buf);
        }
        buf
    });
    let mut stderr_pipe = child.stderr.take();
    let err_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(p) = stderr_pipe.as_mut() {
            let _ = p.read_to_string(&mut buf);
        }
        buf
    });

    let status = child
        .wait_timeout(SCRIPT_TIMEOUT)
        .map_err(|e| DfmError::io(format!("waiting for filter '{}'", name), e))?;

    let status = match status {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(DfmError::Timeout(format!(
                "filter '{}' exceeded {} s",
                name,
                SCRIPT_TIMEOUT.as_secs()
            )));
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    if !status.success() {
        return Err(DfmError::ShellFailed {
            cmd: format!("filter '{}'", name),
            status: status.code().unwrap_or(-1),
            output: format!("{}{}", stdout, stderr),
        });
    }

    let out = stdout.trim();
    match serde_json::from_str::<Value>(out) {
        Ok(v) => Ok(v),
        Err(_) => Ok(Value::String(out.to_string())),
    }
}

// ============================================================================
// TESTS
// ============================================================================
