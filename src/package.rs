//! # Symbol model
//!
//! Packages, symbolic tasks, and types as loaded from package files -
//! before graph construction. A [`Task`] here is a definition (name +
//! uses + needs + body + params); the builder lowers it to executable
//! [`crate::node::TaskNode`]s.
//!
//! Tasks and types are stored in a flat [`SymbolTable`] keyed by qualified
//! name (`pkg.task`); nested task bodies get hierarchical names
//! (`pkg.outer.inner`), giving them a distinct scope that shadows parent
//! names.

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::data::{Consumes, Passthrough};
use crate::errors::{DfmError, Result, SrcLoc};

// ============================================================================
// PARAMETER DECLARATIONS
// ============================================================================

/// A `with:` entry as written in a package file. `ty` introduces a new
/// field; a bare `value` overrides an inherited one. `append`/`prepend`
/// (and their path variants) mutate an inherited list default in place.
#[derive(Debug, Clone, Default)]
pub struct ParamDecl {
    pub name: String,
    pub ty: Option<String>,
    pub value: Option<Value>,
    pub append: Option<Value>,
    pub prepend: Option<Value>,
    pub path_append: Option<Value>,
    pub path_prepend: Option<Value>,
    pub doc: Option<String>,
    pub desc: Option<String>,
    pub srcinfo: Option<SrcLoc>,
}

// ============================================================================
// TASKS
// ============================================================================

/// Which of the exclusive name-forms introduced this task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NameForm {
    #[default]
    Name,
    Root,
    Export,
    Local,
    Override,
}

/// A `needs:` entry; `splice` is the `<task>.needs` form, which explodes
/// to the referent's own needs. A blocking need waits for the dependency
/// but does not inherit its outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct NeedRef {
    pub name: String,
    pub splice: bool,
    pub block: bool,
}

impl NeedRef {
    pub fn parse(s: &str) -> Self {
        match s.strip_suffix(".needs") {
            Some(base) => Self {
                name: base.to_string(),
                splice: true,
                block: false,
            },
            None => Self {
                name: s.to_string(),
                splice: false,
                block: false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RundirKind {
    #[default]
    Unique,
    Inherit,
}

/// `strategy:` - either a registered generator (plugin interface) or a
/// shell snippet that emits the generated sub-graph description.
#[derive(Debug, Clone, Default)]
pub struct StrategyDef {
    pub generator: Option<String>,
    pub shell: Option<String>,
    pub run: Option<String>,
}

// ============================================================================
// CONTROL FLOW
// ============================================================================

pub const DEFAULT_MAX_ITER: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct StateDef {
    pub init: Map<String, Value>,
    /// Expression transforming state between iterations
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CaseDef {
    /// `when:` expression; `None` is the default case
    pub when: Option<String>,
    pub body: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ControlKind {
    If {
        cond: String,
        body: Vec<String>,
        else_body: Vec<String>,
    },
    While {
        cond: String,
        body: Vec<String>,
    },
    DoWhile {
        until: String,
        body: Vec<String>,
    },
    Repeat {
        count: String,
        until: Option<String>,
        body: Vec<String>,
    },
    Match {
        expr: String,
        cases: Vec<CaseDef>,
    },
}

#[derive(Debug, Clone)]
pub struct ControlDef {
    pub kind: ControlKind,
    pub max_iter: u32,
    pub state: Option<StateDef>,
}

impl ControlDef {
    /// Body task names across all branches/cases
    pub fn body_tasks(&self) -> Vec<&str> {
        match &self.kind {
            ControlKind::If { body, else_body, .. } => {
                body.iter().chain(else_body).map(|s| s.as_str()).collect()
            }
            ControlKind::While { body, .. }
            | ControlKind::DoWhile { body, .. }
            | ControlKind::Repeat { body, .. } => body.iter().map(|s| s.as_str()).collect(),
            ControlKind::Match { cases, .. } => cases
                .iter()
                .flat_map(|c| c.body.iter().map(|s| s.as_str()))
                .collect(),
        }
    }
}

// ============================================================================
// TASK / TYPE DEFINITIONS
// ============================================================================

/// Symbolic task definition
#[derive(Debug, Clone)]
pub struct Task {
    /// Fully-qualified name (`pkg.task`, or `pkg.outer.inner` for bodies)
    pub name: String,
    pub shortname: String,
    pub pkg: String,
    pub uses: Option<String>,
    pub needs: Vec<NeedRef>,
    pub feeds: Vec<String>,
    /// Nested body tasks (qualified names)
    pub subtasks: Vec<String>,
    pub form: NameForm,
    /// `None` means "not declared": the builder picks the default for the
    /// task's implementation kind
    pub passthrough: Option<Passthrough>,
    pub consumes: Option<Consumes>,
    pub rundir: RundirKind,
    pub iff: Option<String>,
    pub strategy: Option<StrategyDef>,
    pub run: Option<String>,
    pub shell: Option<String>,
    pub control: Option<ControlDef>,
    pub params: Vec<ParamDecl>,
    pub desc: Option<String>,
    pub doc: Option<String>,
    pub srcinfo: SrcLoc,
}

impl Task {
    pub fn new(pkg: &str, shortname: &str) -> Self {
        Self {
            name: format!("{}.{}", pkg, shortname),
            shortname: shortname.to_string(),
            pkg: pkg.to_string(),
            uses: None,
            needs: Vec::new(),
            feeds: Vec::new(),
            subtasks: Vec::new(),
            form: NameForm::Name,
            passthrough: None,
            consumes: None,
            rundir: RundirKind::Unique,
            iff: None,
            strategy: None,
            run: None,
            shell: None,
            control: None,
            params: Vec::new(),
            desc: None,
            doc: None,
            srcinfo: SrcLoc::default(),
        }
    }
}

/// Type definition: parameters and a `uses` chain, no implementation
#[derive(Debug, Clone)]
pub struct TypeDef {
    pub name: String,
    pub shortname: String,
    pub pkg: String,
    pub uses: Option<String>,
    pub params: Vec<ParamDecl>,
    pub srcinfo: SrcLoc,
}

/// Target of a `uses` reference
#[derive(Debug, Clone, Copy)]
pub enum UsesTarget<'a> {
    Task(&'a Task),
    Type(&'a TypeDef),
}

impl<'a> UsesTarget<'a> {
    pub fn name(&self) -> &str {
        match self {
            UsesTarget::Task(t) => &t.name,
            UsesTarget::Type(t) => &t.name,
        }
    }

    pub fn uses(&self) -> Option<&str> {
        match self {
            UsesTarget::Task(t) => t.uses.as_deref(),
            UsesTarget::Type(t) => t.uses.as_deref(),
        }
    }

    pub fn params(&self) -> &[ParamDecl] {
        match self {
            UsesTarget::Task(t) => &t.params,
            UsesTarget::Type(t) => &t.params,
        }
    }
}

// ============================================================================
// PACKAGES
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub name: String,
    pub params: Vec<ParamDecl>,
    /// Ordered task names (qualified)
    pub tasks: Vec<String>,
    pub types: Vec<String>,
    /// (alias, package name); alias equals the name unless `as:` was given
    pub imports: Vec<(String, String)>,
    pub fragments: Vec<PathBuf>,
    pub srcinfo: SrcLoc,
    /// Directory containing the package file
    pub basedir: PathBuf,
}

// ============================================================================
// SYMBOL TABLE
// ============================================================================

/// Flat store of packages, tasks, and types by qualified name, plus the
/// post-load feeds list.
#[derive(Debug, Default)]
pub struct SymbolTable {
    packages: HashMap<String, Package>,
    tasks: HashMap<String, Task>,
    types: HashMap<String, TypeDef>,
    /// `(fed_task, feeding_task)` pairs, applied after all tasks load
    pub feeds: Vec<(String, String)>,
    pub root_package: String,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_package(&mut self, pkg: Package) -> Result<()> {
        if self.packages.contains_key(&pkg.name) {
            return Err(DfmError::DuplicateDefinition {
                name: pkg.name.clone(),
                loc: Some(pkg.srcinfo.clone()),
            });
        }
        self.packages.insert(pkg.name.clone(), pkg);
        Ok(())
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    pub fn package_mut(&mut self, name: &str) -> Option<&mut Package> {
        self.packages.get_mut(name)
    }

    pub fn root(&self) -> Option<&Package> {
        self.packages.get(&self.root_package)
    }

    /// Add a task. `override:` replaces the earlier definition of the same
    /// short name in the same package; any other duplicate is an error.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.name) {
            if task.form == NameForm::Override {
                self.tasks.insert(task.name.clone(), task);
                return Ok(());
            }
            return Err(DfmError::DuplicateDefinition {
                name: task.name.clone(),
                loc: Some(task.srcinfo.clone()),
            });
        }
        if task.form == NameForm::Override {
            return Err(DfmError::name_not_found_in(
                format!("override target '{}'", task.name),
                self.task_names(),
            )
            .at(task.srcinfo.clone()));
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    pub fn add_type(&mut self, ty: TypeDef) -> Result<()> {
        if self.types.contains_key(&ty.name) {
            return Err(DfmError::DuplicateDefinition {
                name: ty.name.clone(),
                loc: Some(ty.srcinfo.clone()),
            });
        }
        self.types.insert(ty.name.clone(), ty);
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn task_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.get_mut(name)
    }

    pub fn type_def(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    pub fn task_names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|s| s.as_str())
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Resolve a task reference from the scope of `from`: the enclosing
    /// scopes of `from` first (innermost wins), then `from`'s package, then
    /// import aliases, then a bare qualified lookup.
    pub fn resolve_task(&self, from: &Task, name: &str) -> Result<&Task> {
        // Sibling scope within the same (possibly nested) parent
        if let Some((parent, _)) = from.name.rsplit_once('.') {
            let mut scope = Some(parent.to_string());
            while let Some(s) = scope {
                let candidate = format!("{}.{}", s, name);
                if let Some(t) = self.tasks.get(&candidate) {
                    return Ok(t);
                }
                scope = s.rsplit_once('.').map(|(p, _)| p.to_string());
            }
        }

        self.resolve_task_from_pkg(&from.pkg, name)
    }

    /// Resolve from a package scope (no enclosing task)
    pub fn resolve_task_from_pkg(&self, pkg: &str, name: &str) -> Result<&Task> {
        if let Some(t) = self.tasks.get(&format!("{}.{}", pkg, name)) {
            return Ok(t);
        }
        // Import-alias qualified (e.g. `hdl.compile` where hdl is an alias)
        if let Some((head, rest)) = name.split_once('.') {
            if let Some(p) = self.packages.get(pkg) {
                for (alias, target) in &p.imports {
                    if alias == head {
                        if let Some(t) = self.tasks.get(&format!("{}.{}", target, rest)) {
                            return Ok(t);
                        }
                    }
                }
            }
        }
        // Fully-qualified
        if let Some(t) = self.tasks.get(name) {
            return Ok(t);
        }
        Err(DfmError::name_not_found_in(name, self.task_names()))
    }

    pub fn resolve_uses(&self, from_pkg: &str, name: &str) -> Result<UsesTarget<'_>> {
        for candidate in [format!("{}.{}", from_pkg, name), name.to_string()] {
            if let Some(t) = self.tasks.get(&candidate) {
                return Ok(UsesTarget::Task(t));
            }
            if let Some(t) = self.types.get(&candidate) {
                return Ok(UsesTarget::Type(t));
            }
        }
        // Import-alias qualified
        if let Some((head, rest)) = name.split_once('.') {
            if let Some(p) = self.packages.get(from_pkg) {
                for (alias, target) in &p.imports {
                    if alias == head {
                        return self.resolve_uses(target, rest);
                    }
                }
            }
        }
        Err(DfmError::name_not_found_in(
            name,
            self.tasks.keys().chain(self.types.keys()).map(|s| s.as_str()),
        ))
    }

    /// Walk the `uses` chain base-first, rejecting cycles
    pub fn uses_chain<'a>(&'a self, leaf: UsesTarget<'a>) -> Result<Vec<UsesTarget<'a>>> {
        let mut chain = vec![leaf];
        let mut visited: Vec<String> = vec![leaf.name().to_string()];
        let mut cur = leaf;
        while let Some(uses) = cur.uses() {
            let pkg = match cur {
                UsesTarget::Task(t) => t.pkg.as_str(),
                UsesTarget::Type(t) => t.pkg.as_str(),
            };
            let next = self.resolve_uses(pkg, uses)?;
            if visited.iter().any(|v| v == next.name()) {
                visited.push(next.name().to_string());
                return Err(DfmError::Cycle { path: visited });
            }
            visited.push(next.name().to_string());
            chain.push(next);
            cur = next;
        }
        chain.reverse();
        Ok(chain)
    }

    /// Canonical JSON rendering of a package: task/type names, `uses`
    /// edges, needs, and parameter defaults, in stable order. Two loads
    /// of equivalent sources produce identical renderings.
    pub fn package_to_json(&self, pkg_name: &str) -> Option<serde_json::Value> {
        let pkg = self.packages.get(pkg_name)?;
        let task_json = |name: &String| {
            let t = self.tasks.get(name)?;
            Some(serde_json::json!({
                "name": t.name,
                "uses": t.uses,
                "needs": t.needs.iter().map(|n| {
                    serde_json::json!({"name": n.name, "splice": n.splice, "block": n.block})
                }).collect::<Vec<_>>(),
                "params": t.params.iter().map(|p| {
                    serde_json::json!({"name": p.name, "type": p.ty, "value": p.value})
                }).collect::<Vec<_>>(),
            }))
        };
        Some(serde_json::json!({
            "name": pkg.name,
            "tasks": pkg.tasks.iter().filter_map(task_json).collect::<Vec<_>>(),
            "types": pkg.types.iter().filter_map(|name| {
                let t = self.types.get(name)?;
                Some(serde_json::json!({
                    "name": t.name,
                    "uses": t.uses,
                    "params": t.params.iter().map(|p| {
                        serde_json::json!({"name": p.name, "type": p.ty, "value": p.value})
                    }).collect::<Vec<_>>(),
                }))
            }).collect::<Vec<_>>(),
            "imports": pkg.imports.iter().map(|(a, n)| {
                serde_json::json!({"as": a, "package": n})
            }).collect::<Vec<_>>(),
        }))
    }

    /// Apply collected `feeds:` declarations: each feeder is appended to
    /// the fed task's needs (idempotent).
    pub fn apply_feeds(&mut self) -> Result<()> {
        let feeds = std::mem::take(&mut self.feeds);
        for (fed, feeder) in &feeds {
            let fed_name = {
                let feeder_task = self
                    .tasks
                    .get(feeder)
                    .ok_or_else(|| DfmError::name_not_found(feeder.clone()))?;
                self.resolve_task(feeder_task, fed)?.name.clone()
            };
            let task = self
                .tasks
                .get_mut(&fed_name)
                .ok_or_else(|| DfmError::name_not_found(fed_name.clone()))?;
            if !task.needs.iter().any(|n| n.name == *feeder) {
                task.needs.push(NeedRef {
                    name: feeder.clone(),
                    splice: false,
                    block: false,
                });
            }
        }
        self.feeds = feeds;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(tasks: Vec<Task>) -> SymbolTable {
        let mut t = SymbolTable::new();
        t.root_package = "p".to_string();
        t.add_package(Package {
            name: "p".to_string(),
            ..Package::default()
        })
        .unwrap();
        for task in tasks {
            t.add_task(task).unwrap();
        }
        t
    }

    #[test]
    fn test_need_ref_splice() {
        assert_eq!(
            NeedRef::parse("compile.needs"),
            NeedRef {
                name: "compile".to_string(),
                splice: true,
                block: false
            }
        );
        assert_eq!(
            NeedRef::parse("compile"),
            NeedRef {
                name: "compile".to_string(),
                splice: false,
                block: false
            }
        );
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let mut t = table_with(vec![Task::new("p", "a")]);
        let err = t.add_task(Task::new("p", "a")).unwrap_err();
        assert!(matches!(err, DfmError::DuplicateDefinition { .. }));
    }

    #[test]
    fn test_override_replaces_existing() {
        let mut t = table_with(vec![Task::new("p", "a")]);
        let mut repl = Task::new("p", "a");
        repl.form = NameForm::Override;
        repl.run = Some("echo new".to_string());
        t.add_task(repl).unwrap();
        assert_eq!(t.task("p.a").unwrap().run.as_deref(), Some("echo new"));
    }

    #[test]
    fn test_override_without_target_fails() {
        let mut t = table_with(vec![]);
        let mut repl = Task::new("p", "ghost");
        repl.form = NameForm::Override;
        assert!(t.add_task(repl).is_err());
    }

    #[test]
    fn test_uses_chain_base_first() {
        let mut base = Task::new("p", "base");
        base.params.push(ParamDecl {
            name: "x".to_string(),
            ..ParamDecl::default()
        });
        let mut mid = Task::new("p", "mid");
        mid.uses = Some("base".to_string());
        let mut leaf = Task::new("p", "leaf");
        leaf.uses = Some("mid".to_string());

        let t = table_with(vec![base, mid, leaf]);
        let chain = t
            .uses_chain(UsesTarget::Task(t.task("p.leaf").unwrap()))
            .unwrap();
        let names: Vec<&str> = chain.iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["p.base", "p.mid", "p.leaf"]);
    }

    #[test]
    fn test_uses_cycle_detected() {
        let mut a = Task::new("p", "a");
        a.uses = Some("b".to_string());
        let mut b = Task::new("p", "b");
        b.uses = Some("a".to_string());
        let t = table_with(vec![a, b]);
        let err = t
            .uses_chain(UsesTarget::Task(t.task("p.a").unwrap()))
            .unwrap_err();
        match err {
            DfmError::Cycle { path } => {
                assert_eq!(path, vec!["p.a", "p.b", "p.a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_scope_shadows_parent() {
        let mut outer = Task::new("p", "outer");
        outer.subtasks.push("p.outer.helper".to_string());
        let mut nested = Task::new("p", "outer.helper");
        nested.name = "p.outer.helper".to_string();
        nested.shortname = "helper".to_string();
        let toplevel = Task::new("p", "helper");

        let t = table_with(vec![outer, nested, toplevel]);
        let inner_ref = t.task("p.outer.helper").unwrap();
        // From inside the body, "helper" resolves to the sibling
        let resolved = t.resolve_task(inner_ref, "helper").unwrap();
        assert_eq!(resolved.name, "p.outer.helper");
        // From package scope it resolves to the top-level task
        let resolved = t.resolve_task_from_pkg("p", "helper").unwrap();
        assert_eq!(resolved.name, "p.helper");
    }

    #[test]
    fn test_apply_feeds_idempotent() {
        let fed = Task::new("p", "consumer");
        let feeder = Task::new("p", "producer");
        let mut t = table_with(vec![fed, feeder]);
        t.feeds.push(("consumer".to_string(), "p.producer".to_string()));
        t.apply_feeds().unwrap();
        t.feeds = vec![("consumer".to_string(), "p.producer".to_string())];
        t.apply_feeds().unwrap();
        let needs = &t.task("p.consumer").unwrap().needs;
        assert_eq!(needs.len(), 1);
        assert_eq!(needs[0].name, "p.producer");
    }
}
