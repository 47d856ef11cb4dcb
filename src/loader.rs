//! # Package loader
//!
//! Loads `flow.yaml` package documents into the [`SymbolTable`]. A package
//! document is a mapping under a top-level `package:` key; fragment files
//! carry the same shape under `fragment:` (no `name:`) and merge into the
//! including package. Fragment directory entries are walked for
//! `flow.dv` / `flow.yaml` / `flow.yml` files.
//!
//! The loader enforces load-time shape rules (exactly one name-form per
//! task record), collects `feeds:` for post-load application, applies
//! `override:` replacement, and registers package filters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use crate::data::{Consumes, MatchRecord, Passthrough};
use crate::errors::{DfmError, Result, SrcLoc};
use crate::filter::{FilterDef, FilterRegistry, FilterVisibility};
use crate::package::{
    CaseDef, ControlDef, ControlKind, NameForm, NeedRef, Package, ParamDecl, RundirKind, StateDef,
    StrategyDef, SymbolTable, Task, TypeDef, DEFAULT_MAX_ITER,
};

// ============================================================================
// YAML DOCUMENT SHAPES
// ============================================================================

#[derive(Debug, Deserialize)]
struct DocFile {
    #[serde(default)]
    package: Option<PackageDoc>,
    #[serde(default)]
    fragment: Option<FragmentDoc>,
}

#[derive(Debug, Deserialize)]
struct PackageDoc {
    name: String,
    #[serde(default)]
    imports: Vec<ImportSpec>,
    #[serde(default)]
    fragments: Vec<String>,
    #[serde(default, rename = "with")]
    with_params: serde_yaml::Mapping,
    #[serde(default)]
    tasks: Vec<TaskDoc>,
    #[serde(default)]
    types: Vec<TypeDoc>,
    #[serde(default)]
    filters: Vec<FilterDoc>,
    #[serde(default)]
    configs: Vec<ConfigDoc>,
    #[serde(default)]
    overrides: Vec<OverrideDoc>,
}

#[derive(Debug, Deserialize)]
struct FragmentDoc {
    #[serde(default)]
    tasks: Vec<TaskDoc>,
    #[serde(default)]
    types: Vec<TypeDoc>,
    #[serde(default)]
    filters: Vec<FilterDoc>,
    #[serde(default, rename = "with")]
    with_params: serde_yaml::Mapping,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportSpec {
    Plain(String),
    Aliased {
        path: String,
        #[serde(rename = "as")]
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum NeedSpec {
    Plain(String),
    Record {
        task: String,
        #[serde(default)]
        block: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ParamSpec {
    Full(ParamSpecFull),
    Plain(serde_yaml::Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamSpecFull {
    #[serde(default, rename = "type")]
    ty: Option<String>,
    #[serde(default)]
    value: Option<serde_yaml::Value>,
    #[serde(default)]
    append: Option<serde_yaml::Value>,
    #[serde(default)]
    prepend: Option<serde_yaml::Value>,
    #[serde(default, rename = "path-append")]
    path_append: Option<serde_yaml::Value>,
    #[serde(default, rename = "path-prepend")]
    path_prepend: Option<serde_yaml::Value>,
    #[serde(default)]
    doc: Option<String>,
    #[serde(default)]
    desc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum PolicySpec {
    Keyword(String),
    Patterns(Vec<MatchRecord>),
}

#[derive(Debug, Clone, Deserialize)]
struct StrategySpec {
    #[serde(default)]
    generate: Option<GenerateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateSpec {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    run: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct StateSpec {
    #[serde(default)]
    init: serde_yaml::Mapping,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CaseSpec {
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    default: bool,
    #[serde(default)]
    body: Vec<TaskDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct TaskDoc {
    // Exactly one of these name-forms must be present
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    export: Option<String>,
    #[serde(default)]
    local: Option<String>,
    #[serde(default, rename = "override")]
    override_: Option<String>,

    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    needs: Vec<NeedSpec>,
    #[serde(default)]
    feeds: Vec<String>,
    #[serde(default)]
    iff: Option<String>,
    #[serde(default, rename = "with")]
    with_params: serde_yaml::Mapping,
    #[serde(default)]
    consumes: Option<PolicySpec>,
    #[serde(default)]
    passthrough: Option<PolicySpec>,
    #[serde(default)]
    rundir: Option<String>,
    #[serde(default)]
    strategy: Option<StrategySpec>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    body: Vec<TaskDoc>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    doc: Option<String>,

    // Control-flow blocks
    #[serde(default, rename = "if")]
    if_cond: Option<String>,
    #[serde(default, rename = "else-body")]
    else_body: Vec<TaskDoc>,
    #[serde(default, rename = "while")]
    while_cond: Option<String>,
    #[serde(default, rename = "do-while")]
    do_while_until: Option<String>,
    #[serde(default)]
    repeat: Option<serde_yaml::Value>,
    #[serde(default)]
    until: Option<String>,
    #[serde(default, rename = "match")]
    match_expr: Option<String>,
    #[serde(default)]
    cases: Vec<CaseSpec>,
    #[serde(default, rename = "max-iter")]
    max_iter: Option<u32>,
    #[serde(default)]
    state: Option<StateSpec>,
}

#[derive(Debug, Clone, Deserialize)]
struct TypeDoc {
    name: String,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default, rename = "with")]
    with_params: serde_yaml::Mapping,
}

#[derive(Debug, Clone, Deserialize)]
struct FilterDoc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    export: Option<String>,
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    root: Option<String>,
    #[serde(default)]
    visibility: Option<Vec<String>>,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    expr: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    shell: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigDoc {
    name: String,
    #[serde(default)]
    overrides: Vec<OverrideDoc>,
}

#[derive(Debug, Clone, Deserialize)]
struct OverrideDoc {
    #[serde(default)]
    task: Option<String>,
    #[serde(default)]
    package: Option<String>,
    #[serde(default, rename = "with")]
    with_params: serde_yaml::Mapping,
}

// ============================================================================
// LOADER
// ============================================================================

/// Everything produced by a load
#[derive(Debug)]
pub struct LoadedFlow {
    pub symtab: SymbolTable,
    pub filters: FilterRegistry,
    /// Root package file path
    pub root_path: PathBuf,
}

#[derive(Default)]
pub struct PackageLoader {
    symtab: SymbolTable,
    filters: FilterRegistry,
    /// Canonical paths currently being loaded (import-cycle detection)
    loading: Vec<PathBuf>,
    /// Canonical path -> package name, for import reuse
    loaded: HashMap<PathBuf, String>,
    /// Selected configuration overlay
    config: Option<String>,
}

impl PackageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: Option<String>) -> Self {
        self.config = config;
        self
    }

    /// Load a root package file and its transitive imports/fragments
    pub fn load(mut self, path: &Path) -> Result<LoadedFlow> {
        crate::std_tasks::register_std(&mut self.symtab)?;
        let root_path = canonical(path)?;
        let root_pkg = self.load_file(&root_path)?;
        self.symtab.root_package = root_pkg.clone();
        self.filters.set_root_package(&root_pkg);
        self.symtab.apply_feeds()?;
        Ok(LoadedFlow {
            symtab: self.symtab,
            filters: self.filters,
            root_path,
        })
    }

    fn load_file(&mut self, path: &Path) -> Result<String> {
        let path = canonical(path)?;
        if let Some(pkg) = self.loaded.get(&path) {
            return Ok(pkg.clone());
        }
        if self.loading.contains(&path) {
            return Err(DfmError::Cycle {
                path: self
                    .loading
                    .iter()
                    .chain(std::iter::once(&path))
                    .map(|p| p.display().to_string())
                    .collect(),
            });
        }
        self.loading.push(path.clone());
        let result = self.load_file_inner(&path);
        self.loading.pop();
        let pkg = result?;
        self.loaded.insert(path, pkg.clone());
        Ok(pkg)
    }

    fn load_file_inner(&mut self, path: &Path) -> Result<String> {
        debug!(path = %path.display(), "loading package file");
        let text = std::fs::read_to_string(path)
            .map_err(|e| DfmError::io(format!("reading {}", path.display()), e))?;
        let doc: DocFile = serde_yaml::from_str(&text).map_err(|e| {
            let loc = e
                .location()
                .map(|l| SrcLoc::new(path, l.line() as u32, l.column() as u32));
            let mut err = DfmError::syntax(format!("{}: {}", path.display(), e));
            if let Some(loc) = loc {
                err = err.at(loc);
            }
            err
        })?;

        let pdoc = doc.package.ok_or_else(|| {
            DfmError::schema(format!(
                "{}: expected a top-level 'package:' key",
                path.display()
            ))
        })?;
        if doc.fragment.is_some() {
            return Err(DfmError::schema(format!(
                "{}: a file cannot carry both 'package:' and 'fragment:'",
                path.display()
            )));
        }

        let pkg_name = pdoc.name.clone();
        let basedir = path.parent().unwrap_or(Path::new(".")).to_path_buf();

        // Imports load first so alias resolution works during task loads
        let mut imports = Vec::new();
        for imp in &pdoc.imports {
            let (ipath, alias) = match imp {
                ImportSpec::Plain(p) => (p.clone(), None),
                ImportSpec::Aliased { path, alias } => (path.clone(), alias.clone()),
            };
            let resolved = basedir.join(&ipath);
            let loaded = self.load_file(&resolved)?;
            imports.push((alias.unwrap_or_else(|| loaded.clone()), loaded));
        }

        let pkg = Package {
            name: pkg_name.clone(),
            params: parse_param_decls(&pdoc.with_params, path)?,
            tasks: Vec::new(),
            types: Vec::new(),
            imports,
            fragments: Vec::new(),
            srcinfo: SrcLoc::new(path, 0, 0),
            basedir: basedir.clone(),
        };
        self.symtab.add_package(pkg)?;

        self.load_defs(
            &pkg_name,
            path,
            &pdoc.tasks,
            &pdoc.types,
            &pdoc.filters,
            &pkg_imports(&self.symtab, &pkg_name),
        )?;

        // Fragments merge into this package
        for frag in &pdoc.fragments {
            let fpath = basedir.join(frag);
            if fpath.is_dir() {
                for entry in WalkDir::new(&fpath)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_map(|e| e.ok())
                {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if matches!(name.as_str(), "flow.dv" | "flow.yaml" | "flow.yml") {
                        self.load_fragment(&pkg_name, entry.path())?;
                    }
                }
            } else {
                self.load_fragment(&pkg_name, &fpath)?;
            }
        }

        // Package-level overrides, then the selected config overlay
        for ov in &pdoc.overrides {
            self.apply_override(&pkg_name, ov)?;
        }
        if let Some(cfg_name) = self.config.clone() {
            if let Some(cfg) = pdoc.configs.iter().find(|c| c.name == cfg_name) {
                for ov in &cfg.overrides.clone() {
                    self.apply_override(&pkg_name, ov)?;
                }
            }
        }

        Ok(pkg_name)
    }

    fn load_fragment(&mut self, pkg_name: &str, path: &Path) -> Result<()> {
        let path = canonical(path)?;
        debug!(path = %path.display(), pkg = pkg_name, "loading fragment");
        let text = std::fs::read_to_string(&path)
            .map_err(|e| DfmError::io(format!("reading {}", path.display()), e))?;
        let doc: DocFile = serde_yaml::from_str(&text)
            .map_err(|e| DfmError::syntax(format!("{}: {}", path.display(), e)))?;
        let fdoc = doc.fragment.ok_or_else(|| {
            DfmError::schema(format!(
                "{}: expected a top-level 'fragment:' key",
                path.display()
            ))
        })?;

        if let Some(pkg) = self.symtab.package_mut(pkg_name) {
            pkg.fragments.push(path.clone());
            pkg.params
                .extend(parse_param_decls(&fdoc.with_params, &path)?);
        }

        let imports = pkg_imports(&self.symtab, pkg_name);
        self.load_defs(pkg_name, &path, &fdoc.tasks, &fdoc.types, &fdoc.filters, &imports)
    }

    fn load_defs(
        &mut self,
        pkg_name: &str,
        path: &Path,
        tasks: &[TaskDoc],
        types: &[TypeDoc],
        filters: &[FilterDoc],
        imports: &[String],
    ) -> Result<()> {
        for tdoc in tasks {
            let qname = self.load_task(pkg_name, None, tdoc, path)?;
            if let Some(pkg) = self.symtab.package_mut(pkg_name) {
                pkg.tasks.push(qname);
            }
        }
        for ty in types {
            let qname = self.load_type(pkg_name, ty, path)?;
            if let Some(pkg) = self.symtab.package_mut(pkg_name) {
                pkg.types.push(qname);
            }
        }
        if !filters.is_empty() {
            let defs = filters
                .iter()
                .map(|f| parse_filter(f, path))
                .collect::<Result<Vec<_>>>()?;
            self.filters
                .register_package(pkg_name, defs, imports.to_vec())?;
        }
        Ok(())
    }

    /// Load one task record (and, recursively, its body). `scope` is the
    /// enclosing task's qualified name for nested bodies.
    fn load_task(
        &mut self,
        pkg_name: &str,
        scope: Option<&str>,
        doc: &TaskDoc,
        path: &Path,
    ) -> Result<String> {
        let (shortname, form) = task_name_form(doc, path)?;
        let qname = match scope {
            Some(s) => format!("{}.{}", s, shortname),
            None => format!("{}.{}", pkg_name, shortname),
        };

        let mut task = Task::new(pkg_name, &shortname);
        task.name = qname.clone();
        task.form = form;
        task.srcinfo = SrcLoc::new(path, 0, 0);
        task.uses = doc.uses.clone();
        task.iff = doc.iff.clone();
        task.run = doc.run.clone();
        task.shell = doc.shell.clone();
        task.desc = doc.desc.clone();
        task.doc = doc.doc.clone();
        task.params = parse_param_decls(&doc.with_params, path)?;

        for need in &doc.needs {
            match need {
                NeedSpec::Plain(s) => task.needs.push(NeedRef::parse(s)),
                NeedSpec::Record { task: t, block } => {
                    let mut n = NeedRef::parse(t);
                    n.block = *block;
                    task.needs.push(n);
                }
            }
        }

        task.feeds = doc.feeds.clone();
        for fed in &doc.feeds {
            self.symtab.feeds.push((fed.clone(), qname.clone()));
        }

        if let Some(c) = &doc.consumes {
            task.consumes = Some(parse_consumes(c)?);
        }
        if let Some(p) = &doc.passthrough {
            task.passthrough = Some(parse_passthrough(p)?);
        }
        if let Some(r) = &doc.rundir {
            task.rundir = match r.as_str() {
                "unique" => RundirKind::Unique,
                "inherit" => RundirKind::Inherit,
                other => {
                    return Err(DfmError::schema(format!(
                        "invalid rundir '{}' (expected unique|inherit)",
                        other
                    )))
                }
            };
        }
        if let Some(s) = &doc.strategy {
            if let Some(g) = &s.generate {
                task.strategy = Some(StrategyDef {
                    generator: g.name.clone(),
                    shell: g.shell.clone(),
                    run: g.run.clone(),
                });
            }
        }

        // Control blocks take the body as TaskDefs, materialized per
        // iteration/branch at run time. Plain bodies become subtasks.
        task.control = self.load_control(pkg_name, &qname, doc, path)?;
        if task.control.is_none() {
            for sub in &doc.body {
                let sub_name = self.load_task(pkg_name, Some(&qname), sub, path)?;
                task.subtasks.push(sub_name);
            }
        }

        self.symtab.add_task(task)?;
        Ok(qname)
    }

    fn load_control(
        &mut self,
        pkg_name: &str,
        qname: &str,
        doc: &TaskDoc,
        path: &Path,
    ) -> Result<Option<ControlDef>> {
        let control_keys = [
            doc.if_cond.is_some(),
            doc.while_cond.is_some(),
            doc.do_while_until.is_some(),
            doc.repeat.is_some(),
            doc.match_expr.is_some(),
        ];
        let n_keys = control_keys.iter().filter(|b| **b).count();
        if n_keys == 0 {
            return Ok(None);
        }
        if n_keys > 1 {
            return Err(DfmError::schema(format!(
                "task '{}' declares multiple control-flow blocks",
                qname
            )));
        }

        let mut load_body = |docs: &[TaskDoc], tag: &str| -> Result<Vec<String>> {
            let scope = format!("{}.{}", qname, tag);
            docs.iter()
                .map(|d| self.load_task(pkg_name, Some(&scope), d, path))
                .collect()
        };

        let kind = if let Some(cond) = &doc.if_cond {
            ControlKind::If {
                cond: cond.clone(),
                body: load_body(&doc.body, "body")?,
                else_body: load_body(&doc.else_body, "else")?,
            }
        } else if let Some(cond) = &doc.while_cond {
            ControlKind::While {
                cond: cond.clone(),
                body: load_body(&doc.body, "body")?,
            }
        } else if let Some(until) = &doc.do_while_until {
            ControlKind::DoWhile {
                until: until.clone(),
                body: load_body(&doc.body, "body")?,
            }
        } else if let Some(count) = &doc.repeat {
            let count = match count {
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s.clone(),
                other => {
                    return Err(DfmError::schema(format!(
                        "repeat count must be an integer or expression, got {:?}",
                        other
                    )))
                }
            };
            ControlKind::Repeat {
                count,
                until: doc.until.clone(),
                body: load_body(&doc.body, "body")?,
            }
        } else if let Some(expr) = &doc.match_expr {
            let mut cases = Vec::new();
            for (i, case) in doc.cases.iter().enumerate() {
                if case.when.is_none() && !case.default {
                    return Err(DfmError::schema(format!(
                        "match case {} in '{}' needs 'when:' or 'default:'",
                        i, qname
                    )));
                }
                cases.push(CaseDef {
                    when: case.when.clone(),
                    body: load_body(&case.body, &format!("case{}", i))?,
                });
            }
            ControlKind::Match {
                expr: expr.clone(),
                cases,
            }
        } else {
            unreachable!()
        };

        Ok(Some(ControlDef {
            kind,
            max_iter: doc.max_iter.unwrap_or(DEFAULT_MAX_ITER),
            state: doc.state.as_ref().map(|s| {
                Ok::<_, DfmError>(StateDef {
                    init: yaml_mapping_to_json(&s.init)?,
                    feedback: s.feedback.clone(),
                })
            }).transpose()?,
        }))
    }

    fn load_type(&mut self, pkg_name: &str, doc: &TypeDoc, path: &Path) -> Result<String> {
        let qname = format!("{}.{}", pkg_name, doc.name);
        let ty = TypeDef {
            name: qname.clone(),
            shortname: doc.name.clone(),
            pkg: pkg_name.to_string(),
            uses: doc.uses.clone(),
            params: parse_param_decls(&doc.with_params, path)?,
            srcinfo: SrcLoc::new(path, 0, 0),
        };
        self.symtab.add_type(ty)?;
        Ok(qname)
    }

    fn apply_override(&mut self, pkg_name: &str, ov: &OverrideDoc) -> Result<()> {
        let decls_src = &ov.with_params;
        if let Some(task_name) = &ov.task {
            let qname = if task_name.contains('.') {
                task_name.clone()
            } else {
                format!("{}.{}", pkg_name, task_name)
            };
            let decls = parse_param_decls(decls_src, Path::new("<override>"))?;
            let task = self
                .symtab
                .task_mut(&qname)
                .ok_or_else(|| DfmError::name_not_found(qname.clone()))?;
            task.params.extend(decls);
        } else if let Some(target_pkg) = &ov.package {
            let decls = parse_param_decls(decls_src, Path::new("<override>"))?;
            let pkg = self
                .symtab
                .package_mut(target_pkg)
                .ok_or_else(|| DfmError::name_not_found(target_pkg.clone()))?;
            pkg.params.extend(decls);
        } else {
            return Err(DfmError::schema(
                "override entry needs 'task:' or 'package:'",
            ));
        }
        Ok(())
    }
}

fn pkg_imports(symtab: &SymbolTable, pkg: &str) -> Vec<String> {
    symtab
        .package(pkg)
        .map(|p| p.imports.iter().map(|(_, n)| n.clone()).collect())
        .unwrap_or_default()
}

// ============================================================================
// PARSE HELPERS
// ============================================================================

fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize()
        .map_err(|e| DfmError::io(format!("resolving {}", path.display()), e))
}

/// Exactly one of name/root/export/local/override must be present
fn task_name_form(doc: &TaskDoc, path: &Path) -> Result<(String, NameForm)> {
    let forms: Vec<(&Option<String>, NameForm)> = vec![
        (&doc.name, NameForm::Name),
        (&doc.root, NameForm::Root),
        (&doc.export, NameForm::Export),
        (&doc.local, NameForm::Local),
        (&doc.override_, NameForm::Override),
    ];
    let present: Vec<(String, NameForm)> = forms
        .into_iter()
        .filter_map(|(n, f)| n.clone().map(|n| (n, f)))
        .collect();
    match present.len() {
        1 => Ok(present.into_iter().next().unwrap()),
        0 => Err(DfmError::schema(format!(
            "{}: task record lacks a name (expected one of name/root/export/local/override)",
            path.display()
        ))),
        _ => Err(DfmError::schema(format!(
            "{}: task record has multiple name markers",
            path.display()
        ))),
    }
}

fn parse_param_decls(mapping: &serde_yaml::Mapping, path: &Path) -> Result<Vec<ParamDecl>> {
    let mut out = Vec::new();
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| DfmError::schema("parameter names must be strings"))?
            .to_string();
        let spec: ParamSpec = serde_yaml::from_value(value.clone())
            .map_err(|e| DfmError::schema(format!("parameter '{}': {}", name, e)))?;
        let mut decl = ParamDecl {
            name,
            srcinfo: Some(SrcLoc::new(path, 0, 0)),
            ..ParamDecl::default()
        };
        match spec {
            ParamSpec::Full(full) => {
                decl.ty = full.ty;
                decl.value = full.value.map(|v| yaml_to_json(&v)).transpose()?;
                decl.append = full.append.map(|v| yaml_to_json(&v)).transpose()?;
                decl.prepend = full.prepend.map(|v| yaml_to_json(&v)).transpose()?;
                decl.path_append = full.path_append.map(|v| yaml_to_json(&v)).transpose()?;
                decl.path_prepend = full.path_prepend.map(|v| yaml_to_json(&v)).transpose()?;
                decl.doc = full.doc;
                decl.desc = full.desc;
            }
            ParamSpec::Plain(v) => {
                decl.value = Some(yaml_to_json(&v)?);
            }
        }
        out.push(decl);
    }
    Ok(out)
}

fn parse_consumes(spec: &PolicySpec) -> Result<Consumes> {
    match spec {
        PolicySpec::Keyword(k) => match k.as_str() {
            "all" => Ok(Consumes::All),
            "none" => Ok(Consumes::No),
            other => Err(DfmError::schema(format!(
                "invalid consumes '{}' (expected all|none|list)",
                other
            ))),
        },
        PolicySpec::Patterns(p) => Ok(Consumes::Patterns(p.clone())),
    }
}

fn parse_passthrough(spec: &PolicySpec) -> Result<Passthrough> {
    match spec {
        PolicySpec::Keyword(k) => match k.as_str() {
            "all" => Ok(Passthrough::All),
            "none" => Ok(Passthrough::No),
            "unused" => Ok(Passthrough::Unused),
            other => Err(DfmError::schema(format!(
                "invalid passthrough '{}' (expected all|none|unused|list)",
                other
            ))),
        },
        PolicySpec::Patterns(p) => Ok(Passthrough::Patterns(p.clone())),
    }
}

fn parse_filter(doc: &FilterDoc, path: &Path) -> Result<FilterDef> {
    let (name, visibility) = {
        let forms: Vec<(&Option<String>, FilterVisibility)> = vec![
            (&doc.name, FilterVisibility::Default),
            (&doc.export, FilterVisibility::Export),
            (&doc.local, FilterVisibility::Local),
            (&doc.root, FilterVisibility::Root),
        ];
        let present: Vec<(String, FilterVisibility)> = forms
            .into_iter()
            .filter_map(|(n, v)| n.clone().map(|n| (n, v)))
            .collect();
        match present.len() {
            1 => present.into_iter().next().unwrap(),
            0 => {
                return Err(DfmError::schema(format!(
                    "{}: filter record lacks a name",
                    path.display()
                )))
            }
            _ => {
                return Err(DfmError::schema(format!(
                    "{}: filter record has multiple name markers",
                    path.display()
                )))
            }
        }
    };
    let visibility = match &doc.visibility {
        Some(pkgs) => FilterVisibility::Packages(pkgs.clone()),
        None => visibility,
    };
    Ok(FilterDef {
        name,
        params: doc.params.clone(),
        expr: doc.expr.clone(),
        run: doc.run.clone(),
        shell: doc.shell.clone(),
        visibility,
    })
}

pub fn yaml_to_json(v: &serde_yaml::Value) -> Result<Value> {
    serde_json::to_value(v).map_err(|e| DfmError::schema(format!("value not representable: {}", e)))
}

fn yaml_mapping_to_json(m: &serde_yaml::Mapping) -> Result<serde_json::Map<String, Value>> {
    let mut out = serde_json::Map::new();
    for (k, v) in m {
        let key = k
            .as_str()
            .ok_or_else(|| DfmError::schema("mapping keys must be strings"))?;
        out.insert(key.to_string(), yaml_to_json(v)?);
    }
    Ok(out)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_flow(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
        path
    }

    fn load_yaml(text: &str) -> LoadedFlow {
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(dir.path(), "flow.yaml", text);
        PackageLoader::new().load(&path).unwrap()
    }

    #[test]
    fn test_load_minimal_package() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: hello
      run: echo hello
"#,
        );
        let task = flow.symtab.task("demo.hello").unwrap();
        assert_eq!(task.shortname, "hello");
        assert_eq!(task.run.as_deref(), Some("echo hello"));
        assert_eq!(flow.symtab.root_package, "demo");
    }

    #[test]
    fn test_task_requires_exactly_one_name_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(
            dir.path(),
            "flow.yaml",
            r#"
package:
  name: demo
  tasks:
    - name: a
      export: a
"#,
        );
        let err = PackageLoader::new().load(&path).unwrap_err();
        assert!(matches!(err, DfmError::Schema { .. }));
    }

    #[test]
    fn test_load_needs_and_feeds() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: a
    - name: b
      needs: [a]
    - name: c
      feeds: [b]
"#,
        );
        let b = flow.symtab.task("demo.b").unwrap();
        assert_eq!(b.needs.len(), 2);
        assert_eq!(b.needs[0].name, "a");
        // feeds applied post-load: c appended to b's needs
        assert_eq!(b.needs[1].name, "demo.c");
    }

    #[test]
    fn test_load_needs_splice_form() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: a
    - name: b
      needs: [a.needs]
"#,
        );
        let b = flow.symtab.task("demo.b").unwrap();
        assert!(b.needs[0].splice);
        assert_eq!(b.needs[0].name, "a");
    }

    #[test]
    fn test_load_params_full_and_plain() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: t
      with:
        debug:
          type: bool
          value: true
        opt: "-O2"
"#,
        );
        let t = flow.symtab.task("demo.t").unwrap();
        assert_eq!(t.params.len(), 2);
        assert_eq!(t.params[0].ty.as_deref(), Some("bool"));
        assert_eq!(t.params[0].value, Some(serde_json::json!(true)));
        assert_eq!(t.params[1].name, "opt");
        assert_eq!(t.params[1].value, Some(serde_json::json!("-O2")));
    }

    #[test]
    fn test_load_policies() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: t
      consumes:
        - type: std.FileSet
      passthrough: unused
      rundir: inherit
"#,
        );
        let t = flow.symtab.task("demo.t").unwrap();
        assert!(matches!(&t.consumes, Some(Consumes::Patterns(p)) if p.len() == 1));
        assert_eq!(t.passthrough, Some(Passthrough::Unused));
        assert_eq!(t.rundir, RundirKind::Inherit);
    }

    #[test]
    fn test_load_compound_body() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: build
      body:
        - name: compile
          run: echo c
        - name: link
          needs: [compile]
          run: echo l
"#,
        );
        let build = flow.symtab.task("demo.build").unwrap();
        assert_eq!(
            build.subtasks,
            vec!["demo.build.compile", "demo.build.link"]
        );
        assert!(flow.symtab.task("demo.build.compile").is_some());
    }

    #[test]
    fn test_load_control_blocks() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: loop
      do-while: "${{ !done }}"
      max-iter: 5
      body:
        - name: step
          run: echo s
    - name: rep
      repeat: 3
      body:
        - name: step
          run: echo r
"#,
        );
        let l = flow.symtab.task("demo.loop").unwrap();
        let c = l.control.as_ref().unwrap();
        assert_eq!(c.max_iter, 5);
        assert!(matches!(&c.kind, ControlKind::DoWhile { .. }));
        let r = flow.symtab.task("demo.rep").unwrap();
        match &r.control.as_ref().unwrap().kind {
            ControlKind::Repeat { count, .. } => assert_eq!(count, "3"),
            other => panic!("expected repeat, got {:?}", other),
        }
    }

    #[test]
    fn test_load_conflicting_control_blocks_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(
            dir.path(),
            "flow.yaml",
            r#"
package:
  name: demo
  tasks:
    - name: bad
      while: "x"
      repeat: 2
"#,
        );
        assert!(PackageLoader::new().load(&path).is_err());
    }

    #[test]
    fn test_load_imports_with_alias() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(
            dir.path(),
            "lib.yaml",
            r#"
package:
  name: lib
  tasks:
    - name: util
"#,
        );
        let root = write_flow(
            dir.path(),
            "flow.yaml",
            r#"
package:
  name: app
  imports:
    - path: lib.yaml
      as: l
  tasks:
    - name: top
      needs: [l.util]
"#,
        );
        let flow = PackageLoader::new().load(&root).unwrap();
        assert!(flow.symtab.package("lib").is_some());
        let top = flow.symtab.task("app.top").unwrap();
        let resolved = flow.symtab.resolve_task(top, "l.util").unwrap();
        assert_eq!(resolved.name, "lib.util");
    }

    #[test]
    fn test_load_recursive_import_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_flow(
            dir.path(),
            "a.yaml",
            r#"
package:
  name: a
  imports: [b.yaml]
"#,
        );
        write_flow(
            dir.path(),
            "b.yaml",
            r#"
package:
  name: b
  imports: [a.yaml]
"#,
        );
        let err = PackageLoader::new()
            .load(&dir.path().join("a.yaml"))
            .unwrap_err();
        assert!(matches!(err, DfmError::Cycle { .. }));
    }

    #[test]
    fn test_load_fragment_merges_tasks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("rtl")).unwrap();
        write_flow(
            &dir.path().join("rtl"),
            "flow.yaml",
            r#"
fragment:
  tasks:
    - name: extra
      run: echo extra
"#,
        );
        let root = write_flow(
            dir.path(),
            "flow.yaml",
            r#"
package:
  name: demo
  fragments: [rtl]
  tasks:
    - name: top
"#,
        );
        let flow = PackageLoader::new().load(&root).unwrap();
        assert!(flow.symtab.task("demo.extra").is_some());
        assert_eq!(flow.symtab.package("demo").unwrap().fragments.len(), 1);
    }

    #[test]
    fn test_load_override_task_replacement() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  tasks:
    - name: t
      run: echo old
    - override: t
      run: echo new
"#,
        );
        assert_eq!(
            flow.symtab.task("demo.t").unwrap().run.as_deref(),
            Some("echo new")
        );
    }

    #[test]
    fn test_load_config_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(
            dir.path(),
            "flow.yaml",
            r#"
package:
  name: demo
  tasks:
    - name: t
      with:
        mode: "debug"
  configs:
    - name: release
      overrides:
        - task: t
          with:
            mode: "release"
"#,
        );
        let flow = PackageLoader::new()
            .with_config(Some("release".to_string()))
            .load(&path)
            .unwrap();
        let t = flow.symtab.task("demo.t").unwrap();
        // Overlay appends a later decl; the builder's leaf-wins overlay
        // makes it effective
        assert_eq!(t.params.last().unwrap().value, Some(serde_json::json!("release")));
    }

    #[test]
    fn test_canonical_json_stable_across_loads() {
        let yaml = r#"
package:
  name: demo
  tasks:
    - name: base
      with:
        opt: {type: str, value: "-O2"}
    - name: leaf
      uses: base
      needs: [base]
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = write_flow(dir.path(), "flow.yaml", yaml);
        let a = PackageLoader::new().load(&path).unwrap();
        let b = PackageLoader::new().load(&path).unwrap();
        let ja = a.symtab.package_to_json("demo").unwrap();
        let jb = b.symtab.package_to_json("demo").unwrap();
        assert_eq!(ja, jb);
        assert_eq!(ja["tasks"][1]["uses"], serde_json::json!("base"));
        assert_eq!(ja["tasks"][0]["params"][0]["value"], serde_json::json!("-O2"));
    }

    #[test]
    fn test_load_filters() {
        let flow = load_yaml(
            r#"
package:
  name: demo
  filters:
    - name: ids
      expr: "input | map(item.seq)"
    - local: internal
      expr: "input"
"#,
        );
        assert!(flow.filters.resolve("demo", "ids").is_ok());
        assert!(flow.filters.resolve("demo", "internal").is_ok());
    }
}
