//! # Task-graph builder
//!
//! Lowers symbolic [`Task`]s into the executable [`TaskNode`] arena:
//! resolves `uses` chains and `needs` edges, merges parameter schemas with
//! leaf-outermost-wins overlay, evaluates static expressions and defers
//! runtime ones, assigns rundirs from a segment stack, and expands
//! compound bodies.
//!
//! Nodes are memoized by qualified name, so a task reached from several
//! graph positions is shared. Builder errors accumulate as markers where
//! recovery is local; an unresolvable requested root aborts the build.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::data::{Consumes, Passthrough};
use crate::errors::{DfmError, Marker, Result};
use crate::expr::{runtime_names, value_references, DeferredExpr, EvalCtx, Template};
use crate::filter::FilterRegistry;
use crate::node::{NodeId, NodeKind, TaskNode};
use crate::package::{ParamDecl, SymbolTable, Task, TypeDef, RundirKind, UsesTarget};
use crate::params::{ParamKind, ParamRecord, ParamSchema, ParamValue};
use crate::std_tasks::{null_callable, shell_callable, ExtRegistry};

/// Owned element of a `uses` chain
#[derive(Debug, Clone)]
enum ChainElem {
    Task(Task),
    Type(TypeDef),
}

impl ChainElem {
    fn params(&self) -> &[ParamDecl] {
        match self {
            ChainElem::Task(t) => &t.params,
            ChainElem::Type(t) => &t.params,
        }
    }

    fn task(&self) -> Option<&Task> {
        match self {
            ChainElem::Task(t) => Some(t),
            ChainElem::Type(_) => None,
        }
    }
}

pub struct TaskGraphBuilder {
    symtab: Arc<SymbolTable>,
    filters: Arc<FilterRegistry>,
    registry: Arc<ExtRegistry>,
    /// Root package file (the `root` builtin variable)
    root_path: PathBuf,
    root_rundir: PathBuf,
    pub nodes: Vec<TaskNode>,
    node_m: HashMap<String, NodeId>,
    /// Stack of rundir frames; hierarchical builds share the top frame
    rundir_frames: Vec<Vec<String>>,
    /// Compound parent stack
    node_stack: Vec<NodeId>,
    /// Generator-synthesized tasks, shadowing the symbol table
    dynamic: HashMap<String, Task>,
    /// Cache of evaluated package parameter objects
    pkg_params: HashMap<String, Value>,
    pub markers: Vec<Marker>,
}

impl TaskGraphBuilder {
    pub fn new(
        symtab: Arc<SymbolTable>,
        filters: Arc<FilterRegistry>,
        registry: Arc<ExtRegistry>,
        root_path: PathBuf,
        root_rundir: PathBuf,
    ) -> Self {
        Self {
            symtab,
            filters,
            registry,
            root_path,
            root_rundir,
            nodes: Vec::new(),
            node_m: HashMap::new(),
            rundir_frames: vec![Vec::new()],
            node_stack: Vec::new(),
            dynamic: HashMap::new(),
            pkg_params: HashMap::new(),
            markers: Vec::new(),
        }
    }

    pub fn symtab(&self) -> &Arc<SymbolTable> {
        &self.symtab
    }

    pub fn node(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TaskNode {
        &mut self.nodes[id]
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.node_m.get(name).copied()
    }

    /// A node's rundir as segments relative to the root rundir
    pub fn rundir_segments(&self, id: NodeId) -> Vec<String> {
        self.nodes[id]
            .rundir
            .strip_prefix(&self.root_rundir)
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn error(&mut self, err: &DfmError) {
        self.markers.push(err.to_marker());
    }

    // ------------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------------

    /// Build the node for a task requested by (possibly short) name
    pub fn mk_task_node(&mut self, name: &str) -> Result<NodeId> {
        let root_pkg = self.symtab.root_package.clone();
        let task = match self.symtab.resolve_task_from_pkg(&root_pkg, name) {
            Ok(t) => t.clone(),
            Err(_) => {
                // Suggest against short and qualified names alike
                let candidates: Vec<String> = self
                    .symtab
                    .tasks()
                    .flat_map(|t| [t.shortname.clone(), t.name.clone()])
                    .collect();
                return Err(DfmError::name_not_found_in(
                    name,
                    candidates.iter().map(|s| s.as_str()),
                ));
            }
        };
        self.get_or_build(&task)
    }

    /// Build fresh (non-memoized) instances of a control body for one
    /// iteration. `instance_prefix` becomes `<prefix>_<shortname>`;
    /// `rundir_segs` roots the iteration rundirs; `extra_vars` (iteration
    /// state) joins the static scope. Returns `(task_name, node_id)`
    /// pairs in body order.
    pub fn mk_iteration_nodes(
        &mut self,
        body: &[String],
        instance_prefix: &str,
        rundir_segs: &[String],
        extra_vars: &Map<String, Value>,
    ) -> Result<Vec<(String, NodeId)>> {
        self.rundir_frames.push(rundir_segs.to_vec());
        let result = self.mk_iteration_nodes_inner(body, instance_prefix, extra_vars);
        self.rundir_frames.pop();
        result
    }

    fn mk_iteration_nodes_inner(
        &mut self,
        body: &[String],
        instance_prefix: &str,
        extra_vars: &Map<String, Value>,
    ) -> Result<Vec<(String, NodeId)>> {
        let mut built: Vec<(String, NodeId)> = Vec::new();
        for qname in body {
            let task = self.lookup(qname)?;
            let instance = format!("{}_{}", instance_prefix, task.shortname);
            let id = self.build_node(&task, BuildOpts {
                hierarchical: true,
                instance_name: Some(instance),
                extra_vars: Some(extra_vars),
                wire_needs: false,
                memoize: false,
            })?;
            built.push((qname.clone(), id));
        }
        // Intra-body needs resolve to this iteration's instances;
        // everything else resolves normally.
        let local: HashMap<String, NodeId> = built.iter().cloned().collect();
        for (qname, id) in &built {
            let task = self.lookup(qname)?;
            self.wire_needs(&task, *id, Some(&local))?;
        }
        Ok(built)
    }

    fn get_or_build(&mut self, task: &Task) -> Result<NodeId> {
        if let Some(id) = self.node_m.get(&task.name) {
            return Ok(*id);
        }
        self.build_node(task, BuildOpts::default())
    }

    fn lookup(&self, qname: &str) -> Result<Task> {
        if let Some(t) = self.dynamic.get(qname) {
            return Ok(t.clone());
        }
        self.symtab
            .task(qname)
            .cloned()
            .ok_or_else(|| DfmError::name_not_found_in(qname, self.symtab.task_names()))
    }

    // ------------------------------------------------------------------------
    // Node construction
    // ------------------------------------------------------------------------

    fn build_node(&mut self, task: &Task, opts: BuildOpts<'_>) -> Result<NodeId> {
        if !opts.hierarchical {
            self.rundir_frames.push(Vec::new());
        }
        let result = self.build_node_inner(task, &opts);
        if !opts.hierarchical {
            self.rundir_frames.pop();
        }
        result
    }

    fn build_node_inner(&mut self, task: &Task, opts: &BuildOpts<'_>) -> Result<NodeId> {
        debug!(task = %task.name, "building task node");

        // Generators synthesize subtasks before the compound decision
        let mut task = task.clone();
        self.run_generator(&mut task)?;

        if task.control.is_some() {
            self.build_control(&task, opts)
        } else if self.is_compound(&task)? {
            self.build_compound(&task, opts)
        } else {
            self.build_leaf(&task, opts)
        }
    }

    fn is_compound(&self, task: &Task) -> Result<bool> {
        if !task.subtasks.is_empty() {
            return Ok(true);
        }
        let chain = self.chain_of(task)?;
        Ok(chain
            .iter()
            .filter_map(|c| c.task())
            .any(|t| !t.subtasks.is_empty()))
    }

    fn chain_of(&self, task: &Task) -> Result<Vec<ChainElem>> {
        // Dynamic tasks carry no `uses` into the table; resolve through
        // the symbol table when present, else the task alone.
        if self.symtab.task(&task.name).is_some() {
            let chain = self.symtab.uses_chain(UsesTarget::Task(
                self.symtab.task(&task.name).unwrap(),
            ))?;
            Ok(chain
                .into_iter()
                .map(|c| match c {
                    UsesTarget::Task(t) => ChainElem::Task(t.clone()),
                    UsesTarget::Type(t) => ChainElem::Type(t.clone()),
                })
                .collect())
        } else if let Some(uses) = &task.uses {
            let base = self.symtab.resolve_uses(&task.pkg, uses)?;
            let mut chain: Vec<ChainElem> = self
                .symtab
                .uses_chain(base)?
                .into_iter()
                .map(|c| match c {
                    UsesTarget::Task(t) => ChainElem::Task(t.clone()),
                    UsesTarget::Type(t) => ChainElem::Type(t.clone()),
                })
                .collect();
            chain.push(ChainElem::Task(task.clone()));
            Ok(chain)
        } else {
            Ok(vec![ChainElem::Task(task.clone())])
        }
    }

    fn build_leaf(&mut self, task: &Task, opts: &BuildOpts<'_>) -> Result<NodeId> {
        if task.rundir == RundirKind::Unique {
            self.enter_rundir(&task.shortname);
        }

        let chain = self.chain_of(task)?;
        let (params, _ctx) = self.build_params(task, &chain, opts.extra_vars)?;
        let callable = self.resolve_callable(&chain)?;
        let has_impl = chain.iter().filter_map(|c| c.task()).any(|t| {
            t.run.is_some() || self.registry.task(&t.name).is_some()
        });

        let id = self.push_node(TaskNode {
            id: 0,
            name: opts.instance_name.clone().unwrap_or_else(|| task.name.clone()),
            shortname: task.shortname.clone(),
            pkg: task.pkg.clone(),
            srcdir: self.srcdir_of(task),
            rundir: self.current_rundir(),
            params,
            needs: Vec::new(),
            passthrough: self.effective_passthrough(&chain, has_impl),
            consumes: self.effective_consumes(&chain, has_impl),
            iff: self.parse_iff(task)?,
            parent: self.node_stack.last().copied(),
            kind: NodeKind::Leaf { callable },
            result: None,
            output: None,
            skipped: false,
        }, opts.memoize.then_some(task.name.as_str()));

        if opts.wire_needs {
            self.wire_needs(task, id, None)?;
        }

        if task.rundir == RundirKind::Unique {
            self.leave_rundir();
        }
        Ok(id)
    }

    fn build_compound(&mut self, task: &Task, opts: &BuildOpts<'_>) -> Result<NodeId> {
        if task.rundir == RundirKind::Unique {
            self.enter_rundir(&task.shortname);
        }

        let chain = self.chain_of(task)?;
        let (params, _ctx) = self.build_params(task, &chain, opts.extra_vars)?;
        let name = opts.instance_name.clone().unwrap_or_else(|| task.name.clone());

        // Synthetic input node: sink for the compound's own needs, source
        // for body entry tasks. It forwards everything.
        self.enter_rundir(&format!("{}.in", task.shortname));
        let input_id = self.push_node(TaskNode {
            id: 0,
            name: format!("{}.in", name),
            shortname: format!("{}.in", task.shortname),
            pkg: task.pkg.clone(),
            srcdir: self.srcdir_of(task),
            rundir: self.current_rundir(),
            params: ParamRecord::default(),
            needs: Vec::new(),
            passthrough: Passthrough::All,
            consumes: Consumes::No,
            iff: None,
            parent: None,
            kind: NodeKind::Leaf {
                callable: null_callable(),
            },
            result: None,
            output: None,
            skipped: false,
        }, None);
        self.leave_rundir();

        // Terminal node for the sub-DAG
        let id = self.push_node(TaskNode {
            id: 0,
            name: name.clone(),
            shortname: task.shortname.clone(),
            pkg: task.pkg.clone(),
            srcdir: self.srcdir_of(task),
            rundir: self.current_rundir(),
            params,
            needs: Vec::new(),
            passthrough: self.effective_passthrough(&chain, false),
            consumes: self.effective_consumes(&chain, false),
            iff: self.parse_iff(task)?,
            parent: self.node_stack.last().copied(),
            kind: NodeKind::Compound {
                input: input_id,
                children: Vec::new(),
            },
            result: None,
            output: None,
            skipped: false,
        }, opts.memoize.then_some(task.name.as_str()));
        self.nodes[input_id].parent = Some(id);

        // The compound's own needs terminate at the input node
        self.wire_needs(task, input_id, None)?;

        // Children: subtasks across the chain, base first. The leaf's
        // list comes from the (possibly generator-augmented) local task.
        let mut subtasks: Vec<String> = chain[..chain.len().saturating_sub(1)]
            .iter()
            .filter_map(|c| c.task())
            .flat_map(|t| t.subtasks.iter().cloned())
            .collect();
        subtasks.extend(task.subtasks.iter().cloned());

        self.node_stack.push(id);
        let mut children: Vec<(Task, NodeId)> = Vec::new();
        let build_result = (|| -> Result<()> {
            for sub_name in &subtasks {
                let sub = self.lookup(sub_name)?;
                let child_id = self.build_node(&sub, BuildOpts {
                    hierarchical: true,
                    instance_name: None,
                    extra_vars: opts.extra_vars,
                    wire_needs: false,
                    memoize: true,
                })?;
                children.push((sub, child_id));
            }
            Ok(())
        })();
        self.node_stack.pop();
        build_result?;

        for (sub, child_id) in &children {
            self.wire_needs(sub, *child_id, None)?;
        }

        // Internal-reference analysis: children with no edge to a sibling
        // hang off the input node; children no sibling consumes become
        // dependencies of the compound terminal.
        let child_ids: HashSet<NodeId> = children.iter().map(|(_, id)| *id).collect();
        let mut referenced: HashSet<NodeId> = HashSet::new();
        for (_, child_id) in &children {
            for (need, _) in &self.nodes[*child_id].needs {
                if child_ids.contains(need) {
                    referenced.insert(*need);
                }
            }
        }
        for (_, child_id) in &children {
            let refs_internal = self.nodes[*child_id]
                .needs
                .iter()
                .any(|(n, _)| child_ids.contains(n));
            if !refs_internal {
                self.nodes[*child_id].needs.push((input_id, false));
            }
            if !referenced.contains(child_id) {
                self.nodes[id].needs.push((*child_id, false));
            }
        }

        if let NodeKind::Compound { children: slot, .. } = &mut self.nodes[id].kind {
            *slot = children.iter().map(|(_, id)| *id).collect();
        }

        if task.rundir == RundirKind::Unique {
            self.leave_rundir();
        }
        Ok(id)
    }

    fn build_control(&mut self, task: &Task, opts: &BuildOpts<'_>) -> Result<NodeId> {
        if task.rundir == RundirKind::Unique {
            self.enter_rundir(&task.shortname);
        }
        let chain = self.chain_of(task)?;
        let (params, _ctx) = self.build_params(task, &chain, opts.extra_vars)?;

        let id = self.push_node(TaskNode {
            id: 0,
            name: opts.instance_name.clone().unwrap_or_else(|| task.name.clone()),
            shortname: task.shortname.clone(),
            pkg: task.pkg.clone(),
            srcdir: self.srcdir_of(task),
            rundir: self.current_rundir(),
            params,
            needs: Vec::new(),
            passthrough: self.effective_passthrough(&chain, false),
            consumes: self.effective_consumes(&chain, false),
            iff: self.parse_iff(task)?,
            parent: self.node_stack.last().copied(),
            kind: NodeKind::Control {
                def: task.control.clone().expect("control task"),
            },
            result: None,
            output: None,
            skipped: false,
        }, opts.memoize.then_some(task.name.as_str()));

        if opts.wire_needs {
            self.wire_needs(task, id, None)?;
        }

        if task.rundir == RundirKind::Unique {
            self.leave_rundir();
        }
        Ok(id)
    }

    fn push_node(&mut self, mut node: TaskNode, memo_key: Option<&str>) -> NodeId {
        let id = self.nodes.len();
        node.id = id;
        if let Some(key) = memo_key {
            self.node_m.insert(key.to_string(), id);
        }
        self.node_m.entry(node.name.clone()).or_insert(id);
        self.nodes.push(node);
        id
    }

    // ------------------------------------------------------------------------
    // Needs wiring
    // ------------------------------------------------------------------------

    /// Resolve and attach the needs declared across the task's `uses`
    /// chain, base first. `local` maps body-task names to this
    /// iteration's instances.
    fn wire_needs(
        &mut self,
        task: &Task,
        node_id: NodeId,
        local: Option<&HashMap<String, NodeId>>,
    ) -> Result<()> {
        let chain = self.chain_of(task)?;
        for elem in &chain {
            let Some(t) = elem.task() else { continue };
            let needs = t.needs.clone();
            let scope_task = t.clone();
            for need in needs {
                if need.splice {
                    // `<task>.needs` splices the referent's own needs
                    let target = self.symtab.resolve_task(&scope_task, &need.name)?.clone();
                    for sub in target.needs.clone() {
                        if sub.splice {
                            continue;
                        }
                        let resolved = self.symtab.resolve_task(&target, &sub.name)?.clone();
                        let dep = self.need_node(&resolved, local)?;
                        self.add_need(node_id, dep, sub.block);
                    }
                } else {
                    let resolved = self.symtab.resolve_task(&scope_task, &need.name)?.clone();
                    let dep = self.need_node(&resolved, local)?;
                    self.add_need(node_id, dep, need.block);
                }
            }
        }
        Ok(())
    }

    fn need_node(
        &mut self,
        task: &Task,
        local: Option<&HashMap<String, NodeId>>,
    ) -> Result<NodeId> {
        if let Some(local) = local {
            if let Some(id) = local.get(&task.name) {
                return Ok(*id);
            }
        }
        self.get_or_build(task)
    }

    fn add_need(&mut self, node: NodeId, dep: NodeId, block: bool) {
        let needs = &mut self.nodes[node].needs;
        if !needs.iter().any(|(n, _)| *n == dep) {
            needs.push((dep, block));
        }
    }

    // ------------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------------

    /// Walk the `uses` chain base to leaf, merging schemas and overlaying
    /// values; the outermost assignment of a field wins. String values go
    /// through the expression evaluator; values referencing runtime-only
    /// names become deferred.
    fn build_params(
        &mut self,
        task: &Task,
        chain: &[ChainElem],
        extra_vars: Option<&Map<String, Value>>,
    ) -> Result<(ParamRecord, EvalCtx)> {
        let mut ctx = self.static_scope(task)?;
        if let Some(extra) = extra_vars {
            for (k, v) in extra {
                ctx.set(k.clone(), v.clone());
            }
        }

        // Deferral triggers on runtime-only names, including the rundirs
        // of this task's needs
        let need_names: Vec<String> = chain
            .iter()
            .filter_map(|c| c.task())
            .flat_map(|t| t.needs.iter())
            .map(|n| {
                n.name
                    .rsplit('.')
                    .next()
                    .unwrap_or(&n.name)
                    .to_string()
            })
            .collect();
        let runtime = runtime_names(need_names);

        let mut record = ParamRecord::new(ParamSchema::new());
        let mut this_obj = Map::new();

        for elem in chain {
            for decl in elem.params() {
                let result = self.apply_param_decl(
                    &mut record,
                    &mut this_obj,
                    &mut ctx,
                    decl,
                    &runtime,
                );
                if let Err(e) = result {
                    let e = match decl.srcinfo.clone() {
                        Some(loc) => e.at(loc),
                        None => e,
                    };
                    self.error(&e);
                }
            }
        }

        Ok((record, ctx))
    }

    fn apply_param_decl(
        &mut self,
        record: &mut ParamRecord,
        this_obj: &mut Map<String, Value>,
        ctx: &mut EvalCtx,
        decl: &ParamDecl,
        runtime: &HashSet<String>,
    ) -> Result<()> {
        let name = decl.name.as_str();

        if let Some(ty) = &decl.ty {
            // Declaring a (new or redeclared) field
            let kind = ParamKind::from_type_str(ty)?;
            let raw = decl.value.clone().unwrap_or_else(|| kind.default_value());
            let value = self.eval_param_value(&raw, ctx, runtime)?;
            record.declare_set(name, kind, value);
        } else if decl.append.is_some()
            || decl.prepend.is_some()
            || decl.path_append.is_some()
            || decl.path_prepend.is_some()
        {
            self.mutate_param(record, ctx, decl, runtime)?;
        } else {
            // Override-only: the field must exist on an ancestor
            if !record.schema().has(name) {
                return Err(DfmError::schema(format!(
                    "parameter '{}' overridden but never declared in the uses chain",
                    name
                )));
            }
            let raw = decl.value.clone().unwrap_or(Value::Null);
            let value = self.eval_param_value(&raw, ctx, runtime)?;
            record.set(name, value)?;
        }

        if let Some(ParamValue::Value(v)) = record.get(name) {
            this_obj.insert(name.to_string(), v.clone());
            ctx.set("this", Value::Object(this_obj.clone()));
        }
        Ok(())
    }

    /// `append:` / `prepend:` (and path variants) mutate the inherited
    /// default rather than replacing it.
    fn mutate_param(
        &mut self,
        record: &mut ParamRecord,
        ctx: &EvalCtx,
        decl: &ParamDecl,
        runtime: &HashSet<String>,
    ) -> Result<()> {
        let name = decl.name.as_str();
        let current = match record.get(name) {
            Some(ParamValue::Value(v)) => v.clone(),
            Some(ParamValue::Deferred(d)) => {
                return Err(DfmError::schema(format!(
                    "cannot append/prepend to deferred parameter '{}' ({})",
                    name,
                    d.src()
                )));
            }
            None => {
                return Err(DfmError::schema(format!(
                    "parameter '{}' appended but never declared in the uses chain",
                    name
                )));
            }
        };

        let eval_items = |raw: &Value, this: &Self| -> Result<Vec<Value>> {
            let evaluated = match this.eval_param_value(raw, ctx, runtime)? {
                ParamValue::Value(v) => v,
                ParamValue::Deferred(d) => {
                    return Err(DfmError::schema(format!(
                        "append/prepend values may not defer ({})",
                        d.src()
                    )))
                }
            };
            Ok(match evaluated {
                Value::Array(items) => items,
                other => vec![other],
            })
        };

        let updated = if let Some(raw) = &decl.append {
            let mut base = as_list(&current, name)?;
            base.extend(eval_items(raw, self)?);
            Value::Array(base)
        } else if let Some(raw) = &decl.prepend {
            let mut items = eval_items(raw, self)?;
            items.extend(as_list(&current, name)?);
            Value::Array(items)
        } else if let Some(raw) = &decl.path_append {
            let parts = eval_items(raw, self)?;
            Value::String(join_path(&current, &parts, false))
        } else if let Some(raw) = &decl.path_prepend {
            let parts = eval_items(raw, self)?;
            Value::String(join_path(&current, &parts, true))
        } else {
            unreachable!()
        };

        record.set(name, ParamValue::Value(updated))
    }

    fn eval_param_value(
        &self,
        raw: &Value,
        ctx: &EvalCtx,
        runtime: &HashSet<String>,
    ) -> Result<ParamValue> {
        if value_references(raw, runtime)? {
            Ok(ParamValue::Deferred(DeferredExpr::new(
                raw.clone(),
                ctx.snapshot(),
            )))
        } else {
            Ok(ParamValue::Value(crate::expr::eval_embedded(raw, ctx)?))
        }
    }

    // ------------------------------------------------------------------------
    // Static scope
    // ------------------------------------------------------------------------

    fn static_scope(&mut self, task: &Task) -> Result<EvalCtx> {
        let mut ctx = EvalCtx::new().with_filters(self.filters.clone(), task.pkg.clone());
        ctx.set("root", json!(self.root_path.to_string_lossy()));
        ctx.set(
            "rootdir",
            json!(self
                .root_path
                .parent()
                .unwrap_or(Path::new("."))
                .to_string_lossy()),
        );
        ctx.set("srcdir", json!(self.srcdir_of(task).to_string_lossy()));

        let env: Map<String, Value> = std::env::vars().map(|(k, v)| (k, json!(v))).collect();
        ctx.set("env", Value::Object(env));

        // Own package parameters, bound both as `<pkg>` and `this`'s peers
        let own = self.package_params(&task.pkg)?;
        ctx.set(task.pkg.clone(), own);

        // Imported packages under their aliases
        let imports: Vec<(String, String)> = self
            .symtab
            .package(&task.pkg)
            .map(|p| p.imports.clone())
            .unwrap_or_default();
        for (alias, target) in imports {
            let params = self.package_params(&target)?;
            ctx.set(alias, params);
        }

        Ok(ctx)
    }

    /// Package-level `with:` parameters, evaluated once and cached
    fn package_params(&mut self, pkg_name: &str) -> Result<Value> {
        if let Some(v) = self.pkg_params.get(pkg_name) {
            return Ok(v.clone());
        }
        let Some(pkg) = self.symtab.package(pkg_name) else {
            return Ok(json!({}));
        };
        let decls = pkg.params.clone();
        let basedir = pkg.basedir.clone();

        let mut ctx = EvalCtx::new();
        ctx.set("root", json!(self.root_path.to_string_lossy()));
        ctx.set(
            "rootdir",
            json!(self
                .root_path
                .parent()
                .unwrap_or(Path::new("."))
                .to_string_lossy()),
        );
        ctx.set("srcdir", json!(basedir.to_string_lossy()));
        let env: Map<String, Value> = std::env::vars().map(|(k, v)| (k, json!(v))).collect();
        ctx.set("env", Value::Object(env));

        let mut obj = Map::new();
        for decl in &decls {
            let raw = decl.value.clone().unwrap_or(Value::Null);
            let value = crate::expr::eval_embedded(&raw, &ctx)?;
            obj.insert(decl.name.clone(), value);
        }
        let value = Value::Object(obj);
        self.pkg_params.insert(pkg_name.to_string(), value.clone());
        Ok(value)
    }

    // ------------------------------------------------------------------------
    // Policies / callable / misc
    // ------------------------------------------------------------------------

    /// Outermost explicit declaration wins; tasks with an implementation
    /// default to consuming everything and forwarding nothing extra,
    /// aggregators default to forwarding everything untouched.
    fn effective_consumes(&self, chain: &[ChainElem], has_impl: bool) -> Consumes {
        for elem in chain.iter().rev() {
            if let Some(t) = elem.task() {
                if let Some(c) = &t.consumes {
                    return c.clone();
                }
            }
        }
        if has_impl {
            Consumes::All
        } else {
            Consumes::No
        }
    }

    fn effective_passthrough(&self, chain: &[ChainElem], has_impl: bool) -> Passthrough {
        for elem in chain.iter().rev() {
            if let Some(t) = elem.task() {
                if let Some(p) = &t.passthrough {
                    return p.clone();
                }
            }
        }
        if has_impl {
            Passthrough::Unused
        } else {
            Passthrough::All
        }
    }

    fn resolve_callable(&self, chain: &[ChainElem]) -> Result<crate::node::TaskCallable> {
        for elem in chain.iter().rev() {
            let Some(t) = elem.task() else { continue };
            if let Some(run) = &t.run {
                let shell = t.shell.clone().unwrap_or_else(|| "bash".to_string());
                if !self.registry.has_shell(&shell) {
                    return Err(DfmError::schema(format!(
                        "shell '{}' is not registered",
                        shell
                    )));
                }
                return Ok(shell_callable(run.clone(), shell));
            }
            if let Some(c) = self.registry.task(&t.name) {
                return Ok(c);
            }
        }
        Ok(null_callable())
    }

    fn run_generator(&mut self, task: &mut Task) -> Result<()> {
        let Some(strategy) = task.strategy.clone() else {
            return Ok(());
        };
        let generated = if let Some(gen_name) = &strategy.generator {
            let generator = self.registry.generator(gen_name).ok_or_else(|| {
                DfmError::name_not_found(format!("generator '{}'", gen_name))
            })?;
            generator(task)?
        } else if let Some(run) = &strategy.run {
            self.run_shell_generator(task, run, strategy.shell.as_deref().unwrap_or("bash"))?
        } else {
            return Ok(());
        };
        for mut sub in generated {
            sub.name = format!("{}.{}", task.name, sub.shortname);
            sub.pkg = task.pkg.clone();
            task.subtasks.push(sub.name.clone());
            self.dynamic.insert(sub.name.clone(), sub);
        }
        Ok(())
    }

    /// `strategy.generate.run`: the script emits a JSON array of task
    /// records (`{name, run, shell?, needs?}`) on stdout describing the
    /// dynamic sub-DAG.
    fn run_shell_generator(&mut self, task: &Task, run: &str, shell: &str) -> Result<Vec<Task>> {
        if !self.registry.has_shell(shell) {
            return Err(DfmError::schema(format!(
                "shell '{}' is not registered",
                shell
            )));
        }
        let ctx = self.static_scope(task)?;
        let script = crate::expr::expand_nested(run, &ctx)?;
        let out = std::process::Command::new(shell)
            .arg("-c")
            .arg(&script)
            .current_dir(self.srcdir_of(task))
            .output()
            .map_err(|e| DfmError::io(format!("running generator for '{}'", task.name), e))?;
        if !out.status.success() {
            return Err(DfmError::ShellFailed {
                cmd: script,
                status: out.status.code().unwrap_or(-1),
                output: String::from_utf8_lossy(&out.stderr).to_string(),
            });
        }
        let specs: Vec<Value> = serde_json::from_slice(&out.stdout).map_err(|e| {
            DfmError::schema(format!(
                "generator for '{}' must emit a JSON task array: {}",
                task.name, e
            ))
        })?;
        let mut tasks = Vec::new();
        for spec in specs {
            let name = spec
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| DfmError::schema("generated task record lacks 'name'"))?;
            let mut t = Task::new(&task.pkg, name);
            t.run = spec.get("run").and_then(|v| v.as_str()).map(String::from);
            t.shell = spec.get("shell").and_then(|v| v.as_str()).map(String::from);
            if let Some(needs) = spec.get("needs").and_then(|v| v.as_array()) {
                for n in needs {
                    if let Some(n) = n.as_str() {
                        t.needs.push(crate::package::NeedRef::parse(n));
                    }
                }
            }
            tasks.push(t);
        }
        Ok(tasks)
    }

    fn parse_iff(&self, task: &Task) -> Result<Option<Template>> {
        match &task.iff {
            None => Ok(None),
            Some(s) if s.contains("${{") => Ok(Some(Template::parse(s)?)),
            Some(s) => Ok(Some(Template::parse(&format!("${{{{ {} }}}}", s))?)),
        }
    }

    fn srcdir_of(&self, task: &Task) -> PathBuf {
        let dir = task
            .srcinfo
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        dir.or_else(|| {
            self.symtab
                .package(&task.pkg)
                .map(|p| p.basedir.clone())
        })
        .unwrap_or_else(|| PathBuf::from("."))
    }

    fn enter_rundir(&mut self, seg: &str) {
        self.rundir_frames
            .last_mut()
            .expect("rundir frame")
            .push(seg.to_string());
    }

    fn leave_rundir(&mut self) {
        self.rundir_frames.last_mut().expect("rundir frame").pop();
    }

    fn current_rundir(&self) -> PathBuf {
        let mut dir = self.root_rundir.clone();
        for seg in self.rundir_frames.last().expect("rundir frame") {
            dir.push(seg);
        }
        dir
    }
}

struct BuildOpts<'a> {
    hierarchical: bool,
    instance_name: Option<String>,
    extra_vars: Option<&'a Map<String, Value>>,
    wire_needs: bool,
    memoize: bool,
}

impl BuildOpts<'_> {
    fn default() -> Self {
        Self {
            hierarchical: false,
            instance_name: None,
            extra_vars: None,
            wire_needs: true,
            memoize: true,
        }
    }
}

fn as_list(v: &Value, name: &str) -> Result<Vec<Value>> {
    match v {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        other => Err(DfmError::schema(format!(
            "parameter '{}' is not a list (got {})",
            name,
            crate::expr::eval::type_name(other)
        ))),
    }
}

fn join_path(current: &Value, parts: &[Value], prepend: bool) -> String {
    let cur = current.as_str().unwrap_or("").to_string();
    let extra: Vec<String> = parts
        .iter()
        .map(|p| p.as_str().map(String::from).unwrap_or_else(|| p.to_string()))
        .collect();
    let extra = extra.join(":");
    if cur.is_empty() {
        extra
    } else if extra.is_empty() {
        cur
    } else if prepend {
        format!("{}:{}", extra, cur)
    } else {
        format!("{}:{}", cur, extra)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PackageLoader;
    use std::io::Write;

    fn build_flow(yaml: &str) -> (TaskGraphBuilder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        let flow = PackageLoader::new().load(&path).unwrap();
        let builder = TaskGraphBuilder::new(
            Arc::new(flow.symtab),
            Arc::new(flow.filters),
            Arc::new(ExtRegistry::new()),
            flow.root_path,
            dir.path().join("rundir"),
        );
        (builder, dir)
    }

    #[test]
    fn test_parameter_inheritance_chain() {
        // Spec scenario: outer-most override wins through a 4-deep chain
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: task_a
      with:
        p1: {type: str, value: "p1_a"}
        p2: {type: str, value: "p2_a"}
        p3: {type: str, value: ""}
    - name: task_b
      uses: task_a
      with:
        p1: "p1_b"
        p4: {type: str, value: "p4_b"}
    - name: task_c
      uses: task_b
      with:
        p1: "p1_c"
        p4: "p4_c"
        p5: {type: str, value: "p5_c"}
    - name: task_d
      uses: task_c
      with:
        p3: "p3_d"
        p5: "p5_d"
"#,
        );
        let id = b.mk_task_node("task_d").unwrap();
        let params = b.node(id).params.resolved().unwrap();
        assert_eq!(params["p1"], json!("p1_c"));
        assert_eq!(params["p2"], json!("p2_a"));
        assert_eq!(params["p3"], json!("p3_d"));
        assert_eq!(params["p4"], json!("p4_c"));
        assert_eq!(params["p5"], json!("p5_d"));
    }

    #[test]
    fn test_override_of_undeclared_param_is_marker() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: t
      with:
        ghost: "value"
"#,
        );
        let id = b.mk_task_node("t").unwrap();
        assert!(!b.markers.is_empty());
        assert!(b.markers[0].msg.contains("ghost"));
        // The node still materialized; the bad field is just absent
        assert!(b.node(id).params.get("ghost").is_none());
    }

    #[test]
    fn test_append_mutates_inherited_list() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: base
      with:
        flags: {type: list, value: ["-a"]}
    - name: leaf
      uses: base
      with:
        flags:
          append: ["-b", "-c"]
"#,
        );
        let id = b.mk_task_node("leaf").unwrap();
        let params = b.node(id).params.resolved().unwrap();
        assert_eq!(params["flags"], json!(["-a", "-b", "-c"]));
    }

    #[test]
    fn test_deferred_param_detection() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: producer
      run: echo p
    - name: consumer
      needs: [producer]
      with:
        x: {type: str, value: "${{ inputs }}"}
        y: {type: str, value: "${{ srcdir }}"}
"#,
        );
        let id = b.mk_task_node("consumer").unwrap();
        let node = b.node(id);
        assert!(matches!(node.params.get("x"), Some(ParamValue::Deferred(_))));
        assert!(matches!(node.params.get("y"), Some(ParamValue::Value(_))));
    }

    #[test]
    fn test_need_rundir_reference_defers() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: compile
      run: echo c
    - name: sim
      needs: [compile]
      with:
        image: {type: str, value: "${{ compile.rundir }}/a.out"}
"#,
        );
        let id = b.mk_task_node("sim").unwrap();
        assert!(matches!(
            b.node(id).params.get("image"),
            Some(ParamValue::Deferred(_))
        ));
    }

    #[test]
    fn test_needs_shared_nodes_memoized() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: common
      run: echo c
    - name: left
      needs: [common]
    - name: right
      needs: [common]
    - name: top
      needs: [left, right]
"#,
        );
        let id = b.mk_task_node("top").unwrap();
        let top = b.node(id);
        assert_eq!(top.needs.len(), 2);
        let left = b.node(top.needs[0].0);
        let right = b.node(top.needs[1].0);
        assert_eq!(left.needs[0].0, right.needs[0].0, "common is shared");
    }

    #[test]
    fn test_needs_splice() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: a
      run: echo a
    - name: b
      run: echo b
    - name: mid
      needs: [a, b]
    - name: top
      needs: [mid.needs]
"#,
        );
        let id = b.mk_task_node("top").unwrap();
        let names: Vec<&str> = b
            .node(id)
            .needs
            .iter()
            .map(|(n, _)| b.node(*n).name.as_str())
            .collect();
        assert_eq!(names, vec!["p.a", "p.b"]);
    }

    #[test]
    fn test_compound_expansion_wiring() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: pre
      run: echo pre
    - name: build
      needs: [pre]
      body:
        - name: compile
          run: echo c
        - name: link
          needs: [compile]
          run: echo l
"#,
        );
        let id = b.mk_task_node("build").unwrap();
        let node = b.node(id);
        let NodeKind::Compound { input, children } = &node.kind else {
            panic!("expected compound");
        };
        assert_eq!(children.len(), 2);

        // Compound's own needs land on the input node
        let input_node = b.node(*input);
        assert_eq!(input_node.needs.len(), 1);
        assert_eq!(b.node(input_node.needs[0].0).name, "p.pre");

        // compile (no internal refs) hangs off input; link refs compile
        let compile = b.find_node("p.build.compile").unwrap();
        let link = b.find_node("p.build.link").unwrap();
        assert!(b.node(compile).needs.iter().any(|(n, _)| n == input));
        assert!(b.node(link).needs.iter().any(|(n, _)| *n == compile));
        // link (never referenced) is the terminal dependency
        assert!(node.needs.iter().any(|(n, _)| *n == link));
        assert!(!node.needs.iter().any(|(n, _)| *n == compile));
    }

    #[test]
    fn test_rundir_assignment() {
        let (mut b, dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: build
      body:
        - name: compile
          run: echo c
        - name: stamp
          rundir: inherit
          needs: [compile]
          run: echo s
"#,
        );
        let id = b.mk_task_node("build").unwrap();
        let rundir = dir.path().join("rundir");
        assert_eq!(b.node(id).rundir, rundir.join("build"));
        let compile = b.find_node("p.build.compile").unwrap();
        assert_eq!(b.node(compile).rundir, rundir.join("build").join("compile"));
        // inherit pushes nothing
        let stamp = b.find_node("p.build.stamp").unwrap();
        assert_eq!(b.node(stamp).rundir, rundir.join("build"));
        // input node lives under <task>.in
        let NodeKind::Compound { input, .. } = &b.node(id).kind else {
            panic!()
        };
        assert_eq!(b.node(*input).rundir, rundir.join("build").join("build.in"));
    }

    #[test]
    fn test_uses_cycle_reported() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: a
      uses: b
    - name: b
      uses: a
"#,
        );
        assert!(matches!(
            b.mk_task_node("a"),
            Err(DfmError::Cycle { .. })
        ));
    }

    #[test]
    fn test_unknown_task_has_suggestions() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: compile
      run: echo c
"#,
        );
        let err = b.mk_task_node("compilr").unwrap_err();
        match err {
            DfmError::NameNotFound { suggestions, .. } => {
                assert!(suggestions.iter().any(|s| s.contains("compile")));
            }
            other => panic!("expected NameNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_std_task_callable_resolution() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: hello
      uses: std.Message
      with:
        msg: "hi"
"#,
        );
        let id = b.mk_task_node("hello").unwrap();
        let node = b.node(id);
        assert!(matches!(node.kind, NodeKind::Leaf { .. }));
        assert_eq!(node.params.get_str("msg"), Some("hi"));
    }

    #[test]
    fn test_unregistered_shell_rejected() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: t
      shell: csh
      run: echo hi
"#,
        );
        let err = b.mk_task_node("t").unwrap_err();
        assert!(err.to_string().contains("csh"));
    }

    #[test]
    fn test_generator_strategy_expands_subtasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
package:
  name: p
  tasks:
    - name: fanout
      strategy:
        generate:
          name: three_echoes
"#,
        )
        .unwrap();
        let flow = PackageLoader::new().load(&path).unwrap();
        let mut registry = ExtRegistry::new();
        registry.register_generator(
            "three_echoes",
            Arc::new(|task: &Task| {
                Ok((0..3)
                    .map(|i| {
                        let mut t = Task::new(&task.pkg, &format!("gen{}", i));
                        t.run = Some(format!("echo {}", i));
                        t
                    })
                    .collect())
            }),
        );
        let mut b = TaskGraphBuilder::new(
            Arc::new(flow.symtab),
            Arc::new(flow.filters),
            Arc::new(registry),
            flow.root_path,
            dir.path().join("rundir"),
        );
        let id = b.mk_task_node("fanout").unwrap();
        let NodeKind::Compound { children, .. } = &b.node(id).kind else {
            panic!("generator should make the task compound");
        };
        assert_eq!(children.len(), 3);
    }

    #[test]
    fn test_package_params_in_scope() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  with:
    tool: {type: str, value: "verilator"}
  tasks:
    - name: t
      with:
        cmd: {type: str, value: "${{ p.tool }} --version"}
"#,
        );
        let id = b.mk_task_node("t").unwrap();
        assert_eq!(
            b.node(id).params.get_str("cmd"),
            Some("verilator --version")
        );
    }

    #[test]
    fn test_this_reference() {
        let (mut b, _dir) = build_flow(
            r#"
package:
  name: p
  tasks:
    - name: t
      with:
        top: {type: str, value: "dut"}
        image: {type: str, value: "${{ this.top }}.bin"}
"#,
        );
        let id = b.mk_task_node("t").unwrap();
        assert_eq!(b.node(id).params.get_str("image"), Some("dut.bin"));
    }
}
