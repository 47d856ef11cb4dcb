//! # Parallel task-set runner
//!
//! Dependency-ordered scheduler over the node arena. Up to `nproc` task
//! bodies are in flight at once; bodies that spawn subprocesses
//! additionally hold a jobserver token (acquired inside the run context).
//! The scheduler task is the only writer of node state: bodies receive
//! snapshots and return results that are merged on completion.
//!
//! Failure of one task stops its downstream descendants but lets
//! independent branches continue; the final status is the maximum task
//! status, or 1 on a scheduler-level error.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use colored::Colorize;
use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::builder::TaskGraphBuilder;
use crate::ctxt::{CancelToken, TaskRunCtxt};
use crate::data::{
    read_memento, write_memento, DataItem, TaskDataInput, TaskDataOutput, TaskDataResult,
};
use crate::errors::{DfmError, Marker, Result};
use crate::expr::{truthy, EvalCtx};
use crate::jobserver::Jobserver;
use crate::node::{
    apply_passthrough, collect_in_params, merge_dep_m, topo_sort_dep_m, NodeId, NodeKind, TaskNode,
};
use crate::package::{ControlDef, ControlKind};

// ============================================================================
// EVENTS / LISTENERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Enter,
    Leave,
    Error,
}

/// Synchronous callbacks invoked from the scheduler; they must not block
/// on task completion.
pub type Listener = Box<dyn Fn(&TaskNode, EventKind) + Send>;

/// Bundled listener printing colored status lines
pub fn log_listener() -> Listener {
    Box::new(|node, kind| match kind {
        EventKind::Enter => println!("{} {}", ">>".cyan().bold(), node.name),
        EventKind::Leave => println!("{} {}", "<<".green().bold(), node.name),
        EventKind::Error => println!(
            "{} {} (status {})",
            "!!".red().bold(),
            node.name,
            node.status()
        ),
    })
}

// ============================================================================
// RUNNER
// ============================================================================

pub struct TaskSetRunner {
    rundir: PathBuf,
    nproc: usize,
    jobserver: Option<Arc<Jobserver>>,
    listeners: Vec<Listener>,
    cancel: CancelToken,
    save_exec_data: bool,
    base_env: HashMap<String, String>,
}

impl TaskSetRunner {
    /// `nproc <= 0` selects the machine's available parallelism
    pub fn new(rundir: impl Into<PathBuf>, nproc: i64) -> Self {
        let nproc = if nproc <= 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            nproc as usize
        };
        Self {
            rundir: rundir.into(),
            nproc,
            jobserver: None,
            listeners: Vec::new(),
            cancel: CancelToken::new(),
            save_exec_data: false,
            base_env: std::env::vars().collect(),
        }
    }

    pub fn add_listener(&mut self, l: Listener) -> &mut Self {
        self.listeners.push(l);
        self
    }

    pub fn with_jobserver(mut self, js: Arc<Jobserver>) -> Self {
        self.jobserver = Some(js);
        self
    }

    pub fn set_save_exec_data(&mut self, on: bool) {
        self.save_exec_data = on;
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn nproc(&self) -> usize {
        self.nproc
    }

    fn emit(&self, node: &TaskNode, kind: EventKind) {
        for l in &self.listeners {
            l(node, kind);
        }
    }

    /// Execute the graph rooted at `root`. Returns the final status: the
    /// maximum over all task statuses, non-zero on cancellation.
    pub async fn run(&mut self, builder: &mut TaskGraphBuilder, root: NodeId) -> Result<i32> {
        if self.jobserver.is_none() {
            let js = match Jobserver::from_environment() {
                Some(js) => js,
                None => Jobserver::create(self.nproc)?,
            };
            self.jobserver = Some(Arc::new(js));
        }
        check_cycles(builder, root)?;
        std::fs::create_dir_all(&self.rundir)
            .map_err(|e| DfmError::io(format!("creating {}", self.rundir.display()), e))?;
        self.run_set(builder, vec![root]).await
    }

    /// Nested scheduling entry point; control nodes re-enter here for
    /// their iteration sub-DAGs.
    async fn run_set(
        &mut self,
        builder: &mut TaskGraphBuilder,
        roots: Vec<NodeId>,
    ) -> Result<i32> {
        // Transitive closure of incomplete work
        let mut pending: BTreeSet<NodeId> = BTreeSet::new();
        let mut stack = roots.clone();
        while let Some(id) = stack.pop() {
            if builder.node(id).is_complete() || !pending.insert(id) {
                continue;
            }
            stack.extend(builder.node(id).needs.iter().map(|(n, _)| *n));
            if let NodeKind::Compound { input, children } = &builder.node(id).kind {
                stack.push(*input);
                stack.extend(children.iter().copied());
            }
        }

        let mut active: JoinSet<(NodeId, Result<TaskDataResult>, Vec<Marker>)> = JoinSet::new();
        let mut status = 0i32;

        loop {
            self.propagate_skips(builder, &mut pending);

            let mut dispatched = false;
            if !self.cancel.is_cancelled() {
                let ready: Vec<NodeId> = pending
                    .iter()
                    .copied()
                    .filter(|id| {
                        builder
                            .node(*id)
                            .needs
                            .iter()
                            .all(|(n, _)| builder.node(*n).is_complete())
                    })
                    .collect();

                for id in ready {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if matches!(builder.node(id).kind, NodeKind::Control { .. }) {
                        pending.remove(&id);
                        let ctrl_status = match self.run_control(builder, id).await {
                            Ok(s) => s,
                            Err(e) => self.fail_node(builder, id, e),
                        };
                        status = status.max(ctrl_status);
                        dispatched = true;
                        break; // re-scan: the control may unblock others
                    }
                    if active.len() >= self.nproc {
                        break;
                    }
                    pending.remove(&id);
                    dispatched = true;
                    match self.prepare(builder, id) {
                        Ok((callable, ctxt, input)) => {
                            self.emit(builder.node(id), EventKind::Enter);
                            active.spawn(async move {
                                let result = callable(ctxt.clone(), input).await;
                                (id, result, ctxt.take_markers())
                            });
                        }
                        Err(e) => {
                            let s = self.fail_node(builder, id, e);
                            status = status.max(s);
                        }
                    }
                }
            }

            if let Some(joined) = active.join_next().await {
                let (id, result, markers) = joined
                    .map_err(|e| DfmError::schema(format!("task body panicked: {}", e)))?;
                let s = self.complete(builder, id, result, markers)?;
                status = status.max(s);
                continue;
            }

            // No active work: either everything ran, we were cancelled, or
            // nothing further can be dispatched
            if pending.is_empty() || self.cancel.is_cancelled() || !dispatched {
                break;
            }
        }

        if self.cancel.is_cancelled() {
            status = status.max(1);
        } else if !pending.is_empty() {
            return Err(DfmError::schema(format!(
                "scheduler stalled with {} task(s) unrunnable",
                pending.len()
            )));
        }
        Ok(status)
    }

    /// Remove nodes whose dependencies failed or were skipped; they never
    /// start, and the failure propagates transitively.
    fn propagate_skips(&self, builder: &mut TaskGraphBuilder, pending: &mut BTreeSet<NodeId>) {
        loop {
            let skip: Vec<NodeId> = pending
                .iter()
                .copied()
                .filter(|id| {
                    builder.node(*id).needs.iter().any(|(n, _)| {
                        let dep = builder.node(*n);
                        dep.skipped || (dep.is_complete() && dep.status() != 0)
                    })
                })
                .collect();
            if skip.is_empty() {
                return;
            }
            for id in skip {
                debug!(task = %builder.node(id).name, "skipping (failed dependency)");
                pending.remove(&id);
                builder.node_mut(id).skipped = true;
            }
        }
    }

    // ------------------------------------------------------------------------
    // Leaf/compound lifecycle
    // ------------------------------------------------------------------------

    /// Steps 1-7 of the leaf lifecycle: assemble the input snapshot and
    /// the run context.
    fn prepare(
        &self,
        builder: &mut TaskGraphBuilder,
        id: NodeId,
    ) -> Result<(crate::node::TaskCallable, Arc<TaskRunCtxt>, TaskDataInput)> {
        let nodes = &builder.nodes;
        let node = &nodes[id];

        let changed = node
            .needs
            .iter()
            .filter_map(|(n, _)| nodes[*n].output.as_ref())
            .any(|o| o.changed);

        let dep_m = merge_dep_m(nodes, &node.needs);
        let levels = topo_sort_dep_m(&dep_m)?;
        let in_params = collect_in_params(nodes, &node.needs, &levels);

        let inputs: Vec<DataItem> = in_params
            .iter()
            .filter(|item| node.consumes.matches(item))
            .cloned()
            .collect();

        std::fs::create_dir_all(&node.rundir)
            .map_err(|e| DfmError::io(format!("creating {}", node.rundir.display()), e))?;
        let memento = read_memento(&node.rundir);

        // Runtime scope for deferred parameters
        let mut runtime = EvalCtx::new();
        runtime.set(
            "inputs",
            Value::Array(inputs.iter().map(|i| i.to_value()).collect()),
        );
        runtime.set(
            "in",
            Value::Array(in_params.iter().map(|i| i.to_value()).collect()),
        );
        runtime.set("rundir", json!(node.rundir.to_string_lossy()));
        runtime.set("memento", memento.clone().unwrap_or(Value::Null));
        for (dep, _) in &node.needs {
            let dep = &nodes[*dep];
            runtime.set(
                format!("{}.rundir", dep.shortname),
                json!(dep.rundir.to_string_lossy()),
            );
            runtime.set(
                format!("{}.rundir", dep.name),
                json!(dep.rundir.to_string_lossy()),
            );
        }

        // Evaluate every deferred parameter exactly once
        let mut params = Map::new();
        for (name, value) in node.params.iter() {
            let v = match value {
                crate::params::ParamValue::Value(v) => v,
                crate::params::ParamValue::Deferred(d) => d.evaluate(&runtime)?,
            };
            params.insert(name.to_string(), v);
        }

        // iff gating: a false guard swaps in the null body
        let mut callable = match &node.kind {
            NodeKind::Leaf { callable } => callable.clone(),
            NodeKind::Compound { .. } => crate::std_tasks::null_callable(),
            NodeKind::Control { .. } => {
                return Err(DfmError::schema("control nodes run inline"))
            }
        };
        if let Some(iff) = &node.iff {
            let mut guard_ctx = runtime.clone();
            for (k, v) in &params {
                guard_ctx.set(k.clone(), v.clone());
            }
            if !truthy(&iff.eval(&guard_ctx)?) {
                debug!(task = %node.name, "iff guard false, skipping body");
                callable = crate::std_tasks::null_callable();
            }
        }

        let ctxt = Arc::new(TaskRunCtxt::new(
            node.name.clone(),
            node.srcdir.clone(),
            node.rundir.clone(),
            &self.base_env,
            &inputs,
            self.jobserver.clone(),
            self.cancel.clone(),
        ));

        let input = TaskDataInput {
            name: node.name.clone(),
            changed,
            srcdir: node.srcdir.clone(),
            rundir: node.rundir.clone(),
            params,
            inputs,
            memento,
        };

        Ok((callable, ctxt, input))
    }

    /// Steps 8-11: merge the body's result, stamp outputs, apply
    /// passthrough, persist memento and exec data, publish the envelope.
    fn complete(
        &self,
        builder: &mut TaskGraphBuilder,
        id: NodeId,
        result: Result<TaskDataResult>,
        ctxt_markers: Vec<Marker>,
    ) -> Result<i32> {
        let mut res = match result {
            Ok(res) => res,
            Err(e) => {
                warn!(task = %builder.node(id).name, error = %e, "task body failed");
                let mut r = TaskDataResult::with_status(1);
                r.markers.push(e.to_marker());
                r
            }
        };
        res.markers.extend(ctxt_markers);

        let name = builder.node(id).name.clone();
        for (i, out) in res.output.iter_mut().enumerate() {
            out.src = name.clone();
            out.seq = i as u32;
        }

        if let Some(memento) = &res.memento {
            if let Err(e) = write_memento(&builder.node(id).rundir, memento) {
                warn!(task = %name, error = %e, "failed to persist memento");
                res.markers.push(e.to_marker());
            }
        }

        let mut dep_m = merge_dep_m(&builder.nodes, &builder.node(id).needs);
        dep_m.insert(
            name.clone(),
            builder
                .node(id)
                .needs
                .iter()
                .map(|(n, _)| builder.node(*n).name.clone())
                .collect(),
        );

        let mut output_items = res.output.clone();
        apply_passthrough(&builder.nodes, builder.node(id), &mut output_items);

        if self.save_exec_data {
            self.write_exec_data(builder.node(id), &res, &output_items);
        }

        let status = res.status;
        let changed = res.changed;
        {
            let node = builder.node_mut(id);
            node.result = Some(res);
            node.output = Some(TaskDataOutput {
                changed,
                dep_m,
                output: output_items,
            });
        }

        self.emit(
            builder.node(id),
            if status == 0 {
                EventKind::Leave
            } else {
                EventKind::Error
            },
        );
        Ok(status)
    }

    /// A node whose preparation failed completes immediately with status 1
    fn fail_node(&self, builder: &mut TaskGraphBuilder, id: NodeId, err: DfmError) -> i32 {
        warn!(task = %builder.node(id).name, error = %err, "task preparation failed");
        let mut res = TaskDataResult::with_status(1);
        res.markers.push(err.to_marker());
        let node = builder.node_mut(id);
        node.result = Some(res);
        node.output = Some(TaskDataOutput::default());
        self.emit(builder.node(id), EventKind::Error);
        1
    }

    fn write_exec_data(&self, node: &TaskNode, res: &TaskDataResult, forwarded: &[DataItem]) {
        let summary = json!({
            "name": node.name,
            "status": res.status,
            "changed": res.changed,
            "params": node.params.to_json(),
            "inputs": forwarded.iter().map(|i| i.to_value()).collect::<Vec<_>>(),
            "outputs": res.output.iter().map(|i| i.to_value()).collect::<Vec<_>>(),
            "memento": res.memento,
            "markers": res.markers,
        });
        let path = node
            .rundir
            .join(format!("{}.exec_data.json", node.shortname));
        if let Err(e) =
            std::fs::write(&path, serde_json::to_string_pretty(&summary).unwrap_or_default())
        {
            warn!(path = %path.display(), error = %e, "failed to write exec data");
        }
    }

    // ------------------------------------------------------------------------
    // Control-flow nodes
    // ------------------------------------------------------------------------

    fn run_set_boxed<'a>(
        &'a mut self,
        builder: &'a mut TaskGraphBuilder,
        roots: Vec<NodeId>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>> {
        Box::pin(self.run_set(builder, roots))
    }

    /// Materialize and run a control node: each iteration or selected
    /// branch instantiates a fresh sub-DAG scheduled through the same
    /// runner.
    async fn run_control(&mut self, builder: &mut TaskGraphBuilder, id: NodeId) -> Result<i32> {
        let def: ControlDef = match &builder.node(id).kind {
            NodeKind::Control { def } => def.clone(),
            _ => return Err(DfmError::schema("not a control node")),
        };
        let name = builder.node(id).name.clone();
        let base_segs = builder.rundir_segments(id);
        self.emit(builder.node(id), EventKind::Enter);

        let mut state: Map<String, Value> = def
            .state
            .as_ref()
            .map(|s| s.init.clone())
            .unwrap_or_default();
        let max_iter = def.max_iter;
        let mut status = 0i32;
        let mut last_output: Vec<DataItem> = Vec::new();
        let mut markers: Vec<Marker> = Vec::new();
        let mut exhausted = false;

        match &def.kind {
            ControlKind::If {
                cond,
                body,
                else_body,
            } => {
                state.insert("_iter".into(), json!(0));
                state.insert("_max_iter".into(), json!(max_iter));
                let branch = if truthy(&eval_in_state(cond, &state)?) {
                    body
                } else {
                    else_body
                };
                if !branch.is_empty() {
                    let (s, out, new_state) = self
                        .run_iteration(builder, branch, &name, &base_segs, 0, &state)
                        .await?;
                    status = s;
                    last_output = out;
                    state = new_state;
                }
            }
            ControlKind::Match { expr, cases } => {
                state.insert("_iter".into(), json!(0));
                state.insert("_max_iter".into(), json!(max_iter));
                let value = eval_in_state(expr, &state)?;
                let mut selected: Option<&Vec<String>> = None;
                for case in cases {
                    match &case.when {
                        Some(when) => {
                            let mut ctx = state_ctx(&state);
                            ctx.set("value", value.clone());
                            let wv = ctx.eval_str(&strip_expr(when))?;
                            let matched = match &wv {
                                Value::Bool(b) => *b,
                                other => *other == value,
                            };
                            if matched {
                                selected = Some(&case.body);
                                break;
                            }
                        }
                        None => {
                            selected = Some(&case.body);
                            break;
                        }
                    }
                }
                if let Some(body) = selected {
                    if !body.is_empty() {
                        let (s, out, new_state) = self
                            .run_iteration(builder, body, &name, &base_segs, 0, &state)
                            .await?;
                        status = s;
                        last_output = out;
                        state = new_state;
                    }
                }
            }
            ControlKind::While { cond, body } => {
                let mut iter = 0u32;
                loop {
                    if iter >= max_iter {
                        exhausted = true;
                        break;
                    }
                    state.insert("_iter".into(), json!(iter));
                    state.insert("_max_iter".into(), json!(max_iter));
                    if !truthy(&eval_in_state(cond, &state)?) {
                        break;
                    }
                    let (s, out, new_state) = self
                        .run_iteration(builder, body, &name, &base_segs, iter, &state)
                        .await?;
                    status = status.max(s);
                    last_output = out;
                    if s != 0 {
                        break;
                    }
                    let brk = check_break(&new_state);
                    state = self.apply_feedback(&def, new_state)?;
                    if brk {
                        break;
                    }
                    iter += 1;
                }
            }
            ControlKind::DoWhile { until, body } => {
                let mut iter = 0u32;
                loop {
                    if iter >= max_iter {
                        exhausted = true;
                        break;
                    }
                    state.insert("_iter".into(), json!(iter));
                    state.insert("_max_iter".into(), json!(max_iter));
                    let (s, out, new_state) = self
                        .run_iteration(builder, body, &name, &base_segs, iter, &state)
                        .await?;
                    status = status.max(s);
                    last_output = out;
                    if s != 0 {
                        break;
                    }
                    let brk = check_break(&new_state);
                    state = self.apply_feedback(&def, new_state)?;
                    if brk {
                        break;
                    }
                    // Post-condition: checked after the iteration completes
                    if truthy(&eval_in_state(until, &state)?) {
                        break;
                    }
                    iter += 1;
                }
            }
            ControlKind::Repeat { count, until, body } => {
                let count_v = eval_in_state(count, &state)?;
                let count = count_v.as_i64().ok_or_else(|| {
                    DfmError::schema(format!("repeat count is not an integer: {}", count_v))
                })?;
                let mut iter: i64 = 0;
                while iter < count {
                    if iter as u32 >= max_iter {
                        exhausted = true;
                        break;
                    }
                    state.insert("_iter".into(), json!(iter));
                    state.insert("_max_iter".into(), json!(max_iter));
                    let (s, out, new_state) = self
                        .run_iteration(builder, body, &name, &base_segs, iter as u32, &state)
                        .await?;
                    status = status.max(s);
                    last_output = out;
                    if s != 0 {
                        break;
                    }
                    let brk = check_break(&new_state);
                    state = self.apply_feedback(&def, new_state)?;
                    if brk {
                        break;
                    }
                    if let Some(until) = until {
                        if truthy(&eval_in_state(until, &state)?) {
                            break;
                        }
                    }
                    iter += 1;
                }
            }
        }

        if exhausted {
            warn!(task = %name, max_iter, "control loop reached max-iter");
            markers.push(Marker::warning(format!(
                "loop '{}' reached max-iter ({})",
                name, max_iter
            )));
        }

        // Publish the control node's result: the last iteration's outputs,
        // re-emitted under the control node's name.
        for (i, out) in last_output.iter_mut().enumerate() {
            out.src = name.clone();
            out.seq = i as u32;
        }
        let mut dep_m = merge_dep_m(&builder.nodes, &builder.node(id).needs);
        dep_m.insert(
            name.clone(),
            builder
                .node(id)
                .needs
                .iter()
                .map(|(n, _)| builder.node(*n).name.clone())
                .collect(),
        );
        let mut output_items = last_output.clone();
        apply_passthrough(&builder.nodes, builder.node(id), &mut output_items);

        {
            let node = builder.node_mut(id);
            node.result = Some(TaskDataResult {
                status,
                changed: true,
                output: last_output,
                markers,
                memento: None,
            });
            node.output = Some(TaskDataOutput {
                changed: true,
                dep_m,
                output: output_items,
            });
        }
        self.emit(
            builder.node(id),
            if status == 0 {
                EventKind::Leave
            } else {
                EventKind::Error
            },
        );
        Ok(status)
    }

    /// Build one iteration's sub-DAG, run it, and extract the next state
    /// from the output items' `data` mappings.
    async fn run_iteration(
        &mut self,
        builder: &mut TaskGraphBuilder,
        body: &[String],
        ctrl_name: &str,
        base_segs: &[String],
        iter: u32,
        state: &Map<String, Value>,
    ) -> Result<(i32, Vec<DataItem>, Map<String, Value>)> {
        let mut segs = base_segs.to_vec();
        segs.push(format!("iter_{}", iter));

        let mut extra = state.clone();
        extra.insert("state".into(), Value::Object(state.clone()));

        let prefix = format!("{}_iter{}", ctrl_name, iter);
        let built = builder.mk_iteration_nodes(body, &prefix, &segs, &extra)?;
        let ids: Vec<NodeId> = built.iter().map(|(_, id)| *id).collect();

        debug!(ctrl = ctrl_name, iter, tasks = ids.len(), "running iteration sub-DAG");
        let status = self.run_set_boxed(builder, ids.clone()).await?;

        // Terminal nodes: body instances no sibling depends on
        let id_set: BTreeSet<NodeId> = ids.iter().copied().collect();
        let mut referenced: BTreeSet<NodeId> = BTreeSet::new();
        for id in &ids {
            for (n, _) in &builder.node(*id).needs {
                if id_set.contains(n) {
                    referenced.insert(*n);
                }
            }
        }
        let mut outputs: Vec<DataItem> = Vec::new();
        for id in &ids {
            if !referenced.contains(id) {
                if let Some(out) = &builder.node(*id).output {
                    outputs.extend(out.output.iter().cloned());
                }
            }
        }

        // State update: merge each item's `data` mapping, newest last
        let mut new_state = state.clone();
        for item in &outputs {
            if let Some(Value::Object(data)) = item.payload.get("data") {
                for (k, v) in data {
                    new_state.insert(k.clone(), v.clone());
                }
            }
        }
        Ok((status, outputs, new_state))
    }

    fn apply_feedback(
        &self,
        def: &ControlDef,
        state: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let Some(feedback) = def.state.as_ref().and_then(|s| s.feedback.as_ref()) else {
            return Ok(state);
        };
        let ctx = state_ctx(&state);
        let v = ctx.eval_str(&strip_expr(feedback))?;
        match v {
            Value::Object(m) => Ok(m),
            other => Err(DfmError::schema(format!(
                "state feedback must produce an object, got {}",
                crate::expr::eval::type_name(&other)
            ))),
        }
    }
}

// ============================================================================
// CONTROL HELPERS
// ============================================================================

fn state_ctx(state: &Map<String, Value>) -> EvalCtx {
    let mut ctx = EvalCtx::new();
    for (k, v) in state {
        ctx.set(k.clone(), v.clone());
    }
    ctx.set("state", Value::Object(state.clone()));
    ctx
}

/// Gating expressions accept either `${{ expr }}` or a bare expression
fn strip_expr(s: &str) -> String {
    let t = s.trim();
    if let Some(inner) = t.strip_prefix("${{").and_then(|t| t.strip_suffix("}}")) {
        inner.trim().to_string()
    } else {
        t.to_string()
    }
}

fn eval_in_state(expr: &str, state: &Map<String, Value>) -> Result<Value> {
    state_ctx(state).eval_str(&strip_expr(expr))
}

fn check_break(state: &Map<String, Value>) -> bool {
    state.get("_break").map(truthy).unwrap_or(false)
}

// ============================================================================
// CYCLE DETECTION
// ============================================================================

/// DFS over `needs` from the root; a back-edge is an error carrying the
/// offending path.
pub fn check_cycles(builder: &TaskGraphBuilder, root: NodeId) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }
    let mut color = vec![Color::White; builder.nodes.len()];
    let mut path: Vec<NodeId> = Vec::new();

    fn visit(
        builder: &TaskGraphBuilder,
        id: NodeId,
        color: &mut [Color],
        path: &mut Vec<NodeId>,
    ) -> Result<()> {
        color[id] = Color::Grey;
        path.push(id);
        for (dep, _) in &builder.node(id).needs {
            match color[*dep] {
                Color::Grey => {
                    let start = path.iter().position(|p| p == dep).unwrap_or(0);
                    let mut names: Vec<String> = path[start..]
                        .iter()
                        .map(|p| builder.node(*p).name.clone())
                        .collect();
                    names.push(builder.node(*dep).name.clone());
                    return Err(DfmError::Cycle { path: names });
                }
                Color::White => visit(builder, *dep, color, path)?,
                Color::Black => {}
            }
        }
        path.pop();
        color[id] = Color::Black;
        Ok(())
    }

    visit(builder, root, &mut color, &mut path)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PackageLoader;
    use crate::std_tasks::ExtRegistry;

    async fn run_flow(yaml: &str, root: &str) -> (TaskGraphBuilder, i32, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(&path, yaml).unwrap();
        let flow = PackageLoader::new().load(&path).unwrap();
        let mut builder = TaskGraphBuilder::new(
            Arc::new(flow.symtab),
            Arc::new(flow.filters),
            Arc::new(ExtRegistry::new()),
            flow.root_path,
            dir.path().join("rundir"),
        );
        let id = builder.mk_task_node(root).unwrap();
        let mut runner = TaskSetRunner::new(dir.path().join("rundir"), 2);
        let status = runner.run(&mut builder, id).await.unwrap();
        (builder, status, dir)
    }

    #[tokio::test]
    async fn test_single_shell_task() {
        let (builder, status, dir) = run_flow(
            r#"
package:
  name: p
  tasks:
    - name: hello
      run: echo hi > marker.txt
"#,
            "hello",
        )
        .await;
        assert_eq!(status, 0);
        let id = builder.find_node("p.hello").unwrap();
        assert_eq!(builder.node(id).status(), 0);
        assert!(dir
            .path()
            .join("rundir")
            .join("hello")
            .join("marker.txt")
            .exists());
    }

    #[tokio::test]
    async fn test_failed_task_skips_downstream() {
        let (builder, status, _dir) = run_flow(
            r#"
package:
  name: p
  tasks:
    - name: boom
      run: exit 3
    - name: after
      needs: [boom]
      run: echo never
    - name: independent
      run: echo ok
    - name: top
      needs: [after, independent]
"#,
            "top",
        )
        .await;
        assert_ne!(status, 0);
        let after = builder.find_node("p.after").unwrap();
        assert!(builder.node(after).skipped);
        // Independent branch still ran
        let indep = builder.find_node("p.independent").unwrap();
        assert_eq!(builder.node(indep).status(), 0);
        assert!(builder.node(indep).output.is_some());
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
package:
  name: p
  tasks:
    - name: a
      needs: [b]
      run: echo a
    - name: b
      needs: [a]
      run: echo b
"#,
        )
        .unwrap();
        let flow = PackageLoader::new().load(&path).unwrap();
        let mut builder = TaskGraphBuilder::new(
            Arc::new(flow.symtab),
            Arc::new(flow.filters),
            Arc::new(ExtRegistry::new()),
            flow.root_path,
            dir.path().join("rundir"),
        );
        let id = builder.mk_task_node("a").unwrap();
        let err = check_cycles(&builder, id).unwrap_err();
        assert!(matches!(err, DfmError::Cycle { .. }));
    }

    #[tokio::test]
    async fn test_iff_guard_skips_body() {
        let (builder, status, dir) = run_flow(
            r#"
package:
  name: p
  tasks:
    - name: guarded
      iff: "1 == 2"
      run: echo no > guarded.txt
"#,
            "guarded",
        )
        .await;
        assert_eq!(status, 0);
        let id = builder.find_node("p.guarded").unwrap();
        assert!(builder.node(id).output.is_some());
        assert!(!dir
            .path()
            .join("rundir")
            .join("guarded")
            .join("guarded.txt")
            .exists());
    }

    #[tokio::test]
    async fn test_memento_persisted_and_reread() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.sv"), "module x;").unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
package:
  name: p
  tasks:
    - name: files
      uses: std.FileSet
      with:
        include: "*.sv"
"#,
        )
        .unwrap();

        for pass in 0..2 {
            let flow = PackageLoader::new().load(&path).unwrap();
            let mut builder = TaskGraphBuilder::new(
                Arc::new(flow.symtab),
                Arc::new(flow.filters),
                Arc::new(ExtRegistry::new()),
                flow.root_path.clone(),
                dir.path().join("rundir"),
            );
            let id = builder.mk_task_node("files").unwrap();
            let mut runner = TaskSetRunner::new(dir.path().join("rundir"), 1);
            let status = runner.run(&mut builder, id).await.unwrap();
            assert_eq!(status, 0);
            let changed = builder.node(id).result.as_ref().unwrap().changed;
            if pass == 0 {
                assert!(changed, "first run must be changed");
            } else {
                assert!(!changed, "second run must be up-to-date");
            }
        }
        assert!(dir
            .path()
            .join("rundir")
            .join("files")
            .join("memento.json")
            .exists());
    }
}
