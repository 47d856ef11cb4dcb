//! # Executable task nodes
//!
//! A [`TaskNode`] is an executable instance of a symbolic task at a
//! specific DAG position: concrete rundir, resolved (possibly deferred)
//! parameters, and `(node, block)` edges. Nodes live in the builder's
//! arena and are addressed by [`NodeId`].
//!
//! This module also carries the dataflow plumbing used by the runner's
//! per-node lifecycle: dependency-map merging, the deterministic
//! topological sort that orders a node's inputs, and passthrough
//! propagation.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::ctxt::TaskRunCtxt;
use crate::data::{Consumes, DataItem, Passthrough, TaskDataInput, TaskDataOutput, TaskDataResult};
use crate::errors::{DfmError, Result};
use crate::expr::Template;
use crate::package::ControlDef;
use crate::params::ParamRecord;

pub type NodeId = usize;

pub type TaskFuture = Pin<Box<dyn Future<Output = Result<TaskDataResult>> + Send>>;

/// A task body: invoked with the run context and assembled input
pub type TaskCallable = Arc<dyn Fn(Arc<TaskRunCtxt>, TaskDataInput) -> TaskFuture + Send + Sync>;

pub enum NodeKind {
    Leaf {
        callable: TaskCallable,
    },
    /// Synthetic `input` sink plus the contained children; the compound
    /// node itself is the terminal of the sub-DAG.
    Compound {
        input: NodeId,
        children: Vec<NodeId>,
    },
    /// Body tasks are materialized per iteration/branch at run time
    Control {
        def: ControlDef,
    },
}

impl std::fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeKind::Leaf { .. } => write!(f, "Leaf"),
            NodeKind::Compound { input, children } => f
                .debug_struct("Compound")
                .field("input", input)
                .field("children", children)
                .finish(),
            NodeKind::Control { .. } => write!(f, "Control"),
        }
    }
}

#[derive(Debug)]
pub struct TaskNode {
    pub id: NodeId,
    /// Instance name; iteration copies get `<ctrl>_iter<i>_<task>` names
    pub name: String,
    pub shortname: String,
    pub pkg: String,
    pub srcdir: PathBuf,
    pub rundir: PathBuf,
    pub params: ParamRecord,
    pub needs: Vec<(NodeId, bool)>,
    pub passthrough: Passthrough,
    pub consumes: Consumes,
    pub iff: Option<Template>,
    pub parent: Option<NodeId>,
    pub kind: NodeKind,

    // Runtime state, written only by the scheduler
    pub result: Option<TaskDataResult>,
    pub output: Option<TaskDataOutput>,
    pub skipped: bool,
}

impl TaskNode {
    pub fn is_complete(&self) -> bool {
        self.output.is_some() || self.skipped
    }

    pub fn status(&self) -> i32 {
        self.result.as_ref().map(|r| r.status).unwrap_or(0)
    }
}

// ============================================================================
// DATAFLOW PLUMBING
// ============================================================================

/// Union of the dependency maps of all non-blocking deps
pub fn merge_dep_m(nodes: &[TaskNode], needs: &[(NodeId, bool)]) -> BTreeMap<String, Vec<String>> {
    let mut dep_m: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (dep, block) in needs {
        if *block {
            continue;
        }
        if let Some(out) = &nodes[*dep].output {
            for (name, deps) in &out.dep_m {
                let entry = dep_m.entry(name.clone()).or_default();
                for d in deps {
                    if !entry.contains(d) {
                        entry.push(d.clone());
                    }
                }
            }
        }
    }
    dep_m
}

/// Deterministic level-ordered topological sort of a dependency map
/// (`name -> [its dependencies]`). Within a level, names sort
/// lexicographically, so input ordering is stable across runs.
pub fn topo_sort_dep_m(dep_m: &BTreeMap<String, Vec<String>>) -> Result<Vec<Vec<String>>> {
    let mut universe: BTreeSet<String> = dep_m.keys().cloned().collect();
    for deps in dep_m.values() {
        universe.extend(deps.iter().cloned());
    }

    let mut emitted: BTreeSet<String> = BTreeSet::new();
    let mut levels = Vec::new();
    while emitted.len() < universe.len() {
        let level: Vec<String> = universe
            .iter()
            .filter(|n| !emitted.contains(*n))
            .filter(|n| {
                dep_m
                    .get(*n)
                    .map(|deps| deps.iter().all(|d| emitted.contains(d)))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if level.is_empty() {
            let remaining: Vec<String> = universe.difference(&emitted).cloned().collect();
            return Err(DfmError::Cycle { path: remaining });
        }
        emitted.extend(level.iter().cloned());
        levels.push(level);
    }
    Ok(levels)
}

/// Collect upstream outputs in dependency order: levels of the merged
/// topo sort, deduplicated by `(src, seq)`.
pub fn collect_in_params(
    nodes: &[TaskNode],
    needs: &[(NodeId, bool)],
    levels: &[Vec<String>],
) -> Vec<DataItem> {
    let mut by_src: BTreeMap<String, Vec<DataItem>> = BTreeMap::new();
    let mut seen: BTreeSet<(String, u32)> = BTreeSet::new();
    for (dep, block) in needs {
        if *block {
            continue;
        }
        if let Some(out) = &nodes[*dep].output {
            for item in &out.output {
                if seen.insert(item.key()) {
                    by_src.entry(item.src.clone()).or_default().push(item.clone());
                }
            }
        }
    }

    let mut in_params = Vec::new();
    for level in levels {
        for name in level {
            if let Some(items) = by_src.remove(name) {
                in_params.extend(items);
            }
        }
    }
    // Items whose src never appeared in the dependency map keep arrival order
    for (_, items) in by_src {
        in_params.extend(items);
    }
    in_params
}

/// Apply the node's passthrough policy: which upstream items accompany the
/// node's own outputs downstream.
pub fn apply_passthrough(
    nodes: &[TaskNode],
    node: &TaskNode,
    own_output: &mut Vec<DataItem>,
) {
    match &node.passthrough {
        Passthrough::All => {
            for (dep, block) in &node.needs {
                if *block {
                    continue;
                }
                if let Some(out) = &nodes[*dep].output {
                    own_output.extend(out.output.iter().cloned());
                }
            }
        }
        Passthrough::Unused => {
            for (dep, block) in &node.needs {
                if *block {
                    continue;
                }
                if let Some(out) = &nodes[*dep].output {
                    for item in &out.output {
                        if !node.consumes.matches(item) {
                            own_output.push(item.clone());
                        }
                    }
                }
            }
        }
        Passthrough::Patterns(patterns) => {
            for (dep, block) in &node.needs {
                if *block {
                    continue;
                }
                if let Some(out) = &nodes[*dep].output {
                    for item in &out.output {
                        if patterns.iter().any(|p| crate::data::matches_record(item, p)) {
                            own_output.push(item.clone());
                        }
                    }
                }
            }
        }
        Passthrough::No => {}
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_topo_sort_levels_deterministic() {
        let mut dep_m = BTreeMap::new();
        dep_m.insert("c".to_string(), vec!["a".to_string(), "b".to_string()]);
        dep_m.insert("b".to_string(), vec!["a".to_string()]);
        dep_m.insert("a".to_string(), vec![]);
        let levels = topo_sort_dep_m(&dep_m).unwrap();
        assert_eq!(
            levels,
            vec![
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()]
            ]
        );
    }

    #[test]
    fn test_topo_sort_includes_undeclared_deps() {
        let mut dep_m = BTreeMap::new();
        dep_m.insert("b".to_string(), vec!["a".to_string()]);
        let levels = topo_sort_dep_m(&dep_m).unwrap();
        assert_eq!(levels[0], vec!["a".to_string()]);
    }

    #[test]
    fn test_topo_sort_cycle_detected() {
        let mut dep_m = BTreeMap::new();
        dep_m.insert("a".to_string(), vec!["b".to_string()]);
        dep_m.insert("b".to_string(), vec!["a".to_string()]);
        assert!(matches!(
            topo_sort_dep_m(&dep_m),
            Err(DfmError::Cycle { .. })
        ));
    }

    #[test]
    fn test_topo_sort_same_level_sorted() {
        let mut dep_m = BTreeMap::new();
        dep_m.insert("z".to_string(), vec![]);
        dep_m.insert("m".to_string(), vec![]);
        dep_m.insert("a".to_string(), vec![]);
        let levels = topo_sort_dep_m(&dep_m).unwrap();
        assert_eq!(
            levels[0],
            vec!["a".to_string(), "m".to_string(), "z".to_string()]
        );
    }

    fn leaf_node(id: NodeId, name: &str) -> TaskNode {
        TaskNode {
            id,
            name: name.to_string(),
            shortname: name.to_string(),
            pkg: "p".to_string(),
            srcdir: PathBuf::new(),
            rundir: PathBuf::new(),
            params: ParamRecord::default(),
            needs: vec![],
            passthrough: Passthrough::No,
            consumes: Consumes::All,
            iff: None,
            parent: None,
            kind: NodeKind::Leaf {
                callable: Arc::new(|_, _| Box::pin(async { Ok(TaskDataResult::ok()) })),
            },
            result: None,
            output: None,
            skipped: false,
        }
    }

    fn item(ty: &str, src: &str, seq: u32) -> DataItem {
        let mut it = DataItem::new(ty);
        it.src = src.to_string();
        it.seq = seq;
        it
    }

    #[test]
    fn test_collect_in_params_dedups_and_orders() {
        let mut producer_a = leaf_node(0, "a");
        producer_a.output = Some(TaskDataOutput {
            changed: false,
            dep_m: BTreeMap::from([("a".to_string(), vec![])]),
            output: vec![item("T", "a", 0), item("T", "a", 1)],
        });
        let mut producer_b = leaf_node(1, "b");
        producer_b.output = Some(TaskDataOutput {
            changed: false,
            dep_m: BTreeMap::from([("b".to_string(), vec!["a".to_string()])]),
            // b forwards a's item too: same (src, seq) must not duplicate
            output: vec![item("T", "b", 0), item("T", "a", 0)],
        });
        let nodes = vec![producer_a, producer_b];
        let needs = vec![(0usize, false), (1usize, false)];

        let dep_m = merge_dep_m(&nodes, &needs);
        let levels = topo_sort_dep_m(&dep_m).unwrap();
        let in_params = collect_in_params(&nodes, &needs, &levels);

        let keys: Vec<(String, u32)> = in_params.iter().map(|i| i.key()).collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 0)
            ]
        );
    }

    #[test]
    fn test_passthrough_unused_excludes_consumed() {
        let mut dep = leaf_node(0, "up");
        dep.output = Some(TaskDataOutput {
            changed: false,
            dep_m: BTreeMap::new(),
            output: vec![item("std.FileSet", "up", 0), item("std.Env", "up", 1)],
        });
        let nodes = vec![dep];

        let mut consumer = leaf_node(1, "down");
        consumer.needs = vec![(0, false)];
        let mut rec = crate::data::MatchRecord::new();
        rec.insert("type".to_string(), json!("std.FileSet"));
        consumer.consumes = Consumes::Patterns(vec![rec]);
        consumer.passthrough = Passthrough::Unused;

        let mut out = vec![];
        apply_passthrough(&nodes, &consumer, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ty, "std.Env");
    }

    #[test]
    fn test_passthrough_all_and_none() {
        let mut dep = leaf_node(0, "up");
        dep.output = Some(TaskDataOutput {
            changed: false,
            dep_m: BTreeMap::new(),
            output: vec![item("T", "up", 0)],
        });
        let nodes = vec![dep];

        let mut consumer = leaf_node(1, "down");
        consumer.needs = vec![(0, false)];

        consumer.passthrough = Passthrough::All;
        let mut out = vec![item("T", "down", 0)];
        apply_passthrough(&nodes, &consumer, &mut out);
        assert_eq!(out.len(), 2);

        consumer.passthrough = Passthrough::No;
        let mut out = vec![item("T", "down", 0)];
        apply_passthrough(&nodes, &consumer, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_blocking_needs_excluded_from_dataflow() {
        let mut dep = leaf_node(0, "up");
        dep.output = Some(TaskDataOutput {
            changed: false,
            dep_m: BTreeMap::from([("up".to_string(), vec![])]),
            output: vec![item("T", "up", 0)],
        });
        let nodes = vec![dep];
        let needs = vec![(0usize, true)];

        assert!(merge_dep_m(&nodes, &needs).is_empty());
        let in_params = collect_in_params(&nodes, &needs, &[]);
        assert!(in_params.is_empty());
    }
}
