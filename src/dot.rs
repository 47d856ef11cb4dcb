//! Graphviz rendering of a built task graph.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;

use crate::builder::TaskGraphBuilder;
use crate::errors::{DfmError, Result};
use crate::node::{NodeId, NodeKind};

/// Write the graph reachable from `root` in dot format
pub fn write_dot<W: Write>(builder: &TaskGraphBuilder, root: NodeId, out: &mut W) -> Result<()> {
    let mut ids: BTreeSet<NodeId> = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !ids.insert(id) {
            continue;
        }
        stack.extend(builder.node(id).needs.iter().map(|(n, _)| *n));
        if let NodeKind::Compound { input, children } = &builder.node(id).kind {
            stack.push(*input);
            stack.extend(children.iter().copied());
        }
    }

    let mut names: HashMap<NodeId, String> = HashMap::new();
    for (i, id) in ids.iter().enumerate() {
        names.insert(*id, format!("n{}", i + 1));
    }

    let w = |e: std::io::Error| DfmError::io("writing dot graph".to_string(), e);
    writeln!(out, "digraph G {{").map_err(w)?;
    for id in &ids {
        let node = builder.node(*id);
        let shape = match node.kind {
            NodeKind::Compound { .. } => "folder",
            NodeKind::Control { .. } => "diamond",
            NodeKind::Leaf { .. } => "box",
        };
        writeln!(
            out,
            "    {} [label=\"{}\",shape={}];",
            names[id], node.name, shape
        )
        .map_err(w)?;
    }
    for id in &ids {
        for (dep, block) in &builder.node(*id).needs {
            let style = if *block { " [style=dashed]" } else { "" };
            writeln!(out, "    {} -> {}{};", names[dep], names[id], style).map_err(w)?;
        }
    }
    writeln!(out, "}}").map_err(w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::PackageLoader;
    use crate::std_tasks::ExtRegistry;
    use std::sync::Arc;

    #[test]
    fn test_dot_output_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        std::fs::write(
            &path,
            r#"
package:
  name: p
  tasks:
    - name: a
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
        let root = builder.mk_task_node("b").unwrap();
        let mut buf = Vec::new();
        write_dot(&builder, root, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("digraph G {"));
        assert!(text.contains("p.a"));
        assert!(text.contains("->"));
        assert!(text.trim_end().ends_with('}'));
    }
}
