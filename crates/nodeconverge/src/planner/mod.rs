use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::task::{Reconcile, TaskRegistry};

pub type TaskId = String;

/// One `[[tasks]]` entry as written in a run file.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDecl {
    pub id: TaskId,
    pub kind: String,
    #[serde(default)]
    pub after: Vec<TaskId>,
    /// Everything else; interpreted by the task kind.
    #[serde(flatten)]
    pub attrs: toml::value::Table,
}

impl TaskDecl {
    pub fn attrs_as<T: DeserializeOwned>(&self) -> Result<T> {
        toml::Value::Table(self.attrs.clone())
            .try_into()
            .map_err(|e| Error::config(format!("task '{}' ({}): {e}", self.id, self.kind)))
    }
}

#[derive(Clone)]
pub struct PlannedTask {
    pub id: TaskId,
    pub kind: String,
    pub after: Vec<TaskId>,
    pub task: Arc<dyn Reconcile>,
}

/// Collects tasks before validation. Ids are unique; dependencies are checked by [`Plan::build`].
#[derive(Default)]
pub struct Plan {
    tasks: BTreeMap<TaskId, PlannedTask>,
}

impl Plan {
    pub fn add(&mut self, task: PlannedTask) -> Result<()> {
        if task.id.trim().is_empty() {
            return Err(Error::config("task id is empty"));
        }
        if self.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    pub fn add_task(
        &mut self,
        id: &str,
        kind: &str,
        after: &[&str],
        task: Arc<dyn Reconcile>,
    ) -> Result<()> {
        self.add(PlannedTask {
            id: id.to_string(),
            kind: kind.to_string(),
            after: after.iter().map(|s| s.to_string()).collect(),
            task,
        })
    }

    pub fn from_decls(decls: &[TaskDecl], reg: &TaskRegistry) -> Result<Self> {
        let mut plan = Plan::default();
        for decl in decls {
            plan.add(PlannedTask {
                id: decl.id.clone(),
                kind: decl.kind.clone(),
                after: decl.after.clone(),
                task: reg.build(decl)?,
            })?;
        }
        Ok(plan)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Resolves dependencies into an index graph and rejects cycles.
    pub fn build(self) -> Result<TaskGraph> {
        let nodes: Vec<PlannedTask> = self.tasks.into_values().collect();
        let index: BTreeMap<TaskId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for dep in &node.after {
                let Some(&d) = index.get(dep.trim()) else {
                    return Err(Error::UnknownDependency {
                        task: node.id.clone(),
                        dep: dep.clone(),
                    });
                };
                if seen.insert(d) {
                    deps[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let graph = TaskGraph {
            nodes,
            index,
            deps,
            dependents,
        };
        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::Cycle(
                cycle.into_iter().map(|i| graph.id(i).to_string()).collect(),
            ));
        }
        Ok(graph)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Validated, acyclic task graph. Nodes are stored in id order, so index
/// order doubles as a deterministic tie-break.
pub struct TaskGraph {
    nodes: Vec<PlannedTask>,
    index: BTreeMap<TaskId, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn id(&self, idx: usize) -> &str {
        &self.nodes[idx].id
    }

    pub fn node(&self, idx: usize) -> &PlannedTask {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn deps(&self, idx: usize) -> &[usize] {
        &self.deps[idx]
    }

    pub fn dependents(&self, idx: usize) -> &[usize] {
        &self.dependents[idx]
    }

    /// Edges as `(dependency, dependent)` index pairs.
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.deps
            .iter()
            .enumerate()
            .flat_map(|(i, ds)| ds.iter().map(move |&d| (d, i)))
    }

    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut color = vec![Color::White; self.nodes.len()];
        let mut path = Vec::new();
        for start in 0..self.nodes.len() {
            if color[start] == Color::White {
                if let Some(cycle) = self.visit(start, &mut color, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit(&self, n: usize, color: &mut [Color], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        color[n] = Color::Gray;
        path.push(n);
        for &d in &self.deps[n] {
            match color[d] {
                Color::Gray => {
                    // `d` is on the current path; the cycle is the path suffix starting there.
                    let start = path.iter().position(|&p| p == d).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(d);
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.visit(d, color, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }
        path.pop();
        color[n] = Color::Black;
        None
    }

    /// Dependency order, smallest id first among ready tasks.
    pub fn ordered(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.nodes.len())
            .filter(|&i| remaining[i] == 0)
            .collect();
        let mut out = Vec::with_capacity(self.nodes.len());
        while let Some(n) = ready.pop_first() {
            out.push(n);
            for &m in &self.dependents[n] {
                remaining[m] -= 1;
                if remaining[m] == 0 {
                    ready.insert(m);
                }
            }
        }
        out
    }

    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for node in &self.nodes {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                node.id,
                node.task.describe().replace('"', "\\\""),
                node.kind
            ));
        }
        for (d, i) in self.edges() {
            out.push_str(&format!("  \"{}\" -> \"{}\";\n", self.id(d), self.id(i)));
        }
        out.push_str("}\n");
        out
    }
}


#[cfg(test)]
mod tests {
    use super::testing::graph_of;
    use super::*;

    fn ids(g: &TaskGraph, order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| g.id(i).to_string()).collect()
    }

    #[test]
    fn orders_dependencies_first() {
        let g = graph_of(&[
            ("load", &["fetch"]),
            ("fetch", &["dirs"]),
            ("dirs", &[]),
            ("config", &["dirs"]),
        ])
        .expect("graph");
        assert_eq!(ids(&g, &g.ordered()), vec!["dirs", "config", "fetch", "load"]);
    }

    #[test]
    fn rejects_unknown_dependency() {
        let err = graph_of(&[("a", &["missing"])]).err().expect("error");
        match err {
            Error::UnknownDependency { task, dep } => {
                assert_eq!(task, "a");
                assert_eq!(dep, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut plan = Plan::default();
        plan.add_task("a", "noop", &[], Arc::new(testing::Noop("a".into())))
            .expect("first");
        let err = plan
            .add_task("a", "noop", &[], Arc::new(testing::Noop("a".into())))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateTask(ref id) if id == "a"));
    }

    #[test]
    fn cycle_error_names_its_members() {
        let err = graph_of(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"]), ("d", &[])])
            .err()
            .expect("error");
        let Error::Cycle(members) = err else {
            panic!("expected cycle, got {err}");
        };
        assert_eq!(members.first(), members.last());
        for id in ["a", "b", "c"] {
            assert!(members.iter().any(|m| m == id), "{members:?}");
        }
        assert!(!members.iter().any(|m| m == "d"));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = graph_of(&[("a", &["a"])]).err().expect("error");
        assert!(matches!(err, Error::Cycle(ref m) if m == &["a", "a"]));
    }

    #[test]
    fn duplicate_edges_collapse() {
        let g = graph_of(&[("a", &[]), ("b", &["a", "a"])]).expect("graph");
        assert_eq!(g.deps(g.index_of("b").expect("b")).len(), 1);
        assert_eq!(g.edges().count(), 1);
        assert!(g.to_dot().contains("\"a\" -> \"b\";"));
    }

    #[test]
    fn decl_attrs_exclude_engine_keys() {
        let decl: TaskDecl = toml::from_str(
            r#"
id = "x"
kind = "file"
after = ["y"]
path = "/etc/x"
"#,
        )
        .expect("decl");
        assert_eq!(decl.after, vec!["y".to_string()]);
        assert_eq!(decl.attrs.len(), 1);
        assert!(decl.attrs.contains_key("path"));
    }
}
