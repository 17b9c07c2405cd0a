//! Component dependency graph recorded during bootstrap.
//!
//! An edge `a -> b` means component `a` asked for component `b` while it
//! was initialising.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::Path;

use log::info;

use crate::error::Result;

#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    /// Nodes in first-seen order.
    nodes: Vec<String>,
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.nodes.iter().any(|n| n == name) {
            self.nodes.push(name.to_string());
        }
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);
        self.edges.entry(from.to_string()).or_default().insert(to.to_string());
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.edges
            .get(name)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every elementary cycle found by a depth-first walk, each rotated to
    /// start at its smallest node. Rotations of one cycle are reported once.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut found: BTreeSet<Vec<String>> = BTreeSet::new();
        for start in &self.nodes {
            let mut path = vec![start.clone()];
            let mut on_path: BTreeSet<String> = [start.clone()].into_iter().collect();
            self.walk(start, &mut path, &mut on_path, &mut found);
        }
        found.into_iter().collect()
    }

    fn walk(
        &self,
        node: &str,
        path: &mut Vec<String>,
        on_path: &mut BTreeSet<String>,
        found: &mut BTreeSet<Vec<String>>,
    ) {
        for next in self.edges.get(node).into_iter().flatten() {
            if next == &path[0] {
                found.insert(canonical_rotation(path));
            } else if !on_path.contains(next) {
                path.push(next.clone());
                on_path.insert(next.clone());
                self.walk(next, path, on_path, found);
                on_path.remove(next);
                path.pop();
            }
        }
    }

    /// Kahn sort with dependencies first. Ties keep first-seen order.
    /// Nodes caught in a cycle are returned separately.
    pub fn start_order(&self) -> (Vec<String>, Vec<String>) {
        let mut pending: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.as_str(), self.edges.get(n).map_or(0, BTreeSet::len)))
            .collect();
        let mut dependants: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, deps) in &self.edges {
            for dep in deps {
                dependants.entry(dep.as_str()).or_default().push(from.as_str());
            }
        }

        let mut order: Vec<String> = Vec::with_capacity(self.nodes.len());
        let mut emitted: BTreeSet<&str> = BTreeSet::new();
        loop {
            let Some(ready) = self
                .nodes
                .iter()
                .map(String::as_str)
                .find(|n| !emitted.contains(n) && pending.get(n) == Some(&0))
            else {
                break;
            };
            emitted.insert(ready);
            order.push(ready.to_string());
            for dependant in dependants.get(ready).into_iter().flatten() {
                if let Some(count) = pending.get_mut(dependant) {
                    *count = count.saturating_sub(1);
                }
            }
        }
        let stuck = self
            .nodes
            .iter()
            .filter(|n| !emitted.contains(n.as_str()))
            .cloned()
            .collect();
        (order, stuck)
    }

    /// Graphviz source; edges inside a cycle are drawn red.
    pub fn to_dot(&self) -> String {
        let cyclic: BTreeSet<(String, String)> = self
            .cycles()
            .iter()
            .flat_map(|cycle| {
                (0..cycle.len()).map(move |i| (cycle[i].clone(), cycle[(i + 1) % cycle.len()].clone()))
            })
            .collect();

        let mut out = String::from("digraph components {\n    rankdir=LR;\n");
        for node in &self.nodes {
            let _ = writeln!(out, "    \"{node}\";");
        }
        for (from, deps) in &self.edges {
            for to in deps {
                if cyclic.contains(&(from.clone(), to.clone())) {
                    let _ = writeln!(out, "    \"{from}\" -> \"{to}\" [color=red];");
                } else {
                    let _ = writeln!(out, "    \"{from}\" -> \"{to}\";");
                }
            }
        }
        out.push_str("}\n");
        out
    }

    pub fn write_dot(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_dot())?;
        info!("dependency graph with {} components written to {}", self.nodes.len(), path.display());
        Ok(())
    }
}

fn canonical_rotation(cycle: &[String]) -> Vec<String> {
    let min = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map_or(0, |(i, _)| i);
    cycle[min..].iter().chain(cycle[..min].iter()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut g = DependencyGraph::new();
        for (from, to) in edges {
            g.add_edge(from, to);
        }
        g
    }

    #[test]
    fn test_start_order_puts_dependencies_first() {
        let g = graph(&[
            ("watcher", "objectstore"),
            ("objectstore", "config"),
            ("indexer", "objectstore"),
            ("indexer", "fts"),
            ("fts", "config"),
        ]);
        let (order, stuck) = g.start_order();
        assert!(stuck.is_empty());
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("config") < pos("objectstore"));
        assert!(pos("objectstore") < pos("watcher"));
        assert!(pos("fts") < pos("indexer"));
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_rotated_cycles_reported_once() {
        let g = graph(&[("b", "c"), ("c", "a"), ("a", "b"), ("a", "d")]);
        assert_eq!(g.cycles(), vec![vec!["a".to_string(), "b".into(), "c".into()]]);
        let (order, stuck) = g.start_order();
        assert_eq!(order, vec!["d"]);
        assert_eq!(stuck, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_dot_marks_cycle_edges() {
        let g = graph(&[("a", "b"), ("b", "a"), ("a", "c")]);
        let dot = g.to_dot();
        assert!(dot.starts_with("digraph components {"));
        assert!(dot.contains("\"a\" -> \"b\" [color=red];"));
        assert!(dot.contains("\"a\" -> \"c\";"));
        assert!(!dot.contains("\"a\" -> \"c\" [color=red]"));
    }

    #[test]
    fn test_write_dot_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debug").join("deps.dot");
        graph(&[("x", "y")]).write_dot(&path).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("\"x\" -> \"y\";"));
    }
}
