use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::{Error, ErrorKind, Result};

/// Module dependency graph. An edge `a -> b` means `a` depends on `b`.
#[derive(Debug, Default, Clone)]
pub struct Graph {
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, id: &str) {
        self.deps.entry(id.to_string()).or_default();
    }

    pub fn contains(&self, id: &str) -> bool {
        self.deps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.contains(from) {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefDep,
                format!("module '{from}' is not defined"),
            ));
        }
        if !self.contains(to) {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefDep,
                format!("module '{from}' depends on undefined module '{to}'"),
            ));
        }
        if from == to {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefDep,
                format!("module '{from}' depends on itself"),
            ));
        }
        if self.reaches(to, from) {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefDep,
                format!("dependency '{from}' -> '{to}' would create a cycle"),
            ));
        }
        if let Some(set) = self.deps.get_mut(from) {
            set.insert(to.to_string());
        }
        Ok(())
    }

    pub fn dependencies(&self, id: &str) -> impl Iterator<Item = &str> {
        self.deps
            .get(id)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    fn reaches(&self, from: &str, to: &str) -> bool {
        self.descendants(from).contains(to)
    }

    /// `root` plus everything it transitively depends on.
    fn descendants<'a>(&'a self, root: &'a str) -> BTreeSet<&'a str> {
        let mut seen = BTreeSet::new();
        let mut q = VecDeque::from([root]);
        while let Some(n) = q.pop_front() {
            if !seen.insert(n) {
                continue;
            }
            q.extend(self.dependencies(n));
        }
        seen
    }

    /// Build order for `target`: dependencies first, ties broken lexicographically.
    pub fn build_order(&self, target: &str, recursive: bool) -> Result<Vec<String>> {
        if !self.contains(target) {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefTarget,
                format!("target '{target}' is not defined in the configuration"),
            ));
        }
        if !recursive {
            return Ok(vec![target.to_string()]);
        }

        let nodes = self.descendants(target);
        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for &n in &nodes {
            pending.insert(n, self.dependencies(n).count());
            for d in self.dependencies(n) {
                dependents.entry(d).or_default().insert(n);
            }
        }

        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter_map(|(k, v)| (*v == 0).then_some(*k))
            .collect();
        let mut out = Vec::with_capacity(nodes.len());

        while let Some(n) = ready.pop_first() {
            out.push(n.to_string());
            for &m in dependents.get(n).into_iter().flatten() {
                if let Some(slot) = pending.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        ready.insert(m);
                    }
                }
            }
        }

        // Edges are checked on insertion, so this only trips on a corrupted graph.
        if out.len() != nodes.len() {
            return Err(Error::new(
                ErrorKind::DependencyTreeUndefDep,
                format!("dependency cycle below '{target}'"),
            ));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pizza() -> Graph {
        let edges: &[(&str, &[&str])] = &[
            ("pizza", &["dough", "cheese"]),
            ("dough", &["flour", "water"]),
            ("cheese", &["milk"]),
            ("milk", &["water"]),
            ("flour", &[]),
            ("water", &[]),
        ];
        let mut g = Graph::new();
        for (id, _) in edges {
            g.add_vertex(id);
        }
        for (id, deps) in edges {
            for d in *deps {
                g.add_edge(id, d).expect("edge");
            }
        }
        g
    }

    #[test]
    fn recursive_order_respects_dependencies() {
        let g = pizza();
        let order = g.build_order("pizza", true).expect("order");
        assert_eq!(order.len(), 6);
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        for (a, b) in [
            ("pizza", "dough"),
            ("pizza", "cheese"),
            ("dough", "flour"),
            ("dough", "water"),
            ("cheese", "milk"),
            ("milk", "water"),
        ] {
            assert!(pos(a) > pos(b), "{a} must come after {b}: {order:?}");
        }
        assert_eq!(order, ["flour", "water", "dough", "milk", "cheese", "pizza"]);
    }

    #[test]
    fn order_is_limited_to_descendants() {
        let g = pizza();
        assert_eq!(g.build_order("cheese", true).unwrap(), ["water", "milk", "cheese"]);
        assert_eq!(g.build_order("cheese", false).unwrap(), ["cheese"]);
    }

    #[test]
    fn unknown_target_and_dependency() {
        let mut g = pizza();
        assert!(
            g.build_order("salad", true)
                .unwrap_err()
                .is(ErrorKind::DependencyTreeUndefTarget)
        );
        assert!(
            g.add_edge("pizza", "pineapple")
                .unwrap_err()
                .is(ErrorKind::DependencyTreeUndefDep)
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let mut g = pizza();
        assert!(g.add_edge("water", "pizza").unwrap_err().is(ErrorKind::DependencyTreeUndefDep));
        assert!(g.add_edge("milk", "milk").unwrap_err().is(ErrorKind::DependencyTreeUndefDep));
        // Rejected edges leave the graph usable.
        assert_eq!(g.build_order("pizza", true).unwrap().len(), 6);
    }
}
