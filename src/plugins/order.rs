//! Dependency ordering for setups: Tarjan's strongly connected components,
//! flattened so every setup comes after what it depends on.

use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ordering {
    /// Every node exactly once, dependencies first.
    pub order: Vec<String>,
    /// Components with more than one member, or a member depending on itself.
    pub cycles: Vec<Vec<String>>,
    /// `(node, dependency)` pairs naming a dependency that does not exist.
    pub missing: Vec<(String, String)>,
}

/// Order `graph` (node → dependencies).
///
/// Missing dependencies are reported and treated as satisfied. Members of a
/// cycle all appear, sorted by name among themselves.
pub fn order(graph: &BTreeMap<String, Vec<String>>) -> Ordering {
    let mut missing = Vec::new();
    let edges: BTreeMap<&str, Vec<&str>> = graph
        .iter()
        .map(|(node, deps)| {
            let known = deps
                .iter()
                .filter(|dep| {
                    let exists = graph.contains_key(dep.as_str());
                    if !exists {
                        missing.push((node.clone(), (*dep).clone()));
                    }
                    exists
                })
                .map(String::as_str)
                .collect();
            (node.as_str(), known)
        })
        .collect();

    let mut tarjan = Tarjan {
        edges: &edges,
        index: 0,
        indices: BTreeMap::new(),
        lowlinks: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        components: Vec::new(),
    };
    for &node in edges.keys() {
        if !tarjan.indices.contains_key(node) {
            tarjan.connect(node);
        }
    }

    let mut ordering = Ordering {
        missing,
        ..Ordering::default()
    };
    for mut component in tarjan.components {
        component.sort_unstable();
        let self_loop = component.len() == 1
            && edges
                .get(component[0])
                .is_some_and(|deps| deps.contains(&component[0]));
        if component.len() > 1 || self_loop {
            ordering
                .cycles
                .push(component.iter().map(|s| (*s).to_string()).collect());
        }
        ordering
            .order
            .extend(component.into_iter().map(str::to_string));
    }
    ordering
}

struct Tarjan<'g> {
    edges: &'g BTreeMap<&'g str, Vec<&'g str>>,
    index: usize,
    indices: BTreeMap<&'g str, usize>,
    lowlinks: BTreeMap<&'g str, usize>,
    stack: Vec<&'g str>,
    on_stack: BTreeSet<&'g str>,
    components: Vec<Vec<&'g str>>,
}

impl<'g> Tarjan<'g> {
    fn connect(&mut self, node: &'g str) {
        self.indices.insert(node, self.index);
        self.lowlinks.insert(node, self.index);
        self.index += 1;
        self.stack.push(node);
        self.on_stack.insert(node);

        let edges = self.edges;
        for &dep in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(&dep_index) = self.indices.get(dep) {
                if self.on_stack.contains(dep) {
                    self.lower(node, dep_index);
                }
            } else {
                self.connect(dep);
                let dep_low = self.lowlinks[dep];
                self.lower(node, dep_low);
            }
        }

        if self.lowlinks[node] == self.indices[node] {
            let mut component = Vec::new();
            while let Some(member) = self.stack.pop() {
                self.on_stack.remove(member);
                component.push(member);
                if member == node {
                    break;
                }
            }
            self.components.push(component);
        }
    }

    fn lower(&mut self, node: &'g str, candidate: usize) {
        if let Some(low) = self.lowlinks.get_mut(node) {
            *low = (*low).min(candidate);
        }
    }
}
