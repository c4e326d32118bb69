//! Hierarchical Top-N reduction.
//!
//! Bounds a map of category sizes to at most N groups plus an "Other" group
//! while preserving total mass. Small categories are merged into an existing
//! ancestor, into a new common ancestor shared with a similar small group, or
//! into "Other" when nothing suitable exists.
//!
//! Groups live in an arena and are referenced by id. A name that is merged
//! away and later re-created gets a fresh id, so coverage can never count an
//! input key twice.

use std::collections::{BTreeSet, HashMap};

use multimap::MultiMap;
use tracing::debug;

use crate::config::TopNConfig;
use crate::models::domain::{depth, parent_name};

/// Deepest prefix level considered when looking for a related group.
const MAX_LEVELS: usize = 4;

pub const OTHER: &str = "";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopNGroup {
    /// Representative name; empty for the "Other" group.
    pub name: String,
    pub size: u64,
    /// Input keys this group stands for.
    pub covered: BTreeSet<String>,
}

impl TopNGroup {
    pub fn is_other(&self) -> bool {
        self.name.is_empty()
    }
}

struct Node {
    name: String,
    size: u64,
    /// Present in the input, as opposed to a synthesized ancestor.
    original: bool,
}

struct Reducer {
    nodes: Vec<Node>,
    active: HashMap<String, usize>,
    by_size: BTreeSet<(u64, usize)>,
    by_prefix: HashMap<String, BTreeSet<(u64, usize)>>,
    merged: MultiMap<usize, usize>,
    other: usize,
    max_size: f64,
}

/// Reduce `sizes` to at most `config.max_elements` groups plus "Other".
pub fn reduce(sizes: &HashMap<String, u64>, config: TopNConfig) -> Vec<TopNGroup> {
    let mut keys: Vec<(&String, u64)> = sizes.iter().map(|(k, v)| (k, *v)).collect();
    // ids follow name order so ties between equal sizes are deterministic
    keys.sort();

    let total: u64 = keys.iter().map(|(_, v)| v).sum();
    if total == 0 || config.max_elements >= keys.len() {
        let mut groups: Vec<TopNGroup> = keys
            .into_iter()
            .map(|(name, size)| TopNGroup {
                name: name.clone(),
                size,
                covered: BTreeSet::from([name.clone()]),
            })
            .collect();
        sort_groups(&mut groups);
        return groups;
    }

    let mut reducer = Reducer::new(total as f64 * config.max_size_fraction);
    for (name, size) in keys {
        let id = reducer.add_node(name.clone(), size, true);
        reducer.insert(id);
    }
    while reducer.active.len() > config.max_elements {
        reducer.step();
    }
    reducer.into_groups()
}

fn sort_groups(groups: &mut [TopNGroup]) {
    groups.sort_by(|a, b| {
        a.is_other()
            .cmp(&b.is_other())
            .then_with(|| depth(&b.name).cmp(&depth(&a.name)))
            .then_with(|| b.size.cmp(&a.size))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Raw prefixes of `name` from one segment up to [`MAX_LEVELS`], shallowest
/// first. Empty segments are kept, so `a::b` yields `a`, `a:`, `a::b`.
fn raw_prefixes(name: &str) -> Vec<&str> {
    let mut out = Vec::with_capacity(MAX_LEVELS);
    for (i, b) in name.bytes().enumerate() {
        if b == b':' {
            out.push(&name[..i]);
            if out.len() == MAX_LEVELS {
                return out;
            }
        }
    }
    out.push(name);
    out
}

impl Reducer {
    fn new(max_size: f64) -> Self {
        let mut reducer = Self {
            nodes: Vec::new(),
            active: HashMap::new(),
            by_size: BTreeSet::new(),
            by_prefix: HashMap::new(),
            merged: MultiMap::new(),
            other: 0,
            max_size,
        };
        reducer.other = reducer.add_node(OTHER.to_string(), 0, false);
        reducer
    }

    fn add_node(&mut self, name: String, size: u64, original: bool) -> usize {
        self.nodes.push(Node {
            name,
            size,
            original,
        });
        self.nodes.len() - 1
    }

    fn insert(&mut self, id: usize) {
        let node = &self.nodes[id];
        let entry = (node.size, id);
        self.by_size.insert(entry);
        self.active.insert(node.name.clone(), id);
        for prefix in raw_prefixes(&node.name) {
            self.by_prefix
                .entry(prefix.to_string())
                .or_default()
                .insert(entry);
        }
    }

    fn remove(&mut self, id: usize) {
        let node = &self.nodes[id];
        let entry = (node.size, id);
        self.by_size.remove(&entry);
        self.active.remove(&node.name);
        for prefix in raw_prefixes(&node.name) {
            if let Some(bucket) = self.by_prefix.get_mut(prefix) {
                bucket.remove(&entry);
                if bucket.is_empty() {
                    self.by_prefix.remove(prefix);
                }
            }
        }
    }

    /// Fold `child` into `parent`. Neither may be indexed while this runs.
    fn absorb(&mut self, parent: usize, child: usize) {
        self.nodes[parent].size += self.nodes[child].size;
        self.merged.insert(parent, child);
    }

    /// Deepest active ancestor of `name`, immediate parent first.
    fn active_ancestor(&self, name: &str) -> Option<usize> {
        let parent = parent_name(name);
        if let Some(&id) = self.active.get(parent) {
            return Some(id);
        }
        raw_prefixes(name)
            .into_iter()
            .rev()
            .map(|p| p.trim_end_matches(':'))
            .filter(|p| !p.is_empty() && *p != name)
            .find_map(|p| self.active.get(p).copied())
    }

    /// Smallest small-enough group sharing the most leading segments with
    /// `name`, and the name of the ancestor they share.
    fn related_group<'a>(&self, name: &'a str) -> Option<(usize, &'a str)> {
        for prefix in raw_prefixes(name).into_iter().rev() {
            let Some(&(size, id)) = self.by_prefix.get(prefix).and_then(|b| b.first()) else {
                continue;
            };
            if size as f64 <= self.max_size {
                return Some((id, prefix.trim_end_matches(':')));
            }
        }
        None
    }

    /// Merge the smallest active group somewhere; shrinks the active set.
    fn step(&mut self) {
        let Some(&(_, victim)) = self.by_size.first() else {
            return;
        };
        self.remove(victim);
        let name = self.nodes[victim].name.clone();

        if let Some(ancestor) = self.active_ancestor(&name) {
            debug!(victim = %name, group = %self.nodes[ancestor].name, "merged into ancestor");
            self.remove(ancestor);
            self.absorb(ancestor, victim);
            self.insert(ancestor);
            return;
        }

        let Some((candidate, common)) = self.related_group(&name) else {
            debug!(victim = %name, "merged into other");
            self.absorb(self.other, victim);
            return;
        };
        if common.is_empty() {
            debug!(victim = %name, "merged into other");
            self.absorb(self.other, victim);
            return;
        }
        let common = common.to_string();
        self.remove(candidate);

        if common == name {
            debug!(victim = %name, absorbed = %self.nodes[candidate].name, "absorbed descendant");
            self.absorb(victim, candidate);
            self.insert(victim);
        } else if let Some(&existing) = self.active.get(&common) {
            self.remove(existing);
            self.absorb(existing, victim);
            if candidate != existing {
                self.absorb(existing, candidate);
            }
            self.insert(existing);
        } else {
            debug!(
                victim = %name,
                candidate = %self.nodes[candidate].name,
                group = %common,
                "created common ancestor"
            );
            let id = self.add_node(common, 0, false);
            self.absorb(id, victim);
            self.absorb(id, candidate);
            self.insert(id);
        }
    }

    fn coverage(&self, root: usize) -> BTreeSet<String> {
        let mut covered = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.original {
                covered.insert(node.name.clone());
            }
            if let Some(children) = self.merged.get_vec(&id) {
                stack.extend(children.iter().copied());
            }
        }
        covered
    }

    fn into_groups(self) -> Vec<TopNGroup> {
        let mut groups: Vec<TopNGroup> = self
            .by_size
            .iter()
            .map(|&(size, id)| TopNGroup {
                name: self.nodes[id].name.clone(),
                size,
                covered: self.coverage(id),
            })
            .collect();
        let other = self.coverage(self.other);
        if !other.is_empty() {
            groups.push(TopNGroup {
                name: OTHER.to_string(),
                size: self.nodes[self.other].size,
                covered: other,
            });
        }
        sort_groups(&mut groups);
        groups
    }
}
