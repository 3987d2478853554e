// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Aspects (canonical component-id sets) and the aspect inclusion DAG.
//!
//! The registry keeps one node per distinct aspect. A node's parents are
//! the most-specific registered proper subsets, its children the
//! most-specific proper supersets; queries resolve candidate archetypes by
//! walking descendants instead of scanning every aspect.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::component::ComponentId;

const ASPECT_INLINE_IDS: usize = 8;

/// Sorted, duplicate-free set of component ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Aspect {
    ids: SmallVec<[ComponentId; ASPECT_INLINE_IDS]>,
}

impl Aspect {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(id: ComponentId) -> Self {
        let mut ids = SmallVec::new();
        ids.push(id);
        Self { ids }
    }

    /// Builds an aspect from arbitrary ids, sorting and deduplicating.
    pub fn from_ids(ids: impl IntoIterator<Item = ComponentId>) -> Self {
        let mut ids: SmallVec<[ComponentId; ASPECT_INLINE_IDS]> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    pub fn component_ids(&self) -> &[ComponentId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// New aspect with `ids` added.
    pub fn add(&self, ids: &[ComponentId]) -> Aspect {
        Self::from_ids(self.ids.iter().copied().chain(ids.iter().copied()))
    }

    /// New aspect with `ids` removed.
    pub fn remove(&self, ids: &[ComponentId]) -> Aspect {
        Self {
            ids: self
                .ids
                .iter()
                .copied()
                .filter(|id| !ids.contains(id))
                .collect(),
        }
    }

    pub fn contains_id(&self, id: ComponentId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Subset check: every id of `other` is present in `self`.
    pub fn contains(&self, other: &Aspect) -> bool {
        if other.ids.len() > self.ids.len() {
            return false;
        }
        let mut own = self.ids.iter();
        'outer: for id in &other.ids {
            for candidate in own.by_ref() {
                match candidate.cmp(id) {
                    std::cmp::Ordering::Less => continue,
                    std::cmp::Ordering::Equal => continue 'outer,
                    std::cmp::Ordering::Greater => return false,
                }
            }
            return false;
        }
        true
    }

    /// True when the aspects share at least one id.
    pub fn intersects(&self, other: &Aspect) -> bool {
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        while let (Some(&x), Some(&y)) = (a.peek(), b.peek()) {
            match x.cmp(y) {
                std::cmp::Ordering::Less => {
                    a.next();
                }
                std::cmp::Ordering::Greater => {
                    b.next();
                }
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    /// Sorted ids common to both aspects.
    pub fn intersection(&self, other: &Aspect) -> SmallVec<[ComponentId; ASPECT_INLINE_IDS]> {
        let mut out = SmallVec::new();
        let (mut a, mut b) = (self.ids.iter().peekable(), other.ids.iter().peekable());
        while let (Some(&&x), Some(&&y)) = (a.peek(), b.peek()) {
            match x.cmp(&y) {
                std::cmp::Ordering::Less => {
                    a.next();
                }
                std::cmp::Ordering::Greater => {
                    b.next();
                }
                std::cmp::Ordering::Equal => {
                    out.push(x);
                    a.next();
                    b.next();
                }
            }
        }
        out
    }
}

/// Index of a node in the registry arena.
pub type AspectNodeId = usize;

/// The empty aspect's node.
pub const ROOT_ASPECT: AspectNodeId = 0;

struct AspectNode {
    aspect: Aspect,
    parents: SmallVec<[AspectNodeId; 4]>,
    children: SmallVec<[AspectNodeId; 4]>,
}

/// Canonicalizing registry over the aspect inclusion DAG.
pub struct AspectRegistry {
    nodes: Vec<AspectNode>,
    index: AHashMap<Aspect, AspectNodeId>,
}

impl AspectRegistry {
    pub fn new() -> Self {
        let root = AspectNode {
            aspect: Aspect::new(),
            parents: SmallVec::new(),
            children: SmallVec::new(),
        };
        let mut index = AHashMap::new();
        index.insert(Aspect::new(), ROOT_ASPECT);
        Self {
            nodes: vec![root],
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, aspect: &Aspect) -> Option<AspectNodeId> {
        self.index.get(aspect).copied()
    }

    pub fn has_aspect(&self, aspect: &Aspect) -> bool {
        self.index.contains_key(aspect)
    }

    pub fn aspect(&self, node: AspectNodeId) -> &Aspect {
        &self.nodes[node].aspect
    }

    pub fn parents(&self, node: AspectNodeId) -> &[AspectNodeId] {
        &self.nodes[node].parents
    }

    pub fn children(&self, node: AspectNodeId) -> &[AspectNodeId] {
        &self.nodes[node].children
    }

    /// Canonicalizes `aspect`, inserting a node and rewiring the DAG on first
    /// sight.
    pub fn add_or_get(&mut self, aspect: &Aspect) -> AspectNodeId {
        if let Some(&id) = self.index.get(aspect) {
            return id;
        }

        let new_id = self.nodes.len();
        self.nodes.push(AspectNode {
            aspect: aspect.clone(),
            parents: SmallVec::new(),
            children: SmallVec::new(),
        });
        self.index.insert(aspect.clone(), new_id);

        let parents = self.find_best_parents(new_id);
        for &parent in &parents {
            self.nodes[new_id].parents.push(parent);
            self.nodes[parent].children.push(new_id);
        }

        // A child of one of our parents may be a superset of the new aspect;
        // it belongs below the new node, and the direct link is redundant.
        for &parent in &parents {
            let snapshot: SmallVec<[AspectNodeId; 8]> =
                self.nodes[parent].children.iter().copied().collect();
            for child in snapshot {
                if child == new_id {
                    continue;
                }
                if self.nodes[child].aspect.contains(aspect) {
                    self.nodes[parent].children.retain(|&mut c| c != child);
                    self.nodes[child].parents.retain(|&mut p| p != parent);
                    self.nodes[new_id].children.push(child);
                    self.nodes[child].parents.push(new_id);
                }
            }
        }

        new_id
    }

    /// Maximal proper subsets of the node's aspect; the root when none exist.
    fn find_best_parents(&self, node: AspectNodeId) -> SmallVec<[AspectNodeId; 4]> {
        let aspect = &self.nodes[node].aspect;
        let mut candidates: SmallVec<[AspectNodeId; 8]> = SmallVec::new();
        for (id, candidate) in self.nodes.iter().enumerate() {
            if id != node && aspect.contains(&candidate.aspect) && candidate.aspect != *aspect {
                candidates.push(id);
            }
        }

        let mut best: SmallVec<[AspectNodeId; 4]> = SmallVec::new();
        for &candidate in &candidates {
            let maximal = candidates.iter().all(|&other| {
                other == candidate
                    || !self.nodes[other]
                        .aspect
                        .contains(&self.nodes[candidate].aspect)
            });
            if maximal {
                best.push(candidate);
            }
        }

        if best.is_empty() && !aspect.is_empty() {
            best.push(ROOT_ASPECT);
        }
        best
    }

    /// All nodes reachable through child links, visited once each.
    pub fn descendants(&self, node: AspectNodeId) -> Vec<AspectNodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut stack: Vec<AspectNodeId> = self.nodes[node].children.to_vec();
        while let Some(current) = stack.pop() {
            if visited[current] {
                continue;
            }
            visited[current] = true;
            out.push(current);
            stack.extend_from_slice(&self.nodes[current].children);
        }
        out
    }

    /// All nodes reachable through parent links, visited once each.
    pub fn ancestors(&self, node: AspectNodeId) -> Vec<AspectNodeId> {
        let mut visited = vec![false; self.nodes.len()];
        let mut out = Vec::new();
        let mut stack: Vec<AspectNodeId> = self.nodes[node].parents.to_vec();
        while let Some(current) = stack.pop() {
            if visited[current] {
                continue;
            }
            visited[current] = true;
            out.push(current);
            stack.extend_from_slice(&self.nodes[current].parents);
        }
        out
    }
}

impl Default for AspectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> ComponentId {
        ComponentId::from_raw(raw)
    }

    fn aspect(raw: &[u32]) -> Aspect {
        Aspect::from_ids(raw.iter().map(|&r| id(r)))
    }

    #[test]
    fn construction_sorts_and_dedups() {
        let a = Aspect::from_ids([id(3), id(1), id(3), id(2)]);
        assert_eq!(a.component_ids(), &[id(1), id(2), id(3)]);
        assert_eq!(a, aspect(&[1, 2, 3]));
    }

    #[test]
    fn subset_and_intersection() {
        let abc = aspect(&[1, 2, 3]);
        let ac = aspect(&[1, 3]);
        let d = aspect(&[4]);

        assert!(abc.contains(&ac));
        assert!(!ac.contains(&abc));
        assert!(abc.contains(&Aspect::new()));
        assert!(abc.intersects(&ac));
        assert!(!abc.intersects(&d));
        assert_eq!(abc.intersection(&ac).as_slice(), ac.component_ids());
    }

    #[test]
    fn add_remove_produce_new_aspects() {
        let a = aspect(&[1, 2]);
        assert_eq!(a.add(&[id(3), id(1)]), aspect(&[1, 2, 3]));
        assert_eq!(a.remove(&[id(1)]), aspect(&[2]));
        assert_eq!(a, aspect(&[1, 2]));
    }

    #[test]
    fn canonicalization() {
        let mut registry = AspectRegistry::new();
        let first = registry.add_or_get(&aspect(&[2, 1]));
        let second = registry.add_or_get(&aspect(&[1, 2]));
        assert_eq!(first, second);
        assert_ne!(first, registry.add_or_get(&aspect(&[1, 3])));
    }

    #[test]
    fn root_is_parent_of_first_aspects() {
        let mut registry = AspectRegistry::new();
        let a = registry.add_or_get(&aspect(&[1]));
        assert_eq!(registry.parents(a), &[ROOT_ASPECT]);
        assert_eq!(registry.children(ROOT_ASPECT), &[a]);
    }

    #[test]
    fn insert_steals_children_from_parents() {
        let mut registry = AspectRegistry::new();
        let a = registry.add_or_get(&aspect(&[1]));
        let abc = registry.add_or_get(&aspect(&[1, 2, 3]));
        assert_eq!(registry.parents(abc), &[a]);

        // {1,2} slots between {1} and {1,2,3}.
        let ab = registry.add_or_get(&aspect(&[1, 2]));
        assert_eq!(registry.parents(ab), &[a]);
        assert_eq!(registry.parents(abc), &[ab]);
        assert_eq!(registry.children(a), &[ab]);
    }

    #[test]
    fn dag_shares_supersets_between_disjoint_parents() {
        let mut registry = AspectRegistry::new();
        let a = registry.add_or_get(&aspect(&[1]));
        let b = registry.add_or_get(&aspect(&[2]));
        let ab = registry.add_or_get(&aspect(&[1, 2]));

        let mut parents = registry.parents(ab).to_vec();
        parents.sort_unstable();
        assert_eq!(parents, vec![a, b]);

        assert_eq!(registry.descendants(a), vec![ab]);
        assert_eq!(registry.descendants(b), vec![ab]);

        let mut ancestors = registry.ancestors(ab);
        ancestors.sort_unstable();
        assert_eq!(ancestors, vec![ROOT_ASPECT, a, b]);
    }

    #[test]
    fn descendants_visit_diamonds_once() {
        let mut registry = AspectRegistry::new();
        registry.add_or_get(&aspect(&[1]));
        registry.add_or_get(&aspect(&[2]));
        let abc = registry.add_or_get(&aspect(&[1, 2, 3]));
        registry.add_or_get(&aspect(&[1, 2]));

        let from_root = registry.descendants(ROOT_ASPECT);
        assert_eq!(
            from_root.iter().filter(|&&n| n == abc).count(),
            1,
            "diamond node must be reported once"
        );
        assert_eq!(from_root.len(), registry.len() - 1);
    }

    #[test]
    fn strict_parent_child_ordering() {
        let mut registry = AspectRegistry::new();
        for ids in [&[1u32][..], &[2], &[1, 2], &[1, 2, 3], &[2, 3]] {
            registry.add_or_get(&aspect(ids));
        }
        for node in 0..registry.len() {
            for &child in registry.children(node) {
                let parent_aspect = registry.aspect(node);
                let child_aspect = registry.aspect(child);
                assert!(child_aspect.contains(parent_aspect));
                assert_ne!(child_aspect, parent_aspect);
                // No registered aspect sits strictly between the two.
                for middle in 0..registry.len() {
                    if middle == node || middle == child {
                        continue;
                    }
                    let middle_aspect = registry.aspect(middle);
                    assert!(
                        !(middle_aspect.contains(parent_aspect)
                            && child_aspect.contains(middle_aspect)
                            && middle_aspect != parent_aspect
                            && middle_aspect != child_aspect),
                        "aspect {middle} sits between {node} and {child}"
                    );
                }
            }
        }
    }
}
