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

//! Per-aspect structural-change versions.
//!
//! Queries cache the version of their include aspect; a divergence means
//! an archetype matching the aspect (or any more specific one) was created
//! or crossed an empty/non-empty boundary since the cache was built.

use rustc_hash::FxHashMap;

use crate::aspect::{AspectNodeId, AspectRegistry};

pub struct VersionManager {
    versions: FxHashMap<AspectNodeId, u64>,
    next_version: u64,
}

impl VersionManager {
    pub fn new() -> Self {
        Self {
            versions: FxHashMap::default(),
            next_version: 1,
        }
    }

    /// Bumps the aspect's version and every ancestor's, so queries over less
    /// specific aspects observe changes in more specific ones.
    pub fn make_dirty(&mut self, registry: &AspectRegistry, node: AspectNodeId) {
        let version = self.next_version;
        self.next_version += 1;

        self.versions.insert(node, version);
        for ancestor in registry.ancestors(node) {
            self.versions.insert(ancestor, version);
        }
    }

    /// Current version for the node; 0 before the first structural change.
    pub fn version(&self, node: AspectNodeId) -> u64 {
        self.versions.get(&node).copied().unwrap_or(0)
    }
}

impl Default for VersionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aspect::{Aspect, ROOT_ASPECT};
    use crate::component::ComponentId;

    fn aspect(raw: &[u32]) -> Aspect {
        Aspect::from_ids(raw.iter().map(|&r| ComponentId::from_raw(r)))
    }

    #[test]
    fn versions_start_at_zero_and_never_decrease() {
        let mut registry = AspectRegistry::new();
        let node = registry.add_or_get(&aspect(&[1]));
        let mut versions = VersionManager::new();

        assert_eq!(versions.version(node), 0);
        versions.make_dirty(&registry, node);
        let first = versions.version(node);
        versions.make_dirty(&registry, node);
        let second = versions.version(node);
        assert!(first > 0);
        assert!(second > first);
    }

    #[test]
    fn dirtying_a_descendant_bumps_ancestors() {
        let mut registry = AspectRegistry::new();
        let a = registry.add_or_get(&aspect(&[1]));
        let ab = registry.add_or_get(&aspect(&[1, 2]));
        let mut versions = VersionManager::new();

        versions.make_dirty(&registry, ab);
        assert_eq!(versions.version(ab), versions.version(a));
        assert_eq!(versions.version(ab), versions.version(ROOT_ASPECT));

        // Dirtying the parent does not touch the child.
        let child_before = versions.version(ab);
        versions.make_dirty(&registry, a);
        assert_eq!(versions.version(ab), child_before);
        assert!(versions.version(a) > child_before);
    }
}
