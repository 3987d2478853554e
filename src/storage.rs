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

//! ArchetypeManager: entity ↔ archetype bookkeeping and structural changes.
//!
//! Owns the aspect registry and the version manager. Every structural
//! change that creates an archetype or crosses an empty/non-empty boundary
//! dirties the affected aspect so query caches rebuild.

use ahash::AHashMap;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::archetype::{Archetype, EntityLocation};
use crate::aspect::{Aspect, AspectNodeId, AspectRegistry};
use crate::component::{self, ComponentId, DestructionContext, MoveAndDestroyFn};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::memory::{FrameScratch, HeapAllocator};
use crate::version::VersionManager;

pub type ArchetypeId = usize;

pub struct ArchetypeManager {
    archetypes: Vec<Archetype>,
    aspect_to_archetype: AHashMap<Aspect, ArchetypeId>,
    entity_to_archetype: FxHashMap<Entity, ArchetypeId>,
    aspect_registry: AspectRegistry,
    versions: VersionManager,
    allocator: HeapAllocator,
}

struct ColumnMove {
    from_column: usize,
    to_column: usize,
    move_and_destroy: MoveAndDestroyFn,
}

impl ArchetypeManager {
    pub fn new(allocator: HeapAllocator) -> Self {
        Self {
            archetypes: Vec::new(),
            aspect_to_archetype: AHashMap::new(),
            entity_to_archetype: FxHashMap::default(),
            aspect_registry: AspectRegistry::new(),
            versions: VersionManager::new(),
            allocator,
        }
    }

    pub fn aspect_registry(&self) -> &AspectRegistry {
        &self.aspect_registry
    }

    /// Ensures `aspect` has a node in the DAG. Queries register their
    /// include aspect before any matching archetype exists.
    pub fn register_aspect(&mut self, aspect: &Aspect) -> AspectNodeId {
        self.aspect_registry.add_or_get(aspect)
    }

    pub fn archetype(&self, id: ArchetypeId) -> &Archetype {
        &self.archetypes[id]
    }

    pub fn archetype_mut(&mut self, id: ArchetypeId) -> &mut Archetype {
        &mut self.archetypes[id]
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entity_to_archetype.len()
    }

    pub fn is_entity_tracked(&self, entity: Entity) -> bool {
        self.entity_to_archetype.contains_key(&entity)
    }

    pub fn entity_archetype(&self, entity: Entity) -> Result<ArchetypeId> {
        self.entity_to_archetype
            .get(&entity)
            .copied()
            .ok_or(EcsError::EntityNotFound)
    }

    pub fn entity_aspect(&self, entity: Entity) -> Result<&Aspect> {
        Ok(self.archetypes[self.entity_archetype(entity)?].aspect())
    }

    pub fn find_archetype(&self, aspect: &Aspect) -> Option<ArchetypeId> {
        self.aspect_to_archetype.get(aspect).copied()
    }

    /// Current structural version of `aspect`; 0 when it was never seen.
    pub fn aspect_version(&self, aspect: &Aspect) -> u64 {
        match self.aspect_registry.get(aspect) {
            Some(node) => self.versions.version(node),
            None => 0,
        }
    }

    pub fn get_or_create_archetype(&mut self, aspect: &Aspect) -> Result<ArchetypeId> {
        if let Some(&id) = self.aspect_to_archetype.get(aspect) {
            return Ok(id);
        }

        let node = self.aspect_registry.add_or_get(aspect);
        let canonical = self.aspect_registry.aspect(node).clone();
        let archetype = Archetype::new(canonical, node, self.allocator.clone())?;
        let id = self.archetypes.len();
        self.archetypes.push(archetype);
        self.aspect_to_archetype.insert(aspect.clone(), id);

        // A new archetype is a structural change in its own right.
        self.versions.make_dirty(&self.aspect_registry, node);
        tracing::debug!(archetype = id, components = aspect.len(), "created archetype");
        Ok(id)
    }

    pub fn add_entity(&mut self, aspect: &Aspect, entity: Entity) -> Result<()> {
        let id = self.get_or_create_archetype(aspect)?;
        let Self {
            archetypes,
            entity_to_archetype,
            aspect_registry,
            versions,
            ..
        } = self;
        let archetype = &mut archetypes[id];
        let was_empty = archetype.is_empty();
        archetype.add_entity(entity)?;
        if was_empty {
            versions.make_dirty(aspect_registry, archetype.aspect_node());
        }
        entity_to_archetype.insert(entity, id);
        Ok(())
    }

    pub fn add_entities(&mut self, aspect: &Aspect, entities: &[Entity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let id = self.get_or_create_archetype(aspect)?;
        let Self {
            archetypes,
            entity_to_archetype,
            aspect_registry,
            versions,
            ..
        } = self;
        let archetype = &mut archetypes[id];
        let was_empty = archetype.is_empty();

        FrameScratch::with(|scratch| -> Result<()> {
            let _marker = scratch.marker();
            let locations =
                scratch.alloc_slice_fill(entities.len(), EntityLocation::default())?;
            archetype.add_entities(entities, locations)
        })?;

        if was_empty {
            versions.make_dirty(aspect_registry, archetype.aspect_node());
        }
        for &entity in entities {
            entity_to_archetype.insert(entity, id);
        }
        Ok(())
    }

    pub fn add_components(
        &mut self,
        entity: Entity,
        ids: &[ComponentId],
        ctx: &DestructionContext,
    ) -> Result<()> {
        let from = self.entity_archetype(entity)?;
        let target = self.archetypes[from].aspect().add(ids);
        self.move_entity(entity, &target, ctx)
    }

    pub fn remove_components(
        &mut self,
        entity: Entity,
        ids: &[ComponentId],
        ctx: &DestructionContext,
    ) -> Result<()> {
        let from = self.entity_archetype(entity)?;
        let current = self.archetypes[from].aspect();
        for id in ids {
            if !current.contains_id(*id) {
                return Err(EcsError::ComponentNotFound);
            }
        }
        let target = current.remove(ids);
        self.move_entity(entity, &target, ctx)
    }

    pub fn add_components_bulk(
        &mut self,
        entities: &[Entity],
        ids: &[ComponentId],
        ctx: &DestructionContext,
    ) -> Result<()> {
        self.modify_components_bulk(entities, ids, false, ctx)
    }

    pub fn remove_components_bulk(
        &mut self,
        entities: &[Entity],
        ids: &[ComponentId],
        ctx: &DestructionContext,
    ) -> Result<()> {
        self.modify_components_bulk(entities, ids, true, ctx)
    }

    fn modify_components_bulk(
        &mut self,
        entities: &[Entity],
        ids: &[ComponentId],
        remove: bool,
        ctx: &DestructionContext,
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let groups = self.group_by_archetype(entities)?;
        for (from, group_entities) in groups {
            let target = {
                let current = self.archetypes[from].aspect();
                if remove {
                    current.remove(ids)
                } else {
                    current.add(ids)
                }
            };
            let to = self.get_or_create_archetype(&target)?;
            self.move_entities_between(from, to, &group_entities, ctx)?;
        }
        Ok(())
    }

    pub fn move_entity(
        &mut self,
        entity: Entity,
        to_aspect: &Aspect,
        ctx: &DestructionContext,
    ) -> Result<()> {
        let from = self.entity_archetype(entity)?;
        let to = self.get_or_create_archetype(to_aspect)?;
        self.move_entities_between(from, to, &[entity], ctx)
    }

    pub fn move_entities(
        &mut self,
        to_aspect: &Aspect,
        entities: &[Entity],
        ctx: &DestructionContext,
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let to = self.get_or_create_archetype(to_aspect)?;
        let groups = self.group_by_archetype(entities)?;
        for (from, group_entities) in groups {
            self.move_entities_between(from, to, &group_entities, ctx)?;
        }
        Ok(())
    }

    pub fn remove_entity(&mut self, entity: Entity, ctx: &DestructionContext) -> Result<()> {
        let id = self.entity_archetype(entity)?;
        let Self {
            archetypes,
            entity_to_archetype,
            aspect_registry,
            versions,
            ..
        } = self;
        let archetype = &mut archetypes[id];
        let was_empty = archetype.is_empty();
        archetype.remove_entity(entity, ctx)?;
        if !was_empty && archetype.is_empty() {
            versions.make_dirty(aspect_registry, archetype.aspect_node());
        }
        entity_to_archetype.remove(&entity);
        Ok(())
    }

    pub fn remove_entities(&mut self, entities: &[Entity], ctx: &DestructionContext) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }
        let groups = self.group_by_archetype(entities)?;
        let Self {
            archetypes,
            entity_to_archetype,
            aspect_registry,
            versions,
            ..
        } = self;
        for (id, group_entities) in groups {
            let archetype = &mut archetypes[id];
            let was_empty = archetype.is_empty();
            archetype.remove_entities(&group_entities, ctx, None)?;
            if !was_empty && archetype.is_empty() {
                versions.make_dirty(aspect_registry, archetype.aspect_node());
            }
        }
        for entity in entities {
            entity_to_archetype.remove(entity);
        }
        Ok(())
    }

    /// Entities grouped by their current archetype. Untracked entities are an
    /// error: structural changes on stale handles are caller bugs.
    fn group_by_archetype(
        &self,
        entities: &[Entity],
    ) -> Result<SmallVec<[(ArchetypeId, Vec<Entity>); 4]>> {
        let mut groups: SmallVec<[(ArchetypeId, Vec<Entity>); 4]> = SmallVec::new();
        for &entity in entities {
            let id = self.entity_archetype(entity)?;
            match groups.iter_mut().find(|(group_id, _)| *group_id == id) {
                Some((_, list)) => list.push(entity),
                None => groups.push((id, vec![entity])),
            }
        }
        Ok(groups)
    }

    /// Relocates `entities` from one archetype to another.
    ///
    /// Components common to both aspects are moved with their metadata
    /// thunks and skipped on the source's destruction pass; components only
    /// in the destination are left for the caller to construct.
    fn move_entities_between(
        &mut self,
        from_id: ArchetypeId,
        to_id: ArchetypeId,
        entities: &[Entity],
        ctx: &DestructionContext,
    ) -> Result<()> {
        if from_id == to_id || entities.is_empty() {
            return Ok(());
        }

        let Self {
            archetypes,
            entity_to_archetype,
            aspect_registry,
            versions,
            ..
        } = self;
        let (from, to) = index_pair(archetypes, from_id, to_id);

        let from_was_empty = from.is_empty();
        let to_was_empty = to.is_empty();

        let mut common: SmallVec<[ColumnMove; 8]> = SmallVec::new();
        for &id in from.aspect().intersection(to.aspect()).iter() {
            let meta = component::metadata(id)?;
            common.push(ColumnMove {
                from_column: from.component_index(id).ok_or(EcsError::AspectViolation)?,
                to_column: to.component_index(id).ok_or(EcsError::AspectViolation)?,
                move_and_destroy: meta.move_and_destroy,
            });
        }

        FrameScratch::with(|scratch| -> Result<()> {
            let _marker = scratch.marker();
            let locations =
                scratch.alloc_slice_fill(entities.len(), EntityLocation::default())?;
            to.add_entities(entities, locations)?;

            for (index, &entity) in entities.iter().enumerate() {
                let from_location = from.entity_location(entity)?;
                let to_location = locations[index];
                for column in &common {
                    let src = from
                        .chunk(from_location.chunk_index)
                        .raw_component_ptr(column.from_column, from_location.slot);
                    let dst = to
                        .chunk_mut(to_location.chunk_index)
                        .component_ptr_mut(column.to_column, to_location.slot);
                    unsafe { (column.move_and_destroy)(dst, src) };
                }
            }
            Ok(())
        })?;

        // Moved columns were consumed above; the source must not destroy them.
        let skip = to.aspect().clone();
        from.remove_entities(entities, ctx, Some(&skip))?;

        for &entity in entities {
            entity_to_archetype.insert(entity, to_id);
        }

        if !from_was_empty && from.is_empty() {
            versions.make_dirty(aspect_registry, from.aspect_node());
        }
        if to_was_empty && !to.is_empty() {
            versions.make_dirty(aspect_registry, to.aspect_node());
        }
        Ok(())
    }

    /// Archetypes whose aspect contains `include`, does not intersect
    /// `exclude`, and currently holds entities. Candidates come from the
    /// aspect DAG's descendants rather than a full scan.
    pub fn query_non_empty_archetypes(&self, include: &Aspect, exclude: &Aspect) -> Vec<ArchetypeId> {
        let mut result = Vec::new();
        let Some(node) = self.aspect_registry.get(include) else {
            return result;
        };

        let mut candidates = self.aspect_registry.descendants(node);
        candidates.push(node);

        for candidate in candidates {
            let aspect = self.aspect_registry.aspect(candidate);
            if aspect.intersects(exclude) {
                continue;
            }
            if let Some(&id) = self.aspect_to_archetype.get(aspect) {
                if !self.archetypes[id].is_empty() {
                    result.push(id);
                }
            }
        }
        result
    }

    /// Entities currently carrying component `id`, across all archetypes.
    pub fn component_occupancy(&self, id: ComponentId) -> usize {
        self.archetypes
            .iter()
            .filter(|archetype| archetype.aspect().contains_id(id))
            .map(|archetype| archetype.entity_count())
            .sum()
    }

    pub fn reset_all_modification_tracking(&mut self) {
        for archetype in &mut self.archetypes {
            archetype.reset_modification_tracking();
        }
    }

    /// Destroys every remaining component. Teardown path.
    pub fn destroy_all(&mut self, ctx: &DestructionContext) {
        for archetype in &mut self.archetypes {
            archetype.destroy_all_components(ctx);
        }
        self.entity_to_archetype.clear();
    }
}

fn index_pair(
    archetypes: &mut [Archetype],
    a: ArchetypeId,
    b: ArchetypeId,
) -> (&mut Archetype, &mut Archetype) {
    debug_assert_ne!(a, b);
    if a < b {
        let (left, right) = archetypes.split_at_mut(b);
        (&mut left[a], &mut right[0])
    } else {
        let (left, right) = archetypes.split_at_mut(a);
        (&mut right[0], &mut left[b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::register_component;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Vel {
        x: f32,
    }

    fn entity(index: u32) -> Entity {
        Entity::new(index, 1)
    }

    fn manager() -> (ArchetypeManager, ComponentId, ComponentId) {
        let pos = register_component::<Pos>().unwrap();
        let vel = register_component::<Vel>().unwrap();
        (
            ArchetypeManager::new(crate::memory::global_allocator()),
            pos,
            vel,
        )
    }

    #[test]
    fn entity_and_archetype_maps_agree() {
        let (mut manager, pos, _) = manager();
        let aspect = Aspect::single(pos);
        manager.add_entity(&aspect, entity(1)).unwrap();
        manager.add_entity(&aspect, entity(2)).unwrap();

        let id = manager.entity_archetype(entity(1)).unwrap();
        assert_eq!(manager.entity_archetype(entity(2)).unwrap(), id);
        let archetype = manager.archetype(id);
        assert!(archetype.contains_entity(entity(1)));
        assert!(archetype.contains_entity(entity(2)));
        assert_eq!(archetype.entity_count(), 2);
    }

    #[test]
    fn add_component_moves_to_wider_archetype() {
        let (mut manager, pos, vel) = manager();
        manager.add_entity(&Aspect::single(pos), entity(1)).unwrap();
        let before = manager.entity_archetype(entity(1)).unwrap();

        manager
            .add_components(entity(1), &[vel], &DestructionContext::DETACHED)
            .unwrap();

        let after = manager.entity_archetype(entity(1)).unwrap();
        assert_ne!(before, after);
        assert_eq!(
            manager.entity_aspect(entity(1)).unwrap(),
            &Aspect::from_ids([pos, vel])
        );
        assert!(manager.archetype(before).is_empty());
    }

    #[test]
    fn removing_a_missing_component_fails() {
        let (mut manager, pos, vel) = manager();
        manager.add_entity(&Aspect::single(pos), entity(1)).unwrap();
        assert_eq!(
            manager
                .remove_components(entity(1), &[vel], &DestructionContext::DETACHED)
                .unwrap_err(),
            EcsError::ComponentNotFound
        );
    }

    #[test]
    fn moving_to_the_same_archetype_is_a_noop() {
        let (mut manager, pos, _) = manager();
        let aspect = Aspect::single(pos);
        manager.add_entity(&aspect, entity(1)).unwrap();
        let version_before = manager.aspect_version(&aspect);
        manager
            .move_entity(entity(1), &aspect, &DestructionContext::DETACHED)
            .unwrap();
        assert_eq!(manager.aspect_version(&aspect), version_before);
    }

    #[test]
    fn versions_bump_on_structural_transitions() {
        let (mut manager, pos, _) = manager();
        let aspect = Aspect::single(pos);

        assert_eq!(manager.aspect_version(&aspect), 0);
        manager.add_entity(&aspect, entity(1)).unwrap();
        let after_create = manager.aspect_version(&aspect);
        assert!(after_create > 0);

        // A second entity into a non-empty archetype is not a version event.
        manager.add_entity(&aspect, entity(2)).unwrap();
        assert_eq!(manager.aspect_version(&aspect), after_create);

        manager
            .remove_entity(entity(1), &DestructionContext::DETACHED)
            .unwrap();
        assert_eq!(manager.aspect_version(&aspect), after_create);

        // Last entity out: empty transition bumps.
        manager
            .remove_entity(entity(2), &DestructionContext::DETACHED)
            .unwrap();
        assert!(manager.aspect_version(&aspect) > after_create);
    }

    #[test]
    fn query_uses_dag_descendants_and_exclusions() {
        let (mut manager, pos, vel) = manager();
        let pos_only = Aspect::single(pos);
        let pos_vel = Aspect::from_ids([pos, vel]);

        manager.add_entity(&pos_only, entity(1)).unwrap();
        manager.add_entity(&pos_vel, entity(2)).unwrap();

        let matched = manager.query_non_empty_archetypes(&pos_only, &Aspect::new());
        assert_eq!(matched.len(), 2);

        let without_vel = manager.query_non_empty_archetypes(&pos_only, &Aspect::single(vel));
        assert_eq!(without_vel.len(), 1);
        assert!(manager
            .archetype(without_vel[0])
            .contains_entity(entity(1)));

        // Emptied archetypes drop out of the result.
        manager
            .remove_entity(entity(2), &DestructionContext::DETACHED)
            .unwrap();
        let matched = manager.query_non_empty_archetypes(&pos_only, &Aspect::new());
        assert_eq!(matched.len(), 1);
    }

    #[test]
    fn bulk_moves_group_by_source_archetype() {
        let (mut manager, pos, vel) = manager();
        manager
            .add_entities(&Aspect::single(pos), &[entity(1), entity(2)])
            .unwrap();
        manager
            .add_entities(&Aspect::single(vel), &[entity(3)])
            .unwrap();

        let target = Aspect::from_ids([pos, vel]);
        manager
            .move_entities(
                &target,
                &[entity(1), entity(2), entity(3)],
                &DestructionContext::DETACHED,
            )
            .unwrap();

        for index in 1..=3 {
            assert_eq!(manager.entity_aspect(entity(index)).unwrap(), &target);
        }
    }

    #[test]
    fn stale_handles_are_rejected() {
        let (mut manager, pos, _) = manager();
        assert_eq!(
            manager
                .add_components(entity(9), &[pos], &DestructionContext::DETACHED)
                .unwrap_err(),
            EcsError::EntityNotFound
        );
    }
}
