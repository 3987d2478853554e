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

//! EntityManager: the front-door API over archetype storage, shared pools,
//! singletons and queries.
//!
//! Entity ids come from an index/generation allocator; destroying an index
//! bumps its generation so stale handles are rejected. All structural
//! changes flow through the archetype manager with a destruction context
//! wired to the shared-component pools.

use smallvec::SmallVec;

use crate::aspect::Aspect;
use crate::component::{
    self, Component, ComponentId, DestructionContext, SharedComponent, SharedComponentData,
    SingletonComponent,
};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::memory::{global_allocator, HeapAllocator};
use crate::query::{self, QueryDescriptor, QueryFetch, QueryRegistry};
use crate::shared::SharedComponentManager;
use crate::singleton::{SingletonComponentRegistry, SingletonGuard};
use crate::storage::{ArchetypeId, ArchetypeManager};

pub struct EntityManager {
    archetypes: ArchetypeManager,
    shared: SharedComponentManager,
    singletons: SingletonComponentRegistry,
    queries: QueryRegistry,
    // generations[0] is a reserved slot so index 0 is never allocated.
    generations: Vec<u32>,
    free_indices: Vec<u32>,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::with_allocator(global_allocator())
    }

    pub fn with_allocator(allocator: HeapAllocator) -> Self {
        Self {
            archetypes: ArchetypeManager::new(allocator),
            shared: SharedComponentManager::new(),
            singletons: SingletonComponentRegistry::new(),
            queries: QueryRegistry::new(),
            generations: vec![0],
            free_indices: Vec::new(),
        }
    }

    // ---------------------------------------------------------------- entities

    fn allocate_entity(&mut self) -> Entity {
        if let Some(index) = self.free_indices.pop() {
            return Entity::new(index, self.generations[index as usize]);
        }
        let index = self.generations.len() as u32;
        self.generations.push(1);
        Entity::new(index, 1)
    }

    fn validate(&self, entity: Entity) -> Result<()> {
        if entity.is_undefined() || entity.is_proxy() {
            return Err(EcsError::InvalidHandle);
        }
        match self.generations.get(entity.index() as usize) {
            Some(&generation) if generation == entity.generation() => Ok(()),
            _ => Err(EcsError::InvalidHandle),
        }
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.validate(entity).is_ok()
    }

    /// Creates an entity with no components.
    pub fn create_entity(&mut self) -> Result<Entity> {
        let entity = self.allocate_entity();
        self.archetypes.add_entity(&Aspect::new(), entity)?;
        Ok(entity)
    }

    pub fn create_entities(&mut self, count: usize) -> Result<Vec<Entity>> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("create_entities", count).entered();

        let mut entities = Vec::with_capacity(count);
        for _ in 0..count {
            entities.push(self.allocate_entity());
        }
        self.archetypes.add_entities(&Aspect::new(), &entities)?;
        Ok(entities)
    }

    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        self.validate(entity)?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.remove_entity(entity, &ctx)?;
        self.retire_index(entity);
        Ok(())
    }

    pub fn destroy_entities(&mut self, entities: &[Entity]) -> Result<()> {
        for &entity in entities {
            self.validate(entity)?;
        }
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.remove_entities(entities, &ctx)?;
        for &entity in entities {
            self.retire_index(entity);
        }
        Ok(())
    }

    fn retire_index(&mut self, entity: Entity) {
        let index = entity.index() as usize;
        let next = self.generations[index] + 1;
        // An index whose next generation would collide with the proxy
        // marker is never reused.
        if next != Entity::PROXY_GENERATION {
            self.generations[index] = next;
            self.free_indices.push(entity.index());
        }
    }

    pub fn entity_aspect(&self, entity: Entity) -> Result<&Aspect> {
        self.validate(entity)?;
        self.archetypes.entity_aspect(entity)
    }

    /// Moves `entities` into the archetype of `to_aspect`, relocating the
    /// components both aspects share.
    ///
    /// # Safety
    /// Columns present in `to_aspect` but absent from an entity's current
    /// aspect come up uninitialized; the caller must write them before any
    /// read observes the moved entities.
    pub unsafe fn move_entities(&mut self, to_aspect: &Aspect, entities: &[Entity]) -> Result<()> {
        for &entity in entities {
            self.validate(entity)?;
        }
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.move_entities(to_aspect, entities, &ctx)
    }

    // -------------------------------------------------------------- components

    /// Adds `value` as component `T`, moving the entity to the wider
    /// archetype. Replaces (and destroys) any existing `T`.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<()> {
        self.validate(entity)?;
        let id = component::register_component::<T>()?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };

        let had = archetypes.entity_aspect(entity)?.contains_id(id);
        if !had {
            archetypes.add_components(entity, &[id], &ctx)?;
        }

        let ptr = raw_component_ptr(archetypes, entity, id)?;
        unsafe {
            if had {
                if let Some(drop_fn) = component::metadata(id)?.drop_fn {
                    drop_fn(ptr, &ctx);
                }
            }
            (ptr as *mut T).write(value);
        }
        Ok(())
    }

    /// Adds default-constructed `T` to every entity in one structural pass.
    pub fn add_components<T: Component + Default>(&mut self, entities: &[Entity]) -> Result<()> {
        for &entity in entities {
            self.validate(entity)?;
        }
        let id = component::register_component::<T>()?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.add_components_bulk(entities, &[id], &ctx)?;
        for &entity in entities {
            let ptr = raw_component_ptr(archetypes, entity, id)?;
            unsafe { (ptr as *mut T).write(T::default()) };
        }
        Ok(())
    }

    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        self.validate(entity)?;
        let id = component::component_id::<T>()?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.remove_components(entity, &[id], &ctx)
    }

    pub fn remove_components<T: Component>(&mut self, entities: &[Entity]) -> Result<()> {
        for &entity in entities {
            self.validate(entity)?;
        }
        let id = component::component_id::<T>()?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.remove_components_bulk(entities, &[id], &ctx)
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> bool {
        let Ok(id) = component::component_id::<T>() else {
            return false;
        };
        self.validate(entity).is_ok()
            && self
                .archetypes
                .entity_aspect(entity)
                .map(|aspect| aspect.contains_id(id))
                .unwrap_or(false)
    }

    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<&T> {
        self.validate(entity)?;
        let id = component::component_id::<T>()?;
        let archetype = self.archetypes.archetype(self.archetypes.entity_archetype(entity)?);
        let column = archetype.component_index(id).ok_or(EcsError::ComponentNotFound)?;
        let location = archetype.entity_location(entity)?;
        let ptr = archetype
            .chunk(location.chunk_index)
            .component_ptr(column, location.slot);
        Ok(unsafe { &*(ptr as *const T) })
    }

    /// Mutable component access; marks the slot modified.
    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T> {
        self.validate(entity)?;
        let id = component::component_id::<T>()?;
        let ptr = typed_component_ptr_mut(&mut self.archetypes, entity, id)?;
        Ok(unsafe { &mut *(ptr as *mut T) })
    }

    pub fn enable_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        self.set_component_enabled::<T>(entity, true)
    }

    pub fn disable_component<T: Component>(&mut self, entity: Entity) -> Result<()> {
        self.set_component_enabled::<T>(entity, false)
    }

    fn set_component_enabled<T: Component>(&mut self, entity: Entity, enabled: bool) -> Result<()> {
        self.validate(entity)?;
        let id = component::component_id::<T>()?;
        let archetype_id = self.archetypes.entity_archetype(entity)?;
        let archetype = self.archetypes.archetype_mut(archetype_id);
        let column = archetype.component_index(id).ok_or(EcsError::ComponentNotFound)?;
        let location = archetype.entity_location(entity)?;
        let chunk = archetype.chunk_mut(location.chunk_index);
        if enabled {
            chunk.enable_component(column, location.slot);
        } else {
            chunk.disable_component(column, location.slot);
        }
        Ok(())
    }

    pub fn is_component_enabled<T: Component>(&self, entity: Entity) -> Result<bool> {
        self.validate(entity)?;
        let id = component::component_id::<T>()?;
        let archetype = self.archetypes.archetype(self.archetypes.entity_archetype(entity)?);
        let column = archetype.component_index(id).ok_or(EcsError::ComponentNotFound)?;
        let location = archetype.entity_location(entity)?;
        Ok(archetype
            .chunk(location.chunk_index)
            .is_component_enabled(column, location.slot))
    }

    /// Entities currently carrying `T`, across all archetypes.
    pub fn component_occupancy<T: Component>(&self) -> usize {
        match component::component_id::<T>() {
            Ok(id) => self.archetypes.component_occupancy(id),
            Err(_) => 0,
        }
    }

    // ------------------------------------------------------- shared components

    /// Sets the shared value for `entity`, interning `value`. A data-only
    /// update when the entity already has a `SharedComponent<T>`, a
    /// structural add otherwise.
    pub fn set_shared<T: SharedComponentData>(&mut self, entity: Entity, value: T) -> Result<()> {
        self.validate(entity)?;
        let handle_id = component::register_shared_component::<T>()?;

        if self.archetypes.entity_aspect(entity)?.contains_id(handle_id) {
            let new_handle = self.shared.get_handle(&value)?;
            let component = unsafe {
                &mut *(typed_component_ptr_mut(&mut self.archetypes, entity, handle_id)?
                    as *mut SharedComponent<T>)
            };
            let old_handle = component.handle;
            if old_handle != new_handle {
                self.shared.increment_ref(new_handle);
                self.shared.decrement_ref(old_handle);
                component.handle = new_handle;
            }
            return Ok(());
        }

        let new_handle = self.shared.get_handle(&value)?;
        self.shared.increment_ref(new_handle);
        self.add_component(entity, SharedComponent::<T>::new(new_handle))
    }

    pub fn get_shared<T: SharedComponentData>(&self, entity: Entity) -> Result<T> {
        self.with_shared(entity, |value: &T| value.clone())
    }

    pub fn with_shared<T: SharedComponentData, R>(
        &self,
        entity: Entity,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        let handle = self.get_component::<SharedComponent<T>>(entity)?.handle;
        self.shared.with(handle, f)
    }

    /// Copy-on-write mutable access to the entity's shared value. The stored
    /// handle follows the mutated slot.
    pub fn update_shared<T: SharedComponentData, R>(
        &mut self,
        entity: Entity,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        self.validate(entity)?;
        let handle_id = component::register_shared_component::<T>()?;
        let Self {
            archetypes, shared, ..
        } = self;
        let component = unsafe {
            &mut *(typed_component_ptr_mut(archetypes, entity, handle_id)?
                as *mut SharedComponent<T>)
        };
        shared.get_mutable(&mut component.handle, f)
    }

    /// Live-handle count of the entity's shared value. Diagnostics surface.
    pub fn shared_ref_count<T: SharedComponentData>(&self, entity: Entity) -> Result<u32> {
        let handle = self.get_component::<SharedComponent<T>>(entity)?.handle;
        Ok(self.shared.ref_count(handle))
    }

    pub fn shared_manager(&self) -> &SharedComponentManager {
        &self.shared
    }

    // ---------------------------------------------------------------- singletons

    /// Locked singleton access, default-constructing on first use.
    pub fn get_singleton<T: SingletonComponent>(&self) -> SingletonGuard<T> {
        self.singletons.get::<T>()
    }

    /// Runs `f` under the singleton's own lock.
    pub fn access_singleton<T: SingletonComponent, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.singletons.access(f)
    }

    pub fn register_singleton<T: SingletonComponent>(&self, instance: T) {
        self.singletons.register(instance);
    }

    // ------------------------------------------------------------------ queries

    /// Iterates every entity matching `descriptor` with view `V`.
    pub fn for_each<'w, V, F>(&'w mut self, descriptor: &QueryDescriptor, f: F) -> Result<()>
    where
        V: QueryFetch<'w>,
        F: FnMut(Entity, V::Item),
    {
        self.for_each_filtered::<V, F>(descriptor, false, false, f)
    }

    /// Iteration that skips slots whose filter columns are disabled.
    pub fn for_each_enabled<'w, V, F>(&'w mut self, descriptor: &QueryDescriptor, f: F) -> Result<()>
    where
        V: QueryFetch<'w>,
        F: FnMut(Entity, V::Item),
    {
        self.for_each_filtered::<V, F>(descriptor, true, false, f)
    }

    /// Iteration over slots modified since the last tracking reset.
    pub fn for_each_modified<'w, V, F>(&'w mut self, descriptor: &QueryDescriptor, f: F) -> Result<()>
    where
        V: QueryFetch<'w>,
        F: FnMut(Entity, V::Item),
    {
        self.for_each_filtered::<V, F>(descriptor, false, true, f)
    }

    pub fn for_each_enabled_modified<'w, V, F>(
        &'w mut self,
        descriptor: &QueryDescriptor,
        f: F,
    ) -> Result<()>
    where
        V: QueryFetch<'w>,
        F: FnMut(Entity, V::Item),
    {
        self.for_each_filtered::<V, F>(descriptor, true, true, f)
    }

    fn for_each_filtered<'w, V, F>(
        &'w mut self,
        descriptor: &QueryDescriptor,
        filter_enabled: bool,
        filter_modified: bool,
        f: F,
    ) -> Result<()>
    where
        V: QueryFetch<'w>,
        F: FnMut(Entity, V::Item),
    {
        let Self {
            archetypes, queries, ..
        } = self;
        let query = queries.get_or_build(archetypes, descriptor)?;
        let matched: SmallVec<[ArchetypeId; 8]> =
            query.matched_archetypes().iter().copied().collect();
        query::for_each_matched::<V, F>(
            archetypes,
            &matched,
            descriptor,
            filter_enabled,
            filter_modified,
            f,
        )
    }

    /// Fresh builder for assembling a query descriptor.
    pub fn query_builder(&self) -> crate::query::QueryBuilder {
        crate::query::QueryBuilder::new()
    }

    /// Entities matched by the descriptor, before per-slot filters.
    pub fn query_entity_count(&mut self, descriptor: &QueryDescriptor) -> Result<usize> {
        let Self {
            archetypes, queries, ..
        } = self;
        let query = queries.get_or_build(archetypes, descriptor)?;
        Ok(query::count_matched(archetypes, query.matched_archetypes()))
    }

    // -------------------------------------------------------------------- misc

    pub fn archetype_manager(&self) -> &ArchetypeManager {
        &self.archetypes
    }

    pub fn reset_all_modification_tracking(&mut self) {
        self.archetypes.reset_all_modification_tracking();
    }

    /// Command-buffer path: adds the component by id and blits the payload
    /// into the chunk with the metadata relocation thunk.
    pub(crate) fn add_component_erased(
        &mut self,
        entity: Entity,
        id: ComponentId,
        payload: *mut u8,
    ) -> Result<()> {
        self.validate(entity)?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        let meta = component::metadata(id)?;

        let had = archetypes.entity_aspect(entity)?.contains_id(id);
        if !had {
            archetypes.add_components(entity, &[id], &ctx)?;
        }
        let ptr = raw_component_ptr(archetypes, entity, id)?;
        unsafe {
            if had {
                if let Some(drop_fn) = meta.drop_fn {
                    drop_fn(ptr, &ctx);
                }
            }
            (meta.move_and_destroy)(ptr, payload);
        }
        Ok(())
    }

    pub(crate) fn remove_component_erased(&mut self, entity: Entity, id: ComponentId) -> Result<()> {
        self.validate(entity)?;
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.remove_components(entity, &[id], &ctx)
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EntityManager {
    fn drop(&mut self) {
        let Self {
            archetypes, shared, ..
        } = self;
        let ctx = DestructionContext {
            shared: Some(shared),
        };
        archetypes.destroy_all(&ctx);
    }
}

/// Marks the slot modified and returns the raw column pointer.
fn typed_component_ptr_mut(
    archetypes: &mut ArchetypeManager,
    entity: Entity,
    id: ComponentId,
) -> Result<*mut u8> {
    let archetype_id = archetypes.entity_archetype(entity)?;
    let archetype = archetypes.archetype_mut(archetype_id);
    let column = archetype.component_index(id).ok_or(EcsError::ComponentNotFound)?;
    let location = archetype.entity_location(entity)?;
    Ok(archetype
        .chunk_mut(location.chunk_index)
        .component_ptr_mut(column, location.slot))
}

/// Column pointer without modification marking (initialization paths).
fn raw_component_ptr(
    archetypes: &mut ArchetypeManager,
    entity: Entity,
    id: ComponentId,
) -> Result<*mut u8> {
    let archetype_id = archetypes.entity_archetype(entity)?;
    let archetype = archetypes.archetype(archetype_id);
    let column = archetype.component_index(id).ok_or(EcsError::AspectViolation)?;
    let location = archetype.entity_location(entity)?;
    Ok(archetype
        .chunk(location.chunk_index)
        .raw_component_ptr(column, location.slot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Default, Clone, Copy, PartialEq)]
    struct Tag;

    #[test]
    fn created_entities_are_alive_and_distinct() {
        let mut manager = EntityManager::new();
        let a = manager.create_entity().unwrap();
        let b = manager.create_entity().unwrap();
        assert_ne!(a, b);
        assert_ne!(a.id(), 0);
        assert!(manager.is_alive(a));
        assert!(manager.is_alive(b));
    }

    #[test]
    fn destroyed_indices_come_back_with_higher_generations() {
        let mut manager = EntityManager::new();
        let first = manager.create_entity().unwrap();
        manager.destroy_entity(first).unwrap();
        assert!(!manager.is_alive(first));

        let second = manager.create_entity().unwrap();
        assert_eq!(second.index(), first.index());
        assert!(second.generation() > first.generation());

        // The stale handle stays dead.
        assert_eq!(
            manager.get_component::<Pos>(first).unwrap_err(),
            EcsError::InvalidHandle
        );
    }

    #[test]
    fn add_get_remove_component() {
        let mut manager = EntityManager::new();
        let entity = manager.create_entity().unwrap();

        manager
            .add_component(entity, Pos { x: 1.0, y: 2.0 })
            .unwrap();
        assert!(manager.has_component::<Pos>(entity));
        assert_eq!(
            *manager.get_component::<Pos>(entity).unwrap(),
            Pos { x: 1.0, y: 2.0 }
        );

        manager.remove_component::<Pos>(entity).unwrap();
        assert!(!manager.has_component::<Pos>(entity));
        assert_eq!(
            manager.get_component::<Pos>(entity).unwrap_err(),
            EcsError::ComponentNotFound
        );
    }

    #[test]
    fn replacing_a_component_overwrites_in_place() {
        let mut manager = EntityManager::new();
        let entity = manager.create_entity().unwrap();
        manager
            .add_component(entity, Pos { x: 1.0, y: 1.0 })
            .unwrap();
        let aspect_before = manager.entity_aspect(entity).unwrap().clone();

        manager
            .add_component(entity, Pos { x: 9.0, y: 9.0 })
            .unwrap();
        assert_eq!(manager.entity_aspect(entity).unwrap(), &aspect_before);
        assert_eq!(manager.get_component::<Pos>(entity).unwrap().x, 9.0);
    }

    #[test]
    fn droppy_components_are_destroyed_with_the_entity() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Resource;
        impl Drop for Resource {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut manager = EntityManager::new();
        let entity = manager.create_entity().unwrap();
        manager.add_component(entity, Resource).unwrap();
        manager.destroy_entity(entity).unwrap();
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn bulk_default_components() {
        let mut manager = EntityManager::new();
        let entities = manager.create_entities(5).unwrap();
        manager.add_components::<Tag>(&entities).unwrap();
        for &entity in &entities {
            assert!(manager.has_component::<Tag>(entity));
        }
        assert_eq!(manager.component_occupancy::<Tag>(), 5);

        manager.remove_components::<Tag>(&entities).unwrap();
        assert_eq!(manager.component_occupancy::<Tag>(), 0);
    }

    #[test]
    fn operations_on_destroyed_entities_fail() {
        let mut manager = EntityManager::new();
        let entity = manager.create_entity().unwrap();
        manager.add_component(entity, Pos { x: 0.0, y: 0.0 }).unwrap();
        manager.destroy_entity(entity).unwrap();

        assert_eq!(
            manager.destroy_entity(entity).unwrap_err(),
            EcsError::InvalidHandle
        );
        assert_eq!(
            manager.remove_component::<Pos>(entity).unwrap_err(),
            EcsError::InvalidHandle
        );
        assert_eq!(
            manager
                .add_component(entity, Pos { x: 1.0, y: 1.0 })
                .unwrap_err(),
            EcsError::InvalidHandle
        );
    }

    #[test]
    fn component_enable_state_round_trips() {
        let mut manager = EntityManager::new();
        let entity = manager.create_entity().unwrap();
        manager.add_component(entity, Pos { x: 0.0, y: 0.0 }).unwrap();

        assert!(manager.is_component_enabled::<Pos>(entity).unwrap());
        manager.disable_component::<Pos>(entity).unwrap();
        assert!(!manager.is_component_enabled::<Pos>(entity).unwrap());
        manager.enable_component::<Pos>(entity).unwrap();
        assert!(manager.is_component_enabled::<Pos>(entity).unwrap());
    }

    #[test]
    fn singleton_access_through_the_manager() {
        #[derive(Default)]
        struct FrameState {
            frame: u64,
        }

        let manager = EntityManager::new();
        manager.access_singleton(|state: &mut FrameState| state.frame = 7);
        assert_eq!(manager.get_singleton::<FrameState>().frame, 7);
    }
}
