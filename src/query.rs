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

//! Queries: precompiled archetype selectors with per-slot filters.
//!
//! A query caches the archetypes matching its include/exclude aspects
//! together with the include aspect's version; iteration consults the
//! version manager first and rebuilds the cache when a structural change
//! touched the aspect. Typed views fetch component references per slot;
//! mutable fetches mark the modification bit, shared fetches do not.

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::aspect::Aspect;
use crate::chunk::Chunk;
use crate::component::{self, Component, ComponentId};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::storage::{ArchetypeId, ArchetypeManager};

/// What a query selects and how it may touch the data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct QueryDescriptor {
    pub include: Aspect,
    pub exclude: Aspect,
    pub must_be_enabled: Aspect,
    pub must_be_modified: Aspect,
    pub reads: Aspect,
    pub writes: Aspect,
}

/// Fluent descriptor assembly. Component types register on first mention.
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    descriptor: QueryDescriptor,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn id_of<T: Component>() -> ComponentId {
        component::register_component::<T>().expect("component id space exhausted")
    }

    /// Matched archetypes must contain `T`.
    pub fn with<T: Component>(mut self) -> Self {
        self.descriptor.include = self.descriptor.include.add(&[Self::id_of::<T>()]);
        self
    }

    /// Matched archetypes must not contain `T`.
    pub fn without<T: Component>(mut self) -> Self {
        self.descriptor.exclude = self.descriptor.exclude.add(&[Self::id_of::<T>()]);
        self
    }

    /// Enabled-filtered iteration requires `T`'s bit set per slot.
    pub fn require_enabled<T: Component>(mut self) -> Self {
        self.descriptor.must_be_enabled = self.descriptor.must_be_enabled.add(&[Self::id_of::<T>()]);
        self
    }

    /// Modified-filtered iteration requires `T`'s bit set per slot.
    pub fn require_modified<T: Component>(mut self) -> Self {
        self.descriptor.must_be_modified =
            self.descriptor.must_be_modified.add(&[Self::id_of::<T>()]);
        self
    }

    /// Declares that users of this query read `T`.
    pub fn reads<T: Component>(mut self) -> Self {
        self.descriptor.reads = self.descriptor.reads.add(&[Self::id_of::<T>()]);
        self
    }

    /// Declares that users of this query write `T`.
    pub fn writes<T: Component>(mut self) -> Self {
        self.descriptor.writes = self.descriptor.writes.add(&[Self::id_of::<T>()]);
        self
    }

    pub fn build(self) -> QueryDescriptor {
        self.descriptor
    }
}

/// Cached archetype list for one descriptor.
pub struct Query {
    descriptor: QueryDescriptor,
    matched: Vec<ArchetypeId>,
    include_version: u64,
}

impl Query {
    fn build(manager: &mut ArchetypeManager, descriptor: &QueryDescriptor) -> Result<Query> {
        if descriptor.include.intersects(&descriptor.exclude) {
            return Err(EcsError::AspectViolation);
        }
        // The include aspect enters the DAG so version tracking covers it
        // even before any archetype with exactly this aspect exists.
        manager.register_aspect(&descriptor.include);
        let mut query = Query {
            descriptor: descriptor.clone(),
            matched: Vec::new(),
            include_version: u64::MAX,
        };
        query.refresh(manager);
        Ok(query)
    }

    /// Rebuilds the archetype list iff the include aspect's version moved.
    fn refresh(&mut self, manager: &ArchetypeManager) {
        let current = manager.aspect_version(&self.descriptor.include);
        if current != self.include_version {
            self.matched =
                manager.query_non_empty_archetypes(&self.descriptor.include, &self.descriptor.exclude);
            self.include_version = current;
        }
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn matched_archetypes(&self) -> &[ArchetypeId] {
        &self.matched
    }
}

/// Descriptor-keyed query cache.
pub struct QueryRegistry {
    queries: AHashMap<QueryDescriptor, Query>,
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            queries: AHashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Cached query for `descriptor`, built on first sight and refreshed
    /// against the current aspect version.
    pub fn get_or_build(
        &mut self,
        manager: &mut ArchetypeManager,
        descriptor: &QueryDescriptor,
    ) -> Result<&Query> {
        if !self.queries.contains_key(descriptor) {
            let query = Query::build(manager, descriptor)?;
            self.queries.insert(descriptor.clone(), query);
        }
        let query = self.queries.get_mut(descriptor).expect("query just inserted");
        query.refresh(manager);
        Ok(query)
    }
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed component access for query iteration.
///
/// Implemented for `&T`, `&mut T` and tuples of those, parameterized by the
/// world borrow `'w`. Mutable fetches mark the slot's modification bit;
/// shared fetches leave it untouched.
pub trait QueryFetch<'w> {
    type Item;

    /// Number of component columns this view binds.
    const ID_COUNT: usize;

    /// Appends the component ids in fetch order, registering types on first
    /// use.
    fn component_ids(out: &mut SmallVec<[ComponentId; 8]>) -> Result<()>;

    /// # Safety
    /// `chunk` must be valid for `'w`, `columns` must hold `ID_COUNT`
    /// indices resolved for the chunk's archetype, and `slot` must be below
    /// the chunk's count. Each (column, slot) pair may be fetched mutably at
    /// most once per iteration.
    unsafe fn fetch(chunk: *mut Chunk, columns: &[usize], slot: usize) -> Self::Item;
}

impl<'w, T: Component> QueryFetch<'w> for &'w T {
    type Item = &'w T;
    const ID_COUNT: usize = 1;

    fn component_ids(out: &mut SmallVec<[ComponentId; 8]>) -> Result<()> {
        out.push(component::register_component::<T>()?);
        Ok(())
    }

    unsafe fn fetch(chunk: *mut Chunk, columns: &[usize], slot: usize) -> &'w T {
        &*((*chunk).component_ptr(columns[0], slot) as *const T)
    }
}

impl<'w, T: Component> QueryFetch<'w> for &'w mut T {
    type Item = &'w mut T;
    const ID_COUNT: usize = 1;

    fn component_ids(out: &mut SmallVec<[ComponentId; 8]>) -> Result<()> {
        out.push(component::register_component::<T>()?);
        Ok(())
    }

    unsafe fn fetch(chunk: *mut Chunk, columns: &[usize], slot: usize) -> &'w mut T {
        &mut *((*chunk).component_ptr_mut(columns[0], slot) as *mut T)
    }
}

macro_rules! impl_query_fetch_tuple {
    ($($view:ident),+) => {
        impl<'w, $($view: QueryFetch<'w>),+> QueryFetch<'w> for ($($view,)+) {
            type Item = ($($view::Item,)+);
            const ID_COUNT: usize = 0 $(+ $view::ID_COUNT)+;

            fn component_ids(out: &mut SmallVec<[ComponentId; 8]>) -> Result<()> {
                $($view::component_ids(out)?;)+
                Ok(())
            }

            #[allow(unused_assignments)]
            unsafe fn fetch(chunk: *mut Chunk, columns: &[usize], slot: usize) -> Self::Item {
                let mut offset = 0;
                ($({
                    let picked = &columns[offset..offset + $view::ID_COUNT];
                    offset += $view::ID_COUNT;
                    $view::fetch(chunk, picked, slot)
                },)+)
            }
        }
    };
}

impl_query_fetch_tuple!(A);
impl_query_fetch_tuple!(A, B);
impl_query_fetch_tuple!(A, B, C);
impl_query_fetch_tuple!(A, B, C, D);

fn filter_columns(
    archetype: &crate::archetype::Archetype,
    aspect: &Aspect,
    fallback: &[usize],
) -> SmallVec<[usize; 8]> {
    if aspect.is_empty() {
        return fallback.iter().copied().collect();
    }
    aspect
        .component_ids()
        .iter()
        .filter_map(|&id| archetype.component_index(id))
        .collect()
}

/// Walks `matched` archetypes chunk by chunk, slot by slot, applying the
/// requested per-slot filters before fetching.
pub(crate) fn for_each_matched<'w, V, F>(
    manager: &'w mut ArchetypeManager,
    matched: &[ArchetypeId],
    descriptor: &QueryDescriptor,
    filter_enabled: bool,
    filter_modified: bool,
    mut f: F,
) -> Result<()>
where
    V: QueryFetch<'w>,
    F: FnMut(Entity, V::Item),
{
    let mut ids: SmallVec<[ComponentId; 8]> = SmallVec::new();
    V::component_ids(&mut ids)?;

    for &archetype_id in matched {
        let archetype = manager.archetype_mut(archetype_id);

        let mut columns: SmallVec<[usize; 8]> = SmallVec::new();
        for &id in &ids {
            columns.push(
                archetype
                    .component_index(id)
                    .ok_or(EcsError::AspectViolation)?,
            );
        }

        // Filters default to the fetched columns when no aspect was given.
        let enabled_columns = if filter_enabled {
            filter_columns(archetype, &descriptor.must_be_enabled, &columns)
        } else {
            SmallVec::new()
        };
        let modified_columns = if filter_modified {
            filter_columns(archetype, &descriptor.must_be_modified, &columns)
        } else {
            SmallVec::new()
        };

        for chunk_index in 0..archetype.chunks().len() {
            let chunk_ptr: *mut Chunk = archetype.chunk_mut(chunk_index);
            // SAFETY: chunk_ptr stays valid for the slot loop; shared reads
            // end before a fetch hands out column borrows.
            let count = unsafe { (*chunk_ptr).count() };
            if count == 0 {
                continue;
            }

            'slots: for slot in 0..count {
                let entity = unsafe {
                    let chunk = &*chunk_ptr;
                    for &column in &enabled_columns {
                        if !chunk.is_component_enabled(column, slot) {
                            continue 'slots;
                        }
                    }
                    for &column in &modified_columns {
                        if !chunk.was_modified(column, slot) {
                            continue 'slots;
                        }
                    }
                    chunk.entity(slot)
                };

                let item = unsafe { V::fetch(chunk_ptr, &columns, slot) };
                f(entity, item);
            }
        }
    }
    Ok(())
}

/// Total entities currently matched, before per-slot filters.
pub(crate) fn count_matched(manager: &ArchetypeManager, matched: &[ArchetypeId]) -> usize {
    matched
        .iter()
        .map(|&id| manager.archetype(id).entity_count())
        .sum()
}
