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

//! Archetype: the chunk pool for one aspect.
//!
//! Tracks every resident entity's (chunk, slot) location, recycles emptied
//! chunks through a free list, and runs component destructors through the
//! metadata thunks, optionally skipping components that an archetype move
//! has already relocated.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::aspect::{Aspect, AspectNodeId};
use crate::chunk::{Chunk, ChunkLayout, CHUNK_CAPACITY};
use crate::component::{ComponentId, DestructionContext};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::memory::{FrameScratch, HeapAllocator};

/// Where an entity lives inside its archetype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntityLocation {
    pub chunk_index: usize,
    pub slot: usize,
}

pub struct Archetype {
    aspect: Aspect,
    node: AspectNodeId,
    layout: Arc<ChunkLayout>,
    allocator: HeapAllocator,
    chunks: Vec<Chunk>,
    free_chunks: Vec<Chunk>,
    first_non_full: usize,
    entity_locations: FxHashMap<Entity, EntityLocation>,
    column_of: FxHashMap<ComponentId, usize>,
}

impl Archetype {
    pub fn new(aspect: Aspect, node: AspectNodeId, allocator: HeapAllocator) -> Result<Self> {
        let layout = Arc::new(ChunkLayout::for_aspect(&aspect)?);
        let mut column_of = FxHashMap::default();
        for (index, info) in layout.columns().iter().enumerate() {
            column_of.insert(info.id, index);
        }
        Ok(Self {
            aspect,
            node,
            layout,
            allocator,
            chunks: Vec::new(),
            free_chunks: Vec::new(),
            first_non_full: 0,
            entity_locations: FxHashMap::default(),
            column_of,
        })
    }

    pub fn aspect(&self) -> &Aspect {
        &self.aspect
    }

    pub fn aspect_node(&self) -> AspectNodeId {
        self.node
    }

    /// Column index of `id` within this archetype's chunks.
    pub fn component_index(&self, id: ComponentId) -> Option<usize> {
        self.column_of.get(&id).copied()
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunks_mut(&mut self) -> &mut [Chunk] {
        &mut self.chunks
    }

    pub fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    pub fn chunk_mut(&mut self, index: usize) -> &mut Chunk {
        &mut self.chunks[index]
    }

    pub(crate) fn free_chunk_count(&self) -> usize {
        self.free_chunks.len()
    }

    pub fn entity_count(&self) -> usize {
        self.entity_locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_locations.is_empty()
    }

    pub fn contains_entity(&self, entity: Entity) -> bool {
        self.entity_locations.contains_key(&entity)
    }

    pub fn entity_location(&self, entity: Entity) -> Result<EntityLocation> {
        self.entity_locations
            .get(&entity)
            .copied()
            .ok_or(EcsError::EntityNotFound)
    }

    fn acquire_chunk_slot(&mut self) -> Result<usize> {
        // Start from the last known non-full chunk, then scan.
        if self.first_non_full < self.chunks.len() && !self.chunks[self.first_non_full].is_full() {
            return Ok(self.first_non_full);
        }
        for (index, chunk) in self.chunks.iter().enumerate() {
            if !chunk.is_full() {
                self.first_non_full = index;
                return Ok(index);
            }
        }
        let chunk = match self.free_chunks.pop() {
            Some(recycled) => recycled,
            None => Chunk::new(Arc::clone(&self.layout), self.allocator.clone())?,
        };
        self.chunks.push(chunk);
        self.first_non_full = self.chunks.len() - 1;
        Ok(self.first_non_full)
    }

    pub fn add_entity(&mut self, entity: Entity) -> Result<EntityLocation> {
        let chunk_index = self.acquire_chunk_slot()?;
        let slot = self.chunks[chunk_index].add_entity(entity)?;
        let location = EntityLocation { chunk_index, slot };
        self.entity_locations.insert(entity, location);
        Ok(location)
    }

    /// Bulk insertion: fills existing chunks greedily, then allocates the
    /// exact number of fresh chunks. Writes per-entity locations to `out`
    /// in insertion order.
    pub fn add_entities(&mut self, entities: &[Entity], out: &mut [EntityLocation]) -> Result<()> {
        debug_assert_eq!(entities.len(), out.len());
        if entities.is_empty() {
            return Ok(());
        }
        self.entity_locations.reserve(entities.len());

        let total = entities.len();
        let mut added = 0;

        let mut fill = |chunks: &mut [Chunk],
                        range: std::ops::Range<usize>,
                        added: &mut usize,
                        locations: &mut FxHashMap<Entity, EntityLocation>|
         -> Result<()> {
            for chunk_index in range {
                let chunk = &mut chunks[chunk_index];
                while !chunk.is_full() && *added < total {
                    let entity = entities[*added];
                    let slot = chunk.add_entity(entity)?;
                    let location = EntityLocation { chunk_index, slot };
                    locations.insert(entity, location);
                    out[*added] = location;
                    *added += 1;
                }
            }
            Ok(())
        };

        let existing_chunks_len = self.chunks.len();
        fill(
            &mut self.chunks,
            0..existing_chunks_len,
            &mut added,
            &mut self.entity_locations,
        )?;

        if added < total {
            let remaining = total - added;
            let new_chunks = remaining.div_ceil(CHUNK_CAPACITY);
            self.chunks.reserve(new_chunks);
            for _ in 0..new_chunks {
                self.chunks
                    .push(Chunk::new(Arc::clone(&self.layout), self.allocator.clone())?);
            }
            let start = self.chunks.len() - new_chunks;
            fill(
                &mut self.chunks,
                start..start + new_chunks,
                &mut added,
                &mut self.entity_locations,
            )?;
        }

        debug_assert_eq!(added, total);
        Ok(())
    }

    fn destroy_slot_components(
        chunk: &Chunk,
        layout: &ChunkLayout,
        slot: usize,
        ctx: &DestructionContext,
        skip: Option<&Aspect>,
    ) {
        for (column, info) in layout.columns().iter().enumerate() {
            if let Some(skip_aspect) = skip {
                if skip_aspect.contains_id(info.id) {
                    continue;
                }
            }
            if let Some(drop_fn) = info.drop_fn {
                unsafe { drop_fn(chunk.raw_component_ptr(column, slot), ctx) };
            }
        }
    }

    pub fn remove_entity(&mut self, entity: Entity, ctx: &DestructionContext) -> Result<()> {
        let location = self.entity_location(entity)?;
        let EntityLocation { chunk_index, slot } = location;

        let layout = Arc::clone(&self.layout);
        let chunk = &mut self.chunks[chunk_index];
        Self::destroy_slot_components(chunk, &layout, slot, ctx, None);

        let swapped = chunk.remove_entity_and_swap(slot);
        let now_empty = chunk.is_empty();

        self.entity_locations.remove(&entity);
        if let Some(swapped_entity) = swapped {
            self.entity_locations
                .insert(swapped_entity, EntityLocation { chunk_index, slot });
        }

        if now_empty {
            self.recycle_chunk(chunk_index);
        }
        Ok(())
    }

    fn recycle_chunk(&mut self, chunk_index: usize) {
        let last_index = self.chunks.len() - 1;
        // swap_remove drops the last chunk into the vacated position.
        let emptied = self.chunks.swap_remove(chunk_index);
        self.free_chunks.push(emptied);

        if chunk_index != last_index {
            for slot in 0..self.chunks[chunk_index].count() {
                let entity = self.chunks[chunk_index].entity(slot);
                if let Some(location) = self.entity_locations.get_mut(&entity) {
                    location.chunk_index = chunk_index;
                }
            }
        }

        if self.first_non_full == chunk_index || self.first_non_full == last_index {
            self.first_non_full = 0;
        }
    }

    /// Bulk removal grouped by chunk, slots processed in descending order.
    /// Components whose id is in `skip_destruction` are not destroyed; an
    /// archetype move has already consumed them.
    pub fn remove_entities(
        &mut self,
        entities: &[Entity],
        ctx: &DestructionContext,
        skip_destruction: Option<&Aspect>,
    ) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        FrameScratch::with(|scratch| -> Result<()> {
            let _marker = scratch.marker();
            let pairs = scratch.alloc_slice_fill::<(usize, usize)>(entities.len(), (0, 0))?;
            let mut found = 0;
            for entity in entities {
                if let Some(location) = self.entity_locations.get(entity) {
                    pairs[found] = (location.chunk_index, location.slot);
                    found += 1;
                }
            }
            // Descending slot order keeps recorded slots valid across swap-pops.
            pairs[..found].sort_unstable_by(|a, b| b.cmp(a));

            let layout = Arc::clone(&self.layout);
            for &(chunk_index, slot) in pairs[..found].iter() {
                let chunk = &mut self.chunks[chunk_index];
                Self::destroy_slot_components(chunk, &layout, slot, ctx, skip_destruction);

                let removed = chunk.entity(slot);
                let swapped = chunk.remove_entity_and_swap(slot);

                self.entity_locations.remove(&removed);
                if let Some(swapped_entity) = swapped {
                    self.entity_locations
                        .insert(swapped_entity, EntityLocation { chunk_index, slot });
                }
            }
            Ok(())
        })
    }

    /// Destroys every live component in every chunk. Manager teardown path.
    pub fn destroy_all_components(&mut self, ctx: &DestructionContext) {
        let layout = Arc::clone(&self.layout);
        for chunk in &mut self.chunks {
            for slot in 0..chunk.count() {
                Self::destroy_slot_components(chunk, &layout, slot, ctx, None);
            }
        }
        self.chunks.clear();
        self.free_chunks.clear();
        self.entity_locations.clear();
        self.first_non_full = 0;
    }

    pub fn reset_modification_tracking(&mut self) {
        for chunk in &mut self.chunks {
            chunk.reset_modification_tracking();
        }
    }
}
