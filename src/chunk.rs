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

//! Fixed-capacity struct-of-arrays chunks.
//!
//! All component columns of a chunk live in one backing allocation from the
//! heap pool, at per-column aligned offsets. Removal is swap-pop: the last
//! slot is relocated into the vacated one through the metadata thunks.
//! Component destructors for the *removed* slot are the archetype's
//! responsibility and run before the swap.

use std::ptr;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::aspect::Aspect;
use crate::component::{self, ComponentId, DropFn, MoveAndDestroyFn};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::memory::{align_up, HeapAllocator};

/// Entities per chunk.
pub const CHUNK_CAPACITY: usize = 64;

const COLUMNS_INLINE: usize = 16;

type ColumnBitsets = SmallVec<[u64; COLUMNS_INLINE]>;

/// Per-column placement and thunks, resolved once per archetype.
#[derive(Clone, Copy)]
pub struct ColumnInfo {
    pub id: ComponentId,
    pub offset: usize,
    pub size: usize,
    pub drop_fn: Option<DropFn>,
    pub move_and_destroy: MoveAndDestroyFn,
}

/// Shared storage recipe for every chunk of one archetype.
pub struct ChunkLayout {
    columns: SmallVec<[ColumnInfo; COLUMNS_INLINE]>,
    total_size: usize,
    max_alignment: usize,
}

impl ChunkLayout {
    /// Computes column offsets for `aspect` into one backing block sized
    /// `Σ align_up(size_j × CAPACITY, align_j)`.
    pub fn for_aspect(aspect: &Aspect) -> Result<ChunkLayout> {
        let mut columns = SmallVec::new();
        let mut total_size = 0usize;
        let mut max_alignment = std::mem::align_of::<u64>();

        for &id in aspect.component_ids() {
            let meta = component::metadata(id)?;
            max_alignment = max_alignment.max(meta.alignment);
            if meta.alignment > 0 {
                total_size = align_up(total_size, meta.alignment);
            }
            columns.push(ColumnInfo {
                id,
                offset: total_size,
                size: meta.size,
                drop_fn: meta.drop_fn,
                move_and_destroy: meta.move_and_destroy,
            });
            total_size += meta.size * CHUNK_CAPACITY;
        }

        Ok(ChunkLayout {
            columns,
            total_size,
            max_alignment,
        })
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }
}

pub struct Chunk {
    count: usize,
    storage: *mut u8,
    layout: Arc<ChunkLayout>,
    allocator: HeapAllocator,
    entities: [Entity; CHUNK_CAPACITY],
    modified: ColumnBitsets,
    enabled: ColumnBitsets,
}

// The storage block is exclusively owned; access is gated by &/&mut.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub fn new(layout: Arc<ChunkLayout>, allocator: HeapAllocator) -> Result<Chunk> {
        let storage = if layout.total_size == 0 {
            ptr::null_mut()
        } else {
            allocator
                .allocate(layout.total_size, layout.max_alignment)?
                .as_ptr()
        };

        let column_count = layout.column_count();
        let mut enabled: ColumnBitsets = SmallVec::new();
        let mut modified: ColumnBitsets = SmallVec::new();
        enabled.resize(column_count, u64::MAX);
        modified.resize(column_count, 0);

        Ok(Chunk {
            count: 0,
            storage,
            layout,
            allocator,
            entities: [Entity::undefined(); CHUNK_CAPACITY],
            modified,
            enabled,
        })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn capacity(&self) -> usize {
        CHUNK_CAPACITY
    }

    pub fn is_full(&self) -> bool {
        self.count >= CHUNK_CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    pub fn entity(&self, slot: usize) -> Entity {
        debug_assert!(slot < self.count);
        self.entities[slot]
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities[..self.count]
    }

    /// Appends `entity` and returns its slot. All of the slot's columns
    /// start modified and enabled.
    pub fn add_entity(&mut self, entity: Entity) -> Result<usize> {
        if self.is_full() {
            return Err(EcsError::ChunkFull);
        }
        let slot = self.count;
        self.entities[slot] = entity;
        let bit = 1u64 << slot;
        for column in 0..self.layout.column_count() {
            self.modified[column] |= bit;
            self.enabled[column] |= bit;
        }
        self.count += 1;
        Ok(slot)
    }

    /// Swap-pop removal: relocates the last slot into `slot` and returns the
    /// entity that moved (`None` when `slot` was last). The removed slot's
    /// destructors must already have run.
    pub fn remove_entity_and_swap(&mut self, slot: usize) -> Option<Entity> {
        debug_assert!(slot < self.count);
        let last = self.count - 1;
        let mut swapped = None;

        if slot != last {
            self.entities[slot] = self.entities[last];
            swapped = Some(self.entities[slot]);

            for (column, info) in self.layout.columns.iter().enumerate() {
                if info.size > 0 {
                    unsafe {
                        let base = self.storage.add(info.offset);
                        let dest = base.add(slot * info.size);
                        let src = base.add(last * info.size);
                        (info.move_and_destroy)(dest, src);
                    }
                }

                // Modification and enabled state travel with the swapped slot.
                let moved_modified = (self.modified[column] >> last) & 1;
                let moved_enabled = (self.enabled[column] >> last) & 1;
                self.modified[column] =
                    (self.modified[column] & !(1 << slot)) | (moved_modified << slot);
                self.enabled[column] =
                    (self.enabled[column] & !(1 << slot)) | (moved_enabled << slot);
            }
        }

        self.count -= 1;
        swapped
    }

    /// O(1) read pointer to a component slot.
    pub fn component_ptr(&self, column: usize, slot: usize) -> *const u8 {
        self.raw_component_ptr(column, slot)
    }

    /// O(1) write pointer; marks the slot modified.
    pub fn component_ptr_mut(&mut self, column: usize, slot: usize) -> *mut u8 {
        self.mark_modified(column, slot);
        self.raw_component_ptr(column, slot)
    }

    /// Write pointer without touching modification state (relocation and
    /// destruction paths).
    pub(crate) fn raw_component_ptr(&self, column: usize, slot: usize) -> *mut u8 {
        debug_assert!(column < self.layout.column_count());
        debug_assert!(slot < CHUNK_CAPACITY);
        let info = &self.layout.columns[column];
        unsafe { self.storage.add(info.offset + slot * info.size) }
    }

    pub fn mark_modified(&mut self, column: usize, slot: usize) {
        debug_assert!(slot < self.count);
        self.modified[column] |= 1 << slot;
    }

    pub fn was_modified(&self, column: usize, slot: usize) -> bool {
        (self.modified[column] >> slot) & 1 != 0
    }

    pub fn enable_component(&mut self, column: usize, slot: usize) {
        self.enabled[column] |= 1 << slot;
    }

    pub fn disable_component(&mut self, column: usize, slot: usize) {
        self.enabled[column] &= !(1 << slot);
    }

    pub fn is_component_enabled(&self, column: usize, slot: usize) -> bool {
        (self.enabled[column] >> slot) & 1 != 0
    }

    pub fn reset_modification_tracking(&mut self) {
        for bits in &mut self.modified {
            *bits = 0;
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        if !self.storage.is_null() {
            self.allocator.deallocate(self.storage);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::register_component;

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
        z: f32,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Mass(f64);

    fn chunk_for(ids: &[ComponentId]) -> Chunk {
        let aspect = Aspect::from_ids(ids.iter().copied());
        let layout = Arc::new(ChunkLayout::for_aspect(&aspect).unwrap());
        Chunk::new(layout, crate::memory::global_allocator()).unwrap()
    }

    fn write_pos(chunk: &mut Chunk, column: usize, slot: usize, value: Pos) {
        unsafe { (chunk.component_ptr_mut(column, slot) as *mut Pos).write(value) };
    }

    fn read_pos(chunk: &Chunk, column: usize, slot: usize) -> Pos {
        unsafe { *(chunk.component_ptr(column, slot) as *const Pos) }
    }

    #[test]
    fn layout_aligns_columns() {
        let pos = register_component::<Pos>().unwrap();
        let mass = register_component::<Mass>().unwrap();
        let aspect = Aspect::from_ids([pos, mass]);
        let layout = ChunkLayout::for_aspect(&aspect).unwrap();

        for info in layout.columns() {
            let meta = component::metadata(info.id).unwrap();
            assert_eq!(info.offset % meta.alignment, 0);
        }
        assert!(layout.total_size() >= (12 + 8) * CHUNK_CAPACITY);
    }

    #[test]
    fn empty_aspect_needs_no_storage() {
        let chunk = chunk_for(&[]);
        assert_eq!(chunk.layout().total_size(), 0);
        assert!(chunk.is_empty());
    }

    #[test]
    fn add_fills_slots_in_order() {
        let pos = register_component::<Pos>().unwrap();
        let mut chunk = chunk_for(&[pos]);

        for i in 0..CHUNK_CAPACITY {
            let slot = chunk.add_entity(Entity::new(i as u32 + 1, 1)).unwrap();
            assert_eq!(slot, i);
        }
        assert!(chunk.is_full());
        assert_eq!(
            chunk.add_entity(Entity::new(999, 1)).unwrap_err(),
            EcsError::ChunkFull
        );
    }

    #[test]
    fn new_slots_start_modified_and_enabled() {
        let pos = register_component::<Pos>().unwrap();
        let mut chunk = chunk_for(&[pos]);
        let slot = chunk.add_entity(Entity::new(1, 1)).unwrap();
        assert!(chunk.was_modified(0, slot));
        assert!(chunk.is_component_enabled(0, slot));

        chunk.reset_modification_tracking();
        assert!(!chunk.was_modified(0, slot));
        assert!(chunk.is_component_enabled(0, slot));
    }

    #[test]
    fn swap_pop_preserves_remaining_data() {
        let pos = register_component::<Pos>().unwrap();
        let mut chunk = chunk_for(&[pos]);

        for i in 0..4u32 {
            let slot = chunk.add_entity(Entity::new(i + 1, 1)).unwrap();
            write_pos(
                &mut chunk,
                0,
                slot,
                Pos {
                    x: i as f32,
                    y: 0.0,
                    z: 0.0,
                },
            );
        }

        // Remove slot 1; slot 3 (entity 4, x=3) must take its place.
        let swapped = chunk.remove_entity_and_swap(1).unwrap();
        assert_eq!(swapped, Entity::new(4, 1));
        assert_eq!(chunk.count(), 3);
        assert_eq!(chunk.entity(1), Entity::new(4, 1));
        assert_eq!(read_pos(&chunk, 0, 1).x, 3.0);
        assert_eq!(read_pos(&chunk, 0, 0).x, 0.0);
        assert_eq!(read_pos(&chunk, 0, 2).x, 2.0);

        // Removing the last slot swaps nothing.
        assert_eq!(chunk.remove_entity_and_swap(2), None);
        assert_eq!(chunk.count(), 2);
    }

    #[test]
    fn swap_pop_carries_bitset_state() {
        let pos = register_component::<Pos>().unwrap();
        let mut chunk = chunk_for(&[pos]);
        for i in 0..3u32 {
            chunk.add_entity(Entity::new(i + 1, 1)).unwrap();
        }
        chunk.reset_modification_tracking();
        chunk.disable_component(0, 2);
        chunk.mark_modified(0, 2);

        chunk.remove_entity_and_swap(0);
        assert!(!chunk.is_component_enabled(0, 0));
        assert!(chunk.was_modified(0, 0));
        assert!(chunk.is_component_enabled(0, 1));
        assert!(!chunk.was_modified(0, 1));
    }

    #[test]
    fn mutable_pointer_marks_modified() {
        let pos = register_component::<Pos>().unwrap();
        let mut chunk = chunk_for(&[pos]);
        let slot = chunk.add_entity(Entity::new(1, 1)).unwrap();
        chunk.reset_modification_tracking();

        let _ = chunk.component_ptr(0, slot);
        assert!(!chunk.was_modified(0, slot));

        let _ = chunk.component_ptr_mut(0, slot);
        assert!(chunk.was_modified(0, slot));
    }
}
