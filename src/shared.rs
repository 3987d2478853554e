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

//! Shared-component interning pools.
//!
//! Equal values are stored once and referenced by handle; refcounts track
//! live handles, and mutation goes through copy-on-write so writers never
//! disturb other owners of the same value. The manager is thread-safe.

use std::any::Any;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::component::{self, ComponentId, SharedComponentData, SharedComponentHandle};
use crate::error::{EcsError, Result};

struct PoolInner<T> {
    values: Vec<Option<T>>,
    ref_counts: Vec<u32>,
    free_list: Vec<u32>,
    interned: AHashMap<T, u32>,
}

impl<T: SharedComponentData> Default for PoolInner<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            ref_counts: Vec::new(),
            free_list: Vec::new(),
            interned: AHashMap::new(),
        }
    }
}

impl<T: SharedComponentData> PoolInner<T> {
    /// Places `value` in a fresh slot with refcount 0, reusing the free list.
    /// The slot is not interned.
    fn create_unique(&mut self, value: T) -> Result<u32> {
        if let Some(index) = self.free_list.pop() {
            self.values[index as usize] = Some(value);
            self.ref_counts[index as usize] = 0;
            return Ok(index);
        }
        if self.values.len() >= u32::MAX as usize {
            return Err(EcsError::PoolExhausted);
        }
        self.values.push(Some(value));
        self.ref_counts.push(0);
        Ok(self.values.len() as u32 - 1)
    }

    fn find_or_create(&mut self, value: &T) -> Result<u32> {
        if let Some(&index) = self.interned.get(value) {
            return Ok(index);
        }
        let index = self.create_unique(value.clone())?;
        self.interned.insert(value.clone(), index);
        Ok(index)
    }

    /// Drops the interning entry for `index` if it still points there.
    fn erase_interned(&mut self, index: u32) {
        let Some(Some(value)) = self.values.get(index as usize) else {
            return;
        };
        if self.interned.get(value) == Some(&index) {
            let key = value.clone();
            self.interned.remove(&key);
        }
    }

    fn decrement(&mut self, index: u32) {
        let slot = index as usize;
        if slot >= self.ref_counts.len() || self.ref_counts[slot] == 0 {
            return;
        }
        self.ref_counts[slot] -= 1;
        if self.ref_counts[slot] == 0 {
            self.erase_interned(index);
            self.values[slot] = None;
            self.free_list.push(index);
        }
    }
}

trait ErasedSharedPool: Send + Sync {
    fn increment_ref(&self, index: u32);
    fn decrement_ref(&self, index: u32);
    fn ref_count(&self, index: u32) -> u32;
    fn as_any(&self) -> &dyn Any;
}

struct SharedPool<T: SharedComponentData> {
    inner: Mutex<PoolInner<T>>,
}

impl<T: SharedComponentData> SharedPool<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
        }
    }
}

impl<T: SharedComponentData> ErasedSharedPool for SharedPool<T> {
    fn increment_ref(&self, index: u32) {
        let mut inner = self.inner.lock();
        let slot = index as usize;
        if slot < inner.ref_counts.len() {
            inner.ref_counts[slot] += 1;
        }
    }

    fn decrement_ref(&self, index: u32) {
        self.inner.lock().decrement(index);
    }

    fn ref_count(&self, index: u32) -> u32 {
        let inner = self.inner.lock();
        inner.ref_counts.get(index as usize).copied().unwrap_or(0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Thread-safe registry of per-type interning pools.
pub struct SharedComponentManager {
    pools: RwLock<FxHashMap<ComponentId, Arc<dyn ErasedSharedPool>>>,
}

impl SharedComponentManager {
    pub fn new() -> Self {
        Self {
            pools: RwLock::new(FxHashMap::default()),
        }
    }

    fn pool_for<T: SharedComponentData>(&self) -> Result<(ComponentId, Arc<dyn ErasedSharedPool>)> {
        let id = component::register_shared_component::<T>()?;
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(&id) {
                return Ok((id, Arc::clone(pool)));
            }
        }
        let mut pools = self.pools.write();
        let pool = pools
            .entry(id)
            .or_insert_with(|| Arc::new(SharedPool::<T>::new()) as Arc<dyn ErasedSharedPool>);
        Ok((id, Arc::clone(pool)))
    }

    fn existing_pool(&self, id: ComponentId) -> Result<Arc<dyn ErasedSharedPool>> {
        self.pools
            .read()
            .get(&id)
            .cloned()
            .ok_or(EcsError::InvalidHandle)
    }

    fn typed<'a, T: SharedComponentData>(
        pool: &'a Arc<dyn ErasedSharedPool>,
    ) -> Result<&'a SharedPool<T>> {
        pool.as_any()
            .downcast_ref::<SharedPool<T>>()
            .ok_or(EcsError::InvalidHandle)
    }

    /// Interns `value` and returns its handle without touching refcounts.
    /// Callers that store the handle increment explicitly.
    pub fn get_handle<T: SharedComponentData>(&self, value: &T) -> Result<SharedComponentHandle> {
        let (id, pool) = self.pool_for::<T>()?;
        let index = Self::typed::<T>(&pool)?.inner.lock().find_or_create(value)?;
        Ok(SharedComponentHandle {
            component_id: id,
            data_index: index,
        })
    }

    /// Clones the value behind `handle`.
    pub fn get<T: SharedComponentData>(&self, handle: SharedComponentHandle) -> Result<T> {
        self.with(handle, |value: &T| value.clone())
    }

    /// Runs `f` against the value behind `handle` under the pool lock.
    pub fn with<T: SharedComponentData, R>(
        &self,
        handle: SharedComponentHandle,
        f: impl FnOnce(&T) -> R,
    ) -> Result<R> {
        let expected = component::register_shared_component::<T>()?;
        if handle.component_id != expected {
            return Err(EcsError::InvalidHandle);
        }
        let pool = self.existing_pool(handle.component_id)?;
        let inner = Self::typed::<T>(&pool)?.inner.lock();
        match inner.values.get(handle.data_index as usize) {
            Some(Some(value)) => Ok(f(value)),
            _ => Err(EcsError::InvalidHandle),
        }
    }

    /// Copy-on-write mutable access.
    ///
    /// With more than one owner the value is cloned into a fresh slot
    /// (refcount 1, old handle released); with a single owner the slot is
    /// un-interned and mutated in place. `handle` is updated to the slot
    /// that was mutated.
    pub fn get_mutable<T: SharedComponentData, R>(
        &self,
        handle: &mut SharedComponentHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R> {
        let expected = component::register_shared_component::<T>()?;
        if handle.component_id != expected {
            return Err(EcsError::InvalidHandle);
        }
        let pool = self.existing_pool(handle.component_id)?;
        let mut inner = Self::typed::<T>(&pool)?.inner.lock();
        let index = handle.data_index;
        let slot = index as usize;

        let Some(Some(_)) = inner.values.get(slot) else {
            return Err(EcsError::InvalidHandle);
        };

        if inner.ref_counts[slot] > 1 {
            let copy = inner.values[slot].clone().unwrap();
            inner.decrement(index);
            let fresh = inner.create_unique(copy)?;
            inner.ref_counts[fresh as usize] = 1;
            handle.data_index = fresh;
            Ok(f(inner.values[fresh as usize].as_mut().unwrap()))
        } else {
            // Mutation would desynchronize the interning key.
            inner.erase_interned(index);
            Ok(f(inner.values[slot].as_mut().unwrap()))
        }
    }

    pub fn increment_ref(&self, handle: SharedComponentHandle) {
        if !handle.is_valid() {
            return;
        }
        if let Ok(pool) = self.existing_pool(handle.component_id) {
            pool.increment_ref(handle.data_index);
        }
    }

    pub fn decrement_ref(&self, handle: SharedComponentHandle) {
        if !handle.is_valid() {
            return;
        }
        if let Ok(pool) = self.existing_pool(handle.component_id) {
            pool.decrement_ref(handle.data_index);
        }
    }

    pub fn ref_count(&self, handle: SharedComponentHandle) -> u32 {
        if !handle.is_valid() {
            return 0;
        }
        match self.existing_pool(handle.component_id) {
            Ok(pool) => pool.ref_count(handle.data_index),
            Err(_) => 0,
        }
    }
}

impl Default for SharedComponentManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Material {
        name: &'static str,
        tint: u32,
    }

    const BLUE: Material = Material {
        name: "blue",
        tint: 0x0000FF,
    };

    const RED: Material = Material {
        name: "red",
        tint: 0xFF0000,
    };

    #[test]
    fn equal_values_intern_to_one_slot() {
        let manager = SharedComponentManager::new();
        let a = manager.get_handle(&BLUE).unwrap();
        let b = manager.get_handle(&BLUE).unwrap();
        let c = manager.get_handle(&RED).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(manager.get::<Material>(a).unwrap(), BLUE);
    }

    #[test]
    fn handles_do_not_implicitly_own() {
        let manager = SharedComponentManager::new();
        let handle = manager.get_handle(&BLUE).unwrap();
        assert_eq!(manager.ref_count(handle), 0);

        manager.increment_ref(handle);
        manager.increment_ref(handle);
        assert_eq!(manager.ref_count(handle), 2);
    }

    #[test]
    fn last_reference_destroys_and_recycles_the_slot() {
        let manager = SharedComponentManager::new();
        let handle = manager.get_handle(&BLUE).unwrap();
        manager.increment_ref(handle);
        manager.decrement_ref(handle);

        assert!(manager.get::<Material>(handle).is_err());
        assert_eq!(manager.ref_count(handle), 0);

        // The freed index is reused for the next distinct value.
        let next = manager.get_handle(&RED).unwrap();
        assert_eq!(next.data_index, handle.data_index);
    }

    #[test]
    fn copy_on_write_splits_shared_values() {
        let manager = SharedComponentManager::new();
        let mut writer = manager.get_handle(&BLUE).unwrap();
        let reader = writer;
        manager.increment_ref(writer);
        manager.increment_ref(reader);

        manager
            .get_mutable(&mut writer, |material: &mut Material| {
                material.tint = 0x123456;
            })
            .unwrap();

        assert_ne!(writer.data_index, reader.data_index);
        assert_eq!(manager.get::<Material>(reader).unwrap(), BLUE);
        assert_eq!(manager.get::<Material>(writer).unwrap().tint, 0x123456);
        assert_eq!(manager.ref_count(reader), 1);
        assert_eq!(manager.ref_count(writer), 1);
    }

    #[test]
    fn sole_owner_mutates_in_place_and_leaves_interning() {
        let manager = SharedComponentManager::new();
        let mut handle = manager.get_handle(&BLUE).unwrap();
        manager.increment_ref(handle);

        let before = handle;
        manager
            .get_mutable(&mut handle, |material: &mut Material| {
                material.tint = 0x777777;
            })
            .unwrap();
        assert_eq!(handle, before);

        // The mutated slot left the interning set: asking for the original
        // value mints a fresh slot.
        let fresh = manager.get_handle(&BLUE).unwrap();
        assert_ne!(fresh.data_index, handle.data_index);
    }

    #[test]
    fn wrong_type_is_an_invalid_handle() {
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        struct Other(u8);

        let manager = SharedComponentManager::new();
        let handle = manager.get_handle(&BLUE).unwrap();
        assert_eq!(
            manager.get::<Other>(handle).unwrap_err(),
            EcsError::InvalidHandle
        );
    }
}
