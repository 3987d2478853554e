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

//! Process-wide singleton components.
//!
//! The registry lock is held only long enough to find or create a
//! singleton's slot; the per-instance mutex guards the access itself, so
//! distinct singletons are usable concurrently.

use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use rustc_hash::FxHashMap;

use crate::component::SingletonComponent;

type Slot = Arc<Mutex<Box<dyn Any + Send>>>;

pub struct SingletonComponentRegistry {
    instances: Mutex<FxHashMap<TypeId, Slot>>,
}

/// Locked access to one singleton instance.
pub struct SingletonGuard<T: SingletonComponent> {
    guard: ArcMutexGuard<RawMutex, Box<dyn Any + Send>>,
    _marker: PhantomData<T>,
}

impl<T: SingletonComponent> Deref for SingletonGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.downcast_ref::<T>().expect("singleton slot type")
    }
}

impl<T: SingletonComponent> DerefMut for SingletonGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.downcast_mut::<T>().expect("singleton slot type")
    }
}

impl SingletonComponentRegistry {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(FxHashMap::default()),
        }
    }

    fn slot<T: SingletonComponent>(&self) -> Slot {
        let mut instances = self.instances.lock();
        Arc::clone(
            instances
                .entry(TypeId::of::<T>())
                .or_insert_with(|| Arc::new(Mutex::new(Box::new(T::default()) as Box<dyn Any + Send>))),
        )
    }

    /// Replaces (or seeds) the instance of `T`.
    pub fn register<T: SingletonComponent>(&self, instance: T) {
        let mut instances = self.instances.lock();
        instances.insert(
            TypeId::of::<T>(),
            Arc::new(Mutex::new(Box::new(instance) as Box<dyn Any + Send>)),
        );
    }

    pub fn contains<T: SingletonComponent>(&self) -> bool {
        self.instances.lock().contains_key(&TypeId::of::<T>())
    }

    /// Locks and returns the singleton, default-constructing it on first
    /// access.
    pub fn get<T: SingletonComponent>(&self) -> SingletonGuard<T> {
        let slot = self.slot::<T>();
        SingletonGuard {
            guard: slot.lock_arc(),
            _marker: PhantomData,
        }
    }

    /// Runs `f` under the instance lock. The registry lock is released
    /// before `f` runs.
    pub fn access<T: SingletonComponent, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let slot = self.slot::<T>();
        let mut guard = slot.lock();
        f(guard.downcast_mut::<T>().expect("singleton slot type"))
    }
}

impl Default for SingletonComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct FrameCounter {
        frames: u64,
    }

    #[derive(Default)]
    struct Settings {
        vsync: bool,
    }

    #[test]
    fn first_access_default_constructs() {
        let registry = SingletonComponentRegistry::new();
        assert!(!registry.contains::<FrameCounter>());
        assert_eq!(registry.get::<FrameCounter>().frames, 0);
        assert!(registry.contains::<FrameCounter>());
    }

    #[test]
    fn guard_mutations_persist() {
        let registry = SingletonComponentRegistry::new();
        registry.get::<FrameCounter>().frames = 41;
        let mut guard = registry.get::<FrameCounter>();
        guard.frames += 1;
        drop(guard);
        assert_eq!(registry.get::<FrameCounter>().frames, 42);
    }

    #[test]
    fn access_runs_under_the_instance_lock() {
        let registry = SingletonComponentRegistry::new();
        let seen = registry.access(|counter: &mut FrameCounter| {
            counter.frames += 1;
            counter.frames
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn registered_instances_replace_defaults() {
        let registry = SingletonComponentRegistry::new();
        registry.register(FrameCounter { frames: 100 });
        assert_eq!(registry.get::<FrameCounter>().frames, 100);
    }

    #[test]
    fn distinct_singletons_lock_independently() {
        let registry = SingletonComponentRegistry::new();
        let counter = registry.get::<FrameCounter>();
        // A different singleton stays reachable while the first is held.
        registry.access(|settings: &mut Settings| {
            settings.vsync = true;
        });
        drop(counter);
        assert!(registry.access(|settings: &mut Settings| settings.vsync));
    }
}
