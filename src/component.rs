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

//! Component traits and the type-erased metadata registry.
//!
//! Structural operations never see concrete component types: chunks and
//! archetypes relocate and destroy columns through the function-pointer
//! thunks recorded here at registration.

use std::any::TypeId;
use std::marker::PhantomData;
use std::sync::OnceLock;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{EcsError, Result};
use crate::shared::SharedComponentManager;

/// Upper bound on distinct registered component types.
pub const MAX_COMPONENTS: usize = 256;

/// Marker trait for components.
///
/// Components must be 'static (no borrowed data).
pub trait Component: 'static + Send + Sync {}

/// Automatically implement Component for all valid types
impl<T: 'static + Send + Sync> Component for T {}

/// Values storable in the shared-component interning pools.
pub trait SharedComponentData: Component + Clone + PartialEq + Eq + std::hash::Hash {}

impl<T: Component + Clone + PartialEq + Eq + std::hash::Hash> SharedComponentData for T {}

/// Components stored once per process in the singleton registry.
pub trait SingletonComponent: Component + Default {}

impl<T: Component + Default> SingletonComponent for T {}

/// Dense component type id assigned at registration. 0 is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ComponentId(u32);

impl ComponentId {
    pub const INVALID: ComponentId = ComponentId(0);

    pub(crate) const fn from_raw(raw: u32) -> Self {
        ComponentId(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// Handle into a shared-component pool: pool id plus slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedComponentHandle {
    pub component_id: ComponentId,
    pub data_index: u32,
}

impl SharedComponentHandle {
    pub const INVALID: SharedComponentHandle = SharedComponentHandle {
        component_id: ComponentId::INVALID,
        data_index: u32::MAX,
    };

    pub fn is_valid(self) -> bool {
        self.component_id.is_valid()
    }
}

impl Default for SharedComponentHandle {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Chunk-resident component holding a handle into the interning pool for `T`.
#[derive(Debug, Clone)]
pub struct SharedComponent<T: SharedComponentData> {
    pub handle: SharedComponentHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: SharedComponentData> SharedComponent<T> {
    pub fn new(handle: SharedComponentHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }
}

impl<T: SharedComponentData> Default for SharedComponent<T> {
    fn default() -> Self {
        Self::new(SharedComponentHandle::INVALID)
    }
}

/// Passed to destructor thunks; shared-handle columns decrement through it.
pub struct DestructionContext<'a> {
    pub shared: Option<&'a SharedComponentManager>,
}

impl DestructionContext<'_> {
    pub const DETACHED: DestructionContext<'static> = DestructionContext { shared: None };
}

/// Destroys the component at `ptr`.
pub type DropFn = unsafe fn(*mut u8, &DestructionContext);

/// Move-constructs at `dst` from `src` and leaves `src` destroyed.
pub type MoveAndDestroyFn = unsafe fn(dst: *mut u8, src: *mut u8);

#[derive(Clone, Copy)]
pub struct ComponentMetadata {
    pub id: ComponentId,
    pub size: usize,
    pub alignment: usize,
    /// No drop glue: relocation is a plain byte copy with nothing left behind.
    pub is_trivially_relocatable: bool,
    pub drop_fn: Option<DropFn>,
    pub move_and_destroy: MoveAndDestroyFn,
}

impl std::fmt::Debug for ComponentMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentMetadata")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("alignment", &self.alignment)
            .field("is_trivially_relocatable", &self.is_trivially_relocatable)
            .field("has_drop", &self.drop_fn.is_some())
            .finish()
    }
}

unsafe fn drop_component<T>(ptr: *mut u8, _ctx: &DestructionContext) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn drop_shared_handle<T: SharedComponentData>(ptr: *mut u8, ctx: &DestructionContext) {
    let handle = (*(ptr as *mut SharedComponent<T>)).handle;
    if let Some(shared) = ctx.shared {
        shared.decrement_ref(handle);
    }
}

unsafe fn relocate<T>(dst: *mut u8, src: *mut u8) {
    std::ptr::write(dst as *mut T, std::ptr::read(src as *const T));
}

#[derive(Default)]
struct RegistryState {
    type_to_id: FxHashMap<TypeId, ComponentId>,
    metadata: Vec<ComponentMetadata>,
}

static REGISTRY: OnceLock<RwLock<RegistryState>> = OnceLock::new();

fn registry() -> &'static RwLock<RegistryState> {
    REGISTRY.get_or_init(|| RwLock::new(RegistryState::default()))
}

fn register_raw(type_id: TypeId, mut meta: ComponentMetadata) -> Result<ComponentId> {
    let mut state = registry().write();
    if let Some(&id) = state.type_to_id.get(&type_id) {
        return Ok(id);
    }
    if state.metadata.len() + 1 >= MAX_COMPONENTS {
        return Err(EcsError::PoolExhausted);
    }
    let id = ComponentId(state.metadata.len() as u32 + 1);
    meta.id = id;
    state.metadata.push(meta);
    state.type_to_id.insert(type_id, id);
    tracing::debug!(id = id.raw(), size = meta.size, "registered component type");
    Ok(id)
}

/// Registers `T`, assigning the next sequential id. Idempotent.
pub fn register_component<T: Component>() -> Result<ComponentId> {
    let needs_drop = std::mem::needs_drop::<T>();
    register_raw(
        TypeId::of::<T>(),
        ComponentMetadata {
            id: ComponentId::INVALID,
            size: std::mem::size_of::<T>(),
            alignment: std::mem::align_of::<T>(),
            is_trivially_relocatable: !needs_drop,
            drop_fn: needs_drop.then_some(drop_component::<T> as DropFn),
            move_and_destroy: relocate::<T>,
        },
    )
}

/// Registers the handle component `SharedComponent<T>`. Its destructor
/// releases the pool reference through the destruction context.
pub fn register_shared_component<T: SharedComponentData>() -> Result<ComponentId> {
    register_raw(
        TypeId::of::<SharedComponent<T>>(),
        ComponentMetadata {
            id: ComponentId::INVALID,
            size: std::mem::size_of::<SharedComponent<T>>(),
            alignment: std::mem::align_of::<SharedComponent<T>>(),
            is_trivially_relocatable: true,
            drop_fn: Some(drop_shared_handle::<T> as DropFn),
            move_and_destroy: relocate::<SharedComponent<T>>,
        },
    )
}

/// Id of a previously registered type; [`EcsError::NotRegistered`] otherwise.
pub fn component_id<T: Component>() -> Result<ComponentId> {
    registry()
        .read()
        .type_to_id
        .get(&TypeId::of::<T>())
        .copied()
        .ok_or(EcsError::NotRegistered)
}

/// Metadata by id; [`EcsError::InvalidHandle`] for out-of-range ids.
pub fn metadata(id: ComponentId) -> Result<ComponentMetadata> {
    registry()
        .read()
        .metadata
        .get(id.raw().wrapping_sub(1) as usize)
        .copied()
        .ok_or(EcsError::InvalidHandle)
}
