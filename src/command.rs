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

//! Deferred structural changes.
//!
//! Systems iterating a query must not restructure archetypes under their
//! own feet; they log commands here instead. Entity creations hand out
//! proxies (generation `u32::MAX`) that commit resolves to real entities
//! before any component command runs. `commit` consumes the buffer, so the
//! log replays exactly once.

use std::alloc::Layout;
use std::ptr::NonNull;

use crate::component::{self, Component, ComponentId, DestructionContext};
use crate::entity::Entity;
use crate::error::{EcsError, Result};
use crate::world::EntityManager;

/// Type-erased component value waiting for commit.
struct ErasedPayload {
    data: NonNull<u8>,
    component_id: ComponentId,
    consumed: bool,
}

// Payload types are `Component` and therefore `Send`.
unsafe impl Send for ErasedPayload {}

impl ErasedPayload {
    fn new<T: Component>(component_id: ComponentId, value: T) -> Self {
        let layout = Layout::new::<T>();
        let data = if layout.size() == 0 {
            NonNull::<T>::dangling().cast::<u8>()
        } else {
            let raw = unsafe { std::alloc::alloc(layout) };
            NonNull::new(raw).expect("payload allocation failed")
        };
        unsafe { (data.as_ptr() as *mut T).write(value) };
        Self {
            data,
            component_id,
            consumed: false,
        }
    }

    fn layout(&self) -> Layout {
        let meta = component::metadata(self.component_id).expect("payload metadata");
        Layout::from_size_align(meta.size, meta.alignment).expect("payload layout")
    }
}

impl Drop for ErasedPayload {
    fn drop(&mut self) {
        let layout = self.layout();
        if !self.consumed {
            if let Ok(meta) = component::metadata(self.component_id) {
                if let Some(drop_fn) = meta.drop_fn {
                    unsafe { drop_fn(self.data.as_ptr(), &DestructionContext::DETACHED) };
                }
            }
        }
        if layout.size() != 0 {
            unsafe { std::alloc::dealloc(self.data.as_ptr(), layout) };
        }
    }
}

enum Command {
    CreateEntity,
    AddComponent {
        target: Entity,
        payload: ErasedPayload,
    },
    RemoveComponent {
        target: Entity,
        component_id: ComponentId,
    },
    DestroyEntity {
        target: Entity,
    },
}

/// Ordered log of deferred structural commands.
#[derive(Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    proxy_count: u32,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            commands: Vec::with_capacity(capacity),
            proxy_count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Queues an entity creation and returns its proxy. The proxy is valid
    /// as a target for further commands in this buffer only.
    pub fn create_entity(&mut self) -> Entity {
        let proxy = Entity::new(self.proxy_count, Entity::PROXY_GENERATION);
        self.proxy_count += 1;
        self.commands.push(Command::CreateEntity);
        proxy
    }

    /// Queues adding `value` to `target` (a real entity or a proxy from
    /// this buffer).
    pub fn add_component<T: Component>(&mut self, target: Entity, value: T) -> Result<()> {
        let id = component::register_component::<T>()?;
        self.commands.push(Command::AddComponent {
            target,
            payload: ErasedPayload::new(id, value),
        });
        Ok(())
    }

    pub fn remove_component<T: Component>(&mut self, target: Entity) -> Result<()> {
        let id = component::component_id::<T>()?;
        self.commands.push(Command::RemoveComponent {
            target,
            component_id: id,
        });
        Ok(())
    }

    pub fn destroy_entity(&mut self, target: Entity) {
        self.commands.push(Command::DestroyEntity { target });
    }

    /// Replays the log against `manager`.
    ///
    /// Pass one allocates a real entity for every proxy; pass two executes
    /// the commands in order, translating proxies. Consuming `self` makes
    /// re-commit unrepresentable.
    pub fn commit(self, manager: &mut EntityManager) -> Result<()> {
        #[cfg(feature = "profiling")]
        let _span = tracing::info_span!("command_commit", queued = self.commands.len()).entered();

        let Self {
            commands,
            proxy_count,
        } = self;

        let proxies = manager.create_entities(proxy_count as usize)?;
        let resolve = |entity: Entity| -> Result<Entity> {
            if !entity.is_proxy() {
                return Ok(entity);
            }
            proxies
                .get(entity.index() as usize)
                .copied()
                .ok_or_else(|| EcsError::CommandError("unknown proxy entity".to_string()))
        };

        for command in commands {
            match command {
                Command::CreateEntity => {}
                Command::AddComponent {
                    target,
                    mut payload,
                } => {
                    let entity = resolve(target)?;
                    manager.add_component_erased(
                        entity,
                        payload.component_id,
                        payload.data.as_ptr(),
                    )?;
                    payload.consumed = true;
                }
                Command::RemoveComponent {
                    target,
                    component_id,
                } => {
                    let entity = resolve(target)?;
                    manager.remove_component_erased(entity, component_id)?;
                }
                Command::DestroyEntity { target } => {
                    let entity = resolve(target)?;
                    manager.destroy_entity(entity)?;
                }
            }
        }
        Ok(())
    }
}
