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

//! Aspect ECS - archetype storage with aspect-graph queries
//!
//! Entities are grouped by their exact component set (aspect) into
//! fixed-capacity chunks; queries resolve archetypes through the aspect
//! inclusion DAG and invalidate through per-aspect versions.

pub mod archetype;
pub mod aspect;
pub mod chunk;
pub mod command;
pub mod component;
pub mod components;
pub mod dependency;
pub mod entity;
pub mod error;
pub mod interner;
pub mod memory;
pub mod query;
pub mod schedule;
pub mod shared;
pub mod singleton;
pub mod storage;
pub mod system;
pub mod version;
pub mod world;

// Re-exports for convenience
pub use archetype::{Archetype, EntityLocation};
pub use aspect::{Aspect, AspectRegistry};
pub use chunk::{Chunk, CHUNK_CAPACITY};
pub use command::CommandBuffer;
pub use dependency::DependencyGraph;
pub use component::{
    Component, ComponentId, ComponentMetadata, SharedComponent, SharedComponentData,
    SharedComponentHandle, SingletonComponent, MAX_COMPONENTS,
};
pub use entity::Entity;
pub use error::{EcsError, Result};
pub use memory::{FrameScratch, HeapAllocator, ScratchAllocator};
pub use query::{QueryBuilder, QueryDescriptor, QueryFetch, QueryRegistry};
pub use schedule::SystemScheduler;
pub use shared::SharedComponentManager;
pub use singleton::SingletonComponentRegistry;
pub use storage::ArchetypeManager;
pub use system::{BoxedSystem, ExecutionStage, System, SystemContext, SystemDependencies};
pub use world::EntityManager;
