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

//! Error types

use std::fmt;

/// ECS error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EcsError {
    /// Entity handle is stale or was never created
    InvalidHandle,

    /// Entity not found in any archetype
    EntityNotFound,

    /// Component not present on the entity
    ComponentNotFound,

    /// Component type used before registration
    NotRegistered,

    /// A named allocator or registration slot collided on a distinct definition
    DuplicateRegistration(String),

    /// Include and exclude aspects intersect, or an archetype lacks a requested column
    AspectViolation,

    /// Component id space or shared pool index space exhausted
    PoolExhausted,

    /// Heap pool or scratch buffer exhausted
    OutOfMemory {
        allocator: String,
    },

    /// Non-forced heap shutdown with outstanding allocations
    LeakDetected {
        allocator: String,
        outstanding: usize,
    },

    /// Chunk is at capacity
    ChunkFull,

    /// System dependency cycle detected
    SystemCycleDetected,

    /// Command buffer error
    CommandError(String),
}

impl fmt::Display for EcsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EcsError::InvalidHandle => write!(f, "Invalid or stale entity handle"),
            EcsError::EntityNotFound => write!(f, "Entity not found"),
            EcsError::ComponentNotFound => write!(f, "Component not found"),
            EcsError::NotRegistered => write!(f, "Component type is not registered"),
            EcsError::DuplicateRegistration(name) => {
                write!(f, "Duplicate registration: {name}")
            }
            EcsError::AspectViolation => write!(f, "Aspect constraint violated"),
            EcsError::PoolExhausted => write!(f, "Pool index space exhausted"),
            EcsError::OutOfMemory { allocator } => {
                write!(f, "Allocator '{allocator}' out of memory")
            }
            EcsError::LeakDetected {
                allocator,
                outstanding,
            } => {
                write!(
                    f,
                    "Allocator '{allocator}' shut down with {outstanding} outstanding allocations"
                )
            }
            EcsError::ChunkFull => write!(f, "Chunk is full"),
            EcsError::SystemCycleDetected => write!(f, "System dependency cycle detected"),
            EcsError::CommandError(msg) => write!(f, "Command error: {msg}"),
        }
    }
}

impl std::error::Error for EcsError {}

/// Result type alias
pub type Result<T> = std::result::Result<T, EcsError>;
