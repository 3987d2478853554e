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

//! Engine-facing component definitions.
//!
//! The renderer and its caches live behind opaque pointers in singleton
//! components; the ECS stores them and guarantees their storage outlives
//! any system access, nothing more. Event components follow the
//! entity-per-event convention: spawn with [`EventTag`], consume, destroy
//! at end of frame.

use std::ffi::c_void;
use std::ptr::NonNull;

use glam::Mat4;

use crate::interner::HashedString;

/// Marker for event entities. A consuming system queries for the event
/// component together with this tag and destroys the entities it handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventTag;

/// Foreign pointer owned by an external subsystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueHandle(Option<NonNull<c_void>>);

// The pointee is owned and synchronized by the external subsystem.
unsafe impl Send for OpaqueHandle {}
unsafe impl Sync for OpaqueHandle {}

impl OpaqueHandle {
    pub fn new(ptr: *mut c_void) -> Self {
        Self(NonNull::new(ptr))
    }

    pub fn get(self) -> Option<NonNull<c_void>> {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_none()
    }
}

/// Handle to a GPU buffer owned by the render resource manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Debug, Clone, Copy, Default)]
pub struct MeshComponent {
    pub index_buffer: BufferHandle,
    pub vertex_buffer: BufferHandle,
    pub index_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RendererSingleton {
    pub renderer: OpaqueHandle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderDeviceSingleton {
    pub render_device: OpaqueHandle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderGraphSingleton {
    pub render_graph: OpaqueHandle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderResourceManagerSingleton {
    pub resource_manager: OpaqueHandle,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CameraMatricesSingleton {
    pub view: Mat4,
    pub projection: Mat4,
}

/// Event component requesting a model load from disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelLoadRequest {
    pub file_path: HashedString,
}
