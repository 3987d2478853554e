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

//! Custom allocator primitives: TLSF heap pools and linear scratch memory.

pub mod heap;
pub mod scratch;

pub use heap::{global_allocator, register_heap, HeapAllocator, MemoryStats};
pub use scratch::{FrameScratch, ScratchAllocator, ScratchMarker};

pub const KB: usize = 1024;
pub const MB: usize = 1024 * 1024;

/// Default size of the process-wide main heap pool.
pub const DEFAULT_HEAP_SIZE: usize = 32 * MB;

/// Default size of the GPU staging heap pool.
pub const GPU_HEAP_SIZE: usize = 128 * MB;

/// Default size of each thread's frame scratch buffer.
pub const DEFAULT_FRAME_SCRATCH_SIZE: usize = 32 * MB;

pub(crate) const fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}
