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

//! Linear scratch allocator for temporary allocations.
//!
//! Allocation is a pointer bump, individual deallocation is a no-op, and
//! scoped markers rewind the cursor on drop. `FrameScratch` provides one
//! lazily-created instance per thread, all of which `reset_frame` rewinds.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EcsError, Result};
use crate::memory::{align_up, DEFAULT_FRAME_SCRATCH_SIZE};

const DEFAULT_ALIGNMENT: usize = 16;

pub struct ScratchAllocator {
    buffer: NonNull<u8>,
    size: usize,
    cursor: AtomicUsize,
    high_water: AtomicUsize,
    live_markers: AtomicUsize,
    name: &'static str,
}

// A scratch allocator is used by one thread at a time; the registry only
// rewinds cursors at frame boundaries.
unsafe impl Send for ScratchAllocator {}
unsafe impl Sync for ScratchAllocator {}

impl ScratchAllocator {
    pub fn new(size: usize, name: &'static str) -> Self {
        let layout = Layout::from_size_align(size.max(DEFAULT_ALIGNMENT), DEFAULT_ALIGNMENT)
            .expect("scratch layout");
        let buffer = unsafe { std::alloc::alloc(layout) };
        Self {
            buffer: NonNull::new(buffer).expect("scratch backing allocation failed"),
            size,
            cursor: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            live_markers: AtomicUsize::new(0),
            name,
        }
    }

    /// Pointer-bump allocation with default 16-byte alignment.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, DEFAULT_ALIGNMENT)
    }

    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        debug_assert!(alignment.is_power_of_two());
        let current = self.cursor.load(Ordering::Relaxed);
        let base = self.buffer.as_ptr() as usize;
        let aligned = align_up(base + current, alignment) - base;
        let end = aligned.checked_add(size).ok_or_else(|| self.oom())?;
        if end > self.size {
            return Err(self.oom());
        }
        self.cursor.store(end, Ordering::Relaxed);
        self.high_water.fetch_max(end, Ordering::Relaxed);
        // SAFETY: `aligned` is in bounds of the backing buffer.
        Ok(unsafe { NonNull::new_unchecked(self.buffer.as_ptr().add(aligned)) })
    }

    fn oom(&self) -> EcsError {
        EcsError::OutOfMemory {
            allocator: self.name.to_string(),
        }
    }

    /// Copies `src` into scratch storage and returns the mutable copy.
    pub fn alloc_slice_copy<'a, T: Copy>(&'a self, src: &[T]) -> Result<&'a mut [T]> {
        let ptr = self
            .allocate_aligned(std::mem::size_of_val(src), std::mem::align_of::<T>())?
            .cast::<T>();
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), src.len()))
        }
    }

    /// Allocates a slice of `len` copies of `value`.
    pub fn alloc_slice_fill<'a, T: Copy>(&'a self, len: usize, value: T) -> Result<&'a mut [T]> {
        let ptr = self
            .allocate_aligned(len * std::mem::size_of::<T>(), std::mem::align_of::<T>())?
            .cast::<T>();
        unsafe {
            for i in 0..len {
                ptr.as_ptr().add(i).write(value);
            }
            Ok(std::slice::from_raw_parts_mut(ptr.as_ptr(), len))
        }
    }

    /// Individual deallocation is a no-op; use markers or `reset`.
    pub fn deallocate(&self, _ptr: *mut u8) {}

    /// Records the current cursor; dropping the marker rewinds to it.
    /// Markers must drop in reverse creation order.
    pub fn marker(&self) -> ScratchMarker<'_> {
        self.live_markers.fetch_add(1, Ordering::Relaxed);
        ScratchMarker {
            allocator: self,
            position: self.cursor.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    pub fn bytes_used(&self) -> usize {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn bytes_remaining(&self) -> usize {
        self.size - self.bytes_used()
    }

    pub fn total_size(&self) -> usize {
        self.size
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn owns(&self, ptr: *const u8) -> bool {
        let base = self.buffer.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.size
    }
}

impl Drop for ScratchAllocator {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.size.max(DEFAULT_ALIGNMENT), DEFAULT_ALIGNMENT)
                .expect("scratch layout");
        unsafe { std::alloc::dealloc(self.buffer.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for ScratchAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchAllocator")
            .field("name", &self.name)
            .field("bytes_used", &self.bytes_used())
            .field("total_size", &self.size)
            .finish()
    }
}

/// RAII cursor snapshot; restores the allocator to its recorded position on drop.
pub struct ScratchMarker<'a> {
    allocator: &'a ScratchAllocator,
    position: usize,
}

impl Drop for ScratchMarker<'_> {
    fn drop(&mut self) {
        debug_assert!(
            self.position <= self.allocator.cursor.load(Ordering::Relaxed),
            "scratch markers dropped out of order"
        );
        self.allocator.cursor.store(self.position, Ordering::Relaxed);
        self.allocator.live_markers.fetch_sub(1, Ordering::Relaxed);
    }
}

static FRAME_REGISTRY: Mutex<Vec<Arc<ScratchAllocator>>> = Mutex::new(Vec::new());

thread_local! {
    static FRAME_ALLOCATOR: Arc<ScratchAllocator> = {
        let allocator = Arc::new(ScratchAllocator::new(
            DEFAULT_FRAME_SCRATCH_SIZE,
            "FrameScratch",
        ));
        FRAME_REGISTRY.lock().push(Arc::clone(&allocator));
        allocator
    };
}

/// Thread-local frame scratch with a process-wide registry.
pub struct FrameScratch;

impl FrameScratch {
    /// Runs `f` against the calling thread's frame allocator, creating and
    /// registering it on first use.
    pub fn with<R>(f: impl FnOnce(&ScratchAllocator) -> R) -> R {
        FRAME_ALLOCATOR.with(|allocator| f(allocator))
    }

    /// Rewinds every registered thread-local allocator. A live marker pins
    /// its allocator: that thread is mid-scope and is skipped.
    pub fn reset_frame() {
        for allocator in FRAME_REGISTRY.lock().iter() {
            if allocator.live_markers.load(Ordering::Relaxed) == 0 {
                allocator.reset();
            }
        }
    }
}
