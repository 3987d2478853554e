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

//! Named TLSF heap pools.
//!
//! Each pool is one contiguous region carved into blocks tracked by
//! two-level segregated free lists. Handles are cheap clones that share the
//! pool; only the owning handle may shut it down, and a non-forced shutdown
//! reports leaks.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::{EcsError, Result};
use crate::memory::{align_up, DEFAULT_HEAP_SIZE};

/// All payloads are at least this aligned.
const BLOCK_ALIGN: usize = 16;

/// Block header size, rounded so payloads stay 16-aligned.
const HEADER_SIZE: usize = 48;

/// Smallest payload a block may carry.
const MIN_PAYLOAD: usize = 32;

/// Sizes below this threshold map linearly into the first-level-zero bucket.
const SMALL_THRESHOLD: usize = 256;

const SL_COUNT: usize = 16;
const FL_COUNT: usize = 40;

/// Per-pool usage counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryStats {
    /// Bytes currently handed out (block payload capacities).
    pub allocated_bytes: usize,
    /// Highest value `allocated_bytes` ever reached.
    pub peak_bytes: usize,
    /// Number of live allocations.
    pub live_allocations: usize,
    /// Total allocations served over the pool's lifetime.
    pub total_allocations: u64,
}

#[repr(C)]
struct BlockHeader {
    /// Payload capacity in bytes, always a multiple of 16.
    size: usize,
    /// Physical predecessor in the pool, null for the first block.
    prev_phys: *mut BlockHeader,
    free: bool,
    next_free: *mut BlockHeader,
    prev_free: *mut BlockHeader,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() <= HEADER_SIZE);

struct TlsfPool {
    memory: NonNull<u8>,
    pool_size: usize,
    fl_bitmap: u64,
    sl_bitmap: [u16; FL_COUNT],
    free_lists: [[*mut BlockHeader; SL_COUNT]; FL_COUNT],
    stats: MemoryStats,
    shut_down: bool,
}

// The pool owns its region exclusively; raw pointers never escape the mutex.
unsafe impl Send for TlsfPool {}

fn mapping_insert(size: usize) -> (usize, usize) {
    if size < SMALL_THRESHOLD {
        (0, size / BLOCK_ALIGN)
    } else {
        let msb = usize::BITS as usize - 1 - size.leading_zeros() as usize;
        let fl = msb - 7;
        let sl = (size >> (msb - 4)) & (SL_COUNT - 1);
        if fl >= FL_COUNT {
            (FL_COUNT - 1, SL_COUNT - 1)
        } else {
            (fl, sl)
        }
    }
}

fn mapping_search(size: usize) -> (usize, usize) {
    if size < SMALL_THRESHOLD {
        (0, size / BLOCK_ALIGN)
    } else {
        let msb = usize::BITS as usize - 1 - size.leading_zeros() as usize;
        // Round up so every block in the reported class fits the request.
        let rounded = size + (1usize << (msb - 4)) - 1;
        mapping_insert(rounded)
    }
}

impl TlsfPool {
    fn new(size: usize) -> Self {
        let pool_size = align_up(size.max(HEADER_SIZE + MIN_PAYLOAD), BLOCK_ALIGN);
        let layout = Layout::from_size_align(pool_size, BLOCK_ALIGN).expect("pool layout");
        let memory = unsafe { std::alloc::alloc(layout) };
        let memory = NonNull::new(memory).expect("pool backing allocation failed");

        let mut pool = Self {
            memory,
            pool_size,
            fl_bitmap: 0,
            sl_bitmap: [0; FL_COUNT],
            free_lists: [[ptr::null_mut(); SL_COUNT]; FL_COUNT],
            stats: MemoryStats::default(),
            shut_down: false,
        };

        unsafe {
            let first = memory.as_ptr() as *mut BlockHeader;
            (*first).size = pool_size - HEADER_SIZE;
            (*first).prev_phys = ptr::null_mut();
            (*first).free = false;
            (*first).next_free = ptr::null_mut();
            (*first).prev_free = ptr::null_mut();
            pool.insert_free(first);
        }
        pool
    }

    fn pool_end(&self) -> *mut u8 {
        unsafe { self.memory.as_ptr().add(self.pool_size) }
    }

    unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
        (block as *mut u8).add(HEADER_SIZE)
    }

    unsafe fn next_phys(&self, block: *mut BlockHeader) -> *mut BlockHeader {
        let end = Self::payload(block).add((*block).size);
        if end >= self.pool_end() {
            ptr::null_mut()
        } else {
            end as *mut BlockHeader
        }
    }

    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert((*block).size);
        let head = self.free_lists[fl][sl];
        (*block).free = true;
        (*block).next_free = head;
        (*block).prev_free = ptr::null_mut();
        if !head.is_null() {
            (*head).prev_free = block;
        }
        self.free_lists[fl][sl] = block;
        self.sl_bitmap[fl] |= 1 << sl;
        self.fl_bitmap |= 1 << fl;
    }

    unsafe fn remove_free(&mut self, block: *mut BlockHeader) {
        let (fl, sl) = mapping_insert((*block).size);
        let prev = (*block).prev_free;
        let next = (*block).next_free;
        if !prev.is_null() {
            (*prev).next_free = next;
        } else {
            self.free_lists[fl][sl] = next;
        }
        if !next.is_null() {
            (*next).prev_free = prev;
        }
        if self.free_lists[fl][sl].is_null() {
            self.sl_bitmap[fl] &= !(1 << sl);
            if self.sl_bitmap[fl] == 0 {
                self.fl_bitmap &= !(1 << fl);
            }
        }
        (*block).free = false;
        (*block).next_free = ptr::null_mut();
        (*block).prev_free = ptr::null_mut();
    }

    fn find_suitable(&self, size: usize) -> *mut BlockHeader {
        let (fl, sl) = mapping_search(size);
        if fl >= FL_COUNT {
            return ptr::null_mut();
        }

        let sl_map = self.sl_bitmap[fl] & (u16::MAX << sl);
        if sl_map != 0 {
            let sl_hit = sl_map.trailing_zeros() as usize;
            return self.free_lists[fl][sl_hit];
        }

        if fl + 1 >= FL_COUNT {
            return ptr::null_mut();
        }
        let fl_map = self.fl_bitmap & (u64::MAX << (fl + 1));
        if fl_map == 0 {
            return ptr::null_mut();
        }
        let fl_hit = fl_map.trailing_zeros() as usize;
        let sl_hit = self.sl_bitmap[fl_hit].trailing_zeros() as usize;
        self.free_lists[fl_hit][sl_hit]
    }

    fn allocate(&mut self, size: usize, alignment: usize) -> Option<NonNull<u8>> {
        assert!(!self.shut_down, "allocation from a shut-down heap pool");
        let alignment = alignment.max(BLOCK_ALIGN);
        debug_assert!(alignment.is_power_of_two());

        // Slack for the back-pointer word plus worst-case alignment padding.
        let needed = align_up(size + alignment + BLOCK_ALIGN, BLOCK_ALIGN).max(MIN_PAYLOAD);

        let block = self.find_suitable(needed);
        if block.is_null() {
            return None;
        }

        unsafe {
            self.remove_free(block);

            if (*block).size >= needed + HEADER_SIZE + MIN_PAYLOAD {
                let remaining = (*block).size - needed - HEADER_SIZE;
                (*block).size = needed;
                let split = Self::payload(block).add(needed) as *mut BlockHeader;
                (*split).size = remaining;
                (*split).prev_phys = block;
                (*split).free = false;
                (*split).next_free = ptr::null_mut();
                (*split).prev_free = ptr::null_mut();
                let after = self.next_phys(split);
                if !after.is_null() {
                    (*after).prev_phys = split;
                }
                self.insert_free(split);
            }

            let payload = Self::payload(block);
            let user = align_up(payload as usize + std::mem::size_of::<usize>(), alignment) as *mut u8;
            debug_assert!(user.add(size) <= payload.add((*block).size));
            // Back-pointer to the header lives in the word before the payload.
            (user as *mut *mut BlockHeader).sub(1).write(block);

            self.stats.allocated_bytes += (*block).size;
            self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.allocated_bytes);
            self.stats.live_allocations += 1;
            self.stats.total_allocations += 1;

            Some(NonNull::new_unchecked(user))
        }
    }

    unsafe fn header_of(ptr: *mut u8) -> *mut BlockHeader {
        (ptr as *mut *mut BlockHeader).sub(1).read()
    }

    fn deallocate(&mut self, user: *mut u8) {
        if user.is_null() {
            return;
        }
        unsafe {
            let mut block = Self::header_of(user);
            debug_assert!(!(*block).free, "double free in heap pool");

            self.stats.allocated_bytes -= (*block).size;
            self.stats.live_allocations -= 1;

            // Coalesce with the physical successor.
            let next = self.next_phys(block);
            if !next.is_null() && (*next).free {
                self.remove_free(next);
                (*block).size += HEADER_SIZE + (*next).size;
                let after = self.next_phys(block);
                if !after.is_null() {
                    (*after).prev_phys = block;
                }
            }

            // Coalesce with the physical predecessor.
            let prev = (*block).prev_phys;
            if !prev.is_null() && (*prev).free {
                self.remove_free(prev);
                (*prev).size += HEADER_SIZE + (*block).size;
                block = prev;
                let after = self.next_phys(block);
                if !after.is_null() {
                    (*after).prev_phys = block;
                }
            }

            self.insert_free(block);
        }
    }

    /// Bytes usable from `user` to the end of its block.
    fn usable_size(&self, user: *mut u8) -> usize {
        unsafe {
            let block = Self::header_of(user);
            let end = Self::payload(block).add((*block).size);
            end as usize - user as usize
        }
    }
}

impl Drop for TlsfPool {
    fn drop(&mut self) {
        if !self.shut_down && self.stats.live_allocations > 0 {
            tracing::warn!(
                outstanding = self.stats.live_allocations,
                "heap pool dropped with live allocations"
            );
        }
        let layout = Layout::from_size_align(self.pool_size, BLOCK_ALIGN).expect("pool layout");
        unsafe { std::alloc::dealloc(self.memory.as_ptr(), layout) };
    }
}

struct HeapShared {
    name: String,
    total_size: usize,
    pool: Mutex<TlsfPool>,
}

/// Handle to a named TLSF pool.
///
/// Clones share the underlying pool; only the handle returned by [`HeapAllocator::new`]
/// owns it and may call [`HeapAllocator::shutdown`].
pub struct HeapAllocator {
    shared: Arc<HeapShared>,
    owner: bool,
}

impl HeapAllocator {
    pub fn new(name: &str, size: usize) -> Self {
        tracing::debug!(name, size, "creating heap pool");
        Self {
            shared: Arc::new(HeapShared {
                name: name.to_string(),
                total_size: size,
                pool: Mutex::new(TlsfPool::new(size)),
            }),
            owner: true,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn total_size(&self) -> usize {
        self.shared.total_size
    }

    pub fn allocate(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.shared
            .pool
            .lock()
            .allocate(size, alignment)
            .ok_or_else(|| EcsError::OutOfMemory {
                allocator: self.shared.name.clone(),
            })
    }

    pub fn reallocate(&self, original: *mut u8, size: usize) -> Result<NonNull<u8>> {
        if original.is_null() {
            return self.allocate(size, BLOCK_ALIGN);
        }
        let mut pool = self.shared.pool.lock();
        let usable = pool.usable_size(original);
        if size <= usable {
            // SAFETY: `original` came out of this pool and is still live.
            return Ok(unsafe { NonNull::new_unchecked(original) });
        }
        let fresh = pool.allocate(size, BLOCK_ALIGN).ok_or_else(|| EcsError::OutOfMemory {
            allocator: self.shared.name.clone(),
        })?;
        unsafe {
            ptr::copy_nonoverlapping(original, fresh.as_ptr(), usable.min(size));
        }
        pool.deallocate(original);
        Ok(fresh)
    }

    pub fn deallocate(&self, ptr: *mut u8) {
        self.shared.pool.lock().deallocate(ptr);
    }

    /// Disposes of the pool. With `force == false`, fails with
    /// [`EcsError::LeakDetected`] if any allocation is still live.
    pub fn shutdown(&self, force: bool) -> Result<()> {
        assert!(self.owner, "only the owning handle may shut down a heap pool");
        let mut pool = self.shared.pool.lock();
        let outstanding = pool.stats.live_allocations;
        if !force && outstanding > 0 {
            tracing::warn!(
                allocator = %self.shared.name,
                outstanding,
                "leak detected at heap shutdown"
            );
            return Err(EcsError::LeakDetected {
                allocator: self.shared.name.clone(),
                outstanding,
            });
        }
        pool.shut_down = true;
        Ok(())
    }

    pub fn stats(&self) -> MemoryStats {
        self.shared.pool.lock().stats
    }

    pub fn live_allocations(&self) -> usize {
        self.shared.pool.lock().stats.live_allocations
    }
}

impl Clone for HeapAllocator {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            owner: false,
        }
    }
}

impl std::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("name", &self.shared.name)
            .field("total_size", &self.shared.total_size)
            .field("owner", &self.owner)
            .finish()
    }
}

static HEAP_REGISTRY: OnceLock<Mutex<AHashMap<String, HeapAllocator>>> = OnceLock::new();

fn registry() -> &'static Mutex<AHashMap<String, HeapAllocator>> {
    HEAP_REGISTRY.get_or_init(|| Mutex::new(AHashMap::new()))
}

/// Registers a named pool, creating it on first call. Re-registering the same
/// name with a different size is a [`EcsError::DuplicateRegistration`].
pub fn register_heap(name: &str, size: usize) -> Result<HeapAllocator> {
    let mut heaps = registry().lock();
    if let Some(existing) = heaps.get(name) {
        if existing.total_size() != size {
            return Err(EcsError::DuplicateRegistration(name.to_string()));
        }
        return Ok(existing.clone());
    }
    let heap = HeapAllocator::new(name, size);
    let handle = heap.clone();
    heaps.insert(name.to_string(), heap);
    Ok(handle)
}

/// The process-wide main pool ("MainAllocator"), created on first access.
pub fn global_allocator() -> HeapAllocator {
    register_heap("MainAllocator", DEFAULT_HEAP_SIZE).expect("main allocator registration")
}
