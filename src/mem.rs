// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory pools, and the storage regions everything else uses.
//!
//! # Storage
//!
//! Objects that need a buffer (pools, queues, task stacks) take a [`Storage`]
//! saying where it comes from:
//!
//! - [`Storage::Pool`] draws it from the global allocator and returns it when
//!   the object is deleted with its kind's plain `*_delete`.
//! - [`Storage::External`] uses a buffer the caller set aside, typically a
//!   `static`. The object is deleted with `*_delete_static`, which hands the
//!   buffer back instead of freeing it.
//!
//! Using the wrong delete for the storage fails with [`Error::Param`] and
//! leaves the object alone.
//!
//! To have the global allocator itself be built from fixed-block pools, so
//! that "pool-backed" really means it, install a [`MemSpace`] as the
//! `#[global_allocator]`.
//!
//! # Pools
//!
//! A pool carves its region into `block_count` equal blocks on an intrusive
//! free list: each free block holds the index of the next. Allocation takes
//! the head of the list, so a block that was just freed is the next one
//! handed out.
//!
//! Blocks come back as [`Block`] values, which can't be copied, so a block
//! can't be freed twice from safe code. Freeing a block into a pool that
//! didn't issue it is a contract violation and faults the system, as does
//! finding the free list corrupted.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::alloc::{GlobalAlloc, Layout};
use core::cell::RefCell;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::{self, NonNull};

use crate::error::{Error, Fault, Result};
use crate::handle::{Arena, Handle};
use crate::list::{Order, WaitList};
use crate::os::{Object, Os, State, Turn};
use crate::port::{ContextId, Port};
use crate::time::Timeout;

/// Alignment of every region and block.
const ALIGN: usize = 8;

/// Where an object's buffer comes from.
#[derive(Debug)]
pub enum Storage {
    /// Allocate it; free it on delete.
    Pool,
    /// Use this caller-supplied buffer; give it back on static delete.
    External(&'static mut [u8]),
}

/// A buffer held by an object: either allocated by us or lent by the caller.
pub(crate) struct Region {
    base: NonNull<u8>,
    len: usize,
    source: Source,
}

#[derive(Copy, Clone)]
enum Source {
    Owned { words: usize },
    External { start: NonNull<u8>, len: usize },
}

// Safety: a Region is the only path to its memory, like the Box or &mut it
// was made from.
unsafe impl Send for Region {}

impl Region {
    /// Obtains `len` usable bytes, aligned to `ALIGN`.
    pub(crate) fn acquire(storage: Storage, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Param);
        }
        match storage {
            Storage::Pool => {
                let words = len.div_ceil(ALIGN);
                let mut v: Vec<u64> = Vec::new();
                v.try_reserve_exact(words).map_err(|_| Error::MemAllocFailure)?;
                v.resize(words, 0);
                let raw = Box::into_raw(v.into_boxed_slice());
                let base = NonNull::new(raw.cast::<u8>())
                    .ok_or(Error::MemAllocFailure)?;
                Ok(Self { base, len, source: Source::Owned { words } })
            }
            Storage::External(buf) => {
                let full = buf.len();
                let offset = buf.as_ptr().align_offset(ALIGN);
                if offset.checked_add(len).map_or(true, |need| need > full) {
                    return Err(Error::Param);
                }
                let start = NonNull::from(buf).cast::<u8>();
                // Safety: offset + len <= full, so this stays in the buffer.
                let base = unsafe { start.add(offset) };
                Ok(Self { base, len, source: Source::External { start, len: full } })
            }
        }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_external(&self) -> bool {
        matches!(self.source, Source::External { .. })
    }

    /// Gives back the caller's buffer, or `self` if we own the memory.
    pub(crate) fn into_external(self) -> core::result::Result<&'static mut [u8], Self> {
        match self.source {
            Source::External { start, len } => {
                let _ = ManuallyDrop::new(self);
                // Safety: this is the buffer we were lent in `acquire`, and
                // nothing else refers to it any more.
                Ok(unsafe { core::slice::from_raw_parts_mut(start.as_ptr(), len) })
            }
            Source::Owned { .. } => Err(self),
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Source::Owned { words } = self.source {
            let raw = ptr::slice_from_raw_parts_mut(self.base.as_ptr().cast::<u64>(), words);
            // Safety: this is the boxed slice leaked in `acquire`.
            drop(unsafe { Box::from_raw(raw) });
        }
    }
}

/// Sentinel ending the free list.
const NIL: u32 = u32::MAX;

/// A free list of equal-sized blocks over raw memory.
pub(crate) struct Blocks {
    base: NonNull<u8>,
    stride: usize,
    count: u32,
    head: u32,
    free: u32,
}

// Safety: Blocks only touches its own region, and only through &mut self.
unsafe impl Send for Blocks {}

impl Blocks {
    /// Distance between blocks for a requested block size: room for a link,
    /// rounded up to `ALIGN`.
    pub(crate) fn stride_for(block_size: usize) -> usize {
        block_size.max(4).next_multiple_of(ALIGN)
    }

    /// Threads every block onto the free list.
    ///
    /// # Safety
    ///
    /// `base` must be `ALIGN`-aligned and point to `stride * count` writable
    /// bytes that stay valid, and that nobody else touches except through
    /// blocks this hands out, for as long as the `Blocks` exists.
    pub(crate) unsafe fn new(base: NonNull<u8>, stride: usize, count: u32) -> Self {
        let mut blocks = Self { base, stride, count, head: NIL, free: 0 };
        for i in (0..count).rev() {
            blocks.link(i).write(blocks.head);
            blocks.head = i;
            blocks.free += 1;
        }
        blocks
    }

    fn link(&self, i: u32) -> LinkPtr {
        LinkPtr(self.block(i).cast::<u32>())
    }

    fn block(&self, i: u32) -> NonNull<u8> {
        // Safety: callers only pass i < count, which is inside the region.
        unsafe { self.base.add(i as usize * self.stride) }
    }

    pub(crate) fn count(&self) -> u32 {
        self.count
    }

    pub(crate) fn free(&self) -> u32 {
        self.free
    }

    /// Takes the block at the head of the free list.
    pub(crate) fn pop(&mut self) -> core::result::Result<Option<NonNull<u8>>, Fault> {
        if self.head == NIL {
            return Ok(None);
        }
        let i = self.head;
        let next = self.link(i).read();
        if (next != NIL && next >= self.count) || self.free == 0 {
            return Err(Fault::CorruptFreeList);
        }
        self.head = next;
        self.free -= 1;
        Ok(Some(self.block(i)))
    }

    /// Returns block `i` to the head of the free list.
    pub(crate) fn push(&mut self, i: u32) -> core::result::Result<(), Fault> {
        if self.free >= self.count {
            // More frees than blocks: something was freed twice.
            return Err(Fault::CorruptFreeList);
        }
        self.link(i).write(self.head);
        self.head = i;
        self.free += 1;
        Ok(())
    }

    /// Maps a block address back to its index, if it's one of ours.
    pub(crate) fn index_of(&self, p: *const u8) -> Option<u32> {
        let offset = (p as usize).checked_sub(self.base.as_ptr() as usize)?;
        if offset % self.stride != 0 {
            return None;
        }
        let i = offset / self.stride;
        (i < self.count as usize).then_some(i as u32)
    }
}

/// Pointer to the link word at the start of a free block.
struct LinkPtr(NonNull<u32>);

impl LinkPtr {
    fn read(&self) -> u32 {
        // Safety: links live at the aligned start of blocks inside the region.
        unsafe { self.0.as_ptr().read() }
    }

    fn write(&self, next: u32) {
        // Safety: as for read.
        unsafe { self.0.as_ptr().write(next) }
    }
}

/// One block allocated from a pool.
///
/// Deliberately not `Clone`: handing it back to
/// [`Os::mem_pool_free`] consumes it.
#[derive(Debug)]
pub struct Block {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a Block is the unique claim on its memory.
unsafe impl Send for Block {}

impl Block {
    /// Address of the block.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Address of the block, as a number.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Usable size: the pool's block size.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false; pools don't have zero-sized blocks.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Views the block's memory.
    ///
    /// # Safety
    ///
    /// The pool that issued the block must still exist. (The layer won't
    /// delete a pool with blocks outstanding, but it can't stop the `Os`
    /// itself from being dropped.)
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the block is len bytes inside a live pool, and &mut self
        // makes this the only view.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// A fixed-block memory pool object.
pub struct MemPool {
    name: &'static str,
    block_size: usize,
    blocks: Blocks,
    /// Free blocks promised to woken waiters.
    reserved: u32,
    waiters: WaitList,
    region: Region,
}

/// Handle to a [`MemPool`].
pub type MemPoolHandle = Handle<MemPool>;

impl fmt::Debug for MemPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemPool")
            .field("name", &self.name)
            .field("block_size", &self.block_size)
            .field("block_count", &self.blocks.count())
            .field("free", &self.blocks.free())
            .finish()
    }
}

fn pool_waiters(p: &mut MemPool) -> &mut WaitList {
    &mut p.waiters
}

impl MemPool {
    fn in_use(&self) -> u32 {
        self.blocks.count() - self.blocks.free()
    }

    fn take(&mut self) -> core::result::Result<Option<Block>, Fault> {
        let len = self.block_size;
        Ok(self.blocks.pop()?.map(|ptr| Block { ptr, len }))
    }

    /// Gives a freed block's reservation to the next waiter, if any.
    fn offer(&mut self, wake: &mut dyn FnMut(ContextId)) {
        if self.blocks.free() > self.reserved {
            if let Ok(ctx) = self.waiters.grant_next(()) {
                self.reserved += 1;
                wake(ctx);
            }
        }
    }

    fn check_delete(&self, external: bool) -> Result<()> {
        if self.in_use() > 0 {
            Err(Error::InstanceInUse)
        } else if self.region.is_external() != external {
            Err(Error::Param)
        } else {
            Ok(())
        }
    }
}

impl Object for MemPool {
    fn arena(state: &mut State) -> &mut Arena<Self> {
        &mut state.pools
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn forget(&mut self, ctx: ContextId, wake: &mut dyn FnMut(ContextId)) {
        if let Some(()) = self.waiters.withdraw(ctx) {
            self.reserved -= 1;
            self.offer(wake);
        }
    }

    fn close(&mut self, wake: &mut dyn FnMut(ContextId)) {
        self.waiters.drain(wake);
        self.reserved = 0;
    }
}

/// # Memory pools
impl<P: Port> Os<P> {
    /// Creates a pool of `block_count` blocks of `block_size` bytes.
    ///
    /// With [`Storage::External`], the buffer must hold the blocks after
    /// aligning to 8 bytes, with each block rounded up to a multiple of 8
    /// (and at least 8); otherwise this fails with `Param`. Whatever the
    /// failure, an external buffer is left as it was.
    pub fn mem_pool_create(
        &self,
        name: &'static str,
        block_size: usize,
        block_count: u32,
        storage: Storage,
    ) -> Result<MemPoolHandle> {
        if block_size == 0 || block_count == 0 || block_count == NIL {
            return Err(Error::Param);
        }
        let stride = Blocks::stride_for(block_size);
        let len = stride
            .checked_mul(block_count as usize)
            .ok_or(Error::Param)?;
        self.insert_with(name, || {
            let region = Region::acquire(storage, len)?;
            // Safety: the region is len bytes, aligned, and owned by the pool
            // these Blocks will live in.
            let blocks = unsafe { Blocks::new(region.base(), stride, block_count) };
            Ok(MemPool {
                name,
                block_size,
                blocks,
                reserved: 0,
                waiters: WaitList::new(Order::Fifo),
                region,
            })
        })
    }

    /// Deletes a pool created with [`Storage::Pool`], freeing its memory.
    ///
    /// Fails with `InstanceInUse` while any block is allocated.
    pub fn mem_pool_delete(&self, pool: MemPoolHandle) -> Result<()> {
        self.remove(pool, |p| p.check_delete(false)).map(drop)
    }

    /// Deletes a pool created with [`Storage::External`], returning the
    /// buffer.
    pub fn mem_pool_delete_static(
        &self,
        pool: MemPoolHandle,
    ) -> Result<&'static mut [u8]> {
        let p = self.remove(pool, |p| p.check_delete(true))?;
        p.region.into_external().map_err(|_| Error::Param)
    }

    /// Allocates a block, waiting up to `timeout` for one to be freed.
    ///
    /// Both an empty poll and an expired wait fail with `MemAllocFailure`.
    pub fn mem_pool_alloc(
        &self,
        pool: MemPoolHandle,
        timeout: Timeout,
    ) -> Result<Block> {
        let taken = self.block(
            pool,
            timeout,
            Error::MemAllocFailure,
            (),
            pool_waiters,
            |p, turn, _| match turn {
                Turn::Try(_) if p.blocks.free() > p.reserved => Ok(Some(p.take())),
                Turn::Try(_) => Ok(None),
                Turn::Granted(()) => {
                    p.reserved -= 1;
                    Ok(Some(p.take()))
                }
            },
        );
        match taken {
            Ok(Ok(Some(block))) => Ok(block),
            // A reserved block that isn't there means the books are wrong.
            Ok(Ok(None)) => self.fault(Fault::CorruptFreeList),
            Ok(Err(fault)) => self.fault(fault),
            Err(Error::Timeout) => Err(Error::MemAllocFailure),
            Err(e) => Err(e),
        }
    }

    /// Returns a block to the pool that issued it.
    ///
    /// A block from some other pool is a contract violation, and faults.
    pub fn mem_pool_free(&self, pool: MemPoolHandle, block: Block) -> Result<()> {
        let freed = self.modify(pool, |p, wake| {
            let Some(i) = p.blocks.index_of(block.as_ptr()) else {
                return Ok(Err(Fault::ForeignBlock));
            };
            if let Err(fault) = p.blocks.push(i) {
                return Ok(Err(fault));
            }
            p.offer(wake);
            Ok(Ok(()))
        })?;
        freed.unwrap_or_else(|fault| self.fault(fault));
        Ok(())
    }

    /// The pool's name.
    pub fn mem_pool_name(&self, pool: MemPoolHandle) -> Result<&'static str> {
        self.read(pool, |p| p.name)
    }

    /// Size of each block, as requested at creation.
    pub fn mem_pool_block_size(&self, pool: MemPoolHandle) -> Result<usize> {
        self.read(pool, |p| p.block_size)
    }

    /// Number of blocks in the pool.
    pub fn mem_pool_block_count(&self, pool: MemPoolHandle) -> Result<u32> {
        self.read(pool, |p| p.blocks.count())
    }

    /// Number of blocks currently allocated.
    pub fn mem_pool_in_use(&self, pool: MemPoolHandle) -> Result<u32> {
        self.read(pool, MemPool::in_use)
    }

    /// Finds a pool by name.
    pub fn mem_pool_find(&self, name: &str) -> Result<MemPoolHandle> {
        self.lookup(name)
    }
}

/// One zone of a [`MemSpace`]: `block_count` blocks of `block_size` bytes,
/// carved out of `region`.
#[derive(Debug)]
pub struct Zone {
    /// Largest allocation this zone serves.
    pub block_size: usize,
    /// Number of blocks.
    pub block_count: u32,
    /// Backing memory; must hold the blocks after 8-byte alignment.
    pub region: &'static mut [u8],
}

struct Carved {
    block_size: usize,
    blocks: Blocks,
}

/// A global allocator built from `N` fixed-block zones.
///
/// Each allocation comes from the zone with the smallest blocks that fit it,
/// moving up to larger zones when that one is exhausted. Alignments above 8
/// aren't supported and fail the allocation.
///
/// A corrupted zone, or a `dealloc` of memory no zone issued, is handed to
/// the fault hook given to [`new`](Self::new). The hook runs outside the
/// critical section and must not unwind: unwinding out of a global allocator
/// is undefined behavior. With the `std` feature, [`Default`] uses a hook
/// that aborts the process.
///
/// ```ignore
/// fn halt(_: Fault) -> ! {
///     loop {
///         cortex_m::asm::udf();
///     }
/// }
///
/// #[global_allocator]
/// static HEAP: MemSpace<3> = MemSpace::new(halt);
///
/// fn main() {
///     HEAP.initialize([
///         Zone { block_size: 32, block_count: 64, region: small },
///         Zone { block_size: 256, block_count: 16, region: medium },
///         Zone { block_size: 2048, block_count: 4, region: large },
///     ]).unwrap();
///     // ...
/// }
/// ```
pub struct MemSpace<const N: usize> {
    zones: critical_section::Mutex<RefCell<[Option<Carved>; N]>>,
    on_fault: fn(Fault) -> !,
}

impl<const N: usize> fmt::Debug for MemSpace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemSpace").field("zones", &N).finish_non_exhaustive()
    }
}

impl<const N: usize> MemSpace<N> {
    const EMPTY: Option<Carved> = None;

    /// Creates a space with no zones; allocation fails until
    /// [`initialize`](Self::initialize). `on_fault` is called, and must not
    /// return or unwind, if the allocator's books turn out to be wrong.
    pub const fn new(on_fault: fn(Fault) -> !) -> Self {
        Self {
            zones: critical_section::Mutex::new(RefCell::new([Self::EMPTY; N])),
            on_fault,
        }
    }

    /// Carves the zones. Only the first call succeeds; later ones fail with
    /// `InstanceDuplicate`.
    ///
    /// This must not allocate, since it may run before anything else can.
    pub fn initialize(&self, zones: [Zone; N]) -> Result<()> {
        let mut carved = [Self::EMPTY; N];
        for (slot, zone) in carved.iter_mut().zip(zones) {
            if zone.block_size == 0 || zone.block_count == 0 || zone.block_count == NIL {
                return Err(Error::Param);
            }
            let stride = Blocks::stride_for(zone.block_size);
            let len = stride
                .checked_mul(zone.block_count as usize)
                .ok_or(Error::Param)?;
            let offset = zone.region.as_ptr().align_offset(ALIGN);
            if offset.checked_add(len).map_or(true, |need| need > zone.region.len()) {
                return Err(Error::Param);
            }
            let start = NonNull::from(zone.region).cast::<u8>();
            // Safety: offset + len fits in the region, which is 'static and
            // now ours alone.
            let blocks = unsafe { Blocks::new(start.add(offset), stride, zone.block_count) };
            *slot = Some(Carved { block_size: zone.block_size, blocks });
        }
        carved.sort_unstable_by_key(|c| c.as_ref().map_or(usize::MAX, |c| c.block_size));

        critical_section::with(|cs| {
            let mut current = self.zones.borrow_ref_mut(cs);
            if current.iter().any(Option::is_some) {
                return Err(Error::InstanceDuplicate);
            }
            *current = carved;
            Ok(())
        })
    }
}

#[cfg(feature = "std")]
impl<const N: usize> Default for MemSpace<N> {
    fn default() -> Self {
        Self::new(abort_on_fault)
    }
}

#[cfg(feature = "std")]
fn abort_on_fault(_: Fault) -> ! {
    std::process::abort()
}

// Safety: blocks are handed out at most once until returned, are at least
// `layout.size()` bytes, and are aligned to ALIGN >= `layout.align()`.
unsafe impl<const N: usize> GlobalAlloc for MemSpace<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return ptr::null_mut();
        }
        let taken = critical_section::with(|cs| {
            let mut zones = self.zones.borrow_ref_mut(cs);
            for zone in zones.iter_mut().flatten() {
                if layout.size() > zone.block_size {
                    continue;
                }
                if let Some(p) = zone.blocks.pop()? {
                    return Ok(p.as_ptr());
                }
            }
            Ok(ptr::null_mut())
        });
        taken.unwrap_or_else(|fault| (self.on_fault)(fault))
    }

    unsafe fn dealloc(&self, p: *mut u8, _layout: Layout) {
        let freed = critical_section::with(|cs| {
            let mut zones = self.zones.borrow_ref_mut(cs);
            for zone in zones.iter_mut().flatten() {
                if let Some(i) = zone.blocks.index_of(p) {
                    return zone.blocks.push(i);
                }
            }
            Err(Fault::ForeignBlock)
        });
        if let Err(fault) = freed {
            (self.on_fault)(fault)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{leak_buffer, spawn_os, wait_until};
    use crate::task::TaskState;

    #[test]
    fn test_four_by_sixty_four() {
        let os = spawn_os();
        let pool = os.mem_pool_create("blocks", 64, 4, Storage::Pool).unwrap();

        let mut taken: Vec<Block> = (0..4)
            .map(|_| os.mem_pool_alloc(pool, Timeout::POLL).unwrap())
            .collect();
        assert_eq!(os.mem_pool_in_use(pool), Ok(4));

        // Disjoint, each 64 bytes.
        let mut addrs: Vec<usize> = taken.iter().map(Block::addr).collect();
        addrs.sort_unstable();
        for w in addrs.windows(2) {
            assert!(w[1] - w[0] >= 64);
        }

        assert_eq!(
            os.mem_pool_alloc(pool, Timeout::POLL).unwrap_err(),
            Error::MemAllocFailure,
        );

        let victim = taken.remove(2);
        let addr = victim.addr();
        os.mem_pool_free(pool, victim).unwrap();
        let again = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        assert_eq!(again.addr(), addr);
        assert!(os.mem_pool_in_use(pool).unwrap() <= 4);
    }

    #[test]
    fn test_alloc_timeout() {
        let os = spawn_os();
        let pool = os.mem_pool_create("", 16, 1, Storage::Pool).unwrap();
        let _only = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        let start = os.tick_count();
        assert_eq!(
            os.mem_pool_alloc(pool, Timeout::ticks(20)).unwrap_err(),
            Error::MemAllocFailure,
        );
        assert!(os.tick_count().ticks() >= start.ticks() + 20);
    }

    #[test]
    fn test_free_hands_block_to_waiter() {
        let os = spawn_os();
        let pool = os.mem_pool_create("handoff", 32, 1, Storage::Pool).unwrap();
        let held = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        let held_addr = held.addr();

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = os
            .task_create(crate::TaskSpec::new("waiter"), move || {
                let b = os.mem_pool_alloc(pool, Timeout::FOREVER).unwrap();
                tx.send(b.addr()).unwrap();
            })
            .unwrap();
        wait_until(|| os.task_state(waiter) == Ok(TaskState::Blocked));

        os.mem_pool_free(pool, held).unwrap();
        // The waiter was promised the block, so a poll can't take it.
        assert_eq!(
            os.mem_pool_alloc(pool, Timeout::POLL).unwrap_err(),
            Error::MemAllocFailure,
        );
        assert_eq!(rx.recv().unwrap(), held_addr);
    }

    #[test]
    fn test_external_storage_round_trip() {
        let os = spawn_os();
        let buf = leak_buffer(4 * 64 + 8);
        let buf_addr = buf.as_ptr() as usize;
        let pool = os
            .mem_pool_create("ext", 64, 4, Storage::External(buf))
            .unwrap();
        let b = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        assert!(b.addr() >= buf_addr && b.addr() < buf_addr + 4 * 64 + 8);

        assert_eq!(os.mem_pool_delete_static(pool).unwrap_err(), Error::InstanceInUse);
        os.mem_pool_free(pool, b).unwrap();
        assert_eq!(os.mem_pool_delete(pool).unwrap_err(), Error::Param);
        let back = os.mem_pool_delete_static(pool).unwrap();
        assert_eq!(back.as_ptr() as usize, buf_addr);
        assert_eq!(os.mem_pool_in_use(pool).unwrap_err(), Error::InstanceInvalid);
    }

    #[test]
    fn test_external_storage_too_small() {
        let os = spawn_os();
        let buf = leak_buffer(64);
        assert_eq!(
            os.mem_pool_create("small", 64, 4, Storage::External(buf)).unwrap_err(),
            Error::Param,
        );
    }

    #[test]
    fn test_bad_geometry() {
        let os = spawn_os();
        assert_eq!(os.mem_pool_create("", 0, 4, Storage::Pool).unwrap_err(), Error::Param);
        assert_eq!(os.mem_pool_create("", 8, 0, Storage::Pool).unwrap_err(), Error::Param);
    }

    #[test]
    fn test_accessors_and_find() {
        let os = spawn_os();
        let pool = os.mem_pool_create("named", 10, 3, Storage::Pool).unwrap();
        assert_eq!(os.mem_pool_name(pool), Ok("named"));
        assert_eq!(os.mem_pool_block_size(pool), Ok(10));
        assert_eq!(os.mem_pool_block_count(pool), Ok(3));
        assert_eq!(os.mem_pool_find("named"), Ok(pool));
        assert_eq!(os.mem_pool_find("nope"), Err(Error::InstanceNotFound));
        assert_eq!(
            os.mem_pool_create("named", 10, 3, Storage::Pool).unwrap_err(),
            Error::InstanceDuplicate,
        );
        os.mem_pool_delete(pool).unwrap();
        assert_eq!(os.mem_pool_find("named"), Err(Error::InstanceNotFound));
    }

    #[test]
    #[should_panic(expected = "kernel fault")]
    fn test_foreign_block_faults() {
        let os = spawn_os();
        let a = os.mem_pool_create("a", 16, 2, Storage::Pool).unwrap();
        let b = os.mem_pool_create("b", 16, 2, Storage::Pool).unwrap();
        let block = os.mem_pool_alloc(a, Timeout::POLL).unwrap();
        let _ = os.mem_pool_free(b, block);
    }

    #[test]
    fn test_blocks_detect_overfree() {
        let region = leak_buffer(64);
        let start = NonNull::from(region).cast::<u8>();
        let offset = start.as_ptr().align_offset(ALIGN);
        let mut blocks = unsafe { Blocks::new(start.add(offset), 8, 2) };
        let p = blocks.pop().unwrap().unwrap();
        let i = blocks.index_of(p.as_ptr()).unwrap();
        blocks.push(i).unwrap();
        assert_eq!(blocks.push(i), Err(Fault::CorruptFreeList));
        assert_eq!(blocks.index_of(unsafe { p.as_ptr().add(1) }), None);
    }

    #[test]
    fn test_mem_space_picks_smallest_fit() {
        let space = MemSpace::<2>::default();
        space
            .initialize([
                Zone { block_size: 128, block_count: 1, region: leak_buffer(136) },
                Zone { block_size: 16, block_count: 2, region: leak_buffer(40) },
            ])
            .unwrap();

        let small = Layout::from_size_align(10, 4).unwrap();
        unsafe {
            let a = space.alloc(small);
            let b = space.alloc(small);
            // Small zone exhausted; falls through to the big one.
            let c = space.alloc(small);
            assert!(!a.is_null() && !b.is_null() && !c.is_null());
            // Nothing left anywhere.
            assert!(space.alloc(small).is_null());
            space.dealloc(b, small);
            assert_eq!(space.alloc(small), b);
            // Too big for any zone.
            assert!(space.alloc(Layout::from_size_align(200, 8).unwrap()).is_null());
        }

        let again = space.initialize([
            Zone { block_size: 8, block_count: 1, region: leak_buffer(16) },
            Zone { block_size: 8, block_count: 1, region: leak_buffer(16) },
        ]);
        assert_eq!(again, Err(Error::InstanceDuplicate));
    }

    static CAUGHT: std::sync::Mutex<Option<Fault>> = std::sync::Mutex::new(None);

    fn record_and_hang(fault: Fault) -> ! {
        *CAUGHT.lock().unwrap() = Some(fault);
        loop {
            std::thread::park();
        }
    }

    #[test]
    fn test_mem_space_foreign_dealloc_goes_to_hook() {
        static SPACE: MemSpace<1> = MemSpace::new(record_and_hang);
        SPACE
            .initialize([Zone { block_size: 16, block_count: 1, region: leak_buffer(24) }])
            .unwrap();
        let stranger = leak_buffer(16).as_mut_ptr() as usize;
        // The hook never returns, so give it a thread to keep.
        std::thread::spawn(move || unsafe {
            SPACE.dealloc(stranger as *mut u8, Layout::from_size_align(16, 8).unwrap());
        });
        wait_until(|| *CAUGHT.lock().unwrap() == Some(Fault::ForeignBlock));
    }

    #[test]
    fn test_refused_create_leaves_buffer_untouched() {
        let os = spawn_os();
        os.mem_pool_create("taken", 8, 1, Storage::Pool).unwrap();
        let buf = leak_buffer(4 * 64 + 8);
        buf.fill(0xA5);
        let (ptr, len) = (buf.as_mut_ptr(), buf.len());
        assert_eq!(
            os.mem_pool_create("taken", 64, 4, Storage::External(buf)).unwrap_err(),
            Error::InstanceDuplicate,
        );

        // Safety: the refused create kept nothing pointing into the buffer.
        let buf = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
        assert!(buf.iter().all(|&b| b == 0xA5));
        let pool = os.mem_pool_create("second", 64, 4, Storage::External(buf)).unwrap();
        assert_eq!(os.mem_pool_block_count(pool), Ok(4));
    }

    #[test]
    fn test_deleting_woken_allocator_returns_its_block() {
        let os = spawn_os();
        let pool = os.mem_pool_create("one", 16, 1, Storage::Pool).unwrap();
        let held = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        let t = os
            .task_create(crate::TaskSpec::new("waiter"), move || {
                let _ = os.mem_pool_alloc(pool, Timeout::FOREVER);
            })
            .unwrap();
        wait_until(|| os.task_state(t) == Ok(TaskState::Blocked));

        os.task_suspend(t).unwrap();
        os.mem_pool_free(pool, held).unwrap();
        assert_eq!(
            os.mem_pool_alloc(pool, Timeout::POLL).unwrap_err(),
            Error::MemAllocFailure,
        );

        os.task_delete(t).unwrap();
        let again = os.mem_pool_alloc(pool, Timeout::POLL).unwrap();
        assert_eq!(os.mem_pool_in_use(pool), Ok(1));
        os.mem_pool_free(pool, again).unwrap();
    }
}
