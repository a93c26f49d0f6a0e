//! Shared-memory region backing one ring buffer.
//!
//! The whole protocol state lives inside a single anonymous
//! `MAP_SHARED` mapping created by the controller before worker
//! processes fork, so every endpoint in every process addresses the
//! same atomics. Layout of the region:
//!
//! ```text
//! +----------------------------------------------------------+
//! |  RegionHeader (4 cache lines)                            |
//! |  +- line 0: magic, version, geometry, group count        |
//! |  +- line 1: protocol lock, paused/shutdown flags         |
//! |  +- line 2: next_sequence, events_total                  |
//! |  +- line 3: rate meter state                             |
//! +----------------------------------------------------------+
//! |  SlotMeta[N]      (sequence, state, ready_count)         |
//! |  free queue       (QueueHeader + N index ring)           |
//! |  ready queues     (MAX_READER_GROUPS x same)             |
//! |  snapshot cell    (SnapshotHeader + one slot payload)    |
//! |  slot storage     (N x slot_stride bytes)                |
//! +----------------------------------------------------------+
//! ```
//!
//! Queue contents and the sequence counter are only touched while the
//! header's lock word is held; the flags, meters, and the snapshot
//! cell are read lock-free.

use std::hint;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use crate::constants::{
    CACHE_LINE_SIZE, MAX_READER_GROUPS, MAX_SLOTS, REGION_MAGIC, REGION_VERSION,
};
use crate::error::{Result, SluiceError};

/// Slot lifecycle states stored in `SlotMeta::state`.
///
/// "In read" is a per-group condition (one group can hold a slot while
/// it is still queued for another), so it has no slot-wide state word;
/// `ready_count` tracks it instead.
pub(crate) const SLOT_FREE: u32 = 0;
pub(crate) const SLOT_IN_WRITE: u32 = 1;
pub(crate) const SLOT_PUBLISHED: u32 = 2;

/// Region header, one per buffer, at offset 0 of the mapping.
#[repr(C, align(64))]
pub(crate) struct RegionHeader {
    // Cache line 0: identity and geometry (written once at creation)
    pub magic: AtomicU64,
    pub version: AtomicU32,
    pub slots: AtomicU32,
    pub channels: AtomicU32,
    pub slot_bytes: AtomicU32,
    pub n_groups: AtomicU32,
    _pad0: [u8; 36],

    // Cache line 1: protocol lock and run flags
    pub lock: AtomicU32,
    pub paused: AtomicU32,
    pub shutdown: AtomicU32,
    /// Set at the first commit; reader-group registration is rejected
    /// afterwards.
    pub setup_closed: AtomicU32,
    _pad1: [u8; 48],

    // Cache line 2: sequencing (guarded by `lock`)
    pub next_sequence: AtomicU64,
    pub events_total: AtomicU64,
    _pad2: [u8; 48],

    // Cache line 3: rate meter (written by the status sampler only)
    pub rate_bits: AtomicU64,
    pub sample_micros: AtomicU64,
    pub sample_events: AtomicU64,
    _pad3: [u8; 40],
}

const_assert_eq!(std::mem::size_of::<RegionHeader>(), 4 * CACHE_LINE_SIZE);

/// Per-slot metadata.
#[repr(C)]
pub(crate) struct SlotMeta {
    /// Sequence assigned at commit; 0 while never committed.
    pub sequence: AtomicU64,
    pub state: AtomicU32,
    /// Reader groups that have not yet released this publication.
    pub ready_count: AtomicU32,
}

const_assert_eq!(std::mem::size_of::<SlotMeta>(), 16);

/// Fixed-capacity FIFO of slot indices. The ring of `AtomicU32`
/// entries follows the header directly. All mutation happens under the
/// region lock; `len` alone is read lock-free for status snapshots.
#[repr(C)]
pub(crate) struct QueueHeader {
    pub len: AtomicU32,
    pub head: AtomicU32,
    pub capacity: AtomicU32,
    _pad: u32,
}

const_assert_eq!(std::mem::size_of::<QueueHeader>(), 16);

/// Seqlock header of the observer snapshot cell. `stamp` is even when
/// the payload is stable, odd mid-write, and 0 before the first
/// commit. The payload bytes follow the header.
#[repr(C)]
pub(crate) struct SnapshotHeader {
    pub stamp: AtomicU64,
    pub sequence: AtomicU64,
}

const_assert_eq!(std::mem::size_of::<SnapshotHeader>(), 16);

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Byte offsets of every section of the region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RegionMap {
    pub slots: usize,
    pub slot_bytes: usize,
    pub slot_stride: usize,
    pub meta_off: usize,
    pub free_q_off: usize,
    pub ready_q_off: usize,
    pub queue_stride: usize,
    pub snap_off: usize,
    pub data_off: usize,
    pub len: usize,
}

impl RegionMap {
    pub fn compute(slots: usize, slot_bytes: usize) -> Self {
        let slot_stride = align8(slot_bytes);
        let meta_off = std::mem::size_of::<RegionHeader>();
        let free_q_off = align8(meta_off + slots * std::mem::size_of::<SlotMeta>());
        let queue_stride = align8(std::mem::size_of::<QueueHeader>() + slots * 4);
        let ready_q_off = free_q_off + queue_stride;
        let snap_off = ready_q_off + MAX_READER_GROUPS * queue_stride;
        let data_off = align8(snap_off + std::mem::size_of::<SnapshotHeader>() + slot_stride);
        let len = data_off + slots * slot_stride;
        Self {
            slots,
            slot_bytes,
            slot_stride,
            meta_off,
            free_q_off,
            ready_q_off,
            queue_stride,
            snap_off,
            data_off,
            len,
        }
    }
}

/// Anonymous shared mapping. Created before any fork; children inherit
/// the same physical pages, so the atomics inside coordinate across
/// processes.
pub(crate) struct SharedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the raw pointer addresses a MAP_SHARED region that is only
// accessed through atomics or under the region lock; the mapping lives
// until drop and all access is bounds-checked through RegionMap.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    pub fn create(len: usize) -> Result<Self> {
        // SAFETY: anonymous mapping with validated length; MAP_FAILED
        // is checked below, mlock failure is non-fatal.
        let ptr = unsafe {
            let ptr = libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(SluiceError::shm(format!(
                    "mmap of {} bytes failed: {}",
                    len,
                    std::io::Error::last_os_error()
                )));
            }
            // Keep DAQ buffers out of swap; best effort.
            let _ = libc::mlock(ptr, len);
            ptr::write_bytes(ptr as *mut u8, 0, len);
            ptr as *mut u8
        };
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly the mapping created above.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

/// Which index queue to address.
#[derive(Debug, Clone, Copy)]
pub(crate) enum QueueId {
    Free,
    Ready(usize),
}

/// View of one index queue. Mutating calls require the region lock.
pub(crate) struct QueueRef<'a> {
    header: &'a QueueHeader,
    ring: &'a [AtomicU32],
}

impl QueueRef<'_> {
    pub fn init(&self, capacity: u32) {
        self.header.capacity.store(capacity, Ordering::Relaxed);
        self.header.head.store(0, Ordering::Relaxed);
        self.header.len.store(0, Ordering::Relaxed);
    }

    /// Push an index; the queue is sized to hold every slot, so this
    /// cannot overflow in a conforming protocol.
    pub fn push(&self, idx: u32) {
        let cap = self.header.capacity.load(Ordering::Relaxed);
        let len = self.header.len.load(Ordering::Relaxed);
        debug_assert!(len < cap, "index queue overflow");
        let head = self.header.head.load(Ordering::Relaxed);
        let tail = (head + len) % cap;
        self.ring[tail as usize].store(idx, Ordering::Relaxed);
        self.header.len.store(len + 1, Ordering::Relaxed);
    }

    pub fn pop(&self) -> Option<u32> {
        let len = self.header.len.load(Ordering::Relaxed);
        if len == 0 {
            return None;
        }
        let cap = self.header.capacity.load(Ordering::Relaxed);
        let head = self.header.head.load(Ordering::Relaxed);
        let idx = self.ring[head as usize].load(Ordering::Relaxed);
        self.header.head.store((head + 1) % cap, Ordering::Relaxed);
        self.header.len.store(len - 1, Ordering::Relaxed);
        Some(idx)
    }

    /// Lock-free approximate length, for status snapshots.
    pub fn len_relaxed(&self) -> u32 {
        self.header.len.load(Ordering::Relaxed)
    }
}

/// Guard for the region's protocol lock word.
pub(crate) struct RegionGuard<'a> {
    lock: &'a AtomicU32,
}

impl Drop for RegionGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.store(0, Ordering::Release);
    }
}

/// The shared region plus its offset map; every raw access funnels
/// through here.
pub(crate) struct BufferShared {
    region: SharedRegion,
    map: RegionMap,
}

impl BufferShared {
    pub fn create(slots: usize, channels: usize, slot_bytes: usize) -> Result<Self> {
        if slots == 0 || slots > MAX_SLOTS {
            return Err(SluiceError::config(format!(
                "number_of_slots must be in 1..={MAX_SLOTS}, got {slots}"
            )));
        }
        let map = RegionMap::compute(slots, slot_bytes);
        let region = SharedRegion::create(map.len)?;
        let shared = Self { region, map };

        let h = shared.header();
        h.magic.store(REGION_MAGIC, Ordering::Relaxed);
        h.version.store(REGION_VERSION, Ordering::Relaxed);
        h.slots.store(slots as u32, Ordering::Relaxed);
        h.channels.store(channels as u32, Ordering::Relaxed);
        h.slot_bytes.store(slot_bytes as u32, Ordering::Relaxed);
        h.next_sequence.store(1, Ordering::Relaxed);

        shared.queue(QueueId::Free).init(slots as u32);
        for g in 0..MAX_READER_GROUPS {
            shared.queue(QueueId::Ready(g)).init(slots as u32);
        }
        // All slots start free.
        let free = shared.queue(QueueId::Free);
        for i in 0..slots as u32 {
            free.push(i);
        }
        Ok(shared)
    }

    #[inline]
    pub fn map(&self) -> &RegionMap {
        &self.map
    }

    #[inline]
    pub fn header(&self) -> &RegionHeader {
        // SAFETY: offset 0 of the region is a zero-initialized
        // RegionHeader for the lifetime of the mapping.
        unsafe { &*(self.region.as_ptr() as *const RegionHeader) }
    }

    #[inline]
    pub fn meta(&self, slot: usize) -> &SlotMeta {
        debug_assert!(slot < self.map.slots);
        // SAFETY: slot is bounds-checked against the map; the metadata
        // array was zero-initialized at creation.
        unsafe {
            let base = self.region.as_ptr().add(self.map.meta_off) as *const SlotMeta;
            &*base.add(slot)
        }
    }

    pub fn queue(&self, id: QueueId) -> QueueRef<'_> {
        let off = match id {
            QueueId::Free => self.map.free_q_off,
            QueueId::Ready(g) => {
                debug_assert!(g < MAX_READER_GROUPS);
                self.map.ready_q_off + g * self.map.queue_stride
            }
        };
        // SAFETY: off addresses a QueueHeader followed by `slots`
        // AtomicU32 ring entries, per RegionMap::compute.
        unsafe {
            let header = &*(self.region.as_ptr().add(off) as *const QueueHeader);
            let ring = std::slice::from_raw_parts(
                self.region
                    .as_ptr()
                    .add(off + std::mem::size_of::<QueueHeader>())
                    as *const AtomicU32,
                self.map.slots,
            );
            QueueRef { header, ring }
        }
    }

    #[inline]
    pub fn snapshot(&self) -> &SnapshotHeader {
        // SAFETY: snap_off addresses a SnapshotHeader per RegionMap.
        unsafe { &*(self.region.as_ptr().add(self.map.snap_off) as *const SnapshotHeader) }
    }

    #[inline]
    pub fn snapshot_payload(&self) -> *mut u8 {
        // SAFETY: the payload directly follows the snapshot header and
        // is slot_stride bytes long.
        unsafe {
            self.region
                .as_ptr()
                .add(self.map.snap_off + std::mem::size_of::<SnapshotHeader>())
        }
    }

    #[inline]
    pub fn slot_ptr(&self, slot: usize) -> *mut u8 {
        debug_assert!(slot < self.map.slots);
        // SAFETY: slot is bounds-checked; storage extends to map.len.
        unsafe {
            self.region
                .as_ptr()
                .add(self.map.data_off + slot * self.map.slot_stride)
        }
    }

    /// Take the protocol lock. Critical sections are a handful of
    /// queue operations, so contention is resolved by spinning.
    pub fn lock(&self) -> RegionGuard<'_> {
        let lock = &self.header().lock;
        let mut spins = 0u32;
        while lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins < 64 {
                hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        RegionGuard { lock }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_map_sections_do_not_overlap() {
        let map = RegionMap::compute(7, 13);
        assert_eq!(map.slot_stride, 16);
        assert!(map.meta_off >= std::mem::size_of::<RegionHeader>());
        assert!(map.free_q_off >= map.meta_off + 7 * 16);
        assert!(map.ready_q_off > map.free_q_off);
        assert!(map.snap_off >= map.ready_q_off + MAX_READER_GROUPS * map.queue_stride);
        assert!(map.data_off > map.snap_off);
        assert_eq!(map.len, map.data_off + 7 * 16);
    }

    #[test]
    fn create_initializes_header_and_free_queue() {
        let shared = BufferShared::create(4, 2, 16).unwrap();
        let h = shared.header();
        assert_eq!(h.magic.load(Ordering::Relaxed), REGION_MAGIC);
        assert_eq!(h.version.load(Ordering::Relaxed), REGION_VERSION);
        assert_eq!(h.slots.load(Ordering::Relaxed), 4);
        assert_eq!(h.next_sequence.load(Ordering::Relaxed), 1);
        assert_eq!(shared.queue(QueueId::Free).len_relaxed(), 4);
        assert_eq!(shared.queue(QueueId::Ready(0)).len_relaxed(), 0);
    }

    #[test]
    fn queue_fifo_order_and_wrap() {
        let shared = BufferShared::create(3, 1, 8).unwrap();
        let q = shared.queue(QueueId::Ready(1));
        let _g = shared.lock();
        q.push(2);
        q.push(0);
        assert_eq!(q.pop(), Some(2));
        q.push(1);
        assert_eq!(q.pop(), Some(0));
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn slot_storage_is_disjoint() {
        let shared = BufferShared::create(4, 1, 8).unwrap();
        for i in 0..4usize {
            // SAFETY: test-local exclusive access.
            unsafe {
                shared.slot_ptr(i).cast::<u64>().write(i as u64 + 10);
            }
        }
        for i in 0..4usize {
            let v = unsafe { shared.slot_ptr(i).cast::<u64>().read() };
            assert_eq!(v, i as u64 + 10);
        }
    }

    #[test]
    fn zero_sized_or_oversized_slots_rejected() {
        assert!(BufferShared::create(0, 1, 8).is_err());
        assert!(BufferShared::create(MAX_SLOTS + 1, 1, 8).is_err());
    }
}
