//! Shared-memory ring buffers with fan-out and backpressure.
//!
//! A `RingBuffer` is a fixed pool of equally-sized slots exchanged
//! between writer, reader, and observer endpoints across process
//! boundaries. Slots travel FREE -> IN_WRITE -> (commit) PUBLISHED ->
//! ... -> FREE; committed slots are delivered to every reader group
//! once (reference-counted fan-out, no copying) and within a group to
//! exactly one of its competing readers, in commit order.
//!
//! Backpressure is intrinsic: writers block on the free queue, so a
//! group that stops consuming eventually stalls the producers.
//! `pause()` closes ingest without touching in-flight work; after
//! `shutdown()` readers drain what was committed and then see
//! end-of-stream.

pub mod observer;
pub mod rate;
pub mod reader;
pub mod shm;
pub mod wait;
pub mod writer;

pub use observer::{Observer, SlotSnapshot};
pub use reader::{ReadGuard, Reader};
pub use writer::{WriteGuard, Writer};

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::constants::MAX_READER_GROUPS;
use crate::error::{Result, SluiceError};
use crate::layout::SlotLayout;

use shm::{BufferShared, QueueId, SLOT_FREE, SLOT_IN_WRITE, SLOT_PUBLISHED};

/// Geometry and layout of a ring buffer.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Number of slots in the pool.
    pub slots: usize,
    /// Items (scalars or records) per slot.
    pub channels: usize,
    /// Item layout.
    pub layout: SlotLayout,
}

impl BufferConfig {
    /// Validated configuration.
    pub fn new(slots: usize, channels: usize, layout: SlotLayout) -> Result<Self> {
        if slots == 0 {
            return Err(SluiceError::config("number_of_slots must be at least 1"));
        }
        if channels == 0 {
            return Err(SluiceError::config("channel_per_slot must be at least 1"));
        }
        Ok(Self {
            slots,
            channels,
            layout,
        })
    }

    /// Payload bytes of one slot.
    pub fn slot_bytes(&self) -> usize {
        self.channels * self.layout.item_size()
    }
}

/// One sample of a buffer's state, as reported on the status line.
#[derive(Debug, Clone, Copy)]
pub struct BufferStatus {
    /// Slots committed since creation.
    pub events_total: u64,
    /// Slots currently outside the free queue (approximate snapshot).
    pub n_filled: usize,
    /// Smoothed commit rate in Hz.
    pub rate_hz: f64,
}

/// Outcome of a ready-queue poll.
pub(crate) enum NextSlot {
    Slot(usize, u64),
    Empty,
    EndOfStream,
}

/// A multi-slot shared-memory ring buffer.
///
/// Created by the controller before worker processes fork; endpoints
/// hold an `Arc` to it and remain valid in the children because the
/// underlying region is a shared mapping.
pub struct RingBuffer {
    name: String,
    config: BufferConfig,
    shared: BufferShared,
}

impl RingBuffer {
    /// Allocate the shared region and initialize all slots as free.
    pub fn create(name: impl Into<String>, config: BufferConfig) -> Result<Arc<Self>> {
        let name = name.into();
        let shared = BufferShared::create(config.slots, config.channels, config.slot_bytes())?;
        debug!(
            buffer = %name,
            slots = config.slots,
            channels = config.channels,
            layout = %config.layout.describe(),
            "ring buffer created"
        );
        Ok(Arc::new(Self {
            name,
            config,
            shared,
        }))
    }

    /// Buffer name (e.g. `RB_1`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots.
    pub fn slots(&self) -> usize {
        self.config.slots
    }

    /// Items per slot.
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// Item layout.
    pub fn layout(&self) -> &SlotLayout {
        &self.config.layout
    }

    /// Payload bytes per slot.
    pub fn slot_bytes(&self) -> usize {
        self.config.slot_bytes()
    }

    /// Number of registered reader groups.
    pub fn reader_groups(&self) -> usize {
        self.shared.header().n_groups.load(Ordering::Relaxed) as usize
    }

    /// Grant write capability. Multiple writers contend on the free
    /// queue.
    pub fn new_writer(self: &Arc<Self>) -> Writer {
        Writer::new(Arc::clone(self))
    }

    /// Grant peek capability.
    pub fn new_observer(self: &Arc<Self>) -> Observer {
        Observer::new(Arc::clone(self))
    }

    /// Register a reader group. Groups share delivery within
    /// themselves (competing consumers) and fan out across each other.
    ///
    /// Only valid before the first commit; the controller registers
    /// all groups during setup, before any worker starts.
    pub fn new_reader_group(self: &Arc<Self>) -> Result<Reader> {
        let h = self.shared.header();
        let _guard = self.shared.lock();
        if h.setup_closed.load(Ordering::Relaxed) != 0 {
            return Err(SluiceError::config(format!(
                "buffer '{}': reader groups must be registered before data taking starts",
                self.name
            )));
        }
        let group = h.n_groups.load(Ordering::Relaxed) as usize;
        if group >= MAX_READER_GROUPS {
            return Err(SluiceError::config(format!(
                "buffer '{}': at most {MAX_READER_GROUPS} reader groups",
                self.name
            )));
        }
        h.n_groups.store(group as u32 + 1, Ordering::Relaxed);
        Ok(Reader::new(Arc::clone(self), group))
    }

    /// Close ingest: subsequent and blocked writer acquires return
    /// closed. In-flight commits still complete; reads keep draining.
    pub fn pause(&self) {
        self.shared.header().paused.store(1, Ordering::Release);
        debug!(buffer = %self.name, "paused");
    }

    /// Re-open ingest.
    pub fn resume(&self) {
        self.shared.header().paused.store(0, Ordering::Release);
        debug!(buffer = %self.name, "resumed");
    }

    /// Stop the buffer: writers see closed, readers drain the ready
    /// queues and then see end-of-stream. Idempotent.
    pub fn shutdown(&self) {
        self.shared.header().shutdown.store(1, Ordering::Release);
        debug!(buffer = %self.name, "shutdown");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.header().paused.load(Ordering::Acquire) != 0
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.header().shutdown.load(Ordering::Acquire) != 0
    }

    /// Total committed slots.
    pub fn events_total(&self) -> u64 {
        self.shared.header().events_total.load(Ordering::Relaxed)
    }

    /// Sample the buffer state. The rate EWMA folds in one sample per
    /// call, so one process (the supervisor) should own the cadence.
    pub fn status(&self) -> BufferStatus {
        let h = self.shared.header();
        let free = self.shared.queue(QueueId::Free).len_relaxed() as usize;
        BufferStatus {
            events_total: h.events_total.load(Ordering::Relaxed),
            n_filled: self.config.slots.saturating_sub(free),
            rate_hz: rate::sample(h),
        }
    }

    /// Tuple form of [`RingBuffer::status`]: `(events_total, n_filled,
    /// rate_hz)`.
    pub fn buffer_status(&self) -> (u64, usize, f64) {
        let st = self.status();
        (st.events_total, st.n_filled, st.rate_hz)
    }

    /// Return every non-free slot to the free queue.
    ///
    /// Only sound once no endpoint can still hold a slot — the
    /// controller calls this after all worker processes are joined, so
    /// slots abandoned by crashed workers are not leaked.
    pub fn reclaim_orphans(&self) -> usize {
        let _guard = self.shared.lock();
        let groups = self.shared.header().n_groups.load(Ordering::Relaxed) as usize;
        for g in 0..groups {
            while self.shared.queue(QueueId::Ready(g)).pop().is_some() {}
        }
        let free = self.shared.queue(QueueId::Free);
        let mut reclaimed = 0;
        for i in 0..self.config.slots {
            let meta = self.shared.meta(i);
            if meta.state.load(Ordering::Relaxed) != SLOT_FREE {
                meta.ready_count.store(0, Ordering::Relaxed);
                meta.state.store(SLOT_FREE, Ordering::Relaxed);
                free.push(i as u32);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            debug!(buffer = %self.name, reclaimed, "reclaimed orphaned slots");
        }
        reclaimed
    }

    // ------------------------------------------------------------------
    // Slot protocol (called by the endpoint types)
    // ------------------------------------------------------------------

    /// Pop one free slot, FREE -> IN_WRITE. Non-blocking.
    pub(crate) fn acquire_slot(&self) -> Option<usize> {
        let _guard = self.shared.lock();
        let idx = self.shared.queue(QueueId::Free).pop()? as usize;
        let meta = self.shared.meta(idx);
        debug_assert_eq!(meta.state.load(Ordering::Relaxed), SLOT_FREE);
        meta.state.store(SLOT_IN_WRITE, Ordering::Relaxed);
        Some(idx)
    }

    /// Publish a written slot: assign the next sequence, reference-
    /// count it across all reader groups, refresh the observer
    /// snapshot. Atomic w.r.t. other commits, so every group observes
    /// the same total order.
    pub(crate) fn commit_slot(&self, idx: usize) -> u64 {
        let h = self.shared.header();
        let _guard = self.shared.lock();

        let seq = h.next_sequence.load(Ordering::Relaxed);
        h.next_sequence.store(seq + 1, Ordering::Relaxed);
        h.setup_closed.store(1, Ordering::Relaxed);

        let meta = self.shared.meta(idx);
        debug_assert_eq!(meta.state.load(Ordering::Relaxed), SLOT_IN_WRITE);
        meta.sequence.store(seq, Ordering::Relaxed);

        let groups = h.n_groups.load(Ordering::Relaxed) as usize;
        if groups == 0 {
            // Nobody consumes: the publication is complete immediately.
            meta.state.store(SLOT_FREE, Ordering::Relaxed);
            self.shared.queue(QueueId::Free).push(idx as u32);
        } else {
            meta.ready_count.store(groups as u32, Ordering::Relaxed);
            meta.state.store(SLOT_PUBLISHED, Ordering::Relaxed);
            for g in 0..groups {
                self.shared.queue(QueueId::Ready(g)).push(idx as u32);
            }
        }

        self.write_snapshot(idx, seq);
        h.events_total.fetch_add(1, Ordering::Relaxed);
        seq
    }

    /// Return an unpublished slot, IN_WRITE -> FREE.
    pub(crate) fn discard_slot(&self, idx: usize) {
        let _guard = self.shared.lock();
        let meta = self.shared.meta(idx);
        debug_assert_eq!(meta.state.load(Ordering::Relaxed), SLOT_IN_WRITE);
        meta.state.store(SLOT_FREE, Ordering::Relaxed);
        self.shared.queue(QueueId::Free).push(idx as u32);
    }

    /// Pop the next ready slot for a group, or report why there is
    /// none.
    pub(crate) fn next_ready(&self, group: usize) -> NextSlot {
        {
            let _guard = self.shared.lock();
            if let Some(idx) = self.shared.queue(QueueId::Ready(group)).pop() {
                let idx = idx as usize;
                let seq = self.shared.meta(idx).sequence.load(Ordering::Relaxed);
                return NextSlot::Slot(idx, seq);
            }
        }
        if self.is_shutdown() {
            NextSlot::EndOfStream
        } else {
            NextSlot::Empty
        }
    }

    /// One group is done with a publication; the last release frees
    /// the slot.
    pub(crate) fn release_slot(&self, idx: usize) {
        let _guard = self.shared.lock();
        let meta = self.shared.meta(idx);
        let rc = meta.ready_count.load(Ordering::Relaxed);
        debug_assert!(rc > 0, "release of a slot no group holds");
        meta.ready_count.store(rc - 1, Ordering::Relaxed);
        if rc == 1 {
            meta.state.store(SLOT_FREE, Ordering::Relaxed);
            self.shared.queue(QueueId::Free).push(idx as u32);
        }
    }

    /// Seqlock-write the freshly committed payload into the observer
    /// cell. Caller holds the region lock, so writes never interleave.
    fn write_snapshot(&self, idx: usize, seq: u64) {
        let snap = self.shared.snapshot();
        let stamp = snap.stamp.load(Ordering::Relaxed);
        snap.stamp.store(stamp + 1, Ordering::Release); // odd: in progress
        std::sync::atomic::fence(Ordering::Release);
        // SAFETY: source is this buffer's slot idx, destination the
        // snapshot payload; both are slot_bytes long within the region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.shared.slot_ptr(idx),
                self.shared.snapshot_payload(),
                self.slot_bytes(),
            );
        }
        snap.sequence.store(seq, Ordering::Relaxed);
        std::sync::atomic::fence(Ordering::Release);
        snap.stamp.store(stamp + 2, Ordering::Release); // even: stable
    }

    /// Copy out the latest committed payload, if any. Never blocks and
    /// never consumes.
    pub(crate) fn peek_snapshot(&self) -> Option<(u64, Vec<u8>)> {
        let snap = self.shared.snapshot();
        let n = self.slot_bytes();
        let mut data = vec![0u8; n];
        let mut backoff = wait::Backoff::new();
        loop {
            let s1 = snap.stamp.load(Ordering::Acquire);
            if s1 == 0 {
                return None; // never committed
            }
            if s1 & 1 == 1 {
                backoff.wait(); // commit in progress, a few ns
                continue;
            }
            // SAFETY: payload is n bytes; torn reads are detected by
            // the stamp re-check below and retried.
            unsafe {
                std::ptr::copy_nonoverlapping(self.shared.snapshot_payload(), data.as_mut_ptr(), n);
            }
            let seq = snap.sequence.load(Ordering::Relaxed);
            std::sync::atomic::fence(Ordering::Acquire);
            if snap.stamp.load(Ordering::Relaxed) == s1 {
                return Some((seq, data));
            }
            backoff.reset();
        }
    }

    /// Raw payload pointer of a slot; exclusivity comes from the slot
    /// protocol (only the IN_WRITE owner mutates).
    pub(crate) fn slot_data_ptr(&self, idx: usize) -> *mut u8 {
        self.shared.slot_ptr(idx)
    }

    /// Approximate free-queue length (tests and diagnostics).
    pub fn free_slots(&self) -> usize {
        self.shared.queue(QueueId::Free).len_relaxed() as usize
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("slots", &self.config.slots)
            .field("channels", &self.config.channels)
            .field("groups", &self.reader_groups())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::ElementType;

    fn small_buffer(slots: usize) -> Arc<RingBuffer> {
        let cfg = BufferConfig::new(slots, 1, SlotLayout::scalar(ElementType::F64)).unwrap();
        RingBuffer::create("RB_test", cfg).unwrap()
    }

    #[test]
    fn commit_with_no_groups_returns_slot_immediately() {
        let rb = small_buffer(2);
        let idx = rb.acquire_slot().unwrap();
        assert_eq!(rb.free_slots(), 1);
        let seq = rb.commit_slot(idx);
        assert_eq!(seq, 1);
        assert_eq!(rb.free_slots(), 2);
        assert_eq!(rb.events_total(), 1);
    }

    #[test]
    fn sequences_are_strictly_increasing() {
        let rb = small_buffer(4);
        let mut last = 0;
        for _ in 0..10 {
            let idx = rb.acquire_slot().unwrap();
            let seq = rb.commit_slot(idx);
            assert!(seq > last);
            last = seq;
        }
    }

    #[test]
    fn late_group_registration_is_rejected() {
        let rb = small_buffer(2);
        let idx = rb.acquire_slot().unwrap();
        rb.commit_slot(idx);
        assert!(rb.new_reader_group().is_err());
    }

    #[test]
    fn group_limit_enforced() {
        let rb = small_buffer(2);
        for _ in 0..MAX_READER_GROUPS {
            rb.new_reader_group().unwrap();
        }
        assert!(rb.new_reader_group().is_err());
    }

    #[test]
    fn fanout_reference_counting() {
        let rb = small_buffer(2);
        let r1 = rb.new_reader_group().unwrap();
        let r2 = rb.new_reader_group().unwrap();

        let idx = rb.acquire_slot().unwrap();
        rb.commit_slot(idx);
        assert_eq!(rb.free_slots(), 1);

        let g1 = r1.next().unwrap();
        drop(g1); // first release keeps the slot alive for group 2
        assert_eq!(rb.free_slots(), 1);

        let g2 = r2.next().unwrap();
        drop(g2);
        assert_eq!(rb.free_slots(), 2);
    }

    #[test]
    fn reclaim_returns_held_and_queued_slots() {
        let rb = small_buffer(4);
        let _r = rb.new_reader_group().unwrap();
        let a = rb.acquire_slot().unwrap();
        rb.commit_slot(a); // queued for the group
        let _b = rb.acquire_slot().unwrap(); // left in write state
        assert_eq!(rb.free_slots(), 2);
        assert_eq!(rb.reclaim_orphans(), 2);
        assert_eq!(rb.free_slots(), 4);
    }

    #[test]
    fn status_counts_filled_slots() {
        let rb = small_buffer(4);
        let _r = rb.new_reader_group().unwrap();
        for _ in 0..3 {
            let idx = rb.acquire_slot().unwrap();
            rb.commit_slot(idx);
        }
        let st = rb.status();
        assert_eq!(st.events_total, 3);
        assert_eq!(st.n_filled, 3);
        assert!(st.rate_hz >= 0.0);
    }
}
