//! Reader endpoint: dequeue ready slots for one reader group.

use std::sync::Arc;

use crate::error::Result;
use crate::layout::Element;

use super::wait::Backoff;
use super::{NextSlot, RingBuffer};

/// Read capability for one reader group. Clones share the group's
/// ready queue, giving competing-consumer semantics between replicas
/// of the same worker.
#[derive(Clone)]
pub struct Reader {
    buffer: Arc<RingBuffer>,
    group: usize,
}

impl Reader {
    pub(crate) fn new(buffer: Arc<RingBuffer>, group: usize) -> Self {
        Self { buffer, group }
    }

    /// Dequeue the next committed slot for this group, in commit
    /// order.
    ///
    /// Blocks while the queue is empty. Returns `None` (end of
    /// stream) once the buffer is shut down and the queue drained;
    /// workers exit cleanly on that.
    pub fn next(&self) -> Option<ReadGuard> {
        let mut backoff = Backoff::new();
        loop {
            match self.buffer.next_ready(self.group) {
                NextSlot::Slot(idx, sequence) => {
                    return Some(ReadGuard {
                        buffer: Arc::clone(&self.buffer),
                        idx,
                        sequence,
                    })
                }
                NextSlot::EndOfStream => return None,
                NextSlot::Empty => backoff.wait(),
            }
        }
    }

    /// The buffer this reader consumes.
    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Reader-group id within the buffer.
    pub fn group(&self) -> usize {
        self.group
    }

    pub fn is_shutdown(&self) -> bool {
        self.buffer.is_shutdown()
    }
}

/// A delivered slot. Reading is shared (other groups may hold the same
/// publication); the guard releases the group's reference on drop, and
/// the last group to release frees the slot.
pub struct ReadGuard {
    buffer: Arc<RingBuffer>,
    idx: usize,
    sequence: u64,
}

impl ReadGuard {
    /// Sequence number assigned at commit.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Items per slot.
    pub fn channels(&self) -> usize {
        self.buffer.channels()
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: published slots are read-only until every group has
        // released them, so shared reads cannot race a writer.
        unsafe {
            std::slice::from_raw_parts(
                self.buffer.slot_data_ptr(self.idx),
                self.buffer.slot_bytes(),
            )
        }
    }

    /// View the slot as a slice of `T` scalars (scalar layouts only).
    pub fn scalars<T: Element>(&self) -> Result<&[T]> {
        self.buffer.layout().check_scalar::<T>()?;
        // SAFETY: layout-checked as for bytes(); base is 8-aligned.
        Ok(unsafe {
            std::slice::from_raw_parts(
                self.buffer.slot_data_ptr(self.idx).cast::<T>(),
                self.buffer.channels(),
            )
        })
    }

    /// Read one record field (record layouts only).
    pub fn read_field<T: Element>(&self, channel: usize, name: &str) -> Result<T> {
        let layout = self.buffer.layout();
        let off = layout.check_field::<T>(name)?;
        let channels = self.buffer.channels();
        if channel >= channels {
            return Err(crate::error::SluiceError::misuse(format!(
                "channel {channel} out of range (slot has {channels})"
            )));
        }
        let byte = channel * layout.item_size() + off;
        // SAFETY: in-bounds by the layout arithmetic; packed records
        // need an unaligned read.
        Ok(unsafe {
            self.buffer
                .slot_data_ptr(self.idx)
                .add(byte)
                .cast::<T>()
                .read_unaligned()
        })
    }

    /// Release explicitly (equivalent to dropping the guard).
    pub fn release(self) {}
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.buffer.release_slot(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ElementType, SlotLayout};
    use crate::ring::BufferConfig;

    fn buffer(slots: usize) -> Arc<RingBuffer> {
        let cfg = BufferConfig::new(slots, 2, SlotLayout::scalar(ElementType::U64)).unwrap();
        RingBuffer::create("RB_r", cfg).unwrap()
    }

    #[test]
    fn delivery_in_commit_order() {
        let rb = buffer(4);
        let r = rb.new_reader_group().unwrap();
        let w = rb.new_writer();

        for v in [7u64, 8, 9] {
            let mut g = w.acquire().unwrap();
            g.scalars_mut::<u64>().unwrap().fill(v);
            g.commit();
        }

        for expect in [7u64, 8, 9] {
            let g = r.next().unwrap();
            assert_eq!(g.scalars::<u64>().unwrap(), &[expect, expect]);
        }
    }

    #[test]
    fn end_of_stream_after_drain() {
        let rb = buffer(4);
        let r = rb.new_reader_group().unwrap();
        let w = rb.new_writer();

        w.acquire().unwrap().commit();
        rb.shutdown();

        // The committed slot is still delivered, then end of stream.
        assert!(r.next().is_some());
        assert!(r.next().is_none());
        assert!(r.is_shutdown());
    }

    #[test]
    fn roundtrip_is_byte_identical() {
        let rb = buffer(2);
        let r = rb.new_reader_group().unwrap();
        let w = rb.new_writer();

        let payload: Vec<u8> = (0u8..16).collect();
        let mut g = w.acquire().unwrap();
        g.bytes_mut().copy_from_slice(&payload);
        g.commit();

        let got = r.next().unwrap();
        assert_eq!(got.bytes(), payload.as_slice());
    }

    #[test]
    fn backpressure_frees_after_release() {
        let rb = buffer(1);
        let r = rb.new_reader_group().unwrap();
        let w = rb.new_writer();

        w.acquire().unwrap().commit();
        // Pool exhausted while the publication is unconsumed.
        assert_eq!(rb.free_slots(), 0);
        let g = r.next().unwrap();
        assert_eq!(rb.free_slots(), 0);
        drop(g);
        assert_eq!(rb.free_slots(), 1);
    }
}
