//! Writer endpoint: acquire a free slot, fill it, commit or discard.

use std::sync::Arc;

use crate::error::Result;
use crate::layout::Element;

use super::wait::Backoff;
use super::RingBuffer;

/// Write capability on a ring buffer. Cheap to clone; multiple writers
/// contend on the free queue.
#[derive(Clone)]
pub struct Writer {
    buffer: Arc<RingBuffer>,
}

impl Writer {
    pub(crate) fn new(buffer: Arc<RingBuffer>) -> Self {
        Self { buffer }
    }

    /// Acquire a free slot for writing.
    ///
    /// Blocks while the pool is exhausted (backpressure). Returns
    /// `None` once the buffer is paused or shut down; producers that
    /// want to survive a pause check [`Writer::is_shutdown`] and retry
    /// later.
    pub fn acquire(&self) -> Option<WriteGuard> {
        let mut backoff = Backoff::new();
        loop {
            if self.buffer.is_paused() || self.buffer.is_shutdown() {
                return None;
            }
            if let Some(idx) = self.buffer.acquire_slot() {
                return Some(WriteGuard {
                    buffer: Arc::clone(&self.buffer),
                    idx,
                    done: false,
                });
            }
            backoff.wait();
        }
    }

    /// The buffer this writer feeds.
    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// True once the buffer will never accept data again.
    pub fn is_shutdown(&self) -> bool {
        self.buffer.is_shutdown()
    }

    /// True while ingest is paused.
    pub fn is_paused(&self) -> bool {
        self.buffer.is_paused()
    }
}

/// An acquired slot. Commit publishes it; dropping (or `discard`)
/// returns it unpublished. Double commit is unrepresentable: `commit`
/// consumes the guard.
pub struct WriteGuard {
    buffer: Arc<RingBuffer>,
    idx: usize,
    done: bool,
}

impl WriteGuard {
    /// Items per slot.
    pub fn channels(&self) -> usize {
        self.buffer.channels()
    }

    /// Raw payload bytes of the slot.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: this guard is the slot's IN_WRITE owner, so access
        // is exclusive until commit/discard; the pointer spans
        // slot_bytes within the mapping.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.slot_data_ptr(self.idx),
                self.buffer.slot_bytes(),
            )
        }
    }

    /// View the slot as a mutable slice of `T` scalars (scalar layouts
    /// only; length is the channel count).
    pub fn scalars_mut<T: Element>(&mut self) -> Result<&mut [T]> {
        self.buffer.layout().check_scalar::<T>()?;
        // SAFETY: layout check guarantees the payload is `channels`
        // elements of T; the base is 8-aligned by construction.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(
                self.buffer.slot_data_ptr(self.idx).cast::<T>(),
                self.buffer.channels(),
            )
        })
    }

    /// Write one record field (record layouts only).
    pub fn write_field<T: Element>(&mut self, channel: usize, name: &str, value: T) -> Result<()> {
        let layout = self.buffer.layout();
        let off = layout.check_field::<T>(name)?;
        let channels = self.buffer.channels();
        if channel >= channels {
            return Err(crate::error::SluiceError::misuse(format!(
                "channel {channel} out of range (slot has {channels})"
            )));
        }
        let byte = channel * layout.item_size() + off;
        // SAFETY: byte + size_of::<T>() <= slot_bytes by the layout
        // arithmetic above; records are packed, hence unaligned write.
        unsafe {
            self.buffer
                .slot_data_ptr(self.idx)
                .add(byte)
                .cast::<T>()
                .write_unaligned(value);
        }
        Ok(())
    }

    /// Publish the slot and return its sequence number.
    pub fn commit(mut self) -> u64 {
        self.done = true;
        self.buffer.commit_slot(self.idx)
    }

    /// Return the slot to the pool without publishing.
    pub fn discard(mut self) {
        self.done = true;
        self.buffer.discard_slot(self.idx);
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        if !self.done {
            self.buffer.discard_slot(self.idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ElementType, FieldDef, SlotLayout};
    use crate::ring::BufferConfig;

    #[test]
    fn acquire_fill_commit() {
        let cfg = BufferConfig::new(2, 3, SlotLayout::scalar(ElementType::F64)).unwrap();
        let rb = RingBuffer::create("RB_w", cfg).unwrap();
        let w = rb.new_writer();

        let mut guard = w.acquire().unwrap();
        guard.scalars_mut::<f64>().unwrap().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(guard.commit(), 1);
        assert_eq!(rb.events_total(), 1);
    }

    #[test]
    fn dropped_guard_discards() {
        let cfg = BufferConfig::new(1, 1, SlotLayout::scalar(ElementType::U32)).unwrap();
        let rb = RingBuffer::create("RB_w", cfg).unwrap();
        let w = rb.new_writer();

        drop(w.acquire().unwrap());
        assert_eq!(rb.events_total(), 0);
        assert_eq!(rb.free_slots(), 1);
        // The slot is reusable.
        assert!(w.acquire().is_some());
    }

    #[test]
    fn acquire_closed_when_paused_or_shutdown() {
        let cfg = BufferConfig::new(2, 1, SlotLayout::scalar(ElementType::F64)).unwrap();
        let rb = RingBuffer::create("RB_w", cfg).unwrap();
        let w = rb.new_writer();

        rb.pause();
        assert!(w.acquire().is_none());
        assert!(!w.is_shutdown());
        rb.resume();
        assert!(w.acquire().is_some());

        rb.shutdown();
        assert!(w.acquire().is_none());
        assert!(w.is_shutdown());
    }

    #[test]
    fn typed_access_is_layout_checked() {
        let cfg = BufferConfig::new(1, 1, SlotLayout::scalar(ElementType::F32)).unwrap();
        let rb = RingBuffer::create("RB_w", cfg).unwrap();
        let w = rb.new_writer();
        let mut guard = w.acquire().unwrap();
        assert!(guard.scalars_mut::<f64>().is_err());
        assert!(guard.scalars_mut::<f32>().is_ok());
        assert!(guard.write_field::<f32>(0, "x", 1.0).is_err());
    }

    #[test]
    fn record_field_write() {
        let layout = SlotLayout::record(vec![
            FieldDef {
                name: "t".into(),
                ty: ElementType::U64,
            },
            FieldDef {
                name: "v".into(),
                ty: ElementType::F32,
            },
        ])
        .unwrap();
        let cfg = BufferConfig::new(1, 2, layout).unwrap();
        let rb = RingBuffer::create("RB_w", cfg).unwrap();
        let w = rb.new_writer();
        let mut guard = w.acquire().unwrap();
        guard.write_field::<u64>(1, "t", 42).unwrap();
        guard.write_field::<f32>(1, "v", 0.5).unwrap();
        assert!(guard.write_field::<u64>(2, "t", 0).is_err());
        let bytes = guard.bytes_mut();
        assert_eq!(&bytes[12..20], &42u64.to_ne_bytes());
    }
}
