//! Observer endpoint: non-consuming peek at the latest commit.

use std::sync::Arc;

use crate::error::Result;
use crate::layout::{Element, SlotLayout};

use super::RingBuffer;

/// Peek capability on a ring buffer. Observers hold no slot and never
/// interfere with delivery; they sample the seqlock-guarded snapshot
/// the committer refreshes.
#[derive(Clone)]
pub struct Observer {
    buffer: Arc<RingBuffer>,
}

impl Observer {
    pub(crate) fn new(buffer: Arc<RingBuffer>) -> Self {
        Self { buffer }
    }

    /// Copy of the highest-sequence committed slot, or `None` before
    /// the first commit. Never blocks.
    pub fn peek(&self) -> Option<SlotSnapshot> {
        let (sequence, data) = self.buffer.peek_snapshot()?;
        Some(SlotSnapshot {
            sequence,
            channels: self.buffer.channels(),
            layout: self.buffer.layout().clone(),
            data,
        })
    }

    /// The observed buffer.
    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    /// Stop signal for observer-only workers, which otherwise never
    /// see an end of stream.
    pub fn is_shutdown(&self) -> bool {
        self.buffer.is_shutdown()
    }
}

/// An owned copy of one committed slot.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    sequence: u64,
    channels: usize,
    layout: SlotLayout,
    data: Vec<u8>,
}

impl SlotSnapshot {
    /// Sequence number of the copied commit.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Items per slot.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Raw payload bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy out the scalars (scalar layouts only).
    pub fn scalars<T: Element>(&self) -> Result<Vec<T>> {
        self.layout.check_scalar::<T>()?;
        let mut out = Vec::with_capacity(self.channels);
        for ch in 0..self.channels {
            // SAFETY: ch * size < data.len() by layout arithmetic; the
            // Vec's base alignment is unknown, hence unaligned reads.
            out.push(unsafe {
                self.data
                    .as_ptr()
                    .add(ch * std::mem::size_of::<T>())
                    .cast::<T>()
                    .read_unaligned()
            });
        }
        Ok(out)
    }

    /// All values of one channel as `f64`, for display and
    /// histogramming.
    pub fn item_values_f64(&self, channel: usize) -> Vec<f64> {
        self.layout.item_values_f64(&self.data, channel)
    }

    /// Read one record field (record layouts only).
    pub fn read_field<T: Element>(&self, channel: usize, name: &str) -> Result<T> {
        let off = self.layout.check_field::<T>(name)?;
        if channel >= self.channels {
            return Err(crate::error::SluiceError::misuse(format!(
                "channel {channel} out of range (slot has {})",
                self.channels
            )));
        }
        let byte = channel * self.layout.item_size() + off;
        // SAFETY: in-bounds by layout arithmetic; packed data.
        Ok(unsafe { self.data.as_ptr().add(byte).cast::<T>().read_unaligned() })
    }
}
