//! Stream transforms between buffers.

use crate::error::{Result, SluiceError};
use crate::worker::{acquire_blocking, WorkerContext};

/// Forward every k-th record from one buffer into another. Config
/// keys: `keep_every` (default 1 = forward everything).
///
/// Source and sink must share the slot payload size; the record is
/// copied verbatim.
pub fn downsample(ctx: WorkerContext) -> Result<()> {
    let sources = ctx
        .sources
        .as_ref()
        .ok_or_else(|| SluiceError::config("downsample needs a source"))?;
    let sinks = ctx
        .sinks
        .as_ref()
        .ok_or_else(|| SluiceError::config("downsample needs a sink"))?;
    let ([source], [sink]) = (sources.as_slice(), sinks.as_slice()) else {
        return Err(SluiceError::config(
            "downsample takes exactly one source and one sink",
        ));
    };
    if source.buffer().slot_bytes() != sink.buffer().slot_bytes() {
        return Err(SluiceError::config(format!(
            "downsample: slot size mismatch ({} vs {} bytes)",
            source.buffer().slot_bytes(),
            sink.buffer().slot_bytes()
        )));
    }
    let keep_every = ctx.cfg_u64("keep_every").unwrap_or(1).max(1);

    let mut seen = 0u64;
    while let Some(record) = source.next() {
        seen += 1;
        if seen % keep_every != 0 {
            continue; // dropping the guard releases the slot
        }
        let Some(mut out) = acquire_blocking(sink) else {
            break;
        };
        out.bytes_mut().copy_from_slice(record.bytes());
        out.commit();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ElementType, SlotLayout};
    use crate::ring::{BufferConfig, RingBuffer};
    use serde_yaml::{Mapping, Value};
    use std::collections::BTreeMap;

    #[test]
    fn forwards_every_third_record() {
        let mk = |name: &str| {
            let cfg = BufferConfig::new(8, 1, SlotLayout::scalar(ElementType::U64)).unwrap();
            RingBuffer::create(name, cfg).unwrap()
        };
        let upstream = mk("RB_1");
        let downstream = mk("RB_2");
        let up_reader = upstream.new_reader_group().unwrap();
        let down_reader = downstream.new_reader_group().unwrap();

        let mut config = Mapping::new();
        config.insert(Value::String("keep_every".into()), Value::Number(3.into()));
        let ctx = WorkerContext {
            sources: Some(vec![up_reader]),
            sinks: Some(vec![downstream.new_writer()]),
            observers: None,
            config,
            assignments: BTreeMap::new(),
        };
        let stage = std::thread::spawn(move || downsample(ctx));

        let writer = upstream.new_writer();
        for v in 1..=9u64 {
            let mut g = writer.acquire().unwrap();
            g.scalars_mut::<u64>().unwrap().fill(v);
            g.commit();
        }
        upstream.shutdown();
        stage.join().unwrap().unwrap();
        downstream.shutdown();

        let mut forwarded = Vec::new();
        while let Some(rec) = down_reader.next() {
            forwarded.push(rec.scalars::<u64>().unwrap()[0]);
        }
        assert_eq!(forwarded, vec![3, 6, 9]);
    }

    #[test]
    fn slot_size_mismatch_rejected() {
        let a = RingBuffer::create(
            "RB_1",
            BufferConfig::new(2, 1, SlotLayout::scalar(ElementType::U64)).unwrap(),
        )
        .unwrap();
        let b = RingBuffer::create(
            "RB_2",
            BufferConfig::new(2, 2, SlotLayout::scalar(ElementType::U64)).unwrap(),
        )
        .unwrap();
        let ctx = WorkerContext {
            sources: Some(vec![a.new_reader_group().unwrap()]),
            sinks: Some(vec![b.new_writer()]),
            observers: None,
            config: Mapping::new(),
            assignments: BTreeMap::new(),
        };
        assert!(downsample(ctx).is_err());
    }
}
