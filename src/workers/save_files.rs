//! File sinks: tab-separated text and raw binary dumps.
//!
//! Both drain one source until end-of-stream and place their output
//! beneath the run's `directory_prefix`. Config keys: `filename`
//! (stem, default "data").

use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;

use crate::error::{Result, SluiceError};
use crate::ring::Reader;
use crate::worker::WorkerContext;

fn single_source<'a>(ctx: &'a WorkerContext, what: &str) -> Result<&'a Reader> {
    let sources = ctx
        .sources
        .as_ref()
        .ok_or_else(|| SluiceError::config(format!("{what} needs a source")))?;
    let [source] = sources.as_slice() else {
        return Err(SluiceError::config(format!(
            "{what} takes exactly one source"
        )));
    };
    Ok(source)
}

/// Write each record as one tab-separated line. The header line
/// carries the column labels derived from the slot layout.
pub fn save_to_txt(ctx: WorkerContext) -> Result<()> {
    let source = single_source(&ctx, "save_to_txt")?;
    let stem = ctx.cfg_str("filename").unwrap_or("data");
    let path = ctx.directory_prefix().join(format!("{stem}.txt"));
    let mut out = BufWriter::new(File::create(&path)?);

    let layout = source.buffer().layout().clone();
    let channels = source.buffer().channels();
    let names = layout.value_names();
    let mut columns = Vec::with_capacity(channels * names.len());
    for ch in 0..channels {
        for name in &names {
            if channels == 1 {
                columns.push(name.clone());
            } else {
                columns.push(format!("{name}_{ch}"));
            }
        }
    }
    writeln!(out, "# {}", columns.join("\t"))?;

    let mut records = 0u64;
    while let Some(record) = source.next() {
        let mut fields = Vec::with_capacity(columns.len());
        for ch in 0..channels {
            for value in layout.item_values_f64(record.bytes(), ch) {
                fields.push(value.to_string());
            }
        }
        writeln!(out, "{}", fields.join("\t"))?;
        records += 1;
    }
    out.flush()?;
    info!(file = %path.display(), records, "text sink finished");
    Ok(())
}

/// Dump raw slot payloads back to back. The counterpart of
/// `file_source`: a file recorded here replays into a buffer of the
/// same geometry.
pub fn save_raw(ctx: WorkerContext) -> Result<()> {
    let source = single_source(&ctx, "save_raw")?;
    let stem = ctx.cfg_str("filename").unwrap_or("data");
    let path = ctx.directory_prefix().join(format!("{stem}.dat"));
    let mut out = BufWriter::new(File::create(&path)?);

    let mut records = 0u64;
    while let Some(record) = source.next() {
        out.write_all(record.bytes())?;
        records += 1;
    }
    out.flush()?;
    info!(file = %path.display(), records, "raw sink finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{ElementType, SlotLayout};
    use crate::ring::{BufferConfig, RingBuffer};
    use serde_yaml::{Mapping, Value};
    use std::collections::BTreeMap;
    use std::fs;

    fn ctx_for(rb: &std::sync::Arc<RingBuffer>, dir: &std::path::Path, stem: &str) -> WorkerContext {
        let mut config = Mapping::new();
        config.insert(
            Value::String("directory_prefix".into()),
            Value::String(dir.display().to_string()),
        );
        config.insert(
            Value::String("filename".into()),
            Value::String(stem.into()),
        );
        WorkerContext {
            sources: Some(vec![rb.new_reader_group().unwrap()]),
            sinks: None,
            observers: None,
            config,
            assignments: BTreeMap::new(),
        }
    }

    #[test]
    fn txt_sink_writes_header_and_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = BufferConfig::new(4, 2, SlotLayout::scalar(ElementType::F64)).unwrap();
        let rb = RingBuffer::create("RB_1", cfg).unwrap();
        let ctx = ctx_for(&rb, tmp.path(), "waves");

        let writer = rb.new_writer();
        for v in [0.5f64, 1.5] {
            let mut g = writer.acquire().unwrap();
            g.scalars_mut::<f64>().unwrap().copy_from_slice(&[v, -v]);
            g.commit();
        }
        rb.shutdown();
        save_to_txt(ctx).unwrap();

        let text = fs::read_to_string(tmp.path().join("waves.txt")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# value_0\tvalue_1");
        assert_eq!(lines[1], "0.5\t-0.5");
        assert_eq!(lines[2], "1.5\t-1.5");
    }

    #[test]
    fn raw_sink_roundtrips_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = BufferConfig::new(4, 3, SlotLayout::scalar(ElementType::U32)).unwrap();
        let rb = RingBuffer::create("RB_1", cfg).unwrap();
        let ctx = ctx_for(&rb, tmp.path(), "dump");

        let writer = rb.new_writer();
        let mut g = writer.acquire().unwrap();
        g.scalars_mut::<u32>().unwrap().copy_from_slice(&[7, 8, 9]);
        g.commit();
        rb.shutdown();
        save_raw(ctx).unwrap();

        let bytes = fs::read(tmp.path().join("dump.dat")).unwrap();
        let expect: Vec<u8> = [7u32, 8, 9]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect();
        assert_eq!(bytes, expect);
    }
}
