//! Replays a recorded raw file into a buffer.
//!
//! Reads fixed-size records (one slot payload each) from `filename`
//! and commits them in order. Returns cleanly at end of file, which is
//! the end-of-input signal that terminates a batch-mode run. Config
//! keys: `filename` (required), `max_events`.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};

use crate::error::{Result, SluiceError};
use crate::worker::{acquire_blocking, WorkerContext};

pub fn file_source(ctx: WorkerContext) -> Result<()> {
    let sinks = ctx
        .sinks
        .as_ref()
        .ok_or_else(|| SluiceError::config("file_source needs a sink"))?;
    let [sink] = sinks.as_slice() else {
        return Err(SluiceError::config("file_source takes exactly one sink"));
    };
    let path = ctx
        .cfg_str("filename")
        .ok_or_else(|| SluiceError::config("file_source needs 'filename'"))?;
    let max_events = ctx.cfg_u64("max_events").unwrap_or(u64::MAX);

    let mut file = BufReader::new(File::open(path)?);
    let mut record = vec![0u8; sink.buffer().slot_bytes()];
    let mut produced = 0u64;
    while produced < max_events {
        match file.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let Some(mut slot) = acquire_blocking(sink) else {
            break;
        };
        slot.bytes_mut().copy_from_slice(&record);
        slot.commit();
        produced += 1;
    }
    Ok(())
}
