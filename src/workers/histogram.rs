//! Observer-driven histogram accumulator.
//!
//! Samples the latest commit of each observed buffer on a fixed
//! cadence and records the first value of channel 0 into an HDR
//! histogram. Being an observer it never consumes or backpressures;
//! it sees a sample of the stream, not every event. Quantiles are
//! logged and written to a summary file when the run shuts down.
//!
//! Config keys: `low`, `high` (value bounds after scaling),
//! `significant_figures`, `scale` (applied before recording),
//! `interval_ms`, `filename` (summary stem).

use std::fs::File;
use std::io::{BufWriter, Write};
use std::thread;
use std::time::Duration;

use hdrhistogram::Histogram;
use tracing::info;

use crate::error::{Result, SluiceError};
use crate::worker::WorkerContext;

pub fn histogram(ctx: WorkerContext) -> Result<()> {
    let observers = ctx
        .observers
        .as_ref()
        .ok_or_else(|| SluiceError::config("histogram needs at least one observer"))?;
    let low = ctx.cfg_u64("low").unwrap_or(1).max(1);
    let high = ctx.cfg_u64("high").unwrap_or(1_000_000).max(low + 1);
    let sigfig = ctx.cfg_u64("significant_figures").unwrap_or(3).clamp(1, 5) as u8;
    let scale = ctx.cfg_f64("scale").unwrap_or(1.0);
    let interval = Duration::from_millis(ctx.cfg_u64("interval_ms").unwrap_or(100));

    let mut hists: Vec<Histogram<u64>> = Vec::with_capacity(observers.len());
    for _ in observers {
        hists.push(
            Histogram::new_with_bounds(low, high, sigfig)
                .map_err(|e| SluiceError::config(format!("histogram bounds: {e}")))?,
        );
    }
    let mut last_seen = vec![0u64; observers.len()];

    loop {
        let mut any_live = false;
        for (i, obs) in observers.iter().enumerate() {
            if !obs.is_shutdown() {
                any_live = true;
            }
            let Some(snap) = obs.peek() else { continue };
            if snap.sequence() <= last_seen[i] {
                continue; // nothing new since the previous sample
            }
            last_seen[i] = snap.sequence();
            let value = snap.item_values_f64(0).first().copied().unwrap_or(0.0) * scale;
            if value.is_finite() && value > 0.0 {
                hists[i].saturating_record(value.round() as u64);
            }
        }
        if !any_live {
            break;
        }
        thread::sleep(interval);
    }

    let stem = ctx.cfg_str("filename").unwrap_or("histogram");
    let path = ctx.directory_prefix().join(format!("{stem}.txt"));
    let mut out = BufWriter::new(File::create(&path)?);
    for (i, hist) in hists.iter().enumerate() {
        info!(
            observer = i,
            entries = hist.len(),
            p50 = hist.value_at_quantile(0.5),
            p90 = hist.value_at_quantile(0.9),
            p99 = hist.value_at_quantile(0.99),
            max = hist.max(),
            "histogram summary"
        );
        writeln!(out, "# observer {i}: {} entries", hist.len())?;
        for q in [0.1, 0.25, 0.5, 0.75, 0.9, 0.99, 1.0] {
            writeln!(out, "{q}\t{}", hist.value_at_quantile(q))?;
        }
    }
    out.flush()?;
    Ok(())
}
