//! Simulated detector pulse source.
//!
//! Fills each slot with a sampled exponential pulse on a noisy
//! baseline. Config keys: `number_of_events` (default: run until
//! shutdown), `pulse_height`, `decay_time` (in samples),
//! `noise_level`, `event_rate_hz` (throttle; 0 = as fast as the
//! buffer accepts).

use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::{Result, SluiceError};
use crate::worker::{acquire_blocking, WorkerContext};

pub fn pulse_source(ctx: WorkerContext) -> Result<()> {
    let sinks = ctx
        .sinks
        .as_ref()
        .ok_or_else(|| SluiceError::config("pulse_source needs at least one sink"))?;
    let n_events = ctx.cfg_u64("number_of_events").unwrap_or(u64::MAX);
    let height = ctx.cfg_f64("pulse_height").unwrap_or(1.0);
    let decay = ctx.cfg_f64("decay_time").unwrap_or(25.0).max(1.0);
    let noise = ctx.cfg_f64("noise_level").unwrap_or(0.05);
    let rate = ctx.cfg_f64("event_rate_hz").unwrap_or(0.0);
    let throttle = (rate > 0.0).then(|| Duration::from_secs_f64(1.0 / rate));

    let mut rng = rand::thread_rng();
    let mut produced = 0u64;
    'produce: while produced < n_events {
        for sink in sinks {
            let Some(mut slot) = acquire_blocking(sink) else {
                break 'produce;
            };
            let samples = slot.scalars_mut::<f64>()?;
            // Pulse onset somewhere in the first quarter of the trace.
            let onset = rng.gen_range(0..samples.len().div_ceil(4).max(1));
            for (i, s) in samples.iter_mut().enumerate() {
                let mut v = noise * (rng.gen::<f64>() - 0.5);
                if i >= onset {
                    v += height * (-((i - onset) as f64) / decay).exp();
                }
                *s = v;
            }
            slot.commit();
        }
        produced += 1;
        if let Some(pause) = throttle {
            thread::sleep(pause);
        }
    }
    Ok(())
}
