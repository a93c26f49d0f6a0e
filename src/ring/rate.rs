//! Commit-rate metering.
//!
//! The supervisor samples `events_total` on its status cadence and
//! folds the instantaneous rate into an EWMA with a fixed half-life.
//! Meter state lives in the shared header so the sampled value is the
//! buffer's, not any one process's.

use std::sync::atomic::Ordering;

use crate::constants::RATE_HALF_LIFE_SECS;

use super::shm::RegionHeader;

/// Monotonic clock in microseconds, comparable across the processes of
/// one run.
pub(crate) fn monotonic_micros() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer; CLOCK_MONOTONIC is always
    // available on the supported platforms.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// Fold one sample into the EWMA and return the smoothed rate in Hz.
///
/// Meant for a single sampler (the supervising controller); concurrent
/// callers would only degrade smoothing, not safety.
pub(crate) fn sample(header: &RegionHeader) -> f64 {
    sample_at(header, monotonic_micros())
}

pub(crate) fn sample_at(header: &RegionHeader, now_micros: u64) -> f64 {
    let events = header.events_total.load(Ordering::Relaxed);
    let last_t = header.sample_micros.swap(now_micros, Ordering::Relaxed);
    let last_e = header.sample_events.swap(events, Ordering::Relaxed);

    if last_t == 0 || now_micros <= last_t {
        // First sample (or a clock hiccup): report idle.
        return f64::from_bits(header.rate_bits.load(Ordering::Relaxed));
    }

    let dt = (now_micros - last_t) as f64 / 1e6;
    let inst = events.saturating_sub(last_e) as f64 / dt;
    let alpha = 1.0 - 0.5f64.powf(dt / RATE_HALF_LIFE_SECS);
    let prev = f64::from_bits(header.rate_bits.load(Ordering::Relaxed));
    let rate = prev + alpha * (inst - prev);
    header.rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    rate
}
