//! Static worker registry.
//!
//! Worker callables are resolved by name at setup time. The registry
//! replaces the original dynamic module loading: embedders register
//! their callables once (the binary registers the built-in payloads),
//! and setup files refer to them by `fkt_name`.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Result, SluiceError};
use crate::worker::WorkerFn;

static REGISTRY: Lazy<RwLock<HashMap<String, WorkerFn>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a callable under a name. Re-registering a name replaces
/// the previous callable.
pub fn register_worker(name: &str, func: WorkerFn) {
    REGISTRY.write().insert(name.to_string(), func);
}

/// Resolve a callable by name; unresolved names are fatal at setup.
pub fn resolve_worker(name: &str) -> Result<WorkerFn> {
    REGISTRY
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| SluiceError::UnknownWorker {
            name: name.to_string(),
        })
}

/// Names currently registered, sorted (diagnostics).
pub fn registered_workers() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY.read().keys().cloned().collect();
    names.sort();
    names
}
