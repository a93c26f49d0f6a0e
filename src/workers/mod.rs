//! Built-in worker payloads.
//!
//! These are the stock callables the `sluice` binary registers:
//! simulation and file sources, a transform stage, text/raw sinks, and
//! an observer-driven histogram. Embedders register their own
//! callables next to them with
//! [`register_worker`](crate::control::register_worker).

pub mod file_source;
pub mod histogram;
pub mod pulse_source;
pub mod save_files;
pub mod transform;

pub use file_source::file_source;
pub use histogram::histogram;
pub use pulse_source::pulse_source;
pub use save_files::{save_raw, save_to_txt};
pub use transform::downsample;

use crate::control::register_worker;

/// Register every built-in payload under its canonical name.
pub fn register_builtin() {
    register_worker("pulse_source", pulse_source);
    register_worker("file_source", file_source);
    register_worker("downsample", downsample);
    register_worker("save_to_txt", save_to_txt);
    register_worker("save_raw", save_raw);
    register_worker("histogram", histogram);
}
