//! Setup-file loading and the run output directory.
//!
//! The setup file declares the topology in two ordered sections:
//!
//! ```yaml
//! RingBuffer:
//!   - RB_1:
//!       number_of_slots: 16
//!       channel_per_slot: 250
//!       data_type: float
//! Functions:
//!   - Fkt_main:
//!       runtime: 60
//!       config_file: config/common.yaml
//!   - Fkt_1:
//!       file_name: workers/pulse_source
//!       fkt_name: pulse_source
//!       num_process: 1
//!       RB_assign: {RB_1: write}
//! ```
//!
//! Buffer and function names must be consecutive (`RB_1`, `RB_2`, ...;
//! `Fkt_main`, `Fkt_1`, ...); violations, unknown roles, unknown
//! types, and references to undefined buffers are configuration errors
//! that abort before any worker starts.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::config_error;
use crate::error::{Result, SluiceError};
use crate::layout::SlotLayout;
use crate::ring::BufferConfig;
use crate::worker::Role;

#[derive(Debug, Deserialize)]
struct SetupFile {
    #[serde(rename = "RingBuffer")]
    ring_buffers: Vec<BTreeMap<String, BufferSpec>>,
    #[serde(rename = "Functions")]
    functions: Vec<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BufferSpec {
    number_of_slots: usize,
    channel_per_slot: usize,
    data_type: Value,
}

#[derive(Debug, Default, Deserialize)]
struct MainSpec {
    #[serde(default)]
    runtime: Option<f64>,
    #[serde(default)]
    config_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct WorkerSpec {
    file_name: String,
    fkt_name: String,
    #[serde(default = "default_processes")]
    num_process: usize,
    #[serde(rename = "RB_assign", default)]
    rb_assign: BTreeMap<String, Role>,
    #[serde(default)]
    config_file: Option<PathBuf>,
}

fn default_processes() -> usize {
    1
}

/// One declared buffer.
#[derive(Debug, Clone)]
pub struct BufferDef {
    pub name: String,
    pub config: BufferConfig,
}

/// One declared worker function.
#[derive(Debug, Clone)]
pub struct WorkerDef {
    /// Declaration name (`Fkt_1`, ...).
    pub name: String,
    /// Module path the original declaration carries; kept for
    /// diagnostics, resolution goes through the registry.
    pub file_name: String,
    /// Registered callable name.
    pub fkt_name: String,
    /// Replication count.
    pub processes: usize,
    /// Buffer name -> role.
    pub assignments: BTreeMap<String, Role>,
    /// Worker-specific config file, overriding the common one.
    pub config_file: Option<PathBuf>,
}

/// A validated, lowered setup.
#[derive(Debug, Clone)]
pub struct SetupPlan {
    pub setup_path: PathBuf,
    /// Seconds of timed running; 0 selects batch mode.
    pub runtime: f64,
    pub common_config: Option<PathBuf>,
    pub buffers: Vec<BufferDef>,
    pub workers: Vec<WorkerDef>,
}

impl SetupPlan {
    /// Load and validate a setup file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            SluiceError::config(format!("cannot read setup file '{}': {e}", path.display()))
        })?;
        let file: SetupFile = serde_yaml::from_str(&text)?;
        Self::lower(path, file)
    }

    fn lower(path: &Path, file: SetupFile) -> Result<Self> {
        if file.ring_buffers.is_empty() {
            return Err(SluiceError::config("setup declares no ring buffers"));
        }
        let mut buffers = Vec::with_capacity(file.ring_buffers.len());
        for (i, entry) in file.ring_buffers.into_iter().enumerate() {
            let expected = format!("RB_{}", i + 1);
            let spec = single_entry(entry, &expected, "RingBuffer")?;
            let layout = SlotLayout::from_spec(&spec.data_type)
                .map_err(|e| config_error!("{expected}: {e}"))?;
            let config = BufferConfig::new(spec.number_of_slots, spec.channel_per_slot, layout)
                .map_err(|e| config_error!("{expected}: {e}"))?;
            buffers.push(BufferDef {
                name: expected,
                config,
            });
        }

        let mut functions = file.functions.into_iter();
        let main_entry = functions
            .next()
            .ok_or_else(|| SluiceError::config("Functions section is empty"))?;
        let main_value = single_entry(main_entry, "Fkt_main", "Functions")?;
        let main: MainSpec = serde_yaml::from_value(main_value)?;

        let mut workers = Vec::new();
        for (i, entry) in functions.enumerate() {
            let expected = format!("Fkt_{}", i + 1);
            let value = single_entry(entry, &expected, "Functions")?;
            let spec: WorkerSpec = serde_yaml::from_value(value)
                .map_err(|e| config_error!("{expected}: {e}"))?;
            if spec.num_process == 0 {
                return Err(config_error!("{expected}: num_process must be at least 1"));
            }
            for buffer in spec.rb_assign.keys() {
                if !buffers.iter().any(|b| &b.name == buffer) {
                    return Err(config_error!(
                        "{expected}: assigned buffer '{buffer}' is not declared"
                    ));
                }
            }
            let has_stop_signal = spec
                .rb_assign
                .values()
                .any(|r| matches!(r, Role::Read | Role::Observe));
            if !has_stop_signal {
                // No source and no observer: such a worker never sees
                // end-of-stream and only stops with the whole run.
                warn!(
                    worker = %spec.fkt_name,
                    "{expected} has neither sources nor observers; it will run until shutdown"
                );
            }
            workers.push(WorkerDef {
                name: expected,
                file_name: spec.file_name,
                fkt_name: spec.fkt_name,
                processes: spec.num_process,
                assignments: spec.rb_assign,
                config_file: spec.config_file,
            });
        }
        if workers.is_empty() {
            return Err(SluiceError::config("setup declares no worker functions"));
        }

        Ok(Self {
            setup_path: path.to_path_buf(),
            runtime: main.runtime.unwrap_or(0.0).max(0.0),
            common_config: main.config_file,
            buffers,
            workers,
        })
    }
}

fn single_entry<T>(entry: BTreeMap<String, T>, expected: &str, section: &str) -> Result<T> {
    if entry.len() != 1 {
        return Err(config_error!(
            "{section} entries must have exactly one key, expected '{expected}'"
        ));
    }
    let (name, value) = entry.into_iter().next().expect("len checked");
    if name != expected {
        return Err(config_error!(
            "{section} entry '{name}' out of order, expected '{expected}'"
        ));
    }
    Ok(value)
}

/// Load a YAML config file as a mapping.
pub fn load_config(path: &Path) -> Result<Mapping> {
    let text = fs::read_to_string(path).map_err(|e| {
        SluiceError::config(format!("cannot read config file '{}': {e}", path.display()))
    })?;
    let value: Value = serde_yaml::from_str(&text)?;
    match value {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        _ => Err(config_error!(
            "config file '{}' is not a mapping",
            path.display()
        )),
    }
}

/// The per-run output directory: `target/<setup-stem>_<timestamp>/`,
/// created with restricted permissions. Holds copies of the setup and
/// config files plus everything the workers produce.
#[derive(Debug, Clone)]
pub struct RunDirectory {
    path: PathBuf,
}

impl RunDirectory {
    pub fn create(setup_path: &Path) -> Result<Self> {
        let stem = setup_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "run".to_string());
        let (y, mo, d, h, mi, s) = local_time();
        let dir = PathBuf::from("target").join(format!(
            "{stem}_{y:04}-{mo:02}-{d:02}_{h:02}{mi:02}{s:02}"
        ));
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o770)
            .create(&dir)?;
        Ok(Self { path: dir })
    }

    /// Use an existing directory (tests, embedders).
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy a referenced file into the run directory, keeping its file
    /// name.
    pub fn copy_in(&self, file: &Path) -> Result<PathBuf> {
        let name = file
            .file_name()
            .ok_or_else(|| config_error!("'{}' has no file name", file.display()))?;
        let dest = self.path.join(name);
        fs::copy(file, &dest)?;
        Ok(dest)
    }
}

fn local_time() -> (i32, u32, u32, u32, u32, u32) {
    let now = unsafe { libc::time(std::ptr::null_mut()) };
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: now is a valid time_t, tm a valid out-pointer.
    unsafe {
        libc::localtime_r(&now, &mut tm);
    }
    (
        tm.tm_year + 1900,
        tm.tm_mon as u32 + 1,
        tm.tm_mday as u32,
        tm.tm_hour as u32,
        tm.tm_min as u32,
        tm.tm_sec as u32,
    )
}
