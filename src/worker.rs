//! Worker callable contract.
//!
//! A worker is a plain function run in its own process, bound to the
//! endpoint bundle the controller allocated for it. Absent endpoint
//! kinds are `None` (the "none" sentinel, distinct from an empty
//! list); workers pattern-match on that to decide their loop shape.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::Result;
use crate::ring::{Observer, Reader, WriteGuard, Writer};

/// How a worker uses an assigned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Read,
    Write,
    Observe,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Read => "read",
            Role::Write => "write",
            Role::Observe => "observe",
        })
    }
}

/// Signature every registered worker callable has.
pub type WorkerFn = fn(WorkerContext) -> Result<()>;

/// Everything a worker process receives: its endpoints, resolved
/// configuration, and the buffer-name-to-role assignment it was
/// declared with.
#[derive(Clone)]
pub struct WorkerContext {
    /// Reader endpoints, one per buffer assigned with role `read`.
    pub sources: Option<Vec<Reader>>,
    /// Writer endpoints, one per buffer assigned with role `write`.
    pub sinks: Option<Vec<Writer>>,
    /// Observer endpoints, one per buffer assigned with role `observe`.
    pub observers: Option<Vec<Observer>>,
    /// Resolved configuration section, with `directory_prefix`
    /// injected by the controller.
    pub config: Mapping,
    /// The declared assignment map.
    pub assignments: BTreeMap<String, Role>,
}

impl WorkerContext {
    /// Raw config value.
    pub fn cfg(&self, key: &str) -> Option<&Value> {
        self.config.get(&Value::String(key.to_string()))
    }

    pub fn cfg_str(&self, key: &str) -> Option<&str> {
        self.cfg(key).and_then(Value::as_str)
    }

    pub fn cfg_f64(&self, key: &str) -> Option<f64> {
        self.cfg(key).and_then(Value::as_f64)
    }

    pub fn cfg_u64(&self, key: &str) -> Option<u64> {
        self.cfg(key).and_then(Value::as_u64)
    }

    /// Run output directory injected by the controller; workers place
    /// their artifacts beneath it.
    pub fn directory_prefix(&self) -> PathBuf {
        self.cfg_str("directory_prefix")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Acquire that survives pauses: retries while ingest is merely
/// paused, gives up (`None`) only on shutdown. Producer workers use
/// this so a controller pause does not terminate them.
pub fn acquire_blocking(writer: &Writer) -> Option<WriteGuard> {
    loop {
        match writer.acquire() {
            Some(guard) => return Some(guard),
            None if writer.is_shutdown() => return None,
            None => thread::sleep(Duration::from_millis(10)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(config: Mapping) -> WorkerContext {
        WorkerContext {
            sources: None,
            sinks: None,
            observers: None,
            config,
            assignments: BTreeMap::new(),
        }
    }

    #[test]
    fn config_accessors() {
        let config: Mapping =
            serde_yaml::from_str("{rate: 2.5, count: 7, name: pulse, directory_prefix: /tmp/run}")
                .unwrap();
        let ctx = ctx_with(config);
        assert_eq!(ctx.cfg_f64("rate"), Some(2.5));
        assert_eq!(ctx.cfg_u64("count"), Some(7));
        assert_eq!(ctx.cfg_str("name"), Some("pulse"));
        assert_eq!(ctx.directory_prefix(), PathBuf::from("/tmp/run"));
        assert!(ctx.cfg("missing").is_none());
    }

    #[test]
    fn directory_prefix_defaults_to_cwd() {
        let ctx = ctx_with(Mapping::new());
        assert_eq!(ctx.directory_prefix(), PathBuf::from("."));
    }

    #[test]
    fn role_parses_lowercase() {
        let role: Role = serde_yaml::from_str("observe").unwrap();
        assert_eq!(role, Role::Observe);
        assert_eq!(role.to_string(), "observe");
    }
}
