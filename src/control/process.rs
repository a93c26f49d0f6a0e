//! Worker process control.
//!
//! Workers are forked from the controller after the buffers exist, so
//! the children inherit the shared mappings and their endpoint
//! bundles. A child runs its callable and terminates with `_exit`,
//! reporting success (0) or failure through its exit code; the
//! controller never marshals errors across the process boundary.

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::worker::{WorkerContext, WorkerFn};

/// A spawned worker process.
pub(crate) struct WorkerProcess {
    pub name: String,
    pub pid: Pid,
    exit_code: Option<i32>,
}

impl WorkerProcess {
    /// Fork and run `func(ctx)` in the child.
    ///
    /// The controller must still be single-threaded here; fork only
    /// preserves the calling thread.
    pub fn spawn(name: &str, func: WorkerFn, ctx: WorkerContext) -> Result<Self> {
        // SAFETY: called before the controller spawns any thread; the
        // child only touches its own context and the shared regions,
        // then leaves via _exit without unwinding into parent state.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let code = match func(ctx) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(worker = name, error = %e, "worker failed");
                        1
                    }
                };
                // SAFETY: terminating the child without running the
                // parent's atexit handlers or flushing its inherited
                // buffers twice.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                debug!(worker = name, pid = %child, "worker started");
                Ok(Self {
                    name: name.to_string(),
                    pid: child,
                    exit_code: None,
                })
            }
        }
    }

    /// Non-blocking exit check; remembers the code once reaped.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::Exited(_, code) => {
                if code == 0 {
                    debug!(worker = %self.name, pid = %self.pid, "worker exited cleanly");
                } else {
                    warn!(worker = %self.name, pid = %self.pid, code, "worker crashed");
                }
                self.exit_code = Some(code);
            }
            WaitStatus::Signaled(_, signal, _) => {
                error!(worker = %self.name, pid = %self.pid, ?signal, "worker killed");
                self.exit_code = Some(128 + signal as i32);
            }
            _ => {}
        }
        Ok(self.exit_code)
    }

    /// Blocking join.
    pub fn join(&mut self) -> Result<i32> {
        loop {
            if let Some(code) = self.exit_code {
                return Ok(code);
            }
            match waitpid(self.pid, None)? {
                WaitStatus::Exited(_, code) => self.exit_code = Some(code),
                WaitStatus::Signaled(_, signal, _) => self.exit_code = Some(128 + signal as i32),
                _ => continue,
            }
        }
    }

    /// Exit code, if the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }
}
