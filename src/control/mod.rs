//! Buffer controller: builds the topology, runs and supervises it.
//!
//! The controller translates a [`SetupPlan`] into live state in four
//! steps: create the ring buffers in declaration order, resolve each
//! worker's callable/config/endpoints, fork the worker processes in
//! reverse dataflow order (consumers first, so head buffers cannot
//! saturate against missing readers), then supervise on a fixed
//! cadence until the run ends. Shutdown is deterministic: pause the
//! head buffer, let the graph drain, shut every buffer down, join all
//! workers, reclaim whatever they left behind.

pub mod process;
pub mod registry;
pub mod setup;

pub use registry::{register_worker, registered_workers, resolve_worker};
pub use setup::{load_config, BufferDef, RunDirectory, SetupPlan, WorkerDef};

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::constants::{DRAIN_GRACE, SUPERVISE_INTERVAL};
use crate::error::Result;
use crate::ring::RingBuffer;
use crate::worker::{Role, WorkerContext, WorkerFn};

use process::WorkerProcess;

/// User hook points around a run. All default to no-ops.
pub trait RunHooks {
    /// Before any buffer is created.
    fn pre_setup(&mut self) -> Result<()> {
        Ok(())
    }
    /// After all worker processes are started.
    fn post_start(&mut self) -> Result<()> {
        Ok(())
    }
    /// After shutdown completes and all workers are joined.
    fn post_stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The default, hook-less run.
pub struct NoopHooks;

impl RunHooks for NoopHooks {}

/// Outcome of a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// Events committed into the head buffer.
    pub events_processed: u64,
    /// Wall time between worker start and shutdown completion.
    pub elapsed: Duration,
    /// Exit code of every worker process, in start order.
    pub worker_exits: Vec<(String, i32)>,
}

struct PreparedWorker {
    def: WorkerDef,
    func: WorkerFn,
    contexts: Vec<WorkerContext>,
}

/// Owns the buffers and worker processes of one run.
pub struct Controller {
    plan: SetupPlan,
    out_dir: RunDirectory,
    runtime: f64,
    buffers: Vec<Arc<RingBuffer>>,
    prepared: Vec<PreparedWorker>,
    procs: Vec<WorkerProcess>,
}

impl Controller {
    /// Controller with a freshly created run directory.
    pub fn new(plan: SetupPlan) -> Result<Self> {
        let out_dir = RunDirectory::create(&plan.setup_path)?;
        Self::with_output_dir(plan, out_dir)
    }

    /// Controller writing into an existing directory (tests,
    /// embedders).
    pub fn with_output_dir(plan: SetupPlan, out_dir: RunDirectory) -> Result<Self> {
        if plan.setup_path.is_file() {
            out_dir.copy_in(&plan.setup_path)?;
        }
        let runtime = plan.runtime;
        Ok(Self {
            plan,
            out_dir,
            runtime,
            buffers: Vec::new(),
            prepared: Vec::new(),
            procs: Vec::new(),
        })
    }

    /// The run output directory.
    pub fn output_dir(&self) -> &Path {
        self.out_dir.path()
    }

    /// Buffers, in declaration order (available after
    /// [`Controller::setup_buffers`]).
    pub fn buffers(&self) -> &[Arc<RingBuffer>] {
        &self.buffers
    }

    /// Create all ring buffers in declaration order.
    pub fn setup_buffers(&mut self) -> Result<()> {
        for def in &self.plan.buffers {
            self.buffers
                .push(RingBuffer::create(&def.name, def.config.clone())?);
        }
        info!("{} buffers created", self.buffers.len());
        Ok(())
    }

    fn buffer(&self, name: &str) -> &Arc<RingBuffer> {
        self.buffers
            .iter()
            .find(|b| b.name() == name)
            .expect("assignments validated against declared buffers")
    }

    /// Resolve callables and configs, allocate endpoint bundles.
    ///
    /// Each worker definition gets its own reader group per `read`
    /// assignment; the group's readers are cloned across the worker's
    /// replicas, so replicas compete for slots while distinct workers
    /// each see the full stream.
    pub fn setup_workers(&mut self) -> Result<()> {
        let common = match &self.plan.common_config {
            Some(path) => {
                self.out_dir.copy_in(path)?;
                let mapping = load_config(path)?;
                if let Some(Value::Mapping(general)) =
                    mapping.get(&Value::String("general".to_string()))
                {
                    if let Some(runtime) = general
                        .get(&Value::String("runtime".to_string()))
                        .and_then(Value::as_f64)
                    {
                        self.runtime = runtime.max(0.0);
                    }
                }
                Some(mapping)
            }
            None => None,
        };

        let mut total_processes = 0usize;
        for def in &self.plan.workers {
            let func = resolve_worker(&def.fkt_name)?;
            let mut config = self.resolve_worker_config(def, common.as_ref())?;
            config.insert(
                Value::String("directory_prefix".to_string()),
                Value::String(self.out_dir.path().display().to_string()),
            );

            let mut sources = Vec::new();
            let mut sinks = Vec::new();
            let mut observers = Vec::new();
            for (buffer_name, role) in &def.assignments {
                let buffer = self.buffer(buffer_name);
                match role {
                    Role::Read => sources.push(buffer.new_reader_group()?),
                    Role::Write => sinks.push(buffer.new_writer()),
                    Role::Observe => observers.push(buffer.new_observer()),
                }
            }
            let template = WorkerContext {
                sources: (!sources.is_empty()).then_some(sources),
                sinks: (!sinks.is_empty()).then_some(sinks),
                observers: (!observers.is_empty()).then_some(observers),
                config,
                assignments: def.assignments.clone(),
            };
            let contexts = (0..def.processes).map(|_| template.clone()).collect();
            total_processes += def.processes;
            self.prepared.push(PreparedWorker {
                def: def.clone(),
                func,
                contexts,
            });
        }

        let cores = num_cpus::get();
        if total_processes + 1 > cores {
            warn!(
                workers = total_processes,
                cores, "more worker processes than cores; expect scheduling contention"
            );
        }
        Ok(())
    }

    fn resolve_worker_config(
        &self,
        def: &WorkerDef,
        common: Option<&Mapping>,
    ) -> Result<Mapping> {
        let section_key = Value::String(def.fkt_name.clone());
        if let Some(path) = &def.config_file {
            self.out_dir.copy_in(path)?;
            let mapping = load_config(path)?;
            // A top-level section keyed by the callable name wins;
            // otherwise the whole file is the worker's config.
            return Ok(match mapping.get(&section_key) {
                Some(Value::Mapping(section)) => section.clone(),
                _ => mapping,
            });
        }
        if let Some(common) = common {
            if let Some(Value::Mapping(section)) = common.get(&section_key) {
                return Ok(section.clone());
            }
        }
        warn!(worker = %def.fkt_name, "no configuration found");
        Ok(Mapping::new())
    }

    /// Log the buffer table before starting.
    pub fn display_layout(&self) {
        for buffer in &self.buffers {
            info!(
                buffer = %buffer.name(),
                slots = buffer.slots(),
                channels = buffer.channels(),
                layout = %buffer.layout().describe(),
                groups = buffer.reader_groups(),
                "buffer"
            );
        }
    }

    /// Fork all worker processes, last-declared first, so downstream
    /// consumers are running before upstream producers publish.
    pub fn start_workers(&mut self) -> Result<()> {
        let mut prepared = std::mem::take(&mut self.prepared);
        for worker in prepared.iter_mut().rev() {
            for ctx in worker.contexts.drain(..) {
                self.procs
                    .push(WorkerProcess::spawn(&worker.def.fkt_name, worker.func, ctx)?);
            }
        }
        info!("{} workers started", self.procs.len());
        Ok(())
    }

    fn head_events(&self) -> u64 {
        self.buffers.first().map_or(0, |b| b.events_total())
    }

    fn print_status(&self, prefix: &str) {
        let mut line = String::from(prefix);
        for buffer in &self.buffers {
            let st = buffer.status();
            line.push_str(&format!(
                " : {} {:3} ({}) {:.4} Hz",
                buffer.name(),
                st.n_filled,
                st.events_total,
                st.rate_hz
            ));
        }
        print!("\r{line}          ");
        let _ = std::io::stdout().flush();
    }

    /// Supervise until the run's termination condition, then pause the
    /// head buffer and let the graph drain. Returns the head buffer's
    /// event count.
    pub fn supervise(&mut self) -> Result<u64> {
        let start = Instant::now();
        if self.runtime > 0.0 {
            info!(runtime_s = self.runtime, "timed mode");
            while start.elapsed().as_secs_f64() < self.runtime {
                thread::sleep(SUPERVISE_INTERVAL);
                self.harvest_exits()?;
                let remaining = (self.runtime - start.elapsed().as_secs_f64()).max(0.0);
                self.print_status(&format!("Time remaining: {remaining:3.0}s"));
            }
        } else {
            info!("batch mode - running until a worker exits cleanly");
            let spinner = ['|', '/', '-', '\\'];
            let mut step = 0usize;
            loop {
                thread::sleep(SUPERVISE_INTERVAL);
                self.print_status(&format!(" > {} ", spinner[step]));
                step = (step + 1) % spinner.len();
                let mut all_exited = true;
                let mut done = false;
                for proc in &mut self.procs {
                    match proc.poll()? {
                        Some(0) => done = true,
                        Some(_) => {}
                        None => all_exited = false,
                    }
                }
                if done {
                    break;
                }
                if all_exited {
                    warn!("all workers exited without a clean end-of-input signal");
                    break;
                }
            }
        }
        println!();

        if let Some(head) = self.buffers.first() {
            head.pause();
        }
        let events = self.head_events();
        info!(
            elapsed_s = %format!("{:.2}", start.elapsed().as_secs_f64()),
            events, "ingest paused"
        );
        self.drain();
        Ok(events)
    }

    fn harvest_exits(&mut self) -> Result<()> {
        for proc in &mut self.procs {
            proc.poll()?;
        }
        Ok(())
    }

    /// Wait until every buffer reports no filled slots, bounded by the
    /// drain grace period.
    fn drain(&self) {
        let start = Instant::now();
        while start.elapsed() < DRAIN_GRACE {
            if self
                .buffers
                .iter()
                .all(|b| b.free_slots() == b.slots())
            {
                return;
            }
            thread::sleep(Duration::from_millis(50));
        }
        warn!("graph did not drain within the grace period");
    }

    /// Shut every buffer down in declaration order, join all workers,
    /// and reclaim slots crashed workers may have left behind.
    pub fn shutdown(&mut self) -> Result<Vec<(String, i32)>> {
        info!("session ended, sending shutdown");
        for buffer in &self.buffers {
            buffer.shutdown();
        }
        let mut exits = Vec::with_capacity(self.procs.len());
        for proc in &mut self.procs {
            let code = proc.join()?;
            exits.push((proc.name.clone(), code));
        }
        for buffer in &self.buffers {
            buffer.reclaim_orphans();
        }
        info!("all workers joined");
        Ok(exits)
    }
}

/// Run a plan to completion with hooks.
pub fn run_with_hooks(plan: SetupPlan, hooks: &mut dyn RunHooks) -> Result<RunSummary> {
    hooks.pre_setup()?;
    let mut controller = Controller::new(plan)?;
    controller.setup_buffers()?;
    controller.setup_workers()?;
    controller.display_layout();
    controller.start_workers()?;
    hooks.post_start()?;
    let start = Instant::now();
    let events_processed = controller.supervise()?;
    let worker_exits = controller.shutdown()?;
    hooks.post_stop()?;
    Ok(RunSummary {
        events_processed,
        elapsed: start.elapsed(),
        worker_exits,
    })
}

/// Run a plan to completion.
pub fn run(plan: SetupPlan) -> Result<RunSummary> {
    run_with_hooks(plan, &mut NoopHooks)
}
