//! Engine lifecycle: init, start, stop.
//!
//! At most one [`Engine`] is active per [`EngineRegistry`]; [`Engine::init`]
//! claims the process-wide registry and the slot is released when the engine
//! is dropped.

use crate::aggregator::Aggregator;
use crate::app_table::AppTable;
use crate::config::{FlowstatConfig, NormalizedConfig};
use crate::error::{EngineError, Result, StartError};
use crate::exporter::{run_export_task, Exporter};
use crate::metrics::MetricsCollector;
use crate::reload::{run_reload_task, SharedTable, TableReloader};
use crate::rib::AsTable;
use crate::sink::MetricSink;
use crate::source::{PortDriver, PortStats};
use crate::stats::{run_stats_task, EngineStats, PortStatsCell, StatsReporter, StatsSnapshot};
use crate::worker::{CaptureWorker, FlowClassifier, PortQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

static GLOBAL_REGISTRY: EngineRegistry = EngineRegistry::new();

/// Slot for the single active engine.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    active: AtomicBool,
}

impl EngineRegistry {
    pub const fn new() -> Self {
        EngineRegistry {
            active: AtomicBool::new(false),
        }
    }

    /// The registry used by [`Engine::init`].
    pub fn global() -> &'static EngineRegistry {
        &GLOBAL_REGISTRY
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn release(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Resources that exist only after a successful start.
struct Running {
    exporter: Arc<Exporter>,
    reporter: Arc<Mutex<StatsReporter>>,
    metrics: MetricsCollector,
    workers: Vec<thread::JoinHandle<()>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// The flow capture engine.
pub struct Engine {
    config: NormalizedConfig,
    registry: &'static EngineRegistry,
    shutdown: CancellationToken,
    stats: Arc<EngineStats>,
    aggregators: Vec<Arc<Aggregator>>,
    as_table: Arc<SharedTable<AsTable>>,
    apps: Arc<SharedTable<AppTable>>,
    running: Option<Running>,
}

impl Engine {
    /// Validates `config` and claims the process-wide engine slot.
    pub fn init(config: &FlowstatConfig) -> Result<Engine> {
        Self::init_in(EngineRegistry::global(), config)
    }

    /// Like [`init`](Self::init), claiming the slot of `registry` instead.
    pub fn init_in(registry: &'static EngineRegistry, config: &FlowstatConfig) -> Result<Engine> {
        let config = config.normalize()?;
        if !registry.claim() {
            return Err(EngineError::SingletonViolation);
        }

        let aggregators = config
            .cores
            .iter()
            .map(|core| Arc::new(Aggregator::new(core.index, config.max_flows_per_core)))
            .collect();

        info!(
            cores = config.cores.len(),
            interval_secs = config.interval.as_secs(),
            "flowstat: engine initialized"
        );

        Ok(Engine {
            config,
            registry,
            shutdown: CancellationToken::new(),
            stats: Arc::new(EngineStats::default()),
            aggregators,
            as_table: Arc::new(SharedTable::new(AsTable::new())),
            apps: Arc::new(SharedTable::new(AppTable::new())),
            running: None,
        })
    }

    /// Opens every configured port through `driver`, loads the lookup tables
    /// and starts the capture workers and timer tasks.
    ///
    /// Must be called from within a tokio runtime. Table load failures are
    /// logged and leave the tables empty.
    pub fn start(
        &mut self,
        driver: &dyn PortDriver,
        sink: Arc<dyn MetricSink>,
    ) -> std::result::Result<(), StartError> {
        let handle = Handle::try_current().map_err(|_| StartError::NoRuntime)?;
        if self.running.is_some() || self.shutdown.is_cancelled() {
            return Err(StartError::AlreadyStarted);
        }
        let metrics = MetricsCollector::new()?;

        // open all ports before anything is spawned
        let mut queues = Vec::with_capacity(self.config.cores.len());
        let mut port_cells: Vec<(u8, PortStatsCell)> = Vec::new();
        for core in &self.config.cores {
            let mut ports = Vec::with_capacity(core.ports.len());
            for port in &core.ports {
                let source = driver.open(port).map_err(|source| StartError::PortOpen {
                    port: port.index,
                    source,
                })?;
                let cell: PortStatsCell = Arc::new(Mutex::new(PortStats::default()));
                port_cells.push((port.index, Arc::clone(&cell)));
                ports.push(PortQueue {
                    spec: port.clone(),
                    source,
                    stats: cell,
                });
            }
            queues.push(ports);
        }

        let (as_reloader, app_reloader) = self.load_tables(&metrics);

        let classifier = Arc::new(FlowClassifier::new(
            self.config.local_networks.clone(),
            self.config.aggregation,
        ));
        let mut workers = Vec::with_capacity(queues.len());
        for ((core, ports), aggregator) in self
            .config
            .cores
            .iter()
            .zip(queues)
            .zip(&self.aggregators)
        {
            let worker = CaptureWorker::new(
                core,
                ports,
                Arc::clone(&classifier),
                Arc::clone(aggregator),
                Arc::clone(&self.as_table),
                Arc::clone(&self.stats),
                self.shutdown.clone(),
            )
            .pinned(self.config.pin_workers);
            match worker.spawn() {
                Ok(handle) => workers.push(handle),
                Err(source) => {
                    // stop the workers already running
                    self.shutdown.cancel();
                    return Err(StartError::WorkerSpawn {
                        core: core.index,
                        source,
                    });
                }
            }
        }

        let descriptions: HashMap<u8, String> = self
            .config
            .cores
            .iter()
            .flat_map(|core| core.ports.iter())
            .map(|port| (port.index, port.description.clone()))
            .collect();
        let exporter = Arc::new(Exporter::new(
            self.aggregators.clone(),
            descriptions,
            Arc::clone(&self.apps),
            sink,
            Arc::clone(&self.stats),
            metrics.clone(),
        ));
        let port_count = port_cells.len();
        let reporter = Arc::new(Mutex::new(StatsReporter::new(
            Arc::clone(&self.stats),
            port_cells,
            self.aggregators.clone(),
            metrics.clone(),
        )));

        let tasks = vec![
            handle.spawn(run_reload_task(
                as_reloader,
                app_reloader,
                metrics.clone(),
                self.shutdown.clone(),
            )),
            handle.spawn(run_export_task(
                Arc::clone(&exporter),
                self.config.interval,
                self.shutdown.clone(),
            )),
            handle.spawn(run_stats_task(
                Arc::clone(&reporter),
                self.config.stats_interval,
                self.shutdown.clone(),
            )),
        ];

        info!(
            workers = workers.len(),
            ports = port_count,
            "flowstat: engine started"
        );
        self.running = Some(Running {
            exporter,
            reporter,
            metrics,
            workers,
            tasks,
        });
        Ok(())
    }

    /// Performs the initial table loads and returns the reloaders for the
    /// reload task.
    fn load_tables(
        &self,
        metrics: &MetricsCollector,
    ) -> (Option<TableReloader<AsTable>>, TableReloader<AppTable>) {
        let as_reloader = self.config.mrt_rib_path.clone().map(|path| {
            let sources = vec![path.clone()];
            let mut reloader = TableReloader::new(
                "mrt_rib",
                Arc::clone(&self.as_table),
                sources,
                move || AsTable::load(&path),
            );
            // failures are logged by the reloader and retried on change
            let _ = reloader.load_now(metrics);
            reloader
        });

        let protocols = self.config.protocols_path.clone();
        let services = self.config.services_path.clone();
        let mut app_reloader = TableReloader::new(
            "app_table",
            Arc::clone(&self.apps),
            vec![protocols.clone(), services.clone()],
            move || AppTable::load(&protocols, &services),
        );
        let _ = app_reloader.load_now(metrics);

        (as_reloader, app_reloader)
    }

    /// Signals every worker and task to stop. Does not wait; see
    /// [`wait`](Self::wait).
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!("flowstat: stopping engine");
        }
        self.shutdown.cancel();
    }

    /// Waits for the workers and tasks of a stopped engine to finish, then
    /// runs the final export and reports the remaining stats.
    pub async fn wait(&mut self) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        for task in running.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "engine task failed");
            }
        }
        let workers: Vec<_> = running.workers.drain(..).collect();
        let joined = tokio::task::spawn_blocking(move || {
            for worker in workers {
                if worker.join().is_err() {
                    error!("capture worker panicked");
                }
            }
        })
        .await;
        if let Err(e) = joined {
            warn!(error = %e, "failed to join capture workers");
        }

        // workers are gone, nothing can land in a table after this drain
        let records = running.exporter.export();
        info!(records, "flowstat: final export on shutdown");
        running.reporter.lock().report();
    }

    /// Drains every flow table into the sink now. Returns the number of
    /// records emitted, 0 before start.
    pub fn export_now(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.exporter.export())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some() && !self.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &NormalizedConfig {
        &self.config
    }

    /// Engine counters since init.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Flows currently held across all cores.
    pub fn live_flows(&self) -> usize {
        self.aggregators.iter().map(|a| a.len()).sum()
    }

    /// The currently published AS table.
    pub fn as_table(&self) -> Arc<AsTable> {
        self.as_table.load()
    }

    /// The currently published application table.
    pub fn app_table(&self) -> Arc<AppTable> {
        self.apps.load()
    }

    /// Prometheus text exposition of the engine's counters, once started.
    pub fn metrics_text(&self) -> Option<String> {
        self.running
            .as_ref()
            .map(|running| running.metrics.gather_metrics())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.registry.release();
    }
}
