//! Hot reload of lookup tables.
//!
//! Tables are rebuilt off the packet path whenever their source files get a
//! newer modification time, then published by swapping an `Arc` under a
//! reader-writer lock. Readers only hold the lock long enough to clone the
//! `Arc`, so a capture worker sees either the old or the new table, never a
//! partially built one.

use crate::app_table::AppTable;
use crate::error::ReloadError;
use crate::metrics::MetricsCollector;
use crate::rib::AsTable;
use parking_lot::RwLock;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often source files are checked for changes.
pub const RELOAD_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// An immutable table that can be replaced while readers are active.
#[derive(Debug, Default)]
pub struct SharedTable<T> {
    current: RwLock<Arc<T>>,
}

impl<T> SharedTable<T> {
    pub fn new(table: T) -> Self {
        SharedTable {
            current: RwLock::new(Arc::new(table)),
        }
    }

    /// Returns the currently published table.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.current.read())
    }

    /// Publishes `table`; later [`load`](Self::load) calls observe it.
    pub fn store(&self, table: T) {
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(table));
        // the old table may be large; release it outside the lock
        drop(previous);
    }
}

/// Tracks the newest modification time seen across a set of files.
#[derive(Debug)]
pub(crate) struct MtimeWatch {
    paths: Vec<PathBuf>,
    last_attempt: Option<SystemTime>,
}

impl MtimeWatch {
    pub(crate) fn new(paths: Vec<PathBuf>) -> Self {
        MtimeWatch {
            paths,
            last_attempt: None,
        }
    }

    /// Newest modification time over all paths, or `None` if any of them
    /// cannot be inspected.
    fn newest(&self) -> Option<SystemTime> {
        let mut newest = None;
        for path in &self.paths {
            match fs::metadata(path).and_then(|m| m.modified()) {
                Ok(mtime) => newest = newest.max(Some(mtime)),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "cannot stat table source");
                    return None;
                }
            }
        }
        newest
    }

    /// Returns true, and records the attempt, if the sources changed since
    /// the last recorded attempt.
    pub(crate) fn changed(&mut self) -> bool {
        match self.newest() {
            Some(mtime) if self.last_attempt.map_or(true, |last| mtime > last) => {
                self.last_attempt = Some(mtime);
                true
            }
            _ => false,
        }
    }

    /// Records the current modification time as attempted.
    pub(crate) fn mark(&mut self) {
        self.last_attempt = self.newest();
    }
}

type BuildFn<T> = Arc<dyn Fn() -> Result<T, ReloadError> + Send + Sync>;

/// Rebuilds one [`SharedTable`] from its sources when they change.
pub(crate) struct TableReloader<T> {
    name: &'static str,
    table: Arc<SharedTable<T>>,
    watch: MtimeWatch,
    build: BuildFn<T>,
}

impl<T: Send + Sync + 'static> TableReloader<T> {
    pub(crate) fn new<F>(
        name: &'static str,
        table: Arc<SharedTable<T>>,
        sources: Vec<PathBuf>,
        build: F,
    ) -> Self
    where
        F: Fn() -> Result<T, ReloadError> + Send + Sync + 'static,
    {
        TableReloader {
            name,
            table,
            watch: MtimeWatch::new(sources),
            build: Arc::new(build),
        }
    }

    /// Builds and publishes the table on the calling thread.
    ///
    /// The attempt is recorded even if it fails, so an unchanged broken
    /// source is not retried on every check.
    pub(crate) fn load_now(&mut self, metrics: &MetricsCollector) -> Result<(), ReloadError> {
        self.watch.mark();
        let result = (self.build)();
        self.publish(result, metrics)
    }

    /// Rebuilds on the blocking pool if the sources changed.
    pub(crate) async fn poll(&mut self, metrics: &MetricsCollector) {
        if !self.watch.changed() {
            return;
        }
        info!(table = self.name, "table source changed, rebuilding");
        let build = Arc::clone(&self.build);
        let result = match tokio::task::spawn_blocking(move || build()).await {
            Ok(result) => result,
            Err(e) => {
                warn!(table = self.name, error = %e, "table rebuild task failed");
                metrics.record_reload(self.name, false);
                return;
            }
        };
        // already logged inside publish
        let _ = self.publish(result, metrics);
    }

    fn publish(
        &self,
        result: Result<T, ReloadError>,
        metrics: &MetricsCollector,
    ) -> Result<(), ReloadError> {
        match result {
            Ok(table) => {
                self.table.store(table);
                metrics.record_reload(self.name, true);
                info!(table = self.name, "published new table");
                Ok(())
            }
            Err(e) => {
                warn!(
                    table = self.name,
                    error = %e,
                    "table rebuild failed, keeping previous table"
                );
                metrics.record_reload(self.name, false);
                Err(e)
            }
        }
    }
}

/// Checks every reloader once per [`RELOAD_CHECK_INTERVAL`] until cancelled.
pub(crate) async fn run_reload_task(
    mut as_table: Option<TableReloader<AsTable>>,
    mut apps: TableReloader<AppTable>,
    metrics: MetricsCollector,
    shutdown: CancellationToken,
) {
    let mut tick = tokio::time::interval(RELOAD_CHECK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately and the initial load already ran
    tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                if let Some(reloader) = as_table.as_mut() {
                    reloader.poll(&metrics).await;
                }
                apps.poll(&metrics).await;
            }
        }
    }
    debug!("reload task stopped");
}
