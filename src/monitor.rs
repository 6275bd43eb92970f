// SPDX-License-Identifier: Apache-2.0

//! The event-driven watch-and-dispatch loop.
//!
//! One dispatch loop owns the filesystem watcher. Each channel runs on its
//! own worker thread behind a bounded queue; change notifications are routed
//! to the owning channels, with bursts for the same path coalesced while a
//! request is queued or in flight. Throttled cycles are re-scheduled after
//! their back-off expires. Shutdown is cooperative: scheduling stops, queued
//! and in-flight cycles drain to a batch boundary, then watches are released.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::channel::{Channel, CycleOutcome};
use crate::error::{Error, Result};
use crate::lock::LockManager;
use crate::source::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Initializing,
    Watching,
    Scheduling,
    Consuming,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How long the dispatch loop waits for events before a housekeeping
    /// tick (due retries, watch refresh).
    pub poll_interval: Duration,
    /// Per-channel work queue depth.
    pub queue_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            queue_size: 64,
        }
    }
}

/// Aggregate result of one monitor run.
#[derive(Debug, Default)]
pub struct MonitorReport {
    pub records: u64,
    pub bytes: u64,
    pub failures: u64,
}

enum WorkItem {
    Consume(PathBuf),
    Forget(PathBuf),
}

struct WorkResult {
    worker: usize,
    path: PathBuf,
    retry_in: Option<Duration>,
    failed: bool,
    records: u64,
    bytes: u64,
}

struct WorkerHandle {
    name: String,
    sources: Vec<Arc<Source>>,
    tx: Option<BoundedSender<WorkItem>>,
    join: JoinHandle<()>,
}

pub struct Monitor {
    config: MonitorConfig,
    locks: LockManager,
    state: MonitorState,
}

impl Monitor {
    pub fn new(locks: LockManager, config: MonitorConfig) -> Self {
        Self {
            config,
            locks,
            state: MonitorState::Initializing,
        }
    }

    fn set_state(&mut self, state: MonitorState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "monitor state");
            self.state = state;
        }
    }

    /// Run the loop until `shutdown` is set. Consumes the channels; they are
    /// handed to their worker threads.
    pub fn run(
        mut self,
        channels: Vec<Channel>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<MonitorReport> {
        self.set_state(MonitorState::Initializing);

        // Sized so a worker can always report without blocking: each queued
        // work item produces exactly one result.
        let results_capacity = channels.len().max(1) * self.config.queue_size + 16;
        let (results_tx, results_rx) = bounded::<WorkResult>(results_capacity);

        // Paths queued or in flight, keyed by worker; arrival of another
        // event for the same path is coalesced into the existing request.
        let mut in_flight: HashSet<(usize, PathBuf)> = HashSet::new();

        let mut workers = Vec::with_capacity(channels.len());
        for (index, mut channel) in channels.into_iter().enumerate() {
            // Seed unseen files per the channel's backfill policy before any
            // consumption is scheduled.
            let mut initial = Vec::new();
            for source in channel.sources() {
                initial.extend(source.resolve_files()?);
            }
            for path in &initial {
                if let Err(e) = channel.seed_path(path) {
                    warn!(channel = channel.name(), path = %path.display(), error = %e, "seed failed");
                }
            }

            let sources = channel.sources().to_vec();
            let name = channel.name().to_string();
            let (tx, rx) = bounded::<WorkItem>(self.config.queue_size);
            let locks = self.locks.clone();
            let worker_results = results_tx.clone();
            let join = std::thread::Builder::new()
                .name(format!("channel-{name}"))
                .spawn(move || run_worker(index, channel, locks, rx, worker_results))
                .map_err(Error::Io)?;

            let handle = WorkerHandle {
                name,
                sources,
                tx: Some(tx),
                join,
            };
            // Catch up: consume everything visible now.
            for path in initial {
                enqueue(&handle, index, path, &mut in_flight);
            }
            workers.push(handle);
        }
        drop(results_tx);

        let (event_tx, event_rx) = mpsc::channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |event| {
                let _ = event_tx.send(event);
            },
            notify::Config::default(),
        )
        .map_err(|e| Error::Config(format!("cannot create watcher: {e}")))?;

        let mut watched: Vec<PathBuf> = Vec::new();
        setup_watches(&mut watcher, &mut watched, &workers);

        info!(channels = workers.len(), dirs = watched.len(), "monitoring");
        self.set_state(MonitorState::Watching);

        // Throttled cycles waiting for their back-off to expire.
        let mut backlog: Vec<(Instant, usize, PathBuf)> = Vec::new();
        let mut report = MonitorReport::default();

        while !shutdown.load(Ordering::SeqCst) {
            match event_rx.recv_timeout(self.config.poll_interval) {
                Ok(Ok(event)) => {
                    if matches!(event.kind, EventKind::Access(_)) {
                        continue;
                    }
                    self.set_state(MonitorState::Scheduling);
                    let removed = matches!(event.kind, EventKind::Remove(_));
                    let created = matches!(event.kind, EventKind::Create(_));
                    for path in &event.paths {
                        dispatch(path, removed, &workers, &mut in_flight);
                    }
                    if created {
                        setup_watches(&mut watcher, &mut watched, &workers);
                    }
                    self.set_state(MonitorState::Watching);
                }
                Ok(Err(e)) => warn!(error = %e, "watcher error"),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    error!("watcher channel disconnected");
                    break;
                }
            }

            drain_results(&results_rx, &mut in_flight, &mut backlog, &mut report);

            // Re-dispatch throttled paths whose back-off has expired.
            let now = Instant::now();
            let mut due = Vec::new();
            backlog.retain(|(at, worker, path)| {
                if *at <= now {
                    due.push((*worker, path.clone()));
                    false
                } else {
                    true
                }
            });
            for (worker, path) in due {
                enqueue(&workers[worker], worker, path, &mut in_flight);
            }

            if in_flight.is_empty() {
                self.set_state(MonitorState::Watching);
            } else {
                self.set_state(MonitorState::Consuming);
            }
        }

        self.set_state(MonitorState::Stopping);
        info!("draining in-flight consumption");
        for worker in &mut workers {
            worker.tx.take();
        }
        for worker in workers {
            if worker.join.join().is_err() {
                error!(channel = %worker.name, "worker panicked");
                report.failures += 1;
            }
        }
        drain_results(&results_rx, &mut in_flight, &mut backlog, &mut report);

        for dir in &watched {
            let _ = watcher.unwatch(dir);
        }
        self.set_state(MonitorState::Stopped);
        info!(
            records = report.records,
            bytes = report.bytes,
            failures = report.failures,
            "monitor stopped"
        );
        Ok(report)
    }
}

/// Route one event path to every owning channel, coalescing duplicates.
fn dispatch(
    path: &Path,
    removed: bool,
    workers: &[WorkerHandle],
    in_flight: &mut HashSet<(usize, PathBuf)>,
) {
    for (index, worker) in workers.iter().enumerate() {
        if !worker.sources.iter().any(|s| s.matches(path)) {
            continue;
        }
        if removed {
            if let Some(tx) = &worker.tx {
                let _ = tx.send_blocking(WorkItem::Forget(path.to_path_buf()));
            }
            in_flight.remove(&(index, path.to_path_buf()));
            continue;
        }
        enqueue(worker, index, path.to_path_buf(), in_flight);
    }
}

fn enqueue(
    worker: &WorkerHandle,
    index: usize,
    path: PathBuf,
    in_flight: &mut HashSet<(usize, PathBuf)>,
) {
    if !in_flight.insert((index, path.clone())) {
        // Already queued or running; the pending cycle will pick up the
        // new data when it reads to EOF.
        return;
    }
    if let Some(tx) = &worker.tx {
        if tx.try_send(WorkItem::Consume(path.clone())).is_err() {
            debug!(channel = %worker.name, path = %path.display(), "work queue full, dropping");
            in_flight.remove(&(index, path));
        }
    }
}

fn drain_results(
    results_rx: &BoundedReceiver<WorkResult>,
    in_flight: &mut HashSet<(usize, PathBuf)>,
    backlog: &mut Vec<(Instant, usize, PathBuf)>,
    report: &mut MonitorReport,
) {
    while let Some(result) = results_rx.try_recv() {
        in_flight.remove(&(result.worker, result.path.clone()));
        report.records += result.records;
        report.bytes += result.bytes;
        if result.failed {
            report.failures += 1;
        }
        if let Some(retry_in) = result.retry_in {
            backlog.push((Instant::now() + retry_in, result.worker, result.path));
        }
    }
}

/// Watch the parent directories of every glob and every resolved file.
/// Non-recursive: sources glob concrete directories.
fn setup_watches(
    watcher: &mut RecommendedWatcher,
    watched: &mut Vec<PathBuf>,
    workers: &[WorkerHandle],
) {
    let mut dirs: Vec<PathBuf> = Vec::new();
    for worker in workers {
        for source in &worker.sources {
            for pattern in source.globs() {
                let mut dir = glob_fixed_prefix(pattern);
                if dir.is_file() {
                    dir.pop();
                }
                if dir.is_dir() && !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
            if let Ok(files) = source.resolve_files() {
                for file in files {
                    if let Some(parent) = file.parent() {
                        let parent = parent.to_path_buf();
                        if parent.is_dir() && !dirs.contains(&parent) {
                            dirs.push(parent);
                        }
                    }
                }
            }
        }
    }

    for dir in &dirs {
        if !watched.contains(dir) {
            match watcher.watch(dir, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    debug!(dir = %dir.display(), "watching");
                    watched.push(dir.clone());
                }
                Err(e) => warn!(dir = %dir.display(), error = %e, "cannot watch"),
            }
        }
    }
}

/// The fixed leading part of a glob pattern, the directory to watch.
fn glob_fixed_prefix(pattern: &str) -> PathBuf {
    let mut dir = PathBuf::new();
    for component in Path::new(pattern).components() {
        let raw = component.as_os_str().to_string_lossy();
        if raw.contains('*') || raw.contains('?') || raw.contains('[') {
            break;
        }
        dir.push(component);
    }
    dir
}

fn run_worker(
    index: usize,
    mut channel: Channel,
    locks: LockManager,
    rx: BoundedReceiver<WorkItem>,
    results_tx: BoundedSender<WorkResult>,
) {
    while let Some(item) = rx.recv_blocking() {
        match item {
            WorkItem::Consume(path) => {
                let mut result = WorkResult {
                    worker: index,
                    path: path.clone(),
                    retry_in: None,
                    failed: false,
                    records: 0,
                    bytes: 0,
                };
                match channel.consume_path(&locks, &path) {
                    Ok(report) => {
                        result.records = report.records;
                        result.bytes = report.bytes;
                        match report.outcome {
                            CycleOutcome::Drained => {}
                            CycleOutcome::Throttled { retry_in } => {
                                result.retry_in = Some(retry_in);
                            }
                            CycleOutcome::Failed { reason } => {
                                error!(
                                    channel = channel.name(),
                                    path = %path.display(),
                                    %reason,
                                    "cycle failed"
                                );
                                result.failed = true;
                            }
                        }
                    }
                    Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        debug!(channel = channel.name(), path = %path.display(), "vanished before consumption");
                        let _ = channel.forget_path(&path);
                    }
                    Err(e) => {
                        error!(channel = channel.name(), path = %path.display(), error = %e, "cycle error");
                        result.failed = true;
                    }
                }
                let _ = results_tx.send_blocking(result);
            }
            WorkItem::Forget(path) => {
                if let Err(e) = channel.forget_path(&path) {
                    warn!(channel = channel.name(), path = %path.display(), error = %e, "untrack failed");
                }
            }
        }
    }
    debug!(channel = channel.name(), "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_prefix_extraction_stops_at_wildcards() {
        assert_eq!(
            glob_fixed_prefix("/var/log/nginx/*.log"),
            PathBuf::from("/var/log/nginx")
        );
        assert_eq!(
            glob_fixed_prefix("/var/log/ng?nx/error.log"),
            PathBuf::from("/var/log")
        );
        assert_eq!(glob_fixed_prefix("*.log"), PathBuf::new());
    }
}
