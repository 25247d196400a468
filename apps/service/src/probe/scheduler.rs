//! Schedule-entry bookkeeping and the coordinating loop.
//!
//! The loop is the single writer of the entry table. Probes run as spawned
//! tasks gated by a semaphore-bounded worker pool and report back through
//! an mpsc channel, so a stalled probe can never block tick detection for
//! other entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tracing::{debug, info, warn};

use super::executor::ExecuteProbe;
use super::types::{EntryKey, ProbeOutcome, ResolvedCheck};
use crate::emitter::Emitter;

/// Granularity of due-time detection. Per-entry intervals are independent
/// of this rate; it only bounds dispatch latency.
const TICK: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct ScheduleEntry {
    check: Arc<ResolvedCheck>,
    next_due: Instant,
    in_flight: bool,
}

/// Spawned probe tasks plus the entry each task belongs to, so a panicked
/// task can be traced back to its schedule entry.
#[derive(Default)]
struct InFlightTasks {
    set: JoinSet<()>,
    keys: HashMap<tokio::task::Id, EntryKey>,
}

/// Owns all schedule entries and drives them on their own intervals.
pub struct Scheduler {
    entries: HashMap<EntryKey, ScheduleEntry>,
    executor: Arc<dyn ExecuteProbe>,
    emitter: Emitter,
    workers: Arc<Semaphore>,
    grace: Duration,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn ExecuteProbe>,
        emitter: Emitter,
        concurrency: usize,
        grace: Duration,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            executor,
            emitter,
            workers: Arc::new(Semaphore::new(concurrency.max(1))),
            grace,
        }
    }

    /// Install the initial check set; everything is due immediately.
    pub fn install(&mut self, checks: Vec<ResolvedCheck>) {
        let now = Instant::now();
        for check in checks {
            self.entries.insert(
                check.key(),
                ScheduleEntry { check: Arc::new(check), next_due: now, in_flight: false },
            );
        }
    }

    /// Replace the entry set with a freshly validated one. Unchanged
    /// entries keep their due times; removed entries are dropped (an
    /// in-flight result still emits, it just no longer reschedules);
    /// added and changed entries become due immediately.
    fn apply(&mut self, checks: Vec<ResolvedCheck>) {
        let now = Instant::now();
        let mut incoming: HashMap<EntryKey, ResolvedCheck> =
            checks.into_iter().map(|check| (check.key(), check)).collect();

        let before = self.entries.len();
        self.entries.retain(|key, _| incoming.contains_key(key));
        let removed = before - self.entries.len();

        let mut changed = 0;
        for (key, entry) in self.entries.iter_mut() {
            // retained above, so the key is present
            let Some(fresh) = incoming.remove(key) else { continue };
            if *entry.check != fresh {
                entry.check = Arc::new(fresh);
                entry.next_due = now;
                changed += 1;
            }
        }

        let added = incoming.len();
        for (key, check) in incoming {
            self.entries
                .insert(key, ScheduleEntry { check: Arc::new(check), next_due: now, in_flight: false });
        }

        info!(added, removed, changed, total = self.entries.len(), "schedule updated");
    }

    /// Run until the shutdown signal flips, then drain in-flight probes
    /// for the grace period.
    pub async fn run(
        mut self,
        mut reloads: mpsc::Receiver<Vec<ResolvedCheck>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (result_tx, mut result_rx) = mpsc::channel::<(EntryKey, ProbeOutcome)>(256);
        let mut tasks = InFlightTasks::default();
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_due(&result_tx, &mut tasks),
                Some((key, outcome)) = result_rx.recv() => self.complete(&key, outcome),
                Some(checks) = reloads.recv() => self.apply(checks),
                Some(joined) = tasks.set.join_next_with_id(), if !tasks.set.is_empty() => {
                    self.reap(&mut tasks, joined)
                }
                _ = shutdown.changed() => break,
            }
        }

        self.drain(&mut tasks, &mut result_rx).await;
    }

    /// Task bookkeeping on join. A clean join already reported through the
    /// result channel; a panicked probe never did, so its entry is reset
    /// here instead of staying in-flight forever.
    fn reap(
        &mut self,
        tasks: &mut InFlightTasks,
        joined: Result<(tokio::task::Id, ()), tokio::task::JoinError>,
    ) {
        match joined {
            Ok((id, ())) => {
                tasks.keys.remove(&id);
            }
            Err(join_error) => {
                let Some(key) = tasks.keys.remove(&join_error.id()) else { return };
                warn!(entry = %key, error = %join_error, "probe task failed");
                if let Some(entry) = self.entries.get_mut(&key) {
                    entry.in_flight = false;
                    entry.next_due = Instant::now() + entry.check.interval;
                }
            }
        }
    }

    /// Dispatch every due, idle entry into the worker pool. A saturated
    /// pool makes the spawned task wait on the semaphore, never this loop.
    fn dispatch_due(
        &mut self,
        result_tx: &mpsc::Sender<(EntryKey, ProbeOutcome)>,
        tasks: &mut InFlightTasks,
    ) {
        let now = Instant::now();
        for (key, entry) in self.entries.iter_mut() {
            if entry.next_due > now {
                continue;
            }
            if entry.in_flight {
                // skip rather than queue: overlap must not build a backlog
                warn!(entry = %key, "previous probe still running at due time, skipping tick");
                entry.next_due = now + entry.check.interval;
                continue;
            }

            entry.in_flight = true;
            entry.next_due = now + entry.check.interval;
            debug!(entry = %key, "dispatching probe");

            let check = Arc::clone(&entry.check);
            let key = key.clone();
            let executor = Arc::clone(&self.executor);
            let workers = Arc::clone(&self.workers);
            let tx = result_tx.clone();
            let handle = tasks.set.spawn({
                let key = key.clone();
                async move {
                    let Ok(_permit) = workers.acquire_owned().await else { return };
                    let outcome = executor.execute(&check).await;
                    if tx.send((key, outcome)).await.is_err() {
                        warn!("result channel closed, dropping probe outcome");
                    }
                }
            });
            tasks.keys.insert(handle.id(), key);
        }
    }

    /// Outcome delivery: emit, clear the in-flight flag and reschedule
    /// from completion time so stalls never cause catch-up bursts.
    fn complete(&mut self, key: &EntryKey, outcome: ProbeOutcome) {
        self.emitter.emit(&outcome);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.in_flight = false;
            entry.next_due = Instant::now() + entry.check.interval;
        }
    }

    async fn drain(
        &mut self,
        tasks: &mut InFlightTasks,
        result_rx: &mut mpsc::Receiver<(EntryKey, ProbeOutcome)>,
    ) {
        if !tasks.set.is_empty() {
            info!(in_flight = tasks.set.len(), "draining in-flight probes");
        }
        let deadline = Instant::now() + self.grace;
        while !tasks.set.is_empty() {
            tokio::select! {
                _ = sleep_until(deadline) => {
                    warn!(
                        remaining = tasks.set.len(),
                        "shutdown grace elapsed, aborting remaining probes"
                    );
                    tasks.set.abort_all();
                    break;
                }
                Some(joined) = tasks.set.join_next_with_id() => self.reap(tasks, joined),
                Some((key, outcome)) = result_rx.recv() => self.complete(&key, outcome),
            }
        }
        // results from tasks that finished right before abort
        while let Ok((key, outcome)) = result_rx.try_recv() {
            self.complete(&key, outcome);
        }
    }
}
