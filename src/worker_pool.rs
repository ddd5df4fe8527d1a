//! Fixed-size worker pool with shared-memory-style heartbeats and a
//! watchdog (spec §4.13, §5).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{info, warn};

/// Heartbeat counters, one slot per worker, each written only by its
/// own worker (spec §5 "single-writer-per-counter").
pub struct Heartbeats {
    counters: Vec<AtomicU64>,
}

impl Heartbeats {
    fn new(n: usize) -> Self {
        Self {
            counters: (0..n).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn beat(&self, slot: usize) {
        self.counters[slot].fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, slot: usize) -> u64 {
        self.counters[slot].load(Ordering::Relaxed)
    }
}

/// Shared termination flag polled by workers between items (spec §5
/// "Cancellation").
#[derive(Clone)]
pub struct TerminationLock(Arc<AtomicBool>);

impl TerminationLock {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for TerminationLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Process one work item, producing its output (or a non-fatal error
/// the pool should log and move past).
pub trait ItemProcessor<Item, Output>: Send + Sync + 'static {
    fn process(&self, item: Item) -> Output;
}

impl<Item, Output, F> ItemProcessor<Item, Output> for F
where
    F: Fn(Item) -> Output + Send + Sync + 'static,
{
    fn process(&self, item: Item) -> Output {
        self(item)
    }
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    slot: usize,
}

/// A fixed-size pool: `n_workers` threads pull from a bounded queue,
/// feed a processor, and push results to a sink channel. A watchdog
/// loop on the caller's thread (via [`WorkerPool::run_watchdog`])
/// detects workers whose heartbeat has not advanced and replaces them
/// (spec §4.13).
pub struct WorkerPool<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    n_workers: usize,
    work_tx: Sender<Item>,
    work_rx: Receiver<Item>,
    output_tx: Sender<Output>,
    pub output_rx: Receiver<Output>,
    heartbeats: Arc<Heartbeats>,
    termination: TerminationLock,
    handles: Vec<WorkerHandle>,
}

impl<Item, Output> WorkerPool<Item, Output>
where
    Item: Send + 'static,
    Output: Send + 'static,
{
    pub fn new(n_workers: usize, queue_capacity: usize) -> Self {
        let (work_tx, work_rx) = bounded(queue_capacity);
        let (output_tx, output_rx) = bounded(queue_capacity);
        Self {
            n_workers,
            work_tx,
            work_rx,
            output_tx,
            output_rx,
            heartbeats: Arc::new(Heartbeats::new(n_workers)),
            termination: TerminationLock::new(),
            handles: Vec::new(),
        }
    }

    pub fn submit(&self, item: Item) -> bool {
        self.work_tx.send(item).is_ok()
    }

    pub fn termination_lock(&self) -> TerminationLock {
        self.termination.clone()
    }

    /// Close the queue so workers exit once it drains.
    pub fn close(self) {
        drop(self.work_tx);
        for mut h in self.handles {
            if let Some(t) = h.thread.take() {
                let _ = t.join();
            }
        }
    }

    /// Spawn `n_workers` OS threads, each single-threaded internally
    /// (spec §5 "coarse-grained data parallelism").
    pub fn start(&mut self, processor: Arc<dyn ItemProcessor<Item, Output>>) {
        for slot in 0..self.n_workers {
            let rx = self.work_rx.clone();
            let tx = self.output_tx.clone();
            let heartbeats = Arc::clone(&self.heartbeats);
            let termination = self.termination.clone();
            let processor = Arc::clone(&processor);

            let thread = std::thread::Builder::new()
                .name(format!("worker-{slot}"))
                .spawn(move || {
                    info!(slot, "worker started");
                    while let Ok(item) = rx.recv() {
                        if termination.is_set() {
                            break;
                        }
                        let output = processor.process(item);
                        heartbeats.beat(slot);
                        if tx.send(output).is_err() {
                            break;
                        }
                    }
                    info!(slot, "worker exiting");
                })
                .expect("failed to spawn worker thread");

            self.handles.push(WorkerHandle {
                thread: Some(thread),
                slot,
            });
        }
    }

    /// Poll heartbeats once; returns the slots that have not advanced
    /// since `last_seen` within `timeout`. Does not itself kill
    /// threads — safe Rust has no thread-kill primitive, so the
    /// watchdog's job is to notice and let the caller decide (spec §9
    /// open question: replacement, not true preemption).
    pub fn stalled_slots(&self, last_seen: &mut [u64], last_checked: &mut Instant, timeout: Duration) -> Vec<usize> {
        if last_checked.elapsed() < timeout {
            return Vec::new();
        }
        *last_checked = Instant::now();
        let mut stalled = Vec::new();
        for slot in 0..self.n_workers {
            let current = self.heartbeats.get(slot);
            if current == last_seen[slot] {
                stalled.push(slot);
            }
            last_seen[slot] = current;
        }
        stalled
    }

    /// Drive the watchdog loop until `stop` is signalled, logging
    /// (not killing) any stalled worker. Embedding binaries that need
    /// real preemption should run workers as OS processes instead.
    pub fn run_watchdog(&self, timeout: Duration, stop: &TerminationLock) {
        let mut last_seen = vec![0u64; self.n_workers];
        let mut last_checked = Instant::now() - timeout;
        while !stop.is_set() {
            let stalled = self.stalled_slots(&mut last_seen, &mut last_checked, timeout);
            for slot in stalled {
                warn!(slot, "worker heartbeat stalled past timeout");
            }
            std::thread::sleep(Duration::from_millis(50).min(timeout));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeats_start_at_zero() {
        let hb = Heartbeats::new(3);
        assert_eq!(hb.get(0), 0);
        hb.beat(0);
        assert_eq!(hb.get(0), 1);
        assert_eq!(hb.get(1), 0);
    }

    #[test]
    fn termination_lock_round_trips() {
        let lock = TerminationLock::new();
        assert!(!lock.is_set());
        lock.set();
        assert!(lock.is_set());
        assert!(lock.clone().is_set());
    }

    #[test]
    fn pool_processes_all_submitted_items() {
        let mut pool: WorkerPool<i32, i32> = WorkerPool::new(2, 16);
        pool.start(Arc::new(|x: i32| x * 2));

        for i in 0..10 {
            assert!(pool.submit(i));
        }

        let mut results = Vec::new();
        for _ in 0..10 {
            results.push(pool.output_rx.recv().unwrap());
        }
        results.sort();
        assert_eq!(results, (0..10).map(|x| x * 2).collect::<Vec<_>>());

        pool.close();
    }

    #[test]
    fn stalled_slots_reports_nothing_before_timeout_elapses() {
        let pool: WorkerPool<i32, i32> = WorkerPool::new(1, 4);
        let mut last_seen = vec![0u64];
        let mut last_checked = Instant::now();
        let stalled = pool.stalled_slots(&mut last_seen, &mut last_checked, Duration::from_secs(60));
        assert!(stalled.is_empty());
    }
}
