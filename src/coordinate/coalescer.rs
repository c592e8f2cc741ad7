//! Update coalescer
//!
//! Buffers coordinate updates in memory and writes them to the store in one
//! atomic batch per flush interval. Within an epoch the last submission for a
//! `(node, segment)` key wins, so the store sees at most one write per key per
//! interval no matter how often agents report.
//!
//! Durability is fire-and-forget: `submit` acknowledges as soon as the update
//! is buffered. A failed flush puts its batch back (newer submissions for the
//! same key take precedence) and is retried on the next tick, so callers never
//! see store errors.
//!
//! A single background task owns flushing. Explicit flushes, purges and
//! shutdown go through its command channel so they are ordered with the
//! periodic flushes.

use crate::common::{CoordinateMetrics, Error, Result};
use crate::coordinate::model::{Coordinate, CoordinateEntry, CoordinateKey, CoordinateUpdateRequest};
use crate::coordinate::store::CoordinateStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the command channel
const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// How long `shutdown` waits for the task to exit
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Coalescer settings
#[derive(Debug, Clone)]
pub struct CoalescerConfig {
    /// Datacenter whose updates this coalescer owns
    pub datacenter: String,
    pub flush_interval: Duration,
    /// Distinct keys the buffer may hold before new keys are refused
    pub max_pending: usize,
}

/// Outcome of the latest successful flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushEpoch {
    /// Number of successful non-empty flushes so far
    pub epoch: u64,
    /// Store index produced by that flush
    pub index: u64,
    /// Keys written by that flush
    pub keys: usize,
}

enum Command {
    Flush {
        ack: oneshot::Sender<Result<FlushEpoch>>,
    },
    PurgeNode {
        node: String,
        ack: oneshot::Sender<Result<u64>>,
    },
    Shutdown {
        ack: oneshot::Sender<Result<FlushEpoch>>,
    },
}

struct Shared {
    datacenter: String,
    max_pending: usize,
    pending: Mutex<HashMap<CoordinateKey, Coordinate>>,
    closed: AtomicBool,
    store: Arc<dyn CoordinateStore>,
    metrics: Arc<CoordinateMetrics>,
    epochs: watch::Sender<FlushEpoch>,
}

/// Handle to a running coalescer. Cheap to clone.
#[derive(Clone)]
pub struct UpdateCoalescer {
    shared: Arc<Shared>,
    tx: mpsc::Sender<Command>,
    task: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl UpdateCoalescer {
    /// Spawn the flush task. Must be called inside a tokio runtime.
    pub fn start(
        config: CoalescerConfig,
        store: Arc<dyn CoordinateStore>,
        metrics: Arc<CoordinateMetrics>,
    ) -> Self {
        let (epochs, _rx) = watch::channel(FlushEpoch::default());
        let shared = Arc::new(Shared {
            datacenter: config.datacenter,
            max_pending: config.max_pending,
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            store,
            metrics,
            epochs,
        });

        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = tokio::spawn(run_flush_task(shared.clone(), rx, config.flush_interval));

        tracing::info!(
            datacenter = %shared.datacenter,
            interval_ms = config.flush_interval.as_millis() as u64,
            "Coordinate coalescer started"
        );

        Self {
            shared,
            tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.shared.datacenter
    }

    pub fn metrics(&self) -> &Arc<CoordinateMetrics> {
        &self.shared.metrics
    }

    /// Buffer an update for the next flush. Never waits on the store.
    pub fn submit(&self, update: CoordinateUpdateRequest) -> Result<()> {
        if !update.datacenter.is_empty() && update.datacenter != self.shared.datacenter {
            return Err(Error::InvalidRequest(format!(
                "update for datacenter {} submitted to coalescer for {}",
                update.datacenter, self.shared.datacenter
            )));
        }
        let key = update.key();
        let mut pending = self.shared.lock_pending()?;
        // Checked under the lock so nothing lands after the final drain
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Unavailable("coordinate coalescer is shutting down".into()));
        }
        if !pending.contains_key(&key) && pending.len() >= self.shared.max_pending {
            return Err(Error::Unavailable(format!(
                "coordinate update queue full ({} keys pending)",
                pending.len()
            )));
        }
        if pending.insert(key, update.coord).is_some() {
            self.shared.metrics.updates_coalesced.inc();
        }
        self.shared.metrics.pending_keys.set(pending.len() as u64);
        Ok(())
    }

    /// Number of keys waiting for the next flush
    pub fn pending_len(&self) -> usize {
        self.shared.lock_pending().map(|p| p.len()).unwrap_or(0)
    }

    /// Flush immediately and wait for the result.
    ///
    /// Returns the latest epoch (unchanged if nothing was pending).
    pub async fn flush_now(&self) -> Result<FlushEpoch> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::Flush { ack }).await?;
        rx.await
            .map_err(|_| Error::Unavailable("coalescer dropped flush acknowledgment".into()))?
    }

    /// Drop pending updates for `node` and delete its stored coordinates.
    ///
    /// Runs on the flush task so an in-flight batch cannot resurrect the node.
    pub async fn purge_node(&self, node: &str) -> Result<u64> {
        let (ack, rx) = oneshot::channel();
        self.send(Command::PurgeNode {
            node: node.to_string(),
            ack,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Unavailable("coalescer dropped purge acknowledgment".into()))?
    }

    /// Receiver notified after every successful flush
    pub fn subscribe(&self) -> watch::Receiver<FlushEpoch> {
        self.shared.epochs.subscribe()
    }

    /// Refuse new submissions, flush once more and stop the task.
    pub async fn shutdown(&self) -> Result<FlushEpoch> {
        self.shared.closed.store(true, Ordering::Release);
        let (ack, rx) = oneshot::channel();
        let result = match self.send(Command::Shutdown { ack }).await {
            Ok(()) => rx
                .await
                .map_err(|_| Error::Unavailable("coalescer dropped shutdown acknowledgment".into()))
                .and_then(|r| r),
            Err(e) => Err(e),
        };

        let mut guard = self.task.lock().await;
        if let Some(handle) = guard.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                tracing::warn!(datacenter = %self.shared.datacenter, "Coalescer task did not stop in time");
            }
        }
        result
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| Error::Unavailable("coordinate coalescer is stopped".into()))
    }
}

impl Shared {
    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, HashMap<CoordinateKey, Coordinate>>> {
        self.pending
            .lock()
            .map_err(|_| Error::Internal("pending buffer lock poisoned".into()))
    }

    fn current_epoch(&self) -> FlushEpoch {
        *self.epochs.borrow()
    }

    /// Refuse further submissions, then write whatever is buffered.
    async fn final_flush(&self) -> Result<FlushEpoch> {
        {
            let _pending = self.lock_pending()?;
            self.closed.store(true, Ordering::Release);
        }
        self.flush().await
    }

    /// Write the current buffer as one batch.
    async fn flush(&self) -> Result<FlushEpoch> {
        let batch = std::mem::take(&mut *self.lock_pending()?);
        if batch.is_empty() {
            return Ok(self.current_epoch());
        }

        let mut entries: Vec<CoordinateEntry> = batch
            .iter()
            .map(|(key, coord)| CoordinateEntry {
                node: key.node.clone(),
                segment: key.segment.clone(),
                coord: coord.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.node, &a.segment).cmp(&(&b.node, &b.segment)));
        let keys = entries.len();

        let store = self.store.clone();
        let datacenter = self.datacenter.clone();
        let start = Instant::now();
        let result = tokio::task::spawn_blocking(move || store.apply(&datacenter, &entries))
            .await
            .map_err(|e| Error::Internal(format!("flush task panicked: {}", e)))
            .and_then(|r| r);

        match result {
            Ok(index) => {
                let previous = self.current_epoch();
                let epoch = FlushEpoch {
                    epoch: previous.epoch + 1,
                    index,
                    keys,
                };
                self.metrics.record_flush(keys, start.elapsed());
                self.metrics
                    .pending_keys
                    .set(self.lock_pending().map(|p| p.len()).unwrap_or(0) as u64);
                self.epochs.send_replace(epoch);
                tracing::debug!(
                    datacenter = %self.datacenter,
                    keys,
                    index,
                    epoch = epoch.epoch,
                    "Flushed coordinate batch"
                );
                Ok(epoch)
            }
            Err(e) => {
                // Put the batch back; anything submitted meanwhile is newer and wins.
                let mut pending = self.lock_pending()?;
                for (key, coord) in batch {
                    pending.entry(key).or_insert(coord);
                }
                self.metrics.flush_failures.inc();
                self.metrics.pending_keys.set(pending.len() as u64);
                tracing::warn!(
                    datacenter = %self.datacenter,
                    error = %e,
                    retained = pending.len(),
                    "Coordinate flush failed, will retry"
                );
                Err(Error::StoreFailure(e.to_string()))
            }
        }
    }

    async fn purge_node(&self, node: &str) -> Result<u64> {
        let dropped = {
            let mut pending = self.lock_pending()?;
            let before = pending.len();
            pending.retain(|key, _| key.node != node);
            self.metrics.pending_keys.set(pending.len() as u64);
            before - pending.len()
        };

        let store = self.store.clone();
        let datacenter = self.datacenter.clone();
        let owned = node.to_string();
        let index = tokio::task::spawn_blocking(move || store.delete_node(&datacenter, &owned))
            .await
            .map_err(|e| Error::Internal(format!("purge task panicked: {}", e)))??;

        tracing::info!(datacenter = %self.datacenter, node, dropped, index, "Purged node coordinates");
        Ok(index)
    }
}

/// Main loop of the flush task.
async fn run_flush_task(shared: Arc<Shared>, mut rx: mpsc::Receiver<Command>, interval: Duration) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // Skip the first immediate tick
    timer.tick().await;

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                let Some(cmd) = cmd else {
                    // Every handle dropped
                    if let Err(e) = shared.final_flush().await {
                        tracing::warn!(datacenter = %shared.datacenter, error = %e, "Final flush failed on channel close");
                    }
                    break;
                };
                match cmd {
                    Command::Flush { ack } => {
                        let _ = ack.send(shared.flush().await);
                    }
                    Command::PurgeNode { node, ack } => {
                        let _ = ack.send(shared.purge_node(&node).await);
                    }
                    Command::Shutdown { ack } => {
                        let result = shared.final_flush().await;
                        if let Err(e) = &result {
                            tracing::warn!(datacenter = %shared.datacenter, error = %e, "Final flush failed during shutdown");
                        }
                        let _ = ack.send(result);
                        tracing::info!(datacenter = %shared.datacenter, "Coordinate coalescer stopped");
                        break;
                    }
                }
            }
            _ = timer.tick() => {
                // Failures are logged and retried on the next tick
                let _ = shared.flush().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinate::store::{MemoryStore, Snapshot};
    use std::sync::atomic::AtomicUsize;

    /// Store that fails `apply` while `failing` is set
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
        applies: AtomicUsize,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                failing: AtomicBool::new(false),
                applies: AtomicUsize::new(0),
            }
        }
    }

    impl CoordinateStore for FlakyStore {
        fn apply(&self, datacenter: &str, batch: &[CoordinateEntry]) -> Result<u64> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Unavailable("no cluster leader".into()));
            }
            self.inner.apply(datacenter, batch)
        }
        fn list(&self, datacenter: &str) -> Result<Snapshot> {
            self.inner.list(datacenter)
        }
        fn node(&self, datacenter: &str, node: &str) -> Result<Snapshot> {
            self.inner.node(datacenter, node)
        }
        fn delete_node(&self, datacenter: &str, node: &str) -> Result<u64> {
            self.inner.delete_node(datacenter, node)
        }
        fn index(&self) -> u64 {
            self.inner.index()
        }
        fn subscribe(&self) -> watch::Receiver<u64> {
            self.inner.subscribe()
        }
    }

    fn config(max_pending: usize) -> CoalescerConfig {
        CoalescerConfig {
            datacenter: "dc1".into(),
            // Long enough that only explicit flushes run during a test
            flush_interval: Duration::from_secs(3600),
            max_pending,
        }
    }

    fn update(node: &str, segment: &str, height: f64) -> CoordinateUpdateRequest {
        let mut coord = Coordinate::new(2);
        coord.height = height;
        CoordinateUpdateRequest {
            datacenter: "dc1".into(),
            node: node.into(),
            segment: segment.into(),
            coord,
        }
    }

    #[tokio::test]
    async fn test_last_write_wins_within_epoch() {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(CoordinateMetrics::new());
        let coalescer = UpdateCoalescer::start(config(16), store.clone(), metrics.clone());

        coalescer.submit(update("foo", "", 1.0)).unwrap();
        coalescer.submit(update("foo", "", 2.0)).unwrap();
        coalescer.submit(update("foo", "alpha", 3.0)).unwrap();
        assert_eq!(coalescer.pending_len(), 2);

        let epoch = coalescer.flush_now().await.unwrap();
        assert_eq!(epoch.epoch, 1);
        assert_eq!(epoch.keys, 2);
        assert_eq!(coalescer.pending_len(), 0);

        let snap = store.node("dc1", "foo").unwrap();
        assert_eq!(snap.records.len(), 2);
        let default = snap.records.iter().find(|r| r.segment.is_empty()).unwrap();
        assert_eq!(default.coord.height, 2.0);
        assert_eq!(metrics.updates_coalesced.get(), 1);
        // One store write for the whole batch
        assert_eq!(store.index(), 1);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_touch_store() {
        let store = Arc::new(MemoryStore::new());
        let coalescer = UpdateCoalescer::start(config(16), store.clone(), Arc::new(CoordinateMetrics::new()));

        let epoch = coalescer.flush_now().await.unwrap();
        assert_eq!(epoch, FlushEpoch::default());
        assert_eq!(store.index(), 0);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried() {
        let store = Arc::new(FlakyStore::new());
        let metrics = Arc::new(CoordinateMetrics::new());
        let coalescer = UpdateCoalescer::start(config(16), store.clone(), metrics.clone());

        store.failing.store(true, Ordering::SeqCst);
        coalescer.submit(update("foo", "", 1.0)).unwrap();
        coalescer.submit(update("bar", "", 1.0)).unwrap();
        assert!(matches!(coalescer.flush_now().await, Err(Error::StoreFailure(_))));
        assert_eq!(coalescer.pending_len(), 2);
        assert_eq!(metrics.flush_failures.get(), 1);

        // A newer submission for a retained key replaces it
        coalescer.submit(update("foo", "", 7.0)).unwrap();

        store.failing.store(false, Ordering::SeqCst);
        let epoch = coalescer.flush_now().await.unwrap();
        assert_eq!(epoch.keys, 2);

        let snap = store.list("dc1").unwrap();
        assert_eq!(snap.records.len(), 2);
        let foo = snap.records.iter().find(|r| r.node == "foo").unwrap();
        assert_eq!(foo.coord.height, 7.0);
        assert_eq!(store.applies.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_new_keys_only() {
        let store = Arc::new(MemoryStore::new());
        let coalescer = UpdateCoalescer::start(config(2), store, Arc::new(CoordinateMetrics::new()));

        coalescer.submit(update("a", "", 1.0)).unwrap();
        coalescer.submit(update("b", "", 1.0)).unwrap();
        assert!(matches!(
            coalescer.submit(update("c", "", 1.0)),
            Err(Error::Unavailable(_))
        ));
        // Existing keys can still be refreshed
        coalescer.submit(update("a", "", 2.0)).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_refuses() {
        let store = Arc::new(MemoryStore::new());
        let coalescer = UpdateCoalescer::start(config(16), store.clone(), Arc::new(CoordinateMetrics::new()));

        coalescer.submit(update("foo", "", 1.0)).unwrap();
        let epoch = coalescer.shutdown().await.unwrap();
        assert_eq!(epoch.keys, 1);
        assert_eq!(store.list("dc1").unwrap().records.len(), 1);

        assert!(matches!(
            coalescer.submit(update("bar", "", 1.0)),
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(coalescer.flush_now().await, Err(Error::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_periodic_flush_notifies_subscribers() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(16);
        cfg.flush_interval = Duration::from_millis(20);
        let coalescer = UpdateCoalescer::start(cfg, store.clone(), Arc::new(CoordinateMetrics::new()));
        let mut epochs = coalescer.subscribe();

        coalescer.submit(update("foo", "", 1.0)).unwrap();
        let epoch = *tokio::time::timeout(Duration::from_secs(5), epochs.wait_for(|e| e.epoch >= 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(epoch.keys, 1);
        assert_eq!(store.node("dc1", "foo").unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn test_purge_drops_pending_and_stored() {
        let store = Arc::new(MemoryStore::new());
        let coalescer = UpdateCoalescer::start(config(16), store.clone(), Arc::new(CoordinateMetrics::new()));

        coalescer.submit(update("foo", "", 1.0)).unwrap();
        coalescer.flush_now().await.unwrap();
        coalescer.submit(update("foo", "alpha", 2.0)).unwrap();
        coalescer.submit(update("bar", "", 1.0)).unwrap();

        coalescer.purge_node("foo").await.unwrap();
        assert_eq!(coalescer.pending_len(), 1);
        coalescer.flush_now().await.unwrap();

        assert!(store.node("dc1", "foo").unwrap().records.is_empty());
        assert_eq!(store.node("dc1", "bar").unwrap().records.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_never_drops_acknowledged_updates() {
        for round in 0..20 {
            let store = Arc::new(MemoryStore::new());
            let coalescer =
                UpdateCoalescer::start(config(1_000_000), store.clone(), Arc::new(CoordinateMetrics::new()));

            let submitters: Vec<_> = (0..6)
                .map(|t| {
                    let coalescer = coalescer.clone();
                    tokio::task::spawn_blocking(move || {
                        let mut acked = 0usize;
                        for i in 0..2000 {
                            match coalescer.submit(update(&format!("n-{}-{}", t, i), "", 1.0)) {
                                Ok(()) => acked += 1,
                                Err(Error::Unavailable(_)) => break,
                                Err(e) => panic!("unexpected error: {}", e),
                            }
                        }
                        acked
                    })
                })
                .collect();

            while coalescer.pending_len() < 100 {
                tokio::task::yield_now().await;
            }
            coalescer.shutdown().await.unwrap();

            let mut acked = 0;
            for s in submitters {
                acked += s.await.unwrap();
            }
            let stored = store.list("dc1").unwrap().records.len();
            assert_eq!(acked, stored, "round {}", round);
            assert_eq!(coalescer.pending_len(), 0, "round {}", round);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_on_shared_keys() {
        const TASKS: usize = 8;
        const KEYS: usize = 50;
        const ROUNDS: usize = 200;

        let store = Arc::new(MemoryStore::new());
        let mut cfg = config(1024);
        cfg.flush_interval = Duration::from_millis(5);
        let coalescer = UpdateCoalescer::start(cfg, store.clone(), Arc::new(CoordinateMetrics::new()));

        let tasks: Vec<_> = (0..TASKS)
            .map(|t| {
                let coalescer = coalescer.clone();
                tokio::spawn(async move {
                    for round in 0..ROUNDS {
                        // The last round writes a per-task marker
                        let height = if round + 1 == ROUNDS {
                            1000.0 + t as f64
                        } else {
                            round as f64
                        };
                        for k in 0..KEYS {
                            coalescer.submit(update(&format!("node-{}", k), "", height)).unwrap();
                        }
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        coalescer.flush_now().await.unwrap();

        let snap = store.list("dc1").unwrap();
        assert_eq!(snap.records.len(), KEYS);
        let markers: Vec<f64> = (0..TASKS).map(|t| 1000.0 + t as f64).collect();
        for record in &snap.records {
            assert!(
                markers.contains(&record.coord.height),
                "{} holds {}, not a final write",
                record.node,
                record.coord.height
            );
        }
    }

    #[tokio::test]
    async fn test_wrong_datacenter_rejected() {
        let coalescer = UpdateCoalescer::start(
            config(16),
            Arc::new(MemoryStore::new()),
            Arc::new(CoordinateMetrics::new()),
        );
        let mut req = update("foo", "", 1.0);
        req.datacenter = "dc2".into();
        assert!(matches!(coalescer.submit(req), Err(Error::InvalidRequest(_))));
    }
}
