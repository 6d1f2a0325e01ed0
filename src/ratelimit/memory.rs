//! In-memory counter backend.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::backend::CounterBackend;
use super::counter::CounterEntry;
use super::key::ClientKey;

/// A single-process counter backend.
///
/// Counters live in a [`DashMap`], so an increment only locks the shard
/// holding its key. The cleanup pass walks the map shard by shard under
/// the same locks, which keeps it from racing with increments.
pub struct MemoryBackend {
    /// Counters indexed by client key
    entries: Arc<DashMap<ClientKey, CounterEntry>>,
    /// Period of the background cleanup
    cleanup_interval: Duration,
    /// Handle to the running cleanup task, if any
    cleanup: Mutex<Option<CleanupTask>>,
}

struct CleanupTask {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl MemoryBackend {
    /// Create a backend whose cleanup runs every `cleanup_interval`.
    pub fn new(cleanup_interval: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            cleanup_interval,
            cleanup: Mutex::new(None),
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    /// Evict every entry whose window plus one grace interval has elapsed.
    ///
    /// Returns the number of entries removed.
    pub fn cleanup(&self) -> usize {
        evict_stale(&self.entries, Instant::now())
    }
}

fn evict_stale(entries: &DashMap<ClientKey, CounterEntry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_stale(now));
    before.saturating_sub(entries.len())
}

#[async_trait]
impl CounterBackend for MemoryBackend {
    fn increment(&self, key: &ClientKey, interval: Duration) -> (u64, Instant) {
        let now = Instant::now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            return entry.hit(now, interval);
        }

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().hit(now, interval),
            Entry::Vacant(vacant) => {
                let entry = vacant.insert(CounterEntry::new(now, interval));
                (entry.count(), entry.window_start())
            }
        }
    }

    fn peek(&self, key: &ClientKey, _interval: Duration) -> Option<(u64, Instant)> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| (entry.count(), entry.window_start()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn start(&self) {
        let mut cleanup = self.cleanup.lock();
        if cleanup.is_some() {
            debug!("Counter cleanup already running");
            return;
        }

        let entries = Arc::clone(&self.entries);
        let period = self.cleanup_interval;
        let (shutdown, mut shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let removed = evict_stale(&entries, Instant::now());
                        trace!(removed, remaining = entries.len(), "Counter cleanup tick");
                    }
                }
            }
        });

        info!(interval = ?period, "Counter cleanup started");
        *cleanup = Some(CleanupTask { shutdown, handle });
    }

    fn is_running(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    async fn stop(&self) {
        let task = self.cleanup.lock().take();

        let Some(task) = task else {
            return;
        };

        let _ = task.shutdown.send(());
        if let Err(e) = task.handle.await {
            warn!(error = %e, "Counter cleanup task ended abnormally");
        }

        info!("Counter cleanup stopped");
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(task) = self.cleanup.get_mut().take() {
            task.handle.abort();
        }
    }
}
