//! Controller runner: turns cluster events into reconcile calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgegrid_state::ClusterEvent;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::workqueue::WorkQueue;

/// A level-triggered reconciler keyed by string.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Keys affected by an event. Empty when the event is irrelevant.
    fn keys_for(&self, event: &ClusterEvent) -> Vec<String>;

    /// Every key that currently exists; queued at start and on resync.
    async fn initial_keys(&self) -> anyhow::Result<Vec<String>>;

    /// Bring the object named by `key` to its desired state.
    async fn reconcile(&self, key: &str) -> anyhow::Result<()>;
}

/// Runs one reconciler with a pool of workers over its own queue.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    threadiness: usize,
    max_retries: u32,
    resync: Option<Duration>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: Arc<R>, threadiness: usize, max_retries: u32) -> Self {
        Self {
            reconciler,
            queue: WorkQueue::new(),
            threadiness: threadiness.max(1),
            max_retries,
            resync: None,
        }
    }

    /// Re-queue every key periodically.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.queue = Arc::new(WorkQueue::with_backoff(base, max));
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until shutdown or until the event stream closes.
    ///
    /// In-flight reconciles finish before this returns.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ClusterEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let name = self.reconciler.name();
        self.enqueue_all().await?;

        let workers: Vec<_> = (0..self.threadiness)
            .map(|id| {
                let reconciler = self.reconciler.clone();
                let queue = self.queue.clone();
                let max_retries = self.max_retries;
                tokio::spawn(async move {
                    while let Some(key) = queue.get().await {
                        process(reconciler.as_ref(), &queue, &key, max_retries).await;
                        queue.done(&key);
                    }
                    debug!(controller = name, worker = id, "worker stopped");
                })
            })
            .collect();
        info!(controller = name, workers = self.threadiness, "controller started");

        let mut resync = self
            .resync
            .map(|p| tokio::time::interval_at(Instant::now() + p, p));

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        for key in self.reconciler.keys_for(&event) {
                            self.queue.add(key);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(controller = name, missed, "event stream lagged, resyncing");
                        if let Err(e) = self.enqueue_all().await {
                            warn!(controller = name, error = %e, "resync failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(controller = name, "event stream closed");
                        break;
                    }
                },
                _ = next_tick(&mut resync) => {
                    if let Err(e) = self.enqueue_all().await {
                        warn!(controller = name, error = %e, "resync failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!(controller = name, "controller shutting down");
                    break;
                }
            }
        }

        self.queue.shut_down();
        for worker in workers {
            if let Err(e) = worker.await {
                error!(controller = name, error = %e, "worker panicked");
            }
        }
        info!(controller = name, "controller stopped");
        Ok(())
    }

    async fn enqueue_all(&self) -> anyhow::Result<()> {
        let keys = self.reconciler.initial_keys().await?;
        debug!(controller = self.reconciler.name(), count = keys.len(), "queueing all keys");
        for key in keys {
            self.queue.add(key);
        }
        Ok(())
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn process<R: Reconciler>(reconciler: &R, queue: &Arc<WorkQueue>, key: &str, max_retries: u32) {
    let name = reconciler.name();
    match reconciler.reconcile(key).await {
        Ok(()) => {
            queue.forget(key);
            debug!(controller = name, %key, "reconciled");
        }
        Err(e) => {
            let retries = queue.num_requeues(key);
            if retries < max_retries {
                warn!(controller = name, %key, retries, error = %e, "reconcile failed, retrying");
                queue.add_rate_limited(key);
            } else {
                error!(controller = name, %key, retries, error = %e, "reconcile failed, dropping key");
                queue.forget(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgegrid_state::EventKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Fails the first `fail_first` reconciles of each key.
    struct Recorder {
        calls: Mutex<HashMap<String, u32>>,
        fail_first: u32,
        initial: Vec<String>,
    }

    impl Recorder {
        fn new(fail_first: u32, initial: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(HashMap::new()),
                fail_first,
                initial: initial.iter().map(|s| s.to_string()).collect(),
            })
        }

        fn calls(&self, key: &str) -> u32 {
            self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Reconciler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn keys_for(&self, event: &ClusterEvent) -> Vec<String> {
            match event {
                ClusterEvent::Node { name, .. } => vec![name.clone()],
                _ => Vec::new(),
            }
        }

        async fn initial_keys(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.initial.clone())
        }

        async fn reconcile(&self, key: &str) -> anyhow::Result<()> {
            let n = {
                let mut calls = self.calls.lock().unwrap();
                let n = calls.entry(key.to_string()).or_insert(0);
                *n += 1;
                *n
            };
            if n <= self.fail_first {
                anyhow::bail!("attempt {n} failed");
            }
            Ok(())
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    fn node_event(name: &str) -> ClusterEvent {
        ClusterEvent::Node {
            kind: EventKind::Upserted,
            name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn initial_keys_and_events_are_reconciled() {
        let rec = Recorder::new(0, &["boot"]);
        let (tx, rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let controller = Controller::new(rec.clone(), 2, 3);
        let handle = tokio::spawn(controller.run(rx, stop_rx));

        wait_for(|| rec.calls("boot") == 1).await;
        tx.send(node_event("n1")).unwrap();
        wait_for(|| rec.calls("n1") == 1).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failures_are_retried_with_backoff() {
        let rec = Recorder::new(2, &["flaky"]);
        let (_tx, rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let controller = Controller::new(rec.clone(), 1, 5)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(10));
        let queue = controller.queue();
        let handle = tokio::spawn(controller.run(rx, stop_rx));

        wait_for(|| rec.calls("flaky") == 3).await;
        wait_for(|| queue.num_requeues("flaky") == 0).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn retries_stop_at_max() {
        let rec = Recorder::new(u32::MAX, &["broken"]);
        let (_tx, rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let controller = Controller::new(rec.clone(), 1, 2)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2));
        let handle = tokio::spawn(controller.run(rx, stop_rx));

        wait_for(|| rec.calls("broken") == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(rec.calls("broken"), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resync_requeues_initial_keys() {
        let rec = Recorder::new(0, &["periodic"]);
        let (_tx, rx) = broadcast::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let controller = Controller::new(rec.clone(), 1, 1).with_resync(Duration::from_millis(10));
        let handle = tokio::spawn(controller.run(rx, stop_rx));

        wait_for(|| rec.calls("periodic") >= 3).await;

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
