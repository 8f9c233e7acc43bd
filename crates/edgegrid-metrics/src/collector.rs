//! Metrics collector: folds response samples into rolling windows.
//!
//! Samples arrive on the channel the load balancers `try_send` into. Each
//! one updates the backend's window and, when a persister is attached, is
//! forwarded as a `RawResponseTime` row.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use edgegrid_core::FunctionKey;
use edgegrid_state::RawResponseTime;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::persist::{PersistHandle, Sample};
use crate::window::FunctionMetrics;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One proxied request as observed by a load balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSample {
    pub timestamp_ms: u64,
    pub function: FunctionKey,
    pub backend_url: String,
    /// Node hosting the backend.
    pub destination: String,
    pub community: String,
    pub gpu: bool,
    pub latency: Duration,
    pub status: u16,
    pub description: String,
}

/// Point-in-time aggregate for one function.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSnapshot {
    pub function: FunctionKey,
    pub response_time_ms: f64,
    pub request_count: u64,
    pub throughput: f64,
    pub backends: usize,
}

/// Per-function metrics registry fed from the balancer sample channel.
pub struct MetricsCollector {
    /// Node this dispatcher runs on (the `source` of every sample).
    node: String,
    window: Duration,
    granularity: Duration,
    functions: RwLock<HashMap<FunctionKey, Arc<FunctionMetrics>>>,
    persist: Option<PersistHandle>,
}

impl MetricsCollector {
    pub fn new(
        node: impl Into<String>,
        window: Duration,
        granularity: Duration,
        persist: Option<PersistHandle>,
    ) -> Self {
        Self {
            node: node.into(),
            window,
            granularity,
            functions: RwLock::new(HashMap::new()),
            persist,
        }
    }

    /// Metrics for a function, created on first use.
    pub fn function(&self, key: &FunctionKey) -> Arc<FunctionMetrics> {
        if let Some(existing) = self.functions.read().expect("metrics lock").get(key) {
            return existing.clone();
        }
        self.functions
            .write()
            .expect("metrics lock")
            .entry(key.clone())
            .or_insert_with(|| Arc::new(FunctionMetrics::new(self.window, self.granularity)))
            .clone()
    }

    pub fn get(&self, key: &FunctionKey) -> Option<Arc<FunctionMetrics>> {
        self.functions.read().expect("metrics lock").get(key).cloned()
    }

    /// Forget a backend that left the pool.
    pub fn remove_backend(&self, key: &FunctionKey, url: &str) {
        if let Some(f) = self.get(key) {
            f.remove_backend(url);
        }
    }

    /// Update the rolling windows for one sample.
    pub fn record(&self, sample: &ResponseSample) {
        let latency_ms = sample.latency.as_secs_f64() * 1000.0;
        self.function(&sample.function)
            .set_backend(&sample.backend_url)
            .add_value(latency_ms);
    }

    fn raw_row(&self, sample: &ResponseSample) -> RawResponseTime {
        RawResponseTime {
            timestamp_ms: sample.timestamp_ms,
            source: self.node.clone(),
            destination: sample.destination.clone(),
            function: sample.function.name.clone(),
            namespace: sample.function.namespace.clone(),
            community: sample.community.clone(),
            gpu: sample.gpu,
            latency_ms: sample.latency.as_secs_f64() * 1000.0,
            status: sample.status,
            description: sample.description.clone(),
        }
    }

    async fn handle(&self, sample: ResponseSample) {
        self.record(&sample);
        if let Some(persist) = &self.persist {
            // Blocks once the persister buffer is full.
            if let Err(e) = persist.send(Sample::Response(self.raw_row(&sample))).await {
                warn!(error = %e, function = %sample.function, "sample not persisted");
            }
        }
    }

    /// Aggregates for every known function, sorted by key.
    pub fn snapshot(&self) -> Vec<FunctionSnapshot> {
        let functions = self.functions.read().expect("metrics lock");
        let mut out: Vec<_> = functions
            .iter()
            .map(|(key, m)| FunctionSnapshot {
                function: key.clone(),
                response_time_ms: m.response_time(),
                request_count: m.request_count(),
                throughput: m.throughput(),
                backends: m.backend_count(),
            })
            .collect();
        out.sort_by(|a, b| a.function.cmp(&b.function));
        out
    }

    /// Consume samples until the channel closes or shutdown is signalled.
    ///
    /// On shutdown, samples already queued are drained before returning;
    /// dropping the collector afterwards closes the persister channel.
    pub async fn run(
        &self,
        mut samples: mpsc::Receiver<ResponseSample>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node = %self.node, window_secs = self.window.as_secs(), "metrics collector started");
        loop {
            tokio::select! {
                sample = samples.recv() => match sample {
                    Some(sample) => self.handle(sample).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    samples.close();
                    let mut drained = 0;
                    while let Some(sample) = samples.recv().await {
                        self.handle(sample).await;
                        drained += 1;
                    }
                    debug!(drained, "metrics collector drained");
                    break;
                }
            }
        }
        info!("metrics collector stopped");
    }
}
