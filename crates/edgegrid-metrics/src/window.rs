//! Rolling-window aggregation of response times.
//!
//! A window is a fixed span of time split into buckets of fixed
//! granularity. Samples land in the newest bucket; buckets older than the
//! span are evicted on every read and write.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    sum: f64,
    count: u64,
}

/// Time-bucketed sum/count over the last `size` of wall time.
#[derive(Debug)]
pub struct RollingWindow {
    size: Duration,
    granularity: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(size: Duration, granularity: Duration) -> Self {
        let granularity = granularity.max(Duration::from_millis(1)).min(size);
        Self {
            size,
            granularity,
            buckets: VecDeque::new(),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= self.size {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn add(&mut self, value: f64, now: Instant) {
        self.evict(now);
        match self.buckets.back_mut() {
            Some(last) if now.saturating_duration_since(last.start) < self.granularity => {
                last.sum += value;
                last.count += 1;
            }
            _ => self.buckets.push_back(Bucket {
                start: now,
                sum: value,
                count: 1,
            }),
        }
    }

    /// `(sum, count)` over the live buckets.
    pub fn totals(&mut self, now: Instant) -> (f64, u64) {
        self.evict(now);
        self.buckets
            .iter()
            .fold((0.0, 0), |(s, c), b| (s + b.sum, c + b.count))
    }

    pub fn size(&self) -> Duration {
        self.size
    }
}

/// Rolling response-time statistics for one backend.
#[derive(Debug)]
pub struct BackendMetrics {
    window: Mutex<RollingWindow>,
}

impl BackendMetrics {
    pub fn new(size: Duration, granularity: Duration) -> Self {
        Self {
            window: Mutex::new(RollingWindow::new(size, granularity)),
        }
    }

    pub fn add_value(&self, value: f64) {
        self.add_value_at(value, Instant::now());
    }

    pub fn add_value_at(&self, value: f64, now: Instant) {
        self.window.lock().expect("metrics lock").add(value, now);
    }

    fn totals(&self) -> (f64, u64) {
        self.window
            .lock()
            .expect("metrics lock")
            .totals(Instant::now())
    }

    /// Mean of the samples in the window, 0 when empty.
    pub fn response_time(&self) -> f64 {
        match self.totals() {
            (_, 0) => 0.0,
            (sum, count) => sum / count as f64,
        }
    }

    pub fn request_count(&self) -> u64 {
        self.totals().1
    }

    /// Requests per second over the full window span.
    pub fn throughput(&self) -> f64 {
        let secs = self.window.lock().expect("metrics lock").size().as_secs_f64();
        let count = self.request_count();
        if count == 0 || secs == 0.0 {
            return 0.0;
        }
        count as f64 / secs
    }
}

/// Aggregate over every backend serving one function.
#[derive(Debug)]
pub struct FunctionMetrics {
    size: Duration,
    granularity: Duration,
    backends: RwLock<HashMap<String, Arc<BackendMetrics>>>,
}

impl FunctionMetrics {
    pub fn new(size: Duration, granularity: Duration) -> Self {
        Self {
            size,
            granularity,
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Register a backend, returning its metrics. Existing windows are kept.
    pub fn set_backend(&self, url: &str) -> Arc<BackendMetrics> {
        if let Some(existing) = self.backend(url) {
            return existing;
        }
        let mut backends = self.backends.write().expect("metrics lock");
        backends
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(BackendMetrics::new(self.size, self.granularity)))
            .clone()
    }

    pub fn remove_backend(&self, url: &str) {
        self.backends.write().expect("metrics lock").remove(url);
    }

    pub fn backend(&self, url: &str) -> Option<Arc<BackendMetrics>> {
        self.backends.read().expect("metrics lock").get(url).cloned()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.read().expect("metrics lock").len()
    }

    /// Count-weighted mean response time over backends that have one.
    pub fn response_time(&self) -> f64 {
        let backends = self.backends.read().expect("metrics lock");
        let (weighted, count) = backends
            .values()
            .map(|b| (b.response_time(), b.request_count()))
            .filter(|(rt, _)| *rt != 0.0)
            .fold((0.0, 0u64), |(w, c), (rt, rc)| (w + rt * rc as f64, c + rc));
        let mean = weighted / count as f64;
        if mean.is_nan() || count == 0 { 0.0 } else { mean }
    }

    pub fn request_count(&self) -> u64 {
        let backends = self.backends.read().expect("metrics lock");
        backends.values().map(|b| b.request_count()).sum()
    }

    pub fn throughput(&self) -> f64 {
        let backends = self.backends.read().expect("metrics lock");
        backends.values().map(|b| b.throughput()).sum()
    }
}
