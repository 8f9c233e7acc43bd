//! edgegrid-metrics — response-time tracking for the EdgeGrid data plane.
//!
//! The load balancer emits one [`ResponseSample`] per proxied request on a
//! bounded channel. The collector folds samples into per-backend rolling
//! windows and forwards raw rows to a fixed pool of drain workers that
//! persist them in batches.
//!
//! # Architecture
//!
//! ```text
//! LoadBalancer ── try_send ──► mpsc<ResponseSample>
//!                                   │
//!                          MetricsCollector::run
//!                           ├── FunctionMetrics (RwLock)
//!                           │     └── BackendMetrics (rolling window)
//!                           └── PersistHandle::send ──► mpsc<Sample> (bounded)
//!                                                           │
//!                                               N drain workers ──► SampleSink
//!
//! ResourceSampler ── every interval ──► PersistHandle::send (RawResourceData)
//!
//! render_prometheus() → text/plain for /metrics
//! ```

pub mod collector;
pub mod persist;
pub mod prometheus;
pub mod resource;
pub mod window;

pub use collector::{FunctionSnapshot, MetricsCollector, ResponseSample, epoch_millis};
pub use persist::{PersistConfig, PersistError, PersistHandle, Persister, Sample};
pub use prometheus::render_prometheus;
pub use resource::ResourceSampler;
pub use window::{BackendMetrics, FunctionMetrics, RollingWindow};
