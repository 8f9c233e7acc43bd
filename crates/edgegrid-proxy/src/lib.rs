//! edgegrid-proxy — the EdgeGrid dispatcher.
//!
//! Inbound function calls are buffered, queued, and handed by a fixed set
//! of workers to the load balancer owned by the target function. Backend
//! pools are converged from the local node's community schedule.
//!
//! # Architecture
//!
//! ```text
//! DispatchServer (hyper http1)
//!   ├── /function/<ns>/<name>/... → PendingRequest → RequestQueue
//!   └── anything else             → pass-through to its own Host
//!
//! Dispatcher
//!   ├── N workers: RequestQueue::next() → LoadBalancer::balance()
//!   │                                        ├── BackendPool::next_backend()
//!   │                                        ├── transform::upstream_request()
//!   │                                        └── try_send(ResponseSample)
//!   └── RoutingReconciler: CommunitySchedule + pods → add/delete/update servers
//!
//! HealthProber (opt-in): TCP dial per backend → BackendPool::set_alive()
//! ```

pub mod balancer;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod pool;
pub mod queue;
pub mod server;
pub mod transform;

pub use balancer::{LoadBalancer, PendingRequest, ProxyBody, Recovery};
pub use dispatcher::{Dispatcher, RoutingReconciler, SyncStats};
pub use error::{ProxyError, ProxyResult};
pub use health::{HealthProber, tcp_probe};
pub use pool::{Backend, BackendPool};
pub use queue::RequestQueue;
pub use server::{DispatchServer, extract_function_key};
