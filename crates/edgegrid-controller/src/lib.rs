//! edgegrid-controller — the reconcile loop runtime shared by every
//! EdgeGrid controller.
//!
//! # Architecture
//!
//! ```text
//! ClusterApi::subscribe() ──► Reconciler::keys_for(event) ──► WorkQueue
//!        resync ticker    ──► Reconciler::initial_keys()  ──►    │
//!                                                                ▼
//!                                           threadiness workers: get → reconcile → done
//!                                                   │ Err
//!                                                   └─► add_rate_limited (100ms → 60s)
//! ```
//!
//! A key is processed by at most one worker at a time. Adding a key that
//! is already queued is a no-op; adding one that is being processed
//! re-queues it once after `done`.

pub mod runner;
pub mod workqueue;

pub use runner::{Controller, Reconciler};
pub use workqueue::WorkQueue;
