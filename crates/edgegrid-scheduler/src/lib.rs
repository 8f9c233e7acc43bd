//! edgegrid-scheduler — per-community placement for EdgeGrid.
//!
//! Two loops share this crate:
//!
//! - [`SchedulingCycle`] periodically gathers a community's nodes,
//!   functions, delay and workload matrices, asks the external optimizer
//!   for a placement, and overwrites the community's `CommunitySchedule`.
//! - [`CommunityReconciler`] converges function pods with that schedule.
//!
//! # Architecture
//!
//! ```text
//! SchedulingCycle (resync tick per community)
//!   ├── ClusterApi (nodes, functions, schedule CAS)
//!   ├── DelaySource + StateStore (delay / workload matrices)
//!   └── SchedulingClient ──HTTP/JSON──► optimizer
//!
//! CommunityReconciler (schedule + pod events)
//!   ├── plan_sync (pure diff)
//!   └── ClusterApi (create, bind, get, delete pods)
//! ```

pub mod client;
pub mod cycle;
pub mod error;
pub mod pods;
pub mod reconciler;

pub use client::{SchedulingClient, SchedulingInput, SchedulingOutput};
pub use cycle::{CycleOutcome, SchedulingCycle};
pub use error::{SchedulerError, SchedulerResult};
pub use pods::build_pod;
pub use reconciler::{CommunityReconciler, PlannedPod, SyncOutcome, SyncPlan, plan_sync};
