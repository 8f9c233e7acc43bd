//! edgegrid-cluster — community partitioning for EdgeGrid.
//!
//! The system controller watches `CommunityConfiguration` objects. For each
//! one it sends the ready worker nodes and their delay matrix to the
//! external partitioner, then labels every node with its community and
//! role (one leader per community) and keeps one `CommunitySchedule` per
//! community in existence.
//!
//! # Architecture
//!
//! ```text
//! Controller<SystemReconciler>
//!   └── SystemReconciler
//!         ├── ClusterApi (nodes, schedules, configuration status)
//!         ├── DelaySource (node-to-node delays)
//!         └── PartitionClient ──HTTP/JSON──► partitioner
//! ```

pub mod error;
pub mod partition;
pub mod system;

pub use error::{ClusterError, ClusterResult};
pub use partition::{PartitionClient, PartitionRequest, PartitionedCommunity};
pub use system::{ApplyOutcome, SystemReconciler};
