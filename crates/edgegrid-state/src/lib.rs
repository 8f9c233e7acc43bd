//! edgegrid-state — cluster view model and persistence for EdgeGrid.
//!
//! Two halves live here:
//!
//! - The **cluster boundary**: typed view models (`NodeView`, `PodView`,
//!   `CommunitySchedule`, ...), the [`ClusterApi`] trait every controller
//!   talks to, and [`MemoryCluster`], an in-process implementation used by
//!   standalone mode and tests. Community membership and roles are typed
//!   fields; the label encoding lives only in [`labels`].
//! - The **sample store**: a [redb](https://docs.rs/redb) database holding
//!   raw response-time and resource samples, exposed through [`SampleSink`].
//!
//! # Architecture
//!
//! ```text
//! ClusterApi (trait)
//!   ├── typed reads (nodes, functions, pods, schedules, configurations)
//!   ├── compare-and-update writes (resource_version)
//!   └── subscribe() → broadcast of ClusterEvent
//!
//! StateStore (redb)
//!   ├── response_times  {timestamp_ms:020}:{seq:020} → RawResponseTime
//!   └── resource_data   {timestamp_ms:020}:{seq:020} → RawResourceData
//! ```

pub mod cluster;
pub mod delay;
pub mod error;
pub mod labels;
pub mod memory;
pub mod store;
pub mod tables;
pub mod types;

pub use cluster::{ClusterApi, ClusterEvent, EventKind, NodeSelector, PodSelector};
pub use delay::{ConstantDelay, DelaySource};
pub use error::{StateError, StateResult};
pub use memory::{ClusterManifest, ManifestNode, MemoryCluster};
pub use store::{SampleSink, StateStore};
pub use types::*;
