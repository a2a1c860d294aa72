//! Tessera cluster — the distributed half of the partitioned table
//! runtime.
//!
//! One master coordinates N workers. Clients declare typed tables split
//! into shards; the master assigns shards to workers, dispatches kernels
//! against them, and recovers from stragglers and dead workers. Workers
//! own shard state, serve reads and inbound update batches, and stream
//! shard contents to remote iterators.
//!
//! ```text
//!         ┌───────────────┐               ┌───────────────┐
//! client→ │    Master     │ ←──  RPC  ──→ │   Worker[i]   │
//!         │  - scheduler  │               │ - shard store │
//!         │  - table meta │               │ - update buf  │
//!         └───────▲───────┘               └───────▲───────┘
//!                 └────── peer RPC (put/get) ─────┘
//! ```

pub mod error;
pub mod kernel;
pub mod master;
pub mod proto;
pub mod table;
pub mod transport;
pub mod worker;

pub use crate::error::{ClusterError, Result};
pub use crate::kernel::{Kernel, KernelRegistry, KernelScope, RunDescriptor};
pub use crate::master::{Master, TaskState, WorkerState};
pub use crate::proto::{NodeId, PluginSpec, Request, Response, ShardId, TableId};
pub use crate::table::{RemoteIterator, ShardIter, Table, TableHandle, TypedShardIter};
pub use crate::transport::{Endpoint, Envelope, Mesh, ReplyHandle, Transport};
pub use crate::worker::{Worker, WorkerHandle};
