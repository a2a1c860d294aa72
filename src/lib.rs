//! Tessera — a distributed partitioned key-value table runtime.
//!
//! Facade crate: re-exports the core table model and the cluster runtime.

pub use tessera_cluster::{
    ClusterError, Endpoint, Envelope, Kernel, KernelRegistry, KernelScope, Master, Mesh, NodeId,
    PluginSpec, RemoteIterator, Request, Response, Result, RunDescriptor, ShardId, ShardIter,
    Table, TableHandle, TableId, TaskState, Transport, TypedShardIter, Worker, WorkerHandle,
    WorkerState,
};
pub use tessera_core::{
    codec, Accumulator, Config, CoreError, DataType, Modulo, PluginRegistry, Replace, Selector,
    ShardKey, ShardMap, Sharder, Sum, TypeRegistry,
};
