//! Wire messages exchanged between the master and workers.
//!
//! The semantic layout is fixed; the concrete encoding is whatever the
//! transport chooses (the in-process mesh passes these values directly).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type TableId = u32;

/// A node of the cluster. Workers are numbered from zero; the master
/// participates as a table client under a reserved id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub i32);

impl NodeId {
    pub const MASTER: NodeId = NodeId(-1);

    pub fn worker(index: usize) -> NodeId {
        NodeId(index as i32)
    }

    pub fn is_master(&self) -> bool {
        *self == NodeId::MASTER
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_master() {
            write!(f, "master")
        } else {
            write!(f, "worker-{}", self.0)
        }
    }
}

/// Globally unique shard identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub table: TableId,
    pub shard: usize,
}

impl ShardId {
    pub fn new(table: TableId, shard: usize) -> Self {
        Self { table, shard }
    }
}

/// A plugin reference on the wire: type id plus opaque construction options.
/// Type id −1 means absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    pub type_id: i32,
    pub opts: Vec<u8>,
}

impl PluginSpec {
    pub fn new(type_id: i32) -> Self {
        Self {
            type_id,
            opts: Vec::new(),
        }
    }

    pub fn with_opts(type_id: i32, opts: Vec<u8>) -> Self {
        Self { type_id, opts }
    }

    pub fn absent() -> Self {
        Self {
            type_id: -1,
            opts: Vec::new(),
        }
    }

    pub fn is_absent(&self) -> bool {
        self.type_id < 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReq {
    pub worker: NodeId,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTableReq {
    pub id: TableId,
    pub table_type_id: i32,
    pub num_shards: usize,
    pub sharder: PluginSpec,
    pub combiner: PluginSpec,
    pub reducer: PluginSpec,
    pub selector: PluginSpec,
}

/// Routing metadata for one partition, as broadcast by the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub shard: usize,
    pub owner: Option<NodeId>,
    pub entries: u64,
    /// Set on the former owner: it still holds data it must stream out.
    pub dirty: bool,
    /// Set for the new owner: a bulk update is in flight toward this shard.
    pub tainted: bool,
}

impl PartitionInfo {
    pub fn unassigned(shard: usize) -> Self {
        Self {
            shard,
            owner: None,
            entries: 0,
            dirty: false,
            tainted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub table: TableId,
    pub epoch: u64,
    pub partitions: Vec<PartitionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvData {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// A batch of buffered writes flushed toward a shard's owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableData {
    pub table: TableId,
    pub shard: usize,
    pub source: NodeId,
    pub epoch: u64,
    pub kv_data: Vec<KvData>,
    /// Final batch of this delta stream; the receiver clears taint.
    pub done: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashGet {
    pub table: TableId,
    pub shard: usize,
    pub key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashGetResp {
    pub value: Option<Vec<u8>>,
    pub missing_key: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorRequest {
    pub table: TableId,
    pub shard: usize,
    pub cursor: Vec<u8>,
    pub fetch_num: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IteratorResponse {
    pub kv_data: Vec<KvData>,
    pub cursor: Vec<u8>,
    pub done: bool,
}

pub type ArgMap = HashMap<String, Vec<u8>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunKernelReq {
    pub kernel: i32,
    pub table: TableId,
    pub shard: usize,
    pub args: ArgMap,
}

/// Worker → master kernel completion. A populated `error` marks a failed
/// run; the scheduler retries it elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelDone {
    pub shard_id: ShardId,
    pub worker: NodeId,
    pub runtime_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearTable {
    pub table: TableId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyTable {
    pub table: TableId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    pub worker: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    Register(RegisterReq),
    CreateTable(CreateTableReq),
    Assign(ShardAssignment),
    Put(TableData),
    Get(HashGet),
    Iterate(IteratorRequest),
    RunKernel(RunKernelReq),
    KernelDone(KernelDone),
    ClearTable(ClearTable),
    DestroyTable(DestroyTable),
    Flush,
    Ping(Ping),
    Shutdown,
}

impl Request {
    /// Stable method name, used for transport call accounting.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Register(_) => "register",
            Request::CreateTable(_) => "create_table",
            Request::Assign(_) => "assign",
            Request::Put(_) => "put",
            Request::Get(_) => "get",
            Request::Iterate(_) => "iterate",
            Request::RunKernel(_) => "run_kernel",
            Request::KernelDone(_) => "kernel_done",
            Request::ClearTable(_) => "clear_table",
            Request::DestroyTable(_) => "destroy_table",
            Request::Flush => "flush",
            Request::Ping(_) => "ping",
            Request::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ack,
    Get(HashGetResp),
    Iterate(IteratorResponse),
    Error(String),
}
