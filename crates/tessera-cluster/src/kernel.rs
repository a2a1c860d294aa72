//! User-supplied computations scheduled once per targeted shard.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use tessera_core::codec::{self, DataType};
use tessera_core::registry::TypeRegistry;
use tessera_core::CoreError;

use crate::error::Result;
use crate::proto::{ArgMap, NodeId, TableId};
use crate::table::{Table, TableHandle};

/// A computation run by a worker against one shard of one table. Kernels
/// may read and write any table through the scope; all routing and
/// buffering rules apply as for any other caller.
pub trait Kernel: Send + Sync {
    fn run(&self, scope: &KernelScope<'_>) -> Result<()>;
}

/// What a kernel sees while it runs.
pub struct KernelScope<'a> {
    node: NodeId,
    table: Arc<Table>,
    shard: usize,
    args: &'a ArgMap,
    tables: Arc<RwLock<HashMap<TableId, Arc<Table>>>>,
}

impl<'a> KernelScope<'a> {
    pub fn new(
        node: NodeId,
        table: Arc<Table>,
        shard: usize,
        args: &'a ArgMap,
        tables: Arc<RwLock<HashMap<TableId, Arc<Table>>>>,
    ) -> Self {
        Self {
            node,
            table,
            shard,
            args,
            tables,
        }
    }

    /// The worker this kernel is running on.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The shard this kernel was dispatched against.
    pub fn shard(&self) -> usize {
        self.shard
    }

    /// Typed view of the target table.
    pub fn table<K: DataType, V: DataType>(&self) -> TableHandle<K, V> {
        TableHandle::new(Arc::clone(&self.table))
    }

    /// Any other table hosted on this worker.
    pub fn other_table<K: DataType, V: DataType>(
        &self,
        id: TableId,
    ) -> Result<TableHandle<K, V>> {
        let table = self
            .tables
            .read()
            .get(&id)
            .cloned()
            .ok_or(CoreError::Config("no such table".to_string()))?;
        Ok(TableHandle::new(table))
    }

    /// Decodes a kernel argument.
    pub fn arg<T: DataType>(&self, name: &str) -> Result<T> {
        let bytes = self
            .args
            .get(name)
            .ok_or_else(|| CoreError::Config(format!("missing kernel arg {name}")))?;
        Ok(codec::decode(bytes)?)
    }

    pub fn has_arg(&self, name: &str) -> bool {
        self.args.contains_key(name)
    }
}

/// Kernels registered by type id and by name, like every other plugin
/// family.
pub struct KernelRegistry {
    kernels: TypeRegistry<dyn Kernel>,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self {
            kernels: TypeRegistry::new("kernel"),
        }
    }

    pub fn register<F>(&mut self, type_id: i32, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Kernel> + Send + Sync + 'static,
    {
        self.kernels
            .register_named(type_id, name, move |_opts| Ok(factory()));
    }

    pub fn build(&self, type_id: i32) -> Result<Box<dyn Kernel>> {
        Ok(self.kernels.build(type_id, &[])?)
    }

    pub fn check(&self, type_id: i32) -> Result<()> {
        Ok(self.kernels.check(type_id)?)
    }

    pub fn id_by_name(&self, name: &str) -> Result<i32> {
        Ok(self.kernels.id_by_name(name)?)
    }
}

/// One `run()` call: which kernel, against which shards of which table.
#[derive(Debug, Clone)]
pub struct RunDescriptor {
    pub kernel: i32,
    pub args: ArgMap,
    pub table: TableId,
    pub shards: Vec<usize>,
}

impl RunDescriptor {
    pub fn over_all_shards(kernel: i32, table: TableId, num_shards: usize) -> Self {
        Self {
            kernel,
            args: ArgMap::new(),
            table,
            shards: (0..num_shards).collect(),
        }
    }

    pub fn with_arg<T: DataType>(mut self, name: &str, value: &T) -> Result<Self> {
        self.args.insert(name.to_string(), codec::encode(value)?);
        Ok(self)
    }
}
