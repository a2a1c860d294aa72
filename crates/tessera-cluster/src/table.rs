//! The partitioned table: shard routing, local vs. remote access, update
//! buffering, taint handling, and the remote-iterator protocol.
//!
//! A [`Table`] is the erased, byte-level object shared by the worker
//! runtime and the scheduler; [`TableHandle`] is the typed facade client
//! code and kernels use, encoding keys and values through the codec.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use tessera_core::codec::{self, DataType};
use tessera_core::error::CoreError;
use tessera_core::registry::PluginRegistry;
use tessera_core::shard::ShardMap;
use tessera_core::{ByteAccumulator, ByteSelector, ByteSharder, Config};

use crate::error::{ClusterError, Result};
use crate::proto::{
    ClearTable, CreateTableReq, HashGet, HashGetResp, IteratorRequest, IteratorResponse, KvData,
    NodeId, PartitionInfo, Request, Response, ShardAssignment, TableData, TableId,
};
use crate::transport::Transport;

/// A remotely read value kept for later reads of the same key.
struct CacheEntry {
    value: Vec<u8>,
    last_read_time: Instant,
}

/// Partition metadata plus the epoch at which this node acquired it.
struct LocalPartition {
    info: PartitionInfo,
    acquired_epoch: u64,
}

/// Per-shard state: the authoritative store (meaningful only on the
/// owner) and the partition metadata guarding it.
struct ShardState {
    data: Mutex<ShardMap>,
    partition: Mutex<LocalPartition>,
    taint_cleared: Condvar,
}

/// Fallback merge when a table declares no accumulator: the update wins.
struct OverwriteBytes;

impl ByteAccumulator for OverwriteBytes {
    fn accumulate(&self, _current: &[u8], update: &[u8]) -> tessera_core::Result<Vec<u8>> {
        Ok(update.to_vec())
    }
}

pub struct Table {
    id: TableId,
    num_shards: usize,
    node: NodeId,
    transport: Arc<dyn Transport>,
    sharder: Box<dyn ByteSharder>,
    combiner: Box<dyn ByteAccumulator>,
    reducer: Box<dyn ByteAccumulator>,
    selector: Option<Box<dyn ByteSelector>>,
    shards: Vec<ShardState>,
    /// Buffered writes headed for shards this node does not own. Guarded
    /// separately from the shard stores so flushing never re-enters them.
    outgoing: Vec<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
    pending_writes: AtomicUsize,
    flush_frequency: usize,
    iterator_fetch: usize,
    cache: Mutex<HashMap<Vec<u8>, CacheEntry>>,
    epoch_seen: AtomicU64,
}

impl Table {
    /// Instantiates a table replica from a wire request, resolving every
    /// plugin through the registry. Unknown type ids fail here.
    pub fn create(
        req: &CreateTableReq,
        config: &Config,
        node: NodeId,
        transport: Arc<dyn Transport>,
        plugins: &PluginRegistry,
    ) -> Result<Table> {
        if req.num_shards == 0 {
            return Err(CoreError::Config("table needs at least one shard".to_string()).into());
        }
        if req.sharder.is_absent() {
            return Err(CoreError::UnknownType {
                family: "sharder",
                type_id: req.sharder.type_id,
            }
            .into());
        }
        let sharder = plugins.sharders.build(req.sharder.type_id, &req.sharder.opts)?;
        let combiner: Box<dyn ByteAccumulator> = if req.combiner.is_absent() {
            Box::new(OverwriteBytes)
        } else {
            plugins
                .accumulators
                .build(req.combiner.type_id, &req.combiner.opts)?
        };
        let reducer: Box<dyn ByteAccumulator> = if req.reducer.is_absent() {
            Box::new(OverwriteBytes)
        } else {
            plugins
                .accumulators
                .build(req.reducer.type_id, &req.reducer.opts)?
        };
        let selector: Option<Box<dyn ByteSelector>> = if req.selector.is_absent() {
            None
        } else {
            Some(
                plugins
                    .selectors
                    .build(req.selector.type_id, &req.selector.opts)?,
            )
        };

        let shards = (0..req.num_shards)
            .map(|shard| ShardState {
                data: Mutex::new(ShardMap::new()),
                partition: Mutex::new(LocalPartition {
                    info: PartitionInfo::unassigned(shard),
                    acquired_epoch: 0,
                }),
                taint_cleared: Condvar::new(),
            })
            .collect();
        let outgoing = (0..req.num_shards)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();

        Ok(Table {
            id: req.id,
            num_shards: req.num_shards,
            node,
            transport,
            sharder,
            combiner,
            reducer,
            selector,
            shards,
            outgoing,
            pending_writes: AtomicUsize::new(0),
            flush_frequency: config.flush_frequency,
            iterator_fetch: config.iterator_fetch,
            cache: Mutex::new(HashMap::new()),
            epoch_seen: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> TableId {
        self.id
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    pub fn pending_writes(&self) -> usize {
        self.pending_writes.load(Ordering::Relaxed)
    }

    fn check_shard(&self, shard: usize) -> Result<()> {
        if shard < self.num_shards {
            Ok(())
        } else {
            Err(CoreError::ShardOutOfRange {
                table: self.id,
                shard,
                num_shards: self.num_shards,
            }
            .into())
        }
    }

    pub fn shard_for_key_bytes(&self, key: &[u8]) -> Result<usize> {
        let shard = self.sharder.shard_for_bytes(key, self.num_shards)?;
        self.check_shard(shard)?;
        Ok(shard)
    }

    pub fn owner(&self, shard: usize) -> Option<NodeId> {
        self.shards[shard].partition.lock().info.owner
    }

    pub fn is_local_shard(&self, shard: usize) -> bool {
        self.owner(shard) == Some(self.node)
    }

    pub fn tainted(&self, shard: usize) -> bool {
        self.shards[shard].partition.lock().info.tainted
    }

    pub fn partition(&self, shard: usize) -> PartitionInfo {
        self.shards[shard].partition.lock().info.clone()
    }

    /// Local shards answer from the store; remote shards answer from the
    /// entry count last broadcast by the master.
    pub fn shard_size(&self, shard: usize) -> u64 {
        if self.is_local_shard(shard) {
            self.shards[shard].data.lock().len() as u64
        } else {
            self.shards[shard].partition.lock().info.entries
        }
    }

    /// Blocks until no bulk update is in flight toward `shard`.
    fn wait_untainted(&self, shard: usize) {
        let state = &self.shards[shard];
        let mut part = state.partition.lock();
        while part.info.tainted {
            state.taint_cleared.wait(&mut part);
        }
    }

    /// Route and write. Local shards are overwritten in place; remote
    /// writes are buffered and flushed once enough accumulate.
    pub fn put_bytes(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let shard = self.shard_for_key_bytes(&key)?;
        if self.is_local_shard(shard) {
            self.shards[shard].data.lock().insert(key, value);
            return Ok(());
        }
        self.cache.lock().remove(&key);
        self.outgoing[shard].lock().insert(key, value);
        self.note_pending_write()
    }

    /// Route and merge through the combiner. The remote case merges into
    /// the outgoing buffer so a flush carries one pre-folded entry per key.
    pub fn update_bytes(&self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let shard = self.shard_for_key_bytes(&key)?;
        if self.is_local_shard(shard) {
            return self.shards[shard]
                .data
                .lock()
                .update(key, value, self.combiner.as_ref())
                .map_err(Into::into);
        }
        self.cache.lock().remove(&key);
        {
            let mut buffer = self.outgoing[shard].lock();
            let merged = match buffer.get(&key) {
                Some(current) => self.combiner.accumulate(current, &value)?,
                None => value,
            };
            buffer.insert(key, merged);
        }
        self.note_pending_write()
    }

    fn note_pending_write(&self) -> Result<()> {
        let pending = self.pending_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if pending > self.flush_frequency {
            self.send_updates()?;
        }
        Ok(())
    }

    /// Route and read by value. Reads of a tainted shard block until the
    /// inbound delta stream finishes; remote reads go through the cache.
    pub fn get_bytes(&self, key: &[u8]) -> Result<Vec<u8>> {
        let shard = self.shard_for_key_bytes(key)?;
        self.wait_untainted(shard);

        if self.is_local_shard(shard) {
            return self.shards[shard]
                .data
                .lock()
                .get(key)
                .cloned()
                .ok_or_else(|| CoreError::MissingKey.into());
        }

        // Read-your-writes: push buffered writes to the owner before
        // asking it for the value.
        if !self.outgoing[shard].lock().is_empty() {
            self.send_updates()?;
        }
        if let Some(hit) = self.cache_lookup(key) {
            return Ok(hit);
        }
        let resp = self.fetch_remote(shard, key)?;
        match resp.value {
            Some(value) => {
                self.cache.lock().insert(
                    key.to_vec(),
                    CacheEntry {
                        value: value.clone(),
                        last_read_time: Instant::now(),
                    },
                );
                Ok(value)
            }
            None => Err(CoreError::MissingKey.into()),
        }
    }

    /// Same routing and taint rules as [`get_bytes`]; a remote miss is
    /// reported as `false` instead of an error.
    pub fn contains_bytes(&self, key: &[u8]) -> Result<bool> {
        let shard = self.shard_for_key_bytes(key)?;
        self.wait_untainted(shard);

        if self.is_local_shard(shard) {
            return Ok(self.shards[shard].data.lock().contains(key));
        }
        if !self.outgoing[shard].lock().is_empty() {
            self.send_updates()?;
        }
        if self.cache_lookup(key).is_some() {
            return Ok(true);
        }
        let resp = self.fetch_remote(shard, key)?;
        match resp.value {
            Some(value) => {
                self.cache.lock().insert(
                    key.to_vec(),
                    CacheEntry {
                        value,
                        last_read_time: Instant::now(),
                    },
                );
                Ok(true)
            }
            None => Ok(!resp.missing_key),
        }
    }

    /// Reserved; single-key deletion is not part of the runtime contract.
    pub fn remove_bytes(&self, _key: &[u8]) -> Result<()> {
        Err(CoreError::Unimplemented("remove").into())
    }

    fn cache_lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut cache = self.cache.lock();
        cache.get_mut(key).map(|entry| {
            entry.last_read_time = Instant::now();
            entry.value.clone()
        })
    }

    fn fetch_remote(&self, shard: usize, key: &[u8]) -> Result<HashGetResp> {
        let owner = self.owner(shard).ok_or(ClusterError::NoLiveOwner {
            table: self.id,
            shard,
        })?;
        let req = Request::Get(HashGet {
            table: self.id,
            shard,
            key: key.to_vec(),
        });
        match self.transport.call(owner, req)?.wait()? {
            Response::Get(resp) => Ok(resp),
            other => Err(ClusterError::Protocol(format!(
                "get reply was {other:?}"
            ))),
        }
    }

    /// Flushes buffered writes to each shard's owner. Every dirty shard
    /// gets at least one batch, even an empty one, so the owner can clear
    /// its taint flag.
    pub fn send_updates(&self) -> Result<usize> {
        let epoch = self.epoch_seen.load(Ordering::Relaxed);
        let mut sent = 0;
        for shard in 0..self.num_shards {
            if self.is_local_shard(shard) {
                continue;
            }
            let dirty = self.shards[shard].partition.lock().info.dirty;
            let batch: Vec<KvData> = {
                let mut buffer = self.outgoing[shard].lock();
                buffer
                    .drain()
                    .map(|(key, value)| KvData { key, value })
                    .collect()
            };
            if batch.is_empty() && !dirty {
                continue;
            }
            let owner = self.owner(shard).ok_or(ClusterError::NoLiveOwner {
                table: self.id,
                shard,
            })?;
            sent += batch.len();
            debug!(
                table = self.id,
                shard,
                entries = batch.len(),
                %owner,
                "flushing shard batch"
            );
            let data = TableData {
                table: self.id,
                shard,
                source: self.node,
                epoch,
                kv_data: batch,
                done: true,
            };
            self.transport.call(owner, Request::Put(data))?.wait_ack()?;
            self.shards[shard].partition.lock().info.dirty = false;
        }
        self.pending_writes.store(0, Ordering::Relaxed);
        Ok(sent)
    }

    /// Drops this table's contents everywhere: broadcast to all workers,
    /// plus the caller's own buffers and cache.
    pub fn clear(&self) -> Result<()> {
        self.clear_local();
        for (_, handle) in self
            .transport
            .broadcast(Request::ClearTable(ClearTable { table: self.id }))?
        {
            handle.wait_ack()?;
        }
        Ok(())
    }

    /// Drops shard stores, outgoing buffers, and the read cache on this
    /// node only.
    pub fn clear_local(&self) {
        for state in &self.shards {
            state.data.lock().clear();
        }
        for buffer in &self.outgoing {
            buffer.lock().clear();
        }
        self.cache.lock().clear();
        self.pending_writes.store(0, Ordering::Relaxed);
    }

    /// Applies a master assignment broadcast. Gaining a shard marked
    /// tainted arms the taint gate; losing one moves the authoritative
    /// copy into the outgoing buffer for the delta stream.
    pub fn apply_assignment(&self, assignment: &ShardAssignment) {
        self.epoch_seen
            .fetch_max(assignment.epoch, Ordering::Relaxed);
        for p in &assignment.partitions {
            if p.shard >= self.num_shards {
                warn!(table = self.id, shard = p.shard, "assignment out of range");
                continue;
            }
            let state = &self.shards[p.shard];
            let mut part = state.partition.lock();
            let was_local = part.info.owner == Some(self.node);
            let now_local = p.owner == Some(self.node);
            part.info.owner = p.owner;
            part.info.entries = p.entries;

            if was_local && !now_local {
                let moved = state.data.lock().drain();
                let mut buffer = self.outgoing[p.shard].lock();
                for (key, value) in moved {
                    buffer.insert(key, value);
                }
                part.info.dirty = true;
                part.info.tainted = false;
                state.taint_cleared.notify_all();
                debug!(table = self.id, shard = p.shard, "demoted, delta queued");
            } else if now_local && !was_local {
                part.acquired_epoch = assignment.epoch;
                part.info.tainted = p.tainted;
            } else if !now_local {
                part.info.tainted = false;
            }
        }
    }

    /// Applies an inbound batch. The whole batch lands under the shard
    /// lock before taint is cleared; batches older than the epoch at
    /// which we acquired the shard are stale leftovers of a former owner
    /// and are dropped.
    pub fn apply_put(&self, data: &TableData) -> Result<()> {
        self.check_shard(data.shard)?;
        let state = &self.shards[data.shard];

        let acquired = state.partition.lock().acquired_epoch;
        if data.epoch < acquired {
            warn!(
                table = self.id,
                shard = data.shard,
                batch_epoch = data.epoch,
                acquired,
                "dropping stale batch from former owner"
            );
            return Ok(());
        }

        let entries = {
            let mut shard = state.data.lock();
            for kv in &data.kv_data {
                shard.update(kv.key.clone(), kv.value.clone(), self.reducer.as_ref())?;
            }
            shard.len() as u64
        };

        if data.done {
            let mut part = state.partition.lock();
            part.info.entries = entries;
            if part.info.tainted {
                part.info.tainted = false;
                debug!(table = self.id, shard = data.shard, "taint cleared");
            }
            state.taint_cleared.notify_all();
        }
        Ok(())
    }

    /// Serves a remote point read. Only the owner answers; the selector,
    /// when present, filters what leaves the node.
    pub fn serve_get(&self, req: &HashGet) -> Result<HashGetResp> {
        self.check_shard(req.shard)?;
        self.wait_untainted(req.shard);
        if !self.is_local_shard(req.shard) {
            return Err(ClusterError::Protocol(format!(
                "get for table {} shard {} routed to non-owner {}",
                req.table, req.shard, self.node
            )));
        }
        let shard = self.shards[req.shard].data.lock();
        let Some(value) = shard.get(&req.key) else {
            return Ok(HashGetResp {
                value: None,
                missing_key: true,
            });
        };
        let selected = match &self.selector {
            Some(selector) => selector.select(&req.key, value)?,
            None => Some(value.clone()),
        };
        Ok(match selected {
            Some(value) => HashGetResp {
                value: Some(value),
                missing_key: false,
            },
            None => HashGetResp {
                value: None,
                missing_key: true,
            },
        })
    }

    /// Serves one page of a remote scan.
    pub fn serve_iterate(&self, req: &IteratorRequest) -> Result<IteratorResponse> {
        self.check_shard(req.shard)?;
        self.wait_untainted(req.shard);
        if !self.is_local_shard(req.shard) {
            return Err(ClusterError::Protocol(format!(
                "iterate for table {} shard {} routed to non-owner {}",
                req.table, req.shard, self.node
            )));
        }
        let page = self.shards[req.shard]
            .data
            .lock()
            .page(req.shard, &req.cursor, req.fetch_num.max(1))?;
        let mut kv_data = Vec::with_capacity(page.entries.len());
        for (key, value) in page.entries {
            let selected = match &self.selector {
                Some(selector) => selector.select(&key, &value)?,
                None => Some(value),
            };
            if let Some(value) = selected {
                kv_data.push(KvData { key, value });
            }
        }
        Ok(IteratorResponse {
            kv_data,
            cursor: page.cursor,
            done: page.done,
        })
    }

    /// In-process iteration for local shards, a prefetching
    /// [`RemoteIterator`] otherwise.
    pub fn iter_shard(self: &Arc<Self>, shard: usize) -> Result<ShardIter> {
        self.check_shard(shard)?;
        self.wait_untainted(shard);
        if self.is_local_shard(shard) {
            let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self.shards[shard]
                .data
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(ShardIter::Local(snapshot.into_iter()))
        } else {
            Ok(ShardIter::Remote(RemoteIterator {
                table: Arc::clone(self),
                shard,
                cursor: Vec::new(),
                fifo: VecDeque::new(),
                done: false,
                fetch_num: self.iterator_fetch,
            }))
        }
    }
}

/// Streaming view of a remote shard: a prefetched FIFO refilled by
/// blocking `Iterate` calls against the owner.
pub struct RemoteIterator {
    table: Arc<Table>,
    shard: usize,
    cursor: Vec<u8>,
    fifo: VecDeque<(Vec<u8>, Vec<u8>)>,
    done: bool,
    fetch_num: usize,
}

impl RemoteIterator {
    fn refill(&mut self) -> Result<()> {
        let owner = self
            .table
            .owner(self.shard)
            .ok_or(ClusterError::NoLiveOwner {
                table: self.table.id,
                shard: self.shard,
            })?;
        let req = Request::Iterate(IteratorRequest {
            table: self.table.id,
            shard: self.shard,
            cursor: std::mem::take(&mut self.cursor),
            fetch_num: self.fetch_num,
        });
        match self.table.transport.call(owner, req)?.wait()? {
            Response::Iterate(resp) => {
                self.cursor = resp.cursor;
                self.done = resp.done;
                self.fifo
                    .extend(resp.kv_data.into_iter().map(|kv| (kv.key, kv.value)));
                Ok(())
            }
            other => Err(ClusterError::Protocol(format!(
                "iterate reply was {other:?}"
            ))),
        }
    }

    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while self.fifo.is_empty() && !self.done {
            self.refill()?;
        }
        Ok(self.fifo.pop_front())
    }
}

/// Iteration over one shard, local or remote.
pub enum ShardIter {
    Local(std::vec::IntoIter<(Vec<u8>, Vec<u8>)>),
    Remote(RemoteIterator),
}

impl ShardIter {
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        match self {
            ShardIter::Local(entries) => Ok(entries.next()),
            ShardIter::Remote(remote) => remote.next_entry(),
        }
    }
}

/// Typed facade over an erased table.
pub struct TableHandle<K, V> {
    table: Arc<Table>,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> Clone for TableHandle<K, V> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            _marker: PhantomData,
        }
    }
}

impl<K, V> std::fmt::Debug for TableHandle<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHandle").field("table", &self.table.id()).finish()
    }
}

impl<K: DataType, V: DataType> TableHandle<K, V> {
    pub fn new(table: Arc<Table>) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> TableId {
        self.table.id()
    }

    pub fn num_shards(&self) -> usize {
        self.table.num_shards()
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn shard_for_key(&self, key: &K) -> Result<usize> {
        self.table.shard_for_key_bytes(&codec::encode(key)?)
    }

    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        self.table
            .put_bytes(codec::encode(key)?, codec::encode(value)?)
    }

    pub fn update(&self, key: &K, value: &V) -> Result<()> {
        self.table
            .update_bytes(codec::encode(key)?, codec::encode(value)?)
    }

    pub fn get(&self, key: &K) -> Result<V> {
        let value = self.table.get_bytes(&codec::encode(key)?)?;
        Ok(codec::decode(&value)?)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        self.table.contains_bytes(&codec::encode(key)?)
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.table.remove_bytes(&codec::encode(key)?)
    }

    pub fn send_updates(&self) -> Result<usize> {
        self.table.send_updates()
    }

    pub fn clear(&self) -> Result<()> {
        self.table.clear()
    }

    pub fn iter_shard(&self, shard: usize) -> Result<TypedShardIter<K, V>> {
        Ok(TypedShardIter {
            inner: self.table.iter_shard(shard)?,
            _marker: PhantomData,
        })
    }
}

/// Typed iteration over one shard.
pub struct TypedShardIter<K, V> {
    inner: ShardIter,
    _marker: PhantomData<fn(K, V)>,
}

impl<K: DataType, V: DataType> TypedShardIter<K, V> {
    pub fn next_entry(&mut self) -> Result<Option<(K, V)>> {
        match self.inner.next_entry()? {
            Some((key, value)) => Ok(Some((codec::decode(&key)?, codec::decode(&value)?))),
            None => Ok(None),
        }
    }
}
