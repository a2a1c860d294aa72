//! The master: worker registration, shard-to-worker assignment, kernel
//! dispatch with one active task per worker, straggler stealing, and
//! recovery when a worker stops pinging.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use tessera_core::codec::DataType;
use tessera_core::registry::PluginRegistry;
use tessera_core::{Config, CoreError};

use crate::error::{ClusterError, Result};
use crate::kernel::{KernelRegistry, RunDescriptor};
use crate::proto::{
    CreateTableReq, DestroyTable, KernelDone, NodeId, PartitionInfo, PluginSpec, Request,
    Response, RunKernelReq, ShardAssignment, ShardId, TableId,
};
use crate::table::{Table, TableHandle};
use crate::transport::{Envelope, Transport};

/// One schedulable unit: a kernel execution against one shard.
#[derive(Debug, Clone)]
pub struct TaskState {
    pub id: ShardId,
    pub size: u64,
    pub stolen: bool,
}

impl TaskState {
    pub fn new(id: ShardId, size: u64) -> Self {
        Self {
            id,
            size,
            stolen: false,
        }
    }
}

struct WorkerInner {
    alive: bool,
    last_ping: Instant,
    total_runtime: Duration,
    pending: BTreeMap<ShardId, TaskState>,
    active: BTreeMap<ShardId, TaskState>,
    finished: BTreeMap<ShardId, TaskState>,
    shards: HashSet<ShardId>,
}

/// Master-side bookkeeping for one worker. All task sets live under one
/// per-worker mutex.
pub struct WorkerState {
    pub id: NodeId,
    pub addr: String,
    inner: Mutex<WorkerInner>,
}

impl WorkerState {
    fn new(id: NodeId, addr: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            addr,
            inner: Mutex::new(WorkerInner {
                alive: true,
                last_ping: Instant::now(),
                total_runtime: Duration::ZERO,
                pending: BTreeMap::new(),
                active: BTreeMap::new(),
                finished: BTreeMap::new(),
                shards: HashSet::new(),
            }),
        })
    }

    fn ping(&self) {
        self.inner.lock().last_ping = Instant::now();
    }

    pub fn is_alive(&self) -> bool {
        self.inner.lock().alive
    }

    fn is_stale(&self, timeout: Duration) -> bool {
        let inner = self.inner.lock();
        inner.alive && inner.last_ping.elapsed() > timeout
    }

    fn has_work(&self) -> bool {
        let inner = self.inner.lock();
        !inner.pending.is_empty() || !inner.active.is_empty()
    }

    fn serves(&self, shard: ShardId) -> bool {
        self.inner.lock().shards.contains(&shard)
    }

    fn add_shard(&self, shard: ShardId) {
        self.inner.lock().shards.insert(shard);
    }

    fn shard_count(&self, table: TableId) -> usize {
        self.inner
            .lock()
            .shards
            .iter()
            .filter(|s| s.table == table)
            .count()
    }

    fn assign_task(&self, task: TaskState) {
        self.inner.lock().pending.insert(task.id, task);
    }

    /// Pops the next pending task into `active`, smallest shard first.
    /// Returns nothing while a task is already active: each worker runs
    /// at most one kernel at a time.
    fn next_task(&self) -> Option<TaskState> {
        let mut inner = self.inner.lock();
        if !inner.active.is_empty() || inner.pending.is_empty() {
            return None;
        }
        let (id, task) = inner.pending.pop_first()?;
        inner.active.insert(id, task.clone());
        Some(task)
    }

    fn set_finished(&self, id: ShardId, runtime: Duration) {
        let mut inner = self.inner.lock();
        let task = inner
            .active
            .remove(&id)
            .or_else(|| inner.pending.remove(&id))
            .unwrap_or_else(|| TaskState::new(id, 1));
        inner.finished.insert(id, task);
        inner.total_runtime += runtime;
    }

    fn take_active(&self, id: ShardId) -> Option<TaskState> {
        let mut inner = self.inner.lock();
        inner
            .active
            .remove(&id)
            .or_else(|| inner.pending.remove(&id))
    }

    fn discard(&self, id: ShardId) {
        let mut inner = self.inner.lock();
        inner.pending.remove(&id);
        inner.active.remove(&id);
    }

    fn remove_pending(&self, id: ShardId) {
        self.inner.lock().pending.remove(&id);
    }

    /// Marks the worker dead and returns every task it still held.
    fn mark_dead_and_drain(&self) -> Vec<TaskState> {
        let mut inner = self.inner.lock();
        inner.alive = false;
        let mut orphans: Vec<TaskState> = inner.pending.values().cloned().collect();
        orphans.extend(inner.active.values().cloned());
        inner.pending.clear();
        inner.active.clear();
        orphans
    }

    /// Steals the largest-index pending task, if any.
    fn steal_task(&self) -> Option<TaskState> {
        let mut inner = self.inner.lock();
        let (_, mut task) = inner.pending.pop_last()?;
        task.stolen = true;
        Some(task)
    }

    fn clear_tasks(&self) {
        let mut inner = self.inner.lock();
        inner.pending.clear();
        inner.active.clear();
        inner.finished.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn finished_ids(&self) -> Vec<ShardId> {
        self.inner.lock().finished.keys().copied().collect()
    }

    pub fn total_runtime(&self) -> Duration {
        self.inner.lock().total_runtime
    }
}

struct MasterState {
    workers: Mutex<Vec<Arc<WorkerState>>>,
    workers_changed: Condvar,
}

/// The cluster coordinator and client entry point.
pub struct Master {
    config: Config,
    transport: Arc<dyn Transport>,
    plugins: Arc<PluginRegistry>,
    kernels: Arc<KernelRegistry>,
    state: Arc<MasterState>,
    tables: RwLock<HashMap<TableId, Arc<Table>>>,
    table_id_counter: AtomicU32,
    epoch: AtomicU64,
    poisoned: AtomicBool,
    completions_rx: Receiver<KernelDone>,
    rpc_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    /// Starts the master's RPC loop. Returns immediately; workers register
    /// as they come up and `wait_for_workers` blocks until enough have.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        inbox: Receiver<Envelope>,
        plugins: Arc<PluginRegistry>,
        kernels: Arc<KernelRegistry>,
    ) -> Result<Master> {
        config.validate()?;
        let state = Arc::new(MasterState {
            workers: Mutex::new(Vec::new()),
            workers_changed: Condvar::new(),
        });
        let (completions_tx, completions_rx) = unbounded();

        let rpc_thread = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || rpc_loop(&state, &completions_tx, inbox))
        };

        Ok(Master {
            config,
            transport,
            plugins,
            kernels,
            state,
            tables: RwLock::new(HashMap::new()),
            table_id_counter: AtomicU32::new(0),
            epoch: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
            completions_rx,
            rpc_thread: Mutex::new(Some(rpc_thread)),
        })
    }

    /// Blocks until the configured number of workers has registered.
    pub fn wait_for_workers(&self) {
        let mut workers = self.state.workers.lock();
        while workers.len() < self.config.num_workers {
            self.state.workers_changed.wait(&mut workers);
        }
    }

    pub fn num_workers(&self) -> usize {
        self.state.workers.lock().len()
    }

    pub fn get_table(&self, id: TableId) -> Option<Arc<Table>> {
        self.tables.read().get(&id).cloned()
    }

    fn all_workers(&self) -> Vec<Arc<WorkerState>> {
        self.state.workers.lock().clone()
    }

    fn live_workers(&self) -> Vec<Arc<WorkerState>> {
        self.state
            .workers
            .lock()
            .iter()
            .filter(|w| w.is_alive())
            .cloned()
            .collect()
    }

    fn worker_by_id(&self, id: NodeId) -> Option<Arc<WorkerState>> {
        self.state
            .workers
            .lock()
            .iter()
            .find(|w| w.id == id)
            .cloned()
    }

    /// The live worker serving `shard`, if any.
    fn worker_for_shard(&self, shard: ShardId) -> Result<Arc<WorkerState>> {
        self.live_workers()
            .into_iter()
            .find(|w| w.serves(shard))
            .ok_or(ClusterError::NoLiveOwner {
                table: shard.table,
                shard: shard.shard,
            })
    }

    /// Creates a table across the cluster. Waits for the worker quorum,
    /// fails fast on unresolvable plugin ids, broadcasts the create, and
    /// assigns shards.
    pub fn create_table<K: DataType, V: DataType>(
        &self,
        sharder: PluginSpec,
        combiner: PluginSpec,
        reducer: PluginSpec,
        selector: Option<PluginSpec>,
    ) -> Result<TableHandle<K, V>> {
        self.wait_for_workers();

        self.plugins.sharders.check(sharder.type_id)?;
        if !combiner.is_absent() {
            self.plugins.accumulators.check(combiner.type_id)?;
        }
        if !reducer.is_absent() {
            self.plugins.accumulators.check(reducer.type_id)?;
        }
        if let Some(spec) = &selector {
            self.plugins.selectors.check(spec.type_id)?;
        }

        let id = self.table_id_counter.fetch_add(1, Ordering::Relaxed);
        let num_shards = self.config.shards_for(self.num_workers());
        let req = CreateTableReq {
            id,
            table_type_id: 0,
            num_shards,
            sharder,
            combiner,
            reducer,
            selector: selector.unwrap_or_else(PluginSpec::absent),
        };
        info!(table = id, num_shards, "creating table");

        let table = Arc::new(Table::create(
            &req,
            &self.config,
            NodeId::MASTER,
            Arc::clone(&self.transport),
            &self.plugins,
        )?);
        for worker in self.live_workers() {
            self.transport
                .call(worker.id, Request::CreateTable(req.clone()))?
                .wait_ack()?;
        }
        self.tables.write().insert(id, Arc::clone(&table));
        self.assign_shards(&table)?;
        Ok(TableHandle::new(table))
    }

    /// Sticky, least-loaded shard assignment: keep live owners, hand the
    /// rest to the live worker with the fewest shards of this table (ties
    /// to the smallest worker id), then broadcast.
    fn assign_shards(&self, table: &Arc<Table>) -> Result<()> {
        let workers = self.live_workers();
        if workers.is_empty() {
            return Err(CoreError::Config("no live workers to assign shards to".to_string()).into());
        }
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed) + 1;
        let mut partitions = Vec::with_capacity(table.num_shards());
        for shard in 0..table.num_shards() {
            let sid = ShardId::new(table.id(), shard);
            let previous = table.owner(shard);
            let chosen = match workers.iter().find(|w| w.serves(sid)) {
                Some(current) => Arc::clone(current),
                None => {
                    let least = workers
                        .iter()
                        .min_by_key(|w| (w.shard_count(table.id()), w.id))
                        .cloned()
                        .ok_or(CoreError::Config("no live workers".to_string()))?;
                    least.add_shard(sid);
                    least
                }
            };
            // A shard moving between two live workers gets a delta stream
            // from the former owner; the new owner must gate reads on it.
            let moved_from_live = previous.is_some_and(|prev| {
                prev != chosen.id && workers.iter().any(|w| w.id == prev)
            });
            partitions.push(PartitionInfo {
                shard,
                owner: Some(chosen.id),
                entries: table.shard_size(shard),
                dirty: false,
                tainted: moved_from_live,
            });
        }

        let assignment = ShardAssignment {
            table: table.id(),
            epoch,
            partitions,
        };
        table.apply_assignment(&assignment);
        for worker in &workers {
            self.transport
                .call(worker.id, Request::Assign(assignment.clone()))?
                .wait_ack()?;
        }
        debug!(table = table.id(), epoch, "assignment broadcast");
        Ok(())
    }

    /// Runs `kernel` once per shard of `table`.
    pub fn map_shards(&self, table: TableId, kernel: &str) -> Result<()> {
        let kernel_id = self.kernels.id_by_name(kernel)?;
        let num_shards = self
            .get_table(table)
            .ok_or_else(|| CoreError::Config(format!("no such table {table}")))?
            .num_shards();
        self.run(RunDescriptor::over_all_shards(kernel_id, table, num_shards))
    }

    /// The dispatch loop. Completes when every target shard is finished
    /// exactly once; recovers from dead workers by reassignment and from
    /// stragglers by stealing.
    pub fn run(&self, desc: RunDescriptor) -> Result<()> {
        if self.poisoned.load(Ordering::Relaxed) {
            return Err(ClusterError::Protocol(
                "master poisoned by an earlier fatal error; shutdown required".to_string(),
            ));
        }
        let result = self.run_inner(&desc);
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("fatal error, refusing further runs: {e}");
                self.poisoned.store(true, Ordering::Relaxed);
            }
        }
        result
    }

    fn run_inner(&self, desc: &RunDescriptor) -> Result<()> {
        self.kernels.check(desc.kernel)?;
        let table = self
            .get_table(desc.table)
            .ok_or_else(|| CoreError::Config(format!("no such table {}", desc.table)))?;
        for &shard in &desc.shards {
            if shard >= table.num_shards() {
                return Err(CoreError::ShardOutOfRange {
                    table: desc.table,
                    shard,
                    num_shards: table.num_shards(),
                }
                .into());
            }
        }

        // Stale completions from an earlier run must not satisfy this one.
        while self.completions_rx.try_recv().is_ok() {}
        for worker in self.all_workers() {
            worker.clear_tasks();
        }

        let target: BTreeSet<ShardId> = desc
            .shards
            .iter()
            .map(|&s| ShardId::new(desc.table, s))
            .collect();
        if target
            .iter()
            .any(|sid| self.worker_for_shard(*sid).is_err())
        {
            self.assign_shards(&table)?;
        }
        for sid in &target {
            let worker = self.worker_for_shard(*sid)?;
            worker.assign_task(TaskState::new(*sid, table.shard_size(sid.shard).max(1)));
        }
        info!(
            table = desc.table,
            kernel = desc.kernel,
            shards = target.len(),
            "run started"
        );

        let ping_interval = Duration::from_millis(self.config.ping_interval_ms);
        let ping_timeout = Duration::from_millis(self.config.ping_timeout_ms);
        let mut finished: BTreeSet<ShardId> = BTreeSet::new();
        let mut retries: HashMap<ShardId, u32> = HashMap::new();

        while finished.len() < target.len() {
            let mut orphans: Vec<TaskState> = Vec::new();

            // Dispatch to every idle worker with pending work.
            for worker in self.live_workers() {
                if let Some(task) = worker.next_task() {
                    let req = RunKernelReq {
                        kernel: desc.kernel,
                        table: desc.table,
                        shard: task.id.shard,
                        args: desc.args.clone(),
                    };
                    debug!(worker = %worker.id, shard = task.id.shard, "dispatching kernel");
                    match self.transport.call(worker.id, Request::RunKernel(req)) {
                        Ok(handle) => {
                            // completion arrives as a KernelDone message
                            let _ = handle;
                        }
                        Err(e) => {
                            warn!(worker = %worker.id, "dispatch failed, declaring dead: {e}");
                            orphans.extend(worker.mark_dead_and_drain());
                        }
                    }
                }
            }

            // Wait for any completion, bounded by the ping interval.
            match self.completions_rx.recv_timeout(ping_interval) {
                Ok(done) => self.handle_completion(done, &mut finished, &mut retries)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClusterError::Transport(
                        "completion channel closed".to_string(),
                    ));
                }
            }

            // Declare silent workers dead and collect their tasks.
            for worker in self.live_workers() {
                if worker.is_stale(ping_timeout) && worker.has_work() {
                    warn!(worker = %worker.id, "ping timeout, reassigning its tasks");
                    orphans.extend(worker.mark_dead_and_drain());
                }
            }
            if !orphans.is_empty() {
                self.assign_shards(&table)?;
                for task in orphans {
                    if finished.contains(&task.id) {
                        continue;
                    }
                    self.worker_for_shard(task.id)?.assign_task(task);
                }
            }

            self.steal_one();
        }

        info!(table = desc.table, shards = finished.len(), "run complete");
        Ok(())
    }

    fn handle_completion(
        &self,
        done: KernelDone,
        finished: &mut BTreeSet<ShardId>,
        retries: &mut HashMap<ShardId, u32>,
    ) -> Result<()> {
        let Some(worker) = self.worker_by_id(done.worker) else {
            return Ok(());
        };

        if let Some(message) = done.error {
            let task = worker
                .take_active(done.shard_id)
                .unwrap_or_else(|| TaskState::new(done.shard_id, 1));
            let attempts = retries.entry(done.shard_id).or_insert(0);
            if *attempts >= self.config.kernel_retry_limit {
                return Err(ClusterError::KernelFailed {
                    shard: done.shard_id.shard,
                    message,
                });
            }
            *attempts += 1;
            let retry_on = self
                .live_workers()
                .into_iter()
                .filter(|w| w.id != done.worker)
                .min_by_key(|w| (w.pending_len() + w.active_len(), w.id));
            match retry_on {
                Some(other) => {
                    warn!(
                        shard = done.shard_id.shard,
                        from = %done.worker,
                        to = %other.id,
                        "kernel failed, retrying elsewhere: {message}"
                    );
                    other.assign_task(task);
                    Ok(())
                }
                None => Err(ClusterError::KernelFailed {
                    shard: done.shard_id.shard,
                    message,
                }),
            }
        } else {
            if finished.contains(&done.shard_id) {
                // a stolen or requeued duplicate finished twice
                debug!(shard = done.shard_id.shard, "duplicate completion");
                worker.discard(done.shard_id);
                return Ok(());
            }
            worker.set_finished(done.shard_id, Duration::from_millis(done.runtime_ms));
            finished.insert(done.shard_id);
            for other in self.all_workers() {
                if other.id != done.worker {
                    other.remove_pending(done.shard_id);
                }
            }
            Ok(())
        }
    }

    /// Moves one task from the most-backlogged worker to an idle one.
    /// Ties on both sides go to the smallest worker id.
    fn steal_one(&self) {
        let workers = self.live_workers();
        let Some(donor) = workers
            .iter()
            .filter(|w| w.pending_len() > 0)
            .min_by_key(|w| (Reverse(w.pending_len()), w.id))
        else {
            return;
        };
        let Some(recipient) = workers
            .iter()
            .filter(|w| w.id != donor.id && w.pending_len() + w.active_len() == 0)
            .min_by_key(|w| w.id)
        else {
            return;
        };
        if let Some(task) = donor.steal_task() {
            debug!(
                shard = task.id.shard,
                from = %donor.id,
                to = %recipient.id,
                "stealing task"
            );
            recipient.assign_task(task);
        }
    }

    /// Flushes the master's buffered writes, then every worker's.
    pub fn flush(&self) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
        for table in &tables {
            table.send_updates()?;
        }
        for worker in self.live_workers() {
            self.transport
                .call(worker.id, Request::Flush)?
                .wait_ack()?;
        }
        Ok(())
    }

    pub fn destroy_table(&self, table: TableId) -> Result<()> {
        for worker in self.live_workers() {
            self.transport
                .call(worker.id, Request::DestroyTable(DestroyTable { table }))?
                .wait_ack()?;
        }
        self.tables.write().remove(&table);
        Ok(())
    }

    /// Stops every worker and the master's own RPC loop.
    pub fn shutdown(&self) {
        for worker in self.live_workers() {
            if let Ok(handle) = self.transport.call(worker.id, Request::Shutdown) {
                let _ = handle.wait_ack();
            }
        }
        if let Ok(handle) = self.transport.call(NodeId::MASTER, Request::Shutdown) {
            let _ = handle.wait_ack();
        }
        if let Some(thread) = self.rpc_thread.lock().take() {
            let _ = thread.join();
        }
    }

    /// Scheduler introspection, for tests and status displays.
    pub fn worker_states(&self) -> Vec<Arc<WorkerState>> {
        self.all_workers()
    }
}

fn rpc_loop(state: &MasterState, completions: &Sender<KernelDone>, inbox: Receiver<Envelope>) {
    while let Ok(env) = inbox.recv() {
        match &env.req {
            Request::Register(req) => {
                let mut workers = state.workers.lock();
                match workers.iter().find(|w| w.id == req.worker) {
                    Some(existing) => {
                        debug!(worker = %req.worker, "re-registration, refreshing ping");
                        existing.ping();
                    }
                    None => {
                        info!(worker = %req.worker, addr = %req.addr, "worker registered");
                        workers.push(WorkerState::new(req.worker, req.addr.clone()));
                        state.workers_changed.notify_all();
                    }
                }
                env.respond(Response::Ack);
            }
            Request::Ping(ping) => {
                if let Some(worker) = state.workers.lock().iter().find(|w| w.id == ping.worker) {
                    worker.ping();
                }
                env.respond(Response::Ack);
            }
            Request::KernelDone(done) => {
                let _ = completions.send(done.clone());
                env.respond(Response::Ack);
            }
            Request::Shutdown => {
                env.respond(Response::Ack);
                break;
            }
            other => {
                let method = other.method();
                env.respond(Response::Error(format!(
                    "{method} not served by the master",
                )));
            }
        }
    }
}
