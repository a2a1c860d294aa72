//! The worker runtime: an event loop feeding a pool of RPC handler
//! threads, so point reads and inbound batches stay serviceable while a
//! kernel runs or a flush blocks on a peer.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tessera_core::registry::PluginRegistry;
use tessera_core::Config;

use crate::error::{ClusterError, Result};
use crate::kernel::{KernelRegistry, KernelScope};
use crate::proto::{
    KernelDone, NodeId, Ping, RegisterReq, Request, Response, RunKernelReq, ShardId, TableId,
};
use crate::table::Table;
use crate::transport::{Envelope, Transport};

struct WorkerCtx {
    id: NodeId,
    config: Config,
    transport: Arc<dyn Transport>,
    plugins: Arc<PluginRegistry>,
    kernels: Arc<KernelRegistry>,
    tables: Arc<RwLock<HashMap<TableId, Arc<Table>>>>,
}

/// A running worker's threads and stop switch.
pub struct WorkerHandle {
    pub id: NodeId,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Asks the worker's background threads to wind down. The event loop
    /// itself stops on a `Shutdown` request or when its inbox closes.
    pub fn kill(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn join(self) {
        for thread in self.threads {
            let _ = thread.join();
        }
    }
}

/// Worker entry point: registers with the master, starts the ping loop,
/// the event loop, and the handler pool.
pub struct Worker;

impl Worker {
    pub fn spawn(
        id: NodeId,
        config: Config,
        transport: Arc<dyn Transport>,
        inbox: Receiver<Envelope>,
        plugins: Arc<PluginRegistry>,
        kernels: Arc<KernelRegistry>,
    ) -> Result<WorkerHandle> {
        config.validate()?;
        transport
            .call(
                NodeId::MASTER,
                Request::Register(RegisterReq {
                    worker: id,
                    addr: format!("inproc://{id}"),
                }),
            )?
            .wait_ack()?;
        info!(%id, "worker registered");

        let ctx = Arc::new(WorkerCtx {
            id,
            config: config.clone(),
            transport,
            plugins,
            kernels,
            tables: Arc::new(RwLock::new(HashMap::new())),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        // Handler pool.
        let (work_tx, work_rx) = unbounded::<Envelope>();
        for _ in 0..config.handler_threads {
            let ctx = Arc::clone(&ctx);
            let work_rx = work_rx.clone();
            threads.push(std::thread::spawn(move || {
                while let Ok(env) = work_rx.recv() {
                    ctx.handle(env);
                }
            }));
        }

        // Event loop: accepts requests and hands them to the pool.
        {
            let shutdown = Arc::clone(&shutdown);
            threads.push(std::thread::spawn(move || {
                while let Ok(env) = inbox.recv() {
                    if matches!(env.req, Request::Shutdown) {
                        env.respond(Response::Ack);
                        break;
                    }
                    if work_tx.send(env).is_err() {
                        break;
                    }
                }
                shutdown.store(true, Ordering::Relaxed);
                // work_tx drops here; the pool drains and exits
            }));
        }

        // Ping loop.
        {
            let ctx = Arc::clone(&ctx);
            let shutdown = Arc::clone(&shutdown);
            let interval = Duration::from_millis(config.ping_interval_ms);
            threads.push(std::thread::spawn(move || loop {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                match ctx
                    .transport
                    .call(NodeId::MASTER, Request::Ping(Ping { worker: ctx.id }))
                {
                    Ok(handle) => {
                        let _ = handle;
                    }
                    Err(e) => {
                        debug!(id = %ctx.id, "ping failed, stopping: {e}");
                        break;
                    }
                }
                std::thread::sleep(interval);
            }));
        }

        Ok(WorkerHandle {
            id,
            shutdown,
            threads,
        })
    }
}

impl WorkerCtx {
    fn handle(&self, env: Envelope) {
        match self.dispatch(&env.req) {
            Ok(resp) => env.respond(resp),
            Err(e) => {
                warn!(id = %self.id, req = env.req.method(), "request failed: {e}");
                env.respond(Response::Error(e.to_string()));
            }
        }
    }

    fn table(&self, id: TableId) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| ClusterError::Protocol(format!("unknown table {id}")))
    }

    fn dispatch(&self, req: &Request) -> Result<Response> {
        match req {
            Request::CreateTable(req) => {
                let table = Table::create(
                    req,
                    &self.config,
                    self.id,
                    Arc::clone(&self.transport),
                    &self.plugins,
                )?;
                self.tables.write().insert(req.id, Arc::new(table));
                info!(id = %self.id, table = req.id, shards = req.num_shards, "table created");
                Ok(Response::Ack)
            }
            Request::Assign(assignment) => {
                self.table(assignment.table)?.apply_assignment(assignment);
                Ok(Response::Ack)
            }
            Request::Put(data) => {
                self.table(data.table)?.apply_put(data)?;
                Ok(Response::Ack)
            }
            Request::Get(get) => Ok(Response::Get(self.table(get.table)?.serve_get(get)?)),
            Request::Iterate(req) => {
                Ok(Response::Iterate(self.table(req.table)?.serve_iterate(req)?))
            }
            Request::RunKernel(req) => {
                self.run_kernel(req);
                Ok(Response::Ack)
            }
            Request::ClearTable(req) => {
                self.table(req.table)?.clear_local();
                Ok(Response::Ack)
            }
            Request::DestroyTable(req) => {
                self.tables.write().remove(&req.table);
                Ok(Response::Ack)
            }
            Request::Flush => {
                let tables: Vec<Arc<Table>> = self.tables.read().values().cloned().collect();
                for table in tables {
                    table.send_updates()?;
                }
                Ok(Response::Ack)
            }
            Request::Shutdown => Ok(Response::Ack),
            Request::Register(_) | Request::Ping(_) | Request::KernelDone(_) => Err(
                ClusterError::Protocol(format!("{} not served by workers", req.method())),
            ),
        }
    }

    /// Runs a kernel synchronously in this handler thread and reports the
    /// outcome to the master. Panics and errors travel back as a failed
    /// completion; the scheduler decides whether to retry.
    fn run_kernel(&self, req: &RunKernelReq) {
        let started = Instant::now();
        let outcome = self.execute_kernel(req);
        let error = match outcome {
            Ok(()) => None,
            Err(e) => {
                warn!(id = %self.id, table = req.table, shard = req.shard, "kernel failed: {e}");
                Some(e.to_string())
            }
        };
        let done = KernelDone {
            shard_id: ShardId::new(req.table, req.shard),
            worker: self.id,
            runtime_ms: started.elapsed().as_millis() as u64,
            error,
        };
        match self
            .transport
            .call(NodeId::MASTER, Request::KernelDone(done))
        {
            Ok(handle) => {
                let _ = handle;
            }
            Err(e) => debug!(id = %self.id, "completion report failed: {e}"),
        }
    }

    fn execute_kernel(&self, req: &RunKernelReq) -> Result<()> {
        let kernel = self.kernels.build(req.kernel)?;
        let table = self.table(req.table)?;
        debug!(id = %self.id, table = req.table, shard = req.shard, "running kernel");
        let scope = KernelScope::new(
            self.id,
            table,
            req.shard,
            &req.args,
            Arc::clone(&self.tables),
        );
        match catch_unwind(AssertUnwindSafe(|| kernel.run(&scope))) {
            Ok(result) => result,
            Err(_) => Err(ClusterError::KernelFailed {
                shard: req.shard,
                message: "kernel panicked".to_string(),
            }),
        }
    }
}
