//! In-process cluster bootstrap shared by the end-to-end tests.
#![allow(dead_code)]

use std::sync::Arc;

use tessera::{
    Config, KernelRegistry, Master, Mesh, Modulo, NodeId, PluginRegistry, Replace, Sum, Worker,
    WorkerHandle,
};

pub const MODULO_I32: i32 = 1;
pub const REPLACE_I32: i32 = 2;
pub const SUM_I32: i32 = 3;
pub const MODULO_STR: i32 = 4;
pub const SUM_I64: i32 = 5;
pub const REPLACE_STR: i32 = 6;

pub fn plugin_registry() -> PluginRegistry {
    let mut reg = PluginRegistry::new();
    reg.register_sharder::<i32, _, _>(MODULO_I32, |_| Modulo);
    reg.register_accumulator::<i32, _, _>(REPLACE_I32, |_| Replace);
    reg.register_accumulator::<i32, _, _>(SUM_I32, |_| Sum);
    reg.register_sharder::<String, _, _>(MODULO_STR, |_| Modulo);
    reg.register_accumulator::<i64, _, _>(SUM_I64, |_| Sum);
    reg.register_accumulator::<String, _, _>(REPLACE_STR, |_| Replace);
    reg
}

/// Test-friendly timings: quick pings, small iterator pages.
pub fn test_config(num_workers: usize, num_shards: usize) -> Config {
    Config {
        num_workers,
        num_shards: Some(num_shards),
        iterator_fetch: 16,
        ping_interval_ms: 50,
        ping_timeout_ms: 2_000,
        ..Config::default()
    }
}

pub struct Cluster {
    pub mesh: Arc<Mesh>,
    pub master: Master,
    pub workers: Vec<WorkerHandle>,
}

pub fn start(config: Config, kernels: KernelRegistry) -> Cluster {
    if std::env::var_os("TESSERA_TEST_LOG").is_some() {
        let _ = tracing_subscriber::fmt().try_init();
    }

    let mesh = Mesh::new();
    let plugins = Arc::new(plugin_registry());
    let kernels = Arc::new(kernels);

    let (endpoint, inbox) = mesh.join(NodeId::MASTER);
    let master = Master::new(
        config.clone(),
        Arc::new(endpoint),
        inbox,
        Arc::clone(&plugins),
        Arc::clone(&kernels),
    )
    .unwrap();

    let workers = (0..config.num_workers)
        .map(|i| {
            let id = NodeId::worker(i);
            let (endpoint, inbox) = mesh.join(id);
            Worker::spawn(
                id,
                config.clone(),
                Arc::new(endpoint),
                inbox,
                Arc::clone(&plugins),
                Arc::clone(&kernels),
            )
            .unwrap()
        })
        .collect();
    master.wait_for_workers();

    Cluster {
        mesh,
        master,
        workers,
    }
}

impl Cluster {
    pub fn stop(self) {
        self.master.shutdown();
        for worker in self.workers {
            worker.join();
        }
    }
}
