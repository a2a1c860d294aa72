mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::{start, MODULO_I32, REPLACE_I32};
use tessera::{Config, Kernel, KernelRegistry, KernelScope, NodeId, PluginSpec};

struct SleepKernel;

impl Kernel for SleepKernel {
    fn run(&self, scope: &KernelScope<'_>) -> tessera::Result<()> {
        let ms: u64 = scope.arg("ms")?;
        std::thread::sleep(Duration::from_millis(ms));
        Ok(())
    }
}

#[test]
fn dead_worker_tasks_are_reassigned() {
    let mut kernels = KernelRegistry::new();
    kernels.register(20, "sleep", || Box::new(SleepKernel));

    let config = Config {
        num_workers: 3,
        num_shards: Some(9),
        ping_interval_ms: 50,
        ping_timeout_ms: 400,
        ..Config::default()
    };
    let cluster = start(config, kernels);
    let table = cluster
        .master
        .create_table::<i32, i32>(
            PluginSpec::new(MODULO_I32),
            PluginSpec::new(REPLACE_I32),
            PluginSpec::new(REPLACE_I32),
            None,
        )
        .unwrap();

    let desc = tessera::RunDescriptor::over_all_shards(20, table.id(), 9)
        .with_arg("ms", &300u64)
        .unwrap();

    std::thread::scope(|scope| {
        let run = scope.spawn(|| cluster.master.run(desc));

        // kill worker 1 while its first kernel is still sleeping
        std::thread::sleep(Duration::from_millis(150));
        cluster.mesh.disconnect(NodeId::worker(1));
        cluster.workers[1].kill();

        run.join().unwrap().unwrap();
    });

    // the dead worker is recognized as such
    let states = cluster.master.worker_states();
    let dead = states.iter().find(|w| w.id == NodeId::worker(1)).unwrap();
    assert!(!dead.is_alive());

    // and every shard finished exactly once, on a surviving worker
    let mut all = BTreeSet::new();
    for worker in &states {
        for sid in worker.finished_ids() {
            assert!(all.insert(sid), "shard finished twice");
            assert_ne!(worker.id, NodeId::worker(1));
        }
    }
    assert_eq!(all.len(), 9);

    cluster.stop();
}
