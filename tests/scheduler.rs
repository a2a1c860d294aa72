mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{start, test_config, MODULO_I32, REPLACE_I32};
use tessera::{
    ClusterError, Kernel, KernelRegistry, KernelScope, NodeId, PluginSpec, RunDescriptor, ShardId,
};

/// Tracks per-worker kernel concurrency while sleeping longer on worker 0,
/// so an idle peer has something to steal.
struct SkewKernel {
    probe: Arc<Probe>,
}

struct Probe {
    active: Vec<AtomicUsize>,
    max_active: Vec<AtomicUsize>,
}

impl Probe {
    fn new(workers: usize) -> Arc<Self> {
        Arc::new(Self {
            active: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            max_active: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
        })
    }
}

impl Kernel for SkewKernel {
    fn run(&self, scope: &KernelScope<'_>) -> tessera::Result<()> {
        let worker = scope.node().0 as usize;
        let now = self.probe.active[worker].fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active[worker].fetch_max(now, Ordering::SeqCst);

        let ms = if scope.node() == NodeId::worker(0) {
            80
        } else {
            5
        };
        std::thread::sleep(Duration::from_millis(ms));

        self.probe.active[worker].fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails the first attempt on each shard, succeeds afterwards, and
/// remembers which worker saw the failure.
struct FlakyOnceKernel {
    failed: Arc<parking_lot::Mutex<std::collections::HashMap<usize, NodeId>>>,
}

impl Kernel for FlakyOnceKernel {
    fn run(&self, scope: &KernelScope<'_>) -> tessera::Result<()> {
        let mut failed = self.failed.lock();
        if let std::collections::hash_map::Entry::Vacant(slot) = failed.entry(scope.shard()) {
            slot.insert(scope.node());
            return Err(ClusterError::Remote("first attempt".to_string()));
        }
        Ok(())
    }
}

struct AlwaysFailKernel;

impl Kernel for AlwaysFailKernel {
    fn run(&self, _scope: &KernelScope<'_>) -> tessera::Result<()> {
        Err(ClusterError::Remote("nope".to_string()))
    }
}

struct NoopKernel;

impl Kernel for NoopKernel {
    fn run(&self, _scope: &KernelScope<'_>) -> tessera::Result<()> {
        Ok(())
    }
}

fn finished_by_worker(master: &tessera::Master) -> Vec<(NodeId, Vec<ShardId>)> {
    master
        .worker_states()
        .iter()
        .map(|w| (w.id, w.finished_ids()))
        .collect()
}

fn assert_exact_coverage(master: &tessera::Master, expected: usize) {
    let mut all = BTreeSet::new();
    for (worker, finished) in finished_by_worker(master) {
        for sid in finished {
            assert!(
                all.insert(sid),
                "shard {sid:?} finished on more than one worker ({worker})"
            );
        }
    }
    assert_eq!(all.len(), expected);
}

#[test]
fn idle_workers_steal_from_stragglers() {
    let probe = Probe::new(2);
    let mut kernels = KernelRegistry::new();
    {
        let probe = Arc::clone(&probe);
        kernels.register(30, "skew", move || {
            Box::new(SkewKernel {
                probe: Arc::clone(&probe),
            })
        });
    }

    let cluster = start(test_config(2, 8), kernels);
    let table = cluster
        .master
        .create_table::<i32, i32>(
            PluginSpec::new(MODULO_I32),
            PluginSpec::new(REPLACE_I32),
            PluginSpec::new(REPLACE_I32),
            None,
        )
        .unwrap();

    cluster.master.map_shards(table.id(), "skew").unwrap();

    assert_exact_coverage(&cluster.master, 8);
    for (worker, count) in probe
        .max_active
        .iter()
        .map(|m| m.load(Ordering::SeqCst))
        .enumerate()
    {
        assert!(count <= 1, "worker {worker} ran {count} kernels at once");
    }

    // worker 1 drains its own four fast tasks, then steals from worker 0
    let finished = finished_by_worker(&cluster.master);
    let fast_worker = finished
        .iter()
        .find(|(id, _)| *id == NodeId::worker(1))
        .map(|(_, f)| f.len())
        .unwrap();
    assert!(
        fast_worker >= 5,
        "expected stealing to shift work, worker 1 finished only {fast_worker}"
    );

    cluster.stop();
}

#[test]
fn failed_kernels_retry_and_the_run_completes() {
    let failed = Arc::new(parking_lot::Mutex::new(std::collections::HashMap::new()));
    let mut kernels = KernelRegistry::new();
    {
        let failed = Arc::clone(&failed);
        kernels.register(31, "flaky_once", move || {
            Box::new(FlakyOnceKernel {
                failed: Arc::clone(&failed),
            })
        });
    }

    let cluster = start(test_config(2, 6), kernels);
    let table = cluster
        .master
        .create_table::<i32, i32>(
            PluginSpec::new(MODULO_I32),
            PluginSpec::new(REPLACE_I32),
            PluginSpec::new(REPLACE_I32),
            None,
        )
        .unwrap();

    // every shard fails its first attempt; the single retry saves the run
    cluster.master.map_shards(table.id(), "flaky_once").unwrap();
    assert_exact_coverage(&cluster.master, 6);
    assert_eq!(failed.lock().len(), 6, "each shard failed exactly once");

    cluster.stop();
}

#[test]
fn retry_budget_exhausted_fails_the_run_but_not_the_master() {
    let mut kernels = KernelRegistry::new();
    kernels.register(32, "always_fail", || Box::new(AlwaysFailKernel));
    kernels.register(33, "noop", || Box::new(NoopKernel));

    let cluster = start(test_config(2, 4), kernels);
    let table = cluster
        .master
        .create_table::<i32, i32>(
            PluginSpec::new(MODULO_I32),
            PluginSpec::new(REPLACE_I32),
            PluginSpec::new(REPLACE_I32),
            None,
        )
        .unwrap();

    let err = cluster
        .master
        .map_shards(table.id(), "always_fail")
        .unwrap_err();
    assert!(matches!(err, ClusterError::KernelFailed { .. }));

    // user errors are not fatal: let stragglers drain, then run again
    std::thread::sleep(Duration::from_millis(200));
    cluster.master.map_shards(table.id(), "noop").unwrap();
    assert_exact_coverage(&cluster.master, 4);

    cluster.stop();
}

#[test]
fn unknown_kernel_poisons_the_master() {
    let mut kernels = KernelRegistry::new();
    kernels.register(33, "noop", || Box::new(NoopKernel));

    let cluster = start(test_config(1, 3), kernels);
    let table = cluster
        .master
        .create_table::<i32, i32>(
            PluginSpec::new(MODULO_I32),
            PluginSpec::new(REPLACE_I32),
            PluginSpec::new(REPLACE_I32),
            None,
        )
        .unwrap();

    let err = cluster
        .master
        .run(RunDescriptor::over_all_shards(999, table.id(), 3))
        .unwrap_err();
    assert!(matches!(
        err,
        ClusterError::Core(tessera::CoreError::UnknownType { .. })
    ));

    // configuration errors are fatal: further runs are refused
    let err = cluster
        .master
        .run(RunDescriptor::over_all_shards(33, table.id(), 3))
        .unwrap_err();
    assert!(matches!(err, ClusterError::Protocol(_)));

    cluster.stop();
}
