mod common;

use common::{start, test_config, MODULO_STR, REPLACE_STR, SUM_I64};
use tessera::{Kernel, KernelRegistry, KernelScope, PluginSpec};

struct TallyKernel;

impl Kernel for TallyKernel {
    fn run(&self, scope: &KernelScope<'_>) -> tessera::Result<()> {
        let table = scope.table::<String, i64>();
        table.update(&"total".to_string(), &1)
    }
}

#[test]
fn cross_worker_updates_sum_after_flush() {
    let cluster = start(test_config(2, 5), Default::default());
    let table = cluster
        .master
        .create_table::<String, i64>(
            PluginSpec::new(MODULO_STR),
            PluginSpec::new(SUM_I64),
            PluginSpec::new(SUM_I64),
            None,
        )
        .unwrap();

    for _ in 0..100 {
        table.update(&"x".to_string(), &3).unwrap();
    }
    cluster.master.flush().unwrap();
    assert_eq!(table.get(&"x".to_string()).unwrap(), 300);

    cluster.stop();
}

#[test]
fn kernels_accumulate_into_one_key() {
    let mut kernels = KernelRegistry::new();
    kernels.register(10, "tally", || Box::new(TallyKernel));

    let cluster = start(test_config(2, 5), kernels);
    let table = cluster
        .master
        .create_table::<String, i64>(
            PluginSpec::new(MODULO_STR),
            PluginSpec::new(SUM_I64),
            PluginSpec::new(SUM_I64),
            None,
        )
        .unwrap();

    cluster.master.map_shards(table.id(), "tally").unwrap();
    cluster.master.flush().unwrap();

    // one update per shard, merged by the Sum accumulator
    assert_eq!(table.get(&"total".to_string()).unwrap(), 5);

    cluster.stop();
}

#[test]
fn flush_makes_every_put_visible() {
    let cluster = start(test_config(3, 7), Default::default());
    let table = cluster
        .master
        .create_table::<String, String>(
            PluginSpec::new(MODULO_STR),
            PluginSpec::new(REPLACE_STR),
            PluginSpec::new(REPLACE_STR),
            None,
        )
        .unwrap();

    let mut written = Vec::new();
    for i in 0..200 {
        let key = format!("key-{i}-{}", fastrand::u32(..));
        let value = format!("value-{}", fastrand::u64(..));
        table.put(&key, &value).unwrap();
        written.push((key, value));
    }
    cluster.master.flush().unwrap();

    for (key, value) in &written {
        assert_eq!(&table.get(key).unwrap(), value);
    }

    cluster.stop();
}

#[test]
fn accumulation_is_order_independent() {
    let cluster = start(test_config(2, 5), Default::default());
    let table = cluster
        .master
        .create_table::<String, i64>(
            PluginSpec::new(MODULO_STR),
            PluginSpec::new(SUM_I64),
            PluginSpec::new(SUM_I64),
            None,
        )
        .unwrap();

    let mut updates: Vec<i64> = (0..50).map(|_| fastrand::i64(-100..100)).collect();
    let expected: i64 = updates.iter().sum();
    fastrand::shuffle(&mut updates);

    for (i, u) in updates.iter().enumerate() {
        table.update(&"acc".to_string(), u).unwrap();
        if i % 7 == 0 {
            // interleave partial flushes: batch arrival order must not matter
            cluster.master.flush().unwrap();
        }
    }
    cluster.master.flush().unwrap();
    assert_eq!(table.get(&"acc".to_string()).unwrap(), expected);

    cluster.stop();
}
