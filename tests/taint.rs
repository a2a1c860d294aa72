//! Drives the worker RPC surface directly (playing the master by hand) to
//! exercise ownership hand-off: the new owner must gate reads until the
//! former owner's delta stream lands.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{plugin_registry, test_config, MODULO_I32, REPLACE_I32};
use tessera::{
    codec, KernelRegistry, Mesh, NodeId, PluginSpec, Request, Response, Transport, Worker,
};
use tessera_cluster::proto::{
    CreateTableReq, HashGet, KvData, PartitionInfo, ShardAssignment, TableData,
};

#[test]
fn reads_block_until_the_ownership_handoff_completes() {
    let mesh = Mesh::new();
    let (master, master_inbox) = mesh.join(NodeId::MASTER);

    // stand-in master: ack registrations, pings, and completions
    std::thread::spawn(move || {
        while let Ok(env) = master_inbox.recv() {
            env.respond(Response::Ack);
        }
    });

    let plugins = Arc::new(plugin_registry());
    let kernels = Arc::new(KernelRegistry::new());
    let config = test_config(2, 1);
    let a = NodeId::worker(0);
    let b = NodeId::worker(1);
    let handles: Vec<_> = [a, b]
        .into_iter()
        .map(|id| {
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

    let create = CreateTableReq {
        id: 0,
        table_type_id: 0,
        num_shards: 1,
        sharder: PluginSpec::new(MODULO_I32),
        combiner: PluginSpec::new(REPLACE_I32),
        reducer: PluginSpec::new(REPLACE_I32),
        selector: PluginSpec::absent(),
    };
    for worker in [a, b] {
        master
            .call(worker, Request::CreateTable(create.clone()))
            .unwrap()
            .wait_ack()
            .unwrap();
    }

    // shard 0 starts out on worker A
    let owned_by = |owner: NodeId, epoch: u64, tainted: bool| ShardAssignment {
        table: 0,
        epoch,
        partitions: vec![PartitionInfo {
            shard: 0,
            owner: Some(owner),
            entries: 0,
            dirty: false,
            tainted,
        }],
    };
    for worker in [a, b] {
        master
            .call(worker, Request::Assign(owned_by(a, 1, false)))
            .unwrap()
            .wait_ack()
            .unwrap();
    }

    // seed a value on A
    let key = codec::encode(&5i32).unwrap();
    master
        .call(
            a,
            Request::Put(TableData {
                table: 0,
                shard: 0,
                source: NodeId::MASTER,
                epoch: 1,
                kv_data: vec![KvData {
                    key: key.clone(),
                    value: codec::encode(&55i32).unwrap(),
                }],
                done: true,
            }),
        )
        .unwrap()
        .wait_ack()
        .unwrap();

    // hand the shard to B; B must treat it as tainted until A's delta lands
    for worker in [a, b] {
        master
            .call(worker, Request::Assign(owned_by(b, 2, true)))
            .unwrap()
            .wait_ack()
            .unwrap();
    }

    let reader = {
        let master = master.clone();
        let key = key.clone();
        std::thread::spawn(move || {
            let handle = master
                .call(
                    b,
                    Request::Get(HashGet {
                        table: 0,
                        shard: 0,
                        key,
                    }),
                )
                .unwrap();
            match handle.wait().unwrap() {
                Response::Get(resp) => resp,
                other => panic!("unexpected reply {other:?}"),
            }
        })
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(
        !reader.is_finished(),
        "read must block while the shard is tainted"
    );

    // flushing A streams the demoted shard to B with done=true
    master.call(a, Request::Flush).unwrap().wait_ack().unwrap();

    let resp = reader.join().unwrap();
    assert_eq!(resp.value, Some(codec::encode(&55i32).unwrap()));
    assert!(!resp.missing_key);

    for worker in [a, b] {
        let _ = master.call(worker, Request::Shutdown).map(|h| h.wait_ack());
    }
    for handle in handles {
        handle.join();
    }
}
