//! Replaying the same ordered command stream on every replica yields the
//! same store contents, whatever each node's local clock says.

use meridian_common::config::NodeConfig;
use meridian_common::{Key, MeridianError, Priority, Timestamp, TxnMeta, TxnStatus, Value};
use meridian_test::{init_tracing, TestCluster, Workload, WorkloadConfig};
use meridian_txn::{Command, Request};

const MS: u64 = 1_000_000;

#[test]
fn test_replicas_converge() {
    init_tracing();
    let cluster = TestCluster::with_config(3, &NodeConfig::for_testing(), MS).unwrap();
    // Skew the followers; replicated commands must not care.
    cluster.node(1).manual.increment(40 * MS);
    cluster.node(2).manual.set(0);

    let mut workload = Workload::new(WorkloadConfig {
        seed: 1234,
        ..WorkloadConfig::default()
    });
    let mut applied = 0;
    for (i, command) in workload.take_commands(500).into_iter().enumerate() {
        if i % 25 == 0 {
            cluster.leader().manual.increment(MS);
        }
        match cluster.execute_replicated(Request::new(command)) {
            Ok(_) => applied += 1,
            Err(MeridianError::WriteTooOld { .. }) => {}
            Err(err) => panic!("command {i} failed: {err}"),
        }
    }
    assert!(applied > 400);

    let leader = cluster.leader().snapshot().unwrap();
    assert!(!leader.is_empty());
    for node in &cluster.nodes()[1..] {
        assert_eq!(node.snapshot().unwrap(), leader);
    }
}

fn assert_converged(cluster: &TestCluster) {
    let leader = cluster.leader().snapshot().unwrap();
    for node in &cluster.nodes()[1..] {
        assert_eq!(node.snapshot().unwrap(), leader);
    }
}

#[test]
fn test_intent_resolutions_replay_on_followers() {
    init_tracing();
    let cluster = TestCluster::with_config(3, &NodeConfig::for_testing(), MS).unwrap();
    let leader = cluster.leader();
    let begin = |priority: i32| {
        let meta = TxnMeta::new(
            leader.store.next_txn_id(),
            Priority::new(priority),
            Timestamp::new(MS, 0),
        );
        leader.store.registry().begin(meta, leader.clock.physical_now());
        meta
    };
    let pushed = begin(1);
    let aborted = begin(1);

    cluster
        .execute_replicated(Request::new(Command::put("a", "1")).with_txn(pushed))
        .unwrap();
    cluster
        .execute_replicated(Request::new(Command::put("b", "1")).with_txn(aborted))
        .unwrap();
    assert_converged(&cluster);

    // A high-priority scan pushes the first owner; a high-priority write
    // aborts the second. Only the leader decides either.
    let read_ts = Timestamp::new(MS + 50, 0);
    let rows = cluster
        .execute_replicated(
            Request::new(Command::scan("a", "c", 0))
                .at(read_ts)
                .with_priority(Priority::MAX),
        )
        .unwrap()
        .into_rows()
        .unwrap();
    assert!(rows.is_empty());
    cluster
        .execute_replicated(
            Request::new(Command::put("b", "2"))
                .at(Timestamp::new(MS + 60, 0))
                .with_priority(Priority::MAX),
        )
        .unwrap();
    assert_converged(&cluster);
    for node in cluster.nodes() {
        let replica = node.store.replica_for_key(&Key::from_str("a")).unwrap();
        let intent = replica.versions().intent(&Key::from_str("a")).unwrap();
        assert_eq!(intent.txn.timestamp, read_ts.next());
        assert!(replica.versions().intent(&Key::from_str("b")).is_none());
    }
    assert_eq!(leader.store.registry().status(aborted.id), Some(TxnStatus::Aborted));

    // Commit the pushed owner at its pushed timestamp.
    let committed = leader
        .store
        .registry()
        .get(pushed.id)
        .unwrap()
        .update(|record| {
            record.status = TxnStatus::Committed;
            record.meta
        });
    cluster
        .execute_replicated(Request::new(Command::resolve_intent(
            "a",
            committed,
            TxnStatus::Committed,
        )))
        .unwrap();
    assert_converged(&cluster);

    let at = Timestamp::new(MS + 100, 0);
    for values in [
        cluster.read_all(&Key::from_str("a"), at).unwrap(),
        cluster.read_all(&Key::from_str("b"), at).unwrap(),
    ] {
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.is_some()));
    }
    assert_eq!(
        cluster.read_all(&Key::from_str("a"), read_ts).unwrap(),
        vec![None, None, None]
    );
}

#[test]
fn test_pushed_write_replays_at_pushed_timestamp() {
    let cluster = TestCluster::with_config(2, &NodeConfig::for_testing(), MS).unwrap();
    let read_ts = Timestamp::new(MS + 50, 0);
    cluster
        .execute_replicated(Request::new(Command::get("a")).at(read_ts))
        .unwrap();

    let response = cluster
        .execute_replicated(Request::new(Command::put("a", "v")).at(Timestamp::new(MS, 0)))
        .unwrap();
    assert_eq!(response.timestamp, read_ts.next());

    for node in cluster.nodes() {
        let replica = node.store.replica_for_key(&Key::from_str("a")).unwrap();
        assert_eq!(replica.versions().latest_timestamp(&Key::from_str("a")), Some(read_ts.next()));
    }
}

#[test]
fn test_round_trip() {
    let cluster = TestCluster::new(1).unwrap();
    let node = cluster.leader();
    node.manual.set(10 * MS);
    let db = node.db();

    db.put("a", "v1").unwrap();
    let first = node.store.replica_for_key(&Key::from_str("a")).unwrap();
    let ts1 = first.versions().latest_timestamp(&Key::from_str("a")).unwrap();

    node.manual.increment(MS);
    db.put("a", "v2").unwrap();
    let ts2 = first.versions().latest_timestamp(&Key::from_str("a")).unwrap();
    assert!(ts2 > ts1);

    let key = Key::from_str("a");
    assert_eq!(node.read(&key, ts2).unwrap(), Some(Value::from_str("v2")));
    assert_eq!(node.read(&key, ts1).unwrap(), Some(Value::from_str("v1")));
    assert_eq!(node.read(&key, Timestamp::new(ts1.wall_time - 1, 0)).unwrap(), None);
    assert_eq!(db.get("a").unwrap(), Some(Value::from_str("v2")));
}
