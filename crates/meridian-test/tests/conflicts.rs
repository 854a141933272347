//! Conflicts between transactions: priorities, waiting, cancellation and
//! the read/write ordering guarantee.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use meridian_common::config::NodeConfig;
use meridian_common::{Key, MeridianError, Priority, Timestamp, TxnMeta, TxnStatus, Value};
use meridian_test::{init_tracing, TestNode};
use meridian_txn::{CancelToken, Command, Request, TxnOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn node() -> TestNode {
    init_tracing();
    TestNode::new(NodeConfig::for_testing(), 1_000).unwrap()
}

fn begin(node: &TestNode, priority: i32, wall: u64) -> TxnMeta {
    let meta = TxnMeta::new(
        node.store.next_txn_id(),
        Priority::new(priority),
        Timestamp::new(wall, 0),
    );
    node.store.registry().begin(meta, node.clock.physical_now());
    meta
}

fn put(node: &TestNode, key: &str, value: &str, txn: TxnMeta) -> Result<(), MeridianError> {
    node.store
        .execute(Request::new(Command::put(key, value)).with_txn(txn))
        .map(|_| ())
}

fn intent_owner(node: &TestNode, key: &str) -> Option<TxnMeta> {
    node.store
        .replica_for_key(&Key::from_str(key))
        .unwrap()
        .versions()
        .intent(&Key::from_str(key))
        .map(|intent| intent.txn)
}

#[test]
fn test_higher_priority_writer_arriving_second_aborts_owner() {
    let node = node();
    let low = begin(&node, 1, 10);
    let high = begin(&node, 100, 20);

    put(&node, "k", "low", low).unwrap();
    put(&node, "k", "high", high).unwrap();

    assert_eq!(node.store.registry().status(low.id), Some(TxnStatus::Aborted));
    assert_eq!(node.store.registry().status(high.id), Some(TxnStatus::Pending));
    assert_eq!(intent_owner(&node, "k").map(|t| t.id), Some(high.id));
    assert_eq!(node.store.resolver().stats().aborts.load(Ordering::Relaxed), 1);
}

#[test]
fn test_lower_priority_writer_arriving_second_waits() {
    let node = node();
    let high = begin(&node, 100, 10);
    let low = begin(&node, 1, 20);
    put(&node, "k", "high", high).unwrap();

    let err = node
        .store
        .execute(
            Request::new(Command::put("k", "low"))
                .with_txn(low)
                .with_deadline(Instant::now() + Duration::from_millis(30)),
        )
        .unwrap_err();

    assert!(matches!(err, MeridianError::Timeout { .. }));
    assert_eq!(node.store.registry().status(high.id), Some(TxnStatus::Pending));
    assert_eq!(intent_owner(&node, "k").map(|t| t.id), Some(high.id));
}

#[test]
fn test_equal_priority_goes_to_lower_id() {
    let node = node();
    let first = begin(&node, 5, 10);
    let second = begin(&node, 5, 20);
    assert!(first.id < second.id);

    put(&node, "k", "second", second).unwrap();
    put(&node, "k", "first", first).unwrap();
    assert_eq!(node.store.registry().status(second.id), Some(TxnStatus::Aborted));
    assert_eq!(intent_owner(&node, "k").map(|t| t.id), Some(first.id));
}

#[test]
fn test_waiter_proceeds_once_owner_commits() {
    let node = Arc::new(node());
    let high = begin(&node, 100, 10);
    let low = begin(&node, 1, 20);
    put(&node, "k", "high", high).unwrap();

    let waiter = {
        let node = Arc::clone(&node);
        thread::spawn(move || {
            node.store.execute(
                Request::new(Command::put("k", "low"))
                    .with_txn(low)
                    .with_deadline(Instant::now() + Duration::from_secs(10)),
            )
        })
    };

    thread::sleep(Duration::from_millis(20));
    let entry = node.store.registry().get(high.id).unwrap();
    entry.update(|record| record.status = TxnStatus::Committed);

    let response = waiter.join().unwrap().unwrap();
    assert_eq!(response.timestamp, Timestamp::new(20, 0));
    assert_eq!(intent_owner(&node, "k").map(|t| t.id), Some(low.id));
    assert!(node.store.resolver().stats().waits.load(Ordering::Relaxed) >= 1);

    // The high-priority value was committed underneath the new intent.
    let value = node.read(&Key::from_str("k"), Timestamp::new(15, 0)).unwrap();
    assert_eq!(value, Some(Value::from_str("high")));
}

#[test]
fn test_cancel_while_waiting_leaves_state() {
    let node = Arc::new(node());
    let holder = begin(&node, i32::MAX - 1, 10);
    put(&node, "k", "held", holder).unwrap();
    let cancel = CancelToken::new();

    let waiter = {
        let node = Arc::clone(&node);
        let cancel = cancel.clone();
        thread::spawn(move || {
            node.db().txn_with(
                &TxnOptions::default()
                    .with_priority(Priority::new(1))
                    .with_cancel(cancel),
                |txn| txn.put("k", "mine"),
            )
        })
    };

    thread::sleep(Duration::from_millis(20));
    cancel.cancel();
    let err = waiter.join().unwrap().unwrap_err();

    assert!(matches!(err, MeridianError::Cancelled));
    assert_eq!(intent_owner(&node, "k").map(|t| t.id), Some(holder.id));
    assert_eq!(node.store.registry().status(holder.id), Some(TxnStatus::Pending));
}

#[test]
fn test_scan_pushes_every_conflicting_owner() {
    let node = node();
    node.store
        .execute(Request::new(Command::put("k0", "committed")).at(Timestamp::new(5, 0)))
        .unwrap();
    let first = begin(&node, 1, 10);
    let second = begin(&node, 2, 20);
    put(&node, "k1", "first", first).unwrap();
    put(&node, "k2", "second", second).unwrap();

    let read_ts = Timestamp::new(50, 0);
    let rows = node
        .store
        .execute(
            Request::new(Command::scan("k0", "k9", 0))
                .at(read_ts)
                .with_priority(Priority::MAX),
        )
        .unwrap()
        .into_rows()
        .unwrap();
    assert_eq!(rows, vec![(Key::from_str("k0"), Value::from_str("committed"))]);

    for (owner, key) in [(first, "k1"), (second, "k2")] {
        let record = node.store.registry().get(owner.id).unwrap().read();
        assert_eq!(record.status, TxnStatus::Pending);
        assert!(record.meta.timestamp > read_ts);
        assert_eq!(intent_owner(&node, key).map(|t| t.timestamp), Some(read_ts.next()));
    }
    assert_eq!(node.store.resolver().stats().pushes.load(Ordering::Relaxed), 2);
}

#[test]
fn test_lower_priority_scan_times_out() {
    let node = node();
    let low = begin(&node, 1, 10);
    let high = begin(&node, 100, 10);
    put(&node, "k1", "low", low).unwrap();
    put(&node, "k2", "high", high).unwrap();

    let err = node
        .store
        .execute(
            Request::new(Command::scan("k0", "k9", 0))
                .at(Timestamp::new(50, 0))
                .with_priority(Priority::new(5))
                .with_deadline(Instant::now() + Duration::from_millis(30)),
        )
        .unwrap_err();

    assert!(matches!(err, MeridianError::Timeout { .. }));
    assert_eq!(node.store.registry().get(high.id).unwrap().read().meta.timestamp, Timestamp::new(10, 0));
    // Neither intent moved, including the one whose owner was outranked.
    assert_eq!(intent_owner(&node, "k1").map(|t| t.timestamp), Some(Timestamp::new(10, 0)));
    assert_eq!(intent_owner(&node, "k2").map(|t| t.timestamp), Some(Timestamp::new(10, 0)));
}

#[test]
fn test_reads_are_never_invalidated() {
    let node = node();
    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<Key> = (0..4).map(|i| Key::from(format!("k{i}"))).collect();

    // Every served read, with the value it returned.
    let mut reads: Vec<(Key, Timestamp, Option<Value>)> = Vec::new();
    for step in 0..200u64 {
        let key = keys[rng.gen_range(0..keys.len())].clone();
        if rng.gen_bool(0.5) {
            let ts = Timestamp::new(1_000 + rng.gen_range(0..50), 0);
            let value = node
                .store
                .execute(Request::new(Command::get(key.clone())).at(ts))
                .unwrap()
                .into_value()
                .unwrap();
            reads.push((key, ts, value));
        } else {
            // Writes ask for stale timestamps; the cache must push them.
            let ts = Timestamp::new(1_000 + rng.gen_range(0..50), 0);
            let value = Value::from(format!("v{step}").into_bytes());
            let request = Request::new(Command::put(key.clone(), value)).at(ts);
            match node.store.execute(request) {
                Ok(_) | Err(MeridianError::WriteTooOld { .. }) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
    }

    for (key, ts, value) in reads {
        assert_eq!(node.read(&key, ts).unwrap(), value, "read of {key} at {ts} changed");
    }
}

#[test]
fn test_transaction_reads_its_own_writes_only() {
    let node = node();
    let db = node.db();
    db.put("a", "before").unwrap();

    db.txn(|txn| {
        txn.put("a", "inside")?;
        assert_eq!(txn.get("a")?, Some(Value::from_str("inside")));
        // Outside the transaction the intent is not readable without
        // resolving it first; a low-priority read waits, so give up fast.
        let outside = node.store.execute(
            Request::new(Command::get("a"))
                .with_priority(Priority::MIN)
                .with_deadline(Instant::now() + Duration::from_millis(10)),
        );
        assert!(matches!(outside, Err(MeridianError::Timeout { .. })));
        Ok(())
    })
    .unwrap();

    assert_eq!(db.get("a").unwrap(), Some(Value::from_str("inside")));
}
