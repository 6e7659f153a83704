//! End-to-end scenarios against a real Redis instance.
//!
//! Skipped (not failed) unless `FLOWLOCK_TEST_REDIS_URL` is set, since CI
//! environments without a Redis instance available shouldn't see red.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use flowlock::error::ErrorKind;
use flowlock::store::Store;
use flowlock::{FlowLockError, ResourceManager};

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_store(name: &str) -> Option<Store> {
    let url = std::env::var("FLOWLOCK_TEST_REDIS_URL").ok()?;
    let client = redis::Client::open(url).expect("valid redis url");
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let prefix = format!("flowlock-test:{name}:{nanos}:{n}:");
    Some(Store::new(client, prefix, false))
}

macro_rules! skip_without_redis {
    ($store:expr) => {
        match $store {
            Some(s) => s,
            None => {
                eprintln!("skipping: FLOWLOCK_TEST_REDIS_URL not set");
                return;
            }
        }
    };
}

#[test]
fn produce_then_consume() {
    let store = skip_without_redis!(test_store("produce_then_consume"));

    let a = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        true,
        store.clone(),
        false,
        "test.a",
        None,
    );
    a.start(false).expect("A should acquire output x");
    a.stop(false);

    let b = ResourceManager::new(vec!["x"], vec!["y"], 60, 0, true, store, false, "test.b", None);
    b.start(false).expect("B should acquire input x and output y");
    b.stop(false);
}

#[test]
fn missing_input_fails() {
    let store = skip_without_redis!(test_store("missing_input_fails"));

    let b = ResourceManager::new(vec!["x"], vec!["y"], 60, 0, true, store, false, "test.b", None);
    let err = b.start(false).expect_err("x was never produced");
    match err {
        FlowLockError::ResourceUnavailable(map) => {
            assert!(map.contains_key(&ErrorKind::InputMissing));
            assert_eq!(map[&ErrorKind::InputMissing], vec!["x".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn overwrite_false_collision_then_overwrite_true_succeeds() {
    let store = skip_without_redis!(test_store("overwrite_collision"));

    let a = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        true,
        store.clone(),
        false,
        "test.a",
        None,
    );
    a.start(false).unwrap();
    a.stop(false);

    let a_prime = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        false,
        store.clone(),
        false,
        "test.a-prime",
        None,
    );
    let err = a_prime.start(false).expect_err("x already produced, overwrite=false");
    match err {
        FlowLockError::ResourceUnavailable(map) => {
            assert!(map.contains_key(&ErrorKind::OutputExists));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let a_retry = ResourceManager::new(Vec::<String>::new(), vec!["x"], 60, 0, true, store, false, "test.a-retry", None);
    a_retry.start(false).expect("overwrite=true should succeed");
    a_retry.stop(false);
}

#[test]
fn reader_blocks_writer() {
    let store = skip_without_redis!(test_store("reader_blocks_writer"));

    let producer = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        true,
        store.clone(),
        false,
        "test.producer",
        None,
    );
    producer.start(false).unwrap();
    producer.stop(false);

    let p1 = ResourceManager::new(vec!["x"], Vec::<String>::new(), 30, 0, true, store.clone(), false, "test.p1", None);
    p1.start(false).expect("p1 should acquire read lease on x");

    let p2 = ResourceManager::new(Vec::<String>::new(), vec!["x"], 10, 0, true, store, false, "test.p2", None);
    let err = p2.start(false).expect_err("x is read-locked by p1");
    match err {
        FlowLockError::ResourceUnavailable(map) => {
            assert!(map.contains_key(&ErrorKind::OutputUsed));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    p1.stop(false);
}

#[test]
fn expiry_reclaim_without_stop() {
    let store = skip_without_redis!(test_store("expiry_reclaim"));

    let producer = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        true,
        store.clone(),
        false,
        "test.producer",
        None,
    );
    producer.start(false).unwrap();
    producer.stop(false);

    let p1 = ResourceManager::new(vec!["x"], Vec::<String>::new(), 2, 0, true, store.clone(), false, "test.p1", None);
    p1.start(false).expect("p1 should acquire short-lived read lease");
    // p1 is deliberately never stopped; its lease must expire in Redis.

    std::thread::sleep(std::time::Duration::from_secs(3));

    let competing = ResourceManager::new(
        Vec::<String>::new(),
        vec!["x"],
        60,
        0,
        true,
        store,
        false,
        "test.competing",
        None,
    );
    competing
        .start(false)
        .expect("expired read lease should no longer block a writer");
    competing.stop(false);
}

#[test]
fn wait_zero_performs_immediate_and_final_attempt_only() {
    let store = skip_without_redis!(test_store("wait_zero"));

    let holder = ResourceManager::new(
        Vec::<String>::new(),
        vec!["z"],
        60,
        0,
        true,
        store.clone(),
        false,
        "test.holder",
        None,
    );
    holder.start(false).unwrap();

    let contender = ResourceManager::new(Vec::<String>::new(), vec!["z"], 60, 0, true, store, false, "test.contender", None);
    let before = std::time::Instant::now();
    let err = contender.start(false).expect_err("z is olock'd by holder");
    assert!(before.elapsed() < std::time::Duration::from_secs(1));
    match err {
        FlowLockError::ResourceUnavailable(map) => {
            assert!(map.contains_key(&ErrorKind::OutputLocked));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    holder.stop(false);
}
