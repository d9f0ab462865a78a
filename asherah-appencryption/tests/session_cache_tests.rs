mod support;

use asherah_appencryption::{AsherahError, CryptoPolicy, SessionFactory};
use pretty_assertions::assert_eq;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use support::{factory_with, ik_id, manual_clock, CountingMetastore};

fn bounded(max_size: usize, idle_secs: i64) -> CryptoPolicy {
    CryptoPolicy {
        session_cache_max_size: max_size,
        session_cache_duration_secs: idle_secs,
        ..CryptoPolicy::default()
    }
}

#[test]
fn least_recently_used_session_is_evicted() {
    let metastore = CountingMetastore::new();
    let factory = factory_with(bounded(2, 3600), metastore.clone(), manual_clock());

    let p1 = factory.session("p1").unwrap();
    let p2 = factory.session("p2").unwrap();
    assert!(p2.cached_key_count() > 0);

    // p1 becomes the most recent, so p3 pushes out p2.
    assert!(Arc::ptr_eq(&p1, &factory.session("p1").unwrap()));
    factory.session("p3").unwrap();

    assert_eq!(factory.cached_session_count(), 2);
    assert_eq!(p2.cached_key_count(), 0);
    assert!(p1.cached_key_count() > 0);

    factory.session("p1").unwrap();
    assert_eq!(metastore.load_latest_calls(&ik_id("p1")), 1);

    let again = factory.session("p2").unwrap();
    assert!(!Arc::ptr_eq(&p2, &again));
    assert_eq!(metastore.load_latest_calls(&ik_id("p2")), 2);
}

#[test]
fn evicted_session_remains_usable() {
    let factory = factory_with(bounded(1, 3600), CountingMetastore::new(), manual_clock());

    let held = factory.session("p1").unwrap();
    let record = held.encrypt(b"still works").unwrap();
    factory.session("p2").unwrap();

    assert_eq!(held.cached_key_count(), 0);
    assert_eq!(held.decrypt(&record).unwrap(), b"still works");
}

#[test]
fn idle_sessions_expire() {
    let metastore = CountingMetastore::new();
    let clock = manual_clock();
    let factory = factory_with(bounded(100, 60), metastore.clone(), clock.clone());

    let p1 = factory.session("p1").unwrap();
    clock.advance(30);
    factory.session("p1").unwrap();
    clock.advance(40);
    factory.session("p2").unwrap();

    // p1 was touched 40s ago, inside the window.
    assert_eq!(factory.cached_session_count(), 2);
    assert!(p1.cached_key_count() > 0);

    clock.advance(60);
    factory.session("p3").unwrap();
    assert_eq!(factory.cached_session_count(), 1);
    assert_eq!(p1.cached_key_count(), 0);

    factory.session("p1").unwrap();
    assert_eq!(metastore.load_latest_calls(&ik_id("p1")), 2);
}

#[test]
fn concurrent_callers_share_one_derivation() {
    let metastore = CountingMetastore::new();
    metastore.set_delay(Duration::from_millis(50));
    let factory = Arc::new(factory_with(
        CryptoPolicy::default(),
        metastore.clone(),
        manual_clock(),
    ));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let factory = Arc::clone(&factory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                factory.session("p1").unwrap()
            })
        })
        .collect();
    let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for session in &sessions[1..] {
        assert!(Arc::ptr_eq(&sessions[0], session));
    }
    assert_eq!(metastore.load_latest_calls(&ik_id("p1")), 1);
    assert_eq!(factory.cached_session_count(), 1);
}

#[test]
fn partitions_derive_independently() {
    let metastore = CountingMetastore::new();
    let factory = Arc::new(factory_with(
        CryptoPolicy::default(),
        metastore.clone(),
        manual_clock(),
    ));
    // Create the SK up front so partitions only race on their own IKs.
    factory.session("warmup").unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let factory = Arc::clone(&factory);
            thread::spawn(move || {
                let partition = format!("p{i}");
                let session = factory.session(&partition).unwrap();
                let record = session.encrypt(partition.as_bytes()).unwrap();
                assert_eq!(session.decrypt(&record).unwrap(), partition.as_bytes());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for i in 0..6 {
        assert_eq!(metastore.successful_stores(&ik_id(&format!("p{i}"))), 1);
    }
    assert_eq!(factory.cached_session_count(), 7);
}

#[test]
fn eviction_does_not_wait_for_another_partitions_derivation() {
    let metastore = CountingMetastore::new();
    let factory = Arc::new(factory_with(bounded(1, 3600), metastore.clone(), manual_clock()));
    factory.session("warmup").unwrap();
    metastore.slow_down(&ik_id("slow"), Duration::from_millis(600));

    let slow = {
        let factory = Arc::clone(&factory);
        thread::spawn(move || factory.session("slow").unwrap())
    };
    thread::sleep(Duration::from_millis(100));

    // Inserting "fast" evicts "slow" while it is still deriving.
    let started = Instant::now();
    let fast = factory.session("fast").unwrap();
    assert!(started.elapsed() < Duration::from_millis(300));
    assert!(fast.cached_key_count() > 0);

    // The orphaned derivation finishes usable but wiped.
    let slow = slow.join().unwrap();
    assert_eq!(slow.cached_key_count(), 0);
    let record = slow.encrypt(b"still works").unwrap();
    assert_eq!(slow.decrypt(&record).unwrap(), b"still works");
    assert_eq!(factory.cached_session_count(), 1);
}

#[test]
fn decrypt_sessions_share_the_cache_without_creating_keys() {
    let metastore = CountingMetastore::new();
    let factory = factory_with(CryptoPolicy::default(), metastore.clone(), manual_clock());
    let record = factory.session("p1").unwrap().encrypt(b"cached").unwrap();
    factory.close();

    let reader = factory.decrypt_session("p1").unwrap();
    assert_eq!(reader.decrypt(&record).unwrap(), b"cached");
    assert!(Arc::ptr_eq(&reader, &factory.session("p1").unwrap()));
    assert_eq!(factory.cached_session_count(), 1);
    assert_eq!(metastore.successful_stores(&ik_id("p1")), 1);
    assert!(matches!(
        factory.decrypt_session(""),
        Err(AsherahError::InvalidArgument(_))
    ));
}

#[test]
fn failed_derivation_reaches_every_waiter_then_recovers() {
    let metastore = CountingMetastore::new();
    metastore.set_delay(Duration::from_millis(50));
    metastore.set_failing(true);
    let factory = Arc::new(factory_with(
        CryptoPolicy::default(),
        metastore.clone(),
        manual_clock(),
    ));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let factory = Arc::clone(&factory);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                factory.session("p1")
            })
        })
        .collect();
    for handle in handles {
        match handle.join().unwrap() {
            Err(AsherahError::MetastoreUnavailable(msg)) => assert!(msg.contains("injected")),
            other => panic!("expected MetastoreUnavailable, got {other:?}"),
        }
    }
    assert_eq!(factory.cached_session_count(), 0);

    metastore.set_delay(Duration::ZERO);
    metastore.set_failing(false);
    let session = factory.session("p1").unwrap();
    let record = session.encrypt(b"recovered").unwrap();
    assert_eq!(session.decrypt(&record).unwrap(), b"recovered");
    assert_eq!(factory.cached_session_count(), 1);
}

#[test]
fn disabled_session_cache_derives_every_time() {
    let metastore = CountingMetastore::new();
    let policy = CryptoPolicy {
        cache_sessions: false,
        ..CryptoPolicy::default()
    };
    let factory = factory_with(policy, metastore.clone(), manual_clock());

    let first = factory.session("p1").unwrap();
    let second = factory.session("p1").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.cached_session_count(), 0);
    assert_eq!(metastore.load_latest_calls(&ik_id("p1")), 2);

    let record = first.encrypt(b"uncached").unwrap();
    assert_eq!(second.decrypt(&record).unwrap(), b"uncached");
}

#[test]
fn empty_partition_is_rejected() {
    let factory = factory_with(
        CryptoPolicy::default(),
        CountingMetastore::new(),
        manual_clock(),
    );
    assert!(matches!(
        factory.session(""),
        Err(AsherahError::InvalidArgument(_))
    ));
}

#[test]
fn close_wipes_sessions_and_system_keys() {
    let factory: SessionFactory =
        factory_with(CryptoPolicy::default(), CountingMetastore::new(), manual_clock());
    let held = factory.session("p1").unwrap();
    let record = held.encrypt(b"before close").unwrap();
    assert_eq!(factory.cached_system_key_count(), 1);

    factory.close();
    assert_eq!(factory.cached_session_count(), 0);
    assert_eq!(factory.cached_system_key_count(), 0);
    assert_eq!(held.cached_key_count(), 0);

    // Keys reload from the metastore on demand.
    assert_eq!(held.decrypt(&record).unwrap(), b"before close");
}
