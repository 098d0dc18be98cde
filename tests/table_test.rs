use petek::{BlockPool, Config, Error, Heap, Petek, WorkerState};

#[test]
fn test_round_trip_integration() {
    let table: Petek<i32, i32> = Petek::new(128);
    let mut worker = table.worker().unwrap();

    for i in 0..100 {
        assert!(table.put(&mut worker, i, i).unwrap());
    }
    for i in (0..100).rev() {
        assert_eq!(table.get(&mut worker, &i), Some(i));
    }

    for i in 0..100 {
        assert_eq!(table.update(&mut worker, &i, |x| x * x), Some(i));
    }
    for i in (0..100).rev() {
        assert_eq!(table.get(&mut worker, &i), Some(i * i));
    }

    for i in 0..100 {
        assert!(table.erase(&mut worker, &i));
    }
    for i in 0..100 {
        assert_eq!(table.get(&mut worker, &i), None);
    }
}

#[test]
fn test_put_overwrites_in_place() {
    let table: Petek<i32, i32> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    assert!(table.put(&mut worker, 1, 2).unwrap());
    assert!(!table.put(&mut worker, 1, 5).unwrap());
    assert_eq!(table.get(&mut worker, &1), Some(5));
}

#[test]
fn test_put_twice_is_idempotent() {
    let table: Petek<u64, u64> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    assert!(table.put(&mut worker, 7, 9).unwrap());
    assert!(!table.put(&mut worker, 7, 9).unwrap());
    assert_eq!(table.get(&mut worker, &7), Some(9));
    assert!(table.erase(&mut worker, &7));
    assert_eq!(table.get(&mut worker, &7), None);
}

#[test]
fn test_update_missing_key() {
    let table: Petek<u64, u64> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    assert_eq!(table.update(&mut worker, &3, |x| x + 1), None);
    assert_eq!(table.get(&mut worker, &3), None);
}

#[test]
fn test_erase_missing_key() {
    let table: Petek<u64, u64> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    assert!(!table.erase(&mut worker, &11));
    table.put(&mut worker, 11, 1).unwrap();
    assert!(table.erase(&mut worker, &11));
    assert!(!table.erase(&mut worker, &11));
}

#[test]
fn test_update_strict_applies_cas() {
    let table: Petek<u64, u64> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    assert_eq!(table.update_strict(&mut worker, &1, |x| x + 1), None);
    table.put(&mut worker, 1, 10).unwrap();
    assert_eq!(table.update_strict(&mut worker, &1, |x| x * 3), Some(10));
    assert_eq!(table.get(&mut worker, &1), Some(30));
}

#[test]
fn test_many_keys_in_few_buckets() {
    // Long chains force real ordered-insert traffic in every bucket.
    let table: Petek<u64, u64> = Petek::new(8);
    let mut worker = table.worker().unwrap();

    for i in 0..1000u64 {
        assert!(table.put(&mut worker, i * 7919 % 10007, i).unwrap());
    }
    for i in (0..1000u64).rev() {
        assert_eq!(table.get(&mut worker, &(i * 7919 % 10007)), Some(i));
    }
}

#[test]
fn test_register_worker_caps_slots() {
    let table: Petek<u64, u64> = Petek::with_config(
        4,
        Config {
            max_workers: 2,
            minor_ticks_per_major: 10,
        },
    );
    let _first = table.worker().unwrap();
    let _second = table.worker().unwrap();
    assert_eq!(
        table.worker().err(),
        Some(Error::WorkersExhausted { max_workers: 2 })
    );
}

#[test]
fn test_explicit_registration_path() {
    let table: Petek<u64, u64> = Petek::new(16);
    let pool = BlockPool::new(Heap, Petek::<u64, u64>::entry_layout());
    let mut state = WorkerState::new(pool);
    table.register_worker(&mut state).unwrap();

    assert!(table.put(&mut state, 5, 50).unwrap());
    assert_eq!(table.get(&mut state, &5), Some(50));
    assert!(state.pool().stats().upstream_blocks >= 1);
}

#[test]
fn test_erased_blocks_are_recycled() {
    // With a single worker and a cadence of one, every mutating operation
    // announces and releases, so an erased entry's block is back in the
    // pool before the next put.
    let table: Petek<u64, u64> = Petek::with_config(
        4,
        Config {
            max_workers: 4,
            minor_ticks_per_major: 1,
        },
    );
    let mut worker = table.worker().unwrap();

    table.put(&mut worker, 1, 10).unwrap();
    assert!(table.erase(&mut worker, &1));
    assert_eq!(worker.pending(), 0);

    table.put(&mut worker, 2, 20).unwrap();
    let stats = worker.pool().stats();
    assert_eq!(stats.upstream_blocks, 1);
    assert_eq!(stats.reused_blocks, 1);
    assert_eq!(table.get(&mut worker, &2), Some(20));
}

#[test]
fn test_string_keys() {
    let table: Petek<String, u64> = Petek::new(32);
    let mut worker = table.worker().unwrap();

    for word in ["bal", "kovan", "petek", "ari"] {
        assert!(table.put(&mut worker, word.to_string(), word.len() as u64).unwrap());
    }
    assert_eq!(table.get(&mut worker, &"petek".to_string()), Some(5));
    assert!(table.erase(&mut worker, &"bal".to_string()));
    assert_eq!(table.get(&mut worker, &"bal".to_string()), None);
}

#[test]
fn test_single_bucket_table() {
    let table: Petek<u64, u64> = Petek::new(1);
    let mut worker = table.worker().unwrap();

    for i in 0..64u64 {
        table.put(&mut worker, i, i + 1).unwrap();
    }
    for i in 0..64u64 {
        assert_eq!(table.get(&mut worker, &i), Some(i + 1));
    }
}
