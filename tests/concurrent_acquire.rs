//! # Concurrent Acquire Tests
//!
//! The manager claims to be thread-safe for every operation. These tests
//! hammer the acquire path from many threads and check the things that can
//! only go wrong under contention:
//!
//! - One address per chunk, no matter how many threads race the first touch
//! - Reservation counts that balance once every thread is done
//! - Growth races between peer managers resolving to a single resize
//! - Writes through one thread's store visible to every other store of the
//!   same chunk

use std::sync::{Arc, Barrier};
use std::thread;

use chunkfile::MappedFile;
use tempfile::tempdir;

const CHUNK: u64 = 64 * 1024;
const OVERLAP: u64 = 4 * 1024;
const THREADS: usize = 8;

#[test]
fn racing_threads_get_one_address_per_chunk() {
    let dir = tempdir().unwrap();
    let mf = MappedFile::open_with_overlap(dir.path().join("race.dat"), CHUNK, OVERLAP).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let mf = Arc::clone(&mf);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let store = mf.acquire_byte_store(CHUNK + 123).unwrap();
                store.address().unwrap() as usize
            })
        })
        .collect();

    let addresses: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(addresses.windows(2).all(|w| w[0] == w[1]));

    // Every thread's guard dropped; only the cache reservation remains.
    let store = mf.acquire_byte_store(CHUNK).unwrap();
    assert_eq!(store.ref_count(), 2);
}

#[test]
fn acquire_release_storm_balances_counts() {
    let dir = tempdir().unwrap();
    let mf = MappedFile::open_with_overlap(dir.path().join("storm.dat"), CHUNK, OVERLAP).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let mf = Arc::clone(&mf);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..500u64 {
                    let position = ((t as u64 + i) % 4) * CHUNK + i;
                    let store = mf.acquire_byte_store(position).unwrap();
                    assert!(store.ref_count() >= 2);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // Four chunks were touched; each settles at exactly the cache
    // reservation.
    assert_eq!(mf.reference_counts(), "refCount: 1, 1, 1, 1, 1");
}

#[test]
fn writers_in_different_threads_share_the_mapping() {
    let dir = tempdir().unwrap();
    let mf = MappedFile::open_with_overlap(dir.path().join("share.dat"), CHUNK, OVERLAP).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let mf = Arc::clone(&mf);
            thread::spawn(move || {
                let store = mf.acquire_byte_store(0).unwrap();
                let offset = t as u64 * 64;
                store.write_at(offset, &[t as u8; 64]).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let store = mf.acquire_byte_store(0).unwrap();
    for t in 0..THREADS {
        let mut buf = [0u8; 64];
        store.read_at(t as u64 * 64, &mut buf).unwrap();
        assert_eq!(buf, [t as u8; 64]);
    }
}

#[test]
fn peer_managers_race_growth_to_one_resize() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("peer_race.dat");

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let path = path.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // Each thread plays a separate process: its own manager,
                // its own file description, its own advisory lock.
                let mf = MappedFile::open_with_overlap(&path, CHUNK, OVERLAP).unwrap();
                barrier.wait();
                let store = mf.acquire_byte_store(2 * CHUNK).unwrap();
                assert_eq!(store.start(), 2 * CHUNK);
                let size = mf.actual_size().unwrap();
                drop(store);
                mf.close();
                size
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap(), 3 * CHUNK + OVERLAP);
    }
}
