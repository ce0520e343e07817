//! Multi-threaded world tests.
//!
//! Every thread shares one `Arc<World>`; the checks cover identifier
//! uniqueness under contention, row visibility through `Chunk::count`, and
//! segment deduplication.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use entia_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Position {
    x: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct Marker(u64);

const THREADS: usize = 8;

#[test]
fn concurrent_reserve_never_duplicates() {
    let world = Arc::new(World::with_config(WorldConfig {
        chunk_capacity: 16,
        table_block_size: 8,
    })
    .unwrap());
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let world = Arc::clone(&world);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut all = Vec::new();
                for _ in 0..50 {
                    all.extend(world.reserve(7));
                }
                all
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for entity in handle.join().unwrap() {
            assert!(!entity.is_null());
            assert!(seen.insert(entity), "{entity:?} issued twice");
        }
    }
    assert_eq!(seen.len(), THREADS * 50 * 7);
    assert!(world.table_capacity() >= seen.len());
}

#[test]
fn concurrent_create_and_release_keeps_counts() {
    let world = Arc::new(World::with_config(WorldConfig {
        chunk_capacity: 32,
        table_block_size: 64,
    })
    .unwrap());
    let template = Template::<u64>::new().add(|_, x: &u64| Position { x: *x });

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let world = Arc::clone(&world);
            let template = template.clone();
            thread::spawn(move || {
                let creator = Creator::new(&world, &template);
                let mut kept = Vec::new();
                for round in 0..20u64 {
                    let states: Vec<u64> = (0..10)
                        .map(|i| t as u64 * 1000 + round * 10 + i)
                        .collect();
                    let entities = creator.create(&world, &states);
                    for (i, e) in entities.into_iter().enumerate() {
                        if i % 2 == 0 {
                            assert!(world.release(e));
                        } else {
                            kept.push((e, states[i]));
                        }
                    }
                }
                kept
            })
        })
        .collect();

    let mut kept = Vec::new();
    for handle in handles {
        kept.extend(handle.join().unwrap());
    }
    // Releases that raced with another thread's fill may have been deferred.
    world.flush();
    assert_eq!(world.count(), kept.len());
    assert!(world.entities().iter().all(|&e| world.is_alive(e)));
    for (e, x) in kept {
        assert_eq!(world.read(e, |p: &Position| p.x), Some(x));
    }
}

/// Readers that observe `count` rows must see every column of those rows
/// fully written.
#[test]
fn published_rows_are_fully_initialized() {
    let world = Arc::new(World::new());
    let template = Template::<u64>::new()
        .add(|_, x: &u64| Position { x: *x })
        .add(|_, x: &u64| Marker(*x));
    let creator = Arc::new(Creator::new(&world, &template));
    let done = Arc::new(AtomicBool::new(false));

    let reader = {
        let segment = Arc::clone(creator.segment());
        let done = Arc::clone(&done);
        thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                for chunk in segment.chunks().iter() {
                    let view = chunk.view();
                    let positions = view.read::<Position>().unwrap();
                    let markers = view.read::<Marker>().unwrap();
                    assert_eq!(chunk.count(), view.len());
                    assert_eq!(positions.len(), view.len());
                    assert_eq!(markers.len(), view.len());
                    for (p, m) in positions.iter().zip(markers.iter()) {
                        assert_eq!(p.x, m.0);
                    }
                }
            }
        })
    };

    let writers: Vec<_> = (0..4u64)
        .map(|t| {
            let world = Arc::clone(&world);
            let creator = Arc::clone(&creator);
            thread::spawn(move || {
                for round in 0..100u64 {
                    creator.create(&world, &[t * 10_000 + round]);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    reader.join().unwrap();
    assert_eq!(world.count(), 400);
}

#[test]
fn concurrent_segment_lookup_dedups() {
    let world = Arc::new(World::new());
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let world = Arc::clone(&world);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                // Half the threads ask in the opposite order.
                if t % 2 == 0 {
                    world.segment(&[Meta::of::<Position>(), Meta::of::<Marker>()])
                } else {
                    world.segment(&[Meta::of::<Marker>(), Meta::of::<Position>()])
                }
            })
        })
        .collect();
    let segments: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(segments.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(world.segments().len(), 1);
}
