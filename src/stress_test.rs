//! Randomized invariant stress test for the free-list allocator.
//!
//! Drives a long random sequence of add/save/delete/put_meta operations
//! against a live store and checks, after every step, that every
//! surviving record still reads back correctly, and at the end that the
//! free list never left two adjacent AVAILABLE blocks uncoalesced.

use std::collections::HashMap;
use std::io::Cursor;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::BlockKind;
use crate::lint::{lint, LintEntry};
use crate::store::Store;
use crate::Rref;

fn open_new() -> Store<Cursor<Vec<u8>>> {
    Store::create(Cursor::new(Vec::new())).unwrap()
}

#[test]
fn randomized_add_delete_save_preserves_readability() {
    let _ = env_logger::try_init();
    let mut rng = StdRng::seed_from_u64(0xC0DEBEEF);
    let mut store = open_new();
    let mut live: HashMap<Rref, Vec<u8>> = HashMap::new();

    for step in 0..500 {
        let action = rng.random_range(0..3);
        match action {
            0 => {
                let len = rng.random_range(1..64);
                let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                let padding = rng.random_range(0..8);
                let rref = store.add(&data, padding).unwrap();
                live.insert(rref, data);
            }
            1 if !live.is_empty() => {
                let keys: Vec<Rref> = live.keys().copied().collect();
                let victim = keys[rng.random_range(0..keys.len())];
                store.delete(victim).unwrap();
                live.remove(&victim);
            }
            2 if !live.is_empty() => {
                let keys: Vec<Rref> = live.keys().copied().collect();
                let target = keys[rng.random_range(0..keys.len())];
                let len = rng.random_range(1..96);
                let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
                let new_rref = store.save(target, &data, 0).unwrap();
                live.remove(&target);
                live.insert(new_rref, data);
            }
            _ => {}
        }

        if step % 50 == 0 {
            for (&rref, expected) in &live {
                assert_eq!(&store.read_data(rref).unwrap(), expected);
            }
        }
    }

    for (&rref, expected) in &live {
        assert_eq!(&store.read_data(rref).unwrap(), expected);
    }
}

#[test]
fn randomized_meta_updates_preserve_latest_value() {
    let _ = env_logger::try_init();
    let mut rng = StdRng::seed_from_u64(0x5EED5EED);
    let mut store = open_new();
    let mut expected: Option<Vec<u8>> = None;

    for _ in 0..200 {
        let len = rng.random_range(1..128);
        let padding = rng.random_range(0..16);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        store.put_meta(&data, padding).unwrap();
        expected = Some(data);
    }

    assert_eq!(store.get_meta().unwrap(), expected.unwrap());
}

#[test]
fn free_list_never_leaves_two_adjacent_available_blocks() {
    let _ = env_logger::try_init();
    let mut rng = StdRng::seed_from_u64(0xA11CE);
    let mut store = open_new();
    let mut live = Vec::new();

    for _ in 0..200 {
        if live.is_empty() || rng.random_bool(0.6) {
            let len = rng.random_range(1..48);
            let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
            let rref = store.add(&data, 0).unwrap();
            live.push(rref);
        } else {
            let idx = rng.random_range(0..live.len());
            let victim = live.swap_remove(idx);
            store.delete(victim).unwrap();
        }
    }

    let mut cursor = store.into_inner().unwrap();
    let report = lint(&mut cursor).unwrap();

    let mut prev_was_available = false;
    for entry in &report.entries {
        if let LintEntry::Block { kind, .. } = entry {
            let is_available = *kind == BlockKind::Available;
            assert!(
                !(prev_was_available && is_available),
                "two adjacent AVAILABLE blocks were not coalesced"
            );
            prev_was_available = is_available;
        }
    }
}

#[test]
fn randomized_stress_survives_reopen_midway() {
    let _ = env_logger::try_init();
    let mut rng = StdRng::seed_from_u64(0xFEEDFACE);
    let mut store = open_new();
    let mut live: HashMap<Rref, Vec<u8>> = HashMap::new();

    for _ in 0..150 {
        let len = rng.random_range(1..64);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let rref = store.add(&data, 0).unwrap();
        live.insert(rref, data);
    }
    // Delete roughly half.
    let victims: Vec<Rref> = live.keys().copied().step_by(2).collect();
    for v in victims {
        store.delete(v).unwrap();
        live.remove(&v);
    }

    // Round-trip through a close/reopen cycle and keep going.
    let cursor = store.into_inner().unwrap();
    let mut store = Store::open(cursor).unwrap();

    for _ in 0..150 {
        let len = rng.random_range(1..64);
        let data: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        let rref = store.add(&data, 0).unwrap();
        live.insert(rref, data);
    }

    for (&rref, expected) in &live {
        assert_eq!(&store.read_data(rref).unwrap(), expected);
    }
}
