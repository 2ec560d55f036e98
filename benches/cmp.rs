#![feature(test)]

//! How does the snapshotting trie hold up against the std maps, and what does a fork
//! actually cost?
//!
//! The interesting numbers are not the raw lookups (a plain `HashMap` wins those, as it
//! should) but the snapshot ones: the fork itself must not scale with the map size, and the
//! first writes after a fork pay the copy-on-write debt down.

extern crate test;

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use snaptrie::SnapMap;
use test::{black_box, Bencher};

const PROBE: usize = 100;

// Deterministic key material, so every structure chews on the same input.
fn keys(n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(0x5eed_cafe);
    (0..n).map(|_| rng.gen()).collect()
}

// A mix of mostly-present and definitely-absent probes.
fn probes(keys: &[u64]) -> Vec<u64> {
    let mut probes: Vec<u64> = keys.iter().take(PROBE / 2).cloned().collect();
    probes.extend((0..PROBE as u64 / 2).map(|i| i.wrapping_mul(2) + 1));
    probes
}

fn lookups_hash_map(n: usize, bencher: &mut Bencher) {
    let keys = keys(n);
    let map: HashMap<u64, u64> = keys.iter().map(|k| (*k, *k)).collect();
    let probes = probes(&keys);
    bencher.iter(|| {
        for key in &probes {
            black_box(map.get(key));
        }
    });
}

fn lookups_btree_map(n: usize, bencher: &mut Bencher) {
    let keys = keys(n);
    let map: BTreeMap<u64, u64> = keys.iter().map(|k| (*k, *k)).collect();
    let probes = probes(&keys);
    bencher.iter(|| {
        for key in &probes {
            black_box(map.get(key));
        }
    });
}

fn lookups_snap_map(n: usize, bencher: &mut Bencher) {
    let keys = keys(n);
    let map: SnapMap<u64, u64> = keys.iter().map(|k| (*k, *k)).collect();
    let probes = probes(&keys);
    bencher.iter(|| {
        for key in &probes {
            black_box(map.get(key));
        }
    });
}

#[bench]
fn lookup_mid_hash_map(bencher: &mut Bencher) {
    lookups_hash_map(10_000, bencher);
}

#[bench]
fn lookup_mid_btree_map(bencher: &mut Bencher) {
    lookups_btree_map(10_000, bencher);
}

#[bench]
fn lookup_mid_snap_map(bencher: &mut Bencher) {
    lookups_snap_map(10_000, bencher);
}

#[bench]
fn lookup_huge_hash_map(bencher: &mut Bencher) {
    lookups_hash_map(1_000_000, bencher);
}

#[bench]
fn lookup_huge_snap_map(bencher: &mut Bencher) {
    lookups_snap_map(1_000_000, bencher);
}

/// Lookups that go through a freshly forked map, i.e. entirely over shared branches.
#[bench]
fn lookup_mid_snap_map_forked(bencher: &mut Bencher) {
    let keys = keys(10_000);
    let map: SnapMap<u64, u64> = keys.iter().map(|k| (*k, *k)).collect();
    let snap = map.snapshot();
    let probes = probes(&keys);
    bencher.iter(|| {
        for key in &probes {
            black_box(snap.get(key));
        }
    });
}

// The headline act: forking must not depend on the map size.

fn fork(n: usize, bencher: &mut Bencher) {
    let map: SnapMap<u64, u64> = keys(n).into_iter().map(|k| (k, k)).collect();
    bencher.iter(|| black_box(map.snapshot()));
}

#[bench]
fn fork_tiny(bencher: &mut Bencher) {
    fork(100, bencher);
}

#[bench]
fn fork_mid(bencher: &mut Bencher) {
    fork(10_000, bencher);
}

#[bench]
fn fork_huge(bencher: &mut Bencher) {
    fork(1_000_000, bencher);
}

/// Plain insert throughput, no snapshots anywhere.
#[bench]
fn insert_unforked(bencher: &mut Bencher) {
    let map: SnapMap<u64, u64> = keys(10_000).into_iter().map(|k| (k, k)).collect();
    let fresh: Vec<u64> = (1..=PROBE as u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).collect();
    bencher.iter(|| {
        for key in &fresh {
            map.insert(*key, 0);
        }
    });
}

/// The same inserts, but each round starts right after a fork, so the writes also pay for
/// re-copying the branches they touch.
#[bench]
fn insert_paying_fork_debt(bencher: &mut Bencher) {
    let map: SnapMap<u64, u64> = keys(10_000).into_iter().map(|k| (k, k)).collect();
    let fresh: Vec<u64> = (1..=PROBE as u64).map(|i| i.wrapping_mul(0x9e37_79b9_7f4a_7c15)).collect();
    bencher.iter(|| {
        let snap = map.snapshot();
        for key in &fresh {
            map.insert(*key, 0);
        }
        black_box(snap);
    });
}
