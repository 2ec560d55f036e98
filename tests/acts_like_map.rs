//! In these tests, we make sure the trie works as a HashMap in single threaded context, and
//! sometimes in multithreaded too.
//!
//! To do that we simply generate a series of inserts, lookups, conditional updates, deletions
//! and snapshots and try them on both maps. They need to return the same things.
//!
//! Furthermore, each test is run in several instances, with keys in differently sized universe.
//! The small ones likely generate only short hashes, but are more likely to reuse the same
//! value.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use proptest::collection::vec;
use proptest::prelude::*;
use rayon::prelude::*;
use snaptrie::{Conditional, SnapMap};

#[derive(Debug, Clone)]
enum Instruction<K, V> {
    Lookup(K),
    Remove(K),
    Insert(K, V),
    PutIfAbsent(K, V),
    Replace(K, V, V),
    RemoveIf(K, V),
    Snapshot,
}

impl<K, V> Instruction<K, V>
where
    K: Arbitrary + Clone + Debug + Eq + Hash + 'static,
    V: Arbitrary + Clone + Debug + PartialEq + 'static,
{
    fn strategy() -> impl Strategy<Value = Self> {
        use Instruction::*;

        prop_oneof![
            4 => any::<K>().prop_map(Lookup),
            2 => any::<K>().prop_map(Remove),
            4 => any::<(K, V)>().prop_map(|(k, v)| Insert(k, v)),
            2 => any::<(K, V)>().prop_map(|(k, v)| PutIfAbsent(k, v)),
            2 => any::<(K, V, V)>().prop_map(|(k, old, new)| Replace(k, old, new)),
            2 => any::<(K, V)>().prop_map(|(k, v)| RemoveIf(k, v)),
            1 => Just(Snapshot),
        ]
    }

    fn run(instructions: Vec<Self>) -> Result<(), TestCaseError> {
        use Instruction::*;

        let trie = SnapMap::new();
        let mut map = HashMap::new();
        // Snapshots taken on the way, each next to a frozen copy of the model. They must stay
        // untouched by everything that happens to the live map afterwards.
        let mut snaps: Vec<(SnapMap<K, V>, HashMap<K, V>)> = Vec::new();
        for ins in instructions {
            match ins {
                Lookup(key) => {
                    let expected = map.get(&key);
                    let found = trie.get(&key);
                    prop_assert_eq!(expected, found.as_ref().map(|l| l.value()));
                }
                Remove(key) => {
                    let expected = map.remove(&key);
                    let found = trie.remove(&key);
                    prop_assert_eq!(expected.as_ref(), found.as_ref().map(|l| l.value()));
                }
                Insert(key, value) => {
                    let expected = map.insert(key.clone(), value.clone());
                    let found = trie.insert(key, value);
                    prop_assert_eq!(expected.as_ref(), found.as_ref().map(|l| l.value()));
                }
                PutIfAbsent(key, value) => {
                    let expected = map.get(&key).cloned();
                    if expected.is_none() {
                        map.insert(key.clone(), value.clone());
                    }
                    let found = trie.put_if_absent(key, value);
                    prop_assert_eq!(expected.as_ref(), found.as_ref().map(|l| l.value()));
                }
                Replace(key, old, new) => {
                    let expected = match map.get(&key).cloned() {
                        None => Conditional::Absent,
                        Some(found) if found != old => Conditional::Mismatch,
                        Some(found) => {
                            map.insert(key.clone(), new.clone());
                            Conditional::Applied(found)
                        }
                    };
                    let found = trie.replace(key, &old, new).map(|l| l.value().clone());
                    prop_assert_eq!(expected, found);
                }
                RemoveIf(key, expected_value) => {
                    let expected = match map.get(&key).cloned() {
                        None => Conditional::Absent,
                        Some(found) if found != expected_value => Conditional::Mismatch,
                        Some(_) => Conditional::Applied(map.remove(&key).unwrap()),
                    };
                    let found = trie
                        .remove_if(&key, &expected_value)
                        .map(|l| l.value().clone());
                    prop_assert_eq!(expected, found);
                }
                Snapshot => {
                    snaps.push((trie.snapshot(), map.clone()));
                }
            }
        }

        // Each snapshot must still look exactly like the model did at its moment.
        for (snap, model) in &snaps {
            for (key, value) in model {
                let found = snap.get(key);
                prop_assert_eq!(Some(value), found.as_ref().map(|l| l.value()));
            }
            // And nothing the live map gained since may show up in it.
            for key in map.keys() {
                prop_assert_eq!(
                    model.get(key).is_some(),
                    snap.get(key).is_some(),
                    "live-only key leaked into a snapshot"
                );
            }
        }

        Ok(())
    }
}

fn insert_parallel_test<T: Clone + Hash + Eq + Send + Sync + 'static>(
    values: Vec<T>,
) -> Result<(), TestCaseError> {
    let set: HashSet<_> = values.iter().cloned().collect();
    let trie = SnapMap::new();
    values.into_par_iter().for_each(|v| {
        trie.insert(v, ());
    });
    for v in set {
        prop_assert!(trie.get(&v).is_some());
    }

    Ok(())
}

proptest! {
    #[test]
    fn small_keys(instructions in vec(Instruction::<u8, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn mid_keys(instructions in vec(Instruction::<u16, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn large_keys(instructions in vec(Instruction::<usize, usize>::strategy(), 1..10_000)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn string_keys(instructions in vec(Instruction::<String, usize>::strategy(), 1..100)) {
        Instruction::run(instructions)?;
    }

    #[test]
    fn insert_all_large(values in vec(any::<usize>(), 1..10_000)) {
        // Make them unique
        let set: HashSet<_> = values.iter().cloned().collect();
        let trie = SnapMap::new();
        for v in values {
            trie.insert(v, ());
        }
        for v in set {
            prop_assert!(trie.get(&v).is_some());
        }
    }

    #[test]
    fn insert_all_small_parallel(values in vec(any::<u8>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_mid_parallel(values in vec(any::<u16>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }

    #[test]
    fn insert_all_large_parallel(values in vec(any::<usize>(), 1..10_000)) {
        insert_parallel_test(values)?;
    }
}
