//! The [`SnapMap`][crate::SnapMap] type and its helpers.

use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::iter::FromIterator;
use std::marker::PhantomData;
use std::sync::Arc;

#[cfg(feature = "parallel")]
use rayon::iter::{FromParallelIterator, IntoParallelIterator, ParallelExtend, ParallelIterator};

use crate::outcome::Conditional;
use crate::raw::config::Config;
use crate::raw::Raw;

/// One key/value entry of the map.
///
/// The map hands out [`Arc`] handles to these. An entry never changes once it is in a map;
/// "updating" a key installs a new entry, and snapshots keep handing out the old one. That is
/// also why a snapshot and its origin can share entries forever without copying them.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry<K, V> {
    key: K,
    value: V,
}

impl<K, V> Entry<K, V> {
    fn new(key: K, value: V) -> Self {
        Entry { key, value }
    }

    /// The key this entry sits under.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The stored value.
    pub fn value(&self) -> &V {
        &self.value
    }
}

// What the raw trie actually moves around: a cheap-to-clone handle that can cough up its key.
struct Keyed<K, V>(Arc<Entry<K, V>>);

impl<K, V> Keyed<K, V> {
    fn pair(key: K, value: V) -> Self {
        Keyed(Arc::new(Entry::new(key, value)))
    }

    fn handle(&self) -> Arc<Entry<K, V>> {
        Arc::clone(&self.0)
    }
}

impl<K, V> Clone for Keyed<K, V> {
    fn clone(&self) -> Self {
        Keyed(Arc::clone(&self.0))
    }
}

impl<K, V> Borrow<K> for Keyed<K, V> {
    fn borrow(&self) -> &K {
        &self.0.key
    }
}

struct SnapConfig<K, V>(PhantomData<(K, V)>);

impl<K, V> Config for SnapConfig<K, V>
where
    K: Hash + Eq + 'static,
    V: 'static,
{
    type Payload = Keyed<K, V>;
    type Key = K;
}

// How many inserts a bulk operation does on one epoch pin before refreshing it. Holding a
// single pin across a huge batch would stall reclamation for everyone else.
const BULK_REPIN: usize = 64;

/// A concurrent map with O(1) snapshots.
///
/// The data is stored as [`Arc<Entry<K, V>>`][Entry] handles, so lookups return the held value
/// without copying it and a snapshot can keep serving an entry long after the live map moved
/// on.
///
/// All operations work on a shared reference. The crown piece is [`snapshot`][SnapMap::snapshot]:
/// it forks the whole map in constant time, and afterwards the two maps evolve independently ‒
/// writes into one are invisible in the other. Internally they keep sharing their subtrees and
/// only re-copy the branches a write actually touches.
///
/// [`Extend`] and [`FromIterator`] are implemented for `(K, V)` pairs; the `Extend` flavour on
/// a shared reference lets several threads feed one map. Both run whole batches on a periodically
/// refreshed epoch pin rather than paying for one pin per insert. With the `parallel` feature,
/// [`ParallelExtend`]/[`FromParallelIterator`] do the same with one pin per rayon worker.
///
/// # Examples
///
/// ```rust
/// use snaptrie::SnapMap;
/// use crossbeam_utils::thread;
///
/// let map = SnapMap::new();
///
/// thread::scope(|s| {
///     s.spawn(|_| {
///         map.insert("hello", 1);
///     });
///     s.spawn(|_| {
///         map.insert("world", 2);
///     });
/// }).unwrap();
/// assert_eq!(1, *map.get("hello").unwrap().value());
/// assert_eq!(2, *map.get("world").unwrap().value());
/// ```
///
/// ```rust
/// use snaptrie::SnapMap;
///
/// let map = SnapMap::new();
/// map.insert("x", 1);
///
/// let snap = map.snapshot();
/// map.insert("x", 2);
///
/// assert_eq!(2, *map.get("x").unwrap().value());
/// assert_eq!(1, *snap.get("x").unwrap().value());
/// ```
pub struct SnapMap<K, V, S = RandomState>
where
    K: Hash + Eq + 'static,
    V: 'static,
{
    raw: Raw<SnapConfig<K, V>, S>,
}

impl<K, V> SnapMap<K, V>
where
    K: Hash + Eq,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::default())
    }
}

impl<K, V, S> SnapMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new empty map, but with the provided hasher implementation.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            raw: Raw::with_hasher(hasher),
        }
    }

    /// Inserts a new entry.
    ///
    /// Any previous entry with the same key is replaced and returned.
    pub fn insert(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        let pin = crossbeam_epoch::pin();
        self.raw
            .insert(Keyed::pair(key, value), &pin)
            .map(Keyed::handle)
    }

    /// Inserts a new entry, but only if its key is not in the map yet.
    ///
    /// If the key is already present, the map is left alone and the present entry is returned.
    /// `None` means the provided pair made it in.
    pub fn put_if_absent(&self, key: K, value: V) -> Option<Arc<Entry<K, V>>> {
        let pin = crossbeam_epoch::pin();
        self.raw
            .put_if_absent(Keyed::pair(key, value), &pin)
            .map(Keyed::handle)
    }

    /// Replaces the value under the key, but only if the current value is the expected one.
    ///
    /// On [`Applied`][Conditional::Applied] the returned entry is the replaced one.
    pub fn replace(&self, key: K, expected: &V, value: V) -> Conditional<Arc<Entry<K, V>>>
    where
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .replace(
                Keyed::pair(key, value),
                |found| *found.0.value() == *expected,
                &pin,
            )
            .map(Keyed::handle)
    }

    /// Looks up an entry.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.get(key, &pin).map(Keyed::handle)
    }

    /// Removes the entry under the given key, returning it.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
    {
        let pin = crossbeam_epoch::pin();
        self.raw.remove(key, &pin).map(Keyed::handle)
    }

    /// Removes the entry under the key, but only if its value is the expected one.
    ///
    /// On [`Applied`][Conditional::Applied] the returned entry is the removed one.
    pub fn remove_if<Q>(&self, key: &Q, expected: &V) -> Conditional<Arc<Entry<K, V>>>
    where
        Q: ?Sized + Eq + Hash,
        K: Borrow<Q>,
        V: PartialEq,
    {
        let pin = crossbeam_epoch::pin();
        self.raw
            .remove_if(key, |found| *found.0.value() == *expected, &pin)
            .map(Keyed::handle)
    }

    /// Takes an O(1) snapshot of the map.
    ///
    /// The returned map holds exactly the entries this one held at the moment of the call and
    /// from then on the two lead separate lives ‒ neither sees the other's writes. The cost of
    /// the call itself is constant; the real copying happens lazily, branch by branch, as
    /// writes on either side touch the shared paths.
    pub fn snapshot(&self) -> Self
    where
        S: Clone,
    {
        let pin = crossbeam_epoch::pin();
        Self {
            raw: self.raw.snapshot(&pin),
        }
    }

    // The single engine behind Extend/FromIterator: one pin for the whole batch, refreshed
    // every BULK_REPIN inserts so a long feed doesn't hold the epoch back.
    fn feed<I>(&self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut pin = crossbeam_epoch::pin();
        for (done, (key, value)) in pairs.into_iter().enumerate() {
            if done % BULK_REPIN == 0 && done > 0 {
                pin.repin();
            }
            self.raw.insert(Keyed::pair(key, value), &pin);
        }
    }
}

impl<K, V> Default for SnapMap<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

// Cloning a map is just snapshotting it under a different name.
impl<K, V, S> Clone for SnapMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Clone,
{
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

impl<K, V, S> Extend<(K, V)> for &'_ SnapMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.feed(pairs);
    }
}

impl<K, V, S> Extend<(K, V)> for SnapMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn extend<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
    {
        self.feed(pairs);
    }
}

impl<K, V> FromIterator<(K, V)> for SnapMap<K, V>
where
    K: Hash + Eq,
{
    fn from_iter<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let map = SnapMap::new();
        map.feed(pairs);
        map
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<(K, V)> for &'_ SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, pairs: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map = *self;
        // One pin per rayon worker batch instead of one per insert.
        pairs
            .into_par_iter()
            .for_each_init(crossbeam_epoch::pin, |pin, (key, value)| {
                map.raw.insert(Keyed::pair(key, value), pin);
            });
    }
}

#[cfg(feature = "parallel")]
impl<K, V, S> ParallelExtend<(K, V)> for SnapMap<K, V, S>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
    S: BuildHasher + Sync,
{
    fn par_extend<I>(&mut self, pairs: I)
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        ParallelExtend::par_extend(&mut &*self, pairs);
    }
}

#[cfg(feature = "parallel")]
impl<K, V> FromParallelIterator<(K, V)> for SnapMap<K, V>
where
    K: Hash + Eq + Send + Sync,
    V: Send + Sync,
{
    fn from_par_iter<I>(pairs: I) -> Self
    where
        I: IntoParallelIterator<Item = (K, V)>,
    {
        let map = SnapMap::new();
        ParallelExtend::par_extend(&mut &map, pairs);
        map
    }
}
