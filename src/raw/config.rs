use std::borrow::Borrow;
use std::hash::Hash;
use std::marker::PhantomData;

// TODO: Allow our own hash, returning something else than just u64. Then the constants go here
// too.
/// Compile-time description of what the raw trie stores.
///
/// The payload is the unit the trie moves around ‒ for a map it is a key-value pair, for a set
/// just the key. It needs to be cheap to clone (collision handling and the copy-on-write
/// branches clone it), so wrap big things in an `Arc`.
pub trait Config {
    /// The stored unit.
    type Payload: Clone + Borrow<Self::Key>;
    /// The key the payload is addressed by.
    type Key: Hash + Eq;
}

/// A [`Config`] for a trie storing plain values that are their own keys.
pub struct Trivial<T>(PhantomData<T>);

impl<T> Config for Trivial<T>
where
    T: Clone + Hash + Eq,
{
    type Payload = T;
    type Key = T;
}
