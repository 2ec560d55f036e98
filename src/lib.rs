#![doc(
    html_root_url = "https://docs.rs/snaptrie/0.1.0/snaptrie/",
    test(attr(deny(warnings)))
)]
#![warn(missing_docs)]

//! A concurrent lock-free hash trie with constant-time snapshots.
//!
//! The [`SnapMap`] is a concurrent map: many threads may read and write it at once, without
//! locks, and every operation stays lock-free ‒ a stalled thread can never wedge the others,
//! because whoever runs into its half-done work finishes that work instead of waiting.
//!
//! What sets it apart from the usual concurrent maps is [`snapshot`][SnapMap::snapshot]: an
//! O(1) fork of the whole map. The snapshot is itself a full map ‒ readable *and* writable ‒
//! and the original and the snapshot never see each other's subsequent writes. The actual
//! copying happens lazily, a branch at a time, only on the paths that writes touch.
//!
//! # When to use this
//!
//! * You need consistent point-in-time views of a map that stays hot with writes ‒ periodic
//!   statistics, checkpointing, speculative what-if mutations that may be thrown away.
//! * You want reasonably scalable concurrent access without a global lock.
//!
//! If you never snapshot, a plain sharded or lock-free hash map will likely be faster; the
//! generation machinery here is the price of the O(1) fork.
//!
//! # Example
//!
//! ```rust
//! use snaptrie::SnapMap;
//!
//! let map = SnapMap::new();
//! map.insert("apples", 3);
//! map.insert("pears", 5);
//!
//! let checkpoint = map.snapshot();
//! map.insert("apples", 4);
//!
//! assert_eq!(4, *map.get("apples").unwrap().value());
//! assert_eq!(3, *checkpoint.get("apples").unwrap().value());
//!
//! // The snapshot is a first-class map of its own.
//! checkpoint.insert("plums", 7);
//! assert!(map.get("plums").is_none());
//! ```
//!
//! The crate is structured in layers. The [`raw`] module contains the actual lock-free trie,
//! generic over a [`Config`][raw::config::Config]; [`SnapMap`] dresses it up into a map with
//! [`Arc`][std::sync::Arc]-held elements. Further flavours can be built on top of [`raw`] if
//! the provided one doesn't fit.

pub mod map;
pub mod outcome;
pub mod raw;

pub use crate::map::{Entry, SnapMap};
pub use crate::outcome::Conditional;
