//! A module containing few debug utilities.
//!
//! In general, they are meant for debugging the *trie itself*, but it is exposed as potentially
//! useful.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};
use std::hash::BuildHasher;
use std::sync::atomic::Ordering;

use arrayvec::ArrayVec;
use crossbeam_epoch::{self as epoch, Atomic, Guard};

use super::config::Config;
use super::{position, slot, Desc, Node, NodeKind, Raw, HASH_BITS, LEVEL_BITS, MAX_LEVELS, PENDING};

impl<C, S> Raw<C, S>
where
    C: Config,
    S: BuildHasher,
{
    // Hack: &mut to make sure it is not shared between threads and nobody is modifying the
    // thing right now.
    /// Panics if the trie is not in a consistent state.
    ///
    /// Checks, for everything reachable from this root: the bitmaps exactly describe the child
    /// arrays, every node is either idle or carries a finished descriptor, collision leaves
    /// live past the last hash bit and hold at least two pairs, and every pair sits on the
    /// path its hash selects.
    #[cfg(test)]
    pub(crate) fn check_consistent(&mut self) {
        // Unprotected is fine, we are &mut so nobody else is allowed to do stuff to us at the
        // moment, and Relaxed everywhere for the same reason.
        let pin = unsafe { epoch::unprotected() };
        assert!(
            self.root().status.load(Ordering::Relaxed, pin).is_null(),
            "descriptor left on a quiescent root"
        );
        let mut path = ArrayVec::<u32, MAX_LEVELS>::new();
        let top = self.root().child.load(Ordering::Relaxed, pin);
        assert!(!top.is_null(), "the root must always have a child");
        self.check_node(unsafe { top.deref() }, &mut path, pin);
    }

    #[cfg(test)]
    fn check_node(&self, node: &Node<C>, path: &mut ArrayVec<u32, MAX_LEVELS>, pin: &Guard) {
        assert!(
            node.refs.load(Ordering::Relaxed) >= 1,
            "reachable node without an edge leading to it"
        );
        let status = node.status.load(Ordering::Relaxed, pin);
        if !status.is_null() {
            match unsafe { status.deref() } {
                Desc::Mutate(m) => assert_ne!(
                    m.decision.load(Ordering::Relaxed),
                    PENDING,
                    "unfinished descriptor on a quiescent node"
                ),
                Desc::Snap(_) => panic!("snapshot descriptor on a node"),
            }
        }
        match &node.kind {
            NodeKind::Branch {
                bitmap, children, ..
            } => {
                assert_eq!(
                    bitmap.count_ones() as usize,
                    children.len(),
                    "bitmap does not match the child array"
                );
                for s in 0..32u32 {
                    if bitmap & (1 << s) == 0 {
                        continue;
                    }
                    let child = children[position(*bitmap, s)].load(Ordering::Relaxed, pin);
                    assert!(!child.is_null(), "hole in a dense child array");
                    path.push(s);
                    self.check_node(unsafe { child.deref() }, path, pin);
                    path.pop();
                }
            }
            NodeKind::Single(payload) => {
                use std::borrow::Borrow;
                let hash = self.hash(payload.borrow());
                for (level, expected) in path.iter().enumerate() {
                    assert_eq!(
                        slot(hash, level * LEVEL_BITS),
                        *expected,
                        "pair stored off its hash path"
                    );
                }
            }
            NodeKind::Collisions(pairs) => {
                assert!(
                    path.len() * LEVEL_BITS >= HASH_BITS,
                    "collision leaf before the hash ran out"
                );
                assert!(pairs.len() >= 2, "collision leaf with less than 2 pairs");
            }
        }
    }

    /// Panics unless every branch reachable from this root carries the root's own generation.
    ///
    /// Right after a snapshot this does not hold (the shared branches still carry the old
    /// stamp); it holds again once writes have touched every path, so tests force that first.
    #[cfg(test)]
    pub(crate) fn check_single_generation(&mut self) {
        fn walk<C: Config>(node: &Node<C>, root_gen: u64, pin: &Guard) {
            if let NodeKind::Branch {
                gen, children, ..
            } = &node.kind
            {
                assert_eq!(gen.0, root_gen, "branch left behind in an old generation");
                for cell in children.iter() {
                    let child = cell.load(Ordering::Relaxed, pin);
                    walk(unsafe { child.deref() }, root_gen, pin);
                }
            }
        }
        let pin = unsafe { epoch::unprotected() };
        let root_gen = self.root().gen.load(Ordering::Relaxed);
        let top = self.root().child.load(Ordering::Relaxed, pin);
        walk(unsafe { top.deref() }, root_gen, pin);
    }

    fn print_shape_ptr(&self, ptr: &Atomic<Node<C>>, fmt: &mut Formatter, pin: &Guard) -> FmtResult
    where
        C::Payload: Debug,
    {
        let ptr = ptr.load(Ordering::Acquire, pin);
        write!(fmt, "{:?}", ptr.as_raw())?;
        if ptr.is_null() {
            return Ok(());
        }
        let node = unsafe { ptr.deref() };
        match &node.kind {
            NodeKind::Single(payload) => write!(fmt, "[{:?}]", payload)?,
            NodeKind::Collisions(pairs) => write!(fmt, "[{:?}]", pairs)?,
            NodeKind::Branch {
                gen,
                bitmap,
                children,
            } => {
                write!(fmt, "@{}(", gen.0)?;
                for s in 0..32u32 {
                    if bitmap & (1 << s) == 0 {
                        continue;
                    }
                    write!(fmt, " {:X}:", s)?;
                    self.print_shape_ptr(&children[position(*bitmap, s)], fmt, pin)?;
                }
                write!(fmt, " )")?;
            }
        }
        Ok(())
    }

    fn print_shape(&self, fmt: &mut Formatter) -> FmtResult
    where
        C::Payload: Debug,
    {
        let pin = epoch::pin();
        write!(fmt, "gen {}: ", self.root().gen.load(Ordering::Relaxed))?;
        self.print_shape_ptr(&self.root().child, fmt, &pin)
    }
}

/// A pretty-printing wrapper around the raw trie.
///
/// The structure, including the pointers and generation stamps, is printed if this is used to
/// wrap the raw trie.
pub struct PrintShape<'a, C, S>(pub &'a Raw<C, S>)
where
    C: Config;

impl<C, S> Display for PrintShape<'_, C, S>
where
    C: Config,
    C::Payload: Debug,
    S: BuildHasher,
{
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        self.0.print_shape(fmt)
    }
}
