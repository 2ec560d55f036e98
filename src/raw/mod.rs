//! The core implementation of the snapshotting concurrent trie.
//!
//! This module contains the [`Raw`][crate::raw::Raw] type, which is the engine of the data
//! structures in this crate. This is exposed to allow wrapping it into further APIs, but is
//! probably not the best thing for general use.
//!
//! # How the protocol works, in short
//!
//! The trie is made of immutable-by-intent nodes. A `Branch` holds up to 32 children, selected
//! by 5 bits of the hash per level and stored densely under a bitmap. A `Single` holds one
//! pair, a `Collisions` leaf holds the pairs whose hashes ran out of bits. Every change to the
//! structure replaces a whole node under its parent.
//!
//! That replacement is a multi-word operation (two status words and the child pointer), so it
//! is driven through a descriptor. A mutation allocates a [`Mutate`] descriptor and then goes
//! through five CAS events, in this order:
//!
//! 1. parent status: idle → descriptor
//! 2. old child status: idle → descriptor (branches only ‒ leaves can't change anyway)
//! 3. parent child pointer: old child → replacement
//! 4. replacement status: descriptor → idle
//! 5. parent status: descriptor → idle
//!
//! Any thread that runs into a non-idle status finishes the descriptor it finds there before
//! (re)trying its own ‒ nobody ever waits for anybody. The evicted child keeps the descriptor
//! in its status forever, which locks the detached subtree against late writers. Step 4 must
//! happen before step 5: a late thread decides whether a descriptor committed by looking at
//! the replacement's status, and that only works if the replacement is released first.
//!
//! Snapshots hang a [`Snap`] descriptor onto the root, publish a frozen second root that
//! shares the whole subtree, and move the live root to a fresh generation. Writers stamp each
//! branch with the generation they saw at the root and re-copy any branch with an old stamp
//! before descending through it, so the two tries fall apart lazily, one touched path at a
//! time.
//!
//! All the protocol fields are handled with sequentially consistent operations. The helping
//! case analysis reads several distinct words (both statuses, the child pointer, the root
//! generation) and draws conclusions from their combination; weaker orderings would invalidate
//! those conclusions. The few relaxed spots are the single-threaded teardown paths.
//!
//! Memory is reclaimed through [`crossbeam_epoch`], with one twist: after a snapshot the two
//! tries share nodes, so an unlinked node cannot simply be freed once the epoch turns. Every
//! node counts the tree edges leading to it and dies when the last edge is dropped at a safe
//! point.

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash, Hasher};
use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use smallvec::SmallVec;

pub mod config;
pub mod debug;

use self::config::Config;
use crate::outcome::Conditional;

pub(crate) const LEVEL_BITS: usize = 5;
pub(crate) const LEVEL_MASK: u64 = 0b1_1111;
pub(crate) const LEVEL_CELLS: usize = 32;
pub(crate) const HASH_BITS: usize = mem::size_of::<u64>() * 8;
pub(crate) const MAX_LEVELS: usize = (HASH_BITS + LEVEL_BITS - 1) / LEVEL_BITS;

/// A generation token.
///
/// Two generations are the same generation exactly when their ids are equal; the ids come from
/// a global counter and are never reused. The live root moves to a fresh generation on every
/// snapshot and branches are stamped with the generation they were copied under.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Gen(u64);

impl Gen {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Gen(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The entry point of one map.
///
/// The child always points at a branch (possibly an empty one). The status takes both mutation
/// descriptors (for replacing the top branch) and snapshot descriptors.
pub(crate) struct Root<C: Config> {
    status: Atomic<Desc<C>>,
    child: Atomic<Node<C>>,
    gen: AtomicU64,
}

/// One node of the trie.
///
/// `refs` counts the tree edges (parent cells and root child pointers) leading here; after a
/// snapshot a node can be reachable from several roots at once. `status` is null when idle,
/// otherwise it points at the descriptor currently working on (or permanently pinning) the
/// node.
pub(crate) struct Node<C: Config> {
    refs: AtomicUsize,
    status: Atomic<Desc<C>>,
    kind: NodeKind<C>,
}

pub(crate) enum NodeKind<C: Config> {
    Branch {
        gen: Gen,
        bitmap: u32,
        children: Box<[Atomic<Node<C>>]>,
    },
    Single(C::Payload),
    Collisions(SmallVec<[C::Payload; 2]>),
}

impl<C: Config> NodeKind<C> {
    fn is_branch(&self) -> bool {
        match self {
            NodeKind::Branch { .. } => true,
            _ => false,
        }
    }
}

impl<C: Config> Node<C> {
    fn single(payload: C::Payload) -> Self {
        Node {
            refs: AtomicUsize::new(1),
            status: Atomic::null(),
            kind: NodeKind::Single(payload),
        }
    }

    fn collisions(pairs: SmallVec<[C::Payload; 2]>) -> Self {
        debug_assert!(pairs.len() >= 2, "BUG: collision node with less than 2 pairs");
        Node {
            refs: AtomicUsize::new(1),
            status: Atomic::null(),
            kind: NodeKind::Collisions(pairs),
        }
    }

    fn branch(gen: Gen, bitmap: u32, children: Box<[Atomic<Node<C>>]>) -> Self {
        debug_assert_eq!(bitmap.count_ones() as usize, children.len());
        Node {
            refs: AtomicUsize::new(1),
            status: Atomic::null(),
            kind: NodeKind::Branch {
                gen,
                bitmap,
                children,
            },
        }
    }
}

/// Which 5-bit slot of a branch the hash selects at this depth.
fn slot(hash: u64, shift: usize) -> u32 {
    ((hash >> shift) & LEVEL_MASK) as u32
}

/// Where in the dense child array a logical slot lives.
fn position(bitmap: u32, slot: u32) -> usize {
    (bitmap & ((1u32 << slot) - 1)).count_ones() as usize
}

/// A new cell holding an already shared pointer.
fn cell_from<C: Config>(ptr: Shared<'_, Node<C>>) -> Atomic<Node<C>> {
    let cell = Atomic::null();
    cell.store(ptr, Ordering::SeqCst);
    cell
}

const PENDING: u8 = 0;
const COMMITTED: u8 = 1;
const ABORTED: u8 = 2;

/// The status family. Null stands for the idle case, so the enum only has the two working
/// shapes. The set is closed on purpose ‒ the completion paths match on it exhaustively.
///
/// Descriptor identity is pointer identity. They are allocated per operation attempt and never
/// reused.
pub(crate) enum Desc<C: Config> {
    Mutate(Mutate<C>),
    Snap(Snap<C>),
}

/// An in-flight replacement of `child` by something new under `parent[index]`.
pub(crate) struct Mutate<C: Config> {
    /// The root this operation runs under, for re-validating the generation.
    root: *const Root<C>,
    /// The root generation observed when the walk started.
    gen: Gen,
    parent: Parent<C>,
    /// Physical index in the parent (always 0 for a root parent).
    index: usize,
    child: *const Node<C>,
    recipe: Recipe<C>,
    /// The replacement once constructed. Written at most once, by the first completer.
    new_child: Atomic<Node<C>>,
    /// One-shot pending → committed | aborted. The transition is the serialization point
    /// between helpers racing towards commit and helpers racing towards rollback, and it lets
    /// late observers learn the outcome without dereferencing anything else.
    decision: AtomicU8,
}

/// How to make the replacement node.
///
/// For a branch-shaped old child the replacement is only built inside the completion, after
/// step 2 has pinned the child ‒ building it earlier could capture a child cell that another
/// thread still manages to change. Leaves can't change, so their replacements come prebuilt.
enum Recipe<C: Config> {
    /// Prebuilt replacement (the old child is a leaf).
    Ready(Atomic<Node<C>>),
    /// Copy the branch child with `payload` added as a new `Single` in the free logical slot.
    Expand { slot: u32, payload: C::Payload },
    /// Copy the branch child without the logical slot, provided the slot still holds `victim`.
    /// May contract to the lone leaf left over.
    Shrink { slot: u32, victim: *const Node<C> },
    /// Copy the branch child verbatim, restamped to the descriptor's generation.
    Refresh,
}

/// A snapshot in flight on `root`.
pub(crate) struct Snap<C: Config> {
    root: *const Root<C>,
    old_gen: Gen,
    new_trie_gen: Gen,
    new_snap_gen: Gen,
    /// The frozen second root. Written at most once, by the first completer to get there.
    frozen: Atomic<Root<C>>,
}

/// Whatever a mutation hangs off: the root (for the top branch) or a branch.
pub(crate) enum Parent<C: Config> {
    Root(*const Root<C>),
    Branch(*const Node<C>),
}

impl<C: Config> Clone for Parent<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Config> Copy for Parent<C> {}

impl<C: Config> Parent<C> {
    unsafe fn status(&self) -> &Atomic<Desc<C>> {
        match self {
            Parent::Root(root) => &(**root).status,
            Parent::Branch(node) => &(**node).status,
        }
    }

    unsafe fn cell(&self, index: usize) -> &Atomic<Node<C>> {
        match self {
            Parent::Root(root) => {
                debug_assert_eq!(index, 0);
                &(**root).child
            }
            Parent::Branch(node) => match &(**node).kind {
                NodeKind::Branch { children, .. } => &children[index],
                _ => unreachable!("BUG: leaf node used as a parent"),
            },
        }
    }

    fn is_branch(&self) -> bool {
        match self {
            Parent::Branch(_) => true,
            Parent::Root(_) => false,
        }
    }
}

// ---------- reference counting ----------

/// Drops one tree edge leading to the node. The free is deferred through the epoch, so a
/// reader that loaded the pointer before the edge went away can still use it.
unsafe fn dec_ref<C: Config>(node: Shared<'_, Node<C>>, guard: &Guard) {
    if node.deref().refs.fetch_sub(1, Ordering::SeqCst) == 1 {
        let raw = node.as_raw();
        guard.defer_unchecked(move || release(raw));
    }
}

/// Frees a node whose last edge is gone. Runs at an epoch safe point. By then the node is
/// unreachable, so the edges it holds itself can be dropped (and followed) directly, together
/// with any descriptor pinned into its status.
unsafe fn release<C: Config>(ptr: *const Node<C>) {
    let node = &*ptr;
    if let NodeKind::Branch { children, .. } = &node.kind {
        for cell in children.iter() {
            let child = cell.load(Ordering::Relaxed, epoch::unprotected());
            if child.deref().refs.fetch_sub(1, Ordering::Relaxed) == 1 {
                release(child.as_raw());
            }
        }
    }
    let status = node.status.load(Ordering::Relaxed, epoch::unprotected());
    if !status.is_null() {
        drop(status.into_owned());
    }
    drop(Owned::from_raw(ptr as *mut Node<C>));
}

/// Takes apart a node that was never published ‒ a lost construction race or an aborted
/// prebuilt replacement. The edges it took on shared children are handed back; the allocation
/// itself was never visible, so it can go at once.
unsafe fn discard_unpublished<C: Config>(node: Shared<'_, Node<C>>, guard: &Guard) {
    if let NodeKind::Branch { children, .. } = &node.deref().kind {
        for cell in children.iter() {
            dec_ref(cell.load(Ordering::SeqCst, guard), guard);
        }
    }
    drop(node.into_owned());
}

// ---------- the completion protocol ----------

/// Finishes whatever descriptor sits in a status word (helping).
unsafe fn help<C: Config>(desc: Shared<'_, Desc<C>>, guard: &Guard) {
    if desc.is_null() {
        return;
    }
    match desc.deref() {
        Desc::Mutate(_) => {
            complete_mutate(desc, guard);
        }
        Desc::Snap(_) => complete_snap(desc, guard),
    }
}

/// One-shot decision of a mutation descriptor. Whoever gets there first wins; everyone else
/// learns the verdict.
fn decide<C: Config>(m: &Mutate<C>, want: u8) -> u8 {
    match m
        .decision
        .compare_exchange(PENDING, want, Ordering::SeqCst, Ordering::SeqCst)
    {
        Ok(_) => want,
        Err(actual) => actual,
    }
}

/// Does the descriptor's recipe still make sense against the (now unchangeable) old child?
unsafe fn recipe_applies<C: Config>(m: &Mutate<C>, child: &Node<C>, guard: &Guard) -> bool {
    match &m.recipe {
        Recipe::Shrink { slot, victim } => match &child.kind {
            NodeKind::Branch { bitmap, children, .. } => {
                children[position(*bitmap, *slot)]
                    .load(Ordering::SeqCst, guard)
                    .as_raw()
                    == *victim
            }
            _ => unreachable!("BUG: shrink recipe over a leaf"),
        },
        // Expansion only looks at the bitmap and a bitmap never changes on a live node; the
        // prebuilt recipes were checked against an immutable leaf.
        _ => true,
    }
}

enum BuiltKind {
    /// A freshly allocated node.
    Fresh,
    /// An existing leaf adopted by contraction; it got an extra edge up front.
    SharedLeaf,
    /// The prebuilt node out of the recipe.
    Ready,
}

/// Builds the replacement node. The old child can no longer change here (pinned or a leaf),
/// so every helper constructs the same value and the first to publish it into the descriptor
/// wins.
unsafe fn construct<'g, C: Config>(
    d: Shared<'g, Desc<C>>,
    m: &Mutate<C>,
    child: &'g Node<C>,
    guard: &'g Guard,
) -> (Shared<'g, Node<C>>, BuiltKind) {
    let parts = |node: &'g NodeKind<C>| match node {
        NodeKind::Branch {
            bitmap, children, ..
        } => (*bitmap, children),
        _ => unreachable!("BUG: branch recipe over a leaf"),
    };
    match &m.recipe {
        Recipe::Ready(node) => (node.load(Ordering::SeqCst, guard), BuiltKind::Ready),
        Recipe::Refresh => {
            let (bitmap, children) = parts(&child.kind);
            let cells = children
                .iter()
                .map(|c| {
                    let sub = c.load(Ordering::SeqCst, guard);
                    sub.deref().refs.fetch_add(1, Ordering::SeqCst);
                    cell_from(sub)
                })
                .collect::<Vec<_>>()
                .into_boxed_slice();
            let node = Owned::new(Node::branch(m.gen, bitmap, cells));
            node.status.store(d, Ordering::SeqCst);
            (node.into_shared(guard), BuiltKind::Fresh)
        }
        Recipe::Expand { slot, payload } => {
            let (bitmap, children) = parts(&child.kind);
            let bit = 1u32 << *slot;
            debug_assert_eq!(bitmap & bit, 0, "BUG: expanding into an occupied slot");
            let pos = position(bitmap, *slot);
            let mut cells = Vec::with_capacity(children.len() + 1);
            for (i, cell) in children.iter().enumerate() {
                if i == pos {
                    cells.push(Atomic::new(Node::single(payload.clone())));
                }
                let sub = cell.load(Ordering::SeqCst, guard);
                sub.deref().refs.fetch_add(1, Ordering::SeqCst);
                cells.push(cell_from(sub));
            }
            if pos == children.len() {
                cells.push(Atomic::new(Node::single(payload.clone())));
            }
            let node = Owned::new(Node::branch(m.gen, bitmap | bit, cells.into_boxed_slice()));
            node.status.store(d, Ordering::SeqCst);
            (node.into_shared(guard), BuiltKind::Fresh)
        }
        Recipe::Shrink { slot, victim } => {
            let (bitmap, children) = parts(&child.kind);
            let bit = 1u32 << *slot;
            debug_assert_ne!(bitmap & bit, 0, "BUG: shrinking an empty slot");
            let pos = position(bitmap, *slot);
            debug_assert_eq!(
                children[pos].load(Ordering::SeqCst, guard).as_raw(),
                *victim,
                "BUG: shrink applicability was not rechecked"
            );
            let survivors = children
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != pos)
                .map(|(_, c)| c.load(Ordering::SeqCst, guard))
                .collect::<Vec<_>>();
            // If a single pair is left and we are not the top branch, put the leaf itself into
            // the parent instead of a one-armed branch. Only a `Single` may travel up ‒ a
            // collision leaf belongs at the very bottom, where the hash bits are spent.
            let lone_single = survivors.len() == 1
                && match survivors[0].deref().kind {
                    NodeKind::Single(_) => true,
                    _ => false,
                };
            if lone_single && m.parent.is_branch() {
                let lone = survivors[0];
                lone.deref().refs.fetch_add(1, Ordering::SeqCst);
                (lone, BuiltKind::SharedLeaf)
            } else {
                let cells = survivors
                    .into_iter()
                    .map(|sub| {
                        sub.deref().refs.fetch_add(1, Ordering::SeqCst);
                        cell_from(sub)
                    })
                    .collect::<Vec<_>>()
                    .into_boxed_slice();
                let node = Owned::new(Node::branch(m.gen, bitmap & !bit, cells));
                node.status.store(d, Ordering::SeqCst);
                (node.into_shared(guard), BuiltKind::Fresh)
            }
        }
    }
}

/// Replays the commit tail of a decided descriptor: build, steps 3, 4 and 5. Idempotent.
unsafe fn finish_commit<C: Config>(d: Shared<'_, Desc<C>>, m: &Mutate<C>, guard: &Guard) -> bool {
    let child = Shared::from(m.child);
    let cell = m.parent.cell(m.index);

    let mut new_child = m.new_child.load(Ordering::SeqCst, guard);
    if new_child.is_null() {
        let (built, kind) = construct(d, m, child.deref(), guard);
        match m
            .new_child
            .compare_exchange(Shared::null(), built, Ordering::SeqCst, Ordering::SeqCst, guard)
        {
            Ok(_) => new_child = built,
            Err(e) => {
                match kind {
                    BuiltKind::Fresh => discard_unpublished(built, guard),
                    BuiltKind::SharedLeaf => dec_ref(built, guard),
                    BuiltKind::Ready => (),
                }
                new_child = e.current;
            }
        }
    }

    // Step 3 ‒ the linearization point. Exactly one of the racing helpers swings the pointer.
    let _ = cell.compare_exchange(child, new_child, Ordering::SeqCst, Ordering::SeqCst, guard);
    // Step 4 before step 5: late observers read "replacement status is not the descriptor" as
    // proof of commit, which only holds if the replacement is released first.
    let _ = new_child.deref().status.compare_exchange(
        d,
        Shared::null(),
        Ordering::SeqCst,
        Ordering::SeqCst,
        guard,
    );
    // Step 5. The winner also drops the tree edge to the evicted child ‒ not earlier! The
    // child's release frees the descriptor pinned into it, so it must not be scheduled while
    // the parent status still points there.
    if m.parent
        .status()
        .compare_exchange(d, Shared::null(), Ordering::SeqCst, Ordering::SeqCst, guard)
        .is_ok()
    {
        dec_ref(child, guard);
        // Unless the child pins the descriptor (it does when step 2 ran and the child will
        // take the descriptor to the grave with it), the release was its last reference.
        let pinned = child.deref().kind.is_branch()
            && child.deref().status.load(Ordering::SeqCst, guard) == d;
        if !pinned {
            let raw = d.as_raw();
            guard.defer_unchecked(move || drop(Owned::from_raw(raw as *mut Desc<C>)));
        }
    }
    true
}

/// Replays the rollback of an aborted descriptor: unpin the child, release the parent, in the
/// reverse of the acquisition order. Idempotent.
unsafe fn finish_abort<C: Config>(d: Shared<'_, Desc<C>>, m: &Mutate<C>, guard: &Guard) -> bool {
    let child = Shared::<'_, Node<C>>::from(m.child);
    if child.deref().kind.is_branch() {
        let _ = child.deref().status.compare_exchange(
            d,
            Shared::null(),
            Ordering::SeqCst,
            Ordering::SeqCst,
            guard,
        );
    }
    if m.parent
        .status()
        .compare_exchange(d, Shared::null(), Ordering::SeqCst, Ordering::SeqCst, guard)
        .is_ok()
    {
        // Nothing references an aborted descriptor once the parent lets go.
        let raw = d.as_raw();
        guard.defer_unchecked(move || drop(Owned::from_raw(raw as *mut Desc<C>)));
    }
    false
}

/// Drives a mutation descriptor to its terminal state. Any thread may call this any number of
/// times; the result is whether the descriptor committed.
///
/// The recursion through `help` is bounded by the number of in-flight descriptors (they order
/// parent before child, so the chains cannot cycle), not by the trie depth.
unsafe fn complete_mutate<C: Config>(d: Shared<'_, Desc<C>>, guard: &Guard) -> bool {
    let m = match d.deref() {
        Desc::Mutate(m) => m,
        Desc::Snap(_) => unreachable!("BUG: mutation completion over a snapshot descriptor"),
    };
    let child = Shared::<'_, Node<C>>::from(m.child);
    loop {
        if m.parent.status().load(Ordering::SeqCst, guard) != d {
            // Past the release (or the rollback); the decision is final.
            return m.decision.load(Ordering::SeqCst) == COMMITTED;
        }
        match m.decision.load(Ordering::SeqCst) {
            COMMITTED => return finish_commit(d, m, guard),
            ABORTED => return finish_abort(d, m, guard),
            _ => (),
        }

        // Step 2: pin the old child if it is a branch. Leaves cannot change, so there is
        // nothing to pin on them.
        if child.deref().kind.is_branch() {
            let child_status = child.deref().status.load(Ordering::SeqCst, guard);
            if child_status.is_null() {
                let _ = child.deref().status.compare_exchange(
                    Shared::null(),
                    d,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                continue;
            }
            if child_status != d {
                if m.parent.cell(m.index).load(Ordering::SeqCst, guard) != child {
                    // The slot moved on before we got hold of anything; the install race is
                    // lost. Unless a fellow helper already committed us, that is.
                    let verdict = decide(m, ABORTED);
                    return if verdict == COMMITTED {
                        finish_commit(d, m, guard)
                    } else {
                        finish_abort(d, m, guard)
                    };
                }
                match child_status.deref() {
                    Desc::Mutate(other) => match other.decision.load(Ordering::SeqCst) {
                        COMMITTED if other.child == child.as_raw() => {
                            // The child was evicted from a sibling trie (snapshots share
                            // subtrees) and its status is pinned for good. It can never change
                            // again, which is everything the pinning would buy us ‒ go on
                            // without it.
                        }
                        COMMITTED => {
                            // A committed descriptor in a child's status either pinned it
                            // (handled above) or installed it, and an installed child has its
                            // status wiped before the parent edge can ever be copied.
                            unreachable!("BUG: installed child still wears its descriptor")
                        }
                        ABORTED => {
                            // Help the aborted owner let go of the child.
                            let _ = child.deref().status.compare_exchange(
                                child_status,
                                Shared::null(),
                                Ordering::SeqCst,
                                Ordering::SeqCst,
                                guard,
                            );
                            continue;
                        }
                        _ => {
                            // In flight ‒ its parent word is still taken, so it is safe to
                            // walk into and help.
                            complete_mutate(child_status, guard);
                            continue;
                        }
                    },
                    Desc::Snap(_) => {
                        unreachable!("BUG: snapshot descriptor pinned to a branch")
                    }
                }
            }
        }

        // Decision time. We hold every word the commit needs; check that the world is still
        // the one the descriptor was made for. A failed generation check means the trie was
        // snapshotted under us and the whole walk must restart against the new generation.
        let applicable = (*m.root).gen.load(Ordering::SeqCst) == m.gen.0
            && m.parent.cell(m.index).load(Ordering::SeqCst, guard) == child
            && recipe_applies(m, child.deref(), guard);
        let verdict = decide(m, if applicable { COMMITTED } else { ABORTED });
        return if verdict == COMMITTED {
            finish_commit(d, m, guard)
        } else {
            finish_abort(d, m, guard)
        };
    }
}

/// Drives a snapshot descriptor to its terminal state. Idempotent, any thread.
unsafe fn complete_snap<C: Config>(d: Shared<'_, Desc<C>>, guard: &Guard) {
    let s = match d.deref() {
        Desc::Snap(s) => s,
        Desc::Mutate(_) => unreachable!("BUG: snapshot completion over a mutation descriptor"),
    };
    let root = &*s.root;
    if root.status.load(Ordering::SeqCst, guard) != d {
        return;
    }
    // The generation is stable while the root status is taken, so all helpers agree on this
    // verdict. A mismatch means the descriptor was built against an already flipped root; it
    // then steps aside without publishing anything and the caller goes again.
    if root.gen.load(Ordering::SeqCst) == s.old_gen.0 {
        // The subtree cannot move while the root status is taken ‒ this read *is* the
        // snapshot.
        let child = root.child.load(Ordering::SeqCst, guard);
        if s.frozen.load(Ordering::SeqCst, guard).is_null() {
            child.deref().refs.fetch_add(1, Ordering::SeqCst);
            let frozen = Owned::new(Root {
                status: Atomic::null(),
                child: cell_from(child),
                gen: AtomicU64::new(s.new_snap_gen.0),
            });
            if let Err(e) = s.frozen.compare_exchange(
                Shared::null(),
                frozen,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                dec_ref(child, guard);
                drop(e.new);
            }
        }
        // Move the live root to its next generation. Writers re-validate against this word,
        // so from here on every walk re-copies what it touches.
        let _ = root
            .gen
            .compare_exchange(s.old_gen.0, s.new_trie_gen.0, Ordering::SeqCst, Ordering::SeqCst);
    }
    if root
        .status
        .compare_exchange(d, Shared::null(), Ordering::SeqCst, Ordering::SeqCst, guard)
        .is_ok()
    {
        let raw = d.as_raw();
        guard.defer_unchecked(move || drop(Owned::from_raw(raw as *mut Desc<C>)));
    }
}

// ---------- the map engine ----------

/// What a write walk decided, before the operation-specific wrappers translate it.
enum Done<'r, C: Config> {
    /// Installed a new pair; there was no previous one.
    Installed,
    /// Replaced or removed this previous payload.
    Previous(&'r C::Payload),
    /// Found this payload and left it alone (`put_if_absent` on a present key).
    Found(&'r C::Payload),
    /// The conditional check failed against the present payload.
    Mismatch,
    /// The key is not in the map.
    Absent,
}

/// The payload-carrying write operations that share one walk.
enum WriteOp<C: Config> {
    Insert(C::Payload),
    PutIfAbsent(C::Payload),
    Replace(C::Payload),
}

impl<C: Config> WriteOp<C> {
    fn payload(&self) -> &C::Payload {
        match self {
            WriteOp::Insert(p) | WriteOp::PutIfAbsent(p) | WriteOp::Replace(p) => p,
        }
    }

    fn key(&self) -> &C::Key {
        self.payload().borrow()
    }
}

/// The raw snapshotting hash trie.
///
/// This provides the low level data structure: lock-free operations on payloads described by
/// the [`Config`] type parameter, without a user friendly interface. It is designed to keep
/// the single implementation of the core algorithm in one place and let thin wrappers dress it
/// up for different use cases.
///
/// As a general rule, the structure takes a [`crossbeam_epoch`] [`Guard`] and returns borrowed
/// payloads valid for that guard ‒ even operations that remove something return borrows,
/// because other threads might still be reading the removed node until the epoch turns.
pub struct Raw<C: Config, S> {
    hash_builder: S,
    // Owned, but raw: helpers of a freshly finished descriptor may still look at the root for
    // a moment after the owning operation returned, so the drop goes through the epoch.
    root: *const Root<C>,
    _payload: PhantomData<C::Payload>,
}

// The descriptors inside the trie carry raw pointers, which kills the auto traits. The
// structure itself hands out nothing but shared references to payloads and keeps every pointer
// under the epoch discipline.
unsafe impl<C, S> Send for Raw<C, S>
where
    C: Config,
    C::Payload: Send + Sync,
    S: Send,
{
}

unsafe impl<C, S> Sync for Raw<C, S>
where
    C: Config,
    C::Payload: Send + Sync,
    S: Sync,
{
}

impl<C, S> Raw<C, S>
where
    C: Config,
    S: BuildHasher,
{
    /// Constructs an empty trie from the given hasher.
    pub fn with_hasher(hash_builder: S) -> Self {
        let gen = Gen::fresh();
        let empty = Node::branch(gen, 0, Vec::new().into_boxed_slice());
        Self {
            hash_builder,
            root: Box::into_raw(Box::new(Root {
                status: Atomic::null(),
                child: Atomic::new(empty),
                gen: AtomicU64::new(gen.0),
            })),
            _payload: PhantomData,
        }
    }

    /// Access to the hasher.
    pub fn hash_builder(&self) -> &S {
        &self.hash_builder
    }

    fn root(&self) -> &Root<C> {
        // Alive as long as self is (and a bit longer, thanks to the deferred drop).
        unsafe { &*self.root }
    }

    /// Computes a hash (using the stored hasher) of a key.
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let mut hasher = self.hash_builder.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Looks up a value.
    ///
    /// A pure read: it installs nothing, refreshes nothing and doesn't help anyone. Reading a
    /// stale-generation branch is fine ‒ the lookup then linearizes before whatever write is
    /// busy re-copying that path.
    pub fn get<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
    {
        let hash = self.hash(key);
        let mut shift = 0;
        let mut node = self.root().child.load(Ordering::SeqCst, pin);
        loop {
            match unsafe { &node.deref().kind } {
                NodeKind::Branch {
                    bitmap, children, ..
                } => {
                    let s = slot(hash, shift);
                    if bitmap & (1 << s) == 0 {
                        return None;
                    }
                    node = children[position(*bitmap, s)].load(Ordering::SeqCst, pin);
                    shift += LEVEL_BITS;
                }
                NodeKind::Single(payload) => {
                    return if payload.borrow().borrow() == key {
                        Some(payload)
                    } else {
                        None
                    };
                }
                NodeKind::Collisions(pairs) => {
                    return pairs.iter().find(|p| (*p).borrow().borrow() == key);
                }
            }
        }
    }

    /// Inserts a new payload, replacing and returning any previously held one.
    pub fn insert<'s, 'p, 'r>(
        &'s self,
        payload: C::Payload,
        pin: &'p Guard,
    ) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
    {
        match self.traverse(WriteOp::Insert(payload), |_| true, pin) {
            Done::Installed => None,
            Done::Previous(p) => Some(p),
            _ => unreachable!("BUG: insert neither installed nor replaced"),
        }
    }

    /// Inserts the payload only if its key is absent.
    ///
    /// Returns the already present payload if there was one (and then nothing was changed).
    pub fn put_if_absent<'s, 'p, 'r>(
        &'s self,
        payload: C::Payload,
        pin: &'p Guard,
    ) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
    {
        match self.traverse(WriteOp::PutIfAbsent(payload), |_| true, pin) {
            Done::Installed => None,
            Done::Found(p) => Some(p),
            _ => unreachable!("BUG: put_if_absent neither installed nor found"),
        }
    }

    /// Replaces the payload under its key, but only when the present one passes the check.
    ///
    /// The check runs against the immutable present leaf; the commit verifies that very leaf
    /// is still in place, so the check cannot go stale.
    pub fn replace<'s, 'p, 'r, F>(
        &'s self,
        payload: C::Payload,
        check: F,
        pin: &'p Guard,
    ) -> Conditional<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        F: Fn(&C::Payload) -> bool,
    {
        match self.traverse(WriteOp::Replace(payload), check, pin) {
            Done::Previous(p) => Conditional::Applied(p),
            Done::Mismatch => Conditional::Mismatch,
            Done::Absent => Conditional::Absent,
            _ => unreachable!("BUG: replace installed a missing key"),
        }
    }

    /// Removes the payload under the key, returning it if it was there.
    pub fn remove<'r, 's, 'p, Q>(&'s self, key: &Q, pin: &'p Guard) -> Option<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
    {
        match self.remove_walk(key, |_| true, pin) {
            Done::Previous(p) => Some(p),
            Done::Absent => None,
            _ => unreachable!("BUG: remove ended in an impossible state"),
        }
    }

    /// Removes the payload under the key, but only when the present one passes the check.
    pub fn remove_if<'r, 's, 'p, Q, F>(
        &'s self,
        key: &Q,
        check: F,
        pin: &'p Guard,
    ) -> Conditional<&'r C::Payload>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        F: Fn(&C::Payload) -> bool,
    {
        match self.remove_walk(key, check, pin) {
            Done::Previous(p) => Conditional::Applied(p),
            Done::Mismatch => Conditional::Mismatch,
            Done::Absent => Conditional::Absent,
            _ => unreachable!("BUG: remove_if ended in an impossible state"),
        }
    }

    /// Takes an O(1) snapshot: a new, fully independent trie sharing the current subtree.
    ///
    /// Both the live trie and the returned one keep working; they re-copy the shared branches
    /// lazily as writes touch them. The hasher is cloned, so clones must hash the same way
    /// (every sane `BuildHasher` does).
    pub fn snapshot(&self, pin: &Guard) -> Self
    where
        S: Clone,
    {
        unsafe {
            loop {
                let snap = Owned::new(Desc::Snap(Snap {
                    root: self.root,
                    old_gen: Gen(self.root().gen.load(Ordering::SeqCst)),
                    new_trie_gen: Gen::fresh(),
                    new_snap_gen: Gen::fresh(),
                    frozen: Atomic::null(),
                }))
                .into_shared(pin);
                match self.root().status.compare_exchange(
                    Shared::null(),
                    snap,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    pin,
                ) {
                    Ok(_) => {
                        complete_snap(snap, pin);
                        let s = match snap.deref() {
                            Desc::Snap(s) => s,
                            Desc::Mutate(_) => unreachable!("BUG: snapshot turned into a mutation"),
                        };
                        let frozen = s.frozen.load(Ordering::SeqCst, pin);
                        if frozen.is_null() {
                            // The generation moved between reading it and taking the root;
                            // the descriptor refused to publish. Go again.
                            continue;
                        }
                        return Raw {
                            hash_builder: self.hash_builder.clone(),
                            root: frozen.as_raw(),
                            _payload: PhantomData,
                        };
                    }
                    Err(e) => {
                        help(e.current, pin);
                        drop(e.new);
                    }
                }
            }
        }
    }

    /// Allocates a mutation descriptor for replacing `child` under `parent[index]`.
    fn mutate_desc(
        &self,
        gen: Gen,
        parent: Parent<C>,
        index: usize,
        child: Shared<'_, Node<C>>,
        recipe: Recipe<C>,
    ) -> Owned<Desc<C>> {
        Owned::new(Desc::Mutate(Mutate {
            root: self.root,
            gen,
            parent,
            index,
            child: child.as_raw(),
            recipe,
            new_child: Atomic::null(),
            decision: AtomicU8::new(PENDING),
        }))
    }

    /// Publishes the descriptor into its parent's status and drives it to the end.
    ///
    /// `false` means nothing happened (a lost race or an aborted descriptor) and the caller
    /// restarts its walk from the root.
    unsafe fn engage(&self, desc: Owned<Desc<C>>, pin: &Guard) -> bool {
        let d = desc.into_shared(pin);
        let m = match d.deref() {
            Desc::Mutate(m) => m,
            Desc::Snap(_) => unreachable!("BUG: engage over a snapshot descriptor"),
        };
        // A prebuilt replacement enters the world already owned by its descriptor.
        if let Recipe::Ready(node) = &m.recipe {
            node.load(Ordering::SeqCst, pin).deref().status.store(d, Ordering::SeqCst);
        }
        match m.parent.status().compare_exchange(
            Shared::null(),
            d,
            Ordering::SeqCst,
            Ordering::SeqCst,
            pin,
        ) {
            Ok(_) => {
                let committed = complete_mutate(d, pin);
                if !committed {
                    // An aborted descriptor never consumed its prebuilt node.
                    if let Recipe::Ready(node) = &m.recipe {
                        discard_unpublished(node.load(Ordering::SeqCst, pin), pin);
                    }
                    // The descriptor itself is retired by whoever rolled the parent back.
                }
                committed
            }
            Err(e) => {
                help(e.current, pin);
                // Ours was never published; take it back apart on the spot.
                if let Recipe::Ready(node) = &m.recipe {
                    discard_unpublished(node.load(Ordering::SeqCst, pin), pin);
                }
                drop(d.into_owned());
                false
            }
        }
    }

    /// The write walk shared by the payload-carrying operations.
    fn traverse<'s, 'p, 'r, F>(
        &'s self,
        op: WriteOp<C>,
        check: F,
        pin: &'p Guard,
    ) -> Done<'r, C>
    where
        's: 'r,
        'p: 'r,
        F: Fn(&C::Payload) -> bool,
    {
        let hash = self.hash(op.key());
        'restart: loop {
            let gen = Gen(self.root().gen.load(Ordering::SeqCst));
            let mut parent = Parent::Root(self.root);
            let mut index = 0;
            let mut shift = 0;
            loop {
                let node = unsafe { parent.cell(index) }.load(Ordering::SeqCst, pin);
                let node_ref = unsafe { node.deref() };
                let (node_gen, bitmap, children) = match &node_ref.kind {
                    NodeKind::Branch {
                        gen,
                        bitmap,
                        children,
                    } => (*gen, *bitmap, children),
                    // A concurrent contraction slid a leaf into this cell under us; the walk
                    // context no longer matches, so start over.
                    _ => continue 'restart,
                };
                if node_gen != gen {
                    // Stale generation ‒ re-copy before going any deeper.
                    let desc = self.mutate_desc(gen, parent, index, node, Recipe::Refresh);
                    if unsafe { self.engage(desc, pin) } {
                        continue;
                    }
                    continue 'restart;
                }
                let s = slot(hash, shift);
                if bitmap & (1 << s) == 0 {
                    // Nothing under this slot.
                    match op {
                        WriteOp::Replace(_) => return Done::Absent,
                        WriteOp::Insert(_) | WriteOp::PutIfAbsent(_) => {
                            let recipe = Recipe::Expand {
                                slot: s,
                                payload: op.payload().clone(),
                            };
                            let desc = self.mutate_desc(gen, parent, index, node, recipe);
                            if unsafe { self.engage(desc, pin) } {
                                return Done::Installed;
                            }
                            continue 'restart;
                        }
                    }
                }
                let pos = position(bitmap, s);
                let sub = children[pos].load(Ordering::SeqCst, pin);
                let sub_ref = unsafe { sub.deref() };
                match &sub_ref.kind {
                    NodeKind::Branch { .. } => {
                        parent = Parent::Branch(node.as_raw());
                        index = pos;
                        shift += LEVEL_BITS;
                    }
                    NodeKind::Single(found) => {
                        if found.borrow() == op.key() {
                            match &op {
                                WriteOp::PutIfAbsent(_) => return Done::Found(found),
                                WriteOp::Replace(_) if !check(found) => return Done::Mismatch,
                                WriteOp::Insert(_) | WriteOp::Replace(_) => (),
                            }
                            let ready = Owned::new(Node::single(op.payload().clone()));
                            let desc = self.mutate_desc(
                                gen,
                                Parent::Branch(node.as_raw()),
                                pos,
                                sub,
                                Recipe::Ready(Atomic::from(ready)),
                            );
                            if unsafe { self.engage(desc, pin) } {
                                return Done::Previous(found);
                            }
                            continue 'restart;
                        }
                        match op {
                            WriteOp::Replace(_) => return Done::Absent,
                            WriteOp::Insert(_) | WriteOp::PutIfAbsent(_) => (),
                        }
                        // Two different keys share this slot so far; grow the path under it
                        // until their hashes part ways (or run out).
                        let other_hash = self.hash(found.borrow());
                        let chain = build_chain(
                            gen,
                            shift + LEVEL_BITS,
                            found.clone(),
                            other_hash,
                            op.payload().clone(),
                            hash,
                        );
                        let desc = self.mutate_desc(
                            gen,
                            Parent::Branch(node.as_raw()),
                            pos,
                            sub,
                            Recipe::Ready(Atomic::from(chain)),
                        );
                        if unsafe { self.engage(desc, pin) } {
                            return Done::Installed;
                        }
                        continue 'restart;
                    }
                    NodeKind::Collisions(pairs) => {
                        let found = pairs.iter().position(|p| p.borrow() == op.key());
                        match (&op, found) {
                            (WriteOp::PutIfAbsent(_), Some(i)) => return Done::Found(&pairs[i]),
                            (WriteOp::Replace(_), None) => return Done::Absent,
                            (WriteOp::Replace(_), Some(i)) if !check(&pairs[i]) => {
                                return Done::Mismatch;
                            }
                            _ => (),
                        }
                        let mut new_pairs = SmallVec::with_capacity(
                            pairs.len() + if found.is_some() { 0 } else { 1 },
                        );
                        new_pairs.extend(
                            pairs
                                .iter()
                                .filter(|p| (*p).borrow() != op.key())
                                .cloned(),
                        );
                        new_pairs.push(op.payload().clone());
                        let ready = Owned::new(Node::collisions(new_pairs));
                        let desc = self.mutate_desc(
                            gen,
                            Parent::Branch(node.as_raw()),
                            pos,
                            sub,
                            Recipe::Ready(Atomic::from(ready)),
                        );
                        if unsafe { self.engage(desc, pin) } {
                            return match found {
                                Some(i) => Done::Previous(&pairs[i]),
                                None => Done::Installed,
                            };
                        }
                        continue 'restart;
                    }
                }
            }
        }
    }

    /// The walk shared by `remove` and `remove_if`.
    fn remove_walk<'s, 'p, 'r, Q, F>(&'s self, key: &Q, check: F, pin: &'p Guard) -> Done<'r, C>
    where
        's: 'r,
        'p: 'r,
        Q: ?Sized + Eq + Hash,
        C::Key: Borrow<Q>,
        F: Fn(&C::Payload) -> bool,
    {
        let hash = self.hash(key);
        'restart: loop {
            let gen = Gen(self.root().gen.load(Ordering::SeqCst));
            let mut parent = Parent::Root(self.root);
            let mut index = 0;
            let mut shift = 0;
            loop {
                let node = unsafe { parent.cell(index) }.load(Ordering::SeqCst, pin);
                let node_ref = unsafe { node.deref() };
                let (node_gen, bitmap, children) = match &node_ref.kind {
                    NodeKind::Branch {
                        gen,
                        bitmap,
                        children,
                    } => (*gen, *bitmap, children),
                    _ => continue 'restart,
                };
                if node_gen != gen {
                    let desc = self.mutate_desc(gen, parent, index, node, Recipe::Refresh);
                    if unsafe { self.engage(desc, pin) } {
                        continue;
                    }
                    continue 'restart;
                }
                let s = slot(hash, shift);
                if bitmap & (1 << s) == 0 {
                    return Done::Absent;
                }
                let pos = position(bitmap, s);
                let sub = children[pos].load(Ordering::SeqCst, pin);
                let sub_ref = unsafe { sub.deref() };
                match &sub_ref.kind {
                    NodeKind::Branch { .. } => {
                        parent = Parent::Branch(node.as_raw());
                        index = pos;
                        shift += LEVEL_BITS;
                    }
                    NodeKind::Single(found) => {
                        if found.borrow().borrow() != key {
                            return Done::Absent;
                        }
                        if !check(found) {
                            return Done::Mismatch;
                        }
                        // Taking a pair out means clearing its bit, which is a new branch in
                        // the parent's slot.
                        let recipe = Recipe::Shrink {
                            slot: s,
                            victim: sub.as_raw(),
                        };
                        let desc = self.mutate_desc(gen, parent, index, node, recipe);
                        if unsafe { self.engage(desc, pin) } {
                            return Done::Previous(found);
                        }
                        continue 'restart;
                    }
                    NodeKind::Collisions(pairs) => {
                        let found = match pairs.iter().position(|p| (*p).borrow().borrow() == key)
                        {
                            Some(i) => i,
                            None => return Done::Absent,
                        };
                        if !check(&pairs[found]) {
                            return Done::Mismatch;
                        }
                        // The bitmap stays; the collision leaf just gets smaller (down to a
                        // plain `Single` once only one pair is left).
                        let rest = pairs
                            .iter()
                            .enumerate()
                            .filter(|(i, _)| *i != found)
                            .map(|(_, p)| p.clone())
                            .collect::<SmallVec<[C::Payload; 2]>>();
                        let ready = if rest.len() == 1 {
                            let mut rest = rest;
                            Owned::new(Node::single(rest.pop().expect("just checked the length")))
                        } else {
                            Owned::new(Node::collisions(rest))
                        };
                        let desc = self.mutate_desc(
                            gen,
                            Parent::Branch(node.as_raw()),
                            pos,
                            sub,
                            Recipe::Ready(Atomic::from(ready)),
                        );
                        if unsafe { self.engage(desc, pin) } {
                            return Done::Previous(&pairs[found]);
                        }
                        continue 'restart;
                    }
                }
            }
        }
    }
}

/// Builds the branch path distinguishing two payloads whose hashes agree up to `shift`,
/// stamped with the walk's generation. Ends in a collision leaf if the hashes never part.
fn build_chain<C: Config>(
    gen: Gen,
    shift: usize,
    a: C::Payload,
    hash_a: u64,
    b: C::Payload,
    hash_b: u64,
) -> Owned<Node<C>> {
    if shift >= HASH_BITS {
        let mut pairs = SmallVec::new();
        pairs.push(a);
        pairs.push(b);
        return Owned::new(Node::collisions(pairs));
    }
    let slot_a = slot(hash_a, shift);
    let slot_b = slot(hash_b, shift);
    if slot_a == slot_b {
        let below = build_chain(gen, shift + LEVEL_BITS, a, hash_a, b, hash_b);
        let children = vec![Atomic::from(below)].into_boxed_slice();
        Owned::new(Node::branch(gen, 1 << slot_a, children))
    } else {
        let (first, second) = if slot_a < slot_b { (a, b) } else { (b, a) };
        let children = vec![
            Atomic::new(Node::single(first)),
            Atomic::new(Node::single(second)),
        ]
        .into_boxed_slice();
        Owned::new(Node::branch(gen, (1 << slot_a) | (1 << slot_b), children))
    }
}

impl<C: Config, S> Drop for Raw<C, S> {
    fn drop(&mut self) {
        // We hold the last handle, so no operation is in flight on this trie. The subtree may
        // still be shared with snapshots (and their readers), which is exactly what the edge
        // counts and the epoch deferral sort out. The root itself goes through the epoch too:
        // helpers of a just-finished descriptor may still glance at it.
        let pin = epoch::pin();
        let root = self.root;
        unsafe {
            let child = (*root).child.load(Ordering::Relaxed, &pin);
            debug_assert!(
                (*root).status.load(Ordering::Relaxed, &pin).is_null(),
                "BUG: dropping a trie with a descriptor on the root"
            );
            dec_ref(child, &pin);
            pin.defer_unchecked(move || drop(Box::from_raw(root as *mut Root<C>)));
        }
    }
}
