//! Shared union-find structures for the SCC-based algorithms.
//!
//! [`UnionFind`] backs UFSCC: every set carries the workers that visit it,
//! an accepting flag and a cyclic list of states whose successors are not
//! yet fully explored. Roots are locked during a union, smallest reference
//! first. [`RenaultUnionFind`] is the lighter lock-free variant used by
//! Renault's algorithm, which only needs to share completed components.

use crate::core::atomics::cas;
use crate::store::Ref;
use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

const UF_UNSEEN: u8 = 0;
const UF_INIT: u8 = 1;
const UF_LIVE: u8 = 2;
const UF_LOCKED: u8 = 3;
const UF_DEAD: u8 = 4;

const LIST_LIVE: u8 = 0;
const LIST_BUSY: u8 = 1;
const LIST_REMOVED: u8 = 2;

/// Result of [`UnionFind::make_claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The caller created the state
    First,
    /// The caller joined a live set it had not visited before
    Success,
    /// The caller already visits the state's set
    Found,
    /// The state's component is complete
    Dead,
}

/// Result of [`UnionFind::pick_from_list`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pick {
    /// A state of the set still has unexplored successors
    Live(Ref),
    /// The list was empty and this call marked the set dead
    MarkedDead,
    /// The list was empty and the set was already dead
    Dead,
}

#[derive(Debug, Default)]
struct UfNode {
    parent: AtomicUsize,
    list_next: AtomicUsize,
    w_set: AtomicU64,
    rank: AtomicU8,
    uf_status: AtomicU8,
    list_status: AtomicU8,
    accepting: AtomicBool,
}

pub struct UnionFind {
    nodes: Box<[UfNode]>,
}

impl UnionFind {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: (0..capacity).map(|_| UfNode::default()).collect(),
        }
    }

    fn status(&self, r: Ref) -> u8 {
        self.nodes[r].uf_status.load(Ordering::Acquire)
    }

    fn parent(&self, r: Ref) -> Ref {
        self.nodes[r].parent.load(Ordering::Acquire)
    }

    pub fn is_unseen(&self, r: Ref) -> bool {
        self.status(r) == UF_UNSEEN
    }

    /// Claim `r` for `worker`, creating it when unseen
    pub fn make_claim(&self, r: Ref, worker: usize, accepting: bool) -> Claim {
        let w_id = 1u64 << worker;
        let node = &self.nodes[r];
        if cas(&node.uf_status, UF_UNSEEN, UF_INIT) {
            node.parent.store(r, Ordering::Release);
            node.list_next.store(r, Ordering::Release);
            node.w_set.store(w_id, Ordering::Release);
            node.accepting.store(accepting, Ordering::Release);
            node.uf_status.store(UF_LIVE, Ordering::Release);
            return Claim::First;
        }
        let backoff = Backoff::new();
        while self.status(r) == UF_INIT {
            backoff.snooze();
        }

        let mut f = self.find(r);
        if self.status(f) == UF_DEAD {
            return Claim::Dead;
        }
        if self.nodes[f].w_set.load(Ordering::Acquire) & w_id != 0 {
            return Claim::Found;
        }
        self.nodes[f].w_set.fetch_or(w_id, Ordering::AcqRel);
        while self.parent(f) != f || self.status(f) == UF_LOCKED {
            f = self.parent(f);
            self.nodes[f].w_set.fetch_or(w_id, Ordering::AcqRel);
            if self.status(f) == UF_DEAD {
                return Claim::Dead;
            }
            backoff.spin();
        }
        Claim::Success
    }

    /// Representative of `r`'s set, compressing the path on the way
    pub fn find(&self, r: Ref) -> Ref {
        let mut root = r;
        loop {
            let parent = self.parent(root);
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut cur = r;
        while cur != root {
            let next = self.parent(cur);
            if next == root {
                break;
            }
            let _ = self.nodes[cur]
                .parent
                .compare_exchange(next, root, Ordering::AcqRel, Ordering::Acquire);
            cur = next;
        }
        root
    }

    pub fn sameset(&self, a: Ref, b: Ref) -> bool {
        let (mut a, mut b) = (a, b);
        loop {
            let a_f = self.find(a);
            let b_f = self.find(b);
            let a_p = self.parent(a_f);
            let b_p = self.parent(b_f);
            if a_f != a_p
                || b_f != b_p
                || self.status(a_f) == UF_LOCKED
                || self.status(b_f) == UF_LOCKED
            {
                a = a_p;
                b = b_p;
                std::hint::spin_loop();
                continue;
            }
            return a_f == b_f;
        }
    }

    pub fn is_dead(&self, r: Ref) -> bool {
        self.status(self.find(r)) == UF_DEAD
    }

    /// The set of `r` contains an accepting state
    pub fn is_accepting(&self, r: Ref) -> bool {
        self.nodes[self.find(r)].accepting.load(Ordering::Acquire)
    }

    /// Returns `true` when this call marked the set dead
    pub fn mark_dead(&self, r: Ref) -> bool {
        let mut marked = false;
        let mut f = self.find(r);
        while !self.is_dead(f) {
            f = self.find(f);
            if self.status(f) == UF_LIVE {
                marked = cas(&self.nodes[f].uf_status, UF_LIVE, UF_DEAD);
            } else {
                std::hint::spin_loop();
            }
        }
        marked
    }

    pub fn is_in_list(&self, r: Ref) -> bool {
        self.nodes[r].list_status.load(Ordering::Acquire) != LIST_REMOVED
    }

    /// Find a state of `r`'s set that is still in the list, unlinking
    /// removed entries on the way. The set dies when none is left.
    pub fn pick_from_list(&self, r: Ref) -> Pick {
        if self.is_dead(r) {
            return Pick::Dead;
        }
        let mut s = r;
        let mut n1 = self.nodes[s].list_next.load(Ordering::Acquire);
        while self.nodes[n1].list_status.load(Ordering::Acquire) == LIST_REMOVED {
            let n2 = self.nodes[n1].list_next.load(Ordering::Acquire);
            if n1 == n2 {
                return self.pick_dead(s);
            }
            // keep merges off `s` while its pointer moves
            let status = &self.nodes[s].list_status;
            let claimed = loop {
                if cas(status, LIST_LIVE, LIST_BUSY) {
                    break true;
                }
                if status.load(Ordering::Acquire) == LIST_REMOVED {
                    break false;
                }
                std::hint::spin_loop();
            };
            let _ = self.nodes[s]
                .list_next
                .compare_exchange(n1, n2, Ordering::AcqRel, Ordering::Acquire);
            if claimed {
                status.store(LIST_LIVE, Ordering::Release);
            }
            s = n1;
            n1 = self.nodes[s].list_next.load(Ordering::Acquire);
        }
        Pick::Live(n1)
    }

    fn pick_dead(&self, s: Ref) -> Pick {
        if self.mark_dead(s) {
            Pick::MarkedDead
        } else {
            Pick::Dead
        }
    }

    /// All successors of `r` are explored. Waits while a merge holds `r`.
    pub fn remove_from_list(&self, r: Ref) {
        let status = &self.nodes[r].list_status;
        let backoff = Backoff::new();
        loop {
            match status.load(Ordering::Acquire) {
                LIST_LIVE => {
                    if cas(status, LIST_LIVE, LIST_REMOVED) {
                        return;
                    }
                }
                LIST_REMOVED => return,
                _ => backoff.snooze(),
            }
        }
    }

    /// Mark a list entry of `x`'s set busy. The set of a locked root always
    /// keeps a live entry.
    fn lock_list_node(&self, mut x: Ref) -> Ref {
        while !cas(&self.nodes[x].list_status, LIST_LIVE, LIST_BUSY) {
            if let Pick::Live(next) = self.pick_from_list(x) {
                x = next;
            }
        }
        x
    }

    /// Splice the cyclic lists of locked roots `x` and `y`
    fn merge_list(&self, x: Ref, y: Ref) {
        let x = self.lock_list_node(x);
        let y = self.lock_list_node(y);
        let x_next = self.nodes[x].list_next.load(Ordering::Acquire);
        let y_next = self.nodes[y].list_next.load(Ordering::Acquire);
        self.nodes[x].list_next.store(y_next, Ordering::Release);
        self.nodes[y].list_next.store(x_next, Ordering::Release);
        self.nodes[x].list_status.store(LIST_LIVE, Ordering::Release);
        self.nodes[y].list_status.store(LIST_LIVE, Ordering::Release);
    }

    /// Lock both roots, smallest reference first. `false` when the states
    /// already share a set.
    fn lock(&self, x: Ref, y: Ref) -> bool {
        let backoff = Backoff::new();
        loop {
            let mut a = self.find(x);
            let mut b = self.find(y);
            if a == b {
                return false;
            }
            if a > b {
                std::mem::swap(&mut a, &mut b);
            }
            if cas(&self.nodes[a].uf_status, UF_LIVE, UF_LOCKED) {
                if self.parent(a) == a {
                    if cas(&self.nodes[b].uf_status, UF_LIVE, UF_LOCKED) {
                        if self.parent(b) == b {
                            return true;
                        }
                        self.nodes[b].uf_status.store(UF_LIVE, Ordering::Release);
                    }
                }
                self.nodes[a].uf_status.store(UF_LIVE, Ordering::Release);
            }
            backoff.spin();
        }
    }

    /// Unite the sets of `x` and `y`. Returns whether the resulting set
    /// contains an accepting state.
    pub fn union(&self, x: Ref, y: Ref) -> bool {
        if self.lock(x, y) {
            let x_f = self.find(x);
            let y_f = self.find(y);
            self.merge_list(x_f, y_f);

            let x_rank = self.nodes[x_f].rank.load(Ordering::Acquire);
            let y_rank = self.nodes[y_f].rank.load(Ordering::Acquire);
            let (root, other) = if x_rank > y_rank { (x_f, y_f) } else { (y_f, x_f) };
            let root_node = &self.nodes[root];
            let other_node = &self.nodes[other];
            root_node
                .w_set
                .fetch_or(other_node.w_set.load(Ordering::Acquire), Ordering::AcqRel);
            root_node
                .accepting
                .fetch_or(other_node.accepting.load(Ordering::Acquire), Ordering::AcqRel);
            other_node.parent.store(root, Ordering::Release);
            if x_rank == y_rank {
                root_node.rank.fetch_add(1, Ordering::AcqRel);
            }
            self.nodes[x_f].uf_status.store(UF_LIVE, Ordering::Release);
            self.nodes[y_f].uf_status.store(UF_LIVE, Ordering::Release);
        }
        self.is_accepting(x)
    }
}

const R_UNSEEN: u8 = 0;
const R_INIT: u8 = 1;
const R_LIVE: u8 = 2;
const R_DEAD: u8 = 3;

#[derive(Debug, Default)]
struct RenaultNode {
    parent: AtomicUsize,
    rank: AtomicU8,
    status: AtomicU8,
}

/// Lock-free union-find sharing completed components
pub struct RenaultUnionFind {
    nodes: Box<[RenaultNode]>,
}

impl RenaultUnionFind {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: (0..capacity).map(|_| RenaultNode::default()).collect(),
        }
    }

    fn parent(&self, r: Ref) -> Ref {
        self.nodes[r].parent.load(Ordering::Acquire)
    }

    /// Returns `true` for the caller that created `r`
    pub fn make_claim(&self, r: Ref) -> bool {
        let node = &self.nodes[r];
        if cas(&node.status, R_UNSEEN, R_INIT) {
            node.parent.store(r, Ordering::Release);
            node.status.store(R_LIVE, Ordering::Release);
            return true;
        }
        let backoff = Backoff::new();
        while node.status.load(Ordering::Acquire) == R_INIT {
            backoff.snooze();
        }
        false
    }

    pub fn find(&self, r: Ref) -> Ref {
        let mut root = r;
        loop {
            let parent = self.parent(root);
            if parent == root {
                break;
            }
            root = parent;
        }
        let mut cur = r;
        while cur != root {
            let next = self.parent(cur);
            if next != root {
                let _ = self.nodes[cur]
                    .parent
                    .compare_exchange(next, root, Ordering::AcqRel, Ordering::Acquire);
            }
            cur = next;
        }
        root
    }

    pub fn sameset(&self, a: Ref, b: Ref) -> bool {
        let (mut a, mut b) = (a, b);
        loop {
            let a_r = self.find(a);
            let b_r = self.find(b);
            if a_r == b_r {
                return true;
            }
            if self.parent(a_r) == a_r && self.parent(b_r) == b_r {
                return false;
            }
            a = a_r;
            b = b_r;
        }
    }

    pub fn union(&self, x: Ref, y: Ref) {
        let backoff = Backoff::new();
        loop {
            let x_f = self.find(x);
            let y_f = self.find(y);
            if x_f == y_f {
                return;
            }
            let x_rank = self.nodes[x_f].rank.load(Ordering::Acquire);
            let y_rank = self.nodes[y_f].rank.load(Ordering::Acquire);
            let (root, other) = if x_rank < y_rank || (x_rank == y_rank && y_f < x_f) {
                (y_f, x_f)
            } else {
                (x_f, y_f)
            };
            if !cas(&self.nodes[other].parent, other, root) {
                backoff.spin();
                continue;
            }
            if self.parent(root) != root {
                self.nodes[other].parent.store(other, Ordering::Release);
                backoff.spin();
                continue;
            }
            if x_rank == y_rank {
                self.nodes[root].rank.fetch_add(1, Ordering::AcqRel);
            }
            return;
        }
    }

    pub fn is_dead(&self, r: Ref) -> bool {
        match self.nodes[r].status.load(Ordering::Acquire) {
            R_UNSEEN | R_INIT => false,
            _ => self.nodes[self.find(r)].status.load(Ordering::Acquire) == R_DEAD,
        }
    }

    /// Returns `true` when this call marked the set dead
    pub fn mark_dead(&self, r: Ref) -> bool {
        let mut marked = false;
        while !self.is_dead(r) {
            let f = self.find(r);
            let status = self.nodes[f].status.load(Ordering::Acquire);
            if status != R_DEAD {
                marked = cas(&self.nodes[f].status, status, R_DEAD);
            }
        }
        marked
    }
}
