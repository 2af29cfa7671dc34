//! Intrusive, circular, doubly linked list.
//!
//! Instead of raw pointers, nodes refer to each other by index. Whoever owns
//! the nodes implements [`Links`], mapping an index to the [`ListNode`]
//! embedded in one of its records. A list is then just a node that is used as
//! the head, and every operation is provided by the [`Links`] trait.
//!
//! A node is never dangling: a standalone node links to itself, so a list head
//! is empty if its `next` points back to the head.

/// The link part of any record that can be put on a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListNode {
    next: usize,
    prev: usize,
}

impl ListNode {
    /// Create a standalone node that lives at index `at`.
    pub const fn standalone(at: usize) -> Self {
        Self { next: at, prev: at }
    }

    /// The index of the node after this one.
    pub fn next(&self) -> usize {
        self.next
    }

    /// The index of the node before this one.
    pub fn prev(&self) -> usize {
        self.prev
    }
}

/// Access to the nodes of a set of lists.
///
/// Implementors only have to provide [`node`](Links::node) and
/// [`node_mut`](Links::node_mut). Both should panic if `at` does not name a
/// node that is currently allowed to be linked.
pub trait Links {
    /// Return the node at index `at`.
    fn node(&self, at: usize) -> &ListNode;

    /// Return the node at index `at` mutably.
    fn node_mut(&mut self, at: usize) -> &mut ListNode;

    /// Reset the node at `at` to a standalone node.
    fn init(&mut self, at: usize) {
        *self.node_mut(at) = ListNode::standalone(at);
    }

    /// Check if the node at `at` links to nothing but itself.
    ///
    /// For a list head this means that the list is empty.
    fn is_empty(&self, at: usize) -> bool {
        let node = self.node(at);
        node.next == at && node.prev == at
    }

    /// Splice the node `at` into the list directly after `anchor`.
    fn insert_after(&mut self, anchor: usize, at: usize) {
        debug_assert_ne!(anchor, at, "can't insert a node after itself");
        debug_assert!(self.is_empty(at), "node {} is already linked", at);

        let next = self.node(anchor).next;
        *self.node_mut(at) = ListNode { next, prev: anchor };
        self.node_mut(next).prev = at;
        self.node_mut(anchor).next = at;
    }

    /// Splice the node `at` into the list directly before `anchor`.
    fn insert_before(&mut self, anchor: usize, at: usize) {
        let prev = self.node(anchor).prev;
        self.insert_after(prev, at);
    }

    /// Unlink the node `at` from whatever list it is on.
    ///
    /// The node is standalone afterwards and can be inserted again.
    fn remove(&mut self, at: usize) {
        let ListNode { next, prev } = *self.node(at);
        self.node_mut(prev).next = next;
        self.node_mut(next).prev = prev;
        self.init(at);
    }

    /// Return the first node of the list headed by `head`.
    fn first(&self, head: usize) -> Option<usize> {
        let next = self.node(head).next;
        (next != head).then(|| next)
    }

    /// Return an iterator over the indices of every node in the list headed by `head`.
    fn iter(&self, head: usize) -> Iter<'_, Self> {
        Iter {
            links: self,
            head,
            cur: self.node(head).next,
        }
    }
}

/// Iterator over the node indices of a single list, excluding the head.
pub struct Iter<'links, L: ?Sized> {
    links: &'links L,
    head: usize,
    cur: usize,
}

impl<L: Links + ?Sized> Iterator for Iter<'_, L> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur == self.head {
            return None;
        }

        let item = self.cur;
        self.cur = self.links.node(item).next;
        Some(item)
    }
}
