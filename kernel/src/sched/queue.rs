//! Intrusive FIFO queues for scheduler objects.
//!
//! Threads and processes each get their own queue type from the same
//! generic shape: a head/tail pair plus a spinlock, with the link fields
//! living inside the queued objects. An object can sit on at most one
//! queue at a time; its `in_queue` back-pointer is non-null exactly while
//! it is linked, which is what lets [`force_dequeue`] pull an object out
//! of whatever queue it is currently on.
//!
//! The lock guards only the queue's own head/tail and the link fields of
//! its members; callers lock explicitly and then use the unsafe unlocked
//! operations, mirroring how the scheduler composes queue moves with
//! status changes under one critical section.

use core::cell::Cell;
use core::ptr::NonNull;

use crate::sync::spinlock::SpinLock;

/// Implemented by objects that can be linked onto a [`Queue`].
pub trait QueueNode: Sized {
    fn next_in_queue(&self) -> &Cell<Option<NonNull<Self>>>;
    fn in_queue(&self) -> &Cell<Option<NonNull<Queue<Self>>>>;
}

/// An intrusive singly linked FIFO queue.
pub struct Queue<T: QueueNode> {
    pub lock: SpinLock,
    first: Cell<Option<NonNull<T>>>,
    last: Cell<Option<NonNull<T>>>,
}

// SAFETY: head/tail cells and member link fields are only touched with
// `lock` held (or during single-threaded construction).
unsafe impl<T: QueueNode> Sync for Queue<T> {}
// SAFETY: as above; members are kernel-owned objects.
unsafe impl<T: QueueNode> Send for Queue<T> {}

impl<T: QueueNode> Queue<T> {
    pub const fn new() -> Self {
        Queue {
            lock: SpinLock::new(()),
            first: Cell::new(None),
            last: Cell::new(None),
        }
    }

    /// Appends `node` at the tail.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock`, `node` must point to a live
    /// object, and that object must not currently be on any queue.
    pub unsafe fn enqueue(&self, node: NonNull<T>) {
        // SAFETY: node is live per the contract.
        let node_ref = unsafe { node.as_ref() };
        debug_assert!(node_ref.in_queue().get().is_none());

        match self.last.get() {
            // SAFETY: a non-null tail is a live queued object.
            Some(last) => unsafe { last.as_ref().next_in_queue().set(Some(node)) },
            None => self.first.set(Some(node)),
        }
        node_ref.next_in_queue().set(None);
        node_ref.in_queue().set(Some(NonNull::from(self)));
        self.last.set(Some(node));
    }

    /// Removes and returns the head, or `None` when empty.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    pub unsafe fn dequeue(&self) -> Option<NonNull<T>> {
        let node = self.first.get()?;
        // SAFETY: a non-null head is a live queued object.
        let node_ref = unsafe { node.as_ref() };

        self.first.set(node_ref.next_in_queue().get());
        node_ref.in_queue().set(None);
        if self.last.get() == Some(node) {
            self.last.set(None);
        }
        Some(node)
    }

    /// The current head, without removing it.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    pub unsafe fn peek(&self) -> Option<NonNull<T>> {
        self.first.get()
    }

    /// Whether the queue is empty. (head is nil iff tail is nil.)
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock`.
    pub unsafe fn is_empty(&self) -> bool {
        debug_assert_eq!(self.first.get().is_none(), self.last.get().is_none());
        self.first.get().is_none()
    }

    /// Unlinks `node` from the middle of this queue.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.lock` and `node` must be linked on this
    /// queue.
    pub unsafe fn unlink(&self, node: NonNull<T>) {
        // SAFETY: node is live and queued per the contract.
        let node_ref = unsafe { node.as_ref() };

        if self.first.get() == Some(node) {
            self.first.set(node_ref.next_in_queue().get());
            if self.last.get() == Some(node) {
                self.last.set(None);
            }
        } else {
            let mut prev = self.first.get();
            while let Some(p) = prev {
                // SAFETY: p is a live queued object.
                let p_ref = unsafe { p.as_ref() };
                if p_ref.next_in_queue().get() == Some(node) {
                    p_ref.next_in_queue().set(node_ref.next_in_queue().get());
                    if self.last.get() == Some(node) {
                        self.last.set(Some(p));
                    }
                    break;
                }
                prev = p_ref.next_in_queue().get();
            }
        }
        node_ref.in_queue().set(None);
    }

    /// Inserts `node` before the first member for which `before` returns
    /// true (used by the sorted sleep queue).
    ///
    /// # Safety
    ///
    /// As for [`enqueue`](Queue::enqueue).
    pub unsafe fn insert_sorted(&self, node: NonNull<T>, mut before: impl FnMut(&T) -> bool) {
        // SAFETY: node is live per the contract.
        let node_ref = unsafe { node.as_ref() };
        node_ref.in_queue().set(Some(NonNull::from(self)));

        // SAFETY: a non-null head is a live queued object.
        let head_matches = self
            .first
            .get()
            .map(|h| before(unsafe { h.as_ref() }))
            .unwrap_or(true);

        if head_matches {
            node_ref.next_in_queue().set(self.first.get());
            if self.first.get().is_none() {
                self.last.set(Some(node));
            }
            self.first.set(Some(node));
            return;
        }

        let mut prev = self.first.get().unwrap();
        loop {
            // SAFETY: prev is a live queued object.
            let prev_ref = unsafe { prev.as_ref() };
            match prev_ref.next_in_queue().get() {
                // SAFETY: a non-null link is a live queued object.
                Some(next) if !before(unsafe { next.as_ref() }) => prev = next,
                other => {
                    node_ref.next_in_queue().set(other);
                    prev_ref.next_in_queue().set(Some(node));
                    if other.is_none() {
                        self.last.set(Some(node));
                    }
                    return;
                }
            }
        }
    }
}

impl<T: QueueNode> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Pulls `node` off whatever queue it is currently on, taking that queue's
/// lock. Retries if the node migrates between the unlocked read of
/// `in_queue` and the lock acquisition.
pub fn force_dequeue<T: QueueNode>(node: NonNull<T>) {
    loop {
        // SAFETY: node points to a live object per the callers of this
        // function (scheduler-owned threads/processes).
        let queue = match unsafe { node.as_ref() }.in_queue().get() {
            Some(q) => q,
            None => return,
        };
        // SAFETY: queues outlive their members.
        let queue_ref = unsafe { queue.as_ref() };
        let guard = queue_ref.lock.lock();
        // SAFETY: node is live; re-check under the lock.
        if unsafe { node.as_ref() }.in_queue().get() == Some(queue) {
            // SAFETY: lock held, node confirmed on this queue.
            unsafe { queue_ref.unlink(node) };
            drop(guard);
            return;
        }
        drop(guard);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    struct Node {
        id: u32,
        next: Cell<Option<NonNull<Node>>>,
        queue: Cell<Option<NonNull<Queue<Node>>>>,
    }

    impl Node {
        fn new(id: u32) -> Self {
            Node {
                id,
                next: Cell::new(None),
                queue: Cell::new(None),
            }
        }
    }

    impl QueueNode for Node {
        fn next_in_queue(&self) -> &Cell<Option<NonNull<Self>>> {
            &self.next
        }
        fn in_queue(&self) -> &Cell<Option<NonNull<Queue<Self>>>> {
            &self.queue
        }
    }

    fn drain(q: &Queue<Node>) -> std::vec::Vec<u32> {
        let mut out = std::vec::Vec::new();
        // SAFETY: test-local queue, lock held.
        let _g = q.lock.lock();
        while let Some(n) = unsafe { q.dequeue() } {
            out.push(unsafe { n.as_ref() }.id);
        }
        out
    }

    #[test]
    fn fifo_order_and_in_queue_tracking() {
        let q = Queue::<Node>::new();
        let nodes: std::vec::Vec<_> = (0..4).map(Node::new).collect();

        {
            let _g = q.lock.lock();
            for n in &nodes {
                // SAFETY: lock held; nodes are unqueued and live.
                unsafe { q.enqueue(NonNull::from(n)) };
                assert!(n.in_queue().get().is_some());
            }
        }

        assert_eq!(drain(&q), [0, 1, 2, 3]);
        assert!(nodes.iter().all(|n| n.in_queue().get().is_none()));
    }

    #[test]
    fn head_nil_iff_tail_nil() {
        let q = Queue::<Node>::new();
        let n = Node::new(7);
        let _g = q.lock.lock();
        // SAFETY: lock held throughout.
        unsafe {
            assert!(q.is_empty());
            q.enqueue(NonNull::from(&n));
            assert!(!q.is_empty());
            q.dequeue();
            assert!(q.is_empty());
        }
    }

    #[test]
    fn force_dequeue_unlinks_from_the_middle() {
        let q = Queue::<Node>::new();
        let nodes: std::vec::Vec<_> = (0..3).map(Node::new).collect();
        {
            let _g = q.lock.lock();
            for n in &nodes {
                // SAFETY: lock held; nodes are unqueued and live.
                unsafe { q.enqueue(NonNull::from(n)) };
            }
        }

        force_dequeue(NonNull::from(&nodes[1]));
        assert!(nodes[1].in_queue().get().is_none());
        assert_eq!(drain(&q), [0, 2]);

        // A node on no queue is a no-op.
        force_dequeue(NonNull::from(&nodes[1]));
    }

    #[test]
    fn sorted_insert_keeps_order() {
        let q = Queue::<Node>::new();
        let a = Node::new(30);
        let b = Node::new(10);
        let c = Node::new(20);
        {
            let _g = q.lock.lock();
            // SAFETY: lock held; nodes are unqueued and live.
            unsafe {
                q.insert_sorted(NonNull::from(&a), |n| n.id >= 30);
                q.insert_sorted(NonNull::from(&b), |n| n.id >= 10);
                q.insert_sorted(NonNull::from(&c), |n| n.id >= 20);
            }
        }
        assert_eq!(drain(&q), [10, 20, 30]);
    }
}
