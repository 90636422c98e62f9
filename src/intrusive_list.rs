//! Intrusive singly-linked list for pool metadata chains.
//!
//! The large-allocation list and the cleanup chain both keep their nodes
//! inside pool memory. Each node stores its own `next` pointer; the list only
//! remembers the head. Insertion is at the head, so iteration visits the most
//! recently added node first.

use std::marker::PhantomData;
use std::ptr::NonNull;

/// A node in an intrusive singly-linked list.
#[derive(Debug)]
pub struct IntrusiveNode<T> {
    pub(crate) next: Option<NonNull<Self>>,
    pub(crate) data: T,
}

impl<T> IntrusiveNode<T> {
    /// Creates a new unlinked node with the given data.
    pub const fn new(data: T) -> Self {
        Self { next: None, data }
    }
}

/// An intrusive singly-linked list.
///
/// This list does not own its nodes - they live in pool blocks and are
/// reclaimed together with them. Nodes are never unlinked individually.
///
/// # Safety
///
/// The caller must ensure that:
/// - Nodes are not released while linked in the list
/// - Nodes are only linked in one list at a time
pub struct IntrusiveList<T> {
    head: Option<NonNull<IntrusiveNode<T>>>,
    len: usize,
}

impl<T> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IntrusiveList<T> {
    /// Creates a new empty intrusive list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of nodes in the list.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pushes a node to the front of the list.
    ///
    /// # Safety
    ///
    /// The caller must ensure:
    /// - `node` points to a valid, initialized `IntrusiveNode`
    /// - `node` stays valid until the list is cleared or dropped
    /// - `node` is not already in any list
    pub unsafe fn push_front(&mut self, node: NonNull<IntrusiveNode<T>>) {
        // SAFETY: Caller guarantees node is valid and unlinked
        unsafe {
            (*node.as_ptr()).next = self.head;
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// Forgets every node. The nodes themselves are left untouched.
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    /// Returns an iterator over the nodes, head first.
    ///
    /// The successor of a node is read before the node is yielded, so the
    /// caller may freely mutate the yielded node's data.
    pub const fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _list: PhantomData,
        }
    }
}

/// Iterator over the nodes of an [`IntrusiveList`].
pub struct Iter<'a, T> {
    next: Option<NonNull<IntrusiveNode<T>>>,
    _list: PhantomData<&'a IntrusiveList<T>>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = NonNull<IntrusiveNode<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        // SAFETY: every linked node is valid while the list is borrowed
        self.next = unsafe { (*node.as_ptr()).next };
        Some(node)
    }
}

// SAFETY: The list only contains raw pointers which are Send if T is Send
unsafe impl<T: Send> Send for IntrusiveList<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(list: &IntrusiveList<i32>) -> Vec<i32> {
        list.iter()
            .map(|node| unsafe { (*node.as_ptr()).data })
            .collect()
    }

    #[test]
    fn test_empty_list() {
        let list: IntrusiveList<i32> = IntrusiveList::new();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
        assert!(list.iter().next().is_none());
    }

    #[test]
    fn test_push_front_order() {
        let mut list: IntrusiveList<i32> = IntrusiveList::new();
        let mut nodes = [
            IntrusiveNode::new(1),
            IntrusiveNode::new(2),
            IntrusiveNode::new(3),
        ];

        unsafe {
            list.push_front(NonNull::new(&raw mut nodes[0]).unwrap());
            list.push_front(NonNull::new(&raw mut nodes[1]).unwrap());
            list.push_front(NonNull::new(&raw mut nodes[2]).unwrap());
        }

        assert_eq!(list.len(), 3);
        // Most recent first
        assert_eq!(collect(&list), vec![3, 2, 1]);
    }

    #[test]
    fn test_mutate_while_iterating() {
        let mut list: IntrusiveList<i32> = IntrusiveList::new();
        let mut nodes = [IntrusiveNode::new(1), IntrusiveNode::new(2)];

        unsafe {
            list.push_front(NonNull::new(&raw mut nodes[0]).unwrap());
            list.push_front(NonNull::new(&raw mut nodes[1]).unwrap());
        }

        for node in list.iter() {
            unsafe {
                (*node.as_ptr()).data *= 10;
            }
        }

        assert_eq!(collect(&list), vec![20, 10]);
    }

    #[test]
    fn test_clear() {
        let mut list: IntrusiveList<i32> = IntrusiveList::new();
        let mut node = IntrusiveNode::new(7);

        unsafe {
            list.push_front(NonNull::new(&raw mut node).unwrap());
        }
        list.clear();

        assert!(list.is_empty());
        assert!(list.iter().next().is_none());
        // The node itself is untouched
        assert_eq!(node.data, 7);
    }
}
