//! LRU List Module
//!
//! Implements Least Recently Used ordering for cache eviction.

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: usize,
    next: usize,
}

// == LRU List ==
/// Recency-ordered list with O(1) touch, removal and eviction.
///
/// Nodes live in a slab and are addressed by the slot index returned from
/// [`LruList::push_front`]; indices stay stable until the node is removed.
/// - Front (head) = Most recently used
/// - Back (tail) = Least recently used
#[derive(Debug)]
pub struct LruList<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    // == Constructor ==
    /// Creates a new empty LRU list.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    // == Push Front ==
    /// Inserts a value as most recently used and returns its slot index.
    pub fn push_front(&mut self, value: T) -> usize {
        let node = Node {
            value,
            prev: NIL,
            next: NIL,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.link_front(idx);
        self.len += 1;
        idx
    }

    // == Touch ==
    /// Marks a slot as most recently used.
    pub fn move_to_front(&mut self, idx: usize) {
        if self.head == idx || !self.contains(idx) {
            return;
        }
        self.unlink(idx);
        self.link_front(idx);
    }

    // == Remove ==
    /// Removes a slot and returns its value.
    pub fn remove(&mut self, idx: usize) -> Option<T> {
        if !self.contains(idx) {
            return None;
        }
        self.unlink(idx);
        let node = self.nodes[idx].take()?;
        self.free.push(idx);
        self.len -= 1;
        Some(node.value)
    }

    // == Evict Oldest ==
    /// Removes and returns the least recently used value.
    pub fn pop_back(&mut self) -> Option<T> {
        self.remove(self.tail)
    }

    /// Slot index of the least recently used value.
    pub fn back(&self) -> Option<usize> {
        (self.tail != NIL).then_some(self.tail)
    }

    /// Value stored in a slot, if the slot is occupied.
    pub fn get(&self, idx: usize) -> Option<&T> {
        self.nodes.get(idx)?.as_ref().map(|node| &node.value)
    }

    /// Mutable access to a slot's value without touching recency.
    pub fn get_mut(&mut self, idx: usize) -> Option<&mut T> {
        self.nodes.get_mut(idx)?.as_mut().map(|node| &mut node.value)
    }

    /// Iterates values from most to least recently used.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Number of values in the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list holds no values.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drops every node and releases the slab.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.len = 0;
    }

    fn contains(&self, idx: usize) -> bool {
        matches!(self.nodes.get(idx), Some(Some(_)))
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.nodes.get(idx) {
            Some(Some(node)) => (node.prev, node.next),
            _ => return,
        };

        match self.nodes.get_mut(prev) {
            Some(Some(node)) => node.next = next,
            _ => self.head = next,
        }
        match self.nodes.get_mut(next) {
            Some(Some(node)) => node.prev = prev,
            _ => self.tail = prev,
        }
    }

    fn link_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(Some(node)) = self.nodes.get_mut(idx) {
            node.prev = NIL;
            node.next = old_head;
        }
        match self.nodes.get_mut(old_head) {
            Some(Some(node)) => node.prev = idx,
            _ => self.tail = idx,
        }
        self.head = idx;
    }
}

// == Iterator ==
/// Most-recently-used-first iterator over an [`LruList`].
pub struct Iter<'a, T> {
    list: &'a LruList<T>,
    cursor: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.list.nodes.get(self.cursor)?.as_ref()?;
        self.cursor = node.next;
        Some(&node.value)
    }
}
