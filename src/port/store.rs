//! Index-linked element storage for ports.
//!
//! A port holds its queued messages in an [`ElementStore`]: a slot arena
//! threaded with an intrusive doubly linked list of slot indices. This
//! gives FIFO push/pop plus O(1) removal and re-insertion at an arbitrary
//! position, which the arbiters need: a join detaches elements from the
//! middle of the queue during its two-phase take and must be able to put
//! them back exactly where they were if a later port comes up empty.
//!
//! # Invariants
//!
//! - Every occupied slot is on the list exactly once; every free slot is on
//!   the free list exactly once.
//! - `head`/`tail` are `NONE` iff `len == 0`.
//! - Slot indices handed out by `push_*`/`insert_before` stay valid until
//!   the element is removed; removal invalidates the index.

use crate::causality::CausalitySet;

/// A queued message plus the causality context captured when it was posted.
pub(crate) struct Element<T> {
    pub(crate) item: T,
    pub(crate) causality: Option<CausalitySet>,
}

impl<T> Element<T> {
    pub(crate) fn new(item: T, causality: Option<CausalitySet>) -> Self {
        Self { item, causality }
    }
}

const NONE: u32 = u32::MAX;

struct Slot<T> {
    element: Option<Element<T>>,
    next: u32,
    prev: u32,
}

/// FIFO element storage with O(1) detach and positional re-insert.
pub(crate) struct ElementStore<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: u32,
    tail: u32,
    len: usize,
}

impl<T> ElementStore<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: NONE,
            tail: NONE,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn alloc(&mut self, element: Element<T>) -> u32 {
        if let Some(id) = self.free.pop() {
            let slot = &mut self.slots[id as usize];
            slot.element = Some(element);
            slot.next = NONE;
            slot.prev = NONE;
            id
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Slot {
                element: Some(element),
                next: NONE,
                prev: NONE,
            });
            id
        }
    }

    /// Appends an element at the tail. Returns its slot id.
    pub(crate) fn push_back(&mut self, element: Element<T>) -> u32 {
        let id = self.alloc(element);
        if self.tail == NONE {
            self.head = id;
            self.tail = id;
        } else {
            self.slots[self.tail as usize].next = id;
            self.slots[id as usize].prev = self.tail;
            self.tail = id;
        }
        self.len += 1;
        id
    }

    /// Prepends an element at the head. Returns its slot id.
    pub(crate) fn push_front(&mut self, element: Element<T>) -> u32 {
        let id = self.alloc(element);
        if self.head == NONE {
            self.head = id;
            self.tail = id;
        } else {
            self.slots[self.head as usize].prev = id;
            self.slots[id as usize].next = self.head;
            self.head = id;
        }
        self.len += 1;
        id
    }

    /// Inserts an element immediately before the slot `before`, or at the
    /// tail when `before` is `None`. Used to restore a detached element to
    /// its original position.
    pub(crate) fn insert_before(&mut self, before: Option<u32>, element: Element<T>) -> u32 {
        let Some(before) = before else {
            return self.push_back(element);
        };
        if before == self.head {
            return self.push_front(element);
        }
        let prev = self.slots[before as usize].prev;
        let id = self.alloc(element);
        self.slots[id as usize].prev = prev;
        self.slots[id as usize].next = before;
        self.slots[prev as usize].next = id;
        self.slots[before as usize].prev = id;
        self.len += 1;
        id
    }

    /// Removes and returns the head element.
    pub(crate) fn pop_front(&mut self) -> Option<Element<T>> {
        if self.head == NONE {
            return None;
        }
        self.remove(self.head)
    }

    /// Detaches the element in slot `id`.
    pub(crate) fn remove(&mut self, id: u32) -> Option<Element<T>> {
        let slot = self.slots.get_mut(id as usize)?;
        let element = slot.element.take()?;
        let next = slot.next;
        let prev = slot.prev;
        slot.next = NONE;
        slot.prev = NONE;
        if prev == NONE {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next == NONE {
            self.tail = prev;
        } else {
            self.slots[next as usize].prev = prev;
        }
        self.free.push(id);
        self.len -= 1;
        Some(element)
    }

    /// The slot id of the head element.
    pub(crate) fn front_id(&self) -> Option<u32> {
        (self.head != NONE).then_some(self.head)
    }

    /// The slot id following `id` in queue order.
    pub(crate) fn next_id(&self, id: u32) -> Option<u32> {
        let next = self.slots.get(id as usize)?.next;
        (next != NONE).then_some(next)
    }

    /// Drains every element in queue order.
    pub(crate) fn drain(&mut self) -> Vec<Element<T>> {
        let mut out = Vec::with_capacity(self.len);
        while let Some(element) = self.pop_front() {
            out.push(element);
        }
        out
    }
}

impl<T> Default for ElementStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
