//! Intrusive thread lists.
//!
//! Every thread slot carries one link. A link names the list it is on and
//! its neighbours there; each list is circular and remembers only its head.
//! Moving a thread between lists rewrites indices and never allocates.

/// The global thread lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListId {
    Ready,
    Running,
    Terminated,
    Sleep,
    Readline,
    Deschedule,
    VanishWait,
}

const LIST_COUNT: usize = 7;

impl ListId {
    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Clone, Copy)]
struct Link {
    prev: usize,
    next: usize,
    list: Option<ListId>,
}

impl Link {
    const UNLINKED: Self = Self {
        prev: 0,
        next: 0,
        list: None,
    };
}

/// Heads and links of every list.
pub struct ThreadLists {
    links: alloc::vec::Vec<Link>,
    heads: [Option<usize>; LIST_COUNT],
    lens: [usize; LIST_COUNT],
}

impl Default for ThreadLists {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadLists {
    /// All lists empty.
    pub const fn new() -> Self {
        Self {
            links: alloc::vec::Vec::new(),
            heads: [None; LIST_COUNT],
            lens: [0; LIST_COUNT],
        }
    }

    fn link(&mut self, slot: usize) -> &mut Link {
        if slot >= self.links.len() {
            self.links.resize(slot + 1, Link::UNLINKED);
        }
        &mut self.links[slot]
    }

    /// The list `slot` is on.
    pub fn list_of(&self, slot: usize) -> Option<ListId> {
        self.links.get(slot).and_then(|l| l.list)
    }

    /// First slot of `list`.
    pub fn head(&self, list: ListId) -> Option<usize> {
        self.heads[list.index()]
    }

    /// Number of slots on `list`.
    pub fn len(&self, list: ListId) -> usize {
        self.lens[list.index()]
    }

    /// Whether `list` is empty.
    pub fn is_empty(&self, list: ListId) -> bool {
        self.len(list) == 0
    }

    /// The slot after `slot` on its list, wrapping around.
    pub fn next(&self, slot: usize) -> usize {
        self.links[slot].next
    }

    /// Slots of `list`, head first.
    pub fn iter(&self, list: ListId) -> impl Iterator<Item = usize> + '_ {
        let mut cursor = self.head(list);
        let mut left = self.len(list);
        core::iter::from_fn(move || {
            if left == 0 {
                return None;
            }
            left -= 1;
            let slot = cursor?;
            cursor = Some(self.links[slot].next);
            Some(slot)
        })
    }

    /// Make `slot`, already on `list`, its head. The circular order is kept.
    pub fn rotate_to(&mut self, list: ListId, slot: usize) {
        assert_eq!(
            self.list_of(slot),
            Some(list),
            "rotate to slot {} not on {:?}",
            slot,
            list
        );
        self.heads[list.index()] = Some(slot);
    }

    /// Take `slot` off whatever list it is on.
    pub fn unlink(&mut self, slot: usize) {
        let Link { prev, next, list } = *self.link(slot);
        let list = match list {
            Some(list) => list,
            None => return,
        };
        let i = list.index();
        if next == slot {
            self.heads[i] = None;
        } else {
            self.links[prev].next = next;
            self.links[next].prev = prev;
            if self.heads[i] == Some(slot) {
                self.heads[i] = Some(next);
            }
        }
        self.lens[i] -= 1;
        self.links[slot] = Link::UNLINKED;
    }

    // Splice the unlinked `slot` in before `next`, or as the only member.
    fn splice(&mut self, list: ListId, slot: usize, next: Option<usize>) {
        assert!(self.list_of(slot).is_none(), "slot {} is already linked", slot);
        let (prev, next) = match next {
            Some(next) => (self.links[next].prev, next),
            None => (slot, slot),
        };
        *self.link(slot) = Link {
            prev,
            next,
            list: Some(list),
        };
        self.links[prev].next = slot;
        self.links[next].prev = slot;
        self.lens[list.index()] += 1;
    }

    /// Append `slot` to `list`.
    pub fn push_back(&mut self, list: ListId, slot: usize) {
        let head = self.head(list);
        self.splice(list, slot, head);
        if head.is_none() {
            self.heads[list.index()] = Some(slot);
        }
    }

    /// Prepend `slot` to `list`.
    pub fn push_front(&mut self, list: ListId, slot: usize) {
        let head = self.head(list);
        self.splice(list, slot, head);
        self.heads[list.index()] = Some(slot);
    }

    /// Insert `slot` right before `at`, which must be on `list`.
    ///
    /// Inserting before the head makes `slot` the new head.
    pub fn insert_before(&mut self, list: ListId, at: usize, slot: usize) {
        assert_eq!(self.list_of(at), Some(list));
        if self.head(list) == Some(at) {
            self.push_front(list, slot);
        } else {
            self.splice(list, slot, Some(at));
        }
    }

    /// Insert `slot` right after `at`, which must be on `list`.
    pub fn insert_after(&mut self, list: ListId, at: usize, slot: usize) {
        assert_eq!(self.list_of(at), Some(list));
        let next = self.links[at].next;
        self.splice(list, slot, Some(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    fn collect(lists: &ThreadLists, list: ListId) -> Vec<usize> {
        lists.iter(list).collect()
    }

    #[test]
    fn push_and_unlink() {
        let mut lists = ThreadLists::new();
        lists.push_back(ListId::Ready, 3);
        lists.push_back(ListId::Ready, 1);
        lists.push_front(ListId::Ready, 7);
        assert_eq!(collect(&lists, ListId::Ready), [7, 3, 1]);
        assert_eq!(lists.len(ListId::Ready), 3);

        lists.unlink(7);
        assert_eq!(collect(&lists, ListId::Ready), [3, 1]);
        assert_eq!(lists.list_of(7), None);
        lists.unlink(1);
        lists.unlink(3);
        assert!(lists.is_empty(ListId::Ready));
        assert_eq!(lists.head(ListId::Ready), None);
    }

    #[test]
    fn insert_relative() {
        let mut lists = ThreadLists::new();
        lists.push_back(ListId::Sleep, 0);
        lists.push_back(ListId::Sleep, 2);
        lists.insert_before(ListId::Sleep, 2, 1);
        lists.insert_before(ListId::Sleep, 0, 4);
        lists.insert_after(ListId::Sleep, 2, 5);
        assert_eq!(collect(&lists, ListId::Sleep), [4, 0, 1, 2, 5]);
    }

    #[test]
    fn rotation_keeps_cycle() {
        let mut lists = ThreadLists::new();
        for slot in 0..4 {
            lists.push_back(ListId::Ready, slot);
        }
        lists.rotate_to(ListId::Ready, 2);
        assert_eq!(collect(&lists, ListId::Ready), [2, 3, 0, 1]);
        lists.push_back(ListId::Ready, 9);
        assert_eq!(collect(&lists, ListId::Ready), [2, 3, 0, 1, 9]);
    }

    #[test]
    fn lists_are_independent() {
        let mut lists = ThreadLists::new();
        lists.push_back(ListId::Ready, 0);
        lists.push_back(ListId::Running, 1);
        lists.unlink(0);
        lists.push_back(ListId::Terminated, 0);
        assert_eq!(collect(&lists, ListId::Running), [1]);
        assert_eq!(collect(&lists, ListId::Terminated), [0]);
        assert!(lists.is_empty(ListId::Ready));
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_link_panics() {
        let mut lists = ThreadLists::new();
        lists.push_back(ListId::Ready, 0);
        lists.push_back(ListId::Sleep, 0);
    }
}
