//! Intrusive doubly linked list over arena indices.
//!
//! Entries live in a fixed pool (the kernel's task table); a list head and
//! the per-entry links store `Option<usize>` indices into that pool instead
//! of pointers, so no pointer cycles arise. In the closed-loop variant the
//! first entry's `prev` refers to the last entry and vice versa, which lets
//! iteration terminate by comparing against the starting index.
use crate::utils::Init;

/// Index of an entry within the pool.
pub type Idx = usize;

/// Links to neighbor entries. `None` when the entry is not in any list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub prev: Option<Idx>,
    pub next: Option<Idx>,
}

impl Init for Link {
    const INIT: Self = Self {
        prev: None,
        next: None,
    };
}

/// List head. `CLOSED_LOOP` selects whether the end entries are stitched
/// together (`first.prev == last`, `last.next == first`).
#[derive(Debug, Clone, Copy)]
pub struct ListHead<const CLOSED_LOOP: bool = true> {
    first: Option<Idx>,
    last: Option<Idx>,
    len: usize,
}

impl<const C: bool> Init for ListHead<C> {
    const INIT: Self = Self {
        first: None,
        last: None,
        len: 0,
    };
}

impl<const C: bool> ListHead<C> {
    pub const fn new() -> Self {
        Self::INIT
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn first(&self) -> Option<Idx> {
        self.first
    }

    #[inline]
    pub fn last(&self) -> Option<Idx> {
        self.last
    }
}

/// Accessor binding a [`ListHead`] to the pool containing its entries.
///
/// `map_link` projects an entry to its link field. An entry belongs to at
/// most one list at any time; linking an already-linked entry or unlinking
/// an unlinked one is a debug assertion.
pub struct ListAccessor<'a, T, MapLink, const CLOSED_LOOP: bool = true> {
    head: &'a mut ListHead<CLOSED_LOOP>,
    pool: &'a mut [T],
    map_link: MapLink,
}

impl<'a, T, MapLink, const C: bool> ListAccessor<'a, T, MapLink, C>
where
    MapLink: Fn(&mut T) -> &mut Option<Link>,
{
    #[inline]
    pub fn new(head: &'a mut ListHead<C>, pool: &'a mut [T], map_link: MapLink) -> Self {
        Self {
            head,
            pool,
            map_link,
        }
    }

    #[inline]
    fn link_of(&mut self, i: Idx) -> &mut Option<Link> {
        (self.map_link)(&mut self.pool[i])
    }

    pub fn head(&self) -> &ListHead<C> {
        &*self.head
    }

    /// Append `entry` at the back.
    pub fn push_back(&mut self, entry: Idx) {
        debug_assert!(self.link_of(entry).is_none(), "entry is already linked");

        let old_last = self.head.last;
        *self.link_of(entry) = Some(Link {
            prev: old_last,
            next: None,
        });
        if let Some(last) = old_last {
            self.link_of(last).as_mut().unwrap().next = Some(entry);
        } else {
            self.head.first = Some(entry);
        }
        self.head.last = Some(entry);
        self.head.len += 1;

        self.update_ends();
    }

    /// Prepend `entry` at the front.
    pub fn push_front(&mut self, entry: Idx) {
        debug_assert!(self.link_of(entry).is_none(), "entry is already linked");

        let old_first = self.head.first;
        *self.link_of(entry) = Some(Link {
            prev: None,
            next: old_first,
        });
        if let Some(first) = old_first {
            self.link_of(first).as_mut().unwrap().prev = Some(entry);
        } else {
            self.head.last = Some(entry);
        }
        self.head.first = Some(entry);
        self.head.len += 1;

        self.update_ends();
    }

    /// Insert `entry` immediately before `at`.
    pub fn insert_before(&mut self, entry: Idx, at: Idx) {
        debug_assert!(self.link_of(entry).is_none(), "entry is already linked");

        if self.head.first == Some(at) {
            self.push_front(entry);
            return;
        }

        // `at` has a real (non-wrapped) predecessor
        let prev = self.link_of(at).unwrap().prev.unwrap();
        *self.link_of(entry) = Some(Link {
            prev: Some(prev),
            next: Some(at),
        });
        self.link_of(prev).as_mut().unwrap().next = Some(entry);
        self.link_of(at).as_mut().unwrap().prev = Some(entry);
        self.head.len += 1;

        self.update_ends();
    }

    /// Remove `entry` from the list.
    pub fn unlink(&mut self, entry: Idx) {
        let link = self.link_of(entry).expect("entry is not linked");

        if self.head.first == Some(entry) {
            self.head.first = if self.head.len == 1 { None } else { link.next };
        }
        if self.head.last == Some(entry) {
            self.head.last = if self.head.len == 1 { None } else { link.prev };
        }

        // In the closed-loop variant the neighbor links of a sole entry refer
        // back to the entry itself; guard against relinking the entry then.
        if self.head.len > 1 {
            if let Some(prev) = link.prev {
                self.link_of(prev).as_mut().unwrap().next = link.next;
            }
            if let Some(next) = link.next {
                self.link_of(next).as_mut().unwrap().prev = link.prev;
            }
        }

        *self.link_of(entry) = None;
        self.head.len -= 1;

        self.update_ends();
    }

    pub fn pop_front(&mut self) -> Option<Idx> {
        let first = self.head.first?;
        self.unlink(first);
        Some(first)
    }

    pub fn pop_back(&mut self) -> Option<Idx> {
        let last = self.head.last?;
        self.unlink(last);
        Some(last)
    }

    /// Successor of `entry`. In the closed-loop variant the last entry's
    /// successor is the first entry.
    pub fn next_of(&mut self, entry: Idx) -> Option<Idx> {
        let link = self.link_of(entry).expect("entry is not linked");
        link.next
    }

    /// Predecessor of `entry`. In the closed-loop variant the first entry's
    /// predecessor is the last entry.
    pub fn prev_of(&mut self, entry: Idx) -> Option<Idx> {
        let link = self.link_of(entry).expect("entry is not linked");
        link.prev
    }

    /// Move every entry to the back of `to` in order, in O(n).
    pub fn relink_to(&mut self, to: &mut ListHead<C>) {
        while let Some(i) = self.pop_front() {
            ListAccessor::new(to, &mut *self.pool, &self.map_link).push_back(i);
        }
    }

    #[inline]
    fn update_ends(&mut self) {
        if !C {
            return;
        }
        if let (Some(first), Some(last)) = (self.head.first, self.head.last) {
            self.link_of(first).as_mut().unwrap().prev = Some(last);
            self.link_of(last).as_mut().unwrap().next = Some(first);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[derive(Clone, Copy)]
    struct El {
        link: Option<Link>,
        val: u32,
    }

    fn make_pool(n: usize) -> Vec<El> {
        (0..n)
            .map(|i| El {
                link: None,
                val: i as u32,
            })
            .collect()
    }

    fn collect<const C: bool>(head: &mut ListHead<C>, pool: &mut [El]) -> Vec<u32> {
        let mut acc = ListAccessor::new(head, pool, |e: &mut El| &mut e.link);
        let mut out = Vec::new();
        let Some(start) = acc.head().first() else {
            return out;
        };
        let mut cur = start;
        loop {
            out.push(acc.pool[cur].val);
            match acc.next_of(cur) {
                Some(next) if next != start => cur = next,
                _ => break,
            }
        }
        out
    }

    #[test]
    fn push_and_wrap() {
        let mut head = ListHead::<true>::new();
        let mut pool = make_pool(4);
        {
            let mut acc = ListAccessor::new(&mut head, &mut pool, |e: &mut El| &mut e.link);
            acc.push_back(0);
            acc.push_back(1);
            acc.push_back(2);

            // closed loop: ends are stitched
            assert_eq!(acc.next_of(2), Some(0));
            assert_eq!(acc.prev_of(0), Some(2));
        }
        assert_eq!(collect(&mut head, &mut pool), vec![0, 1, 2]);
    }

    #[test]
    fn unlink_middle_and_ends() {
        let mut head = ListHead::<true>::new();
        let mut pool = make_pool(4);
        {
            let mut acc = ListAccessor::new(&mut head, &mut pool, |e: &mut El| &mut e.link);
            for i in 0..4 {
                acc.push_back(i);
            }
            acc.unlink(2);
            assert_eq!(acc.next_of(1), Some(3));
            acc.unlink(0);
            acc.unlink(3);
            assert_eq!(acc.head().len(), 1);
            assert_eq!(acc.next_of(1), Some(1));
            acc.unlink(1);
            assert!(acc.head().is_empty());
            assert_eq!(acc.head().first(), None);
            assert_eq!(acc.head().last(), None);
        }
        assert!(pool.iter().all(|e| e.link.is_none()));
    }

    #[test]
    fn insert_before_keeps_order() {
        let mut head = ListHead::<true>::new();
        let mut pool = make_pool(4);
        let mut acc = ListAccessor::new(&mut head, &mut pool, |e: &mut El| &mut e.link);
        acc.push_back(0);
        acc.push_back(2);
        acc.insert_before(1, 2);
        acc.insert_before(3, 0); // before the first entry
        drop(acc);
        assert_eq!(collect(&mut head, &mut pool), vec![3, 0, 1, 2]);
    }

    /// Applying an arbitrary push/pop sequence keeps `len`, the end
    /// pointers, and the link consistency in agreement.
    #[quickcheck]
    fn qc_ops_consistent(ops: Vec<(bool, bool)>) -> bool {
        let mut head = ListHead::<true>::new();
        let mut pool = make_pool(8);
        let mut free: Vec<usize> = (0..8).collect();
        let mut model: std::collections::VecDeque<usize> = Default::default();

        for (push, front) in ops {
            let mut acc = ListAccessor::new(&mut head, &mut pool, |e: &mut El| &mut e.link);
            if push {
                let Some(i) = free.pop() else { continue };
                if front {
                    acc.push_front(i);
                    model.push_front(i);
                } else {
                    acc.push_back(i);
                    model.push_back(i);
                }
            } else {
                let got = if front { acc.pop_front() } else { acc.pop_back() };
                let want = if front {
                    model.pop_front()
                } else {
                    model.pop_back()
                };
                if got != want {
                    return false;
                }
                if let Some(i) = got {
                    free.push(i);
                }
            }
            if acc.head().len() != model.len() {
                return false;
            }
            if acc.head().first() != model.front().copied() {
                return false;
            }
            if acc.head().last() != model.back().copied() {
                return false;
            }
        }
        true
    }
}
