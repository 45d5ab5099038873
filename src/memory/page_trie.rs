//! Radix trie from span-aligned page addresses to page handles.
//!
//! Keys are `addr >> shift`, consumed six bits per level from the most
//! significant end, so every address inside a page's aligned window resolves
//! to that page. Mutation requires `&mut self` (the allocator's writer lock).

const FANOUT_BITS: u32 = 6;
const FANOUT: usize = 1 << FANOUT_BITS;

enum Slot<T> {
    Empty,
    Leaf(T),
    Branch(Box<Node<T>>),
}

struct Node<T> {
    slots: [Slot<T>; FANOUT],
    occupied: usize,
}

impl<T> Node<T> {
    fn new() -> Box<Self> {
        Box::new(Self {
            slots: std::array::from_fn(|_| Slot::Empty),
            occupied: 0,
        })
    }
}

pub(crate) struct PageTrie<T> {
    root: Box<Node<T>>,
    shift: u32,
    depth: u32,
    len: usize,
}

impl<T: Copy> PageTrie<T> {
    /// `shift` is log2 of the page alignment.
    pub fn new(shift: u32) -> Self {
        debug_assert!(shift < usize::BITS);
        let key_bits = usize::BITS - shift;
        Self {
            root: Node::new(),
            shift,
            depth: key_bits.div_ceil(FANOUT_BITS),
            len: 0,
        }
    }

    #[inline]
    fn digit(&self, key: usize, level: u32) -> usize {
        // Level 0 takes the most significant digit.
        let pos = (self.depth - 1 - level) * FANOUT_BITS;
        (key >> pos) & (FANOUT - 1)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Value for the page whose window contains `addr`.
    pub fn get(&self, addr: usize) -> Option<T> {
        let key = addr >> self.shift;
        let mut node = &self.root;
        for level in 0..self.depth {
            match &node.slots[self.digit(key, level)] {
                Slot::Empty => return None,
                Slot::Leaf(value) => {
                    return (level == self.depth - 1).then_some(*value);
                }
                Slot::Branch(child) => node = child,
            }
        }
        None
    }

    /// Inserts or replaces. Returns the previous value.
    pub fn insert(&mut self, addr: usize, value: T) -> Option<T> {
        let key = addr >> self.shift;
        let last = self.depth - 1;
        let mut node = &mut self.root;
        for level in 0..last {
            let digit = (key >> ((self.depth - 1 - level) * FANOUT_BITS)) & (FANOUT - 1);
            if matches!(node.slots[digit], Slot::Empty) {
                node.slots[digit] = Slot::Branch(Node::new());
                node.occupied += 1;
            }
            node = match &mut node.slots[digit] {
                Slot::Branch(child) => child,
                // Leaves only live at the last level.
                Slot::Leaf(_) | Slot::Empty => unreachable!("interior trie slot holds a leaf"),
            };
        }
        let digit = key & (FANOUT - 1);
        match std::mem::replace(&mut node.slots[digit], Slot::Leaf(value)) {
            Slot::Leaf(previous) => Some(previous),
            _ => {
                node.occupied += 1;
                self.len += 1;
                None
            }
        }
    }

    /// Removes `addr`'s entry and prunes branches left empty.
    pub fn remove(&mut self, addr: usize) -> Option<T> {
        let key = addr >> self.shift;
        let removed = Self::remove_in(&mut self.root, key, 0, self.depth)?;
        self.len -= 1;
        Some(removed)
    }

    fn remove_in(node: &mut Node<T>, key: usize, level: u32, depth: u32) -> Option<T> {
        let digit = (key >> ((depth - 1 - level) * FANOUT_BITS)) & (FANOUT - 1);
        if level == depth - 1 {
            return match std::mem::replace(&mut node.slots[digit], Slot::Empty) {
                Slot::Leaf(value) => {
                    node.occupied -= 1;
                    Some(value)
                }
                other => {
                    node.slots[digit] = other;
                    None
                }
            };
        }
        let Slot::Branch(child) = &mut node.slots[digit] else {
            return None;
        };
        let removed = Self::remove_in(child, key, level + 1, depth)?;
        if child.occupied == 0 {
            node.slots[digit] = Slot::Empty;
            node.occupied -= 1;
        }
        Some(removed)
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.root = Node::new();
        self.len = 0;
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    const SHIFT: u32 = 21;
    const ALIGN: usize = 1 << SHIFT;

    #[test]
    fn test_insert_get_remove() {
        let mut trie = PageTrie::new(SHIFT);
        assert_eq!(trie.insert(3 * ALIGN, 'a'), None);
        assert_eq!(trie.insert(1000 * ALIGN, 'b'), None);
        assert_eq!(trie.len(), 2);

        assert_eq!(trie.get(3 * ALIGN), Some('a'));
        assert_eq!(trie.get(1000 * ALIGN), Some('b'));
        assert_eq!(trie.get(4 * ALIGN), None);

        assert_eq!(trie.remove(3 * ALIGN), Some('a'));
        assert_eq!(trie.get(3 * ALIGN), None);
        assert_eq!(trie.remove(3 * ALIGN), None);
        assert_eq!(trie.len(), 1);
    }

    #[test]
    fn test_interior_addresses_resolve() {
        let mut trie = PageTrie::new(SHIFT);
        trie.insert(7 * ALIGN, 7usize);
        assert_eq!(trie.get(7 * ALIGN + 1), Some(7));
        assert_eq!(trie.get(8 * ALIGN - 1), Some(7));
        assert_eq!(trie.get(8 * ALIGN), None);
    }

    #[test]
    fn test_insert_replaces() {
        let mut trie = PageTrie::new(SHIFT);
        trie.insert(ALIGN, 1u32);
        assert_eq!(trie.insert(ALIGN, 2), Some(1));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.get(ALIGN), Some(2));
    }

    #[test]
    fn test_remove_prunes_branches() {
        let mut trie = PageTrie::new(SHIFT);
        let high = usize::MAX & !(ALIGN - 1);
        trie.insert(high, 1u8);
        trie.insert(ALIGN, 2u8);
        assert_eq!(trie.root.occupied, 2);
        trie.remove(high);
        assert_eq!(trie.root.occupied, 1);
        trie.remove(ALIGN);
        assert_eq!(trie.root.occupied, 0);
        assert_eq!(trie.len(), 0);
    }

    #[test]
    fn test_clear() {
        let mut trie = PageTrie::new(SHIFT);
        for i in 1..50 {
            trie.insert(i * ALIGN, i);
        }
        trie.clear();
        assert_eq!(trie.len(), 0);
        assert_eq!(trie.get(10 * ALIGN), None);
    }
}
