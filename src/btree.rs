//! A concurrent B+ tree index with unique keys, built on buffer-pool page
//! guards.
//!
//! Descents crab-latch: each child is latched before its parent is
//! released, and during writes the held ancestor set is exactly the chain
//! of nodes that a split or merge at the current node could touch. A node
//! is safe for insert when one more entry cannot fill it, and safe for
//! remove when one fewer entry cannot underflow it; reaching a safe node
//! releases every held ancestor, including the tree header page.

use std::io;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::btree_page::{
    internal_capacity, leaf_capacity, BTreePageType, InternalMut, InternalRef, LeafMut, LeafRef,
};
use crate::buffer_pool::BufferPoolManager;
use crate::page_guard::WritePageGuard;
use crate::{PageId, INVALID_PAGE_ID};

/// Contents of the distinguished header page: the current root, or
/// INVALID_PAGE_ID while the tree is empty.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TreeHeader {
    root_page_id: PageId,
}

/// Ancestor guards held during a write descent. The last element is the
/// deepest retained ancestor (the header page sits at the bottom); clearing
/// the set is how a safe node releases everything above it.
struct Context<'a> {
    write_set: Vec<WritePageGuard<'a>>,
    root_page_id: PageId,
}

impl Context<'_> {
    fn is_root(&self, page_id: PageId) -> bool {
        page_id == self.root_page_id
    }
}

/// A B+ tree keyed by `K`'s `Ord` impl. `leaf_max_size` and
/// `internal_max_size` bound how many entries a node exposes between
/// operations; internally nodes hold one extra slot and split upon
/// reaching it.
pub struct BPlusTree<K, V> {
    bpm: Arc<BufferPoolManager>,
    header_page_id: PageId,
    leaf_max_size: u16,
    internal_max_size: u16,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> BPlusTree<K, V>
where
    K: Copy + Ord,
    V: Copy,
{
    /// Takes ownership of `header_page_id` and resets the tree to empty.
    pub fn new(
        bpm: Arc<BufferPoolManager>,
        header_page_id: PageId,
        leaf_max_size: u16,
        internal_max_size: u16,
    ) -> io::Result<Self> {
        assert!(leaf_max_size >= 2, "leaf max size must be at least 2");
        assert!(internal_max_size >= 2, "internal max size must be at least 2");
        let leaf_max_size = leaf_max_size + 1;
        let internal_max_size = internal_max_size + 1;
        assert!(
            leaf_max_size as usize <= leaf_capacity::<K, V>(),
            "leaf max size exceeds page capacity"
        );
        assert!(
            internal_max_size as usize <= internal_capacity::<K>(),
            "internal max size exceeds page capacity"
        );

        {
            let mut header_guard = bpm.fetch_page_write(header_page_id)?;
            header_guard.write_at(
                0,
                TreeHeader {
                    root_page_id: INVALID_PAGE_ID,
                },
            );
        }

        Ok(Self {
            bpm,
            header_page_id,
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        let guard = self.bpm.fetch_page_read(self.header_page_id)?;
        Ok(guard.read_at::<TreeHeader>(0).root_page_id == INVALID_PAGE_ID)
    }

    /// Every value stored under `key`. Inserts keep keys unique, so the
    /// result has at most one element, but lookup stays tolerant of
    /// duplicates.
    pub fn get(&self, key: &K) -> io::Result<Vec<V>> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let mut page_id = guard.read_at::<TreeHeader>(0).root_page_id;
        loop {
            if page_id == INVALID_PAGE_ID {
                return Ok(Vec::new());
            }
            let child = self.bpm.fetch_page_read(page_id)?;
            guard = child;
            if guard.btree_page_type() == BTreePageType::Leaf {
                let leaf = LeafRef::<K, V>::new(&guard);
                let mut values = Vec::new();
                for i in 0..leaf.size() {
                    if leaf.key_at(i) == *key {
                        values.push(leaf.value_at(i));
                    }
                }
                return Ok(values);
            }
            let node = InternalRef::<K>::new(&guard);
            let index = Self::internal_upper_bound(&node, key);
            page_id = node.value_at(index - 1);
        }
    }

    /// Inserts a unique key. Returns false when the key is already present.
    pub fn insert(&self, key: K, value: V) -> io::Result<bool> {
        let mut header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_page_id = header_guard.read_at::<TreeHeader>(0).root_page_id;

        if root_page_id == INVALID_PAGE_ID {
            let mut root_guard = self.bpm.new_page()?;
            let root_page_id = root_guard.page_id();
            {
                let mut page = root_guard.write();
                let mut leaf = LeafMut::<K, V>::new(&mut page);
                leaf.init(self.leaf_max_size);
                let inserted = leaf.insert_at(0, key, value);
                debug_assert!(inserted);
            }
            header_guard.write_at(0, TreeHeader { root_page_id });
            return Ok(true);
        }

        let mut ctx = Context {
            write_set: vec![header_guard],
            root_page_id,
        };
        self.insert_recursive(root_page_id, &mut ctx, key, value)
    }

    fn insert_recursive<'a>(
        &'a self,
        page_id: PageId,
        ctx: &mut Context<'a>,
        key: K,
        value: V,
    ) -> io::Result<bool> {
        let mut guard = self.bpm.fetch_page_write(page_id)?;
        let header = guard.btree_header();
        if (header.size as usize) < header.max_size as usize - 1 {
            // Safe: this node cannot split, nothing above is needed anymore.
            ctx.write_set.clear();
        }

        let inserted;
        if guard.btree_page_type() == BTreePageType::Leaf {
            let index = {
                let leaf = LeafRef::<K, V>::new(&guard);
                Self::leaf_upper_bound(&leaf, &key)
            };
            if index > 0 && LeafRef::<K, V>::new(&guard).key_at(index - 1) == key {
                return Ok(false);
            }
            let mut leaf = LeafMut::<K, V>::new(&mut guard);
            inserted = leaf.insert_at(index, key, value);
        } else {
            let child = {
                let node = InternalRef::<K>::new(&guard);
                let index = Self::internal_upper_bound(&node, &key);
                node.value_at(index - 1)
            };
            let my_pos = ctx.write_set.len();
            ctx.write_set.push(guard);
            inserted = self.insert_recursive(child, ctx, key, value)?;
            if ctx.write_set.len() <= my_pos {
                // A safe descendant released the whole ancestor chain;
                // nothing can propagate to this level.
                return Ok(inserted);
            }
            guard = ctx.write_set.pop().expect("ancestor guard");
        }

        let header = guard.btree_header();
        if (header.size as usize) < header.max_size as usize || !inserted {
            return Ok(inserted);
        }
        self.split(page_id, guard, ctx)?;
        Ok(inserted)
    }

    /// Splits a full node, promoting the separator into the parent held at
    /// the back of the write set (or growing a new root).
    fn split(
        &self,
        page_id: PageId,
        mut guard: WritePageGuard<'_>,
        ctx: &mut Context<'_>,
    ) -> io::Result<()> {
        let mut split_guard = self.bpm.new_page()?;
        let split_page_id = split_guard.page_id();

        let separator: K;
        if guard.btree_page_type() == BTreePageType::Leaf {
            let mut split_page = split_guard.write();
            let mut new_leaf = LeafMut::<K, V>::new(&mut split_page);
            new_leaf.init(self.leaf_max_size);
            let mut leaf = LeafMut::<K, V>::new(&mut guard);
            leaf.split_to(&mut new_leaf, split_page_id);
            separator = new_leaf.key_at(0);
        } else {
            let mut split_page = split_guard.write();
            let mut new_node = InternalMut::<K>::new(&mut split_page);
            new_node.init(self.internal_max_size);
            let mut node = InternalMut::<K>::new(&mut guard);
            node.split_to(&mut new_node);
            separator = new_node.key_at(0);
        }

        if ctx.is_root(page_id) {
            // The back of the write set is the header page.
            let mut root_guard = self.bpm.new_page()?;
            let new_root_id = root_guard.page_id();
            {
                let mut page = root_guard.write();
                let mut new_root = InternalMut::<K>::new(&mut page);
                new_root.init(self.internal_max_size);
                new_root.set_value_at(0, page_id);
                let ok = new_root.insert_at(1, separator, split_page_id);
                assert!(ok, "fresh root cannot be full");
            }
            let header_guard = ctx.write_set.last_mut().expect("header guard");
            header_guard.write_at(
                0,
                TreeHeader {
                    root_page_id: new_root_id,
                },
            );
        } else {
            let parent_guard = ctx.write_set.last_mut().expect("parent guard");
            let index = {
                let parent = InternalRef::<K>::new(parent_guard);
                Self::internal_upper_bound(&parent, &separator)
            };
            let mut parent = InternalMut::<K>::new(&mut **parent_guard);
            let ok = parent.insert_at(index, separator, split_page_id);
            assert!(ok, "parent overflowed on separator insert");
        }
        Ok(())
    }

    /// Removes `key` if present. Absent keys (and an empty tree) are
    /// no-ops.
    pub fn remove(&self, key: &K) -> io::Result<()> {
        let header_guard = self.bpm.fetch_page_write(self.header_page_id)?;
        let root_page_id = header_guard.read_at::<TreeHeader>(0).root_page_id;
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut ctx = Context {
            write_set: vec![header_guard],
            root_page_id,
        };
        self.remove_recursive(root_page_id, &mut ctx, key)
    }

    fn remove_recursive<'a>(
        &'a self,
        page_id: PageId,
        ctx: &mut Context<'a>,
        key: &K,
    ) -> io::Result<()> {
        let mut guard = self.bpm.fetch_page_write(page_id)?;
        let header = guard.btree_header();
        let size = header.size as usize;
        let min_size = (header.max_size / 2) as usize;
        let is_leaf = guard.btree_page_type() == BTreePageType::Leaf;
        let is_root = ctx.is_root(page_id);

        let safe = if is_root {
            if is_leaf {
                size > 1
            } else {
                size > 2
            }
        } else {
            size > min_size
        };
        if safe {
            ctx.write_set.clear();
        }

        if is_leaf {
            let index = {
                let leaf = LeafRef::<K, V>::new(&guard);
                let upper = Self::leaf_upper_bound(&leaf, key);
                if upper > 0 && leaf.key_at(upper - 1) == *key {
                    Some(upper - 1)
                } else {
                    None
                }
            };
            let Some(index) = index else {
                return Ok(());
            };
            let new_size = {
                let mut leaf = LeafMut::<K, V>::new(&mut guard);
                leaf.remove_at(index);
                leaf.size()
            };

            if is_root {
                if new_size == 0 {
                    let header_guard = ctx.write_set.last_mut().expect("header guard");
                    header_guard.write_at(
                        0,
                        TreeHeader {
                            root_page_id: INVALID_PAGE_ID,
                        },
                    );
                    drop(guard);
                    self.bpm.delete_page(page_id)?;
                }
                return Ok(());
            }
            if new_size >= min_size {
                return Ok(());
            }
            return self.repair_leaf_underflow(page_id, guard, ctx, key);
        }

        let child = {
            let node = InternalRef::<K>::new(&guard);
            let index = Self::internal_upper_bound(&node, key);
            node.value_at(index - 1)
        };
        let my_pos = ctx.write_set.len();
        ctx.write_set.push(guard);
        self.remove_recursive(child, ctx, key)?;
        if ctx.write_set.len() <= my_pos {
            return Ok(());
        }
        let guard = ctx.write_set.pop().expect("ancestor guard");

        let size = guard.btree_header().size as usize;
        if ctx.is_root(page_id) {
            if size < 2 {
                // The root is down to a single child: promote it.
                let new_root = {
                    let node = InternalRef::<K>::new(&guard);
                    node.value_at(0)
                };
                let header_guard = ctx.write_set.last_mut().expect("header guard");
                header_guard.write_at(
                    0,
                    TreeHeader {
                        root_page_id: new_root,
                    },
                );
                drop(guard);
                self.bpm.delete_page(page_id)?;
            }
            return Ok(());
        }
        if size >= min_size {
            return Ok(());
        }
        self.repair_internal_underflow(page_id, guard, ctx, key)
    }

    /// Brings an underfull leaf back to minimum size: borrow from the left
    /// sibling, else from the right, else merge.
    fn repair_leaf_underflow(
        &self,
        page_id: PageId,
        mut guard: WritePageGuard<'_>,
        ctx: &mut Context<'_>,
        key: &K,
    ) -> io::Result<()> {
        let parent_guard = ctx.write_set.last_mut().expect("parent guard");
        let (index, parent_size) = {
            let parent = InternalRef::<K>::new(parent_guard);
            (Self::internal_upper_bound(&parent, key) - 1, parent.size())
        };
        let needed = {
            let leaf = LeafRef::<K, V>::new(&guard);
            leaf.min_size() - leaf.size()
        };

        if index > 0 {
            let left_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_page_id)?;
            let borrowed = {
                let mut leaf = LeafMut::<K, V>::new(&mut guard);
                let mut left = LeafMut::<K, V>::new(&mut left_guard);
                leaf.borrow_from_left(&mut left, needed)
            };
            if borrowed {
                let first_key = LeafRef::<K, V>::new(&guard).key_at(0);
                let mut parent = InternalMut::<K>::new(&mut **parent_guard);
                parent.set_key_at(index, first_key);
                return Ok(());
            }
        }

        if index + 1 < parent_size {
            let right_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index + 1)
            };
            let mut right_guard = self.bpm.fetch_page_write(right_page_id)?;
            let borrowed = {
                let mut leaf = LeafMut::<K, V>::new(&mut guard);
                let mut right = LeafMut::<K, V>::new(&mut right_guard);
                leaf.borrow_from_right(&mut right, needed)
            };
            if borrowed {
                let separator = LeafRef::<K, V>::new(&right_guard).key_at(0);
                let mut parent = InternalMut::<K>::new(&mut **parent_guard);
                parent.set_key_at(index + 1, separator);
                return Ok(());
            }
        }

        if index > 0 {
            // Merge into the left sibling and free this page.
            let left_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_page_id)?;
            {
                let mut leaf = LeafMut::<K, V>::new(&mut guard);
                let mut left = LeafMut::<K, V>::new(&mut left_guard);
                leaf.merge_to_left(&mut left);
            }
            let mut parent = InternalMut::<K>::new(&mut **parent_guard);
            parent.remove_at(index);
            drop(left_guard);
            drop(guard);
            self.bpm.delete_page(page_id)?;
            return Ok(());
        }

        // Leftmost child: absorb the right sibling instead, which keeps the
        // incoming leaf chain pointing at a live page.
        let right_page_id = {
            let parent = InternalRef::<K>::new(parent_guard);
            parent.value_at(index + 1)
        };
        let mut right_guard = self.bpm.fetch_page_write(right_page_id)?;
        {
            let mut leaf = LeafMut::<K, V>::new(&mut guard);
            let mut right = LeafMut::<K, V>::new(&mut right_guard);
            right.merge_to_left(&mut leaf);
        }
        let mut parent = InternalMut::<K>::new(&mut **parent_guard);
        parent.remove_at(index + 1);
        drop(right_guard);
        drop(guard);
        self.bpm.delete_page(right_page_id)?;
        Ok(())
    }

    /// Underflow repair for internal nodes. Differs from the leaf case in
    /// the separator juggling: a borrowed slot-0 child carries no key, so
    /// the parent separator rotates down into the borrowed slot and the new
    /// boundary key rotates up into the parent.
    fn repair_internal_underflow(
        &self,
        page_id: PageId,
        mut guard: WritePageGuard<'_>,
        ctx: &mut Context<'_>,
        key: &K,
    ) -> io::Result<()> {
        let parent_guard = ctx.write_set.last_mut().expect("parent guard");
        let (index, parent_size) = {
            let parent = InternalRef::<K>::new(parent_guard);
            (Self::internal_upper_bound(&parent, key) - 1, parent.size())
        };
        let (needed, old_size) = {
            let node = InternalRef::<K>::new(&guard);
            (node.min_size() - node.size(), node.size())
        };

        if index > 0 {
            let left_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_page_id)?;
            let borrowed = {
                let mut node = InternalMut::<K>::new(&mut guard);
                let mut left = InternalMut::<K>::new(&mut left_guard);
                node.borrow_from_left(&mut left, needed)
            };
            if borrowed {
                let old_separator = InternalRef::<K>::new(parent_guard).key_at(index);
                let mut node = InternalMut::<K>::new(&mut guard);
                node.set_key_at(needed, old_separator);
                let new_separator = node.key_at(0);
                let mut parent = InternalMut::<K>::new(&mut **parent_guard);
                parent.set_key_at(index, new_separator);
                return Ok(());
            }
        }

        if index + 1 < parent_size {
            let right_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index + 1)
            };
            let mut right_guard = self.bpm.fetch_page_write(right_page_id)?;
            let borrowed = {
                let mut node = InternalMut::<K>::new(&mut guard);
                let mut right = InternalMut::<K>::new(&mut right_guard);
                node.borrow_from_right(&mut right, needed)
            };
            if borrowed {
                let old_separator = InternalRef::<K>::new(parent_guard).key_at(index + 1);
                let mut node = InternalMut::<K>::new(&mut guard);
                node.set_key_at(old_size, old_separator);
                let new_separator = InternalRef::<K>::new(&right_guard).key_at(0);
                let mut parent = InternalMut::<K>::new(&mut **parent_guard);
                parent.set_key_at(index + 1, new_separator);
                return Ok(());
            }
        }

        if index > 0 {
            let left_page_id = {
                let parent = InternalRef::<K>::new(parent_guard);
                parent.value_at(index - 1)
            };
            let mut left_guard = self.bpm.fetch_page_write(left_page_id)?;
            let separator = InternalRef::<K>::new(parent_guard).key_at(index);
            {
                let mut node = InternalMut::<K>::new(&mut guard);
                node.set_key_at(0, separator);
                let mut left = InternalMut::<K>::new(&mut left_guard);
                node.merge_to_left(&mut left);
            }
            let mut parent = InternalMut::<K>::new(&mut **parent_guard);
            parent.remove_at(index);
            drop(left_guard);
            drop(guard);
            self.bpm.delete_page(page_id)?;
            return Ok(());
        }

        // Leftmost child: absorb the right sibling.
        let right_page_id = {
            let parent = InternalRef::<K>::new(parent_guard);
            parent.value_at(index + 1)
        };
        let mut right_guard = self.bpm.fetch_page_write(right_page_id)?;
        let separator = InternalRef::<K>::new(parent_guard).key_at(index + 1);
        {
            let mut right = InternalMut::<K>::new(&mut right_guard);
            right.set_key_at(0, separator);
            let mut node = InternalMut::<K>::new(&mut guard);
            right.merge_to_left(&mut node);
        }
        let mut parent = InternalMut::<K>::new(&mut **parent_guard);
        parent.remove_at(index + 1);
        drop(right_guard);
        drop(guard);
        self.bpm.delete_page(right_page_id)?;
        Ok(())
    }

    /// Iterator over every pair, ascending.
    pub fn iter(&self) -> io::Result<TreeIterator<'_, K, V>> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let mut page_id = guard.read_at::<TreeHeader>(0).root_page_id;
        loop {
            if page_id == INVALID_PAGE_ID {
                return Ok(TreeIterator::empty(&self.bpm));
            }
            let child = self.bpm.fetch_page_read(page_id)?;
            guard = child;
            if guard.btree_page_type() == BTreePageType::Leaf {
                return Ok(TreeIterator::new(&self.bpm, guard, 0));
            }
            let node = InternalRef::<K>::new(&guard);
            page_id = node.value_at(0);
        }
    }

    /// Iterator positioned at the first entry with key >= `key`.
    pub fn iter_from(&self, key: &K) -> io::Result<TreeIterator<'_, K, V>> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let mut page_id = guard.read_at::<TreeHeader>(0).root_page_id;
        loop {
            if page_id == INVALID_PAGE_ID {
                return Ok(TreeIterator::empty(&self.bpm));
            }
            let child = self.bpm.fetch_page_read(page_id)?;
            guard = child;
            if guard.btree_page_type() == BTreePageType::Leaf {
                let (index, size, next_page_id) = {
                    let leaf = LeafRef::<K, V>::new(&guard);
                    let mut index = 0;
                    while index < leaf.size() && leaf.key_at(index) < *key {
                        index += 1;
                    }
                    (index, leaf.size(), leaf.next_page_id())
                };
                if index == size && next_page_id != INVALID_PAGE_ID {
                    let next_guard = self.bpm.fetch_page_read(next_page_id)?;
                    return Ok(TreeIterator::new(&self.bpm, next_guard, 0));
                }
                return Ok(TreeIterator::new(&self.bpm, guard, index));
            }
            let node = InternalRef::<K>::new(&guard);
            let index = Self::internal_upper_bound(&node, key);
            page_id = node.value_at(index - 1);
        }
    }

    /// Number of levels, counting the leaf level; 0 for an empty tree.
    pub fn height(&self) -> io::Result<usize> {
        let mut guard = self.bpm.fetch_page_read(self.header_page_id)?;
        let mut page_id = guard.read_at::<TreeHeader>(0).root_page_id;
        let mut height = 0;
        loop {
            if page_id == INVALID_PAGE_ID {
                return Ok(height);
            }
            let child = self.bpm.fetch_page_read(page_id)?;
            guard = child;
            height += 1;
            if guard.btree_page_type() == BTreePageType::Leaf {
                return Ok(height);
            }
            let node = InternalRef::<K>::new(&guard);
            page_id = node.value_at(0);
        }
    }

    /// Walks the whole tree and panics on any structural violation: node
    /// size bounds, separator ordering, uniform leaf depth, or a leaf chain
    /// that disagrees with the in-order traversal.
    pub fn validate(&self) -> io::Result<()> {
        let root_page_id = {
            let guard = self.bpm.fetch_page_read(self.header_page_id)?;
            guard.read_at::<TreeHeader>(0).root_page_id
        };
        if root_page_id == INVALID_PAGE_ID {
            return Ok(());
        }
        let mut leaf_depth = None;
        let mut in_order = Vec::new();
        self.validate_node(root_page_id, 1, true, None, None, &mut leaf_depth, &mut in_order)?;

        for window in in_order.windows(2) {
            assert!(window[0] < window[1], "keys are not strictly increasing");
        }
        let mut chained = Vec::with_capacity(in_order.len());
        for pair in self.iter()? {
            chained.push(pair?.0);
        }
        assert!(
            chained == in_order,
            "leaf chain disagrees with in-order traversal"
        );
        Ok(())
    }

    fn validate_node(
        &self,
        page_id: PageId,
        depth: usize,
        is_root: bool,
        low: Option<K>,
        high: Option<K>,
        leaf_depth: &mut Option<usize>,
        in_order: &mut Vec<K>,
    ) -> io::Result<()> {
        let guard = self.bpm.fetch_page_read(page_id)?;
        match guard.btree_page_type() {
            BTreePageType::Leaf => {
                let leaf = LeafRef::<K, V>::new(&guard);
                let size = leaf.size();
                assert!(size < leaf.max_size(), "leaf over max size");
                if is_root {
                    assert!(size >= 1, "root leaf is empty");
                } else {
                    assert!(size >= leaf.min_size(), "leaf under min size");
                }
                match *leaf_depth {
                    None => *leaf_depth = Some(depth),
                    Some(expected) => assert_eq!(expected, depth, "leaves at unequal depth"),
                }
                for i in 0..size {
                    let k = leaf.key_at(i);
                    if i > 0 {
                        assert!(leaf.key_at(i - 1) < k, "leaf keys out of order");
                    }
                    assert!(low.map_or(true, |l| k >= l), "leaf key below subtree bound");
                    assert!(high.map_or(true, |h| k < h), "leaf key above subtree bound");
                    in_order.push(k);
                }
            }
            BTreePageType::Internal => {
                let children = {
                    let node = InternalRef::<K>::new(&guard);
                    let size = node.size();
                    assert!(size < node.max_size(), "internal node over max size");
                    if is_root {
                        assert!(size >= 2, "root internal has a single child");
                    } else {
                        assert!(size >= node.min_size(), "internal node under min size");
                    }
                    for i in 2..size {
                        assert!(
                            node.key_at(i - 1) < node.key_at(i),
                            "separators out of order"
                        );
                    }
                    let mut children = Vec::with_capacity(size);
                    for i in 0..size {
                        let child_low = if i == 0 { low } else { Some(node.key_at(i)) };
                        let child_high = if i + 1 < size {
                            Some(node.key_at(i + 1))
                        } else {
                            high
                        };
                        children.push((node.value_at(i), child_low, child_high));
                    }
                    children
                };
                for (child, child_low, child_high) in children {
                    self.validate_node(
                        child,
                        depth + 1,
                        false,
                        child_low,
                        child_high,
                        leaf_depth,
                        in_order,
                    )?;
                }
            }
            BTreePageType::Invalid => panic!("reached an uninitialized page"),
        }
        Ok(())
    }

    fn leaf_upper_bound(leaf: &LeafRef<'_, K, V>, key: &K) -> usize {
        let mut index = 0;
        while index < leaf.size() && leaf.key_at(index) <= *key {
            index += 1;
        }
        index
    }

    /// First slot whose key is strictly greater than `key`; slot 0 carries
    /// no key, so the scan starts at 1.
    fn internal_upper_bound(node: &InternalRef<'_, K>, key: &K) -> usize {
        let mut index = 1;
        while index < node.size() && node.key_at(index) <= *key {
            index += 1;
        }
        index
    }
}

/// Forward iterator anchored on a read-latched leaf. Stepping past the end
/// of a leaf fetches the next leaf's guard before dropping the current one,
/// so each leaf is seen as a consistent snapshot.
pub struct TreeIterator<'a, K, V> {
    bpm: &'a BufferPoolManager,
    guard: Option<crate::page_guard::ReadPageGuard<'a>>,
    index: usize,
    _marker: PhantomData<(K, V)>,
}

impl<'a, K, V> TreeIterator<'a, K, V> {
    fn new(
        bpm: &'a BufferPoolManager,
        guard: crate::page_guard::ReadPageGuard<'a>,
        index: usize,
    ) -> Self {
        Self {
            bpm,
            guard: Some(guard),
            index,
            _marker: PhantomData,
        }
    }

    fn empty(bpm: &'a BufferPoolManager) -> Self {
        Self {
            bpm,
            guard: None,
            index: 0,
            _marker: PhantomData,
        }
    }
}

impl<K, V> Iterator for TreeIterator<'_, K, V>
where
    K: Copy + Ord,
    V: Copy,
{
    type Item = io::Result<(K, V)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let guard = self.guard.as_ref()?;
            let (size, next_page_id, pair) = {
                let leaf = LeafRef::<K, V>::new(guard);
                let pair = if self.index < leaf.size() {
                    Some(leaf.pair_at(self.index))
                } else {
                    None
                };
                (leaf.size(), leaf.next_page_id(), pair)
            };

            if let Some(pair) = pair {
                self.index += 1;
                return Some(Ok(pair));
            }
            debug_assert_eq!(self.index, size);
            if next_page_id == INVALID_PAGE_ID {
                self.guard = None;
                return None;
            }
            match self.bpm.fetch_page_read(next_page_id) {
                Ok(next_guard) => {
                    self.guard = Some(next_guard);
                    self.index = 0;
                }
                Err(e) => {
                    self.guard = None;
                    return Some(Err(e));
                }
            }
        }
    }
}
