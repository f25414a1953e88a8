//! Ordered in-memory storage backed by an AVL tree.
//!
//! [`AvlTree`] is the only storage engine of the server. Keys are byte
//! strings compared in lexicographic byte order; values are opaque to the
//! tree. Every mutation rebalances the path it touched, so every node keeps
//! `|height(left) - height(right)| <= 1`.
//!
//! Nodes are owned boxes. Mutations are recursive and each step returns the
//! new root of the subtree it was given, which is how rotations splice
//! themselves back into the parent.

use std::cmp::Ordering;
use std::fmt;

use tracing::info;

type Link<V> = Option<Box<Node<V>>>;

struct Node<V> {
    key: Box<[u8]>,
    value: V,
    height: u32,
    left: Link<V>,
    right: Link<V>,
}

impl<V> Node<V> {
    fn leaf(key: Box<[u8]>, value: V) -> Box<Self> {
        Box::new(Self {
            key,
            value,
            height: 1,
            left: None,
            right: None,
        })
    }

    fn update_height(&mut self) {
        self.height = 1 + height(&self.left).max(height(&self.right));
    }

    fn balance(&self) -> i64 {
        i64::from(height(&self.left)) - i64::from(height(&self.right))
    }
}

fn height<V>(link: &Link<V>) -> u32 {
    link.as_ref().map_or(0, |node| node.height)
}

/// Self-balancing ordered map from byte-string keys to values.
pub struct AvlTree<V> {
    root: Link<V>,
    len: usize,
}

impl<V> Default for AvlTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> AvlTree<V> {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self { root: None, len: 0 }
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Height of the root, 0 for an empty tree.
    pub fn height(&self) -> u32 {
        height(&self.root)
    }

    /// Inserts `value` under `key`, returning the value it replaced.
    ///
    /// An existing key is updated in place: the node keeps its position,
    /// children and height, so the tree shape does not change.
    pub fn set(&mut self, key: impl Into<Box<[u8]>>, value: V) -> Option<V> {
        let (root, replaced) = insert(self.root.take(), key.into(), value);
        self.root = Some(root);
        if replaced.is_none() {
            self.len += 1;
        }
        replaced
    }

    /// Looks up `key` without touching the tree shape.
    pub fn get(&self, key: &[u8]) -> Option<&V> {
        let mut current = self.root.as_deref();
        while let Some(node) = current {
            match key.cmp(&node.key) {
                Ordering::Less => current = node.left.as_deref(),
                Ordering::Greater => current = node.right.as_deref(),
                Ordering::Equal => return Some(&node.value),
            }
        }
        info!(key = %String::from_utf8_lossy(key), "key not found");
        None
    }

    /// Removes `key`, returning its value if it was present.
    pub fn delete(&mut self, key: &[u8]) -> Option<V> {
        let (root, removed) = remove(self.root.take(), key);
        self.root = root;
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    /// Drops every node and value.
    pub fn clear(&mut self) {
        // Unlink iteratively so a large tree cannot exhaust the stack on drop.
        let mut pending: Vec<Box<Node<V>>> = self.root.take().into_iter().collect();
        while let Some(mut node) = pending.pop() {
            pending.extend(node.left.take());
            pending.extend(node.right.take());
        }
        self.len = 0;
    }

    /// In-order iterator over `(key, value)` pairs, ascending by key.
    pub fn iter(&self) -> Iter<'_, V> {
        let mut iter = Iter { stack: Vec::new() };
        iter.push_left(self.root.as_deref());
        iter
    }

    /// Walks the whole tree and reports the first structural violation.
    ///
    /// Checks key ordering, stored heights, the AVL balance bound and the
    /// entry count.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut count = 0;
        check_subtree(&self.root, None, None, &mut count)?;
        if count != self.len {
            return Err(InvariantViolation::Count {
                counted: count,
                recorded: self.len,
            });
        }
        Ok(())
    }
}

impl<V> Drop for AvlTree<V> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<V: fmt::Debug> fmt::Debug for AvlTree<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
            .finish()
    }
}

fn insert<V>(link: Link<V>, key: Box<[u8]>, value: V) -> (Box<Node<V>>, Option<V>) {
    let Some(mut node) = link else {
        return (Node::leaf(key, value), None);
    };

    match key.cmp(&node.key) {
        Ordering::Less => {
            let (left, replaced) = insert(node.left.take(), key, value);
            node.left = Some(left);
            if replaced.is_some() {
                return (node, replaced);
            }
        }
        Ordering::Greater => {
            let (right, replaced) = insert(node.right.take(), key, value);
            node.right = Some(right);
            if replaced.is_some() {
                return (node, replaced);
            }
        }
        Ordering::Equal => {
            let replaced = std::mem::replace(&mut node.value, value);
            return (node, Some(replaced));
        }
    }

    (rebalance(node), None)
}

fn remove<V>(link: Link<V>, key: &[u8]) -> (Link<V>, Option<V>) {
    let Some(mut node) = link else {
        return (None, None);
    };

    let removed = match key.cmp(&node.key) {
        Ordering::Less => {
            let (left, removed) = remove(node.left.take(), key);
            node.left = left;
            removed
        }
        Ordering::Greater => {
            let (right, removed) = remove(node.right.take(), key);
            node.right = right;
            removed
        }
        Ordering::Equal => match (node.left.take(), node.right.take()) {
            (None, child) | (child, None) => return (child, Some(node.value)),
            (Some(left), Some(right)) => {
                // Two children: the in-order successor takes over this slot.
                let (right, successor_key, successor_value) = take_min(right);
                node.left = Some(left);
                node.right = right;
                node.key = successor_key;
                Some(std::mem::replace(&mut node.value, successor_value))
            }
        },
    };

    if removed.is_none() {
        return (Some(node), None);
    }
    (Some(rebalance(node)), removed)
}

/// Detaches the minimum entry of the subtree rooted at `node`.
fn take_min<V>(mut node: Box<Node<V>>) -> (Link<V>, Box<[u8]>, V) {
    match node.left.take() {
        None => {
            let Node {
                key, value, right, ..
            } = *node;
            (right, key, value)
        }
        Some(left) => {
            let (left, key, value) = take_min(left);
            node.left = left;
            (Some(rebalance(node)), key, value)
        }
    }
}

fn rebalance<V>(mut node: Box<Node<V>>) -> Box<Node<V>> {
    node.update_height();
    match node.balance() {
        2 => {
            if let Some(left) = node.left.take() {
                // LR: rotate the left child first.
                node.left = Some(if left.balance() < 0 {
                    rotate_left(left)
                } else {
                    left
                });
            }
            rotate_right(node)
        }
        -2 => {
            if let Some(right) = node.right.take() {
                // RL: rotate the right child first.
                node.right = Some(if right.balance() > 0 {
                    rotate_right(right)
                } else {
                    right
                });
            }
            rotate_left(node)
        }
        _ => node,
    }
}

fn rotate_right<V>(mut y: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut x) = y.left.take() else {
        return y;
    };
    y.left = x.right.take();
    y.update_height();
    x.right = Some(y);
    x.update_height();
    x
}

fn rotate_left<V>(mut x: Box<Node<V>>) -> Box<Node<V>> {
    let Some(mut y) = x.right.take() else {
        return x;
    };
    x.right = y.left.take();
    x.update_height();
    y.left = Some(x);
    y.update_height();
    y
}

fn check_subtree<V>(
    link: &Link<V>,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    count: &mut usize,
) -> Result<u32, InvariantViolation> {
    let Some(node) = link else {
        return Ok(0);
    };

    let key = &node.key[..];
    if lower.is_some_and(|lower| key <= lower) || upper.is_some_and(|upper| key >= upper) {
        return Err(InvariantViolation::Order {
            key: String::from_utf8_lossy(key).into_owned(),
        });
    }

    let left = check_subtree(&node.left, lower, Some(key), count)?;
    let right = check_subtree(&node.right, Some(key), upper, count)?;
    *count += 1;

    let expected = 1 + left.max(right);
    if node.height != expected {
        return Err(InvariantViolation::Height {
            key: String::from_utf8_lossy(key).into_owned(),
            stored: node.height,
            expected,
        });
    }
    if left.abs_diff(right) > 1 {
        return Err(InvariantViolation::Balance {
            key: String::from_utf8_lossy(key).into_owned(),
            left,
            right,
        });
    }
    Ok(expected)
}

/// A broken structural property found by [`AvlTree::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("key {key:?} is out of order")]
    Order { key: String },
    #[error("node {key:?} stores height {stored}, expected {expected}")]
    Height {
        key: String,
        stored: u32,
        expected: u32,
    },
    #[error("node {key:?} is unbalanced: left height {left}, right height {right}")]
    Balance { key: String, left: u32, right: u32 },
    #[error("tree holds {counted} nodes but records {recorded}")]
    Count { counted: usize, recorded: usize },
}

/// In-order iterator returned by [`AvlTree::iter`].
pub struct Iter<'a, V> {
    stack: Vec<&'a Node<V>>,
}

impl<'a, V> Iter<'a, V> {
    fn push_left(&mut self, mut current: Option<&'a Node<V>>) {
        while let Some(node) = current {
            self.stack.push(node);
            current = node.left.as_deref();
        }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        self.push_left(node.right.as_deref());
        Some((&node.key[..], &node.value))
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    use super::*;

    fn keys<V>(tree: &AvlTree<V>) -> Vec<String> {
        tree.iter()
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect()
    }

    #[test]
    fn set_then_get_returns_value() {
        let mut tree = AvlTree::new();
        assert_eq!(tree.set(&b"foo"[..], "bar"), None);
        assert_eq!(tree.get(b"foo"), Some(&"bar"));
        assert_eq!(tree.get(b"fo"), None);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let mut tree = AvlTree::new();
        for key in ["m", "c", "x", "a"] {
            tree.set(key.as_bytes(), 0);
        }
        let height = tree.height();

        assert_eq!(tree.set(&b"c"[..], 1), Some(0));
        assert_eq!(tree.set(&b"c"[..], 2), Some(1));

        assert_eq!(tree.len(), 4);
        assert_eq!(tree.height(), height);
        assert_eq!(tree.get(b"c"), Some(&2));
        assert_eq!(keys(&tree), ["a", "c", "m", "x"]);
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = AvlTree::new();
        for i in 0..1024u32 {
            tree.set(format!("key{i:05}").into_bytes(), i);
            tree.check_invariants().expect("balanced after insert");
        }
        assert_eq!(tree.len(), 1024);
        // A perfectly balanced tree of 1024 nodes has height 11; AVL allows ~1.44x.
        assert!(tree.height() <= 15, "height {}", tree.height());
    }

    #[test]
    fn rotations_cover_all_four_cases() {
        // LL, RR, LR, RL in that order; each collapses to a three-node tree.
        for order in [["c", "b", "a"], ["a", "b", "c"], ["c", "a", "b"], ["a", "c", "b"]] {
            let mut tree = AvlTree::new();
            for key in order {
                tree.set(key.as_bytes(), ());
            }
            tree.check_invariants().expect("rotation restores balance");
            assert_eq!(tree.height(), 2, "order {order:?}");
            assert_eq!(keys(&tree), ["a", "b", "c"]);
        }
    }

    #[test]
    fn delete_present_and_absent_keys() {
        let mut tree = AvlTree::new();
        for key in ["d", "b", "f", "a", "c", "e", "g"] {
            tree.set(key.as_bytes(), key.to_uppercase());
        }

        assert_eq!(tree.delete(b"zz"), None);
        assert_eq!(tree.len(), 7);

        // "d" is the root with two children; its successor "e" moves up.
        assert_eq!(tree.delete(b"d"), Some("D".to_string()));
        assert_eq!(tree.len(), 6);
        assert_eq!(tree.get(b"d"), None);
        assert_eq!(tree.get(b"e"), Some(&"E".to_string()));
        assert_eq!(keys(&tree), ["a", "b", "c", "e", "f", "g"]);
        tree.check_invariants().expect("balanced after delete");
    }

    #[test]
    fn delete_rebalances_on_the_way_up() {
        let mut tree = AvlTree::new();
        for key in ["b", "a", "d", "c", "e"] {
            tree.set(key.as_bytes(), ());
        }
        tree.delete(b"a");
        tree.check_invariants().expect("right-heavy delete rotates");
        assert_eq!(tree.height(), 3);
        assert_eq!(keys(&tree), ["b", "c", "d", "e"]);
    }

    #[test]
    fn random_keys_insert_then_delete_empties_tree() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut keys: Vec<Vec<u8>> = (0..2000u32)
            .map(|i| format!("{:08x}", i.wrapping_mul(2_654_435_761)).into_bytes())
            .collect();
        keys.shuffle(&mut rng);

        let mut tree = AvlTree::new();
        for key in &keys {
            tree.set(key.clone(), key.len());
        }
        tree.check_invariants().expect("balanced after inserts");
        assert_eq!(tree.len(), keys.len());

        keys.shuffle(&mut rng);
        for (removed, key) in keys.iter().enumerate() {
            assert!(tree.delete(key).is_some());
            if removed % 97 == 0 {
                tree.check_invariants().expect("balanced during deletes");
            }
        }
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.height(), 0);
        tree.check_invariants().expect("empty tree is valid");
    }

    #[test]
    fn keys_compare_as_bytes() {
        let mut tree = AvlTree::new();
        for key in [&b"b"[..], b"B", b"\xff", b"", b"ab", b"a"] {
            tree.set(key, ());
        }
        let ordered: Vec<&[u8]> = tree.iter().map(|(k, _)| k).collect();
        assert_eq!(ordered, [&b""[..], b"B", b"a", b"ab", b"b", b"\xff"]);
    }

    #[test]
    fn clear_releases_everything() {
        let mut tree = AvlTree::new();
        for i in 0..100u8 {
            tree.set(vec![i], i);
        }
        tree.clear();
        assert!(tree.is_empty());
        assert_eq!(tree.len(), 0);
        assert_eq!(tree.iter().count(), 0);
        assert_eq!(tree.get(&[1]), None);
    }
}
