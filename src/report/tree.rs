//! Prefix-shared call-tree: a trie over frame ids.
//!
//! Every observed stack collapses to the index of its terminal node; walking
//! parent links back to the root recovers the full stack. The writer uses a
//! `FrameTree<u64>` keyed on instruction pointers to intern native stacks,
//! the reader a `FrameTree<u32>` keyed on managed frame ids.

/// Index of a node in the tree. Index 0 is the reserved root.
pub type NodeIndex = u32;

/// The reserved root index ("no parent", empty stack).
pub const ROOT: NodeIndex = 0;

struct Node<K> {
    key: K,
    parent: NodeIndex,
    /// Children sorted by key for O(log k) lookup.
    children: Vec<(K, NodeIndex)>,
}

/// Append-only trie of frames. Once assigned, an index never changes.
pub struct FrameTree<K> {
    nodes: Vec<Node<K>>,
}

impl<K: Copy + Ord + Default> FrameTree<K> {
    /// Create a tree holding only the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node { key: K::default(), parent: ROOT, children: Vec::new() }],
        }
    }

    /// Number of nodes, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no stack has ever been interned.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Intern a root-first stack and return its terminal index.
    ///
    /// An empty stack maps to [`ROOT`].
    pub fn index_of(&mut self, stack: &[K]) -> NodeIndex {
        self.index_of_with(stack, |_, _, _| {})
    }

    /// Like [`index_of`](Self::index_of), invoking `on_new` for every node
    /// created along the way with `(index, key, parent_index)`.
    pub fn index_of_with<F>(&mut self, stack: &[K], mut on_new: F) -> NodeIndex
    where
        F: FnMut(NodeIndex, K, NodeIndex),
    {
        let mut current = ROOT;
        for &key in stack {
            let (child, created) = self.child(current, key);
            if created {
                on_new(child, key, current);
            }
            current = child;
        }
        current
    }

    /// Find or create the child of `parent` keyed by `key`.
    fn child(&mut self, parent: NodeIndex, key: K) -> (NodeIndex, bool) {
        match self.nodes[parent as usize].children.binary_search_by_key(&key, |&(k, _)| k) {
            Ok(pos) => (self.nodes[parent as usize].children[pos].1, false),
            Err(pos) => {
                let index = self.nodes.len() as NodeIndex;
                self.nodes.push(Node { key, parent, children: Vec::new() });
                self.nodes[parent as usize].children.insert(pos, (key, index));
                (index, true)
            }
        }
    }

    /// Append a node under an explicit parent without a lookup.
    ///
    /// Used when rebuilding a tree from a stream that already carries parent
    /// links; the caller guarantees the (parent, key) pair is new.
    pub fn push_node(&mut self, key: K, parent: NodeIndex) -> NodeIndex {
        let index = self.nodes.len() as NodeIndex;
        self.nodes.push(Node { key, parent, children: Vec::new() });
        let pos = self.nodes[parent as usize]
            .children
            .binary_search_by_key(&key, |&(k, _)| k)
            .unwrap_or_else(|p| p);
        self.nodes[parent as usize].children.insert(pos, (key, index));
        index
    }

    /// The `(key, parent_index)` of a node, or `None` for the root and for
    /// out-of-range indices.
    pub fn node(&self, index: NodeIndex) -> Option<(K, NodeIndex)> {
        if index == ROOT {
            return None;
        }
        self.nodes.get(index as usize).map(|n| (n.key, n.parent))
    }

    /// Reconstruct a stack leaf-first by walking parent links, stopping
    /// after `max_depth` frames (0 means unbounded).
    pub fn walk_up(&self, index: NodeIndex, max_depth: usize) -> Vec<K> {
        let mut out = Vec::new();
        let mut current = index;
        while let Some((key, parent)) = self.node(current) {
            out.push(key);
            if max_depth != 0 && out.len() >= max_depth {
                break;
            }
            current = parent;
        }
        out
    }
}

impl<K: Copy + Ord + Default> Default for FrameTree<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stack_is_root() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        assert_eq!(tree.index_of(&[]), ROOT);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_same_stack_same_index() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        let a = tree.index_of(&[1, 2, 3]);
        let b = tree.index_of(&[1, 2, 3]);
        assert_eq!(a, b);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_prefix_sharing() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        let deep = tree.index_of(&[1, 2, 3]);
        let shallow = tree.index_of(&[1, 2]);
        // The shallow stack's terminal is the deep stack's parent.
        let (_, parent) = tree.node(deep).unwrap();
        assert_eq!(parent, shallow);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn test_walk_up_is_leaf_first() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        let idx = tree.index_of(&[10, 20, 30]);
        assert_eq!(tree.walk_up(idx, 0), vec![30, 20, 10]);
        assert_eq!(tree.walk_up(idx, 2), vec![30, 20]);
    }

    #[test]
    fn test_indices_are_stable_across_inserts() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        let first = tree.index_of(&[5, 6]);
        let node_before = tree.node(first).unwrap();
        for stack in [[1u32, 2].as_slice(), &[5, 7], &[9, 9, 9]] {
            tree.index_of(stack);
        }
        assert_eq!(tree.node(first).unwrap(), node_before);
        assert_eq!(tree.index_of(&[5, 6]), first);
    }

    #[test]
    fn test_callback_fires_only_for_new_nodes() {
        let mut tree: FrameTree<u32> = FrameTree::new();
        let mut created = Vec::new();
        tree.index_of_with(&[1, 2], |idx, key, parent| created.push((idx, key, parent)));
        assert_eq!(created, vec![(1, 1, ROOT), (2, 2, 1)]);

        created.clear();
        tree.index_of_with(&[1, 2, 3], |idx, key, parent| created.push((idx, key, parent)));
        assert_eq!(created, vec![(3, 3, 2)]);
    }

    #[test]
    fn test_push_node_matches_index_of() {
        let mut by_insert: FrameTree<u64> = FrameTree::new();
        let a = by_insert.push_node(0x1000, ROOT);
        let b = by_insert.push_node(0x2000, a);
        assert_eq!(by_insert.walk_up(b, 0), vec![0x2000, 0x1000]);
        assert_eq!(by_insert.index_of(&[0x1000, 0x2000]), b);
    }
}
