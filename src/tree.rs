//! k-ary tree topology and owner routing.
//!
//! Allocator ranks form a rooted k-ary tree: rank 0 is the root, rank `r > 0`
//! hangs under `(r - 1) / k`. Routing toward an owner rank is purely local:
//! a node only ever forwards to one of its children or to its parent.

use crate::storage::Rank;

/// A node's view of the allocator tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub rank: Rank,
    pub nb_children: usize,
    pub tree_size: usize,
    pub children: Vec<Rank>,
    pub parent: Option<Rank>,
}

impl Topology {
    pub fn new(rank: Rank, nb_children: usize, tree_size: usize) -> Self {
        let children = (rank * nb_children + 1..=(rank + 1) * nb_children)
            .filter(|&c| c < tree_size)
            .collect();
        let parent = if rank == 0 { None } else { Some((rank - 1) / nb_children) };
        Topology { rank, nb_children, tree_size, children, parent }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_child(&self, r: Rank) -> bool {
        self.children.contains(&r)
    }

    /// Next hop on the way to `owner`.
    ///
    /// Direct child and direct parent are short-circuited; otherwise the
    /// ancestor path decides between descending into the child that leads to
    /// `owner` and climbing to the parent. `None` means the tree holds no
    /// route (an owner rank outside the tree, seen from the root).
    pub fn next_hop_toward(&self, owner: Rank) -> Option<Rank> {
        if self.is_child(owner) || self.parent == Some(owner) {
            return Some(owner);
        }
        let (ancestor, path) = is_ancestor(self.rank, owner, self.nb_children, self.tree_size);
        if ancestor {
            // path ends at self; the entry before it is the child to descend
            // into. A single-entry path means owner hangs directly below.
            if path.len() < 2 {
                Some(owner)
            } else {
                Some(path[path.len() - 2])
            }
        } else {
            self.parent
        }
    }
}

/// Is rank `a` on the root-to-`n` path of the k-ary tree?
///
/// Returns the ancestor chain of `n` (nearest first) accumulated up to the
/// point of decision. The accumulator is a fresh vector on every call.
pub fn is_ancestor(a: Rank, n: Rank, k: usize, tree_size: usize) -> (bool, Vec<Rank>) {
    let mut path = Vec::new();
    if n == 0 || n >= tree_size {
        return (false, path);
    }
    let mut n = n;
    loop {
        let up = (n - 1) / k;
        path.push(up);
        if up == a {
            return (true, path);
        }
        if up == 0 {
            return (false, path);
        }
        n = up;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn topology_derives_children_and_parent() {
        let t = Topology::new(0, 3, 4);
        assert_eq!(t.children, vec![1, 2, 3]);
        assert_eq!(t.parent, None);

        let t = Topology::new(1, 3, 13);
        assert_eq!(t.children, vec![4, 5, 6]);
        assert_eq!(t.parent, Some(0));

        // children are clipped to the allocator count
        let t = Topology::new(1, 3, 5);
        assert_eq!(t.children, vec![4]);
    }

    #[test]
    fn ancestor_path_ends_at_the_querying_rank() {
        let (yes, path) = is_ancestor(0, 13, 3, 14);
        assert!(yes);
        assert_eq!(path, vec![4, 1, 0]);

        let (yes, path) = is_ancestor(1, 13, 3, 14);
        assert!(yes);
        assert_eq!(path, vec![4, 1]);
    }

    #[test]
    fn non_ancestors_and_out_of_tree_ranks_are_rejected() {
        let (yes, _) = is_ancestor(2, 13, 3, 14);
        assert!(!yes);

        let (yes, path) = is_ancestor(1, 0, 3, 14);
        assert!(!yes);
        assert!(path.is_empty());

        let (yes, path) = is_ancestor(0, 40, 3, 14);
        assert!(!yes);
        assert!(path.is_empty());
    }

    #[test]
    fn next_hop_descends_ascends_or_short_circuits() {
        let root = Topology::new(0, 3, 14);
        // deep descendant: descend into the subtree that leads there
        assert_eq!(root.next_hop_toward(13), Some(1));
        // direct child
        assert_eq!(root.next_hop_toward(2), Some(2));

        let mid = Topology::new(1, 3, 14);
        assert_eq!(mid.next_hop_toward(13), Some(4));
        assert_eq!(mid.next_hop_toward(0), Some(0));
        // sibling subtree: climb first
        assert_eq!(mid.next_hop_toward(2), Some(0));

        let leaf = Topology::new(13, 3, 14);
        assert_eq!(leaf.next_hop_toward(1), Some(4));
    }

    #[test]
    fn every_route_reaches_its_owner_within_twice_the_depth() {
        let k = 3;
        let tree_size = 14;
        let depth = 3; // ranks 0..14 with k=3 span 3 levels below the root
        for src in 0..tree_size {
            for owner in 0..tree_size {
                let mut at = src;
                let mut hops = 0;
                while at != owner {
                    let topo = Topology::new(at, k, tree_size);
                    at = topo.next_hop_toward(owner).expect("route must exist");
                    hops += 1;
                    assert!(hops <= 2 * depth, "route {src}->{owner} did not terminate");
                }
            }
        }
    }
}
