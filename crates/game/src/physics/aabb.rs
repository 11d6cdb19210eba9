use std::collections::HashMap;

use glam::DVec2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub lower: DVec2,
    pub upper: DVec2,
}

impl Aabb {
    pub fn new(lower: DVec2, upper: DVec2) -> Self {
        Self { lower, upper }
    }

    pub fn point(p: DVec2) -> Self {
        Self { lower: p, upper: p }
    }

    pub fn union(self, other: Aabb) -> Aabb {
        Aabb {
            lower: self.lower.min(other.lower),
            upper: self.upper.max(other.upper),
        }
    }

    pub fn contains(&self, other: &Aabb) -> bool {
        self.lower.x <= other.lower.x
            && self.lower.y <= other.lower.y
            && self.upper.x >= other.upper.x
            && self.upper.y >= other.upper.y
    }

    pub fn overlaps(&self, other: &Aabb) -> bool {
        self.lower.x <= other.upper.x
            && other.lower.x <= self.upper.x
            && self.lower.y <= other.upper.y
            && other.lower.y <= self.upper.y
    }

    pub fn perimeter(&self) -> f64 {
        let extent = self.upper - self.lower;
        2.0 * (extent.x + extent.y)
    }

    pub fn expanded(&self, margin: f64) -> Aabb {
        Aabb {
            lower: self.lower - DVec2::splat(margin),
            upper: self.upper + DVec2::splat(margin),
        }
    }
}

const NULL: usize = usize::MAX;

/// Leaves are fattened by this much so slow drift does not force a
/// reinsert every step.
const FAT_MARGIN: f64 = 5.0;

#[derive(Debug, Clone)]
struct Node {
    bounds: Aabb,
    parent: usize,
    left: usize,
    right: usize,
    /// Arena slot for leaves, `NULL` for internal nodes.
    slot: usize,
    next_free: usize,
}

/// Dynamic bounding-volume tree over the body arena. Insert, remove and
/// move are O(log n); pair queries walk the tree per leaf.
pub struct AabbTree {
    nodes: Vec<Node>,
    root: usize,
    free: usize,
    leaves: HashMap<usize, usize>,
}

impl Default for AabbTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AabbTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            root: NULL,
            free: NULL,
            leaves: HashMap::new(),
        }
    }

    pub fn root_bounds(&self) -> Option<Aabb> {
        if self.root == NULL {
            None
        } else {
            Some(self.nodes[self.root].bounds)
        }
    }

    pub fn insert(&mut self, slot: usize, bounds: Aabb) {
        let leaf = self.allocate(bounds.expanded(FAT_MARGIN), slot);
        self.leaves.insert(slot, leaf);
        self.insert_leaf(leaf);
    }

    pub fn remove(&mut self, slot: usize) {
        if let Some(leaf) = self.leaves.remove(&slot) {
            self.remove_leaf(leaf);
            self.release(leaf);
        }
    }

    /// Reinsert only when the body outgrew its fat bounds.
    pub fn update(&mut self, slot: usize, bounds: Aabb) {
        match self.leaves.get(&slot) {
            Some(&leaf) => {
                if self.nodes[leaf].bounds.contains(&bounds) {
                    return;
                }
                self.remove_leaf(leaf);
                self.nodes[leaf].bounds = bounds.expanded(FAT_MARGIN);
                self.insert_leaf(leaf);
            }
            None => self.insert(slot, bounds),
        }
    }

    /// Visit the slots of every leaf overlapping `bounds`.
    pub fn query(&self, bounds: &Aabb, mut visit: impl FnMut(usize)) {
        let mut stack = Vec::with_capacity(32);
        if self.root != NULL {
            stack.push(self.root);
        }
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !node.bounds.overlaps(bounds) {
                continue;
            }
            if node.slot != NULL {
                visit(node.slot);
            } else {
                stack.push(node.left);
                stack.push(node.right);
            }
        }
    }

    /// All overlapping leaf pairs, each reported once with `a < b`, in
    /// slot order so solve order is stable across runs.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for (&slot, &leaf) in &self.leaves {
            let bounds = self.nodes[leaf].bounds;
            self.query(&bounds, |other| {
                if slot < other {
                    out.push((slot, other));
                }
            });
        }
        out.sort_unstable();
        out
    }

    fn allocate(&mut self, bounds: Aabb, slot: usize) -> usize {
        if self.free != NULL {
            let index = self.free;
            self.free = self.nodes[index].next_free;
            self.nodes[index] = Node {
                bounds,
                parent: NULL,
                left: NULL,
                right: NULL,
                slot,
                next_free: NULL,
            };
            index
        } else {
            self.nodes.push(Node {
                bounds,
                parent: NULL,
                left: NULL,
                right: NULL,
                slot,
                next_free: NULL,
            });
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, index: usize) {
        self.nodes[index].next_free = self.free;
        self.nodes[index].slot = NULL;
        self.free = index;
    }

    fn insert_leaf(&mut self, leaf: usize) {
        if self.root == NULL {
            self.root = leaf;
            self.nodes[leaf].parent = NULL;
            return;
        }

        // Descend towards the sibling that grows the tree least.
        let leaf_bounds = self.nodes[leaf].bounds;
        let mut index = self.root;
        while self.nodes[index].slot == NULL {
            let left = self.nodes[index].left;
            let right = self.nodes[index].right;

            let combined = self.nodes[index].bounds.union(leaf_bounds).perimeter();
            let cost_parent = 2.0 * combined;

            let cost_left = self.descend_cost(left, leaf_bounds);
            let cost_right = self.descend_cost(right, leaf_bounds);

            if cost_parent < cost_left && cost_parent < cost_right {
                break;
            }
            index = if cost_left < cost_right { left } else { right };
        }

        let sibling = index;
        let old_parent = self.nodes[sibling].parent;
        let new_parent = self.allocate(self.nodes[sibling].bounds.union(leaf_bounds), NULL);
        self.nodes[new_parent].parent = old_parent;
        self.nodes[new_parent].left = sibling;
        self.nodes[new_parent].right = leaf;
        self.nodes[sibling].parent = new_parent;
        self.nodes[leaf].parent = new_parent;

        if old_parent == NULL {
            self.root = new_parent;
        } else if self.nodes[old_parent].left == sibling {
            self.nodes[old_parent].left = new_parent;
        } else {
            self.nodes[old_parent].right = new_parent;
        }

        self.refit_upwards(new_parent);
    }

    fn descend_cost(&self, child: usize, bounds: Aabb) -> f64 {
        let child_bounds = self.nodes[child].bounds;
        let combined = child_bounds.union(bounds).perimeter();
        if self.nodes[child].slot != NULL {
            combined
        } else {
            combined - child_bounds.perimeter()
        }
    }

    fn remove_leaf(&mut self, leaf: usize) {
        if self.root == leaf {
            self.root = NULL;
            return;
        }

        let parent = self.nodes[leaf].parent;
        let grandparent = self.nodes[parent].parent;
        let sibling = if self.nodes[parent].left == leaf {
            self.nodes[parent].right
        } else {
            self.nodes[parent].left
        };

        if grandparent == NULL {
            self.root = sibling;
            self.nodes[sibling].parent = NULL;
        } else {
            if self.nodes[grandparent].left == parent {
                self.nodes[grandparent].left = sibling;
            } else {
                self.nodes[grandparent].right = sibling;
            }
            self.nodes[sibling].parent = grandparent;
            self.refit_upwards(grandparent);
        }
        self.release(parent);
    }

    fn refit_upwards(&mut self, mut index: usize) {
        while index != NULL {
            let left = self.nodes[index].left;
            let right = self.nodes[index].right;
            self.nodes[index].bounds = self.nodes[left].bounds.union(self.nodes[right].bounds);
            index = self.nodes[index].parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(center: DVec2, half: f64) -> Aabb {
        Aabb::new(center - DVec2::splat(half), center + DVec2::splat(half))
    }

    #[test]
    fn root_bounds_cover_all_leaves() {
        let mut tree = AabbTree::new();
        tree.insert(0, square(DVec2::new(0.0, 0.0), 1.0));
        tree.insert(1, square(DVec2::new(100.0, 50.0), 1.0));
        tree.insert(2, square(DVec2::new(-40.0, 10.0), 1.0));

        let root = tree.root_bounds().unwrap();
        assert!(root.lower.x <= -41.0 && root.upper.x >= 101.0);
        assert!(root.lower.y <= -1.0 && root.upper.y >= 51.0);
    }

    #[test]
    fn pairs_only_report_overlaps() {
        let mut tree = AabbTree::new();
        tree.insert(0, square(DVec2::new(0.0, 0.0), 2.0));
        tree.insert(1, square(DVec2::new(3.0, 0.0), 2.0));
        tree.insert(2, square(DVec2::new(500.0, 0.0), 2.0));

        let pairs = tree.pairs();
        assert!(pairs.contains(&(0, 1)));
        assert!(!pairs.iter().any(|&(a, b)| a == 2 || b == 2));
    }

    #[test]
    fn update_tracks_movement() {
        let mut tree = AabbTree::new();
        tree.insert(0, square(DVec2::new(0.0, 0.0), 1.0));
        tree.insert(1, square(DVec2::new(200.0, 0.0), 1.0));
        assert!(tree.pairs().is_empty());

        tree.update(1, square(DVec2::new(1.0, 0.0), 1.0));
        assert_eq!(tree.pairs(), vec![(0, 1)]);
    }

    #[test]
    fn remove_shrinks_the_tree() {
        let mut tree = AabbTree::new();
        tree.insert(0, square(DVec2::new(0.0, 0.0), 1.0));
        tree.insert(1, square(DVec2::new(1000.0, 0.0), 1.0));
        tree.remove(1);

        let root = tree.root_bounds().unwrap();
        assert!(root.upper.x < 100.0);

        tree.remove(0);
        assert!(tree.root_bounds().is_none());
    }
}
