//! Packed forest storage.
//!
//! Trees are flattened into shared pools: fixed-width decision nodes, a
//! parallel score array and a factor-bit image, each located per tree by a
//! cumulative height array. No pointers are stored anywhere; a tree is a
//! slice of each pool, and a node addresses its left child by delta (the
//! right child is the next slot).
//!
//! A node's 64-bit split word is read per predictor kind: the bits of an
//! `f64` threshold for numeric splits, or a packed `(offset, cardinality)`
//! pair into the tree's factor-bit slice for factor splits. Terminals
//! reuse the predictor field to carry their leaf index.

mod predict;
mod weight;

pub use predict::{PredictBlock, Predictor};
pub use weight::forest_weight;

use serde::{Deserialize, Serialize};

use crate::bits::JaggedBitMatrix;
use crate::frontier::{PackedSplit, PackedTree};

/// Fixed-width packed decision node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionNode {
    /// Split predictor at interior nodes; leaf index at terminals.
    pred: u32,
    /// Delta to the left child; zero marks a terminal.
    delta: u32,
    /// Threshold bits or `(offset << 32) | cardinality`.
    split: u64,
}

impl DecisionNode {
    fn terminal(leaf_idx: u32) -> Self {
        Self {
            pred: leaf_idx,
            delta: 0,
            split: 0,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.delta == 0
    }

    /// Leaf index; meaningful at terminals only.
    #[inline]
    pub fn leaf_idx(&self) -> u32 {
        debug_assert!(self.is_terminal());
        self.pred
    }

    #[inline]
    pub fn pred(&self) -> u32 {
        self.pred
    }

    #[inline]
    pub fn delta(&self) -> u32 {
        self.delta
    }

    /// Numeric threshold view of the split word.
    #[inline]
    pub fn threshold(&self) -> f64 {
        f64::from_bits(self.split)
    }

    /// Factor view of the split word: bit offset and cardinality.
    #[inline]
    pub fn bit_range(&self) -> (u32, u32) {
        ((self.split >> 32) as u32, self.split as u32)
    }
}

/// Packed forest over shared pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forest {
    n_pred_num: usize,
    /// Trained cardinality per factor predictor.
    fac_card: Vec<usize>,
    nodes: Vec<DecisionNode>,
    /// Scores parallel to `nodes`; meaningful at terminals.
    scores: Vec<f64>,
    /// Per-tree factor-bit images, one jagged row per tree.
    fac_bits: JaggedBitMatrix,
    /// Cumulative node counts per tree.
    node_height: Vec<usize>,
    /// Cumulative leaf counts per tree.
    leaf_height: Vec<usize>,
}

impl Forest {
    pub fn new(n_pred_num: usize, fac_card: Vec<usize>) -> Self {
        Self {
            n_pred_num,
            fac_card,
            nodes: Vec::new(),
            scores: Vec::new(),
            fac_bits: JaggedBitMatrix::empty(),
            node_height: Vec::new(),
            leaf_height: Vec::new(),
        }
    }

    #[inline]
    pub fn n_tree(&self) -> usize {
        self.node_height.len()
    }

    #[inline]
    pub fn n_pred_num(&self) -> usize {
        self.n_pred_num
    }

    #[inline]
    pub fn n_pred_fac(&self) -> usize {
        self.fac_card.len()
    }

    /// Trained cardinality of one factor predictor.
    #[inline]
    pub fn fac_card(&self, fac_idx: usize) -> usize {
        self.fac_card[fac_idx]
    }

    /// Append one packed tree to the pools. Trees must arrive in tree
    /// order; the trainer serializes the handover.
    pub fn push_tree(&mut self, tree: &PackedTree) {
        for (out_idx, &(pred, delta, split)) in tree.nodes.iter().enumerate() {
            let node = match split {
                PackedSplit::None => DecisionNode::terminal(0),
                PackedSplit::Threshold(v) => DecisionNode {
                    pred,
                    delta,
                    split: v.to_bits(),
                },
                PackedSplit::BitRange { offset, card } => DecisionNode {
                    pred,
                    delta,
                    split: ((offset as u64) << 32) | card as u64,
                },
            };
            self.nodes.push(node);
            self.scores.push(tree.scores[out_idx]);
        }

        // Terminals take their leaf index in emission order.
        let base = self.nodes.len() - tree.nodes.len();
        let mut leaf = 0u32;
        for node in &mut self.nodes[base..] {
            if node.is_terminal() {
                node.pred = leaf;
                leaf += 1;
            }
        }

        self.fac_bits.push_row(&tree.fac_bits);

        self.node_height.push(self.nodes.len());
        let prev_leaves = self.leaf_height.last().copied().unwrap_or(0);
        self.leaf_height.push(prev_leaves + tree.leaf_count);
    }

    #[inline]
    fn node_base(&self, tree: usize) -> usize {
        if tree == 0 {
            0
        } else {
            self.node_height[tree - 1]
        }
    }

    /// Node slice of one tree.
    #[inline]
    pub fn tree_nodes(&self, tree: usize) -> &[DecisionNode] {
        &self.nodes[self.node_base(tree)..self.node_height[tree]]
    }

    /// Score slice of one tree.
    #[inline]
    pub fn tree_scores(&self, tree: usize) -> &[f64] {
        &self.scores[self.node_base(tree)..self.node_height[tree]]
    }

    /// Leaf count of one tree.
    #[inline]
    pub fn tree_leaf_count(&self, tree: usize) -> usize {
        let prev = if tree == 0 {
            0
        } else {
            self.leaf_height[tree - 1]
        };
        self.leaf_height[tree] - prev
    }

    /// Walk one row down one tree; returns the tree-local terminal index.
    ///
    /// Numeric splits branch left on strict `<`. Factor splits test the
    /// code's membership bit; codes at or past the trained cardinality
    /// (the unseen-level proxy) test no bit and route right.
    pub fn walk_row(&self, tree: usize, num: &[f64], fac: &[u32]) -> u32 {
        let nodes = self.tree_nodes(tree);
        let mut idx = 0u32;
        loop {
            let node = &nodes[idx as usize];
            if node.is_terminal() {
                return idx;
            }
            let pred = node.pred as usize;
            let left = if pred < self.n_pred_num {
                num[pred] < node.threshold()
            } else {
                let code = fac[pred - self.n_pred_num];
                let (offset, card) = node.bit_range();
                code < card
                    && self
                        .fac_bits
                        .test_bit(tree, offset as usize + code as usize)
            };
            idx += node.delta + u32::from(!left);
        }
    }

    /// Terminal score of a walked row.
    #[inline]
    pub fn leaf_score(&self, tree: usize, node_idx: u32) -> f64 {
        self.tree_scores(tree)[node_idx as usize]
    }

    /// Leaf index of a walked terminal.
    #[inline]
    pub fn leaf_of_node(&self, tree: usize, node_idx: u32) -> u32 {
        self.tree_nodes(tree)[node_idx as usize].leaf_idx()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::frontier::{PTStat, PreTree};

    fn stat(s_count: u32, sum: f64) -> PTStat {
        PTStat {
            s_count,
            sum,
            ctg_sum: Vec::new(),
        }
    }

    /// Two trees: a numeric root split, and a factor root split.
    fn two_tree_forest() -> Forest {
        let frame = FrameBuilder::new()
            .add_num(&[0.0, 1.0, 2.0, 3.0])
            .add_fac(&[0, 1, 2, 1], 3)
            .build()
            .unwrap();

        let mut forest = Forest::new(1, vec![3]);

        let mut t0 = PreTree::new(stat(4, 6.0));
        t0.branch_num(0, 0, 1, 2, 1.0, stat(2, 1.0), stat(2, 5.0));
        forest.push_tree(&t0.consume(&frame, &[0.5, 0.5]));

        let mut t1 = PreTree::new(stat(4, 6.0));
        t1.branch_fac(0, 1, 3, 1.0, stat(2, 1.0), stat(2, 5.0));
        t1.lh_bit(0, 0);
        t1.lh_bit(0, 2);
        forest.push_tree(&t1.consume(&frame, &[0.5, 0.5]));

        forest
    }

    #[test]
    fn pools_locate_trees() {
        let forest = two_tree_forest();
        assert_eq!(forest.n_tree(), 2);
        assert_eq!(forest.tree_nodes(0).len(), 3);
        assert_eq!(forest.tree_nodes(1).len(), 3);
        assert_eq!(forest.tree_leaf_count(0), 2);
        assert_eq!(forest.tree_leaf_count(1), 2);
    }

    #[test]
    fn numeric_walk_strict_less() {
        let forest = two_tree_forest();
        // Threshold interpolates to 1.5.
        let term = forest.walk_row(0, &[1.0], &[0]);
        assert!((forest.leaf_score(0, term) - 0.5).abs() < 1e-12);
        let term = forest.walk_row(0, &[1.5], &[0]);
        assert!((forest.leaf_score(0, term) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn factor_walk_tests_bits() {
        let forest = two_tree_forest();
        // Codes 0 and 2 go left, 1 goes right.
        let left = forest.walk_row(1, &[0.0], &[0]);
        let right = forest.walk_row(1, &[0.0], &[1]);
        let left2 = forest.walk_row(1, &[0.0], &[2]);
        assert!((forest.leaf_score(1, left) - 0.5).abs() < 1e-12);
        assert!((forest.leaf_score(1, right) - 2.5).abs() < 1e-12);
        assert_eq!(left, left2);
    }

    #[test]
    fn unseen_code_routes_right() {
        let forest = two_tree_forest();
        // Proxy code one past the trained cardinality.
        let term = forest.walk_row(1, &[0.0], &[3]);
        assert!((forest.leaf_score(1, term) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn leaf_indices_count_terminals_in_order() {
        let forest = two_tree_forest();
        let term_l = forest.walk_row(0, &[0.0], &[0]);
        let term_r = forest.walk_row(0, &[3.0], &[0]);
        assert_eq!(forest.leaf_of_node(0, term_l), 0);
        assert_eq!(forest.leaf_of_node(0, term_r), 1);
    }

    #[test]
    fn serde_round_trip_is_bit_exact() {
        let forest = two_tree_forest();
        let bytes = postcard::to_allocvec(&forest).unwrap();
        let back: Forest = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(forest.nodes, back.nodes);
        assert_eq!(forest.scores, back.scores);
        assert_eq!(forest.fac_bits, back.fac_bits);
        let again = postcard::to_allocvec(&back).unwrap();
        assert_eq!(bytes, again);
    }
}
