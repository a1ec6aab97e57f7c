//! Meinshausen-style forest weighting.
//!
//! For a test row, each tree spreads `1 / n_tree` of weight over the
//! training samples sharing its terminal leaf, proportionally to their
//! multiplicities. Per row, the weights over training rows therefore sum
//! to one whenever every tree is hit.

use ndarray::Array2;
use rayon::prelude::*;

use super::{Forest, PredictBlock};
use crate::leaf::Leaf;

/// Dense `n_test x n_obs` weight matrix.
pub fn forest_weight(
    forest: &Forest,
    leaf: &Leaf,
    block: &PredictBlock,
    n_obs: usize,
    parallel: bool,
) -> Array2<f64> {
    let n_tree = forest.n_tree();
    let one_row = |r: usize| {
        let mut w = vec![0.0f64; n_obs];
        for t in 0..n_tree {
            let term = forest.walk_row(t, block.num_row(r), block.fac_row(r));
            let leaf_idx = forest.leaf_of_node(t, term);
            let total = leaf.block_s_count(t, leaf_idx);
            if total == 0 {
                continue;
            }
            let scale = 1.0 / (total as f64 * n_tree as f64);
            for sample in leaf.block(t, leaf_idx) {
                w[sample.row() as usize] += sample.mult() as f64 * scale;
            }
        }
        w
    };

    let rows: Vec<Vec<f64>> = if parallel {
        (0..block.n_row()).into_par_iter().map(one_row).collect()
    } else {
        (0..block.n_row()).map(one_row).collect()
    };

    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((block.n_row(), n_obs), flat).expect("rows share a width")
}
