//! Prediction over a packed forest.
//!
//! Rows arrive as dense row-major blocks, numeric values and factor codes
//! separated. Each row walks every (non-masked) tree to a terminal;
//! aggregation is commutative, so per-tree visitation order never matters,
//! but jitter and defaults are drawn from fixed per-tree streams to keep
//! results bit-identical under any thread schedule.
//!
//! Out-of-bag gating masks the trees whose bag holds the row; it only
//! makes sense for blocks whose rows align with the training frame.

use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use super::Forest;
use crate::bits::BitMatrix;
use crate::error::PredictError;
use crate::leaf::Leaf;

/// Row-major prediction input: one numeric column per numeric predictor,
/// one code column per factor predictor.
#[derive(Debug, Clone)]
pub struct PredictBlock {
    pub(crate) num: Array2<f64>,
    pub(crate) fac: Array2<u32>,
}

impl PredictBlock {
    /// Wrap dense blocks, verifying shape agreement and standard layout.
    pub fn new(num: Array2<f64>, fac: Array2<u32>) -> Result<Self, PredictError> {
        if num.nrows() != fac.nrows() && !num.is_empty() && !fac.is_empty() {
            return Err(PredictError::BadInput(format!(
                "numeric block has {} rows, factor block {}",
                num.nrows(),
                fac.nrows()
            )));
        }
        if !num.is_standard_layout() || !fac.is_standard_layout() {
            return Err(PredictError::BadInput(
                "prediction blocks must be row-major".into(),
            ));
        }
        Ok(Self { num, fac })
    }

    /// Numeric-only block.
    pub fn from_num(num: Array2<f64>) -> Result<Self, PredictError> {
        let rows = num.nrows();
        Self::new(num, Array2::zeros((rows, 0)))
    }

    #[inline]
    pub fn n_row(&self) -> usize {
        self.num.nrows().max(self.fac.nrows())
    }

    #[inline]
    pub(crate) fn num_row(&self, r: usize) -> &[f64] {
        self.num.row(r).to_slice().expect("standard layout")
    }

    #[inline]
    pub(crate) fn fac_row(&self, r: usize) -> &[u32] {
        self.fac.row(r).to_slice().expect("standard layout")
    }
}

/// Prediction engine bound to a trained forest.
pub struct Predictor<'a> {
    forest: &'a Forest,
    leaf: Option<&'a Leaf>,
    bag: &'a BitMatrix,
    n_obs: usize,
    n_ctg: usize,
    /// Training-response mean; regression fallback when a row hits no tree.
    default_score: f64,
    /// Empirical category distribution; classification fallback.
    ctg_default: Vec<f64>,
    /// Per-tree vote jitter in `[0, 1)`.
    jitter: Vec<f64>,
    parallel: bool,
}

impl<'a> Predictor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        forest: &'a Forest,
        leaf: Option<&'a Leaf>,
        bag: &'a BitMatrix,
        n_obs: usize,
        n_ctg: usize,
        default_score: f64,
        ctg_default: Vec<f64>,
        seed: u64,
    ) -> Self {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed ^ 0xC2B2_AE3D_27D4_EB4F);
        let jitter = (0..forest.n_tree()).map(|_| rng.gen::<f64>()).collect();
        Self {
            forest,
            leaf,
            bag,
            n_obs,
            n_ctg,
            default_score,
            ctg_default,
            jitter,
            parallel: true,
        }
    }

    /// Disable row-level parallelism.
    pub fn sequential(mut self) -> Self {
        self.parallel = false;
        self
    }

    fn validate(&self, block: &PredictBlock) -> Result<(), PredictError> {
        if block.num.ncols() != self.forest.n_pred_num() {
            return Err(PredictError::BadInput(format!(
                "block has {} numeric predictors, forest trained with {}",
                block.num.ncols(),
                self.forest.n_pred_num()
            )));
        }
        if block.fac.ncols() != self.forest.n_pred_fac() {
            return Err(PredictError::BadInput(format!(
                "block has {} factor predictors, forest trained with {}",
                block.fac.ncols(),
                self.forest.n_pred_fac()
            )));
        }
        // Levels unseen at training act as a proxy code past the trained
        // cardinality and route right at every split on that predictor.
        let unseen = (0..block.fac.ncols())
            .map(|f| {
                let card = self.forest.fac_card(f) as u32;
                block.fac.column(f).iter().filter(|&&c| c >= card).count()
            })
            .sum::<usize>();
        if unseen > 0 {
            eprintln!(
                "canopy: {} factor values at unseen levels; routing right",
                unseen
            );
        }
        Ok(())
    }

    /// Whether tree `t` participates for row `r` under the gating mode.
    #[inline]
    fn tree_hits(&self, tree: usize, row: usize, oob: bool) -> bool {
        !oob || !self.bag.test_bit(tree, row)
    }

    fn map_rows<T, F>(&self, n_row: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync + Send,
    {
        if self.parallel {
            (0..n_row).into_par_iter().map(f).collect()
        } else {
            (0..n_row).map(f).collect()
        }
    }

    /// Regression: mean of per-tree terminal scores; training mean when
    /// every tree is masked.
    pub fn predict_reg(&self, block: &PredictBlock, oob: bool) -> Result<Vec<f64>, PredictError> {
        self.validate(block)?;
        Ok(self.map_rows(block.n_row(), |r| {
            let mut sum = 0.0;
            let mut hits = 0usize;
            for t in 0..self.forest.n_tree() {
                if !self.tree_hits(t, r, oob) {
                    continue;
                }
                let term = self.forest.walk_row(t, block.num_row(r), block.fac_row(r));
                sum += self.forest.leaf_score(t, term);
                hits += 1;
            }
            if hits == 0 {
                self.default_score
            } else {
                sum / hits as f64
            }
        }))
    }

    /// Classification votes: per-tree category tallies with jitter-broken
    /// ties; the modal training category when every tree is masked.
    pub fn predict_ctg(&self, block: &PredictBlock, oob: bool) -> Result<Vec<u32>, PredictError> {
        self.validate(block)?;
        let n_tree = self.forest.n_tree();
        Ok(self.map_rows(block.n_row(), |r| {
            let mut tally = vec![0.0f64; self.n_ctg];
            let mut hits = 0usize;
            for t in 0..n_tree {
                if !self.tree_hits(t, r, oob) {
                    continue;
                }
                let term = self.forest.walk_row(t, block.num_row(r), block.fac_row(r));
                let ctg = self.forest.leaf_score(t, term) as usize;
                // Jitter stays below one vote over the whole forest, so it
                // can only break exact ties.
                tally[ctg] += 1.0 + self.jitter[t] / n_tree as f64;
                hits += 1;
            }
            if hits == 0 {
                argmax(&self.ctg_default) as u32
            } else {
                argmax(&tally) as u32
            }
        }))
    }

    /// Classification probabilities: per-row category frequencies over the
    /// trees hit; the empirical training distribution when none hit.
    pub fn predict_ctg_prob(
        &self,
        block: &PredictBlock,
        oob: bool,
    ) -> Result<Array2<f64>, PredictError> {
        self.validate(block)?;
        let rows = self.map_rows(block.n_row(), |r| {
            let mut counts = vec![0.0f64; self.n_ctg];
            let mut hits = 0usize;
            for t in 0..self.forest.n_tree() {
                if !self.tree_hits(t, r, oob) {
                    continue;
                }
                let term = self.forest.walk_row(t, block.num_row(r), block.fac_row(r));
                counts[self.forest.leaf_score(t, term) as usize] += 1.0;
                hits += 1;
            }
            if hits == 0 {
                self.ctg_default.clone()
            } else {
                counts.iter_mut().for_each(|c| *c /= hits as f64);
                counts
            }
        });
        Ok(collect_rows(rows, self.n_ctg))
    }

    /// Quantile estimates: per-row terminal scores weighted by their
    /// leaves' sample multiplicities, ties at boundaries resolving left.
    pub fn predict_quant(
        &self,
        block: &PredictBlock,
        quantiles: &[f64],
        oob: bool,
    ) -> Result<Array2<f64>, PredictError> {
        self.validate(block)?;
        let leaf = self.leaf.ok_or(PredictError::ThinLeaves)?;
        let rows = self.map_rows(block.n_row(), |r| {
            let mut weighted: Vec<(f64, f64)> = Vec::new();
            for t in 0..self.forest.n_tree() {
                if !self.tree_hits(t, r, oob) {
                    continue;
                }
                let term = self.forest.walk_row(t, block.num_row(r), block.fac_row(r));
                let leaf_idx = self.forest.leaf_of_node(t, term);
                let weight = leaf.block_s_count(t, leaf_idx) as f64;
                weighted.push((self.forest.leaf_score(t, term), weight));
            }
            weighted.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
            let total: f64 = weighted.iter().map(|(_, w)| w).sum();
            quantiles
                .iter()
                .map(|&q| {
                    if weighted.is_empty() {
                        return self.default_score;
                    }
                    let target = q * total;
                    let mut cum = 0.0;
                    for &(score, w) in &weighted {
                        cum += w;
                        if cum >= target {
                            return score;
                        }
                    }
                    weighted.last().unwrap().0
                })
                .collect::<Vec<f64>>()
        });
        Ok(collect_rows(rows, quantiles.len()))
    }

    /// Terminal node index per (row, tree); feeds the weight kernel.
    pub fn leaf_indices(&self, block: &PredictBlock) -> Result<Array2<u32>, PredictError> {
        self.validate(block)?;
        let n_tree = self.forest.n_tree();
        let rows = self.map_rows(block.n_row(), |r| {
            (0..n_tree)
                .map(|t| self.forest.walk_row(t, block.num_row(r), block.fac_row(r)))
                .collect::<Vec<u32>>()
        });
        Ok(collect_rows(rows, n_tree))
    }

    /// Meinshausen forest weights for a test block; see
    /// [`super::forest_weight`].
    pub fn forest_weight(&self, block: &PredictBlock) -> Result<Array2<f64>, PredictError> {
        let leaf = self.leaf.ok_or(PredictError::ThinLeaves)?;
        self.validate(block)?;
        Ok(super::weight::forest_weight(
            self.forest,
            leaf,
            block,
            self.n_obs,
            self.parallel,
        ))
    }
}

fn argmax(vals: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in vals.iter().enumerate() {
        if v > vals[best] {
            best = i;
        }
    }
    best
}

fn collect_rows<T>(rows: Vec<Vec<T>>, width: usize) -> Array2<T> {
    let n_row = rows.len();
    let flat: Vec<T> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_row, width), flat).expect("rows share a width")
}
