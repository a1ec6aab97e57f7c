//! Training orchestration.
//!
//! The trainer owns the whole fit: it validates the option set, draws one
//! bag per tree, grows trees in blocks (data-parallel within a block) and
//! consumes finished trees into the forest pools strictly in tree-index
//! order. A failing tree is dropped with a diagnostic; the fit only fails
//! once the drop rate stops being ignorable or an option set is
//! contradictory.

mod logger;
mod parallelism;
mod params;

pub use logger::{TrainingLogger, Verbosity};
pub use parallelism::Parallelism;
pub use params::TrainParams;

use std::sync::atomic::{AtomicBool, Ordering};

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};

use crate::bits::BitMatrix;
use crate::error::TrainError;
use crate::forest::{Forest, PredictBlock, Predictor};
use crate::frame::RankedFrame;
use crate::frontier::{one_tree, GrowConfig, PackedTree};
use crate::leaf::Leaf;
use crate::sampler::{Response, Sampler};

/// Fraction of trees that may drop before the fit fails.
const DROP_FLOOR: f64 = 0.25;

// =============================================================================
// TrainedModel
// =============================================================================

/// Fit diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainSummary {
    /// Per-predictor accumulated information gain.
    pub pred_info: Vec<f64>,
    /// Trees consumed into the forest.
    pub trees_trained: usize,
    /// Dropped trees with their diagnostics.
    pub trees_dropped: Vec<(usize, String)>,
    /// Out-of-bag error: mean squared error for regression,
    /// misclassification rate for classification. Absent when bagging is
    /// off or no row was ever out of bag.
    pub oob_error: Option<f64>,
}

/// A trained forest with everything prediction needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub forest: Forest,
    /// Per-leaf sample records; absent under `thin_leaves`.
    pub leaf: Option<Leaf>,
    /// Bagged-row matrix, one row per tree; empty when bagging is off.
    pub bag: BitMatrix,
    pub n_obs: usize,
    pub n_ctg: usize,
    /// Training-response mean (regression fallback score).
    pub default_score: f64,
    /// Empirical category distribution (classification fallback).
    pub ctg_default: Vec<f64>,
    pub seed: u64,
    pub summary: TrainSummary,
}

impl TrainedModel {
    /// Prediction engine borrowing this model.
    pub fn predictor(&self) -> Predictor<'_> {
        Predictor::new(
            &self.forest,
            self.leaf.as_ref(),
            &self.bag,
            self.n_obs,
            self.n_ctg,
            self.default_score,
            self.ctg_default.clone(),
            self.seed,
        )
    }

    /// Serialize the packed model; byte-exact across round trips.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TrainError> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Deserialize a packed model.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TrainError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

// =============================================================================
// Trainer
// =============================================================================

/// One tree's contribution, handed to the ordered consume.
struct TreeProduct {
    packed: PackedTree,
    /// `(leaf, row, multiplicity)` per bagged sample.
    assignments: Vec<(u32, u32, u32)>,
    /// Bagged rows, ascending.
    bag_rows: Vec<u32>,
}

/// Orchestrates a fit over an immutable frame and response.
pub struct Trainer {
    params: TrainParams,
}

impl Trainer {
    pub fn new(params: TrainParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &TrainParams {
        &self.params
    }

    /// Fit a forest.
    pub fn train(
        &self,
        frame: &RankedFrame,
        response: &Response,
    ) -> Result<TrainedModel, TrainError> {
        self.train_with_cancel(frame, response, &AtomicBool::new(false))
    }

    /// Fit a forest, polling `cancel` at tree-block boundaries. A
    /// cancelled fit retains nothing.
    pub fn train_with_cancel(
        &self,
        frame: &RankedFrame,
        response: &Response,
        cancel: &AtomicBool,
    ) -> Result<TrainedModel, TrainError> {
        let n_ctg = response.n_ctg();
        self.params.validate(frame.n_row(), frame.n_pred(), n_ctg)?;
        if response.n_obs() != frame.n_row() {
            return Err(TrainError::BadInput(format!(
                "response length {} does not match frame rows {}",
                response.n_obs(),
                frame.n_row()
            )));
        }

        // Threading contract: 0 rides the global pool, 1 is strictly
        // sequential, anything else gets a dedicated pool for this fit.
        match self.params.n_thread {
            0 | 1 => self.train_impl(frame, response, cancel),
            n => ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| TrainError::ResourceExhausted(e.to_string()))?
                .install(|| self.train_impl(frame, response, cancel)),
        }
    }

    fn train_impl(
        &self,
        frame: &RankedFrame,
        response: &Response,
        cancel: &AtomicBool,
    ) -> Result<TrainedModel, TrainError> {
        let params = &self.params;
        let n_obs = frame.n_row();
        let n_pred = frame.n_pred();
        let n_ctg = response.n_ctg();
        let n_samp = params.effective_n_samp(n_obs);
        let logger = TrainingLogger::new(params.verbosity);
        logger.start_training(params.n_tree, n_obs, n_pred);

        let sampler = Sampler::new(
            n_obs,
            n_samp,
            params.with_replacement,
            Some(&params.sample_weight),
        )?;
        // A full, unreplaced draw bags every row; the bitmap degenerates.
        let bagging = params.with_replacement || n_samp < n_obs;

        let parallelism = Parallelism::from_threads(params.n_thread);
        let grow_cfg = GrowConfig {
            min_node: params.min_node,
            tot_levels: params.tot_levels,
            min_ratio: params.min_ratio,
            leaf_max: params.leaf_max,
            pred_fixed: params.pred_fixed,
            pred_prob: params.pred_prob.clone(),
            reg_mono: params.reg_mono.clone(),
            parallel: parallelism.allows_parallel(),
        };
        let split_quant = if params.split_quant.is_empty() {
            vec![0.5; n_pred]
        } else {
            params.split_quant.clone()
        };

        let build = |tree: usize| -> Result<TreeProduct, TrainError> {
            let mut rng = Xoshiro256PlusPlus::seed_from_u64(tree_seed(params.seed, tree));
            let set = sampler.sample(response, &mut rng)?;
            let grown = one_tree(frame, &set, n_ctg, &grow_cfg, &mut rng);
            let packed = grown.pretree.consume(frame, &split_quant);

            let mut assignments = Vec::with_capacity(set.bag_count);
            let mut bag_rows = Vec::with_capacity(set.bag_count);
            for (sample, (row, mult)) in set.rows().enumerate() {
                let leaf = packed.leaf_of_pt[grown.st_term[sample] as usize];
                assignments.push((leaf, row, mult));
                bag_rows.push(row);
            }
            Ok(TreeProduct {
                packed,
                assignments,
                bag_rows,
            })
        };

        // Grow in tree blocks; consume in tree-index order within each.
        let fac_card: Vec<usize> = (frame.n_pred_num()..n_pred)
            .map(|pred| frame.cardinality(pred))
            .collect();
        let mut forest = Forest::new(frame.n_pred_num(), fac_card);
        let mut leaf = Leaf::new();
        let mut pred_info = vec![0.0f64; n_pred];
        let mut bag_rows_per_tree: Vec<Vec<u32>> = Vec::new();
        let mut dropped: Vec<(usize, String)> = Vec::new();

        let block = params.effective_tree_block();
        let mut lo = 0usize;
        while lo < params.n_tree {
            if cancel.load(Ordering::Relaxed) {
                return Err(TrainError::ResourceExhausted(
                    "fit cancelled at tree boundary".into(),
                ));
            }
            let hi = (lo + block).min(params.n_tree);
            let products: Vec<Result<TreeProduct, TrainError>> = if parallelism.allows_parallel() {
                (lo..hi).into_par_iter().map(|t| build(t)).collect()
            } else {
                (lo..hi).map(|t| build(t)).collect()
            };

            for (offset, product) in products.into_iter().enumerate() {
                let tree = lo + offset;
                match product {
                    Ok(product) => {
                        forest.push_tree(&product.packed);
                        if !params.thin_leaves {
                            leaf.push_tree(product.packed.leaf_count, &product.assignments);
                        }
                        for (p, &info) in product.packed.pred_info.iter().enumerate() {
                            pred_info[p] += info;
                        }
                        bag_rows_per_tree.push(product.bag_rows);
                    }
                    Err(err) => {
                        logger.tree_dropped(tree, &err.to_string());
                        dropped.push((tree, err.to_string()));
                    }
                }
            }
            logger.block_done(lo, hi);
            lo = hi;
        }

        if (dropped.len() as f64) > DROP_FLOOR * params.n_tree as f64 {
            return Err(TrainError::TooManyTreeFailures {
                failed: dropped.len(),
                total: params.n_tree,
            });
        }

        let bag = if bagging {
            let mut bag = BitMatrix::new(bag_rows_per_tree.len(), n_obs);
            for (tree, rows) in bag_rows_per_tree.iter().enumerate() {
                for &row in rows {
                    bag.set_bit(tree, row as usize);
                }
            }
            bag
        } else {
            BitMatrix::empty()
        };

        let (default_score, ctg_default) = response_defaults(response);
        let trees_trained = forest.n_tree();
        logger.finish(trees_trained, dropped.len());

        let mut model = TrainedModel {
            forest,
            leaf: if params.thin_leaves { None } else { Some(leaf) },
            bag,
            n_obs,
            n_ctg,
            default_score,
            ctg_default,
            seed: params.seed,
            summary: TrainSummary {
                pred_info,
                trees_trained,
                trees_dropped: dropped,
                oob_error: None,
            },
        };
        model.summary.oob_error = self.oob_error(frame, response, &model)?;
        Ok(model)
    }

    /// Out-of-bag error over the training rows, when bagging left any row
    /// out anywhere.
    fn oob_error(
        &self,
        frame: &RankedFrame,
        response: &Response,
        model: &TrainedModel,
    ) -> Result<Option<f64>, TrainError> {
        if model.bag.is_empty() || model.forest.n_tree() == 0 {
            return Ok(None);
        }
        let (num, fac) = frame.decode_rows();
        let block = PredictBlock::new(num, fac)
            .map_err(|e| TrainError::BadInput(e.to_string()))?;
        let predictor = model.predictor();

        // Rows bagged by every tree carry no out-of-bag signal.
        let oob_row = |r: usize| (0..model.forest.n_tree()).any(|t| !model.bag.test_bit(t, r));

        let err = match response {
            Response::Reg { y } => {
                let yhat = predictor
                    .predict_reg(&block, true)
                    .map_err(|e| TrainError::BadInput(e.to_string()))?;
                let mut sse = 0.0;
                let mut n = 0usize;
                for (r, (&truth, &pred)) in y.iter().zip(yhat.iter()).enumerate() {
                    if oob_row(r) {
                        sse += (truth - pred) * (truth - pred);
                        n += 1;
                    }
                }
                (n > 0).then(|| sse / n as f64)
            }
            Response::Ctg { ctg, .. } => {
                let yhat = predictor
                    .predict_ctg(&block, true)
                    .map_err(|e| TrainError::BadInput(e.to_string()))?;
                let mut miss = 0usize;
                let mut n = 0usize;
                for (r, (&truth, &pred)) in ctg.iter().zip(yhat.iter()).enumerate() {
                    if oob_row(r) {
                        miss += usize::from(truth != pred);
                        n += 1;
                    }
                }
                (n > 0).then(|| miss as f64 / n as f64)
            }
        };
        Ok(err)
    }
}

/// Per-tree generator seed: decorrelates trees while staying a pure
/// function of `(seed, tree)`, so completion order never matters.
fn tree_seed(seed: u64, tree: usize) -> u64 {
    seed ^ (tree as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn response_defaults(response: &Response) -> (f64, Vec<f64>) {
    match response {
        Response::Reg { y } => {
            let mean = y.iter().sum::<f64>() / y.len().max(1) as f64;
            (mean, Vec::new())
        }
        Response::Ctg { ctg, n_ctg, .. } => {
            let mut freq = vec![0.0f64; *n_ctg];
            for &c in ctg {
                freq[c as usize] += 1.0;
            }
            let total: f64 = freq.iter().sum();
            freq.iter_mut().for_each(|f| *f /= total.max(1.0));
            (0.0, freq)
        }
    }
}

/// Convenience entry mirroring the typical binding call: build, fit,
/// return the model.
pub fn train(
    frame: &RankedFrame,
    response: &Response,
    params: TrainParams,
) -> Result<TrainedModel, TrainError> {
    Trainer::new(params).train(frame, response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn small_frame() -> RankedFrame {
        FrameBuilder::new()
            .add_num(&(0..32).map(f64::from).collect::<Vec<_>>())
            .build()
            .unwrap()
    }

    #[test]
    fn tree_seeds_decorrelate() {
        assert_ne!(tree_seed(7, 0), tree_seed(7, 1));
        assert_ne!(tree_seed(7, 0), tree_seed(8, 0));
        assert_eq!(tree_seed(7, 3), tree_seed(7, 3));
    }

    #[test]
    fn response_mismatch_is_bad_input() {
        let frame = small_frame();
        let response = Response::regression(vec![1.0; 8]).unwrap();
        let err = Trainer::new(TrainParams::default())
            .train(&frame, &response)
            .unwrap_err();
        assert!(matches!(err, TrainError::BadInput(_)));
    }

    #[test]
    fn invalid_params_surface_before_work() {
        let frame = small_frame();
        let response = Response::regression((0..32).map(f64::from).collect()).unwrap();
        let err = Trainer::new(TrainParams {
            n_tree: 0,
            ..Default::default()
        })
        .train(&frame, &response)
        .unwrap_err();
        assert!(matches!(err, TrainError::InvalidConfig(_)));
    }

    #[test]
    fn cancellation_drops_everything() {
        let frame = small_frame();
        let response = Response::regression((0..32).map(f64::from).collect()).unwrap();
        let cancel = AtomicBool::new(true);
        let err = Trainer::new(TrainParams::default())
            .train_with_cancel(&frame, &response, &cancel)
            .unwrap_err();
        assert!(matches!(err, TrainError::ResourceExhausted(_)));
    }

    #[test]
    fn full_unreplaced_draw_disables_bagging() {
        let frame = small_frame();
        let response = Response::regression((0..32).map(f64::from).collect()).unwrap();
        let model = Trainer::new(TrainParams {
            n_tree: 3,
            with_replacement: false,
            n_thread: 1,
            ..Default::default()
        })
        .train(&frame, &response)
        .unwrap();
        assert!(model.bag.is_empty());
        assert_eq!(model.summary.oob_error, None);
    }

    #[test]
    fn gain_accumulates_per_predictor() {
        let frame = FrameBuilder::new()
            .add_num(&(0..32).map(f64::from).collect::<Vec<_>>())
            .add_num(&[0.5; 32])
            .build()
            .unwrap();
        let response = Response::regression((0..32).map(f64::from).collect()).unwrap();
        let model = Trainer::new(TrainParams {
            n_tree: 5,
            n_thread: 1,
            ..Default::default()
        })
        .train(&frame, &response)
        .unwrap();
        // All signal lives in the first predictor; the constant column
        // cannot split.
        assert!(model.summary.pred_info[0] > 0.0);
        assert_eq!(model.summary.pred_info[1], 0.0);
    }
}
