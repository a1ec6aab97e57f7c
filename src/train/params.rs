//! Training configuration.
//!
//! One value carries every training option; nothing is process-global.
//! Construct with struct-update syntax over [`TrainParams::default`] and
//! let [`TrainParams::validate`] name whatever does not hold together.

use super::Verbosity;
use crate::error::TrainError;

/// Parameters for fitting a forest.
#[derive(Debug, Clone)]
pub struct TrainParams {
    /// Trees to grow.
    pub n_tree: usize,
    /// Samples drawn per tree; `0` draws one bag-sized sample per row.
    pub n_samp: usize,
    /// Bagging mode: draw rows with replacement.
    pub with_replacement: bool,
    /// Per-row sampling weights; empty for uniform.
    pub sample_weight: Vec<f64>,
    /// Per-category splitting weights (classification); empty for
    /// inverse-frequency defaults.
    pub class_weight: Vec<f64>,
    /// Exact predictor count tried per split; `0` defers to `pred_prob`.
    pub pred_fixed: usize,
    /// Per-predictor trial probability when `pred_fixed == 0`; empty
    /// tries every predictor.
    pub pred_prob: Vec<f64>,
    /// Minimum multiplicity per candidate child.
    pub min_node: u32,
    /// Depth cap; `0` for unlimited.
    pub tot_levels: usize,
    /// Minimum gain relative to the parent's winning gain.
    pub min_ratio: f64,
    /// Leaf cap per tree; `0` for unlimited.
    pub leaf_max: usize,
    /// Per-predictor interpolation fraction inside a cut's rank range;
    /// empty for midpoints.
    pub split_quant: Vec<f64>,
    /// Per-predictor monotonicity in `[-1, 1]`; `0` leaves a predictor
    /// unconstrained. Regression only.
    pub reg_mono: Vec<f64>,
    /// Worker threads: `0` default pool, `1` sequential.
    pub n_thread: usize,
    /// Trees consumed per scheduling block.
    pub tree_block: usize,
    /// Omit per-leaf sample blocks, disabling quantiles and weighting.
    pub thin_leaves: bool,
    /// Random seed; fixing it fixes the forest bit for bit.
    pub seed: u64,
    pub verbosity: Verbosity,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            n_tree: 100,
            n_samp: 0,
            with_replacement: true,
            sample_weight: Vec::new(),
            class_weight: Vec::new(),
            pred_fixed: 0,
            pred_prob: Vec::new(),
            min_node: 2,
            tot_levels: 0,
            min_ratio: 0.0,
            leaf_max: 0,
            split_quant: Vec::new(),
            reg_mono: Vec::new(),
            n_thread: 0,
            tree_block: 16,
            thin_leaves: false,
            seed: 17,
            verbosity: Verbosity::Silent,
        }
    }
}

impl TrainParams {
    /// Effective per-tree sample count.
    pub fn effective_n_samp(&self, n_obs: usize) -> usize {
        if self.n_samp == 0 {
            n_obs
        } else {
            self.n_samp
        }
    }

    /// Effective tree-block granularity.
    pub fn effective_tree_block(&self) -> usize {
        self.tree_block.max(1)
    }

    /// Check the option set against the frame and response shape.
    pub fn validate(&self, n_obs: usize, n_pred: usize, n_ctg: usize) -> Result<(), TrainError> {
        if self.n_tree == 0 {
            return Err(TrainError::InvalidConfig("n_tree == 0".into()));
        }
        let n_samp = self.effective_n_samp(n_obs);
        if n_samp == 0 {
            return Err(TrainError::InvalidConfig("n_samp == 0".into()));
        }
        if !self.with_replacement && n_samp > n_obs {
            return Err(TrainError::InvalidConfig(format!(
                "n_samp ({}) exceeds n_obs ({}) without replacement",
                n_samp, n_obs
            )));
        }
        if self.pred_fixed > n_pred {
            return Err(TrainError::InvalidConfig(format!(
                "pred_fixed ({}) exceeds predictor count ({})",
                self.pred_fixed, n_pred
            )));
        }
        if !self.pred_prob.is_empty() {
            if self.pred_prob.len() != n_pred {
                return Err(TrainError::InvalidConfig(format!(
                    "pred_prob length ({}) does not match predictor count ({})",
                    self.pred_prob.len(),
                    n_pred
                )));
            }
            if self.pred_prob.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
                return Err(TrainError::InvalidConfig(
                    "pred_prob entries must lie in [0, 1]".into(),
                ));
            }
        }
        if self.min_node == 0 {
            return Err(TrainError::InvalidConfig("min_node == 0".into()));
        }
        if !(0.0..=1.0).contains(&self.min_ratio) {
            return Err(TrainError::InvalidConfig(format!(
                "min_ratio ({}) must lie in [0, 1]",
                self.min_ratio
            )));
        }
        if !self.split_quant.is_empty() {
            if self.split_quant.len() != n_pred {
                return Err(TrainError::InvalidConfig(format!(
                    "split_quant length ({}) does not match predictor count ({})",
                    self.split_quant.len(),
                    n_pred
                )));
            }
            if self.split_quant.iter().any(|&q| !(0.0..=1.0).contains(&q)) {
                return Err(TrainError::InvalidConfig(
                    "split_quant entries must lie in [0, 1]".into(),
                ));
            }
        }
        if !self.reg_mono.is_empty() {
            if n_ctg > 0 {
                return Err(TrainError::InvalidConfig(
                    "reg_mono applies to regression responses only".into(),
                ));
            }
            if self.reg_mono.len() != n_pred {
                return Err(TrainError::InvalidConfig(format!(
                    "reg_mono length ({}) does not match predictor count ({})",
                    self.reg_mono.len(),
                    n_pred
                )));
            }
            if self.reg_mono.iter().any(|&m| !(-1.0..=1.0).contains(&m)) {
                return Err(TrainError::InvalidConfig(
                    "reg_mono entries must lie in [-1, 1]".into(),
                ));
            }
        }
        if n_ctg == 0 && !self.class_weight.is_empty() {
            return Err(TrainError::InvalidConfig(
                "class_weight applies to classification responses only".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let params = TrainParams::default();
        assert!(params.validate(100, 4, 0).is_ok());
        assert!(params.validate(100, 4, 3).is_ok());
    }

    #[test]
    fn contradictions_name_the_option() {
        let params = TrainParams {
            pred_fixed: 9,
            ..Default::default()
        };
        let err = params.validate(100, 4, 0).unwrap_err();
        assert!(err.to_string().contains("pred_fixed"));

        let params = TrainParams {
            n_samp: 101,
            with_replacement: false,
            ..Default::default()
        };
        let err = params.validate(100, 4, 0).unwrap_err();
        assert!(err.to_string().contains("n_samp"));

        let params = TrainParams {
            reg_mono: vec![0.5, 0.0, 0.0, 0.0],
            ..Default::default()
        };
        let err = params.validate(100, 4, 2).unwrap_err();
        assert!(err.to_string().contains("reg_mono"));
    }

    #[test]
    fn zero_n_samp_means_full_bag() {
        let params = TrainParams::default();
        assert_eq!(params.effective_n_samp(250), 250);
        let params = TrainParams {
            n_samp: 64,
            ..Default::default()
        };
        assert_eq!(params.effective_n_samp(250), 64);
    }
}
