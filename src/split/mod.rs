//! Split search.
//!
//! For every scheduled (node, predictor) candidate the searcher produces at
//! most one [`SplitNux`]: the argmax cut for that pair under the response's
//! information measure. The frontier then takes the per-node argmax across
//! predictors. Regression maximizes weighted-variance gain, classification
//! Gini gain; both start from the node's pre-bias, so a nucleus only exists
//! when the cut strictly improves on the unsplit node.
//!
//! Response kinds share a single entry point and dispatch by tag; nothing
//! in the candidate loop is virtual.

mod factor;
mod numeric;

use crate::frame::RankedFrame;
use crate::partition::{ExpRange, ObsPart};
use crate::runs::RunSet;

/// Smallest response sum a classification child may carry; guards the Gini
/// denominators against class-weight pathologies.
pub(crate) const MIN_DENOM: f64 = 1e-5;

/// Per-node sums the searcher reads; built by the frontier each level.
#[derive(Debug, Clone)]
pub struct NodeSum {
    /// Total multiplicity.
    pub s_count: u32,
    /// Response sum.
    pub sum: f64,
    /// Unsplit information: `sum^2 / s_count` (regression) or
    /// `sum_squares / sum` (classification).
    pub pre_bias: f64,
    /// Gain floor inherited from the parent's winning gain.
    pub min_info: f64,
    /// Per-category response sums; empty for regression.
    pub ctg_sum: Vec<f64>,
    /// Sum of squared category sums.
    pub sum_squares: f64,
}

/// One scheduled (node, predictor) candidate.
#[derive(Debug)]
pub struct SplitCand {
    pub node: usize,
    pub pred: usize,
    /// Explicit cell range within the predictor's buffer slice.
    pub range: ExpRange,
    /// Implicit index count riding on the predictor's dense rank.
    pub implicit: u32,
    /// Resolved monotonicity for this candidate: -1, 0 or +1.
    pub mono: i8,
    /// Pre-drawn variates for wide-run sampling; empty otherwise.
    pub rv: Vec<f64>,
    /// Run workspace, populated for factor candidates that split.
    pub run_set: Option<RunSet>,
}

impl SplitCand {
    pub fn new(node: usize, pred: usize, range: ExpRange, implicit: u32) -> Self {
        Self {
            node,
            pred,
            range,
            implicit,
            mono: 0,
            rv: Vec::new(),
            run_set: None,
        }
    }
}

/// Split encoding carried by a winning nucleus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SplitEncoding {
    /// Numeric cut straddling `(rank_lo, rank_hi)`, with the count of
    /// implicit indices that belong to the left side.
    Num {
        rank_lo: u32,
        rank_hi: u32,
        lh_implicit: u32,
    },
    /// Factor cut; membership lives in the candidate's committed
    /// [`RunSet`] selection.
    Fac,
}

/// Winning split for one candidate.
#[derive(Debug, Clone)]
pub struct SplitNux {
    pub node: usize,
    pub pred: usize,
    /// Information gain over the node's pre-bias.
    pub info: f64,
    /// Left-side multiplicity.
    pub lh_s_count: u32,
    /// Left-side index extent, implicit indices included.
    pub lh_extent: u32,
    pub encoding: SplitEncoding,
}

/// Level-scoped split searcher.
pub struct Splitter<'a> {
    pub frame: &'a RankedFrame,
    pub part: &'a ObsPart,
    /// Source buffer bit for this level.
    pub buf: usize,
    pub nodes: &'a [NodeSum],
    pub n_ctg: usize,
    /// Minimum multiplicity per candidate child.
    pub min_node: u32,
}

impl Splitter<'_> {
    /// Search one candidate. `None` when no cut beats the pre-bias, when
    /// the gain floor is not met, or when every cut violates a constraint.
    pub fn split(&self, cand: &mut SplitCand) -> Option<SplitNux> {
        if cand.range.extent < 1 {
            return None;
        }
        let node = &self.nodes[cand.node];
        let (obs, _) = self.part.pred_slices(cand.pred, self.buf);
        let ctg_bits = self.part.ctg_bits();

        if self.frame.is_factor(cand.pred) {
            factor::split_fac(self, cand, node, obs, ctg_bits)
        } else if self.n_ctg > 0 {
            numeric::split_num_ctg(self, cand, node, obs, ctg_bits)
        } else {
            numeric::split_num_reg(self, cand, node, obs, ctg_bits)
        }
    }

    /// Dense rank of the candidate's predictor, when compressed.
    #[inline]
    pub(crate) fn dense_rank(&self, cand: &SplitCand) -> Option<u32> {
        self.frame.dense_rank(cand.pred)
    }

    /// Child-size constraint for a prospective cut.
    #[inline]
    pub(crate) fn children_viable(&self, sc_l: u32, sc_r: u32) -> bool {
        sc_l >= self.min_node && sc_r >= self.min_node
    }
}

/// Monotone acceptance: the left-to-right slope must agree with the
/// constraint's sign. Computed cross-multiplied to avoid the division.
#[inline]
pub(crate) fn mono_accepts(mono: i8, sum_l: f64, sc_l: u32, sum_r: f64, sc_r: u32) -> bool {
    if mono == 0 {
        return true;
    }
    let up = sum_l * sc_r as f64 <= sum_r * sc_l as f64;
    if mono > 0 {
        up
    } else {
        !up
    }
}
