//! Numeric cut search.
//!
//! Cells are walked from the high-rank end toward the low, so runs of tied
//! ranks are never split: a cut is only evaluated where the rank changes
//! between neighbors. A predictor with a dense rank contributes a residual
//! pseudo-cell whose position in the walk depends on where the dense rank
//! falls relative to the explicit range: entirely right, entirely left, or
//! in the middle, in which case the walk pauses at the boundary, evaluates
//! the residual cut and resumes with the residual folded into the
//! right-side accumulators.

use super::{mono_accepts, NodeSum, SplitCand, SplitEncoding, SplitNux, Splitter, MIN_DENOM};
use crate::partition::Obs;

/// Running argmax over candidate cuts.
struct Cut {
    max_info: f64,
    lh_s_count: u32,
    rank_lo: u32,
    rank_hi: u32,
    /// Left-exclusive end of the explicit left range.
    rh_inf: u32,
}

impl Cut {
    fn new(pre_bias: f64) -> Self {
        Self {
            max_info: pre_bias,
            lh_s_count: 0,
            rank_lo: 0,
            rank_hi: 0,
            rh_inf: 0,
        }
    }

    #[inline]
    fn record(&mut self, info: f64, lh_s_count: u32, rank_lo: u32, rank_hi: u32, rh_inf: u32) {
        self.max_info = info;
        self.lh_s_count = lh_s_count;
        self.rank_lo = rank_lo;
        self.rank_hi = rank_hi;
        self.rh_inf = rh_inf;
    }

    /// Emit the nucleus when a cut beat the pre-bias and clears the node's
    /// gain floor.
    fn into_nux(self, cand: &SplitCand, node: &NodeSum, dense_rank: Option<u32>) -> Option<SplitNux> {
        let gain = self.max_info - node.pre_bias;
        if !(self.max_info > node.pre_bias) || gain <= node.min_info {
            return None;
        }
        let lh_implicit = match dense_rank {
            Some(dense) if self.rank_lo >= dense => cand.implicit,
            _ => 0,
        };
        let lh_extent = (self.rh_inf - cand.range.start) + lh_implicit;
        Some(SplitNux {
            node: cand.node,
            pred: cand.pred,
            info: gain,
            lh_s_count: self.lh_s_count,
            lh_extent,
            encoding: SplitEncoding::Num {
                rank_lo: self.rank_lo,
                rank_hi: self.rank_hi,
                lh_implicit,
            },
        })
    }
}

/// Residual of the node totals over the explicit range, and where the
/// dense rank falls relative to it.
struct Residual {
    /// Lowest explicit index with rank above the dense rank; `end` when
    /// none exists.
    dense_cut: usize,
    /// All explicit ranks above the dense rank.
    dense_left: bool,
    /// All explicit ranks below the dense rank.
    dense_right: bool,
    sum: f64,
    s_count: u32,
    /// Per-category residual sums; empty for regression.
    ctg: Vec<f64>,
}

fn residuals(
    obs: &[Obs],
    ctg_bits: u32,
    s: usize,
    e: usize,
    dense_rank: u32,
    node: &NodeSum,
) -> Residual {
    let mut sum_tot = 0.0;
    let mut sc_tot = 0u32;
    let mut ctg_tot = vec![0.0; node.ctg_sum.len()];
    let mut dense_cut = e;
    for i in (s..=e).rev() {
        let (y_sum, rank, sc, ctg) = obs[i].ctg_fields(ctg_bits);
        if rank > dense_rank {
            dense_cut = i;
        }
        sum_tot += y_sum;
        sc_tot += sc;
        if !ctg_tot.is_empty() {
            ctg_tot[ctg as usize] += y_sum;
        }
    }
    let ctg = node
        .ctg_sum
        .iter()
        .zip(ctg_tot.iter())
        .map(|(node_c, expl_c)| node_c - expl_c)
        .collect();
    Residual {
        dense_cut,
        dense_left: obs[s].rank() > dense_rank,
        dense_right: obs[e].rank() < dense_rank,
        sum: node.sum - sum_tot,
        s_count: node.s_count - sc_tot,
        ctg,
    }
}

// =============================================================================
// Regression
// =============================================================================

/// Weighted-variance walk state: right-side accumulators grow as cells
/// move across the prospective cut.
struct RegWalk {
    sum_r: f64,
    sc_l: u32,
    rk_right: u32,
}

impl RegWalk {
    /// Walk `hi` down to `lo`, evaluating a cut wherever the rank changes.
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        sp: &Splitter<'_>,
        obs: &[Obs],
        ctg_bits: u32,
        lo: usize,
        hi: usize,
        node: &NodeSum,
        mono: i8,
        cut: &mut Cut,
    ) {
        for i in (lo..=hi).rev() {
            let (y_sum, rk_this, sc) = obs[i].reg_fields(ctg_bits);
            if rk_this != self.rk_right {
                let sc_r = node.s_count - self.sc_l;
                let sum_l = node.sum - self.sum_r;
                let info =
                    (sum_l * sum_l) / self.sc_l as f64 + (self.sum_r * self.sum_r) / sc_r as f64;
                if info > cut.max_info
                    && sp.children_viable(self.sc_l, sc_r)
                    && mono_accepts(mono, sum_l, self.sc_l, self.sum_r, sc_r)
                {
                    cut.record(info, self.sc_l, rk_this, self.rk_right, i as u32 + 1);
                }
            }
            self.sc_l -= sc;
            self.sum_r += y_sum;
            self.rk_right = rk_this;
        }
    }

    /// Evaluate the cut placing the residual at the top of the left side.
    fn eval_dense(
        &self,
        sp: &Splitter<'_>,
        node: &NodeSum,
        mono: i8,
        dense_rank: u32,
        rh_inf: u32,
        cut: &mut Cut,
    ) {
        let sc_r = node.s_count - self.sc_l;
        if self.sc_l == 0 || sc_r == 0 {
            return;
        }
        let sum_l = node.sum - self.sum_r;
        let info = (sum_l * sum_l) / self.sc_l as f64 + (self.sum_r * self.sum_r) / sc_r as f64;
        if info > cut.max_info
            && sp.children_viable(self.sc_l, sc_r)
            && mono_accepts(mono, sum_l, self.sc_l, self.sum_r, sc_r)
        {
            cut.record(info, self.sc_l, dense_rank, self.rk_right, rh_inf);
        }
    }
}

pub(super) fn split_num_reg(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    obs: &[Obs],
    ctg_bits: u32,
) -> Option<SplitNux> {
    let s = cand.range.start as usize;
    let e = (cand.range.end() - 1) as usize;
    let mono = cand.mono;
    let mut cut = Cut::new(node.pre_bias);
    let dense_rank = sp.dense_rank(cand);

    if cand.implicit == 0 {
        let mut walk = RegWalk {
            sum_r: 0.0,
            sc_l: node.s_count,
            rk_right: obs[e].rank(),
        };
        walk.walk(sp, obs, ctg_bits, s, e, node, mono, &mut cut);
        return cut.into_nux(cand, node, dense_rank);
    }

    let dense = dense_rank.expect("implicit indices without a dense rank");
    let res = residuals(obs, ctg_bits, s, e, dense, node);

    if res.dense_right {
        // Residual sits beyond the top explicit rank: prime the walk with it.
        let mut walk = RegWalk {
            sum_r: res.sum,
            sc_l: node.s_count - res.s_count,
            rk_right: dense,
        };
        walk.walk(sp, obs, ctg_bits, s, e, node, mono, &mut cut);
    } else {
        let lo1 = if res.dense_left { s } else { res.dense_cut };
        let mut walk = RegWalk {
            sum_r: 0.0,
            sc_l: node.s_count,
            rk_right: obs[e].rank(),
        };
        walk.walk(sp, obs, ctg_bits, lo1, e, node, mono, &mut cut);
        walk.eval_dense(sp, node, mono, dense, lo1 as u32, &mut cut);
        if !res.dense_left {
            // Fold the residual into the right side and finish the low ranks.
            walk.sc_l -= res.s_count;
            walk.sum_r += res.sum;
            walk.rk_right = dense;
            if lo1 > s {
                walk.walk(sp, obs, ctg_bits, s, lo1 - 1, node, mono, &mut cut);
            }
        }
    }
    cut.into_nux(cand, node, dense_rank)
}

// =============================================================================
// Classification
// =============================================================================

/// Gini walk state: left sums shrink from the node totals while squared
/// sums track both sides through the per-category accumulator.
struct CtgWalk {
    sum_l: f64,
    sc_l: u32,
    ss_l: f64,
    ss_r: f64,
    /// Right-side per-category sums.
    ctg_acc: Vec<f64>,
    rk_right: u32,
}

impl CtgWalk {
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &mut self,
        sp: &Splitter<'_>,
        obs: &[Obs],
        ctg_bits: u32,
        lo: usize,
        hi: usize,
        node: &NodeSum,
        cut: &mut Cut,
    ) {
        for i in (lo..=hi).rev() {
            let (y_sum, rk_this, sc, ctg) = obs[i].ctg_fields(ctg_bits);
            let sum_r = node.sum - self.sum_l;
            if rk_this != self.rk_right && self.sum_l > MIN_DENOM && sum_r > MIN_DENOM {
                let info = self.ss_l / self.sum_l + self.ss_r / sum_r;
                let sc_r = node.s_count - self.sc_l;
                if info > cut.max_info && sp.children_viable(self.sc_l, sc_r) {
                    cut.record(info, self.sc_l, rk_this, self.rk_right, i as u32 + 1);
                }
            }
            self.rk_right = rk_this;
            self.sc_l -= sc;
            self.sum_l -= y_sum;
            let prior = self.ctg_acc[ctg as usize];
            self.ctg_acc[ctg as usize] += y_sum;
            self.ss_r += y_sum * (y_sum + 2.0 * prior);
            let sum_l_ctg = node.ctg_sum[ctg as usize] - prior;
            self.ss_l += y_sum * (y_sum - 2.0 * sum_l_ctg);
        }
    }

    fn eval_dense(
        &self,
        sp: &Splitter<'_>,
        node: &NodeSum,
        dense_rank: u32,
        rh_inf: u32,
        cut: &mut Cut,
    ) {
        let sum_r = node.sum - self.sum_l;
        if !(self.sum_l > MIN_DENOM && sum_r > MIN_DENOM) {
            return;
        }
        let info = self.ss_l / self.sum_l + self.ss_r / sum_r;
        let sc_r = node.s_count - self.sc_l;
        if info > cut.max_info && sp.children_viable(self.sc_l, sc_r) {
            cut.record(info, self.sc_l, dense_rank, self.rk_right, rh_inf);
        }
    }

    /// Move the residual across the cut, left to right.
    fn apply_residual(&mut self, node: &NodeSum, res: &Residual) {
        for (c, &y_sum) in res.ctg.iter().enumerate() {
            let prior = self.ctg_acc[c];
            self.ctg_acc[c] += y_sum;
            self.ss_r += y_sum * (y_sum + 2.0 * prior);
            let sum_l_ctg = node.ctg_sum[c] - prior;
            self.ss_l += y_sum * (y_sum - 2.0 * sum_l_ctg);
        }
        self.sum_l -= res.sum;
        self.sc_l -= res.s_count;
    }
}

pub(super) fn split_num_ctg(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    obs: &[Obs],
    ctg_bits: u32,
) -> Option<SplitNux> {
    let s = cand.range.start as usize;
    let e = (cand.range.end() - 1) as usize;
    let mut cut = Cut::new(node.pre_bias);
    let dense_rank = sp.dense_rank(cand);

    let fresh = |rk_right| CtgWalk {
        sum_l: node.sum,
        sc_l: node.s_count,
        ss_l: node.sum_squares,
        ss_r: 0.0,
        ctg_acc: vec![0.0; node.ctg_sum.len()],
        rk_right,
    };

    if cand.implicit == 0 {
        let mut walk = fresh(obs[e].rank());
        walk.walk(sp, obs, ctg_bits, s, e, node, &mut cut);
        return cut.into_nux(cand, node, dense_rank);
    }

    let dense = dense_rank.expect("implicit indices without a dense rank");
    let res = residuals(obs, ctg_bits, s, e, dense, node);

    if res.dense_right {
        let mut walk = fresh(dense);
        walk.apply_residual(node, &res);
        walk.walk(sp, obs, ctg_bits, s, e, node, &mut cut);
    } else {
        let lo1 = if res.dense_left { s } else { res.dense_cut };
        let mut walk = fresh(obs[e].rank());
        walk.walk(sp, obs, ctg_bits, lo1, e, node, &mut cut);
        walk.eval_dense(sp, node, dense, lo1 as u32, &mut cut);
        if !res.dense_left {
            walk.apply_residual(node, &res);
            walk.rk_right = dense;
            if lo1 > s {
                walk.walk(sp, obs, ctg_bits, s, lo1 - 1, node, &mut cut);
            }
        }
    }
    cut.into_nux(cand, node, dense_rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameBuilder, RankedFrame};
    use crate::partition::{ObsPart, StageCount};
    use crate::sampler::{Response, Sampler, SampleSet};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    /// Stage a full unreplaced bag over a single numeric column.
    fn fixture(vals: &[f64], auto: f64) -> (RankedFrame, ObsPart, Vec<StageCount>, SampleSet) {
        let n = vals.len();
        let frame = FrameBuilder::new()
            .auto_compress(auto)
            .add_num(vals)
            .build()
            .unwrap();
        let response = Response::regression(vals.to_vec()).unwrap();
        let sampler = Sampler::new(n, n, false, None).unwrap();
        let set = sampler
            .sample(&response, &mut Xoshiro256PlusPlus::seed_from_u64(1))
            .unwrap();
        let mut part = ObsPart::new(&frame, n, 0);
        let counts = part.stage(&frame, &set);
        (frame, part, counts, set)
    }

    fn root_sum(set: &SampleSet) -> NodeSum {
        let s_count = set.total_s_count() as u32;
        NodeSum {
            s_count,
            sum: set.sum,
            pre_bias: (set.sum * set.sum) / s_count as f64,
            min_info: 0.0,
            ctg_sum: Vec::new(),
            sum_squares: 0.0,
        }
    }

    fn search(
        frame: &RankedFrame,
        part: &ObsPart,
        counts: &[StageCount],
        set: &SampleSet,
    ) -> Option<SplitNux> {
        let node = root_sum(set);
        let nodes = vec![node];
        let splitter = Splitter {
            frame,
            part,
            buf: 0,
            nodes: &nodes,
            n_ctg: 0,
            min_node: 1,
        };
        let implicit = set.bag_count as u32 - counts[0].range.extent;
        let mut cand = SplitCand::new(0, 0, counts[0].range, implicit);
        splitter.split(&mut cand)
    }

    #[test]
    fn explicit_cut_straddles_ranks() {
        let (frame, part, counts, set) = fixture(&[1.0, 1.0, 7.0, 7.0], 1.0);
        let nux = search(&frame, &part, &counts, &set).unwrap();
        assert_eq!(nux.lh_s_count, 2);
        assert_eq!(nux.lh_extent, 2);
        match nux.encoding {
            SplitEncoding::Num {
                rank_lo,
                rank_hi,
                lh_implicit,
            } => {
                assert_eq!((rank_lo, rank_hi), (0, 1));
                assert_eq!(lh_implicit, 0);
            }
            _ => panic!("numeric encoding expected"),
        }
    }

    #[test]
    fn dense_middle_residual_cut() {
        // Ranks: 1 -> 0, 5 -> 1 (dense, 4 of 6 rows), 9 -> 2.
        let (frame, part, counts, set) = fixture(&[1.0, 5.0, 5.0, 5.0, 5.0, 9.0], 0.5);
        assert_eq!(frame.dense_rank(0), Some(1));
        assert_eq!(counts[0].range.extent, 2);

        let nux = search(&frame, &part, &counts, &set).unwrap();
        // The winning cut places {1, 5x4} left of {9}.
        assert_eq!(nux.lh_s_count, 5);
        assert_eq!(nux.lh_extent, 5);
        match nux.encoding {
            SplitEncoding::Num {
                rank_lo,
                rank_hi,
                lh_implicit,
            } => {
                assert_eq!((rank_lo, rank_hi), (1, 2));
                assert_eq!(lh_implicit, 4);
            }
            _ => panic!("numeric encoding expected"),
        }
    }

    #[test]
    fn dense_right_keeps_residual_high() {
        // Dense value 9 outranks every explicit cell.
        let (frame, part, counts, set) = fixture(&[9.0, 9.0, 9.0, 9.0, 1.0, 2.0], 0.5);
        assert_eq!(frame.dense_rank(0), Some(2));

        let nux = search(&frame, &part, &counts, &set).unwrap();
        // Best cut isolates the dense block on the right.
        assert_eq!(nux.lh_s_count, 2);
        assert_eq!(nux.lh_extent, 2);
        match nux.encoding {
            SplitEncoding::Num {
                rank_lo,
                rank_hi,
                lh_implicit,
            } => {
                assert_eq!((rank_lo, rank_hi), (1, 2));
                assert_eq!(lh_implicit, 0);
            }
            _ => panic!("numeric encoding expected"),
        }
    }

    #[test]
    fn dense_left_takes_whole_residual() {
        let (frame, part, counts, set) = fixture(&[0.0, 0.0, 0.0, 0.0, 5.0, 9.0], 0.5);
        assert_eq!(frame.dense_rank(0), Some(0));

        let nux = search(&frame, &part, &counts, &set).unwrap();
        // The residual block splits off alone: implicit-only left side.
        assert_eq!(nux.lh_s_count, 4);
        assert_eq!(nux.lh_extent, 4);
        match nux.encoding {
            SplitEncoding::Num {
                rank_lo,
                rank_hi,
                lh_implicit,
            } => {
                assert_eq!(rank_lo, 0);
                assert_eq!(rank_hi, 1);
                assert_eq!(lh_implicit, 4);
            }
            _ => panic!("numeric encoding expected"),
        }
    }

    #[test]
    fn monotone_gate_rejects_conflicting_cuts() {
        let (frame, part, counts, set) = fixture(&[1.0, 2.0, 3.0, 4.0], 1.0);
        let node = root_sum(&set);
        let nodes = vec![node];
        let splitter = Splitter {
            frame: &frame,
            part: &part,
            buf: 0,
            nodes: &nodes,
            n_ctg: 0,
            min_node: 1,
        };
        // Response rises with rank; a decreasing constraint kills all cuts.
        let mut cand = SplitCand::new(0, 0, counts[0].range, 0);
        cand.mono = -1;
        assert!(splitter.split(&mut cand).is_none());

        let mut cand = SplitCand::new(0, 0, counts[0].range, 0);
        cand.mono = 1;
        assert!(splitter.split(&mut cand).is_some());
    }
}
