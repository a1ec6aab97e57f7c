//! Factor-valued split search.
//!
//! Cells fold into per-rank runs, the implicit residual joining them as a
//! final run when the predictor carries a dense rank. Regression orders
//! runs by mean response and scans the accumulated left sums for a slot
//! cut. Binary classification orders by the probability of category one,
//! which reduces subset search to the same linear scan. Wider categorical
//! responses enumerate proper subsets of the (possibly sampled-down) run
//! set, with the final run conventionally bound to the right side so
//! complements are never revisited.

use super::{NodeSum, SplitCand, SplitEncoding, SplitNux, Splitter, MIN_DENOM};
use crate::partition::{ExpRange, Obs};
use crate::runs::RunSet;

pub(super) fn split_fac(
    sp: &Splitter<'_>,
    cand: &mut SplitCand,
    node: &NodeSum,
    obs: &[Obs],
    ctg_bits: u32,
) -> Option<SplitNux> {
    let mut run_set = RunSet::new(cand.range.extent as usize + 1, sp.n_ctg);
    collect_runs(sp, cand, node, obs, ctg_bits, &mut run_set);

    let result = if sp.n_ctg == 0 {
        split_runs_reg(sp, cand, node, &mut run_set)
    } else if sp.n_ctg == 2 {
        split_runs_binary(sp, cand, node, &mut run_set)
    } else {
        split_runs_wide(sp, cand, node, &mut run_set)
    };
    cand.run_set = Some(run_set);
    result
}

/// Fold the explicit range into runs, right to left, appending the
/// residual run when the predictor compresses a dense rank.
fn collect_runs(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    obs: &[Obs],
    ctg_bits: u32,
    run_set: &mut RunSet,
) {
    let s = cand.range.start as usize;
    let e = (cand.range.end() - 1) as usize;

    let mut rk_this = obs[e].rank();
    let mut sum_run = 0.0;
    let mut sc_run = 0u32;
    let mut run_end = e;
    for i in (s..=e).rev() {
        let (y_sum, rank, sc, ctg) = obs[i].ctg_fields(ctg_bits);
        if rank != rk_this {
            run_set.write(
                rk_this,
                sc_run,
                sum_run,
                ExpRange {
                    start: i as u32 + 1,
                    extent: (run_end - i) as u32,
                },
            );
            sum_run = 0.0;
            sc_run = 0;
            run_end = i;
            rk_this = rank;
        }
        if sp.n_ctg > 0 {
            run_set.accum_ctg(ctg, y_sum);
        }
        sum_run += y_sum;
        sc_run += sc;
    }
    run_set.write(
        rk_this,
        sc_run,
        sum_run,
        ExpRange {
            start: s as u32,
            extent: (run_end - s) as u32 + 1,
        },
    );

    if cand.implicit > 0 {
        let dense = sp
            .dense_rank(cand)
            .expect("implicit indices without a dense rank");
        run_set.write_implicit(dense, node.s_count, node.sum, &node.ctg_sum);
    }
}

/// Package a winning selection, applying the gain floor.
fn emit(
    cand: &SplitCand,
    node: &NodeSum,
    max_info: f64,
    lh_extent: u32,
    lh_s_count: u32,
) -> Option<SplitNux> {
    let gain = max_info - node.pre_bias;
    if gain <= node.min_info {
        return None;
    }
    Some(SplitNux {
        node: cand.node,
        pred: cand.pred,
        info: gain,
        lh_s_count,
        lh_extent,
        encoding: SplitEncoding::Fac,
    })
}

/// Mean-ordered slot scan under weighted variance.
fn split_runs_reg(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    run_set: &mut RunSet,
) -> Option<SplitNux> {
    run_set.heap_mean();

    let mut sum_l = 0.0;
    let mut sc_l = 0u32;
    let mut max_info = node.pre_bias;
    let mut cut = None;
    for pos in 0..run_set.run_count() - 1 {
        let (run_sum, run_sc) = run_set.sum_heap(pos);
        sum_l += run_sum;
        sc_l += run_sc;
        let sc_r = node.s_count - sc_l;
        let sum_r = node.sum - sum_l;
        let info = (sum_l * sum_l) / sc_l as f64 + (sum_r * sum_r) / sc_r as f64;
        if info > max_info && sp.children_viable(sc_l, sc_r) {
            max_info = info;
            cut = Some(pos);
        }
    }

    let cut = cut?;
    let (lh_extent, lh_s_count) = run_set.select_slots(cut, cand.implicit);
    emit(cand, node, max_info, lh_extent, lh_s_count)
}

/// Probability-ordered scan for the two-category response: running left
/// sums per category stand in for full subset enumeration.
fn split_runs_binary(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    run_set: &mut RunSet,
) -> Option<SplitNux> {
    run_set.heap_binary();

    let tot0 = node.ctg_sum[0];
    let tot1 = node.ctg_sum[1];
    let mut sum_l0 = 0.0;
    let mut sum_l1 = 0.0;
    let mut sc_l = 0u32;
    let mut max_info = node.pre_bias;
    let mut cut = None;
    for pos in 0..run_set.run_count() - 1 {
        let (cell0, cell1, splitable) = run_set.sum_binary(pos);
        let (_, run_sc) = run_set.sum_heap(pos);
        sum_l0 += cell0;
        sum_l1 += cell1;
        sc_l += run_sc;

        let sum_l = sum_l0 + sum_l1;
        let sum_r = node.sum - sum_l;
        if splitable && sum_l > MIN_DENOM && sum_r > MIN_DENOM {
            let ss_l = sum_l0 * sum_l0 + sum_l1 * sum_l1;
            let ss_r = (tot0 - sum_l0) * (tot0 - sum_l0) + (tot1 - sum_l1) * (tot1 - sum_l1);
            let info = ss_l / sum_l + ss_r / sum_r;
            let sc_r = node.s_count - sc_l;
            if info > max_info && sp.children_viable(sc_l, sc_r) {
                max_info = info;
                cut = Some(pos);
            }
        }
    }

    let cut = cut?;
    let (lh_extent, lh_s_count) = run_set.select_slots(cut, cand.implicit);
    emit(cand, node, max_info, lh_extent, lh_s_count)
}

/// Subset enumeration for responses past two categories. The run set is
/// sampled down to `MAX_WIDTH` first when wide; the final slot never
/// toggles, fixing the branch orientation.
fn split_runs_wide(
    sp: &Splitter<'_>,
    cand: &SplitCand,
    node: &NodeSum,
    run_set: &mut RunSet,
) -> Option<SplitNux> {
    let eff_count = run_set.de_wide(&cand.rv);
    if eff_count < 2 {
        return None;
    }
    let slot_sup = eff_count - 1;
    let left_full: u64 = (1 << slot_sup) - 1;

    let n_ctg = sp.n_ctg;
    let mut max_info = node.pre_bias;
    let mut lh_bits = 0u64;
    for subset in 1..=left_full {
        let mut sum_l = 0.0;
        let mut ss_l = 0.0;
        let mut ss_r = 0.0;
        for ctg in 0..n_ctg {
            let mut sum_ctg = 0.0;
            for slot in 0..slot_sup {
                if subset & (1 << slot) != 0 {
                    sum_ctg += run_set.sum_ctg(slot, ctg);
                }
            }
            let tot = node.ctg_sum[ctg];
            sum_l += sum_ctg;
            ss_l += sum_ctg * sum_ctg;
            ss_r += (tot - sum_ctg) * (tot - sum_ctg);
        }
        let sum_r = node.sum - sum_l;
        if sum_l > MIN_DENOM && sum_r > MIN_DENOM {
            let info = ss_l / sum_l + ss_r / sum_r;
            if info > max_info {
                max_info = info;
                lh_bits = subset;
            }
        }
    }

    if lh_bits == 0 {
        return None;
    }
    let (lh_extent, lh_s_count) = run_set.select_bits(lh_bits, cand.implicit);
    let sc_r = node.s_count - lh_s_count;
    if !sp.children_viable(lh_s_count, sc_r) {
        return None;
    }
    emit(cand, node, max_info, lh_extent, lh_s_count)
}
