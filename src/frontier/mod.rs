//! Frontier: the set of live nodes at the current depth, and the level
//! loop that grows one tree.
//!
//! Each level is a pure step: schedule (node, predictor) candidates over
//! the staged partition, search them in parallel, take the per-node argmax,
//! branch the pre-tree, replay the winning splits onto the sample set and
//! restage the partition for the offspring. Nodes that fail to split
//! retire, marking their samples extinct and recording their pre-tree
//! terminal for leaf assembly.

mod pretree;

pub use pretree::{PTStat, PackedSplit, PackedTree, PreTree, NO_LEAF};

use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use rayon::prelude::*;

use crate::bits::BitVec;
use crate::frame::RankedFrame;
use crate::partition::{ExpRange, IdxPath, ObsPart, StageCount};
use crate::runs::MAX_WIDTH;
use crate::sampler::SampleSet;
use crate::split::{NodeSum, SplitCand, SplitEncoding, SplitNux, Splitter};

/// Growth limits and sampling knobs the frontier consumes; the trainer
/// projects these out of its parameter set.
#[derive(Debug, Clone)]
pub struct GrowConfig {
    pub min_node: u32,
    pub tot_levels: usize,
    pub min_ratio: f64,
    pub leaf_max: usize,
    pub pred_fixed: usize,
    pub pred_prob: Vec<f64>,
    pub reg_mono: Vec<f64>,
    pub parallel: bool,
}

/// One live frontier node.
#[derive(Debug, Clone)]
struct IndexSet {
    pt_id: u32,
    /// Range within the primary sample ordering.
    start: u32,
    extent: u32,
    s_count: u32,
    sum: f64,
    ctg_sum: Vec<f64>,
    sum_squares: f64,
    pre_bias: f64,
    min_info: f64,
}

impl IndexSet {
    fn node_sum(&self) -> NodeSum {
        NodeSum {
            s_count: self.s_count,
            sum: self.sum,
            pre_bias: self.pre_bias,
            min_info: self.min_info,
            ctg_sum: self.ctg_sum.clone(),
            sum_squares: self.sum_squares,
        }
    }

    fn stat(&self) -> PTStat {
        PTStat {
            s_count: self.s_count,
            sum: self.sum,
            ctg_sum: self.ctg_sum.clone(),
        }
    }
}

fn pre_bias(n_ctg: usize, s_count: u32, sum: f64, sum_squares: f64) -> f64 {
    if n_ctg == 0 {
        (sum * sum) / s_count as f64
    } else if sum > 0.0 {
        sum_squares / sum
    } else {
        0.0
    }
}

/// A fully grown tree: the pre-tree image plus each sample's terminal.
#[derive(Debug)]
pub struct GrownTree {
    pub pretree: PreTree,
    /// Pre-tree terminal id per bagged sample.
    pub st_term: Vec<u32>,
}

/// Grow one tree over a staged bag.
pub fn one_tree(
    frame: &RankedFrame,
    set: &SampleSet,
    n_ctg: usize,
    cfg: &GrowConfig,
    rng: &mut Xoshiro256PlusPlus,
) -> GrownTree {
    let bag = set.bag_count;
    let mut part = ObsPart::new(frame, bag, n_ctg);
    let mut ranges: Vec<Vec<StageCount>> = part
        .stage(frame, set)
        .into_iter()
        .map(|sc| vec![sc])
        .collect();

    let mut path = IdxPath::new(bag);
    let mut primary: Vec<u32> = (0..bag as u32).collect();
    let mut st_term = vec![0u32; bag];

    let total_sc = set.total_s_count() as u32;
    let sum_squares: f64 = set.ctg_sum.iter().map(|s| s * s).sum();
    let root = IndexSet {
        pt_id: 0,
        start: 0,
        extent: bag as u32,
        s_count: total_sc,
        sum: set.sum,
        ctg_sum: set.ctg_sum.clone(),
        sum_squares,
        pre_bias: pre_bias(n_ctg, total_sc, set.sum, sum_squares),
        min_info: 0.0,
    };
    let mut pretree = PreTree::new(root.stat());
    let mut nodes = vec![root];

    let mut lh_bits = BitVec::new(bag, 1);
    let mut expl_bits = BitVec::new(bag, 1);
    let mut scratch: Vec<u32> = vec![0; bag];

    let mut buf = 0usize;
    let mut level = 0usize;
    while !nodes.is_empty() {
        let capped = (cfg.tot_levels > 0 && level >= cfg.tot_levels)
            || (cfg.leaf_max > 0 && pretree.leaf_count() >= cfg.leaf_max);

        let mut cands = if capped {
            Vec::new()
        } else {
            schedule(frame, &nodes, &ranges, n_ctg, cfg, rng)
        };

        let results: Vec<Option<SplitNux>> = if cands.is_empty() {
            Vec::new()
        } else {
            let node_sums: Vec<NodeSum> = nodes.iter().map(IndexSet::node_sum).collect();
            let splitter = Splitter {
                frame,
                part: &part,
                buf,
                nodes: &node_sums,
                n_ctg,
                min_node: cfg.min_node,
            };
            if cfg.parallel {
                cands
                    .par_iter_mut()
                    .map(|cand| splitter.split(cand))
                    .collect()
            } else {
                cands.iter_mut().map(|cand| splitter.split(cand)).collect()
            }
        };

        // Per-node argmax across predictors; ties keep the earliest
        // candidate, so the outcome is schedule-order deterministic.
        let mut winner: Vec<Option<(usize, f64)>> = vec![None; nodes.len()];
        for (ci, res) in results.iter().enumerate() {
            if let Some(nux) = res {
                let better = match winner[nux.node] {
                    None => true,
                    Some((_, info)) => nux.info > info,
                };
                if better {
                    winner[nux.node] = Some((ci, nux.info));
                }
            }
        }

        let mut next_nodes: Vec<IndexSet> = Vec::new();
        let mut any_split = false;
        for (node_idx, node) in nodes.iter().enumerate() {
            match winner[node_idx] {
                None => {
                    retire(node, &primary, &mut path, &mut st_term);
                }
                Some((ci, _)) => {
                    any_split = true;
                    let nux = results[ci].as_ref().expect("winner without nucleus");
                    consume_split(
                        node,
                        nux,
                        &cands[ci],
                        frame,
                        &part,
                        buf,
                        n_ctg,
                        cfg,
                        &mut pretree,
                        &mut path,
                        &mut primary,
                        &mut scratch,
                        &mut lh_bits,
                        &mut expl_bits,
                        &mut next_nodes,
                    );
                }
            }
        }
        if !any_split {
            break;
        }

        // Restage each predictor for the offspring level.
        let mut next_ranges = Vec::with_capacity(frame.n_pred());
        for pred in 0..frame.n_pred() {
            let parent_ranges: Vec<ExpRange> =
                ranges[pred].iter().map(|sc| sc.range).collect();
            next_ranges.push(part.restage_pred(pred, buf, &parent_ranges, &path, next_nodes.len()));
        }
        ranges = next_ranges;
        nodes = next_nodes;
        buf = 1 - buf;
        level += 1;
    }

    if cfg.leaf_max > 0 {
        pretree.leaf_merge(cfg.leaf_max);
    }
    GrownTree { pretree, st_term }
}

/// Candidate scheduling: per node, draw the predictor subset under
/// `pred_fixed` / `pred_prob`, drop singletons, and resolve per-candidate
/// randomness (monotone gating, wide-run variates) up front so the split
/// pass is deterministic under any thread schedule.
fn schedule(
    frame: &RankedFrame,
    nodes: &[IndexSet],
    ranges: &[Vec<StageCount>],
    n_ctg: usize,
    cfg: &GrowConfig,
    rng: &mut Xoshiro256PlusPlus,
) -> Vec<SplitCand> {
    let n_pred = frame.n_pred();
    let mut cands = Vec::new();
    for (node_idx, node) in nodes.iter().enumerate() {
        if node.extent < 2 || node.s_count < 2 * cfg.min_node.max(1) {
            continue;
        }
        for pred in sample_preds(cfg, n_pred, rng) {
            let sc = &ranges[pred][node_idx];
            let implicit = node.extent - sc.range.extent;
            if sc.singleton(implicit) {
                continue;
            }
            let mut cand = SplitCand::new(node_idx, pred, sc.range, implicit);
            if n_ctg == 0 {
                let m = cfg.reg_mono.get(pred).copied().unwrap_or(0.0);
                if m != 0.0 && rng.gen::<f64>() < m.abs() {
                    cand.mono = if m > 0.0 { 1 } else { -1 };
                }
            }
            if frame.is_factor(pred) && n_ctg > 2 {
                let safe_count = sc.rank_count as usize + usize::from(implicit > 0);
                if safe_count > MAX_WIDTH {
                    cand.rv = (0..safe_count).map(|_| rng.gen()).collect();
                }
            }
            cands.push(cand);
        }
    }
    cands
}

fn sample_preds(cfg: &GrowConfig, n_pred: usize, rng: &mut Xoshiro256PlusPlus) -> Vec<usize> {
    if cfg.pred_fixed > 0 {
        let take = cfg.pred_fixed.min(n_pred);
        let mut preds: Vec<usize> = (0..n_pred).collect();
        for i in 0..take {
            let j = rng.gen_range(i..n_pred);
            preds.swap(i, j);
        }
        preds.truncate(take);
        preds.sort_unstable();
        preds
    } else if !cfg.pred_prob.is_empty() {
        (0..n_pred)
            .filter(|&p| rng.gen::<f64>() < cfg.pred_prob.get(p).copied().unwrap_or(0.0))
            .collect()
    } else {
        (0..n_pred).collect()
    }
}

/// Retire a node: its samples go extinct, remembered by terminal id.
fn retire(node: &IndexSet, primary: &[u32], path: &mut IdxPath, st_term: &mut [u32]) {
    for i in node.start..node.start + node.extent {
        let sample = primary[i as usize] as usize;
        path.extinct(sample);
        st_term[sample] = node.pt_id;
    }
}

/// Apply a winning split: replay its explicit blocks, partition the node's
/// primary segment, branch the pre-tree and bear the offspring index sets.
#[allow(clippy::too_many_arguments)]
fn consume_split(
    node: &IndexSet,
    nux: &SplitNux,
    cand: &SplitCand,
    frame: &RankedFrame,
    part: &ObsPart,
    buf: usize,
    n_ctg: usize,
    cfg: &GrowConfig,
    pretree: &mut PreTree,
    path: &mut IdxPath,
    primary: &mut [u32],
    scratch: &mut [u32],
    lh_bits: &mut BitVec,
    expl_bits: &mut BitVec,
    next_nodes: &mut Vec<IndexSet>,
) {
    lh_bits.clear_all();
    expl_bits.clear_all();

    // Explicit node range: marks membership, yielding the residual sums by
    // subtraction from the node totals.
    let mut expl_ctg = vec![0.0; n_ctg];
    let (expl_sum, _) = part.block_replay(cand.pred, buf, cand.range, expl_bits, &mut expl_ctg);

    // Left-hand explicit blocks.
    let mut lh_ctg = vec![0.0; n_ctg];
    let mut lh_sum = 0.0;
    let implicit_left = match nux.encoding {
        SplitEncoding::Num { lh_implicit, .. } => {
            let lh_expl = ExpRange {
                start: cand.range.start,
                extent: nux.lh_extent - lh_implicit,
            };
            let (s, _) = part.block_replay(cand.pred, buf, lh_expl, lh_bits, &mut lh_ctg);
            lh_sum += s;
            lh_implicit > 0
        }
        SplitEncoding::Fac => {
            let run_set = cand.run_set.as_ref().expect("factor winner without runs");
            for run in run_set.lh_runs() {
                if let Some(range) = run.range {
                    let (s, _) = part.block_replay(cand.pred, buf, range, lh_bits, &mut lh_ctg);
                    lh_sum += s;
                }
            }
            run_set.implicit_lh()
        }
    };
    if implicit_left {
        lh_sum += node.sum - expl_sum;
        for c in 0..n_ctg {
            lh_ctg[c] += node.ctg_sum[c] - expl_ctg[c];
        }
    }

    // Partition the primary segment: left-goers first, order preserved.
    let seg_lo = node.start as usize;
    let seg_hi = seg_lo + node.extent as usize;
    let mut fill = 0usize;
    for &sample in &primary[seg_lo..seg_hi] {
        let s = sample as usize;
        let left = lh_bits.test_bit(s) || (implicit_left && !expl_bits.test_bit(s));
        if left {
            scratch[fill] = sample;
            fill += 1;
        }
    }
    debug_assert_eq!(fill as u32, nux.lh_extent);
    for &sample in &primary[seg_lo..seg_hi] {
        let s = sample as usize;
        let left = lh_bits.test_bit(s) || (implicit_left && !expl_bits.test_bit(s));
        if !left {
            scratch[fill] = sample;
            fill += 1;
        }
    }
    primary[seg_lo..seg_hi].copy_from_slice(&scratch[..node.extent as usize]);

    // Offspring statistics.
    let rh_sum = node.sum - lh_sum;
    let rh_s_count = node.s_count - nux.lh_s_count;
    let rh_ctg: Vec<f64> = node
        .ctg_sum
        .iter()
        .zip(lh_ctg.iter())
        .map(|(n, l)| n - l)
        .collect();
    let lh_ss: f64 = lh_ctg.iter().map(|s| s * s).sum();
    let rh_ss: f64 = rh_ctg.iter().map(|s| s * s).sum();

    let left_stat = PTStat {
        s_count: nux.lh_s_count,
        sum: lh_sum,
        ctg_sum: lh_ctg.clone(),
    };
    let right_stat = PTStat {
        s_count: rh_s_count,
        sum: rh_sum,
        ctg_sum: rh_ctg.clone(),
    };

    let (lh_pt, rh_pt) = match nux.encoding {
        SplitEncoding::Num { rank_lo, rank_hi, .. } => pretree.branch_num(
            node.pt_id,
            nux.pred as u32,
            rank_lo,
            rank_hi,
            nux.info,
            left_stat,
            right_stat,
        ),
        SplitEncoding::Fac => {
            let card = frame.cardinality(cand.pred);
            let offspring = pretree.branch_fac(
                node.pt_id,
                nux.pred as u32,
                card,
                nux.info,
                left_stat,
                right_stat,
            );
            let run_set = cand.run_set.as_ref().expect("factor winner without runs");
            for run in run_set.lh_runs() {
                pretree.lh_bit(node.pt_id, run.rank);
            }
            offspring
        }
    };

    // Bear the offspring and extend each sample's path.
    let lh_node = next_nodes.len() as u32;
    let rh_node = lh_node + 1;
    for (pos, &sample) in primary[seg_lo..seg_hi].iter().enumerate() {
        let left = (pos as u32) < nux.lh_extent;
        path.extend(
            sample as usize,
            left,
            if left { lh_node } else { rh_node },
        );
    }

    next_nodes.push(IndexSet {
        pt_id: lh_pt,
        start: node.start,
        extent: nux.lh_extent,
        s_count: nux.lh_s_count,
        sum: lh_sum,
        sum_squares: lh_ss,
        pre_bias: pre_bias(n_ctg, nux.lh_s_count, lh_sum, lh_ss),
        ctg_sum: lh_ctg,
        min_info: cfg.min_ratio * nux.info,
    });
    next_nodes.push(IndexSet {
        pt_id: rh_pt,
        start: node.start + nux.lh_extent,
        extent: node.extent - nux.lh_extent,
        s_count: rh_s_count,
        sum: rh_sum,
        sum_squares: rh_ss,
        pre_bias: pre_bias(n_ctg, rh_s_count, rh_sum, rh_ss),
        ctg_sum: rh_ctg,
        min_info: cfg.min_ratio * nux.info,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::sampler::{Response, Sampler};
    use rand::SeedableRng;

    fn cfg() -> GrowConfig {
        GrowConfig {
            min_node: 1,
            tot_levels: 0,
            min_ratio: 0.0,
            leaf_max: 0,
            pred_fixed: 0,
            pred_prob: Vec::new(),
            reg_mono: Vec::new(),
            parallel: false,
        }
    }

    fn grow(
        frame: &RankedFrame,
        response: &Response,
        cfg: &GrowConfig,
        seed: u64,
    ) -> (GrownTree, SampleSet) {
        let n_obs = frame.n_row();
        let sampler = Sampler::new(n_obs, n_obs, false, None).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let set = sampler.sample(response, &mut rng).unwrap();
        let tree = one_tree(frame, &set, response.n_ctg(), cfg, &mut rng);
        (tree, set)
    }

    #[test]
    fn constant_response_is_single_leaf() {
        let frame = FrameBuilder::new()
            .add_num(&[1.0, 2.0, 3.0, 4.0])
            .build()
            .unwrap();
        let response = Response::regression(vec![7.0; 4]).unwrap();
        let (tree, _) = grow(&frame, &response, &cfg(), 3);
        assert_eq!(tree.pretree.height(), 1);
        assert_eq!(tree.pretree.leaf_count(), 1);
        assert!(tree.st_term.iter().all(|&pt| pt == 0));
    }

    #[test]
    fn single_value_predictor_is_leaf() {
        let frame = FrameBuilder::new()
            .auto_compress(1.0)
            .add_num(&[5.0; 8])
            .build()
            .unwrap();
        let response = Response::regression((0..8).map(f64::from).collect()).unwrap();
        let (tree, _) = grow(&frame, &response, &cfg(), 3);
        assert_eq!(tree.pretree.leaf_count(), 1);
    }

    #[test]
    fn clean_numeric_split_partitions_samples() {
        let frame = FrameBuilder::new()
            .add_num(&[1.0, 1.0, 1.0, 1.0, 9.0, 9.0, 9.0, 9.0])
            .build()
            .unwrap();
        let y = vec![1.0, 1.0, 1.0, 1.0, 9.0, 9.0, 9.0, 9.0];
        let response = Response::regression(y).unwrap();
        let (tree, set) = grow(&frame, &response, &cfg(), 5);

        // Root split plus two pure leaves.
        assert_eq!(tree.pretree.height(), 3);
        assert_eq!(tree.pretree.leaf_count(), 2);
        // Samples of the two blocks land in distinct terminals.
        let term_of = |row: u32| tree.st_term[set.row2sample[row as usize] as usize];
        for row in 0..4 {
            assert_eq!(term_of(row), term_of(0));
        }
        for row in 4..8 {
            assert_eq!(term_of(row), term_of(4));
        }
        assert_ne!(term_of(0), term_of(4));
    }

    #[test]
    fn depth_cap_stops_growth() {
        let frame = FrameBuilder::new()
            .add_num(&(0..64).map(f64::from).collect::<Vec<_>>())
            .build()
            .unwrap();
        let response = Response::regression((0..64).map(f64::from).collect()).unwrap();
        let mut capped = cfg();
        capped.tot_levels = 1;
        let (tree, _) = grow(&frame, &response, &capped, 9);
        // One level: a root split at most.
        assert!(tree.pretree.height() <= 3);
    }

    #[test]
    fn min_ratio_prunes_weak_children() {
        let frame = FrameBuilder::new()
            .add_num(&(0..32).map(f64::from).collect::<Vec<_>>())
            .build()
            .unwrap();
        // Step response: one strong cut, then noise-free plateaus.
        let y: Vec<f64> = (0..32).map(|i| if i < 16 { 0.0 } else { 1.0 }).collect();
        let response = Response::regression(y).unwrap();
        let mut strict = cfg();
        strict.min_ratio = 0.99;
        let (tree, _) = grow(&frame, &response, &strict, 11);
        // The plateau children have zero gain and cannot clear the floor.
        assert_eq!(tree.pretree.height(), 3);
    }

    #[test]
    fn factor_response_splits_codes() {
        let frame = FrameBuilder::new()
            .add_fac(&[0, 0, 0, 0, 0, 1, 1, 1, 1, 1], 2)
            .build()
            .unwrap();
        let response =
            Response::classification(vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1], 2).unwrap();
        let (tree, set) = grow(&frame, &response, &cfg(), 13);
        assert_eq!(tree.pretree.leaf_count(), 2);
        let term_of = |row: u32| tree.st_term[set.row2sample[row as usize] as usize];
        assert_ne!(term_of(0), term_of(9));
    }

    #[test]
    fn every_sample_lands_in_one_terminal() {
        let frame = FrameBuilder::new()
            .add_num(&(0..40).map(|i| f64::from(i % 7)).collect::<Vec<_>>())
            .add_num(&(0..40).map(|i| f64::from(i % 11)).collect::<Vec<_>>())
            .build()
            .unwrap();
        let y: Vec<f64> = (0..40).map(|i| f64::from(i % 5)).collect();
        let response = Response::regression(y).unwrap();
        let (tree, set) = grow(&frame, &response, &cfg(), 17);

        // Terminal multiplicities cover the bag exactly.
        let packed = tree.pretree.consume(
            &FrameBuilder::new()
                .add_num(&(0..40).map(|i| f64::from(i % 7)).collect::<Vec<_>>())
                .add_num(&(0..40).map(|i| f64::from(i % 11)).collect::<Vec<_>>())
                .build()
                .unwrap(),
            &[0.5, 0.5],
        );
        let mut per_leaf = vec![0u64; packed.leaf_count];
        for (sample, &pt) in tree.st_term.iter().enumerate() {
            let leaf = packed.leaf_of_pt[pt as usize];
            assert_ne!(leaf, NO_LEAF);
            per_leaf[leaf as usize] += set.s_count[sample] as u64;
        }
        let total: u64 = per_leaf.iter().sum();
        assert_eq!(total, set.total_s_count());
        assert!(per_leaf.iter().all(|&c| c > 0));
    }
}
