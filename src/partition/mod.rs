//! Double-buffered per-predictor sample ordering.
//!
//! During growth, each predictor keeps the node's bagged samples in rank
//! order inside its own slice of one large observation buffer. Two copies
//! of the buffer exist; each level reads cells from one and writes the
//! reordered cells for the next level into the other, so no in-place sort
//! ever happens. A cell carries the sample's rank for the predictor, its
//! multiplicity (with the category code packed into the low bits) and its
//! response sum.
//!
//! Predictor slices are laid out with the frame's conservative safe
//! offsets: predictors with a dense rank stage only their explicit cells in
//! a compact region, all others claim a full bag-sized stride.

mod path;

pub use path::{IdxPath, NO_NODE};

use crate::bits::BitVec;
use crate::frame::RankedFrame;
use crate::sampler::{SampleSet, NO_SAMPLE};

// =============================================================================
// Obs
// =============================================================================

/// One staged observation cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct Obs {
    rank: u32,
    /// Multiplicity, with the category code in the low `ctg_bits`.
    sc_packed: u32,
    y_sum: f64,
}

impl Obs {
    #[inline]
    fn new(rank: u32, s_count: u32, ctg: u32, y_sum: f64, ctg_bits: u32) -> Self {
        Self {
            rank,
            sc_packed: (s_count << ctg_bits) | ctg,
            y_sum,
        }
    }

    /// Rank of the cell.
    #[inline]
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Regression fields: response sum, rank, multiplicity.
    #[inline]
    pub fn reg_fields(&self, ctg_bits: u32) -> (f64, u32, u32) {
        (self.y_sum, self.rank, self.sc_packed >> ctg_bits)
    }

    /// Classification fields: response sum, rank, multiplicity, category.
    #[inline]
    pub fn ctg_fields(&self, ctg_bits: u32) -> (f64, u32, u32, u32) {
        (
            self.y_sum,
            self.rank,
            self.sc_packed >> ctg_bits,
            self.sc_packed & ((1 << ctg_bits) - 1),
        )
    }
}

// =============================================================================
// Ranges and staging summaries
// =============================================================================

/// Explicit cell range of one (node, predictor) pair within the predictor's
/// buffer slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpRange {
    pub start: u32,
    pub extent: u32,
}

impl ExpRange {
    #[inline]
    pub fn end(&self) -> u32 {
        self.start + self.extent
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.extent == 0
    }
}

/// Per-(node, predictor) outcome of a staging or restaging pass.
#[derive(Debug, Clone, Copy)]
pub struct StageCount {
    /// Explicit range within the predictor's slice.
    pub range: ExpRange,
    /// Count of distinct explicit ranks seen in the range.
    pub rank_count: u32,
}

impl StageCount {
    /// A (node, predictor) pair is a singleton when its samples cannot be
    /// told apart: at most one distinct rank, counting an implicit residual
    /// as a rank of its own.
    pub fn singleton(&self, implicit: u32) -> bool {
        let implicit_ranks = u32::from(implicit > 0);
        self.rank_count + implicit_ranks <= 1
    }
}

// =============================================================================
// ObsPart
// =============================================================================

/// The double-buffered observation partition for one tree.
pub struct ObsPart {
    /// Cell buffers, toggled by the level's buffer bit.
    obs: [Vec<Obs>; 2],
    /// Sample indices parallel to `obs`.
    idx: [Vec<u32>; 2],
    /// Per-predictor slice offset.
    pred_off: Vec<usize>,
    /// Per-predictor slice capacity.
    pred_cap: Vec<usize>,
    /// Width of the packed category field.
    ctg_bits: u32,
    /// Scratch for restage cursors, reused across calls.
    cursor: Vec<u32>,
}

impl ObsPart {
    /// Allocate both buffers for a tree with the given bag size.
    pub fn new(frame: &RankedFrame, bag_count: usize, n_ctg: usize) -> Self {
        let buf_size = frame.safe_size(bag_count);
        let n_pred = frame.n_pred();
        let mut pred_off = Vec::with_capacity(n_pred);
        let mut pred_cap = Vec::with_capacity(n_pred);
        for pred in 0..n_pred {
            let (off, cap) = frame.safe_offset(pred, bag_count);
            pred_off.push(off);
            pred_cap.push(cap);
        }
        let ctg_bits = if n_ctg > 1 {
            usize::BITS - (n_ctg - 1).leading_zeros()
        } else {
            0
        };
        Self {
            obs: [vec![Obs::default(); buf_size], vec![Obs::default(); buf_size]],
            idx: [vec![0; buf_size], vec![0; buf_size]],
            pred_off,
            pred_cap,
            ctg_bits,
            cursor: Vec::new(),
        }
    }

    /// Width of the packed category field.
    #[inline]
    pub fn ctg_bits(&self) -> u32 {
        self.ctg_bits
    }

    /// Cell and sample-index slices of one predictor in one buffer.
    #[inline]
    pub fn pred_slices(&self, pred: usize, buf: usize) -> (&[Obs], &[u32]) {
        let lo = self.pred_off[pred];
        let hi = lo + self.pred_cap[pred];
        (&self.obs[buf][lo..hi], &self.idx[buf][lo..hi])
    }

    /// Stage level zero into buffer 0: walk each predictor's sorted stream
    /// and copy the bagged entries, in rank order, into the predictor's
    /// slice. Returns one summary per predictor.
    pub fn stage(&mut self, frame: &RankedFrame, set: &SampleSet) -> Vec<StageCount> {
        let ctg_bits = self.ctg_bits;
        let mut counts = Vec::with_capacity(frame.n_pred());
        for pred in 0..frame.n_pred() {
            let base = self.pred_off[pred];
            let mut fill = 0usize;
            let mut rank_count = 0u32;
            let mut last_rank = u32::MAX;
            for cell in frame.rle_stream(pred) {
                for row in cell.row..cell.row + cell.run {
                    let sample = set.row2sample[row as usize];
                    if sample == NO_SAMPLE {
                        continue;
                    }
                    let s = sample as usize;
                    let ctg = if set.ctg.is_empty() { 0 } else { set.ctg[s] };
                    self.obs[0][base + fill] =
                        Obs::new(cell.rank, set.s_count[s], ctg, set.y_sum[s], ctg_bits);
                    self.idx[0][base + fill] = sample;
                    if cell.rank != last_rank {
                        rank_count += 1;
                        last_rank = cell.rank;
                    }
                    fill += 1;
                }
            }
            debug_assert!(fill <= self.pred_cap[pred]);
            counts.push(StageCount {
                range: ExpRange {
                    start: 0,
                    extent: fill as u32,
                },
                rank_count,
            });
        }
        counts
    }

    /// Restage one predictor for the next level.
    ///
    /// Reads the parents' explicit ranges from the source buffer, routes
    /// each live cell to its sample's front node, and writes the cells into
    /// per-node contiguous regions of the target buffer. Two passes: the
    /// first tabulates per-node cell counts (fixing each node's region),
    /// the second writes cells and counts distinct ranks per node. Extinct
    /// samples drop out here.
    ///
    /// Returns one summary per new node, in node order.
    pub fn restage_pred(
        &mut self,
        pred: usize,
        src_buf: usize,
        parent_ranges: &[ExpRange],
        path: &IdxPath,
        n_node: usize,
    ) -> Vec<StageCount> {
        let base = self.pred_off[pred];
        let tgt_buf = 1 - src_buf;

        // Pass 1: per-node explicit counts.
        let mut count = vec![0u32; n_node];
        for range in parent_ranges {
            for i in range.start..range.end() {
                let sample = self.idx[src_buf][base + i as usize] as usize;
                let node = path.front_node(sample);
                if node != NO_NODE {
                    count[node as usize] += 1;
                }
            }
        }

        // Node regions stack up in node order.
        let mut out = Vec::with_capacity(n_node);
        self.cursor.clear();
        let mut start = 0u32;
        for &c in &count {
            out.push(StageCount {
                range: ExpRange { start, extent: c },
                rank_count: 0,
            });
            self.cursor.push(start);
            start += c;
        }
        debug_assert!(start as usize <= self.pred_cap[pred]);

        // Pass 2: route cells; ranks arrive in order within each node, so
        // distinct-rank counting is a boundary test.
        let mut last_rank = vec![u32::MAX; n_node];
        for range in parent_ranges {
            for i in range.start..range.end() {
                let at = base + i as usize;
                let sample = self.idx[src_buf][at] as usize;
                let node = path.front_node(sample);
                if node == NO_NODE {
                    continue;
                }
                let node = node as usize;
                let obs = self.obs[src_buf][at];
                let dest = base + self.cursor[node] as usize;
                self.obs[tgt_buf][dest] = obs;
                self.idx[tgt_buf][dest] = sample as u32;
                self.cursor[node] += 1;
                if obs.rank != last_rank[node] {
                    out[node].rank_count += 1;
                    last_rank[node] = obs.rank;
                }
            }
        }
        out
    }

    /// Block-replay a winning split's explicit cell range: flip each
    /// sample's bit in `replay` and accumulate the range's response sums.
    ///
    /// Returns `(sum, s_count)` over the range; per-category sums
    /// accumulate into `ctg_sum` when non-empty.
    pub fn block_replay(
        &self,
        pred: usize,
        buf: usize,
        range: ExpRange,
        replay: &mut BitVec,
        ctg_sum: &mut [f64],
    ) -> (f64, u32) {
        let base = self.pred_off[pred];
        let ctg_bits = self.ctg_bits;
        let mut sum = 0.0;
        let mut s_count = 0u32;
        for i in range.start..range.end() {
            let at = base + i as usize;
            let obs = self.obs[buf][at];
            let (y_sum, _, sc, ctg) = obs.ctg_fields(ctg_bits);
            sum += y_sum;
            s_count += sc;
            if !ctg_sum.is_empty() {
                ctg_sum[ctg as usize] += y_sum;
            }
            replay.set_bit(self.idx[buf][at] as usize);
        }
        (sum, s_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;
    use crate::sampler::{Response, Sampler};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn staged_fixture() -> (RankedFrame, SampleSet, ObsPart, Vec<StageCount>) {
        let frame = FrameBuilder::new()
            .auto_compress(1.0)
            .add_num(&[5.0, 1.0, 3.0, 2.0, 4.0, 0.0])
            .add_fac(&[1, 0, 1, 0, 1, 0], 2)
            .build()
            .unwrap();
        let response = Response::regression(vec![5.0, 1.0, 3.0, 2.0, 4.0, 0.0]).unwrap();
        let sampler = Sampler::new(6, 6, false, None).unwrap();
        let set = sampler
            .sample(&response, &mut Xoshiro256PlusPlus::seed_from_u64(1))
            .unwrap();
        let mut part = ObsPart::new(&frame, set.bag_count, 0);
        let counts = part.stage(&frame, &set);
        (frame, set, part, counts)
    }

    #[test]
    fn stage_orders_by_rank() {
        let (_, set, part, counts) = staged_fixture();
        assert_eq!(counts[0].range.extent as usize, set.bag_count);
        assert_eq!(counts[0].rank_count, 6);
        // No-replacement full draw: all six distinct values present.
        let (obs, _) = part.pred_slices(0, 0);
        for w in obs[..6].windows(2) {
            assert!(w[0].rank() < w[1].rank());
        }
    }

    #[test]
    fn stage_counts_factor_ranks() {
        let (_, _, _, counts) = staged_fixture();
        assert_eq!(counts[1].rank_count, 2);
        assert!(!counts[1].singleton(0));
    }

    #[test]
    fn singleton_accounts_for_residual() {
        let sc = StageCount {
            range: ExpRange { start: 0, extent: 4 },
            rank_count: 1,
        };
        assert!(sc.singleton(0));
        // One explicit rank plus an implicit residual is two ranks.
        assert!(!sc.singleton(3));

        let empty = StageCount {
            range: ExpRange { start: 0, extent: 0 },
            rank_count: 0,
        };
        assert!(empty.singleton(0));
        assert!(empty.singleton(5));
    }

    #[test]
    fn restage_partitions_contiguously() {
        let (_, set, mut part, counts) = staged_fixture();
        // Send samples of rows 0..3 to node 0, the rest to node 1, as if a
        // split had landed that way.
        let mut path = IdxPath::new(set.bag_count);
        for (row, _) in set.rows() {
            let sample = set.row2sample[row as usize] as usize;
            if row < 3 {
                path.extend(sample, true, 0);
            } else {
                path.extend(sample, false, 1);
            }
        }

        let out = part.restage_pred(0, 0, &[counts[0].range], &path, 2);
        assert_eq!(out[0].range.extent + out[1].range.extent, 6);
        assert_eq!(out[0].range.start, 0);
        assert_eq!(out[1].range.start, out[0].range.extent);

        // Each child's cells stay in rank order and belong to the child.
        let (obs, idx) = part.pred_slices(0, 1);
        for node in 0..2u32 {
            let r = out[node as usize].range;
            for i in r.start..r.end() {
                assert_eq!(path.front_node(idx[i as usize] as usize), node);
            }
            for i in r.start + 1..r.end() {
                assert!(obs[i as usize - 1].rank() <= obs[i as usize].rank());
            }
        }
    }

    #[test]
    fn restage_drops_extinct() {
        let (_, set, mut part, counts) = staged_fixture();
        let mut path = IdxPath::new(set.bag_count);
        for sample in 0..set.bag_count {
            if sample % 2 == 0 {
                path.extend(sample, true, 0);
            } else {
                path.extinct(sample);
            }
        }
        let out = part.restage_pred(0, 0, &[counts[0].range], &path, 1);
        assert_eq!(out[0].range.extent as usize, set.bag_count / 2);
    }

    #[test]
    fn replay_flags_range_samples() {
        let (_, set, part, counts) = staged_fixture();
        let mut replay = BitVec::new(set.bag_count, 1);
        let lh = ExpRange {
            start: 0,
            extent: 3,
        };
        let (sum, s_count) = part.block_replay(0, 0, lh, &mut replay, &mut []);
        // Lowest three values: 0.0 + 1.0 + 2.0.
        assert!((sum - 3.0).abs() < 1e-12);
        assert_eq!(s_count, 3);
        assert_eq!(replay.pop_count(), 3);
        let _ = counts;
    }
}
