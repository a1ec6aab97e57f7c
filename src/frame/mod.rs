//! Presorted, rank-encoded observation frame.
//!
//! Each predictor column is replaced at ingest by a sorted stream of
//! `(row, rank, run_length)` cells: ranks ascend with the predictor value,
//! ties share a rank, and maximal runs of consecutive rows at one rank are
//! collapsed. Numeric predictors carry a side table mapping rank back to
//! value; factor predictors use the category code itself as the rank, so a
//! code doubles as a bit position in factor-split masks.
//!
//! A predictor whose most populous rank covers at least
//! `auto_compress x n_row` rows is stored without that rank's cells; the
//! missing block is reconstructed downstream as a residual against node
//! totals. The frame is built once and immutable thereafter.

mod ingest;

pub use ingest::FrameBuilder;

use ndarray::Array2;

/// One run-length cell of a predictor's sorted stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleCell {
    /// First row of the run.
    pub row: u32,
    /// Rank shared by the whole run.
    pub rank: u32,
    /// Run length in rows.
    pub run: u32,
}

/// Immutable presorted frame over all predictors.
///
/// Numeric predictors occupy indices `[0, n_pred_num)`; factor predictors
/// `[n_pred_num, n_pred)`. Built via [`FrameBuilder`].
#[derive(Debug, Clone)]
pub struct RankedFrame {
    pub(crate) n_row: usize,
    pub(crate) n_pred_num: usize,
    pub(crate) n_pred_fac: usize,

    /// All predictors' RLE streams, concatenated.
    pub(crate) rle: Vec<RleCell>,
    /// Per-predictor offset into `rle`.
    pub(crate) rr_start: Vec<usize>,
    /// Per-predictor cell count in `rle`.
    pub(crate) rr_extent: Vec<usize>,

    /// Per-predictor count of explicitly represented rows.
    pub(crate) explicit_count: Vec<usize>,
    /// Per-predictor dense rank, if designated.
    pub(crate) dense_rank: Vec<Option<u32>>,
    /// Per-predictor count of rows at the dense rank.
    pub(crate) implicit_count: Vec<usize>,
    /// Per-predictor distinct-rank count.
    pub(crate) rank_count: Vec<usize>,

    /// Per-numeric-predictor offset into `num_val`.
    pub(crate) num_offset: Vec<usize>,
    /// Rank-to-value tables for numeric predictors.
    pub(crate) num_val: Vec<f64>,

    /// Per-factor-predictor cardinality.
    pub(crate) fac_card: Vec<usize>,

    /// Count of predictors staged at full stride.
    pub(crate) noncompact: usize,
    /// Total compact staging extent.
    pub(crate) accum_compact: usize,
    /// Per-predictor staging ordinal; see [`RankedFrame::safe_offset`].
    pub(crate) safe_ord: Vec<usize>,
}

impl RankedFrame {
    /// Observation (row) count.
    #[inline]
    pub fn n_row(&self) -> usize {
        self.n_row
    }

    /// Total predictor count.
    #[inline]
    pub fn n_pred(&self) -> usize {
        self.n_pred_num + self.n_pred_fac
    }

    /// Numeric predictor count.
    #[inline]
    pub fn n_pred_num(&self) -> usize {
        self.n_pred_num
    }

    /// Factor predictor count.
    #[inline]
    pub fn n_pred_fac(&self) -> usize {
        self.n_pred_fac
    }

    /// Whether a predictor is factor-valued.
    #[inline]
    pub fn is_factor(&self, pred: usize) -> bool {
        pred >= self.n_pred_num
    }

    /// Cardinality of a predictor: factor level count, zero for numeric.
    #[inline]
    pub fn cardinality(&self, pred: usize) -> usize {
        if self.is_factor(pred) {
            self.fac_card[pred - self.n_pred_num]
        } else {
            0
        }
    }

    /// The predictor's RLE stream.
    #[inline]
    pub fn rle_stream(&self, pred: usize) -> &[RleCell] {
        &self.rle[self.rr_start[pred]..self.rr_start[pred] + self.rr_extent[pred]]
    }

    /// Dense rank for a predictor, if one was designated at ingest.
    #[inline]
    pub fn dense_rank(&self, pred: usize) -> Option<u32> {
        self.dense_rank[pred]
    }

    /// Count of rows at the predictor's dense rank.
    #[inline]
    pub fn implicit_count(&self, pred: usize) -> usize {
        self.implicit_count[pred]
    }

    /// Count of rows represented explicitly for the predictor.
    #[inline]
    pub fn explicit_count(&self, pred: usize) -> usize {
        self.explicit_count[pred]
    }

    /// Distinct-rank count for the predictor.
    #[inline]
    pub fn rank_count(&self, pred: usize) -> usize {
        self.rank_count[pred]
    }

    /// Numeric value at a rank.
    #[inline]
    pub fn num_val(&self, pred: usize, rank: u32) -> f64 {
        debug_assert!(!self.is_factor(pred));
        self.num_val[self.num_offset[pred] + rank as usize]
    }

    /// Conservative staging-buffer size for a per-sample stride.
    ///
    /// Predictors without a dense rank stage at full stride; compacted
    /// predictors reserve only their explicit extent.
    pub fn safe_size(&self, stride: usize) -> usize {
        self.noncompact * stride + self.accum_compact
    }

    /// Staging offset and capacity for one predictor under a stride.
    pub fn safe_offset(&self, pred: usize, stride: usize) -> (usize, usize) {
        if self.dense_rank[pred].is_none() {
            (self.safe_ord[pred] * stride, stride)
        } else {
            (
                self.noncompact * stride + self.safe_ord[pred],
                self.explicit_count[pred],
            )
        }
    }

    /// Interpolated numeric split value for a rank range.
    ///
    /// Synthesizes the fractional rank `lo + quant * (hi - lo)` and lerps
    /// between the values at its floor and ceiling; a whole-number rank
    /// resolves to the left endpoint.
    pub fn quant_rank(&self, pred: usize, rank_lo: u32, rank_hi: u32, quant: f64) -> f64 {
        let rank_num = rank_lo as f64 + quant * (rank_hi as f64 - rank_lo as f64);
        let floor = rank_num.floor();
        let lo = self.num_val(pred, floor as u32);
        let hi = self.num_val(pred, rank_num.ceil() as u32);
        lo + (rank_num - floor) * (hi - lo)
    }

    /// Reconstruct raw row-major predictor blocks from the sorted streams.
    ///
    /// Used for out-of-bag validation at fit time; prediction on fresh data
    /// takes caller-supplied blocks instead.
    pub fn decode_rows(&self) -> (Array2<f64>, Array2<u32>) {
        let mut num = Array2::zeros((self.n_row, self.n_pred_num));
        for pred in 0..self.n_pred_num {
            if let Some(dense) = self.dense_rank[pred] {
                let dense_val = self.num_val(pred, dense);
                num.column_mut(pred).fill(dense_val);
            }
            for cell in self.rle_stream(pred) {
                let val = self.num_val(pred, cell.rank);
                for r in cell.row..cell.row + cell.run {
                    num[[r as usize, pred]] = val;
                }
            }
        }

        let mut fac = Array2::zeros((self.n_row, self.n_pred_fac));
        for fac_idx in 0..self.n_pred_fac {
            let pred = self.n_pred_num + fac_idx;
            if let Some(dense) = self.dense_rank[pred] {
                fac.column_mut(fac_idx).fill(dense);
            }
            for cell in self.rle_stream(pred) {
                for r in cell.row..cell.row + cell.run {
                    fac[[r as usize, fac_idx]] = cell.rank;
                }
            }
        }
        (num, fac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn two_pred_frame() -> RankedFrame {
        FrameBuilder::new()
            .auto_compress(1.0)
            .add_num(&[3.0, 1.0, 2.0, 1.0])
            .add_fac(&[1, 0, 1, 2], 3)
            .build()
            .unwrap()
    }

    #[test]
    fn layout_and_types() {
        let frame = two_pred_frame();
        assert_eq!(frame.n_row(), 4);
        assert_eq!(frame.n_pred(), 2);
        assert!(!frame.is_factor(0));
        assert!(frame.is_factor(1));
        assert_eq!(frame.cardinality(0), 0);
        assert_eq!(frame.cardinality(1), 3);
    }

    #[test]
    fn numeric_ranks_respect_ties() {
        let frame = two_pred_frame();
        // Values 1.0, 1.0, 2.0, 3.0 -> ranks 0, 0, 1, 2.
        assert_eq!(frame.rank_count(0), 3);
        assert_abs_diff_eq!(frame.num_val(0, 0), 1.0);
        assert_abs_diff_eq!(frame.num_val(0, 1), 2.0);
        assert_abs_diff_eq!(frame.num_val(0, 2), 3.0);

        let stream = frame.rle_stream(0);
        let total: u32 = stream.iter().map(|c| c.run).sum();
        assert_eq!(total, 4);
        // Ranks ascend along the stream.
        for w in stream.windows(2) {
            assert!(w[0].rank <= w[1].rank);
        }
    }

    #[test]
    fn factor_rank_is_code() {
        let frame = two_pred_frame();
        let stream = frame.rle_stream(1);
        // Codes 0,1,1,2 sorted: rank equals the raw code.
        assert_eq!(stream[0].rank, 0);
        assert_eq!(stream.last().unwrap().rank, 2);
        assert_eq!(frame.rank_count(1), 3);
    }

    #[test]
    fn quant_rank_interpolates() {
        let frame = two_pred_frame();
        // Midpoint of ranks 0 and 1: values 1.0 and 2.0.
        assert_abs_diff_eq!(frame.quant_rank(0, 0, 1, 0.5), 1.5);
        // Quantile 0 resolves to the left endpoint, 1 to the right.
        assert_abs_diff_eq!(frame.quant_rank(0, 0, 1, 0.0), 1.0);
        assert_abs_diff_eq!(frame.quant_rank(0, 0, 1, 1.0), 2.0);
        // Degenerate range sticks to the endpoint.
        assert_abs_diff_eq!(frame.quant_rank(0, 2, 2, 0.5), 3.0);
    }

    #[test]
    fn decode_round_trips_columns() {
        let frame = two_pred_frame();
        let (num, fac) = frame.decode_rows();
        assert_abs_diff_eq!(num[[0, 0]], 3.0);
        assert_abs_diff_eq!(num[[1, 0]], 1.0);
        assert_abs_diff_eq!(num[[2, 0]], 2.0);
        assert_abs_diff_eq!(num[[3, 0]], 1.0);
        assert_eq!(fac[[0, 0]], 1);
        assert_eq!(fac[[1, 0]], 0);
        assert_eq!(fac[[3, 0]], 2);
    }

    #[test]
    fn dense_rank_decode() {
        // 8 of 10 rows share value 0.0; threshold 0.5 designates it dense.
        let mut col = vec![0.0; 10];
        col[3] = 5.0;
        col[7] = -2.0;
        let frame = FrameBuilder::new()
            .auto_compress(0.5)
            .add_num(&col)
            .build()
            .unwrap();

        assert!(frame.dense_rank(0).is_some());
        assert_eq!(frame.implicit_count(0), 8);
        assert_eq!(frame.explicit_count(0), 2);

        let (num, _) = frame.decode_rows();
        for r in 0..10 {
            assert_abs_diff_eq!(num[[r, 0]], col[r]);
        }
    }
}
