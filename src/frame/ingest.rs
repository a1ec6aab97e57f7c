//! Frame construction: presorting, rank assignment, run-length compression
//! and dense-rank detection.

use ndarray::ArrayView2;

use super::{RankedFrame, RleCell};
use crate::error::TrainError;

/// Default dense-rank trigger: a rank covering a quarter of the rows is
/// worth compressing away.
pub const DEFAULT_AUTO_COMPRESS: f64 = 0.25;

/// Staged column prior to rank assignment.
enum RawColumn {
    /// Dense numeric values, one per row.
    NumDense(Vec<f64>),
    /// Sparse numeric runs `(value, row_start, run_length)` covering all rows.
    NumRle {
        vals: Vec<f64>,
        row_start: Vec<u32>,
        run_length: Vec<u32>,
    },
    /// Factor codes, one per row, with declared cardinality.
    Fac { codes: Vec<u32>, card: usize },
}

/// Builder for [`RankedFrame`].
///
/// Numeric columns must all be added before factor columns; the frame's
/// predictor indexing puts numeric predictors first.
///
/// # Example
///
/// ```
/// use canopy::FrameBuilder;
///
/// let frame = FrameBuilder::new()
///     .add_num(&[0.5, 1.5, 0.5, 2.0])
///     .add_fac(&[0, 1, 1, 0], 2)
///     .build()
///     .unwrap();
/// assert_eq!(frame.n_pred(), 2);
/// ```
pub struct FrameBuilder {
    auto_compress: f64,
    num_cols: Vec<RawColumn>,
    fac_cols: Vec<RawColumn>,
    error: Option<TrainError>,
}

impl Default for FrameBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuilder {
    pub fn new() -> Self {
        Self {
            auto_compress: DEFAULT_AUTO_COMPRESS,
            num_cols: Vec::new(),
            fac_cols: Vec::new(),
            error: None,
        }
    }

    /// Dense-rank trigger as a fraction of the row count. A value of 1.0 or
    /// more disables compression entirely.
    pub fn auto_compress(mut self, threshold: f64) -> Self {
        self.auto_compress = threshold;
        self
    }

    /// Add one dense numeric column.
    pub fn add_num(mut self, col: &[f64]) -> Self {
        if col.iter().any(|v| !v.is_finite()) {
            self.fail("non-finite value in numeric column");
        } else {
            self.num_cols.push(RawColumn::NumDense(col.to_vec()));
        }
        self
    }

    /// Add a dense column-major numeric block, one column per predictor.
    pub fn add_num_block(mut self, block: ArrayView2<'_, f64>) -> Self {
        for col in block.columns() {
            self = self.add_num(col.to_vec().as_slice());
        }
        self
    }

    /// Add one sparse numeric column as `(value, row_start, run_length)`
    /// triples. The runs must tile `[0, n_row)` exactly, in ascending row
    /// order; anything else is a bad-input error at build.
    pub fn add_num_rle(mut self, vals: &[f64], row_start: &[u32], run_length: &[u32]) -> Self {
        if vals.len() != row_start.len() || vals.len() != run_length.len() {
            self.fail("sparse numeric column has mismatched triple lengths");
        } else if vals.iter().any(|v| !v.is_finite()) {
            self.fail("non-finite value in sparse numeric column");
        } else {
            self.num_cols.push(RawColumn::NumRle {
                vals: vals.to_vec(),
                row_start: row_start.to_vec(),
                run_length: run_length.to_vec(),
            });
        }
        self
    }

    /// Add a sparse numeric block: `pred_start` indexes the shared triple
    /// arrays per predictor, terminated by the total triple count.
    pub fn add_num_sparse_block(
        mut self,
        vals: &[f64],
        row_start: &[u32],
        run_length: &[u32],
        pred_start: &[usize],
    ) -> Self {
        if pred_start.is_empty() || *pred_start.last().unwrap() != vals.len() {
            self.fail("sparse block pred_start does not terminate at the value count");
            return self;
        }
        for w in pred_start.windows(2) {
            let (lo, hi) = (w[0], w[1]);
            if hi < lo || hi > vals.len() {
                self.fail("sparse block pred_start is not ascending");
                return self;
            }
            self = self.add_num_rle(&vals[lo..hi], &row_start[lo..hi], &run_length[lo..hi]);
        }
        self
    }

    /// Add one factor column of zero-based codes with its cardinality.
    pub fn add_fac(mut self, codes: &[u32], card: usize) -> Self {
        if let Some(&bad) = codes.iter().find(|&&c| c as usize >= card) {
            self.fail(&format!(
                "factor code {} at or past declared cardinality {}",
                bad, card
            ));
        } else {
            self.fac_cols.push(RawColumn::Fac {
                codes: codes.to_vec(),
                card,
            });
        }
        self
    }

    fn fail(&mut self, msg: &str) {
        if self.error.is_none() {
            self.error = Some(TrainError::BadInput(msg.to_string()));
        }
    }

    /// Presort every column, assign ranks, compress runs and designate
    /// dense ranks.
    pub fn build(self) -> Result<RankedFrame, TrainError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.num_cols.is_empty() && self.fac_cols.is_empty() {
            return Err(TrainError::BadInput("frame has no predictors".into()));
        }

        // All columns must agree on the row count.
        let n_row = match self.num_cols.first().or(self.fac_cols.first()) {
            Some(RawColumn::NumDense(col)) => col.len(),
            Some(RawColumn::Fac { codes, .. }) => codes.len(),
            Some(RawColumn::NumRle { run_length, .. }) => {
                run_length.iter().map(|&r| r as usize).sum()
            }
            None => unreachable!(),
        };
        if n_row == 0 {
            return Err(TrainError::BadInput("frame has no rows".into()));
        }

        let n_pred_num = self.num_cols.len();
        let n_pred_fac = self.fac_cols.len();
        let n_pred = n_pred_num + n_pred_fac;

        let mut rle = Vec::new();
        let mut rr_start = Vec::with_capacity(n_pred);
        let mut rr_extent = Vec::with_capacity(n_pred);
        let mut explicit_count = Vec::with_capacity(n_pred);
        let mut dense_rank = Vec::with_capacity(n_pred);
        let mut implicit_count = Vec::with_capacity(n_pred);
        let mut rank_count = Vec::with_capacity(n_pred);
        let mut num_offset = Vec::with_capacity(n_pred_num);
        let mut num_val = Vec::new();
        let mut fac_card = Vec::with_capacity(n_pred_fac);

        for col in self.num_cols.iter().chain(self.fac_cols.iter()) {
            let (mut cells, ranks, card) = match col {
                RawColumn::NumDense(vals) => {
                    if vals.len() != n_row {
                        return Err(TrainError::BadInput(format!(
                            "numeric column length {} does not match row count {}",
                            vals.len(),
                            n_row
                        )));
                    }
                    let (cells, vals_out) = sort_num_dense(vals);
                    (cells, Some(vals_out), 0)
                }
                RawColumn::NumRle {
                    vals,
                    row_start,
                    run_length,
                } => {
                    let (cells, vals_out) = sort_num_rle(vals, row_start, run_length, n_row)?;
                    (cells, Some(vals_out), 0)
                }
                RawColumn::Fac { codes, card } => {
                    if codes.len() != n_row {
                        return Err(TrainError::BadInput(format!(
                            "factor column length {} does not match row count {}",
                            codes.len(),
                            n_row
                        )));
                    }
                    (sort_fac(codes), None, *card)
                }
            };

            let distinct = match &ranks {
                Some(vals_out) => vals_out.len(),
                // Factor ranks are raw codes; the span may exceed the count
                // of codes observed, but bit masks are sized by cardinality.
                None => cells.iter().map(|c| c.rank as usize + 1).max().unwrap_or(0),
            };

            // Dense-rank designation: the most populous rank, when heavy
            // enough and compression is not disabled.
            let mut dense = None;
            let mut implicit = 0usize;
            if self.auto_compress < 1.0 {
                if let Some((rank, count)) = heaviest_rank(&cells) {
                    if count as f64 >= self.auto_compress * n_row as f64 {
                        dense = Some(rank);
                        implicit = count;
                        cells.retain(|c| c.rank != rank);
                    }
                }
            }

            rr_start.push(rle.len());
            rr_extent.push(cells.len());
            explicit_count.push(n_row - implicit);
            dense_rank.push(dense);
            implicit_count.push(implicit);
            rank_count.push(distinct);
            rle.extend_from_slice(&cells);

            if let Some(vals_out) = ranks {
                num_offset.push(num_val.len());
                num_val.extend_from_slice(&vals_out);
            } else {
                fac_card.push(card);
            }
        }

        // Staging ordinals: full stride for uncompressed predictors,
        // compacted extents for the rest.
        let mut noncompact = 0usize;
        let mut accum_compact = 0usize;
        let mut safe_ord = Vec::with_capacity(n_pred);
        for pred in 0..n_pred {
            if dense_rank[pred].is_none() {
                safe_ord.push(noncompact);
                noncompact += 1;
            } else {
                safe_ord.push(accum_compact);
                accum_compact += explicit_count[pred];
            }
        }

        Ok(RankedFrame {
            n_row,
            n_pred_num,
            n_pred_fac,
            rle,
            rr_start,
            rr_extent,
            explicit_count,
            dense_rank,
            implicit_count,
            rank_count,
            num_offset,
            num_val,
            fac_card,
            noncompact,
            accum_compact,
            safe_ord,
        })
    }
}

/// Sort a dense numeric column into rank-ordered RLE cells plus the
/// rank-to-value table.
fn sort_num_dense(vals: &[f64]) -> (Vec<RleCell>, Vec<f64>) {
    let mut val_row: Vec<(f64, u32)> = vals
        .iter()
        .enumerate()
        .map(|(row, &v)| (v, row as u32))
        .collect();
    val_row.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite by validation").then(a.1.cmp(&b.1)));

    let mut cells = Vec::new();
    let mut table = Vec::new();
    let mut rank = 0u32;
    for (i, &(v, row)) in val_row.iter().enumerate() {
        if i == 0 {
            table.push(v);
        } else if v != val_row[i - 1].0 {
            rank += 1;
            table.push(v);
        }
        push_run(&mut cells, row, rank);
    }
    (cells, table)
}

/// Sort a sparse numeric column. Runs must tile the full row range.
fn sort_num_rle(
    vals: &[f64],
    row_start: &[u32],
    run_length: &[u32],
    n_row: usize,
) -> Result<(Vec<RleCell>, Vec<f64>), TrainError> {
    let covered: usize = run_length.iter().map(|&r| r as usize).sum();
    if covered != n_row {
        return Err(TrainError::BadInput(format!(
            "sparse numeric runs cover {} rows of {}",
            covered, n_row
        )));
    }
    let mut seen = vec![false; n_row];
    for (&start, &len) in row_start.iter().zip(run_length.iter()) {
        for row in start..start + len {
            let slot = seen.get_mut(row as usize).ok_or_else(|| {
                TrainError::BadInput(format!("sparse run exceeds row count at row {}", row))
            })?;
            if *slot {
                return Err(TrainError::BadInput(format!(
                    "sparse runs overlap at row {}",
                    row
                )));
            }
            *slot = true;
        }
    }

    // Order runs by value, then assign ranks over distinct values and
    // re-expand runs in row order within each rank.
    let mut order: Vec<usize> = (0..vals.len()).collect();
    order.sort_by(|&a, &b| {
        vals[a]
            .partial_cmp(&vals[b])
            .expect("finite by validation")
            .then(row_start[a].cmp(&row_start[b]))
    });

    let mut cells = Vec::new();
    let mut table = Vec::new();
    let mut rank = 0u32;
    for (i, &k) in order.iter().enumerate() {
        if i == 0 {
            table.push(vals[k]);
        } else if vals[k] != vals[order[i - 1]] {
            rank += 1;
            table.push(vals[k]);
        }
        cells.push(RleCell {
            row: row_start[k],
            rank,
            run: run_length[k],
        });
    }
    Ok((cells, table))
}

/// Sort a factor column; the rank of a cell is its raw code.
fn sort_fac(codes: &[u32]) -> Vec<RleCell> {
    let mut code_row: Vec<(u32, u32)> = codes
        .iter()
        .enumerate()
        .map(|(row, &c)| (c, row as u32))
        .collect();
    code_row.sort_unstable();

    let mut cells = Vec::new();
    for &(code, row) in &code_row {
        push_run(&mut cells, row, code);
    }
    cells
}

/// Append a row to the cell stream, extending the current run when the row
/// is adjacent and the rank unchanged.
fn push_run(cells: &mut Vec<RleCell>, row: u32, rank: u32) {
    if let Some(last) = cells.last_mut() {
        if last.rank == rank && last.row + last.run == row {
            last.run += 1;
            return;
        }
    }
    cells.push(RleCell { row, rank, run: 1 });
}

/// The rank covering the most rows, with its row count.
fn heaviest_rank(cells: &[RleCell]) -> Option<(u32, usize)> {
    let mut best: Option<(u32, usize)> = None;
    let mut cur_rank = u32::MAX;
    let mut cur_count = 0usize;
    for cell in cells {
        if cell.rank != cur_rank {
            if cur_count > 0 && best.map_or(true, |(_, c)| cur_count > c) {
                best = Some((cur_rank, cur_count));
            }
            cur_rank = cell.rank;
            cur_count = 0;
        }
        cur_count += cell.run as usize;
    }
    if cur_count > 0 && best.map_or(true, |(_, c)| cur_count > c) {
        best = Some((cur_rank, cur_count));
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_and_sparse_agree() {
        // Column: rows 0..3 hold 7.0, rows 3..8 hold 1.0, rows 8..10 hold 4.0.
        let mut dense = vec![0.0; 10];
        dense[..3].fill(7.0);
        dense[3..8].fill(1.0);
        dense[8..].fill(4.0);

        let a = FrameBuilder::new()
            .auto_compress(1.0)
            .add_num(&dense)
            .build()
            .unwrap();
        let b = FrameBuilder::new()
            .auto_compress(1.0)
            .add_num_rle(&[7.0, 1.0, 4.0], &[0, 3, 8], &[3, 5, 2])
            .build()
            .unwrap();

        assert_eq!(a.rank_count(0), b.rank_count(0));
        let (na, _) = a.decode_rows();
        let (nb, _) = b.decode_rows();
        assert_eq!(na, nb);
    }

    #[test]
    fn sparse_gap_is_bad_input() {
        let err = FrameBuilder::new()
            .add_num_rle(&[7.0, 1.0], &[0, 5], &[3, 5])
            .build()
            .unwrap_err();
        assert!(matches!(err, TrainError::BadInput(_)));
    }

    #[test]
    fn sparse_overlap_is_bad_input() {
        let err = FrameBuilder::new()
            .add_num_rle(&[7.0, 1.0], &[0, 2], &[4, 6])
            .build()
            .unwrap_err();
        assert!(matches!(err, TrainError::BadInput(_)));
    }

    #[test]
    fn sparse_block_pred_start_validated() {
        let err = FrameBuilder::new()
            .add_num_sparse_block(&[1.0, 2.0], &[0, 4], &[4, 4], &[0, 1])
            .build()
            .unwrap_err();
        assert!(matches!(err, TrainError::BadInput(_)));
    }

    #[test]
    fn factor_code_past_cardinality_rejected() {
        let err = FrameBuilder::new()
            .add_fac(&[0, 1, 3], 3)
            .build()
            .unwrap_err();
        assert!(matches!(err, TrainError::BadInput(_)));
    }

    #[test]
    fn auto_compress_one_disables_dense() {
        let frame = FrameBuilder::new()
            .auto_compress(1.0)
            .add_num(&[0.0; 16])
            .build()
            .unwrap();
        assert_eq!(frame.dense_rank(0), None);
        assert_eq!(frame.implicit_count(0), 0);
    }

    #[test]
    fn heaviest_rank_wins_dense_designation() {
        // Rank populations: 0.0 x 6, 1.0 x 3, 2.0 x 1.
        let mut col = vec![0.0; 6];
        col.extend_from_slice(&[1.0, 1.0, 1.0, 2.0]);
        let frame = FrameBuilder::new()
            .auto_compress(0.5)
            .add_num(&col)
            .build()
            .unwrap();
        assert_eq!(frame.dense_rank(0), Some(0));
        assert_eq!(frame.implicit_count(0), 6);
        // Explicit stream no longer mentions the dense rank.
        assert!(frame.rle_stream(0).iter().all(|c| c.rank != 0));
    }

    #[test]
    fn below_threshold_stays_explicit() {
        let mut col = vec![0.0; 4];
        col.extend((0..12).map(|i| i as f64 + 1.0));
        let frame = FrameBuilder::new()
            .auto_compress(0.5)
            .add_num(&col)
            .build()
            .unwrap();
        // 4 of 16 rows is below the 0.5 trigger.
        assert_eq!(frame.dense_rank(0), None);
    }

    #[test]
    fn safe_offsets_partition_buffer() {
        let mut sparse = vec![0.0; 12];
        sparse[0] = 9.0;
        sparse[5] = 3.0;
        let frame = FrameBuilder::new()
            .auto_compress(0.5)
            .add_num(&sparse)
            .add_num(&(0..12).map(f64::from).collect::<Vec<_>>())
            .build()
            .unwrap();

        let stride = 12;
        let (off0, ext0) = frame.safe_offset(0, stride);
        let (off1, ext1) = frame.safe_offset(1, stride);
        // Predictor 1 is noncompact and claims a full stride; predictor 0
        // compacts to its explicit extent past the strided region.
        assert_eq!((off1, ext1), (0, stride));
        assert_eq!(off0, stride);
        assert_eq!(ext0, 2);
        assert!(frame.safe_size(stride) >= off0 + ext0);
    }
}
