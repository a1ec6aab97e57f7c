//! Per-tree row sampling and response records.
//!
//! Each tree draws `n_samp` rows, with or without replacement, optionally
//! weighted per row. The draw is recorded two ways: a compact
//! [`SamplerNux`] stream of `(delta-row, multiplicity)` words in ascending
//! row order, and a bit per bagged row in the trainer's bag matrix. The
//! splitter never sees raw responses; it consumes the per-sample records
//! built here (response sums for regression, class-weight proxies for
//! classification).

use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

use crate::error::TrainError;

/// Sentinel for rows outside the bag.
pub const NO_SAMPLE: u32 = u32::MAX;

/// Row count per counting bin; sized so a bin's count table sits in cache.
const BIN_ROWS_LOG2: u32 = 16;

/// Row-count threshold above which the binning pass pays for itself.
const BIN_THRESHOLD: usize = 1 << (BIN_ROWS_LOG2 + 1);

// =============================================================================
// Response
// =============================================================================

/// Training response: numeric or categorical.
#[derive(Debug, Clone)]
pub enum Response {
    /// Numeric response, one value per row.
    Reg { y: Vec<f64> },
    /// Categorical response with per-category splitting proxies.
    Ctg {
        ctg: Vec<u32>,
        n_ctg: usize,
        /// Per-category proxy consumed by the splitter in place of `y`.
        proxy: Vec<f64>,
    },
}

impl Response {
    /// Numeric response.
    pub fn regression(y: Vec<f64>) -> Result<Self, TrainError> {
        if y.iter().any(|v| !v.is_finite()) {
            return Err(TrainError::BadInput("non-finite response value".into()));
        }
        Ok(Self::Reg { y })
    }

    /// Categorical response with uniform class weighting: the proxy for
    /// category `c` is the uniform `1 / n_obs` share scaled up by the
    /// inverse of `c`'s frequency, normalized so the per-sample proxy
    /// averages one. Rare categories are not drowned at split time, and
    /// downstream sum guards see unit-scale magnitudes.
    pub fn classification(ctg: Vec<u32>, n_ctg: usize) -> Result<Self, TrainError> {
        Self::classification_weighted(ctg, n_ctg, &[])
    }

    /// Categorical response; user weights multiply the per-category proxies.
    pub fn classification_weighted(
        ctg: Vec<u32>,
        n_ctg: usize,
        class_weight: &[f64],
    ) -> Result<Self, TrainError> {
        if n_ctg < 2 {
            return Err(TrainError::BadInput(format!(
                "classification requires at least 2 categories, got {}",
                n_ctg
            )));
        }
        if let Some(&bad) = ctg.iter().find(|&&c| c as usize >= n_ctg) {
            return Err(TrainError::BadInput(format!(
                "category code {} at or past cardinality {}",
                bad, n_ctg
            )));
        }
        if !class_weight.is_empty() && class_weight.len() != n_ctg {
            return Err(TrainError::BadInput(format!(
                "class_weight length {} does not match category count {}",
                class_weight.len(),
                n_ctg
            )));
        }

        let mut count = vec![0usize; n_ctg];
        for &c in &ctg {
            count[c as usize] += 1;
        }
        let n_obs = ctg.len() as f64;
        let proxy = (0..n_ctg)
            .map(|c| {
                let freq = count[c].max(1) as f64 / n_obs;
                let user = if class_weight.is_empty() {
                    1.0
                } else {
                    class_weight[c]
                };
                user / (n_ctg as f64 * freq)
            })
            .collect();

        Ok(Self::Ctg { ctg, n_ctg, proxy })
    }

    /// Row count.
    pub fn n_obs(&self) -> usize {
        match self {
            Self::Reg { y } => y.len(),
            Self::Ctg { ctg, .. } => ctg.len(),
        }
    }

    /// Category count; zero for regression.
    pub fn n_ctg(&self) -> usize {
        match self {
            Self::Reg { .. } => 0,
            Self::Ctg { n_ctg, .. } => *n_ctg,
        }
    }

    /// Splitting response for a row: raw value or category proxy.
    #[inline]
    fn y_val(&self, row: usize) -> f64 {
        match self {
            Self::Reg { y } => y[row],
            Self::Ctg { ctg, proxy, .. } => proxy[ctg[row] as usize],
        }
    }

    /// Category of a row; zero for regression.
    #[inline]
    fn ctg_val(&self, row: usize) -> u32 {
        match self {
            Self::Reg { .. } => 0,
            Self::Ctg { ctg, .. } => ctg[row],
        }
    }
}

// =============================================================================
// SamplerNux
// =============================================================================

/// One bagged row: delta to the previous bagged row and multiplicity,
/// packed into a single word. The bit split is a runtime parameter carried
/// by the owning [`SampleSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerNux(u64);

impl SamplerNux {
    /// Pack, raising `SamplerOverflow` if either field exceeds its width.
    pub fn pack(delta: u64, mult: u64, mult_bits: u32) -> Result<Self, TrainError> {
        let delta_bits = 64 - mult_bits;
        if mult >= (1u64 << mult_bits) {
            return Err(TrainError::SamplerOverflow {
                field: "multiplicity",
                value: mult,
                bits: mult_bits,
            });
        }
        if delta_bits < 64 && delta >= (1u64 << delta_bits) {
            return Err(TrainError::SamplerOverflow {
                field: "row delta",
                value: delta,
                bits: delta_bits,
            });
        }
        Ok(Self((delta << mult_bits) | mult))
    }

    /// Delta to the previous bagged row.
    #[inline]
    pub fn delta(self, mult_bits: u32) -> u64 {
        self.0 >> mult_bits
    }

    /// Sample multiplicity.
    #[inline]
    pub fn mult(self, mult_bits: u32) -> u64 {
        self.0 & ((1u64 << mult_bits) - 1)
    }
}

// =============================================================================
// Sampler / SampleSet
// =============================================================================

/// Draws per-tree bags. One sampler serves every tree of a fit; per-tree
/// randomness comes in through the caller's generator.
#[derive(Debug, Clone)]
pub struct Sampler {
    n_obs: usize,
    n_samp: usize,
    with_repl: bool,
    /// Cumulative row weights for weighted draws.
    cum_weight: Option<Vec<f64>>,
    /// Raw row weights, kept for without-replacement keys.
    weight: Option<Vec<f64>>,
    /// Low-bit width of the packed nux word.
    mult_bits: u32,
}

impl Sampler {
    pub fn new(
        n_obs: usize,
        n_samp: usize,
        with_repl: bool,
        sample_weight: Option<&[f64]>,
    ) -> Result<Self, TrainError> {
        if n_samp == 0 {
            return Err(TrainError::InvalidConfig("n_samp == 0".into()));
        }
        if !with_repl && n_samp > n_obs {
            return Err(TrainError::InvalidConfig(format!(
                "n_samp ({}) exceeds n_obs ({}) without replacement",
                n_samp, n_obs
            )));
        }
        let weight = match sample_weight {
            None => None,
            Some(w) if w.is_empty() => None,
            Some(w) => {
                if w.len() != n_obs {
                    return Err(TrainError::InvalidConfig(format!(
                        "sample_weight length {} does not match n_obs {}",
                        w.len(),
                        n_obs
                    )));
                }
                if w.iter().any(|&x| !(x >= 0.0) || !x.is_finite()) {
                    return Err(TrainError::InvalidConfig(
                        "sample_weight entries must be finite and non-negative".into(),
                    ));
                }
                Some(w.to_vec())
            }
        };
        let cum_weight = weight.as_ref().map(|w| {
            let mut acc = 0.0;
            w.iter()
                .map(|&x| {
                    acc += x;
                    acc
                })
                .collect()
        });

        // Delta field sized to span the full row range; multiplicity takes
        // the rest of the word.
        let delta_bits = (usize::BITS - n_obs.leading_zeros()).max(1);
        let mult_bits = 64 - delta_bits;

        Ok(Self {
            n_obs,
            n_samp,
            with_repl,
            cum_weight,
            weight,
            mult_bits,
        })
    }

    #[inline]
    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    #[inline]
    pub fn n_samp(&self) -> usize {
        self.n_samp
    }

    /// Draw one tree's bag and build its per-sample records.
    pub fn sample(
        &self,
        response: &Response,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Result<SampleSet, TrainError> {
        let mut count_row = vec![0u32; self.n_obs];
        if self.with_repl {
            let mut drawn = self.draw_with_replacement(rng);
            if self.n_obs >= BIN_THRESHOLD {
                bin_rows(&mut drawn);
            }
            for row in drawn {
                count_row[row as usize] += 1;
            }
        } else {
            for row in self.draw_without_replacement(rng) {
                count_row[row as usize] = 1;
            }
        }

        SampleSet::build(&count_row, response, self.mult_bits)
    }

    fn draw_with_replacement(&self, rng: &mut Xoshiro256PlusPlus) -> Vec<u32> {
        match &self.cum_weight {
            None => (0..self.n_samp)
                .map(|_| rng.gen_range(0..self.n_obs) as u32)
                .collect(),
            Some(cum) => {
                let total = *cum.last().unwrap();
                (0..self.n_samp)
                    .map(|_| {
                        let u = rng.gen::<f64>() * total;
                        cum.partition_point(|&c| c <= u).min(self.n_obs - 1) as u32
                    })
                    .collect()
            }
        }
    }

    fn draw_without_replacement(&self, rng: &mut Xoshiro256PlusPlus) -> Vec<u32> {
        match &self.weight {
            None => {
                // Partial Fisher-Yates over the row range.
                let mut rows: Vec<u32> = (0..self.n_obs as u32).collect();
                for i in 0..self.n_samp {
                    let j = rng.gen_range(i..self.n_obs);
                    rows.swap(i, j);
                }
                rows.truncate(self.n_samp);
                rows
            }
            Some(w) => {
                // Weighted without replacement via exponential keys: the
                // n_samp smallest values of e / w are the drawn rows.
                let mut keyed: Vec<(f64, u32)> = w
                    .iter()
                    .enumerate()
                    .map(|(row, &wt)| {
                        let key = if wt > 0.0 {
                            -rng.gen::<f64>().ln() / wt
                        } else {
                            f64::INFINITY
                        };
                        (key, row as u32)
                    })
                    .collect();
                keyed.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("finite keys"));
                keyed.truncate(self.n_samp);
                keyed.into_iter().map(|(_, row)| row).collect()
            }
        }
    }
}

/// Cache-friendly scatter of drawn row indices: count per bin, scan the
/// counts right-exclusively, then place each index at the top of its bin's
/// reserved region, walking the region downward.
fn bin_rows(rows: &mut Vec<u32>) {
    let n_bin = (rows.iter().map(|&r| r >> BIN_ROWS_LOG2).max().unwrap_or(0) + 1) as usize;
    if n_bin <= 1 {
        return;
    }

    let mut scan = vec![0usize; n_bin];
    for &row in rows.iter() {
        scan[(row >> BIN_ROWS_LOG2) as usize] += 1;
    }
    let mut total = 0usize;
    for count in scan.iter_mut() {
        total += *count;
        *count = total;
    }

    let mut out = vec![0u32; rows.len()];
    for &row in rows.iter() {
        let bin = (row >> BIN_ROWS_LOG2) as usize;
        scan[bin] -= 1;
        out[scan[bin]] = row;
    }
    *rows = out;
}

/// One tree's bag: packed row stream plus the per-sample records the
/// splitter consumes.
#[derive(Debug, Clone)]
pub struct SampleSet {
    /// Packed `(delta-row, multiplicity)` stream in ascending row order.
    pub nux: Vec<SamplerNux>,
    /// Low-bit width of the packed words.
    pub mult_bits: u32,
    /// Count of distinct bagged rows.
    pub bag_count: usize,

    /// Per-sample response sum: `multiplicity x y`.
    pub y_sum: Vec<f64>,
    /// Per-sample multiplicity.
    pub s_count: Vec<u32>,
    /// Per-sample category; empty for regression.
    pub ctg: Vec<u32>,
    /// Row-to-sample-index map, `NO_SAMPLE` outside the bag.
    pub row2sample: Vec<u32>,

    /// Response sum over the bag.
    pub sum: f64,
    /// Per-category response sums over the bag; empty for regression.
    pub ctg_sum: Vec<f64>,
}

impl SampleSet {
    fn build(
        count_row: &[u32],
        response: &Response,
        mult_bits: u32,
    ) -> Result<Self, TrainError> {
        let n_ctg = response.n_ctg();
        let mut nux = Vec::new();
        let mut y_sum = Vec::new();
        let mut s_count = Vec::new();
        let mut ctg = Vec::new();
        let mut row2sample = vec![NO_SAMPLE; count_row.len()];
        let mut ctg_sum = vec![0.0; n_ctg];
        let mut sum = 0.0;

        let mut prev_row = 0u64;
        for (row, &mult) in count_row.iter().enumerate() {
            if mult == 0 {
                continue;
            }
            let delta = row as u64 - prev_row;
            nux.push(SamplerNux::pack(delta, mult as u64, mult_bits)?);
            prev_row = row as u64;

            row2sample[row] = y_sum.len() as u32;
            let y = response.y_val(row) * mult as f64;
            sum += y;
            if n_ctg > 0 {
                let c = response.ctg_val(row);
                ctg_sum[c as usize] += y;
                ctg.push(c);
            }
            y_sum.push(y);
            s_count.push(mult);
        }

        let bag_count = nux.len();
        Ok(Self {
            nux,
            mult_bits,
            bag_count,
            y_sum,
            s_count,
            ctg,
            row2sample,
            sum,
            ctg_sum,
        })
    }

    /// Total multiplicity over the bag.
    pub fn total_s_count(&self) -> u64 {
        self.s_count.iter().map(|&c| c as u64).sum()
    }

    /// Iterate `(row, multiplicity)` in ascending row order.
    pub fn rows(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let mult_bits = self.mult_bits;
        self.nux.iter().scan(0u64, move |row, nux| {
            *row += nux.delta(mult_bits);
            Some((*row as u32, nux.mult(mult_bits) as u32))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng(seed: u64) -> Xoshiro256PlusPlus {
        Xoshiro256PlusPlus::seed_from_u64(seed)
    }

    fn reg_response(n: usize) -> Response {
        Response::regression((0..n).map(|i| i as f64).collect()).unwrap()
    }

    #[test]
    fn nux_packs_round_trip() {
        let nux = SamplerNux::pack(1234, 7, 16).unwrap();
        assert_eq!(nux.delta(16), 1234);
        assert_eq!(nux.mult(16), 7);
    }

    #[test]
    fn nux_overflow_raises() {
        let err = SamplerNux::pack(0, 1 << 16, 16).unwrap_err();
        assert!(matches!(
            err,
            TrainError::SamplerOverflow {
                field: "multiplicity",
                ..
            }
        ));
        let err = SamplerNux::pack(1 << 48, 0, 16).unwrap_err();
        assert!(matches!(
            err,
            TrainError::SamplerOverflow {
                field: "row delta",
                ..
            }
        ));
    }

    #[test]
    fn with_replacement_multiplicity_sums_to_n_samp() {
        let sampler = Sampler::new(50, 80, true, None).unwrap();
        let set = sampler.sample(&reg_response(50), &mut rng(7)).unwrap();
        assert_eq!(set.total_s_count(), 80);
        assert_eq!(set.bag_count, set.nux.len());
        assert!(set.bag_count <= 50);
    }

    #[test]
    fn without_replacement_is_distinct() {
        let sampler = Sampler::new(50, 30, false, None).unwrap();
        let set = sampler.sample(&reg_response(50), &mut rng(7)).unwrap();
        assert_eq!(set.bag_count, 30);
        assert!(set.s_count.iter().all(|&c| c == 1));
        assert_eq!(set.total_s_count(), 30);
    }

    #[test]
    fn rows_decode_in_ascending_order() {
        let sampler = Sampler::new(100, 100, true, None).unwrap();
        let set = sampler.sample(&reg_response(100), &mut rng(3)).unwrap();
        let rows: Vec<u32> = set.rows().map(|(r, _)| r).collect();
        for w in rows.windows(2) {
            assert!(w[0] < w[1]);
        }
        // row2sample inverts the stream.
        for (i, (row, _)) in set.rows().enumerate() {
            assert_eq!(set.row2sample[row as usize], i as u32);
        }
    }

    #[test]
    fn deterministic_under_seed() {
        let sampler = Sampler::new(64, 64, true, None).unwrap();
        let a = sampler.sample(&reg_response(64), &mut rng(11)).unwrap();
        let b = sampler.sample(&reg_response(64), &mut rng(11)).unwrap();
        assert_eq!(a.nux, b.nux);
    }

    #[test]
    fn zero_weight_rows_never_drawn() {
        let mut w = vec![1.0; 40];
        for i in 0..20 {
            w[i] = 0.0;
        }
        let sampler = Sampler::new(40, 25, true, Some(&w)).unwrap();
        let set = sampler.sample(&reg_response(40), &mut rng(5)).unwrap();
        assert!(set.rows().all(|(row, _)| row >= 20));

        let sampler = Sampler::new(40, 15, false, Some(&w)).unwrap();
        let set = sampler.sample(&reg_response(40), &mut rng(5)).unwrap();
        assert!(set.rows().all(|(row, _)| row >= 20));
    }

    #[test]
    fn invalid_config_rejected() {
        assert!(matches!(
            Sampler::new(10, 0, true, None),
            Err(TrainError::InvalidConfig(_))
        ));
        assert!(matches!(
            Sampler::new(10, 11, false, None),
            Err(TrainError::InvalidConfig(_))
        ));
        assert!(matches!(
            Sampler::new(10, 5, true, Some(&[1.0; 3])),
            Err(TrainError::InvalidConfig(_))
        ));
    }

    #[test]
    fn binning_preserves_draw_counts() {
        let mut rows: Vec<u32> = (0..200_000u32).rev().map(|r| r % 150_000).collect();
        let mut expect = rows.clone();
        bin_rows(&mut rows);
        // Same multiset.
        expect.sort_unstable();
        let mut got = rows.clone();
        got.sort_unstable();
        assert_eq!(got, expect);
        // Bin-major ordering.
        for w in rows.windows(2) {
            assert!(w[0] >> BIN_ROWS_LOG2 <= w[1] >> BIN_ROWS_LOG2);
        }
    }

    #[test]
    fn classification_proxies_scale_by_inverse_frequency() {
        let resp = Response::classification(vec![0, 0, 0, 1], 2).unwrap();
        match &resp {
            Response::Ctg { proxy, .. } => {
                // Category 1 is three times rarer, so its proxy is three
                // times heavier.
                assert!((proxy[1] / proxy[0] - 3.0).abs() < 1e-12);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn classification_sample_tracks_category_sums() {
        let resp = Response::classification(vec![0, 1, 0, 1, 1, 0], 2).unwrap();
        let sampler = Sampler::new(6, 6, false, None).unwrap();
        let set = sampler.sample(&resp, &mut rng(9)).unwrap();
        assert_eq!(set.ctg.len(), 6);
        let total: f64 = set.ctg_sum.iter().sum();
        assert!((total - set.sum).abs() < 1e-12);
    }
}
