//! Testing utilities: deterministic synthetic columns and float assertions
//! shared by unit and integration tests.

use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Default tolerance for floating point comparisons.
pub const DEFAULT_TOLERANCE: f64 = 1e-9;

/// Deterministic uniform column in `[lo, hi)`.
pub fn uniform_column(n: usize, lo: f64, hi: f64, seed: u64) -> Vec<f64> {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    (0..n).map(|_| lo + rng.gen::<f64>() * (hi - lo)).collect()
}

/// Two-level step column: the first `n_lo` rows at `lo`, the rest at `hi`.
pub fn step_column(n: usize, n_lo: usize, lo: f64, hi: f64) -> Vec<f64> {
    (0..n).map(|i| if i < n_lo { lo } else { hi }).collect()
}

/// Assert two f64 values agree within a tolerance.
#[macro_export]
macro_rules! assert_close {
    ($left:expr, $right:expr) => {
        $crate::assert_close!($left, $right, $crate::testing::DEFAULT_TOLERANCE)
    };
    ($left:expr, $right:expr, $tol:expr) => {{
        let (l, r): (f64, f64) = ($left, $right);
        assert!(
            (l - r).abs() <= $tol,
            "values differ: {} vs {} (tol {})",
            l,
            r,
            $tol
        );
    }};
}
