//! Shared parallelism configuration.
//!
//! A single [`Parallelism`] hint travels from the trainer into the tree
//! block loop, the per-level candidate search and row-blocked prediction.
//! Components may self-correct to sequential execution when their workload
//! is too small to split.

/// Parallelism strategy for data-parallel scopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parallelism {
    /// Strictly sequential; no thread spawning anywhere.
    Sequential,
    /// Parallel execution with up to `n` threads.
    Parallel(usize),
}

impl Parallelism {
    /// Interpret a thread-count option.
    ///
    /// - `0`: rayon's current pool width
    /// - `1`: sequential
    /// - `n > 1`: parallel with `n` threads
    #[inline]
    pub fn from_threads(n_thread: usize) -> Self {
        match n_thread {
            0 => Self::Parallel(rayon::current_num_threads()),
            1 => Self::Sequential,
            n => Self::Parallel(n),
        }
    }

    /// Whether parallel execution is allowed.
    #[inline]
    pub fn allows_parallel(self) -> bool {
        matches!(self, Self::Parallel(n) if n > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_counts_map_to_modes() {
        assert_eq!(Parallelism::from_threads(1), Parallelism::Sequential);
        assert_eq!(Parallelism::from_threads(4), Parallelism::Parallel(4));
        assert!(matches!(
            Parallelism::from_threads(0),
            Parallelism::Parallel(_)
        ));
    }

    #[test]
    fn sequential_never_parallel() {
        assert!(!Parallelism::Sequential.allows_parallel());
        assert!(!Parallelism::Parallel(1).allows_parallel());
        assert!(Parallelism::Parallel(2).allows_parallel());
    }
}
