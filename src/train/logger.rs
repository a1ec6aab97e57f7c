//! Structured training output.

/// Verbosity level for training output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Verbosity {
    /// No output.
    #[default]
    Silent,
    /// Fit lifecycle and dropped-tree diagnostics.
    Info,
    /// Per-block progress.
    Debug,
}

/// Plain stderr logger owned by the trainer; nothing global.
#[derive(Debug, Clone, Copy)]
pub struct TrainingLogger {
    verbosity: Verbosity,
}

impl TrainingLogger {
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }

    pub fn start_training(&self, n_tree: usize, n_obs: usize, n_pred: usize) {
        if self.verbosity != Verbosity::Silent {
            eprintln!(
                "canopy: fitting {} trees over {} rows x {} predictors",
                n_tree, n_obs, n_pred
            );
        }
    }

    pub fn block_done(&self, lo: usize, hi: usize) {
        if self.verbosity == Verbosity::Debug {
            eprintln!("canopy: trees {}..{} consumed", lo, hi);
        }
    }

    pub fn tree_dropped(&self, tree: usize, why: &str) {
        if self.verbosity != Verbosity::Silent {
            eprintln!("canopy: tree {} dropped: {}", tree, why);
        }
    }

    pub fn finish(&self, trained: usize, dropped: usize) {
        if self.verbosity != Verbosity::Silent {
            eprintln!("canopy: fit complete, {} trees ({} dropped)", trained, dropped);
        }
    }
}
