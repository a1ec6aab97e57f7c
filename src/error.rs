//! Shared error types for training and prediction.

use thiserror::Error;

/// Errors raised while building a frame or fitting a forest.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Malformed ingest data: unsupported sparse layout, ragged columns,
    /// factor codes at or past the declared cardinality.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Contradictory or out-of-range training options. The message names
    /// the offending option.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The sampler's fixed-width word cannot hold an observed row delta or
    /// multiplicity. Retrying with a wider packing is the caller's move.
    #[error("sampler packing overflow: {field} = {value} exceeds {bits}-bit field")]
    SamplerOverflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },

    /// A packed pool could not be grown within its cap.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Too many trees were dropped for the fit to be trusted.
    #[error("{failed} of {total} trees failed to train")]
    TooManyTreeFailures { failed: usize, total: usize },

    /// Packed-model byte codec failure.
    #[error("model codec: {0}")]
    Codec(#[from] postcard::Error),
}

/// Errors raised while predicting from a trained model.
#[derive(Debug, Error)]
pub enum PredictError {
    /// Prediction block shape does not match the trained frame.
    #[error("bad input: {0}")]
    BadInput(String),

    /// Quantiles or forest weights were requested, but the model was
    /// trained with `thin_leaves` and carries no per-leaf sample blocks.
    #[error("model was trained with thin leaves; per-leaf sample records are unavailable")]
    ThinLeaves,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn train_error_names_option() {
        let err = TrainError::InvalidConfig("pred_fixed (12) exceeds predictor count (4)".into());
        assert!(err.to_string().contains("pred_fixed"));
    }

    #[test]
    fn sampler_overflow_reports_width() {
        let err = TrainError::SamplerOverflow {
            field: "multiplicity",
            value: 70_000,
            bits: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("multiplicity"));
        assert!(msg.contains("16-bit"));
    }
}
