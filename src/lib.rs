//! canopy: a decision-forest training and prediction engine.
//!
//! This crate grows ensembles of CART-style decision trees over a presorted,
//! rank-encoded observation frame. Training produces a packed forest
//! representation together with per-leaf sample records, which later serve
//! prediction, quantile estimation and Meinshausen-style forest weighting.
//!
//! # Pipeline
//!
//! - [`frame`]: ingest columns once into an immutable [`frame::RankedFrame`]
//!   (sorted-rank codes, run-length compressed, optionally auto-compressed
//!   around a per-predictor dense rank).
//! - [`sampler`]: draw per-tree bags with or without replacement, recording
//!   compact `(delta-row, multiplicity)` streams and a bagged-row bit matrix.
//! - [`partition`] / [`runs`] / [`split`]: the per-level split search over a
//!   double-buffered per-predictor sample ordering.
//! - [`frontier`]: the level loop that turns winning splits into a pre-tree.
//! - [`train`]: orchestration across trees and tree blocks.
//! - [`forest`] / [`leaf`]: the packed result and everything served from it.

pub mod bits;
pub mod error;
pub mod forest;
pub mod frame;
pub mod frontier;
pub mod leaf;
pub mod partition;
pub mod runs;
pub mod sampler;
pub mod split;
pub mod testing;
pub mod train;

pub use error::{PredictError, TrainError};
pub use forest::{Forest, PredictBlock, Predictor};
pub use frame::{FrameBuilder, RankedFrame};
pub use sampler::Response;
pub use train::{TrainParams, TrainedModel, Trainer, Verbosity};
