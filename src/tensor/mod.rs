//! Tensor helpers on top of the candle substrate
//!
//! Embeddings, labels and weights are plain `candle_core::Tensor`s; this module
//! only adds the few numerically careful building blocks the losses share.

pub mod ops;

pub use ops::*;

#[cfg(test)]
pub(crate) mod testing;
