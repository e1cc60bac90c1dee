//! Reducers turn per-element losses into the scalar handed to `backward()`

use std::fmt::Debug;

use candle_core::{DType, Tensor};

use crate::{
    config::ReducerConfig,
    error::MetricResult,
    tensor::{to_f64, zero_loss},
};

/// Aggregation of per-element losses into a scalar
pub trait Reducer: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Reduce a 1-D tensor of losses to a rank-0 tensor
    fn reduce(&self, losses: &Tensor) -> MetricResult<Tensor>;

    /// Reduce after scaling each loss by its weight; a 0/1 weight acts as an
    /// active-element mask
    fn reduce_weighted(&self, losses: &Tensor, weights: &Tensor) -> MetricResult<Tensor> {
        self.reduce(&losses.mul(weights)?)
    }
}

fn empty_loss(losses: &Tensor) -> MetricResult<Tensor> {
    Ok(Tensor::zeros((), losses.dtype(), losses.device())?)
}

/// Mean over every element, zeros included
#[derive(Debug, Clone, Copy, Default)]
pub struct MeanReducer;

impl Reducer for MeanReducer {
    fn name(&self) -> &'static str {
        "MeanReducer"
    }

    fn reduce(&self, losses: &Tensor) -> MetricResult<Tensor> {
        if losses.elem_count() == 0 {
            return empty_loss(losses);
        }
        Ok(losses.mean_all()?)
    }
}

/// Sum of every element
#[derive(Debug, Clone, Copy, Default)]
pub struct SumReducer;

impl Reducer for SumReducer {
    fn name(&self) -> &'static str {
        "SumReducer"
    }

    fn reduce(&self, losses: &Tensor) -> MetricResult<Tensor> {
        if losses.elem_count() == 0 {
            return empty_loss(losses);
        }
        Ok(losses.sum_all()?)
    }
}

/// Mean over the strictly positive elements only
///
/// When nothing is positive the result is a zero that still carries the graph
/// of `losses`, so `backward()` keeps working on fully satisfied batches.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvgNonZeroReducer;

impl Reducer for AvgNonZeroReducer {
    fn name(&self) -> &'static str {
        "AvgNonZeroReducer"
    }

    fn reduce(&self, losses: &Tensor) -> MetricResult<Tensor> {
        if losses.elem_count() == 0 {
            return empty_loss(losses);
        }
        let active = losses.gt(&losses.zeros_like()?)?.to_dtype(losses.dtype())?;
        let num_active = to_f64(&active.to_dtype(DType::F32)?.sum_all()?)?;
        if num_active == 0.0 {
            return zero_loss(losses);
        }
        tracing::trace!(num_active, total = losses.elem_count(), "averaging non-zero losses");
        Ok(losses.mul(&active)?.sum_all()?.affine(1.0 / num_active, 0.0)?)
    }
}

impl ReducerConfig {
    /// Instantiate the configured reducer
    pub fn build(&self) -> Box<dyn Reducer> {
        match self {
            ReducerConfig::Mean => Box::new(MeanReducer),
            ReducerConfig::AvgNonZero => Box::new(AvgNonZeroReducer),
            ReducerConfig::Sum => Box::new(SumReducer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::testing::{assert_close, scalar};
    use candle_core::{Device, Var};

    fn losses(values: &[f64]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_mean_counts_zeros() {
        let loss = MeanReducer.reduce(&losses(&[0.0, 1.0, 2.0, 0.0])).unwrap();
        assert_close(scalar(&loss), 0.75, 1e-12);
    }

    #[test]
    fn test_avg_non_zero_skips_zeros() {
        let loss = AvgNonZeroReducer.reduce(&losses(&[0.0, 1.0, 2.0, 0.0])).unwrap();
        assert_close(scalar(&loss), 1.5, 1e-12);
    }

    #[test]
    fn test_avg_non_zero_all_zero_keeps_graph() {
        let values = Var::new(&[0f64, 0., 0.], &Device::Cpu).unwrap();
        let loss = AvgNonZeroReducer.reduce(values.as_tensor()).unwrap();
        assert_eq!(scalar(&loss), 0.0);
        let grads = loss.backward().unwrap();
        let grad = grads.get(values.as_tensor()).unwrap().to_vec1::<f64>().unwrap();
        assert_eq!(grad, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sum_and_empty() {
        assert_close(scalar(&SumReducer.reduce(&losses(&[1.0, 2.5])).unwrap()), 3.5, 1e-12);
        let empty = Tensor::zeros(0, DType::F32, &Device::Cpu).unwrap();
        for reducer in [ReducerConfig::Mean, ReducerConfig::AvgNonZero, ReducerConfig::Sum] {
            let loss = reducer.build().reduce(&empty).unwrap();
            assert_eq!(scalar(&loss), 0.0);
        }
    }

    #[test]
    fn test_reduce_weighted_masks_elements() {
        let weights = losses(&[1.0, 0.0, 1.0]);
        let loss = MeanReducer.reduce_weighted(&losses(&[2.0, 100.0, 4.0]), &weights).unwrap();
        assert_close(scalar(&loss), 2.0, 1e-12);
    }
}
