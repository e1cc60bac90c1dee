//! Shared tensor operations: normalisation, clamping, softplus and batch checks

use candle_core::{DType, Device, Tensor};

use crate::error::{MetricError, MetricResult};

/// Floor applied to norms before dividing, as `F.normalize` does
pub const NORM_EPS: f64 = 1e-12;

/// Rank-0 tensor holding `value` with the dtype and device of `like`
pub fn scalar_like(like: &Tensor, value: f64) -> MetricResult<Tensor> {
    Ok(Tensor::new(value, like.device())?.to_dtype(like.dtype())?)
}

/// Elementwise `max(x, min)`
pub fn clamp_min(x: &Tensor, min: f64) -> MetricResult<Tensor> {
    Ok(x.broadcast_maximum(&scalar_like(x, min)?)?)
}

/// Elementwise `min(max(x, min), max)`
pub fn clamp(x: &Tensor, min: f64, max: f64) -> MetricResult<Tensor> {
    let lower = clamp_min(x, min)?;
    Ok(lower.broadcast_minimum(&scalar_like(x, max)?)?)
}

/// L2-normalise `x` along `dim`
pub fn l2_normalize(x: &Tensor, dim: usize) -> MetricResult<Tensor> {
    let norm = x.sqr()?.sum_keepdim(dim)?.sqrt()?;
    let norm = clamp_min(&norm, NORM_EPS)?;
    Ok(x.broadcast_div(&norm)?)
}

/// `log(1 + exp(x))`, evaluated as `relu(x) + log(1 + exp(-|x|))` so large
/// inputs do not overflow
pub fn softplus(x: &Tensor) -> MetricResult<Tensor> {
    let tail = x.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    Ok(x.relu()?.add(&tail)?)
}

/// Scalar zero that stays attached to the graph of `like`
pub fn zero_loss(like: &Tensor) -> MetricResult<Tensor> {
    Ok(like.mul(&like.zeros_like()?)?.sum_all()?)
}

/// Read a scalar tensor back as `f64`
pub fn to_f64(scalar: &Tensor) -> MetricResult<f64> {
    Ok(scalar.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Flatten a `[N]` or `[N, 1]` integer label tensor into host class ids
pub fn flatten_labels(labels: &Tensor) -> MetricResult<Vec<i64>> {
    match labels.dtype() {
        DType::U8 | DType::U32 | DType::I64 => {}
        other => {
            return Err(MetricError::InvalidInput(format!(
                "labels must be an integer tensor, got {:?}",
                other
            )))
        }
    }
    Ok(labels.flatten_all()?.to_dtype(DType::I64)?.to_vec1::<i64>()?)
}

/// Validate a `[N, D]` float embedding batch against `num_labels` labels and
/// return `(N, D)`
pub fn batch_dims(embeddings: &Tensor, num_labels: usize) -> MetricResult<(usize, usize)> {
    let (batch, dim) = match embeddings.dims() {
        &[batch, dim] => (batch, dim),
        dims => {
            return Err(MetricError::shape_error(
                "[batch, dim] embeddings",
                &format!("{:?}", dims),
                None,
            ))
        }
    };
    if !embeddings.dtype().is_float() {
        return Err(MetricError::InvalidInput(format!(
            "embeddings must be a float tensor, got {:?}",
            embeddings.dtype()
        )));
    }
    if batch != num_labels {
        return Err(MetricError::shape_error(
            &format!("{} labels", batch),
            &format!("{} labels", num_labels),
            Some("Pass exactly one class id per embedding"),
        ));
    }
    Ok((batch, dim))
}

/// 1-D `u32` index tensor, the index dtype candle gathers with
pub fn index_tensor(ids: Vec<u32>, device: &Device) -> MetricResult<Tensor> {
    let len = ids.len();
    Ok(Tensor::from_vec(ids, len, device)?)
}
