//! Pluggable distances and similarities
//!
//! A [`Distance`] scores pairs of embedding rows. Similarities (higher means
//! closer) report `is_inverted() == true`, which flips the sign convention of
//! every margin built on top of them.

use std::fmt::Debug;

use candle_core::Tensor;

use crate::{
    config::DistanceConfig,
    error::{MetricError, MetricResult},
    tensor::{clamp_min, l2_normalize},
};

/// Floor for squared Euclidean distances before the square root
const SQUARED_DISTANCE_EPS: f64 = 1e-12;

/// Pairwise score between embedding rows
pub trait Distance: Send + Sync + Debug {
    /// Name used in logs and configs
    fn name(&self) -> &'static str;

    /// `true` for similarities, where larger scores mean closer rows
    fn is_inverted(&self) -> bool;

    /// Whether rows are L2-normalised before scoring
    fn normalize_embeddings(&self) -> bool;

    /// `[N, M]` scores for already-prepared `[N, D]` and `[M, D]` rows
    fn compute_pairwise(&self, query: &Tensor, reference: &Tensor) -> MetricResult<Tensor>;

    /// `[N]` scores between row `i` of `a` and row `i` of `b`
    fn compute_paired(&self, a: &Tensor, b: &Tensor) -> MetricResult<Tensor>;

    /// Score every query row against every reference row
    fn pairwise(&self, query: &Tensor, reference: &Tensor) -> MetricResult<Tensor> {
        check_same_width(query, reference)?;
        let query = self.prepare(query)?;
        let reference = self.prepare(reference)?;
        self.compute_pairwise(&query, &reference)
    }

    /// Score aligned rows of `a` and `b`
    fn paired(&self, a: &Tensor, b: &Tensor) -> MetricResult<Tensor> {
        if a.dims() != b.dims() {
            return Err(MetricError::shape_error(
                &format!("{:?}", a.dims()),
                &format!("{:?}", b.dims()),
                Some("Paired scores need rows aligned one to one"),
            ));
        }
        let a = self.prepare(a)?;
        let b = self.prepare(b)?;
        self.compute_paired(&a, &b)
    }

    /// How much closer `y` is than `x`: `x - y` for distances, `y - x` for
    /// similarities
    fn margin(&self, x: &Tensor, y: &Tensor) -> MetricResult<Tensor> {
        if self.is_inverted() {
            Ok(y.sub(x)?)
        } else {
            Ok(x.sub(y)?)
        }
    }

    /// Elementwise the closer of two scores
    fn harder(&self, x: &Tensor, y: &Tensor) -> MetricResult<Tensor> {
        if self.is_inverted() {
            Ok(x.maximum(y)?)
        } else {
            Ok(x.minimum(y)?)
        }
    }

    fn prepare(&self, rows: &Tensor) -> MetricResult<Tensor> {
        if self.normalize_embeddings() {
            l2_normalize(rows, 1)
        } else {
            Ok(rows.clone())
        }
    }
}

fn check_same_width(query: &Tensor, reference: &Tensor) -> MetricResult<()> {
    let (_, q_dim) = query.dims2()?;
    let (_, r_dim) = reference.dims2()?;
    if q_dim != r_dim {
        return Err(MetricError::shape_error(
            &format!("reference rows of width {}", q_dim),
            &format!("width {}", r_dim),
            None,
        ));
    }
    Ok(())
}

/// Cosine similarity; rows are always normalised
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl CosineSimilarity {
    pub fn new() -> Self {
        Self
    }
}

impl Distance for CosineSimilarity {
    fn name(&self) -> &'static str {
        "CosineSimilarity"
    }

    fn is_inverted(&self) -> bool {
        true
    }

    fn normalize_embeddings(&self) -> bool {
        true
    }

    fn compute_pairwise(&self, query: &Tensor, reference: &Tensor) -> MetricResult<Tensor> {
        Ok(query.matmul(&reference.t()?.contiguous()?)?)
    }

    fn compute_paired(&self, a: &Tensor, b: &Tensor) -> MetricResult<Tensor> {
        Ok(a.mul(b)?.sum(1)?)
    }
}

/// Raw inner product
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductSimilarity {
    normalize_embeddings: bool,
}

impl DotProductSimilarity {
    pub fn new(normalize_embeddings: bool) -> Self {
        Self { normalize_embeddings }
    }
}

impl Distance for DotProductSimilarity {
    fn name(&self) -> &'static str {
        "DotProductSimilarity"
    }

    fn is_inverted(&self) -> bool {
        true
    }

    fn normalize_embeddings(&self) -> bool {
        self.normalize_embeddings
    }

    fn compute_pairwise(&self, query: &Tensor, reference: &Tensor) -> MetricResult<Tensor> {
        Ok(query.matmul(&reference.t()?.contiguous()?)?)
    }

    fn compute_paired(&self, a: &Tensor, b: &Tensor) -> MetricResult<Tensor> {
        Ok(a.mul(b)?.sum(1)?)
    }
}

/// Minkowski distance `(sum |a - b|^p)^(1/p)`, optionally raised to `power`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LpDistance {
    p: f64,
    power: f64,
    normalize_embeddings: bool,
}

impl LpDistance {
    pub fn new(p: f64, power: f64, normalize_embeddings: bool) -> MetricResult<Self> {
        if !(p.is_finite() && p > 0.0) {
            return Err(MetricError::InvalidInput(format!("Lp distance needs p > 0, got {}", p)));
        }
        if !(power.is_finite() && power > 0.0) {
            return Err(MetricError::InvalidInput(format!(
                "Lp distance needs power > 0, got {}",
                power
            )));
        }
        Ok(Self { p, power, normalize_embeddings })
    }

    /// Plain Euclidean distance on raw rows
    pub fn euclidean() -> Self {
        Self { p: 2.0, power: 1.0, normalize_embeddings: false }
    }

    /// Euclidean distance between L2-normalised rows
    pub fn normalized_euclidean() -> Self {
        Self { p: 2.0, power: 1.0, normalize_embeddings: true }
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn power(&self) -> f64 {
        self.power
    }

    /// Reduce differences along `dim` to their Lp norm
    fn norm_of(&self, diff: &Tensor, dim: usize) -> MetricResult<Tensor> {
        let norm = if self.p == 2.0 {
            let squared = diff.sqr()?.sum(dim)?;
            clamp_min(&squared, SQUARED_DISTANCE_EPS)?.sqrt()?
        } else if self.p == 1.0 {
            diff.abs()?.sum(dim)?
        } else {
            let summed = diff.abs()?.powf(self.p)?.sum(dim)?;
            clamp_min(&summed, SQUARED_DISTANCE_EPS)?.powf(1.0 / self.p)?
        };
        if self.power == 1.0 {
            Ok(norm)
        } else {
            Ok(norm.powf(self.power)?)
        }
    }
}

impl Default for LpDistance {
    fn default() -> Self {
        Self::euclidean()
    }
}

impl Distance for LpDistance {
    fn name(&self) -> &'static str {
        "LpDistance"
    }

    fn is_inverted(&self) -> bool {
        false
    }

    fn normalize_embeddings(&self) -> bool {
        self.normalize_embeddings
    }

    fn compute_pairwise(&self, query: &Tensor, reference: &Tensor) -> MetricResult<Tensor> {
        let diff = query.unsqueeze(1)?.broadcast_sub(&reference.unsqueeze(0)?)?;
        self.norm_of(&diff, 2)
    }

    fn compute_paired(&self, a: &Tensor, b: &Tensor) -> MetricResult<Tensor> {
        self.norm_of(&a.sub(b)?, 1)
    }
}

impl DistanceConfig {
    /// Instantiate the configured distance
    pub fn build(&self) -> MetricResult<Box<dyn Distance>> {
        Ok(match *self {
            DistanceConfig::Cosine => Box::new(CosineSimilarity::new()),
            DistanceConfig::DotProduct { normalize_embeddings } => {
                Box::new(DotProductSimilarity::new(normalize_embeddings))
            }
            DistanceConfig::Lp { p, power, normalize_embeddings } => {
                Box::new(LpDistance::new(p, power, normalize_embeddings)?)
            }
        })
    }
}
