//! Additive angular margin losses
//!
//! The margin computation only ever sees a `[batch, num_classes]` cosine
//! matrix. Where that matrix comes from (one center per class, or the best of
//! several sub-centers) is up to the loss that owns the [`CenterBank`].

use std::ops::Range;

use candle_core::{DType, Device, Tensor, Var, D};
use rand::{distributions::Uniform, rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::ArcFaceConfig,
    error::{MetricError, MetricResult},
    nn::{
        distances::{CosineSimilarity, Distance},
        reducers::Reducer,
    },
    tensor::{batch_dims, clamp, flatten_labels, index_tensor, l2_normalize},
};

use super::MetricLoss;

/// Cosines are kept this far inside (-1, 1) before the margin is added
pub const COSINE_EPS: f64 = 1e-7;

/// Column layout of a center bank: class `c` owns the contiguous columns
/// `c * sub_centers .. (c + 1) * sub_centers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CenterLayout {
    num_classes: usize,
    sub_centers: usize,
}

impl CenterLayout {
    pub fn new(num_classes: usize, sub_centers: usize) -> Self {
        Self { num_classes, sub_centers }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn sub_centers(&self) -> usize {
        self.sub_centers
    }

    pub fn num_columns(&self) -> usize {
        self.num_classes * self.sub_centers
    }

    pub fn columns(&self, class: usize) -> Range<usize> {
        class * self.sub_centers..(class + 1) * self.sub_centers
    }
}

/// Learnable `embedding_size x num_columns` matrix of class centers
#[derive(Debug)]
pub struct CenterBank {
    weight: Var,
    layout: CenterLayout,
    embedding_size: usize,
    training: bool,
}

impl CenterBank {
    /// Uniform init in [-1, 1] followed by column normalisation
    pub fn new(
        embedding_size: usize,
        layout: CenterLayout,
        seed: Option<u64>,
        device: &Device,
    ) -> MetricResult<Self> {
        if embedding_size == 0 || layout.num_columns() == 0 {
            return Err(MetricError::ConfigurationError(format!(
                "center bank needs a positive shape, got {} x {}",
                embedding_size,
                layout.num_columns()
            )));
        }
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let dist = Uniform::new_inclusive(-1.0f32, 1.0);
        let values: Vec<f32> = (0..embedding_size * layout.num_columns())
            .map(|_| rng.sample(dist))
            .collect();
        let raw = Tensor::from_vec(values, (embedding_size, layout.num_columns()), device)?;
        let weight = Var::from_tensor(&l2_normalize(&raw, 0)?)?;

        tracing::debug!(
            embedding_size,
            num_classes = layout.num_classes(),
            sub_centers = layout.sub_centers(),
            "initialised center bank"
        );

        Ok(Self {
            weight,
            layout,
            embedding_size,
            training: true,
        })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Trainable variables, for an external optimiser
    pub fn parameters(&self) -> Vec<Var> {
        vec![self.weight.clone()]
    }

    /// Replace the centers with `weight`, which must be `embedding_size x num_columns`
    pub fn set_weight(&mut self, weight: &Tensor) -> MetricResult<()> {
        let expected = [self.embedding_size, self.layout.num_columns()];
        if weight.dims() != expected {
            return Err(MetricError::shape_error(
                &format!("{:?}", expected),
                &format!("{:?}", weight.dims()),
                Some("Centers are stored one per column"),
            ));
        }
        if !weight.dtype().is_float() {
            return Err(MetricError::InvalidInput(format!(
                "centers must be a float tensor, got {:?}",
                weight.dtype()
            )));
        }
        self.weight = Var::from_tensor(weight)?;
        Ok(())
    }

    pub fn layout(&self) -> CenterLayout {
        self.layout
    }

    pub fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    /// Run `f` in eval mode and restore the previous mode afterwards, whether
    /// `f` succeeds or not
    pub fn with_eval_mode<T, F>(&mut self, f: F) -> MetricResult<T>
    where
        F: FnOnce(&mut Self) -> MetricResult<T>,
    {
        let was_training = self.training;
        self.training = false;
        let result = f(self);
        self.training = was_training;
        result
    }

    /// Move the stored centers to `dtype` on `device`.
    ///
    /// Returns `true` when the variable was replaced. Handles taken earlier
    /// through [`CenterBank::parameters`] then point at the old variable and
    /// must be fetched again before the next optimizer step.
    pub fn cast_types(&mut self, dtype: DType, device: &Device) -> MetricResult<bool> {
        let same_device = self.weight.device().same_device(device);
        if self.weight.dtype() == dtype && same_device {
            return Ok(false);
        }
        let cast = self.weight.as_tensor().to_dtype(dtype)?.to_device(device)?;
        self.weight = Var::from_tensor(&cast)?;
        tracing::warn!(
            ?dtype,
            "center bank recast, parameters() must be fetched again for the optimizer"
        );
        Ok(true)
    }

    /// Check embedding width against the bank
    pub fn check_embeddings(&self, embeddings: &Tensor, num_labels: usize) -> MetricResult<usize> {
        let (batch, dim) = batch_dims(embeddings, num_labels)?;
        if dim != self.embedding_size {
            return Err(MetricError::shape_error(
                &format!("embeddings of size {}", self.embedding_size),
                &format!("size {}", dim),
                None,
            ));
        }
        Ok(batch)
    }

    /// `[batch, num_columns]` similarity of every embedding to every center.
    /// The weights follow the embeddings' dtype/device without being stored.
    pub fn similarities(&self, embeddings: &Tensor, distance: &dyn Distance) -> MetricResult<Tensor> {
        let mut weight = self.weight.as_tensor().clone();
        if weight.dtype() != embeddings.dtype() {
            weight = weight.to_dtype(embeddings.dtype())?;
        }
        if !weight.device().same_device(embeddings.device()) {
            weight = weight.to_device(embeddings.device())?;
        }
        distance.pairwise(embeddings, &weight.t()?)
    }

    /// `embedding_size x sub_centers` block of one class
    pub fn class_centers(&self, class: usize) -> MetricResult<Tensor> {
        if class >= self.layout.num_classes() {
            return Err(MetricError::InvalidInput(format!(
                "class {} out of range for {} classes",
                class,
                self.layout.num_classes()
            )));
        }
        let columns = self.layout.columns(class);
        Ok(self.weight.narrow(1, columns.start, columns.len())?)
    }
}

/// Validate labels against `num_classes` and convert them to column indices
pub(crate) fn class_indices(labels: &[i64], num_classes: usize) -> MetricResult<Vec<u32>> {
    labels
        .iter()
        .map(|&label| {
            if label < 0 || label as usize >= num_classes {
                Err(MetricError::InvalidInput(format!(
                    "label {} out of range for {} classes",
                    label, num_classes
                )))
            } else {
                Ok(label as u32)
            }
        })
        .collect()
}

/// `cos(theta + m)` on the target class, scaled logits, cross-entropy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngularMargin {
    margin_degrees: f64,
    margin: f64,
    scale: f64,
}

impl AngularMargin {
    pub fn new(margin_degrees: f64, scale: f64) -> MetricResult<Self> {
        if !margin_degrees.is_finite() || !scale.is_finite() || scale <= 0.0 {
            return Err(MetricError::ConfigurationError(format!(
                "angular margin and scale must be finite with scale > 0, got margin {} and scale {}",
                margin_degrees, scale
            )));
        }
        Ok(Self {
            margin_degrees,
            margin: margin_degrees.to_radians(),
            scale,
        })
    }

    pub fn margin_degrees(&self) -> f64 {
        self.margin_degrees
    }

    pub fn margin_radians(&self) -> f64 {
        self.margin
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// `cos(theta + m) = cos(theta) cos(m) - sin(theta) sin(m)`, with the cosine
    /// clamped first so `sin(theta)` and its gradient stay finite
    pub fn modify_target_cosine(&self, cosine: &Tensor) -> MetricResult<Tensor> {
        let cosine = clamp(cosine, -1.0 + COSINE_EPS, 1.0 - COSINE_EPS)?;
        let sine = cosine.sqr()?.affine(-1.0, 1.0)?.sqrt()?;
        let shifted = cosine.affine(self.margin.cos(), 0.0)?;
        Ok(shifted.sub(&sine.affine(self.margin.sin(), 0.0)?)?)
    }

    /// Scaled `[batch, num_classes]` logits with the margin applied to each
    /// row's target class
    pub fn logits(&self, cosine: &Tensor, targets: &[u32]) -> MetricResult<Tensor> {
        let (batch, num_classes) = cosine.dims2()?;
        if targets.len() != batch {
            return Err(MetricError::shape_error(
                &format!("{} targets", batch),
                &format!("{}", targets.len()),
                None,
            ));
        }
        let mut one_hot = vec![0f32; batch * num_classes];
        for (row, &target) in targets.iter().enumerate() {
            let target = target as usize;
            if target >= num_classes {
                return Err(MetricError::InvalidInput(format!(
                    "target {} out of range for {} classes",
                    target, num_classes
                )));
            }
            one_hot[row * num_classes + target] = 1.0;
        }
        let mask = Tensor::from_vec(one_hot, (batch, num_classes), cosine.device())?
            .to_dtype(cosine.dtype())?;

        let modified = self.modify_target_cosine(cosine)?;
        let logits = cosine.add(&mask.mul(&modified.sub(cosine)?)?)?;
        Ok(logits.affine(self.scale, 0.0)?)
    }

    /// Per-sample cross-entropy of the margin logits
    pub fn per_sample_loss(&self, cosine: &Tensor, targets: &[u32]) -> MetricResult<Tensor> {
        let logits = self.logits(cosine, targets)?;
        let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
        let targets = index_tensor(targets.to_vec(), cosine.device())?;
        Ok(log_probs.gather(&targets.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?)
    }

    pub fn loss(&self, cosine: &Tensor, targets: &[u32], reducer: &dyn Reducer) -> MetricResult<Tensor> {
        reducer.reduce(&self.per_sample_loss(cosine, targets)?)
    }
}

/// ArcFace: one learnable center per class
#[derive(Debug)]
pub struct ArcFaceLoss {
    bank: CenterBank,
    margin: AngularMargin,
    distance: CosineSimilarity,
    reducer: Box<dyn Reducer>,
}

impl ArcFaceLoss {
    pub fn new(
        num_classes: usize,
        embedding_size: usize,
        margin_degrees: f64,
        scale: f64,
        device: &Device,
    ) -> MetricResult<Self> {
        Self::from_config(
            &ArcFaceConfig {
                num_classes,
                embedding_size,
                margin: margin_degrees,
                scale,
                ..Default::default()
            },
            device,
        )
    }

    pub fn from_config(config: &ArcFaceConfig, device: &Device) -> MetricResult<Self> {
        let margin = AngularMargin::new(config.margin, config.scale)?;
        let bank = CenterBank::new(
            config.embedding_size,
            CenterLayout::new(config.num_classes, 1),
            config.seed,
            device,
        )?;
        Ok(Self {
            bank,
            margin,
            distance: CosineSimilarity::new(),
            reducer: config.reducer.build(),
        })
    }

    pub fn with_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn bank(&self) -> &CenterBank {
        &self.bank
    }

    pub fn bank_mut(&mut self) -> &mut CenterBank {
        &mut self.bank
    }

    pub fn margin(&self) -> &AngularMargin {
        &self.margin
    }

    /// `[batch, num_classes]` cosine similarity to the class centers
    pub fn get_cosine(&self, embeddings: &Tensor) -> MetricResult<Tensor> {
        self.bank.similarities(embeddings, &self.distance)
    }

    /// Scaled cosines without margin, for inference
    pub fn get_logits(&self, embeddings: &Tensor) -> MetricResult<Tensor> {
        let (batch, _) = embeddings.dims2()?;
        self.bank.check_embeddings(embeddings, batch)?;
        Ok(self.get_cosine(embeddings)?.affine(self.margin.scale(), 0.0)?)
    }
}

impl MetricLoss for ArcFaceLoss {
    fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<Tensor> {
        let labels = flatten_labels(labels)?;
        self.bank.check_embeddings(embeddings, labels.len())?;
        let targets = class_indices(&labels, self.bank.layout().num_classes())?;
        let cosine = self.get_cosine(embeddings)?;
        self.margin.loss(&cosine, &targets, self.reducer.as_ref())
    }

    fn name(&self) -> &'static str {
        "ArcFaceLoss"
    }

    fn parameters(&self) -> Vec<Var> {
        self.bank.parameters()
    }
}
