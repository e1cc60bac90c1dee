//! Centroid triplet loss
//!
//! Each class in a batch must contribute the same number of samples `M`. For
//! every slot `m` and class `p`, the centroid `C[m][p]` is the mean of class
//! `p` without its `m`-th sample. The anchor (the `m`-th sample of `p`) is
//! pulled towards `C[m][p]` and pushed away from both the `m`-th sample and
//! `C[m][q]` of every other class `q`.

use candle_core::Tensor;

use crate::{
    config::CentroidTripletConfig,
    error::{MetricError, MetricResult},
    nn::{
        distances::{Distance, LpDistance},
        reducers::{AvgNonZeroReducer, Reducer},
    },
    tensor::{batch_dims, flatten_labels, zero_loss},
};

use super::{
    ranking::{triplet_violations, TripletIndices},
    MetricLoss,
};

/// Batch positions grouped by label, classes in order of first appearance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassGroups {
    classes: Vec<i64>,
    members: Vec<Vec<u32>>,
}

impl ClassGroups {
    pub fn from_labels(labels: &[i64]) -> Self {
        let mut classes: Vec<i64> = Vec::new();
        let mut members: Vec<Vec<u32>> = Vec::new();
        for (idx, &label) in labels.iter().enumerate() {
            match classes.iter().position(|&c| c == label) {
                Some(pos) => members[pos].push(idx as u32),
                None => {
                    classes.push(label);
                    members.push(vec![idx as u32]);
                }
            }
        }
        Self { classes, members }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    pub fn members(&self, class_pos: usize) -> &[u32] {
        &self.members[class_pos]
    }

    pub fn counts(&self) -> Vec<usize> {
        self.members.iter().map(Vec::len).collect()
    }

    /// Common per-class sample count; classes must be equally sized with at
    /// least two samples each
    pub fn balanced_size(&self) -> MetricResult<usize> {
        let counts = self.counts();
        let size = counts.first().copied().unwrap_or(0);
        if counts.iter().any(|&c| c != size) {
            return Err(MetricError::ClassImbalance { counts });
        }
        if size < 2 {
            return Err(MetricError::InvalidInput(format!(
                "every class needs at least 2 samples to form a centroid, got {}",
                size
            )));
        }
        Ok(size)
    }
}

#[derive(Debug)]
pub struct CentroidTripletLoss {
    margin: f64,
    smooth_loss: bool,
    swap: bool,
    distance: Box<dyn Distance>,
    reducer: Box<dyn Reducer>,
    smooth_distance: LpDistance,
}

impl CentroidTripletLoss {
    pub fn new(margin: f64) -> Self {
        Self {
            margin,
            smooth_loss: false,
            swap: false,
            distance: Box::new(LpDistance::euclidean()),
            reducer: Box::new(AvgNonZeroReducer),
            smooth_distance: LpDistance::normalized_euclidean(),
        }
    }

    pub fn from_config(config: &CentroidTripletConfig) -> MetricResult<Self> {
        Ok(Self::new(config.margin)
            .with_smooth_loss(config.smooth_loss)
            .with_swap(config.swap)
            .with_distance(config.distance.build()?)
            .with_reducer(config.reducer.build()))
    }

    pub fn with_distance(mut self, distance: Box<dyn Distance>) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

    /// Softplus instead of the hinge. Always scored on normalised Euclidean
    /// distance, whatever distance is configured.
    pub fn with_smooth_loss(mut self, smooth_loss: bool) -> Self {
        self.smooth_loss = smooth_loss;
        self
    }

    pub fn with_swap(mut self, swap: bool) -> Self {
        self.swap = swap;
        self
    }

    pub fn margin(&self) -> f64 {
        self.margin
    }

    /// `[M * P, D]` leave-one-out centroids; row `m * P + p` is `C[m][p]`
    pub fn centroids(&self, embeddings: &Tensor, groups: &ClassGroups) -> MetricResult<Tensor> {
        let per_class = groups.balanced_size()?;
        let num_classes = groups.num_classes();
        let (batch, _) = embeddings.dims2()?;

        let weight = 1.0 / (per_class - 1) as f64;
        let mut averaging = vec![0f64; per_class * num_classes * batch];
        for m in 0..per_class {
            for p in 0..num_classes {
                let row = (m * num_classes + p) * batch;
                for (j, &idx) in groups.members(p).iter().enumerate() {
                    if j != m {
                        averaging[row + idx as usize] = weight;
                    }
                }
            }
        }
        let averaging = Tensor::from_vec(averaging, (per_class * num_classes, batch), embeddings.device())?
            .to_dtype(embeddings.dtype())?;
        Ok(averaging.matmul(&embeddings.contiguous()?)?)
    }

    /// Triplets over `[embeddings; centroids]`, where the centroid `C[m][p]`
    /// sits at row `batch + m * P + p`
    pub fn triplets(&self, batch: usize, groups: &ClassGroups) -> MetricResult<TripletIndices> {
        let per_class = groups.balanced_size()?;
        let num_classes = groups.num_classes();
        let centroid = |m: usize, p: usize| (batch + m * num_classes + p) as u32;

        let mut indices = TripletIndices::default();
        for m in 0..per_class {
            for p in 0..num_classes {
                let anchor = groups.members(p)[m];
                for q in (0..num_classes).filter(|&q| q != p) {
                    indices.push(anchor, centroid(m, p), groups.members(q)[m]);
                    indices.push(anchor, centroid(m, p), centroid(m, q));
                }
            }
        }
        Ok(indices)
    }
}

impl MetricLoss for CentroidTripletLoss {
    fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<Tensor> {
        let labels = flatten_labels(labels)?;
        let (batch, _) = batch_dims(embeddings, labels.len())?;
        let groups = ClassGroups::from_labels(&labels);

        if groups.num_classes() < 2 {
            tracing::warn!(
                classes = ?groups.classes(),
                "centroid triplet loss needs at least two classes, returning zero"
            );
            return zero_loss(embeddings);
        }

        let per_class = groups.balanced_size()?;
        let centroids = self.centroids(embeddings, &groups)?;
        let indices = self.triplets(batch, &groups)?;
        let reference = Tensor::cat(&[embeddings, &centroids], 0)?;
        let (anchors, positives, negatives) = indices.select(&reference, &reference)?;

        let distance: &dyn Distance = if self.smooth_loss {
            &self.smooth_distance
        } else {
            self.distance.as_ref()
        };
        let losses = triplet_violations(
            distance,
            self.margin,
            self.swap,
            self.smooth_loss,
            &anchors,
            &positives,
            &negatives,
        )?;

        tracing::debug!(
            classes = groups.num_classes(),
            per_class,
            triplets = indices.len(),
            "centroid triplets formed"
        );
        self.reducer.reduce(&losses)
    }

    fn name(&self) -> &'static str {
        "CentroidTripletLoss"
    }
}
