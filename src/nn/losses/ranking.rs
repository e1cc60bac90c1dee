//! Triplet margin losses over explicit (anchor, positive, negative) index sets

use candle_core::Tensor;

use crate::{
    config::TripletMarginConfig,
    error::{MetricError, MetricResult},
    nn::{
        distances::{Distance, LpDistance},
        reducers::{AvgNonZeroReducer, Reducer},
    },
    tensor::{batch_dims, flatten_labels, index_tensor, softplus, zero_loss},
};

use super::MetricLoss;

/// Row indices of a batch of triplets. Anchors index the query rows,
/// positives and negatives index the reference rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripletIndices {
    pub anchors: Vec<u32>,
    pub positives: Vec<u32>,
    pub negatives: Vec<u32>,
}

impl TripletIndices {
    pub fn new(anchors: Vec<u32>, positives: Vec<u32>, negatives: Vec<u32>) -> MetricResult<Self> {
        if anchors.len() != positives.len() || anchors.len() != negatives.len() {
            return Err(MetricError::InvalidInput(format!(
                "triplet index lists differ in length: {} anchors, {} positives, {} negatives",
                anchors.len(),
                positives.len(),
                negatives.len()
            )));
        }
        Ok(Self { anchors, positives, negatives })
    }

    /// Every `(a, p, n)` with `a != p` sharing a label and `n` labelled differently
    pub fn all_from_labels(labels: &[i64]) -> Self {
        let mut triplets = Self::default();
        for (a, &anchor_label) in labels.iter().enumerate() {
            for (p, &positive_label) in labels.iter().enumerate() {
                if p == a || positive_label != anchor_label {
                    continue;
                }
                for (n, &negative_label) in labels.iter().enumerate() {
                    if negative_label != anchor_label {
                        triplets.push(a as u32, p as u32, n as u32);
                    }
                }
            }
        }
        triplets
    }

    pub fn push(&mut self, anchor: u32, positive: u32, negative: u32) {
        self.anchors.push(anchor);
        self.positives.push(positive);
        self.negatives.push(negative);
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Gather `(anchors, positives, negatives)` rows
    pub fn select(&self, query: &Tensor, reference: &Tensor) -> MetricResult<(Tensor, Tensor, Tensor)> {
        let device = query.device();
        let anchors = query.index_select(&index_tensor(self.anchors.clone(), device)?, 0)?;
        let positives = reference.index_select(&index_tensor(self.positives.clone(), device)?, 0)?;
        let negatives = reference.index_select(&index_tensor(self.negatives.clone(), device)?, 0)?;
        Ok((anchors, positives, negatives))
    }
}

/// Per-triplet `[ap - an + margin]` in the sign convention of `distance`,
/// hinged with relu or with softplus when `smooth`
pub fn triplet_violations(
    distance: &dyn Distance,
    margin: f64,
    swap: bool,
    smooth: bool,
    anchors: &Tensor,
    positives: &Tensor,
    negatives: &Tensor,
) -> MetricResult<Tensor> {
    let ap = distance.paired(anchors, positives)?;
    let mut an = distance.paired(anchors, negatives)?;
    if swap {
        let pn = distance.paired(positives, negatives)?;
        an = distance.harder(&an, &pn)?;
    }
    let violation = distance.margin(&ap, &an)?.affine(1.0, margin)?;
    if smooth {
        softplus(&violation)
    } else {
        Ok(violation.relu()?)
    }
}

#[derive(Debug)]
pub struct TripletMarginLoss {
    margin: f64,
    smooth_loss: bool,
    swap: bool,
    distance: Box<dyn Distance>,
    reducer: Box<dyn Reducer>,
}

impl TripletMarginLoss {
    pub fn new(margin: f64) -> Self {
        Self {
            margin,
            smooth_loss: false,
            swap: false,
            distance: Box::new(LpDistance::normalized_euclidean()),
            reducer: Box::new(AvgNonZeroReducer),
        }
    }

    pub fn from_config(config: &TripletMarginConfig) -> MetricResult<Self> {
        Ok(Self {
            margin: config.margin,
            smooth_loss: config.smooth_loss,
            swap: config.swap,
            distance: config.distance.build()?,
            reducer: config.reducer.build(),
        })
    }

    pub fn with_distance(mut self, distance: Box<dyn Distance>) -> Self {
        self.distance = distance;
        self
    }

    pub fn with_reducer(mut self, reducer: Box<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

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

    /// Unreduced `[num_triplets]` losses
    pub fn triplet_losses(
        &self,
        query: &Tensor,
        reference: &Tensor,
        indices: &TripletIndices,
    ) -> MetricResult<Tensor> {
        let (anchors, positives, negatives) = indices.select(query, reference)?;
        triplet_violations(
            self.distance.as_ref(),
            self.margin,
            self.swap,
            self.smooth_loss,
            &anchors,
            &positives,
            &negatives,
        )
    }

    /// Reduced loss over caller-chosen triplets
    pub fn forward_indices(
        &self,
        query: &Tensor,
        reference: &Tensor,
        indices: &TripletIndices,
    ) -> MetricResult<Tensor> {
        if indices.is_empty() {
            return zero_loss(query);
        }
        let losses = self.triplet_losses(query, reference, indices)?;
        self.reducer.reduce(&losses)
    }
}

impl MetricLoss for TripletMarginLoss {
    fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<Tensor> {
        let labels = flatten_labels(labels)?;
        batch_dims(embeddings, labels.len())?;
        let indices = TripletIndices::all_from_labels(&labels);
        if indices.is_empty() {
            tracing::debug!(batch = labels.len(), "no triplets in batch");
        }
        self.forward_indices(embeddings, embeddings, &indices)
    }

    fn name(&self) -> &'static str {
        "TripletMarginLoss"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        nn::{distances::CosineSimilarity, reducers::MeanReducer},
        tensor::testing::{angle_embeddings, assert_close, labels, scalar},
    };
    use candle_core::DType;

    fn chord(degrees: f64) -> f64 {
        2.0 * (degrees.to_radians() / 2.0).sin()
    }

    #[test]
    fn test_all_triplets_from_labels() {
        let indices = TripletIndices::all_from_labels(&[0, 0, 1, 1]);
        assert_eq!(indices.len(), 8);
        assert_eq!((indices.anchors[0], indices.positives[0], indices.negatives[0]), (0, 1, 2));
        assert!(TripletIndices::all_from_labels(&[0, 1, 2]).is_empty());
    }

    #[test]
    fn test_index_lengths_must_match() {
        assert!(TripletIndices::new(vec![0], vec![1], vec![]).is_err());
    }

    #[test]
    fn test_hinge_on_unit_circle() {
        let embeddings = angle_embeddings(&[0.0, 10.0, 90.0], DType::F64);
        let loss = TripletMarginLoss::new(1.5)
            .forward(&embeddings, &labels(&[0, 0, 1]))
            .unwrap();
        let expected = ((chord(10.0) - chord(90.0) + 1.5) + (chord(10.0) - chord(80.0) + 1.5)) / 2.0;
        assert_close(scalar(&loss), expected, 1e-9);
    }

    #[test]
    fn test_swap_uses_harder_negative() {
        let embeddings = angle_embeddings(&[0.0, 60.0, 100.0], DType::F64);
        let indices = TripletIndices::new(vec![0], vec![1], vec![2]).unwrap();
        let plain = TripletMarginLoss::new(1.0)
            .forward_indices(&embeddings, &embeddings, &indices)
            .unwrap();
        let swapped = TripletMarginLoss::new(1.0)
            .with_swap(true)
            .forward_indices(&embeddings, &embeddings, &indices)
            .unwrap();
        assert_close(scalar(&plain), chord(60.0) - chord(100.0) + 1.0, 1e-9);
        assert_close(scalar(&swapped), chord(60.0) - chord(40.0) + 1.0, 1e-9);
    }

    #[test]
    fn test_similarity_flips_margin_sign() {
        let embeddings = angle_embeddings(&[0.0, 20.0, 30.0], DType::F32);
        let indices = TripletIndices::new(vec![0], vec![1], vec![2]).unwrap();
        let loss = TripletMarginLoss::new(0.2)
            .with_distance(Box::new(CosineSimilarity::new()))
            .with_reducer(Box::new(MeanReducer))
            .forward_indices(&embeddings, &embeddings, &indices)
            .unwrap();
        let expected = 30f64.to_radians().cos() - 20f64.to_radians().cos() + 0.2;
        assert_close(scalar(&loss), expected, 1e-6);
    }

    #[test]
    fn test_smooth_loss_is_softplus() {
        let embeddings = angle_embeddings(&[0.0, 10.0, 90.0], DType::F64);
        let indices = TripletIndices::new(vec![0], vec![1], vec![2]).unwrap();
        let loss = TripletMarginLoss::new(0.05)
            .with_smooth_loss(true)
            .forward_indices(&embeddings, &embeddings, &indices)
            .unwrap();
        let x = chord(10.0) - chord(90.0) + 0.05;
        assert_close(scalar(&loss), (1.0 + x.exp()).ln(), 1e-9);
    }

    #[test]
    fn test_no_triplets_gives_attached_zero() {
        let embeddings = angle_embeddings(&[0.0, 90.0], DType::F32);
        let loss = TripletMarginLoss::new(0.1)
            .forward(&embeddings, &labels(&[0, 1]))
            .unwrap();
        assert_eq!(scalar(&loss), 0.0);
        let grads = loss.backward().unwrap();
        assert!(grads.get(embeddings.as_tensor()).is_some());
    }
}
