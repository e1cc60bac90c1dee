//! Metric learning losses
//!
//! Every loss maps a `[batch, dim]` float embedding batch and a `[batch]`
//! integer label tensor to a scalar that can be back-propagated through.
//! Angular losses additionally own trainable class centers, exposed through
//! [`MetricLoss::parameters`] so they can be handed to an optimizer.

pub mod angular;
pub mod centroid_triplet;
pub mod ranking;
pub mod sub_center;

pub use angular::*;
pub use centroid_triplet::*;
pub use ranking::*;
pub use sub_center::*;

use candle_core::{Device, Tensor, Var};

use crate::{
    config::{
        ArcFaceConfig, CentroidTripletConfig, LossConfig, SubCenterArcFaceConfig,
        TripletMarginConfig,
    },
    error::{MetricError, MetricResult},
};

/// Base trait for all metric losses
pub trait MetricLoss: Send + Sync {
    /// Compute the reduced loss for one batch
    fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<Tensor>;

    /// Get the name of the loss function
    fn name(&self) -> &'static str;

    /// Trainable tensors owned by the loss
    fn parameters(&self) -> Vec<Var> {
        Vec::new()
    }
}

/// Loss function factory for creating losses by name or from configuration
pub struct LossFactory;

impl LossFactory {
    /// Create a loss with default parameters. Angular losses need the class
    /// count and embedding size, so they are built for `num_classes` classes
    /// of `embedding_size` wide embeddings.
    pub fn create(
        name: &str,
        num_classes: usize,
        embedding_size: usize,
        device: &Device,
    ) -> MetricResult<Box<dyn MetricLoss>> {
        let config = match name.to_lowercase().as_str() {
            "arcface" | "arc_face" => LossConfig::ArcFace(ArcFaceConfig {
                num_classes,
                embedding_size,
                ..Default::default()
            }),
            "subcenter_arcface" | "sub_center_arc_face" => {
                LossConfig::SubCenterArcFace(SubCenterArcFaceConfig {
                    num_classes,
                    embedding_size,
                    ..Default::default()
                })
            }
            "centroid_triplet" => LossConfig::CentroidTriplet(CentroidTripletConfig::default()),
            "triplet" | "triplet_margin" => LossConfig::TripletMargin(TripletMarginConfig::default()),
            _ => return Err(MetricError::InvalidInput(format!("Unknown loss function: {}", name))),
        };
        Self::from_config(&config, device)
    }

    /// Validate `config` and build the loss it describes
    pub fn from_config(config: &LossConfig, device: &Device) -> MetricResult<Box<dyn MetricLoss>> {
        config.validate()?;
        let loss: Box<dyn MetricLoss> = match config {
            LossConfig::ArcFace(c) => Box::new(ArcFaceLoss::from_config(c, device)?),
            LossConfig::SubCenterArcFace(c) => Box::new(SubCenterArcFaceLoss::from_config(c, device)?),
            LossConfig::CentroidTriplet(c) => Box::new(CentroidTripletLoss::from_config(c)?),
            LossConfig::TripletMargin(c) => Box::new(TripletMarginLoss::from_config(c)?),
        };
        tracing::debug!(loss = loss.name(), "built loss from config");
        Ok(loss)
    }

    /// Build the loss described by the global configuration
    pub fn from_global_config(device: &Device) -> MetricResult<Box<dyn MetricLoss>> {
        Self::from_config(&crate::config::get_config().loss, device)
    }

    /// List all available loss functions
    pub fn available_losses() -> Vec<&'static str> {
        vec!["arcface", "subcenter_arcface", "centroid_triplet", "triplet_margin"]
    }
}
