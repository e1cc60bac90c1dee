//! Anvil Metric - metric learning losses on a differentiable tensor backend
//!
//! Features:
//! - Sub-center ArcFace with outlier detection against dominant sub-centers
//! - ArcFace and a shared additive angular margin
//! - Centroid triplet loss over leave-one-out class centroids
//! - Triplet margin loss over explicit index sets
//! - Pluggable distances and reducers
//! - Serde configuration with a global config manager

pub mod config;
pub mod error;
pub mod nn;
pub mod tensor;

pub use config::{ConfigBuilder, LossConfig, MetricConfig, OutlierOptions};
pub use error::{MetricError, MetricResult};
pub use nn::*;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{MetricError, MetricResult};
    pub use crate::nn::distances::{CosineSimilarity, Distance, DotProductSimilarity, LpDistance};
    pub use crate::nn::losses::{
        ArcFaceLoss, CentroidTripletLoss, LossFactory, MetricLoss, OutlierReport,
        SubCenterArcFaceLoss, TripletIndices, TripletMarginLoss,
    };
    pub use crate::nn::reducers::{AvgNonZeroReducer, MeanReducer, Reducer, SumReducer};
}

use crate::config::LoggingConfig;

/// Initialize logging with the default configuration
pub fn init() -> MetricResult<()> {
    init_with_config(&LoggingConfig::default())
}

/// Initialize logging at the configured level. A subscriber installed earlier
/// (by the host application or a previous call) is left in place.
pub fn init_with_config(logging: &LoggingConfig) -> MetricResult<()> {
    let level = logging.level.parse::<tracing::Level>().map_err(|_| {
        MetricError::ConfigurationError(format!("unknown log level '{}'", logging.level))
    })?;
    let installed = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(logging.with_target)
        .try_init()
        .is_ok();
    tracing::info!(installed, %level, "Anvil metric initialized");
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_init_rejects_unknown_level() {
        let logging = LoggingConfig { level: "loud".to_string(), ..Default::default() };
        assert!(matches!(
            init_with_config(&logging),
            Err(MetricError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
