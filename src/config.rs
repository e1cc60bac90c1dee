//! Configuration management for the metric-learning losses

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{MetricError, MetricResult};

/// Pairwise distance selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DistanceConfig {
    Cosine,
    DotProduct {
        normalize_embeddings: bool,
    },
    Lp {
        p: f64,
        power: f64,
        normalize_embeddings: bool,
    },
}

impl DistanceConfig {
    /// Raw Euclidean distance
    pub fn euclidean() -> Self {
        DistanceConfig::Lp { p: 2.0, power: 1.0, normalize_embeddings: false }
    }
}

impl Default for DistanceConfig {
    fn default() -> Self {
        Self::euclidean()
    }
}

/// Loss reduction selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReducerConfig {
    Mean,
    AvgNonZero,
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArcFaceConfig {
    pub num_classes: usize,
    pub embedding_size: usize,
    /// Additive angular margin in degrees
    pub margin: f64,
    pub scale: f64,
    /// Seed for the center initialisation; entropy when unset
    pub seed: Option<u64>,
    pub reducer: ReducerConfig,
}

impl Default for ArcFaceConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            embedding_size: 128,
            margin: 28.6,
            scale: 64.0,
            seed: None,
            reducer: ReducerConfig::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubCenterArcFaceConfig {
    pub num_classes: usize,
    pub embedding_size: usize,
    /// Additive angular margin in degrees
    pub margin: f64,
    pub scale: f64,
    pub sub_centers: usize,
    pub seed: Option<u64>,
    pub reducer: ReducerConfig,
}

impl Default for SubCenterArcFaceConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            embedding_size: 128,
            margin: 28.6,
            scale: 64.0,
            sub_centers: 3,
            seed: None,
            reducer: ReducerConfig::Mean,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentroidTripletConfig {
    pub margin: f64,
    /// Softplus instead of the hinge, on normalised Euclidean distances
    pub smooth_loss: bool,
    pub swap: bool,
    pub distance: DistanceConfig,
    pub reducer: ReducerConfig,
}

impl Default for CentroidTripletConfig {
    fn default() -> Self {
        Self {
            margin: 0.05,
            smooth_loss: false,
            swap: false,
            distance: DistanceConfig::euclidean(),
            reducer: ReducerConfig::AvgNonZero,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripletMarginConfig {
    pub margin: f64,
    pub smooth_loss: bool,
    pub swap: bool,
    pub distance: DistanceConfig,
    pub reducer: ReducerConfig,
}

impl Default for TripletMarginConfig {
    fn default() -> Self {
        Self {
            margin: 0.05,
            smooth_loss: false,
            swap: false,
            distance: DistanceConfig::Lp { p: 2.0, power: 1.0, normalize_embeddings: true },
            reducer: ReducerConfig::AvgNonZero,
        }
    }
}

/// Which loss to build, with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossConfig {
    ArcFace(ArcFaceConfig),
    SubCenterArcFace(SubCenterArcFaceConfig),
    CentroidTriplet(CentroidTripletConfig),
    TripletMargin(TripletMarginConfig),
}

impl Default for LossConfig {
    fn default() -> Self {
        LossConfig::CentroidTriplet(CentroidTripletConfig::default())
    }
}

/// Parameters of the sub-center outlier scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlierOptions {
    /// Angle in degrees, within [0, 180]
    pub threshold_degrees: f64,
    pub normalize: bool,
    pub return_dominant_centers: bool,
}

impl Default for OutlierOptions {
    fn default() -> Self {
        Self {
            threshold_degrees: 75.0,
            normalize: true,
            return_dominant_centers: true,
        }
    }
}

impl OutlierOptions {
    pub fn with_threshold(mut self, threshold_degrees: f64) -> Self {
        self.threshold_degrees = threshold_degrees;
        self
    }

    pub fn validate(&self) -> MetricResult<()> {
        if !(0.0..=180.0).contains(&self.threshold_degrees) {
            return Err(MetricError::InvalidInput(format!(
                "outlier threshold must be an angle in [0, 180] degrees, got {}",
                self.threshold_degrees
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricConfig {
    pub loss: LossConfig,
    pub outliers: OutlierOptions,
    pub logging: LoggingConfig,
}

fn check_margin_and_scale(margin: f64, scale: f64) -> MetricResult<()> {
    if !margin.is_finite() || !scale.is_finite() || scale <= 0.0 {
        return Err(MetricError::ConfigurationError(format!(
            "angular margin and scale must be finite with scale > 0, got margin {} and scale {}",
            margin, scale
        )));
    }
    Ok(())
}

fn check_shape(num_classes: usize, embedding_size: usize) -> MetricResult<()> {
    if num_classes == 0 || embedding_size == 0 {
        return Err(MetricError::ConfigurationError(format!(
            "num_classes and embedding_size must be positive, got {} and {}",
            num_classes, embedding_size
        )));
    }
    Ok(())
}

fn check_distance(distance: &DistanceConfig) -> MetricResult<()> {
    if let DistanceConfig::Lp { p, power, .. } = *distance {
        if !(p > 0.0 && p.is_finite() && power > 0.0 && power.is_finite()) {
            return Err(MetricError::ConfigurationError(format!(
                "Lp distance needs positive finite p and power, got p = {} and power = {}",
                p, power
            )));
        }
    }
    Ok(())
}

impl LossConfig {
    pub fn validate(&self) -> MetricResult<()> {
        match self {
            LossConfig::ArcFace(c) => {
                check_shape(c.num_classes, c.embedding_size)?;
                check_margin_and_scale(c.margin, c.scale)
            }
            LossConfig::SubCenterArcFace(c) => {
                check_shape(c.num_classes, c.embedding_size)?;
                check_margin_and_scale(c.margin, c.scale)?;
                if c.sub_centers == 0 {
                    return Err(MetricError::ConfigurationError(
                        "sub_centers must be at least 1".to_string(),
                    ));
                }
                Ok(())
            }
            LossConfig::CentroidTriplet(c) => {
                if !c.margin.is_finite() {
                    return Err(MetricError::ConfigurationError(format!(
                        "triplet margin must be finite, got {}",
                        c.margin
                    )));
                }
                check_distance(&c.distance)
            }
            LossConfig::TripletMargin(c) => {
                if !c.margin.is_finite() {
                    return Err(MetricError::ConfigurationError(format!(
                        "triplet margin must be finite, got {}",
                        c.margin
                    )));
                }
                check_distance(&c.distance)
            }
        }
    }
}

impl MetricConfig {
    pub fn validate(&self) -> MetricResult<()> {
        self.loss.validate()?;
        self.outliers
            .validate()
            .map_err(|e| MetricError::ConfigurationError(e.to_string()))?;
        self.logging
            .level
            .parse::<tracing::Level>()
            .map_err(|_| {
                MetricError::ConfigurationError(format!("unknown log level '{}'", self.logging.level))
            })?;
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
pub struct ConfigManager {
    config: Arc<RwLock<MetricConfig>>,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(MetricConfig::default())),
            config_file: None,
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> MetricResult<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetricError::operation_error("config", &format!("Failed to read config file: {}", e)))?;

        let config: MetricConfig = serde_json::from_str(&content)
            .map_err(|e| MetricError::operation_error("config", &format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> MetricResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())
            .map_err(|e| MetricError::operation_error("config", &format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| MetricError::operation_error("config", &format!("Failed to write config file: {}", e)))?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> MetricConfig {
        self.config.read().clone()
    }

    /// Apply `f` to a copy of the configuration and keep it only if it validates
    pub fn update_config<F>(&mut self, f: F) -> MetricResult<()>
    where
        F: FnOnce(&mut MetricConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }

        Ok(())
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> MetricConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> MetricResult<()>
where
    F: FnOnce(&mut MetricConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> MetricResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Create a configuration builder for easy setup
pub struct ConfigBuilder {
    config: MetricConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: MetricConfig::default(),
        }
    }

    pub fn loss(mut self, loss: LossConfig) -> Self {
        self.config.loss = loss;
        self
    }

    pub fn outliers(mut self, f: impl FnOnce(&mut OutlierOptions)) -> Self {
        f(&mut self.config.outliers);
        self
    }

    pub fn logging(mut self, f: impl FnOnce(&mut LoggingConfig)) -> Self {
        f(&mut self.config.logging);
        self
    }

    pub fn build(self) -> MetricResult<MetricConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    pub fn apply(self) -> MetricResult<()> {
        let config = self.build()?;
        update_config(|c| *c = config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
