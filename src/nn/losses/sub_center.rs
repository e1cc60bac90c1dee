//! Sub-center ArcFace
//!
//! Every class owns `sub_centers` columns of the center bank. The effective
//! class similarity is the best of them, so one class can cover several modes
//! of its data, and samples that stay far from the class's dominant sub-center
//! can be reported as likely label noise.

use candle_core::{DType, Device, Tensor, Var};

use crate::{
    config::{OutlierOptions, SubCenterArcFaceConfig},
    error::{MetricError, MetricResult},
    nn::{
        distances::CosineSimilarity,
        reducers::Reducer,
    },
    tensor::{flatten_labels, index_tensor, l2_normalize},
};

use super::{
    angular::{class_indices, AngularMargin, CenterBank, CenterLayout},
    MetricLoss,
};

/// Result of [`SubCenterArcFaceLoss::get_outliers`]
#[derive(Debug, Clone)]
pub struct OutlierReport {
    /// U32 batch indices of flagged samples, class by class
    pub outliers: Tensor,
    /// `embedding_size x num_classes`; only the columns listed in
    /// `covered_classes` hold a dominant center
    pub dominant_centers: Option<Tensor>,
    /// Classes present in the batch, in ascending order
    pub covered_classes: Vec<usize>,
    /// The scan recast the centers to a new dtype or device; optimizers must
    /// be rebuilt from a fresh `parameters()`
    pub weights_recast: bool,
}

impl OutlierReport {
    pub fn outlier_indices(&self) -> MetricResult<Vec<u32>> {
        Ok(self.outliers.to_vec1::<u32>()?)
    }

    pub fn num_outliers(&self) -> usize {
        self.outliers.elem_count()
    }
}

#[derive(Debug)]
pub struct SubCenterArcFaceLoss {
    bank: CenterBank,
    margin: AngularMargin,
    distance: CosineSimilarity,
    reducer: Box<dyn Reducer>,
}

impl SubCenterArcFaceLoss {
    pub fn new(
        num_classes: usize,
        embedding_size: usize,
        margin_degrees: f64,
        scale: f64,
        sub_centers: usize,
        device: &Device,
    ) -> MetricResult<Self> {
        Self::from_config(
            &SubCenterArcFaceConfig {
                num_classes,
                embedding_size,
                margin: margin_degrees,
                scale,
                sub_centers,
                ..Default::default()
            },
            device,
        )
    }

    pub fn from_config(config: &SubCenterArcFaceConfig, device: &Device) -> MetricResult<Self> {
        if config.sub_centers == 0 {
            return Err(MetricError::ConfigurationError(
                "sub_centers must be at least 1".to_string(),
            ));
        }
        let margin = AngularMargin::new(config.margin, config.scale)?;
        let bank = CenterBank::new(
            config.embedding_size,
            CenterLayout::new(config.num_classes, config.sub_centers),
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

    pub fn num_classes(&self) -> usize {
        self.bank.layout().num_classes()
    }

    pub fn sub_centers(&self) -> usize {
        self.bank.layout().sub_centers()
    }

    /// `[batch, num_classes]` cosine to each class's best sub-center
    pub fn get_cosine(&self, embeddings: &Tensor) -> MetricResult<Tensor> {
        let all = self.bank.similarities(embeddings, &self.distance)?;
        let (batch, _) = all.dims2()?;
        Ok(all
            .reshape((batch, self.num_classes(), self.sub_centers()))?
            .max(2)?)
    }

    /// Scaled cosines without margin, for inference
    pub fn get_logits(&self, embeddings: &Tensor) -> MetricResult<Tensor> {
        let (batch, _) = embeddings.dims2()?;
        self.bank.check_embeddings(embeddings, batch)?;
        Ok(self.get_cosine(embeddings)?.affine(self.margin.scale(), 0.0)?)
    }

    /// Flag samples whose similarity to their class's dominant sub-center is
    /// below `cos(threshold)`.
    ///
    /// Runs without gradient tracking and in eval mode. The stored centers are
    /// cast to the embeddings' dtype and device first, and stay cast. When that
    /// replaces the center variable the report says so through
    /// `weights_recast`, and [`MetricLoss::parameters`] has to be called again
    /// before further optimizer steps.
    pub fn get_outliers(
        &mut self,
        embeddings: &Tensor,
        labels: &Tensor,
        options: &OutlierOptions,
    ) -> MetricResult<OutlierReport> {
        options.validate()?;
        let labels = flatten_labels(labels)?;
        self.bank.check_embeddings(embeddings, labels.len())?;

        let embeddings = embeddings.detach();
        let embeddings = if options.normalize {
            l2_normalize(&embeddings, 1)?
        } else {
            embeddings
        };
        let cos_threshold = options.threshold_degrees.to_radians().cos();

        let report = self.bank.with_eval_mode(|bank| {
            let recast = bank.cast_types(embeddings.dtype(), embeddings.device())?;
            let mut report =
                scan_classes(bank, &embeddings, &labels, cos_threshold, options.return_dominant_centers)?;
            report.weights_recast = recast;
            Ok(report)
        })?;

        tracing::debug!(
            outliers = report.num_outliers(),
            classes = report.covered_classes.len(),
            threshold = options.threshold_degrees,
            "sub-center outlier scan finished"
        );
        Ok(report)
    }

    /// [`SubCenterArcFaceLoss::get_outliers`] with the globally configured
    /// outlier options
    pub fn detect_outliers(&mut self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<OutlierReport> {
        let options = crate::config::get_config().outliers;
        self.get_outliers(embeddings, labels, &options)
    }
}

/// Most assigned sub-center, lowest index on ties
fn dominant_sub_center(assignments: &[u32], sub_centers: usize) -> usize {
    let mut counts = vec![0usize; sub_centers];
    for &assigned in assignments {
        counts[assigned as usize] += 1;
    }
    let mut best = 0;
    for (idx, &count) in counts.iter().enumerate() {
        if count > counts[best] {
            best = idx;
        }
    }
    best
}

fn scan_classes(
    bank: &CenterBank,
    embeddings: &Tensor,
    labels: &[i64],
    cos_threshold: f64,
    keep_centers: bool,
) -> MetricResult<OutlierReport> {
    let layout = bank.layout();
    let device = embeddings.device();
    let mut outliers: Vec<u32> = Vec::new();
    let mut dominant: Vec<Option<Tensor>> = vec![None; layout.num_classes()];

    for class in 0..layout.num_classes() {
        let members: Vec<u32> = labels
            .iter()
            .enumerate()
            .filter(|(_, &label)| label == class as i64)
            .map(|(idx, _)| idx as u32)
            .collect();
        if members.is_empty() {
            continue;
        }

        let selected = embeddings.index_select(&index_tensor(members.clone(), device)?, 0)?;
        let centers = l2_normalize(&bank.class_centers(class)?.detach(), 0)?.contiguous()?;
        let similarities = selected.matmul(&centers)?;

        let assignments = similarities.argmax(1)?.to_vec1::<u32>()?;
        let dominant_idx = dominant_sub_center(&assignments, layout.sub_centers());
        dominant[class] = Some(centers.narrow(1, dominant_idx, 1)?);

        let to_dominant = similarities
            .narrow(1, dominant_idx, 1)?
            .squeeze(1)?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        let before = outliers.len();
        outliers.extend(
            members
                .iter()
                .zip(to_dominant)
                .filter(|(_, similarity)| *similarity < cos_threshold)
                .map(|(&idx, _)| idx),
        );
        tracing::trace!(
            class,
            samples = members.len(),
            dominant = dominant_idx,
            flagged = outliers.len() - before,
            "scanned class"
        );
    }

    let covered_classes: Vec<usize> = dominant
        .iter()
        .enumerate()
        .filter_map(|(class, center)| center.as_ref().map(|_| class))
        .collect();

    let dominant_centers = if keep_centers {
        let unset = Tensor::zeros((bank.embedding_size(), 1), embeddings.dtype(), device)?;
        let columns: Vec<Tensor> = dominant
            .into_iter()
            .map(|center| center.unwrap_or_else(|| unset.clone()))
            .collect();
        Some(Tensor::cat(&columns, 1)?)
    } else {
        None
    };

    Ok(OutlierReport {
        outliers: index_tensor(outliers, device)?,
        dominant_centers,
        covered_classes,
        weights_recast: false,
    })
}

impl MetricLoss for SubCenterArcFaceLoss {
    fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> MetricResult<Tensor> {
        let labels = flatten_labels(labels)?;
        self.bank.check_embeddings(embeddings, labels.len())?;
        let targets = class_indices(&labels, self.num_classes())?;
        let cosine = self.get_cosine(embeddings)?;
        self.margin.loss(&cosine, &targets, self.reducer.as_ref())
    }

    fn name(&self) -> &'static str {
        "SubCenterArcFaceLoss"
    }

    fn parameters(&self) -> Vec<Var> {
        self.bank.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ArcFaceConfig,
        nn::losses::angular::ArcFaceLoss,
        tensor::testing::{angle_columns, angle_embeddings, assert_close, labels, scalar, TEST_DTYPES},
    };
    use candle_nn::{Optimizer, SGD};

    /// Class 0 centers at 0/90/180 degrees, class 1 at 45/135/270, class 2 never
    /// appears in the batches below
    fn fixture_loss(dtype: DType) -> SubCenterArcFaceLoss {
        let mut loss_func = SubCenterArcFaceLoss::new(3, 2, 28.6, 64.0, 3, &Device::Cpu).unwrap();
        let weight = angle_columns(&[0.0, 90.0, 180.0, 45.0, 135.0, 270.0, 10.0, 20.0, 30.0], dtype);
        loss_func.bank_mut().set_weight(&weight).unwrap();
        loss_func
    }

    const FIXTURE_ANGLES: [f64; 6] = [5.0, 40.0, -5.0, 10.0, 50.0, 100.0];
    const FIXTURE_LABELS: [u32; 6] = [0, 1, 0, 0, 1, 0];

    #[test]
    fn test_cosine_takes_best_sub_center() {
        let loss_func = fixture_loss(DType::F64);
        let embeddings = angle_embeddings(&[80.0, 180.0], DType::F64);
        let cosine = loss_func.get_cosine(&embeddings).unwrap();
        assert_eq!(cosine.dims(), &[2, 3]);
        let cosine = cosine.to_vec2::<f64>().unwrap();
        assert_close(cosine[0][0], 10f64.to_radians().cos(), 1e-9);
        assert_close(cosine[0][1], 35f64.to_radians().cos(), 1e-9);
        assert_close(cosine[1][0], 1.0, 1e-9);
        assert_close(cosine[1][1], 45f64.to_radians().cos(), 1e-9);
    }

    #[test]
    fn test_outlier_far_from_dominant_center() {
        for dtype in TEST_DTYPES {
            let mut loss_func = fixture_loss(dtype);
            let embeddings = angle_embeddings(&FIXTURE_ANGLES, dtype);
            let report = loss_func
                .get_outliers(&embeddings, &labels(&FIXTURE_LABELS), &OutlierOptions::default())
                .unwrap();

            assert_eq!(report.outlier_indices().unwrap(), vec![5]);
            assert_eq!(report.covered_classes, vec![0, 1]);

            let centers = report
                .dominant_centers
                .unwrap()
                .to_dtype(DType::F64)
                .unwrap()
                .to_vec2::<f64>()
                .unwrap();
            assert_close(centers[0][0], 1.0, 1e-6);
            assert_close(centers[1][0], 0.0, 1e-6);
            assert_close(centers[0][1], 45f64.to_radians().cos(), 1e-6);
            assert_close(centers[1][1], 45f64.to_radians().sin(), 1e-6);
            assert_eq!(centers[0][2], 0.0);
            assert_eq!(centers[1][2], 0.0);
        }
    }

    #[test]
    fn test_tighter_threshold_flags_more_samples() {
        let mut loss_func = fixture_loss(DType::F32);
        let embeddings = angle_embeddings(&FIXTURE_ANGLES, DType::F32);
        let report = loss_func
            .get_outliers(
                &embeddings,
                &labels(&FIXTURE_LABELS),
                &OutlierOptions::default().with_threshold(7.0),
            )
            .unwrap();
        assert_eq!(report.outlier_indices().unwrap(), vec![3, 5]);
    }

    #[test]
    fn test_detect_outliers_reads_global_options() {
        crate::config::update_config(|c| c.outliers.return_dominant_centers = false).unwrap();
        let mut loss_func = fixture_loss(DType::F32);
        let embeddings = angle_embeddings(&FIXTURE_ANGLES, DType::F32);
        let report = loss_func.detect_outliers(&embeddings, &labels(&FIXTURE_LABELS)).unwrap();
        crate::config::update_config(|c| c.outliers.return_dominant_centers = true).unwrap();

        assert!(report.dominant_centers.is_none());
        assert_eq!(report.outlier_indices().unwrap(), vec![5]);
    }

    #[test]
    fn test_absent_classes_contribute_nothing() {
        let mut loss_func = fixture_loss(DType::F32);
        let embeddings = angle_embeddings(&[120.0, 130.0], DType::F32);
        let report = loss_func
            .get_outliers(&embeddings, &labels(&[1, 1]), &OutlierOptions::default())
            .unwrap();
        assert_eq!(report.num_outliers(), 0);
        assert_eq!(report.covered_classes, vec![1]);

        let centers = report.dominant_centers.unwrap().to_vec2::<f32>().unwrap();
        assert_close(centers[0][1] as f64, 135f64.to_radians().cos(), 1e-6);
        assert_eq!(centers[0][0], 0.0);
        assert_eq!(centers[0][2], 0.0);
    }

    #[test]
    fn test_outlier_scan_restores_mode_and_casts_weights() {
        let mut loss_func = fixture_loss(DType::F32);
        assert!(loss_func.bank().is_training());

        let embeddings = angle_embeddings(&FIXTURE_ANGLES, DType::F64);
        let report = loss_func
            .get_outliers(
                &embeddings,
                &labels(&FIXTURE_LABELS),
                &OutlierOptions { return_dominant_centers: false, ..Default::default() },
            )
            .unwrap();
        assert!(report.dominant_centers.is_none());
        assert!(report.weights_recast);
        assert!(loss_func.bank().is_training());
        assert_eq!(loss_func.bank().weight().dtype(), DType::F64);

        loss_func.bank_mut().eval();
        let report = loss_func
            .get_outliers(&embeddings, &labels(&FIXTURE_LABELS), &OutlierOptions::default())
            .unwrap();
        assert!(!report.weights_recast);
        assert!(!loss_func.bank().is_training());
    }

    #[test]
    fn test_optimizer_rebuilt_after_recast_keeps_training() {
        let config = SubCenterArcFaceConfig {
            num_classes: 3,
            embedding_size: 2,
            scale: 4.0,
            sub_centers: 2,
            seed: Some(5),
            ..Default::default()
        };
        let mut loss_func = SubCenterArcFaceLoss::from_config(&config, &Device::Cpu).unwrap();
        let stale = loss_func.parameters();

        let embeddings = angle_embeddings(&[0.0, 10.0, 120.0, 130.0, 240.0, 250.0], DType::F64)
            .as_tensor()
            .detach();
        let targets = labels(&[0, 0, 1, 1, 2, 2]);
        let report = loss_func
            .get_outliers(&embeddings, &targets, &OutlierOptions::default())
            .unwrap();
        assert!(report.weights_recast);

        let fresh = loss_func.parameters();
        assert_ne!(stale[0].as_tensor().id(), fresh[0].as_tensor().id());
        assert_eq!(fresh[0].dtype(), DType::F64);

        let before = loss_func.forward(&embeddings, &targets).unwrap();
        let mut optimizer = SGD::new(fresh, 0.01).unwrap();
        optimizer.backward_step(&before).unwrap();
        let after = loss_func.forward(&embeddings, &targets).unwrap();
        assert!(scalar(&after) < scalar(&before));
    }

    #[test]
    fn test_outlier_argument_errors() {
        let mut loss_func = fixture_loss(DType::F32);
        let embeddings = angle_embeddings(&FIXTURE_ANGLES, DType::F32);
        let column_labels = Tensor::new(&[[0u32], [1], [0], [0], [1], [0]], &Device::Cpu).unwrap();
        let report = loss_func
            .get_outliers(&embeddings, &column_labels, &OutlierOptions::default())
            .unwrap();
        assert_eq!(report.outlier_indices().unwrap(), vec![5]);

        let bad = OutlierOptions::default().with_threshold(181.0);
        assert!(loss_func.get_outliers(&embeddings, &labels(&FIXTURE_LABELS), &bad).is_err());
        assert!(loss_func
            .get_outliers(&embeddings, &labels(&[0, 1]), &OutlierOptions::default())
            .is_err());
    }

    #[test]
    fn test_single_sub_center_matches_arcface() {
        let config = ArcFaceConfig { num_classes: 4, embedding_size: 2, seed: Some(11), ..Default::default() };
        let arcface = ArcFaceLoss::from_config(&config, &Device::Cpu).unwrap();
        let sub_center = SubCenterArcFaceLoss::from_config(
            &SubCenterArcFaceConfig {
                num_classes: 4,
                embedding_size: 2,
                sub_centers: 1,
                seed: Some(11),
                ..Default::default()
            },
            &Device::Cpu,
        )
        .unwrap();

        let embeddings = angle_embeddings(&[0.0, 70.0, 140.0, 210.0, 280.0], DType::F32);
        let targets = labels(&[0, 1, 2, 3, 0]);
        let a = scalar(&arcface.forward(&embeddings, &targets).unwrap());
        let b = scalar(&sub_center.forward(&embeddings, &targets).unwrap());
        assert_close(a, b, 1e-6);
    }

    #[test]
    fn test_backward_reaches_embeddings_and_centers() {
        let loss_func = fixture_loss(DType::F32);
        let embeddings = angle_embeddings(&FIXTURE_ANGLES, DType::F32);
        let loss = loss_func.forward(&embeddings, &labels(&FIXTURE_LABELS)).unwrap();
        assert!(scalar(&loss) > 0.0);

        let grads = loss.backward().unwrap();
        assert!(grads.get(embeddings.as_tensor()).is_some());
        let weight_grad = grads.get(loss_func.bank().weight().as_tensor()).unwrap();
        assert_eq!(weight_grad.dims(), &[2, 9]);
    }

    #[test]
    fn test_optimizer_step_lowers_loss() {
        let config = SubCenterArcFaceConfig {
            num_classes: 3,
            embedding_size: 2,
            scale: 4.0,
            sub_centers: 2,
            seed: Some(3),
            ..Default::default()
        };
        let loss_func = SubCenterArcFaceLoss::from_config(&config, &Device::Cpu).unwrap();
        let embeddings = angle_embeddings(&[0.0, 10.0, 120.0, 130.0, 240.0, 250.0], DType::F32).as_tensor().detach();
        let targets = labels(&[0, 0, 1, 1, 2, 2]);

        let before = loss_func.forward(&embeddings, &targets).unwrap();
        let mut optimizer = SGD::new(loss_func.parameters(), 0.01).unwrap();
        optimizer.backward_step(&before).unwrap();
        let after = loss_func.forward(&embeddings, &targets).unwrap();
        assert!(scalar(&after) < scalar(&before));
    }
}
