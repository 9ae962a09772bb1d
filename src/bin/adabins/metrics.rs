use crate::loss::{prepare, LossError, LossOptions};
use serde::Serialize;
use tch::{Kind, Tensor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DepthMetrics {
    pub a1: f64,
    pub a2: f64,
    pub a3: f64,
    pub abs_rel: f64,
    pub sq_rel: f64,
    pub rmse: f64,
    pub rmse_log: f64,
    pub log10: f64,
    pub silog: f64,
}

impl DepthMetrics {
    /// Standard monocular depth errors over pixels with `min_depth < gt < max_depth`.
    ///
    /// The prediction is resized to the ground truth and clamped to the valid
    /// depth range before comparison.
    pub fn compute(
        prediction: &Tensor,
        ground_truth: &Tensor,
        min_depth: f64,
        max_depth: f64,
    ) -> Result<Self, LossError> {
        let prediction = prediction.clamp(min_depth, max_depth);
        let valid = ground_truth.gt(min_depth).logical_and(&ground_truth.lt(max_depth));
        let options = LossOptions::new()
            .interpolate(prediction.dim() == 4 && prediction.size() != ground_truth.size())
            .mask(&valid);
        let (prediction, gt) = prepare(&prediction, ground_truth, options)?;
        let prediction = prediction.to_kind(Kind::Double);
        let gt = gt.to_kind(Kind::Double);

        let ratio = (&gt / &prediction).maximum(&(&prediction / &gt));
        let within = |threshold: f64| -> Result<f64, LossError> {
            Ok(f64::try_from(ratio.lt(threshold).to_kind(Kind::Double).mean(Kind::Double))?)
        };

        let diff = &gt - &prediction;
        let log_diff = prediction.log() - gt.log();
        let mean = |t: Tensor| -> Result<f64, LossError> { Ok(f64::try_from(t.mean(Kind::Double))?) };

        let log_mse = mean(log_diff.square())?;
        let log_mean = mean(log_diff.shallow_clone())?;

        Ok(Self {
            a1: within(1.25)?,
            a2: within(1.25f64.powi(2))?,
            a3: within(1.25f64.powi(3))?,
            abs_rel: mean(diff.abs() / &gt)?,
            sq_rel: mean(diff.square() / &gt)?,
            rmse: mean(diff.square())?.sqrt(),
            rmse_log: log_mse.sqrt(),
            log10: mean((gt.log10() - prediction.log10()).abs())?,
            silog: (log_mse - log_mean * log_mean).max(0.0).sqrt() * 100.0,
        })
    }

    pub fn entries(&self) -> [(&'static str, f64); 9] {
        [
            ("a1", self.a1),
            ("a2", self.a2),
            ("a3", self.a3),
            ("abs_rel", self.abs_rel),
            ("sq_rel", self.sq_rel),
            ("rmse", self.rmse),
            ("rmse_log", self.rmse_log),
            ("log10", self.log10),
            ("silog", self.silog),
        ]
    }
}

/// Running per-sample average of [`DepthMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsAverage {
    sum: DepthMetrics,
    count: usize,
}

impl MetricsAverage {
    pub fn add(&mut self, metrics: &DepthMetrics) {
        let sum = &mut self.sum;
        sum.a1 += metrics.a1;
        sum.a2 += metrics.a2;
        sum.a3 += metrics.a3;
        sum.abs_rel += metrics.abs_rel;
        sum.sq_rel += metrics.sq_rel;
        sum.rmse += metrics.rmse;
        sum.rmse_log += metrics.rmse_log;
        sum.log10 += metrics.log10;
        sum.silog += metrics.silog;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<DepthMetrics> {
        if self.count == 0 {
            return None;
        }

        let n = self.count as f64;
        let sum = &self.sum;
        Some(DepthMetrics {
            a1: sum.a1 / n,
            a2: sum.a2 / n,
            a3: sum.a3 / n,
            abs_rel: sum.abs_rel / n,
            sq_rel: sum.sq_rel / n,
            rmse: sum.rmse / n,
            rmse_log: sum.rmse_log / n,
            log10: sum.log10 / n,
            silog: sum.silog / n,
        })
    }
}
