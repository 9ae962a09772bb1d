use clap::ValueEnum;
use log::debug;
use tch::{Kind, TchError, Tensor};
use thiserror::Error;

const SILOG_VARIANCE_FOCUS: f64 = 0.15;
const SILOG_SCALE: f64 = 10.0;
const BERHU_THRESHOLD_FACTOR: f64 = 0.2;

/// Ground-truth depth at or above this value counts as a valid observation.
pub const VALID_DEPTH_THRESHOLD: f64 = 1e-3;

#[derive(Error, Debug)]
pub enum LossError {
    #[error("invalid tensor rank: expected {expected}, got {actual}")]
    InvalidRank { expected: usize, actual: usize },
    #[error("prediction shape {prediction:?} does not match target shape {target:?}")]
    ShapeMismatch {
        prediction: Vec<i64>,
        target: Vec<i64>,
    },
    #[error("mask must be boolean, got {0:?}")]
    MaskKind(Kind),
    #[error("mask shape {mask:?} is not broadcastable to {target:?}")]
    MaskShape { mask: Vec<i64>, target: Vec<i64> },
    #[error("bin centers must be (N, P) or (N, P, 1), got {0:?}")]
    BinsShape(Vec<i64>),
    #[error("bin centers batch {bins} does not match ground truth batch {ground_truth}")]
    BatchMismatch { bins: i64, ground_truth: i64 },
    #[error("no elements left to reduce over")]
    EmptySelection,
    #[error("tch error: {0:?}")]
    Tch(#[from] TchError),
}

/// Per-call preprocessing applied before any pixel-wise loss.
///
/// Resizing always happens before masking, so a mask is expressed in the
/// target's resolution.
#[derive(Debug, Clone, Copy)]
pub struct LossOptions<'a> {
    /// Resample the prediction to the target's spatial size (bilinear, aligned corners).
    pub interpolate: bool,
    /// Boolean selector, broadcastable to the target.
    pub mask: Option<&'a Tensor>,
}

impl Default for LossOptions<'_> {
    fn default() -> Self {
        Self {
            interpolate: true,
            mask: None,
        }
    }
}

impl<'a> LossOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interpolate(mut self, interpolate: bool) -> Self {
        self.interpolate = interpolate;
        self
    }

    pub fn mask(mut self, mask: &'a Tensor) -> Self {
        self.mask = Some(mask);
        self
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthLoss {
    Silog,
    Berhu,
    Mse,
}

impl DepthLoss {
    pub fn compute(
        self,
        prediction: &Tensor,
        target: &Tensor,
        options: LossOptions<'_>,
    ) -> Result<Tensor, LossError> {
        match self {
            DepthLoss::Silog => silog_loss(prediction, target, options),
            DepthLoss::Berhu => berhu_loss(prediction, target, options),
            DepthLoss::Mse => mse_loss(prediction, target, options),
        }
    }
}

/// Scale-invariant log loss: `10 * sqrt(var(g) + 0.15 * mean(g)^2)` with
/// `g = ln(prediction) - ln(target)`.
///
/// Inputs are expected to be strictly positive on the selected elements; this
/// is not checked and non-positive values surface as NaN or infinity.
pub fn silog_loss(
    prediction: &Tensor,
    target: &Tensor,
    options: LossOptions<'_>,
) -> Result<Tensor, LossError> {
    let (prediction, target) = prepare(prediction, target, options)?;
    let g = prediction.log() - target.log();
    let kind = g.kind();
    let dg = g.var(true) + g.mean(kind).square() * SILOG_VARIANCE_FOCUS;

    Ok(dg.sqrt() * SILOG_SCALE)
}

/// Reverse Huber loss with a threshold of `0.2 * max|error|`.
///
/// Errors strictly above the threshold are penalised quadratically, errors
/// strictly below it linearly. An error exactly equal to the threshold
/// contributes nothing, which also makes an all-zero error batch evaluate to
/// zero instead of dividing by a zero threshold.
pub fn berhu_loss(
    prediction: &Tensor,
    target: &Tensor,
    options: LossOptions<'_>,
) -> Result<Tensor, LossError> {
    let (prediction, target) = prepare(prediction, target, options)?;
    let error = (target - prediction).abs();
    let kind = error.kind();
    let threshold = error.max() * BERHU_THRESHOLD_FACTOR;

    let quadratic = error.f_masked_select(&error.gt_tensor(&threshold))?;
    let quadratic = (quadratic.square() + threshold.square()) / (&threshold * 2.0);
    let linear = error.f_masked_select(&error.lt_tensor(&threshold))?;

    let total = quadratic.sum(kind) + linear.sum(kind);
    Ok(total / error.numel() as f64)
}

pub fn mse_loss(
    prediction: &Tensor,
    target: &Tensor,
    options: LossOptions<'_>,
) -> Result<Tensor, LossError> {
    let (prediction, target) = prepare(prediction, target, options)?;
    let kind = prediction.kind();

    Ok((prediction - target).square().mean(kind))
}

/// Bidirectional Chamfer distance between each sample's bin centers and its
/// valid ground-truth depth values, treated as 1-D point sets.
///
/// `bin_centers` is `(N, P)` or `(N, P, 1)`; `ground_truth` is any tensor with
/// a leading batch dimension of `N`. Each direction averages squared
/// nearest-neighbour distances, the two directions are summed, and the result
/// is averaged over the batch. Samples without a single valid point are left
/// out of the average.
pub fn bins_chamfer_loss(
    bin_centers: &Tensor,
    ground_truth: &Tensor,
) -> Result<Tensor, LossError> {
    let bins_size = bin_centers.size();
    let valid_shape = match bins_size.len() {
        2 => true,
        3 => bins_size[2] == 1,
        _ => false,
    };
    if !valid_shape {
        return Err(LossError::BinsShape(bins_size));
    }
    if ground_truth.dim() < 2 {
        return Err(LossError::InvalidRank {
            expected: 2,
            actual: ground_truth.dim(),
        });
    }

    let batch = ground_truth.size()[0];
    let bins_batch = bins_size[0];
    if bins_batch != batch {
        return Err(LossError::BatchMismatch {
            bins: bins_batch,
            ground_truth: batch,
        });
    }

    let centers = bin_centers.f_reshape([batch, -1])?;
    if centers.size()[1] == 0 {
        return Err(LossError::EmptySelection);
    }
    let points = ground_truth.f_reshape([batch, -1])?;
    let kind = centers.kind();

    let mut distances = Vec::with_capacity(batch as usize);
    for index in 0..batch {
        let sample = points.get(index);
        let valid = sample.f_masked_select(&sample.ge(VALID_DEPTH_THRESHOLD))?;
        if valid.numel() == 0 {
            debug!("sample {index} has no valid ground truth points, skipping");
            continue;
        }

        let sample_centers = centers.get(index);
        let center_to_point = nearest_squared_distance(&sample_centers, &valid)?;
        let point_to_center = nearest_squared_distance(&valid, &sample_centers)?;
        distances.push(center_to_point.mean(kind) + point_to_center.mean(kind));
    }

    if distances.is_empty() {
        return Err(LossError::EmptySelection);
    }

    Ok(Tensor::stack(&distances, 0).mean(kind))
}

/// Squared distance from every query to its nearest point, both 1-D.
///
/// The points are sorted once and each query only looks at its two
/// neighbours in sorted order, so memory stays linear in the inputs.
fn nearest_squared_distance(queries: &Tensor, points: &Tensor) -> Result<Tensor, LossError> {
    let (sorted, _) = points.f_sort(0, false)?;
    let last = sorted.size()[0] - 1;

    let upper = queries.detach().f_bucketize(&sorted.detach(), false, false)?;
    let lower = (&upper - 1).f_clamp(0, last)?;
    let upper = upper.f_clamp(0, last)?;

    let to_lower = (queries - sorted.f_gather(0, &lower, false)?).square();
    let to_upper = (queries - sorted.f_gather(0, &upper, false)?).square();
    Ok(to_lower.f_minimum(&to_upper)?)
}

/// Resizes, validates and masks a prediction/target pair, returning the
/// tensors the pixel-wise losses reduce over.
pub fn prepare(
    prediction: &Tensor,
    target: &Tensor,
    options: LossOptions<'_>,
) -> Result<(Tensor, Tensor), LossError> {
    let target_size = target.size();

    let prediction = if options.interpolate {
        if prediction.dim() != 4 {
            return Err(LossError::InvalidRank {
                expected: 4,
                actual: prediction.dim(),
            });
        }
        if target_size.len() < 2 {
            return Err(LossError::InvalidRank {
                expected: 2,
                actual: target_size.len(),
            });
        }
        let spatial = &target_size[target_size.len() - 2..];
        prediction.f_upsample_bilinear2d(spatial, true, None::<f64>, None::<f64>)?
    } else {
        prediction.shallow_clone()
    };

    let prediction_size = prediction.size();
    if prediction_size != target_size {
        return Err(LossError::ShapeMismatch {
            prediction: prediction_size,
            target: target_size,
        });
    }

    let (prediction, target) = match options.mask {
        Some(mask) => {
            if mask.kind() != Kind::Bool {
                return Err(LossError::MaskKind(mask.kind()));
            }
            let mask_size = mask.size();
            if !broadcasts_to(&mask_size, &target_size) {
                return Err(LossError::MaskShape {
                    mask: mask_size,
                    target: target_size,
                });
            }
            (
                prediction.f_masked_select(mask)?,
                target.f_masked_select(mask)?,
            )
        }
        None => (prediction, target.shallow_clone()),
    };

    if prediction.numel() == 0 {
        return Err(LossError::EmptySelection);
    }

    Ok((prediction, target))
}

fn broadcasts_to(from: &[i64], to: &[i64]) -> bool {
    from.len() <= to.len()
        && from
            .iter()
            .rev()
            .zip(to.iter().rev())
            .all(|(&from, &to)| from == to || from == 1)
}
