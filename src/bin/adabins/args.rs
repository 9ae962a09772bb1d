use crate::{loss::DepthLoss, net::BinNorm};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "adabins",
    about = "Train a monocular depth network with adaptive bins"
)]
pub struct DepthArgs {
    /// Dataset root containing train/ (and optionally test/).
    #[arg(long)]
    pub dataset: PathBuf,
    /// Experiment name; the run is written to <logging-root>/<exp-name>.
    #[arg(long)]
    pub exp_name: String,
    #[arg(long, default_value = "logs")]
    pub logging_root: PathBuf,
    /// Replace an existing run directory.
    #[arg(long)]
    pub overwrite: bool,

    #[arg(long, default_value_t = 25)]
    pub epochs: usize,
    #[arg(long, default_value_t = 8)]
    pub batch_size: usize,
    /// Maximum learning rate of the decoder; the encoder uses a tenth of it.
    #[arg(long, default_value_t = 3.57e-4)]
    pub lr: f64,
    /// AdamW weight decay.
    #[arg(long, default_value_t = 0.1)]
    pub wd: f64,
    #[arg(long, default_value_t = 25.0)]
    pub div_factor: f64,
    #[arg(long, default_value_t = 100.0)]
    pub final_div_factor: f64,
    #[arg(long, default_value_t = 0.1)]
    pub max_grad_norm: f64,

    #[arg(long, default_value_t = 5)]
    pub epochs_til_checkpoint: usize,
    #[arg(long, default_value_t = 100)]
    pub steps_til_summary: usize,

    /// Weight of the bin-center Chamfer regularizer.
    #[arg(long, default_value_t = 0.1)]
    pub w_chamfer: f64,
    #[arg(long, value_enum, default_value_t = DepthLoss::Silog)]
    pub depth_loss: DepthLoss,
    #[arg(long, default_value_t = 1e-3)]
    pub min_depth: f64,
    #[arg(long, default_value_t = 10.0)]
    pub max_depth: f64,
    #[arg(long, default_value_t = 256)]
    pub n_bins: i64,
    #[arg(long, value_enum, default_value_t = BinNorm::Linear)]
    pub norm: BinNorm,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,
    /// Only load the first N training samples.
    #[arg(long)]
    pub small_data_num: Option<usize>,
    /// Fraction of the training split held out for validation.
    #[arg(long, default_value_t = 0.1)]
    pub val_fraction: f64,
    /// Random horizontal flips and color jitter on training batches.
    #[arg(long)]
    pub augment: bool,
    /// Weights to start from.
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = DepthArgs::parse_from(["adabins", "--dataset", "nyu", "--exp-name", "run"]);

        assert_eq!(args.logging_root, PathBuf::from("logs"));
        assert_eq!(args.depth_loss, DepthLoss::Silog);
        assert_eq!(args.norm, BinNorm::Linear);
        assert_eq!(args.n_bins, 256);
        assert_eq!(args.epochs_til_checkpoint, 5);
        assert!(!args.overwrite);
        assert!(args.small_data_num.is_none());
    }

    #[test]
    fn test_value_enums() {
        let args = DepthArgs::parse_from([
            "adabins",
            "--dataset",
            "nyu",
            "--exp-name",
            "run",
            "--depth-loss",
            "berhu",
            "--norm",
            "softmax",
            "--small-data-num",
            "100",
        ]);

        assert_eq!(args.depth_loss, DepthLoss::Berhu);
        assert_eq!(args.norm, BinNorm::Softmax);
        assert_eq!(args.small_data_num, Some(100));
    }
}
