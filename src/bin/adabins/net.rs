use clap::ValueEnum;
use tch::{
    nn::{batch_norm2d, conv2d, linear, BatchNorm, Conv2D, ConvConfig, Linear, ModuleT, Path},
    Kind, Tensor,
};

/// Optimizer group for the encoder, trained at a tenth of the base learning rate.
pub const ENCODER_GROUP: usize = 0;
/// Optimizer group for the decoder and the bins head.
pub const DECODER_GROUP: usize = 1;

const LINEAR_NORM_EPS: f64 = 0.1;

/// How raw bin-width logits become a partition of the depth range.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinNorm {
    Linear,
    Softmax,
    Sigmoid,
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveBinsConfig {
    pub n_bins: i64,
    pub min_depth: f64,
    pub max_depth: f64,
    pub norm: BinNorm,
}

#[derive(Debug)]
struct ConvBlock {
    conv1: Conv2D,
    bn1: BatchNorm,
    conv2: Conv2D,
    bn2: BatchNorm,
}

impl ConvBlock {
    fn new(vs: &Path, in_channels: i64, out_channels: i64) -> Self {
        let config = ConvConfig {
            padding: 1,
            ..Default::default()
        };
        Self {
            conv1: conv2d(vs / "conv1", in_channels, out_channels, 3, config),
            bn1: batch_norm2d(vs / "bn1", out_channels, Default::default()),
            conv2: conv2d(vs / "conv2", out_channels, out_channels, 3, config),
            bn2: batch_norm2d(vs / "bn2", out_channels, Default::default()),
        }
    }
}

impl ModuleT for ConvBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        xs.apply(&self.conv1)
            .apply_t(&self.bn1, train)
            .relu()
            .apply(&self.conv2)
            .apply_t(&self.bn2, train)
            .relu()
    }
}

/// A small U-Net whose decoder output feeds an adaptive-bins head.
///
/// The forward pass returns `(bin_centers, depth)` where `bin_centers` is
/// `(N, n_bins)` and `depth` is `(N, 1, H / 2, W / 2)`.
#[derive(Debug)]
pub struct AdaptiveBinsNet {
    config: AdaptiveBinsConfig,
    enc1: ConvBlock,
    enc2: ConvBlock,
    enc3: ConvBlock,
    enc4: ConvBlock,
    dec3: ConvBlock,
    dec2: ConvBlock,
    widths_fc1: Linear,
    widths_fc2: Linear,
    range_attention: Conv2D,
}

impl AdaptiveBinsNet {
    pub fn new(vs: &Path, config: AdaptiveBinsConfig) -> Self {
        let encoder = (vs / "encoder").set_group(ENCODER_GROUP);
        let decoder = (vs / "decoder").set_group(DECODER_GROUP);

        Self {
            config,
            enc1: ConvBlock::new(&(&encoder / "enc1"), 3, 32),
            enc2: ConvBlock::new(&(&encoder / "enc2"), 32, 64),
            enc3: ConvBlock::new(&(&encoder / "enc3"), 64, 128),
            enc4: ConvBlock::new(&(&encoder / "enc4"), 128, 256),
            dec3: ConvBlock::new(&(&decoder / "dec3"), 256 + 128, 128),
            dec2: ConvBlock::new(&(&decoder / "dec2"), 128 + 64, 64),
            widths_fc1: linear(&decoder / "widths_fc1", 64, 128, Default::default()),
            widths_fc2: linear(&decoder / "widths_fc2", 128, config.n_bins, Default::default()),
            range_attention: conv2d(
                &decoder / "range_attention",
                64,
                config.n_bins,
                1,
                Default::default(),
            ),
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> (Tensor, Tensor) {
        let e1 = xs.apply_t(&self.enc1, train);
        let e2 = e1.max_pool2d_default(2).apply_t(&self.enc2, train);
        let e3 = e2.max_pool2d_default(2).apply_t(&self.enc3, train);
        let e4 = e3.max_pool2d_default(2).apply_t(&self.enc4, train);

        let d3 = Tensor::cat(&[upsample_like(&e4, &e3), e3], 1).apply_t(&self.dec3, train);
        let features = Tensor::cat(&[upsample_like(&d3, &e2), e2], 1).apply_t(&self.dec2, train);

        let batch = features.size()[0];
        let widths = features
            .adaptive_avg_pool2d([1, 1])
            .view([batch, -1])
            .apply(&self.widths_fc1)
            .relu()
            .apply(&self.widths_fc2);
        let centers = self.bin_centers(&widths);

        // (N, bins, h, w) -> (N, h, w, bins) x (N, 1, bins, 1) -> (N, 1, h, w)
        let attention = features.apply(&self.range_attention).softmax(1, Kind::Float);
        let depth = attention
            .permute([0, 2, 3, 1])
            .matmul(&centers.view([batch, 1, self.config.n_bins, 1]))
            .permute([0, 3, 1, 2]);

        (centers, depth)
    }

    fn bin_centers(&self, widths: &Tensor) -> Tensor {
        let widths = match self.config.norm {
            BinNorm::Linear => normalize(&(widths.relu() + LINEAR_NORM_EPS)),
            BinNorm::Softmax => widths.softmax(1, Kind::Float),
            BinNorm::Sigmoid => normalize(&widths.sigmoid()),
        };
        let widths = widths * (self.config.max_depth - self.config.min_depth);

        let batch = widths.size()[0];
        let start = Tensor::full(
            [batch, 1],
            self.config.min_depth,
            (widths.kind(), widths.device()),
        );
        let edges = Tensor::cat(&[start, widths], 1).cumsum(1, Kind::Float);

        let n_bins = self.config.n_bins;
        (edges.narrow(1, 0, n_bins) + edges.narrow(1, 1, n_bins)) * 0.5
    }
}

fn normalize(xs: &Tensor) -> Tensor {
    xs / xs.sum_dim_intlist(1, true, Kind::Float)
}

fn upsample_like(xs: &Tensor, reference: &Tensor) -> Tensor {
    let size = reference.size();
    xs.upsample_bilinear2d(&size[2..], true, None::<f64>, None::<f64>)
}
