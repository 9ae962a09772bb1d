mod args;
mod batch;
mod data;
mod loss;
mod metrics;
mod net;
mod run;
mod scheduler;
mod summary;
mod trainer;

use args::DepthArgs;
use batch::BatchGenerator;
use clap::Parser;
use data::{load_depth_sample_set, DatasetSplit};
use log::{info, warn};
use net::{AdaptiveBinsConfig, AdaptiveBinsNet};
use rand::{rngs::StdRng, Rng, SeedableRng};
use run::RunDir;
use scheduler::OneCycleScheduler;
use tch::{
    nn::{AdamW, VarStore},
    Device,
};
use trainer::{Trainer, TrainerConfig};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let args = DepthArgs::parse();
    let mut rng = init_seed(args.seed);

    let device = if tch::Cuda::is_available() {
        info!("CUDA is available, using CUDA");
        Device::cuda_if_available()
    } else if tch::utils::has_mps() {
        info!("MPS is available, using MPS");
        Device::Mps
    } else {
        info!("no accelerator available, using CPU");
        Device::Cpu
    };

    let run = RunDir::create(args.logging_root.join(&args.exp_name), args.overwrite)?;
    info!("writing run to {}", run.root.display());

    info!("loading data...");
    let sample_set = load_depth_sample_set(&args.dataset, DatasetSplit::Train, args.small_data_num)?;
    let (train_set, val_set) = sample_set.random_split(args.val_fraction, &mut rng);
    info!(
        "{} training samples, {} validation samples",
        train_set.len(),
        val_set.len()
    );

    let mut vs = VarStore::new(device);
    let net = AdaptiveBinsNet::new(
        &vs.root(),
        AdaptiveBinsConfig {
            n_bins: args.n_bins,
            min_depth: args.min_depth,
            max_depth: args.max_depth,
            norm: args.norm,
        },
    );
    if let Some(path) = &args.resume {
        vs.load(path)?;
        info!("resumed weights from {}", path.display());
    }

    let batch_generator = BatchGenerator::new(
        device,
        args.batch_size,
        train_set,
        args.augment,
        StdRng::seed_from_u64(rng.gen()),
    )?;
    let lr_scheduler = OneCycleScheduler::new(
        vec![args.lr / 10.0, args.lr],
        args.epochs * batch_generator.batches_per_epoch,
        args.div_factor,
        args.final_div_factor,
    )?
    .with_pct_start(0.3)?
    .with_momentum(0.85, 0.95);

    let config = TrainerConfig {
        epochs: args.epochs,
        depth_loss: args.depth_loss,
        w_chamfer: args.w_chamfer,
        min_depth: args.min_depth,
        max_depth: args.max_depth,
        max_grad_norm: args.max_grad_norm,
        epochs_til_checkpoint: args.epochs_til_checkpoint,
        steps_til_summary: args.steps_til_summary,
    };
    let optimizer_config = AdamW {
        wd: args.wd,
        ..Default::default()
    };
    let mut trainer = Trainer::new(vs, net, optimizer_config, lr_scheduler, config, run)?;

    let val_set = (!val_set.is_empty()).then_some(val_set);
    let report = trainer.train(batch_generator, val_set.as_ref()).await?;
    info!(
        "finished {} steps, final epoch loss {:.4}",
        report.total_steps,
        report.epoch_losses.last().copied().unwrap_or(f64::NAN)
    );

    if args.dataset.join(DatasetSplit::Test.dir_name()).is_dir() {
        let test_set = load_depth_sample_set(&args.dataset, DatasetSplit::Test, None)?;
        match trainer.evaluate(&test_set)? {
            Some(metrics) => info!("test metrics: {metrics:?}"),
            None => warn!("test split has no valid depth"),
        }
    }

    Ok(())
}

/// Seeds every random number generator the run touches. All other randomness
/// is drawn from the returned generator.
fn init_seed(seed: u64) -> StdRng {
    info!("using random seed {seed}");
    tch::manual_seed(seed as i64);
    tch::Cuda::manual_seed_all(seed);
    StdRng::seed_from_u64(seed)
}
