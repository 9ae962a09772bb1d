use crate::{
    batch::{make_batch, Batch, BatchGenerator, BatchGeneratorError},
    data::DepthSampleSet,
    loss::{bins_chamfer_loss, DepthLoss, LossError, LossOptions},
    metrics::{DepthMetrics, MetricsAverage},
    net::{AdaptiveBinsNet, DECODER_GROUP},
    run::RunDir,
    scheduler::OneCycleScheduler,
    summary::{SummaryError, SummaryWriter},
};
use log::{debug, info, warn};
use std::time::Instant;
use tch::{
    nn::{Optimizer, OptimizerConfig, VarStore},
    Device, TchError,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("tch error: {0:?}")]
    Tch(#[from] TchError),
    #[error("batch generator error: {0:?}")]
    BatchGenerator(#[from] BatchGeneratorError),
    #[error("loss error: {0}")]
    Loss(#[from] LossError),
    #[error("summary error: {0}")]
    Summary(#[from] SummaryError),
}

#[derive(Debug, Clone, Copy)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub depth_loss: DepthLoss,
    pub w_chamfer: f64,
    pub min_depth: f64,
    pub max_depth: f64,
    pub max_grad_norm: f64,
    /// Zero disables per-epoch checkpoints.
    pub epochs_til_checkpoint: usize,
    /// Zero disables step summaries and `model_current` checkpoints.
    pub steps_til_summary: usize,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub total_steps: usize,
    pub epoch_losses: Vec<f64>,
    pub val_metrics: Option<DepthMetrics>,
}

#[derive(Debug)]
pub struct Trainer {
    device: Device,
    vs: VarStore,
    net: AdaptiveBinsNet,
    optimizer: Optimizer,
    lr_scheduler: OneCycleScheduler,
    config: TrainerConfig,
    run: RunDir,
    summary: SummaryWriter,
}

impl Trainer {
    pub fn new(
        vs: VarStore,
        net: AdaptiveBinsNet,
        optimizer_config: impl OptimizerConfig,
        lr_scheduler: OneCycleScheduler,
        config: TrainerConfig,
        run: RunDir,
    ) -> Result<Self, TrainerError> {
        let mut optimizer = optimizer_config.build(&vs, lr_scheduler.lrs()[DECODER_GROUP])?;
        lr_scheduler.apply(&mut optimizer);
        let summary = SummaryWriter::new(&run.summaries)?;

        Ok(Self {
            device: vs.device(),
            vs,
            net,
            optimizer,
            lr_scheduler,
            config,
            run,
            summary,
        })
    }

    pub async fn train(
        &mut self,
        mut batch_generator: BatchGenerator,
        val_set: Option<&DepthSampleSet>,
    ) -> Result<TrainingReport, TrainerError> {
        let epochs = self.config.epochs;
        let steps_per_epoch = batch_generator.batches_per_epoch;
        let mut total_steps = 0;
        let mut epoch_losses = Vec::with_capacity(epochs);
        let mut val_metrics = None;

        for epoch in 0..epochs {
            info!("============= epoch {}/{} =============", epoch + 1, epochs);

            if is_due(epoch, self.config.epochs_til_checkpoint) && epoch != 0 {
                let path = self.run.epoch_checkpoint(epoch);
                self.vs.save(&path)?;
                info!("saved checkpoint {}", path.display());
            }

            let mut losses = Vec::with_capacity(steps_per_epoch);
            let mut step = 0;
            while let Some(batch) = batch_generator.next().await? {
                let start = Instant::now();
                let loss = self.train_step(&batch)?;
                if let Some(loss) = loss {
                    losses.push(loss);
                }

                if is_due(total_steps, self.config.steps_til_summary) {
                    let loss = loss.unwrap_or(f64::NAN);
                    info!(
                        "epoch [{}/{}], step [{}/{}], loss: {:.4}, iteration time {:.6} sec",
                        epoch,
                        epochs,
                        step,
                        steps_per_epoch,
                        loss,
                        start.elapsed().as_secs_f64()
                    );
                    self.vs.save(self.run.current_checkpoint())?;
                    self.summary.add_scalar("step_train_loss", loss, total_steps)?;
                    self.summary.add_scalar(
                        "lr",
                        self.lr_scheduler.lrs()[DECODER_GROUP],
                        total_steps,
                    )?;
                }

                step += 1;
                total_steps += 1;
            }

            let epoch_loss = mean(&losses);
            epoch_losses.push(epoch_loss);
            self.summary.add_scalar("epoch_train_loss", epoch_loss, epoch)?;
            info!("epoch train loss: {:.4}", epoch_loss);

            if let Some(val_set) = val_set {
                val_metrics = self.evaluate(val_set)?;
                if let Some(metrics) = &val_metrics {
                    for (name, value) in metrics.entries() {
                        self.summary.add_scalar(&format!("val_{name}"), value, epoch)?;
                    }
                    info!(
                        "validation: a1 {:.4}, abs_rel {:.4}, rmse {:.4}, silog {:.4}",
                        metrics.a1, metrics.abs_rel, metrics.rmse, metrics.silog
                    );
                }
            }

            self.summary.flush()?;
        }

        let path = self.run.final_checkpoint();
        self.vs.save(&path)?;
        info!("saved final checkpoint {}", path.display());

        Ok(TrainingReport {
            total_steps,
            epoch_losses,
            val_metrics,
        })
    }

    /// Runs one optimisation step and returns the combined loss, or `None`
    /// when the batch had nothing to learn from.
    fn train_step(&mut self, batch: &Batch) -> Result<Option<f64>, TrainerError> {
        let (bins, prediction) = self.net.forward_t(&batch.images, true);
        let mask = batch.depths.gt(self.config.min_depth);

        let depth_loss = self.config.depth_loss.compute(
            &prediction,
            &batch.depths,
            LossOptions::new().mask(&mask),
        );
        let bins_loss = bins_chamfer_loss(&bins, &batch.depths);
        let (depth_loss, bins_loss) = match (depth_loss, bins_loss) {
            (Ok(depth_loss), Ok(bins_loss)) => (depth_loss, bins_loss),
            (Err(LossError::EmptySelection), _) | (_, Err(LossError::EmptySelection)) => {
                warn!("batch of {} has no valid depth, skipping", batch.size);
                self.advance_schedule();
                return Ok(None);
            }
            (Err(err), _) | (_, Err(err)) => return Err(err.into()),
        };

        let loss = depth_loss + bins_loss * self.config.w_chamfer;
        let value = f64::try_from(&loss)?;
        if !value.is_finite() {
            warn!("non-finite loss {value}, skipping optimizer step");
            self.optimizer.zero_grad();
            self.advance_schedule();
            return Ok(None);
        }

        self.optimizer
            .backward_step_clip_norm(&loss, self.config.max_grad_norm);
        self.advance_schedule();
        debug!("step loss {value:.6}");

        Ok(Some(value))
    }

    fn advance_schedule(&mut self) {
        self.lr_scheduler.step();
        self.lr_scheduler.apply(&mut self.optimizer);
    }

    /// Averages depth metrics over `sample_set`, one sample at a time.
    pub fn evaluate(
        &self,
        sample_set: &DepthSampleSet,
    ) -> Result<Option<DepthMetrics>, TrainerError> {
        let mut average = MetricsAverage::default();

        for sample in &sample_set.samples {
            let batch = make_batch(
                self.device,
                sample_set.image_width,
                sample_set.image_height,
                std::slice::from_ref(sample),
            );
            let (_, prediction) = tch::no_grad(|| self.net.forward_t(&batch.images, false));

            match DepthMetrics::compute(
                &prediction,
                &batch.depths,
                self.config.min_depth,
                self.config.max_depth,
            ) {
                Ok(metrics) => average.add(&metrics),
                Err(LossError::EmptySelection) => continue,
                Err(err) => return Err(err.into()),
            }
        }

        debug!("evaluated {} samples", average.count());
        Ok(average.mean())
    }
}

fn is_due(counter: usize, every: usize) -> bool {
    every != 0 && (counter + 1) % every == 0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::DepthSample,
        net::{AdaptiveBinsConfig, BinNorm},
        summary::SCALARS_FILE,
    };
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use tch::nn::AdamW;

    fn synthetic_set(count: usize, rng: &mut StdRng) -> DepthSampleSet {
        let (width, height) = (16, 16);
        DepthSampleSet {
            image_width: width,
            image_height: height,
            samples: (0..count)
                .map(|_| DepthSample {
                    image: (0..3 * width * height).map(|_| rng.gen_range(-1.0..1.0)).collect(),
                    depth: (0..width * height)
                        .map(|i| if i % 7 == 0 { 0.0 } else { rng.gen_range(0.5..9.0) })
                        .collect(),
                })
                .collect(),
        }
    }

    fn trainer(run: RunDir, epochs: usize, steps: usize) -> Trainer {
        tch::manual_seed(0);
        let vs = VarStore::new(Device::Cpu);
        let net = AdaptiveBinsNet::new(
            &vs.root(),
            AdaptiveBinsConfig {
                n_bins: 8,
                min_depth: 1e-3,
                max_depth: 10.0,
                norm: BinNorm::Linear,
            },
        );
        let scheduler = OneCycleScheduler::new(vec![1e-4, 1e-3], steps, 25.0, 100.0).unwrap();
        let config = TrainerConfig {
            epochs,
            depth_loss: DepthLoss::Silog,
            w_chamfer: 0.1,
            min_depth: 1e-3,
            max_depth: 10.0,
            max_grad_norm: 0.1,
            epochs_til_checkpoint: 2,
            steps_til_summary: 1,
        };

        Trainer::new(vs, net, AdamW::default(), scheduler, config, run).unwrap()
    }

    #[tokio::test]
    async fn test_train_writes_checkpoints_and_summaries() {
        let mut rng = StdRng::seed_from_u64(0);
        let train_set = synthetic_set(4, &mut rng);
        let val_set = synthetic_set(2, &mut rng);
        let logs = tempfile::tempdir().unwrap();
        let run = RunDir::create(logs.path().join("exp"), false).unwrap();

        let mut trainer = trainer(run.clone(), 2, 4);
        let generator =
            BatchGenerator::new(Device::Cpu, 2, train_set, true, StdRng::seed_from_u64(1)).unwrap();
        let report = trainer.train(generator, Some(&val_set)).await.unwrap();

        assert_eq!(report.total_steps, 4);
        assert_eq!(report.epoch_losses.len(), 2);
        assert!(report.epoch_losses.iter().all(|loss| loss.is_finite()));
        let metrics = report.val_metrics.unwrap();
        assert!((0.0..=1.0).contains(&metrics.a1));

        assert!(run.current_checkpoint().is_file());
        assert!(run.epoch_checkpoint(1).is_file());
        assert!(run.final_checkpoint().is_file());

        let scalars = std::fs::read_to_string(run.summaries.join(SCALARS_FILE)).unwrap();
        assert_eq!(scalars.matches("\"step_train_loss\"").count(), 4);
        assert_eq!(scalars.matches("\"epoch_train_loss\"").count(), 2);
        assert!(scalars.contains("\"val_rmse\""));
    }

    #[tokio::test]
    async fn test_batches_without_valid_depth_are_skipped() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut train_set = synthetic_set(2, &mut rng);
        for sample in &mut train_set.samples {
            sample.depth.iter_mut().for_each(|depth| *depth = 0.0);
        }
        let logs = tempfile::tempdir().unwrap();
        let run = RunDir::create(logs.path().join("exp"), false).unwrap();

        let mut trainer = trainer(run, 1, 1);
        let generator =
            BatchGenerator::new(Device::Cpu, 2, train_set, false, StdRng::seed_from_u64(1)).unwrap();
        let report = trainer.train(generator, None).await.unwrap();

        assert_eq!(report.total_steps, 1);
        assert!(report.epoch_losses[0].is_nan());
    }

    #[test]
    fn test_is_due() {
        assert!(!is_due(0, 0));
        assert!(is_due(4, 5));
        assert!(!is_due(5, 5));
        assert!(is_due(0, 1));
    }
}
