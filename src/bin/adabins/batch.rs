use crate::data::{
    augment::{augment_color_jitter, augment_flip_horizontal},
    DepthSample, DepthSampleSet,
};
use log::error;
use rand::rngs::StdRng;
use std::time::Duration;
use tch::{Device, Tensor};
use thiserror::Error;
use tokio::sync::mpsc::{Receiver, Sender};

const FLIP_PROBABILITY: f64 = 0.5;
const COLOR_JITTER_STRENGTH: f32 = 0.1;

#[derive(Error, Debug)]
pub enum BatchGeneratorError {
    #[error("invalid batch size: {0}")]
    InvalidBatchSize(usize),
    #[error("sample set is empty")]
    EmptySampleSet,
    #[error("channel closed unexpectedly")]
    ChannelClosed,
}

#[derive(Debug)]
pub struct BatchGenerator {
    pub rx: Receiver<Option<Batch>>,
    pub tx_stop: Option<tokio::sync::oneshot::Sender<()>>,
    pub batches_per_epoch: usize,
}

#[derive(Debug)]
pub struct Batch {
    pub size: usize,
    /// (N, 3, H, W)
    pub images: Tensor,
    /// (N, 1, H, W), metres
    pub depths: Tensor,
}

impl BatchGenerator {
    pub fn new(
        device: Device,
        batch_size: usize,
        sample_set: DepthSampleSet,
        augment: bool,
        rng: StdRng,
    ) -> Result<Self, BatchGeneratorError> {
        if batch_size == 0 {
            return Err(BatchGeneratorError::InvalidBatchSize(batch_size));
        }

        if sample_set.is_empty() {
            return Err(BatchGeneratorError::EmptySampleSet);
        }

        let batches_per_epoch = sample_set.len().div_ceil(batch_size);
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let (tx_stop, rx_stop) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            batch_generator_loop(device, batch_size, sample_set, augment, rng, tx, rx_stop).await;
        });

        Ok(Self {
            rx,
            tx_stop: Some(tx_stop),
            batches_per_epoch,
        })
    }

    /// Returns the next batch in the generator.
    ///
    /// `None` marks the end of an epoch; the following call starts the next
    /// one on a reshuffled sample set.
    pub async fn next(&mut self) -> Result<Option<Batch>, BatchGeneratorError> {
        self.rx
            .recv()
            .await
            .ok_or(BatchGeneratorError::ChannelClosed)
    }
}

impl Drop for BatchGenerator {
    fn drop(&mut self) {
        if let Some(tx) = self.tx_stop.take() {
            let _ = tx.send(());
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

async fn batch_generator_loop(
    device: Device,
    batch_size: usize,
    mut sample_set: DepthSampleSet,
    augment: bool,
    mut rng: StdRng,
    tx: Sender<Option<Batch>>,
    mut rx_stop: tokio::sync::oneshot::Receiver<()>,
) {
    sample_set.shuffle(&mut rng);
    let mut index = 0;

    loop {
        let batch = prepare_batch(device, batch_size, &mut index, &mut sample_set, augment, &mut rng);
        tokio::select! {
            result = tx.send(batch) => {
                if let Err(err) = result {
                    error!("error sending batch: {err:#?}");
                    break;
                }
            }
            _ = &mut rx_stop => {
                break;
            }
        }
    }
}

fn prepare_batch(
    device: Device,
    batch_size: usize,
    index: &mut usize,
    sample_set: &mut DepthSampleSet,
    augment: bool,
    rng: &mut StdRng,
) -> Option<Batch> {
    if sample_set.len() <= *index {
        *index = 0;
        sample_set.shuffle(rng);
        return None;
    }

    let batch_size = batch_size.min(sample_set.len() - *index);
    let samples = &sample_set.samples[*index..*index + batch_size];
    *index += batch_size;

    if !augment {
        return Some(make_batch(
            device,
            sample_set.image_width,
            sample_set.image_height,
            samples,
        ));
    }

    let mut samples = samples.to_vec();
    augment_flip_horizontal(
        sample_set.image_width,
        sample_set.image_height,
        &mut samples,
        FLIP_PROBABILITY,
        rng,
    );
    augment_color_jitter(&mut samples, COLOR_JITTER_STRENGTH, rng);

    Some(make_batch(
        device,
        sample_set.image_width,
        sample_set.image_height,
        &samples,
    ))
}

pub fn make_batch(
    device: Device,
    image_width: u32,
    image_height: u32,
    samples: &[DepthSample],
) -> Batch {
    let pixel_count = image_width as usize * image_height as usize;
    let mut image_data = Vec::<f32>::with_capacity(samples.len() * pixel_count * 3);
    let mut depth_data = Vec::<f32>::with_capacity(samples.len() * pixel_count);

    for sample in samples {
        image_data.extend(sample.image.iter());
        depth_data.extend(sample.depth.iter());
    }

    let image_tensor = Tensor::from_slice(&image_data)
        .reshape([
            samples.len() as i64,
            3,
            image_height as i64,
            image_width as i64,
        ])
        .to_device(device);
    let depth_tensor = Tensor::from_slice(&depth_data)
        .reshape([
            samples.len() as i64,
            1,
            image_height as i64,
            image_width as i64,
        ])
        .to_device(device);

    Batch {
        size: samples.len(),
        images: image_tensor,
        depths: depth_tensor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn sample_set(count: usize) -> DepthSampleSet {
        DepthSampleSet {
            image_width: 3,
            image_height: 2,
            samples: (0..count)
                .map(|i| DepthSample {
                    image: vec![i as f32; 18],
                    depth: vec![i as f32 + 1.0; 6],
                })
                .collect(),
        }
    }

    #[test]
    fn test_make_batch_shapes() {
        let set = sample_set(2);
        let batch = make_batch(Device::Cpu, 3, 2, &set.samples);

        assert_eq!(batch.size, 2);
        assert_eq!(batch.images.size(), vec![2, 3, 2, 3]);
        assert_eq!(batch.depths.size(), vec![2, 1, 2, 3]);
        assert_eq!(batch.depths.double_value(&[1, 0, 1, 2]), 2.0);
    }

    #[tokio::test]
    async fn test_generator_epoch_boundaries() {
        let mut generator = BatchGenerator::new(
            Device::Cpu,
            2,
            sample_set(5),
            false,
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        assert_eq!(generator.batches_per_epoch, 3);

        for _ in 0..2 {
            let mut sizes = Vec::new();
            while let Some(batch) = generator.next().await.unwrap() {
                sizes.push(batch.size);
            }
            assert_eq!(sizes, vec![2, 2, 1]);
        }
    }

    #[tokio::test]
    async fn test_generator_rejects_bad_input() {
        let rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            BatchGenerator::new(Device::Cpu, 0, sample_set(2), false, rng.clone()),
            Err(BatchGeneratorError::InvalidBatchSize(0))
        ));
        assert!(matches!(
            BatchGenerator::new(Device::Cpu, 2, sample_set(0), false, rng),
            Err(BatchGeneratorError::EmptySampleSet)
        ));
    }
}
