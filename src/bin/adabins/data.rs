pub mod augment;

use byteorder::{BigEndian, ReadBytesExt};
use log::debug;
use rand::{seq::SliceRandom, Rng};
use std::{
    fs::{self, OpenOptions},
    io::BufReader,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub const DEPTH_MAGIC: u32 = 0x0000_0D3F;
const DEPTH_HEADER_LEN: u64 = 12;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum DepthDatasetError {
    #[error("invalid depth magic number: {0:#010x}")]
    InvalidDepthMagicNumber(u32),
    #[error("image and depth size mismatch in {path:?}: {image:?} != {depth:?}")]
    SizeMismatch {
        path: PathBuf,
        image: (u32, u32),
        depth: (u32, u32),
    },
    #[error("sample {path:?} is {actual:?}, expected {expected:?}")]
    InconsistentSampleSize {
        path: PathBuf,
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("depth payload is {actual} bytes, header declares {expected}")]
    DepthPayloadSize { expected: u64, actual: u64 },
    #[error("missing depth map for {0:?}")]
    MissingDepth(PathBuf),
    #[error("no samples found in {0:?}")]
    EmptySplit(PathBuf),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetSplit {
    Train,
    Test,
}

impl DatasetSplit {
    pub fn dir_name(self) -> &'static str {
        match self {
            DatasetSplit::Train => "train",
            DatasetSplit::Test => "test",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthMap {
    pub width: u32,
    pub height: u32,
    /// Row-major depth in metres; zero marks a missing measurement.
    pub values: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct DepthSample {
    /// CHW, normalised with the ImageNet statistics.
    pub image: Vec<f32>,
    pub depth: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct DepthSampleSet {
    pub image_width: u32,
    pub image_height: u32,
    pub samples: Vec<DepthSample>,
}

impl DepthSampleSet {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn shuffle(&mut self, rng: &mut impl Rng) {
        self.samples.shuffle(rng);
    }

    /// Randomly splits off `fraction` of the samples, returning `(rest, split_off)`.
    pub fn random_split(mut self, fraction: f64, rng: &mut impl Rng) -> (Self, Self) {
        self.shuffle(rng);

        let split_len = (self.samples.len() as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
        let split_off = self.samples.split_off(self.samples.len() - split_len);

        let other = Self {
            image_width: self.image_width,
            image_height: self.image_height,
            samples: split_off,
        };
        (self, other)
    }
}

pub fn read_depth_map(path: impl AsRef<Path>) -> Result<DepthMap, DepthDatasetError> {
    let file = OpenOptions::new().read(true).open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let magic = reader.read_u32::<BigEndian>()?;
    if magic != DEPTH_MAGIC {
        return Err(DepthDatasetError::InvalidDepthMagicNumber(magic));
    }

    let width = reader.read_u32::<BigEndian>()?;
    let height = reader.read_u32::<BigEndian>()?;
    let expected = (u64::from(width) * u64::from(height)).saturating_mul(4);
    let actual = file_len.saturating_sub(DEPTH_HEADER_LEN);
    if actual != expected {
        return Err(DepthDatasetError::DepthPayloadSize { expected, actual });
    }
    let mut values = vec![0f32; width as usize * height as usize];
    reader.read_f32_into::<BigEndian>(&mut values)?;

    Ok(DepthMap {
        width,
        height,
        values,
    })
}

/// Loads every `<name>.png` / `<name>.depth` pair under `<root>/<split>`.
///
/// Samples are visited in file-name order; `limit` keeps only the first `n`.
pub fn load_depth_sample_set(
    root: impl AsRef<Path>,
    split: DatasetSplit,
    limit: Option<usize>,
) -> Result<DepthSampleSet, DepthDatasetError> {
    let dir = root.as_ref().join(split.dir_name());

    let mut image_paths = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("png") {
            image_paths.push(path);
        }
    }
    image_paths.sort();
    if let Some(limit) = limit {
        image_paths.truncate(limit);
    }

    let mut set: Option<DepthSampleSet> = None;
    for image_path in image_paths {
        let (size, sample) = load_sample(&image_path)?;

        let set = set.get_or_insert_with(|| DepthSampleSet {
            image_width: size.0,
            image_height: size.1,
            samples: Vec::new(),
        });
        let expected = (set.image_width, set.image_height);
        if size != expected {
            return Err(DepthDatasetError::InconsistentSampleSize {
                path: image_path,
                expected,
                actual: size,
            });
        }
        set.samples.push(sample);
    }

    let set = set.ok_or(DepthDatasetError::EmptySplit(dir))?;
    debug!(
        "loaded {} {} samples ({}x{})",
        set.samples.len(),
        split.dir_name(),
        set.image_width,
        set.image_height
    );

    Ok(set)
}

fn load_sample(image_path: &Path) -> Result<((u32, u32), DepthSample), DepthDatasetError> {
    let depth_path = image_path.with_extension("depth");
    if !depth_path.is_file() {
        return Err(DepthDatasetError::MissingDepth(depth_path));
    }

    let image = image::open(image_path)?.to_rgb8();
    let depth = read_depth_map(&depth_path)?;

    let image_size = image.dimensions();
    if image_size != (depth.width, depth.height) {
        return Err(DepthDatasetError::SizeMismatch {
            path: image_path.to_path_buf(),
            image: image_size,
            depth: (depth.width, depth.height),
        });
    }

    let (width, height) = image_size;
    let pixel_count = width as usize * height as usize;
    let mut chw = vec![0f32; pixel_count * 3];
    for (index, pixel) in image.pixels().enumerate() {
        for channel in 0..3 {
            let value = pixel[channel] as f32 / 255.0;
            chw[channel * pixel_count + index] =
                (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }

    Ok((
        image_size,
        DepthSample {
            image: chw,
            depth: depth.values,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;
    use image::{Rgb, RgbImage};
    use rand::{rngs::StdRng, SeedableRng};
    use std::io::{BufWriter, Write};

    fn write_depth_map(path: impl AsRef<Path>, depth: &DepthMap) -> Result<(), DepthDatasetError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::new(file);

        writer.write_u32::<BigEndian>(DEPTH_MAGIC)?;
        writer.write_u32::<BigEndian>(depth.width)?;
        writer.write_u32::<BigEndian>(depth.height)?;
        for value in &depth.values {
            writer.write_f32::<BigEndian>(*value)?;
        }
        writer.flush()?;

        Ok(())
    }

    fn write_sample(dir: &Path, name: &str, width: u32, height: u32, depth_size: (u32, u32)) {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8 * 10, y as u8 * 10, 128]));
        image.save(dir.join(format!("{name}.png"))).unwrap();

        let depth = DepthMap {
            width: depth_size.0,
            height: depth_size.1,
            values: (0..depth_size.0 * depth_size.1).map(|v| v as f32 * 0.5).collect(),
        };
        write_depth_map(dir.join(format!("{name}.depth")), &depth).unwrap();
    }

    #[test]
    fn test_depth_map_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.depth");
        let depth = DepthMap {
            width: 3,
            height: 2,
            values: vec![0.0, 1.5, 2.0, 0.0, 4.25, 9.0],
        };

        write_depth_map(&path, &depth).unwrap();
        let bytes = fs::read(&path).unwrap();

        assert_eq!(bytes.len(), 12 + 6 * 4);
        assert_eq!(&bytes[..4], &DEPTH_MAGIC.to_be_bytes());
        assert_eq!(read_depth_map(&path).unwrap(), depth);
    }

    #[test]
    fn test_read_depth_map_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.depth");
        fs::write(&path, [0u8, 0, 8, 3, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 0]).unwrap();

        let err = read_depth_map(&path).unwrap_err();

        assert!(matches!(err, DepthDatasetError::InvalidDepthMagicNumber(0x0803)));
    }

    #[test]
    fn test_read_depth_map_checks_payload_before_allocating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.depth");
        let mut bytes = DEPTH_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&1.0f32.to_be_bytes());
        fs::write(&path, bytes).unwrap();

        let err = read_depth_map(&path).unwrap_err();

        assert!(matches!(
            err,
            DepthDatasetError::DepthPayloadSize {
                expected: u64::MAX,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_read_depth_map_rejects_trailing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.depth");
        let mut bytes = DEPTH_MAGIC.to_be_bytes().to_vec();
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        fs::write(&path, bytes).unwrap();

        let err = read_depth_map(&path).unwrap_err();

        assert!(matches!(
            err,
            DepthDatasetError::DepthPayloadSize {
                expected: 4,
                actual: 8
            }
        ));
    }

    #[test]
    fn test_load_depth_sample_set() {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        fs::create_dir(&train).unwrap();
        write_sample(&train, "a", 4, 3, (4, 3));
        write_sample(&train, "b", 4, 3, (4, 3));
        write_sample(&train, "c", 4, 3, (4, 3));

        let set = load_depth_sample_set(root.path(), DatasetSplit::Train, None).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!((set.image_width, set.image_height), (4, 3));
        assert_eq!(set.samples[0].image.len(), 4 * 3 * 3);
        assert_eq!(set.samples[0].depth[5], 2.5);
        // blue channel is constant 128 across the image
        let blue = (128.0 / 255.0 - IMAGENET_MEAN[2]) / IMAGENET_STD[2];
        assert!((set.samples[0].image[2 * 12] - blue).abs() < 1e-6);

        let limited = load_depth_sample_set(root.path(), DatasetSplit::Train, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_load_depth_sample_set_errors() {
        let root = tempfile::tempdir().unwrap();
        let train = root.path().join("train");
        fs::create_dir(&train).unwrap();
        write_sample(&train, "a", 4, 3, (3, 4));

        let err = load_depth_sample_set(root.path(), DatasetSplit::Train, None).unwrap_err();
        assert!(matches!(err, DepthDatasetError::SizeMismatch { .. }));

        fs::remove_file(train.join("a.depth")).unwrap();
        let err = load_depth_sample_set(root.path(), DatasetSplit::Train, None).unwrap_err();
        assert!(matches!(err, DepthDatasetError::MissingDepth(_)));

        let test = root.path().join("test");
        fs::create_dir(&test).unwrap();
        let err = load_depth_sample_set(root.path(), DatasetSplit::Test, None).unwrap_err();
        assert!(matches!(err, DepthDatasetError::EmptySplit(_)));
    }

    #[test]
    fn test_random_split_is_seeded() {
        let set = DepthSampleSet {
            image_width: 1,
            image_height: 1,
            samples: (0..20)
                .map(|i| DepthSample {
                    image: vec![i as f32; 3],
                    depth: vec![i as f32],
                })
                .collect(),
        };

        let (train, val) = set.clone().random_split(0.1, &mut StdRng::seed_from_u64(7));
        let (train_again, val_again) = set.random_split(0.1, &mut StdRng::seed_from_u64(7));

        assert_eq!(train.len(), 18);
        assert_eq!(val.len(), 2);
        let depths = |set: &DepthSampleSet| set.samples.iter().map(|s| s.depth[0]).collect::<Vec<_>>();
        assert_eq!(depths(&train), depths(&train_again));
        assert_eq!(depths(&val), depths(&val_again));
    }
}
