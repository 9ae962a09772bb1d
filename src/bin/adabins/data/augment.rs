use super::DepthSample;
use rand::Rng;

/// Mirrors image and depth together with probability `probability`.
pub fn augment_flip_horizontal(
    image_width: u32,
    image_height: u32,
    samples: &mut [DepthSample],
    probability: f64,
    rng: &mut impl Rng,
) {
    let width = image_width as usize;
    let height = image_height as usize;

    for sample in samples {
        if !rng.gen_bool(probability) {
            continue;
        }

        for plane in sample.image.chunks_exact_mut(width * height) {
            flip_rows(plane, width);
        }
        flip_rows(&mut sample.depth, width);
    }
}

/// Scales contrast and shifts brightness of the (normalised) image only.
pub fn augment_color_jitter(samples: &mut [DepthSample], strength: f32, rng: &mut impl Rng) {
    if strength <= 0.0 {
        return;
    }

    for sample in samples {
        let contrast: f32 = rng.gen_range(1.0 - strength..=1.0 + strength);
        let brightness: f32 = rng.gen_range(-strength..=strength);

        for value in &mut sample.image {
            *value = *value * contrast + brightness;
        }
    }
}

fn flip_rows(plane: &mut [f32], width: usize) {
    for row in plane.chunks_exact_mut(width) {
        row.reverse();
    }
}
