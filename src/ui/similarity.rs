//! Screenshot-similarity comparator (spec.md §4.6.4a method 3): the third
//! and last hybrid state-validation method, used only when UI-element-count
//! and activity matching (methods 1-2) don't already decide the question.
//! Learned from `examples/other_examples` image-diffing idiom: decode with
//! `image`, reduce to a small per-channel histogram, and compare — cheap
//! relative to per-pixel diffing and tolerant of minor rendering noise.

use image::{DynamicImage, GenericImageView};

const BUCKETS: usize = 16;

type Histogram = [[f64; BUCKETS]; 3];

fn histogram(img: &DynamicImage) -> Histogram {
    let mut hist: Histogram = [[0.0; BUCKETS]; 3];
    let (w, h) = img.dimensions();
    let total = (w as u64 * h as u64).max(1) as f64;
    for (_, _, pixel) in img.to_rgb8().enumerate_pixels() {
        for c in 0..3 {
            let bucket = ((pixel[c] as usize) * BUCKETS / 256).min(BUCKETS - 1);
            hist[c][bucket] += 1.0;
        }
    }
    for channel in hist.iter_mut() {
        for bucket in channel.iter_mut() {
            *bucket /= total;
        }
    }
    hist
}

/// A histogram built directly from raw bytes when they can't be decoded as
/// an image at all, so the RMS fallback still has something to compare
/// against instead of failing the whole validation outright.
fn raw_byte_histogram(bytes: &[u8]) -> Histogram {
    let mut h = [0.0f64; BUCKETS];
    let total = bytes.len().max(1) as f64;
    for &b in bytes {
        let bucket = ((b as usize) * BUCKETS / 256).min(BUCKETS - 1);
        h[bucket] += 1.0;
    }
    for bucket in h.iter_mut() {
        *bucket /= total;
    }
    [h, h, h]
}

fn pearson_correlation(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return if (mean_a - mean_b).abs() <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

fn rms_similarity(a: &Histogram, b: &Histogram) -> f64 {
    let mut sum_sq = 0.0;
    let mut n = 0usize;
    for c in 0..3 {
        for i in 0..BUCKETS {
            let d = a[c][i] - b[c][i];
            sum_sq += d * d;
            n += 1;
        }
    }
    (1.0 - (sum_sq / n as f64).sqrt().min(1.0)).max(0.0)
}

fn flatten(h: &Histogram) -> Vec<f64> {
    h.iter().flatten().copied().collect()
}

/// Returns a similarity score in `[0, 1]`, or `None` when `current_png`
/// itself can't be decoded (no signal to compare at all). When the
/// reference decodes too, similarity is histogram-correlation-based;
/// otherwise falls back to an RMS distance over byte-level histograms.
pub fn screenshot_similarity(current_png: &[u8], reference_png: &[u8]) -> Option<f64> {
    let current = image::load_from_memory(current_png).ok()?;
    let current_hist = histogram(&current);

    match image::load_from_memory(reference_png) {
        Ok(reference) => {
            let reference_hist = histogram(&reference);
            let corr = pearson_correlation(&flatten(&current_hist), &flatten(&reference_hist));
            Some(((corr + 1.0) / 2.0).clamp(0.0, 1.0))
        }
        Err(_) => {
            let reference_hist = raw_byte_histogram(reference_png);
            Some(rms_similarity(&current_hist, &reference_hist))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_png(rgb: [u8; 3]) -> Vec<u8> {
        let mut img = image::RgbImage::new(8, 8);
        for pixel in img.pixels_mut() {
            *pixel = image::Rgb(rgb);
        }
        let mut out = Vec::new();
        image::DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png).unwrap();
        out
    }

    #[test]
    fn identical_images_score_near_one() {
        let a = solid_png([200, 100, 50]);
        let score = screenshot_similarity(&a, &a).unwrap();
        assert!(score > 0.99, "expected near-1.0 similarity, got {score}");
    }

    #[test]
    fn starkly_different_images_score_low() {
        let a = solid_png([255, 255, 255]);
        let b = solid_png([0, 0, 0]);
        let score = screenshot_similarity(&a, &b).unwrap();
        assert!(score < 0.5, "expected low similarity, got {score}");
    }

    #[test]
    fn undecodable_reference_falls_back_to_rms_instead_of_failing() {
        let a = solid_png([10, 20, 30]);
        let garbage = vec![1u8, 2, 3, 4, 5];
        let score = screenshot_similarity(&a, &garbage);
        assert!(score.is_some());
    }

    #[test]
    fn undecodable_current_returns_none() {
        let garbage = vec![9u8, 9, 9];
        let reference = solid_png([1, 2, 3]);
        assert!(screenshot_similarity(&garbage, &reference).is_none());
    }
}
