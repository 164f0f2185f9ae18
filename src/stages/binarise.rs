//! Page binarization and margin wipe.
//!
//! Binarization uses integral-image local-mean thresholding: for each pixel
//! the threshold is the mean intensity of a square neighbourhood, scaled by
//! the variant's threshold factor. A factor of 0.0 is plain adaptive
//! thresholding; larger factors keep only clearly-dark pixels, trading
//! broken glyphs for less background noise. OCRing several variants and
//! keeping the most confident one per page is the whole point of the
//! pipeline.

use image::{GrayImage, Luma};

use crate::prelude::*;

/// Ink fraction below which a row or column is considered margin noise by
/// the wipe routine.
const WIPE_INK_FRACTION: f64 = 0.05;

/// Padding in pixels kept around the detected content box.
const WIPE_PADDING: u32 = 10;

/// Binarize `path` once per threshold, writing `<stem>_binT.T.png` next to
/// it. Returns the written paths in threshold order.
pub fn binarize_file(path: &Path, thresholds: &[f64]) -> Result<Vec<PathBuf>> {
    let gray = load_gray(path)?;
    let integral = integral_image(&gray);
    let mut outputs = Vec::with_capacity(thresholds.len());
    for &threshold in thresholds {
        let bin = threshold_image(&gray, &integral, threshold);
        let out = variant_path(path, threshold)?;
        bin.save(&out)
            .with_context(|| format!("failed to save {}", out.display()))?;
        outputs.push(out);
    }
    Ok(outputs)
}

/// Wipe margin noise from `path` and binarize, writing `<stem>_bin0.0.png`.
///
/// The content box is found from the binarized ink profile: rows and
/// columns whose ink fraction stays under [`WIPE_INK_FRACTION`] are treated
/// as margin and cleared to white.
pub fn wipe_file(path: &Path) -> Result<PathBuf> {
    let gray = load_gray(path)?;
    let integral = integral_image(&gray);
    let mut bin = threshold_image(&gray, &integral, 0.0);
    let (width, height) = bin.dimensions();

    let mut row_ink = vec![0u32; height as usize];
    let mut col_ink = vec![0u32; width as usize];
    for (x, y, pixel) in bin.enumerate_pixels() {
        if pixel.0[0] == 0 {
            row_ink[y as usize] += 1;
            col_ink[x as usize] += 1;
        }
    }
    let content_rows = content_span(&row_ink, width);
    let content_cols = content_span(&col_ink, height);

    if let (Some((top, bottom)), Some((left, right))) = (content_rows, content_cols) {
        let top = top.saturating_sub(WIPE_PADDING);
        let left = left.saturating_sub(WIPE_PADDING);
        let bottom = (bottom + WIPE_PADDING).min(height - 1);
        let right = (right + WIPE_PADDING).min(width - 1);
        for (x, y, pixel) in bin.enumerate_pixels_mut() {
            if y < top || y > bottom || x < left || x > right {
                *pixel = Luma([255]);
            }
        }
    }
    // No content box means a blank page; leave it as binarized.

    let out = variant_path(path, 0.0)?;
    bin.save(&out)
        .with_context(|| format!("failed to save {}", out.display()))?;
    Ok(out)
}

/// Output path for a variant of `path` at `threshold`: same stem with the
/// `_binT.T.png` suffix.
fn variant_path(path: &Path, threshold: f64) -> Result<PathBuf> {
    let stem = path
        .file_stem()
        .ok_or_else(|| anyhow!("no file stem in {}", path.display()))?
        .to_string_lossy();
    Ok(path.with_file_name(format!("{stem}_bin{threshold:.1}.png")))
}

fn load_gray(path: &Path) -> Result<GrayImage> {
    let img = image::open(path)
        .with_context(|| format!("failed to decode image {}", path.display()))?;
    Ok(img.to_luma8())
}

/// First and last index whose ink count exceeds the noise fraction of the
/// opposite dimension.
fn content_span(ink: &[u32], span: u32) -> Option<(u32, u32)> {
    let min_ink = (span as f64 * WIPE_INK_FRACTION) as u32;
    let first = ink.iter().position(|&count| count > min_ink)?;
    let last = ink.iter().rposition(|&count| count > min_ink)?;
    Some((first as u32, last as u32))
}

/// Summed-area table with a one-pixel zero border, so any window sum is
/// four lookups.
fn integral_image(gray: &GrayImage) -> Vec<Vec<u64>> {
    let (width, height) = gray.dimensions();
    let mut integral = vec![vec![0u64; width as usize + 1]; height as usize + 1];
    for y in 0..height as usize {
        let mut row_sum = 0u64;
        for x in 0..width as usize {
            row_sum += u64::from(gray.get_pixel(x as u32, y as u32).0[0]);
            integral[y + 1][x + 1] = integral[y][x + 1] + row_sum;
        }
    }
    integral
}

fn region_mean(
    integral: &[Vec<u64>],
    width: u32,
    height: u32,
    x: u32,
    y: u32,
    radius: u32,
) -> f64 {
    let x0 = x.saturating_sub(radius) as usize;
    let y0 = y.saturating_sub(radius) as usize;
    let x1 = (x + radius + 1).min(width) as usize;
    let y1 = (y + radius + 1).min(height) as usize;
    let sum = integral[y1][x1] + integral[y0][x0] - integral[y0][x1] - integral[y1][x0];
    let count = ((x1 - x0) * (y1 - y0)) as f64;
    sum as f64 / count
}

fn threshold_image(gray: &GrayImage, integral: &[Vec<u64>], threshold: f64) -> GrayImage {
    let (width, height) = gray.dimensions();
    // A window about a thirtieth of the page tracks lighting gradients
    // without being swamped by individual glyphs. The global mean is mixed
    // in so that regions of solid ink, where the local mean equals the
    // pixel value, still binarize dark.
    let radius = (width.min(height) / 30).max(16);
    let global = region_mean(integral, width, height, 0, 0, width.max(height));
    let mut out = GrayImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let local = region_mean(integral, width, height, x, y, radius);
            let cutoff = (local + global) / 2.0 * (1.0 - threshold);
            let value = if f64::from(gray.get_pixel(x, y).0[0]) < cutoff {
                0u8
            } else {
                255u8
            };
            out.put_pixel(x, y, Luma([value]));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A white page with a dark block of "text" in the middle and a small
    /// speck near the edge.
    fn test_page(dir: &Path) -> PathBuf {
        let mut img = GrayImage::from_pixel(200, 200, Luma([230u8]));
        for y in 80..120 {
            for x in 40..160 {
                img.put_pixel(x, y, Luma([20u8]));
            }
        }
        for y in 2..5 {
            for x in 2..5 {
                img.put_pixel(x, y, Luma([10u8]));
            }
        }
        let path = dir.join("page_0001.png");
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn emits_one_variant_per_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_page(dir.path());
        let outputs = binarize_file(&path, &[0.1, 0.2, 0.3]).unwrap();
        let names: Vec<String> = outputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "page_0001_bin0.1.png",
                "page_0001_bin0.2.png",
                "page_0001_bin0.3.png"
            ]
        );
        for out in &outputs {
            let bin = image::open(out).unwrap().to_luma8();
            // Center of the text block must be ink; the far corner must not.
            assert_eq!(bin.get_pixel(100, 100).0[0], 0);
            assert_eq!(bin.get_pixel(195, 195).0[0], 255);
        }
    }

    #[test]
    fn wipe_clears_margin_speck_but_keeps_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = test_page(dir.path());
        let out = wipe_file(&path).unwrap();
        assert_eq!(
            out.file_name().unwrap().to_string_lossy(),
            "page_0001_bin0.0.png"
        );
        let bin = image::open(&out).unwrap().to_luma8();
        assert_eq!(bin.get_pixel(100, 100).0[0], 0, "content kept");
        assert_eq!(bin.get_pixel(3, 3).0[0], 255, "margin speck wiped");
    }

    #[test]
    fn variant_names_match_the_pipeline_pattern() {
        let path = Path::new("/tmp/b/page_0001.jpg");
        let out = variant_path(path, 0.2).unwrap();
        assert!(
            crate::cloud::VARIANT_PATTERN.is_match(&out.to_string_lossy()),
            "{} should look like a variant",
            out.display()
        );
    }
}
