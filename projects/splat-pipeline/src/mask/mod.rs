//! Prompted background removal.
//!
//! Each image goes through an open-vocabulary [`Detector`] and, when something
//! was found, a box-prompted [`Segmenter`]. Pixels outside the union of the
//! returned masks are set to black; images without detections become fully
//! black. No check is made that detections actually match the prompt.

pub mod usls_models;

use crate::video::sampler::write_jpeg;
use crate::workspace::list_images;
use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::{GrayImage, Luma, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::{Path, PathBuf};

/// Axis-aligned box in pixel coordinates of the source image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxPrompt {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub confidence: f32,
}

pub trait Detector {
    /// Boxes for the configured prompt, already filtered by confidence.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoxPrompt>>;
}

pub trait Segmenter {
    /// One mask per box; non-zero pixels are foreground.
    fn segment(&mut self, image: &RgbImage, boxes: &[BoxPrompt]) -> Result<Vec<GrayImage>>;
}

/// Logical OR of `masks` at `width`x`height`, resizing any mask of a different size.
pub fn union_masks(width: u32, height: u32, masks: &[GrayImage]) -> GrayImage {
    let mut combined = GrayImage::new(width, height);
    for mask in masks {
        let resized;
        let mask = if mask.dimensions() == (width, height) {
            mask
        } else {
            resized = image::imageops::resize(mask, width, height, FilterType::Nearest);
            &resized
        };

        for (dst, src) in combined.pixels_mut().zip(mask.pixels()) {
            if src[0] > 0 {
                *dst = Luma([255]);
            }
        }
    }
    combined
}

/// Zero every pixel of `image` whose mask value is zero.
pub fn apply_mask(image: &mut RgbImage, mask: &GrayImage) {
    for (pixel, m) in image.pixels_mut().zip(mask.pixels()) {
        if m[0] == 0 {
            pixel.0 = [0, 0, 0];
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOutcome {
    NoDetections,
    Masked { boxes: usize },
}

pub fn mask_image<D, S>(
    mut image: RgbImage,
    detector: &mut D,
    segmenter: &mut S,
) -> Result<(RgbImage, MaskOutcome)>
where
    D: Detector + ?Sized,
    S: Segmenter + ?Sized,
{
    let (width, height) = image.dimensions();
    let boxes = detector.detect(&image)?;
    if boxes.is_empty() {
        return Ok((RgbImage::new(width, height), MaskOutcome::NoDetections));
    }

    let masks = segmenter.segment(&image, &boxes)?;
    let combined = union_masks(width, height, &masks);
    apply_mask(&mut image, &combined);
    Ok((image, MaskOutcome::Masked { boxes: boxes.len() }))
}

fn save_image(path: &Path, image: &RgbImage) -> Result<()> {
    let is_jpeg = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| matches!(s.to_lowercase().as_str(), "jpg" | "jpeg"))
        .unwrap_or(false);

    if is_jpeg {
        write_jpeg(path, image)?;
    } else {
        image
            .save(path)
            .with_context(|| format!("Failed to write {:?}", path))?;
    }
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaskReport {
    pub total: usize,
    pub masked: usize,
    pub blank: usize,
    pub failed: Vec<PathBuf>,
}

fn process_file<D, S>(
    file: &Path,
    output_dir: &Path,
    detector: &mut D,
    segmenter: &mut S,
) -> Result<MaskOutcome>
where
    D: Detector + ?Sized,
    S: Segmenter + ?Sized,
{
    let image = image::open(file)
        .with_context(|| format!("Failed to read {:?}", file))?
        .to_rgb8();
    let (masked, outcome) = mask_image(image, detector, segmenter)?;

    let name = file
        .file_name()
        .ok_or_else(|| anyhow!("Invalid image path: {:?}", file))?;
    save_image(&output_dir.join(name), &masked)?;
    Ok(outcome)
}

/// Mask every image in `input_dir` into `output_dir` under the same file name.
/// Per-image failures are logged and counted; the batch always runs to the end.
pub fn mask_directory<D, S>(
    input_dir: &Path,
    output_dir: &Path,
    prompt: &str,
    detector: &mut D,
    segmenter: &mut S,
) -> Result<MaskReport>
where
    D: Detector + ?Sized,
    S: Segmenter + ?Sized,
{
    if !input_dir.is_dir() {
        anyhow::bail!("Input folder not found: {:?}", input_dir);
    }
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {:?}", output_dir))?;

    let files = list_images(input_dir);
    tracing::info!(
        "Masking {} images in {:?} with prompt '{}'",
        files.len(),
        input_dir,
        prompt
    );

    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    let mut report = MaskReport {
        total: files.len(),
        ..Default::default()
    };

    for (i, file) in files.iter().enumerate() {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        pb.set_message(name.clone());

        match process_file(file, output_dir, detector, segmenter) {
            Ok(MaskOutcome::NoDetections) => {
                tracing::info!(
                    "[{}/{}] No '{}' detected in {}, saved black image",
                    i + 1,
                    files.len(),
                    prompt,
                    name
                );
                report.blank += 1;
            }
            Ok(MaskOutcome::Masked { boxes }) => {
                tracing::debug!("[{}/{}] {}: {} boxes", i + 1, files.len(), name, boxes);
                report.masked += 1;
            }
            Err(e) => {
                tracing::error!("Error processing {}: {:#}", name, e);
                report.failed.push(file.clone());
            }
        }
        pb.inc(1);
    }

    pb.finish_with_message("Done");
    tracing::info!(
        "Masking complete: {} masked, {} blank, {} failed; output in {:?}",
        report.masked,
        report.blank,
        report.failed.len(),
        output_dir
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::collections::HashMap;

    /// Returns canned boxes keyed by image width.
    struct FakeDetector {
        boxes: HashMap<u32, Vec<BoxPrompt>>,
        calls: usize,
    }

    impl Detector for FakeDetector {
        fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoxPrompt>> {
            self.calls += 1;
            Ok(self.boxes.get(&image.width()).cloned().unwrap_or_default())
        }
    }

    /// Fills each box; optionally at half resolution to exercise resizing.
    struct BoxSegmenter {
        half_resolution: bool,
    }

    impl Segmenter for BoxSegmenter {
        fn segment(&mut self, image: &RgbImage, boxes: &[BoxPrompt]) -> Result<Vec<GrayImage>> {
            let scale = if self.half_resolution { 2 } else { 1 };
            let (w, h) = (image.width() / scale, image.height() / scale);
            Ok(boxes
                .iter()
                .map(|b| {
                    GrayImage::from_fn(w, h, |x, y| {
                        let (fx, fy) = ((x * scale) as f32, (y * scale) as f32);
                        let inside = fx >= b.xmin && fx < b.xmax && fy >= b.ymin && fy < b.ymax;
                        Luma([if inside { 255 } else { 0 }])
                    })
                })
                .collect())
        }
    }

    struct FailingSegmenter;

    impl Segmenter for FailingSegmenter {
        fn segment(&mut self, _: &RgbImage, _: &[BoxPrompt]) -> Result<Vec<GrayImage>> {
            Err(anyhow!("model exploded"))
        }
    }

    fn bbox(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> BoxPrompt {
        BoxPrompt {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence: 0.5,
        }
    }

    fn white(w: u32, h: u32) -> RgbImage {
        RgbImage::from_pixel(w, h, Rgb([255, 255, 255]))
    }

    #[test]
    fn test_no_detections_gives_black_image() {
        let mut detector = FakeDetector {
            boxes: HashMap::new(),
            calls: 0,
        };
        let mut segmenter = FailingSegmenter;

        let (out, outcome) = mask_image(white(40, 30), &mut detector, &mut segmenter).unwrap();
        assert_eq!(outcome, MaskOutcome::NoDetections);
        assert_eq!(out.dimensions(), (40, 30));
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_union_of_boxes_keeps_inside_pixels() {
        let mut detector = FakeDetector {
            boxes: HashMap::from([(40, vec![bbox(0.0, 0.0, 10.0, 10.0), bbox(30.0, 20.0, 40.0, 30.0)])]),
            calls: 0,
        };
        let mut segmenter = BoxSegmenter {
            half_resolution: false,
        };

        let mut source = white(40, 30);
        source.put_pixel(5, 5, Rgb([10, 20, 30]));
        let (out, outcome) = mask_image(source, &mut detector, &mut segmenter).unwrap();

        assert_eq!(outcome, MaskOutcome::Masked { boxes: 2 });
        assert_eq!(out.get_pixel(5, 5).0, [10, 20, 30]);
        assert_eq!(out.get_pixel(35, 25).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(20, 15).0, [0, 0, 0]);
        assert_eq!(out.get_pixel(39, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_mismatched_masks_are_resized() {
        let small = GrayImage::from_fn(2, 2, |x, _| Luma([if x == 0 { 255 } else { 0 }]));
        let combined = union_masks(8, 4, &[small]);
        assert_eq!(combined.dimensions(), (8, 4));
        assert_eq!(combined.get_pixel(0, 0)[0], 255);
        assert_eq!(combined.get_pixel(3, 3)[0], 255);
        assert_eq!(combined.get_pixel(4, 0)[0], 0);
        assert_eq!(combined.get_pixel(7, 3)[0], 0);

        let mut detector = FakeDetector {
            boxes: HashMap::from([(40, vec![bbox(0.0, 0.0, 20.0, 30.0)])]),
            calls: 0,
        };
        let mut segmenter = BoxSegmenter {
            half_resolution: true,
        };
        let (out, _) = mask_image(white(40, 30), &mut detector, &mut segmenter).unwrap();
        assert_eq!(out.get_pixel(2, 2).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(30, 2).0, [0, 0, 0]);
    }

    #[test]
    fn test_union_with_no_masks_is_empty() {
        let combined = union_masks(4, 4, &[]);
        assert!(combined.pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_mask_directory_continues_after_failures() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("masked");
        fs::create_dir_all(&input).unwrap();

        white(40, 30).save(input.join("a.png")).unwrap();
        fs::write(input.join("b.jpg"), b"not an image").unwrap();
        white(20, 10).save(input.join("c.png")).unwrap();
        fs::write(input.join("readme.txt"), b"skip me").unwrap();

        let mut detector = FakeDetector {
            boxes: HashMap::from([(40, vec![bbox(0.0, 0.0, 20.0, 30.0)])]),
            calls: 0,
        };
        let mut segmenter = BoxSegmenter {
            half_resolution: false,
        };

        let report = mask_directory(&input, &output, "bridge", &mut detector, &mut segmenter).unwrap();
        assert_eq!(report.total, 3);
        assert_eq!(report.masked, 1);
        assert_eq!(report.blank, 1);
        assert_eq!(report.failed, vec![input.join("b.jpg")]);
        assert_eq!(detector.calls, 2);

        let a = image::open(output.join("a.png")).unwrap().to_rgb8();
        assert_eq!(a.get_pixel(5, 5).0, [255, 255, 255]);
        assert_eq!(a.get_pixel(30, 5).0, [0, 0, 0]);

        let c = image::open(output.join("c.png")).unwrap().to_rgb8();
        assert_eq!(c.dimensions(), (20, 10));
        assert!(c.pixels().all(|p| p.0 == [0, 0, 0]));
        assert!(!output.join("b.jpg").exists());
    }

    #[test]
    fn test_mask_directory_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        let output = dir.path().join("masked");
        fs::create_dir_all(&input).unwrap();
        white(40, 30).save(input.join("a.png")).unwrap();

        let mut detector = FakeDetector {
            boxes: HashMap::from([(40, vec![bbox(10.0, 10.0, 30.0, 20.0)])]),
            calls: 0,
        };
        let mut segmenter = BoxSegmenter {
            half_resolution: false,
        };

        mask_directory(&input, &output, "bridge", &mut detector, &mut segmenter).unwrap();
        let first = fs::read(output.join("a.png")).unwrap();
        mask_directory(&input, &output, "bridge", &mut detector, &mut segmenter).unwrap();
        assert_eq!(first, fs::read(output.join("a.png")).unwrap());
    }

    #[test]
    fn test_missing_input_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut detector = FakeDetector {
            boxes: HashMap::new(),
            calls: 0,
        };
        let result = mask_directory(
            &dir.path().join("nope"),
            &dir.path().join("out"),
            "bridge",
            &mut detector,
            &mut FailingSegmenter,
        );
        assert!(result.is_err());
    }
}
