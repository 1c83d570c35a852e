use super::{BoxPrompt, Detector, Segmenter};
use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, RgbImage};
use std::path::Path;
use usls::models::{SAM, YOLO};
use usls::{Config, Image, SamPrompt};

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("Model path is not valid UTF-8: {:?}", path))
}

fn to_usls_image(image: &RgbImage) -> Image {
    Image::from(DynamicImage::ImageRgb8(image.clone()))
}

/// Open-vocabulary YOLO detector exported with a fixed text prompt.
pub struct UslsDetector {
    model: YOLO,
    confidence: f32,
}

impl UslsDetector {
    pub fn new(model_path: &Path, prompt: &str, confidence: f32) -> Result<Self> {
        let config = Config::default()
            .with_model_file(path_str(model_path)?)
            .with_class_names(&[prompt])
            .with_class_confs(&[confidence]);

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let config = config.commit()?;
        let model = YOLO::new(config)?;
        tracing::info!("Loaded detector {:?} for '{}'", model_path, prompt);
        Ok(Self { model, confidence })
    }
}

impl Detector for UslsDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoxPrompt>> {
        let results = self.model.forward(&[to_usls_image(image)])?;

        let boxes = results
            .into_iter()
            .flat_map(|y| y.hbbs)
            .filter_map(|hbb| {
                let confidence = hbb.confidence().unwrap_or(0.0);
                if confidence < self.confidence {
                    return None;
                }
                Some(BoxPrompt {
                    xmin: hbb.xmin(),
                    ymin: hbb.ymin(),
                    xmax: hbb.xmin() + hbb.width(),
                    ymax: hbb.ymin() + hbb.height(),
                    confidence,
                })
            })
            .collect();
        Ok(boxes)
    }
}

/// Box-prompted SAM. Uses the published base weights unless explicit files are given.
pub struct UslsSegmenter {
    model: SAM,
}

impl UslsSegmenter {
    pub fn new(encoder: Option<&Path>, decoder: Option<&Path>) -> Result<Self> {
        let mut config = Config::sam_v1_base();
        if let Some(encoder) = encoder {
            config = config.with_encoder_file(path_str(encoder)?);
        }
        if let Some(decoder) = decoder {
            config = config.with_decoder_file(path_str(decoder)?);
        }

        #[cfg(target_os = "macos")]
        let config = config.with_model_device(usls::Device::CoreMl);

        let model = SAM::new(config.commit()?)?;
        Ok(Self { model })
    }
}

impl Segmenter for UslsSegmenter {
    fn segment(&mut self, image: &RgbImage, boxes: &[BoxPrompt]) -> Result<Vec<GrayImage>> {
        let input = [to_usls_image(image)];
        let mut masks = Vec::with_capacity(boxes.len());

        for b in boxes {
            let prompt = SamPrompt::default().with_xyxy(b.xmin, b.ymin, b.xmax, b.ymax);
            let results = self.model.forward(&input, &[prompt])?;
            for y in results {
                masks.extend(y.masks.iter().map(|m| m.mask().clone()));
            }
        }
        Ok(masks)
    }
}
