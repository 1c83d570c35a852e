use super::VideoReader;
use crate::error::SampleError;
use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{
        VideoCapture, CAP_ANY, CAP_PROP_FPS, CAP_PROP_FRAME_COUNT, CAP_PROP_FRAME_HEIGHT,
        CAP_PROP_FRAME_WIDTH, CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY,
    },
};
use std::path::Path;

/// Sequential video decoder backed by OpenCV's `VideoCapture`.
pub struct OpencvReader {
    capture: VideoCapture,
    source_fps: f64,
    total_frames: usize,
    width: u32,
    height: u32,
    frames_decoded: usize,
}

impl OpencvReader {
    pub fn new(path: &Path) -> Result<Self, SampleError> {
        let open_err = |reason: String| SampleError::StreamOpen {
            path: path.to_path_buf(),
            reason,
        };

        let path_str = path
            .to_str()
            .ok_or_else(|| open_err("path is not valid UTF-8".to_string()))?;

        let mut capture =
            VideoCapture::from_file(path_str, CAP_ANY).map_err(|e| open_err(e.to_string()))?;
        if !capture.is_opened().map_err(|e| open_err(e.to_string()))? {
            return Err(open_err("VideoCapture could not open the file".to_string()));
        }

        if let Ok(true) = capture.set(CAP_PROP_HW_ACCELERATION, VIDEO_ACCELERATION_ANY as f64) {
            tracing::debug!("OpencvReader: hardware acceleration enabled");
        }

        let mut fps = capture.get(CAP_PROP_FPS).unwrap_or(0.0);
        if fps <= 0.0 {
            tracing::warn!("OpencvReader: Failed to get FPS from metadata, falling back to 30.0");
            fps = 30.0;
        }
        let total_frames = capture.get(CAP_PROP_FRAME_COUNT).unwrap_or(0.0).max(0.0) as usize;
        let width = capture.get(CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32;
        let height = capture.get(CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32;

        tracing::info!(
            "OpencvReader: opened {:?}, fps={:.2}, frames={}, {}x{}",
            path,
            fps,
            total_frames,
            width,
            height
        );

        Ok(Self {
            capture,
            source_fps: fps,
            total_frames,
            width,
            height,
            frames_decoded: 0,
        })
    }

    fn decode_error(&self, reason: String) -> SampleError {
        SampleError::Decode {
            index: self.frames_decoded,
            reason,
        }
    }
}

/// Convert a BGR Mat into an owned RGB image.
fn mat_to_rgb_image(mat: &Mat) -> opencv::Result<Option<RgbImage>> {
    let mut rgb_mat = Mat::default();
    imgproc::cvt_color_def(mat, &mut rgb_mat, imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    let rgb_mat = if rgb_mat.is_continuous() {
        rgb_mat
    } else {
        rgb_mat.try_clone()?
    };

    let data = rgb_mat.data_bytes()?.to_vec();
    Ok(RgbImage::from_raw(size.width as u32, size.height as u32, data))
}

impl VideoReader for OpencvReader {
    fn frame_count(&self) -> usize {
        self.total_frames
    }

    fn source_fps(&self) -> f64 {
        self.source_fps
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>, SampleError> {
        let mut frame = Mat::default();
        let success = self
            .capture
            .read(&mut frame)
            .map_err(|e| self.decode_error(e.to_string()))?;
        if !success || frame.empty() {
            return Ok(None);
        }

        let image = mat_to_rgb_image(&frame)
            .map_err(|e| self.decode_error(e.to_string()))?
            .ok_or_else(|| self.decode_error("frame buffer size mismatch".to_string()))?;
        self.frames_decoded += 1;
        Ok(Some(image))
    }

    fn skip_frame(&mut self) -> Result<bool, SampleError> {
        let grabbed = self
            .capture
            .grab()
            .map_err(|e| self.decode_error(e.to_string()))?;
        if grabbed {
            self.frames_decoded += 1;
        }
        Ok(grabbed)
    }
}
