//! Fixed-stride frame sampling.
//!
//! A [`FrameSampler`] walks a [`VideoReader`] in decode order and yields every
//! `stride`-th frame, optionally rescaled to a target width. Frames are named
//! by emission order (`frame_00000.jpg`, `frame_00001.jpg`, ...), independent
//! of their position in the stream.

use crate::config::ExtractConfig;
use crate::error::SampleError;
use crate::video::{open_reader, VideoReader};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleParams {
    /// Keep decode index `i` iff `i % stride == 0`. Must be positive.
    pub stride: usize,
    pub max_frames: Option<usize>,
    pub resize_width: Option<u32>,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            stride: 10,
            max_frames: None,
            resize_width: None,
        }
    }
}

/// A frame selected by the sampler.
#[derive(Debug, Clone)]
pub struct SampledFrame {
    /// Position in emission order; drives the file name.
    pub ordinal: usize,
    /// Position in decode order.
    pub source_index: usize,
    pub image: RgbImage,
}

impl SampledFrame {
    pub fn file_name(&self) -> String {
        frame_file_name(self.ordinal)
    }
}

pub fn frame_file_name(ordinal: usize) -> String {
    format!("frame_{:05}.jpg", ordinal)
}

/// `floor(total / stride)`, capped at `max_frames`.
pub fn expected_frames(total_frames: usize, stride: usize, max_frames: Option<usize>) -> usize {
    let expected = total_frames / stride.max(1);
    match max_frames {
        Some(cap) => expected.min(cap),
        None => expected,
    }
}

/// Height that preserves the aspect ratio of `src_width`x`src_height` at `target_width`.
pub fn resized_height(target_width: u32, src_width: u32, src_height: u32) -> u32 {
    let height = (target_width as f64 * src_height as f64 / src_width as f64).round() as u32;
    height.max(1)
}

fn resize_to_width(image: RgbImage, target_width: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let target_height = resized_height(target_width, width, height);
    if (width, height) == (target_width, target_height) {
        return image;
    }
    image::imageops::resize(&image, target_width, target_height, FilterType::Triangle)
}

/// Lazy, single-pass sequence of sampled frames.
///
/// Iteration ends when the stream is exhausted, when `max_frames` frames have
/// been produced, or right after the first decode error is yielded.
pub struct FrameSampler<R: VideoReader> {
    reader: R,
    params: SampleParams,
    decode_index: usize,
    emitted: usize,
    expected: usize,
    finished: bool,
}

impl<R: VideoReader> FrameSampler<R> {
    pub fn new(reader: R, params: SampleParams) -> Self {
        let expected = expected_frames(reader.frame_count(), params.stride, params.max_frames);
        Self {
            reader,
            params,
            decode_index: 0,
            emitted: 0,
            expected,
            finished: false,
        }
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    #[cfg(test)]
    pub fn reader(&self) -> &R {
        &self.reader
    }

    fn cap_reached(&self) -> bool {
        self.params
            .max_frames
            .is_some_and(|cap| self.emitted >= cap)
    }

    fn fail(&mut self, err: SampleError) -> Option<Result<SampledFrame, SampleError>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<R: VideoReader> Iterator for FrameSampler<R> {
    type Item = Result<SampledFrame, SampleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.cap_reached() {
            return None;
        }

        let stride = self.params.stride.max(1);
        loop {
            if self.decode_index % stride != 0 {
                match self.reader.skip_frame() {
                    Ok(true) => {
                        self.decode_index += 1;
                        continue;
                    }
                    Ok(false) => {
                        self.finished = true;
                        return None;
                    }
                    Err(e) => return self.fail(e),
                }
            }

            let image = match self.reader.next_frame() {
                Ok(Some(image)) => image,
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => return self.fail(e),
            };

            let image = match self.params.resize_width {
                Some(width) => resize_to_width(image, width),
                None => image,
            };

            let frame = SampledFrame {
                ordinal: self.emitted,
                source_index: self.decode_index,
                image,
            };
            self.decode_index += 1;
            self.emitted += 1;
            return Some(Ok(frame));
        }
    }
}

/// Something that consumes sampled frames.
pub trait FrameProcessor {
    fn process(&mut self, frame: SampledFrame) -> Result<(), SampleError>;
}

impl<F> FrameProcessor for F
where
    F: FnMut(SampledFrame) -> Result<(), SampleError>,
{
    fn process(&mut self, frame: SampledFrame) -> Result<(), SampleError> {
        self(frame)
    }
}

pub struct SamplingStats {
    pub emitted: usize,
    pub expected: usize,
    pub duration: Duration,
}

/// Drive a sampler to completion, feeding every frame to `processor`.
pub fn sample_video<R, P>(
    reader: R,
    params: SampleParams,
    mut processor: P,
) -> Result<SamplingStats, SampleError>
where
    R: VideoReader,
    P: FrameProcessor,
{
    let start_time = Instant::now();
    let mut sampler = FrameSampler::new(reader, params);
    let expected = sampler.expected();

    let pb = ProgressBar::new(expected as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    for frame in sampler.by_ref() {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                pb.abandon_with_message("Decode failed");
                return Err(e);
            }
        };
        let emitted = frame.ordinal + 1;
        tracing::debug!("Frame {} -> {}", frame.source_index, frame.file_name());
        if let Err(e) = processor.process(frame) {
            pb.abandon_with_message("Write failed");
            return Err(e);
        }
        pb.inc(1);

        if emitted % 10 == 0 {
            tracing::info!("Extracted {}/{} frames", emitted, expected);
        }
    }

    pb.finish_with_message("Done");

    Ok(SamplingStats {
        emitted: sampler.emitted(),
        expected,
        duration: start_time.elapsed(),
    })
}

pub fn write_jpeg(path: &Path, image: &RgbImage) -> Result<(), SampleError> {
    let file = fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY)
        .encode_image(image)
        .map_err(|source| SampleError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug)]
pub struct ExtractReport {
    pub images_dir: PathBuf,
    pub saved: usize,
    pub expected: usize,
    pub duration: Duration,
}

/// Sample `reader` into `images_dir` as numbered JPEG files.
pub fn extract_from_reader<R: VideoReader>(
    reader: R,
    images_dir: &Path,
    params: SampleParams,
) -> Result<ExtractReport, SampleError> {
    fs::create_dir_all(images_dir)?;

    let stats = sample_video(reader, params, |frame: SampledFrame| {
        write_jpeg(&images_dir.join(frame.file_name()), &frame.image)
    })?;

    tracing::info!(
        "Frame extraction complete: {} images saved to {:?} in {:.1}s",
        stats.emitted,
        images_dir,
        stats.duration.as_secs_f64()
    );

    Ok(ExtractReport {
        images_dir: images_dir.to_path_buf(),
        saved: stats.emitted,
        expected: stats.expected,
        duration: stats.duration,
    })
}

/// Open the configured video and extract frames into `<output>/input`.
pub fn extract_frames(config: &ExtractConfig) -> Result<ExtractReport, SampleError> {
    let reader = open_reader(&config.video, config.backend)?;

    let (width, height) = reader.dimensions();
    tracing::info!(
        "Video: {} frames, {:.2} fps, {}x{}, interval {}, expecting {} frames",
        reader.frame_count(),
        reader.source_fps(),
        width,
        height,
        config.sampling.stride,
        expected_frames(
            reader.frame_count(),
            config.sampling.stride,
            config.sampling.max_frames
        )
    );

    let images_dir = crate::workspace::Workspace::new(&config.output).input_dir();
    extract_from_reader(reader, &images_dir, config.sampling)
}
