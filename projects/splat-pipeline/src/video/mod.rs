pub mod ffmpeg_reader;
#[cfg(feature = "opencv")]
pub mod opencv_reader;
pub mod sampler;

use crate::error::SampleError;
use clap::ValueEnum;
use image::RgbImage;
use std::path::Path;

/// Sequential access to the decoded frames of a video stream.
pub trait VideoReader {
    /// Total frame count as reported by the container (may be an estimate).
    fn frame_count(&self) -> usize;
    fn source_fps(&self) -> f64;
    /// Source (width, height) in pixels.
    fn dimensions(&self) -> (u32, u32);
    /// Decode the next frame. `Ok(None)` marks the end of the stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, SampleError>;

    /// Advance past the next frame without producing pixels.
    /// Returns `false` at the end of the stream.
    fn skip_frame(&mut self) -> Result<bool, SampleError> {
        Ok(self.next_frame()?.is_some())
    }
}

impl<R: VideoReader + ?Sized> VideoReader for Box<R> {
    fn frame_count(&self) -> usize {
        (**self).frame_count()
    }

    fn source_fps(&self) -> f64 {
        (**self).source_fps()
    }

    fn dimensions(&self) -> (u32, u32) {
        (**self).dimensions()
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>, SampleError> {
        (**self).next_frame()
    }

    fn skip_frame(&mut self) -> Result<bool, SampleError> {
        (**self).skip_frame()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum VideoBackend {
    #[default]
    Ffmpeg,
    Opencv,
}

pub fn open_reader(path: &Path, backend: VideoBackend) -> Result<Box<dyn VideoReader>, SampleError> {
    match backend {
        VideoBackend::Ffmpeg => Ok(Box::new(ffmpeg_reader::FfmpegReader::new(path)?)),
        #[cfg(feature = "opencv")]
        VideoBackend::Opencv => Ok(Box::new(opencv_reader::OpencvReader::new(path)?)),
        #[cfg(not(feature = "opencv"))]
        VideoBackend::Opencv => Err(SampleError::StreamOpen {
            path: path.to_path_buf(),
            reason: "opencv backend is disabled (build with --features opencv)".to_string(),
        }),
    }
}
