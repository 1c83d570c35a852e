use super::VideoReader;
use crate::error::SampleError;
use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use std::path::{Path, PathBuf};

use ffmpeg_next::ffi;

// ---------------------------------------------------------------------------
// HwDeviceCtx
// ---------------------------------------------------------------------------

/// Owned `AVBufferRef*` for a VideoToolbox device context, released on drop.
struct HwDeviceCtx {
    ptr: *mut ffi::AVBufferRef,
}

impl HwDeviceCtx {
    fn new_videotoolbox() -> Option<Self> {
        let mut ptr: *mut ffi::AVBufferRef = std::ptr::null_mut();
        let ret = unsafe {
            ffi::av_hwdevice_ctx_create(
                &mut ptr,
                ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX,
                std::ptr::null(),
                std::ptr::null_mut(),
                0,
            )
        };
        if ret < 0 || ptr.is_null() {
            None
        } else {
            Some(Self { ptr })
        }
    }

    /// New reference owned by the caller.
    fn buf_ref(&self) -> *mut ffi::AVBufferRef {
        unsafe { ffi::av_buffer_ref(self.ptr) }
    }
}

impl Drop for HwDeviceCtx {
    fn drop(&mut self) {
        unsafe {
            ffi::av_buffer_unref(&mut self.ptr);
        }
    }
}

// ---------------------------------------------------------------------------
// FfmpegReader
// ---------------------------------------------------------------------------

/// Sequential video decoder backed by ffmpeg-next.
/// Uses VideoToolbox on macOS when the codec supports it, CPU decoding otherwise.
pub struct FfmpegReader {
    path: PathBuf,
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Created on the first converted frame, once the decoded pixel format is known.
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    source_fps: f64,
    total_frames: usize,
    frames_decoded: usize,
    _hw_device_ctx: Option<HwDeviceCtx>,
    hw_pix_fmt: Option<ffi::AVPixelFormat>,
    /// Scratch frame for skipped frames.
    reuse_frame: ffmpeg_next::util::frame::Video,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

impl FfmpegReader {
    pub fn new(path: &Path) -> Result<Self, SampleError> {
        Self::open(path).map_err(|e| SampleError::StreamOpen {
            path: path.to_path_buf(),
            reason: format!("{:#}", e),
        })
    }

    fn open(path: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !path.exists() {
            return Err(anyhow!("Video file not found"));
        }

        let input_ctx = ffmpeg_next::format::input(&path).context("Failed to open container")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found"))?;
        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        let mut decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;

        let (hw_device_ctx, hw_pix_fmt) = try_setup_hw_accel(&mut decoder_ctx);

        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();
        if width == 0 || height == 0 {
            return Err(anyhow!("Video stream reports empty dimensions"));
        }

        tracing::info!(
            "FfmpegReader: opened {:?}, duration={:.2}s, fps={:.2}, frames={}, {}x{} ({} decoding)",
            path,
            duration_secs,
            source_fps,
            total_frames,
            width,
            height,
            if hw_pix_fmt.is_some() { "VideoToolbox" } else { "CPU" }
        );

        Ok(Self {
            path: path.to_path_buf(),
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            width,
            height,
            source_fps,
            total_frames,
            frames_decoded: 0,
            _hw_device_ctx: hw_device_ctx,
            hw_pix_fmt,
            reuse_frame: ffmpeg_next::util::frame::Video::empty(),
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame into `target`. Returns `false` once the
    /// decoder is drained after EOF.
    fn decode_into(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut found_packet = false;
            while let PacketRead::Packet =
                classify_read(self.reuse_packet.read(&mut self.input_ctx))?
            {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn is_hw_frame(&self, frame: &ffmpeg_next::util::frame::Video) -> bool {
        match self.hw_pix_fmt {
            Some(hw_fmt) => unsafe { (*frame.as_ptr()).format == hw_fmt as i32 },
            None => false,
        }
    }

    fn transfer_hw_frame(
        &self,
        hw_frame: &ffmpeg_next::util::frame::Video,
    ) -> Result<ffmpeg_next::util::frame::Video> {
        let mut sw_frame = ffmpeg_next::util::frame::Video::empty();
        let ret =
            unsafe { ffi::av_hwframe_transfer_data(sw_frame.as_mut_ptr(), hw_frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(anyhow!("av_hwframe_transfer_data failed (error code {})", ret));
        }
        Ok(sw_frame)
    }

    /// Move to CPU memory if needed and convert to packed RGB24.
    fn convert(&mut self, frame: ffmpeg_next::util::frame::Video) -> Result<RgbImage> {
        let sw_frame = if self.is_hw_frame(&frame) {
            self.transfer_hw_frame(&frame)?
        } else {
            frame
        };

        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                sw_frame.format(),
                self.width,
                self.height,
                ffmpeg_next::format::Pixel::RGB24,
                self.width,
                self.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }

        let mut rgb_frame = ffmpeg_next::util::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler
                .run(&sw_frame, &mut rgb_frame)
                .context("Scaler failed")?;
        }

        rgb_frame_to_image(&rgb_frame)
    }

    fn decode_error(&self, e: anyhow::Error) -> SampleError {
        tracing::error!("FfmpegReader: decode failure in {:?}: {:#}", self.path, e);
        SampleError::Decode {
            index: self.frames_decoded,
            reason: format!("{:#}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketRead {
    Packet,
    EndOfStream,
}

/// Only a clean EOF ends the stream; any other demuxer error is a decode failure.
fn classify_read(result: std::result::Result<(), ffmpeg_next::Error>) -> Result<PacketRead> {
    match result {
        Ok(()) => Ok(PacketRead::Packet),
        Err(ffmpeg_next::Error::Eof) => Ok(PacketRead::EndOfStream),
        Err(e) => Err(anyhow!("Failed to read packet: {}", e)),
    }
}

/// Probe the codec for a VideoToolbox configuration and attach a device context.
/// Returns `(None, None)` when hardware decoding is unavailable.
fn try_setup_hw_accel(
    decoder_ctx: &mut ffmpeg_next::codec::context::Context,
) -> (Option<HwDeviceCtx>, Option<ffi::AVPixelFormat>) {
    if !cfg!(target_os = "macos") {
        return (None, None);
    }

    unsafe {
        // from_parameters only fills codec_id.
        let codec_id = (*decoder_ctx.as_ptr()).codec_id;
        let codec_ptr = ffi::avcodec_find_decoder(codec_id);
        if codec_ptr.is_null() {
            tracing::debug!("FfmpegReader: no decoder for codec_id {:?}", codec_id);
            return (None, None);
        }

        let mut matched_pix_fmt = None;
        let mut idx = 0i32;
        loop {
            let config = ffi::avcodec_get_hw_config(codec_ptr, idx);
            if config.is_null() {
                break;
            }
            let c = &*config;
            if c.device_type == ffi::AVHWDeviceType::AV_HWDEVICE_TYPE_VIDEOTOOLBOX
                && (c.methods as u32 & ffi::AV_CODEC_HW_CONFIG_METHOD_HW_DEVICE_CTX as u32) != 0
            {
                matched_pix_fmt = Some(c.pix_fmt);
                break;
            }
            idx += 1;
        }

        let Some(hw_pix_fmt) = matched_pix_fmt else {
            tracing::debug!("FfmpegReader: codec has no VideoToolbox config, using CPU");
            return (None, None);
        };

        let Some(hw_ctx) = HwDeviceCtx::new_videotoolbox() else {
            tracing::warn!("FfmpegReader: failed to create VideoToolbox device, falling back to CPU");
            return (None, None);
        };

        (*decoder_ctx.as_mut_ptr()).hw_device_ctx = hw_ctx.buf_ref();
        (Some(hw_ctx), Some(hw_pix_fmt))
    }
}

/// Copy a packed RGB24 frame into an owned image, dropping row padding.
fn rgb_frame_to_image(frame: &ffmpeg_next::util::frame::Video) -> Result<RgbImage> {
    let width = frame.width() as usize;
    let height = frame.height() as usize;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width * 3;

    let mut buffer = Vec::with_capacity(row_bytes * height);
    for y in 0..height {
        let offset = y * stride;
        let row = data
            .get(offset..offset + row_bytes)
            .ok_or_else(|| anyhow!("Frame buffer shorter than expected at row {}", y))?;
        buffer.extend_from_slice(row);
    }

    RgbImage::from_raw(width as u32, height as u32, buffer)
        .ok_or_else(|| anyhow!("Failed to build RGB image from frame data"))
}

impl VideoReader for FfmpegReader {
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
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        match self.decode_into(&mut raw) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => return Err(self.decode_error(e)),
        }

        let image = self.convert(raw).map_err(|e| self.decode_error(e))?;
        self.frames_decoded += 1;
        Ok(Some(image))
    }

    fn skip_frame(&mut self) -> Result<bool, SampleError> {
        // Swap out the scratch frame so decode_into can borrow self mutably.
        let mut frame = std::mem::replace(
            &mut self.reuse_frame,
            ffmpeg_next::util::frame::Video::empty(),
        );
        let res = self.decode_into(&mut frame);
        self.reuse_frame = frame;

        match res {
            Ok(true) => {
                self.frames_decoded += 1;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(self.decode_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_classification() {
        assert_eq!(classify_read(Ok(())).unwrap(), PacketRead::Packet);
        assert_eq!(
            classify_read(Err(ffmpeg_next::Error::Eof)).unwrap(),
            PacketRead::EndOfStream
        );

        let err = classify_read(Err(ffmpeg_next::Error::InvalidData)).unwrap_err();
        assert!(err.to_string().starts_with("Failed to read packet"));
        assert!(classify_read(Err(ffmpeg_next::Error::Bug)).is_err());
    }

    #[test]
    fn test_missing_file_is_stream_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.mp4");
        match FfmpegReader::new(&path) {
            Err(SampleError::StreamOpen { path: p, .. }) => assert_eq!(p, path),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("opening a missing file must fail"),
        }
    }

    #[test]
    fn test_corrupt_file_is_stream_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.mp4");
        std::fs::write(&path, b"definitely not a video container").unwrap();
        assert!(matches!(
            FfmpegReader::new(&path),
            Err(SampleError::StreamOpen { .. })
        ));
    }
}
