use crate::config::{
    ExtractConfig, MaskConfig, PipelineConfig, SfmConfig, TrainConfig, DEFAULT_ITERATIONS,
    DEFAULT_PROMPT, DEFAULT_SH_DEGREE, DETECTION_CONFIDENCE,
};
use crate::sfm::CameraModel;
use crate::video::sampler::SampleParams;
use crate::video::VideoBackend;
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract every Nth frame of a video into <output>/input
    Extract(ExtractArgs),
    /// Run COLMAP feature extraction, matching, mapping and undistortion
    Colmap(ColmapArgs),
    /// Train a Gaussian Splatting model on a COLMAP workspace
    Train(TrainArgs),
    /// Black out everything except the prompted object
    Mask(MaskArgs),
    /// Full pipeline: frames, COLMAP, training
    Run(RunArgs),
}

fn parse_resolution(s: &str) -> Result<i32, String> {
    let value: i32 = s.parse().map_err(|_| format!("invalid resolution '{}'", s))?;
    if value == -1 || value >= 1 {
        Ok(value)
    } else {
        Err("resolution must be -1 (full size) or a positive factor".to_string())
    }
}

fn resolution_option(value: i32) -> Option<u32> {
    (value > 0).then_some(value as u32)
}

#[derive(ClapArgs, Debug)]
pub struct ExtractArgs {
    /// Input video file
    #[arg(short, long)]
    pub video: PathBuf,

    /// Workspace directory; frames are written to <output>/input
    #[arg(short, long, default_value = "./data")]
    pub output: PathBuf,

    /// Keep every Nth frame
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub interval: u32,

    /// Stop after this many frames
    #[arg(short, long)]
    pub max_frames: Option<usize>,

    /// Resize frames to this width, keeping the aspect ratio
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub resize_width: Option<u32>,

    #[arg(long, value_enum, default_value_t = VideoBackend::Ffmpeg)]
    pub backend: VideoBackend,
}

impl ExtractArgs {
    pub fn to_config(&self) -> ExtractConfig {
        ExtractConfig {
            video: self.video.clone(),
            output: self.output.clone(),
            backend: self.backend,
            sampling: SampleParams {
                stride: self.interval as usize,
                max_frames: self.max_frames,
                resize_width: self.resize_width,
            },
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct ColmapArgs {
    /// Workspace containing an input/ folder of images
    #[arg(short, long)]
    pub data: PathBuf,

    #[arg(long, env = "SPLAT_COLMAP_PATH", default_value = "colmap")]
    pub colmap_path: PathBuf,

    /// Run SIFT extraction and matching on the CPU
    #[arg(long)]
    pub no_gpu: bool,

    #[arg(long, value_enum, default_value_t = CameraModel::SimpleRadial)]
    pub camera_model: CameraModel,
}

impl ColmapArgs {
    pub fn to_config(&self) -> SfmConfig {
        SfmConfig {
            workspace: self.data.clone(),
            colmap_path: self.colmap_path.clone(),
            use_gpu: !self.no_gpu,
            camera_model: self.camera_model,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct TrainArgs {
    /// COLMAP workspace (contains images/ and sparse/0)
    #[arg(short, long)]
    pub source_path: PathBuf,

    /// Checkout of the gaussian-splatting repository
    #[arg(short, long, env = "SPLAT_GS_PATH", default_value = "./gaussian-splatting")]
    pub gs_path: PathBuf,

    /// Model output directory (default: <source>/output)
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    #[arg(short, long, default_value_t = DEFAULT_ITERATIONS, value_parser = clap::value_parser!(u32).range(1..))]
    pub iterations: u32,

    /// Image downscale factor, -1 for full resolution
    #[arg(short, long, default_value_t = -1, allow_negative_numbers = true, value_parser = parse_resolution)]
    pub resolution: i32,

    #[arg(long, default_value_t = DEFAULT_SH_DEGREE, value_parser = clap::value_parser!(u8).range(0..=3))]
    pub sh_degree: u8,

    #[arg(long, env = "SPLAT_PYTHON", default_value = "python")]
    pub python: PathBuf,

    /// Install the native extensions and exit
    #[arg(long)]
    pub setup: bool,

    /// Clone the repository if it is missing
    #[arg(long)]
    pub clone: bool,
}

impl TrainArgs {
    pub fn to_config(&self) -> TrainConfig {
        let mut config = TrainConfig::new(&self.source_path, &self.gs_path);
        config.output = self.output_path.clone();
        config.iterations = self.iterations;
        config.resolution = resolution_option(self.resolution);
        config.sh_degree = self.sh_degree;
        config.python = self.python.clone();
        config
    }
}

#[derive(ClapArgs, Debug)]
pub struct MaskArgs {
    /// Folder of images to mask
    #[arg(long)]
    pub input: PathBuf,

    /// Folder for masked images
    #[arg(long)]
    pub output: PathBuf,

    /// Text prompt the detector was exported for
    #[arg(long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Open-vocabulary YOLO ONNX model
    #[arg(long, env = "SPLAT_DETECTOR_MODEL")]
    pub detector_model: PathBuf,

    /// SAM encoder ONNX (default: published base weights)
    #[arg(long, env = "SPLAT_SEGMENTER_ENCODER")]
    pub segmenter_encoder: Option<PathBuf>,

    /// SAM decoder ONNX (default: published base weights)
    #[arg(long, env = "SPLAT_SEGMENTER_DECODER")]
    pub segmenter_decoder: Option<PathBuf>,

    #[arg(long, default_value_t = DETECTION_CONFIDENCE)]
    pub confidence: f32,
}

impl MaskArgs {
    pub fn to_config(&self) -> MaskConfig {
        MaskConfig {
            input: self.input.clone(),
            output: self.output.clone(),
            prompt: self.prompt.clone(),
            detector_model: self.detector_model.clone(),
            segmenter_encoder: self.segmenter_encoder.clone(),
            segmenter_decoder: self.segmenter_decoder.clone(),
            confidence: self.confidence,
        }
    }
}

#[derive(ClapArgs, Debug)]
pub struct RunArgs {
    /// Input video file
    #[arg(short, long)]
    pub video: PathBuf,

    /// Project workspace
    #[arg(short, long, default_value = "./project")]
    pub output: PathBuf,

    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub frame_interval: u32,

    #[arg(long, default_value_t = 300)]
    pub max_frames: usize,

    #[arg(long, default_value_t = 1920, value_parser = clap::value_parser!(u32).range(1..))]
    pub resize_width: u32,

    #[arg(long, default_value_t = DEFAULT_ITERATIONS, value_parser = clap::value_parser!(u32).range(1..))]
    pub iterations: u32,

    #[arg(long, env = "SPLAT_COLMAP_PATH", default_value = "colmap")]
    pub colmap_path: PathBuf,

    #[arg(long, env = "SPLAT_GS_PATH", default_value = "./gaussian-splatting")]
    pub gs_path: PathBuf,

    #[arg(long, env = "SPLAT_PYTHON", default_value = "python")]
    pub python: PathBuf,

    #[arg(long, value_enum, default_value_t = VideoBackend::Ffmpeg)]
    pub backend: VideoBackend,

    #[arg(long)]
    pub skip_frames: bool,

    #[arg(long)]
    pub skip_colmap: bool,

    #[arg(long)]
    pub skip_training: bool,
}

impl RunArgs {
    pub fn to_config(&self) -> PipelineConfig {
        let mut sfm = SfmConfig::new(&self.output);
        sfm.colmap_path = self.colmap_path.clone();

        let mut train = TrainConfig::new(&self.output, &self.gs_path);
        train.iterations = self.iterations;
        train.python = self.python.clone();

        PipelineConfig {
            extract: ExtractConfig {
                video: self.video.clone(),
                output: self.output.clone(),
                backend: self.backend,
                sampling: SampleParams {
                    stride: self.frame_interval as usize,
                    max_frames: Some(self.max_frames),
                    resize_width: Some(self.resize_width),
                },
            },
            sfm,
            train,
            skip_frames: self.skip_frames,
            skip_colmap: self.skip_colmap,
            skip_training: self.skip_training,
        }
    }
}
