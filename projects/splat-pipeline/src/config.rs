// Per-stage configuration
//
// Every stage function receives one of these structs; nothing is read from
// ambient process state once the CLI has been parsed.

use crate::sfm::CameraModel;
use crate::video::sampler::SampleParams;
use crate::video::VideoBackend;
use crate::workspace::Workspace;
use std::path::PathBuf;

pub const DEFAULT_ITERATIONS: u32 = 30_000;
pub const DEFAULT_SAVE_ITERATIONS: [u32; 3] = [7_000, 15_000, 30_000];
pub const DEFAULT_SH_DEGREE: u8 = 3;
pub const GAUSSIAN_SPLATTING_REPO: &str = "https://github.com/graphdeco-inria/gaussian-splatting.git";
pub const DEFAULT_PROMPT: &str = "concrete bridge";
pub const DETECTION_CONFIDENCE: f32 = 0.05;

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub video: PathBuf,
    /// Workspace root; frames land in `<output>/input`.
    pub output: PathBuf,
    pub backend: VideoBackend,
    pub sampling: SampleParams,
}

#[derive(Debug, Clone)]
pub struct SfmConfig {
    pub workspace: PathBuf,
    pub colmap_path: PathBuf,
    pub use_gpu: bool,
    pub camera_model: CameraModel,
}

impl SfmConfig {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            colmap_path: PathBuf::from("colmap"),
            use_gpu: true,
            camera_model: CameraModel::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    /// Reconstruction workspace passed as `-s`.
    pub source: PathBuf,
    /// Checkout of the training repository.
    pub gs_path: PathBuf,
    /// `-m`; defaults to `<source>/output`.
    pub output: Option<PathBuf>,
    pub iterations: u32,
    pub save_iterations: Vec<u32>,
    /// Downscale factor passed as `-r`; `None` keeps full resolution.
    pub resolution: Option<u32>,
    pub sh_degree: u8,
    pub python: PathBuf,
    pub repo_url: String,
}

impl TrainConfig {
    pub fn new(source: impl Into<PathBuf>, gs_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            gs_path: gs_path.into(),
            output: None,
            iterations: DEFAULT_ITERATIONS,
            save_iterations: DEFAULT_SAVE_ITERATIONS.to_vec(),
            resolution: None,
            sh_degree: DEFAULT_SH_DEGREE,
            python: PathBuf::from("python"),
            repo_url: GAUSSIAN_SPLATTING_REPO.to_string(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| Workspace::new(&self.source).default_output_dir())
    }
}

#[derive(Debug, Clone)]
pub struct MaskConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
    pub detector_model: PathBuf,
    pub segmenter_encoder: Option<PathBuf>,
    pub segmenter_decoder: Option<PathBuf>,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub extract: ExtractConfig,
    pub sfm: SfmConfig,
    pub train: TrainConfig,
    pub skip_frames: bool,
    pub skip_colmap: bool,
    pub skip_training: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_train_defaults() {
        let config = TrainConfig::new("/data/project", "./gaussian-splatting");
        assert_eq!(config.iterations, 30_000);
        assert_eq!(config.save_iterations, vec![7_000, 15_000, 30_000]);
        assert_eq!(config.sh_degree, 3);
        assert_eq!(config.resolution, None);
        assert_eq!(config.output_dir(), PathBuf::from("/data/project/output"));
    }

    #[test]
    fn test_explicit_output_wins() {
        let mut config = TrainConfig::new("/data/project", "./gs");
        config.output = Some(PathBuf::from("/elsewhere"));
        assert_eq!(config.output_dir(), PathBuf::from("/elsewhere"));
    }
}
