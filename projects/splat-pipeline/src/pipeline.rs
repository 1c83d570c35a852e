// End-to-end orchestration: frames -> COLMAP -> training.
//
// Stages run in order and each can be skipped. The first failing stage aborts
// the run; completed stages are recorded in the workspace's pipeline.json.

use crate::config::{ExtractConfig, PipelineConfig};
use crate::error::SampleError;
use crate::sfm::{run_sfm, SfmReport};
use crate::tool::ToolRunner;
use crate::train::{ensure_repo, prepare_environment, run_training, RepoStatus, TrainingReport};
use crate::video::sampler::{extract_frames, ExtractReport};
use crate::workspace::{RunMetadata, Workspace};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::{Duration, Instant};

pub const STAGE_FRAMES: &str = "frames";
pub const STAGE_COLMAP: &str = "colmap";
pub const STAGE_TRAINING: &str = "training";

#[derive(Debug, Default)]
pub struct PipelineReport {
    pub frames: Option<ExtractReport>,
    pub sfm: Option<SfmReport>,
    pub training: Option<TrainingReport>,
    pub duration: Duration,
}

impl PipelineReport {
    pub fn final_ply(&self) -> Option<&PathBuf> {
        self.training.as_ref().map(|t| &t.final_ply)
    }
}

fn banner(title: &str) {
    tracing::info!("{}", "=".repeat(60));
    tracing::info!("{}", title);
    tracing::info!("{}", "=".repeat(60));
}

pub fn run_pipeline<R: ToolRunner + ?Sized>(
    config: &PipelineConfig,
    runner: &mut R,
) -> Result<PipelineReport> {
    run_pipeline_with(config, runner, extract_frames)
}

/// [`run_pipeline`] with a caller-supplied frame extraction stage.
pub fn run_pipeline_with<R, F>(
    config: &PipelineConfig,
    runner: &mut R,
    extract: F,
) -> Result<PipelineReport>
where
    R: ToolRunner + ?Sized,
    F: FnOnce(&ExtractConfig) -> Result<ExtractReport, SampleError>,
{
    let started = Instant::now();
    let ws = Workspace::new(&config.extract.output);
    std::fs::create_dir_all(ws.root())
        .with_context(|| format!("Failed to create workspace {:?}", ws.root()))?;

    let mut metadata = RunMetadata::load_or_create(&ws)?;
    if !config.skip_frames {
        metadata.video = Some(config.extract.video.to_string_lossy().into_owned());
    }
    metadata.save()?;

    tracing::info!("Gaussian Splatting pipeline");
    tracing::info!("  Video:     {:?}", config.extract.video);
    tracing::info!("  Workspace: {:?}", ws.root());
    tracing::info!("  Interval:  every {} frames", config.extract.sampling.stride);

    let mut report = PipelineReport::default();

    if config.skip_frames {
        tracing::info!("Skipping frame extraction");
    } else {
        banner("STEP 1: Extracting frames from video");
        let frames = extract(&config.extract).context("Frame extraction failed")?;
        metadata.record_stage(STAGE_FRAMES)?;
        report.frames = Some(frames);
    }

    if config.skip_colmap {
        tracing::info!("Skipping COLMAP");
    } else {
        banner("STEP 2: Running COLMAP structure-from-motion");
        let sfm = run_sfm(&config.sfm, runner).context("COLMAP processing failed")?;
        metadata.record_stage(STAGE_COLMAP)?;
        report.sfm = Some(sfm);
    }

    if config.skip_training {
        tracing::info!("Skipping training");
    } else {
        banner("STEP 3: Training Gaussian Splatting");
        if ensure_repo(&config.train, runner).context("Repository setup failed")?
            == RepoStatus::Cloned
        {
            prepare_environment(&config.train, runner)?;
        }
        let training = run_training(&config.train, runner).context("Training failed")?;
        metadata.record_stage(STAGE_TRAINING)?;
        report.training = Some(training);
    }

    report.duration = started.elapsed();
    banner("Pipeline complete");
    tracing::info!("Total time: {:.1}s", report.duration.as_secs_f64());
    if let Some(ply) = report.final_ply() {
        tracing::info!("Final model: {:?}", ply);
    }
    Ok(report)
}
