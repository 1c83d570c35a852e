mod cli;
mod config;
mod error;
mod mask;
mod pipeline;
mod sfm;
mod tool;
mod train;
mod video;
mod workspace;

use anyhow::{Context, Result};
use cli::{Args, Command, TrainArgs};
use mask::usls_models::{UslsDetector, UslsSegmenter};
use tool::SystemRunner;
use tracing_subscriber::EnvFilter;

fn run_train(args: &TrainArgs) -> Result<()> {
    let config = args.to_config();
    let mut runner = SystemRunner;

    if args.clone {
        train::ensure_repo(&config, &mut runner)?;
    }
    if args.setup {
        train::prepare_environment(&config, &mut runner)?;
        return Ok(());
    }

    train::run_training(&config, &mut runner)?;
    Ok(())
}

fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse_args();

    match args.command {
        Command::Extract(extract) => {
            let report = video::sampler::extract_frames(&extract.to_config())?;
            tracing::info!(
                "Saved {} of {} expected frames to {:?}",
                report.saved,
                report.expected,
                report.images_dir
            );
        }
        Command::Colmap(colmap) => {
            sfm::run_sfm(&colmap.to_config(), &mut SystemRunner)?;
        }
        Command::Train(train_args) => run_train(&train_args)?,
        Command::Mask(mask_args) => {
            let config = mask_args.to_config();
            let mut detector =
                UslsDetector::new(&config.detector_model, &config.prompt, config.confidence)
                    .context("Failed to load detector")?;
            let mut segmenter = UslsSegmenter::new(
                config.segmenter_encoder.as_deref(),
                config.segmenter_decoder.as_deref(),
            )
            .context("Failed to load segmenter")?;
            mask::mask_directory(
                &config.input,
                &config.output,
                &config.prompt,
                &mut detector,
                &mut segmenter,
            )?;
        }
        Command::Run(run) => {
            pipeline::run_pipeline(&run.to_config(), &mut SystemRunner)?;
        }
    }

    Ok(())
}
