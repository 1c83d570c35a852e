// Gaussian Splatting training invoker
//
// Manages the checkout of the training repository and runs its train.py with
// marshalled parameters. Checkpoint point clouds are reported, never required.

use crate::config::TrainConfig;
use crate::error::StageError;
use crate::tool::{run_checked, ToolInvocation, ToolRunner};
use crate::workspace::{checkpoint_ply, is_non_empty_dir};
use std::path::{Path, PathBuf};

pub const TRAIN_SCRIPT: &str = "train.py";
pub const MAX_SH_DEGREE: u8 = 3;
/// Native extensions installed during environment preparation.
pub const EXTENSION_PACKAGES: [&str; 2] = ["diff-gaussian-rasterization", "simple-knn"];

pub fn repo_is_present(gs_path: &Path) -> bool {
    gs_path.join(TRAIN_SCRIPT).is_file()
}

pub fn clone_invocation(repo_url: &str, gs_path: &Path) -> ToolInvocation {
    ToolInvocation::new("Repository clone", "git")
        .arg("clone")
        .arg(repo_url)
        .arg("--recursive")
        .arg(gs_path)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStatus {
    Present,
    Cloned,
}

/// Clone the training repository when `train.py` is missing.
pub fn ensure_repo<R: ToolRunner + ?Sized>(
    config: &TrainConfig,
    runner: &mut R,
) -> Result<RepoStatus, StageError> {
    if repo_is_present(&config.gs_path) {
        return Ok(RepoStatus::Present);
    }

    if is_non_empty_dir(&config.gs_path) {
        return Err(StageError::Setup(format!(
            "{:?} exists but does not contain {}",
            config.gs_path, TRAIN_SCRIPT
        )));
    }

    tracing::info!("Cloning {} into {:?}", config.repo_url, config.gs_path);
    run_checked(runner, &clone_invocation(&config.repo_url, &config.gs_path))?;

    if !repo_is_present(&config.gs_path) {
        return Err(StageError::Setup(format!(
            "Clone finished but {} is missing in {:?}",
            TRAIN_SCRIPT, config.gs_path
        )));
    }
    tracing::info!("Repository cloned");
    Ok(RepoStatus::Cloned)
}

/// Initialize submodules if needed and install the native extensions that are present.
/// Failures are logged; a broken environment surfaces when training starts.
pub fn prepare_environment<R: ToolRunner + ?Sized>(
    config: &TrainConfig,
    runner: &mut R,
) -> Result<(), StageError> {
    let submodules = config.gs_path.join("submodules");

    if !is_non_empty_dir(&submodules) {
        let inv = ToolInvocation::new("Submodule init", "git")
            .args(["submodule", "update", "--init", "--recursive"])
            .current_dir(&config.gs_path);
        if let Err(e) = run_checked(runner, &inv) {
            tracing::warn!("{}", e);
        }
    }

    for package in EXTENSION_PACKAGES {
        let package_dir = submodules.join(package);
        if !package_dir.exists() {
            tracing::debug!("{:?} not present, skipping install", package_dir);
            continue;
        }
        let inv = ToolInvocation::new(format!("Install {}", package), &config.python)
            .args(["-m", "pip", "install"])
            .arg(&package_dir);
        if let Err(e) = run_checked(runner, &inv) {
            tracing::warn!("{}", e);
        }
    }

    tracing::info!("Environment preparation finished");
    Ok(())
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// `python train.py ...`, run from inside the repository.
pub fn training_invocation(config: &TrainConfig) -> ToolInvocation {
    let resolution = config
        .resolution
        .map(|r| r.to_string())
        .unwrap_or_else(|| "-1".to_string());
    let gs_path = absolute(&config.gs_path);

    ToolInvocation::new("Training", &config.python)
        .arg(gs_path.join(TRAIN_SCRIPT))
        .opt("-s", absolute(&config.source))
        .opt("-m", absolute(&config.output_dir()))
        .opt("--iterations", config.iterations.to_string())
        .arg("--save_iterations")
        .args(config.save_iterations.iter().map(|i| i.to_string()))
        .opt("-r", resolution)
        .opt("--sh_degree", config.sh_degree.to_string())
        .current_dir(&gs_path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub iteration: u32,
    pub path: PathBuf,
    /// `None` when the file was not written.
    pub size_bytes: Option<u64>,
}

pub fn collect_checkpoints(output_dir: &Path, iterations: &[u32]) -> Vec<Checkpoint> {
    iterations
        .iter()
        .map(|&iteration| {
            let path = checkpoint_ply(output_dir, iteration);
            let size_bytes = std::fs::metadata(&path)
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len());
            Checkpoint {
                iteration,
                path,
                size_bytes,
            }
        })
        .collect()
}

#[derive(Debug)]
pub struct TrainingReport {
    pub output_dir: PathBuf,
    pub checkpoints: Vec<Checkpoint>,
    pub final_ply: PathBuf,
}

pub fn run_training<R: ToolRunner + ?Sized>(
    config: &TrainConfig,
    runner: &mut R,
) -> Result<TrainingReport, StageError> {
    if !repo_is_present(&config.gs_path) {
        return Err(StageError::Setup(format!(
            "{} not found in {:?}; clone the repository first",
            TRAIN_SCRIPT, config.gs_path
        )));
    }
    if config.sh_degree > MAX_SH_DEGREE {
        return Err(StageError::Setup(format!(
            "SH degree must be between 0 and {}, got {}",
            MAX_SH_DEGREE, config.sh_degree
        )));
    }
    if config.iterations == 0 {
        return Err(StageError::Setup("Iteration count must be positive".to_string()));
    }

    let output_dir = config.output_dir();
    tracing::info!(
        "Training: source={:?}, output={:?}, iterations={}, save at {:?}",
        config.source,
        output_dir,
        config.iterations,
        config.save_iterations
    );

    run_checked(runner, &training_invocation(config))?;

    let checkpoints = collect_checkpoints(&output_dir, &config.save_iterations);
    for checkpoint in &checkpoints {
        match checkpoint.size_bytes {
            Some(size) => tracing::info!(
                "Checkpoint {}: {:?} ({:.1} MB)",
                checkpoint.iteration,
                checkpoint.path,
                size as f64 / (1024.0 * 1024.0)
            ),
            None => tracing::info!(
                "Checkpoint {}: no point cloud at {:?}",
                checkpoint.iteration,
                checkpoint.path
            ),
        }
    }

    let final_ply = checkpoint_ply(&output_dir, config.iterations);
    tracing::info!("Final point cloud: {:?}", final_ply);

    Ok(TrainingReport {
        output_dir,
        checkpoints,
        final_ply,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::testing::RecordingRunner;
    use crate::tool::ToolOutcome;
    use std::fs;

    fn fake_repo(dir: &Path) -> PathBuf {
        let gs = dir.join("gaussian-splatting");
        fs::create_dir_all(&gs).unwrap();
        fs::write(gs.join(TRAIN_SCRIPT), "print('train')").unwrap();
        gs
    }

    #[test]
    fn test_training_invocation_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("project");
        let config = TrainConfig::new(&source, dir.path().join("gs"));
        let inv = training_invocation(&config);

        assert_eq!(inv.program, "python");
        assert_eq!(inv.cwd.as_deref(), Some(dir.path().join("gs").as_path()));
        let args = inv.args_lossy();
        assert_eq!(args[0], dir.path().join("gs").join("train.py").to_string_lossy());
        assert_eq!(inv.value_of("-s"), Some(source.to_string_lossy().into_owned()));
        assert_eq!(
            inv.value_of("-m"),
            Some(source.join("output").to_string_lossy().into_owned())
        );
        assert_eq!(inv.value_of("--iterations").as_deref(), Some("30000"));
        assert_eq!(inv.value_of("-r").as_deref(), Some("-1"));
        assert_eq!(inv.value_of("--sh_degree").as_deref(), Some("3"));

        let pos = args.iter().position(|a| a == "--save_iterations").unwrap();
        assert_eq!(&args[pos + 1..pos + 4], &["7000", "15000", "30000"]);
        assert_eq!(args[pos + 4], "-r");
    }

    #[test]
    fn test_relative_repo_path_resolves_script_once() {
        let config = TrainConfig::new("project", "./gaussian-splatting");
        let inv = training_invocation(&config);

        let cwd = inv.cwd.clone().unwrap();
        let script = PathBuf::from(&inv.args[0]);
        assert!(cwd.is_absolute());
        assert!(script.is_absolute());
        assert_eq!(cwd.join(&script), script);
        assert_eq!(script, cwd.join(TRAIN_SCRIPT));
        assert!(script.ends_with("gaussian-splatting/train.py"));
        assert!(!script.to_string_lossy().contains("gaussian-splatting/./gaussian-splatting"));
    }

    #[test]
    fn test_training_invocation_overrides() {
        let mut config = TrainConfig::new("/data/p", "/opt/gs");
        config.iterations = 7000;
        config.save_iterations = vec![7000];
        config.resolution = Some(2);
        config.sh_degree = 1;
        config.output = Some(PathBuf::from("/out"));

        let inv = training_invocation(&config);
        assert_eq!(inv.value_of("-m").as_deref(), Some("/out"));
        assert_eq!(inv.value_of("--save_iterations").as_deref(), Some("7000"));
        assert_eq!(inv.value_of("-r").as_deref(), Some("2"));
        assert_eq!(inv.value_of("--sh_degree").as_deref(), Some("1"));
    }

    #[test]
    fn test_run_training_reports_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let gs = fake_repo(dir.path());
        let source = dir.path().join("project");
        let config = TrainConfig::new(&source, &gs);

        let output = config.output_dir();
        let mut runner = RecordingRunner::with_hook(move |_| {
            let ply = checkpoint_ply(&output, 7000);
            fs::create_dir_all(ply.parent().unwrap()).unwrap();
            fs::write(&ply, vec![0u8; 2048]).unwrap();
            ToolOutcome::ok()
        });

        let report = run_training(&config, &mut runner).unwrap();
        assert_eq!(runner.steps(), vec!["Training"]);
        assert_eq!(report.checkpoints.len(), 3);
        assert_eq!(report.checkpoints[0].size_bytes, Some(2048));
        assert_eq!(report.checkpoints[1].size_bytes, None);
        assert_eq!(
            report.final_ply,
            source.join("output/point_cloud/iteration_30000/point_cloud.ply")
        );
    }

    #[test]
    fn test_training_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let gs = fake_repo(dir.path());
        let config = TrainConfig::new(dir.path().join("project"), gs);
        let mut runner = RecordingRunner::with_hook(|_| ToolOutcome::failed(1));

        assert!(matches!(
            run_training(&config, &mut runner),
            Err(StageError::ToolFailed { code: Some(1), .. })
        ));
    }

    #[test]
    fn test_missing_repo_and_bad_sh_degree() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = RecordingRunner::new();

        let config = TrainConfig::new(dir.path(), dir.path().join("gs"));
        assert!(matches!(
            run_training(&config, &mut runner),
            Err(StageError::Setup(_))
        ));

        let mut config = TrainConfig::new(dir.path(), fake_repo(dir.path()));
        config.sh_degree = 4;
        assert!(matches!(
            run_training(&config, &mut runner),
            Err(StageError::Setup(_))
        ));
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn test_ensure_repo_clones_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let gs = dir.path().join("gs");
        let config = TrainConfig::new(dir.path(), &gs);

        let mut runner = RecordingRunner::with_hook(|inv| {
            let target = PathBuf::from(inv.args.last().unwrap());
            fs::create_dir_all(&target).unwrap();
            fs::write(target.join(TRAIN_SCRIPT), "").unwrap();
            ToolOutcome::ok()
        });

        assert_eq!(ensure_repo(&config, &mut runner).unwrap(), RepoStatus::Cloned);
        let clone = &runner.calls[0];
        assert_eq!(clone.program, "git");
        assert_eq!(
            clone.args_lossy()[..3],
            ["clone", config.repo_url.as_str(), "--recursive"]
        );

        // Second call finds the checkout.
        assert_eq!(ensure_repo(&config, &mut runner).unwrap(), RepoStatus::Present);
        assert_eq!(runner.calls.len(), 1);
    }

    #[test]
    fn test_ensure_repo_clone_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainConfig::new(dir.path(), dir.path().join("gs"));
        let mut runner = RecordingRunner::with_hook(|_| ToolOutcome::failed(128));
        assert!(matches!(
            ensure_repo(&config, &mut runner),
            Err(StageError::ToolFailed { code: Some(128), .. })
        ));
    }

    #[test]
    fn test_ensure_repo_rejects_foreign_directory() {
        let dir = tempfile::tempdir().unwrap();
        let gs = dir.path().join("gs");
        fs::create_dir_all(&gs).unwrap();
        fs::write(gs.join("README.md"), "other").unwrap();

        let mut runner = RecordingRunner::new();
        let config = TrainConfig::new(dir.path(), &gs);
        assert!(matches!(
            ensure_repo(&config, &mut runner),
            Err(StageError::Setup(_))
        ));
        assert!(runner.calls.is_empty());
    }

    #[test]
    fn test_prepare_environment() {
        let dir = tempfile::tempdir().unwrap();
        let gs = fake_repo(dir.path());
        let config = TrainConfig::new(dir.path(), &gs);

        let submodules = gs.join("submodules");
        let mut runner = RecordingRunner::with_hook(move |inv| {
            if inv.step == "Submodule init" {
                fs::create_dir_all(submodules.join("simple-knn")).unwrap();
            }
            ToolOutcome::ok()
        });

        prepare_environment(&config, &mut runner).unwrap();
        assert_eq!(runner.steps(), vec!["Submodule init", "Install simple-knn"]);
        let install = &runner.calls[1];
        assert_eq!(install.args_lossy()[..3], ["-m", "pip", "install"]);
        assert_eq!(install.cwd, None);
        assert_eq!(runner.calls[0].cwd.as_deref(), Some(gs.as_path()));
    }

    #[test]
    fn test_prepare_environment_skips_initialized_submodules() {
        let dir = tempfile::tempdir().unwrap();
        let gs = fake_repo(dir.path());
        for package in EXTENSION_PACKAGES {
            fs::create_dir_all(gs.join("submodules").join(package)).unwrap();
        }
        let config = TrainConfig::new(dir.path(), &gs);

        let mut runner = RecordingRunner::with_hook(|_| ToolOutcome::failed(1));
        prepare_environment(&config, &mut runner).unwrap();
        assert_eq!(
            runner.steps(),
            vec![
                "Install diff-gaussian-rasterization",
                "Install simple-knn"
            ]
        );
    }
}
