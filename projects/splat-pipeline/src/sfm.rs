// COLMAP invoker
//
// Feature extraction -> exhaustive matching -> mapping -> undistortion, then a
// separate repair step that makes sure `sparse/0` holds a model.

use crate::config::SfmConfig;
use crate::error::StageError;
use crate::tool::{run_checked, ToolInvocation, ToolRunner};
use crate::workspace::{is_non_empty_dir, list_images, Workspace};
use clap::ValueEnum;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

const MIN_RECOMMENDED_IMAGES: usize = 10;
const COUNTED_EXTENSIONS: [&str; 2] = ["jpg", "png"];

/// Number of `*.jpg` and `*.png` files in `dir`, matched case-sensitively.
pub fn count_input_images(dir: &Path) -> usize {
    list_images(dir)
        .iter()
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| COUNTED_EXTENSIONS.contains(&e))
        })
        .count()
}

/// Mapper tolerances tuned for small image sets.
pub const MAPPER_OPTIONS: [(&str, &str); 9] = [
    ("--Mapper.ba_global_function_tolerance", "0.000001"),
    ("--Mapper.ba_local_num_images", "6"),
    ("--Mapper.ba_global_points_ratio", "1.1"),
    ("--Mapper.ba_global_max_num_iterations", "50"),
    ("--Mapper.ba_global_max_refinements", "3"),
    ("--Mapper.init_min_num_inliers", "50"),
    ("--Mapper.init_max_error", "4.0"),
    ("--Mapper.tri_min_angle", "1.5"),
    ("--Mapper.tri_ignore_two_view_tracks", "0"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CameraModel {
    #[default]
    #[value(name = "SIMPLE_RADIAL")]
    SimpleRadial,
    #[value(name = "PINHOLE")]
    Pinhole,
    #[value(name = "OPENCV")]
    Opencv,
    #[value(name = "RADIAL")]
    Radial,
}

impl CameraModel {
    pub fn as_colmap_name(&self) -> &'static str {
        match self {
            CameraModel::SimpleRadial => "SIMPLE_RADIAL",
            CameraModel::Pinhole => "PINHOLE",
            CameraModel::Opencv => "OPENCV",
            CameraModel::Radial => "RADIAL",
        }
    }
}

impl fmt::Display for CameraModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_colmap_name())
    }
}

pub fn feature_extraction(ws: &Workspace, config: &SfmConfig) -> ToolInvocation {
    let inv = ToolInvocation::new("Feature extraction", &config.colmap_path)
        .arg("feature_extractor")
        .opt("--database_path", ws.database_path())
        .opt("--image_path", ws.input_dir())
        .opt("--ImageReader.single_camera", "1")
        .opt("--ImageReader.camera_model", config.camera_model.as_colmap_name());
    if config.use_gpu {
        inv
    } else {
        inv.opt("--SiftExtraction.use_gpu", "0")
    }
}

pub fn exhaustive_matching(ws: &Workspace, config: &SfmConfig) -> ToolInvocation {
    let inv = ToolInvocation::new("Feature matching", &config.colmap_path)
        .arg("exhaustive_matcher")
        .opt("--database_path", ws.database_path());
    if config.use_gpu {
        inv
    } else {
        inv.opt("--SiftMatching.use_gpu", "0")
    }
}

pub fn mapping(ws: &Workspace, config: &SfmConfig) -> ToolInvocation {
    MAPPER_OPTIONS.iter().fold(
        ToolInvocation::new("Sparse reconstruction", &config.colmap_path)
            .arg("mapper")
            .opt("--database_path", ws.database_path())
            .opt("--image_path", ws.input_dir())
            .opt("--output_path", ws.distorted_sparse_dir()),
        |inv, (flag, value)| inv.opt(flag, value),
    )
}

pub fn undistortion(ws: &Workspace, config: &SfmConfig) -> ToolInvocation {
    ToolInvocation::new("Image undistortion", &config.colmap_path)
        .arg("image_undistorter")
        .opt("--image_path", ws.input_dir())
        .opt("--input_path", ws.distorted_model_dir())
        .opt("--output_path", ws.root())
        .opt("--output_type", "COLMAP")
}

/// The four COLMAP invocations, in execution order.
pub fn plan(ws: &Workspace, config: &SfmConfig) -> Vec<ToolInvocation> {
    vec![
        feature_extraction(ws, config),
        exhaustive_matching(ws, config),
        mapping(ws, config),
        undistortion(ws, config),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseModelState {
    /// The undistorter wrote `sparse/0` itself.
    Present,
    /// `sparse/0` was filled from `distorted/sparse/0`.
    Copied { files: usize },
    /// Neither location holds a model.
    Missing,
}

/// Make sure `sparse/0` holds a model, copying the mapper output when the
/// undistorter left it elsewhere.
pub fn normalize_sparse_model(ws: &Workspace) -> Result<SparseModelState, StageError> {
    let sparse_dir = ws.sparse_model_dir();
    if is_non_empty_dir(&sparse_dir) {
        return Ok(SparseModelState::Present);
    }

    let source_dir = ws.distorted_model_dir();
    if !is_non_empty_dir(&source_dir) {
        tracing::warn!(
            "No sparse model found in {:?} or {:?}; training will not find a reconstruction",
            sparse_dir,
            source_dir
        );
        return Ok(SparseModelState::Missing);
    }

    tracing::warn!(
        "Undistorter did not write {:?}; copying the model from {:?}. The COLMAP output layout may have changed.",
        sparse_dir,
        source_dir
    );
    fs::create_dir_all(&sparse_dir)?;

    let mut files = 0;
    for entry in fs::read_dir(&source_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), sparse_dir.join(entry.file_name()))?;
            files += 1;
        }
    }

    if files == 0 {
        return Ok(SparseModelState::Missing);
    }
    tracing::info!("Copied {} sparse model files into {:?}", files, sparse_dir);
    Ok(SparseModelState::Copied { files })
}

#[derive(Debug)]
pub struct SfmReport {
    pub image_count: usize,
    pub sparse_model: SparseModelState,
    pub sparse_dir: PathBuf,
    pub images_dir: PathBuf,
}

/// Run the full COLMAP sequence over `<workspace>/input`, stopping at the
/// first failing step.
pub fn run_sfm<R: ToolRunner + ?Sized>(
    config: &SfmConfig,
    runner: &mut R,
) -> Result<SfmReport, StageError> {
    let ws = Workspace::new(&config.workspace);
    let input_dir = ws.input_dir();
    if !input_dir.is_dir() {
        return Err(StageError::Setup(format!(
            "Image folder not found: {:?}",
            input_dir
        )));
    }

    fs::create_dir_all(ws.distorted_sparse_dir())?;

    let image_count = count_input_images(&input_dir);
    tracing::info!("SfM workspace {:?}: {} input images", ws.root(), image_count);
    if image_count < MIN_RECOMMENDED_IMAGES {
        tracing::warn!(
            "Only {} images found; at least 50 are recommended for a stable reconstruction",
            image_count
        );
    }

    let steps = plan(&ws, config);
    let total = steps.len();
    for (i, step) in steps.iter().enumerate() {
        tracing::info!("Step {}/{}: {}", i + 1, total, step.step);
        run_checked(runner, step)?;
    }

    let sparse_model = normalize_sparse_model(&ws)?;
    let report = SfmReport {
        image_count,
        sparse_model,
        sparse_dir: ws.sparse_model_dir(),
        images_dir: ws.images_dir(),
    };

    tracing::info!(
        "COLMAP preprocessing complete: sparse model {:?}, undistorted images {:?}",
        report.sparse_dir,
        report.images_dir
    );
    Ok(report)
}
