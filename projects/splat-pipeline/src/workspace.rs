use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];
const METADATA_FILE: &str = "pipeline.json";

/// Directory layout shared by the SfM tool and the training repository.
///
/// ```text
/// <root>/input/                  sampled frames
/// <root>/distorted/database.db   feature database
/// <root>/distorted/sparse/0/     mapper output
/// <root>/sparse/0/               undistorted sparse model
/// <root>/images/                 undistorted images
/// <root>/output/point_cloud/iteration_<N>/point_cloud.ply
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    pub fn distorted_dir(&self) -> PathBuf {
        self.root.join("distorted")
    }

    pub fn database_path(&self) -> PathBuf {
        self.distorted_dir().join("database.db")
    }

    pub fn distorted_sparse_dir(&self) -> PathBuf {
        self.distorted_dir().join("sparse")
    }

    /// First reconstruction written by the mapper.
    pub fn distorted_model_dir(&self) -> PathBuf {
        self.distorted_sparse_dir().join("0")
    }

    pub fn sparse_model_dir(&self) -> PathBuf {
        self.root.join("sparse").join("0")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn default_output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
}

/// Location of the point cloud saved at `iteration` under a training output directory.
pub fn checkpoint_ply(output_dir: &Path, iteration: u32) -> PathBuf {
    output_dir
        .join("point_cloud")
        .join(format!("iteration_{}", iteration))
        .join("point_cloud.ply")
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| IMAGE_EXTENSIONS.contains(&s.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Images directly inside `dir`, sorted by file name.
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| is_image_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    images.sort();
    images
}

pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StageRecord {
    pub stage: String,
    pub completed_at: DateTime<Utc>,
}

/// Run history persisted as `pipeline.json` in the workspace root.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RunMetadata {
    #[serde(default)]
    pub video: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(skip)]
    path: PathBuf,
}

impl RunMetadata {
    pub fn load_or_create(workspace: &Workspace) -> Result<Self> {
        let path = workspace.root().join(METADATA_FILE);
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {:?}", path))?;
            let mut metadata: RunMetadata = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {:?}", path))?;
            metadata.path = path;
            return Ok(metadata);
        }

        Ok(Self {
            video: None,
            created_at: Utc::now(),
            stages: Vec::new(),
            path,
        })
    }

    pub fn record_stage(&mut self, stage: &str) -> Result<()> {
        self.stages.push(StageRecord {
            stage: stage.to_string(),
            completed_at: Utc::now(),
        });
        self.save()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, content).with_context(|| format!("Failed to write {:?}", self.path))?;
        Ok(())
    }
}
