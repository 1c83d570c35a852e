use std::path::PathBuf;
use thiserror::Error;

/// Failures raised while sampling frames out of a video stream.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("Failed to open video stream {path:?}: {reason}")]
    StreamOpen { path: PathBuf, reason: String },

    #[error("Failed to decode frame {index}: {reason}")]
    Decode { index: usize, reason: String },

    #[error("Failed to encode frame {path:?}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a stage that delegates to an external tool.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{0}")]
    Setup(String),

    #[error("Failed to launch {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} failed with {}", exit_label(.code))]
    ToolFailed { step: String, code: Option<i32> },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "termination by signal".to_string(),
    }
}
