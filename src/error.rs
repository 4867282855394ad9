use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BundlerError {
    #[error("missing config file extract-bundler.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid bundle target: {0}")]
    InvalidTarget(String),

    #[error("source request failed for {source_name}: {message}")]
    SourceHttp {
        source_name: String,
        message: String,
    },

    #[error("source {source_name} returned status {status}")]
    SourceStatus { source_name: String, status: u16 },

    #[error("required sources not merged: {}", missing.join(", "))]
    IncompleteSources { missing: Vec<String> },

    #[error("authentication against the metadata center failed: {0}")]
    Authentication(String),

    #[error("metadata center request failed: {0}")]
    CatalogHttp(String),

    #[error("metadata center returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("unable to update csw publication after {attempts} attempts")]
    PublishExhausted { attempts: u32 },

    #[error("upload request failed: {0}")]
    UploadHttp(String),

    #[error("blob store returned status {status}: {message}")]
    UploadStatus { status: u16, message: String },

    #[error("duplicate entry {entry} in archive {archive}")]
    DuplicateEntry { archive: String, entry: String },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("expected exactly one data directory in workspace, found {found}")]
    DataRoot { found: usize },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("{program} exited with code {code:?}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    ToolFailed {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl BundlerError {
    pub fn archive(err: impl std::fmt::Display) -> Self {
        BundlerError::Archive(err.to_string())
    }

    pub fn filesystem(err: impl std::fmt::Display) -> Self {
        BundlerError::Filesystem(err.to_string())
    }

    /// Process exit code for this failure class.
    pub fn exit_code(&self) -> u8 {
        match self {
            BundlerError::MissingConfig
            | BundlerError::ConfigRead(_)
            | BundlerError::ConfigParse(_)
            | BundlerError::InvalidConfig(_)
            | BundlerError::InvalidTarget(_) => 2,
            BundlerError::SourceHttp { .. }
            | BundlerError::SourceStatus { .. }
            | BundlerError::Authentication(_)
            | BundlerError::CatalogHttp(_)
            | BundlerError::CatalogStatus { .. }
            | BundlerError::PublishExhausted { .. }
            | BundlerError::UploadHttp(_)
            | BundlerError::UploadStatus { .. }
            | BundlerError::MissingTool(_)
            | BundlerError::ToolFailed { .. } => 3,
            _ => 1,
        }
    }
}
