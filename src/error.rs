//! Error taxonomy for a reconstruction run.
//!
//! Every variant is fatal to the current run. Recovery is operator-driven:
//! fix the cause, then rerun against the same workspace to resume.
use crate::engine::ExitOutcome;
use std::path::PathBuf;
use thiserror::Error;

/// Exit status for malformed invocations.
pub const USAGE_EXIT_CODE: i32 = 2;
/// Exit status for every failure after argument parsing.
pub const FAILURE_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("usage: {0}")]
    Usage(String),

    #[error("workspace {} is unusable: {reason}", path.display())]
    Workspace { path: PathBuf, reason: String },

    #[error("stage {stage}: required artifact {} is missing or empty", path.display())]
    MissingArtifact { stage: String, path: PathBuf },

    #[error("stage {stage} failed: {status}")]
    StageExecution { stage: String, status: ExitOutcome },

    #[error("stage {stage} reported success but {} is missing or empty", path.display())]
    IncompleteOutput { stage: String, path: PathBuf },

    #[error("no sparse model was reconstructed under {} (check image overlap)", path.display())]
    NoModel { path: PathBuf },
}

impl PipelineError {
    /// Stable machine-readable kind used in run summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Usage(_) => "usage",
            PipelineError::Workspace { .. } => "workspace",
            PipelineError::MissingArtifact { .. } => "missing_artifact",
            PipelineError::StageExecution { .. } => "stage_execution",
            PipelineError::IncompleteOutput { .. } => "incomplete_output",
            PipelineError::NoModel { .. } => "no_model",
        }
    }

    /// Name of the stage the run failed at, when the failure belongs to one.
    pub fn stage(&self) -> Option<&str> {
        match self {
            PipelineError::MissingArtifact { stage, .. }
            | PipelineError::StageExecution { stage, .. }
            | PipelineError::IncompleteOutput { stage, .. } => Some(stage),
            PipelineError::NoModel { .. } => Some(crate::stage::MODEL_SELECTION_STAGE),
            PipelineError::Usage(_) | PipelineError::Workspace { .. } => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Usage(_) => USAGE_EXIT_CODE,
            _ => FAILURE_EXIT_CODE,
        }
    }
}
