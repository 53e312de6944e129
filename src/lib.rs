//! Resumable driver for a photogrammetry reconstruction pipeline.
//!
//! Turns a directory of photographs into a fused dense point cloud by running
//! an external reconstruction engine through six stages over one workspace
//! directory. The workspace layout alone records progress, so rerunning
//! against the same directory resumes after the last completed stage.
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod pipeline;
pub mod progress;
pub mod runner;
pub mod selector;
pub mod stage;
pub mod workspace;

pub use engine::{ExitOutcome, OperationRequest, ReconstructionEngine};
pub use error::PipelineError;
pub use pipeline::{Pipeline, PipelineState, RunSummary};
pub use stage::{StageId, StageSpec};
pub use workspace::WorkspacePaths;
