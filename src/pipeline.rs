//! Pipeline orchestration.
//!
//! Drives the six engine stages in order, with model selection between
//! mapping and undistortion. With resume enabled, leading stages whose
//! results are already in the workspace are skipped; once any stage runs,
//! every later stage runs too because its inputs changed.
use crate::config::PipelineConfig;
use crate::engine::{ExitOutcome, ReconstructionEngine};
use crate::error::PipelineError;
use crate::interrupt::Interrupt;
use crate::progress::{now_epoch_ms, ProgressEvent, ProgressSink};
use crate::runner::StageRunner;
use crate::selector::{choose_model, select_model, ModelSelection, SparseModelSet};
use crate::stage::{StageContext, StageId, StageSpec, MODEL_SELECTION_STAGE};
use crate::workspace::{self, WorkspacePaths, MIN_RECOMMENDED_IMAGES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SUMMARY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineState {
    Initialized,
    ExtractingFeatures,
    Matching,
    Mapping,
    SelectingModel,
    Undistorting,
    ComputingStereo,
    Fusing,
    Completed,
    Failed(String),
}

impl PipelineState {
    pub fn for_stage(stage: StageId) -> Self {
        match stage {
            StageId::FeatureExtraction => PipelineState::ExtractingFeatures,
            StageId::Matching => PipelineState::Matching,
            StageId::Mapping => PipelineState::Mapping,
            StageId::Undistortion => PipelineState::Undistorting,
            StageId::DenseStereo => PipelineState::ComputingStereo,
            StageId::Fusion => PipelineState::Fusing,
        }
    }

    /// Name of the step this state is working on, if any.
    pub fn stage_name(&self) -> Option<&str> {
        match self {
            PipelineState::ExtractingFeatures => Some(StageId::FeatureExtraction.name()),
            PipelineState::Matching => Some(StageId::Matching.name()),
            PipelineState::Mapping => Some(StageId::Mapping.name()),
            PipelineState::SelectingModel => Some(MODEL_SELECTION_STAGE),
            PipelineState::Undistorting => Some(StageId::Undistortion.name()),
            PipelineState::ComputingStereo => Some(StageId::DenseStereo.name()),
            PipelineState::Fusing => Some(StageId::Fusion.name()),
            PipelineState::Failed(stage) => Some(stage),
            PipelineState::Initialized | PipelineState::Completed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed(_))
    }
}

/// One reconstruction run over one workspace.
#[derive(Debug, Clone)]
pub struct Job {
    pub image_dir: PathBuf,
    pub workspace: WorkspacePaths,
    pub state: PipelineState,
}

/// Whether a stage would be skipped by a resumed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Satisfied,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub stage: StageId,
    pub status: PlanStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub stage: Option<String>,
    pub message: String,
}

/// Machine-readable outcome of a run, written to `run.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub generated_at_epoch_ms: u64,
    pub image_dir: String,
    pub workspace: String,
    pub state: PipelineState,
    pub success: bool,
    pub executed: Vec<StageId>,
    pub skipped: Vec<StageId>,
    pub chosen_model: Option<u32>,
    pub fused_path: Option<String>,
    pub warnings: Vec<String>,
    pub error: Option<RunError>,
}

pub struct Pipeline<'a> {
    job: Job,
    config: &'a PipelineConfig,
    engine: &'a dyn ReconstructionEngine,
    interrupt: Interrupt,
    resume: bool,
    executed: Vec<StageId>,
    skipped: Vec<StageId>,
    selection: Option<ModelSelection>,
    warnings: Vec<String>,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        image_dir: PathBuf,
        workspace: WorkspacePaths,
        config: &'a PipelineConfig,
        engine: &'a dyn ReconstructionEngine,
    ) -> Self {
        Self {
            job: Job {
                image_dir,
                workspace,
                state: PipelineState::Initialized,
            },
            config,
            engine,
            interrupt: Interrupt::new(),
            resume: true,
            executed: Vec::new(),
            skipped: Vec::new(),
            selection: None,
            warnings: Vec::new(),
        }
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn executed(&self) -> &[StageId] {
        &self.executed
    }

    pub fn skipped(&self) -> &[StageId] {
        &self.skipped
    }

    /// Run every stage to completion or to the first failure.
    ///
    /// Nothing is cleaned up on failure; the workspace is left for diagnosis
    /// and a later resumed run.
    pub fn run(&mut self, sink: &mut dyn ProgressSink) -> Result<(), PipelineError> {
        sink.emit(ProgressEvent::RunStarted {
            image_dir: self.job.image_dir.display().to_string(),
            workspace: self.job.workspace.root().display().to_string(),
            resume: self.resume,
        });
        let result = self.run_stages(sink);
        let failed_stage = match &result {
            Ok(()) => {
                self.job.state = PipelineState::Completed;
                None
            }
            Err(err) => {
                let stage = err
                    .stage()
                    .or_else(|| self.job.state.stage_name())
                    .unwrap_or("initialization")
                    .to_string();
                self.job.state = PipelineState::Failed(stage.clone());
                Some(stage)
            }
        };
        sink.emit(ProgressEvent::RunFinished {
            success: result.is_ok(),
            failed_stage,
            executed: self.executed.len(),
            skipped: self.skipped.len(),
        });
        result
    }

    fn run_stages(&mut self, sink: &mut dyn ProgressSink) -> Result<(), PipelineError> {
        self.check_images(sink)?;
        let runner = StageRunner::new(self.engine);
        let mut resuming = self.resume;

        for id in StageId::ALL {
            if id == StageId::Undistortion {
                self.job.state = PipelineState::SelectingModel;
                let sparse_dir = self.job.workspace.sparse_dir();
                let set = discover_models(&sparse_dir)?;
                let selection =
                    select_model(&set, self.config.selection_policy, &sparse_dir, sink)?;
                if let Some(warning) = &selection.warning {
                    self.warnings.push(format!(
                        "mapping produced {} disjoint models; kept {}, discarded {:?}",
                        warning.total_models, selection.chosen.index, warning.discarded
                    ));
                }
                self.selection = Some(selection);
            }

            self.job.state = PipelineState::for_stage(id);
            if self.interrupt.is_raised() {
                return Err(PipelineError::StageExecution {
                    stage: id.name().to_string(),
                    status: ExitOutcome::Interrupted,
                });
            }

            let spec = self.stage_spec(id)?;
            if resuming && spec.is_satisfied() {
                sink.emit(ProgressEvent::StageSkipped {
                    stage: spec.name.to_string(),
                    reason: "already satisfied".to_string(),
                });
                self.skipped.push(id);
                continue;
            }
            resuming = false;
            runner.run(&spec, sink)?;
            self.executed.push(id);
        }

        let fused = self.job.workspace.fused_path();
        if !workspace::is_non_empty_file(&fused) {
            return Err(PipelineError::IncompleteOutput {
                stage: StageId::Fusion.name().to_string(),
                path: fused,
            });
        }
        Ok(())
    }

    /// Report which stages a resumed run would skip, without touching disk.
    pub fn plan(&self) -> Result<Vec<PlanEntry>, PipelineError> {
        let mut entries = Vec::with_capacity(StageId::ALL.len());
        let mut resuming = self.resume;
        let mut selection = None;
        for id in StageId::ALL {
            if id == StageId::Undistortion && resuming {
                let sparse_dir = self.job.workspace.sparse_dir();
                let set = discover_models(&sparse_dir)?;
                selection = choose_model(&set, self.config.selection_policy, &sparse_dir).ok();
                resuming = selection.is_some();
            }
            let satisfied = resuming
                && StageSpec::build(id, &self.context(selection.as_ref()))
                    .map(|spec| spec.is_satisfied())
                    .unwrap_or(false);
            resuming = satisfied;
            entries.push(PlanEntry {
                stage: id,
                status: if satisfied {
                    PlanStatus::Satisfied
                } else {
                    PlanStatus::Pending
                },
            });
        }
        Ok(entries)
    }

    pub fn summary(&self, error: Option<&PipelineError>) -> RunSummary {
        let fused = self.job.workspace.fused_path();
        RunSummary {
            schema_version: SUMMARY_SCHEMA_VERSION,
            generated_at_epoch_ms: now_epoch_ms(),
            image_dir: self.job.image_dir.display().to_string(),
            workspace: self.job.workspace.root().display().to_string(),
            state: self.job.state.clone(),
            success: self.job.state == PipelineState::Completed,
            executed: self.executed.clone(),
            skipped: self.skipped.clone(),
            chosen_model: self.selection.as_ref().map(|s| s.chosen.index),
            fused_path: workspace::is_non_empty_file(&fused).then(|| fused.display().to_string()),
            warnings: self.warnings.clone(),
            error: error.map(|err| RunError {
                kind: err.kind().to_string(),
                stage: err.stage().map(str::to_string),
                message: err.to_string(),
            }),
        }
    }

    fn stage_spec(&self, id: StageId) -> Result<StageSpec, PipelineError> {
        StageSpec::build(id, &self.context(self.selection.as_ref()))
    }

    fn context<'s>(&'s self, selection: Option<&'s ModelSelection>) -> StageContext<'s> {
        StageContext {
            image_dir: &self.job.image_dir,
            workspace: &self.job.workspace,
            model: selection.map(|s| &s.chosen),
            config: self.config,
        }
    }

    fn check_images(&mut self, sink: &mut dyn ProgressSink) -> Result<(), PipelineError> {
        let image_dir = &self.job.image_dir;
        let missing = || PipelineError::MissingArtifact {
            stage: StageId::FeatureExtraction.name().to_string(),
            path: image_dir.clone(),
        };
        let count = workspace::count_images(image_dir).map_err(|_| missing())?;
        if count == 0 {
            return Err(missing());
        }
        if count < MIN_RECOMMENDED_IMAGES {
            let message = format!(
                "only {count} image(s) in {}; at least {MIN_RECOMMENDED_IMAGES} overlapping views are recommended",
                image_dir.display()
            );
            sink.emit(ProgressEvent::Warning {
                code: "few_images".to_string(),
                message: message.clone(),
            });
            self.warnings.push(message);
        }
        Ok(())
    }
}

fn discover_models(sparse_dir: &Path) -> Result<SparseModelSet, PipelineError> {
    SparseModelSet::discover(sparse_dir).map_err(|err| PipelineError::Workspace {
        path: sparse_dir.to_path_buf(),
        reason: format!("{err:#}"),
    })
}

/// Persist the run summary next to the workspace artifacts.
pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    let text = serde_json::to_string_pretty(summary).context("serialize run summary")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
