//! Stage execution.
//!
//! A stage runs at most once per call: inputs are checked first, the engine
//! is invoked synchronously, and declared outputs are checked afterwards even
//! when the engine reports success. An output older than the invocation is
//! treated as missing, so leftovers from an earlier run never pass.
use crate::engine::{ExitOutcome, OperationRequest, ReconstructionEngine};
use crate::error::PipelineError;
use crate::progress::{now_epoch_ms, ProgressEvent, ProgressSink};
use crate::stage::{StageId, StageSpec};
use crate::workspace;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Filesystems with coarse timestamps may date a fresh output slightly before
/// the engine was started.
const MTIME_SLACK: Duration = Duration::from_secs(2);

/// Timing of a completed stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub stage: StageId,
    pub duration_ms: u64,
}

pub struct StageRunner<'a> {
    engine: &'a dyn ReconstructionEngine,
}

impl<'a> StageRunner<'a> {
    pub fn new(engine: &'a dyn ReconstructionEngine) -> Self {
        Self { engine }
    }

    pub fn run(
        &self,
        stage: &StageSpec,
        sink: &mut dyn ProgressSink,
    ) -> Result<StageReport, PipelineError> {
        workspace::verify_predecessor(stage)?;

        let args = stage.command_args();
        let request = OperationRequest {
            stage: stage.id,
            operation: &stage.operation,
            args: &args,
        };
        sink.emit(ProgressEvent::StageStarted {
            stage: stage.name.to_string(),
            operation: stage.operation.clone(),
            command_line: self.engine.describe(&request),
        });

        let started_at_epoch_ms = now_epoch_ms();
        let fresh_after = SystemTime::now()
            .checked_sub(MTIME_SLACK)
            .unwrap_or(UNIX_EPOCH);
        let start = Instant::now();
        let outcome = self
            .engine
            .execute(&request)
            .unwrap_or_else(|err| ExitOutcome::LaunchFailed(format!("{err:#}")));
        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        let missing = outcome
            .success()
            .then(|| {
                stage
                    .outputs
                    .iter()
                    .find(|output| !output.is_produced_since(fresh_after))
            })
            .flatten();
        let status = match missing {
            Some(output) if output.is_produced() => {
                format!("incomplete output: {} was not rewritten", output.label)
            }
            Some(output) => format!("incomplete output: {} missing", output.label),
            None => outcome.to_string(),
        };
        sink.emit(ProgressEvent::StageFinished {
            stage: stage.name.to_string(),
            operation: stage.operation.clone(),
            started_at_epoch_ms,
            finished_at_epoch_ms: now_epoch_ms(),
            duration_ms,
            status,
            success: outcome.success() && missing.is_none(),
        });

        if !outcome.success() {
            return Err(PipelineError::StageExecution {
                stage: stage.name.to_string(),
                status: outcome,
            });
        }
        if let Some(output) = missing {
            return Err(PipelineError::IncompleteOutput {
                stage: stage.name.to_string(),
                path: output.path.clone(),
            });
        }
        Ok(StageReport {
            stage: stage.id,
            duration_ms,
        })
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
