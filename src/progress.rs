//! Structured progress records.
//!
//! The orchestrator reports what it does as typed records and leaves their
//! presentation to sinks: `tracing` events for the terminal, JSONL for the
//! workspace log, and an in-memory buffer for tests.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const PROGRESS_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub schema_version: u32,
    pub epoch_ms: u64,
    #[serde(flatten)]
    pub event: ProgressEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        image_dir: String,
        workspace: String,
        resume: bool,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    StageStarted {
        stage: String,
        operation: String,
        command_line: String,
    },
    StageFinished {
        stage: String,
        operation: String,
        started_at_epoch_ms: u64,
        finished_at_epoch_ms: u64,
        duration_ms: u64,
        status: String,
        success: bool,
    },
    ModelSelected {
        index: u32,
        total_models: usize,
        registered_images: Option<u64>,
    },
    FragmentedReconstruction {
        total_models: usize,
        chosen: u32,
        discarded: Vec<u32>,
    },
    Warning {
        code: String,
        message: String,
    },
    RunFinished {
        success: bool,
        failed_stage: Option<String>,
        executed: usize,
        skipped: usize,
    },
}

impl ProgressEvent {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ProgressEvent::FragmentedReconstruction { .. } | ProgressEvent::Warning { .. }
        )
    }
}

impl ProgressRecord {
    pub fn new(event: ProgressEvent) -> Self {
        Self {
            schema_version: PROGRESS_SCHEMA_VERSION,
            epoch_ms: now_epoch_ms(),
            event,
        }
    }
}

/// Current epoch time in milliseconds; a clock before 1970 reads as zero.
pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Consumer of progress records. Sinks never fail the run.
pub trait ProgressSink {
    fn record(&mut self, record: &ProgressRecord);

    fn emit(&mut self, event: ProgressEvent) {
        self.record(&ProgressRecord::new(event));
    }
}

/// Forward records to `tracing` with structured fields.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn record(&mut self, record: &ProgressRecord) {
        match &record.event {
            ProgressEvent::RunStarted {
                image_dir,
                workspace,
                resume,
            } => tracing::info!(%image_dir, %workspace, resume, "run started"),
            ProgressEvent::StageSkipped { stage, reason } => {
                tracing::info!(%stage, %reason, "stage skipped")
            }
            ProgressEvent::StageStarted {
                stage,
                operation,
                command_line,
            } => tracing::info!(%stage, %operation, %command_line, "stage started"),
            ProgressEvent::StageFinished {
                stage,
                duration_ms,
                status,
                success,
                ..
            } => {
                if *success {
                    tracing::info!(%stage, elapsed_ms = *duration_ms, %status, "stage finished");
                } else {
                    tracing::error!(%stage, elapsed_ms = *duration_ms, %status, "stage failed");
                }
            }
            ProgressEvent::ModelSelected {
                index,
                total_models,
                registered_images,
            } => tracing::info!(
                index,
                total_models,
                registered_images = ?registered_images,
                "sparse model selected"
            ),
            ProgressEvent::FragmentedReconstruction {
                total_models,
                chosen,
                discarded,
            } => tracing::warn!(
                total_models,
                chosen,
                discarded = ?discarded,
                "mapping produced disjoint models; image overlap is likely insufficient"
            ),
            ProgressEvent::Warning { code, message } => tracing::warn!(%code, "{message}"),
            ProgressEvent::RunFinished {
                success,
                failed_stage,
                executed,
                skipped,
            } => tracing::info!(
                success,
                failed_stage = ?failed_stage,
                executed,
                skipped,
                "run finished"
            ),
        }
    }
}

/// Append records as JSON lines to a file.
#[derive(Debug, Clone)]
pub struct JsonlSink {
    path: PathBuf,
}

impl JsonlSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ProgressSink for JsonlSink {
    fn record(&mut self, record: &ProgressRecord) {
        if let Err(err) = append_record(&self.path, record) {
            tracing::warn!(path = %self.path.display(), "progress log write failed: {err:#}");
        }
    }
}

fn append_record(path: &Path, record: &ProgressRecord) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let line = serde_json::to_string(record).context("serialize progress record")?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Keep records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub records: Vec<ProgressRecord>,
}

impl MemorySink {
    pub fn events(&self) -> impl Iterator<Item = &ProgressEvent> {
        self.records.iter().map(|record| &record.event)
    }

    pub fn warning_count(&self) -> usize {
        self.events().filter(|event| event.is_warning()).count()
    }
}

impl ProgressSink for MemorySink {
    fn record(&mut self, record: &ProgressRecord) {
        self.records.push(record.clone());
    }
}

/// Send every record to each inner sink in order.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: Box<dyn ProgressSink>) {
        self.sinks.push(sink);
    }
}

impl ProgressSink for FanoutSink {
    fn record(&mut self, record: &ProgressRecord) {
        for sink in &mut self.sinks {
            sink.record(record);
        }
    }
}

#[cfg(test)]
#[path = "progress_tests.rs"]
mod tests;
