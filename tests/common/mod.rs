//! Shared test infrastructure for integration tests.

use anyhow::{anyhow, Result};
use photo_recon::config::{default_config, PipelineConfig};
use photo_recon::engine::{ExitOutcome, OperationRequest, ReconstructionEngine};
use photo_recon::progress::MemorySink;
use photo_recon::workspace::{self, WorkspacePaths};
use photo_recon::{Pipeline, PipelineError, StageId};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Engine stand-in that writes plausible artifacts for each stage.
pub struct FakeEngine {
    workspace: WorkspacePaths,
    /// Registered image count per model written by the mapper.
    pub models: Vec<u64>,
    /// Exit with status 1 when this stage runs.
    pub fail_at: Option<StageId>,
    /// Report success for this stage without writing anything.
    pub silent_at: Option<StageId>,
    pub calls: RefCell<Vec<StageId>>,
}

impl FakeEngine {
    pub fn new(workspace: WorkspacePaths) -> Self {
        Self {
            workspace,
            models: vec![120],
            fail_at: None,
            silent_at: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<StageId> {
        self.calls.borrow().clone()
    }

    pub fn reset_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn produce(&self, stage: StageId) -> Result<()> {
        let ws = &self.workspace;
        match stage {
            StageId::FeatureExtraction => write(&ws.database_path(), b"features"),
            StageId::Matching => write(&ws.database_path(), b"features+matches"),
            StageId::Mapping => {
                fs::create_dir_all(ws.sparse_dir())?;
                for (index, registered) in self.models.iter().enumerate() {
                    let dir = ws.model_dir(u32::try_from(index)?);
                    write(&dir.join("cameras.bin"), b"cameras")?;
                    write(&dir.join("images.bin"), &registered.to_le_bytes())?;
                    write(&dir.join("points3D.bin"), b"points")?;
                }
                Ok(())
            }
            StageId::Undistortion => {
                write(&ws.dense_images_dir().join("img000.jpg"), b"jpg")?;
                write(&ws.dense_sparse_dir().join("cameras.bin"), b"cameras")
            }
            StageId::DenseStereo => {
                write(
                    &ws.depth_maps_dir().join("img000.jpg.geometric.bin"),
                    b"depth",
                )?;
                write(
                    &ws.normal_maps_dir().join("img000.jpg.geometric.bin"),
                    b"normal",
                )
            }
            StageId::Fusion => write(&ws.fused_path(), b"ply\nformat binary_little_endian 1.0\n"),
        }
    }
}

impl ReconstructionEngine for FakeEngine {
    fn execute(&self, request: &OperationRequest<'_>) -> Result<ExitOutcome> {
        self.calls.borrow_mut().push(request.stage);
        if self.fail_at == Some(request.stage) {
            return Ok(ExitOutcome::Code(1));
        }
        if self.silent_at == Some(request.stage) {
            return Ok(ExitOutcome::Success);
        }
        self.produce(request.stage)
            .map_err(|err| anyhow!("fake {}: {err:#}", request.operation))?;
        Ok(ExitOutcome::Success)
    }
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Scratch image directory plus a prepared workspace.
pub struct Scratch {
    _temp: TempDir,
    pub image_dir: PathBuf,
    pub workspace: WorkspacePaths,
}

impl Scratch {
    pub fn new(image_count: usize) -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let image_dir = temp.path().join("photos");
        fs::create_dir_all(&image_dir).expect("create image dir");
        for i in 0..image_count {
            fs::write(image_dir.join(format!("IMG_{i:04}.JPG")), b"jpeg")
                .expect("write image");
        }
        let workspace = workspace::prepare(&temp.path().join("recon")).expect("prepare");
        Self {
            _temp: temp,
            image_dir,
            workspace,
        }
    }

    pub fn engine(&self) -> FakeEngine {
        FakeEngine::new(self.workspace.clone())
    }

    /// Run the pipeline once with `engine`, returning the pipeline result and
    /// the stages it executed.
    pub fn run(
        &self,
        engine: &FakeEngine,
        config: &PipelineConfig,
        sink: &mut MemorySink,
    ) -> (Result<(), PipelineError>, Vec<StageId>) {
        let mut pipeline = Pipeline::new(
            self.image_dir.clone(),
            self.workspace.clone(),
            config,
            engine,
        );
        let result = pipeline.run(sink);
        (result, pipeline.executed().to_vec())
    }

    pub fn run_default(&self, engine: &FakeEngine) -> (Result<(), PipelineError>, Vec<StageId>) {
        let mut sink = MemorySink::default();
        self.run(engine, &default_config(), &mut sink)
    }
}
