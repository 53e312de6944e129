//! Sparse model discovery and selection.
//!
//! The mapper may split a capture into several disjoint models. Exactly one is
//! carried into dense reconstruction; which one is a policy decision, and the
//! operator is warned whenever alternatives are dropped.
use crate::error::PipelineError;
use crate::progress::{ProgressEvent, ProgressSink};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// One reconstructed component under `sparse/<index>/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseModel {
    pub index: u32,
    pub path: PathBuf,
    /// Registered image count, when the model files expose it.
    pub registered_images: Option<u64>,
}

/// All models produced by one mapping run, ordered by index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseModelSet {
    models: Vec<SparseModel>,
}

impl SparseModelSet {
    pub fn new(mut models: Vec<SparseModel>) -> Self {
        models.sort_by_key(|model| model.index);
        Self { models }
    }

    /// Scan a sparse directory for numbered, non-empty model directories.
    ///
    /// A missing directory yields an empty set.
    pub fn discover(sparse_dir: &Path) -> Result<Self> {
        if !sparse_dir.is_dir() {
            return Ok(Self::default());
        }
        let mut models = Vec::new();
        for entry in
            fs::read_dir(sparse_dir).with_context(|| format!("read {}", sparse_dir.display()))?
        {
            let entry = entry.with_context(|| format!("read {}", sparse_dir.display()))?;
            let path = entry.path();
            let Some(index) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if !crate::workspace::is_non_empty_dir(&path) {
                continue;
            }
            let registered_images = read_registered_images(&path);
            models.push(SparseModel {
                index,
                path,
                registered_images,
            });
        }
        Ok(Self::new(models))
    }

    pub fn models(&self) -> &[SparseModel] {
        &self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

/// How to choose among several disjoint models.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionPolicy {
    /// Carry the lowest-indexed model forward
    #[default]
    LowestIndex,
    /// Carry the model with the most registered images forward
    MostRegisteredImages,
}

/// Raised when the mapper produced more than one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentationWarning {
    pub total_models: usize,
    pub discarded: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub chosen: SparseModel,
    pub warning: Option<FragmentationWarning>,
}

/// Pick a model without emitting anything. Same set, same answer.
pub fn choose_model(
    set: &SparseModelSet,
    policy: SelectionPolicy,
    sparse_dir: &Path,
) -> Result<ModelSelection, PipelineError> {
    let models = set.models();
    let chosen = match policy {
        SelectionPolicy::LowestIndex => models.first(),
        SelectionPolicy::MostRegisteredImages => models.iter().max_by(|a, b| {
            a.registered_images
                .unwrap_or(0)
                .cmp(&b.registered_images.unwrap_or(0))
                .then(b.index.cmp(&a.index))
        }),
    }
    .ok_or_else(|| PipelineError::NoModel {
        path: sparse_dir.to_path_buf(),
    })?
    .clone();

    let warning = (models.len() > 1).then(|| FragmentationWarning {
        total_models: models.len(),
        discarded: models
            .iter()
            .map(|model| model.index)
            .filter(|index| *index != chosen.index)
            .collect(),
    });
    Ok(ModelSelection { chosen, warning })
}

/// Pick a model and report the choice, plus one warning if others were dropped.
pub fn select_model(
    set: &SparseModelSet,
    policy: SelectionPolicy,
    sparse_dir: &Path,
    sink: &mut dyn ProgressSink,
) -> Result<ModelSelection, PipelineError> {
    let selection = choose_model(set, policy, sparse_dir)?;
    sink.emit(ProgressEvent::ModelSelected {
        index: selection.chosen.index,
        total_models: set.len(),
        registered_images: selection.chosen.registered_images,
    });
    if let Some(warning) = &selection.warning {
        sink.emit(ProgressEvent::FragmentedReconstruction {
            total_models: warning.total_models,
            chosen: selection.chosen.index,
            discarded: warning.discarded.clone(),
        });
    }
    Ok(selection)
}

/// Read the registered image count from `images.bin` or `images.txt`.
fn read_registered_images(model_dir: &Path) -> Option<u64> {
    let bin = model_dir.join("images.bin");
    if bin.is_file() {
        let mut header = [0u8; 8];
        let mut file = fs::File::open(&bin).ok()?;
        file.read_exact(&mut header).ok()?;
        return Some(u64::from_le_bytes(header));
    }
    let text = fs::read_to_string(model_dir.join("images.txt")).ok()?;
    text.lines()
        .filter_map(|line| line.strip_prefix("# Number of images:"))
        .find_map(|rest| rest.split(',').next()?.trim().parse::<u64>().ok())
}

#[cfg(test)]
#[path = "selector_tests.rs"]
mod tests;
