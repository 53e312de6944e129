//! Typed paths into a reconstruction workspace.
//!
//! The workspace layout alone tells a resumed run where to continue, so every
//! stage derives its input and output paths from here rather than building
//! them ad hoc.
use crate::error::PipelineError;
use crate::stage::StageSpec;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File extensions the feature extractor accepts, compared case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "bmp"];

/// Below this many images a reconstruction rarely registers a usable model.
pub const MIN_RECOMMENDED_IMAGES: usize = 3;

/// Convenience wrapper for locating workspace artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspacePaths {
    root: PathBuf,
}

impl WorkspacePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `database.db` feature database path.
    pub fn database_path(&self) -> PathBuf {
        self.root.join("database.db")
    }

    /// Return the `sparse/` model collection directory.
    pub fn sparse_dir(&self) -> PathBuf {
        self.root.join("sparse")
    }

    /// Return the `sparse/<index>/` directory of one reconstructed model.
    pub fn model_dir(&self, index: u32) -> PathBuf {
        self.sparse_dir().join(index.to_string())
    }

    /// Return the `dense/` workspace directory.
    pub fn dense_dir(&self) -> PathBuf {
        self.root.join("dense")
    }

    pub fn dense_images_dir(&self) -> PathBuf {
        self.dense_dir().join("images")
    }

    pub fn dense_sparse_dir(&self) -> PathBuf {
        self.dense_dir().join("sparse")
    }

    pub fn dense_stereo_dir(&self) -> PathBuf {
        self.dense_dir().join("stereo")
    }

    pub fn depth_maps_dir(&self) -> PathBuf {
        self.dense_stereo_dir().join("depth_maps")
    }

    pub fn normal_maps_dir(&self) -> PathBuf {
        self.dense_stereo_dir().join("normal_maps")
    }

    /// Return the `dense/fused.ply` terminal artifact path.
    pub fn fused_path(&self) -> PathBuf {
        self.dense_dir().join("fused.ply")
    }

    /// Return the `progress.jsonl` append-only progress log path.
    pub fn progress_log_path(&self) -> PathBuf {
        self.root.join("progress.jsonl")
    }

    /// Return the `run.json` summary of the most recent run.
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("run.json")
    }
}

/// How an artifact is judged present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCheck {
    NonEmptyFile,
    NonEmptyDir,
    /// A directory the producing stage must create; its contents are judged
    /// by a later step.
    Directory,
}

/// A path a stage reads or writes, with the check that proves it present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub label: &'static str,
    pub path: PathBuf,
    pub check: ArtifactCheck,
}

impl Artifact {
    pub fn file(label: &'static str, path: PathBuf) -> Self {
        Self {
            label,
            path,
            check: ArtifactCheck::NonEmptyFile,
        }
    }

    pub fn dir(label: &'static str, path: PathBuf) -> Self {
        Self {
            label,
            path,
            check: ArtifactCheck::NonEmptyDir,
        }
    }

    pub fn directory(label: &'static str, path: PathBuf) -> Self {
        Self {
            label,
            path,
            check: ArtifactCheck::Directory,
        }
    }

    /// Post-run check: did the producing stage leave this artifact behind?
    pub fn is_produced(&self) -> bool {
        match self.check {
            ArtifactCheck::Directory => self.path.is_dir(),
            ArtifactCheck::NonEmptyFile | ArtifactCheck::NonEmptyDir => self.is_satisfied(),
        }
    }

    /// Resume check: the artifact exists and is non-empty.
    pub fn is_satisfied(&self) -> bool {
        match self.check {
            ArtifactCheck::NonEmptyFile => is_non_empty_file(&self.path),
            ArtifactCheck::NonEmptyDir | ArtifactCheck::Directory => {
                is_non_empty_dir(&self.path)
            }
        }
    }

    /// Post-run check that also rejects outputs left over from an earlier run.
    ///
    /// A file must have been modified at or after `since`; a non-empty
    /// directory must hold at least one such entry. `Directory` outputs are
    /// only checked for existence.
    pub fn is_produced_since(&self, since: SystemTime) -> bool {
        if !self.is_produced() {
            return false;
        }
        match self.check {
            ArtifactCheck::Directory => true,
            ArtifactCheck::NonEmptyFile => modified_since(&self.path, since),
            ArtifactCheck::NonEmptyDir => fs::read_dir(&self.path)
                .map(|entries| {
                    entries
                        .filter_map(|entry| entry.ok())
                        .any(|entry| modified_since(&entry.path(), since))
                })
                .unwrap_or(false),
        }
    }
}

/// Platforms without modification times never report a file as stale.
fn modified_since(path: &Path, since: SystemTime) -> bool {
    match fs::metadata(path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified >= since,
        Err(_) => true,
    }
}

/// Create the workspace root and its canonical subdirectories.
///
/// An existing root is reused as-is so a later run can resume from it.
pub fn prepare(output_root: &Path) -> Result<WorkspacePaths, PipelineError> {
    let unusable = |reason: String| PipelineError::Workspace {
        path: output_root.to_path_buf(),
        reason,
    };
    if output_root.exists() && !output_root.is_dir() {
        return Err(unusable("path exists and is not a directory".to_string()));
    }
    fs::create_dir_all(output_root).map_err(|err| unusable(format!("create root: {err}")))?;
    let root = output_root
        .canonicalize()
        .map_err(|err| unusable(format!("resolve root: {err}")))?;

    tempfile::Builder::new()
        .prefix(".precon-write-check")
        .tempfile_in(&root)
        .map_err(|err| unusable(format!("not writable: {err}")))?;

    let paths = WorkspacePaths::new(root);
    for dir in [paths.sparse_dir(), paths.dense_dir()] {
        fs::create_dir_all(&dir)
            .map_err(|err| unusable(format!("create {}: {err}", dir.display())))?;
    }
    tracing::debug!(root = %paths.root().display(), "workspace prepared");
    Ok(paths)
}

/// Check every artifact a stage reads before the stage is invoked.
pub fn verify_predecessor(stage: &StageSpec) -> Result<(), PipelineError> {
    match stage.inputs.iter().find(|input| !input.is_satisfied()) {
        Some(missing) => Err(PipelineError::MissingArtifact {
            stage: stage.name.to_string(),
            path: missing.path.clone(),
        }),
        None => Ok(()),
    }
}

/// Count the files under `dir`, recursively, that the feature extractor
/// would pick up. Symlinked directories are not followed.
pub fn count_images(dir: &Path) -> Result<usize> {
    let mut count = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let path = entry.path();
        if entry.file_type().is_ok_and(|kind| kind.is_dir()) {
            count += count_images(&path)?;
        } else if path.is_file() && has_image_extension(&path) {
            count += 1;
        }
    }
    Ok(count)
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

pub fn is_non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

pub fn is_non_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
#[path = "workspace_tests.rs"]
mod tests;
