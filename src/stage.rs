//! Declarative stage descriptors.
//!
//! Each stage is described by the artifacts it reads, the artifacts it must
//! leave behind, and the engine arguments that connect the two. The
//! orchestrator walks these descriptors in a single loop.
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::selector::SparseModel;
use crate::workspace::{Artifact, WorkspacePaths};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Name reported for failures in the model selection step, which has no
/// engine operation of its own.
pub const MODEL_SELECTION_STAGE: &str = "model-selection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    FeatureExtraction,
    Matching,
    Mapping,
    Undistortion,
    DenseStereo,
    Fusion,
}

impl StageId {
    /// Every stage in execution order.
    pub const ALL: [StageId; 6] = [
        StageId::FeatureExtraction,
        StageId::Matching,
        StageId::Mapping,
        StageId::Undistortion,
        StageId::DenseStereo,
        StageId::Fusion,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StageId::FeatureExtraction => "feature-extraction",
            StageId::Matching => "matching",
            StageId::Mapping => "mapping",
            StageId::Undistortion => "undistortion",
            StageId::DenseStereo => "dense-stereo",
            StageId::Fusion => "fusion",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        StageId::ALL.into_iter().find(|stage| stage.name() == name)
    }
}

/// One engine invocation with its input/output contract.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: StageId,
    pub name: &'static str,
    pub operation: String,
    pub inputs: Vec<Artifact>,
    pub outputs: Vec<Artifact>,
    /// Artifacts whose presence proves a previous run completed this stage.
    pub resume_evidence: Vec<Artifact>,
    /// Flag/path pairs in the order the engine receives them.
    pub path_args: Vec<(&'static str, PathBuf)>,
    pub options: Vec<String>,
}

/// Everything a stage descriptor is derived from.
pub struct StageContext<'a> {
    pub image_dir: &'a Path,
    pub workspace: &'a WorkspacePaths,
    pub model: Option<&'a SparseModel>,
    pub config: &'a PipelineConfig,
}

impl StageSpec {
    pub fn build(id: StageId, ctx: &StageContext<'_>) -> Result<Self, PipelineError> {
        let ws = ctx.workspace;
        let config = ctx.config;
        let images = Artifact::dir("images", ctx.image_dir.to_path_buf());
        let database = Artifact::file("feature database", ws.database_path());

        let mut spec = match id {
            StageId::FeatureExtraction => {
                let mut options = Vec::new();
                if config.single_camera {
                    push_option(&mut options, "--ImageReader.single_camera", "1");
                }
                if let Some(use_gpu) = config.use_gpu {
                    push_option(&mut options, "--SiftExtraction.use_gpu", flag_value(use_gpu));
                }
                StageSpec::new(
                    id,
                    "feature_extractor",
                    vec![images],
                    vec![database],
                    vec![
                        ("--database_path", ws.database_path()),
                        ("--image_path", ctx.image_dir.to_path_buf()),
                    ],
                    options,
                )
            }
            StageId::Matching => {
                let mut options = Vec::new();
                if let Some(use_gpu) = config.use_gpu {
                    push_option(&mut options, "--SiftMatching.use_gpu", flag_value(use_gpu));
                }
                let mut spec = StageSpec::new(
                    id,
                    config.matcher.operation(),
                    vec![database.clone()],
                    vec![database.clone()],
                    vec![("--database_path", ws.database_path())],
                    options,
                );
                // Matching rewrites the database in place, so the database
                // alone cannot tell extraction-only from matched.
                spec.resume_evidence = vec![
                    database,
                    Artifact::dir("sparse models", ws.sparse_dir()),
                ];
                spec
            }
            StageId::Mapping => StageSpec::new(
                id,
                "mapper",
                vec![database, images],
                vec![Artifact::directory("sparse models", ws.sparse_dir())],
                vec![
                    ("--database_path", ws.database_path()),
                    ("--image_path", ctx.image_dir.to_path_buf()),
                    ("--output_path", ws.sparse_dir()),
                ],
                Vec::new(),
            ),
            StageId::Undistortion => {
                let model = ctx.model.ok_or_else(|| PipelineError::MissingArtifact {
                    stage: id.name().to_string(),
                    path: ws.sparse_dir(),
                })?;
                let mut options = Vec::new();
                push_option(&mut options, "--output_type", "COLMAP");
                if let Some(max_image_size) = config.max_image_size {
                    push_option(&mut options, "--max_image_size", &max_image_size.to_string());
                }
                StageSpec::new(
                    id,
                    "image_undistorter",
                    vec![images, Artifact::dir("sparse model", model.path.clone())],
                    vec![
                        Artifact::dir("undistorted images", ws.dense_images_dir()),
                        Artifact::dir("undistorted model", ws.dense_sparse_dir()),
                    ],
                    vec![
                        ("--image_path", ctx.image_dir.to_path_buf()),
                        ("--input_path", model.path.clone()),
                        ("--output_path", ws.dense_dir()),
                    ],
                    options,
                )
            }
            StageId::DenseStereo => {
                let mut options = Vec::new();
                push_option(&mut options, "--workspace_format", "COLMAP");
                push_option(
                    &mut options,
                    "--PatchMatchStereo.geom_consistency",
                    if config.geom_consistency { "true" } else { "false" },
                );
                StageSpec::new(
                    id,
                    "patch_match_stereo",
                    vec![
                        Artifact::dir("undistorted images", ws.dense_images_dir()),
                        Artifact::dir("undistorted model", ws.dense_sparse_dir()),
                    ],
                    vec![
                        Artifact::dir("depth maps", ws.depth_maps_dir()),
                        Artifact::dir("normal maps", ws.normal_maps_dir()),
                    ],
                    vec![("--workspace_path", ws.dense_dir())],
                    options,
                )
            }
            StageId::Fusion => {
                let mut options = Vec::new();
                push_option(&mut options, "--workspace_format", "COLMAP");
                push_option(
                    &mut options,
                    "--input_type",
                    if config.geom_consistency { "geometric" } else { "photometric" },
                );
                StageSpec::new(
                    id,
                    "stereo_fusion",
                    vec![
                        Artifact::dir("depth maps", ws.depth_maps_dir()),
                        Artifact::dir("normal maps", ws.normal_maps_dir()),
                    ],
                    vec![Artifact::file("fused point cloud", ws.fused_path())],
                    vec![
                        ("--workspace_path", ws.dense_dir()),
                        ("--output_path", ws.fused_path()),
                    ],
                    options,
                )
            }
        };
        spec.options.extend(config.stage_options(id).iter().cloned());
        Ok(spec)
    }

    fn new(
        id: StageId,
        operation: &str,
        inputs: Vec<Artifact>,
        outputs: Vec<Artifact>,
        path_args: Vec<(&'static str, PathBuf)>,
        options: Vec<String>,
    ) -> Self {
        Self {
            id,
            name: id.name(),
            operation: operation.to_string(),
            inputs,
            resume_evidence: outputs.clone(),
            outputs,
            path_args,
            options,
        }
    }

    /// True when a previous run already completed this stage.
    pub fn is_satisfied(&self) -> bool {
        self.resume_evidence
            .iter()
            .all(|artifact| artifact.is_satisfied())
    }

    /// Engine arguments: path flags first, then options in order.
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args = Vec::with_capacity(self.path_args.len() * 2 + self.options.len());
        for (flag, path) in &self.path_args {
            args.push(OsString::from(*flag));
            args.push(path.clone().into_os_string());
        }
        args.extend(self.options.iter().map(OsString::from));
        args
    }
}

fn push_option(options: &mut Vec<String>, flag: &str, value: &str) {
    options.push(flag.to_string());
    options.push(value.to_string());
}

fn flag_value(enabled: bool) -> &'static str {
    if enabled {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
#[path = "stage_tests.rs"]
mod tests;
