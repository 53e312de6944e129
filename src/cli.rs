//! CLI argument parsing.
//!
//! Missing positional arguments are rejected by clap before anything touches
//! the filesystem.
use crate::config::{MatcherKind, PipelineConfig};
use crate::selector::SelectionPolicy;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "precon",
    version,
    about = "Reconstruct a fused dense point cloud from a directory of photographs",
    after_help = "Stages:\n  feature-extraction, matching, mapping, undistortion, dense-stereo, fusion\n\nRerunning against the same OUTPUT_DIR resumes after the last completed stage.\nMatching only counts as complete once mapping has produced a model, so a\nfailed mapping run also reruns matching.\n\nExamples:\n  precon ./photos ./recon\n  precon ./photos ./recon --plan\n  precon ./photos ./recon --selection-policy most-registered-images --json\n  precon ./photos ./recon --engine 'xvfb-run -a colmap' --no-gpu",
    arg_required_else_help = true
)]
pub struct RunArgs {
    /// Directory of source photographs (read-only)
    #[arg(value_name = "IMAGE_DIR")]
    pub image_dir: PathBuf,

    /// Workspace root owned by this run
    #[arg(value_name = "OUTPUT_DIR")]
    pub output_dir: PathBuf,

    /// Pipeline config JSON (defaults to the per-user config when present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Engine launcher, split with shell rules
    #[arg(long, value_name = "CMD")]
    pub engine: Option<String>,

    /// Which sparse model to densify when mapping yields several
    #[arg(long, value_enum, value_name = "POLICY")]
    pub selection_policy: Option<SelectionPolicy>,

    /// Pairwise matching strategy
    #[arg(long, value_enum, value_name = "KIND")]
    pub matcher: Option<MatcherKind>,

    /// Treat all images as taken by one camera
    #[arg(long)]
    pub single_camera: bool,

    /// Disable GPU use in extraction and matching
    #[arg(long)]
    pub no_gpu: bool,

    /// Rerun every stage even if its outputs already exist
    #[arg(long)]
    pub no_resume: bool,

    /// Print which stages would run and exit without running them
    #[arg(long)]
    pub plan: bool,

    /// Emit the run summary as JSON on stdout
    #[arg(long)]
    pub json: bool,

    /// Enable debug logging
    #[arg(long)]
    pub verbose: bool,
}

impl RunArgs {
    /// Apply command-line overrides on top of a loaded config.
    pub fn apply_overrides(&self, config: &mut PipelineConfig) {
        if let Some(engine) = &self.engine {
            config.engine.command = engine.clone();
        }
        if let Some(policy) = self.selection_policy {
            config.selection_policy = policy;
        }
        if let Some(matcher) = self.matcher {
            config.matcher = matcher;
        }
        if self.single_camera {
            config.single_camera = true;
        }
        if self.no_gpu {
            config.use_gpu = Some(false);
        }
    }
}
