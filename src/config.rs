//! Pipeline configuration.
//!
//! Everything the stage runner needs to locate and drive the engine is passed
//! in explicitly from here; the orchestrator never reads the process cwd or
//! environment to find its tools.
use crate::selector::SelectionPolicy;
use crate::stage::StageId;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_ENGINE_COMMAND: &str = "colmap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub selection_policy: SelectionPolicy,
    #[serde(default)]
    pub matcher: MatcherKind,
    /// Assume every image was taken with the same camera and lens.
    #[serde(default)]
    pub single_camera: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_gpu: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_image_size: Option<u32>,
    #[serde(default = "default_true")]
    pub geom_consistency: bool,
    /// Extra engine flags keyed by stage name, appended after the built-in ones.
    #[serde(default)]
    pub stage_options: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_true")]
    pub progress_log: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Launcher for the engine, split with shell rules (e.g. `xvfb-run -a colmap`).
    #[serde(default = "default_engine_command")]
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            env: BTreeMap::new(),
        }
    }
}

/// Pairwise matching strategy for the matching stage.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum MatcherKind {
    /// Match every image against every other image
    #[default]
    Exhaustive,
    /// Match only neighbouring images (ordered captures such as video frames)
    Sequential,
}

impl MatcherKind {
    pub fn operation(self) -> &'static str {
        match self {
            MatcherKind::Exhaustive => "exhaustive_matcher",
            MatcherKind::Sequential => "sequential_matcher",
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_engine_command() -> String {
    DEFAULT_ENGINE_COMMAND.to_string()
}

impl Default for PipelineConfig {
    fn default() -> Self {
        default_config()
    }
}

pub fn default_config() -> PipelineConfig {
    PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        engine: EngineConfig::default(),
        selection_policy: SelectionPolicy::default(),
        matcher: MatcherKind::default(),
        single_camera: false,
        use_gpu: None,
        max_image_size: None,
        geom_consistency: true,
        stage_options: BTreeMap::new(),
        progress_log: true,
    }
}

impl PipelineConfig {
    /// Extra flags configured for `stage`, empty when none are set.
    pub fn stage_options(&self, stage: StageId) -> &[String] {
        self.stage_options
            .get(stage.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Location of the per-user config, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("precon").join("config.json"))
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse config JSON {}", path.display()))?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("create config dir")?;
    }
    let text = serde_json::to_string_pretty(config).context("serialize config")?;
    fs::write(path, text.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Load an explicit config, else the per-user config when present, else defaults.
pub fn resolve_config(explicit: Option<&Path>) -> Result<PipelineConfig> {
    let config = match explicit {
        Some(path) => load_config(path)?,
        None => match default_config_path().filter(|path| path.is_file()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "using per-user config");
                load_config(&path)?
            }
            None => default_config(),
        },
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {}",
            config.schema_version
        ));
    }
    let launcher = shell_words::split(&config.engine.command)
        .with_context(|| format!("parse engine command {:?}", config.engine.command))?;
    if launcher.is_empty() {
        return Err(anyhow!("engine.command must be non-empty"));
    }
    if config.max_image_size == Some(0) {
        return Err(anyhow!("max_image_size must be positive"));
    }
    for (stage, options) in &config.stage_options {
        if StageId::from_name(stage).is_none() {
            return Err(anyhow!("stage_options has unknown stage {stage:?}"));
        }
        if let Some(first) = options.first() {
            if !first.starts_with('-') {
                return Err(anyhow!(
                    "stage_options.{stage} must start with a flag (got {first:?})"
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
