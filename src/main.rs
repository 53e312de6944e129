use anyhow::{Context, Result};
use clap::Parser;
use photo_recon::cli::RunArgs;
use photo_recon::config::{resolve_config, validate_config, PipelineConfig};
use photo_recon::engine::CommandEngine;
use photo_recon::error::{PipelineError, FAILURE_EXIT_CODE};
use photo_recon::interrupt::Interrupt;
use photo_recon::pipeline::{write_summary, Pipeline, PlanStatus};
use photo_recon::progress::{FanoutSink, JsonlSink, TracingSink};
use photo_recon::workspace::{self, WorkspacePaths};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = RunArgs::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = match err.downcast_ref::<PipelineError>() {
                Some(pipeline_err) => {
                    match pipeline_err.stage() {
                        Some(stage) => eprintln!("precon: failed at stage {stage}: {pipeline_err}"),
                        None => eprintln!("precon: {pipeline_err}"),
                    }
                    pipeline_err.exit_code()
                }
                None => {
                    eprintln!("precon: {err:#}");
                    FAILURE_EXIT_CODE
                }
            };
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(args: &RunArgs) -> Result<()> {
    if !args.image_dir.is_dir() {
        return Err(PipelineError::Usage(format!(
            "image directory {} does not exist or is not a directory",
            args.image_dir.display()
        ))
        .into());
    }
    let mut config = resolve_config(args.config.as_deref())?;
    args.apply_overrides(&mut config);
    validate_config(&config)?;
    let image_dir = args
        .image_dir
        .canonicalize()
        .with_context(|| format!("resolve image directory {}", args.image_dir.display()))?;

    if args.plan {
        return print_plan(args, &image_dir, &config);
    }

    let workspace = workspace::prepare(&args.output_dir)?;
    let interrupt = Interrupt::install();
    let engine = CommandEngine::from_config(&config.engine, interrupt.clone())?;
    let mut sink = FanoutSink::new();
    sink.push(Box::new(TracingSink));
    if config.progress_log {
        sink.push(Box::new(JsonlSink::new(workspace.progress_log_path())));
    }

    let mut pipeline = Pipeline::new(image_dir, workspace.clone(), &config, &engine)
        .with_resume(!args.no_resume)
        .with_interrupt(interrupt);
    let result = pipeline.run(&mut sink);
    let summary = pipeline.summary(result.as_ref().err());
    if let Err(err) = write_summary(&workspace.summary_path(), &summary) {
        tracing::warn!(
            path = %workspace.summary_path().display(),
            "run summary write failed: {err:#}"
        );
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if let Some(fused) = summary.fused_path.as_deref().filter(|_| summary.success) {
        println!("{fused}");
    }
    result?;
    Ok(())
}

/// Print the resume plan without creating or modifying anything.
fn print_plan(args: &RunArgs, image_dir: &Path, config: &PipelineConfig) -> Result<()> {
    let engine = CommandEngine::from_config(&config.engine, Interrupt::new())?;
    let workspace = WorkspacePaths::new(args.output_dir.clone());
    let pipeline = Pipeline::new(image_dir.to_path_buf(), workspace, config, &engine)
        .with_resume(!args.no_resume);
    let plan = pipeline.plan()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }
    for entry in plan {
        let status = match entry.status {
            PlanStatus::Satisfied => "satisfied",
            PlanStatus::Pending => "pending",
        };
        println!("{:<20} {status}", entry.stage.name());
    }
    Ok(())
}
