//! Command-line behavior of the `precon` binary.
//!
//! Full runs use a shell script standing in for the engine, so no
//! reconstruction software is needed.

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

const FAKE_ENGINE: &str = r#"
op="$1"; shift
echo "$op" >> "$FAKE_ENGINE_LOG"
while [ $# -gt 0 ]; do
  case "$1" in
    --database_path) db="$2" ;;
    --output_path) out="$2" ;;
    --workspace_path) ws="$2" ;;
  esac
  shift
done
case "$op" in
  feature_extractor|exhaustive_matcher|sequential_matcher)
    printf 'db' >> "$db" ;;
  mapper)
    mkdir -p "$out/0" && printf 'model' > "$out/0/cameras.bin" ;;
  image_undistorter)
    mkdir -p "$out/images" "$out/sparse" &&
      printf 'img' > "$out/images/a.jpg" && printf 'cam' > "$out/sparse/cameras.bin" ;;
  patch_match_stereo)
    mkdir -p "$ws/stereo/depth_maps" "$ws/stereo/normal_maps" &&
      printf 'd' > "$ws/stereo/depth_maps/a.bin" && printf 'n' > "$ws/stereo/normal_maps/a.bin" ;;
  stereo_fusion)
    printf 'ply' > "$out" ;;
  *)
    exit 3 ;;
esac
"#;

struct Setup {
    temp: TempDir,
    photos: PathBuf,
    output: PathBuf,
    config: PathBuf,
    script: PathBuf,
    log: PathBuf,
}

impl Setup {
    fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let photos = temp.path().join("photos");
        fs::create_dir_all(&photos).expect("create photos");
        for name in ["a.jpg", "b.jpg", "c.jpg", "d.jpg"] {
            fs::write(photos.join(name), b"jpeg").expect("write photo");
        }
        let config = temp.path().join("config.json");
        fs::write(&config, br#"{"schema_version": 1}"#).expect("write config");
        let script = temp.path().join("fake-engine.sh");
        fs::write(&script, FAKE_ENGINE).expect("write fake engine");
        Self {
            output: temp.path().join("recon"),
            log: temp.path().join("engine.log"),
            photos,
            config,
            script,
            temp,
        }
    }

    fn run(&self, extra: &[&str]) -> Output {
        let engine = format!(
            "sh {}",
            shell_words::quote(&self.script.to_string_lossy())
        );
        Command::new(env!("CARGO_BIN_EXE_precon"))
            .arg(&self.photos)
            .arg(&self.output)
            .arg("--config")
            .arg(&self.config)
            .arg("--engine")
            .arg(engine)
            .args(extra)
            .env("FAKE_ENGINE_LOG", &self.log)
            .env("RUST_LOG", "warn")
            .output()
            .expect("run precon")
    }

    fn engine_calls(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

fn summary_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    })
}

fn precon<S: AsRef<OsStr>>(args: &[S]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_precon"))
        .args(args)
        .output()
        .expect("run precon")
}

#[test]
fn no_arguments_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_precon"))
        .output()
        .expect("run precon");
    assert!(!output.status.success());
}

#[test]
fn missing_output_dir_creates_nothing() {
    let setup = Setup::new();
    let entries = || fs::read_dir(setup.temp.path()).expect("list temp").count();
    let before = entries();

    let output = precon(&[&setup.photos]);

    assert_eq!(output.status.code(), Some(2));
    assert_eq!(entries(), before);
}

#[test]
fn missing_image_dir_is_a_usage_error() {
    let setup = Setup::new();
    let absent = setup.temp.path().join("no-such-photos");

    let output = precon(&[&absent, &setup.output]);

    assert_eq!(output.status.code(), Some(2));
    assert!(!setup.output.exists());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no-such-photos"), "{stderr}");
}

#[test]
fn plan_reports_pending_stages_without_creating_the_workspace() {
    let setup = Setup::new();

    let output = setup.run(&["--plan"]);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 6, "{stdout}");
    assert!(lines[0].starts_with("feature-extraction"));
    assert!(lines.iter().all(|line| line.ends_with("pending")));
    assert!(!setup.output.exists());
    assert!(setup.engine_calls().is_empty());
}

#[cfg(unix)]
#[test]
fn full_run_then_resume_is_a_no_op() {
    let setup = Setup::new();

    let first = setup.run(&["--json"]);
    assert!(
        first.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&first.stderr)
    );
    let summary = summary_json(&first);
    assert_eq!(summary["success"], true);
    assert_eq!(summary["executed"].as_array().map(Vec::len), Some(6));
    assert_eq!(summary["chosen_model"], 0);
    assert_eq!(
        setup.engine_calls(),
        vec![
            "feature_extractor",
            "exhaustive_matcher",
            "mapper",
            "image_undistorter",
            "patch_match_stereo",
            "stereo_fusion",
        ]
    );
    assert!(setup.output.join("dense").join("fused.ply").is_file());
    assert!(setup.output.join("run.json").is_file());
    let progress = fs::read_to_string(setup.output.join("progress.jsonl")).expect("progress log");
    assert!(progress.lines().count() >= 14, "{progress}");

    let second = setup.run(&["--json"]);
    assert!(second.status.success());
    let summary = summary_json(&second);
    assert_eq!(summary["executed"].as_array().map(Vec::len), Some(0));
    assert_eq!(summary["skipped"].as_array().map(Vec::len), Some(6));
    assert_eq!(setup.engine_calls().len(), 6);
}

#[cfg(unix)]
#[test]
fn engine_failure_names_the_stage() {
    let setup = Setup::new();

    let output = Command::new(env!("CARGO_BIN_EXE_precon"))
        .arg(&setup.photos)
        .arg(&setup.output)
        .arg("--config")
        .arg(&setup.config)
        .args(["--engine", "sh -c 'exit 5' precon-engine"])
        .output()
        .expect("run precon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed at stage feature-extraction"),
        "{stderr}"
    );
    let summary: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(setup.output.join("run.json")).expect("run summary"),
    )
    .expect("parse run summary");
    assert_eq!(summary["success"], false);
    assert_eq!(summary["error"]["kind"], "stage_execution");
    assert_eq!(summary["state"]["stage"], "feature-extraction");
}

#[cfg(unix)]
#[test]
fn unwritable_summary_keeps_the_stage_failure() {
    let setup = Setup::new();
    fs::create_dir_all(setup.output.join("run.json")).expect("block run.json with a directory");

    let output = Command::new(env!("CARGO_BIN_EXE_precon"))
        .arg(&setup.photos)
        .arg(&setup.output)
        .arg("--config")
        .arg(&setup.config)
        .args(["--engine", "sh -c 'exit 5' precon-engine"])
        .output()
        .expect("run precon");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("failed at stage feature-extraction: stage feature-extraction failed: exit status 5"),
        "{stderr}"
    );
    assert!(stderr.contains("run summary write failed"), "{stderr}");
}
