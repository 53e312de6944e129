use super::*;
use crate::config::{default_config, MatcherKind};
use std::fs;

struct Fixture {
    _temp: tempfile::TempDir,
    images: PathBuf,
    workspace: WorkspacePaths,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().expect("create temp dir");
    let images = temp.path().join("images");
    fs::create_dir_all(&images).expect("create images");
    let workspace = WorkspacePaths::new(temp.path().join("recon"));
    Fixture {
        _temp: temp,
        images,
        workspace,
    }
}

fn args_of(spec: &StageSpec) -> Vec<String> {
    spec.command_args()
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

fn build(
    fx: &Fixture,
    id: StageId,
    config: &PipelineConfig,
    model: Option<&SparseModel>,
) -> StageSpec {
    let ctx = StageContext {
        image_dir: &fx.images,
        workspace: &fx.workspace,
        model,
        config,
    };
    StageSpec::build(id, &ctx).expect("build stage")
}

#[test]
fn stage_names_round_trip() {
    for id in StageId::ALL {
        assert_eq!(StageId::from_name(id.name()), Some(id));
    }
    assert_eq!(StageId::from_name("meshing"), None);
}

#[test]
fn feature_extraction_passes_paths_then_options() {
    let fx = fixture();
    let mut config = default_config();
    config.single_camera = true;
    config.use_gpu = Some(false);
    config.stage_options.insert(
        "feature-extraction".to_string(),
        vec!["--SiftExtraction.max_num_features".to_string(), "4096".to_string()],
    );

    let spec = build(&fx, StageId::FeatureExtraction, &config, None);

    assert_eq!(spec.operation, "feature_extractor");
    let db = fx.workspace.database_path().display().to_string();
    let images = fx.images.display().to_string();
    assert_eq!(
        args_of(&spec),
        vec![
            "--database_path".to_string(),
            db,
            "--image_path".to_string(),
            images,
            "--ImageReader.single_camera".to_string(),
            "1".to_string(),
            "--SiftExtraction.use_gpu".to_string(),
            "0".to_string(),
            "--SiftExtraction.max_num_features".to_string(),
            "4096".to_string(),
        ]
    );
}

#[test]
fn matching_operation_follows_matcher_kind() {
    let fx = fixture();
    let mut config = default_config();
    assert_eq!(
        build(&fx, StageId::Matching, &config, None).operation,
        "exhaustive_matcher"
    );
    config.matcher = MatcherKind::Sequential;
    assert_eq!(
        build(&fx, StageId::Matching, &config, None).operation,
        "sequential_matcher"
    );
}

#[test]
fn matching_needs_mapping_evidence_to_count_as_done() {
    let fx = fixture();
    let config = default_config();
    fs::create_dir_all(fx.workspace.sparse_dir()).expect("create sparse");
    fs::write(fx.workspace.database_path(), b"features").expect("write db");

    let spec = build(&fx, StageId::Matching, &config, None);
    assert!(!spec.is_satisfied());

    let model = fx.workspace.model_dir(0);
    fs::create_dir_all(&model).expect("create model");
    fs::write(model.join("cameras.bin"), b"c").expect("write model");
    assert!(spec.is_satisfied());
}

#[test]
fn undistortion_requires_a_chosen_model() {
    let fx = fixture();
    let config = default_config();
    let ctx = StageContext {
        image_dir: &fx.images,
        workspace: &fx.workspace,
        model: None,
        config: &config,
    };
    let err = StageSpec::build(StageId::Undistortion, &ctx).expect_err("model required");
    assert!(matches!(err, PipelineError::MissingArtifact { .. }), "{err:?}");

    let model = SparseModel {
        index: 1,
        path: fx.workspace.model_dir(1),
        registered_images: Some(12),
    };
    let spec = build(&fx, StageId::Undistortion, &config, Some(&model));
    let args = args_of(&spec);
    let input_at = args
        .iter()
        .position(|arg| arg == "--input_path")
        .expect("input path flag");
    assert_eq!(args[input_at + 1], model.path.display().to_string());
    assert!(spec.inputs.iter().any(|input| input.path == model.path));
}

#[test]
fn fusion_writes_the_fused_cloud_with_matching_input_type() {
    let fx = fixture();
    let mut config = default_config();
    let spec = build(&fx, StageId::Fusion, &config, None);
    assert_eq!(spec.outputs.len(), 1);
    assert_eq!(spec.outputs[0].path, fx.workspace.fused_path());
    assert!(args_of(&spec).contains(&"geometric".to_string()));

    config.geom_consistency = false;
    let spec = build(&fx, StageId::Fusion, &config, None);
    assert!(args_of(&spec).contains(&"photometric".to_string()));
}
