//! Runs a manifest-defined pipeline of real shell commands end to end.

#![cfg(unix)]

use std::path::Path;
use std::sync::Arc;

use immunoflow::prelude::*;
use immunoflow::store::discover_raw_runs;
use pretty_assertions::assert_eq;
use serde_json::json;

fn write_manifest(dir: &Path) -> std::path::PathBuf {
    let manifest = json!({
        "store_root": "store",
        "use_catalog": false,
        "worker_slots": 2,
        "stages": [
            {
                "id": "qc",
                "inputs": ["raw_run"],
                "output": "cleaned_run",
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": ["-c", "cat \"$1/analysis.tdf\" \"$1/analysis.tdf_bin\" > \"$2\"", "qc", "{input}", "{output}"]
                }
            },
            {
                "id": "convert",
                "inputs": ["cleaned_run"],
                "output": "converted_spectra",
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": ["-c", "tr a-z A-Z < \"$1\" > \"$2\"", "convert", "{input}", "{output}"]
                }
            },
            {
                "id": "search",
                "inputs": ["converted_spectra"],
                "output": "search_results",
                "config": {
                    "options": [
                        {"name": "database", "type": "string", "required": true},
                        {"name": "marker", "type": "string", "required": true}
                    ]
                },
                "retry": {"max_attempts": 3, "base_delay_ms": 1, "jitter": "none"},
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": [
                        "-c",
                        "if [ ! -e \"$4\" ]; then touch \"$4\"; echo busy >&2; exit 75; fi; cat \"$1\" > \"$2\"; echo \"db=$3 sample=$IMMUNOFLOW_SAMPLE\" >> \"$2\"",
                        "search",
                        "{input}",
                        "{output}",
                        "{config.database}",
                        "{config.marker}"
                    ],
                    "transient_exit_codes": [75]
                }
            },
            {
                "id": "rescore",
                "inputs": ["search_results"],
                "output": "rescored_psms",
                "retry": {"max_attempts": 3, "base_delay_ms": 1, "jitter": "none"},
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": ["-c", "echo 'rescorer crashed' >&2; exit 3"]
                }
            }
        ],
        "stage_config": {
            "search": {"database": "proteome.fasta", "marker": dir.join("search.seen")}
        }
    });
    let path = dir.join("pipeline.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
    path
}

fn acquisition(dir: &Path, name: &str) {
    let run = dir.join("acquisitions").join(name);
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("analysis.tdf"), "peptide sequences\n").unwrap();
    std::fs::write(run.join("analysis.tdf_bin"), "frame data\n").unwrap();
}

async fn engine_for(manifest: &PipelineManifest) -> PipelineEngine {
    PipelineEngine::new(
        Arc::new(manifest.build_registry().unwrap()),
        Arc::new(FsArtifactStore::open(&manifest.store_root).await.unwrap()),
        Arc::new(FsCheckpointStore::open(&manifest.store_root).await.unwrap()),
        Arc::new(CollaboratorInvoker::new()),
        manifest.engine.clone(),
    )
}

#[tokio::test]
async fn test_manifest_pipeline_with_shell_collaborators() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = PipelineManifest::load(write_manifest(dir.path())).unwrap();
    assert_eq!(manifest.store_root, dir.path().join("store"));

    acquisition(dir.path(), "patient-7.d");
    let runs = discover_raw_runs(&dir.path().join("acquisitions")).unwrap();
    assert_eq!(runs.len(), 1);
    let sample = runs[0].sample.clone();
    assert_eq!(sample.as_str(), "patient-7");

    let engine = engine_for(&manifest).await;
    engine
        .artifacts()
        .import(&runs[0].path, &sample, ArtifactType::RawRun)
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let run = engine
        .run(manifest.run_request(sample.clone(), ArtifactType::SearchResults), &cancel)
        .await
        .unwrap();
    assert_eq!(run.status, PipelineRunStatus::Completed, "{}", run.summary());
    assert_eq!(run.stage_run("search").unwrap().attempts, 2);

    let results = engine
        .artifacts()
        .get(run.target_artifact.as_ref().unwrap())
        .await
        .unwrap();
    let body = std::fs::read_to_string(&results.location).unwrap();
    assert_eq!(
        body,
        "PEPTIDE SEQUENCES\nFRAME DATA\ndb=proteome.fasta sample=patient-7\n"
    );
    assert_eq!(results.produced_by, "search");

    // Same request again, from a fresh engine over the same store.
    let engine = engine_for(&manifest).await;
    let again = engine
        .run(manifest.run_request(sample.clone(), ArtifactType::SearchResults), &cancel)
        .await
        .unwrap();
    assert_eq!(again.invocation_count(), 0);
    assert_eq!(again.target_artifact, run.target_artifact);

    let failed = engine
        .run(manifest.run_request(sample, ArtifactType::RescoredPsms), &cancel)
        .await
        .unwrap();
    assert_eq!(failed.status, PipelineRunStatus::Failed);
    let error = failed.execution_error().unwrap();
    assert_eq!(error.stage_id, "rescore");
    assert_eq!(error.class, FailureClass::Permanent);
    assert_eq!(error.attempts, 1);
    assert_eq!(error.diagnostic.exit_code, Some(3));
    assert!(error.diagnostic.stderr.contains("rescorer crashed"));
}

#[tokio::test]
async fn test_unknown_config_key_in_template_is_rejected_at_registration() {
    let manifest: PipelineManifest = serde_json::from_value(json!({
        "use_catalog": false,
        "stages": [{
            "id": "qc",
            "inputs": ["raw_run"],
            "output": "cleaned_run",
            "collaborator": {"kind": "command", "program": "qc", "args": ["{config.threshold}"]}
        }]
    }))
    .unwrap();

    let err = manifest.build_registry().unwrap_err();
    assert!(matches!(err, ImmunoflowError::InvalidInput(_)));
}

#[tokio::test]
async fn test_search_stage_receives_numbered_spectra_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest: PipelineManifest = serde_json::from_value(json!({
        "store_root": dir.path().join("store"),
        "use_catalog": false,
        "sources": ["cleaned_run"],
        "stages": [
            {
                "id": "convert",
                "inputs": ["cleaned_run"],
                "output": "converted_spectra",
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": ["-c", "mkdir -p \"$1\" && for r in B A C; do echo $r > \"$1/run_$r.mzML\"; done", "convert", "{output}"]
                }
            },
            {
                "id": "search",
                "inputs": ["converted_spectra"],
                "output": "search_results",
                "config": {
                    "options": [
                        {"name": "data_type", "type": "enum", "values": ["DDA", "DIA"], "default": "DDA"}
                    ]
                },
                "collaborator": {
                    "kind": "command",
                    "program": "sh",
                    "args": ["-c", "cp \"$1\" \"$2\"", "search", "{manifest}", "{output}"]
                }
            }
        ],
        "stage_config": {"search": {"data_type": "DIA"}}
    }))
    .unwrap();

    let cleaned = dir.path().join("cleaned");
    std::fs::write(&cleaned, "cleaned acquisition").unwrap();
    let sample = SampleId::new("S1").unwrap();
    let engine = engine_for(&manifest).await;
    engine
        .artifacts()
        .import(&cleaned, &sample, ArtifactType::CleanedRun)
        .await
        .unwrap();

    let run = engine
        .run(
            manifest.run_request(sample, ArtifactType::SearchResults),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(run.status, PipelineRunStatus::Completed, "{}", run.summary());

    let results = engine
        .artifacts()
        .get(run.target_artifact.as_ref().unwrap())
        .await
        .unwrap();
    let body = std::fs::read_to_string(&results.location).unwrap();
    let rows: Vec<Vec<&str>> = body.lines().map(|l| l.split('\t').collect()).collect();
    assert_eq!(rows.len(), 3);
    for (index, (row, name)) in rows.iter().zip(["run_A.mzML", "run_B.mzML", "run_C.mzML"]).enumerate() {
        assert!(row[0].ends_with(name), "{}", row[0]);
        assert_eq!(row[1..], ["exp", (index + 1).to_string().as_str(), "DIA"]);
    }
}
