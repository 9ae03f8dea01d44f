//! Artifact publisher and integrity verification against real files.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use gantry_core::{
    verify_artifacts, ArtifactIntegrity, ArtifactPublisher, CasStore, ContentDigest, GantryError,
    PipelineRunRecord, RunId, TriggerEvent, DEFAULT_REPORT_PATHS,
};
use gantry_state::fakes::MemoryCasStore;
use gantry_state::FsCasStore;

fn write(root: &Path, rel: &str, contents: &str) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn default_paths() -> Vec<String> {
    DEFAULT_REPORT_PATHS.iter().map(|p| p.to_string()).collect()
}

#[tokio::test]
async fn publishes_files_and_directories_in_sorted_order() {
    let ws = tempfile::tempdir().unwrap();
    write(ws.path(), "coverage.xml", "<coverage line-rate=\"0.9\"/>");
    write(ws.path(), "htmlcov/index.html", "<html></html>");
    write(ws.path(), "htmlcov/b/style.css", "body {}");
    write(ws.path(), "htmlcov/a.js", "void 0;");

    let cas = Arc::new(MemoryCasStore::new());
    let publisher = ArtifactPublisher::new(cas.clone(), default_paths()).unwrap();
    let report = publisher.publish(ws.path(), "test").await.unwrap();

    let paths: Vec<&str> = report.artifacts.iter().map(|a| a.path.as_str()).collect();
    assert_eq!(
        paths,
        [
            "coverage.xml",
            "htmlcov/a.js",
            "htmlcov/b/style.css",
            "htmlcov/index.html"
        ]
    );
    assert_eq!(report.missing, ["test-reports"]);
    assert!(report.artifacts.iter().all(|a| a.stage == "test"));

    let coverage = &report.artifacts[0];
    assert_eq!(coverage.media_type.as_deref(), Some("application/xml"));
    assert_eq!(coverage.size_bytes, 27);
    assert_eq!(
        coverage.digest,
        ContentDigest::from_bytes(b"<coverage line-rate=\"0.9\"/>")
    );
    assert_eq!(cas.len(), 4);
}

#[tokio::test]
async fn nothing_produced_is_not_an_error() {
    let ws = tempfile::tempdir().unwrap();
    let publisher =
        ArtifactPublisher::new(Arc::new(MemoryCasStore::new()), default_paths()).unwrap();
    let report = publisher.publish(ws.path(), "test").await.unwrap();
    assert!(report.artifacts.is_empty());
    assert_eq!(report.missing.len(), 3);
}

#[test]
fn escaping_paths_are_rejected_up_front() {
    let cas = Arc::new(MemoryCasStore::new());
    let err = ArtifactPublisher::new(cas, vec!["../outside".to_string()])
        .err()
        .unwrap();
    assert!(matches!(err, GantryError::Configuration(_)));
}

#[tokio::test]
async fn earlier_blobs_survive_later_publishes() {
    let ws = tempfile::tempdir().unwrap();
    let cas_dir = tempfile::tempdir().unwrap();
    let cas: Arc<dyn CasStore> = Arc::new(FsCasStore::new(cas_dir.path()).unwrap());
    let publisher = ArtifactPublisher::new(cas.clone(), vec!["coverage.xml".to_string()]).unwrap();

    write(ws.path(), "coverage.xml", "run one");
    let first = publisher.publish(ws.path(), "test").await.unwrap();
    write(ws.path(), "coverage.xml", "run two");
    let second = publisher.publish(ws.path(), "test").await.unwrap();

    assert_ne!(first.artifacts[0].digest, second.artifacts[0].digest);
    assert_eq!(cas.get(&first.artifacts[0].digest).await.unwrap(), b"run one");
    assert_eq!(cas.get(&second.artifacts[0].digest).await.unwrap(), b"run two");
}

#[tokio::test]
async fn verify_detects_corruption_and_loss() {
    let ws = tempfile::tempdir().unwrap();
    write(ws.path(), "coverage.xml", "<coverage/>");
    write(ws.path(), "test-reports/junit.xml", "<testsuite/>");

    let cas = Arc::new(MemoryCasStore::new());
    let publisher = ArtifactPublisher::new(cas.clone(), default_paths()).unwrap();
    let report = publisher.publish(ws.path(), "test").await.unwrap();

    let mut run = PipelineRunRecord::pending(
        RunId::new(),
        TriggerEvent::poll("main", "abc").run_metadata(None),
    );
    run.artifacts = report.artifacts.clone();

    let checks = verify_artifacts(&run, cas.as_ref()).await.unwrap();
    assert!(checks.iter().all(|c| c.is_intact()));

    cas.corrupt(&report.artifacts[0].digest, b"tampered");
    run.artifacts.push(gantry_core::ArtifactRecord {
        path: "gone.xml".to_string(),
        digest: ContentDigest::from_bytes(b"never stored"),
        ..report.artifacts[1].clone()
    });

    let checks = verify_artifacts(&run, cas.as_ref()).await.unwrap();
    assert!(matches!(
        checks[0].integrity,
        ArtifactIntegrity::Corrupted { .. }
    ));
    assert!(checks[1].is_intact());
    assert_eq!(checks[2].integrity, ArtifactIntegrity::Missing);
    assert!(matches!(
        checks[0].to_error(),
        Some(GantryError::DigestMismatch { .. })
    ));
}
