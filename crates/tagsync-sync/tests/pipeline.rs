use std::sync::Arc;

use chrono::{DateTime, Utc};
use tagsync_adapters::{DirectorySource, MemoryPatchSink, MemorySource, StorePatchSink};
use tagsync_core::{
    Advisory, ConflictKind, Correspondence, MergeReport, Position, TagPatch, TaggedEntity,
};
use tagsync_storage::TargetStore;
use tagsync_sync::{
    ApproveAll, DeferAll, ReconcileStatus, ReviewDecision, SkipAmbiguous, SyncPipeline, SyncRules,
};
use tempfile::tempdir;

fn kg(reference: &str, name: &str) -> TaggedEntity {
    TaggedEntity::new()
        .with_tag("ref", reference)
        .with_tag("name", name)
}

fn reconcile_fixture() -> MemorySource {
    MemorySource {
        previous: vec![
            kg("1", "Sol").with_tag("capacity", "20"),
            kg("2", "Måne"),
            kg("3", "Stjerne"),
            kg("4", "Komet"),
            kg("5", "Planet").with_tag("phone", "1"),
            kg("6", "Nordlys").with_tag("phone", "1"),
            kg("7", "Eng").with_tag("phone", "1"),
        ],
        current: vec![
            kg("1", "Sol").with_tag("capacity", "25"),
            kg("2", "Måne"),
            kg("5", "Planet").with_tag("phone", "2"),
            kg("6", "Nordlys").with_tag("phone", "2"),
            kg("7", "Eng").with_tag("phone", "2"),
            kg("8", "Skogen"),
        ],
        targets: vec![
            kg("1", "Sol").with_id("node/1").with_tag("capacity", "22"),
            kg("2", "Måne").with_id("node/2"),
            kg("4", "Komet").with_id("node/4"),
            kg("6", "Nordlys").with_id("node/6a"),
            kg("6", "Nordlys").with_id("node/6b"),
            kg("7", "Eng").with_id("node/7").with_tag("phone", "3"),
        ],
    }
}

#[tokio::test]
async fn reconcile_classifies_every_record() {
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(reconcile_fixture()), sink.clone());

    let summary = pipeline.run_reconcile(&mut ApproveAll).await.expect("reconcile");

    assert!(!summary.aborted);
    assert_eq!(summary.entries.len(), 8);
    for status in [
        ReconcileStatus::Applied,
        ReconcileStatus::NoRelevantChange,
        ReconcileStatus::WithdrawnUnlinked,
        ReconcileStatus::WithdrawnLinked,
        ReconcileStatus::NotLinked,
        ReconcileStatus::DuplicateLink,
        ReconcileStatus::Unresolved,
        ReconcileStatus::PreviouslyWithdrawn,
    ] {
        assert_eq!(summary.count(status), 1, "{status:?}");
    }

    let duplicate = summary
        .entries_with(ReconcileStatus::DuplicateLink)
        .next()
        .expect("duplicate entry");
    assert_eq!(duplicate.key, "6");
    assert_eq!(duplicate.target_ids, vec!["node/6a".to_string(), "node/6b".to_string()]);

    let unresolved = summary
        .entries_with(ReconcileStatus::Unresolved)
        .next()
        .expect("unresolved entry");
    assert_eq!(unresolved.conflicts.len(), 1);
    assert_eq!(unresolved.conflicts[0].kind, ConflictKind::ModifiedButEdited);

    let applied = sink.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].target_id.as_deref(), Some("node/1"));
    assert_eq!(applied[0].patched.tag("capacity"), Some("25"));
}

#[tokio::test]
async fn batch_mode_defers_updates_without_touching_the_sink() {
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(reconcile_fixture()), sink.clone());

    let summary = pipeline.run_reconcile(&mut DeferAll).await.expect("reconcile");

    assert_eq!(summary.count(ReconcileStatus::NeedsReview), 1);
    assert_eq!(summary.count(ReconcileStatus::Applied), 0);
    let deferred = summary
        .entries_with(ReconcileStatus::NeedsReview)
        .next()
        .expect("deferred");
    assert!(deferred.patch.is_some());
    assert!(sink.applied().is_empty());
}

#[tokio::test]
async fn reviewer_abort_stops_the_run() {
    let source = MemorySource {
        previous: vec![kg("1", "A").with_tag("phone", "1"), kg("2", "B").with_tag("phone", "1")],
        current: vec![kg("1", "A").with_tag("phone", "2"), kg("2", "B").with_tag("phone", "2")],
        targets: vec![
            kg("1", "A").with_id("node/1").with_tag("phone", "1"),
            kg("2", "B").with_id("node/2").with_tag("phone", "1"),
        ],
    };
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source), sink.clone());

    let mut asked = 0;
    let mut reviewer = |_: &Correspondence, _: &MergeReport, _: &TagPatch| {
        asked += 1;
        ReviewDecision::Abort
    };
    let summary = pipeline.run_reconcile(&mut reviewer).await.expect("reconcile");

    assert_eq!(asked, 1);
    assert!(summary.aborted);
    assert_eq!(summary.entries.len(), 1);
    assert_eq!(summary.entries[0].status, ReconcileStatus::Aborted);
    assert!(summary.summary_line().ends_with("aborted"));
    assert!(sink.applied().is_empty());
}

#[tokio::test]
async fn link_run_tags_accepted_targets() {
    let source = MemorySource {
        current: vec![TaggedEntity::new()
            .at(60.0, 10.0)
            .with_tag("name", "Sunny Kindergarten")
            .with_tag("ref", "42")],
        targets: vec![
            TaggedEntity::new()
                .with_id("node/1")
                .at(60.0, 10.0001)
                .with_tag("name", "Sunny Kindergarten"),
            TaggedEntity::new().with_id("node/2").with_tag("name", "Moon"),
        ],
        ..MemorySource::default()
    };
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source), sink.clone());

    let summary = pipeline.run_link(&mut SkipAmbiguous).await.expect("link");

    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.tagged, 1);
    assert_eq!(summary.report.correspondences[0].target_index, 0);
    assert_eq!(summary.report.correspondences[0].score, 111);
    let applied = sink.applied();
    assert_eq!(applied[0].target_id.as_deref(), Some("node/1"));
    assert_eq!(applied[0].patched.tag("ref"), Some("42"));
}

#[tokio::test]
async fn link_run_without_tagging_leaves_sink_alone() {
    let source = MemorySource {
        current: vec![kg("42", "Sunny Kindergarten")],
        targets: vec![TaggedEntity::new()
            .with_id("node/1")
            .with_tag("name", "Sunny Kindergarten")],
        ..MemorySource::default()
    };
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source), sink.clone())
        .with_tag_links(false);

    let summary = pipeline.run_link(&mut SkipAmbiguous).await.expect("link");

    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.tagged, 0);
    assert!(sink.applied().is_empty());
}

fn ts() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-02-24T06:00:00Z")
        .expect("ts")
        .with_timezone(&Utc)
}

#[tokio::test]
async fn directory_reconcile_persists_patches_to_the_store() {
    let dir = tempdir().expect("tempdir");
    let authoritative = dir.path().join("authoritative");
    std::fs::create_dir_all(&authoritative).expect("mkdir");
    std::fs::write(
        authoritative.join("previous.json"),
        r#"{
  "dataset": "barnehagefakta",
  "captured_at": "2026-02-23T06:00:00Z",
  "entities": [
    {"id": "1016218", "lat": 59.7211, "lon": 10.84,
     "tags": {"ref": "1016218", "name": "Spilloppen barnehage", "capacity": 18, "fee": true}}
  ]
}"#,
    )
    .expect("write previous");
    std::fs::write(
        authoritative.join("current.json"),
        r#"{
  "dataset": "barnehagefakta",
  "captured_at": "2026-02-24T06:00:00Z",
  "entities": [
    {"id": "1016218", "lat": 59.7211, "lon": 10.84,
     "tags": {"ref": "1016218", "name": "Spilloppen barnehage", "capacity": 24, "fee": true,
              "contact:email": "post@spilloppen.no", "contact:website": null}}
  ]
}"#,
    )
    .expect("write current");

    let source = DirectorySource::new(dir.path());
    TargetStore::from_entities(
        source.target_store_root(),
        vec![TaggedEntity::new()
            .with_id("way/317205476")
            .with_tag("ref", "1016218")
            .with_tag("name", "Spilloppen barnehage")
            .with_tag("capacity", "18")
            .with_tag("fee", "yes")],
    )
    .save(ts())
    .await
    .expect("seed store");

    let store = TargetStore::open(source.target_store_root()).await.expect("open");
    let sink = Arc::new(StorePatchSink::new(store));
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source.clone()), sink.clone());

    let summary = pipeline.run_reconcile(&mut ApproveAll).await.expect("reconcile");
    assert_eq!(summary.count(ReconcileStatus::Applied), 1);
    sink.lock().await.save(Utc::now()).await.expect("save");

    let reopened = TargetStore::open(source.target_store_root()).await.expect("reopen");
    let patched = reopened.get("way/317205476").expect("target");
    assert_eq!(patched.tag("capacity"), Some("24"));
    assert_eq!(patched.tag("contact:email"), Some("post@spilloppen.no"));
    assert_eq!(patched.tag("contact:website"), None);
    assert!(reopened.is_modified("way/317205476"));
}

#[tokio::test]
async fn missing_previous_bundle_is_a_first_run() {
    let dir = tempdir().expect("tempdir");
    let authoritative = dir.path().join("authoritative");
    std::fs::create_dir_all(&authoritative).expect("mkdir");
    std::fs::write(
        authoritative.join("current.json"),
        r#"{"dataset": "d", "captured_at": "2026-02-24T06:00:00Z",
            "entities": [{"tags": {"ref": "1", "name": "Sol"}}]}"#,
    )
    .expect("write current");

    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(
        SyncRules::default(),
        Arc::new(DirectorySource::new(dir.path())),
        sink,
    );
    let summary = pipeline.run_reconcile(&mut ApproveAll).await.expect("reconcile");
    assert_eq!(summary.count(ReconcileStatus::PreviouslyWithdrawn), 1);
}

fn copy_fixture(into: &std::path::Path) {
    let fixture = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/barnehagefakta");
    for file in [
        "authoritative/previous.json",
        "authoritative/current.json",
        "target/targets.json",
    ] {
        let dest = into.join(file);
        std::fs::create_dir_all(dest.parent().expect("parent")).expect("mkdir");
        std::fs::copy(fixture.join(file), dest).expect("copy fixture");
    }
}

#[tokio::test]
async fn fixture_reconcile_with_workspace_rules() {
    let dir = tempdir().expect("tempdir");
    copy_fixture(dir.path());
    let rules = SyncRules::from_path(
        std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/tagsync.yaml"),
    )
    .expect("rules");

    let source = DirectorySource::new(dir.path());
    let store = TargetStore::open(source.target_store_root()).await.expect("open");
    let sink = Arc::new(StorePatchSink::new(store));
    let pipeline = SyncPipeline::new(rules, Arc::new(source), sink.clone());

    let summary = pipeline.run_reconcile(&mut ApproveAll).await.expect("reconcile");

    assert_eq!(summary.entries.len(), 4);
    assert_eq!(summary.count(ReconcileStatus::Applied), 1);
    assert_eq!(summary.count(ReconcileStatus::NoRelevantChange), 1);
    assert_eq!(summary.count(ReconcileStatus::WithdrawnLinked), 1);
    assert_eq!(summary.count(ReconcileStatus::PreviouslyWithdrawn), 1);

    // target drifted 18 -> 20, inside the capacity tolerance
    let store = sink.lock().await;
    assert_eq!(store.get("way/317205476").and_then(|e| e.tag("capacity")), Some("24"));
    assert_eq!(store.modified().len(), 1);
}

#[tokio::test]
async fn moved_record_with_unchanged_tags_keeps_position_advisory() {
    let source = MemorySource {
        previous: vec![kg("1", "Sol").at(60.0, 10.0)],
        current: vec![kg("1", "Sol").at(60.5, 10.0)],
        targets: vec![kg("1", "Sol").with_id("node/1")],
    };
    let sink = Arc::new(MemoryPatchSink::new());
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source), sink.clone());

    let summary = pipeline.run_reconcile(&mut ApproveAll).await.expect("reconcile");

    assert_eq!(summary.entries.len(), 1);
    let entry = &summary.entries[0];
    assert_eq!(entry.status, ReconcileStatus::NoRelevantChange);
    assert_eq!(entry.target_ids, vec!["node/1".to_string()]);
    assert_eq!(
        entry.advisories,
        vec![Advisory::PositionChanged {
            old: Position::new(60.0, 10.0),
            new: Position::new(60.5, 10.0),
        }]
    );
    assert!(sink.applied().is_empty());
}

#[tokio::test]
async fn link_run_reports_tagging_failures_and_continues() {
    let tagged_target = TaggedEntity::new().with_id("node/2").with_tag("name", "Måne");
    let source = MemorySource {
        current: vec![kg("1", "Sol"), kg("2", "Måne")],
        targets: vec![
            TaggedEntity::new().with_tag("name", "Sol"),
            tagged_target.clone(),
        ],
        ..MemorySource::default()
    };
    let sink = Arc::new(StorePatchSink::new(TargetStore::from_entities(".", vec![tagged_target])));
    let pipeline = SyncPipeline::new(SyncRules::default(), Arc::new(source), sink.clone());

    let summary = pipeline.run_link(&mut SkipAmbiguous).await.expect("link");

    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.tagged, 1);
    assert_eq!(summary.untagged, 1);
    assert!(summary.summary_line().contains("1 failed to tag"));
    let store = sink.lock().await;
    assert_eq!(store.get("node/2").and_then(|e| e.tag("ref")), Some("2"));
}
