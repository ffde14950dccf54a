//! Export/import round-trip tests: archives rebuilt into a fresh engine
//! reproduce canonical state, and overlapping imports stay idempotent.

// Integration tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use memsync::io::ExportFilter;
use memsync::merge::ResolutionPolicy;
use memsync::{
    MemoryToken, MemsyncConfig, MemsyncEngine, OriginId, OriginKey, SyncTrigger, TokenContent,
    TokenId, Visibility,
};

fn engine(dir: &std::path::Path) -> MemsyncEngine {
    MemsyncEngine::open(MemsyncConfig::default().with_data_dir(dir)).unwrap()
}

fn seed(engine: &MemsyncEngine, origin: &str, tokens: &[(&str, &str)]) {
    let origin_id = OriginId::from(origin);
    engine
        .register_origin(origin_id.clone(), &OriginKey::generate())
        .unwrap();
    for (id, text) in tokens {
        engine
            .enqueue(MemoryToken::new(*id, TokenContent::new(*text), origin))
            .unwrap();
    }
    engine.sync(&origin_id, SyncTrigger::Manual).unwrap();
}

#[test]
fn full_round_trip_reproduces_canonical_state() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    seed(
        &source,
        "dev-1",
        &[("tok-a", "alpha"), ("tok-b", "beta"), ("tok-c", "gamma")],
    );

    let json = source.export_json(&ExportFilter::default()).unwrap();

    let dst_dir = tempfile::tempdir().unwrap();
    let target = engine(dst_dir.path());
    let report = target.import_json(&json, "restore").unwrap();
    assert_eq!(report.applied, 3);

    for id in ["tok-a", "tok-b", "tok-c"] {
        let original = source.get(&TokenId::from(id)).unwrap().unwrap();
        let restored = target.get(&TokenId::from(id)).unwrap().unwrap();
        assert_eq!(original.content_hash, restored.content_hash);
        assert_eq!(original.version, restored.version);
        assert_eq!(original.origin_id, restored.origin_id);
    }
}

#[test]
fn reimporting_the_same_archive_changes_nothing() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    seed(&source, "dev-1", &[("tok-a", "alpha")]);
    let archive = source.export(&ExportFilter::default()).unwrap();

    let dst_dir = tempfile::tempdir().unwrap();
    let target = engine(dst_dir.path());
    target.import(&archive, "restore").unwrap();

    let report = target.import(&archive, "restore").unwrap();
    assert!(report.is_noop());
    assert_eq!(report.already_applied, 1);
    assert_eq!(target.history(&TokenId::from("tok-a")).unwrap().len(), 1);
}

#[test]
fn overlapping_archives_merge_by_version() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    seed(&source, "dev-1", &[("tok-a", "v1 of a")]);
    let early = source.export(&ExportFilter::default()).unwrap();

    // Canonical state moves on before the second export.
    let origin = OriginId::from("dev-1");
    source
        .enqueue(
            MemoryToken::new("tok-a", TokenContent::new("v2 of a"), "dev-1").with_version(2),
        )
        .unwrap();
    source.sync(&origin, SyncTrigger::Manual).unwrap();
    let late = source.export(&ExportFilter::default()).unwrap();

    let dst_dir = tempfile::tempdir().unwrap();
    let target = engine(dst_dir.path());
    target.import(&late, "restore").unwrap();

    // Importing the older archive afterwards is rejected as stale.
    let report = target.import(&early, "restore").unwrap();
    assert_eq!(report.stale, 1);
    assert_eq!(target.get(&TokenId::from("tok-a")).unwrap().unwrap().version, 2);
}

#[test]
fn export_filter_limits_archive_scope() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    seed(&source, "dev-1", &[("tok-a", "alpha")]);
    seed(&source, "dev-2", &[("tok-b", "beta")]);

    let filter = ExportFilter {
        origins: vec![OriginId::from("dev-2")],
        ..ExportFilter::default()
    };
    let archive = source.export(&filter).unwrap();
    assert_eq!(archive.tokens.len(), 1);
    assert_eq!(archive.tokens[0].id.as_str(), "tok-b");
}

#[test]
fn visibility_filter_exports_only_matching_tokens() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    let origin = OriginId::from("dev-1");
    source
        .register_origin(origin.clone(), &OriginKey::generate())
        .unwrap();
    source
        .enqueue(
            MemoryToken::new("tok-team", TokenContent::new("shared note"), "dev-1")
                .with_visibility(Visibility::Team),
        )
        .unwrap();
    source
        .enqueue(MemoryToken::new("tok-private", TokenContent::new("mine"), "dev-1"))
        .unwrap();
    source.sync(&origin, SyncTrigger::Manual).unwrap();

    let filter = ExportFilter {
        visibility: Some(Visibility::Team),
        ..ExportFilter::default()
    };
    let archive = source.export(&filter).unwrap();
    assert_eq!(archive.tokens.len(), 1);
    assert_eq!(archive.tokens[0].id.as_str(), "tok-team");
}

#[test]
fn imported_conflicts_follow_the_target_policy() {
    let src_dir = tempfile::tempdir().unwrap();
    let source = engine(src_dir.path());
    seed(&source, "dev-1", &[("tok-a", "incoming side")]);
    let archive = source.export(&ExportFilter::default()).unwrap();

    // Target already holds a different version 1 of the same id.
    let dst_dir = tempfile::tempdir().unwrap();
    let target = MemsyncEngine::open(
        MemsyncConfig::default()
            .with_data_dir(dst_dir.path())
            .with_policy(ResolutionPolicy::ManualOnly),
    )
    .unwrap();
    seed(&target, "dev-9", &[("tok-a", "canonical side")]);

    let report = target.import(&archive, "restore").unwrap();
    assert_eq!(report.conflicted, 1);
    assert_eq!(target.pending_conflicts().unwrap().len(), 1);
    // Canonical state untouched while pending.
    assert_eq!(
        target.get(&TokenId::from("tok-a")).unwrap().unwrap().content.text,
        "canonical side"
    );
}
