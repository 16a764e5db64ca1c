mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::{directives_index, words_index, ExtractCounter, Fixture};
use quarry_core::{ChangeKind, FileEvent, FileMeta};
use quarry_index::{IndexError, IndexId, IndexState, Payload, Scope, UpdatePolicy};

fn all() -> Scope {
    Scope::everything()
}

#[test]
fn edit_removes_declaration_from_results() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter)]);
    let directives = IndexId::new("directives");

    // "controller: " is 12 bytes, so the declaration sits at offset 12.
    let f1 = fixture.file(1, "app/main.js", "controller: ngController");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();

    let hits = fixture.engine.find(&directives, "ngController", &all()).unwrap();
    assert_eq!(hits, vec![(f1.id, Payload::from_offset(12))]);

    fixture.modify(&f1, "controller: plainController");
    let hits = fixture.engine.find(&directives, "ngController", &all()).unwrap();
    assert_eq!(hits, vec![]);
}

#[test]
fn deleting_one_of_two_declaring_files() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let words = IndexId::new("words");

    let f1 = fixture.file(1, "a.js", "foo bar");
    let f2 = fixture.file(2, "b.js", "foo baz");
    fixture.engine.initialize(vec![f1.clone(), f2.clone()]).unwrap();

    assert_eq!(
        fixture.engine.files_for_key(&words, "foo", &all()).unwrap(),
        BTreeSet::from([f1.id, f2.id])
    );

    fixture.delete(&f2);
    assert_eq!(
        fixture.engine.files_for_key(&words, "foo", &all()).unwrap(),
        BTreeSet::from([f1.id])
    );
    assert!(fixture
        .engine
        .files_for_key(&words, "baz", &all())
        .unwrap()
        .is_empty());
}

#[test]
fn lazy_engine_defers_extraction_until_queried() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter.clone())]);
    let directives = IndexId::new("directives");

    let f1 = fixture.file(1, "a.js", "ngOne");
    fixture.engine.initialize(vec![f1]).unwrap();
    assert_eq!(counter.get(), 0);

    fixture.engine.all_keys(&directives, &all()).unwrap();
    assert_eq!(counter.get(), 1);
}

#[test]
fn eager_engine_extracts_on_arrival() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::with_policy(
        vec![directives_index(1, counter.clone())],
        UpdatePolicy::Eager,
    );

    let f1 = fixture.file(1, "a.js", "ngOne");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();
    assert_eq!(counter.get(), 1);

    fixture.modify(&f1, "ngTwo");
    assert_eq!(counter.get(), 2);
}

#[test]
fn unchanged_content_is_never_re_extracted() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter.clone())]);
    let directives = IndexId::new("directives");

    let f1 = fixture.file(1, "a.js", "ngOne");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();
    fixture.engine.all_keys(&directives, &all()).unwrap();
    assert_eq!(counter.get(), 1);

    // Re-notify without changing content: the fingerprint gate skips the
    // extractor entirely.
    fixture
        .engine
        .apply_event(FileEvent::new(f1.clone(), ChangeKind::Modified))
        .unwrap();
    fixture.engine.all_keys(&directives, &all()).unwrap();
    assert_eq!(counter.get(), 1);

    // Repeat queries do nothing at all.
    fixture.engine.all_keys(&directives, &all()).unwrap();
    assert_eq!(counter.get(), 1);
}

#[test]
fn scope_filters_results_and_bounds_catch_up() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter.clone())]);
    let directives = IndexId::new("directives");

    let f1 = fixture.file(1, "a.js", "ngShared");
    let f2 = fixture.file(2, "b.js", "ngShared ngOther");
    fixture.engine.initialize(vec![f1.clone(), f2.clone()]).unwrap();

    // A query scoped to f1 only drains f1's backlog entry.
    let hits = fixture
        .engine
        .find(&directives, "ngShared", &Scope::files([f1.id]))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, f1.id);
    assert_eq!(counter.get(), 1);
    assert_eq!(
        fixture.engine.state(&directives).unwrap(),
        IndexState::Validating
    );

    // Widening the scope drains the rest and reaches Ready.
    let files = fixture
        .engine
        .files_for_key(&directives, "ngShared", &all())
        .unwrap();
    assert_eq!(files, BTreeSet::from([f1.id, f2.id]));
    assert_eq!(counter.get(), 2);
    assert_eq!(fixture.engine.state(&directives).unwrap(), IndexState::Ready);
}

#[test]
fn indexes_only_see_applicable_files() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let words = IndexId::new("words");

    let js = fixture.file(1, "a.js", "visible");
    let txt = fixture.file(2, "notes.txt", "invisible");
    fixture.engine.initialize(vec![js, txt]).unwrap();

    let keys = fixture.engine.all_keys(&words, &all()).unwrap();
    assert_eq!(keys, BTreeSet::from(["visible".to_string()]));
}

#[test]
fn move_out_of_applicability_removes_contributions() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let words = IndexId::new("words");

    let f1 = fixture.file(1, "a.js", "movable");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();
    assert!(!fixture.engine.all_keys(&words, &all()).unwrap().is_empty());

    // Renamed to a non-JS file: same id, new path, no longer applicable.
    let moved = FileMeta::new(f1.id, "a.bak", f1.stamp);
    fixture
        .engine
        .apply_event(FileEvent::new(moved, ChangeKind::Moved))
        .unwrap();

    assert!(fixture.engine.all_keys(&words, &all()).unwrap().is_empty());
}

#[test]
fn file_gone_between_notification_and_read_is_removed() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let words = IndexId::new("words");

    let f1 = fixture.file(1, "a.js", "ephemeral");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();
    fixture.engine.all_keys(&words, &all()).unwrap();

    // The source loses the file but the host only reports a modification.
    fixture.source.delete(f1.id);
    fixture
        .engine
        .apply_event(FileEvent::new(f1, ChangeKind::Modified))
        .unwrap();

    assert!(fixture.engine.all_keys(&words, &all()).unwrap().is_empty());
}

#[test]
fn soft_failure_indexes_empty_and_does_not_retry() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter.clone())]);
    let directives = IndexId::new("directives");

    let f1 = fixture.file(1, "a.js", "ngOk BROKEN");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();

    assert!(fixture.engine.all_keys(&directives, &all()).unwrap().is_empty());
    let report = fixture.engine.soft_failures(&directives).unwrap();
    assert_eq!(report.count, 1);
    assert_eq!(report.recent, vec![f1.id]);

    // Still marked indexed: repeated queries do not re-run the extractor.
    fixture.engine.all_keys(&directives, &all()).unwrap();
    assert_eq!(counter.get(), 1);

    // A real fix re-extracts and clears the empty fact set.
    fixture.modify(&f1, "ngOk");
    assert_eq!(
        fixture.engine.all_keys(&directives, &all()).unwrap(),
        BTreeSet::from(["ngOk".to_string()])
    );
}

#[test]
fn unknown_index_id_fails_fast() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let missing = IndexId::new("no-such-index");

    let err = fixture.engine.find(&missing, "key", &all()).unwrap_err();
    assert!(matches!(err, IndexError::UnknownIndex { .. }));
}

#[test]
fn duplicate_registration_fails_fast() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = Arc::new(quarry_index::MemorySource::new());
    let err = quarry_index::IndexEngine::new(
        quarry_index::EngineConfig::new(dir.path()),
        source,
        vec![words_index(1), words_index(2)],
    )
    .unwrap_err();
    assert!(matches!(err, IndexError::DuplicateIndex { .. }));
}

#[test]
fn events_delivered_through_the_channel() {
    let fixture = Fixture::new(vec![words_index(1)]);
    let words = IndexId::new("words");

    let f1 = fixture.file(1, "a.js", "before");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();
    fixture.engine.all_keys(&words, &all()).unwrap();

    let sender = fixture.engine.event_sender();
    let stamp = fixture.source.write(f1.id, "after");
    sender
        .send(FileEvent::new(
            FileMeta::new(f1.id, f1.path.clone(), stamp),
            ChangeKind::Modified,
        ))
        .unwrap();

    // The queued event is absorbed at the next query.
    assert_eq!(
        fixture.engine.all_keys(&words, &all()).unwrap(),
        BTreeSet::from(["after".to_string()])
    );
}

#[test]
fn two_indexes_are_updated_independently() {
    let counter = Arc::new(ExtractCounter::default());
    let fixture = Fixture::new(vec![directives_index(1, counter), words_index(1)]);
    let directives = IndexId::new("directives");
    let words = IndexId::new("words");

    let f1 = fixture.file(1, "a.js", "ngThing other");
    fixture.engine.initialize(vec![f1.clone()]).unwrap();

    assert_eq!(
        fixture.engine.all_keys(&directives, &all()).unwrap(),
        BTreeSet::from(["ngThing".to_string()])
    );
    assert_eq!(
        fixture.engine.all_keys(&words, &all()).unwrap(),
        BTreeSet::from(["ngThing".to_string(), "other".to_string()])
    );

    // Deleting the file empties both indexes.
    fixture.delete(&f1);
    assert!(fixture.engine.all_keys(&directives, &all()).unwrap().is_empty());
    assert!(fixture.engine.all_keys(&words, &all()).unwrap().is_empty());
}
