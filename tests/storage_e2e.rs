//! End-to-end tests for the storage layer.
//!
//! Every behavior is checked on both backends where it applies:
//! - Metadata round-trip
//! - Type accumulation in the schema registry
//! - Metadata deletion policy
//! - Migration of entities between managers
//! - Namespace isolation and sharing

use std::path::Path;
use std::sync::Arc;

use convostore::{
    open_database, Backend, BackendKind, Conversation, ConvoError, Document, DocumentDatabase,
    ObjKind, PersistentConfig, PolicyViolation, Speaker, StorageManager, StorageOptions, TypeTag,
    Utterance, Value,
};
use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn database(dir: &Path) -> Arc<DocumentDatabase> {
    open_database(
        dir,
        Some(PersistentConfig {
            sync_on_write: false,
            ..PersistentConfig::default()
        }),
    )
    .unwrap()
}

fn backends(dir: &Path) -> Vec<Backend> {
    vec![Backend::Memory, Backend::Persistent(database(dir))]
}

fn utterance(manager: &StorageManager, speaker: &mut Speaker, id: &str, text: &str) -> Utterance {
    Utterance::builder()
        .id(id)
        .speaker(speaker)
        .text(text)
        .build(manager)
        .unwrap()
}

/// Equality that treats every NaN as equal to itself.
fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) if x.is_nan() && y.is_nan() => true,
        _ => a == b,
    }
}

#[test]
fn test_metadata_roundtrip_on_both_backends() {
    init_tracing();
    let dir = tempdir().unwrap();

    let values = vec![
        Value::from(5),
        Value::from(2.5),
        Value::from(f64::NAN),
        Value::from(f64::INFINITY),
        Value::from(f64::NEG_INFINITY),
        Value::from("five"),
        Value::from(true),
        Value::from(vec!["a", "b"]),
        Value::binary(vec![0u8, 159, 255]),
        Value::Null,
    ];

    for backend in backends(dir.path()) {
        let kind = backend.kind();
        let manager = StorageManager::new(backend, StorageOptions::named("roundtrip")).unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        let utt = utterance(&manager, &mut bob, "0", "hi");

        for (i, value) in values.iter().enumerate() {
            let key = format!("k{i}");
            utt.meta().set(key.as_str(), value.clone()).unwrap();
            let stored = utt.meta().get(key.as_str()).unwrap();
            assert!(same(&stored, value), "backend {kind}: {stored:?} != {value:?}");

            let reloaded = manager.get_utterance("0").unwrap().meta().get(key.as_str()).unwrap();
            assert!(same(&reloaded, value), "backend {kind}: {reloaded:?} != {value:?}");
        }
        assert_eq!(utt.meta().len().unwrap(), values.len());
    }
}

#[test]
fn test_type_accumulation_across_entities() {
    let dir = tempdir().unwrap();

    for backend in backends(dir.path()) {
        let manager = StorageManager::new(backend, StorageOptions::named("types")).unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();

        let inputs = [Value::from(5), Value::from(5.0), Value::from("five")];
        for (i, value) in inputs.into_iter().enumerate() {
            let utt = utterance(&manager, &mut bob, &i.to_string(), "x");
            utt.meta().set("score", value).unwrap();
        }
        {
            let registry = manager.registry().read().unwrap();
            assert_eq!(
                registry.tags(ObjKind::Utterance, "score"),
                Some(&[TypeTag::Int, TypeTag::Float, TypeTag::Str][..])
            );
        }

        let utt = manager.get_utterance("0").unwrap();
        utt.meta().set("score", Value::binary(vec![1, 2, 3])).unwrap();
        utt.meta().set("score", 7).unwrap();

        let registry = manager.registry().read().unwrap();
        assert_eq!(
            registry.tags(ObjKind::Utterance, "score"),
            Some(&[TypeTag::Bin][..])
        );
    }
}

#[test]
fn test_deletion_lock_and_bulk_delete() {
    let dir = tempdir().unwrap();

    for backend in backends(dir.path()) {
        let manager = StorageManager::new(backend, StorageOptions::named("locks")).unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        let a = utterance(&manager, &mut bob, "0", "x");
        let b = utterance(&manager, &mut bob, "1", "y");
        a.meta().set("toxicity", 0.9).unwrap();
        b.meta().set("toxicity", 0.1).unwrap();

        let err = a.meta().delete("toxicity").unwrap_err();
        assert!(matches!(
            err,
            ConvoError::Policy(PolicyViolation::MetadataDeletionLocked { .. })
        ));
        assert!(a.meta().contains("toxicity").unwrap());

        assert_eq!(manager.delete_metadata(ObjKind::Utterance, "toxicity").unwrap(), 2);
        assert!(!a.meta().contains("toxicity").unwrap());
        assert!(!b.meta().contains("toxicity").unwrap());
        assert!(manager
            .registry()
            .read()
            .unwrap()
            .tags(ObjKind::Utterance, "toxicity")
            .is_none());
    }
}

/// Moves an utterance from `source` to `target` and checks that the two
/// copies are independent afterwards.
fn assert_migrates(source: &StorageManager, target: &StorageManager) {
    let mut bob = Speaker::new(source, "bob").unwrap();
    bob.meta().set("age", 30).unwrap();
    let mut utt = Utterance::builder()
        .id("0")
        .speaker(&mut bob)
        .text("hi")
        .meta("color", "red")
        .build(source)
        .unwrap();

    target.insert_utterance(&mut utt).unwrap();
    assert_eq!(utt.manager(), target);

    let migrated = target.get_utterance("0").unwrap();
    assert_eq!(migrated.text().unwrap(), "hi");
    assert_eq!(migrated.speaker_id().unwrap(), "bob");
    assert_eq!(migrated.meta().get("color").unwrap(), Value::from("red"));
    let moved_bob = target.get_speaker("bob").unwrap();
    assert_eq!(moved_bob.meta().get("age").unwrap(), Value::from(30));
    {
        let registry = target.registry().read().unwrap();
        assert!(registry.tags(ObjKind::Utterance, "color").is_some());
        assert!(registry.tags(ObjKind::Speaker, "age").is_some());
    }

    migrated.set_text("changed").unwrap();
    migrated.meta().set("color", "blue").unwrap();
    moved_bob.meta().set("age", 31).unwrap();

    let original = source.get_utterance("0").unwrap();
    assert_eq!(original.text().unwrap(), "hi");
    assert_eq!(original.meta().get("color").unwrap(), Value::from("red"));
    assert_eq!(
        source.get_speaker("bob").unwrap().meta().get("age").unwrap(),
        Value::from(30)
    );
}

#[test]
fn test_migration_between_backends() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = database(dir.path());

    let memory = StorageManager::new(Backend::Memory, StorageOptions::named("src")).unwrap();
    let persistent =
        StorageManager::new(Backend::Persistent(Arc::clone(&db)), StorageOptions::named("dst"))
            .unwrap();
    assert_migrates(&memory, &persistent);

    let persistent =
        StorageManager::new(Backend::Persistent(db), StorageOptions::named("from_disk")).unwrap();
    let memory = StorageManager::new(Backend::Memory, StorageOptions::named("to_mem")).unwrap();
    assert_migrates(&persistent, &memory);
}

#[test]
fn test_migration_between_memory_namespaces() {
    let first = StorageManager::new(Backend::Memory, StorageOptions::named("same")).unwrap();
    let second = StorageManager::new(Backend::Memory, StorageOptions::named("same")).unwrap();
    assert_ne!(first, second);
    assert_migrates(&first, &second);
}

#[test]
fn test_same_collection_insert_is_adoption() {
    let manager = StorageManager::new(Backend::Memory, StorageOptions::named("adopt")).unwrap();
    let mut alice = Speaker::new(&manager, "alice").unwrap();
    alice.meta().set("age", 30).unwrap();

    manager.insert_speaker(&mut alice).unwrap();
    alice.meta().set("age", 31).unwrap();

    assert_eq!(
        manager.get_speaker("alice").unwrap().meta().get("age").unwrap(),
        Value::from(31)
    );
    assert_eq!(manager.speakers().unwrap().len().unwrap(), 1);
}

#[test]
fn test_mismatched_id_is_rejected() {
    let manager = StorageManager::new(Backend::Memory, StorageOptions::named("ids")).unwrap();
    let mut alice = Speaker::new(&manager, "alice").unwrap();

    let err = manager.speakers().unwrap().set("bob", &mut alice).unwrap_err();
    assert!(err.is_type_error());
}

#[test]
fn test_namespace_isolation_and_sharing() {
    let dir = tempdir().unwrap();
    let db = database(dir.path());

    let first =
        StorageManager::new(Backend::Persistent(Arc::clone(&db)), StorageOptions::named("shared"))
            .unwrap();
    first.corpus_meta().unwrap().set("origin", "first").unwrap();

    let snapshot =
        StorageManager::new(Backend::Persistent(Arc::clone(&db)), StorageOptions::named("shared"))
            .unwrap();
    snapshot.corpus_meta().unwrap().set("origin", "snapshot").unwrap();
    assert_eq!(
        first.corpus_meta().unwrap().get("origin").unwrap(),
        Value::from("first")
    );

    let in_place = StorageManager::new(
        Backend::Persistent(db),
        StorageOptions::named("shared").in_place(true),
    )
    .unwrap();
    in_place.corpus_meta().unwrap().set("origin", "in place").unwrap();
    assert_eq!(
        first.corpus_meta().unwrap().get("origin").unwrap(),
        Value::from("in place")
    );
    assert_eq!(
        snapshot.corpus_meta().unwrap().get("origin").unwrap(),
        Value::from("snapshot")
    );
}

#[test]
fn test_bob_scenario() {
    init_tracing();
    let dir = tempdir().unwrap();
    let db = database(dir.path());

    let m1 = StorageManager::new(Backend::Persistent(Arc::clone(&db)), StorageOptions::named("bob"))
        .unwrap();
    let mut bob = Speaker::new(&m1, "Bob").unwrap();
    utterance(&m1, &mut bob, "0", "Hi");

    let m2 = StorageManager::new(
        Backend::Persistent(db),
        StorageOptions::named("bob").in_place(true),
    )
    .unwrap();
    let utt = m2.get_utterance("0").unwrap();
    assert_eq!(utt.text().unwrap(), "Hi");
    assert_eq!(utt.speaker().unwrap().id(), "Bob");
}

#[test]
fn test_data_survives_reopen() {
    let dir = tempdir().unwrap();
    {
        let manager = StorageManager::new(
            Backend::Persistent(database(dir.path())),
            StorageOptions::named("durable"),
        )
        .unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        let utt = utterance(&manager, &mut bob, "0", "persisted");
        utt.meta().set("score", 3).unwrap();
        utt.meta().set("missing_score", f64::NAN).unwrap();
        utt.meta().set("ceiling", f64::INFINITY).unwrap();
    }

    let manager = StorageManager::new(
        Backend::Persistent(database(dir.path())),
        StorageOptions::named("durable").in_place(true),
    )
    .unwrap();
    assert_eq!(manager.storage_kind(), BackendKind::Persistent);

    let utt = manager.get_utterance("0").unwrap();
    assert_eq!(utt.text().unwrap(), "persisted");
    assert_eq!(utt.meta().get("score").unwrap(), Value::from(3));
    assert!(utt.meta().get("missing_score").unwrap().as_float().unwrap().is_nan());
    assert_eq!(utt.meta().get("ceiling").unwrap(), Value::from(f64::INFINITY));
    assert_eq!(
        manager.get_speaker("bob").unwrap().utterance_ids().unwrap(),
        vec!["0".to_string()]
    );
    assert_eq!(
        manager
            .registry()
            .read()
            .unwrap()
            .tags(ObjKind::Utterance, "score"),
        Some(&[TypeTag::Int][..])
    );
}

#[test]
fn test_conversation_links() {
    let dir = tempdir().unwrap();

    for backend in backends(dir.path()) {
        let manager = StorageManager::new(backend, StorageOptions::named("convo")).unwrap();
        let mut alice = Speaker::new(&manager, "alice").unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        let convo = Conversation::new(&manager, "c1").unwrap();

        let utts = [
            utterance(&manager, &mut bob, "0", "hi"),
            utterance(&manager, &mut alice, "1", "hello"),
            utterance(&manager, &mut bob, "2", "bye"),
        ];
        for utt in &utts {
            assert!(convo.add_utterance(utt).unwrap());
        }
        assert!(!convo.add_utterance(&utts[0]).unwrap());

        assert_eq!(convo.utterance_ids().unwrap(), vec!["0", "1", "2"]);
        assert_eq!(convo.speaker_ids().unwrap(), vec!["bob", "alice"]);
        assert_eq!(
            utts[1].get_conversation().unwrap().id(),
            "c1"
        );
        assert_eq!(bob.conversation_ids().unwrap(), vec!["c1"]);
        assert_eq!(bob.iter_utterances().unwrap().len(), 2);
        assert_eq!(alice.iter_conversations().unwrap()[0], convo);
    }
}

#[test]
fn test_store_filter_and_drop() {
    let dir = tempdir().unwrap();

    for backend in backends(dir.path()) {
        let manager = StorageManager::new(backend, StorageOptions::named("prune")).unwrap();
        let mut bob = Speaker::new(&manager, "bob").unwrap();
        for i in 0..4 {
            utterance(&manager, &mut bob, &i.to_string(), if i % 2 == 0 { "keep" } else { "drop" });
        }

        let store = manager.utterances().unwrap();
        let removed = store
            .filter(|u| u.text().map(|t| t == "keep").unwrap_or(false))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.ids().unwrap(), vec!["0", "2"]);
        assert!(store.get("1").unwrap_err().is_not_found());
        let metas = manager.metas().unwrap().ids().unwrap();
        assert!(metas.contains(&"utterance_0".to_string()));
        assert!(!metas.contains(&"utterance_1".to_string()));

        store.drop_collection().unwrap();
        assert!(store.is_empty().unwrap());
        store.drop_collection().unwrap();
    }
}

#[test]
fn test_deleting_entities_drops_their_metadata() {
    let dir = tempdir().unwrap();

    for backend in backends(dir.path()) {
        let kind = backend.kind();
        let manager = StorageManager::new(backend, StorageOptions::named("forget")).unwrap();
        let bob = Speaker::new(&manager, "bob").unwrap();
        bob.meta().set("age", 30).unwrap();
        let alice = Speaker::new(&manager, "alice").unwrap();
        alice.meta().set("nickname", "al").unwrap();

        manager.speakers().unwrap().delete("bob").unwrap();
        let metas = manager.metas().unwrap();
        assert!(!metas.contains("speaker_bob").unwrap(), "backend {kind}");
        assert!(metas.contains("speaker_alice").unwrap(), "backend {kind}");

        manager.reindex().unwrap();
        {
            let registry = manager.registry().read().unwrap();
            assert!(registry.tags(ObjKind::Speaker, "age").is_none(), "backend {kind}");
            assert!(registry.tags(ObjKind::Speaker, "nickname").is_some(), "backend {kind}");
        }

        assert_eq!(manager.speakers().unwrap().filter(|_| false).unwrap(), 1);
        assert!(metas.is_empty().unwrap(), "backend {kind}");
    }
}

#[test]
fn test_raw_metas_store() {
    let manager = StorageManager::new(Backend::Memory, StorageOptions::named("raw")).unwrap();
    let mut bob = Speaker::new(&manager, "bob").unwrap();
    let utt = utterance(&manager, &mut bob, "0", "x");
    utt.meta().set("k", 1).unwrap();

    let metas = manager.metas().unwrap();
    let raw: Document = metas.get(convostore::storage_key(ObjKind::Utterance, "0")).unwrap();
    assert_eq!(raw.get("k"), Some(&Value::from(1)));
    assert!(metas.contains("speaker_bob").unwrap());
}
