//! End-to-end recovery and fan-out scenarios exercised against the public
//! API, each mirroring a literal case the design was checked against.

use std::fs;
use std::sync::Arc;

use bytes::Bytes;
use ledgerq_core::{Clock, FrozenClock, Journal, JournalConfig, JournaledQueue};

/// A clock under full test control, so rotation file names and recovery
/// behavior are driven by a fixed, known wall-clock value rather than
/// whatever the real clock happens to read when the test runs.
fn clock() -> Arc<FrozenClock> {
    Arc::new(FrozenClock::at(1_700_000_000_000))
}

#[test]
fn startup_discovery_classifies_every_file_kind() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = Journal::open(
            dir.path(),
            "test",
            JournalConfig::default(),
            clock(),
            Default::default(),
        )
        .unwrap();
        journal.ensure_reader("client1").unwrap();
        journal.ensure_reader("client2").unwrap();
    }
    // Debris a prior run (or a crash mid-rename) might leave behind: a
    // leftover temp checkpoint, and a file that merely starts with the
    // queue's name but is neither a writer nor a reader file.
    fs::write(dir.path().join("test.read.client1~~"), b"garbage").unwrap();
    fs::write(dir.path().join("test.readmenot"), b"ignored").unwrap();

    let journal = Journal::open(
        dir.path(),
        "test",
        JournalConfig::default(),
        clock(),
        Default::default(),
    )
    .unwrap();

    assert!(!dir.path().join("test.read.client1~~").exists());
    assert!(dir.path().join("test.readmenot").exists());
    assert_eq!(journal.reader_names().len(), 2);
}

#[test]
fn recovery_second_reader_filters_nonexistent_done_ids() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = Journal::open(
            dir.path(),
            "test",
            JournalConfig::default(),
            clock(),
            Default::default(),
        )
        .unwrap();
        for _ in 0..5 {
            journal.put(Bytes::from_static(b"x"), 1, None).unwrap();
        }
        journal.ensure_reader("r1").unwrap();
        journal.commit("r1", 1).unwrap();
        journal.commit("r1", 2).unwrap();
        journal.commit("r1", 3).unwrap();

        // A second reader acknowledges one real id out of order and one
        // far beyond anything ever journaled -- the latter can only have
        // come from a persisted doneSet surviving a prior truncation.
        journal.ensure_reader("r2").unwrap();
        journal.commit("r2", 3).unwrap();
        journal.commit("r2", 9000).unwrap();
        journal.checkpoint().unwrap();
    }
    let journal = Journal::open(
        dir.path(),
        "test",
        JournalConfig::default(),
        clock(),
        Default::default(),
    )
    .unwrap();
    assert_eq!(journal.reader_head("r1").unwrap(), 3);
    assert_eq!(journal.reader_head("r2").unwrap(), 0);
    assert!(journal.reader_done_contains("r2", 3).unwrap());
    assert!(!journal.reader_done_contains("r2", 9000).unwrap());
}

#[tokio::test]
async fn reclamation_deletes_only_fully_passed_files() {
    let dir = tempfile::tempdir().unwrap();
    // A small max file size tuned to this codec's real per-record overhead
    // (unlike the design's illustrative numbers, which assumed a different
    // concrete frame layout) so two ~150-byte payloads land in one file.
    let config = JournalConfig {
        max_file_size: 400,
        sync_interval: None,
    };
    let clock = Arc::new(FrozenClock::at(1_700_000_000_000));
    let jq = JournaledQueue::open(dir.path(), "test", config, clock.clone()).unwrap();
    jq.ensure_reader("r").unwrap();
    let payload = Bytes::from(vec![0u8; 150]);
    // Advancing the frozen clock between puts drives rotation's "name the
    // new writer file by current millisecond wall clock" behavior off a
    // known sequence instead of real elapsed time.
    for _ in 0..5 {
        jq.put(payload.clone(), 1, None).unwrap();
        clock.advance(1);
    }
    for id in 1..=2 {
        let item = jq.get("r", None).await.unwrap().unwrap();
        assert_eq!(item.id, id);
        jq.commit("r", id).unwrap();
    }
    let before = jq.stats().writer_file_count;
    assert!(before >= 2, "expected rotation to have produced multiple files");
    jq.checkpoint().unwrap();
    let after = jq.stats().writer_file_count;
    assert!(after < before, "expected reclamation to drop at least one file");
}

#[tokio::test]
async fn corrupt_tail_truncates_and_id_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let path;
    {
        let journal = Journal::open(
            dir.path(),
            "test",
            JournalConfig::default(),
            clock(),
            Default::default(),
        )
        .unwrap();
        journal.put(Bytes::from_static(b"first"), 1, None).unwrap();
        journal.put(Bytes::from_static(b"second"), 2, None).unwrap();
        path = journal.file_info_for_id(1).unwrap().path;
    }
    let len = fs::metadata(&path).unwrap().len();
    let file = fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 1).unwrap();
    drop(file);

    let journal = Journal::open(
        dir.path(),
        "test",
        JournalConfig::default(),
        clock(),
        Default::default(),
    )
    .unwrap();
    assert_eq!(journal.max_assigned_id(), 1);
    let (reused, _) = journal.put(Bytes::from_static(b"hi"), 3, None).unwrap();
    assert_eq!(reused.id, 2);
}

#[tokio::test]
async fn default_reader_exists_iff_no_named_reader() {
    let dir = tempfile::tempdir().unwrap();
    let jq = JournaledQueue::open(dir.path(), "test", JournalConfig::default(), clock()).unwrap();
    assert!(dir.path().join("test.read.").exists());
    jq.ensure_reader("only").unwrap();
    assert!(!dir.path().join("test.read.").exists());
    assert!(dir.path().join("test.read.only").exists());
}

#[tokio::test]
async fn put_ids_are_strictly_increasing_across_a_session() {
    let dir = tempfile::tempdir().unwrap();
    let jq = JournaledQueue::open(dir.path(), "test", JournalConfig::default(), clock()).unwrap();
    let mut last = 0;
    for _ in 0..50 {
        let (item, _) = jq.put(Bytes::from_static(b"x"), 1, None).unwrap();
        assert!(item.id > last);
        last = item.id;
    }
}

#[tokio::test]
async fn expired_items_are_skipped_deterministically_under_a_frozen_clock() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(FrozenClock::at(1_700_000_000_000));
    let jq = JournaledQueue::open(dir.path(), "test", JournalConfig::default(), clock.clone())
        .unwrap();
    jq.ensure_reader("r").unwrap();

    let now = clock.now_ms();
    jq.put(Bytes::from_static(b"stale1"), now, Some(now + 10))
        .unwrap();
    jq.put(Bytes::from_static(b"stale2"), now, Some(now + 10))
        .unwrap();
    jq.put(Bytes::from_static(b"fresh"), now, None).unwrap();

    clock.advance(50);
    let got = jq.get("r", None).await.unwrap().unwrap();
    assert_eq!(got.payload, Bytes::from_static(b"fresh"));
    // Both stale items were auto-committed and skipped rather than queued
    // up for a caller that will never see them.
    assert_eq!(jq.reader_size("r").unwrap(), 0);
}

/// Random put/abort/commit interleaving: every item a reader ever sees must
/// eventually be committed exactly once, and abort must never lose one.
#[tokio::test]
async fn random_put_abort_commit_sequence_delivers_every_item_once() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let dir = tempfile::tempdir().unwrap();
    let jq = JournaledQueue::open(dir.path(), "test", JournalConfig::default(), clock()).unwrap();
    jq.ensure_reader("r").unwrap();

    let mut rng = StdRng::seed_from_u64(20260801);
    let mut committed = std::collections::HashSet::new();
    let total_puts: usize = 40;
    for _ in 0..total_puts {
        jq.put(Bytes::from(vec![rng.r#gen::<u8>(); 4]), 1, None)
            .unwrap();
    }

    while committed.len() < total_puts {
        let item = jq.get("r", None).await.unwrap().unwrap();
        if rng.gen_bool(0.3) {
            jq.abort("r", item.id).unwrap();
            continue;
        }
        jq.commit("r", item.id).unwrap();
        assert!(committed.insert(item.id), "item {} committed twice", item.id);
    }

    let mut ids: Vec<_> = committed.into_iter().collect();
    ids.sort_unstable();
    assert_eq!(ids, (1..=total_puts as u64).collect::<Vec<_>>());
}
