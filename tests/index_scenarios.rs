//! Integration tests for the six scenarios and P1-P8 invariants.
//!
//! Test style grounded on `chunk_store.rs::test_chunk_store1`: an absolute
//! path under a dot-prefixed directory in the crate root, removed before
//! and after. Each test gets its own subdirectory so they can run
//! concurrently.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use mail_index::{HeaderFlags, IndexOpenOptions, LockState, MailIndex, ModLogEvent, MsgFlags};

fn test_dir(name: &str) -> PathBuf {
    let mut path = std::fs::canonicalize(".").unwrap();
    path.push(".testdir-index");
    path.push(name);
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    path
}

fn cleanup(path: &Path) {
    let _ = std::fs::remove_dir_all(path);
}

#[test]
fn scenario_1_append_three_messages() {
    let dir = test_dir("scenario1");

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    idx.set_lock(LockState::Exclusive).unwrap();

    idx.append(MsgFlags::empty(), b"hello").unwrap();
    idx.append(MsgFlags::SEEN, b"world").unwrap();
    idx.append(MsgFlags::DELETED, b"gone").unwrap();

    let hdr = idx.header_snapshot().unwrap();
    assert_eq!(hdr.messages_count, 3);
    assert_eq!(hdr.seen_messages_count, 1);
    assert_eq!(hdr.deleted_messages_count, 1);
    assert_eq!(hdr.next_uid, 4);
    assert_eq!(hdr.first_hole_position, 0);

    idx.check_invariants().unwrap();
    idx.set_lock(LockState::Unlocked).unwrap();

    cleanup(&dir);
}

#[test]
fn scenario_2_expunge_creates_one_hole() {
    let dir = test_dir("scenario2");

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    idx.set_lock(LockState::Exclusive).unwrap();

    idx.append(MsgFlags::empty(), b"a").unwrap();
    let pos2 = idx.append(MsgFlags::empty(), b"b").unwrap();
    idx.append(MsgFlags::empty(), b"c").unwrap();

    idx.expunge(pos2, 2, false).unwrap();

    let hdr = idx.header_snapshot().unwrap();
    assert_eq!(hdr.messages_count, 2);
    assert_eq!(hdr.seen_messages_count, 0);
    assert_eq!(hdr.first_hole_position, mail_index::IndexHeader::SIZE as u64 + mail_index::RECORD_SIZE as u64);
    assert_eq!(hdr.first_hole_records, 1);

    let log = idx.read_mod_log().unwrap();
    assert!(log.contains(&ModLogEvent::Expunge { seq: 2, uid: 2, external: false }));

    idx.check_invariants().unwrap();
    idx.set_lock(LockState::Unlocked).unwrap();

    cleanup(&dir);
}

#[test]
fn scenario_3_adjacent_holes_merge_without_compress() {
    let dir = test_dir("scenario3");

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    idx.set_lock(LockState::Exclusive).unwrap();

    idx.append(MsgFlags::empty(), b"a").unwrap(); // uid 1
    let pos2 = idx.append(MsgFlags::empty(), b"b").unwrap(); // uid 2
    let pos3 = idx.append(MsgFlags::empty(), b"c").unwrap(); // uid 3

    idx.expunge(pos2, 2, false).unwrap();

    // uid 3 is now at sequence 2.
    let seq_of_uid3 = idx.get_sequence(pos3).unwrap();
    assert_eq!(seq_of_uid3, 2);
    idx.expunge(pos3, seq_of_uid3, false).unwrap();

    let hdr = idx.header_snapshot().unwrap();
    assert_eq!(hdr.first_hole_records, 2);
    assert!(!hdr.flags().contains(HeaderFlags::COMPRESS));

    idx.check_invariants().unwrap();
    idx.set_lock(LockState::Unlocked).unwrap();

    cleanup(&dir);
}

#[test]
fn scenario_4_nonadjacent_holes_set_compress() {
    let dir = test_dir("scenario4");

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    idx.set_lock(LockState::Exclusive).unwrap();

    let mut positions = Vec::new();
    for i in 1..=5u8 {
        positions.push(idx.append(MsgFlags::empty(), &[i]).unwrap());
    }

    // uid 2 at position 1, sequence 2.
    idx.expunge(positions[1], 2, false).unwrap();

    // uid 4's sequence shifted down by one after uid 2 was expunged.
    let pos_uid4 = idx.lookup_uid_range(4, 4).unwrap().unwrap();
    let seq_uid4 = idx.get_sequence(pos_uid4).unwrap();
    idx.expunge(pos_uid4, seq_uid4, false).unwrap();

    let hdr = idx.header_snapshot().unwrap();
    assert!(hdr.flags().contains(HeaderFlags::COMPRESS));
    assert_eq!(hdr.first_hole_position, mail_index::IndexHeader::SIZE as u64 + mail_index::RECORD_SIZE as u64);
    assert_eq!(hdr.first_hole_records, 1);

    idx.check_invariants().unwrap();
    idx.set_lock(LockState::Unlocked).unwrap();

    cleanup(&dir);
}

#[test]
fn scenario_5_fsck_recovers_after_crash() {
    let dir = test_dir("scenario5");

    {
        let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
        idx.set_lock(LockState::Exclusive).unwrap();
        idx.append(MsgFlags::SEEN, b"only message").unwrap();
        // Simulate a crash: drop the handle while EXCLUSIVE, without
        // folding pending header changes or clearing the FSCK flag that
        // was set (and msynced) on entry to EXCLUSIVE.
    }

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    let hdr = idx.header_snapshot().unwrap();
    assert!(!hdr.flags().contains(HeaderFlags::FSCK));
    assert_eq!(hdr.messages_count, 1);
    assert_eq!(hdr.seen_messages_count, 1);

    idx.check_invariants().unwrap();

    cleanup(&dir);
}

#[test]
fn scenario_6_external_indexid_change_marks_inconsistent() {
    let dir = test_dir("scenario6");

    let mut idx1 = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    assert_eq!(idx1.lock_state(), LockState::Unlocked);

    // Simulate another process rewriting indexid in place (e.g. after its
    // own rebuild assigned a fresh one). `indexid` sits right after
    // `compat_data` (4 bytes) and `version` (4 bytes).
    {
        let index_path = idx1.path().to_path_buf();
        let mut raw = std::fs::OpenOptions::new().read(true).write(true).open(&index_path).unwrap();
        raw.seek(SeekFrom::Start(8)).unwrap();
        let mut buf = [0u8; 4];
        raw.read_exact(&mut buf).unwrap();
        let rewritten = u32::from_le_bytes(buf).wrapping_add(1);
        raw.seek(SeekFrom::Start(8)).unwrap();
        raw.write_all(&rewritten.to_le_bytes()).unwrap();
        raw.flush().unwrap();
    }

    let result = idx1.set_lock(LockState::Shared);
    assert!(result.is_err());
    assert!(idx1.is_inconsistency_error());

    // Once inconsistent, every further call is rejected too.
    assert!(idx1.set_lock(LockState::Unlocked).is_err());

    cleanup(&dir);
}

#[test]
fn round_trip_preserves_live_records() {
    let dir = test_dir("roundtrip");

    {
        let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
        idx.set_lock(LockState::Exclusive).unwrap();
        idx.append(MsgFlags::empty(), b"one").unwrap();
        idx.append(MsgFlags::FLAGGED, b"two").unwrap();
        idx.set_lock(LockState::Unlocked).unwrap();
    }

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    let hdr = idx.header_snapshot().unwrap();
    assert_eq!(hdr.messages_count, 2);
    assert_eq!(hdr.next_uid, 3);

    let pos = idx.lookup_by_seq(2).unwrap().unwrap();
    let rec = idx.record_at(pos).unwrap();
    assert_eq!(rec.uid, 2);
    assert!(rec.msg_flags().contains(MsgFlags::FLAGGED));

    idx.check_invariants().unwrap();

    cleanup(&dir);
}

#[test]
fn lookup_by_seq_and_get_sequence_agree() {
    let dir = test_dir("lookup");

    let mut idx = MailIndex::open_or_create(&dir, IndexOpenOptions::default()).unwrap();
    idx.set_lock(LockState::Exclusive).unwrap();

    for i in 0..10u8 {
        idx.append(MsgFlags::empty(), &[i]).unwrap();
    }
    // expunge a couple of records out of order to exercise the hole-aware walk
    let pos5 = idx.lookup_uid_range(5, 5).unwrap().unwrap();
    idx.expunge(pos5, idx.get_sequence(pos5).unwrap(), false).unwrap();
    let pos8 = idx.lookup_uid_range(8, 8).unwrap().unwrap();
    idx.expunge(pos8, idx.get_sequence(pos8).unwrap(), false).unwrap();

    let mut seq = 1;
    let mut cursor = idx.lookup_by_seq(1).unwrap();
    while let Some(pos) = cursor {
        let rec = idx.record_at(pos).unwrap();
        assert_eq!(idx.get_sequence(pos).unwrap(), seq);
        assert_eq!(idx.lookup_by_seq(seq).unwrap(), Some(pos));
        assert_eq!(idx.lookup_uid_range(rec.uid, rec.uid).unwrap(), Some(pos));
        cursor = idx.next(pos);
        seq += 1;
    }
    assert_eq!(seq - 1, 8); // 10 appended, 2 expunged

    idx.check_invariants().unwrap();
    idx.set_lock(LockState::Unlocked).unwrap();

    cleanup(&dir);
}
