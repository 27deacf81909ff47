use std::sync::Arc;

use proptest::prelude::*;
use token_board::metrics::Counter;
use token_board::storage::{EncryptedGroupMessage, MessageStore, SqliteMessageStore};

fn msg(sig: &[u8], ct: &[u8]) -> EncryptedGroupMessage {
    EncryptedGroupMessage {
        signature: sig.to_vec(),
        ciphertext: ct.to_vec(),
    }
}

fn open_store(dir: &tempfile::TempDir) -> SqliteMessageStore {
    SqliteMessageStore::open(&dir.path().join("cwtch.messages"), Arc::new(Counter::new())).unwrap()
}

#[test]
fn round_trip_hundred_messages() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);

    let sigs: Vec<Vec<u8>> = (0u32..100).map(|i| i.to_be_bytes().to_vec()).collect();
    for sig in &sigs {
        store.add(msg(sig, b"an encrypted group message"));
    }

    let all = store.fetch_all();
    assert_eq!(all.len(), 100);
    for (i, m) in all.iter().enumerate() {
        assert_eq!(m.signature, sigs[i]);
    }

    // suffix from the 50th inserted signature (inclusive)
    let suffix = store.fetch_from(&sigs[49]);
    assert_eq!(suffix.len(), 51);
    assert_eq!(suffix[0].signature, sigs[49]);
    assert_eq!(suffix[50].signature, sigs[99]);
}

#[test]
fn empty_signature_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add(msg(b"real", b"kept"));
    store.add(msg(b"", b"dropped"));
    assert_eq!(store.count(), 1);
}

#[test]
fn duplicate_signature_keeps_first_ciphertext() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store.add(msg(b"A", b"X"));
    store.add(msg(b"A", b"Y"));
    assert_eq!(store.count(), 1);
    let all = store.fetch_all();
    assert_eq!(all[0].ciphertext, b"X".to_vec());
}

#[test]
fn fetch_from_unknown_signature_falls_back_to_full_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    for i in 0u32..10 {
        store.add(msg(&i.to_be_bytes(), b"x"));
    }
    assert_eq!(store.fetch_from(b"never inserted").len(), 10);
    assert_eq!(store.fetch_from(b"").len(), 10);
}

#[test]
fn fetch_from_survives_out_of_band_purge() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cwtch.messages");
    let store = SqliteMessageStore::open(&path, Arc::new(Counter::new())).unwrap();

    let sigs: Vec<Vec<u8>> = (0u32..500).map(|i| i.to_be_bytes().to_vec()).collect();
    for sig in &sigs {
        store.add(msg(sig, b"x"));
    }
    store.close();

    // an operator prunes old rows outside the server
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute("DELETE FROM messages WHERE id < 100", []).unwrap();
    drop(conn);

    let store = SqliteMessageStore::open(&path, Arc::new(Counter::new())).unwrap();
    // the client's resumption point is gone, so it receives the full
    // remaining history rather than silently losing messages
    let replay = store.fetch_from(&sigs[49]);
    assert_eq!(replay.len(), 401);
    assert_eq!(replay[0].signature, sigs[99]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn fetch_all_matches_distinct_nonempty_submissions(
        sigs in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..8), 1..40)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let mut distinct = std::collections::HashSet::new();
        for sig in &sigs {
            store.add(msg(sig, b"payload"));
            if !sig.is_empty() {
                distinct.insert(sig.clone());
            }
        }
        prop_assert_eq!(store.fetch_all().len(), distinct.len());
    }

    #[test]
    fn suffix_length_from_kth_signature(n in 2u32..60, k_seed in 0u32..60) {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let sigs: Vec<Vec<u8>> = (0..n).map(|i| i.to_be_bytes().to_vec()).collect();
        for sig in &sigs {
            store.add(msg(sig, b"x"));
        }
        // k is 1-indexed
        let k = (k_seed % n) + 1;
        let suffix = store.fetch_from(&sigs[(k - 1) as usize]);
        prop_assert_eq!(suffix.len() as u32, n - k + 1);
        for (i, m) in suffix.iter().enumerate() {
            prop_assert_eq!(&m.signature, &sigs[(k - 1) as usize + i]);
        }
    }
}
