//! Unit tests for the key-value store backends.

#[cfg(test)]
mod store_tests {
    use crate::data::store::{validate_key, FileStore, KeyValueStore, MemoryStore};
    use crate::error::StoreError;
    use std::sync::Arc;

    fn exercise_basic_ops(store: &dyn KeyValueStore) {
        assert_eq!(store.get("dedup.abc").unwrap(), None);

        store.set("dedup.abc", "2025-01-01T00:00:00Z").unwrap();
        assert_eq!(store.get("dedup.abc").unwrap().as_deref(), Some("2025-01-01T00:00:00Z"));

        // Last write wins
        store.set("dedup.abc", "2025-01-02T00:00:00Z").unwrap();
        assert_eq!(store.get("dedup.abc").unwrap().as_deref(), Some("2025-01-02T00:00:00Z"));

        assert!(store.remove("dedup.abc").unwrap());
        assert!(!store.remove("dedup.abc").unwrap());
        assert_eq!(store.get("dedup.abc").unwrap(), None);
    }

    fn exercise_insert_if_absent(store: &dyn KeyValueStore) {
        assert!(store.insert_if_absent("confirm.1", "first").unwrap());
        assert!(!store.insert_if_absent("confirm.1", "second").unwrap());
        assert_eq!(store.get("confirm.1").unwrap().as_deref(), Some("first"));
    }

    fn exercise_compare_and_swap(store: &dyn KeyValueStore) {
        assert!(!store.compare_and_swap("channel.acc-1", "{}", Some("order")).unwrap());
        assert_eq!(store.get("channel.acc-1").unwrap(), None);

        store.set("channel.acc-1", "order-a").unwrap();
        assert!(!store.compare_and_swap("channel.acc-1", "order-b", Some("{}")).unwrap());
        assert_eq!(store.get("channel.acc-1").unwrap().as_deref(), Some("order-a"));

        assert!(store.compare_and_swap("channel.acc-1", "order-a", Some("{}")).unwrap());
        assert_eq!(store.get("channel.acc-1").unwrap().as_deref(), Some("{}"));

        // Removal only when the value still matches
        assert!(!store.compare_and_swap("channel.acc-1", "order-a", None).unwrap());
        assert!(store.compare_and_swap("channel.acc-1", "{}", None).unwrap());
        assert_eq!(store.get("channel.acc-1").unwrap(), None);
    }

    fn exercise_list(store: &dyn KeyValueStore) {
        for key in ["dedup.b", "dedup.a", "channel.acc-1", "daily.acc-1.20250101"] {
            store.set(key, "x").unwrap();
        }
        assert_eq!(store.list("dedup.").unwrap(), vec!["dedup.a", "dedup.b"]);
        assert_eq!(store.list("channel.").unwrap(), vec!["channel.acc-1"]);
        assert!(store.list("confirm.").unwrap().is_empty());
        assert_eq!(store.list("").unwrap().len(), 4);
    }

    // ============= Key Validation Tests =============

    #[test]
    fn test_validate_key() {
        assert!(validate_key("dedup.0a1b").is_ok());
        assert!(validate_key("daily.acc_1-x.20250101").is_ok());

        for bad in ["", ".hidden", "../escape", "has space", "slash/key", "emoji✓"] {
            assert!(
                matches!(validate_key(bad), Err(StoreError::InvalidKey { .. })),
                "key {:?} should be rejected",
                bad
            );
        }
    }

    // ============= MemoryStore Tests =============

    #[test]
    fn test_memory_store_basic_ops() {
        let store = MemoryStore::new();
        exercise_basic_ops(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_insert_if_absent() {
        exercise_insert_if_absent(&MemoryStore::new());
    }

    #[test]
    fn test_memory_store_compare_and_swap() {
        exercise_compare_and_swap(&MemoryStore::new());
    }

    #[test]
    fn test_memory_store_list() {
        let store = MemoryStore::new();
        exercise_list(&store);
        assert_eq!(store.len(), 4);
    }

    #[test]
    fn test_memory_store_rejects_invalid_key() {
        let store = MemoryStore::new();
        assert!(store.set("../etc", "x").is_err());
        assert!(store.insert_if_absent("a b", "x").is_err());
    }

    #[test]
    fn test_memory_store_clones_share_entries() {
        let store = MemoryStore::new();
        let clone = store.clone();
        store.set("channel.acc-1", "{}").unwrap();
        assert_eq!(clone.get("channel.acc-1").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_memory_store_concurrent_insert_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.insert_if_absent("dedup.race", &i.to_string()).unwrap())
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }

    // ============= FileStore Tests =============

    #[test]
    fn test_file_store_basic_ops() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("store")).unwrap();
        exercise_basic_ops(&store);
    }

    #[test]
    fn test_file_store_insert_if_absent() {
        let dir = tempfile::tempdir().unwrap();
        exercise_insert_if_absent(&FileStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_file_store_compare_and_swap() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        exercise_compare_and_swap(&store);
        // Lock files are released
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_file_store_concurrent_swap_has_one_winner() {
        let dir = tempfile::tempdir().unwrap();
        FileStore::open(dir.path()).unwrap().set("dedup.race", "stale").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = FileStore::open(dir.path()).unwrap();
                std::thread::spawn(move || {
                    store
                        .compare_and_swap("dedup.race", "stale", Some(&format!("fresh-{}", i)))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|won| *won).count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_file_store_breaks_stale_lock() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let lock = std::fs::File::create(dir.path().join(".channel.acc-1.lock")).unwrap();
        let old = std::time::SystemTime::now() - std::time::Duration::from_secs(60);
        lock.set_modified(old).unwrap();

        store.set("channel.acc-1", "{}").unwrap();
        assert_eq!(store.get("channel.acc-1").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_file_store_list_skips_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        std::fs::write(dir.path().join(".dedup.z.123.tmp"), "partial").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        exercise_list(&store);
    }

    #[test]
    fn test_file_store_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let writer = FileStore::open(dir.path()).unwrap();
        let reader = FileStore::open(dir.path()).unwrap();

        writer.set("channel.acc-1", "{\"symbol\":\"XAUUSD\"}").unwrap();
        assert_eq!(reader.get("channel.acc-1").unwrap().as_deref(), Some("{\"symbol\":\"XAUUSD\"}"));
        assert!(!reader.insert_if_absent("channel.acc-1", "{}").unwrap());
        assert_eq!(writer.root(), dir.path());
    }

    #[test]
    fn test_file_store_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(matches!(store.get("../outside"), Err(StoreError::InvalidKey { .. })));
    }
}
