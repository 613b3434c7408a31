//! Unit tests for scheduled housekeeping.

#[cfg(test)]
mod maintenance_tests {
    use crate::data::store::{KeyValueStore, MemoryStore};
    use crate::error::StoreError;
    use crate::services::dedup::{DedupOutcome, DedupStore, Deduplicator};
    use crate::services::maintenance::MaintenanceService;
    use std::sync::Arc;

    struct FailingDedup;

    impl DedupStore for FailingDedup {
        fn check_and_mark(&self, _signal_hash: &str) -> Result<DedupOutcome, StoreError> {
            Ok(DedupOutcome { is_duplicate: false })
        }

        fn sweep(&self) -> Result<usize, StoreError> {
            Err(StoreError::InvalidKey {
                key: "broken".to_string(),
            })
        }
    }

    #[test]
    fn test_sweep_once_evicts_expired() {
        let store = Arc::new(MemoryStore::new());
        store.set("dedup.old", "2020-01-01T00:00:00+00:00").unwrap();
        let dedup = Deduplicator::new(store.clone(), 24);
        dedup.check_and_mark("fresh").unwrap();

        assert_eq!(MaintenanceService::sweep_once(&dedup), 1);
        assert!(store.get("dedup.old").unwrap().is_none());
        assert!(store.get("dedup.fresh").unwrap().is_some());
    }

    #[test]
    fn test_sweep_once_swallows_errors() {
        assert_eq!(MaintenanceService::sweep_once(&FailingDedup), 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_cron() {
        let service = MaintenanceService::new(Arc::new(FailingDedup), "not a cron");
        assert!(service.start().await.is_err());
    }
}
