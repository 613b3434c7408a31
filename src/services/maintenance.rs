//! Scheduled housekeeping: periodic eviction of expired dedup hashes.

use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};

use crate::services::dedup::DedupStore;

pub struct MaintenanceService {
    dedup: Arc<dyn DedupStore>,
    sweep_cron: String,
}

impl MaintenanceService {
    /// # Arguments
    /// * `sweep_cron` - 6-field cron expression, seconds first (e.g. "0 */10 * * * *")
    pub fn new(dedup: Arc<dyn DedupStore>, sweep_cron: impl Into<String>) -> Self {
        Self {
            dedup,
            sweep_cron: sweep_cron.into(),
        }
    }

    /// One sweep, logged. Returns the number of evicted hashes.
    pub fn sweep_once(dedup: &dyn DedupStore) -> usize {
        match dedup.sweep() {
            Ok(evicted) => {
                if evicted > 0 {
                    info!("🧹 [MAINTENANCE] Dedup sweep evicted {} hashes", evicted);
                }
                evicted
            }
            Err(e) => {
                error!("❌ [MAINTENANCE] Dedup sweep failed: {}", e);
                0
            }
        }
    }

    /// Start the cron job. The returned scheduler must be kept alive for the
    /// job to keep firing.
    pub async fn start(&self) -> Result<JobScheduler, JobSchedulerError> {
        let scheduler = JobScheduler::new().await?;
        let dedup = self.dedup.clone();

        let job = Job::new_async(self.sweep_cron.as_str(), move |_uuid, _l| {
            let dedup = dedup.clone();
            Box::pin(async move {
                Self::sweep_once(dedup.as_ref());
            })
        })?;

        scheduler.add(job).await?;
        scheduler.start().await?;

        info!("🔔 [MAINTENANCE] Dedup sweep scheduled: {}", self.sweep_cron);
        Ok(scheduler)
    }
}
