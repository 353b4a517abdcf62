//! Scheduled Jobs
//!
//! Background jobs for the ledger: due auto-transfers, interest accrual and
//! failing transfers that were abandoned mid-flight.

mod auto_transfer;

pub use auto_transfer::{AutoTransferJob, AutoTransferReport, AUTO_TRANSFER_MEMO};

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::config::Config;
use crate::domain::EventPublisher;
use crate::error::AppError;
use crate::handlers::TransferHandler;
use crate::interest::{AccrualJob, AccrualReport};
use crate::store::{Store, StoreError};

// =========================================================================
// Job Scheduler
// =========================================================================

/// Configuration for job scheduler
#[derive(Debug, Clone)]
pub struct JobSchedulerConfig {
    /// Interval for the due auto-transfer poll (default: 1 minute)
    pub auto_transfer_interval: Duration,
    /// Interval for interest accrual (default: 1 day)
    pub accrual_interval: Duration,
    /// Interval for the stale transfer sweep (default: 1 minute)
    pub stale_transfer_interval: Duration,
    /// Age after which a non-terminal transfer counts as abandoned (default: 5 minutes)
    pub stale_transfer_after: Duration,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            auto_transfer_interval: Duration::from_secs(60),
            accrual_interval: Duration::from_secs(86_400),
            stale_transfer_interval: Duration::from_secs(60),
            stale_transfer_after: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for JobSchedulerConfig {
    fn from(config: &Config) -> Self {
        Self {
            auto_transfer_interval: Duration::from_secs(config.scheduler_poll_secs),
            accrual_interval: Duration::from_secs(config.accrual_interval_secs),
            stale_transfer_interval: Duration::from_secs(config.scheduler_poll_secs),
            stale_transfer_after: Duration::from_secs(config.stale_transfer_after_secs),
        }
    }
}

/// Job Scheduler - runs the periodic ledger jobs
pub struct JobScheduler {
    auto_transfers: AutoTransferJob,
    accrual: AccrualJob,
    transfers: Arc<TransferHandler>,
    config: JobSchedulerConfig,
}

impl JobScheduler {
    /// Create a new job scheduler
    pub fn new(store: Arc<dyn Store>, transfers: Arc<TransferHandler>, events: EventPublisher) -> Self {
        Self::with_config(store, transfers, events, JobSchedulerConfig::default())
    }

    /// Create with custom configuration
    pub fn with_config(
        store: Arc<dyn Store>,
        transfers: Arc<TransferHandler>,
        events: EventPublisher,
        config: JobSchedulerConfig,
    ) -> Self {
        Self {
            auto_transfers: AutoTransferJob::new(store.clone(), transfers.clone(), events.clone()),
            accrual: AccrualJob::new(store, events),
            transfers,
            config,
        }
    }

    /// Start the job scheduler in the background
    /// Returns a handle that can be used to abort the scheduler
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Run the scheduler loop
    async fn run(&self) {
        tracing::info!("Job scheduler started");

        let mut auto_transfer_interval = interval(self.config.auto_transfer_interval);
        let mut accrual_interval = interval(self.config.accrual_interval);
        let mut stale_interval = interval(self.config.stale_transfer_interval);

        loop {
            tokio::select! {
                _ = auto_transfer_interval.tick() => {
                    if let Err(e) = self.auto_transfers.run_once(Utc::now().date_naive()).await {
                        tracing::error!(error = %e, "Auto-transfer pass failed");
                    }
                }
                _ = accrual_interval.tick() => {
                    if let Err(e) = self.accrual.run_once(Utc::now()).await {
                        tracing::error!(error = %e, "Interest accrual pass failed");
                    }
                }
                _ = stale_interval.tick() => {
                    if let Err(e) = self.fail_stale_transfers().await {
                        tracing::error!(error = %e, "Stale transfer sweep failed");
                    }
                }
            }
        }
    }

    async fn fail_stale_transfers(&self) -> Result<usize, JobError> {
        let cutoff = chrono::Duration::from_std(self.config.stale_transfer_after)
            .map(|age| Utc::now() - age)
            .unwrap_or_else(|_| Utc::now());
        Ok(self.transfers.fail_stale(cutoff).await?)
    }

    /// Run all jobs once (for manual trigger or testing)
    pub async fn run_all_once(&self) -> JobReport {
        let mut report = JobReport::default();
        let now = Utc::now();

        match self.auto_transfers.run_once(now.date_naive()).await {
            Ok(result) => {
                report.errors.extend(result.errors.iter().map(|e| format!("Auto-transfer: {}", e)));
                report.auto_transfer = Some(result);
            }
            Err(e) => report.errors.push(format!("Auto-transfer: {}", e)),
        }

        match self.accrual.run_once(now).await {
            Ok(result) => {
                report.errors.extend(result.errors.iter().map(|e| format!("Interest accrual: {}", e)));
                report.accrual = Some(result);
            }
            Err(e) => report.errors.push(format!("Interest accrual: {}", e)),
        }

        match self.fail_stale_transfers().await {
            Ok(count) => report.stale_transfers_failed = count,
            Err(e) => report.errors.push(format!("Stale transfer sweep: {}", e)),
        }

        report.completed_at = Utc::now();
        report
    }
}

/// Report from running all jobs once
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    pub auto_transfer: Option<AutoTransferReport>,
    pub accrual: Option<AccrualReport>,
    pub stale_transfers_failed: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Job execution errors
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Handler(#[from] AppError),
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_job_scheduler_config_default() {
        let config = JobSchedulerConfig::default();
        assert_eq!(config.auto_transfer_interval, Duration::from_secs(60));
        assert_eq!(config.accrual_interval, Duration::from_secs(86_400));
        assert_eq!(config.stale_transfer_after, Duration::from_secs(300));
    }

    #[test]
    fn test_job_report_default() {
        let report = JobReport::default();
        assert!(report.auto_transfer.is_none());
        assert_eq!(report.stale_transfers_failed, 0);
        assert_eq!(report.errors.len(), 0);
    }

    #[tokio::test]
    async fn test_run_all_once_on_empty_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let events = EventPublisher::disabled();
        let transfers = Arc::new(TransferHandler::new(store.clone(), events.clone()));
        let scheduler = JobScheduler::new(store, transfers, events);

        let report = scheduler.run_all_once().await;
        assert!(report.errors.is_empty());
        assert_eq!(report.auto_transfer.map(|r| r.due), Some(0));
        assert_eq!(report.accrual.map(|r| r.accounts_scanned), Some(0));
        assert_eq!(report.stale_transfers_failed, 0);
    }
}
