//! Periodic defragmentation of this writer's store backend.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use super::Cluster;
use crate::errors::ClusterError;
use crate::metrics::{result_label, DEFRAG_TOTAL};

/// Next-run interval: the normal one after a success, the short one after
/// any failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DefragSchedule {
    normal: Duration,
    failed: Duration,
    next: Duration,
}

impl DefragSchedule {
    pub(crate) fn new(normal: Duration, failed: Duration) -> Self {
        Self {
            normal,
            failed,
            next: normal,
        }
    }

    pub(crate) fn next(&self) -> Duration {
        self.next
    }

    pub(crate) fn record<T, E>(&mut self, result: &Result<T, E>) {
        self.next = if result.is_ok() {
            self.normal
        } else {
            self.failed
        };
    }
}

impl Cluster {
    pub(super) async fn defrag_loop(&self) {
        let config = self.config();
        let mut schedule =
            DefragSchedule::new(config.defrag_interval(), config.defrag_failed_interval());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(schedule.next()) => {}
                _ = self.shutdown.cancelled() => return,
            }
            let result = tokio::select! {
                r = self.defrag() => r,
                _ = self.shutdown.cancelled() => return,
            };
            metrics::counter!(DEFRAG_TOTAL, "result" => result_label(&result)).increment(1);
            schedule.record(&result);
            if let Err(e) = result {
                error!("defrag failed, retry in {:?}: {e}", schedule.next());
            }
        }
    }

    /// Defragment the backend behind this node's own peer address.
    pub(crate) async fn defrag(&self) -> Result<(), ClusterError> {
        let client = self.resources.get_client().await?;
        let endpoint = &self.config().peer_url;
        self.resources
            .long_request("defragment", client.defragment(endpoint))
            .await?;
        *self.last_defrag.write().expect("rwlock poisoned") = Some(Utc::now());
        info!(endpoint = %endpoint, "defrag successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_shortens_success_restores() {
        let normal = Duration::from_secs(3600);
        let failed = Duration::from_secs(60);
        let mut schedule = DefragSchedule::new(normal, failed);
        assert_eq!(schedule.next(), normal);

        schedule.record::<(), _>(&Err("busy"));
        assert_eq!(schedule.next(), failed);
        schedule.record::<(), _>(&Err("busy"));
        assert_eq!(schedule.next(), failed);

        schedule.record::<_, ()>(&Ok(()));
        assert_eq!(schedule.next(), normal);
    }
}
