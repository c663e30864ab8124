//! # Always-On Deployment Controller
//!
//! Periodic reconciliation loop keeping long-running user deployments alive
//! and health-checked. Each tick fetches the deployment inventory and
//! re-issues the keep-alive through the deployment API with bounded worker
//! fan-out; failures are counted but never stop the loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::{ALWAYS_ON_RECONCILES_TOTAL, SharedMetrics};

/// Errors from the controller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AlwaysOnError {
    #[error("deployment API error: {0}")]
    Api(String),

    #[error("inventory error: {0}")]
    Inventory(String),

    #[error("reconcile cancelled")]
    Cancelled,
}

/// The deployment platform surface this controller drives.
#[async_trait]
pub trait DeploymentApi: Send + Sync {
    /// Enable or disable keep-alive for one deployment.
    async fn set_always_on(
        &self,
        deployment_id: &str,
        enabled: bool,
        keep_alive_secs: u32,
    ) -> Result<(), AlwaysOnError>;

    /// Read back the deployment's keep-alive status.
    async fn get_always_on_status(
        &self,
        deployment_id: &str,
    ) -> Result<HashMap<String, serde_json::Value>, AlwaysOnError>;
}

/// Source of the deployment ids to reconcile each tick.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    async fn always_on_deployments(&self) -> Result<Vec<String>, AlwaysOnError>;
}

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct AlwaysOnConfig {
    /// Time between reconcile passes
    pub reconcile_interval: Duration,
    /// Keep-alive applied when the caller passes a non-positive value
    pub default_keepalive_secs: u32,
    /// Worker fan-out bound per reconcile pass
    pub max_concurrent: usize,
    /// Prefix stamped on the controller's log lines
    pub log_prefix: String,
}

impl Default for AlwaysOnConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            default_keepalive_secs: 300,
            max_concurrent: 4,
            log_prefix: "always-on".to_string(),
        }
    }
}

/// Atomic controller counters.
#[derive(Debug, Default)]
struct AlwaysOnStats {
    reconciles: AtomicU64,
    ensures: AtomicU64,
    errors: AtomicU64,
    active_workers: AtomicU64,
    last_run_unix: AtomicI64,
    last_success_unix: AtomicI64,
}

/// Point-in-time copy of the controller counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AlwaysOnSnapshot {
    pub reconciles: u64,
    pub ensures: u64,
    pub errors: u64,
    pub active_workers: u64,
    pub last_run_unix: i64,
    pub last_success_unix: i64,
}

/// Reconciliation controller for always-on deployments.
pub struct AlwaysOnController {
    config: AlwaysOnConfig,
    api: Arc<dyn DeploymentApi>,
    inventory: Option<Arc<dyn InventoryProvider>>,
    semaphore: Arc<Semaphore>,
    stats: Arc<AlwaysOnStats>,
    metrics: SharedMetrics,
}

impl AlwaysOnController {
    pub fn new(
        config: AlwaysOnConfig,
        api: Arc<dyn DeploymentApi>,
        inventory: Option<Arc<dyn InventoryProvider>>,
        metrics: SharedMetrics,
    ) -> Self {
        let width = config.max_concurrent.max(1);
        Self {
            config,
            api,
            inventory,
            semaphore: Arc::new(Semaphore::new(width)),
            stats: Arc::new(AlwaysOnStats::default()),
            metrics,
        }
    }

    /// Issue the keep-alive for one deployment and read its status back.
    /// Non-positive `keep_alive_secs` coerces to the configured default.
    ///
    /// # Errors
    ///
    /// API failures increment the error counter and are returned.
    pub async fn ensure(
        &self,
        deployment_id: &str,
        enabled: bool,
        keep_alive_secs: i64,
    ) -> Result<(), AlwaysOnError> {
        ensure_inner(
            &self.api,
            &self.stats,
            self.config.default_keepalive_secs,
            deployment_id,
            enabled,
            keep_alive_secs,
        )
        .await
    }

    /// Reconcile a batch of deployment ids with bounded fan-out. Empty ids
    /// are skipped; the first error is returned while later ones are only
    /// counted. Returns promptly on cancellation, leaving in-flight workers
    /// to observe the token themselves.
    pub async fn reconcile(
        &self,
        token: &CancellationToken,
        deployment_ids: &[String],
    ) -> Result<(), AlwaysOnError> {
        self.stats.reconciles.fetch_add(1, Ordering::Relaxed);
        self.metrics.incr_counter(ALWAYS_ON_RECONCILES_TOTAL, 1);
        self.stats
            .last_run_unix
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);

        let mut handles = Vec::new();
        for deployment_id in deployment_ids {
            if deployment_id.is_empty() {
                continue;
            }
            let permit = tokio::select! {
                permit = Arc::clone(&self.semaphore).acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
                _ = token.cancelled() => return Err(AlwaysOnError::Cancelled),
            };

            let api = Arc::clone(&self.api);
            let stats = Arc::clone(&self.stats);
            let default_keepalive = self.config.default_keepalive_secs;
            let worker_token = token.clone();
            let deployment_id = deployment_id.clone();

            handles.push(tokio::spawn(async move {
                let _permit = permit;
                stats.active_workers.fetch_add(1, Ordering::Relaxed);
                let result = tokio::select! {
                    result = ensure_inner(&api, &stats, default_keepalive, &deployment_id, true, 0) => result,
                    _ = worker_token.cancelled() => Err(AlwaysOnError::Cancelled),
                };
                stats.active_workers.fetch_sub(1, Ordering::Relaxed);
                result
            }));
        }

        let mut first_error = None;
        for handle in handles {
            if token.is_cancelled() {
                return Err(AlwaysOnError::Cancelled);
            }
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_err) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    if first_error.is_none() {
                        first_error = Some(AlwaysOnError::Api(join_err.to_string()));
                    }
                }
            }
        }

        match first_error {
            None => {
                self.stats
                    .last_success_unix
                    .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    /// Run the reconcile loop until the token fires. Each tick fetches ids
    /// from the inventory provider; without a provider the tick is a no-op.
    pub async fn start(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(prefix = %self.config.log_prefix, "reconcile loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let Some(inventory) = &self.inventory else {
                        continue;
                    };
                    match inventory.always_on_deployments().await {
                        Ok(ids) => {
                            debug!(prefix = %self.config.log_prefix, count = ids.len(), "reconciling");
                            if let Err(e) = self.reconcile(&token, &ids).await {
                                warn!(prefix = %self.config.log_prefix, error = %e, "reconcile pass failed");
                            }
                        }
                        Err(e) => {
                            self.stats.errors.fetch_add(1, Ordering::Relaxed);
                            warn!(prefix = %self.config.log_prefix, error = %e, "inventory fetch failed");
                        }
                    }
                }
            }
        }
        info!(prefix = %self.config.log_prefix, "reconcile loop stopped");
    }

    pub fn snapshot(&self) -> AlwaysOnSnapshot {
        AlwaysOnSnapshot {
            reconciles: self.stats.reconciles.load(Ordering::Relaxed),
            ensures: self.stats.ensures.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            active_workers: self.stats.active_workers.load(Ordering::Relaxed),
            last_run_unix: self.stats.last_run_unix.load(Ordering::Relaxed),
            last_success_unix: self.stats.last_success_unix.load(Ordering::Relaxed),
        }
    }
}

async fn ensure_inner(
    api: &Arc<dyn DeploymentApi>,
    stats: &Arc<AlwaysOnStats>,
    default_keepalive_secs: u32,
    deployment_id: &str,
    enabled: bool,
    keep_alive_secs: i64,
) -> Result<(), AlwaysOnError> {
    let keep_alive = if keep_alive_secs <= 0 {
        default_keepalive_secs
    } else {
        keep_alive_secs as u32
    };

    let outcome = async {
        api.set_always_on(deployment_id, enabled, keep_alive).await?;
        api.get_always_on_status(deployment_id).await?;
        Ok(())
    }
    .await;

    stats.ensures.fetch_add(1, Ordering::Relaxed);
    if outcome.is_err() {
        stats.errors.fetch_add(1, Ordering::Relaxed);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;
    use parking_lot::Mutex;

    /// Deployment API double: records calls, optionally failing named ids.
    #[derive(Default)]
    struct FakeDeploymentApi {
        calls: Mutex<Vec<(String, bool, u32)>>,
        failing: Mutex<std::collections::HashSet<String>>,
    }

    impl FakeDeploymentApi {
        fn fail(&self, id: &str) {
            self.failing.lock().insert(id.to_string());
        }

        fn heal(&self, id: &str) {
            self.failing.lock().remove(id);
        }
    }

    #[async_trait]
    impl DeploymentApi for FakeDeploymentApi {
        async fn set_always_on(
            &self,
            deployment_id: &str,
            enabled: bool,
            keep_alive_secs: u32,
        ) -> Result<(), AlwaysOnError> {
            if self.failing.lock().contains(deployment_id) {
                return Err(AlwaysOnError::Api(format!("{deployment_id} unreachable")));
            }
            self.calls
                .lock()
                .push((deployment_id.to_string(), enabled, keep_alive_secs));
            Ok(())
        }

        async fn get_always_on_status(
            &self,
            _deployment_id: &str,
        ) -> Result<HashMap<String, serde_json::Value>, AlwaysOnError> {
            Ok(HashMap::from([(
                "always_on".to_string(),
                serde_json::Value::Bool(true),
            )]))
        }
    }

    fn controller(api: Arc<FakeDeploymentApi>) -> AlwaysOnController {
        AlwaysOnController::new(
            AlwaysOnConfig {
                reconcile_interval: Duration::from_millis(20),
                default_keepalive_secs: 300,
                max_concurrent: 2,
                ..Default::default()
            },
            api,
            None,
            metrics::noop(),
        )
    }

    #[tokio::test]
    async fn test_ensure_coerces_keepalive() {
        let api = Arc::new(FakeDeploymentApi::default());
        let controller = controller(Arc::clone(&api));

        controller.ensure("dep-1", true, 0).await.unwrap();
        controller.ensure("dep-1", true, -5).await.unwrap();
        controller.ensure("dep-1", true, 42).await.unwrap();

        let calls = api.calls.lock();
        assert_eq!(calls[0].2, 300);
        assert_eq!(calls[1].2, 300);
        assert_eq!(calls[2].2, 42);
    }

    #[tokio::test]
    async fn test_reconcile_skips_empty_and_counts() {
        let api = Arc::new(FakeDeploymentApi::default());
        let controller = controller(Arc::clone(&api));

        let ids = vec!["a".to_string(), String::new(), "b".to_string()];
        controller
            .reconcile(&CancellationToken::new(), &ids)
            .await
            .unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.reconciles, 1);
        assert_eq!(snapshot.ensures, 2);
        assert_eq!(snapshot.errors, 0);
        assert!(snapshot.last_success_unix >= snapshot.last_run_unix - 1);
        assert_eq!(api.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_first_error_surfaced_rest_counted() {
        let api = Arc::new(FakeDeploymentApi::default());
        api.fail("bad-1");
        api.fail("bad-2");
        let controller = controller(Arc::clone(&api));

        let ids: Vec<String> = ["good", "bad-1", "bad-2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = controller
            .reconcile(&CancellationToken::new(), &ids)
            .await
            .unwrap_err();
        assert!(matches!(err, AlwaysOnError::Api(_)));
        assert_eq!(controller.snapshot().errors, 2);
    }

    #[tokio::test]
    async fn test_errors_stop_growing_once_healed() {
        let api = Arc::new(FakeDeploymentApi::default());
        api.fail("dep");
        let controller = controller(Arc::clone(&api));
        let token = CancellationToken::new();
        let ids = vec!["dep".to_string()];

        assert!(controller.reconcile(&token, &ids).await.is_err());
        let errors_before = controller.snapshot().errors;

        api.heal("dep");
        controller.reconcile(&token, &ids).await.unwrap();
        controller.reconcile(&token, &ids).await.unwrap();

        let snapshot = controller.snapshot();
        assert_eq!(snapshot.errors, errors_before);
        assert!(snapshot.last_success_unix > 0);
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_returns_promptly() {
        let api = Arc::new(FakeDeploymentApi::default());
        let controller = controller(api);
        let token = CancellationToken::new();
        token.cancel();

        let ids = vec!["a".to_string(), "b".to_string()];
        let err = controller.reconcile(&token, &ids).await.unwrap_err();
        assert!(matches!(err, AlwaysOnError::Cancelled));
    }

    struct StaticInventory(Vec<String>);

    #[async_trait]
    impl InventoryProvider for StaticInventory {
        async fn always_on_deployments(&self) -> Result<Vec<String>, AlwaysOnError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_start_loops_until_cancelled() {
        let api = Arc::new(FakeDeploymentApi::default());
        let controller = Arc::new(AlwaysOnController::new(
            AlwaysOnConfig {
                reconcile_interval: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::clone(&api) as Arc<dyn DeploymentApi>,
            Some(Arc::new(StaticInventory(vec!["dep".to_string()]))),
            metrics::noop(),
        ));

        let token = CancellationToken::new();
        let task = {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move { controller.start(token).await })
        };

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop exits promptly")
            .unwrap();

        assert!(controller.snapshot().reconciles >= 2);
    }
}
