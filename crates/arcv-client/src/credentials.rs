//! Day-keyed cache of service credentials
//!
//! Readers take the `RwLock` concurrently. Refreshes are single-flight: the
//! refresh mutex serializes them and each waiter re-checks the cache after
//! acquiring it, so a burst of misses turns into one fetch.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arcv_core::config::CredentialConfig;
use arcv_core::types::ArchiveServiceCredential;
use arcv_core::{start_of_day, ArchiveError, ArchiveResult, Clock, SECONDS_PER_DAY};

use crate::api::ArchiveApi;

pub struct CredentialCache {
    api: Arc<dyn ArchiveApi>,
    clock: Arc<dyn Clock>,
    config: CredentialConfig,
    entries: RwLock<BTreeMap<u64, ArchiveServiceCredential>>,
    refresh: Mutex<()>,
    fetches: AtomicU64,
}

impl CredentialCache {
    pub fn new(api: Arc<dyn ArchiveApi>, clock: Arc<dyn Clock>, config: CredentialConfig) -> Self {
        Self {
            api,
            clock,
            config,
            entries: RwLock::new(BTreeMap::new()),
            refresh: Mutex::new(()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Credential valid today.
    pub async fn credential(&self) -> ArchiveResult<ArchiveServiceCredential> {
        self.credential_for(self.clock.now_secs()).await
    }

    /// Credential for the day containing `now`, fetching on a miss.
    ///
    /// Backends that need no credentials get an empty placeholder.
    pub async fn credential_for(&self, now: u64) -> ArchiveResult<ArchiveServiceCredential> {
        let day = start_of_day(now);
        if !self.api.requires_credentials() {
            return Ok(ArchiveServiceCredential {
                credential: Vec::new(),
                redemption_time: day,
            });
        }

        if let Some(cred) = self.entries.read().await.get(&day) {
            return Ok(cred.clone());
        }

        warn!(day, "no cached credential for today, fetching on demand");
        self.refresh(now, Some(day)).await?;

        self.entries.read().await.get(&day).cloned().ok_or_else(|| {
            ArchiveError::Authorization(format!("service issued no credential for day {day}"))
        })
    }

    /// Refresh when fewer than `refresh_threshold_days` future days are cached.
    /// Returns true when a fetch happened.
    pub async fn prefetch(&self, now: u64) -> ArchiveResult<bool> {
        if !self.api.requires_credentials() || !self.needs_refresh(now).await {
            return Ok(false);
        }
        self.refresh(now, None).await
    }

    /// Drop a credential the service rejected.
    pub async fn invalidate(&self, day: u64) {
        if self.entries.write().await.remove(&day).is_some() {
            debug!(day, "credential invalidated");
        }
    }

    /// Discard credentials for days before `now`'s day.
    pub async fn prune(&self, now: u64) {
        let today = start_of_day(now);
        self.entries.write().await.retain(|day, _| *day >= today);
    }

    /// Days currently cached, ascending.
    pub async fn cached_days(&self) -> Vec<u64> {
        self.entries.read().await.keys().copied().collect()
    }

    /// Number of service fetches performed so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Run `prefetch` every `prefetch_interval_secs` until `cancel` fires.
    pub fn spawn_prefetch(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.prefetch_interval_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("credential prefetch stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let now = self.clock.now_secs();
                        if let Err(e) = self.prefetch(now).await {
                            warn!("credential prefetch failed: {e}");
                        }
                    }
                }
            }
        })
    }

    async fn needs_refresh(&self, now: u64) -> bool {
        let horizon = start_of_day(now) + self.config.refresh_threshold_days * SECONDS_PER_DAY;
        self.entries.read().await.range(horizon..).next().is_none()
    }

    async fn refresh(&self, now: u64, needed_day: Option<u64>) -> ArchiveResult<bool> {
        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited.
        let satisfied = match needed_day {
            Some(day) => self.entries.read().await.contains_key(&day),
            None => !self.needs_refresh(now).await,
        };
        if satisfied {
            return Ok(false);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let batch = self.api.get_service_credentials(now).await?;
        let received = batch.credentials.len();

        let today = start_of_day(now);
        let mut entries = self.entries.write().await;
        for cred in batch.credentials {
            if cred.redemption_time % SECONDS_PER_DAY != 0 {
                warn!(
                    redemption_time = cred.redemption_time,
                    "ignoring credential not aligned to a day boundary"
                );
                continue;
            }
            entries.insert(cred.redemption_time, cred);
        }
        entries.retain(|day, _| *day >= today);
        info!(received, cached = entries.len(), "service credentials refreshed");
        Ok(true)
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("backend", &self.api.name())
            .field("config", &self.config)
            .field("fetches", &self.fetch_count())
            .finish()
    }
}
