//! Housekeeping scheduler
//!
//! Three independent timers drive the engine: sync (extract then reconcile),
//! discovery (rebuild and swap the target mapping) and the daily pbr restart.
//! They share nothing but the [`TargetRegistry`], so a restart flushing the
//! sets while a sync is running only costs adds that the next cycle redoes.

use chrono::{Local, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};

use super::discovery::Discoverer;
use super::extractor::{Extractor, extract};
use super::matcher::MatchMode;
use super::reconcile::{SetSynchronizer, SyncReport};
use super::targets::{PolicyTarget, TargetRegistry, TargetSnapshot};
use super::warm::{WarmReport, warm};
use crate::error::Result;
use crate::services::{MembershipSets, PageFetcher, PolicyConfigSource, QueryLogSource};
use crate::utils::datetime::{AlarmStep, alarm_step, next_time_of_day_after};
use crate::utils::env::EnvVars;

/// Longest single sleep before the daily restart. Routers often boot on a
/// stale clock that NTP steps later.
const RESTART_RECHECK: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub sync_interval: Duration,
    pub discovery_interval: Duration,
    /// Local time of the daily restart; `None` disables it
    pub restart_at: Option<NaiveTime>,
    pub restart_settle: Duration,
    pub querylog_limit: usize,
    pub domain_match: MatchMode,
    pub warm_start_enabled: bool,
    pub warm_concurrency: usize,
    pub warm_harvest_delay: Duration,
}

impl EngineSettings {
    pub fn from_env(env: &EnvVars) -> Self {
        Self {
            sync_interval: env.sync_interval(),
            discovery_interval: env.discovery_interval(),
            restart_at: env.restart_enabled.then_some(env.restart_at),
            restart_settle: Duration::from_secs(env.restart_settle_secs),
            querylog_limit: env.querylog_limit,
            domain_match: env.domain_match,
            warm_start_enabled: env.warm_start_enabled,
            warm_concurrency: env.warm_concurrency,
            warm_harvest_delay: Duration::from_secs(env.warm_harvest_delay_secs),
        }
    }
}

/// External systems the engine works against.
#[derive(Clone)]
pub struct Collaborators {
    pub query_log: Arc<dyn QueryLogSource>,
    pub policies: Arc<dyn PolicyConfigSource>,
    pub sets: Arc<dyn MembershipSets>,
    pub fetcher: Arc<dyn PageFetcher>,
}

/// Current element count of a tracked set, `None` when the set is missing.
#[derive(Debug, Clone)]
pub struct TargetStatus {
    pub target: Arc<PolicyTarget>,
    pub elements: Option<usize>,
}

pub struct SyncEngine {
    registry: Arc<TargetRegistry>,
    discoverer: Discoverer,
    extractor: Extractor,
    synchronizer: SetSynchronizer,
    sets: Arc<dyn MembershipSets>,
    fetcher: Arc<dyn PageFetcher>,
    settings: EngineSettings,
}

impl SyncEngine {
    pub fn new(registry: Arc<TargetRegistry>, collaborators: Collaborators, settings: EngineSettings) -> Self {
        Self {
            discoverer: Discoverer::new(
                collaborators.policies,
                collaborators.sets.clone(),
                settings.domain_match,
            ),
            extractor: Extractor::new(collaborators.query_log, settings.querylog_limit),
            synchronizer: SetSynchronizer::new(collaborators.sets.clone()),
            sets: collaborators.sets,
            fetcher: collaborators.fetcher,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Rediscover targets and publish them as a new generation.
    pub async fn discover(&self) -> Result<Arc<TargetSnapshot>> {
        self.discoverer.refresh(&self.registry).await
    }

    /// One extract-and-reconcile pass over the current generation.
    pub async fn sync_cycle(&self) -> Result<SyncReport> {
        let snapshot = self.registry.load();
        if snapshot.is_empty() {
            log::warn!("No pbr domain targets discovered, skipping sync");
            return Ok(SyncReport::default());
        }

        let entries = self.extractor.fetch().await?;
        let tuples: Vec<_> = extract(&entries, &snapshot).collect();
        let report = self.synchronizer.reconcile(tuples).await;

        log::info!(
            "Sync cycle (generation {}): {} log entries, {}",
            snapshot.generation,
            entries.len(),
            report
        );
        Ok(report)
    }

    /// Fetch every tracked domain through the proxy.
    pub async fn warm_start(&self) -> WarmReport {
        let snapshot = self.registry.load();
        warm(self.fetcher.as_ref(), &snapshot, self.settings.warm_concurrency).await
    }

    /// Warm, give the resolver time to log the answers, then sync.
    pub async fn warm_and_harvest(&self) -> Result<SyncReport> {
        let report = self.warm_start().await;
        if report.succeeded > 0 {
            tokio::time::sleep(self.settings.warm_harvest_delay).await;
        }
        self.sync_cycle().await
    }

    /// Element counts of the sets backing the current generation.
    pub async fn status(&self) -> Result<Vec<TargetStatus>> {
        let snapshot = self.registry.load();
        let sets = self.sets.list_sets().await?;

        Ok(snapshot
            .targets()
            .iter()
            .map(|target| TargetStatus {
                target: target.clone(),
                elements: sets
                    .iter()
                    .find(|s| s.name == target.set_name)
                    .map(|s| s.element_count),
            })
            .collect())
    }

    /// True when targets exist and none of their sets holds more than the
    /// literal addresses pbr seeds on start.
    pub async fn sets_flushed(&self) -> Result<bool> {
        let status = self.status().await?;
        Ok(!status.is_empty()
            && status
                .iter()
                .all(|s| s.elements.unwrap_or(0) <= s.target.seeded.len()))
    }

    /// Initial discovery, warm-start when the sets were flushed while we
    /// were down, then a first sync.
    pub async fn startup(&self) {
        if let Err(e) = self.discover().await {
            log::error!("Initial discovery failed: {}", e);
        }

        if self.settings.warm_start_enabled {
            match self.sets_flushed().await {
                Ok(true) => {
                    log::info!("All tracked sets are empty, running warm-start");
                    let report = self.warm_start().await;
                    if report.succeeded > 0 {
                        tokio::time::sleep(self.settings.warm_harvest_delay).await;
                    }
                }
                Ok(false) => {}
                Err(e) => log::warn!("Could not check set contents: {}", e),
            }
        }

        if let Err(e) = self.sync_cycle().await {
            log::error!("Initial sync failed: {}", e);
        }
    }

    /// Restart pbr (which flushes every set) and repopulate.
    pub async fn restart(&self) -> Result<()> {
        log::info!("Restarting pbr");
        self.sets.restart_policy_engine().await?;
        log::info!("pbr restarted, waiting {:?} for sets to settle", self.settings.restart_settle);
        tokio::time::sleep(self.settings.restart_settle).await;

        // Set names can change across a restart
        if let Err(e) = self.discover().await {
            log::warn!("Rediscovery after restart failed: {}", e);
        }

        let result = if self.settings.warm_start_enabled {
            self.warm_and_harvest().await
        } else {
            self.sync_cycle().await
        };
        if let Err(e) = result {
            log::error!("Sync after restart failed: {}", e);
        }
        Ok(())
    }
}

/// Periodic sync. The first cycle fires one interval after start since
/// `startup` already ran one.
pub async fn run_sync_service(engine: Arc<SyncEngine>) {
    let period = engine.settings.sync_interval;
    log::info!("Starting sync service (interval: {:?})", period);

    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match engine.sync_cycle().await {
            Ok(_) => {}
            Err(e) if e.is_transient() => log::warn!("Sync cycle failed, retrying next cycle: {}", e),
            Err(e) => log::error!("Sync cycle failed: {}", e),
        }
    }
}

pub async fn run_discovery_service(engine: Arc<SyncEngine>) {
    let period = engine.settings.discovery_interval;
    log::info!("Starting discovery service (interval: {:?})", period);

    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        // refresh already logged the failure and kept the old generation
        let _ = engine.discover().await;
    }
}

pub async fn run_restart_service(engine: Arc<SyncEngine>, at: NaiveTime) {
    log::info!("Starting restart service (daily at {})", at.format("%H:%M"));

    loop {
        sleep_until_local_time(at).await;

        match engine.restart().await {
            Ok(()) => {}
            Err(e) if e.is_transient() => log::warn!("Scheduled pbr restart failed, retrying tomorrow: {}", e),
            Err(e) => log::error!("Scheduled pbr restart failed: {}", e),
        }
    }
}

/// Wait for the next local `at`, following the wall clock as it moves.
async fn sleep_until_local_time(at: NaiveTime) {
    let mut target = next_time_of_day_after(Local::now().naive_local(), at);
    log::debug!("Next pbr restart at {}", target);

    loop {
        match alarm_step(Local::now().naive_local(), target, at, RESTART_RECHECK) {
            AlarmStep::Fire => return,
            AlarmStep::Sleep(wait) => tokio::time::sleep(wait).await,
            AlarmStep::Retarget(next) => {
                log::info!("Local clock moved, next pbr restart at {}", next);
                target = next;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Run the daemon until SIGINT or SIGTERM.
pub async fn run(engine: Arc<SyncEngine>) {
    engine.startup().await;

    let mut tasks = vec![
        tokio::spawn(run_sync_service(engine.clone())),
        tokio::spawn(run_discovery_service(engine.clone())),
    ];
    match engine.settings.restart_at {
        Some(at) => tasks.push(tokio::spawn(run_restart_service(engine.clone(), at))),
        None => log::info!("Daily pbr restart disabled"),
    }

    shutdown_signal().await;
    log::info!("Shutting down");
    for task in tasks {
        task.abort();
    }
}
