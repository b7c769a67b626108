//! The dedup-and-dispatch control loop.
//!
//! Each poll cycle walks the registry inventory, skips digests the
//! [`ContentCache`] already knows, scans the rest, and records every
//! successful result in the cache and on the job queue:
//!
//! ```text
//! Idle -> EnumeratingProjects -> EnumeratingArtifacts -> CheckingCache
//!      -> Scanning -> Recording -> Idle
//! ```
//!
//! Failures are contained at the narrowest scope that makes sense: a failed
//! artifact listing skips one project, a failed or panicking scan pipeline
//! skips one artifact until the next cycle, and a failed project listing (or a
//! panic elsewhere in the cycle) costs one `error_backoff` sleep. Nothing in the
//! steady state stops the loop except the shutdown token.

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ContentCache;
use crate::config::ScheduleConfig;
use crate::error::{RegistryError, ScanError};
use crate::model::{Artifact, Project, ScanResult};
use crate::publisher::JobPublisher;
use crate::registry::RegistryInventory;
use crate::scanner::ScanClient;

/// Where the loop currently is.
///
/// With concurrent scans the reported state is the most recent transition of
/// any pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    EnumeratingProjects,
    EnumeratingArtifacts,
    CheckingCache,
    Scanning,
    Recording,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    pub error_backoff: Duration,
    pub max_concurrent_scans: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for OrchestratorSettings {
    fn from(schedule: &ScheduleConfig) -> Self {
        Self {
            poll_interval: schedule.poll_interval(),
            cache_ttl: schedule.cache_ttl(),
            error_backoff: schedule.error_backoff(),
            max_concurrent_scans: schedule.max_concurrent_scans.max(1),
        }
    }
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub projects: usize,
    pub projects_failed: usize,
    pub artifacts_seen: usize,
    pub duplicates: usize,
    pub cache_hits: usize,
    pub scanned: usize,
    pub scan_failures: usize,
    pub cache_check_failures: usize,
    pub cache_write_failures: usize,
    pub publish_failures: usize,
    /// Artifact pipelines that panicked. Their digests are retried next cycle.
    pub pipeline_panics: usize,
    /// The cycle stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl CycleReport {
    fn record(&mut self, outcome: ArtifactOutcome) {
        match outcome {
            ArtifactOutcome::Duplicate => self.duplicates += 1,
            ArtifactOutcome::Cached => self.cache_hits += 1,
            ArtifactOutcome::Cancelled => self.interrupted = true,
            ArtifactOutcome::Panicked => self.pipeline_panics += 1,
            ArtifactOutcome::ScanFailed { cache_check_failed } => {
                self.scan_failures += 1;
                self.cache_check_failures += usize::from(cache_check_failed);
            }
            ArtifactOutcome::Scanned {
                cache_check_failed,
                cache_write_failed,
                publish_failed,
            } => {
                self.scanned += 1;
                self.cache_check_failures += usize::from(cache_check_failed);
                self.cache_write_failures += usize::from(cache_write_failed);
                self.publish_failures += usize::from(publish_failed);
            }
        }
    }
}

enum ArtifactOutcome {
    Duplicate,
    Cached,
    Cancelled,
    Panicked,
    ScanFailed {
        cache_check_failed: bool,
    },
    Scanned {
        cache_check_failed: bool,
        cache_write_failed: bool,
        publish_failed: bool,
    },
}

/// Digests currently being scanned by this process.
///
/// `run` never overlaps cycles and each cycle already skips repeated digests,
/// so a claim only fails when callers drive [`ScanOrchestrator::run_cycle`]
/// concurrently on the same orchestrator.
#[derive(Debug, Clone, Default)]
struct InFlight {
    digests: Arc<Mutex<HashSet<String>>>,
}

/// Releases an in-flight claim when dropped, including during unwinding.
struct InFlightGuard {
    digests: Arc<Mutex<HashSet<String>>>,
    digest: String,
}

impl InFlight {
    fn claim(&self, digest: &str) -> Option<InFlightGuard> {
        if !lock(&self.digests).insert(digest.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            digests: Arc::clone(&self.digests),
            digest: digest.to_string(),
        })
    }

    fn len(&self) -> usize {
        lock(&self.digests).len()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.digests).remove(&self.digest);
    }
}

fn lock(digests: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    digests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives poll cycles over the four collaborators.
pub struct ScanOrchestrator {
    inventory: Arc<dyn RegistryInventory>,
    cache: Arc<dyn ContentCache>,
    scanner: Arc<dyn ScanClient>,
    publisher: Arc<dyn JobPublisher>,
    settings: OrchestratorSettings,
    in_flight: InFlight,
    state: watch::Sender<OrchestratorState>,
}

impl fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("inventory", &self.inventory.name())
            .field("cache", &self.cache.name())
            .field("scanner", &self.scanner.name())
            .field("publisher", &self.publisher.name())
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight.len())
            .field("state", &self.state())
            .finish()
    }
}

impl ScanOrchestrator {
    pub fn new(
        inventory: Arc<dyn RegistryInventory>,
        cache: Arc<dyn ContentCache>,
        scanner: Arc<dyn ScanClient>,
        publisher: Arc<dyn JobPublisher>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (state, _) = watch::channel(OrchestratorState::Idle);
        Self {
            inventory,
            cache,
            scanner,
            publisher,
            settings,
            in_flight: InFlight::default(),
            state,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: OrchestratorState) {
        self.state.send_replace(state);
    }

    /// Runs poll cycles until `shutdown` is cancelled.
    ///
    /// Each cycle runs in its own task so that a panic inside it is caught
    /// here, logged, and answered with `error_backoff` like any other
    /// systemic failure.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            registry = self.inventory.name(),
            scanner = self.scanner.name(),
            cache = self.cache.name(),
            publisher = self.publisher.name(),
            poll_interval = ?self.settings.poll_interval,
            cache_ttl = ?self.settings.cache_ttl,
            error_backoff = ?self.settings.error_backoff,
            max_concurrent_scans = self.settings.max_concurrent_scans,
            "orchestrator started"
        );

        let mut cycle: u64 = 0;
        while !shutdown.is_cancelled() {
            cycle += 1;
            let this = Arc::clone(&self);
            let token = shutdown.clone();
            let task = tokio::spawn(async move { this.run_cycle(&token).await });

            let delay = match task.await {
                Ok(Ok(report)) => {
                    log_report(cycle, &report);
                    self.settings.poll_interval
                }
                Ok(Err(e)) => {
                    error!(cycle, error = %e, "failed to list projects, backing off");
                    self.settings.error_backoff
                }
                Err(e) => {
                    error!(cycle, error = %e, "poll cycle aborted unexpectedly, backing off");
                    self.set_state(OrchestratorState::Idle);
                    self.settings.error_backoff
                }
            };

            if shutdown.is_cancelled() {
                break;
            }

            debug!(cycle, sleep = ?delay, "waiting for next cycle");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(OrchestratorState::Idle);
        info!(cycles = cycle, "orchestrator stopped");
    }

    /// Runs a single poll cycle.
    ///
    /// # Errors
    ///
    /// Only a failed project listing is returned; every later failure is
    /// logged and counted in the [`CycleReport`].
    pub async fn run_cycle(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<CycleReport, RegistryError> {
        let mut report = CycleReport::default();

        self.set_state(OrchestratorState::EnumeratingProjects);
        let listing = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                report.interrupted = true;
                self.set_state(OrchestratorState::Idle);
                return Ok(report);
            }
            listing = self.inventory.list_projects() => listing,
        };
        let projects = match listing {
            Ok(projects) => projects,
            Err(e) => {
                self.set_state(OrchestratorState::Idle);
                return Err(e);
            }
        };
        report.projects = projects.len();
        debug!(projects = projects.len(), "listed projects");

        let mut seen = HashSet::new();
        for project in &projects {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }

            let Some(artifacts) = self.list_artifacts(project, shutdown, &mut report).await
            else {
                continue;
            };
            report.artifacts_seen += artifacts.len();

            let mut batch = Vec::with_capacity(artifacts.len());
            for artifact in artifacts {
                if seen.insert(artifact.digest.clone()) {
                    batch.push(artifact);
                } else {
                    debug!(
                        digest = %artifact.digest,
                        reference = %artifact.pull_reference,
                        "digest already handled this cycle"
                    );
                    report.record(ArtifactOutcome::Duplicate);
                }
            }

            let outcomes: Vec<ArtifactOutcome> = stream::iter(batch)
                .map(|artifact| self.isolated_pipeline(artifact, shutdown))
                .buffer_unordered(self.settings.max_concurrent_scans)
                .collect()
                .await;
            for outcome in outcomes {
                report.record(outcome);
            }
        }

        self.set_state(OrchestratorState::Idle);
        Ok(report)
    }

    /// Returns `None` when the project has to be skipped this cycle.
    async fn list_artifacts(
        &self,
        project: &Project,
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) -> Option<Vec<Artifact>> {
        self.set_state(OrchestratorState::EnumeratingArtifacts);
        let listing = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                report.interrupted = true;
                return None;
            }
            listing = self.inventory.list_artifacts(project) => listing,
        };

        match listing {
            Ok(artifacts) => {
                debug!(
                    project = %project.name,
                    artifacts = artifacts.len(),
                    "listed artifacts"
                );
                Some(artifacts)
            }
            Err(e) => {
                warn!(
                    project = %project.name,
                    error = %e,
                    "failed to list artifacts, skipping project"
                );
                report.projects_failed += 1;
                None
            }
        }
    }

    /// Runs one artifact pipeline with its panics caught, so that sibling
    /// pipelines of the batch still finish their cache write and publish.
    async fn isolated_pipeline(
        &self,
        artifact: Artifact,
        shutdown: &CancellationToken,
    ) -> ArtifactOutcome {
        let digest = artifact.digest.clone();
        let reference = artifact.pull_reference.clone();

        match AssertUnwindSafe(self.process_artifact(artifact, shutdown))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                error!(
                    digest = %digest,
                    reference = %reference,
                    panic = panic_message(&*panic),
                    "artifact pipeline panicked, will retry next cycle"
                );
                ArtifactOutcome::Panicked
            }
        }
    }

    async fn process_artifact(
        &self,
        artifact: Artifact,
        shutdown: &CancellationToken,
    ) -> ArtifactOutcome {
        if shutdown.is_cancelled() {
            return ArtifactOutcome::Cancelled;
        }

        let Some(_claim) = self.in_flight.claim(&artifact.digest) else {
            debug!(digest = %artifact.digest, "digest already being scanned");
            return ArtifactOutcome::Duplicate;
        };

        self.set_state(OrchestratorState::CheckingCache);
        let mut cache_check_failed = false;
        match self.cache.exists(&artifact.digest).await {
            Ok(true) => {
                debug!(digest = %artifact.digest, "already scanned within retention window");
                return ArtifactOutcome::Cached;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    project = %artifact.project_name,
                    digest = %artifact.digest,
                    error = %e,
                    "cache lookup failed, scanning anyway"
                );
                cache_check_failed = true;
            }
        }

        self.set_state(OrchestratorState::Scanning);
        let budget = self.scanner.timeout();
        let scanned = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(
                    reference = %artifact.pull_reference,
                    "shutdown requested, abandoning scan"
                );
                return ArtifactOutcome::Cancelled;
            }
            scanned = tokio::time::timeout(budget, self.scanner.scan(&artifact)) => scanned,
        };

        let result = match scanned {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log_scan_failure(&artifact, &e);
                return ArtifactOutcome::ScanFailed { cache_check_failed };
            }
            Err(_) => {
                let e = ScanError::Timeout {
                    reference: artifact.pull_reference.clone(),
                    after: budget,
                };
                log_scan_failure(&artifact, &e);
                return ArtifactOutcome::ScanFailed { cache_check_failed };
            }
        };

        // Past this point the result exists; cache and queue writes always run.
        self.set_state(OrchestratorState::Recording);
        let (cache_write_failed, publish_failed) = self.record(&artifact, &result).await;

        let counts = result.severity_counts();
        info!(
            project = %artifact.project_name,
            digest = %artifact.digest,
            critical = counts.critical,
            high = counts.high,
            highest = %result
                .highest_severity()
                .map_or("none", |severity| severity.as_str()),
            "Scanned {}: {} vulnerabilities",
            artifact.pull_reference,
            result.vulnerability_count()
        );

        ArtifactOutcome::Scanned {
            cache_check_failed,
            cache_write_failed,
            publish_failed,
        }
    }

    /// Writes the cache entry, then publishes. Returns the two failure flags.
    async fn record(&self, artifact: &Artifact, result: &ScanResult) -> (bool, bool) {
        let cache_write_failed = match self
            .cache
            .put(&artifact.digest, result, self.settings.cache_ttl)
            .await
        {
            Ok(()) => false,
            Err(e) => {
                warn!(
                    digest = %artifact.digest,
                    error = %e,
                    "failed to record scan in cache, publishing anyway"
                );
                true
            }
        };

        let publish_failed = match self.publisher.publish(result).await {
            Ok(()) => false,
            Err(e) => {
                error!(
                    project = %artifact.project_name,
                    digest = %artifact.digest,
                    reference = %artifact.pull_reference,
                    error = %e,
                    "failed to publish scan result"
                );
                true
            }
        };

        (cache_write_failed, publish_failed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

fn log_scan_failure(artifact: &Artifact, err: &ScanError) {
    warn!(
        project = %artifact.project_name,
        digest = %artifact.digest,
        reference = %artifact.pull_reference,
        error = %err,
        "scan failed, will retry next cycle"
    );
}

fn log_report(cycle: u64, report: &CycleReport) {
    info!(
        cycle,
        projects = report.projects,
        projects_failed = report.projects_failed,
        artifacts = report.artifacts_seen,
        duplicates = report.duplicates,
        cache_hits = report.cache_hits,
        scanned = report.scanned,
        scan_failures = report.scan_failures,
        cache_check_failures = report.cache_check_failures,
        cache_write_failures = report.cache_write_failures,
        publish_failures = report.publish_failures,
        pipeline_panics = report.pipeline_panics,
        interrupted = report.interrupted,
        "poll cycle complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryContentCache;
    use crate::error::{CacheError, PublishError};
    use crate::model::{Severity, Vulnerability};
    use crate::publisher::MemoryPublisher;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const SCAN_TIMEOUT: Duration = Duration::from_secs(600);

    #[derive(Default)]
    struct FakeInventory {
        projects: Vec<Project>,
        artifacts: HashMap<String, Vec<Artifact>>,
        failing_projects: HashSet<String>,
        project_listing_failures: AtomicUsize,
        panic_next: AtomicBool,
    }

    impl FakeInventory {
        fn with_project(mut self, name: &str, artifacts: &[(&str, &str)]) -> Self {
            self.projects.push(Project::new(name));
            self.artifacts.insert(
                name.to_string(),
                artifacts
                    .iter()
                    .map(|(digest, reference)| {
                        Artifact::new(name, *digest, *reference).unwrap()
                    })
                    .collect(),
            );
            self
        }

        fn failing(mut self, name: &str) -> Self {
            self.projects.push(Project::new(name));
            self.failing_projects.insert(name.to_string());
            self
        }
    }

    #[async_trait]
    impl RegistryInventory for FakeInventory {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn list_projects(&self) -> Result<Vec<Project>, RegistryError> {
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("inventory exploded");
            }
            let remaining = self.project_listing_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.project_listing_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(RegistryError::Unavailable("connection refused".into()));
            }
            Ok(self.projects.clone())
        }

        async fn list_artifacts(
            &self,
            project: &Project,
        ) -> Result<Vec<Artifact>, RegistryError> {
            if self.failing_projects.contains(&project.name) {
                return Err(RegistryError::Unavailable("HTTP 502".into()));
            }
            self.artifacts
                .get(&project.name)
                .cloned()
                .ok_or_else(|| RegistryError::ProjectNotFound(project.name.clone()))
        }
    }

    #[derive(Default)]
    struct FakeScanner {
        calls: Mutex<Vec<String>>,
        failing: Mutex<HashSet<String>>,
        hanging: Mutex<HashSet<String>>,
        delays: Mutex<HashMap<String, Duration>>,
        panic_once: Mutex<HashSet<String>>,
    }

    impl FakeScanner {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(&self, digest: &str) {
            self.failing.lock().unwrap().insert(digest.to_string());
        }

        fn hang(&self, digest: &str) {
            self.hanging.lock().unwrap().insert(digest.to_string());
        }

        fn delay(&self, digest: &str, by: Duration) {
            self.delays.lock().unwrap().insert(digest.to_string(), by);
        }

        fn panic_once(&self, digest: &str) {
            self.panic_once.lock().unwrap().insert(digest.to_string());
        }

        fn heal(&self) {
            self.failing.lock().unwrap().clear();
            self.hanging.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl ScanClient for FakeScanner {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn timeout(&self) -> Duration {
            SCAN_TIMEOUT
        }

        async fn scan(&self, artifact: &Artifact) -> Result<ScanResult, ScanError> {
            self.calls.lock().unwrap().push(artifact.pull_reference.clone());

            let delay = self.delays.lock().unwrap().get(&artifact.digest).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let panics = self.panic_once.lock().unwrap().remove(&artifact.digest);
            if panics {
                panic!("scanner exploded on {}", artifact.digest);
            }
            let hangs = self.hanging.lock().unwrap().contains(&artifact.digest);
            if hangs {
                std::future::pending::<()>().await;
            }
            let fails = self.failing.lock().unwrap().contains(&artifact.digest);
            if fails {
                return Err(ScanError::Engine("database locked".into()));
            }

            Ok(ScanResult::new(
                artifact,
                vec![Vulnerability {
                    id: "CVE-2024-0001".to_string(),
                    package: "openssl".to_string(),
                    installed_version: "3.0.2".to_string(),
                    fixed_version: Some("3.0.13".to_string()),
                    severity: Severity::High,
                    title: None,
                }],
            ))
        }
    }

    #[derive(Default)]
    struct UnavailableCache {
        puts: AtomicUsize,
    }

    #[async_trait]
    impl ContentCache for UnavailableCache {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        async fn exists(&self, _digest: &str) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn put(
            &self,
            _digest: &str,
            _result: &ScanResult,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    struct DownPublisher;

    #[async_trait]
    impl JobPublisher for DownPublisher {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn publish(&self, _result: &ScanResult) -> Result<(), PublishError> {
            Err(PublishError::BrokerUnavailable("retries exhausted".into()))
        }
    }

    /// Accepts every result, but only after `delay`.
    struct SlowPublisher {
        inner: MemoryPublisher,
        delay: Duration,
    }

    #[async_trait]
    impl JobPublisher for SlowPublisher {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
            tokio::time::sleep(self.delay).await;
            self.inner.publish(result).await
        }
    }

    struct Harness {
        orchestrator: Arc<ScanOrchestrator>,
        scanner: Arc<FakeScanner>,
        cache: Arc<MemoryContentCache>,
        publisher: Arc<MemoryPublisher>,
    }

    fn harness(inventory: FakeInventory) -> Harness {
        let scanner = Arc::new(FakeScanner::default());
        let cache = Arc::new(MemoryContentCache::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let orchestrator = Arc::new(ScanOrchestrator::new(
            Arc::new(inventory),
            cache.clone(),
            scanner.clone(),
            publisher.clone(),
            OrchestratorSettings::default(),
        ));
        Harness {
            orchestrator,
            scanner,
            cache,
            publisher,
        }
    }

    #[tokio::test]
    async fn test_two_projects_two_uncached_artifacts() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")])
                .with_project("team", &[("sha256:bb", "reg/team/api:2.0")]),
        );

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.scanner.calls().len(), 2);
        assert_eq!(h.cache.len(), 2);
        assert_eq!(h.publisher.len(), 2);
        assert_eq!(report.projects, 2);
        assert_eq!(report.scanned, 2);
        assert_eq!(report.scan_failures, 0);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_same_digest_under_two_references_is_scanned_once() {
        let h = harness(
            FakeInventory::default()
                .with_project(
                    "library",
                    &[
                        ("sha256:aa", "reg/library/nginx:1.25"),
                        ("sha256:aa", "reg/library/nginx:latest"),
                    ],
                )
                .with_project("mirror", &[("sha256:aa", "reg/mirror/nginx:stable")]),
        );

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(h.scanner.calls().len(), 1);
        assert_eq!(h.publisher.len(), 1);
        assert_eq!(report.artifacts_seen, 3);
        assert_eq!(report.duplicates, 2);
    }

    #[tokio::test]
    async fn test_cached_digest_is_not_scanned() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        let token = CancellationToken::new();

        h.orchestrator.run_cycle(&token).await.unwrap();
        let report = h.orchestrator.run_cycle(&token).await.unwrap();

        assert_eq!(h.scanner.calls().len(), 1);
        assert_eq!(h.publisher.len(), 1);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_scanned_again() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        let token = CancellationToken::new();
        let ttl = h.orchestrator.settings().cache_ttl;

        h.orchestrator.run_cycle(&token).await.unwrap();
        tokio::time::advance(ttl - Duration::from_secs(1)).await;
        h.orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(h.scanner.calls().len(), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        let report = h.orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(h.scanner.calls().len(), 2);
        assert_eq!(h.publisher.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_project_does_not_block_others() {
        let h = harness(
            FakeInventory::default()
                .failing("broken")
                .with_project("team", &[("sha256:bb", "reg/team/api:2.0")]),
        );

        let report = h.orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.projects_failed, 1);
        assert_eq!(report.scanned, 1);
        assert_eq!(h.scanner.calls(), vec!["reg/team/api:2.0".to_string()]);
    }

    #[tokio::test]
    async fn test_scan_failure_is_retried_next_cycle() {
        let h = harness(FakeInventory::default().with_project(
            "library",
            &[
                ("sha256:aa", "reg/library/nginx:1.25"),
                ("sha256:bb", "reg/library/redis:7"),
            ],
        ));
        let token = CancellationToken::new();
        h.scanner.fail("sha256:aa");

        let report = h.orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.scan_failures, 1);
        assert_eq!(report.scanned, 1);
        assert!(h.cache.get("sha256:aa").is_none());
        assert!(h.cache.get("sha256:bb").is_some());

        h.scanner.heal();
        let report = h.orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.cache_hits, 1);
        assert!(h.cache.get("sha256:aa").is_some());
        assert_eq!(h.publisher.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_leaves_artifact_uncached() {
        let h = harness(FakeInventory::default().with_project(
            "library",
            &[
                ("sha256:aa", "reg/library/nginx:1.25"),
                ("sha256:bb", "reg/library/redis:7"),
            ],
        ));
        let token = CancellationToken::new();
        h.scanner.hang("sha256:aa");

        let started = tokio::time::Instant::now();
        let report = h.orchestrator.run_cycle(&token).await.unwrap();

        assert!(started.elapsed() >= SCAN_TIMEOUT);
        assert_eq!(report.scan_failures, 1);
        assert_eq!(report.scanned, 1);
        assert!(h.cache.get("sha256:aa").is_none());
        assert_eq!(h.orchestrator.in_flight.len(), 0);

        h.scanner.heal();
        h.orchestrator.run_cycle(&token).await.unwrap();
        assert!(h.cache.get("sha256:aa").is_some());
        let calls = h.scanner.calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "reg/library/nginx:1.25").count(), 2);
    }

    #[tokio::test]
    async fn test_cache_outage_fails_open() {
        let scanner = Arc::new(FakeScanner::default());
        let cache = Arc::new(UnavailableCache::default());
        let publisher = Arc::new(MemoryPublisher::new());
        let orchestrator = ScanOrchestrator::new(
            Arc::new(
                FakeInventory::default()
                    .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
            ),
            cache.clone(),
            scanner.clone(),
            publisher.clone(),
            OrchestratorSettings::default(),
        );

        let report = orchestrator.run_cycle(&CancellationToken::new()).await.unwrap();

        assert_eq!(scanner.calls().len(), 1);
        assert_eq!(cache.puts.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.len(), 1);
        assert_eq!(report.cache_check_failures, 1);
        assert_eq!(report.cache_write_failures, 1);
        assert_eq!(report.scanned, 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_cache_entry() {
        let scanner = Arc::new(FakeScanner::default());
        let cache = Arc::new(MemoryContentCache::new());
        let orchestrator = ScanOrchestrator::new(
            Arc::new(
                FakeInventory::default()
                    .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
            ),
            cache.clone(),
            scanner.clone(),
            Arc::new(DownPublisher),
            OrchestratorSettings::default(),
        );
        let token = CancellationToken::new();

        let report = orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.publish_failures, 1);
        assert_eq!(report.scanned, 1);
        assert!(cache.get("sha256:aa").is_some());

        let report = orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.cache_hits, 1);
        assert_eq!(scanner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_project_listing_failure_is_returned() {
        let inventory = FakeInventory::default()
            .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]);
        inventory.project_listing_failures.store(1, Ordering::SeqCst);
        let h = harness(inventory);

        let err = h.orchestrator.run_cycle(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RegistryError::Unavailable(_)));
        assert!(h.scanner.calls().is_empty());
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_cycle_starts_no_scans() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        let token = CancellationToken::new();
        token.cancel();

        let report = h.orchestrator.run_cycle(&token).await.unwrap();

        assert!(report.interrupted);
        assert!(h.scanner.calls().is_empty());
        assert!(h.cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_in_progress_scan_without_writes() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        h.scanner.hang("sha256:aa");
        let token = CancellationToken::new();

        let orchestrator = Arc::clone(&h.orchestrator);
        let cycle_token = token.clone();
        let cycle = tokio::spawn(async move { orchestrator.run_cycle(&cycle_token).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let report = cycle.await.unwrap().unwrap();

        assert!(report.interrupted);
        assert_eq!(report.scanned, 0);
        assert_eq!(h.scanner.calls().len(), 1);
        assert!(h.cache.is_empty());
        assert!(h.publisher.is_empty());
        assert_eq!(h.orchestrator.in_flight.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_after_error_backoff() {
        let inventory = FakeInventory::default()
            .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]);
        inventory.project_listing_failures.store(1, Ordering::SeqCst);
        let h = harness(inventory);
        let backoff = h.orchestrator.settings().error_backoff;
        let token = CancellationToken::new();

        let run = tokio::spawn(Arc::clone(&h.orchestrator).run(token.clone()));

        tokio::time::sleep(backoff - Duration::from_secs(1)).await;
        assert!(h.scanner.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.scanner.calls().len(), 1);
        assert_eq!(h.publisher.len(), 1);

        token.cancel();
        run.await.unwrap();
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_panicking_cycle() {
        let inventory = FakeInventory::default()
            .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]);
        inventory.panic_next.store(true, Ordering::SeqCst);
        let h = harness(inventory);
        let backoff = h.orchestrator.settings().error_backoff;
        let token = CancellationToken::new();

        let run = tokio::spawn(Arc::clone(&h.orchestrator).run(token.clone()));

        tokio::time::sleep(backoff - Duration::from_secs(1)).await;
        assert!(h.scanner.calls().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        token.cancel();
        run.await.unwrap();

        assert_eq!(h.scanner.calls().len(), 1);
        assert_eq!(h.publisher.len(), 1);
        assert!(h.cache.get("sha256:aa").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_pipeline_leaves_sibling_publish_intact() {
        let scanner = Arc::new(FakeScanner::default());
        let cache = Arc::new(MemoryContentCache::new());
        let publisher = Arc::new(SlowPublisher {
            inner: MemoryPublisher::new(),
            delay: Duration::from_secs(5),
        });
        let orchestrator = ScanOrchestrator::new(
            Arc::new(FakeInventory::default().with_project(
                "library",
                &[
                    ("sha256:aa", "reg/library/nginx:1.25"),
                    ("sha256:bb", "reg/library/redis:7"),
                ],
            )),
            cache.clone(),
            scanner.clone(),
            publisher.clone(),
            OrchestratorSettings::default(),
        );
        scanner.delay("sha256:aa", Duration::from_secs(1));
        scanner.panic_once("sha256:aa");
        let token = CancellationToken::new();

        let report = orchestrator.run_cycle(&token).await.unwrap();

        assert_eq!(report.pipeline_panics, 1);
        assert_eq!(report.scanned, 1);
        assert!(cache.get("sha256:bb").is_some());
        assert!(cache.get("sha256:aa").is_none());
        let published: Vec<_> = publisher
            .inner
            .published()
            .into_iter()
            .map(|r| r.digest)
            .collect();
        assert_eq!(published, vec!["sha256:bb".to_string()]);
        assert_eq!(orchestrator.in_flight.len(), 0);

        let report = orchestrator.run_cycle(&token).await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.cache_hits, 1);
        assert_eq!(publisher.inner.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_cycles_scan_digest_once() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        h.scanner.delay("sha256:aa", Duration::from_secs(1));
        let token = CancellationToken::new();

        let (first, second) = tokio::join!(
            h.orchestrator.run_cycle(&token),
            h.orchestrator.run_cycle(&token)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.scanned + second.scanned, 1);
        assert_eq!(first.duplicates + second.duplicates, 1);
        assert_eq!(h.scanner.calls().len(), 1);
        assert_eq!(h.publisher.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_polls_on_interval() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        let poll = h.orchestrator.settings().poll_interval;
        let token = CancellationToken::new();
        let mut states = h.orchestrator.subscribe();

        let run = tokio::spawn(Arc::clone(&h.orchestrator).run(token.clone()));

        // cycle 1 scans, cycle 2 hits the cache
        tokio::time::sleep(poll + Duration::from_secs(1)).await;
        token.cancel();
        run.await.unwrap();

        assert_eq!(h.scanner.calls().len(), 1);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), OrchestratorState::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_run_returns_immediately() {
        let h = harness(
            FakeInventory::default()
                .with_project("library", &[("sha256:aa", "reg/library/nginx:1.25")]),
        );
        let token = CancellationToken::new();
        token.cancel();

        Arc::clone(&h.orchestrator).run(token).await;

        assert!(h.scanner.calls().is_empty());
    }

    #[test]
    fn test_in_flight_claim_is_exclusive_until_dropped() {
        let in_flight = InFlight::default();

        let first = in_flight.claim("sha256:aa");
        assert!(first.is_some());
        assert!(in_flight.claim("sha256:aa").is_none());
        assert!(in_flight.claim("sha256:bb").is_some());

        drop(first);
        assert!(in_flight.claim("sha256:aa").is_some());
        assert_eq!(in_flight.len(), 0);
    }

    #[test]
    fn test_settings_from_schedule() {
        let schedule = ScheduleConfig {
            poll_interval_secs: 30,
            cache_ttl_secs: 3600,
            error_backoff_secs: 5,
            max_concurrent_scans: 0,
        };
        let settings = OrchestratorSettings::from(&schedule);

        assert_eq!(settings.poll_interval, Duration::from_secs(30));
        assert_eq!(settings.cache_ttl, Duration::from_secs(3600));
        assert_eq!(settings.error_backoff, Duration::from_secs(5));
        assert_eq!(settings.max_concurrent_scans, 1);
    }
}
