//! Bulk migration of app records into cluster-native resources
//!
//! The engine reads every application from the primary store in one bulk
//! read, resolves each app's pool to a cluster, and makes sure the cluster
//! holds the app's `CaravelApp` object. Partial failure is the expected
//! mode: an unresolvable pool or a failing cluster never aborts the batch,
//! it is recorded against that one application and processing continues.
//! Re-running after a fix converges — already-migrated apps are untouched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::app::{App, AppStore};
use crate::client::{AppCrClient, AppCreate, ClientProvider};
use crate::resolver::ClusterResolver;
use crate::{Error, KUBERNETES_PROVISIONER};

/// Default bound on concurrently processed applications
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default deadline for a single cluster API call
///
/// Deadlines are per call, not per batch, so one unreachable cluster can
/// only fail its own applications.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminal state of one application within a migration pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppOutcome {
    /// The cluster-native object was created by this pass
    Migrated,
    /// The object already existed (earlier pass or concurrent creator)
    AlreadyMigrated,
    /// No cluster is bound to the app's pool; operator action needed
    SkippedNoCluster,
    /// A cluster API call failed for this application
    Failed,
}

/// One application-level failure inside a migration pass
#[derive(Debug)]
pub struct MigrationFailure {
    /// Name of the application that failed or was skipped
    pub app: String,
    /// The specific cause
    pub cause: Error,
}

/// Counts of per-application outcomes for a migration pass
///
/// Lets callers distinguish "zero applications processed" from "all
/// applications succeeded" from "some applications failed".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Applications whose object was created by this pass
    pub migrated: usize,
    /// Applications whose object already existed
    pub already_migrated: usize,
    /// Applications skipped because no cluster resolved
    pub skipped: usize,
    /// Applications that hit a cluster API failure
    pub failed: usize,
    /// True if the pass was cancelled before completing
    pub cancelled: bool,
}

impl MigrationSummary {
    /// Total number of applications that reached a terminal state
    pub fn processed(&self) -> usize {
        self.migrated + self.already_migrated + self.skipped + self.failed
    }
}

/// Aggregated error for a migration pass
///
/// Enumerates every application that ended skipped or failed, in the order
/// the bulk read returned them, plus a distinguished cancellation marker.
/// Built as a plain accumulator — failures are collected, never raised and
/// caught per item.
#[derive(Debug)]
pub struct MigrationError {
    /// Per-application failures in input order
    pub failures: Vec<MigrationFailure>,
    /// Outcome counts for the whole pass
    pub summary: MigrationSummary,
}

impl MigrationError {
    /// True if the pass was cancelled before completion
    pub fn cancelled(&self) -> bool {
        self.summary.cancelled
    }
}

impl fmt::Display for MigrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "migration finished with {} failure(s)", self.failures.len())?;
        if self.summary.cancelled {
            write!(f, " (cancelled before completion)")?;
        }
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.app, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for MigrationError {}

/// Orchestrates bulk conversion of app records into cluster resources
pub struct MigrationEngine {
    apps: Arc<dyn AppStore>,
    resolver: ClusterResolver,
    clients: Arc<dyn ClientProvider>,
    concurrency: usize,
    call_timeout: Duration,
}

impl MigrationEngine {
    /// Create an engine over the given store, resolver and client provider
    pub fn new(
        apps: Arc<dyn AppStore>,
        resolver: ClusterResolver,
        clients: Arc<dyn ClientProvider>,
    ) -> Self {
        Self {
            apps,
            resolver,
            clients,
            concurrency: DEFAULT_CONCURRENCY,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound the number of applications processed concurrently
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Override the per-call deadline for cluster API calls
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Migrate every application record, without external cancellation
    pub async fn migrate_apps(&self) -> Result<MigrationSummary, MigrationError> {
        self.migrate_apps_with_cancel(&CancellationToken::new())
            .await
    }

    /// Migrate every application record
    ///
    /// Applications fan out across at most `concurrency` workers; each
    /// application's resolve → check → create sequence runs uninterleaved
    /// inside one worker. Results are folded back in the order the store
    /// returned the records, so the aggregated error enumerates failures
    /// in the order encountered.
    ///
    /// On cancellation, in-flight applications finish and no new ones
    /// start; the returned error then carries the cancellation marker even
    /// if no application failed, since the pass did not cover the whole
    /// store. Configuration errors (client construction) abort the pass
    /// the same way: recorded, then no new applications start.
    #[instrument(skip_all)]
    pub async fn migrate_apps_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MigrationSummary, MigrationError> {
        let apps = match self.apps.list().await {
            Ok(apps) => apps,
            Err(e) => {
                // Nothing was processed; surface the storage failure as the
                // single cause.
                return Err(MigrationError {
                    failures: vec![MigrationFailure {
                        app: "<bulk read>".to_string(),
                        cause: e,
                    }],
                    summary: MigrationSummary::default(),
                });
            }
        };
        let total = apps.len();
        info!(apps = total, "starting app migration");

        let mut summary = MigrationSummary::default();
        let mut failures = Vec::new();
        let abort = AtomicBool::new(false);

        let mut results = futures::stream::iter(apps)
            .take_while(|_| {
                futures::future::ready(!cancel.is_cancelled() && !abort.load(Ordering::SeqCst))
            })
            .map(|app| async move {
                let (outcome, cause) = self.migrate_one(&app).await;
                (app.name, outcome, cause)
            })
            .buffered(self.concurrency);

        while let Some((app, outcome, cause)) = results.next().await {
            match outcome {
                AppOutcome::Migrated => summary.migrated += 1,
                AppOutcome::AlreadyMigrated => summary.already_migrated += 1,
                AppOutcome::SkippedNoCluster => summary.skipped += 1,
                AppOutcome::Failed => summary.failed += 1,
            }
            if let Some(cause) = cause {
                // A malformed cluster definition fails every app behind it;
                // stop pulling new work once we see one.
                if matches!(cause, Error::ClientConstruction { .. }) {
                    warn!(app = %app, error = %cause, "configuration error, aborting pass");
                    abort.store(true, Ordering::SeqCst);
                }
                failures.push(MigrationFailure { app, cause });
            }
        }
        drop(results);

        summary.cancelled = cancel.is_cancelled() && summary.processed() < total;

        info!(
            migrated = summary.migrated,
            already_migrated = summary.already_migrated,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "app migration finished"
        );

        if failures.is_empty() && !summary.cancelled {
            Ok(summary)
        } else {
            Err(MigrationError { failures, summary })
        }
    }

    /// Run one application's full sequence: resolve → check → create
    ///
    /// Returns the terminal outcome and, for skipped/failed apps, the cause
    /// to record in the aggregate.
    async fn migrate_one(&self, app: &App) -> (AppOutcome, Option<Error>) {
        let cluster = match self
            .resolver
            .resolve(KUBERNETES_PROVISIONER, &app.pool)
            .await
        {
            Ok(cluster) => cluster,
            Err(e) if e.is_no_cluster() => {
                debug!(app = %app.name, pool = %app.pool, "no cluster for pool, skipping");
                return (AppOutcome::SkippedNoCluster, Some(e));
            }
            Err(e) => return (AppOutcome::Failed, Some(e)),
        };

        let client = match self.clients.app_client_for(&cluster).await {
            Ok(client) => client,
            Err(e) => return (AppOutcome::Failed, Some(e)),
        };

        match self.migrate_into(app, &cluster.name, client.as_ref()).await {
            Ok(outcome) => {
                debug!(app = %app.name, cluster = %cluster.name, outcome = ?outcome, "app processed");
                (outcome, None)
            }
            Err(e) => {
                warn!(app = %app.name, cluster = %cluster.name, error = %e, "app migration failed");
                (AppOutcome::Failed, Some(e))
            }
        }
    }

    /// Check-then-create against one resolved cluster
    async fn migrate_into(
        &self,
        app: &App,
        cluster: &str,
        client: &dyn AppCrClient,
    ) -> Result<AppOutcome, Error> {
        self.with_deadline(cluster, "register app schema", client.ensure_app_crd())
            .await?;

        let existing = self
            .with_deadline(cluster, "check app resource", client.get_app(&app.name))
            .await?;
        if existing.is_some() {
            return Ok(AppOutcome::AlreadyMigrated);
        }

        match self
            .with_deadline(cluster, "create app resource", client.create_app(app))
            .await?
        {
            AppCreate::Created => Ok(AppOutcome::Migrated),
            // A concurrent creator won the race; the object exists, which
            // is all migration promises.
            AppCreate::AlreadyExists => Ok(AppOutcome::AlreadyMigrated),
        }
    }

    /// Apply the per-call deadline to one cluster API call
    async fn with_deadline<T>(
        &self,
        cluster: &str,
        operation: &str,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(operation, cluster)),
        }
    }
}
