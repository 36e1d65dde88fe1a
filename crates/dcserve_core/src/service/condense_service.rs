//! Condensation job and batch driver.
//!
//! # Responsibility
//! - Produce the condensed artifact of one resource, guarded by the
//!   feature flag, the mime type, artifact existence and a resource lock.
//! - Append API, object-store and HTTP basins referencing every feature
//!   the condensed container does not store.
//! - Drive condensation over all catalog packages.
//!
//! # Invariants
//! - Recoverable failures are logged and reported as `Ok(false)` (or a
//!   `Failed` outcome); only
//!   cancellation and lock backend failures leave `condense` as errors.
//! - The scratch file is removed on every exit path once created.
//! - Warnings captured while condensing are never logged, only counted.
//! - At most one worker per resource runs the main path at a time.

use crate::config::ServeConfig;
use crate::container::{read_container, write_container, ContainerError, ContainerWriter};
use crate::dataset::{
    condense_dataset, upstream_features, BasinResolver, DatasetError, RtdcDataset,
};
use crate::lock::{LockError, ResourceLock};
use crate::model::basin::Basin;
use crate::model::resource::{Package, Resource, ResourceId};
use crate::repo::{
    ArtifactKind, ArtifactLocation, ArtifactStore, CatalogError, ResourceCatalog,
    ResourceLocator, StoreBasinResolver, StoreError,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Locker id recorded in condensation lock markers.
pub const CONDENSE_LOCKER_ID: &str = "DCOR_generate_condensed";

/// Shared interrupt flag checked between condensation steps.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing flag, e.g. one set from a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fatal condensation errors.
#[derive(Debug)]
pub enum CondenseError {
    /// Operator interrupt; never downgraded to a logged failure.
    Cancelled,
    /// The lock backend could not record an acquisition.
    Lock(LockError),
}

impl CondenseError {
    /// Stable class name for operator-facing reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::Lock(_) => "LockError",
        }
    }
}

impl Display for CondenseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "condensation cancelled"),
            Self::Lock(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CondenseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Lock(err) => Some(err),
        }
    }
}

impl From<LockError> for CondenseError {
    fn from(value: LockError) -> Self {
        Self::Lock(value)
    }
}

/// Recoverable failure inside one condensation job.
#[derive(Debug)]
enum JobFailure {
    PackageMissing(String),
    Catalog(CatalogError),
    Store(StoreError),
    Container(ContainerError),
    Dataset(DatasetError),
    Unavailable(ResourceId),
    Scratch {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PackageMissing(id) => write!(f, "package not found: {id}"),
            Self::Catalog(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Container(err) => write!(f, "{err}"),
            Self::Dataset(err) => write!(f, "{err}"),
            Self::Unavailable(id) => write!(f, "resource {id} did not become available"),
            Self::Scratch { path, source } => {
                write!(f, "scratch directory `{}`: {source}", path.display())
            }
        }
    }
}

impl JobFailure {
    fn code(&self) -> &'static str {
        match self {
            Self::PackageMissing(_) => "package_missing",
            Self::Catalog(_) => "catalog",
            Self::Store(_) => "store",
            Self::Container(_) => "container",
            Self::Dataset(_) => "dataset",
            Self::Unavailable(_) => "unavailable",
            Self::Scratch { .. } => "scratch",
        }
    }

    /// Error class name shown to operators.
    fn kind(&self) -> &'static str {
        match self {
            Self::PackageMissing(_) | Self::Unavailable(_) => "NotFound",
            Self::Catalog(_) => "CatalogError",
            Self::Store(_) => "StoreError",
            Self::Container(_) => "ContainerError",
            Self::Dataset(_) => "DatasetError",
            Self::Scratch { .. } => "IoError",
        }
    }
}

impl From<CatalogError> for JobFailure {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

impl From<StoreError> for JobFailure {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<ContainerError> for JobFailure {
    fn from(value: ContainerError) -> Self {
        Self::Container(value)
    }
}

impl From<DatasetError> for JobFailure {
    fn from(value: DatasetError) -> Self {
        Self::Dataset(value)
    }
}

/// Result of one condensation job that did not fail fatally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CondenseOutcome {
    Created,
    /// A guard declined the job: disabled, not RT-DC, already condensed or locked.
    Skipped,
    /// A recoverable failure; details were logged.
    Failed { kind: &'static str, message: String },
}

impl CondenseOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created)
    }
}

/// Outer layer is fatal, inner layer is recoverable.
type JobResult<T> = Result<Result<T, JobFailure>, CondenseError>;

/// Where the raw upload was found.
enum RawSource {
    Local(PathBuf),
    Remote(ArtifactLocation),
}

/// Generates and stores condensed artifacts.
pub struct CondensationEngine {
    config: ServeConfig,
    catalog: Arc<dyn ResourceCatalog>,
    store: Arc<dyn ArtifactStore>,
    lock: Arc<dyn ResourceLock>,
    locator: ResourceLocator,
    cancel: CancelToken,
    scratch_dir: OnceCell<PathBuf>,
}

impl CondensationEngine {
    pub fn new(
        config: ServeConfig,
        catalog: Arc<dyn ResourceCatalog>,
        store: Arc<dyn ArtifactStore>,
        lock: Arc<dyn ResourceLock>,
    ) -> Self {
        let locator = ResourceLocator::new(config.storage_path.clone());
        Self {
            config,
            catalog,
            store,
            lock,
            locator,
            cancel: CancelToken::new(),
            scratch_dir: OnceCell::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Condenses `resource`; returns whether a new artifact was stored.
    ///
    /// # Errors
    /// See [`CondensationEngine::condense_outcome`].
    pub fn condense(
        &self,
        resource: &Resource,
        override_existing: bool,
    ) -> Result<bool, CondenseError> {
        Ok(self.condense_outcome(resource, override_existing)?.is_created())
    }

    /// Condenses `resource` and reports why nothing was stored.
    ///
    /// Guards run in order: feature flag, mime type, artifact existence
    /// (skipped with `override_existing`), lock. A busy lock yields
    /// `Skipped` without waiting.
    ///
    /// # Errors
    /// - `Cancelled` when the cancel token trips at any step.
    /// - `Lock` when the lock backend fails.
    pub fn condense_outcome(
        &self,
        resource: &Resource,
        override_existing: bool,
    ) -> Result<CondenseOutcome, CondenseError> {
        self.check_cancelled()?;
        let resource_id = &resource.id;

        if !self.config.create_condensed_datasets {
            info!(
                "event=condense module=condense status=skip reason=disabled resource_id={}",
                resource_id
            );
            return Ok(CondenseOutcome::Skipped);
        }
        if !resource.is_dc_resource() {
            debug!(
                "event=condense module=condense status=skip reason=mimetype resource_id={}",
                resource_id
            );
            return Ok(CondenseOutcome::Skipped);
        }

        let package = match self.owning_package(resource) {
            Ok(package) => package,
            Err(failure) => return Ok(self.report_failure(resource_id, failure)),
        };
        let location = ArtifactLocation::new(
            self.config.bucket_name(&package.organization_id),
            ArtifactKind::Condensed,
            resource_id.clone(),
        );

        match self.already_condensed(&location, override_existing) {
            Ok(false) => {}
            Ok(true) => return Ok(CondenseOutcome::Skipped),
            Err(failure) => return Ok(self.report_failure(resource_id, failure)),
        }

        let Some(_guard) = self.lock.try_acquire(resource_id, CONDENSE_LOCKER_ID)? else {
            info!(
                "event=condense module=condense status=skip reason=locked resource_id={}",
                resource_id
            );
            return Ok(CondenseOutcome::Skipped);
        };

        // Another worker may have finished between the first check and the lock.
        match self.already_condensed(&location, override_existing) {
            Ok(false) => {}
            Ok(true) => return Ok(CondenseOutcome::Skipped),
            Err(failure) => return Ok(self.report_failure(resource_id, failure)),
        }

        let scratch = match self.scratch_path(resource_id) {
            Ok(path) => path,
            Err(failure) => return Ok(self.report_failure(resource_id, failure)),
        };
        let started_at = Instant::now();
        info!(
            "event=condense module=condense status=start resource_id={}",
            resource_id
        );
        let outcome = self.condense_locked(resource, &package, &location, &scratch);
        remove_scratch(&scratch);

        match outcome? {
            Ok(()) => {
                info!(
                    "event=condense module=condense status=ok resource_id={} duration_ms={}",
                    resource_id,
                    started_at.elapsed().as_millis()
                );
                Ok(CondenseOutcome::Created)
            }
            Err(failure) => Ok(self.report_failure(resource_id, failure)),
        }
    }

    fn condense_locked(
        &self,
        resource: &Resource,
        package: &Package,
        location: &ArtifactLocation,
        scratch: &Path,
    ) -> JobResult<()> {
        let raw_location = ArtifactLocation::new(
            location.bucket.clone(),
            ArtifactKind::Resource,
            resource.id.clone(),
        );
        let source = match self.wait_for_resource(&resource.id, &raw_location)? {
            Ok(source) => source,
            Err(failure) => return Ok(Err(failure)),
        };
        self.check_cancelled()?;

        let upstream = match self.build_scratch(resource, &raw_location, source, scratch) {
            Ok(upstream) => upstream,
            Err(failure) => return Ok(Err(failure)),
        };
        self.check_cancelled()?;

        if let Err(err) = self.store.upload_artifact(location, scratch, true) {
            return Ok(Err(err.into()));
        }
        info!(
            "event=condense_upload module=condense status=ok resource_id={} package={} upstream_features={}",
            resource.id,
            package.name,
            upstream.len()
        );
        Ok(Ok(()))
    }

    /// Writes the condensed container plus basins to `scratch` and returns
    /// the upstream-only features.
    fn build_scratch(
        &self,
        resource: &Resource,
        raw_location: &ArtifactLocation,
        source: RawSource,
        scratch: &Path,
    ) -> Result<Vec<String>, JobFailure> {
        let container = match source {
            RawSource::Local(path) => read_container(path)?,
            RawSource::Remote(raw) => self.store.open_artifact(&raw)?,
        };
        let resolver: Arc<dyn BasinResolver> =
            Arc::new(StoreBasinResolver::new(Arc::clone(&self.store)));
        let raw = RtdcDataset::new(container, Some(resolver))?;

        let mut warnings = Vec::new();
        let condensed = condense_dataset(&raw, &mut warnings)?;
        let upstream = upstream_features(&raw, &condensed);
        write_container(scratch, &condensed)?;
        drop(condensed);

        let object_url = self.store.object_url(raw_location);
        let mut writer = ContainerWriter::open(scratch)?;
        for basin in [
            Basin::dcor_api(&self.config.site_url, resource.id.as_str(), upstream.clone()),
            Basin::object_store(object_url.clone(), upstream.clone()),
            Basin::public_http(object_url, upstream.clone()),
        ] {
            writer.store_basin(&basin)?;
        }
        drop(writer);

        debug!(
            "event=condense_scratch module=condense status=ok resource_id={} events={} warnings={}",
            resource.id,
            raw.len(),
            warnings.len()
        );
        Ok(upstream)
    }

    /// Polls until the raw upload is visible locally or remotely.
    fn wait_for_resource(
        &self,
        resource_id: &ResourceId,
        raw_location: &ArtifactLocation,
    ) -> JobResult<RawSource> {
        let wait = &self.config.wait_for_resource;
        let deadline = Instant::now() + wait.timeout();
        let local_path = self.locator.resource_path(resource_id);
        loop {
            self.check_cancelled()?;
            if local_path.is_file() {
                return Ok(Ok(RawSource::Local(local_path)));
            }
            match self.store.artifact_exists(raw_location) {
                Ok(true) => return Ok(Ok(RawSource::Remote(raw_location.clone()))),
                Ok(false) => {}
                Err(err) => return Ok(Err(err.into())),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Err(JobFailure::Unavailable(resource_id.clone())));
            }
            std::thread::sleep(wait.poll_interval().min(deadline - now));
        }
    }

    fn owning_package(&self, resource: &Resource) -> Result<Package, JobFailure> {
        self.catalog
            .package(&resource.package_id)?
            .ok_or_else(|| JobFailure::PackageMissing(resource.package_id.clone()))
    }

    fn already_condensed(
        &self,
        location: &ArtifactLocation,
        override_existing: bool,
    ) -> Result<bool, JobFailure> {
        if override_existing {
            return Ok(false);
        }
        let exists = self.store.artifact_exists(location)?;
        if exists {
            debug!(
                "event=condense module=condense status=skip reason=artifact_exists resource_id={}",
                location.resource_id
            );
        }
        Ok(exists)
    }

    fn scratch_path(&self, resource_id: &ResourceId) -> Result<PathBuf, JobFailure> {
        let dir = self.scratch_dir.get_or_try_init(|| {
            if let Some(dir) = &self.config.tmp_dir {
                match std::fs::create_dir_all(dir) {
                    Ok(()) => return Ok(dir.clone()),
                    Err(err) => warn!(
                        "event=scratch_dir module=condense status=fallback path={} error={}",
                        dir.display(),
                        err
                    ),
                }
            }
            tempfile::Builder::new()
                .prefix("dcserve_condense_")
                .tempdir()
                .map(|dir| dir.keep())
                .map_err(|source| JobFailure::Scratch {
                    path: std::env::temp_dir(),
                    source,
                })
        })?;
        Ok(dir.join(format!("{resource_id}_condensed.rtdc")))
    }

    fn check_cancelled(&self) -> Result<(), CondenseError> {
        if self.cancel.is_cancelled() {
            return Err(CondenseError::Cancelled);
        }
        Ok(())
    }

    fn report_failure(&self, resource_id: &ResourceId, failure: JobFailure) -> CondenseOutcome {
        error!(
            "event=condense module=condense status=error error_code={} resource_id={} error={}",
            failure.code(),
            resource_id,
            failure
        );
        CondenseOutcome::Failed {
            kind: failure.kind(),
            message: failure.to_string(),
        }
    }
}

fn remove_scratch(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(
            "event=scratch_cleanup module=condense status=error path={} error={}",
            path.display(),
            err
        ),
    }
}

/// Progress reported by `run_condense_batch`.
#[derive(Debug)]
pub enum BatchEvent<'a> {
    Checking {
        package: &'a Package,
        resource: &'a Resource,
    },
    Created {
        package: &'a Package,
        resource: &'a Resource,
    },
    Failed {
        package: &'a Package,
        resource: &'a Resource,
        kind: &'static str,
        message: String,
    },
}

/// Counts of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub checked: usize,
    pub created: usize,
    pub failed: usize,
}

/// Batch driver errors.
#[derive(Debug)]
pub enum BatchError {
    Cancelled,
    Catalog(CatalogError),
}

impl Display for BatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "batch cancelled"),
            Self::Catalog(err) => write!(f, "{err}"),
        }
    }
}

impl Error for BatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Cancelled => None,
            Self::Catalog(err) => Some(err),
        }
    }
}

impl From<CatalogError> for BatchError {
    fn from(value: CatalogError) -> Self {
        Self::Catalog(value)
    }
}

/// Condenses every resource of every package, without override.
///
/// Only packages modified at or after `modified_since` are visited when it
/// is given. A failing resource is reported and the batch continues;
/// cancellation stops it.
pub fn run_condense_batch(
    catalog: &dyn ResourceCatalog,
    engine: &CondensationEngine,
    modified_since: Option<DateTime<Utc>>,
    mut on_event: impl FnMut(BatchEvent<'_>),
) -> Result<BatchSummary, BatchError> {
    let mut summary = BatchSummary::default();
    let packages = catalog.packages()?;
    for package in packages.iter().filter(|package| {
        modified_since.map_or(true, |since| package.metadata_modified >= since)
    }) {
        for resource in &package.resources {
            summary.checked += 1;
            on_event(BatchEvent::Checking { package, resource });
            match engine.condense_outcome(resource, false) {
                Ok(CondenseOutcome::Created) => {
                    summary.created += 1;
                    on_event(BatchEvent::Created { package, resource });
                }
                Ok(CondenseOutcome::Skipped) => {}
                Ok(CondenseOutcome::Failed { kind, message }) => {
                    summary.failed += 1;
                    on_event(BatchEvent::Failed {
                        package,
                        resource,
                        kind,
                        message,
                    });
                }
                Err(CondenseError::Cancelled) => {
                    warn!(
                        "event=condense_batch module=condense status=cancelled checked={}",
                        summary.checked
                    );
                    return Err(BatchError::Cancelled);
                }
                Err(err) => {
                    summary.failed += 1;
                    on_event(BatchEvent::Failed {
                        package,
                        resource,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        }
    }
    info!(
        "event=condense_batch module=condense status=ok checked={} created={} failed={}",
        summary.checked, summary.created, summary.failed
    );
    Ok(summary)
}
