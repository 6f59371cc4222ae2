//! One project's engine: its source, destination and catalog wired together behind the
//! operations the CLI exposes.

use crate::prelude::*;

use crate::execution::catalog::{Catalog, CatalogEntry, StatusCount};
use crate::execution::import_feed;
use crate::execution::reconciler::Reconciler;
use crate::execution::scheduler::{self, CopyContext, RunSummary};
use crate::execution::stats::ReconcileStats;
use crate::execution::status;
use crate::ops::interface::{ObjectDestination, ObjectMetadata, ObjectSource};
use crate::ops::path_mapping::{PathMapping, normalize_prefix};
use crate::ops::storages::local_fs::LocalFsDestination;
use crate::ops::storages::object_store::S3Store;
use crate::settings::{DestinationSettings, Settings};
use std::path::Path;

/// A copy run that left entries in `error`, or was cancelled before finishing.
#[derive(Debug, thiserror::Error)]
#[error("copy run for `{project}` did not complete: {summary}")]
pub struct RunFailed {
    pub project: String,
    pub summary: RunSummary,
}

pub struct SyncService {
    project: String,
    catalog: Catalog,
    source: Arc<dyn ObjectSource>,
    destination: Arc<dyn ObjectDestination>,
    mapping: PathMapping,
    source_folder: String,
    default_workers: usize,
}

impl SyncService {
    /// Connects the adapters and opens the catalog of project `name`.
    pub async fn open(settings: &Settings, name: &str) -> Result<Self> {
        let project = settings.project(name)?;
        let transfer = settings.engine.transfer_options();

        let source = S3Store::connect(&project.source, transfer.clone())
            .await
            .with_context(|| format!("Failed to set up source of `{name}`"))?;
        let destination: Arc<dyn ObjectDestination> = match &project.destination {
            DestinationSettings::ObjectStore(dest) => Arc::new(
                S3Store::connect(dest, transfer)
                    .await
                    .with_context(|| format!("Failed to set up destination of `{name}`"))?,
            ),
            DestinationSettings::LocalPath { path } => {
                Arc::new(
                    LocalFsDestination::new(path)
                        .await?
                        .with_retry_options(settings.engine.retry_options()),
                )
            }
        };
        let catalog = Catalog::open(&settings.catalog_path(name)?).await?;

        Ok(Self::from_parts(name, catalog, Arc::new(source), destination)
            .with_source_folder(&project.source.folder_path)
            .with_path_mapping(project.path_mapping())
            .with_default_workers(settings.engine.default_workers))
    }

    /// Wires already constructed parts. Keys map unchanged and the whole source is listed
    /// until configured otherwise.
    pub fn from_parts(
        project: impl Into<String>,
        catalog: Catalog,
        source: Arc<dyn ObjectSource>,
        destination: Arc<dyn ObjectDestination>,
    ) -> Self {
        Self {
            project: project.into(),
            catalog,
            source,
            destination,
            mapping: PathMapping::identity(),
            source_folder: String::new(),
            default_workers: 5,
        }
    }

    pub fn with_source_folder(mut self, folder: &str) -> Self {
        self.source_folder = normalize_prefix(folder).to_string();
        self
    }

    pub fn with_path_mapping(mut self, mapping: PathMapping) -> Self {
        self.mapping = mapping;
        self
    }

    pub fn with_default_workers(mut self, workers: usize) -> Self {
        self.default_workers = workers;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn default_workers(&self) -> usize {
        self.default_workers
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    fn listing_prefix(&self) -> String {
        if self.source_folder.is_empty() {
            String::new()
        } else {
            format!("{}/", self.source_folder)
        }
    }

    /// Merges a live listing of the source into the catalog.
    #[instrument(skip_all, fields(project = %self.project))]
    pub async fn reconcile(&self, cancel: &CancellationToken) -> Result<ReconcileStats> {
        let prefix = self.listing_prefix();
        let stats = Reconciler::new(&self.catalog, &self.project)
            .reconcile_live(self.source.as_ref(), &prefix, cancel)
            .await?;
        status::log_status_distribution(&self.catalog, &self.project).await;
        Ok(stats)
    }

    /// Adds `records` the catalog does not know yet; known paths are left as they are.
    #[instrument(skip_all, fields(project = %self.project))]
    pub async fn import_listing(
        &self,
        records: Vec<ObjectMetadata>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let stats = Reconciler::new(&self.catalog, &self.project)
            .import(records, cancel)
            .await?;
        status::log_status_distribution(&self.catalog, &self.project).await;
        Ok(stats)
    }

    /// Imports an `mc ls --json` listing whose keys are relative to the source folder.
    pub async fn import_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let listing = import_feed::read_listing_file(path, &self.source_folder).await?;
        let stats = self.import_listing(listing.records, cancel).await?;
        stats.num_malformed.inc(listing.num_malformed as i64);
        Ok(stats)
    }

    /// Copies every entry in `pending` or `error`. Fails with [`RunFailed`] if any entry ended
    /// in `error` or the run was cancelled.
    #[instrument(skip_all, fields(project = %self.project, workers = workers))]
    pub async fn run(&self, workers: usize, cancel: &CancellationToken) -> Result<RunSummary> {
        let ctx = Arc::new(CopyContext {
            project: self.project.clone(),
            catalog: self.catalog.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            mapping: self.mapping.clone(),
        });
        let summary = scheduler::run_copy(ctx, workers, cancel).await?;
        if !summary.is_success() {
            return Err(RunFailed {
                project: self.project.clone(),
                summary,
            }
            .into());
        }
        Ok(summary)
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        status::status_counts(&self.catalog, &self.project).await
    }

    pub async fn recent_errors(&self, limit: usize) -> Result<Vec<CatalogEntry>> {
        status::recent_errors(&self.catalog, &self.project, limit).await
    }
}
