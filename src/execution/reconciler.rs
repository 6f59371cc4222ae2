//! Merges observed object listings into the catalog.
//!
//! Two flavors share one per-object step. A live pass refreshes entries whose fingerprint
//! changed; an import only ever adds entries for paths the catalog does not know yet. Each
//! object is applied as its own statement, so a pass that aborts keeps what it already wrote.

use crate::prelude::*;

use crate::execution::catalog::Catalog;
use crate::execution::stats::ReconcileStats;
use crate::ops::interface::{ObjectMetadata, ObjectSource, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    Live,
    /// Additive only: known paths are never touched, whatever their fingerprint.
    Import,
}

pub struct Reconciler<'a> {
    catalog: &'a Catalog,
    project: &'a str,
}

impl<'a> Reconciler<'a> {
    pub fn new(catalog: &'a Catalog, project: &'a str) -> Self {
        Self { catalog, project }
    }

    async fn apply(
        &self,
        object: &ObjectMetadata,
        mode: ReconcileMode,
        stats: &ReconcileStats,
    ) -> Result<()> {
        stats.num_observed.inc(1);
        match self.catalog.get_entry(self.project, &object.path).await? {
            None => {
                if self.catalog.insert_entry(self.project, object).await? {
                    trace!("new object {}", object.path);
                    stats.num_insertions.inc(1);
                } else {
                    // Inserted by someone else since the lookup.
                    stats.num_no_change.inc(1);
                }
            }
            Some(_) if mode == ReconcileMode::Import => {
                trace!("already tracked, import leaves it alone: {}", object.path);
                stats.num_skipped.inc(1);
            }
            Some(entry) if entry.fingerprint == object.fingerprint => {
                stats.num_no_change.inc(1);
            }
            Some(entry) => {
                if self.catalog.refresh_entry(entry.id, object).await? {
                    debug!(
                        "changed object {} ({} -> {}), back to pending",
                        object.path, entry.fingerprint, object.fingerprint
                    );
                    stats.num_updates.inc(1);
                } else {
                    stats.num_no_change.inc(1);
                }
            }
        }
        Ok(())
    }

    /// Enumerates `source` under `prefix` and merges every object into the catalog.
    ///
    /// An enumeration failure aborts the pass; entries merged before it stay committed.
    pub async fn reconcile_live(
        &self,
        source: &dyn ObjectSource,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let stats = ReconcileStats::default();
        let mut batches = source.list(prefix, cancel);
        loop {
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("reconciliation of `{}` cancelled: {stats}", self.project);
                    return Err(StorageError::Cancelled.into());
                }
                batch = batches.next() => batch,
            };
            let Some(batch) = batch else { break };
            let batch = match batch {
                Ok(batch) => batch,
                Err(err) => {
                    error!(
                        "listing of `{prefix}` failed, reconciliation of `{}` aborted after: {stats}",
                        self.project
                    );
                    return Err(err).with_context(|| format!("Failed to list source objects under `{prefix}`"));
                }
            };
            for object in batch.iter() {
                self.apply(object, ReconcileMode::Live, &stats).await?;
            }
            debug!("reconciled batch of {} objects", batch.len());
        }
        info!("reconciliation of `{}` done: {stats}", self.project);
        Ok(stats)
    }

    /// Adds every record the catalog does not know yet. Existing entries are left untouched.
    pub async fn import(
        &self,
        records: impl IntoIterator<Item = ObjectMetadata>,
        cancel: &CancellationToken,
    ) -> Result<ReconcileStats> {
        let stats = ReconcileStats::default();
        for record in records {
            if cancel.is_cancelled() {
                info!("import into `{}` cancelled: {stats}", self.project);
                return Err(StorageError::Cancelled.into());
            }
            self.apply(&record, ReconcileMode::Import, &stats).await?;
        }
        info!("import into `{}` done: {stats}", self.project);
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::catalog::CatalogStatus;
    use crate::ops::storages::memory::MemoryStore;

    async fn open_temp() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("files.db")).await.unwrap();
        (dir, catalog)
    }

    fn record(path: &str, fingerprint: &str) -> ObjectMetadata {
        ObjectMetadata {
            path: path.to_string(),
            size: 1,
            fingerprint: fingerprint.to_string(),
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn live_pass_is_idempotent() {
        let (_dir, catalog) = open_temp().await;
        let source = MemoryStore::new().with_list_batch_size(2);
        for (path, fp) in [("docs/a", "e1"), ("docs/b", "e2"), ("docs/c", "e3"), ("other/d", "e4")] {
            source.insert(path, "x", fp);
        }
        let reconciler = Reconciler::new(&catalog, "p");
        let cancel = CancellationToken::new();

        let first = reconciler.reconcile_live(&source, "docs/", &cancel).await.unwrap();
        assert_eq!(first.num_insertions.get(), 3);
        let second = reconciler.reconcile_live(&source, "docs/", &cancel).await.unwrap();
        assert_eq!(second.num_mutations(), 0);
        assert_eq!(second.num_no_change.get(), 3);
        assert!(catalog.get_entry("p", "other/d").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn changed_fingerprint_resets_to_pending() {
        let (_dir, catalog) = open_temp().await;
        let source = MemoryStore::new();
        source.insert("a", "x", "e1");
        let reconciler = Reconciler::new(&catalog, "p");
        let cancel = CancellationToken::new();
        reconciler.reconcile_live(&source, "", &cancel).await.unwrap();

        let id = catalog.get_entry("p", "a").await.unwrap().unwrap().id;
        catalog
            .transition_status(id, &[CatalogStatus::Pending], CatalogStatus::Completed, None)
            .await
            .unwrap();

        source.insert("a", "xyz", "e1b");
        let stats = reconciler.reconcile_live(&source, "", &cancel).await.unwrap();
        assert_eq!(stats.num_updates.get(), 1);
        let entry = catalog.get_entry_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.status, CatalogStatus::Pending);
        assert_eq!(entry.size, 3);
        assert_eq!(entry.fingerprint, "e1b");
    }

    #[tokio::test]
    async fn cancelled_pass_stops_early() {
        let (_dir, catalog) = open_temp().await;
        let source = MemoryStore::new();
        source.insert("a", "x", "e1");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = Reconciler::new(&catalog, "p")
            .reconcile_live(&source, "", &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<StorageError>(), Some(&StorageError::Cancelled));
        assert!(catalog.get_entry("p", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn import_only_adds() {
        let (_dir, catalog) = open_temp().await;
        let reconciler = Reconciler::new(&catalog, "p");
        let cancel = CancellationToken::new();
        reconciler.import(vec![record("a", "e1")], &cancel).await.unwrap();

        let stats = reconciler
            .import(vec![record("a", "changed"), record("b", "e2")], &cancel)
            .await
            .unwrap();
        assert_eq!(stats.num_insertions.get(), 1);
        assert_eq!(stats.num_skipped.get(), 1);
        assert_eq!(catalog.get_entry("p", "a").await.unwrap().unwrap().fingerprint, "e1");
    }
}
