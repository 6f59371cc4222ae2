//! Catalog Store: one durable row per tracked source object.
//!
//! Every operation is a single independent statement, so any number of workers can share one
//! [`Catalog`]. Status changes made on behalf of the copy scheduler are compare-and-set: they
//! only apply when the row is still in one of the expected states.

use crate::prelude::*;

use crate::execution::catalog_setup::{CATALOG_TABLE, open_catalog_pool};
use crate::ops::interface::ObjectMetadata;
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogStatus {
    Pending,
    Copying,
    Completed,
    Exists,
    /// Reserved for objects that vanished at the source between listing and copy. Nothing
    /// produces it yet.
    NotFound,
    Error,
}

impl CatalogStatus {
    pub const ALL: [CatalogStatus; 6] = [
        CatalogStatus::Pending,
        CatalogStatus::Copying,
        CatalogStatus::Completed,
        CatalogStatus::Exists,
        CatalogStatus::NotFound,
        CatalogStatus::Error,
    ];

    /// States the copy scheduler picks up.
    pub const NEEDS_COPY: [CatalogStatus; 2] = [CatalogStatus::Pending, CatalogStatus::Error];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogStatus::Pending => "pending",
            CatalogStatus::Copying => "copying",
            CatalogStatus::Completed => "completed",
            CatalogStatus::Exists => "exists",
            CatalogStatus::NotFound => "not_found",
            CatalogStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for CatalogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        CatalogStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown catalog status `{s}`"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub project: String,
    pub path: String,
    pub size: u64,
    pub fingerprint: String,
    pub source_modified: DateTime<Utc>,
    pub status: CatalogStatus,
    pub error_message: Option<String>,
    /// The source object changed since it was last copied, so whatever sits at the
    /// destination is stale and gets overwritten.
    pub source_changed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct CatalogRow {
    id: i64,
    project: String,
    path: String,
    size: i64,
    fingerprint: String,
    source_modified_micros: i64,
    status: String,
    error_message: Option<String>,
    source_changed: i64,
    created_at_micros: i64,
    updated_at_micros: i64,
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

impl TryFrom<CatalogRow> for CatalogEntry {
    type Error = anyhow::Error;

    fn try_from(row: CatalogRow) -> Result<Self> {
        Ok(CatalogEntry {
            id: row.id,
            project: row.project,
            path: row.path,
            size: row.size.max(0) as u64,
            fingerprint: row.fingerprint,
            source_modified: from_micros(row.source_modified_micros),
            status: row.status.parse()?,
            error_message: row.error_message,
            source_changed: row.source_changed != 0,
            created_at: from_micros(row.created_at_micros),
            updated_at: from_micros(row.updated_at_micros),
        })
    }
}

/// One row of the status distribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: CatalogStatus,
    pub count: u64,
    pub total_size: u64,
}

const ENTRY_COLUMNS: &str = "id, project, path, size, fingerprint, source_modified_micros, \
     status, error_message, source_changed, created_at_micros, updated_at_micros";

#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            pool: open_catalog_pool(path).await?,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn get_entry(&self, project: &str, path: &str) -> Result<Option<CatalogEntry>> {
        let query =
            format!("SELECT {ENTRY_COLUMNS} FROM {CATALOG_TABLE} WHERE project = ? AND path = ?");
        let row: Option<CatalogRow> = sqlx::query_as(&query)
            .bind(project)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to look up catalog entry `{path}`"))?;
        row.map(CatalogEntry::try_from).transpose()
    }

    pub async fn get_entry_by_id(&self, id: i64) -> Result<Option<CatalogEntry>> {
        let query = format!("SELECT {ENTRY_COLUMNS} FROM {CATALOG_TABLE} WHERE id = ?");
        let row: Option<CatalogRow> = sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to look up catalog entry #{id}"))?;
        row.map(CatalogEntry::try_from).transpose()
    }

    /// Inserts a `pending` entry for `object`. Returns false (and changes nothing) when the
    /// project already tracks that path.
    pub async fn insert_entry(&self, project: &str, object: &ObjectMetadata) -> Result<bool> {
        let now = now_micros();
        let query = format!(
            "INSERT INTO {CATALOG_TABLE}
                (project, path, size, fingerprint, source_modified_micros, status, error_message,
                 created_at_micros, updated_at_micros)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?, ?)
             ON CONFLICT (project, path) DO NOTHING"
        );
        let result = sqlx::query(&query)
            .bind(project)
            .bind(&object.path)
            .bind(object.size as i64)
            .bind(&object.fingerprint)
            .bind(object.last_modified.timestamp_micros())
            .bind(CatalogStatus::Pending.as_str())
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to insert catalog entry `{}`", object.path))?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a changed source object: refreshes its metadata, puts it back to `pending`,
    /// clears any error and marks it `source_changed`. Does nothing if the stored fingerprint
    /// already matches.
    pub async fn refresh_entry(&self, id: i64, object: &ObjectMetadata) -> Result<bool> {
        let query = format!(
            "UPDATE {CATALOG_TABLE}
             SET size = ?, fingerprint = ?, source_modified_micros = ?, status = ?,
                 error_message = NULL, source_changed = 1, updated_at_micros = ?
             WHERE id = ? AND fingerprint <> ?"
        );
        let result = sqlx::query(&query)
            .bind(object.size as i64)
            .bind(&object.fingerprint)
            .bind(object.last_modified.timestamp_micros())
            .bind(CatalogStatus::Pending.as_str())
            .bind(now_micros())
            .bind(id)
            .bind(&object.fingerprint)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to refresh catalog entry `{}`", object.path))?;
        Ok(result.rows_affected() == 1)
    }

    /// Moves entry `id` to `to` if it is currently in one of `from`. Returns whether the row
    /// moved. The error message is kept only for the `error` state; reaching `completed`
    /// clears `source_changed`.
    pub async fn transition_status(
        &self,
        id: i64,
        from: &[CatalogStatus],
        to: CatalogStatus,
        error_message: Option<&str>,
    ) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let clear_changed = if to == CatalogStatus::Completed {
            ", source_changed = 0"
        } else {
            ""
        };
        let query = format!(
            "UPDATE {CATALOG_TABLE}
             SET status = ?, error_message = ?, updated_at_micros = ?{clear_changed}
             WHERE id = ? AND status IN ({placeholders})"
        );
        let error_message = if to == CatalogStatus::Error {
            error_message
        } else {
            None
        };
        let mut q = sqlx::query(&query)
            .bind(to.as_str())
            .bind(error_message)
            .bind(now_micros())
            .bind(id);
        for status in from {
            q = q.bind(status.as_str());
        }
        let result = q
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to set catalog entry #{id} to {to}"))?;
        Ok(result.rows_affected() == 1)
    }

    /// Puts entries an interrupted run left in `copying` back to `pending`.
    pub async fn reset_interrupted(&self, project: &str) -> Result<u64> {
        let query = format!(
            "UPDATE {CATALOG_TABLE}
             SET status = ?, error_message = NULL, updated_at_micros = ?
             WHERE project = ? AND status = ?"
        );
        let result = sqlx::query(&query)
            .bind(CatalogStatus::Pending.as_str())
            .bind(now_micros())
            .bind(project)
            .bind(CatalogStatus::Copying.as_str())
            .execute(&self.pool)
            .await
            .context("Failed to reset interrupted catalog entries")?;
        Ok(result.rows_affected())
    }

    /// Entries in `pending` or `error`, oldest first.
    pub async fn list_needing_copy(&self, project: &str) -> Result<Vec<CatalogEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM {CATALOG_TABLE}
             WHERE project = ? AND status IN (?, ?)
             ORDER BY created_at_micros, id"
        );
        let rows: Vec<CatalogRow> = sqlx::query_as(&query)
            .bind(project)
            .bind(CatalogStatus::Pending.as_str())
            .bind(CatalogStatus::Error.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list catalog entries needing copy")?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }

    /// Count and total size per status, ordered by status name.
    pub async fn status_counts(&self, project: &str) -> Result<Vec<StatusCount>> {
        let query = format!(
            "SELECT status, COUNT(*), COALESCE(SUM(size), 0) FROM {CATALOG_TABLE}
             WHERE project = ?
             GROUP BY status
             ORDER BY status"
        );
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&query)
            .bind(project)
            .fetch_all(&self.pool)
            .await
            .context("Failed to count catalog entries")?;
        rows.into_iter()
            .map(|(status, count, total_size)| {
                Ok(StatusCount {
                    status: status.parse()?,
                    count: count.max(0) as u64,
                    total_size: total_size.max(0) as u64,
                })
            })
            .collect()
    }

    /// Entries currently in `error`, most recently updated first.
    pub async fn recent_errors(&self, project: &str, limit: usize) -> Result<Vec<CatalogEntry>> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM {CATALOG_TABLE}
             WHERE project = ? AND status = ?
             ORDER BY updated_at_micros DESC, id DESC
             LIMIT ?"
        );
        let rows: Vec<CatalogRow> = sqlx::query_as(&query)
            .bind(project)
            .bind(CatalogStatus::Error.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list recent catalog errors")?;
        rows.into_iter().map(CatalogEntry::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open(&dir.path().join("files.db")).await.unwrap();
        (dir, catalog)
    }

    fn object(path: &str, size: u64, fingerprint: &str) -> ObjectMetadata {
        ObjectMetadata {
            path: path.to_string(),
            size,
            fingerprint: fingerprint.to_string(),
            last_modified: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn status_names_parse_back() {
        for status in CatalogStatus::ALL {
            assert_eq!(status.as_str().parse::<CatalogStatus>().unwrap(), status);
        }
        assert!("done".parse::<CatalogStatus>().is_err());
    }

    #[tokio::test]
    async fn insert_is_unique_per_project_and_path() {
        let (_dir, catalog) = open_temp().await;
        assert!(catalog.insert_entry("p", &object("a", 1, "e1")).await.unwrap());
        assert!(!catalog.insert_entry("p", &object("a", 2, "e2")).await.unwrap());
        assert!(catalog.insert_entry("other", &object("a", 1, "e1")).await.unwrap());

        let entry = catalog.get_entry("p", "a").await.unwrap().unwrap();
        assert_eq!(entry.size, 1);
        assert_eq!(entry.fingerprint, "e1");
        assert_eq!(entry.status, CatalogStatus::Pending);
        assert_eq!(entry.source_modified, object("a", 1, "e1").last_modified);
        assert!(!entry.source_changed);
        assert!(catalog.get_entry("p", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn refresh_only_applies_to_changed_fingerprint() {
        let (_dir, catalog) = open_temp().await;
        catalog.insert_entry("p", &object("a", 1, "e1")).await.unwrap();
        let entry = catalog.get_entry("p", "a").await.unwrap().unwrap();
        catalog
            .transition_status(entry.id, &[CatalogStatus::Pending], CatalogStatus::Error, Some("boom"))
            .await
            .unwrap();

        assert!(!catalog.refresh_entry(entry.id, &object("a", 1, "e1")).await.unwrap());
        assert!(catalog.refresh_entry(entry.id, &object("a", 5, "e1b")).await.unwrap());

        let entry = catalog.get_entry("p", "a").await.unwrap().unwrap();
        assert_eq!(entry.status, CatalogStatus::Pending);
        assert_eq!(entry.size, 5);
        assert_eq!(entry.fingerprint, "e1b");
        assert_eq!(entry.error_message, None);
        assert!(entry.source_changed);

        // Failing again keeps the mark; only a completed copy clears it.
        for to in [CatalogStatus::Copying, CatalogStatus::Error, CatalogStatus::Copying] {
            let from = [CatalogStatus::Pending, CatalogStatus::Copying, CatalogStatus::Error];
            assert!(catalog.transition_status(entry.id, &from, to, Some("x")).await.unwrap());
            assert!(catalog.get_entry_by_id(entry.id).await.unwrap().unwrap().source_changed);
        }
        catalog
            .transition_status(entry.id, &[CatalogStatus::Copying], CatalogStatus::Completed, None)
            .await
            .unwrap();
        assert!(!catalog.get_entry_by_id(entry.id).await.unwrap().unwrap().source_changed);
    }

    #[tokio::test]
    async fn transitions_are_compare_and_set() {
        let (_dir, catalog) = open_temp().await;
        catalog.insert_entry("p", &object("a", 1, "e1")).await.unwrap();
        let id = catalog.get_entry("p", "a").await.unwrap().unwrap().id;

        let claim = |id| {
            catalog.transition_status(id, &CatalogStatus::NEEDS_COPY, CatalogStatus::Copying, None)
        };
        assert!(claim(id).await.unwrap());
        assert!(!claim(id).await.unwrap());

        assert!(catalog
            .transition_status(id, &[CatalogStatus::Copying], CatalogStatus::Error, Some("denied"))
            .await
            .unwrap());
        let entry = catalog.get_entry_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.error_message.as_deref(), Some("denied"));

        assert!(claim(id).await.unwrap());
        assert!(catalog
            .transition_status(id, &[CatalogStatus::Copying], CatalogStatus::Completed, Some("ignored"))
            .await
            .unwrap());
        let entry = catalog.get_entry_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.status, CatalogStatus::Completed);
        assert_eq!(entry.error_message, None);
    }

    #[tokio::test]
    async fn interrupted_entries_go_back_to_pending() {
        let (_dir, catalog) = open_temp().await;
        catalog.insert_entry("p", &object("a", 1, "e1")).await.unwrap();
        let id = catalog.get_entry("p", "a").await.unwrap().unwrap().id;
        catalog
            .transition_status(id, &[CatalogStatus::Pending], CatalogStatus::Copying, None)
            .await
            .unwrap();

        assert_eq!(catalog.reset_interrupted("other").await.unwrap(), 0);
        assert_eq!(catalog.reset_interrupted("p").await.unwrap(), 1);
        let entry = catalog.get_entry_by_id(id).await.unwrap().unwrap();
        assert_eq!(entry.status, CatalogStatus::Pending);
    }

    #[tokio::test]
    async fn needing_copy_lists_pending_and_error_oldest_first() {
        let (_dir, catalog) = open_temp().await;
        for (path, fp) in [("a", "e1"), ("b", "e2"), ("c", "e3")] {
            catalog.insert_entry("p", &object(path, 1, fp)).await.unwrap();
        }
        let b = catalog.get_entry("p", "b").await.unwrap().unwrap();
        let c = catalog.get_entry("p", "c").await.unwrap().unwrap();
        catalog
            .transition_status(b.id, &[CatalogStatus::Pending], CatalogStatus::Completed, None)
            .await
            .unwrap();
        catalog
            .transition_status(c.id, &[CatalogStatus::Pending], CatalogStatus::Error, Some("x"))
            .await
            .unwrap();

        let paths: Vec<_> = catalog
            .list_needing_copy("p")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(paths, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn counts_and_recent_errors() {
        let (_dir, catalog) = open_temp().await;
        for (path, size) in [("a", 10), ("b", 20), ("c", 30)] {
            catalog.insert_entry("p", &object(path, size, "e")).await.unwrap();
        }
        for path in ["a", "b"] {
            let id = catalog.get_entry("p", path).await.unwrap().unwrap().id;
            catalog
                .transition_status(id, &[CatalogStatus::Pending], CatalogStatus::Error, Some(path))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let counts = catalog.status_counts("p").await.unwrap();
        assert_eq!(
            counts,
            vec![
                StatusCount {
                    status: CatalogStatus::Error,
                    count: 2,
                    total_size: 30
                },
                StatusCount {
                    status: CatalogStatus::Pending,
                    count: 1,
                    total_size: 30
                },
            ]
        );

        let errors = catalog.recent_errors("p", 10).await.unwrap();
        let paths: Vec<_> = errors.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "a"]);
        assert_eq!(catalog.recent_errors("p", 1).await.unwrap().len(), 1);
        assert!(catalog.status_counts("empty").await.unwrap().is_empty());
    }
}
