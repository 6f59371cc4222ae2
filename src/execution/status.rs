//! Status Reporter: read-only views over a project's catalog.

use crate::prelude::*;

use crate::execution::catalog::{Catalog, CatalogEntry, StatusCount};

pub const DEFAULT_RECENT_ERRORS: usize = 10;

pub async fn status_counts(catalog: &Catalog, project: &str) -> Result<Vec<StatusCount>> {
    catalog.status_counts(project).await
}

pub async fn recent_errors(
    catalog: &Catalog,
    project: &str,
    limit: usize,
) -> Result<Vec<CatalogEntry>> {
    catalog.recent_errors(project, limit).await
}

/// Logs the status distribution of `project`. Failures are only logged, since this runs after
/// the work it reports on is already done.
pub async fn log_status_distribution(catalog: &Catalog, project: &str) {
    match catalog.status_counts(project).await {
        Ok(counts) => {
            info!("status distribution of `{project}`:");
            for count in counts {
                info!(
                    "  {:<10} {:>10} objects {:>12}",
                    count.status.as_str(),
                    count.count,
                    human_size(count.total_size)
                );
            }
        }
        Err(err) => warn!("failed to read status distribution of `{project}`: {err:#}"),
    }
}

/// Formats a byte count with binary units, e.g. `1.5 MiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
