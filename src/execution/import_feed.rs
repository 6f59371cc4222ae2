//! Parser for pre-captured listings in the JSON-lines format of `mc ls --json`.

use crate::prelude::*;

use crate::ops::interface::ObjectMetadata;
use crate::ops::path_mapping::join_prefix;
use std::path::Path;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListingLine {
    #[serde(rename = "type")]
    kind: String,
    last_modified: DateTime<Utc>,
    size: u64,
    key: String,
    #[serde(default)]
    etag: String,
}

#[derive(Debug, Default)]
pub struct ImportListing {
    pub records: Vec<ObjectMetadata>,
    /// Lines that were not valid listing records.
    pub num_malformed: usize,
    /// Valid lines for something other than a file (folders).
    pub num_ignored: usize,
}

/// Parses a listing whose keys are relative to `folder`. Malformed lines, including ones that
/// are not valid UTF-8, are skipped with a warning.
pub fn parse_listing(data: &[u8], folder: &str) -> ImportListing {
    let mut listing = ImportListing::default();
    for (idx, line) in data.split(|b| *b == b'\n').enumerate() {
        let line = match std::str::from_utf8(line) {
            Ok(line) => line.trim(),
            Err(e) => {
                warn!("skipping listing line {} with invalid UTF-8: {e}", idx + 1);
                listing.num_malformed += 1;
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        let parsed: ListingLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("skipping malformed listing line {}: {e}", idx + 1);
                listing.num_malformed += 1;
                continue;
            }
        };
        if parsed.kind != "file" {
            listing.num_ignored += 1;
            continue;
        }
        listing.records.push(ObjectMetadata {
            path: join_prefix(folder, &parsed.key),
            size: parsed.size,
            fingerprint: parsed.etag,
            last_modified: parsed.last_modified,
        });
    }
    listing
}

pub async fn read_listing_file(path: &Path, folder: &str) -> Result<ImportListing> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read import file `{}`", path.display()))?;
    let listing = parse_listing(&data, folder);
    info!(
        "read {} records from {} ({} malformed lines skipped)",
        listing.records.len(),
        path.display(),
        listing.num_malformed
    );
    Ok(listing)
}
