//! Folder-prefix rewriting between source keys and destination paths.

/// Trims surrounding separators so `"docs/2024/"`, `"/docs/2024"` and `"docs/2024"` all mean
/// the same folder.
pub fn normalize_prefix(prefix: &str) -> &str {
    prefix.trim_matches('/')
}

/// Maps a source object key to its destination path.
///
/// The part of `object_path` under `source_prefix` is re-rooted under `dest_prefix`. Keys that
/// do not live under `source_prefix` are re-rooted unchanged.
pub fn map_destination_path(source_prefix: &str, dest_prefix: &str, object_path: &str) -> String {
    let source_prefix = normalize_prefix(source_prefix);
    let dest_prefix = normalize_prefix(dest_prefix);

    let relative = if source_prefix.is_empty() {
        object_path
    } else {
        object_path
            .strip_prefix(source_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(object_path)
    };
    let relative = relative.trim_start_matches('/');

    if dest_prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{dest_prefix}/{relative}")
    }
}

/// Joins a folder and a key relative to it, as the import feed needs.
pub fn join_prefix(prefix: &str, relative: &str) -> String {
    let prefix = normalize_prefix(prefix);
    let relative = relative.trim_start_matches('/');
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{prefix}/{relative}")
    }
}

/// The fixed prefix pair of one project.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathMapping {
    pub source_prefix: String,
    pub dest_prefix: String,
}

impl PathMapping {
    pub fn new(source_prefix: impl Into<String>, dest_prefix: impl Into<String>) -> Self {
        Self {
            source_prefix: source_prefix.into(),
            dest_prefix: dest_prefix.into(),
        }
    }

    /// Keys land at the same path on the destination.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn destination_path(&self, object_path: &str) -> String {
        map_destination_path(&self.source_prefix, &self.dest_prefix, object_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefixes_keep_key() {
        assert_eq!(map_destination_path("", "", "a/b.txt"), "a/b.txt");
    }

    #[test]
    fn strips_source_folder() {
        assert_eq!(
            map_destination_path("documents/2024", "", "documents/2024/q1/report.pdf"),
            "q1/report.pdf"
        );
        assert_eq!(
            map_destination_path("documents/2024/", "", "documents/2024/report.pdf"),
            "report.pdf"
        );
    }

    #[test]
    fn re_roots_under_destination_folder() {
        assert_eq!(
            map_destination_path("documents/2024", "archive", "documents/2024/q1/report.pdf"),
            "archive/q1/report.pdf"
        );
    }

    #[test]
    fn same_prefix_on_both_sides_is_identity() {
        let mapping = PathMapping::new("docs", "docs");
        assert_eq!(mapping.destination_path("docs/a.txt"), "docs/a.txt");
    }

    #[test]
    fn does_not_strip_partial_segment() {
        assert_eq!(
            map_destination_path("doc", "", "documents/a.txt"),
            "documents/a.txt"
        );
    }

    #[test]
    fn join_handles_separators() {
        assert_eq!(join_prefix("docs/", "/a.txt"), "docs/a.txt");
        assert_eq!(join_prefix("", "a.txt"), "a.txt");
    }
}
