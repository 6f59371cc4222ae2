use crate::prelude::*;

use crate::ops::path_mapping::{PathMapping, normalize_prefix};
use crate::ops::storages::object_store::{
    DEFAULT_MULTIPART_THRESHOLD, DEFAULT_PART_SIZE, TransferOptions,
};
use crate::utils::retryable::RetryOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "projects/config.yaml";
pub const ENV_PREFIX: &str = "BUCKETSYNC";
pub const CATALOG_FILE_NAME: &str = "files.db";

fn default_retry_attempts() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_multipart_threshold() -> u64 {
    DEFAULT_MULTIPART_THRESHOLD
}

fn default_part_size() -> u64 {
    DEFAULT_PART_SIZE
}

fn default_workers() -> usize {
    5
}

fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: u64,
    #[serde(default = "default_part_size")]
    pub multipart_part_size_bytes: u64,
    #[serde(default = "default_workers")]
    pub default_workers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay_secs(),
            multipart_threshold_bytes: default_multipart_threshold(),
            multipart_part_size_bytes: default_part_size(),
            default_workers: default_workers(),
        }
    }
}

impl EngineSettings {
    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions::fixed(
            self.retry_attempts,
            Duration::from_secs(self.retry_delay_secs),
        )
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            retry: self.retry_options(),
            multipart_threshold: self.multipart_threshold_bytes,
            part_size: self.multipart_part_size_bytes,
        }
    }
}

/// Connection to one bucket of an S3-compatible store.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub use_ssl: bool,
    pub bucket: String,
    /// Folder inside the bucket; empty means the whole bucket.
    #[serde(default)]
    pub folder_path: String,
    #[serde(default = "default_region")]
    pub region: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DestinationSettings {
    ObjectStore(ObjectStoreSettings),
    LocalPath { path: PathBuf },
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub source: ObjectStoreSettings,
    pub destination: DestinationSettings,
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
}

impl ProjectSettings {
    /// How source keys become destination paths. Object-store destinations without a folder
    /// of their own keep source keys unchanged; local destinations are rooted at the source
    /// folder.
    pub fn path_mapping(&self) -> PathMapping {
        let source_prefix = normalize_prefix(&self.source.folder_path);
        let dest_prefix = match &self.destination {
            DestinationSettings::ObjectStore(dest) if !normalize_prefix(&dest.folder_path).is_empty() => {
                normalize_prefix(&dest.folder_path)
            }
            DestinationSettings::ObjectStore(_) => source_prefix,
            DestinationSettings::LocalPath { .. } => "",
        };
        PathMapping::new(source_prefix, dest_prefix)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSettings>,
    /// Directory holding the configuration file; default catalogs live below it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Settings {
    /// Loads `path` (a missing file means no projects), then applies `BUCKETSYNC__...`
    /// environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration `{}`", path.display()))?;
        let mut settings: Settings = config
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in `{}`", path.display()))?;
        settings.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!(
            "loaded {} projects from {}",
            settings.projects.len(),
            path.display()
        );
        Ok(settings)
    }

    pub fn project(&self, name: &str) -> Result<&ProjectSettings> {
        self.projects.get(name).ok_or_else(|| {
            anyhow!(
                "project `{name}` is not configured (known: {})",
                self.projects.keys().cloned().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn catalog_path(&self, name: &str) -> Result<PathBuf> {
        let project = self.project(name)?;
        Ok(project
            .catalog_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join(name).join(CATALOG_FILE_NAME)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
engine:
  retry_attempts: 4
projects:
  backup:
    source:
      endpoint: minio:9000
      access_key_id: key
      secret_access_key: secret
      bucket: src
      folder_path: documents/2024/
    destination:
      kind: local_path
      path: /data/backup
  mirror:
    source:
      endpoint: minio:9000
      access_key_id: key
      secret_access_key: secret
      bucket: src
      folder_path: documents
    destination:
      kind: object_store
      endpoint: https://other:9000
      access_key_id: key2
      secret_access_key: secret2
      use_ssl: true
      bucket: dst
    catalog_path: /var/lib/bucketsync/mirror.db
"#;

    fn load(text: &str) -> Settings {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, text).unwrap();
        let mut settings = Settings::load(&path).unwrap();
        settings.base_dir = PathBuf::from("/etc/bucketsync");
        settings
    }

    #[test]
    fn loads_projects_with_defaults() {
        let settings = load(CONFIG);
        assert_eq!(settings.engine.retry_attempts, 4);
        assert_eq!(settings.engine.retry_delay_secs, 5);
        assert_eq!(settings.engine.default_workers, 5);

        let backup = settings.project("backup").unwrap();
        assert_eq!(backup.source.region, "us-east-1");
        assert!(!backup.source.use_ssl);
        assert_eq!(
            backup.destination,
            DestinationSettings::LocalPath {
                path: PathBuf::from("/data/backup")
            }
        );
        assert_eq!(
            settings.catalog_path("backup").unwrap(),
            PathBuf::from("/etc/bucketsync/backup/files.db")
        );
        assert_eq!(
            settings.catalog_path("mirror").unwrap(),
            PathBuf::from("/var/lib/bucketsync/mirror.db")
        );
        assert!(settings.project("nope").is_err());
    }

    #[test]
    fn path_mapping_follows_destination_kind() {
        let settings = load(CONFIG);
        let backup = settings.project("backup").unwrap();
        assert_eq!(
            backup.path_mapping().destination_path("documents/2024/q1/a.pdf"),
            "q1/a.pdf"
        );

        let mirror = settings.project("mirror").unwrap();
        assert_eq!(
            mirror.path_mapping().destination_path("documents/a.pdf"),
            "documents/a.pdf"
        );
    }

    #[test]
    fn missing_file_means_no_projects() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(&dir.path().join("absent.yaml")).unwrap();
        assert!(settings.projects.is_empty());
        assert_eq!(settings.engine, EngineSettings::default());
    }
}
