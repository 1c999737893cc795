//! Workspace discovery: where instigators come from.
//!
//! A workspace is a set of locations, each either loaded (repositories of
//! instigators) or failed to load. The daemon takes a fresh snapshot on every
//! iteration.
//!
//! `YamlWorkspace` reads one file per location from a directory:
//!
//! ```yaml
//! # <workspace>/analytics.yaml  (location "analytics")
//! repositories:
//!   - name: main
//!     sensors:
//!       - name: new_files
//!         min_interval_seconds: 30
//!         default_status: running
//!         job_name: ingest
//!         tags: { team: data }
//!         command: ["./sensors/new_files.sh"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::RwLock;

use crate::domain::{DefaultSensorStatus, Instigator, InstigatorOrigin};

/// A loaded repository
#[derive(Debug, Clone, PartialEq)]
pub struct Repository {
    pub name: String,
    pub instigators: Vec<Instigator>,
}

/// One location of the workspace
#[derive(Debug, Clone, PartialEq)]
pub struct LocationEntry {
    pub name: String,
    pub repositories: Vec<Repository>,
    /// Set when the location could not be loaded
    pub load_error: Option<String>,
}

impl LocationEntry {
    pub fn loaded(name: impl Into<String>, repositories: Vec<Repository>) -> Self {
        Self {
            name: name.into(),
            repositories,
            load_error: None,
        }
    }

    pub fn failed(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            repositories: Vec::new(),
            load_error: Some(error.into()),
        }
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

/// Point-in-time view of every location
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspaceSnapshot {
    pub locations: Vec<LocationEntry>,
}

impl WorkspaceSnapshot {
    pub fn new(locations: Vec<LocationEntry>) -> Self {
        Self { locations }
    }

    /// Snapshot with a single location holding a single repository
    pub fn single(origin: &InstigatorOrigin, instigators: Vec<Instigator>) -> Self {
        Self::new(vec![LocationEntry::loaded(
            origin.location_name.clone(),
            vec![Repository {
                name: origin.repository_name.clone(),
                instigators,
            }],
        )])
    }

    pub fn location(&self, name: &str) -> Option<&LocationEntry> {
        self.locations.iter().find(|l| l.name == name)
    }

    /// Every instigator of every loaded location
    pub fn instigators(&self) -> impl Iterator<Item = &Instigator> {
        self.locations
            .iter()
            .flat_map(|l| l.repositories.iter())
            .flat_map(|r| r.instigators.iter())
    }
}

/// Source of workspace snapshots
#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    async fn snapshot(&self) -> Result<WorkspaceSnapshot>;
}

/// Workspace held in memory and swapped explicitly
#[derive(Debug, Default)]
pub struct StaticWorkspace {
    snapshot: RwLock<WorkspaceSnapshot>,
}

impl StaticWorkspace {
    pub fn new(snapshot: WorkspaceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
        }
    }

    pub async fn set(&self, snapshot: WorkspaceSnapshot) {
        *self.snapshot.write().await = snapshot;
    }
}

#[async_trait]
impl WorkspaceSource for StaticWorkspace {
    async fn snapshot(&self) -> Result<WorkspaceSnapshot> {
        Ok(self.snapshot.read().await.clone())
    }
}

#[derive(Debug, Deserialize)]
struct LocationFile {
    #[serde(default)]
    repositories: Vec<RepositoryFile>,
}

#[derive(Debug, Deserialize)]
struct RepositoryFile {
    name: String,
    #[serde(default)]
    sensors: Vec<SensorFile>,
}

#[derive(Debug, Deserialize)]
struct SensorFile {
    name: String,
    #[serde(default)]
    min_interval_seconds: Option<u64>,
    #[serde(default)]
    default_status: DefaultSensorStatus,
    #[serde(default)]
    job_name: Option<String>,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    command: Vec<String>,
}

impl SensorFile {
    fn into_instigator(self, origin: InstigatorOrigin) -> Instigator {
        Instigator {
            name: self.name,
            origin,
            min_interval_seconds: self.min_interval_seconds,
            default_status: self.default_status,
            job_name: self.job_name,
            tags: self.tags,
            command: self.command,
        }
    }
}

/// Workspace read from a directory of YAML location files
pub struct YamlWorkspace {
    dir: PathBuf,
}

impl YamlWorkspace {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn load_location(name: &str, path: &Path) -> Result<Vec<Repository>> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read location file: {}", path.display()))?;
        let file: LocationFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse location file: {}", path.display()))?;

        Ok(file
            .repositories
            .into_iter()
            .map(|repo| {
                let origin = InstigatorOrigin::new(name, &repo.name);
                Repository {
                    instigators: repo
                        .sensors
                        .into_iter()
                        .map(|s| s.into_instigator(origin.clone()))
                        .collect(),
                    name: repo.name,
                }
            })
            .collect())
    }
}

#[async_trait]
impl WorkspaceSource for YamlWorkspace {
    async fn snapshot(&self) -> Result<WorkspaceSnapshot> {
        if !self.dir.exists() {
            return Ok(WorkspaceSnapshot::default());
        }

        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to read workspace: {}", self.dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_yaml = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            );
            if !is_yaml {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push((stem.to_string(), path.clone()));
            }
        }
        files.sort();

        let mut locations = Vec::with_capacity(files.len());
        for (name, path) in files {
            let entry = match Self::load_location(&name, &path).await {
                Ok(repositories) => LocationEntry::loaded(name, repositories),
                Err(e) => LocationEntry::failed(name, format!("{:#}", e)),
            };
            locations.push(entry);
        }
        Ok(WorkspaceSnapshot::new(locations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_yaml_workspace_loads_locations() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("analytics.yaml"),
            r#"
repositories:
  - name: main
    sensors:
      - name: new_files
        min_interval_seconds: 30
        default_status: running
        job_name: ingest
        command: ["echo"]
      - name: stale
"#,
        )
        .unwrap();
        std::fs::write(temp.path().join("broken.yaml"), "repositories: [oops").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let snapshot = YamlWorkspace::new(temp.path()).snapshot().await.unwrap();
        assert_eq!(snapshot.locations.len(), 2);

        let analytics = snapshot.location("analytics").unwrap();
        assert!(analytics.load_error.is_none());
        let repo = analytics.repository("main").unwrap();
        assert_eq!(repo.instigators.len(), 2);
        assert_eq!(repo.instigators[0].min_interval_seconds, Some(30));
        assert_eq!(repo.instigators[0].default_status, DefaultSensorStatus::Running);
        assert_eq!(repo.instigators[0].origin, InstigatorOrigin::new("analytics", "main"));
        assert_eq!(repo.instigators[1].default_status, DefaultSensorStatus::Stopped);

        let broken = snapshot.location("broken").unwrap();
        assert!(broken.load_error.is_some());
        assert_eq!(snapshot.instigators().count(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let temp = TempDir::new().unwrap();
        let snapshot = YamlWorkspace::new(temp.path().join("nope"))
            .snapshot()
            .await
            .unwrap();
        assert!(snapshot.locations.is_empty());
    }
}
