//! On-disk layout of a store root
//!
//! ```text
//! <root>/config.json              engine configuration
//! <root>/index.json               owners and per-instance lock state
//! <root>/instances/<id>.snapshot  packed snapshot per workflow instance
//! ```
//!
//! Every file is replaced through a sibling `.tmp` file, synced and renamed
//! into place, so a crash leaves either the old or the new contents.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::EngineConfig;
use super::instance::WorkflowInstanceId;

const SNAPSHOT_EXTENSION: &str = "snapshot";
const TEMP_EXTENSION: &str = "tmp";

/// Paths and file operations for one store root
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    /// Layout rooted at `root`; nothing is touched on disk
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Store root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Engine configuration file
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Owner and lock index
    pub fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Directory holding one snapshot per instance
    pub fn instances_dir(&self) -> PathBuf {
        self.root.join("instances")
    }

    /// Snapshot file of one instance
    pub fn snapshot_path(&self, instance: WorkflowInstanceId) -> PathBuf {
        self.instances_dir()
            .join(format!("{}.{}", instance, SNAPSHOT_EXTENSION))
    }

    /// Create the directories and clear temp files left by interrupted writes
    pub fn init(&self) -> Result<()> {
        let instances = self.instances_dir();
        fs::create_dir_all(&instances)
            .with_context(|| format!("Failed to create directory: {:?}", instances))?;

        let stale = self.stale_temp_files()?;
        for path in &stale {
            fs::remove_file(path)
                .with_context(|| format!("Failed to remove stale temp file: {:?}", path))?;
        }
        if !stale.is_empty() {
            tracing::warn!(root = ?self.root, count = stale.len(), "removed interrupted writes");
        }
        Ok(())
    }

    fn stale_temp_files(&self) -> Result<Vec<PathBuf>> {
        let mut stale = Vec::new();
        for dir in [self.root.clone(), self.instances_dir()] {
            let entries = fs::read_dir(&dir)
                .with_context(|| format!("Failed to read directory: {:?}", dir))?;
            for entry in entries {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    stale.push(path);
                }
            }
        }
        Ok(stale)
    }

    /// Instances that have a snapshot on disk
    pub fn snapshot_ids(&self) -> Result<Vec<WorkflowInstanceId>> {
        let dir = self.instances_dir();
        let mut ids = Vec::new();
        let entries = fs::read_dir(&dir)
            .with_context(|| format!("Failed to read directory: {:?}", dir))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != SNAPSHOT_EXTENSION) {
                continue;
            }
            let parsed = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| uuid::Uuid::parse_str(stem).ok());
            if let Some(uuid) = parsed {
                ids.push(WorkflowInstanceId::from_uuid(uuid));
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Read a snapshot; `None` when the instance was never saved
    pub fn read_snapshot(&self, instance: WorkflowInstanceId) -> Result<Option<Vec<u8>>> {
        read_optional(&self.snapshot_path(instance))
    }

    /// Replace the snapshot of one instance
    pub fn write_snapshot(&self, instance: WorkflowInstanceId, bytes: &[u8]) -> Result<()> {
        write_atomic(&self.snapshot_path(instance), bytes)
    }

    /// Read a JSON document; `None` when the file does not exist
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match read_optional(path)? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("Failed to parse {:?}", path))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Replace a JSON document
    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value)
            .with_context(|| format!("Failed to serialize {:?}", path))?;
        write_atomic(path, &json)
    }
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read file: {:?}", path)),
    }
}

/// Write through a synced temp file, rename it over `path`, then sync the
/// directory so the rename itself survives a crash
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(TEMP_EXTENSION);

    let mut file = File::create(&temp_path)
        .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
    file.write_all(data).context("Failed to write data")?;
    file.sync_all().context("Failed to sync file")?;
    drop(file);

    fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    if let Some(parent) = path.parent() {
        OpenOptions::new()
            .read(true)
            .open(parent)
            .and_then(|dir| dir.sync_all())
            .with_context(|| format!("Failed to sync directory: {:?}", parent))?;
    }
    Ok(())
}

/// Create a store root and write its configuration
pub fn write_config(config: &EngineConfig) -> Result<()> {
    let layout = StoreLayout::new(config.root.clone());
    layout.init()?;
    layout.write_json(&layout.config_path(), config)
}

/// Load the configuration written by [`write_config`]
pub fn load_config(root: &Path) -> Result<EngineConfig> {
    let layout = StoreLayout::new(root);
    let path = layout.config_path();
    layout
        .read_json(&path)?
        .with_context(|| format!("No engine configuration at {:?}", path))
}
