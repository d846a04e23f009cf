//! Backup catalog - `backups.json` management
//!
//! The catalog is a single JSON array rewritten as a whole on every mutation.
//! Mutations are serialized through one async mutex so two writers can never
//! interleave their read-modify-write cycles; reads go straight to disk since
//! writes land through an atomic rename.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use uuid::Uuid;

/// One backup artifact's metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub protected: bool,
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn new(id: Uuid, name: Option<String>, protected: bool) -> Self {
        Self {
            id,
            name,
            protected,
            created_at: Utc::now(),
        }
    }

    /// File name of this record's artifact inside the backup directory.
    pub fn artifact_name(&self) -> String {
        artifact_file_name(&self.id.to_string())
    }
}

pub const ARTIFACT_SUFFIX: &str = ".tar.gz";

pub fn artifact_file_name(id: &str) -> String {
    format!("{}{}", id, ARTIFACT_SUFFIX)
}

/// Identifier an artifact file name stands for (`<id>.tar.gz` -> `<id>`).
pub fn artifact_id(file_name: &str) -> &str {
    file_name.strip_suffix(ARTIFACT_SUFFIX).unwrap_or(file_name)
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("Catalog I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backup '{0}' not found")]
    NotFound(Uuid),
}

pub struct BackupCatalog {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl BackupCatalog {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// All records in stored order. A missing file reads as empty.
    pub async fn load(&self) -> Result<Vec<BackupRecord>, CatalogError> {
        let content = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    /// All records, newest first.
    pub async fn list_newest_first(&self) -> Result<Vec<BackupRecord>, CatalogError> {
        let mut records = self.load().await?;
        sort_newest_first(&mut records);
        Ok(records)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<BackupRecord>, CatalogError> {
        Ok(self.load().await?.into_iter().find(|r| r.id == id))
    }

    pub async fn append(&self, record: BackupRecord) -> Result<(), CatalogError> {
        self.mutate(move |records| {
            records.push(record);
            Ok(())
        })
        .await
    }

    pub async fn remove(&self, id: Uuid) -> Result<BackupRecord, CatalogError> {
        self.mutate(move |records| {
            let pos = records
                .iter()
                .position(|r| r.id == id)
                .ok_or(CatalogError::NotFound(id))?;
            Ok(records.remove(pos))
        })
        .await
    }

    pub async fn set_name(&self, id: Uuid, name: Option<String>) -> Result<BackupRecord, CatalogError> {
        self.update(id, move |r| r.name = name).await
    }

    pub async fn set_protected(&self, id: Uuid, protected: bool) -> Result<BackupRecord, CatalogError> {
        self.update(id, move |r| r.protected = protected).await
    }

    async fn update<F>(&self, id: Uuid, apply: F) -> Result<BackupRecord, CatalogError>
    where
        F: FnOnce(&mut BackupRecord),
    {
        self.mutate(move |records| {
            let record = records
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or(CatalogError::NotFound(id))?;
            apply(record);
            Ok(record.clone())
        })
        .await
    }

    /// Read, modify and rewrite the whole catalog while holding the write lock.
    /// Nothing is written when `f` fails.
    async fn mutate<T, F>(&self, f: F) -> Result<T, CatalogError>
    where
        F: FnOnce(&mut Vec<BackupRecord>) -> Result<T, CatalogError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        let out = f(&mut records)?;
        self.save(&records).await?;
        Ok(out)
    }

    async fn save(&self, records: &[BackupRecord]) -> Result<(), CatalogError> {
        let content = serde_json::to_string_pretty(records)?;
        let mut tmp = self.file_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.file_path).await?;
        tracing::debug!("Saved {} backup records", records.len());
        Ok(())
    }
}

pub fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}
