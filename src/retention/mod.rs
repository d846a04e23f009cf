//! Backup retention and orphan cleanup.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{artifact_id, sort_newest_first, BackupCatalog, BackupRecord, CatalogError};

/// Pause between two deletions of a sweep.
pub const DEFAULT_DELETION_DELAY: Duration = Duration::from_millis(100);

#[derive(thiserror::Error, Debug)]
pub enum RetentionError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Backup directory I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Catalog {0} does not exist, refusing to treat every backup as an orphan")]
    CatalogMissing(PathBuf),

    #[error("Retention sweep stopped after deleting {deleted} backups: {source}")]
    Interrupted {
        deleted: usize,
        #[source]
        source: Box<RetentionError>,
    },
}

impl RetentionError {
    /// Backups already deleted when the sweep failed.
    pub fn deleted(&self) -> usize {
        match self {
            RetentionError::Interrupted { deleted, .. } => *deleted,
            _ => 0,
        }
    }
}

pub struct BackupRetentionManager {
    catalog: Arc<BackupCatalog>,
    backup_dir: PathBuf,
    retention: usize,
    deletion_delay: Duration,
}

impl BackupRetentionManager {
    pub fn new(catalog: Arc<BackupCatalog>, backup_dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            catalog,
            backup_dir: backup_dir.into(),
            retention,
            deletion_delay: DEFAULT_DELETION_DELAY,
        }
    }

    pub fn with_deletion_delay(mut self, delay: Duration) -> Self {
        self.deletion_delay = delay;
        self
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Delete every unprotected backup beyond the `retention` newest ones,
    /// artifact first, then its record. Each record removal is its own
    /// catalog rewrite. Returns the number deleted; a failure part way
    /// through is [`RetentionError::Interrupted`] carrying the count so far.
    pub async fn enforce(&self) -> Result<usize, RetentionError> {
        let mut unprotected: Vec<BackupRecord> = self
            .catalog
            .load()
            .await?
            .into_iter()
            .filter(|r| !r.protected)
            .collect();

        if unprotected.len() <= self.retention {
            return Ok(0);
        }

        sort_newest_first(&mut unprotected);
        let extras = unprotected.split_off(self.retention);

        let mut deleted = 0;
        match self.sweep(extras, &mut deleted).await {
            Ok(()) => Ok(deleted),
            Err(e) => Err(RetentionError::Interrupted {
                deleted,
                source: Box::new(e),
            }),
        }
    }

    async fn sweep(&self, extras: Vec<BackupRecord>, deleted: &mut usize) -> Result<(), RetentionError> {
        for record in extras {
            // Protected or removed since the snapshot was taken.
            match self.catalog.get(record.id).await? {
                Some(current) if !current.protected => {}
                _ => continue,
            }

            remove_artifact(&self.backup_dir.join(record.artifact_name())).await?;
            match self.catalog.remove(record.id).await {
                Ok(_) | Err(CatalogError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            *deleted += 1;
            tracing::debug!("Deleted old backup {}", record.id);

            tokio::time::sleep(self.deletion_delay).await;
        }
        Ok(())
    }

    /// Delete artifact files that no catalog record points at. Records without
    /// an artifact are left alone. Without a catalog file nothing is known,
    /// so the sweep is refused instead of deleting everything.
    pub async fn reconcile_orphans(&self) -> Result<usize, RetentionError> {
        if !tokio::fs::try_exists(self.catalog.path()).await? {
            return Err(RetentionError::CatalogMissing(self.catalog.path().to_path_buf()));
        }
        let known: HashSet<String> = self
            .catalog
            .load()
            .await?
            .iter()
            .map(|r| r.id.to_string())
            .collect();

        let mut deleted = 0;
        let mut entries = tokio::fs::read_dir(&self.backup_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                tracing::debug!("Skipping non-file entry {}", entry.path().display());
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if known.contains(artifact_id(&file_name)) {
                continue;
            }
            tokio::fs::remove_file(entry.path()).await?;
            deleted += 1;
        }

        if deleted > 0 {
            tracing::warn!("Deleted {} hanged backups.", deleted);
        }
        Ok(deleted)
    }
}

/// Remove an artifact; a file that is already gone only earns a warning.
pub async fn remove_artifact(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Backup artifact {} was already missing", path.display());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    struct Fixture {
        _dir: tempfile::TempDir,
        backup_dir: PathBuf,
        catalog: Arc<BackupCatalog>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let backup_dir = dir.path().join("backups");
            std::fs::create_dir_all(&backup_dir).unwrap();
            let catalog = Arc::new(BackupCatalog::new(dir.path().join("backups.json")));
            Self { _dir: dir, backup_dir, catalog }
        }

        async fn add(&self, minute: u32, protected: bool) -> BackupRecord {
            let record = BackupRecord {
                id: Uuid::new_v4(),
                name: None,
                protected,
                created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            };
            std::fs::write(self.backup_dir.join(record.artifact_name()), b"tarball").unwrap();
            self.catalog.append(record.clone()).await.unwrap();
            record
        }

        fn manager(&self, retention: usize) -> BackupRetentionManager {
            BackupRetentionManager::new(self.catalog.clone(), &self.backup_dir, retention)
                .with_deletion_delay(Duration::from_millis(1))
        }

        fn has_artifact(&self, record: &BackupRecord) -> bool {
            self.backup_dir.join(record.artifact_name()).exists()
        }
    }

    #[tokio::test]
    async fn test_enforce_deletes_oldest_surplus() {
        let fx = Fixture::new();
        // inserted out of order on purpose
        let m3 = fx.add(3, false).await;
        let m1 = fx.add(1, false).await;
        let m4 = fx.add(4, false).await;
        let m2 = fx.add(2, false).await;

        let deleted = fx.manager(2).enforce().await.unwrap();
        assert_eq!(deleted, 2);

        let remaining: HashSet<Uuid> = fx.catalog.load().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(remaining, HashSet::from([m3.id, m4.id]));
        assert!(fx.has_artifact(&m3) && fx.has_artifact(&m4));
        assert!(!fx.has_artifact(&m1) && !fx.has_artifact(&m2));
    }

    #[tokio::test]
    async fn test_enforce_never_touches_protected() {
        let fx = Fixture::new();
        let p1 = fx.add(1, true).await;
        let p2 = fx.add(2, true).await;
        let u3 = fx.add(3, false).await;
        let u4 = fx.add(4, false).await;

        let deleted = fx.manager(0).enforce().await.unwrap();
        assert_eq!(deleted, 2);

        let remaining = fx.catalog.load().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| r.protected));
        assert!(fx.has_artifact(&p1) && fx.has_artifact(&p2));
        assert!(!fx.has_artifact(&u3) && !fx.has_artifact(&u4));
    }

    #[tokio::test]
    async fn test_enforce_within_limit_is_noop() {
        let fx = Fixture::new();
        fx.add(1, false).await;
        fx.add(2, false).await;
        fx.add(3, true).await;
        assert_eq!(fx.manager(2).enforce().await.unwrap(), 0);
        assert_eq!(fx.catalog.load().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_enforce_tolerates_missing_artifact() {
        let fx = Fixture::new();
        let old = fx.add(1, false).await;
        fx.add(2, false).await;
        std::fs::remove_file(fx.backup_dir.join(old.artifact_name())).unwrap();

        assert_eq!(fx.manager(1).enforce().await.unwrap(), 1);
        assert!(fx.catalog.get(old.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enforce_failure_reports_partial_count() {
        let fx = Fixture::new();
        let m1 = fx.add(1, false).await;
        let m2 = fx.add(2, false).await;
        let m3 = fx.add(3, false).await;
        // an artifact that cannot be removed as a file
        let stuck = fx.backup_dir.join(m1.artifact_name());
        std::fs::remove_file(&stuck).unwrap();
        std::fs::create_dir(&stuck).unwrap();

        let err = fx.manager(0).enforce().await.unwrap_err();
        assert!(matches!(err, RetentionError::Interrupted { deleted: 2, .. }), "got {:?}", err);
        assert_eq!(err.deleted(), 2);

        assert!(fx.catalog.get(m2.id).await.unwrap().is_none());
        assert!(fx.catalog.get(m3.id).await.unwrap().is_none());
        assert!(fx.catalog.get(m1.id).await.unwrap().is_some());
        assert!(stuck.is_dir());
    }

    #[tokio::test]
    async fn test_reconcile_refuses_without_catalog() {
        let fx = Fixture::new();
        let record = fx.add(1, false).await;
        std::fs::remove_file(fx.catalog.path()).unwrap();

        let err = fx.manager(10).reconcile_orphans().await.unwrap_err();
        assert!(matches!(err, RetentionError::CatalogMissing(_)));
        assert!(fx.has_artifact(&record));
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_orphans() {
        let fx = Fixture::new();
        let kept = fx.add(1, false).await;
        let kept_protected = fx.add(2, true).await;
        std::fs::write(fx.backup_dir.join(format!("{}.tar.gz", Uuid::new_v4())), b"x").unwrap();
        std::fs::write(fx.backup_dir.join("stray.txt"), b"x").unwrap();
        std::fs::create_dir(fx.backup_dir.join("nested")).unwrap();

        // a record without an artifact stays in the catalog
        let dangling = BackupRecord::new(Uuid::new_v4(), None, false);
        fx.catalog.append(dangling.clone()).await.unwrap();

        let deleted = fx.manager(10).reconcile_orphans().await.unwrap();
        assert_eq!(deleted, 2);
        assert!(fx.has_artifact(&kept) && fx.has_artifact(&kept_protected));
        assert!(fx.backup_dir.join("nested").is_dir());
        assert!(!fx.backup_dir.join("stray.txt").exists());
        assert!(fx.catalog.get(dangling.id).await.unwrap().is_some());

        assert_eq!(fx.manager(10).reconcile_orphans().await.unwrap(), 0);
    }
}
