//! Scheduled registry backups.
//!
//! Startup check plus a 24-hour periodic task; whole-registry snapshots via
//! `VACUUM INTO` with timestamped filenames, keeping the newest seven.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::store::RegistryStore;

pub const BACKUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const BACKUPS_RETAINED: usize = 7;
/// Grace given to an in-flight backup at shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct BackupScheduler {
    registry: RegistryStore,
    backup_dir: PathBuf,
}

impl BackupScheduler {
    pub fn new(registry: RegistryStore, backup_dir: PathBuf) -> Self {
        Self {
            registry,
            backup_dir,
        }
    }

    /// Take one snapshot now, then rotate. Returns the snapshot path.
    pub async fn backup_now(&self) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.backup_dir).await?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let target = self.backup_dir.join(format!("registry-{stamp}.sqlite"));

        // VACUUM INTO produces a consistent snapshot of a live WAL database.
        sqlx::query(&format!(
            "VACUUM INTO '{}'",
            target.display().to_string().replace('\'', "''")
        ))
        .execute(self.registry.pool())
        .await?;

        self.registry
            .set_last_backup_at(Utc::now().timestamp())
            .await?;
        self.rotate().await?;
        tracing::info!(path = %target.display(), "registry backup written");
        Ok(target)
    }

    /// Delete all but the newest `BACKUPS_RETAINED` snapshots.
    async fn rotate(&self) -> Result<()> {
        let mut snapshots = list_snapshots(&self.backup_dir).await?;
        // Timestamped names sort chronologically.
        snapshots.sort();
        while snapshots.len() > BACKUPS_RETAINED {
            let victim = snapshots.remove(0);
            if let Err(e) = tokio::fs::remove_file(&victim).await {
                tracing::warn!(path = %victim.display(), error = %e, "backup rotation failed");
            }
        }
        Ok(())
    }

    /// Whether the last backup is older than the interval (or absent).
    pub async fn backup_due(&self) -> Result<bool> {
        let last = self.registry.last_backup_at().await?;
        Ok(match last {
            Some(at) => Utc::now().timestamp() - at >= BACKUP_INTERVAL.as_secs() as i64,
            None => true,
        })
    }

    /// The long-running scheduler: startup check, then a daily wake-up.
    /// Honors the shutdown token between (not during) backups; the caller
    /// bounds the final wait with `SHUTDOWN_GRACE`.
    pub async fn run(self, shutdown: CancellationToken) {
        match self.backup_due().await {
            Ok(true) => {
                if let Err(e) = self.backup_now().await {
                    tracing::warn!(error = %e, "startup registry backup failed");
                }
            }
            Ok(false) => tracing::debug!("registry backup fresh, skipping startup backup"),
            Err(e) => tracing::warn!(error = %e, "could not read last backup time"),
        }

        let mut ticker = tokio::time::interval(BACKUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.backup_due().await {
                        Ok(true) => {
                            if let Err(e) = self.backup_now().await {
                                tracing::warn!(error = %e, "periodic registry backup failed");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => tracing::warn!(error = %e, "could not read last backup time"),
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!("backup scheduler stopping");
                    return;
                }
            }
        }
    }
}

async fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut snapshots = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return Ok(snapshots);
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("registry-") && name.ends_with(".sqlite") {
            snapshots.push(entry.path());
        }
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn scheduler(dir: &TempDir) -> BackupScheduler {
        let db = dir.path().join("registry.sqlite");
        let registry = RegistryStore::open(db.to_str().unwrap()).await.unwrap();
        registry.register("/work/alpha", "").await.unwrap();
        BackupScheduler::new(registry, dir.path().join("backups"))
    }

    #[tokio::test]
    async fn backup_writes_openable_snapshot() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir).await;
        let path = scheduler.backup_now().await.unwrap();
        assert!(path.exists());

        // The snapshot is itself a valid registry database.
        let restored = RegistryStore::open(path.to_str().unwrap()).await.unwrap();
        assert_eq!(restored.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn backup_due_tracks_meta() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir).await;
        assert!(scheduler.backup_due().await.unwrap());
        scheduler.backup_now().await.unwrap();
        assert!(!scheduler.backup_due().await.unwrap());
    }

    #[tokio::test]
    async fn rotation_keeps_newest_seven() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir).await;
        let backups = dir.path().join("backups");
        std::fs::create_dir_all(&backups).unwrap();
        for i in 0..9 {
            std::fs::write(
                backups.join(format!("registry-2026010{i}-000000.sqlite")),
                b"old",
            )
            .unwrap();
        }
        scheduler.backup_now().await.unwrap();

        let mut remaining: Vec<_> = std::fs::read_dir(&backups)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), BACKUPS_RETAINED);
        // The oldest synthetic snapshots were rotated out.
        assert!(!remaining.contains(&"registry-20260100-000000.sqlite".to_string()));
        assert!(!remaining.contains(&"registry-20260101-000000.sqlite".to_string()));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token.clone()));
        // Give the startup backup a moment, then cancel.
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
        tokio::time::timeout(SHUTDOWN_GRACE, handle)
            .await
            .expect("scheduler should stop within grace")
            .unwrap();
    }
}
