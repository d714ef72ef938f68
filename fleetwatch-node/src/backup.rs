//! Backup path resolution and staleness
//!
//! Layout: `{root}/{id}/{name}` when the device reports a machine name,
//! `{root}/{id}` otherwise. The newest file anywhere below that directory
//! dates the last backup. Missing directories or files are "no backup yet",
//! never an error, and never a reason to drop a device.

use crate::fanout;
use crate::registry::{DeviceRecord, Registry};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupStatus {
    pub path: Option<PathBuf>,
    pub time_since_backup: Option<Duration>,
}

/// True when `segment` is exactly one plain path component
fn is_single_segment(segment: &str) -> bool {
    let mut components = Path::new(segment).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// Backup directory of `record` under `root`.
///
/// `None` when the device's id or machine name is not a single plain path
/// segment (absolute, `..`, nested), so the result always stays below `root`.
pub fn backup_dir(record: &DeviceRecord, root: &Path) -> Option<PathBuf> {
    if !is_single_segment(&record.id) {
        return None;
    }
    let dir = root.join(&record.id);
    match record.machine_name() {
        Some(name) if is_single_segment(name) => Some(dir.join(name)),
        Some(_) => None,
        None => Some(dir),
    }
}

pub async fn resolve(record: &DeviceRecord, root: &Path) -> io::Result<BackupStatus> {
    resolve_at(record, root, SystemTime::now()).await
}

/// Same as [`resolve`], with elapsed time measured against `now`
pub async fn resolve_at(record: &DeviceRecord, root: &Path, now: SystemTime) -> io::Result<BackupStatus> {
    let Some(dir) = backup_dir(record, root) else {
        warn!(
            device_id = %record.id,
            name = ?record.machine_name(),
            "device id or name is not a plain directory name, backup not resolved"
        );
        return Ok(BackupStatus::default());
    };
    match tokio::fs::metadata(&dir).await {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            debug!(device_id = %record.id, path = %dir.display(), "backup path is not a directory");
            return Ok(BackupStatus::default());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(device_id = %record.id, path = %dir.display(), "no backup directory yet");
            return Ok(BackupStatus::default());
        }
        Err(e) => return Err(e),
    }

    let newest = newest_modification(&dir).await?;
    Ok(BackupStatus {
        time_since_backup: newest.map(|modified| now.duration_since(modified).unwrap_or(Duration::ZERO)),
        path: Some(dir),
    })
}

/// Most recent modification time of any regular file below `dir`
async fn newest_modification(dir: &Path) -> io::Result<Option<SystemTime>> {
    let mut pending = vec![dir.to_path_buf()];
    let mut newest: Option<SystemTime> = None;

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                let modified = entry.metadata().await?.modified()?;
                newest = Some(match newest {
                    Some(seen) => seen.max(modified),
                    None => modified,
                });
            }
        }
    }
    Ok(newest)
}

async fn resolve_one(record: DeviceRecord, root: &Path, now: SystemTime) -> (String, io::Result<BackupStatus>) {
    let status = resolve_at(&record, root, now).await;
    (record.id, status)
}

pub async fn annotate(registry: Registry, root: &Path, concurrency: usize) -> Registry {
    annotate_at(registry, root, concurrency, SystemTime::now()).await
}

/// Fills `backup_path` / `time_since_backup` on every record.
///
/// Resolution errors are logged and leave the record without backup
/// metadata; the device stays in the registry.
pub async fn annotate_at(mut registry: Registry, root: &Path, concurrency: usize, now: SystemTime) -> Registry {
    let started = Instant::now();
    let records: Vec<DeviceRecord> = registry.records().cloned().collect();

    let results = fanout::bounded(records, concurrency, |record| resolve_one(record, root, now)).await;

    for (id, status) in results {
        let Some(record) = registry.get_mut(&id) else { continue };
        match status {
            Ok(status) => {
                record.backup_path = status.path;
                record.time_since_backup = status.time_since_backup;
            }
            Err(e) => {
                error!(device_id = %id, phase = "backup", error = %e, "Error whilst getting backup path for device");
                record.backup_path = None;
                record.time_since_backup = None;
            }
        }
    }

    info!(
        count = registry.len(),
        with_backup = registry.records().filter(|r| r.time_since_backup.is_some()).count(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "BACKUP_PATH -> resolved backup paths"
    );
    registry
}
