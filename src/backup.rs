use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use crate::errors::PalmgrError;
use crate::server::BackupKind;

#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub kind: BackupKind,
    pub name: String,
}

/// Snapshots the world-state directory into a timestamped folder under the
/// backup root and verifies the copy before reporting success.
pub fn create_backup(
    data_dir: &Path,
    backup_root: &Path,
    kind: BackupKind,
) -> Result<BackupRecord> {
    if !data_dir.exists() {
        return Err(PalmgrError::NotFound(format!(
            "world-state directory {}",
            data_dir.display()
        ))
        .into());
    }
    fs::create_dir_all(backup_root)
        .with_context(|| format!("failed to create {}", backup_root.display()))?;

    let name = record_name(kind);
    let destination = backup_root.join(&name);
    copy_dir_recursive(data_dir, &destination)
        .with_context(|| format!("failed to copy world state into {}", destination.display()))?;
    seal_backup(data_dir, &destination)?;

    info!("created {kind} backup {name}");
    Ok(BackupRecord {
        path: destination,
        kind,
        name,
    })
}

/// Compares the top-level listing of source and copy; on mismatch the partial
/// copy is removed and the backup fails.
fn seal_backup(data_dir: &Path, destination: &Path) -> Result<()> {
    let expected = top_level_listing(data_dir)?;
    let actual = top_level_listing(destination)?;
    if expected == actual {
        return Ok(());
    }

    if let Err(err) = fs::remove_dir_all(destination) {
        warn!(
            "failed to remove partial backup {}: {err}",
            destination.display()
        );
    }
    Err(PalmgrError::IntegrityFailure(format!(
        "copy of {} is incomplete",
        data_dir.display()
    ))
    .into())
}

/// Deletes the oldest automatic snapshots beyond `retain`. Manual, launch and
/// first-run records are never touched. `retain == 0` disables pruning.
pub fn prune_backups(backup_root: &Path, retain: u32) -> Result<usize> {
    if retain == 0 || !backup_root.exists() {
        return Ok(0);
    }

    let mut auto_records: Vec<PathBuf> = fs::read_dir(backup_root)
        .with_context(|| format!("failed to read backup root {}", backup_root.display()))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .filter(|path| {
            path.file_name()
                .and_then(|value| value.to_str())
                .map(|name| BackupKind::classify(name).is_prunable())
                .unwrap_or(false)
        })
        .collect();

    if auto_records.len() <= retain as usize {
        return Ok(0);
    }

    // Timestamped names sort oldest-first lexicographically.
    auto_records.sort();
    let excess = auto_records.len() - retain as usize;
    let mut removed = 0;
    for record in auto_records.into_iter().take(excess) {
        fs::remove_dir_all(&record)
            .with_context(|| format!("failed to prune backup {}", record.display()))?;
        info!("pruned backup {}", record.display());
        removed += 1;
    }
    Ok(removed)
}

/// Existing records, oldest first.
pub fn list_backups(backup_root: &Path) -> Result<Vec<String>> {
    if !backup_root.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(backup_root)
        .with_context(|| format!("failed to read backup root {}", backup_root.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

fn record_name(kind: BackupKind) -> String {
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    format!("{stamp}{}", kind.suffix())
}

fn top_level_listing(dir: &Path) -> Result<Vec<OsString>> {
    let mut names: Vec<OsString> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(Result::ok)
        .map(|entry| entry.file_name())
        .collect();
    names.sort();
    Ok(names)
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
