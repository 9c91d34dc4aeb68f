use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::server::LaunchArgs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedState {
    pub first_run_completed: bool,
    /// Arguments of the last successful start, replayed on auto-restart.
    pub last_launch_args: Option<LaunchArgs>,
}

pub fn load_state(path: &Path) -> Result<PersistedState> {
    if !path.exists() {
        return Ok(PersistedState::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read state file {}", path.display()))?;

    if content.trim().is_empty() {
        return Ok(PersistedState::default());
    }

    match serde_json::from_str::<PersistedState>(&content) {
        Ok(state) => Ok(state),
        Err(error) => {
            let backup = corrupted_backup_path(path);
            if let Err(rename_err) = fs::rename(path, &backup) {
                warn!(
                    "failed to move corrupted state file {} -> {}: {rename_err}",
                    path.display(),
                    backup.display()
                );
            } else {
                warn!(
                    "state file {} is corrupted ({error}), moved to {}",
                    path.display(),
                    backup.display()
                );
            }
            Ok(PersistedState::default())
        }
    }
}

pub fn save_state(path: &Path, state: &PersistedState) -> Result<()> {
    let payload = serde_json::to_vec_pretty(state)?;
    write_atomic(path, &payload)
        .with_context(|| format!("failed to write state file {}", path.display()))
}

/// Whole-file rewrite through a temp file and rename, so readers never see a
/// half-written file.
pub fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, payload)
        .with_context(|| format!("failed to write temporary file {}", tmp_path.display()))?;
    replace_file(&tmp_path, path)
}

fn corrupted_backup_path(path: &Path) -> PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    path.with_extension(format!("corrupt-{suffix}.json"))
}

fn tmp_path_for(path: &Path) -> PathBuf {
    path.with_extension("tmp")
}

fn replace_file(tmp_path: &Path, path: &Path) -> Result<()> {
    match fs::rename(tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            #[cfg(windows)]
            {
                if path.exists() {
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove file {}", path.display()))?;
                    fs::rename(tmp_path, path)
                        .with_context(|| format!("failed to replace file {}", path.display()))?;
                    return Ok(());
                }
            }

            Err(rename_err).with_context(|| format!("failed to replace file {}", path.display()))
        }
    }
}
