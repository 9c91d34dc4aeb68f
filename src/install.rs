use std::fs;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallStatus {
    pub steamcmd_available: bool,
    pub server_installed: bool,
}

pub fn check_install(config: &AppConfig) -> InstallStatus {
    InstallStatus {
        steamcmd_available: steamcmd_available(config),
        server_installed: server_installed(config),
    }
}

/// Installed means the launcher exists and the server has produced (or been
/// given) a non-empty settings file.
pub fn server_installed(config: &AppConfig) -> bool {
    if !config.launcher_path.exists() {
        return false;
    }
    fs::read_to_string(&config.settings_path)
        .map(|content| !content.trim().is_empty())
        .unwrap_or(false)
}

fn steamcmd_available(config: &AppConfig) -> bool {
    if config.steamcmd_path.is_absolute() {
        return config.steamcmd_path.exists();
    }
    // Relative command; let a version probe decide whether PATH resolves it.
    Command::new(&config.steamcmd_path)
        .arg("+quit")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Drives steamcmd to download/validate the dedicated server into the
/// install directory.
pub fn install_server(config: &AppConfig) -> Result<()> {
    fs::create_dir_all(&config.install_dir)
        .with_context(|| format!("failed to create {}", config.install_dir.display()))?;

    info!(
        "installing app {} into {}",
        config.steam_app_id,
        config.install_dir.display()
    );
    let status = Command::new(&config.steamcmd_path)
        .arg(format!(
            "+force_install_dir {}",
            config.install_dir.display()
        ))
        .arg("+login anonymous")
        .arg(format!("+app_update {} validate", config.steam_app_id))
        .arg("+quit")
        .stdin(Stdio::null())
        .status()
        .with_context(|| {
            format!(
                "failed to run steamcmd at {}",
                config.steamcmd_path.display()
            )
        })?;

    if !status.success() {
        anyhow::bail!("steamcmd exited with {:?}", status.code());
    }
    info!("server install finished");
    Ok(())
}
