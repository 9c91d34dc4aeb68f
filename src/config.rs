use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_dir: PathBuf,
    /// Root of the dedicated-server installation.
    pub install_dir: PathBuf,
    /// Image name the running server is matched by.
    pub executable: String,
    /// Script/binary used to launch the server.
    pub launcher_path: PathBuf,
    pub settings_path: PathBuf,
    /// Directory holding the world state; this is what gets backed up.
    pub data_dir: PathBuf,
    pub backup_root: PathBuf,
    pub state_path: PathBuf,
    pub steamcmd_path: PathBuf,
    pub steam_app_id: String,
    /// Divide CPU percentages by the core count once more on virtualized hosts.
    pub virtualized_host: bool,
    /// Record the OS monitoring-counter instance token when resolving the process.
    pub use_counter_instances: bool,
    /// Seconds the first-run bootstrap lets the server settle before stopping it.
    pub settle_secs: u64,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let base_dir = env::var("PALMGR_HOME")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(env::temp_dir)
                    .join("palmgr")
            });
        let install_dir = env::var("PALMGR_INSTALL_DIR")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| base_dir.join("server"));
        let executable = env::var("PALMGR_EXECUTABLE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "PalServer".to_string());
        let launcher_path = install_dir.join(launcher_file_name());
        let settings_path = install_dir
            .join("Pal")
            .join("Saved")
            .join("Config")
            .join(platform_config_dir())
            .join("PalWorldSettings.ini");
        let data_dir = install_dir.join("Pal").join("Saved");
        let backup_root = base_dir.join("backups");
        let state_path = base_dir.join("state.json");
        let steamcmd_path = env::var("PALMGR_STEAMCMD")
            .map(PathBuf::from)
            .ok()
            .unwrap_or_else(|| PathBuf::from("steamcmd"));

        let config = Self {
            base_dir,
            install_dir,
            executable,
            launcher_path,
            settings_path,
            data_dir,
            backup_root,
            state_path,
            steamcmd_path,
            steam_app_id: "2394010".to_string(),
            virtualized_host: env_bool("PALMGR_VIRTUALIZED", false),
            use_counter_instances: env_bool("PALMGR_COUNTER_INSTANCES", false),
            settle_secs: env_u64("PALMGR_SETTLE_SECS", 3),
        };
        config.ensure_layout()?;
        Ok(config)
    }

    pub fn ensure_layout(&self) -> Result<()> {
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("failed to create {}", self.base_dir.display()))?;
        fs::create_dir_all(&self.backup_root)
            .with_context(|| format!("failed to create {}", self.backup_root.display()))?;
        Ok(())
    }
}

fn launcher_file_name() -> &'static str {
    #[cfg(windows)]
    {
        "PalServer.exe"
    }

    #[cfg(not(windows))]
    {
        "PalServer.sh"
    }
}

fn platform_config_dir() -> &'static str {
    #[cfg(windows)]
    {
        "WindowsServer"
    }

    #[cfg(not(windows))]
    {
        "LinuxServer"
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim() {
            "1" | "true" | "yes" => Some(true),
            "0" | "false" | "no" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
