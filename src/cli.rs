use clap::{Parser, Subcommand, ValueEnum};

use crate::server::{BackupKind, LaunchArgs};

const BUILD_VERSION: &str = env!("PALMGR_BUILD_VERSION");
const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
USAGE:
  {usage}

COMMANDS:
{subcommands}

OPTIONS:
{options}
{after-help}
";
const HELP_AFTER: &str = "\
Quick Command Map
  Setup:
    install, first-run
  Lifecycle:
    start, stop, restart/rs, status, monitor
  World State:
    backup, prune
  Settings:
    set

Examples
  palmgr start --port 8211 --ram-restart-trigger-gib 14
  palmgr monitor --interval 5
  palmgr backup --kind manual
  palmgr set ServerName=\"My World\" RCONEnabled=True
";

#[derive(Debug, Parser)]
#[command(
    name = "palmgr",
    version = BUILD_VERSION,
    about = "Palworld dedicated server manager",
    help_template = HELP_TEMPLATE,
    after_help = HELP_AFTER
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download/validate the dedicated server through steamcmd.
    Install,
    /// Bootstrap a server that has never run and seed its settings file.
    FirstRun,
    Start {
        #[arg(long, default_value_t = 8211)]
        port: u16,
        #[arg(long = "query-port", default_value_t = 27015)]
        query_port: u16,
        #[arg(long = "rcon-port", default_value_t = 25575)]
        rcon_port: u16,
        #[arg(long = "no-perf-threads", default_value_t = false)]
        no_perf_threads: bool,
        #[arg(long = "async-loading", default_value_t = false)]
        async_loading: bool,
        #[arg(long = "no-multithread-ds", default_value_t = false)]
        no_multithread_ds: bool,
        #[arg(long = "public-lobby", default_value_t = false)]
        public_lobby: bool,
        #[arg(long = "no-auto-backup", default_value_t = false)]
        no_auto_backup: bool,
        #[arg(long = "backup-interval", default_value_t = 3600)]
        backup_interval: u64,
        /// Automatic snapshots to keep; 0 keeps everything.
        #[arg(long = "backup-retain", default_value_t = 48)]
        backup_retain: u32,
        #[arg(long = "no-auto-restart", default_value_t = false)]
        no_auto_restart: bool,
        /// Restart once resident memory reaches this many GiB; 0 disables.
        #[arg(long = "ram-restart-trigger-gib", default_value_t = 0.0)]
        ram_restart_trigger_gib: f64,
    },
    Stop,
    #[command(visible_alias = "rs")]
    Restart,
    Status,
    /// Poll the running server on a fixed cadence.
    Monitor {
        #[arg(long, default_value_t = 5)]
        interval: u64,
        /// Stop after this many passes; omit to run until interrupted.
        #[arg(long)]
        ticks: Option<u64>,
    },
    Backup {
        #[arg(long, value_enum, default_value_t = BackupKindArg::Manual)]
        kind: BackupKindArg,
    },
    /// Delete the oldest automatic snapshots beyond the retention count.
    Prune {
        #[arg(long, default_value_t = 48)]
        retain: u32,
    },
    /// Update entries in PalWorldSettings.ini.
    Set {
        #[arg(required = true, value_parser = parse_setting)]
        settings: Vec<(String, String)>,
    },
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum BackupKindArg {
    Manual,
    Auto,
    Launch,
    FirstRun,
}

impl From<BackupKindArg> for BackupKind {
    fn from(value: BackupKindArg) -> Self {
        match value {
            BackupKindArg::Manual => BackupKind::Manual,
            BackupKindArg::Auto => BackupKind::Auto,
            BackupKindArg::Launch => BackupKind::Launch,
            BackupKindArg::FirstRun => BackupKind::FirstRun,
        }
    }
}

#[allow(clippy::too_many_arguments)]
pub fn build_launch_args(
    port: u16,
    query_port: u16,
    rcon_port: u16,
    no_perf_threads: bool,
    async_loading: bool,
    no_multithread_ds: bool,
    public_lobby: bool,
    no_auto_backup: bool,
    backup_interval: u64,
    backup_retain: u32,
    no_auto_restart: bool,
    ram_restart_trigger_gib: f64,
) -> LaunchArgs {
    LaunchArgs {
        port,
        query_port,
        rcon_port,
        use_perf_threads: !no_perf_threads,
        no_async_loading_thread: !async_loading,
        use_multithread_for_ds: !no_multithread_ds,
        public_lobby,
        auto_backup: !no_auto_backup,
        auto_backup_interval_secs: backup_interval,
        auto_backup_retain: backup_retain,
        auto_restart_on_unexpected_shutdown: !no_auto_restart,
        ram_restart_trigger_gib: ram_restart_trigger_gib.max(0.0),
    }
}

fn parse_setting(value: &str) -> Result<(String, String), String> {
    let Some((key, val)) = value.split_once('=') else {
        return Err("setting must look like KEY=VALUE".to_string());
    };

    if key.trim().is_empty() {
        return Err("setting key cannot be empty".to_string());
    }

    Ok((key.trim().to_string(), val.to_string()))
}
