use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    NotInstalled,
    Installing,
    Stopped,
    Starting,
    Running,
    Stopping,
    Crashed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ServerState::NotInstalled => "not installed",
            ServerState::Installing => "installing",
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Stopping => "stopping",
            ServerState::Crashed => "crashed",
        };
        write!(f, "{label}")
    }
}

/// Progress of the last attempt to pin down the live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateState {
    Unresolved,
    Resolving,
    Resolved,
    Absent,
}

/// Everything known about the one managed server process.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    pub executable: String,
    pub install_path: PathBuf,
    pub pid: Option<u32>,
    pub running: bool,
    pub expected_to_be_running: bool,
    /// OS monitoring-counter instance token, when that strategy is enabled.
    pub counter_instance: Option<String>,
    pub locate_state: LocateState,
}

impl ServerHandle {
    pub fn new(executable: impl Into<String>, install_path: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            install_path: install_path.into(),
            pid: None,
            running: false,
            expected_to_be_running: false,
            counter_instance: None,
            locate_state: LocateState::Unresolved,
        }
    }

    pub fn mark_resolved(&mut self, pid: u32) {
        self.pid = Some(pid);
        self.running = true;
        self.locate_state = LocateState::Resolved;
    }

    pub fn mark_absent(&mut self) {
        self.pid = None;
        self.running = false;
        self.counter_instance = None;
        self.locate_state = LocateState::Absent;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Manual,
    Auto,
    Launch,
    FirstRun,
}

impl BackupKind {
    /// Folder-name tag appended after the timestamp.
    pub fn suffix(&self) -> &'static str {
        match self {
            BackupKind::Manual => "",
            BackupKind::Auto => "-AutoBackup",
            BackupKind::Launch => "-LaunchBackup",
            BackupKind::FirstRun => "-FirstRunBackup",
        }
    }

    /// Only automatic snapshots are subject to retention pruning.
    pub fn is_prunable(&self) -> bool {
        matches!(self, BackupKind::Auto)
    }

    /// Recovers the kind from a record folder name via its suffix tag.
    pub fn classify(name: &str) -> BackupKind {
        if name.ends_with(BackupKind::Auto.suffix()) {
            BackupKind::Auto
        } else if name.ends_with(BackupKind::Launch.suffix()) {
            BackupKind::Launch
        } else if name.ends_with(BackupKind::FirstRun.suffix()) {
            BackupKind::FirstRun
        } else {
            BackupKind::Manual
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackupKind::Manual => "manual",
            BackupKind::Auto => "auto",
            BackupKind::Launch => "launch",
            BackupKind::FirstRun => "first-run",
        };
        write!(f, "{label}")
    }
}

/// Launch configuration, persisted on every successful start so an
/// automatic restart can replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchArgs {
    pub port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
    pub use_perf_threads: bool,
    pub no_async_loading_thread: bool,
    pub use_multithread_for_ds: bool,
    pub public_lobby: bool,
    pub auto_backup: bool,
    pub auto_backup_interval_secs: u64,
    /// 0 disables retention pruning.
    pub auto_backup_retain: u32,
    pub auto_restart_on_unexpected_shutdown: bool,
    /// 0.0 disables the memory trigger.
    pub ram_restart_trigger_gib: f64,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            port: 8211,
            query_port: 27015,
            rcon_port: 25575,
            use_perf_threads: true,
            no_async_loading_thread: true,
            use_multithread_for_ds: true,
            public_lobby: false,
            auto_backup: true,
            auto_backup_interval_secs: 3600,
            auto_backup_retain: 48,
            auto_restart_on_unexpected_shutdown: true,
            ram_restart_trigger_gib: 0.0,
        }
    }
}

impl LaunchArgs {
    /// Renders the argv tail passed to the server launcher.
    pub fn to_launch_flags(&self) -> Vec<String> {
        let mut flags = vec![
            format!("-port={}", self.port),
            format!("-RCONPort={}", self.rcon_port),
            format!("-queryport={}", self.query_port),
        ];
        if self.use_perf_threads {
            flags.push("-useperfthreads".to_string());
        }
        if self.no_async_loading_thread {
            flags.push("-NoAsyncLoadingThread".to_string());
        }
        if self.use_multithread_for_ds {
            flags.push("-UseMultithreadForDS".to_string());
        }
        if self.public_lobby {
            flags.push("-publiclobby".to_string());
        }
        flags
    }
}
