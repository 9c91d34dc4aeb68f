use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use sysinfo::{Pid as SysPid, ProcessesToUpdate, System};

/// Enumerates candidate processes by image name.
pub trait ProcessQuery {
    fn processes_matching(&mut self, executable: &str) -> Result<Vec<ProcessInfo>>;

    /// Whether per-process executable paths can be resolved on this platform.
    /// When false, multi-match disambiguation degrades to first-match.
    fn path_disambiguation(&self) -> bool {
        true
    }

    /// OS monitoring-counter instance token for a pid, when that strategy is
    /// enabled. Default implementations have no counter namespace.
    fn counter_instance(&mut self, _pid: u32) -> Result<Option<String>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Directory holding the process image, when the OS exposes it.
    pub exe_dir: Option<PathBuf>,
}

/// Per-process resource accounting. All answers are `None` once the process
/// is gone; that is a normal outcome, not an error.
pub trait ResourceQuery {
    /// Cumulative CPU time consumed by the process, in seconds.
    fn cpu_time_secs(&mut self, pid: u32) -> Result<Option<f64>>;
    /// Resident memory in bytes.
    fn memory_bytes(&mut self, pid: u32) -> Result<Option<u64>>;
    fn core_count(&self) -> usize;
}

pub trait Terminator {
    /// Forceful, immediate termination. The server persists its world on a
    /// timer, not on shutdown, so there is no graceful path worth waiting for.
    fn kill(&mut self, pid: u32) -> Result<()>;
    fn exists(&mut self, pid: u32) -> bool;
}

pub trait Spawner {
    /// Launches the server detached from our own lifetime and returns its pid.
    fn spawn(&mut self, launcher: &Path, flags: &[String]) -> Result<u32>;
}

/// Real-OS implementation of the capability traits, backed by sysinfo.
pub struct SystemQuery {
    system: System,
    cores: usize,
}

impl SystemQuery {
    pub fn new() -> Self {
        let system = System::new_all();
        let cores = system.cpus().len().max(1);
        Self { system, cores }
    }

    fn refresh_pid(&mut self, pid: u32) {
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    }
}

impl Default for SystemQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessQuery for SystemQuery {
    fn processes_matching(&mut self, executable: &str) -> Result<Vec<ProcessInfo>> {
        self.system.refresh_processes(ProcessesToUpdate::All, true);

        let needle = executable.to_lowercase();
        let mut matches = Vec::new();
        for (pid, process) in self.system.processes() {
            let name = process.name().to_string_lossy().to_lowercase();
            if !name.contains(&needle) {
                continue;
            }
            matches.push(ProcessInfo {
                pid: pid.as_u32(),
                exe_dir: process
                    .exe()
                    .and_then(Path::parent)
                    .map(Path::to_path_buf),
            });
        }
        matches.sort_by_key(|info| info.pid);
        Ok(matches)
    }
}

impl ResourceQuery for SystemQuery {
    fn cpu_time_secs(&mut self, pid: u32) -> Result<Option<f64>> {
        self.refresh_pid(pid);
        Ok(self
            .system
            .process(SysPid::from_u32(pid))
            .map(|process| process.accumulated_cpu_time() as f64 / 1000.0))
    }

    fn memory_bytes(&mut self, pid: u32) -> Result<Option<u64>> {
        self.refresh_pid(pid);
        Ok(self
            .system
            .process(SysPid::from_u32(pid))
            .map(|process| process.memory()))
    }

    fn core_count(&self) -> usize {
        self.cores
    }
}

pub struct SystemTerminator;

impl Terminator for SystemTerminator {
    fn kill(&mut self, pid: u32) -> Result<()> {
        kill_pid(pid)
    }

    fn exists(&mut self, pid: u32) -> bool {
        process_exists(pid)
    }
}

pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&mut self, launcher: &Path, flags: &[String]) -> Result<u32> {
        let mut command = Command::new(launcher);
        command
            .args(flags)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(cwd) = launcher.parent() {
            command.current_dir(cwd);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;

            // Detach into its own session so the server outlives this CLI.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;

            const DETACHED_PROCESS: u32 = 0x0000_0008;
            command.creation_flags(DETACHED_PROCESS);
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", launcher.display()))?;
        Ok(child.id())
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(pid: u32) -> bool {
    let mut system = System::new_all();
    system.refresh_processes(ProcessesToUpdate::Some(&[SysPid::from_u32(pid)]), true);
    system.process(SysPid::from_u32(pid)).is_some()
}

#[cfg(unix)]
fn kill_pid(pid: u32) -> Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let os_pid = Pid::from_raw(pid as i32);
    // Target the whole session first so worker threads and children go too.
    let pgid = Pid::from_raw(-(pid as i32));
    let _ = kill(pgid, Signal::SIGKILL);

    match kill(os_pid, Signal::SIGKILL) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(anyhow::anyhow!("failed to send SIGKILL to {pid}: {err}")),
    }
}

#[cfg(windows)]
fn kill_pid(pid: u32) -> Result<()> {
    if !process_exists(pid) {
        return Ok(());
    }

    let pid_string = pid.to_string();
    let status = Command::new("taskkill")
        .args(["/PID", &pid_string, "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to run taskkill")?;

    if !status.success() && process_exists(pid) {
        anyhow::bail!("failed to force-kill process {pid} with taskkill");
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn kill_pid(_pid: u32) -> Result<()> {
    Ok(())
}
