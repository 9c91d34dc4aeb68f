use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::backup::{self, BackupRecord};
use crate::config::AppConfig;
use crate::errors::PalmgrError;
use crate::install;
use crate::locator::{self, LocateOutcome};
use crate::retry::{Clock, RetryPolicy, SystemClock};
use crate::sampler::{ResourceSampler, SampleOutcome};
use crate::server::{BackupKind, LaunchArgs, ServerHandle, ServerState};
use crate::settings;
use crate::storage::{load_state, save_state, write_atomic, PersistedState};
use crate::sys::{
    CommandSpawner, ProcessQuery, ResourceQuery, Spawner, SystemQuery, SystemTerminator,
    Terminator,
};

/// OS capabilities the controller acts through. Swapped for fakes in tests.
pub struct Platform {
    pub query: Box<dyn ProcessQuery>,
    pub resources: Box<dyn ResourceQuery>,
    pub terminator: Box<dyn Terminator>,
    pub spawner: Box<dyn Spawner>,
    pub clock: Box<dyn Clock>,
}

impl Platform {
    pub fn native() -> Self {
        Self {
            query: Box::new(SystemQuery::new()),
            resources: Box::new(SystemQuery::new()),
            terminator: Box::new(SystemTerminator),
            spawner: Box::new(CommandSpawner),
            clock: Box::new(SystemClock),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickReport {
    pub state: ServerState,
    pub cpu_percent: f64,
    pub resident_gib: f64,
    pub restarted: bool,
    pub backed_up: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: ServerState,
    pub pid: Option<u32>,
    pub cpu_percent: Option<f64>,
    pub resident_gib: Option<f64>,
    pub first_run_completed: bool,
}

/// Drives the one managed server through its state machine. Single-threaded;
/// `monitor_tick` is called from an external cadence.
pub struct LifecycleController {
    config: AppConfig,
    platform: Platform,
    handle: ServerHandle,
    sampler: ResourceSampler,
    state: ServerState,
    transition_in_flight: bool,
    persisted: PersistedState,
    last_auto_backup: Option<Instant>,
}

impl LifecycleController {
    pub fn new(config: AppConfig, platform: Platform) -> Result<Self> {
        let persisted = load_state(&config.state_path)?;
        let state = if install::server_installed(&config) {
            ServerState::Stopped
        } else {
            ServerState::NotInstalled
        };
        let handle = ServerHandle::new(config.executable.clone(), config.install_dir.clone());
        let sampler = ResourceSampler::new(config.virtualized_host);

        let mut controller = Self {
            config,
            platform,
            handle,
            sampler,
            state,
            transition_in_flight: false,
            persisted,
            last_auto_backup: None,
        };
        if controller.state == ServerState::Stopped {
            controller.adopt_running_server()?;
        }
        Ok(controller)
    }

    /// A previous invocation may have left the server running. One probe; when
    /// the process is found the controller takes it over, so monitoring and
    /// stop work across separate runs of the binary.
    fn adopt_running_server(&mut self) -> Result<()> {
        let outcome = locator::locate(
            &mut self.handle,
            self.platform.query.as_mut(),
            self.platform.clock.as_ref(),
            self.config.use_counter_instances,
        )?;
        if let LocateOutcome::Resolved(pid) = outcome {
            self.handle.expected_to_be_running = true;
            self.state = ServerState::Running;
            self.sampler.reset();
            self.last_auto_backup = Some(self.platform.clock.now());
            info!("adopted running server with pid {pid}");
        }
        Ok(())
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn install(&mut self) -> Result<()> {
        self.begin_transition()?;
        self.state = ServerState::Installing;
        let result = install::install_server(&self.config);
        self.transition_in_flight = false;
        if let Err(err) = result {
            self.state = ServerState::NotInstalled;
            return Err(err);
        }
        self.state = ServerState::Stopped;

        if !self.config.settings_path.exists() {
            // A fresh install has never written its settings file.
            self.first_run()?;
        }
        Ok(())
    }

    pub fn start(&mut self, args: LaunchArgs) -> Result<()> {
        self.begin_transition()?;
        let result = self.do_start(&args);
        self.transition_in_flight = false;
        result
    }

    pub fn stop(&mut self) -> Result<()> {
        self.begin_transition()?;
        let result = self.do_stop();
        self.transition_in_flight = false;
        result
    }

    pub fn restart(&mut self) -> Result<()> {
        let args = self.persisted.last_launch_args.clone().unwrap_or_default();
        self.stop().context("restart: stop phase")?;
        self.start(args).context("restart: start phase")
    }

    /// One monitoring pass: sample resources, reconcile crashes, apply the
    /// memory trigger, and take a scheduled backup when one is due.
    pub fn monitor_tick(&mut self) -> Result<TickReport> {
        if self.state != ServerState::Running {
            return Ok(TickReport {
                state: self.state,
                cpu_percent: 0.0,
                resident_gib: 0.0,
                restarted: false,
                backed_up: false,
            });
        }

        let args = self.persisted.last_launch_args.clone().unwrap_or_default();
        let cpu = self.sampler.sample_cpu(
            self.handle.pid,
            self.platform.resources.as_mut(),
            self.platform.clock.as_ref(),
        )?;
        let memory = self
            .sampler
            .sample_memory(self.handle.pid, self.platform.resources.as_mut())?;

        let (cpu_percent, resident_gib) = match (cpu, memory) {
            (SampleOutcome::Sampled(cpu), SampleOutcome::Sampled(memory)) => {
                (cpu.cpu_percent, memory.resident_gib)
            }
            _ => return self.reconcile_unexpected_exit(&args),
        };

        let mut restarted = false;
        if args.ram_restart_trigger_gib > 0.0 && resident_gib >= args.ram_restart_trigger_gib {
            info!(
                "memory {resident_gib} GiB reached the restart trigger {} GiB",
                args.ram_restart_trigger_gib
            );
            self.stop().context("memory-triggered restart: stop phase")?;
            self.start(args.clone())
                .context("memory-triggered restart: start phase")?;
            restarted = true;
        }

        let mut backed_up = false;
        if args.auto_backup && args.auto_backup_interval_secs > 0 && self.auto_backup_due(&args) {
            backup::create_backup(&self.config.data_dir, &self.config.backup_root, BackupKind::Auto)
                .context("scheduled backup")?;
            backup::prune_backups(&self.config.backup_root, args.auto_backup_retain)
                .context("scheduled backup retention")?;
            self.last_auto_backup = Some(self.platform.clock.now());
            backed_up = true;
        }

        Ok(TickReport {
            state: self.state,
            cpu_percent,
            resident_gib,
            restarted,
            backed_up,
        })
    }

    /// Bootstrap pass for a server that has never run: let it generate its
    /// world, stop it, and seed a known-good settings file with remote
    /// administration enabled.
    pub fn first_run(&mut self) -> Result<()> {
        let args = LaunchArgs {
            auto_backup: false,
            ..LaunchArgs::default()
        };
        self.start(args).context("first run: initial start")?;
        self.platform
            .clock
            .sleep(Duration::from_secs(self.config.settle_secs));
        self.stop().context("first run: stop after settle")?;

        write_atomic(&self.config.settings_path, settings::DEFAULT_SETTINGS.as_bytes())
            .context("first run: write default settings")?;
        let updates = vec![
            ("RCONEnabled".to_string(), "True".to_string()),
            ("AdminPassword".to_string(), "\"admin\"".to_string()),
            ("bShowPlayerList".to_string(), "False".to_string()),
        ];
        settings::update(&self.config.settings_path, &updates)
            .context("first run: apply bootstrap settings")?;

        self.persisted.first_run_completed = true;
        save_state(&self.config.state_path, &self.persisted)
            .context("first run: persist completion")?;
        info!("first run completed");
        Ok(())
    }

    pub fn backup(&self, kind: BackupKind) -> Result<BackupRecord> {
        backup::create_backup(&self.config.data_dir, &self.config.backup_root, kind)
    }

    /// Read-mostly snapshot; probes once without waiting and reconciles an
    /// unnoticed crash into the reported state.
    pub fn status(&mut self) -> Result<StatusReport> {
        let expected = self.handle.expected_to_be_running;
        self.handle.expected_to_be_running = false;
        let outcome = locator::locate(
            &mut self.handle,
            self.platform.query.as_mut(),
            self.platform.clock.as_ref(),
            self.config.use_counter_instances,
        );
        self.handle.expected_to_be_running = expected;
        let outcome = outcome?;

        if outcome == LocateOutcome::Absent && self.state == ServerState::Running {
            self.state = ServerState::Crashed;
            self.sampler.reset();
        }

        let mut cpu_percent = None;
        let mut resident_gib = None;
        if let LocateOutcome::Resolved(pid) = outcome {
            if let SampleOutcome::Sampled(sample) = self.sampler.sample_cpu(
                Some(pid),
                self.platform.resources.as_mut(),
                self.platform.clock.as_ref(),
            )? {
                cpu_percent = Some(sample.cpu_percent);
            }
            if let SampleOutcome::Sampled(sample) = self
                .sampler
                .sample_memory(Some(pid), self.platform.resources.as_mut())?
            {
                resident_gib = Some(sample.resident_gib);
            }
        }

        Ok(StatusReport {
            state: self.state,
            pid: self.handle.pid,
            cpu_percent,
            resident_gib,
            first_run_completed: self.persisted.first_run_completed,
        })
    }

    fn begin_transition(&mut self) -> Result<()> {
        if self.transition_in_flight {
            return Err(PalmgrError::TransitionInFlight.into());
        }
        self.transition_in_flight = true;
        Ok(())
    }

    fn do_start(&mut self, args: &LaunchArgs) -> Result<()> {
        if self.state == ServerState::Running {
            return Err(PalmgrError::AlreadyRunning.into());
        }

        if args.auto_backup && self.config.data_dir.exists() {
            backup::create_backup(
                &self.config.data_dir,
                &self.config.backup_root,
                BackupKind::Launch,
            )
            .context("start aborted at launch backup")?;
        }

        self.state = ServerState::Starting;
        self.handle.expected_to_be_running = true;
        let flags = args.to_launch_flags();
        if let Err(err) = self
            .platform
            .spawner
            .spawn(&self.config.launcher_path, &flags)
        {
            self.state = ServerState::Stopped;
            self.handle.expected_to_be_running = false;
            return Err(err.context("start aborted at spawn"));
        }

        match locator::locate(
            &mut self.handle,
            self.platform.query.as_mut(),
            self.platform.clock.as_ref(),
            self.config.use_counter_instances,
        )? {
            LocateOutcome::Resolved(pid) => {
                self.state = ServerState::Running;
                self.sampler.reset();
                self.persisted.last_launch_args = Some(args.clone());
                save_state(&self.config.state_path, &self.persisted)
                    .context("start: persist launch arguments")?;
                self.last_auto_backup = Some(self.platform.clock.now());
                info!("server running with pid {pid}");
                Ok(())
            }
            LocateOutcome::Absent => {
                self.state = ServerState::Stopped;
                self.handle.expected_to_be_running = false;
                Err(PalmgrError::Timeout(
                    "server process did not appear after launch".to_string(),
                )
                .into())
            }
        }
    }

    fn do_stop(&mut self) -> Result<()> {
        self.state = ServerState::Stopping;
        self.handle.expected_to_be_running = false;

        if self.handle.pid.is_none() {
            // The server may be running outside our supervision; one probe.
            locator::locate(
                &mut self.handle,
                self.platform.query.as_mut(),
                self.platform.clock.as_ref(),
                self.config.use_counter_instances,
            )?;
        }

        let Some(pid) = self.handle.pid else {
            self.state = ServerState::Stopped;
            return Ok(());
        };

        self.platform
            .terminator
            .kill(pid)
            .context("stop aborted at terminate")?;

        // The killed process can linger briefly (e.g. as an unreaped zombie),
        // so absence is confirmed by polling, not a single instant probe.
        let Platform {
            terminator, clock, ..
        } = &mut self.platform;
        let gone = RetryPolicy::expected()
            .run(clock.as_ref(), |_| (!terminator.exists(pid)).then_some(()));

        match gone {
            Some(()) => {
                self.handle.mark_absent();
                self.sampler.reset();
                self.state = ServerState::Stopped;
                info!("server stopped");
                Ok(())
            }
            None => Err(PalmgrError::Timeout(format!(
                "server pid {pid} still alive after forceful stop"
            ))
            .into()),
        }
    }

    fn reconcile_unexpected_exit(&mut self, args: &LaunchArgs) -> Result<TickReport> {
        warn!("server process disappeared while expected to be running");
        self.handle.mark_absent();
        self.sampler.reset();
        self.state = ServerState::Crashed;

        let mut restarted = false;
        if args.auto_restart_on_unexpected_shutdown {
            self.start(args.clone())
                .context("automatic restart after unexpected shutdown")?;
            restarted = true;
        }

        Ok(TickReport {
            state: self.state,
            cpu_percent: 0.0,
            resident_gib: 0.0,
            restarted,
            backed_up: false,
        })
    }

    fn auto_backup_due(&self, args: &LaunchArgs) -> bool {
        match self.last_auto_backup {
            Some(at) => {
                let elapsed = self.platform.clock.now().duration_since(at);
                elapsed.as_secs() >= args.auto_backup_interval_secs
            }
            None => true,
        }
    }
}
