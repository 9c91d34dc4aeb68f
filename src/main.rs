mod backup;
mod cli;
mod config;
mod errors;
mod install;
mod lifecycle;
mod locator;
mod retry;
mod sampler;
mod server;
mod settings;
mod storage;
mod sys;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{build_launch_args, Cli, Commands};
use crate::config::AppConfig;
use crate::lifecycle::{LifecycleController, Platform, StatusReport};
use crate::retry::{Clock, SystemClock};

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    config.ensure_layout()?;

    match cli.command {
        Commands::Install => {
            let preflight = install::check_install(&config);
            if !preflight.steamcmd_available {
                anyhow::bail!(
                    "steamcmd not found at {}; install it or set PALMGR_STEAMCMD",
                    config.steamcmd_path.display()
                );
            }
            if preflight.server_installed {
                println!("Server already installed; revalidating through steamcmd");
            }
            let mut controller = controller(config)?;
            controller.install()?;
            println!("Server installed; state: {}", controller.state());
        }
        Commands::FirstRun => {
            let mut controller = controller(config)?;
            controller.first_run()?;
            println!("First run completed; default settings written");
        }
        Commands::Start {
            port,
            query_port,
            rcon_port,
            no_perf_threads,
            async_loading,
            no_multithread_ds,
            public_lobby,
            no_auto_backup,
            backup_interval,
            backup_retain,
            no_auto_restart,
            ram_restart_trigger_gib,
        } => {
            let args = build_launch_args(
                port,
                query_port,
                rcon_port,
                no_perf_threads,
                async_loading,
                no_multithread_ds,
                public_lobby,
                no_auto_backup,
                backup_interval,
                backup_retain,
                no_auto_restart,
                ram_restart_trigger_gib,
            );
            let mut controller = controller(config)?;
            controller.start(args)?;
            print_status(&controller.status()?);
        }
        Commands::Stop => {
            let mut controller = controller(config)?;
            controller.stop()?;
            println!("Server stopped");
        }
        Commands::Restart => {
            let mut controller = controller(config)?;
            controller.restart()?;
            print_status(&controller.status()?);
        }
        Commands::Status => {
            let settings_path = config.settings_path.clone();
            let backup_root = config.backup_root.clone();
            let mut controller = controller(config)?;
            print_status(&controller.status()?);

            if let Ok(document) = settings::SettingsDocument::load(&settings_path) {
                let entries = document.entries()?;
                let named = |key: &str| {
                    entries
                        .iter()
                        .find(|(entry_key, _)| entry_key == key)
                        .map(|(_, value)| value.as_str())
                        .unwrap_or("-")
                };
                println!("Name:       {}", named("ServerName"));
                println!("RCON:       {}", named("RCONEnabled"));
            }
            println!(
                "Backups:    {}",
                backup::list_backups(&backup_root)?.len()
            );
        }
        Commands::Monitor { interval, ticks } => {
            let mut controller = controller(config)?;
            run_monitor(&mut controller, interval, ticks)?;
        }
        Commands::Backup { kind } => {
            let controller = controller(config)?;
            let record = controller.backup(kind.into())?;
            println!(
                "Backup created: {} ({}) at {}",
                record.name,
                record.kind,
                record.path.display()
            );
        }
        Commands::Prune { retain } => {
            let removed = backup::prune_backups(&config.backup_root, retain)?;
            println!("Pruned {removed} automatic backup(s)");
        }
        Commands::Set { settings } => {
            settings::update(&config.settings_path, &settings)?;
            println!(
                "Updated {} setting(s) in {}",
                settings.len(),
                config.settings_path.display()
            );
        }
    }

    Ok(())
}

fn controller(config: AppConfig) -> Result<LifecycleController> {
    LifecycleController::new(config, Platform::native())
}

fn run_monitor(
    controller: &mut LifecycleController,
    interval: u64,
    ticks: Option<u64>,
) -> Result<()> {
    let clock = SystemClock;
    let interval = Duration::from_secs(interval.max(1));
    let mut pass: u64 = 0;

    loop {
        let report = controller.monitor_tick()?;
        let mut line = format!(
            "[{}] cpu {:.2}% | mem {:.2} GiB",
            report.state, report.cpu_percent, report.resident_gib
        );
        if report.restarted {
            line.push_str(" | restarted");
        }
        if report.backed_up {
            line.push_str(" | backup taken");
        }
        println!("{line}");

        pass += 1;
        if let Some(limit) = ticks {
            if pass >= limit {
                break;
            }
        }
        clock.sleep(interval);
    }
    Ok(())
}

fn print_status(report: &StatusReport) {
    println!("State:      {}", report.state);
    match report.pid {
        Some(pid) => println!("PID:        {pid}"),
        None => println!("PID:        -"),
    }
    match report.cpu_percent {
        Some(cpu) => println!("CPU:        {cpu:.2}%"),
        None => println!("CPU:        -"),
    }
    match report.resident_gib {
        Some(mem) => println!("Memory:     {mem:.2} GiB"),
        None => println!("Memory:     -"),
    }
    println!(
        "First run:  {}",
        if report.first_run_completed {
            "completed"
        } else {
            "pending"
        }
    );
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}
