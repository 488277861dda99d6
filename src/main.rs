//! stackvisor: supervise groups of long-running local processes.
//!
//! This is the entry point of the command-line tool. It parses arguments, loads the
//! group definitions and settings, and maps each subcommand onto the supervisor.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stackvisor::config::{load_settings, GroupResolver, Paths, TomlGroupResolver};
use stackvisor::output::{capture_stdin, sanitize_text, tail_lines};
use stackvisor::runner::capture_args;
use stackvisor::{
    CaptureMode, GroupReport, ProcessState, ProcessStatus, StartOptions, Supervisor,
};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "stackvisor",
    version,
    about = "Supervise groups of long-running local processes",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the group definition file.
    #[arg(long, global = true, default_value = "stackvisor.toml")]
    groups: PathBuf,
    /// Root directory for state, logs and locks (overrides STACKVISOR_HOME).
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every command of a group.
    Start {
        group: String,
        /// Discard output instead of capturing it.
        #[arg(long)]
        no_logs: bool,
    },
    /// Stop every process of a group.
    Stop { group: String },
    /// Restart every command of a group.
    Restart {
        group: String,
        /// Discard output instead of capturing it.
        #[arg(long)]
        no_logs: bool,
    },
    /// List supervised processes.
    List {
        /// Only show processes of this group.
        #[arg(long)]
        group: Option<String>,
    },
    /// Print the tail of a process log.
    Logs {
        group: String,
        process: String,
        /// Number of lines to print.
        #[arg(long, short = 'n', default_value_t = 50)]
        lines: usize,
        /// Strip ANSI escape codes.
        #[arg(long)]
        strip_ansi: bool,
    },
    /// Copy standard input into a size-bounded log (spawned by the supervisor).
    #[command(hide = true)]
    Capture {
        #[arg(long)]
        log: PathBuf,
        #[arg(long)]
        max_bytes: u64,
        #[arg(long)]
        keep_ratio: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Capture {
        log,
        max_bytes,
        keep_ratio,
    } = &cli.command
    {
        capture_stdin(log.clone(), *max_bytes, *keep_ratio).await?;
        return Ok(());
    }

    let paths = match &cli.home {
        Some(home) => Paths::new(home),
        None => Paths::from_env()?,
    };
    let settings = load_settings(&paths.settings_file())?;
    // Output is copied by a detached `stackvisor capture` per process, so logging
    // continues after this command exits.
    let program = std::env::current_exe().context("failed to locate the stackvisor binary")?;
    let supervisor = Supervisor::new(&paths, settings).with_capture(CaptureMode::Helper(program));

    match &cli.command {
        Commands::Start { group, no_logs } => {
            let resolver = TomlGroupResolver::load(&cli.groups)?;
            let definition = resolver.resolve(group)?;
            let report = supervisor
                .start_group(
                    &definition.key,
                    &definition.commands,
                    &start_options(&definition, *no_logs),
                )
                .await?;
            print_report(&report);
            fail_on_errors(&report)
        }
        Commands::Restart { group, no_logs } => {
            let resolver = TomlGroupResolver::load(&cli.groups)?;
            let definition = resolver.resolve(group)?;
            let report = supervisor
                .restart_group(
                    &definition.key,
                    &definition.commands,
                    &start_options(&definition, *no_logs),
                )
                .await?;
            print_report(&report);
            fail_on_errors(&report)
        }
        Commands::Stop { group } => {
            // Records of a group that is no longer defined can still be stopped.
            let commands = TomlGroupResolver::load(&cli.groups)
                .and_then(|resolver| resolver.resolve(group))
                .map(|definition| definition.commands)
                .unwrap_or_default();
            let report = supervisor.stop_group(group, &commands).await?;
            print_report(&report);
            fail_on_errors(&report)
        }
        Commands::List { group } => {
            let states = supervisor.list_processes().await;
            let states: Vec<&ProcessState> = states
                .iter()
                .filter(|state| group.as_ref().map_or(true, |g| &state.group == g))
                .collect();
            if states.is_empty() {
                println!("no supervised processes");
            }
            for state in states {
                println!("{}", format_state(state));
            }
            Ok(())
        }
        Commands::Logs {
            group,
            process,
            lines,
            strip_ansi,
        } => {
            let state = supervisor
                .store()
                .read(group, process)
                .with_context(|| format!("no record for {group}/{process}"))?;
            let Some(log_path) = state.log_path.as_deref() else {
                bail!("{group}/{process} has no log (logs disabled)");
            };
            let lines = tail_lines(Path::new(log_path), *lines)
                .with_context(|| format!("failed to read log {log_path}"))?;
            for line in lines {
                println!("{}", sanitize_text(&line, *strip_ansi));
            }
            Ok(())
        }
        Commands::Capture { .. } => Ok(()),
    }
}

fn start_options(definition: &stackvisor::GroupDefinition, no_logs: bool) -> StartOptions {
    StartOptions {
        log_max_bytes: None,
        logs_disabled: no_logs,
        meta: definition.meta.clone(),
    }
}

fn print_report(report: &GroupReport) {
    for entry in &report.entries {
        match &entry.outcome {
            Ok(Some(state)) => println!("{}", format_state(state)),
            Ok(None) => println!("{}/{}: not running", report.group, entry.process),
            Err(err) => println!("{}/{}: {}", report.group, entry.process, err),
        }
    }
}

fn fail_on_errors(report: &GroupReport) -> Result<()> {
    let failed = report.failures().count();
    if failed > 0 {
        bail!(
            "{failed} of {} process(es) in group '{}' failed",
            report.entries.len(),
            report.group
        );
    }
    Ok(())
}

fn format_state(state: &ProcessState) -> String {
    let status = match state.status {
        ProcessStatus::Running => "running",
        ProcessStatus::Stopped => "stopped",
        ProcessStatus::Error => "error",
    };
    let mut line = format!("{}/{}: {status}", state.group, state.process);
    if let Some(pid) = state.pid {
        line.push_str(&format!(" pid={pid}"));
    }
    if !state.claimed_ports().is_empty() {
        let ports: Vec<String> = state.claimed_ports().iter().map(u16::to_string).collect();
        line.push_str(&format!(" ports={}", ports.join(",")));
    }
    if let Some(started) = state.started_at {
        line.push_str(&format!(" since={}", started.format("%Y-%m-%d %H:%M:%S")));
    }
    if let Some(error) = &state.error {
        line.push_str(&format!(" ({error})"));
    }
    line
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
