// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use logship::config::{Config, Overrides};
use logship::form::FnRegistry;
use logship::monitor::{Monitor, MonitorConfig};
use logship::sink::SinkRegistry;
use logship::{CycleOutcome, Error};

#[derive(Debug, Parser)]
#[command(name = "logship", version, about = "Ship delimited log entries to pluggable sinks")]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "LOGSHIP_CONFIG", default_value = "logship.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured sources
    Sources,
    /// List configured channels
    Channels,
    /// Initialize positions for files without consuming them
    Seed { paths: Vec<PathBuf> },
    /// Drain files (or standard input with "-") through matching channels
    #[command(alias = "eat")]
    Consume {
        paths: Vec<String>,
        /// Override every channel's batch size
        #[arg(short, long)]
        batch: Option<usize>,
        /// Enable tracking, persisting positions under this directory
        #[arg(short, long, value_name = "DIR")]
        tracking_root: Option<PathBuf>,
    },
    /// Watch for file changes and consume continuously
    Monitor { paths: Vec<PathBuf> },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> logship::Result<bool> {
    let config = Config::from_file(&cli.config)?;
    let functions = FnRegistry::builtin();
    let sinks = SinkRegistry::builtin();

    match cli.command {
        Command::Sources => {
            for (name, globs) in config.sources() {
                println!("{name}\t{globs}");
            }
            Ok(true)
        }
        Command::Channels => {
            for (name, sources, sink) in config.channels() {
                println!("{name}\t{sources}\t{sink}");
            }
            Ok(true)
        }
        Command::Seed { paths } => {
            let engine = config.build(&functions, &sinks, &Overrides::default())?;
            let mut channels = engine.channels;
            for path in expand_paths(&paths)? {
                for channel in &mut channels {
                    if channel.match_source(&path).is_none() {
                        continue;
                    }
                    let seeded = channel.seed_path(&path)?;
                    if seeded {
                        println!("{}\t{}", channel.name(), path.display());
                    }
                }
            }
            Ok(true)
        }
        Command::Consume {
            paths,
            batch,
            tracking_root,
        } => {
            let overrides = Overrides {
                batch_size: batch,
                track: tracking_root.as_ref().map(|_| true),
                state_dir: tracking_root,
            };
            let engine = config.build(&functions, &sinks, &overrides)?;
            let locks = engine.context.locks;
            let mut channels = engine.channels;
            let mut ok = true;

            for path in &paths {
                if path == "-" {
                    for channel in &mut channels {
                        if channel.sources().len() != 1 {
                            continue;
                        }
                        let report = channel.consume_stream(std::io::stdin().lock())?;
                        report_cycle(channel.name(), &report, &mut ok);
                    }
                    continue;
                }
                for file in expand_paths(&[PathBuf::from(path)])? {
                    let mut matched = 0;
                    for channel in &mut channels {
                        if channel.match_source(&file).is_none() {
                            continue;
                        }
                        matched += 1;
                        let report = channel.consume_path(&locks, &file)?;
                        report_cycle(channel.name(), &report, &mut ok);
                    }
                    if matched == 0 {
                        info!(path = %file.display(), "no channel matches");
                    }
                }
            }
            Ok(ok)
        }
        Command::Monitor { paths } => {
            let engine = config.build(&functions, &sinks, &Overrides::default())?;
            let mut channels = engine.channels;

            // Explicit paths are consumed up front; after that the sources'
            // globs drive discovery.
            for path in expand_paths(&paths)? {
                for channel in &mut channels {
                    if channel.match_source(&path).is_some() {
                        channel.seed_path(&path)?;
                    }
                }
            }

            let shutdown = Arc::new(AtomicBool::new(false));
            let monitor = Monitor::new(engine.context.locks, MonitorConfig::default());
            let report = monitor.run(channels, shutdown)?;
            Ok(report.failures == 0)
        }
    }
}

fn report_cycle(channel: &str, report: &logship::CycleReport, ok: &mut bool) {
    match &report.outcome {
        CycleOutcome::Drained => {
            println!(
                "{channel}\t{}\t{} record(s)\t{} byte(s)\t{} error(s)",
                report.path, report.records, report.bytes, report.errors
            );
        }
        CycleOutcome::Throttled { retry_in } => {
            error!(
                channel,
                path = %report.path,
                retry_in_ms = retry_in.as_millis() as u64,
                "delivery throttled; position unchanged"
            );
            *ok = false;
        }
        CycleOutcome::Failed { reason } => {
            error!(channel, path = %report.path, %reason, "cycle failed");
            *ok = false;
        }
    }
}

/// Expand files and directories (recursively) into concrete file paths.
fn expand_paths(paths: &[PathBuf]) -> logship::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for path in paths {
        collect_files(path, &mut files)?;
    }
    Ok(files)
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> logship::Result<()> {
    let metadata = fs::metadata(path).map_err(Error::Io)?;
    if metadata.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        collect_files(&entry.path(), out)?;
    }
    Ok(())
}
