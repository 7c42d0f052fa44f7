use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use timelapse::app;
use timelapse::cli::{Cli, Commands};
use timelapse::config::{self, TimelapseConfig};
use timelapse::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("timelapse error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    let cli = Cli::parse();
    let log_file = cli.command.is_none().then(config::log_path);
    setup_tracing(log_file.as_deref());

    let mut config = TimelapseConfig::load_or_init()?;
    if cli.merges {
        config.include_merges = true;
    }
    if let Some(hg) = cli.hg {
        config.hg_executable = hg;
    }
    let runtime = config::runtime_settings();

    match cli.command {
        Some(Commands::Log { file, details }) => app::run_log(&config, &runtime, &file, details),
        Some(Commands::Doctor) => app::doctor(&config, &runtime),
        None => app::run_interactive(&config, &runtime, cli.file.as_deref()),
    }
}
