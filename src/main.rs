//! Pi-timelapse binary driving the camera from the command line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pi_timelapse::{Controller, Settings, V4L2Driver};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How often the status is logged while a timelapse is pending or running.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "pi-timelapse")]
#[command(about = "Preview and timelapse capture for a Raspberry Pi camera")]
struct Cli {
    /// JSON settings file; defaults apply when omitted.
    #[arg(long, global = true, env = "PI_TIMELAPSE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Each command drives its own controller and waits for it to finish, so the
/// process exits once the device is idle again.
#[derive(Subcommand, Debug)]
enum Command {
    /// Capture one photo into the configured preview path.
    Preview,
    /// Start a timelapse now.
    Timelapse {
        /// Run length in seconds.
        #[arg(value_parser = seconds)]
        duration: Duration,
        /// Seconds between captures.
        #[arg(value_parser = seconds)]
        interval: Duration,
    },
    /// Start a timelapse after a delay.
    Schedule {
        /// Delay before the run starts, in seconds.
        #[arg(value_parser = seconds)]
        delay: Duration,
        /// Run length in seconds.
        #[arg(value_parser = seconds)]
        duration: Duration,
        /// Seconds between captures.
        #[arg(value_parser = seconds)]
        interval: Duration,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run(Cli::parse()) {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = match &cli.config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };

    let controller = Controller::new(V4L2Driver::new(settings.device_index), settings);
    let output_root = controller.settings().output_root.clone();

    match cli.command {
        Command::Preview => {
            let path = controller.preview_default()?;
            info!(path = %path.display(), "preview written");
        }
        Command::Timelapse { duration, interval } => {
            let directory = controller.start_now(&output_root, duration, interval)?;
            info!(directory = %directory.display(), "timelapse started");
            watch(&controller)?;
        }
        Command::Schedule {
            delay,
            duration,
            interval,
        } => {
            controller.schedule(delay, &output_root, duration, interval)?;
            watch(&controller)?;
        }
    }

    println!("{}", serde_json::to_string(&controller.status())?);
    Ok(())
}

/// Log the status until the device is no longer busy.
fn watch(controller: &Controller<V4L2Driver>) -> Result<()> {
    loop {
        let status = controller.status();
        info!(status = %serde_json::to_string(&status)?, "status");
        if !status.is_busy() {
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn seconds(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .with_context(|| format!("invalid number of seconds {value:?}"))?;
    Ok(Duration::try_from_secs_f64(secs)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_flag_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["pi-timelapse", "timelapse", "60", "2.5", "--config", "x.json"])
            .expect("parse failed");
        assert_eq!(cli.config, Some(PathBuf::from("x.json")));
        assert!(matches!(
            cli.command,
            Command::Timelapse { duration, interval }
                if duration == Duration::from_secs(60) && interval == Duration::from_millis(2500)
        ));
    }

    #[test]
    fn test_negative_seconds_are_rejected() {
        assert!(seconds("-1").is_err());
        assert!(seconds("soon").is_err());
        assert_eq!(seconds("0.5").expect("valid"), Duration::from_millis(500));
    }
}
