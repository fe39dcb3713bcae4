//! CLI argument parsing with clap.

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use super::enums::{Format, Tier};

/// Parse and validate a detection threshold (0-100 percent)
fn parse_threshold(s: &str) -> Result<u8, String> {
    let pct: u8 = s
        .parse()
        .map_err(|_| format!("'{}' is not a valid percentage", s))?;
    if pct > 100 {
        return Err(format!("Threshold must be between 0 and 100, got {}", pct));
    }
    Ok(pct)
}

/// Watches a camera feed and reports when the lens is covered
#[derive(Parser, Debug)]
#[command(name = "sensorpic")]
#[command(version, about = "Detects a blocked camera lens", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file path
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List available camera devices
    ListDevices,
    /// Run the detection pipeline
    Run(RunArgs),
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct RunArgs {
    /// Camera device id (from list-devices)
    #[arg(long, short)]
    pub device: Option<String>,

    /// Stop after this many seconds (default: run until Ctrl+C)
    #[arg(long, short)]
    pub seconds: Option<u64>,

    /// Detection threshold in percent
    #[arg(long, short, value_parser = parse_threshold)]
    pub threshold: Option<u8>,

    /// Pixel format delivered to the classifier
    #[arg(long, short)]
    pub format: Option<Format>,

    /// Lowest accepted hardware tier
    #[arg(long)]
    pub min_tier: Option<Tier>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Create default config file
    Init,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_threshold() {
        assert_eq!(parse_threshold("0"), Ok(0));
        assert_eq!(parse_threshold("75"), Ok(75));
        assert_eq!(parse_threshold("100"), Ok(100));
        assert!(parse_threshold("101").is_err());
        assert!(parse_threshold("-1").is_err());
        assert!(parse_threshold("high").is_err());
    }

    #[test]
    fn test_args_list_devices_subcommand() {
        let args = Args::parse_from(["sensorpic", "list-devices"]);
        assert!(matches!(args.command, Command::ListDevices));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_run_defaults() {
        let args = Args::parse_from(["sensorpic", "run"]);
        match args.command {
            Command::Run(run) => {
                assert!(run.device.is_none());
                assert!(run.seconds.is_none());
                assert!(run.threshold.is_none());
                assert!(run.format.is_none());
                assert!(run.min_tier.is_none());
            }
            _ => panic!("Expected Run subcommand"),
        }
    }

    #[test]
    fn test_args_run_options() {
        let args = Args::parse_from([
            "sensorpic",
            "run",
            "--device",
            "1",
            "--seconds",
            "5",
            "--threshold",
            "60",
            "--format",
            "nv21",
            "--min-tier",
            "limited",
            "--config",
            "/tmp/sensorpic.toml",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/sensorpic.toml")));
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.device.as_deref(), Some("1"));
                assert_eq!(run.seconds, Some(5));
                assert_eq!(run.threshold, Some(60));
                assert_eq!(run.format, Some(Format::Nv21));
                assert_eq!(run.min_tier, Some(Tier::Limited));
            }
            _ => panic!("Expected Run subcommand"),
        }
    }

    #[test]
    fn test_args_run_rejects_bad_threshold() {
        assert!(Args::try_parse_from(["sensorpic", "run", "--threshold", "150"]).is_err());
    }

    #[test]
    fn test_args_config_subcommands() {
        let args = Args::parse_from(["sensorpic", "config", "show"]);
        assert!(matches!(
            args.command,
            Command::Config {
                action: ConfigAction::Show
            }
        ));

        let args = Args::parse_from(["sensorpic", "-c", "/tmp/x.toml", "config", "init"]);
        assert!(matches!(
            args.command,
            Command::Config {
                action: ConfigAction::Init
            }
        ));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/x.toml")));
    }
}
