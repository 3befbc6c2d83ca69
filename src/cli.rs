//! Command-line interface for razor-voice
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time voice command orchestration
#[derive(Parser, Debug)]
#[command(name = "razor-voice", version, about = "Real-time voice command orchestration")]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress status output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device, matched by partial name
    #[arg(long, global = true, value_name = "DEVICE")]
    pub device: Option<String>,
}

impl Cli {
    /// `tracing` filter directive for the verbosity flags.
    ///
    /// `RUST_LOG` takes precedence when set.
    pub fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "razor_voice=info",
            (false, 1) => "razor_voice=debug",
            (false, _) => "razor_voice=trace",
        }
    }
}

/// Parse a duration string.
///
/// Supports any duration format accepted by `humantime`: bare numbers (seconds),
/// single-unit (`30s`, `5m`, `2h`), and compound (`1h30m`, `2m30s`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Capture audio and report speech segments and barge-in level hits
    Listen {
        /// Read a WAV file instead of the microphone (`-` for stdin)
        #[arg(long, value_name = "FILE")]
        wav: Option<PathBuf>,

        /// Stop after this long (e.g. 30s, 5m). Default: until Ctrl-C
        #[arg(long, short = 'd', value_name = "DURATION", value_parser = parse_duration)]
        duration: Option<Duration>,
    },

    /// List available audio input devices
    Devices,

    /// Play a WAV file through the playback engine, pinned to the output device
    Play {
        /// WAV file to play
        file: PathBuf,

        /// Output device override
        #[arg(long, value_name = "DEVICE")]
        output: Option<String>,
    },

    /// Supervise the Bluetooth headset link until Ctrl-C
    Bluetooth {
        /// Paired device name override
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
    },

    /// View and write configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration (file + environment) as TOML
    Show,
    /// Print the configuration file path
    Path,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_is_required() {
        let err = Cli::try_parse_from(["razor-voice"]).unwrap_err();
        assert_eq!(
            err.kind(),
            clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn test_parse_listen_defaults() {
        let cli = Cli::try_parse_from(["razor-voice", "listen"]).unwrap();
        match cli.command {
            Commands::Listen { wav, duration } => {
                assert!(wav.is_none());
                assert!(duration.is_none());
            }
            _ => panic!("Expected Listen command"),
        }
        assert!(!cli.quiet);
        assert_eq!(cli.verbose, 0);
        assert!(cli.config.is_none());
        assert!(cli.device.is_none());
    }

    #[test]
    fn test_parse_listen_with_options() {
        let cli = Cli::try_parse_from([
            "razor-voice",
            "listen",
            "--wav",
            "/tmp/hello.wav",
            "-d",
            "1m30s",
        ])
        .unwrap();
        match cli.command {
            Commands::Listen { wav, duration } => {
                assert_eq!(wav, Some(PathBuf::from("/tmp/hello.wav")));
                assert_eq!(duration, Some(Duration::from_secs(90)));
            }
            _ => panic!("Expected Listen command"),
        }
    }

    #[test]
    fn test_parse_verbose_counts() {
        let cli = Cli::try_parse_from(["razor-voice", "-vv", "devices"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_filter(), "razor_voice=trace");

        let cli = Cli::try_parse_from(["razor-voice", "devices", "-v"]).unwrap();
        assert_eq!(cli.log_filter(), "razor_voice=debug");
    }

    #[test]
    fn test_quiet_wins_over_verbose() {
        let cli = Cli::try_parse_from(["razor-voice", "-q", "-vv", "devices"]).unwrap();
        assert_eq!(cli.log_filter(), "error");
    }

    #[test]
    fn test_parse_play() {
        let cli =
            Cli::try_parse_from(["razor-voice", "play", "reply.wav", "--output", "Razor Buds"])
                .unwrap();
        match cli.command {
            Commands::Play { file, output } => {
                assert_eq!(file, PathBuf::from("reply.wav"));
                assert_eq!(output.as_deref(), Some("Razor Buds"));
            }
            _ => panic!("Expected Play command"),
        }
    }

    #[test]
    fn test_play_requires_file() {
        let err = Cli::try_parse_from(["razor-voice", "play"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_parse_bluetooth() {
        let cli = Cli::try_parse_from(["razor-voice", "bluetooth", "--name", "Buds"]).unwrap();
        match cli.command {
            Commands::Bluetooth { name } => assert_eq!(name.as_deref(), Some("Buds")),
            _ => panic!("Expected Bluetooth command"),
        }
    }

    #[test]
    fn test_parse_config_actions() {
        let cli = Cli::try_parse_from(["razor-voice", "config", "show"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));

        let cli = Cli::try_parse_from(["razor-voice", "config", "init", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Init { force: true }
            }
        ));
    }

    #[test]
    fn test_config_requires_subcommand() {
        assert!(Cli::try_parse_from(["razor-voice", "config"]).is_err());
    }

    #[test]
    fn test_global_options_after_command() {
        let cli = Cli::try_parse_from([
            "razor-voice",
            "listen",
            "--config",
            "/tmp/config.toml",
            "--device",
            "MacBook",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/config.toml")));
        assert_eq!(cli.device.as_deref(), Some("MacBook"));
    }

    #[test]
    fn test_parse_completions() {
        let cli = Cli::try_parse_from(["razor-voice", "completions", "zsh"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Completions { shell: Shell::Zsh }
        ));
    }

    #[test]
    fn test_invalid_command_returns_error() {
        let err = Cli::try_parse_from(["razor-voice", "record"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
    }

    #[test]
    fn test_version_flag() {
        let err = Cli::try_parse_from(["razor-voice", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
    }

    #[test]
    fn test_parse_duration_formats() {
        assert_eq!(parse_duration("45"), Ok(Duration::from_secs(45)));
        assert_eq!(parse_duration("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration(" 1h30m "), Ok(Duration::from_secs(5400)));
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }
}
