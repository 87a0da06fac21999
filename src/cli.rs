//! Command-line surface.

use clap::{Parser, Subcommand};

/// Terminal music player engine.
#[derive(Debug, Parser)]
#[command(name = "kew", version, about = "Terminal music player")]
pub struct Cli {
    /// Exit the process when playback reaches a natural stop.
    #[arg(long)]
    pub quitonstop: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Enqueue a path or a library search match and start playing.
    Play {
        /// File, directory, `.m3u` playlist, or library name query.
        target: Option<String>,
    },
    /// Toggle pause.
    Pause,
    /// Stop playback.
    Stop,
    /// Skip to the next track.
    Next,
    /// Skip to the previous track.
    Prev,
    /// Toggle shuffle.
    Shuffle,
    /// Cycle the repeat mode.
    Repeat,
    /// Change the volume: `+5`, `-10`, `40`, or `40%`.
    Volume { amount: String },
    /// Print the current queue.
    List,
    /// Select a theme by name and persist the choice.
    Theme { name: String },
}

/// A parsed volume argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeChange {
    Adjust(i8),
    Set(u8),
}

/// Parses `+N`, `-N`, `N`, and `N%` volume arguments.
pub fn parse_volume_argument(raw: &str) -> Result<VolumeChange, String> {
    let trimmed = raw.trim().trim_end_matches('%');
    if trimmed.is_empty() {
        return Err("Volume argument is empty".to_string());
    }

    if let Some(rest) = trimmed.strip_prefix('+') {
        let step = rest
            .parse::<i8>()
            .map_err(|_| format!("Invalid volume step: {}", raw))?;
        return Ok(VolumeChange::Adjust(step));
    }
    if let Some(rest) = trimmed.strip_prefix('-') {
        let step = rest
            .parse::<i8>()
            .map_err(|_| format!("Invalid volume step: {}", raw))?;
        return Ok(VolumeChange::Adjust(-step));
    }

    let value = trimmed
        .parse::<u8>()
        .map_err(|_| format!("Invalid volume value: {}", raw))?;
    if value > 100 {
        return Err(format!("Volume must be within 0-100, got {}", value));
    }
    Ok(VolumeChange::Set(value))
}

#[cfg(test)]
mod tests {
    use super::{parse_volume_argument, Cli, Command, VolumeChange};
    use clap::Parser;

    #[test]
    fn test_parse_volume_argument_forms() {
        assert_eq!(parse_volume_argument("+5"), Ok(VolumeChange::Adjust(5)));
        assert_eq!(parse_volume_argument("-10"), Ok(VolumeChange::Adjust(-10)));
        assert_eq!(parse_volume_argument("40"), Ok(VolumeChange::Set(40)));
        assert_eq!(parse_volume_argument("40%"), Ok(VolumeChange::Set(40)));
        assert!(parse_volume_argument("140").is_err());
        assert!(parse_volume_argument("loud").is_err());
        assert!(parse_volume_argument("").is_err());
    }

    #[test]
    fn test_cli_parses_play_with_target() {
        let cli = Cli::parse_from(["kew", "play", "~/Music/album"]);
        match cli.command {
            Some(Command::Play { target: Some(target) }) => {
                assert_eq!(target, "~/Music/album")
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_parses_quitonstop_flag() {
        let cli = Cli::parse_from(["kew", "--quitonstop"]);
        assert!(cli.quitonstop);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_parses_volume_subcommand() {
        let cli = Cli::parse_from(["kew", "volume", "+5"]);
        match cli.command {
            Some(Command::Volume { amount }) => assert_eq!(amount, "+5"),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
