//! Persistent application configuration model and defaults.

use crate::protocol::RepeatMode;

/// Root configuration persisted to `kewrc`.
#[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize)]
pub struct Config {
    /// Music library location and cache policy.
    pub library: LibraryConfig,
    #[serde(default)]
    /// Playback step sizes and persistence flags.
    pub playback: PlaybackConfig,
    #[serde(default)]
    /// Terminal color selection.
    pub theme: ThemeConfig,
}

/// Library root and cache preferences.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LibraryConfig {
    #[serde(default = "default_music_root")]
    pub music_root: String,
    /// `None` until the user has answered the cache prompt once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_library: Option<bool>,
}

/// Playback tuning persisted between sessions.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_volume_step")]
    pub volume_step: u8,
    #[serde(default = "default_seek_step_seconds")]
    pub seek_step_seconds: f64,
    /// When set, shuffle/repeat survive restarts via `kewstaterc`.
    #[serde(default)]
    pub save_repeat_shuffle: bool,
    /// When set, reaching a natural stop exits the process.
    #[serde(default)]
    pub quit_on_stop: bool,
}

/// Color rendering mode for theme roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum ColorMode {
    /// 8-bit ANSI palette indices.
    Ansi,
    /// 24-bit RGB triples.
    Rgb,
}

/// Theme selection persisted between sessions.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct ThemeConfig {
    #[serde(default = "default_theme_name")]
    pub theme: String,
    #[serde(default = "default_color_mode")]
    pub color_mode: ColorMode,
}

/// Volatile state persisted to `kewstaterc` across runs.
///
/// Nothing beyond these fields is persisted.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PersistedState {
    #[serde(default = "default_volume")]
    pub volume: u8,
    #[serde(default = "default_theme_name")]
    pub theme: String,
    #[serde(default = "default_color_mode")]
    pub color_mode: ColorMode,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default = "default_repeat_mode")]
    pub repeat: RepeatMode,
    /// Unix seconds of the previous run, compared against library mtimes.
    #[serde(default)]
    pub last_time_app_ran: i64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            music_root: default_music_root(),
            cache_library: None,
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            volume_step: default_volume_step(),
            seek_step_seconds: default_seek_step_seconds(),
            save_repeat_shuffle: false,
            quit_on_stop: false,
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            theme: default_theme_name(),
            color_mode: default_color_mode(),
        }
    }
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            volume: default_volume(),
            theme: default_theme_name(),
            color_mode: default_color_mode(),
            shuffle: false,
            repeat: default_repeat_mode(),
            last_time_app_ran: 0,
        }
    }
}

fn default_music_root() -> String {
    "~/Music".to_string()
}

fn default_volume_step() -> u8 {
    5
}

fn default_seek_step_seconds() -> f64 {
    5.0
}

fn default_theme_name() -> String {
    "default".to_string()
}

fn default_color_mode() -> ColorMode {
    ColorMode::Rgb
}

fn default_volume() -> u8 {
    100
}

fn default_repeat_mode() -> RepeatMode {
    RepeatMode::Off
}

/// Sanitizes loaded config values into safe runtime ranges.
pub fn sanitize_config(config: Config) -> Config {
    let music_root = {
        let trimmed = config.library.music_root.trim();
        if trimmed.is_empty() {
            default_music_root()
        } else {
            trimmed.to_string()
        }
    };
    let theme = {
        let trimmed = config.theme.theme.trim();
        if trimmed.is_empty() {
            default_theme_name()
        } else {
            trimmed.to_string()
        }
    };

    Config {
        library: LibraryConfig {
            music_root,
            cache_library: config.library.cache_library,
        },
        playback: PlaybackConfig {
            volume_step: config.playback.volume_step.clamp(1, 25),
            seek_step_seconds: config.playback.seek_step_seconds.clamp(1.0, 60.0),
            save_repeat_shuffle: config.playback.save_repeat_shuffle,
            quit_on_stop: config.playback.quit_on_stop,
        },
        theme: ThemeConfig {
            theme,
            color_mode: config.theme.color_mode,
        },
    }
}

/// Sanitizes persisted state into safe runtime ranges.
pub fn sanitize_state(state: PersistedState) -> PersistedState {
    PersistedState {
        volume: state.volume.min(100),
        theme: if state.theme.trim().is_empty() {
            default_theme_name()
        } else {
            state.theme.trim().to_string()
        },
        color_mode: state.color_mode,
        shuffle: state.shuffle,
        repeat: state.repeat,
        last_time_app_ran: state.last_time_app_ran.max(0),
    }
}

/// Expands a leading `~` or `~/` to the user's home directory.
pub fn expand_home(path: &str) -> std::path::PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    std::path::PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::{sanitize_config, sanitize_state, ColorMode, Config, PersistedState};
    use crate::protocol::RepeatMode;

    #[test]
    fn test_default_config_has_expected_values() {
        let config = Config::default();

        assert_eq!(config.library.music_root, "~/Music");
        assert_eq!(config.library.cache_library, None);
        assert_eq!(config.playback.volume_step, 5);
        assert!((config.playback.seek_step_seconds - 5.0).abs() < f64::EPSILON);
        assert!(!config.playback.save_repeat_shuffle);
        assert!(!config.playback.quit_on_stop);
        assert_eq!(config.theme.theme, "default");
        assert_eq!(config.theme.color_mode, ColorMode::Rgb);
    }

    #[test]
    fn test_partial_config_deserialization_fills_defaults() {
        let partial = r#"
[library]
music_root = "/srv/music"
"#;
        let parsed: Config = toml::from_str(partial).expect("config should parse");
        assert_eq!(parsed.library.music_root, "/srv/music");
        assert_eq!(parsed.playback.volume_step, 5);
        assert_eq!(parsed.theme.theme, "default");
    }

    #[test]
    fn test_sanitize_config_clamps_steps_and_restores_empty_strings() {
        let mut config = Config::default();
        config.library.music_root = "   ".to_string();
        config.theme.theme = "".to_string();
        config.playback.volume_step = 200;
        config.playback.seek_step_seconds = 0.0;

        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.library.music_root, "~/Music");
        assert_eq!(sanitized.theme.theme, "default");
        assert_eq!(sanitized.playback.volume_step, 25);
        assert!((sanitized.playback.seek_step_seconds - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sanitize_state_clamps_volume_and_negative_timestamps() {
        let state = PersistedState {
            volume: 180,
            theme: " nord ".to_string(),
            color_mode: ColorMode::Ansi,
            shuffle: true,
            repeat: RepeatMode::List,
            last_time_app_ran: -5,
        };

        let sanitized = sanitize_state(state);
        assert_eq!(sanitized.volume, 100);
        assert_eq!(sanitized.theme, "nord");
        assert_eq!(sanitized.last_time_app_ran, 0);
        assert!(sanitized.shuffle);
        assert_eq!(sanitized.repeat, RepeatMode::List);
    }
}
