//! `kewrc`/`kewstaterc` persistence helpers with comment-preserving TOML
//! updates.
//!
//! Rewrites go through `toml_edit` so user comments and unknown keys survive
//! verbatim; only changed values are touched.

use std::path::{Path, PathBuf};

use log::warn;
use toml_edit::{value, DocumentMut, Item, Table};

use crate::config::{sanitize_config, sanitize_state, ColorMode, Config, PersistedState};
use crate::protocol::RepeatMode;

/// Resolves `{config_dir}/kew`, creating it when missing.
pub fn config_root() -> Result<PathBuf, String> {
    let base = dirs::config_dir().ok_or_else(|| "No config directory for platform".to_string())?;
    let root = base.join("kew");
    std::fs::create_dir_all(&root)
        .map_err(|err| format!("Failed to create config directory {}: {}", root.display(), err))?;
    Ok(root)
}

pub fn config_file_path(root: &Path) -> PathBuf {
    root.join("kewrc")
}

pub fn state_file_path(root: &Path) -> PathBuf {
    root.join("kewstaterc")
}

pub fn library_cache_path(root: &Path) -> PathBuf {
    root.join("library.cache")
}

pub fn themes_dir(root: &Path) -> PathBuf {
    root.join("themes")
}

/// Loads and sanitizes `kewrc`; a missing or unreadable file yields defaults.
pub fn load_config(path: &Path) -> Config {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return sanitize_config(Config::default()),
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => sanitize_config(config),
        Err(err) => {
            warn!(
                "Config file {} failed to parse, using defaults: {}",
                path.display(),
                err
            );
            sanitize_config(Config::default())
        }
    }
}

/// Loads and sanitizes `kewstaterc`; a missing file yields defaults.
pub fn load_state(path: &Path) -> PersistedState {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return PersistedState::default(),
    };
    match toml::from_str::<PersistedState>(&content) {
        Ok(state) => sanitize_state(state),
        Err(err) => {
            warn!(
                "State file {} failed to parse, using defaults: {}",
                path.display(),
                err
            );
            PersistedState::default()
        }
    }
}

fn set_table_value_preserving_decor(table: &mut Table, key: &str, item: Item) {
    let existing_value_decor = table
        .get(key)
        .and_then(|current| current.as_value().map(|val| val.decor().clone()));
    table[key] = item;
    if let Some(existing_value_decor) = existing_value_decor {
        if let Some(next_value) = table[key].as_value_mut() {
            *next_value.decor_mut() = existing_value_decor;
        }
    }
}

fn ensure_section_table(document: &mut DocumentMut, key: &str) {
    let root = document.as_table_mut();
    let should_replace = !matches!(root.get(key), Some(item) if item.is_table());
    if should_replace {
        root.insert(key, Item::Table(Table::new()));
    }
}

fn color_mode_text(mode: ColorMode) -> &'static str {
    match mode {
        ColorMode::Ansi => "Ansi",
        ColorMode::Rgb => "Rgb",
    }
}

fn repeat_mode_text(mode: RepeatMode) -> &'static str {
    match mode {
        RepeatMode::Off => "Off",
        RepeatMode::Track => "Track",
        RepeatMode::List => "List",
    }
}

fn write_config_to_document(document: &mut DocumentMut, config: &Config) {
    ensure_section_table(document, "library");
    ensure_section_table(document, "playback");
    ensure_section_table(document, "theme");

    {
        let library = document["library"]
            .as_table_mut()
            .expect("library should be a table");
        set_table_value_preserving_decor(
            library,
            "music_root",
            value(config.library.music_root.clone()),
        );
        if let Some(cache_library) = config.library.cache_library {
            set_table_value_preserving_decor(library, "cache_library", value(cache_library));
        }
    }

    {
        let playback = document["playback"]
            .as_table_mut()
            .expect("playback should be a table");
        set_table_value_preserving_decor(
            playback,
            "volume_step",
            value(i64::from(config.playback.volume_step)),
        );
        set_table_value_preserving_decor(
            playback,
            "seek_step_seconds",
            value(config.playback.seek_step_seconds),
        );
        set_table_value_preserving_decor(
            playback,
            "save_repeat_shuffle",
            value(config.playback.save_repeat_shuffle),
        );
        set_table_value_preserving_decor(
            playback,
            "quit_on_stop",
            value(config.playback.quit_on_stop),
        );
    }

    {
        let theme = document["theme"]
            .as_table_mut()
            .expect("theme should be a table");
        set_table_value_preserving_decor(theme, "theme", value(config.theme.theme.clone()));
        set_table_value_preserving_decor(
            theme,
            "color_mode",
            value(color_mode_text(config.theme.color_mode)),
        );
    }
}

fn write_state_to_document(document: &mut DocumentMut, state: &PersistedState) {
    let root = document.as_table_mut();
    set_table_value_preserving_decor(root, "volume", value(i64::from(state.volume)));
    set_table_value_preserving_decor(root, "theme", value(state.theme.clone()));
    set_table_value_preserving_decor(root, "color_mode", value(color_mode_text(state.color_mode)));
    set_table_value_preserving_decor(root, "shuffle", value(state.shuffle));
    set_table_value_preserving_decor(root, "repeat", value(repeat_mode_text(state.repeat)));
    set_table_value_preserving_decor(root, "last_time_app_ran", value(state.last_time_app_ran));
}

fn load_document(path: &Path) -> DocumentMut {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.parse::<DocumentMut>().ok())
        .unwrap_or_default()
}

/// Rewrites `kewrc`, preserving comments and keys it does not own.
pub fn persist_config(path: &Path, config: &Config) {
    let mut document = load_document(path);
    write_config_to_document(&mut document, config);
    if let Err(err) = std::fs::write(path, document.to_string()) {
        warn!("Failed to write config file {}: {}", path.display(), err);
    }
}

/// Rewrites `kewstaterc`, preserving comments and keys it does not own.
pub fn persist_state(path: &Path, state: &PersistedState) {
    let mut document = load_document(path);
    write_state_to_document(&mut document, state);
    if let Err(err) = std::fs::write(path, document.to_string()) {
        warn!("Failed to write state file {}: {}", path.display(), err);
    }
}

#[cfg(test)]
mod tests {
    use super::{load_config, load_state, persist_config, persist_state};
    use crate::config::{ColorMode, Config, PersistedState};
    use crate::protocol::RepeatMode;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!("kew_{}_{}_{}", test_name, std::process::id(), nanos))
    }

    #[test]
    fn test_config_write_then_read_preserves_recognized_keys() {
        let path = unique_temp_file("config_roundtrip");
        let mut config = Config::default();
        config.library.music_root = "/srv/music".to_string();
        config.library.cache_library = Some(true);
        config.playback.volume_step = 10;
        config.playback.save_repeat_shuffle = true;
        config.theme.theme = "nord".to_string();
        config.theme.color_mode = ColorMode::Ansi;

        persist_config(&path, &config);
        let reloaded = load_config(&path);

        assert_eq!(reloaded.library.music_root, "/srv/music");
        assert_eq!(reloaded.library.cache_library, Some(true));
        assert_eq!(reloaded.playback.volume_step, 10);
        assert!(reloaded.playback.save_repeat_shuffle);
        assert_eq!(reloaded.theme.theme, "nord");
        assert_eq!(reloaded.theme.color_mode, ColorMode::Ansi);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_config_rewrite_preserves_comments_and_unknown_keys() {
        let path = unique_temp_file("config_preserve");
        let seeded = r#"# user notes stay put
[library]
music_root = "/srv/music" # inline note
legacy_knob = "kept"

[playback]
volume_step = 7
"#;
        std::fs::write(&path, seeded).expect("seed config should be writable");

        let mut config = load_config(&path);
        config.playback.volume_step = 9;
        persist_config(&path, &config);

        let rewritten = std::fs::read_to_string(&path).expect("config should be readable");
        assert!(rewritten.contains("# user notes stay put"));
        assert!(rewritten.contains("# inline note"));
        assert!(rewritten.contains("legacy_knob = \"kept\""));
        assert!(rewritten.contains("volume_step = 9"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_state_write_then_read_round_trips_all_fields() {
        let path = unique_temp_file("state_roundtrip");
        let state = PersistedState {
            volume: 42,
            theme: "mocha".to_string(),
            color_mode: ColorMode::Ansi,
            shuffle: true,
            repeat: RepeatMode::Track,
            last_time_app_ran: 1_700_000_000,
        };

        persist_state(&path, &state);
        let reloaded = load_state(&path);

        assert_eq!(reloaded.volume, 42);
        assert_eq!(reloaded.theme, "mocha");
        assert_eq!(reloaded.color_mode, ColorMode::Ansi);
        assert!(reloaded.shuffle);
        assert_eq!(reloaded.repeat, RepeatMode::Track);
        assert_eq!(reloaded.last_time_app_ran, 1_700_000_000);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_unparseable_config_falls_back_to_defaults() {
        let path = unique_temp_file("config_corrupt");
        std::fs::write(&path, "this is not toml [[[").expect("seed should be writable");

        let config = load_config(&path);
        assert_eq!(config.library.music_root, "~/Music");

        let _ = std::fs::remove_file(&path);
    }
}
