//! Theme file loading and runtime color resolution.
//!
//! Themes are `*.theme` files inside the `themes/` subdirectory of the
//! config root. Each line assigns a named color role either an 8-bit ANSI
//! palette index or an RGB triple; `#` starts a comment.

use std::path::{Path, PathBuf};

use log::warn;

use crate::config::ColorMode;

/// One theme color, stored the way the theme file declared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeColor {
    /// 8-bit ANSI palette index.
    Ansi(u8),
    Rgb(u8, u8, u8),
}

impl ThemeColor {
    /// Maps the color into the 256-color palette for `ColorMode::Ansi`
    /// terminals (6x6x6 cube approximation for RGB values).
    pub fn to_ansi_index(self) -> u8 {
        match self {
            ThemeColor::Ansi(index) => index,
            ThemeColor::Rgb(r, g, b) => {
                let to_cube = |component: u8| (u16::from(component) * 5 / 255) as u8;
                16 + 36 * to_cube(r) + 6 * to_cube(g) + to_cube(b)
            }
        }
    }

    /// Returns the RGB triple, expanding ANSI indices through the standard
    /// 256-color palette layout.
    pub fn to_rgb(self) -> (u8, u8, u8) {
        match self {
            ThemeColor::Rgb(r, g, b) => (r, g, b),
            ThemeColor::Ansi(index) => ansi_index_to_rgb(index),
        }
    }

    /// Resolves the color under the configured terminal color mode.
    pub fn resolve(self, mode: ColorMode) -> ThemeColor {
        match mode {
            ColorMode::Ansi => ThemeColor::Ansi(self.to_ansi_index()),
            ColorMode::Rgb => {
                let (r, g, b) = self.to_rgb();
                ThemeColor::Rgb(r, g, b)
            }
        }
    }
}

fn ansi_index_to_rgb(index: u8) -> (u8, u8, u8) {
    const BASE16: [(u8, u8, u8); 16] = [
        (0, 0, 0),
        (128, 0, 0),
        (0, 128, 0),
        (128, 128, 0),
        (0, 0, 128),
        (128, 0, 128),
        (0, 128, 128),
        (192, 192, 192),
        (128, 128, 128),
        (255, 0, 0),
        (0, 255, 0),
        (255, 255, 0),
        (0, 0, 255),
        (255, 0, 255),
        (0, 255, 255),
        (255, 255, 255),
    ];
    if index < 16 {
        return BASE16[index as usize];
    }
    if index < 232 {
        let cube = index - 16;
        let scale = |component: u8| if component == 0 { 0 } else { 55 + component * 40 };
        return (
            scale(cube / 36),
            scale((cube % 36) / 6),
            scale(cube % 6),
        );
    }
    let gray = 8 + (index - 232) * 10;
    (gray, gray, gray)
}

/// Named color roles a renderer draws with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    pub logo: ThemeColor,
    pub nowplaying: ThemeColor,
    pub artist: ThemeColor,
    pub album: ThemeColor,
    pub year: ThemeColor,
    pub title: ThemeColor,
    pub visualizer: ThemeColor,
    pub progress_filled: ThemeColor,
    pub progress_empty: ThemeColor,
    pub playlist: ThemeColor,
    pub library: ThemeColor,
    pub error: ThemeColor,
}

impl Theme {
    /// Resolves every role under the configured terminal color mode.
    pub fn resolved(&self, mode: ColorMode) -> Theme {
        Theme {
            logo: self.logo.resolve(mode),
            nowplaying: self.nowplaying.resolve(mode),
            artist: self.artist.resolve(mode),
            album: self.album.resolve(mode),
            year: self.year.resolve(mode),
            title: self.title.resolve(mode),
            visualizer: self.visualizer.resolve(mode),
            progress_filled: self.progress_filled.resolve(mode),
            progress_empty: self.progress_empty.resolve(mode),
            playlist: self.playlist.resolve(mode),
            library: self.library.resolve(mode),
            error: self.error.resolve(mode),
        }
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            logo: ThemeColor::Ansi(6),
            nowplaying: ThemeColor::Ansi(15),
            artist: ThemeColor::Ansi(7),
            album: ThemeColor::Ansi(7),
            year: ThemeColor::Ansi(8),
            title: ThemeColor::Ansi(15),
            visualizer: ThemeColor::Ansi(6),
            progress_filled: ThemeColor::Ansi(6),
            progress_empty: ThemeColor::Ansi(8),
            playlist: ThemeColor::Ansi(7),
            library: ThemeColor::Ansi(7),
            error: ThemeColor::Ansi(9),
        }
    }
}

/// Parses one theme color value: `15`, `255,200,100`, or `#aabbcc`.
pub fn parse_theme_color(raw: &str) -> Option<ThemeColor> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(hex) = trimmed.strip_prefix('#') {
        if hex.len() == 6 && hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
            let r = u8::from_str_radix(&hex[0..2], 16).ok()?;
            let g = u8::from_str_radix(&hex[2..4], 16).ok()?;
            let b = u8::from_str_radix(&hex[4..6], 16).ok()?;
            return Some(ThemeColor::Rgb(r, g, b));
        }
        return None;
    }

    if trimmed.contains(',') {
        let mut parts = trimmed.split(',').map(str::trim);
        let r = parts.next()?.parse::<u8>().ok()?;
        let g = parts.next()?.parse::<u8>().ok()?;
        let b = parts.next()?.parse::<u8>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        return Some(ThemeColor::Rgb(r, g, b));
    }

    trimmed.parse::<u8>().ok().map(ThemeColor::Ansi)
}

fn apply_theme_role(theme: &mut Theme, role: &str, color: ThemeColor) -> bool {
    match role {
        "logo" => theme.logo = color,
        "nowplaying" => theme.nowplaying = color,
        "artist" => theme.artist = color,
        "album" => theme.album = color,
        "year" => theme.year = color,
        "title" => theme.title = color,
        "visualizer" => theme.visualizer = color,
        "progress-filled" => theme.progress_filled = color,
        "progress-empty" => theme.progress_empty = color,
        "playlist" => theme.playlist = color,
        "library" => theme.library = color,
        "error" => theme.error = color,
        _ => return false,
    }
    true
}

/// Parses theme file text; unknown roles are ignored with a warning.
pub fn parse_theme_text(text: &str) -> Theme {
    let mut theme = Theme::default();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((role, raw_value)) = line.split_once('=') else {
            continue;
        };
        let role = role.trim().to_ascii_lowercase();
        match parse_theme_color(raw_value) {
            Some(color) => {
                if !apply_theme_role(&mut theme, role.as_str(), color) {
                    warn!("Theme: unknown color role '{}'", role);
                }
            }
            None => warn!("Theme: unparseable color value for role '{}'", role),
        }
    }
    theme
}

/// Loads `{themes_dir}/{name}.theme`; missing or unreadable files yield the
/// built-in default theme.
pub fn resolve_theme(themes_dir: &Path, name: &str) -> Theme {
    let path = themes_dir.join(format!("{}.theme", name.trim()));
    match std::fs::read_to_string(&path) {
        Ok(text) => parse_theme_text(&text),
        Err(_) => {
            if name.trim() != "default" {
                warn!("Theme: '{}' not found, using built-in default", name);
            }
            Theme::default()
        }
    }
}

/// Lists theme names available in the themes directory, sorted.
pub fn available_themes(themes_dir: &Path) -> Vec<String> {
    let mut names = Vec::new();
    let Ok(entries) = std::fs::read_dir(themes_dir) else {
        return names;
    };
    for entry in entries.flatten() {
        let path: PathBuf = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("theme") {
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
    }
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::{parse_theme_color, parse_theme_text, ThemeColor};
    use crate::config::ColorMode;

    #[test]
    fn test_parse_theme_color_accepts_all_three_forms() {
        assert_eq!(parse_theme_color("15"), Some(ThemeColor::Ansi(15)));
        assert_eq!(
            parse_theme_color("255, 200, 100"),
            Some(ThemeColor::Rgb(255, 200, 100))
        );
        assert_eq!(
            parse_theme_color("#aabbcc"),
            Some(ThemeColor::Rgb(0xaa, 0xbb, 0xcc))
        );
    }

    #[test]
    fn test_parse_theme_color_rejects_malformed_values() {
        assert_eq!(parse_theme_color(""), None);
        assert_eq!(parse_theme_color("256"), None);
        assert_eq!(parse_theme_color("1,2"), None);
        assert_eq!(parse_theme_color("#12345"), None);
        assert_eq!(parse_theme_color("1,2,3,4"), None);
    }

    #[test]
    fn test_parse_theme_text_applies_roles_and_ignores_comments() {
        let theme = parse_theme_text(
            "# my theme\nnowplaying = 10 # bright green\nprogress-filled = #00ff00\nunknown-role = 1\n",
        );
        assert_eq!(theme.nowplaying, ThemeColor::Ansi(10));
        assert_eq!(theme.progress_filled, ThemeColor::Rgb(0, 255, 0));
        // Untouched roles keep the defaults.
        assert_eq!(theme.logo, ThemeColor::Ansi(6));
    }

    #[test]
    fn test_rgb_color_downconverts_for_ansi_terminals() {
        let resolved = ThemeColor::Rgb(255, 0, 0).resolve(ColorMode::Ansi);
        assert_eq!(resolved, ThemeColor::Ansi(196));
    }

    #[test]
    fn test_ansi_cube_index_expands_to_rgb() {
        assert_eq!(ThemeColor::Ansi(196).to_rgb(), (255, 0, 0));
        assert_eq!(ThemeColor::Ansi(232).to_rgb(), (8, 8, 8));
    }
}
