//! `.m3u`/`.m3u8` playlist reading and favorites export.

use std::path::{Path, PathBuf};

use log::warn;

use crate::media_file_discovery::is_supported_audio_file;
use crate::playlist::queue::PlayQueue;

/// Reads an `.m3u`/`.m3u8` file into the queue.
///
/// `#`-prefixed lines are comments/directives; relative entries resolve
/// against the playlist file's directory; missing or unsupported files are
/// skipped with a warning. Returns the paths that were enqueued, in order.
pub fn load_playlist_file(path: &Path, queue: &mut PlayQueue) -> Result<Vec<PathBuf>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|err| format!("Failed to read playlist {}: {}", path.display(), err))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut enqueued = Vec::new();
    for raw_line in content.lines() {
        let line = raw_line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let entry = PathBuf::from(line);
        let resolved = if entry.is_absolute() {
            entry
        } else {
            base_dir.join(entry)
        };

        if !resolved.is_file() {
            warn!(
                "Playlist entry {} does not exist, skipping",
                resolved.display()
            );
            continue;
        }
        if !is_supported_audio_file(&resolved) {
            warn!(
                "Playlist entry {} is not a supported audio file, skipping",
                resolved.display()
            );
            continue;
        }

        match queue.enqueue(&resolved) {
            Ok(_) => enqueued.push(resolved),
            Err(err) => warn!("Failed to enqueue playlist entry: {}", err),
        }
    }

    Ok(enqueued)
}

/// Writes the favorites list as an `.m3u` into the music root, named after
/// the first favorite's file stem. Returns the written path.
pub fn export_favorites(queue: &PlayQueue, music_root: &Path) -> Result<PathBuf, String> {
    let favorites = queue.favorites();
    let first = favorites
        .first()
        .ok_or_else(|| "No favorites to export".to_string())?;

    let stem = first
        .path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("favorites");
    let target = music_root.join(format!("{}.m3u", stem));

    let mut content = String::from("#EXTM3U\n");
    for favorite in favorites {
        content.push_str(&favorite.path.to_string_lossy());
        content.push('\n');
    }

    std::fs::write(&target, content)
        .map_err(|err| format!("Failed to write favorites {}: {}", target.display(), err))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::{export_favorites, load_playlist_file};
    use crate::playlist::queue::PlayQueue;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_directory(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        let dir =
            std::env::temp_dir().join(format!("kew_{}_{}_{}", test_name, std::process::id(), nanos));
        std::fs::create_dir_all(&dir).expect("test directory should be created");
        dir
    }

    #[test]
    fn test_load_playlist_file_resolves_relative_entries_and_skips_missing() {
        let dir = unique_temp_directory("m3u_load");
        std::fs::write(dir.join("one.mp3"), b"").expect("fixture should be writable");
        std::fs::write(dir.join("two.flac"), b"").expect("fixture should be writable");
        let playlist_path = dir.join("mix.m3u");
        std::fs::write(
            &playlist_path,
            "#EXTM3U\n#EXTINF:123,Artist - One\none.mp3\nmissing.mp3\ntwo.flac\nnotes.txt\n",
        )
        .expect("playlist should be writable");
        std::fs::write(dir.join("notes.txt"), b"").expect("fixture should be writable");

        let mut queue = PlayQueue::new();
        let enqueued = load_playlist_file(&playlist_path, &mut queue).expect("playlist loads");

        assert_eq!(enqueued, vec![dir.join("one.mp3"), dir.join("two.flac")]);
        assert_eq!(queue.len(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_playlist_file_tolerates_byte_order_mark() {
        let dir = unique_temp_directory("m3u_bom");
        std::fs::write(dir.join("one.mp3"), b"").expect("fixture should be writable");
        let playlist_path = dir.join("mix.m3u8");
        std::fs::write(&playlist_path, "\u{feff}one.mp3\n").expect("playlist should be writable");

        let mut queue = PlayQueue::new();
        let enqueued = load_playlist_file(&playlist_path, &mut queue).expect("playlist loads");
        assert_eq!(enqueued.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_export_favorites_names_file_after_first_track() {
        let dir = unique_temp_directory("m3u_export");
        let mut queue = PlayQueue::new();
        let first = queue
            .enqueue(&dir.join("Morning Song.flac"))
            .expect("enqueue should succeed");
        let second = queue
            .enqueue(&dir.join("Evening Song.flac"))
            .expect("enqueue should succeed");
        queue.add_favorite(first);
        queue.add_favorite(second);

        let written = export_favorites(&queue, &dir).expect("export should succeed");
        assert_eq!(written, dir.join("Morning Song.m3u"));

        let content = std::fs::read_to_string(&written).expect("export should be readable");
        assert!(content.starts_with("#EXTM3U\n"));
        assert!(content.contains("Morning Song.flac"));
        assert!(content.contains("Evening Song.flac"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_export_favorites_with_no_favorites_fails() {
        let dir = unique_temp_directory("m3u_export_empty");
        let queue = PlayQueue::new();
        assert!(export_favorites(&queue, &dir).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
