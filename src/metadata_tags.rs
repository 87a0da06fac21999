//! Tag, lyric, and cover-art readers backed by `lofty`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use lofty::config::{ParseOptions, ParsingMode};
use lofty::file::TaggedFile;
use lofty::file::TaggedFileExt;
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use log::{debug, warn};

use crate::protocol::{track_id_from_path, LyricLine, SongData};

fn first_non_empty_value<F>(primary_tag: Option<&Tag>, tags: &[Tag], mut extractor: F) -> String
where
    F: FnMut(&Tag) -> Option<String>,
{
    if let Some(tag) = primary_tag {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    for tag in tags {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    String::new()
}

fn metadata_parse_options(
    read_cover_art: bool,
    parsing_mode: ParsingMode,
    max_junk_bytes: usize,
) -> ParseOptions {
    ParseOptions::new()
        .read_properties(false)
        .read_cover_art(read_cover_art)
        .parsing_mode(parsing_mode)
        .max_junk_bytes(max_junk_bytes)
}

fn read_tagged_file(path: &Path, read_cover_art: bool) -> Option<TaggedFile> {
    let primary_options = metadata_parse_options(read_cover_art, ParsingMode::BestAttempt, 1024);
    let relaxed_options = metadata_parse_options(read_cover_art, ParsingMode::Relaxed, 64 * 1024);

    match Probe::open(path) {
        Ok(probe) => match probe.options(primary_options).read() {
            Ok(tagged_file) => return Some(tagged_file),
            Err(primary_error) => {
                debug!(
                    "Metadata read primary parse failed for {}: {}",
                    path.display(),
                    primary_error
                );
            }
        },
        Err(open_error) => {
            debug!(
                "Metadata read could not open {}: {}",
                path.display(),
                open_error
            );
        }
    }

    let file = File::open(path).ok()?;
    let guessed_probe = Probe::new(BufReader::new(file))
        .options(relaxed_options)
        .guess_file_type()
        .ok()?;
    match guessed_probe.read() {
        Ok(tagged_file) => {
            debug!(
                "Metadata read recovered via relaxed parsing for {}",
                path.display()
            );
            Some(tagged_file)
        }
        Err(error) => {
            warn!("Metadata read failed for {}: {}", path.display(), error);
            None
        }
    }
}

/// Parses one LRC-style lyric line; untimed lines pass through unchanged.
fn parse_lyric_line(raw: &str) -> Option<LyricLine> {
    let trimmed = raw.trim_end();
    if trimmed.trim().is_empty() {
        return None;
    }

    let stripped = trimmed.trim_start();
    if let Some(rest) = stripped.strip_prefix('[') {
        if let Some((stamp, text)) = rest.split_once(']') {
            if let Some(timestamp_ms) = parse_lrc_timestamp(stamp) {
                return Some(LyricLine {
                    timestamp_ms: Some(timestamp_ms),
                    text: text.trim().to_string(),
                });
            }
        }
    }

    Some(LyricLine {
        timestamp_ms: None,
        text: stripped.to_string(),
    })
}

/// Parses `mm:ss`, `mm:ss.cc`, or `mm:ss.mmm` into milliseconds.
fn parse_lrc_timestamp(stamp: &str) -> Option<u64> {
    let (minutes, seconds_part) = stamp.split_once(':')?;
    let minutes = minutes.trim().parse::<u64>().ok()?;
    let (seconds, fraction) = match seconds_part.split_once('.') {
        Some((seconds, fraction)) => (seconds, Some(fraction)),
        None => (seconds_part, None),
    };
    let seconds = seconds.trim().parse::<u64>().ok()?;
    if seconds >= 60 {
        return None;
    }
    let fraction_ms = match fraction {
        None => 0,
        Some(fraction) => {
            let digits: String = fraction.chars().take(3).collect();
            if digits.is_empty() || !digits.chars().all(|ch| ch.is_ascii_digit()) {
                return None;
            }
            let value = digits.parse::<u64>().ok()?;
            match digits.len() {
                1 => value * 100,
                2 => value * 10,
                _ => value,
            }
        }
    };
    Some((minutes * 60 + seconds) * 1_000 + fraction_ms)
}

fn parse_lyrics(raw: &str) -> Vec<LyricLine> {
    raw.lines()
        .filter_map(parse_lyric_line)
        .filter(|line| line.timestamp_ms.is_some() || !line.text.is_empty())
        .collect()
}

/// Estimated tag overhead in bytes, subtracted before bitrate estimation.
fn metadata_size(path: &Path) -> u64 {
    let mut total_size = 0;
    if let Ok(mut file) = File::open(path) {
        let file_size = file.metadata().map(|meta| meta.len()).unwrap_or(0);
        if file_size == 0 {
            return 0;
        }

        use std::io::{Read, Seek, SeekFrom};
        let mut header = [0u8; 10];
        if file.read_exact(&mut header).is_ok() && &header[0..3] == b"ID3" {
            let size = ((header[6] as u32 & 0x7F) << 21)
                | ((header[7] as u32 & 0x7F) << 14)
                | ((header[8] as u32 & 0x7F) << 7)
                | (header[9] as u32 & 0x7F);
            total_size += (size + 10) as u64;
        }

        if file_size > 128 {
            let _ = file.seek(SeekFrom::End(-128));
            let mut id3v1 = [0u8; 3];
            if file.read_exact(&mut id3v1).is_ok() && &id3v1 == b"TAG" {
                total_size += 128;
            }
        }
    }
    total_size
}

/// Average bitrate in kbps estimated from audio payload size and duration.
pub fn estimate_bitrate_kbps(path: &Path, duration_seconds: f64) -> u32 {
    if duration_seconds <= 0.0 {
        return 0;
    }
    let Ok(file_metadata) = std::fs::metadata(path) else {
        return 0;
    };
    let file_size = file_metadata.len();
    let tag_size = metadata_size(path);
    let audio_data_size = file_size.saturating_sub(tag_size).max(1);
    let bits_per_second = audio_data_size as f64 * 8.0 / duration_seconds;
    (bits_per_second / 1000.0).round() as u32
}

fn sniff_image_extension(data: &[u8]) -> &'static str {
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else {
        "jpg"
    }
}

/// Writes embedded cover art into `covers_dir`, returning the written path.
pub fn extract_cover_art(path: &Path, covers_dir: &Path) -> Option<PathBuf> {
    let tagged_file = read_tagged_file(path, true)?;
    let picture_data = tagged_file
        .primary_tag()
        .and_then(|tag| tag.pictures().first())
        .or_else(|| {
            tagged_file
                .tags()
                .iter()
                .find_map(|tag| tag.pictures().first())
        })
        .map(|picture| picture.data().to_vec())?;
    if picture_data.is_empty() {
        return None;
    }

    if let Err(err) = std::fs::create_dir_all(covers_dir) {
        warn!(
            "Failed to create covers directory {}: {}",
            covers_dir.display(),
            err
        );
        return None;
    }

    let stem: String = path
        .to_string_lossy()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    let target = covers_dir.join(format!(
        "{}.{}",
        stem,
        sniff_image_extension(&picture_data)
    ));
    match std::fs::write(&target, picture_data) {
        Ok(()) => Some(target),
        Err(err) => {
            warn!("Failed to write cover art {}: {}", target.display(), err);
            None
        }
    }
}

/// Reads tags into a `SongData` shell. Duration, sample rate and bitrate are
/// filled in by the loader once a decoder is open.
pub fn read_song_data(path: &Path, covers_dir: Option<&Path>) -> SongData {
    let tagged_file = read_tagged_file(path, false);
    let (primary_tag, tags): (Option<&Tag>, &[Tag]) = match tagged_file.as_ref() {
        Some(tagged) => (tagged.primary_tag(), tagged.tags()),
        None => (None, &[]),
    };

    let fallback_title = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Unknown")
        .to_string();

    let title = {
        let tagged_title = first_non_empty_value(primary_tag, tags, |tag| {
            tag.title().map(|value| value.into_owned())
        });
        if tagged_title.is_empty() {
            fallback_title
        } else {
            tagged_title
        }
    };
    let artist = first_non_empty_value(primary_tag, tags, |tag| {
        tag.artist().map(|value| value.into_owned())
    });
    let album = first_non_empty_value(primary_tag, tags, |tag| {
        tag.album().map(|value| value.into_owned())
    });
    let date = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::RecordingDate)
            .or_else(|| tag.get_string(ItemKey::ReleaseDate))
            .or_else(|| tag.get_string(ItemKey::OriginalReleaseDate))
            .or_else(|| tag.get_string(ItemKey::Year))
            .map(str::to_string)
    });
    let lyrics_text = first_non_empty_value(primary_tag, tags, |tag| {
        tag.get_string(ItemKey::Lyrics).map(str::to_string)
    });

    let cover_art_path = covers_dir.and_then(|dir| extract_cover_art(path, dir));

    SongData {
        title,
        artist,
        album,
        date,
        duration: 0.0,
        cover_art_path,
        sample_rate_hz: 0,
        avg_bitrate_kbps: 0,
        lyrics: parse_lyrics(&lyrics_text),
        has_errors: false,
        track_id: track_id_from_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::{estimate_bitrate_kbps, parse_lrc_timestamp, parse_lyrics, read_song_data};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_file(test_name: &str, extension: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "kew_{}_{}_{}.{}",
            test_name,
            std::process::id(),
            nanos,
            extension
        ))
    }

    #[test]
    fn test_parse_lrc_timestamp_variants() {
        assert_eq!(parse_lrc_timestamp("01:23"), Some(83_000));
        assert_eq!(parse_lrc_timestamp("01:23.45"), Some(83_450));
        assert_eq!(parse_lrc_timestamp("00:05.1"), Some(5_100));
        assert_eq!(parse_lrc_timestamp("00:05.123"), Some(5_123));
        assert_eq!(parse_lrc_timestamp("1:75"), None);
        assert_eq!(parse_lrc_timestamp("oops"), None);
    }

    #[test]
    fn test_parse_lyrics_mixes_timed_and_untimed_lines() {
        let lyrics = parse_lyrics("[00:12.00] first line\nplain line\n\n[00:15] second");
        assert_eq!(lyrics.len(), 3);
        assert_eq!(lyrics[0].timestamp_ms, Some(12_000));
        assert_eq!(lyrics[0].text, "first line");
        assert_eq!(lyrics[1].timestamp_ms, None);
        assert_eq!(lyrics[1].text, "plain line");
        assert_eq!(lyrics[2].timestamp_ms, Some(15_000));
    }

    #[test]
    fn test_read_song_data_falls_back_to_file_stem_title() {
        let path = unique_temp_file("untagged", "mp3");
        std::fs::write(&path, b"not really audio").expect("fixture should be writable");

        let song = read_song_data(&path, None);
        assert!(song.title.starts_with("kew_untagged"));
        assert!(song.artist.is_empty());
        assert!(song.track_id.starts_with("/org/kew/Track/"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_estimate_bitrate_uses_payload_size() {
        let path = unique_temp_file("bitrate", "mp3");
        // 40_000 bytes over 2 seconds is 160 kbps.
        std::fs::write(&path, vec![0u8; 40_000]).expect("fixture should be writable");

        assert_eq!(estimate_bitrate_kbps(&path, 2.0), 160);
        assert_eq!(estimate_bitrate_kbps(&path, 0.0), 0);

        let _ = std::fs::remove_file(&path);
    }
}
