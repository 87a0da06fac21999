//! Event-bus protocol shared by all runtime components.
//!
//! This module defines all message payloads exchanged between the player
//! engine, playlist logic, the library scanner, media controls, and the
//! control plane.

use std::path::{Path, PathBuf};

/// Repeat behavior applied when the active track reaches end-of-stream.
///
/// `Track` and `List` are mutually exclusive states of one mode value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum RepeatMode {
    Off,   // Stop after reaching the end of the play order
    Track, // Rewind the active decoder on EOF, current song unchanged
    List,  // Wrap to the head of the play order on end-of-list
}

impl RepeatMode {
    /// Cycles Off -> List -> Track -> Off, the order used by the repeat key.
    pub fn cycled(self) -> RepeatMode {
        match self {
            RepeatMode::Off => RepeatMode::List,
            RepeatMode::List => RepeatMode::Track,
            RepeatMode::Track => RepeatMode::Off,
        }
    }
}

/// Coarse playback status reported to the control plane and the remote bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackStatus {
    Stopped,
    Playing,
    Paused,
}

/// One timed (or untimed) lyric line embedded in a track's tags.
#[derive(Debug, Clone, PartialEq)]
pub struct LyricLine {
    /// Millisecond offset for synced lyrics, `None` for plain text lines.
    pub timestamp_ms: Option<u64>,
    pub text: String,
}

/// Decoded metadata record for one song, produced by a loader thread.
#[derive(Debug, Clone, Default)]
pub struct SongData {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Date string as discovered from tags.
    pub date: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Cover art extracted next to the config cache, if any.
    pub cover_art_path: Option<PathBuf>,
    pub sample_rate_hz: u32,
    pub avg_bitrate_kbps: u32,
    /// Embedded lyrics, possibly timestamped.
    pub lyrics: Vec<LyricLine>,
    /// Set when the loader failed to open a decoder for this song.
    pub has_errors: bool,
    /// Object-path-safe identity derived from the file path, used for
    /// external-bus addressing.
    pub track_id: String,
}

/// Builds the object-path-safe track identity for external-bus addressing.
///
/// Every character outside `[A-Za-z0-9]` maps to `_` so the result is valid
/// as the final element of a D-Bus object path.
pub fn track_id_from_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let sanitized: String = raw
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    format!("/org/kew/Track/{}", sanitized)
}

/// Sentinel trackid published when no track is loaded.
pub const NO_TRACK_ID: &str = "/org/mpris/MediaPlayer2/TrackList/NoTrack";

/// Names one of the two decoder slots used for gapless streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotId {
    A,
    B,
}

impl SlotId {
    pub fn other(self) -> SlotId {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }
}

/// Result of one asynchronous song load.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Box<SongData>),
    Failed { reason: String },
}

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Player(PlayerMessage),
    Playlist(PlaylistMessage),
    Library(LibraryMessage),
    State(StateMessage),
    System(SystemMessage),
}

/// Player-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum PlayerMessage {
    Play,
    TogglePause,
    Stop,
    Next,
    Previous,
    SkipToNumbered(usize),
    SkipToLast,
    /// Relative seek in seconds (negative seeks backwards).
    SeekBy(f64),
    /// Absolute seek target in seconds.
    SeekTo(f64),
    /// Absolute seek target as a fraction of the current song's duration,
    /// used by progress-bar drag commits.
    SeekToFraction(f32),
    /// Engine volume in `[0, 100]`.
    SetVolume(u8),
    /// Signed step applied to the engine volume.
    AdjustVolume(i8),
    CycleRepeat,
    ToggleShuffle,
    /// Raised by the device callback when the active slot ran dry.
    EndOfSongReached,
    /// Loader thread handoff; stale generations are discarded by the engine.
    SlotLoaded {
        slot: SlotId,
        generation: u64,
        track_id: u64,
        outcome: LoadOutcome,
    },
    /// Exactly one of these is emitted per observable track transition.
    TrackSwitched {
        track_id: u64,
        song: Box<SongData>,
    },
    StatusChanged(PlaybackStatus),
    VolumeChanged(u8),
    ShuffleChanged(bool),
    RepeatChanged(RepeatMode),
    /// Elapsed/duration snapshot in microseconds for remote controllers.
    ProgressChanged {
        elapsed_us: u64,
        duration_us: u64,
    },
}

/// Playlist-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum PlaylistMessage {
    /// Remove the playlist row at this display-order position.
    RemoveRow(usize),
    RemoveId(u64),
    MoveUp(usize),
    MoveDown(usize),
    DequeueAllExceptPlaying,
    AddCurrentToFavorites,
    ExportFavorites,
    LoadPlaylistFile(PathBuf),
    /// Notification that the queue contents changed.
    QueueChanged,
}

/// Library-domain commands and notifications.
#[derive(Debug, Clone)]
pub enum LibraryMessage {
    /// Schedule a full background rescan of the music root.
    RequestRescan,
    /// Toggle sibling ordering between natural and folders-by-age.
    ToggleSort,
    /// Enqueue the subtree (or leaf) rooted at this path.
    Enqueue(PathBuf),
    /// Enqueue and immediately start playback from the first enqueued leaf.
    EnqueueAndPlay(PathBuf),
    /// Resolve a name query against the tree, then enqueue-and-play it.
    EnqueueQueryAndPlay(String),
    /// A background rescan published a new tree.
    TreeReplaced { entry_count: usize },
}

/// Persisted-state updates routed to the config writer.
#[derive(Debug, Clone)]
pub enum StateMessage {
    ThemeChanged(String),
    CacheLibraryAnswered(bool),
    /// Any persisted-state field changed; rewrite `kewstaterc` on shutdown.
    StateDirty,
}

/// Process-level control.
#[derive(Debug, Clone)]
pub enum SystemMessage {
    Quit,
}

#[cfg(test)]
mod tests {
    use super::{track_id_from_path, RepeatMode};
    use std::path::Path;

    #[test]
    fn test_track_id_sanitizes_non_alphanumeric_bytes() {
        let id = track_id_from_path(Path::new("/home/user/Music/Song (live).flac"));
        assert_eq!(id, "/org/kew/Track/_home_user_Music_Song__live__flac");
    }

    #[test]
    fn test_track_id_is_object_path_safe() {
        let id = track_id_from_path(Path::new("/tmp/ä ö ü.mp3"));
        assert!(id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '/'));
    }

    #[test]
    fn test_repeat_mode_cycles_through_all_states() {
        assert_eq!(RepeatMode::Off.cycled(), RepeatMode::List);
        assert_eq!(RepeatMode::List.cycled(), RepeatMode::Track);
        assert_eq!(RepeatMode::Track.cycled(), RepeatMode::Off);
    }
}
