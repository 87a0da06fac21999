//! OS media controls bridge (MPRIS/SMTC/Now Playing).
//!
//! This manager connects the runtime event bus to the session-bus
//! media-player object via `souvlaki`: inbound control events map onto bus
//! messages, and playback status, metadata, position, and volume changes are
//! published back out.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, MediaPosition, PlatformConfig,
    SeekDirection,
};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::protocol::{
    LibraryMessage, Message, PlaybackStatus, PlayerMessage, SongData, SystemMessage, NO_TRACK_ID,
};

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "kew";
const MEDIA_CONTROLS_DBUS_NAME: &str = "kew";
const SEEK_STEP_US: u64 = 10_000_000;
/// Metadata emissions are debounced to at most one per this interval.
const METADATA_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, Default)]
struct ControlState {
    status: Option<PlaybackStatus>,
    elapsed_us: u64,
    duration_us: u64,
}

/// Handles remote control events and publishes engine playback state.
pub struct MediaControlsManager {
    bus_consumer: Receiver<Message>,
    control_state: Arc<Mutex<ControlState>>,
    controls: Option<MediaControls>,
    current_song: Option<SongData>,
    last_published_status: Option<PlaybackStatus>,
    last_published_track_id: Option<String>,
    last_metadata_publish: Option<Instant>,
    pending_metadata: bool,
}

impl MediaControlsManager {
    /// Creates a manager and attempts to initialize platform media controls.
    pub fn new(bus_consumer: Receiver<Message>, bus_producer: Sender<Message>) -> Self {
        let control_state = Arc::new(Mutex::new(ControlState::default()));
        let controls = Self::create_controls(bus_producer, Arc::clone(&control_state));

        Self {
            bus_consumer,
            control_state,
            controls,
            current_song: None,
            last_published_status: None,
            last_published_track_id: None,
            last_metadata_publish: None,
            pending_metadata: false,
        }
    }

    #[cfg(not(target_os = "windows"))]
    fn create_controls(
        bus_producer: Sender<Message>,
        control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        let mut controls = match MediaControls::new(PlatformConfig {
            display_name: MEDIA_CONTROLS_DISPLAY_NAME,
            dbus_name: MEDIA_CONTROLS_DBUS_NAME,
            hwnd: None,
        }) {
            Ok(controls) => controls,
            Err(err) => {
                warn!(
                    "MediaControlsManager: failed to create media controls backend: {:?}",
                    err
                );
                return None;
            }
        };

        if let Err(err) = controls.attach(move |event| {
            let snapshot = match control_state.lock() {
                Ok(state) => *state,
                Err(poisoned) => *poisoned.into_inner(),
            };

            for message in Self::map_control_event(event, snapshot) {
                let _ = bus_producer.send(message);
            }
        }) {
            warn!(
                "MediaControlsManager: failed to attach media controls handler: {:?}",
                err
            );
            return None;
        }

        Some(controls)
    }

    #[cfg(target_os = "windows")]
    fn create_controls(
        _bus_producer: Sender<Message>,
        _control_state: Arc<Mutex<ControlState>>,
    ) -> Option<MediaControls> {
        // Souvlaki requires an HWND on Windows, which a terminal process
        // does not have.
        warn!("MediaControlsManager: Windows media controls are disabled");
        None
    }

    fn map_control_event(event: MediaControlEvent, state: ControlState) -> Vec<Message> {
        match event {
            MediaControlEvent::Play => vec![Message::Player(PlayerMessage::Play)],
            MediaControlEvent::Pause => {
                if state.status == Some(PlaybackStatus::Playing) {
                    vec![Message::Player(PlayerMessage::TogglePause)]
                } else {
                    Vec::new()
                }
            }
            MediaControlEvent::Toggle => vec![Message::Player(PlayerMessage::TogglePause)],
            MediaControlEvent::Next => vec![Message::Player(PlayerMessage::Next)],
            MediaControlEvent::Previous => vec![Message::Player(PlayerMessage::Previous)],
            MediaControlEvent::Stop => vec![Message::Player(PlayerMessage::Stop)],
            MediaControlEvent::SetPosition(position) => {
                vec![Message::Player(PlayerMessage::SeekTo(
                    position.0.as_secs_f64(),
                ))]
            }
            MediaControlEvent::SeekBy(direction, delta) => {
                let delta_seconds = delta.as_secs_f64();
                let signed = match direction {
                    SeekDirection::Forward => delta_seconds,
                    SeekDirection::Backward => -delta_seconds,
                };
                vec![Message::Player(PlayerMessage::SeekBy(signed))]
            }
            MediaControlEvent::Seek(direction) => {
                let step = Duration::from_micros(SEEK_STEP_US).as_secs_f64();
                let signed = match direction {
                    SeekDirection::Forward => step,
                    SeekDirection::Backward => -step,
                };
                vec![Message::Player(PlayerMessage::SeekBy(signed))]
            }
            MediaControlEvent::SetVolume(volume) => {
                // Remote volume is [0.0, 1.0]; engine volume is [0, 100].
                // Values above 1.0 clamp to 1.0 on set.
                let engine_volume = (volume.clamp(0.0, 1.0) * 100.0).round() as u8;
                vec![Message::Player(PlayerMessage::SetVolume(engine_volume))]
            }
            MediaControlEvent::Quit => vec![Message::System(SystemMessage::Quit)],
            MediaControlEvent::OpenUri(uri) => {
                let path = uri.strip_prefix("file://").unwrap_or(uri.as_str());
                vec![Message::Library(LibraryMessage::Enqueue(
                    std::path::PathBuf::from(path),
                ))]
            }
            MediaControlEvent::Raise => Vec::new(),
        }
    }

    fn update_control_state<F>(&self, update: F)
    where
        F: FnOnce(&mut ControlState),
    {
        match self.control_state.lock() {
            Ok(mut state) => update(&mut state),
            Err(poisoned) => {
                let mut state = poisoned.into_inner();
                update(&mut state);
            }
        }
    }

    fn control_state_snapshot(&self) -> ControlState {
        match self.control_state.lock() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn publish_playback_if_needed(&mut self) {
        let snapshot = self.control_state_snapshot();
        let Some(status) = snapshot.status else {
            return;
        };
        if self.last_published_status == Some(status) {
            return;
        }
        let Some(controls) = self.controls.as_mut() else {
            return;
        };

        let progress = Some(MediaPosition(Duration::from_micros(snapshot.elapsed_us)));
        let playback = match status {
            PlaybackStatus::Stopped => MediaPlayback::Stopped,
            PlaybackStatus::Paused => MediaPlayback::Paused { progress },
            PlaybackStatus::Playing => MediaPlayback::Playing { progress },
        };

        if let Err(err) = controls.set_playback(playback) {
            warn!(
                "MediaControlsManager: failed to publish playback state {:?}: {:?}",
                status, err
            );
            return;
        }
        self.last_published_status = Some(status);
    }

    fn metadata_window_open(&self) -> bool {
        match self.last_metadata_publish {
            Some(published_at) => published_at.elapsed() >= METADATA_DEBOUNCE,
            None => true,
        }
    }

    /// Publishes the current song's metadata, or the empty NoTrack record
    /// when no song is loaded.
    fn publish_metadata(&mut self) {
        let snapshot_duration_us = self.control_state_snapshot().duration_us;
        let Some(controls) = self.controls.as_mut() else {
            return;
        };

        let publish_result = match self.current_song.as_ref() {
            Some(song) => {
                let duration_us = if song.duration > 0.0 {
                    (song.duration * 1_000_000.0) as u64
                } else {
                    snapshot_duration_us
                };
                let cover_url = song
                    .cover_art_path
                    .as_ref()
                    .map(|path| format!("file://{}", path.display()));
                controls.set_metadata(MediaMetadata {
                    title: Some(song.title.as_str()),
                    artist: Some(song.artist.as_str()),
                    album: Some(song.album.as_str()),
                    cover_url: cover_url.as_deref(),
                    duration: (duration_us > 0).then(|| Duration::from_micros(duration_us)),
                })
            }
            // End of list: an empty record stands in for the NoTrack entry.
            None => {
                debug!("MediaControlsManager: metadata cleared to {}", NO_TRACK_ID);
                controls.set_metadata(MediaMetadata::default())
            }
        };

        if let Err(err) = publish_result {
            warn!("MediaControlsManager: failed to publish metadata: {:?}", err);
            return;
        }
        self.last_published_track_id = self.current_song.as_ref().map(|song| song.track_id.clone());
        self.last_metadata_publish = Some(Instant::now());
        self.pending_metadata = false;
    }

    fn publish_metadata_debounced(&mut self) {
        let current_track_id = self.current_song.as_ref().map(|song| song.track_id.clone());
        if self.last_published_track_id == current_track_id && !self.pending_metadata {
            return;
        }
        if self.metadata_window_open() {
            self.publish_metadata();
        } else {
            self.pending_metadata = true;
        }
    }

    /// Flushes a deferred metadata emission once the debounce window passes.
    fn flush_pending_metadata(&mut self) {
        if self.pending_metadata && self.metadata_window_open() {
            self.publish_metadata();
        }
    }

    #[cfg(target_os = "linux")]
    fn publish_volume(&mut self, engine_volume: u8) {
        let Some(controls) = self.controls.as_mut() else {
            return;
        };
        // Engine volume [0, 100] reads as [0.0, 1.0] on the bus.
        let remote = f64::from(engine_volume.min(100)) / 100.0;
        if let Err(err) = controls.set_volume(remote) {
            warn!("MediaControlsManager: failed to publish volume: {:?}", err);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn publish_volume(&mut self, _engine_volume: u8) {}

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::Player(PlayerMessage::StatusChanged(status)) => {
                self.update_control_state(|state| {
                    state.status = Some(status);
                    if status == PlaybackStatus::Stopped {
                        state.elapsed_us = 0;
                        state.duration_us = 0;
                    }
                });
                if status == PlaybackStatus::Stopped {
                    self.current_song = None;
                    self.publish_metadata();
                }
                self.publish_playback_if_needed();
            }
            Message::Player(PlayerMessage::TrackSwitched { song, .. }) => {
                self.update_control_state(|state| {
                    state.elapsed_us = 0;
                    state.duration_us = (song.duration * 1_000_000.0) as u64;
                });
                self.current_song = Some(*song);
                self.publish_metadata_debounced();
            }
            Message::Player(PlayerMessage::ProgressChanged {
                elapsed_us,
                duration_us,
            }) => {
                self.update_control_state(|state| {
                    state.elapsed_us = elapsed_us;
                    if duration_us > 0 {
                        state.duration_us = duration_us;
                    }
                });
                self.flush_pending_metadata();
            }
            Message::Player(PlayerMessage::VolumeChanged(volume)) => {
                self.publish_volume(volume);
            }
            _ => {}
        }
    }

    /// Starts the blocking manager loop.
    pub fn run(&mut self) {
        info!("MediaControlsManager: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(Message::System(SystemMessage::Quit)) => break,
                Ok(message) => self.handle_message(message),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("MediaControlsManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControlState, MediaControlsManager};
    use crate::protocol::{Message, PlaybackStatus, PlayerMessage, SystemMessage};
    use souvlaki::{MediaControlEvent, MediaPosition, SeekDirection};
    use std::time::Duration;

    #[test]
    fn test_pause_event_is_dropped_unless_playing() {
        let playing = ControlState {
            status: Some(PlaybackStatus::Playing),
            elapsed_us: 0,
            duration_us: 0,
        };
        let stopped = ControlState {
            status: Some(PlaybackStatus::Stopped),
            elapsed_us: 0,
            duration_us: 0,
        };

        let messages =
            MediaControlsManager::map_control_event(MediaControlEvent::Pause, playing);
        assert!(matches!(
            messages.as_slice(),
            [Message::Player(PlayerMessage::TogglePause)]
        ));

        let messages =
            MediaControlsManager::map_control_event(MediaControlEvent::Pause, stopped);
        assert!(messages.is_empty());
    }

    #[test]
    fn test_set_position_maps_to_absolute_seek_seconds() {
        let state = ControlState::default();
        let messages = MediaControlsManager::map_control_event(
            MediaControlEvent::SetPosition(MediaPosition(Duration::from_micros(25_000_000))),
            state,
        );
        match messages.as_slice() {
            [Message::Player(PlayerMessage::SeekTo(seconds))] => {
                assert!((seconds - 25.0).abs() < 1e-9)
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_seek_by_backward_is_negative() {
        let state = ControlState::default();
        let messages = MediaControlsManager::map_control_event(
            MediaControlEvent::SeekBy(SeekDirection::Backward, Duration::from_secs(4)),
            state,
        );
        match messages.as_slice() {
            [Message::Player(PlayerMessage::SeekBy(delta))] => {
                assert!((delta + 4.0).abs() < 1e-9)
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn test_remote_volume_scales_and_clamps_to_engine_range() {
        let state = ControlState::default();

        let messages =
            MediaControlsManager::map_control_event(MediaControlEvent::SetVolume(0.5), state);
        assert!(matches!(
            messages.as_slice(),
            [Message::Player(PlayerMessage::SetVolume(50))]
        ));

        // Values above 1.0 clamp to 1.0 on set.
        let messages =
            MediaControlsManager::map_control_event(MediaControlEvent::SetVolume(1.5), state);
        assert!(matches!(
            messages.as_slice(),
            [Message::Player(PlayerMessage::SetVolume(100))]
        ));
    }

    #[test]
    fn test_quit_event_maps_to_system_quit() {
        let state = ControlState::default();
        let messages =
            MediaControlsManager::map_control_event(MediaControlEvent::Quit, state);
        assert!(matches!(
            messages.as_slice(),
            [Message::System(SystemMessage::Quit)]
        ));
    }
}
