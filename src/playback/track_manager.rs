//! Dual-decoder load orchestration.
//!
//! Loads run on transient threads: open a format decoder, read tags and
//! cover art, adapt to the device format, then publish into the target slot
//! under the loader lock. Every load carries a generation token; completions
//! whose generation no longer matches are discarded without publishing.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use tokio::sync::broadcast::Sender;

use crate::audio::audio_decoder::{DeviceAdaptedSource, PcmFrameSource, SymphoniaDecoder};
use crate::audio::audio_device::SlotContent;
use crate::metadata_tags::{estimate_bitrate_kbps, read_song_data};
use crate::playback::playback_state::PlaybackState;
use crate::playback::player_engine::EngineShared;
use crate::playlist::queue::PlayQueue;
use crate::protocol::{LoadOutcome, Message, PlayerMessage, RepeatMode, SlotId};

/// Loader-lock state: the generation current loads must carry to publish.
#[derive(Debug, Default)]
pub struct LoaderState {
    pub generation: u64,
}

impl LoaderState {
    /// Invalidates every in-flight load.
    pub fn bump(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

/// The play-list node that would follow `current` under the current repeat
/// and shuffle settings. Repeat-track is handled at EOF time, so pre-loading
/// always looks at the play-order successor.
pub fn choose_next(playback: &PlaybackState, queue: &PlayQueue) -> Option<u64> {
    let current = playback.current?;
    match queue.next_in_play(current) {
        Some(next) => Some(next),
        None if playback.repeat == RepeatMode::List => queue.head_of_play(),
        None => None,
    }
}

/// Resolves which song a `play()` from Stopped should start with.
///
/// Order of preference: an explicit resume hint left by a dequeue, the
/// successor of the last played id, then the head or tail fallback.
pub fn determine_resume_song(playback: &PlaybackState, queue: &PlayQueue) -> Option<u64> {
    if queue.is_empty() {
        return None;
    }
    if playback.waiting_for_playlist {
        return queue.head_of_play();
    }
    if playback.waiting_for_next {
        if let Some(hint) = playback.song_to_start_from {
            // The hint is an id; re-resolve it in case the song was removed
            // after the hint was set.
            if queue.song(hint).is_some() {
                return Some(hint);
            }
        }
        if let Some(last_played) = playback.last_played_id {
            if queue.song(last_played).is_some() {
                return queue
                    .next_in_play(last_played)
                    .or(Some(last_played));
            }
        }
        return if playback.start_from_top {
            queue.head_of_play()
        } else {
            queue.tail_of_play()
        };
    }
    playback
        .current
        .filter(|id| queue.song(*id).is_some())
        .or_else(|| queue.head_of_play())
}

/// Spawns a loader for `track_id` into `slot`.
///
/// The caller holds the playback lock, has set `song_loading`, and passes
/// the generation the load belongs to.
pub fn spawn_song_load(
    shared: &Arc<EngineShared>,
    bus_sender: &Sender<Message>,
    track_id: u64,
    path: PathBuf,
    slot: SlotId,
    generation: u64,
) {
    let shared = Arc::clone(shared);
    let bus_sender = bus_sender.clone();
    thread::Builder::new()
        .name(format!("kew-loader-{}", track_id))
        .spawn(move || {
            run_song_load(&shared, &bus_sender, track_id, path, slot, generation);
        })
        .expect("loader thread should spawn");
}

fn run_song_load(
    shared: &Arc<EngineShared>,
    bus_sender: &Sender<Message>,
    track_id: u64,
    path: PathBuf,
    slot: SlotId,
    generation: u64,
) {
    let outcome = match open_and_prepare(shared, &path) {
        Ok((source, song)) => {
            // Publish under the loader lock so stale completions can never
            // overwrite a fresher slot.
            let loader = shared.loader.lock().expect("loader state lock poisoned");
            if loader.generation != generation {
                debug!(
                    "Loader: discarding stale load for track {} (generation {} != {})",
                    track_id, generation, loader.generation
                );
                return;
            }
            shared.slots.slot(slot).publish(SlotContent {
                track_id,
                source,
                song: (*song).clone(),
            });
            drop(loader);
            LoadOutcome::Loaded(song)
        }
        Err(reason) => {
            warn!("Loader: failed to load {}: {}", path.display(), reason);
            let loader = shared.loader.lock().expect("loader state lock poisoned");
            if loader.generation != generation {
                return;
            }
            drop(loader);
            LoadOutcome::Failed { reason }
        }
    };

    let _ = bus_sender.send(Message::Player(PlayerMessage::SlotLoaded {
        slot,
        generation,
        track_id,
        outcome,
    }));
}

fn open_and_prepare(
    shared: &Arc<EngineShared>,
    path: &PathBuf,
) -> Result<(DeviceAdaptedSource, Box<crate::protocol::SongData>), String> {
    let decoder = SymphoniaDecoder::open(path)?;

    let mut song = read_song_data(path, shared.covers_dir.as_deref());
    song.duration = decoder.duration_seconds();
    song.sample_rate_hz = decoder.sample_rate();
    song.avg_bitrate_kbps = estimate_bitrate_kbps(path, song.duration);
    if !song.lyrics.is_empty() {
        let timed = song
            .lyrics
            .iter()
            .filter(|line| line.timestamp_ms.is_some())
            .count();
        debug!(
            "Loader: {} decoder, {} embedded lyric lines ({} timed) for {}",
            decoder.format_name(),
            song.lyrics.len(),
            timed,
            path.display()
        );
    }

    let (device_rate, device_channels) = shared.device_format()?;
    let source = DeviceAdaptedSource::new(Box::new(decoder), device_rate, device_channels);
    Ok((source, Box::new(song)))
}

#[cfg(test)]
mod tests {
    use super::{choose_next, determine_resume_song};
    use crate::playback::playback_state::PlaybackState;
    use crate::playlist::queue::PlayQueue;
    use crate::protocol::RepeatMode;
    use std::path::PathBuf;

    fn queue_with_tracks(count: usize) -> (PlayQueue, Vec<u64>) {
        let mut queue = PlayQueue::new();
        let ids = (0..count)
            .map(|index| {
                queue
                    .enqueue(&PathBuf::from(format!("/music/track_{}.flac", index)))
                    .expect("enqueue should succeed")
            })
            .collect();
        (queue, ids)
    }

    #[test]
    fn test_choose_next_follows_play_order() {
        let (queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.current = Some(ids[0]);
        assert_eq!(choose_next(&playback, &queue), Some(ids[1]));
    }

    #[test]
    fn test_choose_next_at_tail_stops_without_repeat_list() {
        let (queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.current = Some(ids[2]);
        assert_eq!(choose_next(&playback, &queue), None);
    }

    #[test]
    fn test_choose_next_at_tail_wraps_with_repeat_list() {
        let (queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.current = Some(ids[2]);
        playback.repeat = RepeatMode::List;
        assert_eq!(choose_next(&playback, &queue), Some(ids[0]));
    }

    #[test]
    fn test_resume_prefers_song_to_start_from_hint() {
        let (queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.waiting_for_next = true;
        playback.song_to_start_from = Some(ids[2]);
        assert_eq!(determine_resume_song(&playback, &queue), Some(ids[2]));
    }

    #[test]
    fn test_resume_re_resolves_removed_hint_through_last_played() {
        let (mut queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.waiting_for_next = true;
        playback.song_to_start_from = Some(ids[2]);
        playback.last_played_id = Some(ids[0]);
        queue.remove(ids[2]);

        // The stored hint is stale; the successor of the last played id wins.
        assert_eq!(determine_resume_song(&playback, &queue), Some(ids[1]));
    }

    #[test]
    fn test_resume_falls_back_to_head_when_nothing_is_known() {
        let (queue, ids) = queue_with_tracks(2);
        let mut playback = PlaybackState::new();
        playback.waiting_for_next = true;
        playback.start_from_top = true;
        assert_eq!(determine_resume_song(&playback, &queue), Some(ids[0]));
    }

    #[test]
    fn test_resume_on_empty_queue_is_none() {
        let queue = PlayQueue::new();
        let playback = PlaybackState::new();
        assert_eq!(determine_resume_song(&playback, &queue), None);
    }

    #[test]
    fn test_waiting_for_playlist_starts_from_head() {
        let (queue, ids) = queue_with_tracks(3);
        let mut playback = PlaybackState::new();
        playback.waiting_for_playlist = true;
        assert_eq!(determine_resume_song(&playback, &queue), Some(ids[0]));
    }
}
