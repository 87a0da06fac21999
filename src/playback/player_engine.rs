//! The playback engine: state machine, slot rotation, and queue mutations.
//!
//! `EngineShared` owns every piece of state the subsystems coordinate on.
//! Lock order, to prevent deadlock: playback -> playlist (queue) ->
//! library tree -> data-source (device) -> loader. No other order is
//! allowed, and the playback lock is never held across I/O.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::audio::audio_device::{AudioDevice, DecoderSlots};
use crate::library::library_tree::LibraryTree;
use crate::playback::playback_state::{PendingActivation, PlaybackState};
use crate::playback::track_manager::{
    choose_next, determine_resume_song, spawn_song_load, LoaderState,
};
use crate::playlist::m3u;
use crate::playlist::queue::PlayQueue;
use crate::protocol::{
    LoadOutcome, Message, PlaybackStatus, PlayerMessage, PlaylistMessage, RepeatMode, SlotId,
    SongData, StateMessage, SystemMessage,
};

const MAX_FIRST_LOAD_FAILURES: u32 = 3;
const ERROR_MESSAGE_CAPACITY: usize = 256;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// The single user-visible error message slot.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    message: String,
    has_been_printed: bool,
}

impl ErrorSlot {
    /// Stores a message, truncated to the slot capacity on a char boundary.
    pub fn set(&mut self, message: &str) {
        let mut truncated = message.to_string();
        if truncated.len() > ERROR_MESSAGE_CAPACITY {
            let mut cut = ERROR_MESSAGE_CAPACITY;
            while !truncated.is_char_boundary(cut) {
                cut -= 1;
            }
            truncated.truncate(cut);
        }
        self.message = truncated;
        self.has_been_printed = false;
    }

    pub fn current(&self) -> Option<&str> {
        if self.message.is_empty() {
            None
        } else {
            Some(&self.message)
        }
    }

    /// Called by the renderer once the message reached the screen.
    pub fn mark_printed(&mut self) {
        self.has_been_printed = true;
    }

    /// Returns the message if it has not been shown yet, marking it shown.
    pub fn take_unprinted(&mut self) -> Option<String> {
        if self.has_been_printed {
            return None;
        }
        let message = self.current()?.to_string();
        self.mark_printed();
        Some(message)
    }

    pub fn clear(&mut self) {
        self.message.clear();
        self.has_been_printed = false;
    }

    /// State changes clear the slot only after at least one draw cycle.
    pub fn clear_if_printed(&mut self) {
        if self.has_been_printed {
            self.clear();
        }
    }
}

/// Shared mutable state of the engine, protected by the documented locks.
pub struct EngineShared {
    /// Playback lock: playback state, decoder-slot flags, cross-thread flags.
    pub playback: Mutex<PlaybackState>,
    /// Playlist lock: both orders and the favorites list.
    pub queue: Mutex<PlayQueue>,
    /// The live library tree; replaced atomically by rescans.
    pub library_tree: Mutex<LibraryTree>,
    /// Data-source lock: guards device teardown against the callback.
    pub device: Mutex<Option<AudioDevice>>,
    /// Loader lock: serializes completion handoff into a slot.
    pub loader: Mutex<LoaderState>,
    pub slots: Arc<DecoderSlots>,
    /// Gate read by the device callback.
    pub is_playing: Arc<AtomicBool>,
    /// Engine volume in `[0, 100]`, read by the device callback.
    pub volume: Arc<AtomicU32>,
    /// Raised by any mutation a renderer would redraw for.
    refresh_triggered: AtomicBool,
    pub error_slot: Mutex<ErrorSlot>,
    /// Where loaders drop extracted cover art.
    pub covers_dir: Option<PathBuf>,
    device_format: Mutex<Option<(u32, u16)>>,
}

impl EngineShared {
    pub fn new(covers_dir: Option<PathBuf>) -> Arc<EngineShared> {
        Arc::new(EngineShared {
            playback: Mutex::new(PlaybackState::new()),
            queue: Mutex::new(PlayQueue::new()),
            library_tree: Mutex::new(LibraryTree::empty()),
            device: Mutex::new(None),
            loader: Mutex::new(LoaderState::default()),
            slots: Arc::new(DecoderSlots::new()),
            is_playing: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(AtomicU32::new(100)),
            refresh_triggered: AtomicBool::new(false),
            error_slot: Mutex::new(ErrorSlot::default()),
            covers_dir,
            device_format: Mutex::new(None),
        })
    }

    /// Device output format, probed once and cached. Loaders adapt decoders
    /// to this before the device stream exists.
    pub fn device_format(&self) -> Result<(u32, u16), String> {
        let mut cached = self
            .device_format
            .lock()
            .expect("device format lock poisoned");
        if let Some(format) = *cached {
            return Ok(format);
        }
        let format = AudioDevice::probe_default_format()?;
        *cached = Some(format);
        Ok(format)
    }

    pub fn trigger_refresh(&self) {
        self.refresh_triggered.store(true, Ordering::Release);
    }

    /// Consumes the refresh signal; the renderer calls this per frame.
    pub fn take_refresh(&self) -> bool {
        self.refresh_triggered.swap(false, Ordering::AcqRel)
    }

    pub fn set_error(&self, message: &str) {
        self.error_slot
            .lock()
            .expect("error slot lock poisoned")
            .set(message);
        self.trigger_refresh();
    }
}

/// Bus-driven playback engine.
pub struct PlayerEngine {
    bus_receiver: Receiver<Message>,
    bus_sender: Sender<Message>,
    shared: Arc<EngineShared>,
    music_root: PathBuf,
    quit_on_stop: bool,
    last_emitted_status: PlaybackStatus,
}

impl PlayerEngine {
    pub fn new(
        bus_receiver: Receiver<Message>,
        bus_sender: Sender<Message>,
        shared: Arc<EngineShared>,
        music_root: PathBuf,
        quit_on_stop: bool,
    ) -> PlayerEngine {
        Self::spawn_progress_reporter(&bus_sender, &shared);
        PlayerEngine {
            bus_receiver,
            bus_sender,
            shared,
            music_root,
            quit_on_stop,
            last_emitted_status: PlaybackStatus::Stopped,
        }
    }

    fn spawn_progress_reporter(bus_sender: &Sender<Message>, shared: &Arc<EngineShared>) {
        let bus_sender = bus_sender.clone();
        let shared = Arc::clone(shared);
        thread::spawn(move || loop {
            thread::sleep(PROGRESS_INTERVAL);
            if !shared.is_playing.load(Ordering::Relaxed) {
                continue;
            }
            let elapsed_us = {
                let playback = shared.playback.lock().expect("playback lock poisoned");
                playback.clock.elapsed_us()
            };
            let duration_us = {
                let slot = shared.slots.active_slot();
                if slot.is_unloaded() {
                    0
                } else {
                    slot.lock_content()
                        .as_ref()
                        .map(|content| (content.song.duration * 1_000_000.0) as u64)
                        .unwrap_or(0)
                }
            };
            let _ = bus_sender.send(Message::Player(PlayerMessage::ProgressChanged {
                elapsed_us,
                duration_us,
            }));
        });
    }

    fn emit(&self, message: PlayerMessage) {
        let _ = self.bus_sender.send(Message::Player(message));
    }

    fn emit_status(&mut self, status: PlaybackStatus) {
        if self.last_emitted_status == status {
            return;
        }
        self.last_emitted_status = status;
        self.emit(PlayerMessage::StatusChanged(status));
    }

    fn state_changed(&self) {
        self.shared
            .error_slot
            .lock()
            .expect("error slot lock poisoned")
            .clear_if_printed();
        self.shared.trigger_refresh();
    }

    /// Starts the blocking event loop that reacts to bus messages.
    pub fn run(&mut self) {
        info!("PlayerEngine: started");
        loop {
            match self.bus_receiver.blocking_recv() {
                Ok(Message::Player(message)) => self.handle_player_message(message),
                Ok(Message::Playlist(message)) => self.handle_playlist_message(message),
                Ok(Message::System(SystemMessage::Quit)) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("PlayerEngine: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("PlayerEngine: stopped");
    }

    fn handle_player_message(&mut self, message: PlayerMessage) {
        match message {
            PlayerMessage::Play => self.handle_play(),
            PlayerMessage::TogglePause => self.handle_toggle_pause(),
            PlayerMessage::Stop => self.handle_stop(),
            PlayerMessage::Next => self.handle_next(),
            PlayerMessage::Previous => self.handle_previous(),
            PlayerMessage::SkipToNumbered(number) => self.handle_skip_to_numbered(number),
            PlayerMessage::SkipToLast => {
                let last = {
                    let queue = self.shared.queue.lock().expect("queue lock poisoned");
                    queue.len()
                };
                if last > 0 {
                    self.handle_skip_to_numbered(last);
                }
            }
            PlayerMessage::SeekBy(delta) => self.handle_seek_by(delta),
            PlayerMessage::SeekTo(target) => self.handle_seek_to(target),
            PlayerMessage::SeekToFraction(fraction) => {
                let duration = {
                    let slot = self.shared.slots.active_slot();
                    if slot.is_unloaded() {
                        0.0
                    } else {
                        slot.lock_content()
                            .as_ref()
                            .map(|content| content.song.duration)
                            .unwrap_or(0.0)
                    }
                };
                if duration > 0.0 {
                    self.handle_seek_to(f64::from(fraction.clamp(0.0, 1.0)) * duration);
                }
            }
            PlayerMessage::SetVolume(volume) => self.handle_set_volume(volume),
            PlayerMessage::AdjustVolume(delta) => {
                let current = self.shared.volume.load(Ordering::Relaxed) as i32;
                let next = (current + i32::from(delta)).clamp(0, 100);
                self.handle_set_volume(next as u8);
            }
            PlayerMessage::CycleRepeat => {
                let next = {
                    let playback = self.shared.playback.lock().expect("playback lock poisoned");
                    playback.repeat.cycled()
                };
                self.handle_set_repeat(next);
            }
            PlayerMessage::ToggleShuffle => {
                let next = {
                    let playback = self.shared.playback.lock().expect("playback lock poisoned");
                    !playback.shuffle
                };
                self.handle_set_shuffle(next);
            }
            PlayerMessage::EndOfSongReached => {
                debug!(
                    "PlayerEngine: end of stream signaled (pending={})",
                    self.shared.slots.eof_pending()
                );
                self.handle_eof();
            }
            PlayerMessage::SlotLoaded {
                slot,
                generation,
                track_id,
                outcome,
            } => self.handle_slot_loaded(slot, generation, track_id, outcome),
            // Notifications the engine itself emitted.
            PlayerMessage::TrackSwitched { .. }
            | PlayerMessage::StatusChanged(_)
            | PlayerMessage::VolumeChanged(_)
            | PlayerMessage::ShuffleChanged(_)
            | PlayerMessage::RepeatChanged(_)
            | PlayerMessage::ProgressChanged { .. } => {}
        }
    }

    fn handle_playlist_message(&mut self, message: PlaylistMessage) {
        match message {
            PlaylistMessage::RemoveRow(row) => {
                let id = {
                    let queue = self.shared.queue.lock().expect("queue lock poisoned");
                    queue.id_at_display_row(row)
                };
                if let Some(id) = id {
                    self.handle_remove_id(id);
                }
            }
            PlaylistMessage::RemoveId(id) => self.handle_remove_id(id),
            PlaylistMessage::MoveUp(row) => self.handle_move(row, true),
            PlaylistMessage::MoveDown(row) => self.handle_move(row, false),
            PlaylistMessage::DequeueAllExceptPlaying => self.handle_dequeue_all_except_playing(),
            PlaylistMessage::AddCurrentToFavorites => {
                let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
                let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
                if let Some(current) = playback.current {
                    if queue.add_favorite(current) {
                        debug!("PlayerEngine: added track {} to favorites", current);
                    }
                }
                drop(queue);
                drop(playback);
                self.state_changed();
            }
            PlaylistMessage::ExportFavorites => {
                let queue = self.shared.queue.lock().expect("queue lock poisoned");
                match m3u::export_favorites(&queue, &self.music_root) {
                    Ok(path) => info!("PlayerEngine: favorites exported to {}", path.display()),
                    Err(err) => self.shared.set_error(&err),
                }
            }
            PlaylistMessage::LoadPlaylistFile(path) => self.handle_load_playlist_file(&path),
            PlaylistMessage::QueueChanged => {}
        }
    }

    // ---- transport -------------------------------------------------------

    fn handle_play(&mut self) {
        enum Action {
            Nothing,
            Resume,
            StartLoaded(Box<SongData>, u64),
        }

        let action = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.is_playing() {
                Action::Nothing
            } else if playback.is_paused() {
                Action::Resume
            } else {
                match determine_resume_song(&playback, &queue) {
                    None => {
                        drop(queue);
                        drop(playback);
                        self.shared.set_error("Nothing to play: the queue is empty");
                        return;
                    }
                    Some(id) => {
                        playback.current = Some(id);
                        playback.waiting_for_next = false;
                        playback.waiting_for_playlist = false;
                        playback.song_to_start_from = None;

                        let active = self.shared.slots.active_slot();
                        if active.loaded_track_id() == Some(id) {
                            // A silent switch already primed the active slot.
                            let song = active
                                .lock_content()
                                .as_ref()
                                .map(|content| Box::new(content.song.clone()));
                            match song {
                                Some(song) => Action::StartLoaded(song, id),
                                None => Action::Nothing,
                            }
                        } else {
                            let path = match queue.song(id) {
                                Some(song) => song.path.clone(),
                                None => return,
                            };
                            playback.pending_activation = Some(PendingActivation {
                                track_id: id,
                                start_playing: true,
                            });
                            playback.song_loading = true;
                            let generation = {
                                let mut loader =
                                    self.shared.loader.lock().expect("loader state lock poisoned");
                                loader.bump()
                            };
                            drop(queue);
                            drop(playback);
                            let target = self.shared.slots.inactive_id();
                            spawn_song_load(
                                &self.shared,
                                &self.bus_sender,
                                id,
                                path,
                                target,
                                generation,
                            );
                            self.state_changed();
                            return;
                        }
                    }
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Resume => self.resume_playing(false),
            Action::StartLoaded(song, id) => {
                {
                    let mut playback =
                        self.shared.playback.lock().expect("playback lock poisoned");
                    playback.clock.reset();
                    if playback.skip_from_stopped {
                        debug!("PlayerEngine: starting from a silently switched slot");
                        playback.skip_from_stopped = false;
                    }
                }
                self.notify_track_switch(&song);
                self.emit(PlayerMessage::TrackSwitched { track_id: id, song });
                self.resume_playing(true);
            }
        }
    }

    /// Transitions into Playing: device up, callback gate open, clock running.
    fn resume_playing(&mut self, from_start: bool) {
        if let Err(err) = self.ensure_device() {
            self.shared.set_error(&err);
            self.handle_stop();
            return;
        }
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.status = PlaybackStatus::Playing;
            if from_start {
                playback.clock.reset();
            }
            playback.clock.resume();
        }
        self.shared.is_playing.store(true, Ordering::Release);
        {
            let device = self.shared.device.lock().expect("device lock poisoned");
            if let Some(device) = device.as_ref() {
                device.resume_stream();
            }
        }
        self.emit_status(PlaybackStatus::Playing);
        self.state_changed();
        self.start_preload();
    }

    fn ensure_device(&self) -> Result<(), String> {
        let mut device = self.shared.device.lock().expect("device lock poisoned");
        if device.is_none() {
            let opened = AudioDevice::open(
                Arc::clone(&self.shared.slots),
                Arc::clone(&self.shared.is_playing),
                Arc::clone(&self.shared.volume),
                self.bus_sender.clone(),
            )?;
            debug!(
                "PlayerEngine: output device ready at {} Hz, {} channels",
                opened.sample_rate_hz, opened.channel_count
            );
            *device = Some(opened);
        }
        Ok(())
    }

    /// Notification sink for track switches; delivery beyond the log is a
    /// collaborator's concern.
    fn notify_track_switch(&self, song: &SongData) {
        info!(
            "Now playing: {} - {} [{}] ({} Hz, {} kbps)",
            if song.artist.is_empty() { "Unknown Artist" } else { &song.artist },
            song.title,
            if song.date.is_empty() { "-" } else { &song.date },
            song.sample_rate_hz,
            song.avg_bitrate_kbps,
        );
    }

    fn handle_toggle_pause(&mut self) {
        let status = {
            let playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.status
        };
        match status {
            PlaybackStatus::Playing => {
                {
                    let mut playback =
                        self.shared.playback.lock().expect("playback lock poisoned");
                    playback.status = PlaybackStatus::Paused;
                    playback.clock.pause();
                }
                self.shared.is_playing.store(false, Ordering::Release);
                {
                    let device = self.shared.device.lock().expect("device lock poisoned");
                    if let Some(device) = device.as_ref() {
                        device.pause_stream();
                    }
                }
                self.emit_status(PlaybackStatus::Paused);
                self.state_changed();
            }
            PlaybackStatus::Paused => self.resume_playing(false),
            PlaybackStatus::Stopped => self.handle_play(),
        }
    }

    fn handle_stop(&mut self) {
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            if let Some(current) = playback.current.take() {
                playback.last_played_id = Some(current);
            }
            playback.status = PlaybackStatus::Stopped;
            playback.clock.pause();
            playback.clock.set_to(Duration::ZERO);
            playback.pending_activation = None;
            playback.loaded_next_song = false;
            playback.next_loaded_id = None;
            playback.song_loading = false;
            playback.skipping = false;
            playback.skip_out_of_order = false;
            playback.start_from_top = true;
            let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
            loader.bump();
        }
        self.shared.is_playing.store(false, Ordering::Release);
        self.shared.slots.slot(SlotId::A).unload();
        self.shared.slots.slot(SlotId::B).unload();
        self.shared.slots.set_eof_handled();
        {
            // Data-source lock guards teardown against the callback.
            let mut device = self.shared.device.lock().expect("device lock poisoned");
            *device = None;
        }
        self.emit_status(PlaybackStatus::Stopped);
        self.state_changed();
    }

    // ---- skipping --------------------------------------------------------

    fn handle_next(&mut self) {
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.song_loading || playback.skipping || playback.next_song_needs_rebuilding {
                return;
            }
            let has_next = playback
                .current
                .map(|_| choose_next(&playback, &queue).is_some())
                .unwrap_or(false);
            if !has_next {
                drop(queue);
                let status = playback.status;
                drop(playback);
                if status == PlaybackStatus::Playing {
                    self.handle_stop();
                }
                return;
            }
            if playback.is_stopped() || playback.is_paused() {
                drop(queue);
                drop(playback);
                self.silent_switch(true);
                return;
            }
            playback.skipping = true;
            playback.skip_out_of_order = false;
        }

        // Ordered skip: the EOF handler performs the rotation.
        self.handle_eof();
        let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
        playback.skipping = false;
    }

    fn handle_previous(&mut self) {
        enum Action {
            Nothing,
            Stop,
            Silent,
            RewindToStart,
            Load(u64, PathBuf),
        }

        let action = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.song_loading || playback.skipping {
                Action::Nothing
            } else {
                match playback.current {
                    None => {
                        if playback.is_playing() {
                            Action::Stop
                        } else {
                            Action::Nothing
                        }
                    }
                    Some(current) => {
                        if playback.is_stopped() || playback.is_paused() {
                            Action::Silent
                        } else {
                            match queue.prev_in_play(current) {
                                None => Action::RewindToStart,
                                Some(prev) => {
                                    let path = match queue.song(prev) {
                                        Some(song) => song.path.clone(),
                                        None => return,
                                    };
                                    playback.skipping = true;
                                    playback.skip_out_of_order = true;
                                    playback.last_played_id = Some(current);
                                    playback.current = Some(prev);
                                    playback.loaded_next_song = false;
                                    playback.next_loaded_id = None;
                                    playback.pending_activation = Some(PendingActivation {
                                        track_id: prev,
                                        start_playing: true,
                                    });
                                    playback.song_loading = true;
                                    Action::Load(prev, path)
                                }
                            }
                        }
                    }
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Stop => self.handle_stop(),
            Action::Silent => self.silent_switch(false),
            Action::RewindToStart => self.handle_seek_to(0.0),
            Action::Load(track_id, path) => {
                let generation = {
                    let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
                    loader.bump()
                };
                let target = self.shared.slots.inactive_id();
                spawn_song_load(
                    &self.shared,
                    &self.bus_sender,
                    track_id,
                    path,
                    target,
                    generation,
                );
            }
        }
    }

    fn handle_skip_to_numbered(&mut self, number: usize) {
        let load = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.song_loading || playback.skipping {
                return;
            }
            let Some(target) = queue.id_at_number(number) else {
                return;
            };
            let Some(song) = queue.song(target) else {
                return;
            };
            let path = song.path.clone();
            let start_playing = !playback.is_stopped() && !playback.is_paused();
            playback.skipping = true;
            playback.skip_out_of_order = true;
            playback.skip_from_stopped = playback.is_stopped();
            if let Some(current) = playback.current {
                playback.last_played_id = Some(current);
            }
            playback.current = Some(target);
            playback.waiting_for_next = false;
            playback.waiting_for_playlist = false;
            playback.loaded_next_song = false;
            playback.next_loaded_id = None;
            playback.pending_activation = Some(PendingActivation {
                track_id: target,
                start_playing,
            });
            playback.song_loading = true;
            (target, path)
        };

        let generation = {
            let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
            loader.bump()
        };
        let target_slot = self.shared.slots.inactive_id();
        spawn_song_load(
            &self.shared,
            &self.bus_sender,
            load.0,
            load.1,
            target_slot,
            generation,
        );
    }

    /// Track change while not Playing: the active pointer moves but the
    /// device is not started; the next play resumes at position 0.
    fn silent_switch(&mut self, forward: bool) {
        let load = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            let Some(current) = playback.current else {
                return;
            };
            let target = if forward {
                choose_next(&playback, &queue)
            } else {
                queue.prev_in_play(current)
            };
            let Some(target) = target else {
                return;
            };
            let Some(song) = queue.song(target) else {
                return;
            };
            let path = song.path.clone();

            playback.skipping = true;
            playback.skip_out_of_order = true;
            playback.skip_from_stopped = playback.is_stopped();
            playback.notify_switch = true;
            playback.last_played_id = Some(current);
            playback.current = Some(target);
            playback.loaded_next_song = false;
            playback.next_loaded_id = None;
            playback.next_song_needs_rebuilding = true;
            playback.pending_activation = Some(PendingActivation {
                track_id: target,
                start_playing: false,
            });
            playback.song_loading = true;
            (target, path)
        };

        let generation = {
            let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
            loader.bump()
        };
        let target_slot = self.shared.slots.inactive_id();
        spawn_song_load(
            &self.shared,
            &self.bus_sender,
            load.0,
            load.1,
            target_slot,
            generation,
        );
    }

    // ---- EOF rotation ----------------------------------------------------

    fn handle_eof(&mut self) {
        // The eof flag stays raised until the active pointer has moved, so
        // the callback cannot re-signal while the old slot is still active.
        enum AfterEof {
            RepeatTrack,
            Rotate(u64, Box<SongData>),
            Load(u64, PathBuf),
            EndOfList,
        }

        let decision = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.repeat == RepeatMode::Track && playback.current.is_some() {
                AfterEof::RepeatTrack
            } else {
                if !playback.skip_out_of_order {
                    if let Some(current) = playback.current {
                        playback.last_played_id = Some(current);
                        playback.current = choose_next(&playback, &queue);
                    }
                } else {
                    playback.skip_out_of_order = false;
                }
                if playback.current.is_none() && playback.repeat == RepeatMode::List {
                    playback.current = queue.head_of_play();
                }

                match playback.current {
                    None => AfterEof::EndOfList,
                    Some(next_id) => {
                        let inactive = self.shared.slots.slot(self.shared.slots.inactive_id());
                        let preloaded = playback.loaded_next_song
                            && playback.next_loaded_id == Some(next_id)
                            && inactive.loaded_track_id() == Some(next_id);
                        if preloaded {
                            let song = inactive
                                .lock_content()
                                .as_ref()
                                .map(|content| Box::new(content.song.clone()));
                            playback.loaded_next_song = false;
                            playback.next_loaded_id = None;
                            match song {
                                Some(song) => AfterEof::Rotate(next_id, song),
                                None => AfterEof::EndOfList,
                            }
                        } else {
                            // Pre-load missing or failed: load directly and
                            // continue when the slot publishes.
                            let Some(song) = queue.song(next_id) else {
                                return;
                            };
                            let path = song.path.clone();
                            playback.loaded_next_song = false;
                            playback.next_loaded_id = None;
                            playback.pending_activation = Some(PendingActivation {
                                track_id: next_id,
                                start_playing: playback.is_playing(),
                            });
                            playback.song_loading = true;
                            AfterEof::Load(next_id, path)
                        }
                    }
                }
            }
        };

        match decision {
            AfterEof::RepeatTrack => {
                let slot = self.shared.slots.active_slot();
                let mut content = slot.lock_content();
                if let Some(content) = content.as_mut() {
                    if let Err(err) = content.source.seek(0) {
                        warn!("PlayerEngine: repeat rewind failed: {}", err);
                    }
                }
                drop(content);
                self.shared.slots.set_eof_handled();
                {
                    let mut playback =
                        self.shared.playback.lock().expect("playback lock poisoned");
                    playback.clock.reset();
                }
                self.emit(PlayerMessage::ProgressChanged {
                    elapsed_us: 0,
                    duration_us: 0,
                });
                self.state_changed();
            }
            AfterEof::Rotate(track_id, song) => {
                self.shared.slots.flip_active();
                self.shared.slots.set_eof_handled();
                // The finished decoder is torn down before a new load opens.
                self.shared
                    .slots
                    .slot(self.shared.slots.inactive_id())
                    .unload();
                {
                    let mut playback =
                        self.shared.playback.lock().expect("playback lock poisoned");
                    playback.clock.reset();
                }
                self.notify_track_switch(&song);
                self.emit(PlayerMessage::TrackSwitched { track_id, song });
                self.state_changed();
                self.start_preload();
            }
            AfterEof::Load(track_id, path) => {
                let generation = {
                    let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
                    loader.bump()
                };
                let target = self.shared.slots.inactive_id();
                spawn_song_load(
                    &self.shared,
                    &self.bus_sender,
                    track_id,
                    path,
                    target,
                    generation,
                );
            }
            AfterEof::EndOfList => {
                debug!("PlayerEngine: end of play order reached");
                self.handle_stop();
                if self.quit_on_stop {
                    let _ = self.bus_sender.send(Message::System(SystemMessage::Quit));
                }
            }
        }
    }

    // ---- loader completions ---------------------------------------------

    fn handle_slot_loaded(
        &mut self,
        slot: SlotId,
        generation: u64,
        track_id: u64,
        outcome: LoadOutcome,
    ) {
        {
            let loader = self.shared.loader.lock().expect("loader state lock poisoned");
            if loader.generation != generation {
                debug!(
                    "PlayerEngine: ignoring stale slot load (generation {} != {})",
                    generation, loader.generation
                );
                return;
            }
        }

        match outcome {
            LoadOutcome::Loaded(song) => self.handle_slot_load_success(slot, track_id, song),
            LoadOutcome::Failed { reason } => self.handle_slot_load_failure(track_id, &reason),
        }
    }

    fn handle_slot_load_success(&mut self, slot: SlotId, track_id: u64, song: Box<SongData>) {
        if song.has_errors {
            self.handle_slot_load_failure(track_id, "song data carries an error flag");
            return;
        }
        {
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            queue.set_duration(track_id, song.duration);
        }

        let activation = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.song_loading = false;
            playback.next_song_needs_rebuilding = false;
            match playback.pending_activation {
                Some(pending) if pending.track_id == track_id => {
                    playback.pending_activation = None;
                    playback.first_load_failures = 0;
                    playback.skipping = false;
                    Some(pending)
                }
                Some(_) => None,
                None => {
                    // Pre-load completion for the chosen next.
                    playback.loaded_next_song = true;
                    playback.next_loaded_id = Some(track_id);
                    None
                }
            }
        };

        let Some(pending) = activation else {
            self.state_changed();
            return;
        };

        self.shared.slots.set_active(slot);
        // The previous decoder is torn down now that the pointer has moved,
        // and a pending end-of-stream from it is moot.
        self.shared.slots.slot(slot.other()).unload();
        self.shared.slots.set_eof_handled();
        let announce = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.clock.pause();
            playback.clock.set_to(Duration::ZERO);
            let announce = pending.start_playing || playback.notify_switch;
            playback.notify_switch = false;
            announce
        };
        if announce {
            self.notify_track_switch(&song);
        }
        self.emit(PlayerMessage::TrackSwitched { track_id, song });

        if pending.start_playing {
            self.resume_playing(true);
        } else {
            // Silent switch: pointer moved, device untouched.
            self.state_changed();
        }
    }

    fn handle_slot_load_failure(&mut self, track_id: u64, reason: &str) {
        enum Retry {
            Abort,
            Next(u64, PathBuf, bool),
            PreloadFailed,
        }

        let retry = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");
            playback.song_loading = false;

            match playback.pending_activation {
                Some(pending) if pending.track_id == track_id => {
                    playback.first_load_failures += 1;
                    if playback.first_load_failures >= MAX_FIRST_LOAD_FAILURES {
                        playback.pending_activation = None;
                        playback.first_load_failures = 0;
                        Retry::Abort
                    } else {
                        match queue.next_in_play(track_id) {
                            Some(next) => match queue.song(next) {
                                Some(song) => {
                                    let path = song.path.clone();
                                    playback.current = Some(next);
                                    playback.pending_activation = Some(PendingActivation {
                                        track_id: next,
                                        start_playing: pending.start_playing,
                                    });
                                    playback.song_loading = true;
                                    Retry::Next(next, path, pending.start_playing)
                                }
                                None => {
                                    playback.pending_activation = None;
                                    Retry::Abort
                                }
                            },
                            None => {
                                playback.pending_activation = None;
                                Retry::Abort
                            }
                        }
                    }
                }
                _ => {
                    playback.loaded_next_song = false;
                    playback.next_loaded_id = None;
                    Retry::PreloadFailed
                }
            }
        };

        match retry {
            Retry::Abort => {
                self.shared
                    .set_error(&format!("Couldn't play the song: {}", reason));
                self.handle_stop();
            }
            Retry::Next(next, path, _) => {
                debug!(
                    "PlayerEngine: load failed for track {}, retrying with {}",
                    track_id, next
                );
                let generation = {
                    let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
                    loader.bump()
                };
                let target = self.shared.slots.inactive_id();
                spawn_song_load(&self.shared, &self.bus_sender, next, path, target, generation);
            }
            Retry::PreloadFailed => {
                // The EOF handler skips the offending track in-band.
                debug!("PlayerEngine: pre-load failed for track {}", track_id);
            }
        }
    }

    /// Begins loading the chosen next into the inactive slot.
    fn start_preload(&mut self) {
        let load = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let queue = self.shared.queue.lock().expect("queue lock poisoned");

            if playback.song_loading || playback.pending_activation.is_some() {
                return;
            }
            let Some(next) = choose_next(&playback, &queue) else {
                return;
            };
            if playback.loaded_next_song && playback.next_loaded_id == Some(next) {
                return;
            }
            let Some(song) = queue.song(next) else {
                return;
            };
            let path = song.path.clone();
            playback.song_loading = true;
            playback.next_song_needs_rebuilding = false;
            (next, path)
        };

        let generation = {
            let loader = self.shared.loader.lock().expect("loader state lock poisoned");
            loader.generation
        };
        let target = self.shared.slots.inactive_id();
        spawn_song_load(
            &self.shared,
            &self.bus_sender,
            load.0,
            load.1,
            target,
            generation,
        );
    }

    /// Invalidates the pre-loaded next after a playlist mutation.
    fn invalidate_preload(&mut self) {
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.next_song_needs_rebuilding = true;
            playback.loaded_next_song = false;
            playback.next_loaded_id = None;
            if playback.pending_activation.is_some() {
                // An activation load is in flight; it rebuilds the pre-load
                // itself once its slot publishes.
                return;
            }
            playback.song_loading = false;
            let mut loader = self.shared.loader.lock().expect("loader state lock poisoned");
            loader.bump();
        }
        let inactive = self.shared.slots.inactive_id();
        self.shared.slots.slot(inactive).unload();
        let is_playing = {
            let playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.is_playing()
        };
        if is_playing {
            self.start_preload();
        }
    }

    // ---- seeking ---------------------------------------------------------

    fn handle_seek_by(&mut self, delta: f64) {
        let target = {
            let playback = self.shared.playback.lock().expect("playback lock poisoned");
            if playback.current.is_none() {
                return;
            }
            playback.clock.elapsed().as_secs_f64() + delta
        };
        self.handle_seek_to(target.max(0.0));
    }

    fn handle_seek_to(&mut self, target_seconds: f64) {
        let committed = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            if playback.current.is_none() {
                return;
            }

            let slot = self.shared.slots.active_slot();
            if slot.is_unloaded() || slot.is_deleted() {
                return;
            }
            let mut content = slot.lock_content();
            let Some(content) = content.as_mut() else {
                return;
            };

            // Seek past end clamps to duration; before zero clamps to zero.
            let duration = content.song.duration;
            let clamped = if duration > 0.0 {
                target_seconds.clamp(0.0, duration)
            } else {
                target_seconds.max(0.0)
            };
            let sample_rate = f64::from(content.source.source().sample_rate().max(1));
            let frame = (clamped * sample_rate).round() as u64;
            if let Err(err) = content.source.seek(frame) {
                warn!("PlayerEngine: seek failed: {}", err);
                return;
            }
            debug!(
                "PlayerEngine: seek committed at frame {} (decoder tell={})",
                frame,
                content.source.source().tell()
            );
            playback.clock.set_to(Duration::from_secs_f64(clamped));
            let duration_us = (duration * 1_000_000.0) as u64;
            (playback.clock.elapsed_us(), duration_us)
        };

        self.emit(PlayerMessage::ProgressChanged {
            elapsed_us: committed.0,
            duration_us: committed.1,
        });
        self.state_changed();
    }

    // ---- volume / modes --------------------------------------------------

    fn handle_set_volume(&mut self, volume: u8) {
        let clamped = volume.min(100);
        self.shared
            .volume
            .store(u32::from(clamped), Ordering::Release);
        self.emit(PlayerMessage::VolumeChanged(clamped));
        let _ = self.bus_sender.send(Message::State(StateMessage::StateDirty));
        self.state_changed();
    }

    fn handle_set_repeat(&mut self, mode: RepeatMode) {
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            playback.repeat = mode;
        }
        self.emit(PlayerMessage::RepeatChanged(mode));
        let _ = self.bus_sender.send(Message::State(StateMessage::StateDirty));
        self.state_changed();
        // Repeat-list changes what follows the tail, so rebuild the pre-load.
        self.invalidate_preload();
    }

    fn handle_set_shuffle(&mut self, enabled: bool) {
        {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            if playback.shuffle == enabled {
                return;
            }
            playback.shuffle = enabled;
            if enabled {
                queue.shuffle_play_order(playback.current);
            } else {
                queue.copy_display_onto_play();
            }
            debug!("PlayerEngine: play order is now {:?}", queue.play_ids());
        }
        self.emit(PlayerMessage::ShuffleChanged(enabled));
        let _ = self.bus_sender.send(Message::State(StateMessage::StateDirty));
        let _ = self
            .bus_sender
            .send(Message::Playlist(PlaylistMessage::QueueChanged));
        self.state_changed();
        self.invalidate_preload();
    }

    // ---- queue mutations -------------------------------------------------

    fn handle_remove_id(&mut self, id: u64) {
        enum RemovalKind {
            Current,
            Other,
        }

        let (kind, removed_path) = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");

            let Some(song) = queue.song(id) else {
                return;
            };
            let path = song.path.clone();
            let display_successor = queue
                .display_position(id)
                .and_then(|position| queue.id_at_display_row(position + 1));

            let kind = if playback.current == Some(id) {
                playback.last_played_id = Some(id);
                playback.current = None;
                playback.song_to_start_from = display_successor;
                playback.waiting_for_next = true;
                playback.loaded_next_song = false;
                playback.next_loaded_id = None;
                playback.pending_activation = None;
                RemovalKind::Current
            } else {
                // Keep the resume hint pointing at a live successor.
                if playback.song_to_start_from == Some(id) {
                    playback.song_to_start_from = display_successor;
                }
                RemovalKind::Other
            };

            queue.remove(id);
            if queue.find_by_path(&path).is_none() {
                let mut tree = self
                    .shared
                    .library_tree
                    .lock()
                    .expect("library tree lock poisoned");
                tree.mark_dequeued(&path);
            }
            (kind, path)
        };
        debug!(
            "PlayerEngine: removed track {} ({})",
            id,
            removed_path.display()
        );

        match kind {
            RemovalKind::Current => {
                // Dequeue of the playing song stops playback; the next play
                // resumes from the stored successor hint.
                {
                    let mut playback =
                        self.shared.playback.lock().expect("playback lock poisoned");
                    playback.status = PlaybackStatus::Stopped;
                    playback.clock.pause();
                    playback.clock.set_to(Duration::ZERO);
                    let mut loader =
                        self.shared.loader.lock().expect("loader state lock poisoned");
                    loader.bump();
                }
                self.shared.is_playing.store(false, Ordering::Release);
                let active = self.shared.slots.active_id();
                // The callback may still reference the active slot; mark it
                // deleted so it reads silence until teardown completes.
                self.shared.slots.slot(active).mark_deleted();
                self.shared.slots.slot(active).unload();
                self.shared.slots.slot(active.other()).unload();
                self.emit_status(PlaybackStatus::Stopped);
            }
            RemovalKind::Other => {
                self.invalidate_preload();
            }
        }

        let _ = self
            .bus_sender
            .send(Message::Playlist(PlaylistMessage::QueueChanged));
        self.state_changed();
    }

    fn handle_move(&mut self, row: usize, up: bool) {
        let affected = {
            let playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let Some(id) = queue.id_at_display_row(row) else {
                return;
            };
            let mirror_play = !playback.shuffle;
            let moved = if up {
                queue.move_up(id, mirror_play)
            } else {
                queue.move_down(id, mirror_play)
            };
            if !moved {
                return;
            }

            // A move touching the current song's neighborhood invalidates
            // the pre-loaded next identity.
            match playback.current {
                None => false,
                Some(current) => {
                    let near: Vec<u64> = [
                        Some(current),
                        queue.next_in_play(current),
                        queue.prev_in_play(current),
                    ]
                    .into_iter()
                    .flatten()
                    .collect();
                    near.contains(&id)
                }
            }
        };

        if affected {
            self.invalidate_preload();
        }
        let _ = self
            .bus_sender
            .send(Message::Playlist(PlaylistMessage::QueueChanged));
        self.state_changed();
    }

    fn handle_dequeue_all_except_playing(&mut self) {
        {
            let playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let removed = queue.remove_all_except(playback.current);
            let mut tree = self
                .shared
                .library_tree
                .lock()
                .expect("library tree lock poisoned");
            for song in &removed {
                if queue.find_by_path(&song.path).is_none() {
                    tree.mark_dequeued(&song.path);
                }
            }
        }
        self.invalidate_preload();
        let _ = self
            .bus_sender
            .send(Message::Playlist(PlaylistMessage::QueueChanged));
        self.state_changed();
    }

    fn handle_load_playlist_file(&mut self, path: &std::path::Path) {
        let loaded = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let was_empty = queue.is_empty();
            match m3u::load_playlist_file(path, &mut queue) {
                Ok(paths) if !paths.is_empty() => {
                    let mut tree = self
                        .shared
                        .library_tree
                        .lock()
                        .expect("library tree lock poisoned");
                    for enqueued in &paths {
                        tree.mark_enqueued(enqueued);
                    }
                    drop(tree);
                    if playback.shuffle {
                        queue.shuffle_play_order(playback.current);
                    }
                    if playback.is_stopped() && was_empty {
                        playback.waiting_for_playlist = false;
                        playback.waiting_for_next = true;
                        playback.last_played_id = None;
                        playback.song_to_start_from =
                            queue.find_by_path(&paths[0]).map(|song| song.id);
                    }
                    true
                }
                Ok(_) => false,
                Err(err) => {
                    drop(queue);
                    drop(playback);
                    self.shared.set_error(&err);
                    return;
                }
            }
        };

        if loaded {
            let _ = self
                .bus_sender
                .send(Message::Playlist(PlaylistMessage::QueueChanged));
            self.state_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{EngineShared, ErrorSlot};

    #[test]
    fn test_error_slot_truncates_on_char_boundary() {
        let mut slot = ErrorSlot::default();
        let long_message = "ä".repeat(300);
        slot.set(&long_message);
        let stored = slot.current().expect("message should be stored");
        assert!(stored.len() <= 256);
        assert!(stored.chars().all(|ch| ch == 'ä'));
    }

    #[test]
    fn test_error_slot_clears_only_after_print() {
        let mut slot = ErrorSlot::default();
        slot.set("device lost");
        slot.clear_if_printed();
        assert_eq!(slot.current(), Some("device lost"));
        slot.mark_printed();
        slot.clear_if_printed();
        assert_eq!(slot.current(), None);
    }

    #[test]
    fn test_refresh_signal_is_consumed_once() {
        let shared = EngineShared::new(None);
        shared.trigger_refresh();
        assert!(shared.take_refresh());
        assert!(!shared.take_refresh());
    }

    #[test]
    fn test_set_error_raises_refresh() {
        let shared = EngineShared::new(None);
        shared.set_error("boom");
        assert!(shared.take_refresh());
        let slot = shared.error_slot.lock().expect("error slot lock poisoned");
        assert_eq!(slot.current(), Some("boom"));
    }
}
