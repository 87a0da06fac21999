//! The single event loop driving all mutations.
//!
//! Input sources (keyboard decoding, CLI, remote-control calls) submit
//! `Event`s through a channel; this loop throttles, debounces, and maps them
//! onto bus messages. No event is processed concurrently with another.

use std::sync::mpsc::{self, Receiver as StdReceiver, RecvTimeoutError, Sender as StdSender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};
use log::{debug, info};
use tokio::sync::broadcast::Sender;

use crate::control::events::{Event, ThrottleClass};
use crate::playback::player_engine::EngineShared;
use crate::protocol::{
    LibraryMessage, Message, PlayerMessage, PlaylistMessage, SystemMessage,
};

const PREV_NEXT_WINDOW: Duration = Duration::from_millis(400);
const FAST_NAV_WINDOW: Duration = Duration::from_millis(20);
const ACTION_COOLDOWN: Duration = Duration::from_millis(100);
const DRAG_COMMIT_DELAY: Duration = Duration::from_millis(500);
const INPUT_POLL_TIMEOUT: Duration = Duration::from_millis(50);

type DirectRateLimiter =
    RateLimiter<NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Spawns the debouncer that commits only the last drag target after the
/// post-release quiet period.
fn spawn_drag_commit_dispatcher(bus_sender: Sender<Message>) -> StdSender<f32> {
    let (tx, rx) = mpsc::channel::<f32>();
    thread::spawn(move || {
        while let Ok(initial_fraction) = rx.recv() {
            let mut pending_fraction = initial_fraction;
            loop {
                match rx.recv_timeout(DRAG_COMMIT_DELAY) {
                    Ok(next_fraction) => pending_fraction = next_fraction,
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = bus_sender.send(Message::Player(PlayerMessage::SeekToFraction(
                            pending_fraction,
                        )));
                        break;
                    }
                    Err(RecvTimeoutError::Disconnected) => {
                        let _ = bus_sender.send(Message::Player(PlayerMessage::SeekToFraction(
                            pending_fraction,
                        )));
                        return;
                    }
                }
            }
        }
    });
    tx
}

/// Event loop state: rate limiters, cooldowns, and drag absorption.
pub struct ControlPlane {
    bus_sender: Sender<Message>,
    shared: Arc<EngineShared>,
    event_receiver: StdReceiver<Event>,
    prev_next_limiter: DirectRateLimiter,
    fast_nav_limiter: DirectRateLimiter,
    last_seek_action: Option<Instant>,
    last_remove_action: Option<Instant>,
    drag_in_progress: bool,
    pending_drag_fraction: Option<f32>,
    drag_commit_tx: StdSender<f32>,
    seek_step_seconds: f64,
    volume_step: i8,
}

impl ControlPlane {
    /// Builds the loop and returns the handle input sources submit through.
    pub fn new(
        bus_sender: Sender<Message>,
        shared: Arc<EngineShared>,
        seek_step_seconds: f64,
        volume_step: u8,
    ) -> (ControlPlane, StdSender<Event>) {
        let (event_sender, event_receiver) = mpsc::channel();
        let drag_commit_tx = spawn_drag_commit_dispatcher(bus_sender.clone());
        let plane = ControlPlane {
            bus_sender,
            shared,
            event_receiver,
            prev_next_limiter: RateLimiter::direct(
                Quota::with_period(PREV_NEXT_WINDOW).expect("non-zero quota period"),
            ),
            fast_nav_limiter: RateLimiter::direct(
                Quota::with_period(FAST_NAV_WINDOW).expect("non-zero quota period"),
            ),
            last_seek_action: None,
            last_remove_action: None,
            drag_in_progress: false,
            pending_drag_fraction: None,
            drag_commit_tx,
            seek_step_seconds,
            volume_step: volume_step.min(i8::MAX as u8) as i8,
        };
        (plane, event_sender)
    }

    /// Blocks on the input channel with a short timeout so shutdown and
    /// remote-bus traffic are never starved.
    pub fn run(&mut self) {
        info!("ControlPlane: started");
        loop {
            match self.event_receiver.recv_timeout(INPUT_POLL_TIMEOUT) {
                Ok(event) => {
                    if !self.handle_event(event) {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Minimal message surface: when a refresh is pending,
                    // show the error slot once per message.
                    if self.shared.take_refresh() {
                        let mut slot = self
                            .shared
                            .error_slot
                            .lock()
                            .expect("error slot lock poisoned");
                        if let Some(message) = slot.take_unprinted() {
                            drop(slot);
                            eprintln!("{}", message);
                        }
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("ControlPlane: stopped");
    }

    fn cooldown_expired(slot: &mut Option<Instant>) -> bool {
        let now = Instant::now();
        match slot {
            Some(last) if now.duration_since(*last) < ACTION_COOLDOWN => false,
            _ => {
                *slot = Some(now);
                true
            }
        }
    }

    /// Applies throttling, then dispatches. Returns `false` on quit.
    pub fn handle_event(&mut self, event: Event) -> bool {
        // Any non-drag event cancels an in-progress drag without committing.
        if self.drag_in_progress && !event.is_drag() {
            debug!("ControlPlane: drag cancelled by {:?}", event);
            self.drag_in_progress = false;
            self.pending_drag_fraction = None;
        }

        match event.throttle_class() {
            ThrottleClass::PrevNext => {
                if self.prev_next_limiter.check().is_err() {
                    return true;
                }
            }
            ThrottleClass::FastNav => {
                if self.fast_nav_limiter.check().is_err() {
                    return true;
                }
            }
            ThrottleClass::Unthrottled => {}
        }

        if event.has_action_cooldown() {
            let expired = match event {
                Event::RemoveRow(_) => Self::cooldown_expired(&mut self.last_remove_action),
                _ => Self::cooldown_expired(&mut self.last_seek_action),
            };
            if !expired {
                return true;
            }
        }

        self.dispatch(event)
    }

    fn send(&self, message: Message) {
        let _ = self.bus_sender.send(message);
    }

    fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::PlayPause => self.send(Message::Player(PlayerMessage::TogglePause)),
            Event::Play => self.send(Message::Player(PlayerMessage::Play)),
            Event::Stop => self.send(Message::Player(PlayerMessage::Stop)),
            Event::NextTrack => self.send(Message::Player(PlayerMessage::Next)),
            Event::PrevTrack => self.send(Message::Player(PlayerMessage::Previous)),
            Event::SeekForward => {
                self.send(Message::Player(PlayerMessage::SeekBy(self.seek_step_seconds)))
            }
            Event::SeekBack => {
                self.send(Message::Player(PlayerMessage::SeekBy(-self.seek_step_seconds)))
            }
            Event::SeekDrag { fraction } => {
                self.drag_in_progress = true;
                self.pending_drag_fraction = Some(fraction.clamp(0.0, 1.0));
                self.shared.trigger_refresh();
            }
            Event::SeekDragRelease => {
                self.drag_in_progress = false;
                if let Some(fraction) = self.pending_drag_fraction.take() {
                    let _ = self.drag_commit_tx.send(fraction);
                }
            }
            Event::RemoveRow(row) => {
                self.send(Message::Playlist(PlaylistMessage::RemoveRow(row)))
            }
            Event::MoveRowUp(row) => self.send(Message::Playlist(PlaylistMessage::MoveUp(row))),
            Event::MoveRowDown(row) => {
                self.send(Message::Playlist(PlaylistMessage::MoveDown(row)))
            }
            Event::ClearQueueKeepPlaying => {
                self.send(Message::Playlist(PlaylistMessage::DequeueAllExceptPlaying))
            }
            Event::VolumeUp => self.send(Message::Player(PlayerMessage::AdjustVolume(
                self.volume_step,
            ))),
            Event::VolumeDown => self.send(Message::Player(PlayerMessage::AdjustVolume(
                -self.volume_step,
            ))),
            Event::ToggleShuffle => self.send(Message::Player(PlayerMessage::ToggleShuffle)),
            Event::CycleRepeat => self.send(Message::Player(PlayerMessage::CycleRepeat)),
            Event::SkipToNumbered(number) => {
                self.send(Message::Player(PlayerMessage::SkipToNumbered(number)))
            }
            Event::SkipToLast => self.send(Message::Player(PlayerMessage::SkipToLast)),
            Event::AddToFavorites => {
                self.send(Message::Playlist(PlaylistMessage::AddCurrentToFavorites))
            }
            Event::ExportFavorites => {
                self.send(Message::Playlist(PlaylistMessage::ExportFavorites))
            }
            Event::UpdateLibrary => self.send(Message::Library(LibraryMessage::RequestRescan)),
            Event::ToggleLibrarySort => self.send(Message::Library(LibraryMessage::ToggleSort)),
            // View navigation and resizes only change what a renderer draws.
            Event::ScrollUp
            | Event::ScrollDown
            | Event::PageUp
            | Event::PageDown
            | Event::Resize
            | Event::ViewChange => self.shared.trigger_refresh(),
            Event::Quit => {
                self.send(Message::System(SystemMessage::Quit));
                return false;
            }
        }
        true
    }
}
