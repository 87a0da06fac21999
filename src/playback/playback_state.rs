//! Playback runtime state and the elapsed clock.
//!
//! Every field is read and written only by code holding the playback lock;
//! the device callback communicates through the slot atomics instead.

use std::time::{Duration, Instant};

use crate::protocol::{PlaybackStatus, RepeatMode};

/// Monotonic accumulator that advances while Playing.
///
/// Pause folds the running span into the accumulator; seek overwrites it.
#[derive(Debug)]
pub struct ElapsedClock {
    accumulated: Duration,
    last_resume: Option<Instant>,
}

impl ElapsedClock {
    pub fn new() -> ElapsedClock {
        ElapsedClock {
            accumulated: Duration::ZERO,
            last_resume: None,
        }
    }

    pub fn resume(&mut self) {
        if self.last_resume.is_none() {
            self.last_resume = Some(Instant::now());
        }
    }

    pub fn pause(&mut self) {
        if let Some(resumed_at) = self.last_resume.take() {
            self.accumulated += resumed_at.elapsed();
        }
    }

    pub fn reset(&mut self) {
        self.accumulated = Duration::ZERO;
        if self.is_running() {
            self.last_resume = Some(Instant::now());
        }
    }

    /// Overwrites the elapsed value, keeping the running/paused state.
    pub fn set_to(&mut self, elapsed: Duration) {
        self.accumulated = elapsed;
        if self.is_running() {
            self.last_resume = Some(Instant::now());
        }
    }

    pub fn is_running(&self) -> bool {
        self.last_resume.is_some()
    }

    pub fn elapsed(&self) -> Duration {
        match self.last_resume {
            Some(resumed_at) => self.accumulated + resumed_at.elapsed(),
            None => self.accumulated,
        }
    }

    /// Elapsed microseconds, the unit reported to external controllers.
    pub fn elapsed_us(&self) -> u64 {
        self.elapsed().as_micros().min(u128::from(u64::MAX)) as u64
    }
}

impl Default for ElapsedClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A load whose completion should make its slot active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingActivation {
    pub track_id: u64,
    /// Start the device when the slot publishes; false for silent switches.
    pub start_playing: bool,
}

/// The flag record behind the playback lock.
#[derive(Debug)]
pub struct PlaybackState {
    pub status: PlaybackStatus,
    /// Currently playing song in the play order, by id.
    pub current: Option<u64>,
    pub last_played_id: Option<u64>,
    /// Successor hint stored when the current song is removed. Kept as an id
    /// and re-resolved at resume time, so a later removal of the successor
    /// degrades gracefully.
    pub song_to_start_from: Option<u64>,
    /// The inactive slot holds a valid decoder for `next_loaded_id`.
    pub loaded_next_song: bool,
    pub next_loaded_id: Option<u64>,
    /// Playback stopped because the current song was removed; the next play
    /// resumes from `song_to_start_from`.
    pub waiting_for_next: bool,
    /// Playback should restart from the head of the play order.
    pub waiting_for_playlist: bool,
    pub skipping: bool,
    /// Suppresses the natural `current = chosen_next` advance in the EOF
    /// handler after an explicit current change.
    pub skip_out_of_order: bool,
    /// The last silent switch originated from Stopped rather than Paused.
    pub skip_from_stopped: bool,
    /// A track switch happened that listeners have not been told about yet.
    pub notify_switch: bool,
    pub song_loading: bool,
    /// A playlist mutation invalidated the pre-loaded next identity.
    pub next_song_needs_rebuilding: bool,
    /// In-flight load whose completion activates its slot.
    pub pending_activation: Option<PendingActivation>,
    pub repeat: RepeatMode,
    pub shuffle: bool,
    /// Fallback direction when nothing else determines the resume point.
    pub start_from_top: bool,
    /// Consecutive first-load decoder failures; three abort playback.
    pub first_load_failures: u32,
    pub clock: ElapsedClock,
}

impl PlaybackState {
    pub fn new() -> PlaybackState {
        PlaybackState {
            status: PlaybackStatus::Stopped,
            current: None,
            last_played_id: None,
            song_to_start_from: None,
            loaded_next_song: false,
            next_loaded_id: None,
            waiting_for_next: false,
            waiting_for_playlist: false,
            skipping: false,
            skip_out_of_order: false,
            skip_from_stopped: false,
            notify_switch: false,
            song_loading: false,
            next_song_needs_rebuilding: false,
            pending_activation: None,
            repeat: RepeatMode::Off,
            shuffle: false,
            start_from_top: true,
            first_load_failures: 0,
            clock: ElapsedClock::new(),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.status == PlaybackStatus::Playing
    }

    pub fn is_paused(&self) -> bool {
        self.status == PlaybackStatus::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.status == PlaybackStatus::Stopped
    }
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::ElapsedClock;
    use std::time::Duration;

    #[test]
    fn test_clock_is_zero_before_first_resume() {
        let clock = ElapsedClock::new();
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert!(!clock.is_running());
    }

    #[test]
    fn test_clock_advances_while_running() {
        let mut clock = ElapsedClock::new();
        clock.resume();
        std::thread::sleep(Duration::from_millis(15));
        let first = clock.elapsed();
        std::thread::sleep(Duration::from_millis(15));
        let second = clock.elapsed();
        assert!(second > first, "clock should be monotonic while running");
    }

    #[test]
    fn test_pause_then_resume_does_not_change_elapsed() {
        let mut clock = ElapsedClock::new();
        clock.resume();
        std::thread::sleep(Duration::from_millis(20));
        clock.pause();
        let at_pause = clock.elapsed();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.elapsed(), at_pause);
        clock.resume();
        assert!(clock.elapsed() >= at_pause);
    }

    #[test]
    fn test_set_to_overwrites_elapsed_while_paused() {
        let mut clock = ElapsedClock::new();
        clock.resume();
        clock.pause();
        clock.set_to(Duration::from_secs(25));
        assert_eq!(clock.elapsed(), Duration::from_secs(25));
        assert!(!clock.is_running());
    }

    #[test]
    fn test_reset_zeroes_elapsed_and_keeps_running_state() {
        let mut clock = ElapsedClock::new();
        clock.resume();
        std::thread::sleep(Duration::from_millis(10));
        clock.reset();
        assert!(clock.is_running());
        assert!(clock.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn test_elapsed_us_reports_microseconds() {
        let mut clock = ElapsedClock::new();
        clock.set_to(Duration::from_millis(1_500));
        assert_eq!(clock.elapsed_us(), 1_500_000);
    }
}
