//! Control-plane events and their throttle classes.
//!
//! One event is dispatched per user/IPC action; the event loop consumes them
//! in arrival order and never processes two concurrently.

/// A decoded user or IPC action.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    PlayPause,
    Play,
    Stop,
    NextTrack,
    PrevTrack,
    ScrollUp,
    ScrollDown,
    PageUp,
    PageDown,
    SeekForward,
    SeekBack,
    /// Progress-bar drag sample; absorbed until release.
    SeekDrag { fraction: f32 },
    SeekDragRelease,
    RemoveRow(usize),
    MoveRowUp(usize),
    MoveRowDown(usize),
    ClearQueueKeepPlaying,
    VolumeUp,
    VolumeDown,
    ToggleShuffle,
    CycleRepeat,
    SkipToNumbered(usize),
    SkipToLast,
    AddToFavorites,
    ExportFavorites,
    UpdateLibrary,
    ToggleLibrarySort,
    Resize,
    ViewChange,
    Quit,
}

/// Rate-limit class an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleClass {
    /// Prev/Next: ignored if the last accepted one was under 400 ms ago.
    PrevNext,
    /// Scroll, seek steps, paging: 20 ms window.
    FastNav,
    Unthrottled,
}

impl Event {
    pub fn throttle_class(&self) -> ThrottleClass {
        match self {
            Event::NextTrack | Event::PrevTrack => ThrottleClass::PrevNext,
            Event::ScrollUp
            | Event::ScrollDown
            | Event::PageUp
            | Event::PageDown
            | Event::SeekForward
            | Event::SeekBack => ThrottleClass::FastNav,
            _ => ThrottleClass::Unthrottled,
        }
    }

    /// Seek and remove actions carry an extra 100 ms cooldown to avoid
    /// double-action on key repeat.
    pub fn has_action_cooldown(&self) -> bool {
        matches!(
            self,
            Event::SeekForward | Event::SeekBack | Event::RemoveRow(_)
        )
    }

    pub fn is_drag(&self) -> bool {
        matches!(self, Event::SeekDrag { .. } | Event::SeekDragRelease)
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, ThrottleClass};

    #[test]
    fn test_prev_next_share_a_throttle_class() {
        assert_eq!(Event::NextTrack.throttle_class(), ThrottleClass::PrevNext);
        assert_eq!(Event::PrevTrack.throttle_class(), ThrottleClass::PrevNext);
    }

    #[test]
    fn test_fast_nav_covers_scroll_seek_and_paging() {
        for event in [
            Event::ScrollUp,
            Event::ScrollDown,
            Event::PageUp,
            Event::PageDown,
            Event::SeekForward,
            Event::SeekBack,
        ] {
            assert_eq!(event.throttle_class(), ThrottleClass::FastNav);
        }
    }

    #[test]
    fn test_seek_and_remove_have_cooldowns() {
        assert!(Event::SeekForward.has_action_cooldown());
        assert!(Event::RemoveRow(3).has_action_cooldown());
        assert!(!Event::NextTrack.has_action_cooldown());
    }
}
