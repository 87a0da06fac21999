//! Play queue model: one shared song store with two orderings.
//!
//! The *display* order is the stable, user-visible queue. The *play* order is
//! the traversal order, equal to the display order while shuffle is off and
//! independently shuffled while it is on. Both orders reference songs by id;
//! the id sets are always equal. A third append-only *favorites* list is kept
//! alongside.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use rand::{rngs::StdRng, Rng, RngExt, SeedableRng};

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next monotonically increasing track id.
///
/// The same path enqueued twice produces two distinct ids.
pub fn next_track_id() -> u64 {
    NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed)
}

/// One enqueued song. Duration is filled in once a decoder has seen the file.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSong {
    pub id: u64,
    pub path: PathBuf,
    /// Duration in seconds; 0.0 until known.
    pub duration: f64,
}

/// The queue: shared song store, display order, play order, favorites.
pub struct PlayQueue {
    songs: HashMap<u64, QueuedSong>,
    display_order: Vec<u64>,
    play_order: Vec<u64>,
    favorites: Vec<QueuedSong>,
    rng_seed: [u8; 32],
}

impl PlayQueue {
    pub fn new() -> PlayQueue {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");

        PlayQueue {
            songs: HashMap::new(),
            display_order: Vec::new(),
            play_order: Vec::new(),
            favorites: Vec::new(),
            rng_seed: seed,
        }
    }

    pub fn len(&self) -> usize {
        self.display_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.display_order.is_empty()
    }

    pub fn song(&self, id: u64) -> Option<&QueuedSong> {
        self.songs.get(&id)
    }

    pub fn set_duration(&mut self, id: u64, duration: f64) {
        if let Some(song) = self.songs.get_mut(&id) {
            song.duration = duration;
        }
    }

    pub fn display_ids(&self) -> &[u64] {
        &self.display_order
    }

    pub fn play_ids(&self) -> &[u64] {
        &self.play_order
    }

    pub fn favorites(&self) -> &[QueuedSong] {
        &self.favorites
    }

    /// Appends a new song at the tail of both orders and returns its id.
    ///
    /// Fails when the id is already present in an order; the orphan entry is
    /// dropped by the caller simply by discarding the error.
    pub fn enqueue(&mut self, path: &Path) -> Result<u64, String> {
        let id = next_track_id();
        self.enqueue_with_id(path, id)
    }

    pub(crate) fn enqueue_with_id(&mut self, path: &Path, id: u64) -> Result<u64, String> {
        if self.songs.contains_key(&id) {
            return Err(format!("Track id {} already enqueued", id));
        }
        self.songs.insert(
            id,
            QueuedSong {
                id,
                path: path.to_path_buf(),
                duration: 0.0,
            },
        );
        self.display_order.push(id);
        self.play_order.push(id);
        Ok(id)
    }

    /// Removes a song from both orders; O(1) unlink on the store, linear on
    /// the order vectors.
    pub fn remove(&mut self, id: u64) -> Option<QueuedSong> {
        let song = self.songs.remove(&id)?;
        self.display_order.retain(|entry| *entry != id);
        self.play_order.retain(|entry| *entry != id);
        Some(song)
    }

    /// Removes everything except the song with `keep_id` (or everything when
    /// `keep_id` is `None`). Returns the removed songs for library unmarking.
    pub fn remove_all_except(&mut self, keep_id: Option<u64>) -> Vec<QueuedSong> {
        let removed_ids: Vec<u64> = self
            .display_order
            .iter()
            .copied()
            .filter(|id| Some(*id) != keep_id)
            .collect();
        let mut removed = Vec::with_capacity(removed_ids.len());
        for id in removed_ids {
            if let Some(song) = self.remove(id) {
                removed.push(song);
            }
        }
        removed
    }

    pub fn display_position(&self, id: u64) -> Option<usize> {
        self.display_order.iter().position(|entry| *entry == id)
    }

    pub fn id_at_display_row(&self, row: usize) -> Option<u64> {
        self.display_order.get(row).copied()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&QueuedSong> {
        self.display_order
            .iter()
            .filter_map(|id| self.songs.get(id))
            .find(|song| song.path == path)
    }

    pub fn find_last_by_path(&self, path: &Path) -> Option<&QueuedSong> {
        self.display_order
            .iter()
            .rev()
            .filter_map(|id| self.songs.get(id))
            .find(|song| song.path == path)
    }

    fn move_in_order(order: &mut [u64], id: u64, delta: isize) -> bool {
        let Some(position) = order.iter().position(|entry| *entry == id) else {
            return false;
        };
        let target = position as isize + delta;
        if target < 0 || target as usize >= order.len() {
            return false;
        }
        order.swap(position, target as usize);
        true
    }

    /// Moves the song one row up in the display order, mirrored into the
    /// play order when `mirror_play` is set (shuffle off).
    pub fn move_up(&mut self, id: u64, mirror_play: bool) -> bool {
        let moved = Self::move_in_order(&mut self.display_order, id, -1);
        if moved && mirror_play {
            Self::move_in_order(&mut self.play_order, id, -1);
        }
        moved
    }

    pub fn move_down(&mut self, id: u64, mirror_play: bool) -> bool {
        let moved = Self::move_in_order(&mut self.display_order, id, 1);
        if moved && mirror_play {
            Self::move_in_order(&mut self.play_order, id, 1);
        }
        moved
    }

    /// Rebuilds the play order as an exact copy of the display order.
    ///
    /// Used when shuffle is disabled so traversal mirrors the visible queue.
    pub fn copy_display_onto_play(&mut self) {
        self.play_order = self.display_order.clone();
    }

    /// Fisher-Yates over the play order; when `pinned` names a queued song it
    /// is rotated to the front so the current song keeps playing unchanged.
    pub fn shuffle_play_order(&mut self, pinned: Option<u64>) {
        let count = self.play_order.len();
        if count == 0 {
            return;
        }

        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).expect("Failed to generate random seed");
        self.rng_seed = seed;
        let mut rng = StdRng::from_seed(self.rng_seed);

        for i in (1..count).rev() {
            let j = rng.random_range(0..=i);
            self.play_order.swap(i, j);
        }

        if let Some(pinned_id) = pinned {
            if let Some(position) = self.play_order.iter().position(|id| *id == pinned_id) {
                self.play_order.remove(position);
                self.play_order.insert(0, pinned_id);
            }
        }

        debug!("PlayQueue: new shuffle sequence: {:?}", self.play_order);
    }

    pub fn head_of_play(&self) -> Option<u64> {
        self.play_order.first().copied()
    }

    pub fn tail_of_play(&self) -> Option<u64> {
        self.play_order.last().copied()
    }

    /// The play-order successor of `id`, without repeat-list wrapping.
    pub fn next_in_play(&self, id: u64) -> Option<u64> {
        let position = self.play_order.iter().position(|entry| *entry == id)?;
        self.play_order.get(position + 1).copied()
    }

    pub fn prev_in_play(&self, id: u64) -> Option<u64> {
        let position = self.play_order.iter().position(|entry| *entry == id)?;
        if position == 0 {
            return None;
        }
        self.play_order.get(position - 1).copied()
    }

    /// The song at 1-based position `number` in the display order, clamped to
    /// the final row.
    pub fn id_at_number(&self, number: usize) -> Option<u64> {
        if self.display_order.is_empty() {
            return None;
        }
        let row = number.max(1).min(self.display_order.len()) - 1;
        self.display_order.get(row).copied()
    }

    /// Appends the song to favorites unless an entry with the same id exists.
    pub fn add_favorite(&mut self, id: u64) -> bool {
        if self.favorites.iter().any(|entry| entry.id == id) {
            return false;
        }
        let Some(song) = self.songs.get(&id) else {
            return false;
        };
        self.favorites.push(song.clone());
        true
    }
}

impl Default for PlayQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::PlayQueue;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};

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
    fn test_enqueue_assigns_distinct_ids_for_same_path() {
        let mut queue = PlayQueue::new();
        let first = queue.enqueue(Path::new("/music/a.flac")).unwrap();
        let second = queue.enqueue(Path::new("/music/a.flac")).unwrap();
        assert_ne!(first, second);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_enqueue_with_existing_id_fails_and_leaves_queue_untouched() {
        let (mut queue, ids) = queue_with_tracks(1);
        let result = queue.enqueue_with_id(Path::new("/music/dup.flac"), ids[0]);
        assert!(result.is_err());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_shuffle_preserves_id_set_and_display_order() {
        let (mut queue, ids) = queue_with_tracks(5);
        queue.shuffle_play_order(None);

        assert_eq!(queue.display_ids(), ids.as_slice());
        let display: HashSet<u64> = queue.display_ids().iter().copied().collect();
        let play: HashSet<u64> = queue.play_ids().iter().copied().collect();
        assert_eq!(display, play);
    }

    #[test]
    fn test_shuffle_pins_current_song_to_front() {
        let (mut queue, ids) = queue_with_tracks(5);
        let pinned = ids[2];
        queue.shuffle_play_order(Some(pinned));
        assert_eq!(queue.head_of_play(), Some(pinned));
    }

    #[test]
    fn test_copy_display_onto_play_restores_display_traversal() {
        let (mut queue, ids) = queue_with_tracks(5);
        queue.shuffle_play_order(Some(ids[2]));
        queue.copy_display_onto_play();
        assert_eq!(queue.play_ids(), ids.as_slice());
    }

    #[test]
    fn test_remove_unlinks_from_both_orders() {
        let (mut queue, ids) = queue_with_tracks(3);
        queue.shuffle_play_order(None);
        let removed = queue.remove(ids[1]).expect("song should be removed");
        assert_eq!(removed.id, ids[1]);
        assert!(!queue.display_ids().contains(&ids[1]));
        assert!(!queue.play_ids().contains(&ids[1]));
        assert!(queue.song(ids[1]).is_none());
    }

    #[test]
    fn test_move_up_mirrors_into_play_order_only_when_requested() {
        let (mut queue, ids) = queue_with_tracks(3);

        assert!(queue.move_up(ids[2], true));
        assert_eq!(queue.display_ids(), &[ids[0], ids[2], ids[1]]);
        assert_eq!(queue.play_ids(), &[ids[0], ids[2], ids[1]]);

        assert!(queue.move_down(ids[2], false));
        assert_eq!(queue.display_ids(), &[ids[0], ids[1], ids[2]]);
        assert_eq!(queue.play_ids(), &[ids[0], ids[2], ids[1]]);
    }

    #[test]
    fn test_move_up_at_head_is_rejected() {
        let (mut queue, ids) = queue_with_tracks(2);
        assert!(!queue.move_up(ids[0], true));
        assert_eq!(queue.display_ids(), &[ids[0], ids[1]]);
    }

    #[test]
    fn test_next_and_prev_follow_play_order() {
        let (mut queue, ids) = queue_with_tracks(3);
        queue.copy_display_onto_play();
        assert_eq!(queue.next_in_play(ids[0]), Some(ids[1]));
        assert_eq!(queue.prev_in_play(ids[0]), None);
        assert_eq!(queue.next_in_play(ids[2]), None);
        assert_eq!(queue.prev_in_play(ids[2]), Some(ids[1]));
    }

    #[test]
    fn test_find_last_by_path_returns_latest_duplicate() {
        let mut queue = PlayQueue::new();
        let first = queue.enqueue(Path::new("/music/same.flac")).unwrap();
        let second = queue.enqueue(Path::new("/music/same.flac")).unwrap();

        assert_eq!(
            queue.find_by_path(Path::new("/music/same.flac")).unwrap().id,
            first
        );
        assert_eq!(
            queue
                .find_last_by_path(Path::new("/music/same.flac"))
                .unwrap()
                .id,
            second
        );
    }

    #[test]
    fn test_favorites_deduplicate_by_id() {
        let (mut queue, ids) = queue_with_tracks(2);
        assert!(queue.add_favorite(ids[0]));
        assert!(!queue.add_favorite(ids[0]));
        assert!(queue.add_favorite(ids[1]));
        assert_eq!(queue.favorites().len(), 2);
    }

    #[test]
    fn test_remove_all_except_keeps_only_playing_song() {
        let (mut queue, ids) = queue_with_tracks(3);
        let removed = queue.remove_all_except(Some(ids[1]));
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.display_ids(), &[ids[1]]);
        assert_eq!(queue.play_ids(), &[ids[1]]);
    }

    #[test]
    fn test_id_at_number_clamps_to_bounds() {
        let (queue, ids) = queue_with_tracks(3);
        assert_eq!(queue.id_at_number(0), Some(ids[0]));
        assert_eq!(queue.id_at_number(2), Some(ids[1]));
        assert_eq!(queue.id_at_number(99), Some(ids[2]));
    }
}
