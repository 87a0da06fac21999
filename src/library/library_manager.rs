//! Library runtime component: startup construction, background rescans, and
//! enqueue/dequeue bridging between the tree and the play queue.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Instant, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::library::library_cache::{load_tree, save_tree};
use crate::library::library_tree::{LibrarySort, LibraryTree};
use crate::media_file_discovery::collect_audio_files_from_folder;
use crate::playback::player_engine::EngineShared;
use crate::protocol::{LibraryMessage, Message, PlayerMessage, PlaylistMessage, StateMessage};

/// A cold scan longer than this prompts the user to enable the cache.
const ASK_IF_USE_CACHE_LIMIT_SECONDS: f64 = 4.0;

fn path_mtime_seconds(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// One-time terminal prompt asking whether to keep a library cache.
fn ask_if_cache_library() -> bool {
    print!(
        "Would you like to enable a (local) library cache for quicker startup times?\n\
         You can update the cache at any time by rescanning. (y/n): "
    );
    let _ = std::io::stdout().flush();

    let mut input = String::new();
    loop {
        input.clear();
        if std::io::stdin().read_line(&mut input).is_err() {
            return false;
        }
        match input.trim() {
            "y" | "Y" => return true,
            "n" | "N" => return false,
            _ => continue,
        }
    }
}

/// Coordinates the library tree lifecycle over the bus.
pub struct LibraryManager {
    bus_receiver: Receiver<Message>,
    bus_sender: Sender<Message>,
    shared: Arc<EngineShared>,
    music_root: PathBuf,
    cache_path: PathBuf,
    sort: LibrarySort,
    rescan_running: Arc<AtomicBool>,
}

impl LibraryManager {
    pub fn new(
        bus_receiver: Receiver<Message>,
        bus_sender: Sender<Message>,
        shared: Arc<EngineShared>,
        music_root: PathBuf,
        cache_path: PathBuf,
    ) -> LibraryManager {
        LibraryManager {
            bus_receiver,
            bus_sender,
            shared,
            music_root,
            cache_path,
            sort: LibrarySort::Natural,
            rescan_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds the startup tree: from cache when enabled, otherwise a full
    /// scan. A slow cold scan prompts once for the cache setting.
    pub fn initialize(&mut self, cache_enabled: Option<bool>, last_time_app_ran: i64) {
        let mut tree: Option<LibraryTree> = None;

        if cache_enabled == Some(true) {
            tree = load_tree(&self.cache_path);
            if tree.is_some() {
                self.schedule_mtime_check(last_time_app_ran);
            }
        }

        if tree.is_none() {
            let started = Instant::now();
            match LibraryTree::build_from_disk(&self.music_root, self.sort) {
                Ok(scanned) => {
                    let elapsed = started.elapsed().as_secs_f64();
                    debug!(
                        "LibraryManager: full scan of {} took {:.2}s",
                        self.music_root.display(),
                        elapsed
                    );
                    if elapsed > ASK_IF_USE_CACHE_LIMIT_SECONDS && cache_enabled.is_none() {
                        let answer = ask_if_cache_library();
                        let _ = self
                            .bus_sender
                            .send(Message::State(StateMessage::CacheLibraryAnswered(answer)));
                        if answer {
                            let _ = save_tree(&self.cache_path, &scanned);
                        }
                    }
                    tree = Some(scanned);
                }
                Err(err) => {
                    warn!("LibraryManager: scan failed: {}", err);
                    self.shared
                        .set_error(&format!("No music found at {}.", self.music_root.display()));
                }
            }
        }

        if let Some(tree) = tree {
            info!("LibraryManager: library ready with {} entries", tree.len());
            let mut live = self
                .shared
                .library_tree
                .lock()
                .expect("library tree lock poisoned");
            *live = tree;
        }
    }

    /// Compares the root's and its top-level subdirectories' mtimes against
    /// the previous run and schedules a rescan when anything is newer.
    fn schedule_mtime_check(&self, last_time_app_ran: i64) {
        if last_time_app_ran <= 0 {
            return;
        }
        let music_root = self.music_root.clone();
        let bus_sender = self.bus_sender.clone();
        thread::spawn(move || {
            let mut changed = path_mtime_seconds(&music_root) > last_time_app_ran;
            if !changed {
                if let Ok(entries) = std::fs::read_dir(&music_root) {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        if path.is_dir() && path_mtime_seconds(&path) > last_time_app_ran {
                            changed = true;
                            break;
                        }
                    }
                }
            }
            if changed {
                debug!("LibraryManager: library changed on disk, scheduling rescan");
                let _ = bus_sender.send(Message::Library(LibraryMessage::RequestRescan));
            }
        });
    }

    /// Starts the blocking manager loop.
    pub fn run(&mut self) {
        loop {
            match self.bus_receiver.blocking_recv() {
                Ok(Message::Library(message)) => self.handle_message(message),
                Ok(Message::System(crate::protocol::SystemMessage::Quit)) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("LibraryManager: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn handle_message(&mut self, message: LibraryMessage) {
        match message {
            LibraryMessage::RequestRescan => self.spawn_rescan(),
            LibraryMessage::ToggleSort => {
                self.sort = self.sort.toggled();
                let mut tree = self
                    .shared
                    .library_tree
                    .lock()
                    .expect("library tree lock poisoned");
                tree.resort(self.sort);
                drop(tree);
                self.shared.trigger_refresh();
            }
            LibraryMessage::Enqueue(path) => self.enqueue_entry(&path, false),
            LibraryMessage::EnqueueAndPlay(path) => self.enqueue_entry(&path, true),
            LibraryMessage::EnqueueQueryAndPlay(query) => {
                let matched = {
                    let tree = self
                        .shared
                        .library_tree
                        .lock()
                        .expect("library tree lock poisoned");
                    tree.search_by_name(&query)
                        .map(|index| tree.node(index).full_path.clone())
                };
                match matched {
                    Some(path) => self.enqueue_entry(&path, true),
                    None => self
                        .shared
                        .set_error(&format!("No library match for '{}'", query)),
                }
            }
            LibraryMessage::TreeReplaced { .. } => {}
        }
    }

    /// Rebuilds the tree on a background thread. The fresh tree is built
    /// outside every lock; only the pointer swap happens under the playback
    /// lock, with `is_enqueued` flags copied across by path.
    fn spawn_rescan(&self) {
        if self.rescan_running.swap(true, Ordering::AcqRel) {
            debug!("LibraryManager: rescan already running");
            return;
        }
        let music_root = self.music_root.clone();
        let cache_path = self.cache_path.clone();
        let sort = self.sort;
        let shared = Arc::clone(&self.shared);
        let bus_sender = self.bus_sender.clone();
        let rescan_running = Arc::clone(&self.rescan_running);

        thread::Builder::new()
            .name("kew-library-rescan".to_string())
            .spawn(move || {
                shared.set_error("Updating Library...");
                match LibraryTree::build_from_disk(&music_root, sort) {
                    Ok(mut fresh) => {
                        let entry_count = fresh.len();
                        {
                            let _playback =
                                shared.playback.lock().expect("playback lock poisoned");
                            let mut live = shared
                                .library_tree
                                .lock()
                                .expect("library tree lock poisoned");
                            fresh.copy_is_enqueued_from(&live);
                            *live = fresh;
                        }
                        {
                            let live = shared
                                .library_tree
                                .lock()
                                .expect("library tree lock poisoned");
                            let _ = save_tree(&cache_path, &live);
                        }
                        let _ = bus_sender
                            .send(Message::Library(LibraryMessage::TreeReplaced { entry_count }));
                        shared.trigger_refresh();
                    }
                    Err(err) => {
                        // The scan aborts; the old tree remains live.
                        warn!("LibraryManager: rescan failed: {}", err);
                    }
                }
                rescan_running.store(false, Ordering::Release);
            })
            .expect("rescan thread should spawn");
    }

    /// Enqueues a leaf or an entire subtree, marking the tree and leaving
    /// resume hints so a stopped player starts from the first new song.
    fn enqueue_entry(&self, path: &Path, play_now: bool) {
        let enqueued_any = {
            let mut playback = self.shared.playback.lock().expect("playback lock poisoned");
            let mut queue = self.shared.queue.lock().expect("queue lock poisoned");
            let mut tree = self
                .shared
                .library_tree
                .lock()
                .expect("library tree lock poisoned");

            let was_empty = queue.is_empty();
            let node_index = tree.find_by_path(path);
            let leaves: Vec<PathBuf> = match node_index {
                Some(index) if tree.node(index).is_directory => tree.leaf_paths_under(index),
                Some(_) => vec![path.to_path_buf()],
                // Paths outside the library tree (CLI arguments) are playable
                // too; they simply have no tree node to mark.
                None if path.is_file() => vec![path.to_path_buf()],
                None if path.is_dir() => collect_audio_files_from_folder(path),
                None => {
                    drop(tree);
                    drop(queue);
                    drop(playback);
                    self.shared
                        .set_error(&format!("Not found in library: {}", path.display()));
                    return;
                }
            };

            let mut first_enqueued: Option<u64> = None;
            for leaf in &leaves {
                let already_enqueued = tree
                    .find_by_path(leaf)
                    .map(|index| tree.node(index).is_enqueued)
                    .unwrap_or(false);
                if already_enqueued {
                    continue;
                }
                match queue.enqueue(leaf) {
                    Ok(id) => {
                        tree.mark_enqueued(leaf);
                        if first_enqueued.is_none() {
                            first_enqueued = Some(id);
                        }
                    }
                    Err(err) => warn!("LibraryManager: {}", err),
                }
            }

            let Some(first) = first_enqueued else {
                // Everything under the entry is queued already: the action
                // toggles, dequeueing each leaf instead.
                drop(tree);
                drop(queue);
                drop(playback);
                for leaf in &leaves {
                    self.dequeue_entry(leaf);
                }
                return;
            };

            // Enqueueing the whole root into an empty queue shuffles the
            // play order up front when shuffle is on.
            let enqueued_root = node_index.is_some() && node_index == tree.root();
            if playback.shuffle {
                if enqueued_root && was_empty {
                    queue.shuffle_play_order(None);
                } else {
                    queue.shuffle_play_order(playback.current);
                }
            }

            if playback.is_stopped() {
                playback.waiting_for_playlist = false;
                playback.waiting_for_next = true;
                playback.song_to_start_from = Some(first);
                playback.last_played_id = None;
            }
            true
        };

        if enqueued_any {
            let _ = self
                .bus_sender
                .send(Message::Playlist(PlaylistMessage::QueueChanged));
            self.shared.trigger_refresh();
            if play_now {
                let _ = self.bus_sender.send(Message::Player(PlayerMessage::Play));
            }
        }
    }

    /// Dequeues the most recent queue entry for `path`; the engine owns the
    /// actual removal and the tree unmarking.
    fn dequeue_entry(&self, path: &Path) {
        let id = {
            let queue = self.shared.queue.lock().expect("queue lock poisoned");
            queue.find_last_by_path(path).map(|song| song.id)
        };
        match id {
            Some(id) => {
                let _ = self
                    .bus_sender
                    .send(Message::Playlist(PlaylistMessage::RemoveId(id)));
            }
            None => debug!(
                "LibraryManager: dequeue for {} matched nothing",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::path_mtime_seconds;
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
    fn test_path_mtime_is_positive_for_existing_paths() {
        let dir = unique_temp_directory("mtime");
        assert!(path_mtime_seconds(&dir) > 0);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_path_mtime_is_zero_for_missing_paths() {
        assert_eq!(
            path_mtime_seconds(std::path::Path::new("/nonexistent/kew")),
            0
        );
    }
}
