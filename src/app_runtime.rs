//! Application runtime bootstrap and top-level orchestration.

use std::path::PathBuf;
use std::sync::mpsc::Sender as StdSender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use tokio::sync::broadcast;

use crate::cli::{parse_volume_argument, Cli, Command, VolumeChange};
use crate::config::{expand_home, Config, PersistedState};
use crate::config_persistence::{
    config_file_path, config_root, library_cache_path, load_config, load_state, persist_config,
    persist_state, state_file_path, themes_dir,
};
use crate::control::event_loop::ControlPlane;
use crate::control::events::Event;
use crate::library::library_cache::save_tree;
use crate::library::library_manager::LibraryManager;
use crate::media_controls_manager::MediaControlsManager;
use crate::media_file_discovery::is_playlist_file;
use crate::playback::player_engine::{EngineShared, PlayerEngine};
use crate::protocol::{
    LibraryMessage, Message, PlayerMessage, PlaylistMessage, StateMessage, SystemMessage,
};
use crate::sys_integration::{delete_pid_file, pid_file_path, replace_running_instance};
use crate::theme::{available_themes, resolve_theme};

/// What to do after CLI dispatch: keep running or print-and-exit.
enum CliDispatch {
    Continue,
    Exit,
}

/// Owns startup wiring and the main-thread control loop.
pub struct AppRuntime {
    bus_sender: broadcast::Sender<Message>,
    shared: Arc<EngineShared>,
    control_plane: ControlPlane,
    event_sender: StdSender<Event>,
    config: Config,
    state: Arc<Mutex<PersistedState>>,
    state_file: PathBuf,
    cache_path: PathBuf,
    exit_after_dispatch: bool,
}

impl AppRuntime {
    /// Loads config and state, claims the single-instance slot, and wires
    /// all runtime services.
    pub fn build(cli: Cli) -> Result<AppRuntime, String> {
        replace_running_instance()?;

        let root = config_root()?;
        let config_file = config_file_path(&root);
        let state_file = state_file_path(&root);
        let cache_path = library_cache_path(&root);
        let themes = themes_dir(&root);
        let _ = std::fs::create_dir_all(&themes);

        if !config_file.exists() {
            info!(
                "Config file not found. Creating default config. path={}",
                config_file.display()
            );
            let defaults = crate::config::sanitize_config(Config::default());
            persist_config(&config_file, &defaults);
        }
        let config = load_config(&config_file);
        let mut state = load_state(&state_file);

        // CLI theme selection is applied before the theme is resolved.
        let mut exit_after_dispatch = false;
        if let Some(Command::Theme { name }) = cli.command.as_ref() {
            let known = available_themes(&themes);
            if name.trim() != "default" && !known.iter().any(|theme| theme == name.trim()) {
                warn!("Theme '{}' is not in {}", name, themes.display());
            }
            state.theme = name.trim().to_string();
            persist_state(&state_file, &state);
        }

        let theme = resolve_theme(&themes, &state.theme).resolved(state.color_mode);
        debug!(
            "Theme '{}' resolved under {:?} mode (nowplaying {:?})",
            state.theme, state.color_mode, theme.nowplaying
        );

        let covers = root.join("covers");
        let shared = EngineShared::new(Some(covers));
        shared
            .volume
            .store(u32::from(state.volume), std::sync::atomic::Ordering::Release);
        if config.playback.save_repeat_shuffle {
            let mut playback = shared.playback.lock().expect("playback lock poisoned");
            playback.shuffle = state.shuffle;
            playback.repeat = state.repeat;
        }

        let (bus_sender, _) = broadcast::channel::<Message>(8192);
        let music_root = expand_home(&config.library.music_root);
        let quit_on_stop = config.playback.quit_on_stop || cli.quitonstop;

        // Subscribe every consumer before the first message is sent so
        // early CLI traffic is buffered rather than lost.
        let engine_receiver = bus_sender.subscribe();
        let library_receiver = bus_sender.subscribe();
        let controls_receiver = bus_sender.subscribe();
        let state_receiver = bus_sender.subscribe();

        {
            let mut engine = PlayerEngine::new(
                engine_receiver,
                bus_sender.clone(),
                Arc::clone(&shared),
                music_root.clone(),
                quit_on_stop,
            );
            thread::Builder::new()
                .name("kew-player-engine".to_string())
                .spawn(move || engine.run())
                .map_err(|err| format!("Failed to spawn player engine: {}", err))?;
        }

        {
            let cache_enabled = config.library.cache_library;
            let last_time_app_ran = state.last_time_app_ran;
            let mut library = LibraryManager::new(
                library_receiver,
                bus_sender.clone(),
                Arc::clone(&shared),
                music_root,
                cache_path.clone(),
            );
            thread::Builder::new()
                .name("kew-library".to_string())
                .spawn(move || {
                    library.initialize(cache_enabled, last_time_app_ran);
                    library.run();
                })
                .map_err(|err| format!("Failed to spawn library manager: {}", err))?;
        }

        {
            let mut controls = MediaControlsManager::new(controls_receiver, bus_sender.clone());
            thread::Builder::new()
                .name("kew-media-controls".to_string())
                .spawn(move || controls.run())
                .map_err(|err| format!("Failed to spawn media controls: {}", err))?;
        }

        let state = Arc::new(Mutex::new(state));
        Self::spawn_state_listener(
            state_receiver,
            Arc::clone(&state),
            config.clone(),
            config_file,
            state_file.clone(),
        );

        let (control_plane, event_sender) = ControlPlane::new(
            bus_sender.clone(),
            Arc::clone(&shared),
            config.playback.seek_step_seconds,
            config.playback.volume_step,
        );

        let mut runtime = AppRuntime {
            bus_sender,
            shared,
            control_plane,
            event_sender,
            config,
            state,
            state_file,
            cache_path,
            exit_after_dispatch,
        };

        if let CliDispatch::Exit = runtime.dispatch_command(cli.command)? {
            exit_after_dispatch = true;
        }
        runtime.exit_after_dispatch = exit_after_dispatch;
        Ok(runtime)
    }

    fn spawn_state_listener(
        mut receiver: broadcast::Receiver<Message>,
        state: Arc<Mutex<PersistedState>>,
        mut config: Config,
        config_file: PathBuf,
        state_file: PathBuf,
    ) {
        thread::spawn(move || loop {
            match receiver.blocking_recv() {
                Ok(Message::State(StateMessage::ThemeChanged(name))) => {
                    let mut state = state.lock().expect("state lock poisoned");
                    state.theme = name;
                    persist_state(&state_file, &state);
                }
                Ok(Message::State(StateMessage::CacheLibraryAnswered(answer))) => {
                    config.library.cache_library = Some(answer);
                    persist_config(&config_file, &config);
                }
                Ok(Message::State(StateMessage::StateDirty)) => {}
                Ok(Message::System(SystemMessage::Quit)) => break,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        });
    }

    /// Handle input events from collaborating input sources.
    pub fn event_sender(&self) -> StdSender<Event> {
        self.event_sender.clone()
    }

    fn dispatch_command(&mut self, command: Option<Command>) -> Result<CliDispatch, String> {
        let Some(command) = command else {
            return Ok(CliDispatch::Continue);
        };

        match command {
            Command::Play { target: None } => {
                let _ = self.bus_sender.send(Message::Player(PlayerMessage::Play));
            }
            Command::Play {
                target: Some(target),
            } => {
                let expanded = expand_home(&target);
                if expanded.exists() {
                    if is_playlist_file(&expanded) {
                        let _ = self.bus_sender.send(Message::Playlist(
                            PlaylistMessage::LoadPlaylistFile(expanded),
                        ));
                        let _ = self.bus_sender.send(Message::Player(PlayerMessage::Play));
                    } else {
                        let _ = self
                            .bus_sender
                            .send(Message::Library(LibraryMessage::EnqueueAndPlay(expanded)));
                    }
                } else {
                    let _ = self.bus_sender.send(Message::Library(
                        LibraryMessage::EnqueueQueryAndPlay(target),
                    ));
                }
            }
            Command::Pause => {
                let _ = self
                    .bus_sender
                    .send(Message::Player(PlayerMessage::TogglePause));
            }
            Command::Stop => {
                let _ = self.bus_sender.send(Message::Player(PlayerMessage::Stop));
            }
            Command::Next => {
                let _ = self.bus_sender.send(Message::Player(PlayerMessage::Next));
            }
            Command::Prev => {
                let _ = self
                    .bus_sender
                    .send(Message::Player(PlayerMessage::Previous));
            }
            Command::Shuffle => {
                let _ = self
                    .bus_sender
                    .send(Message::Player(PlayerMessage::ToggleShuffle));
            }
            Command::Repeat => {
                let _ = self
                    .bus_sender
                    .send(Message::Player(PlayerMessage::CycleRepeat));
            }
            Command::Volume { amount } => match parse_volume_argument(&amount)? {
                VolumeChange::Set(volume) => {
                    let _ = self
                        .bus_sender
                        .send(Message::Player(PlayerMessage::SetVolume(volume)));
                }
                VolumeChange::Adjust(delta) => {
                    let _ = self
                        .bus_sender
                        .send(Message::Player(PlayerMessage::AdjustVolume(delta)));
                }
            },
            Command::List => {
                self.print_queue();
                return Ok(CliDispatch::Exit);
            }
            // Applied during build, before the theme was resolved; the bus
            // notification lets running listeners follow the change.
            Command::Theme { name } => {
                let _ = self
                    .bus_sender
                    .send(Message::State(StateMessage::ThemeChanged(name)));
            }
        }
        Ok(CliDispatch::Continue)
    }

    fn print_queue(&self) {
        let queue = self.shared.queue.lock().expect("queue lock poisoned");
        if queue.is_empty() {
            println!("Queue is empty.");
            return;
        }
        for (row, id) in queue.display_ids().iter().enumerate() {
            if let Some(song) = queue.song(*id) {
                let minutes = (song.duration / 60.0) as u64;
                let seconds = (song.duration % 60.0) as u64;
                println!(
                    "{:>4}  {:>2}:{:02}  {}",
                    row + 1,
                    minutes,
                    seconds,
                    song.path.display()
                );
            }
        }
    }

    /// Runs the control loop on the calling thread until quit, then
    /// persists state and cleans up the PID file.
    pub fn run(mut self) -> Result<(), String> {
        if self.exit_after_dispatch {
            self.shutdown();
            return Ok(());
        }

        crate::control::input::spawn_input_reader(self.event_sender());
        self.control_plane.run();
        self.shutdown();
        info!("Application exiting");
        Ok(())
    }

    fn shutdown(&mut self) {
        // Make sure every manager thread unblocks and exits.
        let _ = self.bus_sender.send(Message::System(SystemMessage::Quit));

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0);

        {
            let mut state = self.state.lock().expect("state lock poisoned");
            state.volume = self
                .shared
                .volume
                .load(std::sync::atomic::Ordering::Acquire)
                .min(100) as u8;
            state.last_time_app_ran = now;
            if self.config.playback.save_repeat_shuffle {
                let playback = self.shared.playback.lock().expect("playback lock poisoned");
                state.shuffle = playback.shuffle;
                state.repeat = playback.repeat;
            }
            persist_state(&self.state_file, &state);
        }

        if self.config.library.cache_library == Some(true) {
            let tree = self
                .shared
                .library_tree
                .lock()
                .expect("library tree lock poisoned");
            if !tree.is_empty() {
                if let Err(err) = save_tree(&self.cache_path, &tree) {
                    warn!("Failed to save library cache: {}", err);
                }
            }
        }

        delete_pid_file(&pid_file_path());
    }
}
