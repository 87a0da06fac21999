pub mod playback_state;
pub mod player_engine;
pub mod track_manager;
