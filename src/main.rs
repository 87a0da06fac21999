//! kew binary entrypoint.

mod app_runtime;
mod audio;
mod cli;
mod config;
mod config_persistence;
mod control;
mod library;
mod media_controls_manager;
mod media_file_discovery;
mod metadata_tags;
mod playback;
mod playlist;
mod protocol;
mod sys_integration;
mod theme;

use clap::Parser;
use log::error;

use crate::cli::{parse_volume_argument, Cli, Command};

fn initialize_logging() {
    let mut clog = colog::basic_builder();
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        // Respect explicit user overrides completely when RUST_LOG is set.
        clog.parse_filters(&rust_log);
    } else {
        // Default policy: full kew diagnostics, warnings/errors from dependencies.
        clog.filter(None, log::LevelFilter::Warn);
        clog.filter(Some("kew"), log::LevelFilter::Debug);
    }
    clog.init();
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));
}

/// Debug builds write stderr into `error.log` in the working directory so
/// diagnostics survive raw terminal mode.
#[cfg(all(debug_assertions, unix))]
fn redirect_stderr_to_log_file() {
    use std::os::unix::io::AsRawFd;
    match std::fs::File::create("error.log") {
        Ok(file) => unsafe {
            if libc::dup2(file.as_raw_fd(), libc::STDERR_FILENO) == -1 {
                eprintln!("Failed to redirect stderr to error.log");
            }
            // Keep the descriptor alive for the process lifetime.
            std::mem::forget(file);
        },
        Err(err) => eprintln!("Failed to create error.log: {}", err),
    }
}

#[cfg(not(all(debug_assertions, unix)))]
fn redirect_stderr_to_log_file() {}

fn main() {
    initialize_logging();
    install_panic_hook();
    redirect_stderr_to_log_file();

    // Clap exits with status 2 on argument parse errors.
    let cli = Cli::parse();
    if let Some(Command::Volume { amount }) = cli.command.as_ref() {
        if let Err(err) = parse_volume_argument(amount) {
            eprintln!("{}", err);
            std::process::exit(2);
        }
    }

    match app_runtime::AppRuntime::build(cli) {
        Ok(runtime) => {
            if let Err(err) = runtime.run() {
                error!("{}", err);
                std::process::exit(1);
            }
        }
        Err(err) => {
            error!("Startup failed: {}", err);
            std::process::exit(1);
        }
    }
}
