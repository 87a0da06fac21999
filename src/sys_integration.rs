//! Single-instance policy via a per-user PID file.
//!
//! At startup the engine writes `{tempdir}/kew_{uid}.pid`. When the recorded
//! PID names a live kew process, the new invocation asks it to shut down,
//! waits for it to exit, and takes its place.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, warn};

const REPLACE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const REPLACE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(unix)]
fn current_uid() -> u32 {
    // Safety: getuid has no failure modes.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}

/// `{tempdir}/kew_{uid}.pid`.
pub fn pid_file_path() -> PathBuf {
    std::env::temp_dir().join(format!("kew_{}.pid", current_uid()))
}

/// Reads the decimal PID recorded in the file, if any.
pub fn read_pid_file(path: &std::path::Path) -> Option<i32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.trim().parse::<i32>().ok()
}

/// Writes this process's PID plus a newline.
pub fn create_pid_file(path: &std::path::Path) -> Result<(), String> {
    std::fs::write(path, format!("{}\n", std::process::id()))
        .map_err(|err| format!("Unable to create PID file {}: {}", path.display(), err))
}

pub fn delete_pid_file(path: &std::path::Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(unix)]
fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes for existence without delivering anything.
    let result = unsafe { libc::kill(pid, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: i32) -> bool {
    false
}

/// Checks `/proc/{pid}/comm` for the engine's name. Process names may be
/// truncated to 15 characters, so a substring match is used.
#[cfg(target_os = "linux")]
fn is_kew_process(pid: i32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .map(|name| name.contains("kew"))
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_kew_process(_pid: i32) -> bool {
    true
}

#[cfg(unix)]
fn request_shutdown(pid: i32) -> bool {
    unsafe { libc::kill(pid, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn request_shutdown(_pid: i32) -> bool {
    false
}

/// Ensures only a single instance runs per user: a prior live instance is
/// shut down and replaced, a stale PID file is removed.
pub fn replace_running_instance() -> Result<(), String> {
    let path = pid_file_path();

    if let Some(old_pid) = read_pid_file(&path) {
        if is_process_running(old_pid) && is_kew_process(old_pid) {
            debug!("Replacing running instance with pid {}", old_pid);
            if request_shutdown(old_pid) {
                let started = Instant::now();
                while is_process_running(old_pid) {
                    if started.elapsed() > REPLACE_WAIT_TIMEOUT {
                        warn!("Previous instance (pid {}) did not exit in time", old_pid);
                        break;
                    }
                    std::thread::sleep(REPLACE_POLL_INTERVAL);
                }
            } else {
                warn!("Failed to signal previous instance (pid {})", old_pid);
            }
        }
        delete_pid_file(&path);
    }

    create_pid_file(&path)
}

#[cfg(test)]
mod tests {
    use super::{create_pid_file, delete_pid_file, read_pid_file};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_pid_path(test_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after UNIX_EPOCH")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "kew_test_{}_{}_{}.pid",
            test_name,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn test_pid_file_round_trips_own_pid() {
        let path = unique_pid_path("roundtrip");
        create_pid_file(&path).expect("pid file should be writable");

        let content = std::fs::read_to_string(&path).expect("pid file should be readable");
        assert!(content.ends_with('\n'));
        assert_eq!(read_pid_file(&path), Some(std::process::id() as i32));

        delete_pid_file(&path);
        assert!(read_pid_file(&path).is_none());
    }

    #[test]
    fn test_garbage_pid_file_reads_as_none() {
        let path = unique_pid_path("garbage");
        std::fs::write(&path, "not a pid\n").expect("pid file should be writable");
        assert_eq!(read_pid_file(&path), None);
        delete_pid_file(&path);
    }
}
