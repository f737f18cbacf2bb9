//! OS process-table helpers.
//!
//! Diagnostics only: the supervisor tracks its own child through the handle
//! it spawned and never consults these.

use std::path::Path;

/// Whether a process with `pid` exists and can be signalled.
#[cfg(unix)]
#[must_use]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence. EPERM means it exists but is not ours.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

#[cfg(not(unix))]
#[must_use]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

/// Send SIGKILL to `pid`, bypassing any supervisor.
///
/// # Errors
///
/// Returns an error if the signal cannot be delivered.
#[cfg(unix)]
pub fn kill_pid(pid: u32) -> std::io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(std::io::Error::from)
}

#[cfg(not(unix))]
pub fn kill_pid(_pid: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "killing by pid is only supported on unix",
    ))
}

/// Find live processes whose executable is `binary`.
///
/// Scans `/proc`; other platforms return an empty list.
#[must_use]
pub fn find_pids_by_executable(binary: &Path) -> Vec<u32> {
    #[cfg(target_os = "linux")]
    {
        let Ok(wanted) = binary.canonicalize() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir("/proc") else {
            return Vec::new();
        };

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                std::fs::read_link(format!("/proc/{pid}/exe")).is_ok_and(|exe| exe == wanted)
            })
            .filter(|pid| is_pid_alive(*pid))
            .collect();
        pids.sort_unstable();
        pids
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = binary;
        Vec::new()
    }
}

/// Zombies still answer signal 0 until reaped.
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string(format!("/proc/{pid}/stat")).is_ok_and(|stat| {
            // The state follows the parenthesised command name.
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                == Some("Z")
        })
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        false
    }
}
