use std::path::{Path, PathBuf};

/// Default daemon PID file name, relative to the project root.
pub const PID_FILE: &str = ".mcpd.pid";

pub fn default_path() -> PathBuf {
    PathBuf::from(PID_FILE)
}

/// Write this process's PID as plain decimal.
pub fn write(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

/// Read a PID file. None if the file is missing or not a decimal number.
pub fn read(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Check whether a process is alive by sending signal 0.
/// ESRCH (no such process) means dead; EPERM still counts as alive.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    match nix::sys::signal::kill(pid, None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}
