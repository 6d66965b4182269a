//! Forcing file contents and directory entries to stable storage
//!
//! `durable_sync` maps to the strongest data flush each platform offers.
//! `sync_directory` makes a rename or a newly created file survive power
//! loss on platforms where directory entries are cached separately.

use std::fs::File;
use std::io;
use std::path::Path;

/// Block until the data written to `file` is on stable storage.
///
/// - Linux: `fdatasync()`
/// - macOS/iOS: `fcntl(F_FULLFSYNC)`; plain fsync stops at the drive cache
/// - Windows: `FlushFileBuffers()`
/// - Other: `File::sync_data()`
///
/// May block for a long time under heavy I/O; do not call while holding
/// a lock that readers need.
pub fn durable_sync(file: &File) -> io::Result<()> {
    platform_sync(file)
}

#[cfg(any(target_os = "linux", target_os = "macos", target_os = "ios"))]
fn os_result(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn platform_sync(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    os_result(unsafe { libc::fdatasync(file.as_raw_fd()) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn platform_sync(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    os_result(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) })
}

#[cfg(windows)]
fn platform_sync(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    // SAFETY: the handle belongs to `file`, which outlives the call.
    let flushed = unsafe { winapi::um::fileapi::FlushFileBuffers(file.as_raw_handle() as *mut _) };
    if flushed == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios", windows)))]
fn platform_sync(file: &File) -> io::Result<()> {
    file.sync_data()
}

/// Persist the directory entry list of `dir` (renames, creations, unlinks).
///
/// Windows cannot open a directory as a file and does not need this; the
/// call is a no-op there.
pub fn sync_directory(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir)?;
        handle.sync_all()
    }

    #[cfg(not(unix))]
    {
        let _ = dir;
        Ok(())
    }
}
