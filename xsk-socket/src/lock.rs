//! # BPF Filesystem Resolution and Cross-Process Locking
//!
//! ## Purpose
//!
//! The default redirect program is shared by every cooperating process on
//! a machine; its shared refcount lives in a BPF map and its attachment is
//! pinned on the BPF filesystem. This module resolves the directory those
//! artifacts live in and provides the exclusive advisory lock that
//! serializes refcount mutations across processes.
//!
//! ## How it works
//!
//! The directory named by `LIBXDP_BPFFS` (default `/sys/fs/bpf`) is probed
//! with `statfs`; when it is not a BPF filesystem and
//! `LIBXDP_BPFFS_AUTOMOUNT` is "1", a fresh one is mounted (making the
//! target a private propagation point first, with a bind-and-retry
//! fallback on `EINVAL`). When no BPF filesystem can be established the
//! lock directory falls back to a subdirectory of `/run`. The result is
//! cached process-wide. Locking opens the `xdp` state subdirectory and
//! flocks it.
//!
//! ## Main components
//!
//! - `acquire()`: takes the exclusive cross-process lock.
//! - `LockGuard`: releases the lock on drop.
//! - `pin_path()`: where the default program's link is pinned.

use crate::error::XskError;
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const BPFFS_ENVVAR: &str = "LIBXDP_BPFFS";
const BPFFS_AUTOMOUNT_ENVVAR: &str = "LIBXDP_BPFFS_AUTOMOUNT";
const BPFFS_DEFAULT: &str = "/sys/fs/bpf";
const RUNDIR: &str = "/run";
const STATE_SUBDIR: &str = "xdp";

const BPF_FS_MAGIC: i64 = 0xcafe4a11;

// Resolved once per process; later callers reuse the first resolution.
static BPFFS_CACHE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Creates the `xdp` state subdirectory under `parent` with mode 0700.
/// An already existing directory is not an error.
fn mk_state_subdir(parent: &Path) -> Result<PathBuf, XskError> {
    let dir = parent.join(STATE_SUBDIR);
    match std::fs::DirBuilder::new().mode(0o700).create(&dir) {
        Ok(()) => Ok(dir),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(dir),
        Err(err) => Err(XskError::os("mkdir state subdirectory", err)),
    }
}

fn bpffs_magic_matches(dir: &Path) -> bool {
    let path = match CString::new(dir.as_os_str().as_encoded_bytes()) {
        Ok(path) => path,
        Err(_) => return false,
    };
    let mut fs: libc::statfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statfs(path.as_ptr(), &mut fs) } < 0 {
        return false;
    }
    fs.f_type as i64 == BPF_FS_MAGIC
}

fn mount_bpffs(target: &Path) -> Result<(), XskError> {
    let path = CString::new(target.as_os_str().as_encoded_bytes())
        .map_err(|_| XskError::Invalid("mount target contains NUL"))?;
    let none = CString::new("none").unwrap();
    let bpf = CString::new("bpf").unwrap();
    let mode = CString::new("mode=0700").unwrap();

    let mut bind_done = false;
    loop {
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                path.as_ptr(),
                none.as_ptr(),
                libc::MS_PRIVATE | libc::MS_REC,
                std::ptr::null(),
            )
        };
        if rc == 0 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINVAL) || bind_done {
            return Err(XskError::os("mount --make-private", err));
        }
        // The target is not a mount point yet; bind it onto itself and
        // retry.
        let rc = unsafe {
            libc::mount(
                path.as_ptr(),
                path.as_ptr(),
                none.as_ptr(),
                libc::MS_BIND,
                std::ptr::null(),
            )
        };
        if rc < 0 {
            return Err(XskError::last_os("mount --bind"));
        }
        bind_done = true;
    }

    let rc = unsafe {
        libc::mount(
            bpf.as_ptr(),
            path.as_ptr(),
            bpf.as_ptr(),
            0,
            mode.as_ptr() as *const libc::c_void,
        )
    };
    if rc < 0 {
        return Err(XskError::last_os("mount bpffs"));
    }
    Ok(())
}

/// Locates (and, when allowed, mounts) the BPF filesystem. The first
/// successful resolution is cached for the process lifetime.
fn find_bpffs() -> Result<PathBuf, XskError> {
    let mut cache = BPFFS_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(dir) = cache.as_ref() {
        return Ok(dir.clone());
    }

    let automount = std::env::var(BPFFS_AUTOMOUNT_ENVVAR).as_deref() == Ok("1");
    let dir = PathBuf::from(
        std::env::var(BPFFS_ENVVAR).unwrap_or_else(|_| BPFFS_DEFAULT.to_string()),
    );

    if !bpffs_magic_matches(&dir) {
        if !automount {
            return Err(XskError::NotFound(format!(
                "no bpffs at {}",
                dir.display()
            )));
        }
        mount_bpffs(&dir)?;
    }

    *cache = Some(dir.clone());
    Ok(dir)
}

/// The directory used for cross-process coordination: the `xdp`
/// subdirectory of the BPF filesystem, or of `/run` when no BPF
/// filesystem can be established.
fn lock_dir() -> Result<PathBuf, XskError> {
    match find_bpffs() {
        Ok(parent) => mk_state_subdir(&parent),
        Err(_) => mk_state_subdir(Path::new(RUNDIR)),
    }
}

/// Filesystem location where the link of the default program with id
/// `prog_id` is pinned.
pub(crate) fn pin_path(prog_id: u32) -> Result<PathBuf, XskError> {
    match find_bpffs() {
        Ok(dir) => Ok(dir.join(format!("xsk_def_xdp_prog_{prog_id}"))),
        Err(_) => Ok(mk_state_subdir(Path::new(RUNDIR))?.join(format!("xsk_def_xdp_prog_{prog_id}"))),
    }
}

/// Holds the cross-process exclusive lock; dropping it releases the lock.
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Explicitly releases the lock.
    pub fn release(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } < 0 {
            log::warn!(
                "failed to unlock fd {}: {}",
                self.file.as_raw_fd(),
                io::Error::last_os_error()
            );
        }
    }
}

/// Takes the exclusive advisory lock on the coordination directory,
/// blocking until it is available.
pub fn acquire() -> Result<LockGuard, XskError> {
    let dir = lock_dir()?;
    let file = File::open(&dir).map_err(|err| XskError::os("open lock directory", err))?;
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } < 0 {
        return Err(XskError::last_os("flock LOCK_EX"));
    }
    Ok(LockGuard { file })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_is_not_a_bpffs() {
        assert!(!bpffs_magic_matches(Path::new("/tmp")));
        assert!(!bpffs_magic_matches(Path::new("/path/that/does/not/exist")));
    }

    #[test]
    fn state_subdir_creation_is_idempotent() {
        let base = std::env::temp_dir().join(format!("xsk-lock-test-{}", std::process::id()));
        std::fs::create_dir_all(&base).unwrap();
        let first = mk_state_subdir(&base).unwrap();
        let second = mk_state_subdir(&base).unwrap();
        assert_eq!(first, second);
        assert!(first.is_dir());
        std::fs::remove_dir_all(&base).unwrap();
    }
}
