//! Device-node helpers used to expose an attached disk under a stable path.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc::dev_t;
use nix::sys::stat::{Mode, SFlag, mknod, stat};
use tokio::sync::oneshot;
use tracing::{debug, error, info, instrument, warn};

use super::error::DevNodeError;
use super::metrics::OperationTimer;

/// How long `remove_device` waits before giving up on a removal
pub const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Split a device number into (major, minor) using the legacy 8-bit minor layout.
pub fn split_dev(rdev: u64) -> (u64, u64) {
    (rdev / 256, rdev % 256)
}

/// Encode (major, minor) as a kernel device number.
pub fn encode_dev(major: u64, minor: u64) -> u64 {
    (major << 8) | (minor & 0xff) | ((minor & 0xfff00) << 12)
}

/// Create a block device node at `dest` with the same major/minor as `src`.
///
/// The node is created with mode 0600. Fails if `src` cannot be stat'ed or
/// `dest` cannot be created, e.g. because it already exists.
#[instrument]
pub fn duplicate_device(src: &Path, dest: &Path) -> Result<(), DevNodeError> {
    let timer = OperationTimer::new("duplicate_device");
    timer.finish(duplicate(src, dest))
}

fn duplicate(src: &Path, dest: &Path) -> Result<(), DevNodeError> {
    let st = stat(src).map_err(|e| match e {
        Errno::ENOENT => DevNodeError::NotFound(src.to_path_buf()),
        source => DevNodeError::Stat {
            path: src.to_path_buf(),
            source,
        },
    })?;

    let (major, minor) = split_dev(u64::from(st.st_rdev));
    info!(device = %dest.display(), major, minor, "Creating device");

    mknod(
        dest,
        SFlag::S_IFBLK,
        Mode::S_IRUSR | Mode::S_IWUSR,
        encode_dev(major, minor) as dev_t,
    )
    .map_err(|source| DevNodeError::Create {
        path: dest.to_path_buf(),
        source,
    })
}

/// Remove `path`, waiting at most `REMOVE_TIMEOUT`.
///
/// A missing path is not an error.
pub async fn remove_device(path: impl AsRef<Path>) -> Result<(), DevNodeError> {
    let timer = OperationTimer::new("remove_device");
    let result = remove_with_timeout(path.as_ref(), REMOVE_TIMEOUT, |p| std::fs::remove_file(p)).await;
    timer.finish(result)
}

/// Remove `path` with `remover` on a detached thread, waiting at most `deadline`.
///
/// On timeout the removal is left running in the background; it is not
/// cancelled, does not keep the runtime from shutting down, and its eventual
/// outcome is only logged.
#[instrument(skip(remover))]
pub async fn remove_with_timeout<F>(
    path: &Path,
    deadline: Duration,
    remover: F,
) -> Result<(), DevNodeError>
where
    F: FnOnce(&Path) -> io::Result<()> + Send + 'static,
{
    match tokio::fs::symlink_metadata(path).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("Nothing to remove");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    // A plain thread rather than spawn_blocking: the runtime waits for its
    // blocking pool on shutdown, which would hold process exit on a stuck unlink.
    let owned: PathBuf = path.to_path_buf();
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("remove-device".to_string())
        .spawn(move || {
            let result = match remover(&owned) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    error!(path = %owned.display(), error = %e, "Unable to remove");
                    Err(e)
                }
                Ok(()) => Ok(()),
            };
            // The receiver is gone once the caller timed out
            let _ = tx.send(result);
        })?;

    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(result)) => result.map_err(|source| DevNodeError::Remove {
            path: path.to_path_buf(),
            source,
        }),
        Ok(Err(_)) => Err(DevNodeError::WorkerLost(path.to_path_buf())),
        Err(_) => {
            warn!(timeout = ?deadline, "Removal still in flight, giving up waiting");
            Err(DevNodeError::Timeout(path.to_path_buf()))
        }
    }
}
