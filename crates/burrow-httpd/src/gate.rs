//! Two-level resource locking.
//!
//! A per-resource `flock` can only be taken once a descriptor exists, so the
//! sequence "check existence, open or create, lock" is not atomic on its own.
//! Every such sequence therefore runs while holding an exclusive `flock` on a
//! single marker file (the gate). The gate is dropped as soon as the resource
//! lock is held, so unrelated resources only contend for the duration of an
//! `open` plus a `flock`.
//!
//! The resource lock is first attempted without blocking while the gate is
//! held. When it is contended, the gate is dropped before waiting on the same
//! descriptor, so a request queued behind a slow peer never stalls opens of
//! other names.
//!
//! `flock` locks belong to the open file description, which is why the marker
//! is reopened for every critical section: two descriptors opened by two
//! threads of this process exclude each other exactly like two processes do.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::{debug, info};

use crate::error::{HttpdError, Result};

/// Name of the zero-length marker created in the serve root.
pub const GATE_FILE_NAME: &str = ".burrow-gate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Open an existing resource read-only under a shared lock.
    Read,
    /// Open or create a resource write-only under an exclusive lock.
    Write,
}

impl AccessMode {
    fn lock_arg(self) -> FlockArg {
        match self {
            AccessMode::Read => FlockArg::LockShared,
            AccessMode::Write => FlockArg::LockExclusive,
        }
    }

    fn try_lock_arg(self) -> FlockArg {
        match self {
            AccessMode::Read => FlockArg::LockSharedNonblock,
            AccessMode::Write => FlockArg::LockExclusiveNonblock,
        }
    }
}

/// Result of a gated open.
pub enum Opened {
    /// The resource is open and locked in the requested mode.
    Locked(LockedResource),
    /// The open or create call failed; nothing is held.
    Refused(io::Error),
}

/// An open resource descriptor holding its `flock`.
///
/// Dropping it unlocks and closes the descriptor.
pub struct LockedResource {
    file: Flock<File>,
    existed: bool,
}

impl fmt::Debug for LockedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedResource")
            .field("existed", &self.existed)
            .finish_non_exhaustive()
    }
}

impl LockedResource {
    /// Whether the resource existed before this open.
    ///
    /// Always `true` for reads.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Current size of the resource in bytes.
    pub fn size(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn file(&self) -> &File {
        &self.file
    }
}

/// The global serialization point for open-then-lock sequences.
#[derive(Debug)]
pub struct LockGate {
    path: PathBuf,
}

impl LockGate {
    /// Create (or truncate) the marker file in `root` and return the gate.
    pub fn create(root: &Path) -> Result<Self> {
        let path = root.join(GATE_FILE_NAME);
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;

        info!("Lock gate marker at {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open `path` in `mode` and lock it, atomically with respect to every
    /// other call on this gate.
    ///
    /// Access failures of the open itself come back as [`Opened::Refused`].
    /// An `Err` means a lock call failed, which is not recoverable.
    pub fn open_locked(&self, path: &Path, mode: AccessMode) -> Result<Opened> {
        // Taking a second flock on the marker while holding the gate would
        // never return.
        if path == self.path {
            return Ok(Opened::Refused(Errno::EACCES.into()));
        }

        let gate = self.enter()?;

        let existed = match mode {
            AccessMode::Read => true,
            AccessMode::Write => path.exists(),
        };

        let opened = match mode {
            AccessMode::Read => File::open(path).and_then(refuse_directory),
            AccessMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .mode(0o600)
                .open(path),
        };

        let file = match opened {
            Ok(file) => file,
            Err(e) => {
                drop(gate);
                debug!("Gated open of {} refused: {}", path.display(), e);
                return Ok(Opened::Refused(e));
            }
        };

        let file = match try_lock(file, mode.try_lock_arg(), path)? {
            Ok(locked) => {
                drop(gate);
                locked
            }
            Err(contended) => {
                drop(gate);
                debug!("{} is busy, waiting outside the gate", path.display());
                lock_retrying(contended, mode.lock_arg(), path)?
            }
        };

        debug!("Locked {} for {:?}", path.display(), mode);
        Ok(Opened::Locked(LockedResource { file, existed }))
    }

    fn enter(&self) -> Result<Flock<File>> {
        let marker = OpenOptions::new().write(true).open(&self.path)?;
        lock_retrying(marker, FlockArg::LockExclusive, &self.path)
    }
}

fn refuse_directory(file: File) -> io::Result<File> {
    if file.metadata()?.is_dir() {
        return Err(Errno::EISDIR.into());
    }
    Ok(file)
}

/// Non-blocking attempt; a contended lock hands the descriptor back.
fn try_lock(
    mut file: File,
    arg: FlockArg,
    path: &Path,
) -> Result<std::result::Result<Flock<File>, File>> {
    loop {
        match Flock::lock(file, arg) {
            Ok(locked) => return Ok(Ok(locked)),
            Err((returned, Errno::EWOULDBLOCK)) => return Ok(Err(returned)),
            Err((returned, Errno::EINTR)) => file = returned,
            Err((_, source)) => {
                return Err(HttpdError::Lock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

fn lock_retrying(mut file: File, arg: FlockArg, path: &Path) -> Result<Flock<File>> {
    loop {
        match Flock::lock(file, arg) {
            Ok(locked) => return Ok(locked),
            Err((returned, Errno::EINTR)) => file = returned,
            Err((_, source)) => {
                return Err(HttpdError::Lock {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn locked(opened: Opened) -> std::result::Result<LockedResource, Box<dyn std::error::Error>> {
        match opened {
            Opened::Locked(resource) => Ok(resource),
            Opened::Refused(e) => Err(format!("expected a locked resource, got {e}").into()),
        }
    }

    fn refused(opened: Opened) -> std::result::Result<io::Error, Box<dyn std::error::Error>> {
        match opened {
            Opened::Refused(e) => Ok(e),
            Opened::Locked(_) => Err("expected the open to be refused".into()),
        }
    }

    fn try_shared_from_new_descriptor(path: &Path) -> std::io::Result<bool> {
        let file = File::open(path)?;
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(_) => Ok(true),
            Err((_, Errno::EWOULDBLOCK)) => Ok(false),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    #[test]
    fn creates_empty_marker() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        std::fs::write(root.path().join(GATE_FILE_NAME), b"stale")?;

        let gate = LockGate::create(root.path())?;
        assert_eq!(std::fs::metadata(gate.path())?.len(), 0);
        Ok(())
    }

    #[test]
    fn write_reports_prior_existence() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;
        let target = root.path().join("a");

        let first = locked(gate.open_locked(&target, AccessMode::Write)?)?;
        assert!(!first.existed());
        drop(first);

        let second = locked(gate.open_locked(&target, AccessMode::Write)?)?;
        assert!(second.existed());
        Ok(())
    }

    #[test]
    fn read_refuses_missing_and_directories() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;

        let missing = refused(gate.open_locked(&root.path().join("nope"), AccessMode::Read)?)?;
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);

        std::fs::create_dir(root.path().join("dir"))?;
        let dir = refused(gate.open_locked(&root.path().join("dir"), AccessMode::Read)?)?;
        assert_eq!(dir.raw_os_error(), Some(Errno::EISDIR as i32));
        Ok(())
    }

    #[test]
    fn write_refuses_missing_parent() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;

        let target = root.path().join("missing").join("leaf");
        let err = refused(gate.open_locked(&target, AccessMode::Write)?)?;
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!target.exists());
        Ok(())
    }

    #[test]
    fn refuses_the_marker_itself() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;
        let marker = gate.path().to_path_buf();

        let err = refused(gate.open_locked(&marker, AccessMode::Read)?)?;
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        let err = refused(gate.open_locked(&marker, AccessMode::Write)?)?;
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        Ok(())
    }

    #[test]
    fn writer_excludes_readers_until_dropped()
    -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;
        let target = root.path().join("w");

        let writer = locked(gate.open_locked(&target, AccessMode::Write)?)?;
        assert!(!try_shared_from_new_descriptor(&target)?);
        drop(writer);
        assert!(try_shared_from_new_descriptor(&target)?);
        Ok(())
    }

    #[test]
    fn readers_share_the_lock() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;
        let target = root.path().join("r");
        std::fs::write(&target, b"shared")?;

        let first = locked(gate.open_locked(&target, AccessMode::Read)?)?;
        let second = locked(gate.open_locked(&target, AccessMode::Read)?)?;
        assert_eq!(first.size()?, 6);
        assert_eq!(second.size()?, 6);
        assert!(try_shared_from_new_descriptor(&target)?);
        Ok(())
    }

    #[test]
    fn gate_is_released_after_open() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let root = tempfile::tempdir()?;
        let gate = LockGate::create(root.path())?;
        let target = root.path().join("held");

        let _held = locked(gate.open_locked(&target, AccessMode::Write)?)?;
        let marker = OpenOptions::new().write(true).open(gate.path())?;
        assert!(Flock::lock(marker, FlockArg::LockExclusiveNonblock).is_ok());
        Ok(())
    }

    #[test]
    fn contended_waiter_releases_the_gate() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let root = tempfile::tempdir()?;
        let gate = Arc::new(LockGate::create(root.path())?);
        let target = root.path().join("busy");
        std::fs::write(&target, b"contents")?;

        let held = Flock::lock(File::open(&target)?, FlockArg::LockExclusive)
            .map_err(|(_, errno)| errno)?;

        let (tx, rx) = std::sync::mpsc::channel();
        let waiter = {
            let gate = Arc::clone(&gate);
            let target = target.clone();
            thread::spawn(move || {
                let size = match gate.open_locked(&target, AccessMode::Read) {
                    Ok(Opened::Locked(resource)) => resource.size().ok(),
                    _ => None,
                };
                let _ = tx.send(size);
            })
        };

        // The reader is parked on the resource lock; the gate must be free and
        // other names must still open.
        thread::sleep(std::time::Duration::from_millis(100));
        assert!(rx.try_recv().is_err(), "read went through an exclusive lock");
        let marker = OpenOptions::new().write(true).open(gate.path())?;
        assert!(Flock::lock(marker, FlockArg::LockExclusiveNonblock).is_ok());
        let other = locked(gate.open_locked(&root.path().join("other"), AccessMode::Write)?)?;
        assert!(!other.existed());

        drop(held);
        let size = rx.recv_timeout(std::time::Duration::from_secs(5))?;
        assert_eq!(size, Some(8));
        waiter.join().map_err(|_| "waiter panicked")?;
        Ok(())
    }

    #[test]
    fn racing_first_writes_see_one_creation() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        const WRITERS: usize = 8;

        let root = tempfile::tempdir()?;
        let gate = Arc::new(LockGate::create(root.path())?);
        let target = Arc::new(root.path().join("contended"));
        let barrier = Arc::new(Barrier::new(WRITERS));

        let handles: Vec<_> = (0..WRITERS)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let target = Arc::clone(&target);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    match gate.open_locked(&target, AccessMode::Write) {
                        Ok(Opened::Locked(resource)) => Some(resource.existed()),
                        _ => None,
                    }
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            match handle.join().map_err(|_| "writer panicked")? {
                Some(false) => created += 1,
                Some(true) => {}
                None => return Err("gated write open failed".into()),
            }
        }
        assert_eq!(created, 1);
        Ok(())
    }
}
