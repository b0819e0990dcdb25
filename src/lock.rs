use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;

use tempfile::Builder;
use thiserror::Error;
use tracing::{info, warn};

pub const LOCK_FILE_NAME: &str = "andso.lock";

#[derive(Debug, Error)]
pub enum LockError {
	#[error(
		"the companion is running as pid {pid} ({}); send edits through its stdin or stop it first",
		path.display()
	)]
	Held { pid: u32, path: PathBuf },
	#[error("lock file {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

/// Marks the data directory as owned by a running companion. The file holds
/// the owner's pid and is removed on drop.
#[derive(Debug)]
pub struct RunLock {
	path: PathBuf,
}

impl RunLock {
	pub fn acquire(dir: &Path) -> Result<Self, LockError> {
		fs::create_dir_all(dir).map_err(io_error(dir))?;
		let path = dir.join(LOCK_FILE_NAME);

		// A second attempt only happens after a stale lock was cleared.
		for _ in 0..2 {
			let mut temp = Builder::new()
				.prefix(".andso-lock-")
				.tempfile_in(dir)
				.map_err(io_error(dir))?;
			writeln!(temp, "{}", process::id()).map_err(io_error(temp.path()))?;

			match temp.persist_noclobber(&path) {
				Ok(_) => {
					info!(path = %path.display(), "data directory locked");
					return Ok(Self { path });
				}
				Err(err) if err.error.kind() == ErrorKind::AlreadyExists => ensure_unlocked(dir)?,
				Err(err) => {
					return Err(LockError::Io {
						path,
						source: err.error,
					});
				}
			}
		}

		Err(LockError::Io {
			path,
			source: io::Error::new(ErrorKind::AlreadyExists, "lock file keeps reappearing"),
		})
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

impl Drop for RunLock {
	fn drop(&mut self) {
		match fs::remove_file(&self.path) {
			Ok(()) => {}
			Err(err) if err.kind() == ErrorKind::NotFound => {}
			Err(err) => warn!(path = %self.path.display(), error = %err, "failed to remove lock file"),
		}
	}
}

/// Fails while a live process holds the lock on `dir`. A lock left behind by
/// a crashed process is removed.
pub fn ensure_unlocked(dir: &Path) -> Result<(), LockError> {
	let path = dir.join(LOCK_FILE_NAME);
	let raw = match fs::read_to_string(&path) {
		Ok(raw) => raw,
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
		Err(source) => return Err(LockError::Io { path, source }),
	};

	if let Ok(pid) = raw.trim().parse::<u32>() {
		if is_pid_alive(pid) {
			return Err(LockError::Held { pid, path });
		}
	}

	warn!(path = %path.display(), "removing stale lock file");
	match fs::remove_file(&path) {
		Ok(()) => Ok(()),
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
		Err(source) => Err(LockError::Io { path, source }),
	}
}

#[cfg(unix)]
fn is_pid_alive(pid: u32) -> bool {
	let Ok(pid) = libc::pid_t::try_from(pid) else {
		return false;
	};
	if pid <= 0 {
		return false;
	}
	// Signal 0 only checks for existence. EPERM means someone else's live process.
	let result = unsafe { libc::kill(pid, 0) };
	result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_pid_alive(_pid: u32) -> bool {
	true
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LockError + '_ {
	move |source| LockError::Io {
		path: path.to_path_buf(),
		source,
	}
}

#[cfg(test)]
mod tests {
	use std::fs;
	use std::process;

	use tempfile::TempDir;

	use super::{LOCK_FILE_NAME, LockError, RunLock, ensure_unlocked};

	#[test]
	fn running_companion_blocks_other_writers() {
		let dir = TempDir::new().expect("temp dir");
		let data = dir.path().join("andso");

		let lock = RunLock::acquire(&data).expect("first lock");
		assert_eq!(
			fs::read_to_string(lock.path()).expect("lock contents").trim(),
			process::id().to_string()
		);

		match ensure_unlocked(&data) {
			Err(LockError::Held { pid, .. }) => assert_eq!(pid, process::id()),
			other => panic!("expected a held lock, got {other:?}"),
		}
		assert!(matches!(RunLock::acquire(&data), Err(LockError::Held { .. })));

		drop(lock);
		assert!(!data.join(LOCK_FILE_NAME).exists());
		ensure_unlocked(&data).expect("free after drop");
	}

	#[test]
	fn missing_directory_is_unlocked() {
		let dir = TempDir::new().expect("temp dir");
		ensure_unlocked(&dir.path().join("nowhere")).expect("no lock");
	}

	#[cfg(unix)]
	#[test]
	fn stale_locks_are_cleared() {
		let dir = TempDir::new().expect("temp dir");
		fs::write(dir.path().join(LOCK_FILE_NAME), "0\n").expect("write");
		ensure_unlocked(dir.path()).expect("stale lock removed");
		assert!(!dir.path().join(LOCK_FILE_NAME).exists());

		fs::write(dir.path().join(LOCK_FILE_NAME), "garbage").expect("write");
		let lock = RunLock::acquire(dir.path()).expect("lock over garbage");
		assert!(lock.path().is_file());
	}
}
