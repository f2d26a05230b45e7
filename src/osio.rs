//! Component B: OS helpers — positional read/write, advisory file locks
//! and signalled sleep. mmap itself is handled inline in `hdb::mapping`
//! via `memmap2`, already a teacher dependency.

use crate::error::{Error, Result};
use std::fs::File;
use std::time::Duration;

#[cfg(unix)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	file.read_exact_at(buf, offset).map_err(Error::from)
}

#[cfg(unix)]
pub fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::unix::fs::FileExt;
	file.write_all_at(buf, offset).map_err(Error::from)
}

#[cfg(windows)]
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	let mut read = 0;
	while read < buf.len() {
		let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
		if n == 0 {
			return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read")));
		}
		read += n;
	}
	Ok(())
}

#[cfg(windows)]
pub fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<()> {
	use std::os::windows::fs::FileExt;
	let mut written = 0;
	while written < buf.len() {
		let n = file.seek_write(&buf[written..], offset + written as u64)?;
		written += n;
	}
	Ok(())
}

/// Advisory whole-file lock, shared for readers and exclusive for
/// writers, matching spec §4.D.1 step 2.
pub fn lock_file(file: &File, exclusive: bool, blocking: bool) -> Result<()> {
	use fs2::FileExt;
	let result = match (exclusive, blocking) {
		(true, true) => file.lock_exclusive(),
		(true, false) => file.try_lock_exclusive(),
		(false, true) => file.lock_shared(),
		(false, false) => file.try_lock_shared(),
	};
	result.map_err(|e| Error::Locked(e.to_string()))
}

pub fn unlock_file(file: &File) -> Result<()> {
	use fs2::FileExt;
	file.unlock().map_err(Error::from)
}

/// Sleep that can be woken early by a shared cancellation flag, used by
/// the server's watchdog backoff and the replication client's retry
/// delay (spec §4.H watchdog, §4.G reconnect).
pub fn signalled_sleep(duration: Duration, cancel: &std::sync::atomic::AtomicBool) {
	use std::sync::atomic::Ordering;
	let step = Duration::from_millis(20);
	let mut remaining = duration;
	while remaining > Duration::ZERO {
		if cancel.load(Ordering::Relaxed) {
			return;
		}
		let slice = step.min(remaining);
		std::thread::sleep(slice);
		remaining -= slice;
	}
}
