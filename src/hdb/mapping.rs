//! Byte-window abstraction over a file: a growable mmap covering the
//! header/bucket region (and optionally further, per `xmsiz`), with a
//! ghost file length grown in 32 KiB steps ahead of writes that land
//! past the mapped span but still need mmap-speed access.

use crate::error::Result;
use crate::osio;
use memmap2::MmapMut;
use parking_lot::Mutex;
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

const GHOST_STEP: u64 = 32 * 1024;

pub struct Mapping {
	file: File,
	map: Mutex<Option<MmapMut>>,
	map_len: AtomicU64,
	xmsiz: u64,
	writable: bool,
}

impl Mapping {
	pub fn new(file: File, initial_len: u64, xmsiz: u64, writable: bool) -> Result<Mapping> {
		let mapping = Mapping { file, map: Mutex::new(None), map_len: AtomicU64::new(0), xmsiz, writable };
		mapping.remap(initial_len.max(1))?;
		Ok(mapping)
	}

	pub fn file(&self) -> &File {
		&self.file
	}

	fn remap(&self, want_len: u64) -> Result<()> {
		let capped = want_len.min(self.xmsiz.max(want_len));
		let mut guard = self.map.lock();
		let file_len = self.file.metadata()?.len();
		let map_len = capped.min(file_len.max(1));
		if map_len == 0 {
			*guard = None;
			self.map_len.store(0, Ordering::Relaxed);
			return Ok(());
		}
		let map = unsafe { MmapMut::map_mut(&self.file)? };
		self.map_len.store(map.len() as u64, Ordering::Relaxed);
		*guard = Some(map);
		Ok(())
	}

	pub fn mapped_len(&self) -> u64 {
		self.map_len.load(Ordering::Relaxed)
	}

	/// Grows the backing file's ghost length in `GHOST_STEP` increments
	/// so that writes beyond the current real length land on allocated
	/// storage before the mapping is extended to cover them.
	pub fn ensure_len(&self, want_len: u64) -> Result<()> {
		let file_len = self.file.metadata()?.len();
		if want_len > file_len {
			let steps = (want_len - file_len + GHOST_STEP - 1) / GHOST_STEP;
			let new_len = file_len + steps * GHOST_STEP;
			self.file.set_len(new_len)?;
		}
		if want_len > self.mapped_len() {
			self.remap(want_len)?;
		}
		Ok(())
	}

	pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
		let end = offset + buf.len() as u64;
		if end <= self.mapped_len() {
			let guard = self.map.lock();
			if let Some(map) = guard.as_ref() {
				buf.copy_from_slice(&map[offset as usize..end as usize]);
				return Ok(());
			}
		}
		osio::pread(&self.file, buf, offset)
	}

	pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
		debug_assert!(self.writable);
		let end = offset + buf.len() as u64;
		self.ensure_len(end)?;
		if end <= self.mapped_len() {
			let mut guard = self.map.lock();
			if let Some(map) = guard.as_mut() {
				map[offset as usize..end as usize].copy_from_slice(buf);
				return Ok(());
			}
		}
		osio::pwrite(&self.file, buf, offset)
	}

	pub fn flush(&self) -> Result<()> {
		let guard = self.map.lock();
		if let Some(map) = guard.as_ref() {
			map.flush()?;
		}
		self.file.sync_data()?;
		Ok(())
	}

	pub fn truncate(&self, len: u64) -> Result<()> {
		self.file.set_len(len)?;
		self.remap(len.max(1))
	}
}
