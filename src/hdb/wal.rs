//! Write-ahead log for transaction abort and crash recovery (spec
//! §4.D.7). Entries are `(offset BE u64, size BE u64, old-bytes…)`; the
//! first 8 bytes of the file are a truncation anchor recording `fsiz`
//! at `tranbegin`.

use crate::error::{Error, Result};
use crate::osio;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub struct Wal {
	path: PathBuf,
	file: Mutex<Option<File>>,
}

#[derive(Debug, Clone)]
pub struct WalEntry {
	pub offset: u64,
	pub old_bytes: Vec<u8>,
}

impl Wal {
	pub fn for_db_path(db_path: &Path) -> Wal {
		let mut path = db_path.as_os_str().to_owned();
		path.push(".wal");
		Wal { path: PathBuf::from(path), file: Mutex::new(None) }
	}

	pub fn exists(&self) -> bool {
		self.path.exists()
	}

	fn open_or_create(&self) -> Result<File> {
		Ok(OpenOptions::new().create(true).read(true).write(true).open(&self.path)?)
	}

	/// Opens (creating if absent) and writes the anchor + header
	/// snapshot, starting a fresh transaction log.
	pub fn begin(&self, anchor_fsiz: u64, header_bytes: &[u8]) -> Result<()> {
		let file = self.open_or_create()?;
		file.set_len(0)?;
		osio::pwrite(&file, &anchor_fsiz.to_be_bytes(), 0)?;
		*self.file.lock() = Some(file);
		self.append_locked(0, header_bytes)
	}

	fn append_locked(&self, offset: u64, old_bytes: &[u8]) -> Result<()> {
		let guard = self.file.lock();
		let file = guard.as_ref().ok_or_else(|| Error::Invalid("wal not open".into()))?;
		let cur_len = file.metadata()?.len();
		let mut buf = Vec::with_capacity(16 + old_bytes.len());
        buf.extend_from_slice(&offset.to_be_bytes());
        buf.extend_from_slice(&(old_bytes.len() as u64).to_be_bytes());
        buf.extend_from_slice(old_bytes);
		osio::pwrite(file, &buf, cur_len)?;
		Ok(())
	}

	/// Appends a pre-image entry for a mutation about to happen at
	/// `offset`. Must be called under the caller's WAL mutex per spec
	/// §4.D.9 (the `Mutex` here is that dedicated lock).
	pub fn log_mutation(&self, offset: u64, old_bytes: &[u8]) -> Result<()> {
		self.append_locked(offset, old_bytes)
	}

	pub fn anchor(&self) -> Result<u64> {
		let guard = self.file.lock();
		let file = guard.as_ref().ok_or_else(|| Error::Invalid("wal not open".into()))?;
		let mut buf = [0u8; 8];
		osio::pread(file, &mut buf, 0)?;
		Ok(u64::from_be_bytes(buf))
	}

	/// Reads every logged entry (including the header snapshot) in
	/// forward order.
	pub fn read_all(&self) -> Result<Vec<WalEntry>> {
		let guard = self.file.lock();
		let file = guard.as_ref().ok_or_else(|| Error::Invalid("wal not open".into()))?;
		let len = file.metadata()?.len();
		let mut pos = 8u64;
		let mut entries = Vec::new();
		while pos + 16 <= len {
			let mut hdr = [0u8; 16];
			osio::pread(file, &mut hdr, pos)?;
			let offset = u64::from_be_bytes(hdr[0..8].try_into().unwrap());
			let size = u64::from_be_bytes(hdr[8..16].try_into().unwrap());
			pos += 16;
			if pos + size > len {
				break;
			}
			let mut data = vec![0u8; size as usize];
			osio::pread(file, &mut data, pos)?;
			pos += size;
			entries.push(WalEntry { offset, old_bytes: data });
		}
		Ok(entries)
	}

	/// Commits: the log is no longer needed.
	pub fn clear(&self) -> Result<()> {
		let mut guard = self.file.lock();
		if let Some(file) = guard.as_ref() {
			file.set_len(0)?;
		}
		*guard = None;
		Ok(())
	}

	pub fn remove_file(&self) -> Result<()> {
		if self.path.exists() {
			std::fs::remove_file(&self.path)?;
		}
		Ok(())
	}

	/// Opens an existing WAL for replay without starting a new
	/// transaction (spec §4.D.1 step 5, §4.D.7 last paragraph).
	pub fn open_for_replay(&self) -> Result<()> {
		let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
		*self.file.lock() = Some(file);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn logs_and_replays_entries_in_order() {
		let dir = std::env::temp_dir().join("hashkv-test-wal");
		std::fs::create_dir_all(&dir).unwrap();
		let db_path = dir.join("db.hdb");
		let wal = Wal::for_db_path(&db_path);
		wal.remove_file().ok();
		wal.begin(1000, &[0xAAu8; 8]).unwrap();
		wal.log_mutation(500, b"old1").unwrap();
		wal.log_mutation(600, b"old2").unwrap();
		let entries = wal.read_all().unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[0].offset, 0);
		assert_eq!(entries[1].old_bytes, b"old1");
		assert_eq!(entries[2].old_bytes, b"old2");
		assert_eq!(wal.anchor().unwrap(), 1000);
		wal.clear().unwrap();
		wal.remove_file().ok();
		std::fs::remove_dir_all(&dir).ok();
	}
}
