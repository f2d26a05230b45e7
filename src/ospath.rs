//! Path canonicalization, the process-wide open-path registry guarding
//! against double-opening the same database file, and atomic rename —
//! the "global mutable state" the design notes ask to be modeled as an
//! explicit service object rather than ambient statics.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn registry() -> &'static Mutex<HashSet<PathBuf>> {
	static REGISTRY: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
	REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// RAII guard releasing the path from the process-wide registry when
/// the owning `hdb::Hdb` handle is closed or dropped.
pub struct PathGuard {
	path: PathBuf,
}

impl Drop for PathGuard {
	fn drop(&mut self) {
		registry().lock().remove(&self.path);
	}
}

pub fn canonicalize_best_effort(path: &Path) -> PathBuf {
	path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Claims `path` for the lifetime of the returned guard; fails if
/// another handle in this process already holds it (spec §4.D.1 step 1).
pub fn claim(path: &Path) -> Result<PathGuard> {
	let canon = canonicalize_best_effort(path);
	let mut set = registry().lock();
	if !set.insert(canon.clone()) {
		return Err(Error::Locked(format!("{} already open in this process", canon.display())));
	}
	Ok(PathGuard { path: canon })
}

/// Atomic rename used by `optimize` to swap the rebuilt sibling file
/// into place (spec §4.D.8).
pub fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
	std::fs::rename(from, to).map_err(Error::from)
}

pub fn list_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
	let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
	entries.sort();
	Ok(entries)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn claim_is_exclusive_within_process() {
		let dir = std::env::temp_dir().join("hashkv-test-ospath");
		std::fs::create_dir_all(&dir).unwrap();
		let file = dir.join("db.hdb");
		std::fs::write(&file, b"").unwrap();
		let g1 = claim(&file).unwrap();
		assert!(claim(&file).is_err());
		drop(g1);
		let g2 = claim(&file).unwrap();
		drop(g2);
		std::fs::remove_dir_all(&dir).ok();
	}
}
