//! Component C: in-memory sharded hash (MDB). Eight independent
//! `XMap`s, each behind its own `parking_lot::RwLock`, chosen by an
//! FNV-style secondary hash of the key — the teacher's per-column RW
//! locking (`Column`/`ValueTable`'s atomics-under-lock style) scaled
//! down to a single flat map instead of value tables plus an index.

use crate::bytes::xmap::{Ordering as MtfOrdering, PutMode as XPutMode};
use crate::bytes::XMap;
use crate::error::{Error, Result};
use crate::mode::{AddOutcome, ProcResult, WriteMode};
use parking_lot::RwLock;

pub const SHARD_COUNT: usize = 8;

fn fnv_shard(key: &[u8]) -> usize {
	let mut hash: u64 = 0xcbf29ce484222325;
	for &b in key {
		hash ^= b as u64;
		hash = hash.wrapping_mul(0x100000001b3);
	}
	(hash % SHARD_COUNT as u64) as usize
}

pub struct Mdb {
	shards: [RwLock<XMap>; SHARD_COUNT],
}

impl Default for Mdb {
	fn default() -> Mdb {
		Mdb::new()
	}
}

impl Mdb {
	pub fn new() -> Mdb {
		Mdb { shards: Default::default() }
	}

	fn shard(&self, key: &[u8]) -> &RwLock<XMap> {
		&self.shards[fnv_shard(key)]
	}

	pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.shard(key).read().get(key).map(|v| v.to_vec())
	}

	pub fn vsiz(&self, key: &[u8]) -> Option<usize> {
		self.shard(key).read().get(key).map(|v| v.len())
	}

	pub fn out(&self, key: &[u8]) -> bool {
		self.shard(key).write().remove(key).is_some()
	}

	pub fn put(&self, key: &[u8], value: &[u8], mode: WriteMode<'_>) -> Result<Option<Vec<u8>>> {
		let mut shard = self.shard(key).write();
		match mode {
			WriteMode::Over => {
				shard.put(key, value);
				Ok(Some(value.to_vec()))
			}
			WriteMode::Keep => {
				if shard.contains(key) {
					return Err(Error::Keep);
				}
				shard.put(key, value);
				Ok(Some(value.to_vec()))
			}
			WriteMode::Cat => {
				let mut merged = shard.get(key).map(|v| v.to_vec()).unwrap_or_default();
				merged.extend_from_slice(value);
				shard.put(key, &merged);
				Ok(Some(merged))
			}
			WriteMode::Proc(f) => {
				let result = shard.put_proc(key, None, |old| match f(old) {
					ProcResult::Set(v) => XPutMode::Set(v),
					ProcResult::Delete => XPutMode::Delete,
					ProcResult::Keep => XPutMode::Keep,
				});
				Ok(result)
			}
			WriteMode::AddInt(_) | WriteMode::AddDouble(_) => {
				unreachable!("use add_int/add_double for numeric accumulation")
			}
		}
	}

	/// `put3`: semi-volatilize — overwrite moves the entry to the tail
	/// of insertion order (an LRU-touch on write).
	pub fn put_touch(&self, key: &[u8], value: &[u8]) {
		self.shard(key).write().put_touch(key, value);
	}

	pub fn add_int(&self, key: &[u8], delta: i64) -> AddOutcome<i64> {
		let mut shard = self.shard(key).write();
		match shard.get(key) {
			None => {
				shard.put(key, &delta.to_ne_bytes());
				AddOutcome::Value(delta)
			}
			Some(cur) if cur.len() == 8 => {
				let prev = i64::from_ne_bytes(cur.try_into().unwrap());
				let next = prev.wrapping_add(delta);
				shard.put(key, &next.to_ne_bytes());
				AddOutcome::Value(next)
			}
			Some(_) => AddOutcome::Mismatch,
		}
	}

	pub fn add_double(&self, key: &[u8], delta: f64) -> AddOutcome<f64> {
		let mut shard = self.shard(key).write();
		match shard.get(key) {
			None => {
				shard.put(key, &delta.to_ne_bytes());
				AddOutcome::Value(delta)
			}
			Some(cur) if cur.len() == 8 => {
				let prev = f64::from_ne_bytes(cur.try_into().unwrap());
				let next = prev + delta;
				shard.put(key, &next.to_ne_bytes());
				AddOutcome::Value(next)
			}
			Some(_) => AddOutcome::Mismatch,
		}
	}

	pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Vec<Vec<u8>> {
		let mut out = Vec::new();
		for shard in &self.shards {
			let s = shard.read();
			for key in s.keys_with_prefix(prefix) {
				out.push(key);
				if max.map_or(false, |m| out.len() >= m) {
					return out;
				}
			}
		}
		out
	}

	pub fn vanish(&self) {
		for shard in &self.shards {
			shard.write().clear();
		}
	}

	pub fn rnum(&self) -> usize {
		self.shards.iter().map(|s| s.read().len()).sum()
	}

	/// Approximate total key+value byte size across all shards, used by
	/// ADB's `capsiz` eviction policy.
	pub fn msiz(&self) -> usize {
		self.shards
			.iter()
			.map(|s| s.read().iter().map(|(k, v)| k.len() + v.len()).sum::<usize>())
			.sum()
	}

	/// Approximate global LRU eviction: removes `n/shards + 1` from
	/// each shard's front (spec §4.C `cutfront`).
	pub fn cut_front(&self, n: usize) -> usize {
		let per_shard = n / SHARD_COUNT + 1;
		let mut total = 0;
		for shard in &self.shards {
			total += shard.write().cut_front(per_shard);
		}
		total
	}

	pub fn move_key(&self, key: &[u8], to_front: bool) -> bool {
		let dir = if to_front { MtfOrdering::ToFront } else { MtfOrdering::ToBack };
		self.shard(key).write().move_to(key, dir)
	}

	/// Reads every shard under a read lock taken in ascending shard
	/// order, invoking `cb(key, value) -> bool` (false stops the scan).
	/// Any failure to acquire a lock releases the locks already taken
	/// and returns without invoking further callbacks.
	pub fn foreach<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut cb: F) {
		let mut guards = Vec::with_capacity(SHARD_COUNT);
		for shard in &self.shards {
			guards.push(shard.read());
		}
		'outer: for guard in &guards {
			for (k, v) in guard.iter() {
				if !cb(k, v) {
					break 'outer;
				}
			}
		}
	}

	/// Iterator starting approximately at `key`: the owning shard seeks
	/// to `key`'s position, every other shard starts at its head. Shard
	/// traversal order between shards is unspecified, matching spec
	/// §4.C `iterinit(atKey)`.
	pub fn iter_from(&self, key: Option<&[u8]>) -> MdbIter<'_> {
		let start_shard = key.map(fnv_shard);
		MdbIter { mdb: self, shard_idx: 0, start_shard, start_key: key.map(|k| k.to_vec()), buffer: Vec::new(), buf_pos: 0 }
	}
}

pub struct MdbIter<'a> {
	mdb: &'a Mdb,
	shard_idx: usize,
	start_shard: Option<usize>,
	start_key: Option<Vec<u8>>,
	buffer: Vec<(Vec<u8>, Vec<u8>)>,
	buf_pos: usize,
}

impl<'a> Iterator for MdbIter<'a> {
	type Item = (Vec<u8>, Vec<u8>);

	fn next(&mut self) -> Option<Self::Item> {
		loop {
			if self.buf_pos < self.buffer.len() {
				let item = self.buffer[self.buf_pos].clone();
				self.buf_pos += 1;
				return Some(item);
			}
			if self.shard_idx >= SHARD_COUNT {
				return None;
			}
			let shard = self.mdb.shards[self.shard_idx].read();
			let mut items: Vec<(Vec<u8>, Vec<u8>)> = shard.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
			if self.start_shard == Some(self.shard_idx) {
				if let Some(ref key) = self.start_key {
					if let Some(pos) = items.iter().position(|(k, _)| k == key) {
						items = items.split_off(pos);
					}
				}
			}
			self.buffer = items;
			self.buf_pos = 0;
			self.shard_idx += 1;
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn put_get_out_roundtrip() {
		let db = Mdb::new();
		db.put(b"a", b"1", WriteMode::Over).unwrap();
		assert_eq!(db.get(b"a"), Some(b"1".to_vec()));
		assert!(db.out(b"a"));
		assert_eq!(db.get(b"a"), None);
	}

	#[test]
	fn putkeep_fails_on_existing() {
		let db = Mdb::new();
		db.put(b"a", b"1", WriteMode::Over).unwrap();
		assert!(matches!(db.put(b"a", b"2", WriteMode::Keep), Err(Error::Keep)));
		assert_eq!(db.get(b"a"), Some(b"1".to_vec()));
	}

	#[test]
	fn putcat_appends() {
		let db = Mdb::new();
		db.put(b"x", b"AB", WriteMode::Over).unwrap();
		db.put(b"x", b"CD", WriteMode::Cat).unwrap();
		assert_eq!(db.get(b"x"), Some(b"ABCD".to_vec()));
	}

	#[test]
	fn addint_accumulates_and_detects_mismatch() {
		let db = Mdb::new();
		assert_eq!(db.add_int(b"n", 5), AddOutcome::Value(5));
		assert_eq!(db.add_int(b"n", 7), AddOutcome::Value(12));
		db.put(b"s", b"not-an-int", WriteMode::Over).unwrap();
		assert_eq!(db.add_int(b"s", 1), AddOutcome::Mismatch);
	}

	#[test]
	fn fwmkeys_matches_prefix_only() {
		let db = Mdb::new();
		for k in ["aa", "ab", "ba"] {
			db.put(k.as_bytes(), b"v", WriteMode::Over).unwrap();
		}
		let mut got = db.fwmkeys(b"a", None);
		got.sort();
		assert_eq!(got, vec![b"aa".to_vec(), b"ab".to_vec()]);
	}

	#[test]
	fn cut_front_reduces_count() {
		let db = Mdb::new();
		for i in 0..100u32 {
			db.put(&i.to_le_bytes(), b"v", WriteMode::Over).unwrap();
		}
		let removed = db.cut_front(32);
		assert!(removed > 0);
		assert_eq!(db.rnum(), 100 - removed);
	}

	#[test]
	fn foreach_visits_every_key_once() {
		let db = Mdb::new();
		for i in 0..20u32 {
			db.put(&i.to_le_bytes(), b"v", WriteMode::Over).unwrap();
		}
		let mut seen = std::collections::HashSet::new();
		db.foreach(|k, _| {
			seen.insert(k.to_vec());
			true
		});
		assert_eq!(seen.len(), 20);
	}
}
