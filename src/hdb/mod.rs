//! Component D: the mmap-backed hash storage engine — the core of the
//! crate. Ties the header, bucket array, free-block pool, WAL and
//! record cache together behind the method/bucket/DB lock hierarchy
//! described for the engine (spec §4.D, §4.D.9).

pub mod fbp;
pub mod hashfn;
pub mod header;
pub mod mapping;
pub mod record;
pub mod wal;

use crate::codec::{self, Codec, CodecKind};
use crate::error::{Code, Error, Result};
use crate::mdb::Mdb;
use crate::mode::{AddOutcome, ProcResult, WriteMode};
use crate::ospath::{self, PathGuard};
use crate::osio;
use fbp::{FreeBlock, FreeBlockPool};
use header::Header;
use log::{debug, warn};
use mapping::Mapping;
use parking_lot::{Mutex, RwLock};
use record::{FreeBlockHeader, RecordHeader};
use std::cmp::Ordering as CmpOrdering;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

const BUCKET_LOCK_COUNT: usize = 256;
const CACHE_TAG_PRESENT: u8 = b'=';
const CACHE_TAG_ABSENT: u8 = b'*';
const MAX_FB_CHUNK: u64 = i32::MAX as u64 / 4;

/// Advisory lock acquisition mode for `open` (spec §6 ADB mode letters
/// `e`=no-lock, `f`=non-blocking lock; the ordering ambiguity in §9's
/// Open Question 4 is left undefined in `NoLock` mode, as the spec asks).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
	Blocking,
	NonBlocking,
	NoLock,
}

/// Tuning parameters supplied to `Hdb::open`/`Hdb::create` (spec §4.D.1,
/// §4.D.2). Mirrors the host's `tune`/`setcache`/`setxmsiz`/`setdfunit`.
#[derive(Clone, Copy, Debug)]
pub struct Options {
	pub apow: u8,
	pub fpow: u8,
	pub opts: u8,
	pub bnum: u64,
	pub rcnum: usize,
	pub xmsiz: u64,
	pub dfunit: u64,
	pub lock_mode: LockMode,
}

impl Default for Options {
	fn default() -> Options {
		Options {
			apow: 4,
			fpow: 10,
			opts: 0,
			bnum: hashfn::next_prime(131_071),
			rcnum: 0,
			xmsiz: 64 << 20,
			dfunit: 0,
			lock_mode: LockMode::Blocking,
		}
	}
}

/// Outcome of descending a bucket's collision tree toward `key`.
enum Descend {
	Found { offset: u64, header: RecordHeader, header_len: usize, parent: Option<(u64, bool)> },
	Absent { parent: Option<(u64, bool)> },
}

pub struct Hdb {
	_guard: PathGuard,
	path: PathBuf,
	mapping: Mapping,
	header: RwLock<Header>,
	fbp: Mutex<FreeBlockPool>,
	wal: wal::Wal,
	cache: Mdb,
	cache_cap: usize,
	bucket_locks: Vec<RwLock<()>>,
	method_lock: RwLock<()>,
	db_lock: Mutex<()>,
	writable: bool,
	lock_mode: LockMode,
	apow: u8,
	fpow: u8,
	off_size: usize,
	bnum: u64,
	dfunit: u64,
	codec: Option<Box<dyn Codec>>,
	iter_cursor: AtomicU64,
	dfcur: AtomicU64,
	tran_active: AtomicBool,
}

fn codec_kind_of(opts: u8) -> CodecKind {
	if opts & header::OPT_DEFLATE != 0 {
		CodecKind::Deflate
	} else if opts & header::OPT_BZIP != 0 {
		CodecKind::BZip
	} else if opts & header::OPT_TCBS != 0 {
		CodecKind::BlockSort
	} else if opts & header::OPT_EXCODEC != 0 {
		CodecKind::Ext
	} else {
		CodecKind::None
	}
}

fn fbp_region_len(fpow: u8) -> u64 {
	2 + (FreeBlockPool::new(fpow).trim_capacity() as u64) * fbp::ALLOWANCE_RATIO as u64 * 16
}

impl Hdb {
	/// Opens (and if `create`, initializes) the database file at `path`.
	pub fn open(path: impl AsRef<Path>, writable: bool, create: bool, truncate: bool, opts: Options) -> Result<Hdb> {
		let path = path.as_ref();
		let guard = ospath::claim(path)?;
		let mut open_opts = OpenOptions::new();
		open_opts.read(true).write(writable).create(writable && create);
		let file = open_opts.open(path).map_err(Error::from)?;
		match opts.lock_mode {
			LockMode::Blocking => osio::lock_file(&file, writable, true)?,
			LockMode::NonBlocking => osio::lock_file(&file, writable, false)?,
			LockMode::NoLock => {}
		}

		let wal = wal::Wal::for_db_path(path);
		if writable && truncate {
			file.set_len(0)?;
			wal.remove_file()?;
		}

		let existing_len = file.metadata()?.len();
		let fresh = writable && existing_len == 0;

		let header = if fresh {
			let off_size = if opts.opts & header::OPT_LARGE != 0 { 8 } else { 4 };
			let bnum = hashfn::next_prime(opts.bnum.max(1));
			let bucket_bytes = bnum * off_size as u64;
			let fbp_bytes = fbp_region_len(opts.fpow);
			let frec = align_up(header::HEADER_SIZE as u64 + bucket_bytes + fbp_bytes, 1 << opts.apow.min(20));
			let mut h = Header::new(opts.apow, opts.fpow, opts.opts, bnum);
			h.fsiz = frec;
			h.frec = frec;
			h.flags = 0;
			let zeros = vec![0u8; frec as usize];
			osio::pwrite(&file, &zeros, 0)?;
			osio::pwrite(&file, &h.encode(), 0)?;
			h
		} else {
			let mut hdr_buf = [0u8; header::HEADER_SIZE];
			osio::pread(&file, &mut hdr_buf, 0)?;
			let mut h = Header::decode(&hdr_buf)?;
			if h.flags & header::FLAG_OPEN != 0 && wal.exists() {
				warn!("hdb: recovering from unclean close, replaying write-ahead log");
				wal.open_for_replay()?;
				let entries = wal.read_all()?;
				for entry in entries.into_iter().rev() {
					osio::pwrite(&file, &entry.old_bytes, entry.offset)?;
				}
				let anchor = wal.anchor()?;
				file.set_len(anchor.max(1))?;
				wal.clear()?;
				wal.remove_file()?;
				osio::pread(&file, &mut hdr_buf, 0)?;
				h = Header::decode(&hdr_buf)?;
			}
			h
		};

		let kind = codec_kind_of(header.opts);
		if kind == CodecKind::Ext {
			return Err(Error::InvalidOption("external codec not supplied by this build".into()));
		}
		let codec = codec::resolve(kind);

		let off_size = header.offset_size();
		let bucket_bytes = header.bnum * off_size as u64;
		let fbp_bytes = fbp_region_len(header.fpow);
		let fbp_offset = header::HEADER_SIZE as u64 + bucket_bytes;
		let mapped_len = (header::HEADER_SIZE as u64 + bucket_bytes + fbp_bytes).max(header.fsiz);
		let xmsiz = opts.xmsiz.max(mapped_len);

		let mapping = Mapping::new(file, mapped_len, xmsiz, writable)?;

		let fbp = if writable {
			let mut region = vec![0u8; fbp_bytes as usize];
			mapping.read_at(fbp_offset, &mut region)?;
			let count = u16::from_be_bytes([region[0], region[1]]) as usize;
			let mut entries = Vec::with_capacity(count);
			let mut pos = 2usize;
			for _ in 0..count {
				if pos + 16 > region.len() {
					break;
				}
				let off = u64::from_be_bytes(region[pos..pos + 8].try_into().unwrap());
				let size = u64::from_be_bytes(region[pos + 8..pos + 16].try_into().unwrap());
				entries.push(FreeBlock { offset: off, size });
				pos += 16;
			}
			mapping.write_at(fbp_offset, &[0u8, 0u8])?;
			FreeBlockPool::load(entries, header.fpow)
		} else {
			FreeBlockPool::new(header.fpow)
		};

		let mut bucket_locks = Vec::with_capacity(BUCKET_LOCK_COUNT);
		for _ in 0..BUCKET_LOCK_COUNT {
			bucket_locks.push(RwLock::new(()));
		}

		let frec = header.frec;
		let bnum = header.bnum;
		let apow = header.apow;
		let fpow = header.fpow;
		let mut header = header;
		if writable {
			header.flags |= header::FLAG_OPEN;
			mapping.write_at(0, &header.encode())?;
		}

		Ok(Hdb {
			_guard: guard,
			path: path.to_path_buf(),
			mapping,
			header: RwLock::new(header),
			fbp: Mutex::new(fbp),
			wal,
			cache: Mdb::new(),
			cache_cap: opts.rcnum,
			bucket_locks,
			method_lock: RwLock::new(()),
			db_lock: Mutex::new(()),
			writable,
			lock_mode: opts.lock_mode,
			apow,
			fpow,
			off_size,
			bnum,
			dfunit: opts.dfunit,
			codec,
			iter_cursor: AtomicU64::new(frec),
			dfcur: AtomicU64::new(frec),
			tran_active: AtomicBool::new(false),
		})
	}

	pub fn create(path: impl AsRef<Path>, opts: Options) -> Result<Hdb> {
		Hdb::open(path, true, true, true, opts)
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn rnum(&self) -> u64 {
		self.header.read().rnum
	}

	pub fn fsiz(&self) -> u64 {
		self.header.read().fsiz
	}

	fn check_fatal(&self) -> Result<()> {
		if self.header.read().flags & header::FLAG_FATAL != 0 {
			return Err(Error::Fatal("database is in a fatal state".into()));
		}
		Ok(())
	}

	fn mark_fatal_if_needed(&self, err: &Error) {
		if err.code().is_fatal() && self.writable {
			let mut header = self.header.write();
			if header.flags & header::FLAG_FATAL == 0 {
				header.flags |= header::FLAG_FATAL;
				let bytes = header.encode();
				drop(header);
				let _ = self.mapping.write_at(0, &bytes);
			}
		}
	}

	/// Writes `new_bytes` at `offset`, logging the region's prior bytes
	/// to the WAL first if a transaction is active and the region
	/// existed at `tranbegin` (spec §4.D.7).
	fn mutate(&self, offset: u64, new_bytes: &[u8]) -> Result<()> {
		if self.tran_active.load(Ordering::Acquire) {
			if let Ok(anchor) = self.wal.anchor() {
				if offset + new_bytes.len() as u64 <= anchor {
					let mut old = vec![0u8; new_bytes.len()];
					self.mapping.read_at(offset, &mut old)?;
					self.wal.log_mutation(offset, &old)?;
				}
			}
		}
		self.mapping.write_at(offset, new_bytes)
	}

	fn bucket_slot_offset(&self, bucket: u64) -> u64 {
		header::HEADER_SIZE as u64 + bucket * self.off_size as u64
	}

	fn read_bucket_head(&self, bucket: u64) -> Result<u64> {
		let mut buf = vec![0u8; self.off_size];
		self.mapping.read_at(self.bucket_slot_offset(bucket), &mut buf)?;
		Ok(record::unpack_bucket_slot(&buf, self.apow, self.off_size))
	}

	fn write_bucket_head(&self, bucket: u64, offset: u64) -> Result<()> {
		let buf = record::pack_bucket_slot(offset, self.apow, self.off_size);
		self.mutate(self.bucket_slot_offset(bucket), &buf)
	}

	fn child_field_offset(&self, node_offset: u64, left: bool) -> u64 {
		node_offset + 2 + if left { 0 } else { self.off_size as u64 }
	}

	fn write_child(&self, node_offset: u64, left: bool, new_offset: u64) -> Result<()> {
		let buf = record::pack_bucket_slot(new_offset, self.apow, self.off_size);
		self.mutate(self.child_field_offset(node_offset, left), &buf)
	}

	fn link(&self, bucket: u64, parent: Option<(u64, bool)>, new_offset: u64) -> Result<()> {
		match parent {
			None => self.write_bucket_head(bucket, new_offset),
			Some((poff, is_left)) => self.write_child(poff, is_left, new_offset),
		}
	}

	fn read_record_header(&self, offset: u64) -> Result<(RecordHeader, usize)> {
		let max_len = RecordHeader::header_len(self.off_size) as u64;
		let fsiz = self.header.read().fsiz;
		let avail = fsiz.saturating_sub(offset).min(max_len);
		let mut buf = vec![0u8; avail as usize];
		self.mapping.read_at(offset, &mut buf)?;
		RecordHeader::decode_sized(&buf, self.apow, self.off_size)
	}

	fn read_key(&self, offset: u64, header_len: usize, ksiz: u32) -> Result<Vec<u8>> {
		let mut buf = vec![0u8; ksiz as usize];
		self.mapping.read_at(offset + header_len as u64, &mut buf)?;
		Ok(buf)
	}

	fn read_value_raw(&self, offset: u64, header_len: usize, h: &RecordHeader) -> Result<Vec<u8>> {
		let value_off = offset + header_len as u64 + h.ksiz as u64 + h.psiz as u64;
		let mut buf = vec![0u8; h.vsiz as usize];
		self.mapping.read_at(value_off, &mut buf)?;
		Ok(buf)
	}

	fn decode_value(&self, raw: Vec<u8>) -> Result<Vec<u8>> {
		match &self.codec {
			Some(c) => c.decode(&raw),
			None => Ok(raw),
		}
	}

	fn encode_value(&self, value: &[u8]) -> Result<Vec<u8>> {
		match &self.codec {
			Some(c) => c.encode(value),
			None => Ok(value.to_vec()),
		}
	}

	fn descend(&self, bucket: u64, hash2: u8, key: &[u8]) -> Result<Descend> {
		let mut cur = self.read_bucket_head(bucket)?;
		let mut parent: Option<(u64, bool)> = None;
		loop {
			if cur == 0 {
				return Ok(Descend::Absent { parent });
			}
			let (h, hlen) = self.read_record_header(cur)?;
			match hash2.cmp(&h.hash2) {
				CmpOrdering::Less => {
					parent = Some((cur, true));
					cur = h.left;
				}
				CmpOrdering::Greater => {
					parent = Some((cur, false));
					cur = h.right;
				}
				CmpOrdering::Equal => {
					let node_key = self.read_key(cur, hlen, h.ksiz)?;
					match key.cmp(&node_key[..]) {
						CmpOrdering::Less => {
							parent = Some((cur, true));
							cur = h.left;
						}
						CmpOrdering::Greater => {
							parent = Some((cur, false));
							cur = h.right;
						}
						CmpOrdering::Equal => return Ok(Descend::Found { offset: cur, header: h, header_len: hlen, parent }),
					}
				}
			}
		}
	}

	fn cache_get(&self, key: &[u8]) -> Option<Option<Vec<u8>>> {
		self.cache.get(key).map(|tagged| {
			if tagged.first() == Some(&CACHE_TAG_PRESENT) {
				Some(tagged[1..].to_vec())
			} else {
				None
			}
		})
	}

	fn cache_put_present(&self, key: &[u8], value: &[u8]) {
		let mut tagged = Vec::with_capacity(value.len() + 1);
		tagged.push(CACHE_TAG_PRESENT);
		tagged.extend_from_slice(value);
		let _ = self.cache.put(key, &tagged, WriteMode::Over);
		self.cache_enforce_cap();
	}

	fn cache_put_absent(&self, key: &[u8]) {
		let _ = self.cache.put(key, &[CACHE_TAG_ABSENT], WriteMode::Over);
		self.cache_enforce_cap();
	}

	fn cache_evict(&self, key: &[u8]) {
		self.cache.out(key);
	}

	fn cache_enforce_cap(&self) {
		if self.cache_cap == 0 {
			return;
		}
		let over = self.cache.rnum().saturating_sub(self.cache_cap);
		if over > 0 {
			self.cache.cut_front(over);
		}
	}

	/// `get(key)` — spec §4.D.3.
	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.check_fatal()?;
		let _method = self.method_lock.read();
		if let Some(cached) = self.cache_get(key) {
			return Ok(cached);
		}
		let result = self.get_uncached(key);
		if let Err(e) = &result {
			self.mark_fatal_if_needed(e);
		}
		result
	}

	fn get_uncached(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		let bucket = hashfn::primary_hash(key, self.bnum);
		let hash2 = hashfn::secondary_hash(key);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].read();
		match self.descend(bucket, hash2, key)? {
			Descend::Found { offset, header, header_len, .. } => {
				let raw = self.read_value_raw(offset, header_len, &header)?;
				let value = self.decode_value(raw)?;
				self.cache_put_present(key, &value);
				Ok(Some(value))
			}
			Descend::Absent { .. } => {
				self.cache_put_absent(key);
				Ok(None)
			}
		}
	}

	pub fn vsiz(&self, key: &[u8]) -> Result<Option<usize>> {
		Ok(self.get(key)?.map(|v| v.len()))
	}

	fn allocate_record(&self, min_len: u64) -> Result<(u64, u64)> {
		if let Some(block) = self.fbp.lock().search(min_len, record::HDB_MIN_RUNIT as u64) {
			return Ok((block.offset, block.size));
		}
		let _db = self.db_lock.lock();
		let total = min_len.max(record::HDB_MIN_RUNIT as u64);
		let offset = {
			let header = self.header.read();
			header.fsiz
		};
		let new_fsiz = offset + total;
		self.mapping.ensure_len(new_fsiz)?;
		{
			let mut header = self.header.write();
			header.fsiz = new_fsiz;
			let bytes = header.encode();
			drop(header);
			self.mutate(0, &bytes)?;
		}
		Ok((offset, total))
	}

	fn write_new_record(&self, offset: u64, total: u64, hash2: u8, left: u64, right: u64, key: &[u8], value: &[u8]) -> Result<()> {
		let ksiz = key.len() as u32;
		let vsiz = value.len() as u32;
		let probe = RecordHeader { hash2, left, right, psiz: 0, ksiz, vsiz };
		let hlen = probe.encode(self.apow, self.off_size).len();
		let body_min = hlen as u64 + ksiz as u64 + vsiz as u64;
		if body_min > total {
			return Err(Error::Invalid("allocated block smaller than record body".into()));
		}
		let psiz = (total - body_min) as u16;
		let h = RecordHeader { hash2, left, right, psiz, ksiz, vsiz };
		let mut buf = h.encode(self.apow, self.off_size);
		buf.extend_from_slice(key);
		buf.resize(buf.len() + psiz as usize, 0);
		buf.extend_from_slice(value);
		debug_assert_eq!(buf.len() as u64, total);
		self.mutate(offset, &buf)
	}

	fn free_record(&self, offset: u64, total: u64) -> Result<()> {
		let fb = FreeBlockHeader { rsiz: total as u32 };
		self.mutate(offset, &fb.encode())?;
		self.fbp.lock().insert(offset, total);
		Ok(())
	}

	fn record_total_len(h: &RecordHeader, header_len: usize) -> u64 {
		header_len as u64 + h.ksiz as u64 + h.psiz as u64 + h.vsiz as u64
	}

	fn rewrite_or_relocate(&self, bucket: u64, hash2: u8, key: &[u8], found_offset: u64, found: &RecordHeader, found_len: usize, parent: Option<(u64, bool)>, new_value: &[u8]) -> Result<()> {
		let old_total = Self::record_total_len(found, found_len);
		let ksiz = key.len() as u32;
		let vsiz = new_value.len() as u32;
		let probe = RecordHeader { hash2, left: found.left, right: found.right, psiz: 0, ksiz, vsiz };
		let new_hlen = probe.encode(self.apow, self.off_size).len() as u64;
		let need = new_hlen + ksiz as u64 + vsiz as u64;

		if need <= old_total {
			let psiz = (old_total - need) as u16;
			let h = RecordHeader { hash2, left: found.left, right: found.right, psiz, ksiz, vsiz };
			let mut buf = h.encode(self.apow, self.off_size);
			buf.extend_from_slice(key);
			buf.resize(buf.len() + psiz as usize, 0);
			buf.extend_from_slice(new_value);
			return self.mutate(found_offset, &buf);
		}

		let spliced = {
			let mut fbp = self.fbp.lock();
			match fbp.splice(found_offset + old_total) {
				Some(fb) if old_total + fb.size >= need => Some(fb),
				Some(fb) => {
					fbp.insert(fb.offset, fb.size);
					None
				}
				None => None,
			}
		};
		if let Some(fb) = spliced {
			let total = old_total + fb.size;
			let psiz = (total - need) as u16;
			let h = RecordHeader { hash2, left: found.left, right: found.right, psiz, ksiz, vsiz };
			let mut buf = h.encode(self.apow, self.off_size);
			buf.extend_from_slice(key);
			buf.resize(buf.len() + psiz as usize, 0);
			buf.extend_from_slice(new_value);
			return self.mutate(found_offset, &buf);
		}

		self.free_record(found_offset, old_total)?;
		let (new_offset, total) = self.allocate_record(need)?;
		self.write_new_record(new_offset, total, hash2, found.left, found.right, key, new_value)?;
		self.link(bucket, parent, new_offset)?;
		let _db = self.db_lock.lock();
		Ok(())
	}

	fn insert_new(&self, bucket: u64, hash2: u8, key: &[u8], value: &[u8], parent: Option<(u64, bool)>) -> Result<()> {
		let ksiz = key.len() as u32;
		let vsiz = value.len() as u32;
		let probe = RecordHeader { hash2, left: 0, right: 0, psiz: 0, ksiz, vsiz };
		let hlen = probe.encode(self.apow, self.off_size).len() as u64;
		let need = hlen + ksiz as u64 + vsiz as u64;
		let (offset, total) = self.allocate_record(need)?;
		self.write_new_record(offset, total, hash2, 0, 0, key, value)?;
		self.link(bucket, parent, offset)?;
		let mut header = self.header.write();
		header.rnum += 1;
		let bytes = header.encode();
		drop(header);
		self.mutate(0, &bytes)?;
		Ok(())
	}

	fn delete_found(&self, bucket: u64, offset: u64, h: &RecordHeader, hlen: usize, parent: Option<(u64, bool)>) -> Result<()> {
		let child = if h.left == 0 && h.right == 0 {
			0
		} else if h.left == 0 {
			h.right
		} else if h.right == 0 {
			h.left
		} else {
			let mut succ_parent = offset;
			let mut succ_is_left_of_parent_d = false;
			let mut succ = h.right;
			let (mut succ_h, mut succ_hlen) = self.read_record_header(succ)?;
			while succ_h.left != 0 {
				succ_parent = succ;
				succ_is_left_of_parent_d = true;
				succ = succ_h.left;
				let next = self.read_record_header(succ)?;
				succ_h = next.0;
				succ_hlen = next.1;
			}
			let _ = succ_hlen;
			if succ_parent != offset {
				self.write_child(succ_parent, true, succ_h.right)?;
				self.write_child(succ, true, h.left)?;
				self.write_child(succ, false, h.right)?;
			} else {
				let _ = succ_is_left_of_parent_d;
				self.write_child(succ, true, h.left)?;
			}
			succ
		};
		self.link(bucket, parent, child)?;
		let total = Self::record_total_len(h, hlen);
		self.free_record(offset, total)?;
		let mut header = self.header.write();
		header.rnum = header.rnum.saturating_sub(1);
		let bytes = header.encode();
		drop(header);
		self.mutate(0, &bytes)?;
		Ok(())
	}

	/// `out(key)` — spec §4.D.4/§4.D.5 deletion path.
	pub fn out(&self, key: &[u8]) -> Result<bool> {
		self.check_fatal()?;
		let _method = self.method_lock.read();
		self.cache_evict(key);
		let bucket = hashfn::primary_hash(key, self.bnum);
		let hash2 = hashfn::secondary_hash(key);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].write();
		match self.descend(bucket, hash2, key)? {
			Descend::Found { offset, header, header_len, parent } => {
				self.delete_found(bucket, offset, &header, header_len, parent)?;
				Ok(true)
			}
			Descend::Absent { .. } => Ok(false),
		}
	}

	/// `put(key, value, mode)` for `OVER`/`KEEP`/`CAT`/`PROC` — spec
	/// §4.D.4. Use `add_int`/`add_double` for numeric accumulation.
	pub fn put(&self, key: &[u8], value: &[u8], mode: WriteMode<'_>) -> Result<()> {
		self.check_fatal()?;
		if !self.writable {
			return Err(Error::Invalid("database opened read-only".into()));
		}
		let result = {
			let _method = self.method_lock.read();
			self.cache_evict(key);
			let bucket = hashfn::primary_hash(key, self.bnum);
			let hash2 = hashfn::secondary_hash(key);
			let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].write();
			self.put_locked(bucket, hash2, key, value, mode)
		};
		if let Err(e) = &result {
			self.mark_fatal_if_needed(e);
		} else {
			self.maybe_auto_defrag();
		}
		result
	}

	fn put_locked(&self, bucket: u64, hash2: u8, key: &[u8], value: &[u8], mode: WriteMode<'_>) -> Result<()> {
		match self.descend(bucket, hash2, key)? {
			Descend::Found { offset, header, header_len, parent } => match mode {
				WriteMode::Keep => Err(Error::Keep),
				WriteMode::Over => {
					let encoded = self.encode_value(value)?;
					self.rewrite_or_relocate(bucket, hash2, key, offset, &header, header_len, parent, &encoded)
				}
				WriteMode::Cat => {
					let raw_old = self.read_value_raw(offset, header_len, &header)?;
					let mut merged = self.decode_value(raw_old)?;
					merged.extend_from_slice(value);
					let encoded = self.encode_value(&merged)?;
					self.rewrite_or_relocate(bucket, hash2, key, offset, &header, header_len, parent, &encoded)
				}
				WriteMode::Proc(f) => {
					let raw_old = self.read_value_raw(offset, header_len, &header)?;
					let decoded = self.decode_value(raw_old)?;
					match f(Some(&decoded)) {
						ProcResult::Set(newval) => {
							let encoded = self.encode_value(&newval)?;
							self.rewrite_or_relocate(bucket, hash2, key, offset, &header, header_len, parent, &encoded)
						}
						ProcResult::Delete => self.delete_found(bucket, offset, &header, header_len, parent),
						ProcResult::Keep => Ok(()),
					}
				}
				WriteMode::AddInt(_) | WriteMode::AddDouble(_) => unreachable!("use add_int/add_double"),
			},
			Descend::Absent { parent } => match mode {
				WriteMode::Cat | WriteMode::Over | WriteMode::Keep => {
					let encoded = self.encode_value(value)?;
					self.insert_new(bucket, hash2, key, &encoded, parent)
				}
				WriteMode::Proc(f) => match f(None) {
					ProcResult::Set(newval) => {
						let encoded = self.encode_value(&newval)?;
						self.insert_new(bucket, hash2, key, &encoded, parent)
					}
					ProcResult::Delete | ProcResult::Keep => Ok(()),
				},
				WriteMode::AddInt(_) | WriteMode::AddDouble(_) => unreachable!("use add_int/add_double"),
			},
		}
	}

	/// Native 4-byte int accumulation (spec §8 scenario 3): matches the
	/// host's `addint`, which stores the accumulator as a host-native
	/// `int` rather than a fixed 64-bit width.
	pub fn add_int(&self, key: &[u8], delta: i32) -> Result<AddOutcome<i32>> {
		self.check_fatal()?;
		let _method = self.method_lock.read();
		self.cache_evict(key);
		let bucket = hashfn::primary_hash(key, self.bnum);
		let hash2 = hashfn::secondary_hash(key);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].write();
		match self.descend(bucket, hash2, key)? {
			Descend::Absent { parent } => {
				self.insert_new(bucket, hash2, key, &delta.to_ne_bytes(), parent)?;
				Ok(AddOutcome::Value(delta))
			}
			Descend::Found { offset, header, header_len, parent } => {
				let raw = self.read_value_raw(offset, header_len, &header)?;
				if raw.len() != 4 {
					return Ok(AddOutcome::Mismatch);
				}
				let prev = i32::from_ne_bytes(raw[..4].try_into().unwrap());
				let next = prev.wrapping_add(delta);
				self.rewrite_or_relocate(bucket, hash2, key, offset, &header, header_len, parent, &next.to_ne_bytes())?;
				Ok(AddOutcome::Value(next))
			}
		}
	}

	/// Native 8-byte double accumulation, matching `adddouble`.
	pub fn add_double(&self, key: &[u8], delta: f64) -> Result<AddOutcome<f64>> {
		self.check_fatal()?;
		let _method = self.method_lock.read();
		self.cache_evict(key);
		let bucket = hashfn::primary_hash(key, self.bnum);
		let hash2 = hashfn::secondary_hash(key);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].write();
		match self.descend(bucket, hash2, key)? {
			Descend::Absent { parent } => {
				self.insert_new(bucket, hash2, key, &delta.to_ne_bytes(), parent)?;
				Ok(AddOutcome::Value(delta))
			}
			Descend::Found { offset, header, header_len, parent } => {
				let raw = self.read_value_raw(offset, header_len, &header)?;
				if raw.len() != 8 {
					return Ok(AddOutcome::Mismatch);
				}
				let prev = f64::from_ne_bytes(raw[..8].try_into().unwrap());
				let next = prev + delta;
				self.rewrite_or_relocate(bucket, hash2, key, offset, &header, header_len, parent, &next.to_ne_bytes())?;
				Ok(AddOutcome::Value(next))
			}
		}
	}

	/// `putasync` is an alias for `put`; see the design notes on a
	/// simpler, still-correct delayed record pool.
	pub fn put_async(&self, key: &[u8], value: &[u8], mode: WriteMode<'_>) -> Result<()> {
		self.put(key, value, mode)
	}

	pub fn iterinit(&self) {
		self.iter_cursor.store(self.header.read().frec, Ordering::Relaxed);
	}

	pub fn iterinit_at(&self, key: &[u8]) -> Result<()> {
		let _method = self.method_lock.read();
		let bucket = hashfn::primary_hash(key, self.bnum);
		let hash2 = hashfn::secondary_hash(key);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].read();
		if let Descend::Found { offset, header, header_len, .. } = self.descend(bucket, hash2, key)? {
			let total = Self::record_total_len(&header, header_len);
			self.iter_cursor.store(offset + total, Ordering::Relaxed);
		}
		Ok(())
	}

	pub fn iternext(&self) -> Result<Option<Vec<u8>>> {
		let _method = self.method_lock.read();
		loop {
			let off = self.iter_cursor.load(Ordering::Relaxed);
			let fsiz = self.header.read().fsiz;
			if off >= fsiz {
				return Ok(None);
			}
			let mut magic = [0u8; 1];
			self.mapping.read_at(off, &mut magic)?;
			if magic[0] == record::MAGIC_FB {
				let mut hb = [0u8; FreeBlockHeader::HEADER_LEN];
				self.mapping.read_at(off, &mut hb)?;
				let fb = FreeBlockHeader::decode(&hb)?;
				self.iter_cursor.store(off + fb.rsiz as u64, Ordering::Relaxed);
				continue;
			}
			if magic[0] != record::MAGIC_REC {
				return Err(Error::Corruption("bad magic during iteration".into()));
			}
			let (h, hlen) = self.read_record_header(off)?;
			let key = self.read_key(off, hlen, h.ksiz)?;
			let total = Self::record_total_len(&h, hlen);
			self.iter_cursor.store(off + total, Ordering::Relaxed);
			return Ok(Some(key));
		}
	}

	/// `foreach(cb)` — spec §4.D.6: every bucket lock held in shared
	/// mode for the duration of the scan.
	pub fn foreach<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut cb: F) -> Result<()> {
		let _method = self.method_lock.read();
		let _guards: Vec<_> = self.bucket_locks.iter().map(|l| l.read()).collect();
		let (mut off, fsiz) = {
			let header = self.header.read();
			(header.frec, header.fsiz)
		};
		while off < fsiz {
			let mut magic = [0u8; 1];
			self.mapping.read_at(off, &mut magic)?;
			if magic[0] == record::MAGIC_FB {
				let mut hb = [0u8; FreeBlockHeader::HEADER_LEN];
				self.mapping.read_at(off, &mut hb)?;
				let fb = FreeBlockHeader::decode(&hb)?;
				off += fb.rsiz as u64;
				continue;
			}
			if magic[0] != record::MAGIC_REC {
				return Err(Error::Corruption("bad magic during foreach".into()));
			}
			let (h, hlen) = self.read_record_header(off)?;
			let key = self.read_key(off, hlen, h.ksiz)?;
			let raw = self.read_value_raw(off, hlen, &h)?;
			let value = self.decode_value(raw)?;
			if !cb(&key, &value) {
				break;
			}
			off += Self::record_total_len(&h, hlen);
		}
		Ok(())
	}

	pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
		let mut out = Vec::new();
		self.foreach(|k, _| {
			if k.starts_with(prefix) {
				out.push(k.to_vec());
			}
			max.map_or(true, |m| out.len() < m)
		})?;
		Ok(out)
	}

	pub fn vanish(&self) -> Result<()> {
		let _method = self.method_lock.write();
		self.cache.vanish();
		let frec = self.header.read().frec;
		self.mapping.truncate(frec)?;
		*self.fbp.lock() = FreeBlockPool::new(self.fpow);
		let mut header = self.header.write();
		header.rnum = 0;
		header.fsiz = frec;
		let bytes = header.encode();
		drop(header);
		self.mapping.write_at(0, &bytes)?;
		self.iter_cursor.store(frec, Ordering::Relaxed);
		self.dfcur.store(frec, Ordering::Relaxed);
		Ok(())
	}

	fn maybe_auto_defrag(&self) {
		if self.dfunit == 0 {
			return;
		}
		let dfcnt = self.fbp.lock().dfcnt;
		if dfcnt > self.dfunit {
			if let Err(e) = self.defrag(Some(256)) {
				warn!("hdb: auto-defrag step failed: {}", e);
			}
		}
	}

	fn shift_record(&self, old_offset: u64, new_offset: u64) -> Result<()> {
		let (h, hlen) = self.read_record_header(old_offset)?;
		let total = Self::record_total_len(&h, hlen);
		let mut buf = vec![0u8; total as usize];
		self.mapping.read_at(old_offset, &mut buf)?;
		if new_offset != old_offset {
			self.mutate(new_offset, &buf)?;
		}
		let key = buf[hlen..hlen + h.ksiz as usize].to_vec();
		let bucket = hashfn::primary_hash(&key, self.bnum);
		let _bucket_lock = self.bucket_locks[(bucket % BUCKET_LOCK_COUNT as u64) as usize].write();
		if let Descend::Found { offset, parent, .. } = self.descend(bucket, h.hash2, &key)? {
			if offset == old_offset {
				self.link(bucket, parent, new_offset)?;
			}
		}
		Ok(())
	}

	/// `defrag(step)` — spec §4.D.8. `step = None` runs to EOF.
	pub fn defrag(&self, step: Option<u64>) -> Result<u64> {
		let _method = self.method_lock.write();
		let frec = self.header.read().frec;
		let scan_start = self.dfcur.load(Ordering::Relaxed).max(frec);
		let fsiz = self.header.read().fsiz;
		if scan_start >= fsiz {
			self.dfcur.store(frec, Ordering::Relaxed);
			return Ok(0);
		}

		let mut read_cursor = scan_start;
		let mut write_cursor = scan_start;
		let mut processed = 0u64;
		loop {
			if read_cursor >= fsiz {
				break;
			}
			if let Some(limit) = step {
				if processed >= limit {
					break;
				}
			}
			let mut magic = [0u8; 1];
			self.mapping.read_at(read_cursor, &mut magic)?;
			if magic[0] == record::MAGIC_FB {
				let mut hb = [0u8; FreeBlockHeader::HEADER_LEN];
				self.mapping.read_at(read_cursor, &mut hb)?;
				let fb = FreeBlockHeader::decode(&hb)?;
				read_cursor += fb.rsiz as u64;
				continue;
			}
			if magic[0] != record::MAGIC_REC {
				return Err(Error::Corruption("bad magic during defrag".into()));
			}
			let (h, hlen) = self.read_record_header(read_cursor)?;
			let total = Self::record_total_len(&h, hlen);
			if write_cursor != read_cursor {
				self.shift_record(read_cursor, write_cursor)?;
			}
			write_cursor += total;
			read_cursor += total;
			processed += 1;
		}

		{
			let mut fbp = self.fbp.lock();
			fbp.trim_region(scan_start, read_cursor, None);
		}

		if read_cursor >= fsiz {
			let mut header = self.header.write();
			header.fsiz = write_cursor;
			drop(header);
			self.mapping.truncate(write_cursor.max(1))?;
			let bytes = self.header.read().encode();
			self.mapping.write_at(0, &bytes)?;
			self.dfcur.store(frec, Ordering::Relaxed);
		} else {
			let gap = read_cursor - write_cursor;
			if gap >= FreeBlockHeader::HEADER_LEN as u64 {
				let mut fbp = self.fbp.lock();
				let mut off = write_cursor;
				let mut remaining = gap;
				while remaining > 0 {
					let mut chunk = remaining.min(MAX_FB_CHUNK);
					if remaining - chunk > 0 && remaining - chunk < FreeBlockHeader::HEADER_LEN as u64 {
						chunk = remaining;
					}
					let fbh = FreeBlockHeader { rsiz: chunk as u32 };
					self.mutate(off, &fbh.encode())?;
					fbp.insert(off, chunk);
					off += chunk;
					remaining -= chunk;
				}
			}
			self.dfcur.store(read_cursor, Ordering::Relaxed);
		}
		debug!("hdb: defrag processed {} records", processed);
		Ok(processed)
	}

	/// Rebuilds the database into a sibling file with new tuning and
	/// atomically renames it over the original. The live handle (`self`)
	/// should be closed and reopened afterward; its mapping still
	/// refers to the pre-rename inode, matching ordinary Unix
	/// rename-over-open-file semantics.
	pub fn optimize(&self, opts: Options) -> Result<()> {
		let _method = self.method_lock.write();
		let mut sibling_path = self.path.as_os_str().to_owned();
		sibling_path.push(".optmp");
		let sibling_path = PathBuf::from(sibling_path);
		let sibling = Hdb::create(&sibling_path, opts)?;
		let mut first_err = None;
		self.foreach_unlocked(|k, v| {
			if let Err(e) = sibling.put(k, v, WriteMode::Over) {
				first_err = Some(e);
				return false;
			}
			true
		})?;
		if let Some(e) = first_err {
			return Err(e);
		}
		sibling.close()?;
		ospath::atomic_rename(&sibling_path, &self.path)?;
		Ok(())
	}

	fn foreach_unlocked<F: FnMut(&[u8], &[u8]) -> bool>(&self, mut cb: F) -> Result<()> {
		let (mut off, fsiz) = {
			let header = self.header.read();
			(header.frec, header.fsiz)
		};
		while off < fsiz {
			let mut magic = [0u8; 1];
			self.mapping.read_at(off, &mut magic)?;
			if magic[0] == record::MAGIC_FB {
				let mut hb = [0u8; FreeBlockHeader::HEADER_LEN];
				self.mapping.read_at(off, &mut hb)?;
				let fb = FreeBlockHeader::decode(&hb)?;
				off += fb.rsiz as u64;
				continue;
			}
			let (h, hlen) = self.read_record_header(off)?;
			let key = self.read_key(off, hlen, h.ksiz)?;
			let raw = self.read_value_raw(off, hlen, &h)?;
			let value = self.decode_value(raw)?;
			if !cb(&key, &value) {
				break;
			}
			off += Self::record_total_len(&h, hlen);
		}
		Ok(())
	}

	/// `tranbegin` — spec §4.D.7.
	pub fn tranbegin(&self) -> Result<()> {
		let mut delay = Duration::from_millis(10);
		while self.tran_active.swap(true, Ordering::AcqRel) {
			std::thread::sleep(delay);
			delay = (delay * 2).min(Duration::from_secs(1));
		}
		let _method = self.method_lock.write();
		self.mapping.flush()?;
		let (anchor, header_before) = {
			let header = self.header.read();
			(header.fsiz, header.encode())
		};
		self.wal.begin(anchor, &header_before)?;
		let mut header = self.header.write();
		header.flags &= !header::FLAG_OPEN;
		let cleared = header.encode();
		drop(header);
		self.mapping.write_at(0, &cleared)?;
		let mut header = self.header.write();
		header.flags |= header::FLAG_OPEN;
		let restored = header.encode();
		drop(header);
		self.mapping.write_at(0, &restored)?;
		Ok(())
	}

	/// `trancommit` — spec §4.D.7.
	pub fn trancommit(&self) -> Result<()> {
		self.mapping.flush()?;
		self.wal.clear()?;
		self.tran_active.store(false, Ordering::Release);
		Ok(())
	}

	/// `tranabort` — spec §4.D.7: replays WAL entries in reverse,
	/// truncates to the begin-time anchor, and clears derived state.
	pub fn tranabort(&self) -> Result<()> {
		self.mapping.flush()?;
		let entries = self.wal.read_all()?;
		for entry in entries.into_iter().rev() {
			self.mapping.write_at(entry.offset, &entry.old_bytes)?;
		}
		let anchor = self.wal.anchor()?;
		self.mapping.truncate(anchor.max(1))?;
		let mut hdr_buf = [0u8; header::HEADER_SIZE];
		self.mapping.read_at(0, &mut hdr_buf)?;
		let restored = Header::decode(&hdr_buf)?;
		*self.header.write() = restored;
		let frec = self.header.read().frec;
		self.dfcur.store(frec, Ordering::Relaxed);
		self.iter_cursor.store(frec, Ordering::Relaxed);
		*self.fbp.lock() = FreeBlockPool::new(self.fpow);
		self.cache.vanish();
		self.wal.clear()?;
		self.tran_active.store(false, Ordering::Release);
		Ok(())
	}

	/// Flushes the FBP snapshot and clears `FOPEN`, consuming the
	/// handle (its `PathGuard` releases the process-wide path claim on
	/// drop).
	pub fn close(self) -> Result<()> {
		if self.writable {
			let fbp_offset = header::HEADER_SIZE as u64 + self.header.read().bnum * self.off_size as u64;
			let entries = self.fbp.lock().snapshot().to_vec();
			let mut region = Vec::new();
			region.extend_from_slice(&(entries.len() as u16).to_be_bytes());
			for e in &entries {
				region.extend_from_slice(&e.offset.to_be_bytes());
				region.extend_from_slice(&e.size.to_be_bytes());
			}
			self.mapping.write_at(fbp_offset, &region)?;
			let mut header = self.header.write();
			header.flags &= !header::FLAG_OPEN;
			let bytes = header.encode();
			drop(header);
			self.mapping.write_at(0, &bytes)?;
			self.mapping.flush()?;
		}
		if self.lock_mode != LockMode::NoLock {
			osio::unlock_file(self.mapping.file())?;
		}
		Ok(())
	}
}

fn align_up(value: u64, align: u64) -> u64 {
	if align <= 1 {
		return value;
	}
	(value + align - 1) / align * align
}

#[cfg(test)]
mod test {
	use super::*;

	fn temp_path(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join("hashkv-test-hdb");
		std::fs::create_dir_all(&dir).unwrap();
		dir.join(name)
	}

	fn small_opts() -> Options {
		Options { apow: 2, fpow: 3, opts: 0, bnum: 7, rcnum: 0, xmsiz: 1 << 20, dfunit: 0, lock_mode: LockMode::Blocking }
	}

	#[test]
	fn scenario_put_get_out() {
		let path = temp_path("scenario1.hdb");
		std::fs::remove_file(&path).ok();
		let db = Hdb::create(&path, small_opts()).unwrap();
		db.put(b"a", b"1", WriteMode::Over).unwrap();
		db.put(b"b", b"2", WriteMode::Over).unwrap();
		db.put(b"a", b"X", WriteMode::Over).unwrap();
		assert_eq!(db.get(b"a").unwrap(), Some(b"X".to_vec()));
		assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
		assert_eq!(db.rnum(), 2);
		assert!(db.out(b"a").unwrap());
		assert_eq!(db.get(b"a").unwrap(), None);
		assert_eq!(db.rnum(), 1);
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn scenario_bucket_collisions_iterate_all() {
		let path = temp_path("scenario2.hdb");
		std::fs::remove_file(&path).ok();
		let opts = Options { bnum: 3, ..small_opts() };
		let db = Hdb::create(&path, opts).unwrap();
		for i in 0..5 {
			let k = format!("k{}", i);
			let v = format!("v{}", i);
			db.put(k.as_bytes(), v.as_bytes(), WriteMode::Over).unwrap();
		}
		db.iterinit();
		let mut seen = std::collections::HashSet::new();
		while let Some(k) = db.iternext().unwrap() {
			seen.insert(k);
		}
		let expect: std::collections::HashSet<Vec<u8>> = (0..5).map(|i| format!("k{}", i).into_bytes()).collect();
		assert_eq!(seen, expect);
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn scenario_putcat_and_addint() {
		let path = temp_path("scenario3.hdb");
		std::fs::remove_file(&path).ok();
		let db = Hdb::create(&path, small_opts()).unwrap();
		db.put(b"x", b"AB", WriteMode::Cat).unwrap();
		db.put(b"x", b"CD", WriteMode::Cat).unwrap();
		assert_eq!(db.get(b"x").unwrap(), Some(b"ABCD".to_vec()));
		assert_eq!(db.add_int(b"n", 5).unwrap(), AddOutcome::Value(5));
		assert_eq!(db.add_int(b"n", 7).unwrap(), AddOutcome::Value(12));
		assert_eq!(db.get(b"n").unwrap(), Some(12i32.to_ne_bytes().to_vec()));
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn scenario_transaction_abort_and_commit() {
		let path = temp_path("scenario4.hdb");
		std::fs::remove_file(&path).ok();
		let db = Hdb::create(&path, small_opts()).unwrap();
		db.tranbegin().unwrap();
		db.put(b"p", b"old", WriteMode::Over).unwrap();
		db.put(b"p", b"new", WriteMode::Over).unwrap();
		db.tranabort().unwrap();
		assert_eq!(db.get(b"p").unwrap(), None);

		db.tranbegin().unwrap();
		db.put(b"p", b"old", WriteMode::Over).unwrap();
		db.put(b"p", b"new", WriteMode::Over).unwrap();
		db.trancommit().unwrap();
		assert_eq!(db.get(b"p").unwrap(), Some(b"new".to_vec()));
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn putkeep_fails_on_existing_and_preserves_value() {
		let path = temp_path("scenario_keep.hdb");
		std::fs::remove_file(&path).ok();
		let db = Hdb::create(&path, small_opts()).unwrap();
		db.put(b"k", b"v1", WriteMode::Keep).unwrap();
		assert!(matches!(db.put(b"k", b"v2", WriteMode::Keep), Err(Error::Keep)));
		assert_eq!(db.get(b"k").unwrap(), Some(b"v1".to_vec()));
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}

	#[test]
	fn defrag_to_completion_drops_free_blocks() {
		let path = temp_path("scenario_defrag.hdb");
		std::fs::remove_file(&path).ok();
		let db = Hdb::create(&path, small_opts()).unwrap();
		for i in 0..20 {
			let k = format!("key{}", i);
			db.put(k.as_bytes(), b"0123456789", WriteMode::Over).unwrap();
		}
		for i in 0..20 {
			if i % 2 == 0 {
				let k = format!("key{}", i);
				db.out(k.as_bytes()).unwrap();
			}
		}
		loop {
			let processed = db.defrag(Some(4)).unwrap();
			if processed == 0 {
				break;
			}
		}
		let frec = db.header.read().frec;
		let fsiz = db.fsiz();
		let mut off = frec;
		while off < fsiz {
			let mut magic = [0u8; 1];
			db.mapping.read_at(off, &mut magic).unwrap();
			assert_ne!(magic[0], record::MAGIC_FB);
			let (h, hlen) = db.read_record_header(off).unwrap();
			off += Hdb::record_total_len(&h, hlen);
		}
		assert_eq!(off, fsiz);
		db.close().unwrap();
		std::fs::remove_file(&path).ok();
	}
}
