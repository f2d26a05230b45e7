//! Integration tests for spec §8's six concrete scenarios, each driven
//! through the public crate API rather than any single module's
//! internals.

use hashkv::{hdb, Adb, Hdb, WriteMode};
use std::path::PathBuf;
use std::sync::Arc;

fn temp_path(name: &str) -> PathBuf {
	let dir = std::env::temp_dir().join("hashkv-test-scenarios");
	std::fs::create_dir_all(&dir).unwrap();
	let path = dir.join(name);
	std::fs::remove_file(&path).ok();
	path
}

fn small_opts() -> hdb::Options {
	hdb::Options { apow: 2, fpow: 3, opts: 0, bnum: 7, rcnum: 0, xmsiz: 1 << 20, dfunit: 0, lock_mode: hdb::LockMode::Blocking }
}

#[test]
fn scenario_1_put_overwrite_and_out() {
	let path = temp_path("scenario1.hdb");
	let db = Hdb::open(&path, true, true, true, small_opts()).unwrap();

	db.put(b"a", b"1", WriteMode::Over).unwrap();
	db.put(b"b", b"2", WriteMode::Over).unwrap();
	db.put(b"a", b"X", WriteMode::Over).unwrap();

	assert_eq!(db.get(b"a").unwrap(), Some(b"X".to_vec()));
	assert_eq!(db.get(b"b").unwrap(), Some(b"2".to_vec()));
	assert_eq!(db.rnum(), 2);

	assert!(db.out(b"a").unwrap());
	assert_eq!(db.get(b"a").unwrap(), None);
	assert_eq!(db.rnum(), 1);
}

#[test]
fn scenario_2_bucket_collisions_iterate_every_key_once() {
	let path = temp_path("scenario2.hdb");
	let mut opts = small_opts();
	opts.bnum = 3;
	let db = Hdb::open(&path, true, true, true, opts).unwrap();

	for i in 0..5u32 {
		db.put(format!("k{}", i).as_bytes(), format!("v{}", i).as_bytes(), WriteMode::Over).unwrap();
	}

	let mut seen = std::collections::HashSet::new();
	db.foreach(|k, _| {
		seen.insert(k.to_vec());
		true
	})
	.unwrap();

	let expected: std::collections::HashSet<Vec<u8>> = (0..5u32).map(|i| format!("k{}", i).into_bytes()).collect();
	assert_eq!(seen, expected);
}

#[test]
fn scenario_3_putcat_and_addint() {
	let path = temp_path("scenario3.hdb");
	let db = Hdb::open(&path, true, true, true, small_opts()).unwrap();

	db.put(b"x", b"AB", WriteMode::Over).unwrap();
	db.put(b"x", b"CD", WriteMode::Cat).unwrap();
	assert_eq!(db.get(b"x").unwrap(), Some(b"ABCD".to_vec()));

	use hashkv::AddOutcome;
	assert_eq!(db.add_int(b"n", 5).unwrap(), AddOutcome::Value(5));
	assert_eq!(db.add_int(b"n", 7).unwrap(), AddOutcome::Value(12));
	let stored = db.get(b"n").unwrap().unwrap();
	assert_eq!(i32::from_ne_bytes(stored[..4].try_into().unwrap()), 12);
}

#[test]
fn scenario_4_transaction_abort_and_commit() {
	let path = temp_path("scenario4.hdb");
	let db = Hdb::open(&path, true, true, true, small_opts()).unwrap();

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
}

#[test]
fn scenario_5_ulog_restore_reaches_same_key_set() {
	use hashkv::ulog::{Command, Op, Ulog};

	let log_dir = std::env::temp_dir().join("hashkv-test-scenarios").join("scenario5-ulog");
	std::fs::remove_dir_all(&log_dir).ok();

	let ulog = Ulog::open(&log_dir, 1 << 20, 1).unwrap();
	let adb_a = Adb::open("*").unwrap();
	ulog.log_and_apply(&adb_a, Command { op: Op::Put, key: b"k".to_vec(), value: b"v1".to_vec() }).unwrap();
	ulog.log_and_apply(&adb_a, Command { op: Op::Put, key: b"k".to_vec(), value: b"v2".to_vec() }).unwrap();
	ulog.log_and_apply(&adb_a, Command { op: Op::Out, key: b"k".to_vec(), value: vec![] }).unwrap();

	let adb_b = Adb::open("*").unwrap();
	Ulog::restore(&adb_b, &log_dir, 0, true).unwrap();

	assert_eq!(adb_b.get(b"k").unwrap(), None);
	assert_eq!(adb_b.rnum(), 0);
}

#[test]
fn scenario_6_server_and_rdb_round_trip() {
	use hashkv::{server, Rdb};

	let adb = Arc::new(Adb::open("*").unwrap());
	let mut srv = server::start("127.0.0.1", 19780, adb, Some(2)).unwrap();

	let rdb = Rdb::new();
	rdb.open("127.0.0.1", 19780).unwrap();

	rdb.put(b"foo", b"bar").unwrap();
	assert_eq!(rdb.get(b"foo").unwrap(), Some(b"bar".to_vec()));
	assert_eq!(rdb.vsiz(b"foo").unwrap(), Some(3));

	assert!(rdb.out(b"foo").unwrap());
	assert_eq!(rdb.get(b"foo").unwrap(), None);

	rdb.close();
	srv.kill();
}
