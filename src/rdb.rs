//! Component I: remote database client (spec §4.I). A thin wire-level
//! counterpart to `Adb`, talking the same one-byte command protocol
//! `server` speaks. `tune` must be called before `open`; with `RECON`
//! set, any I/O error triggers exactly one reconnect attempt after a
//! 100ms sleep before the call is reported as failed.

use crate::error::{Error, Result};
use crate::mode::AddOutcome;
use crate::server::wire;
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

/// `RDB::tune` options bit (spec §4.I): automatic single reconnect on
/// I/O error.
pub const OPT_RECON: u32 = 1;

struct Conn {
	stream: TcpStream,
	host: String,
	port: u16,
}

/// Remote client handle. Reconnection replaces the inner stream under a
/// mutex so the handle itself stays `&self`-callable like `Adb`.
pub struct Rdb {
	conn: Mutex<Option<Conn>>,
	timeout: Duration,
	opts: u32,
}

impl Rdb {
	pub fn new() -> Rdb {
		Rdb { conn: Mutex::new(None), timeout: Duration::from_secs(10), opts: 0 }
	}

	/// Sets the per-call I/O timeout and option bits; must precede `open`.
	pub fn tune(&mut self, timeout: Duration, opts: u32) {
		self.timeout = timeout;
		self.opts = opts;
	}

	pub fn open(&self, host: &str, port: u16) -> Result<()> {
		let stream = connect(host, port, self.timeout)?;
		*self.conn.lock().unwrap() = Some(Conn { stream, host: host.to_string(), port });
		Ok(())
	}

	pub fn close(&self) {
		*self.conn.lock().unwrap() = None;
	}

	fn with_conn<F, T>(&self, f: F) -> Result<T>
	where
		F: Fn(&mut TcpStream) -> Result<T>,
	{
		let mut guard = self.conn.lock().unwrap();
		let conn = guard.as_mut().ok_or_else(|| Error::Invalid("rdb not open".into()))?;
		match f(&mut conn.stream) {
			Ok(v) => Ok(v),
			Err(e) if self.opts & OPT_RECON != 0 && is_io_error(&e) => {
				warn!("rdb: call failed ({}), reconnecting once", e);
				std::thread::sleep(Duration::from_millis(100));
				let (host, port) = (conn.host.clone(), conn.port);
				let new_stream = connect(&host, port, self.timeout)?;
				conn.stream = new_stream;
				f(&mut conn.stream)
			}
			Err(e) => Err(e),
		}
	}

	pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.with_conn(|s| send_put(s, wire::PUT, key, value))
	}

	pub fn putkeep(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.with_conn(|s| send_put(s, wire::PUTKEEP, key, value))
	}

	pub fn putcat(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.with_conn(|s| send_put(s, wire::PUTCAT, key, value))
	}

	/// Fire-and-forget put: no response is read back.
	pub fn putnr(&self, key: &[u8], value: &[u8]) -> Result<()> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::PUTNR];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(&(value.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			req.extend_from_slice(value);
			s.write_all(&req)?;
			Ok(())
		})
	}

	pub fn out(&self, key: &[u8]) -> Result<bool> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::OUT];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			s.write_all(&req)?;
			Ok(read_status(s)?.is_ok())
		})
	}

	pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::GET];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			s.write_all(&req)?;
			match read_status(s) {
				Ok(()) => Ok(Some(read_blob(s)?)),
				Err(_) => Ok(None),
			}
		})
	}

	/// `get3`: same as `get` but distinguishes "no such key" from a
	/// transport/protocol error instead of folding both into `None`.
	pub fn get3(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::GET];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			s.write_all(&req)?;
			let mut status = [0u8; 1];
			s.read_exact(&mut status)?;
			match status[0] {
				wire::SUCCESS => Ok(Some(read_blob(s)?)),
				wire::ERROR => {
					let mut code = [0u8; 1];
					s.read_exact(&mut code)?;
					Ok(None)
				}
				other => Err(Error::Corruption(format!("bad response status {:#x}", other))),
			}
		})
	}

	pub fn vsiz(&self, key: &[u8]) -> Result<Option<usize>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::VSIZ];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			s.write_all(&req)?;
			match read_status(s) {
				Ok(()) => Ok(Some(wire::read_u32(s)? as usize)),
				Err(_) => Ok(None),
			}
		})
	}

	pub fn iterinit(&self) -> Result<()> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::ITERINIT])?;
			read_status(s)
		})
	}

	pub fn iternext(&self) -> Result<Option<Vec<u8>>> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::ITERNEXT])?;
			match read_status(s) {
				Ok(()) => Ok(Some(read_blob(s)?)),
				Err(_) => Ok(None),
			}
		})
	}

	pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::FWMKEYS];
			req.extend_from_slice(&(prefix.len() as u32).to_be_bytes());
			req.extend_from_slice(prefix);
			req.extend_from_slice(&(max.map(|m| m as i32).unwrap_or(-1)).to_be_bytes());
			s.write_all(&req)?;
			read_status(s)?;
			let n = wire::read_u32(s)? as usize;
			(0..n).map(|_| read_blob(s)).collect()
		})
	}

	pub fn addint(&self, key: &[u8], delta: i64) -> Result<AddOutcome<i64>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::ADDINT];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			req.extend_from_slice(&(delta as i32).to_be_bytes());
			s.write_all(&req)?;
			match read_status(s) {
				Ok(()) => Ok(AddOutcome::Value(wire::read_i32(s)? as i64)),
				Err(_) => Ok(AddOutcome::Mismatch),
			}
		})
	}

	pub fn adddouble(&self, key: &[u8], delta: f64) -> Result<AddOutcome<f64>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::ADDDOUBLE];
			req.extend_from_slice(&(key.len() as u32).to_be_bytes());
			req.extend_from_slice(key);
			req.extend_from_slice(&delta.to_be_bytes());
			s.write_all(&req)?;
			match read_status(s) {
				Ok(()) => Ok(AddOutcome::Value(wire::read_f64(s)?)),
				Err(_) => Ok(AddOutcome::Mismatch),
			}
		})
	}

	pub fn vanish(&self) -> Result<()> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::VANISH])?;
			read_status(s)
		})
	}

	/// `restore(path, ts, consistencyCheck)` asks the remote to replay
	/// its update log from `ts`, mirroring `ulog::Ulog::restore` but
	/// driven by the server rather than run in-process.
	pub fn restore(&self, path: &str, ts: u64, consistency_check: bool) -> Result<()> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::RESTORE];
			req.extend_from_slice(&(path.len() as u32).to_be_bytes());
			req.extend_from_slice(path.as_bytes());
			req.extend_from_slice(&ts.to_be_bytes());
			req.push(consistency_check as u8);
			s.write_all(&req)?;
			read_status(s)
		})
	}

	/// Designates the master replica a slave should stream from, at the
	/// given master timestamp (spec §4.I `setmst`).
	pub fn setmst(&self, host: &str, port: u16, ts: u64) -> Result<()> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::SETMST];
			req.extend_from_slice(&(host.len() as u32).to_be_bytes());
			req.extend_from_slice(host.as_bytes());
			req.extend_from_slice(&(port as u32).to_be_bytes());
			req.extend_from_slice(&ts.to_be_bytes());
			s.write_all(&req)?;
			read_status(s)
		})
	}

	pub fn rnum(&self) -> Result<u64> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::RNUM])?;
			read_status(s)?;
			let mut b = [0u8; 8];
			s.read_exact(&mut b)?;
			Ok(u64::from_be_bytes(b))
		})
	}

	pub fn size(&self) -> Result<u64> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::SIZE])?;
			read_status(s)?;
			let mut b = [0u8; 8];
			s.read_exact(&mut b)?;
			Ok(u64::from_be_bytes(b))
		})
	}

	pub fn stat(&self) -> Result<String> {
		self.with_conn(|s| {
			s.write_all(&[wire::MAGIC, wire::STAT])?;
			read_status(s)?;
			let blob = read_blob(s)?;
			String::from_utf8(blob).map_err(|_| Error::Corruption("non-utf8 stat response".into()))
		})
	}

	pub fn misc(&self, name: &str, args: &[Vec<u8>]) -> Result<Vec<Vec<u8>>> {
		self.with_conn(|s| {
			let mut req = vec![wire::MAGIC, wire::MISC];
			req.extend_from_slice(&(name.len() as u32).to_be_bytes());
			req.extend_from_slice(name.as_bytes());
			req.extend_from_slice(&(args.len() as u32).to_be_bytes());
			for a in args {
				req.extend_from_slice(&(a.len() as u32).to_be_bytes());
				req.extend_from_slice(a);
			}
			s.write_all(&req)?;
			read_status(s)?;
			let n = wire::read_u32(s)? as usize;
			(0..n).map(|_| read_blob(s)).collect()
		})
	}
}

impl Default for Rdb {
	fn default() -> Rdb {
		Rdb::new()
	}
}

fn connect(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
	let stream = TcpStream::connect((host, port))?;
	stream.set_nodelay(true).ok();
	stream.set_read_timeout(Some(timeout))?;
	stream.set_write_timeout(Some(timeout))?;
	debug!("rdb: connected to {}:{}", host, port);
	Ok(stream)
}

fn is_io_error(e: &Error) -> bool {
	matches!(e, Error::Io(_))
}

fn send_put(s: &mut TcpStream, cmd: u8, key: &[u8], value: &[u8]) -> Result<()> {
	let mut req = vec![wire::MAGIC, cmd];
	req.extend_from_slice(&(key.len() as u32).to_be_bytes());
	req.extend_from_slice(&(value.len() as u32).to_be_bytes());
	req.extend_from_slice(key);
	req.extend_from_slice(value);
	s.write_all(&req)?;
	read_status(s)
}

fn read_status(s: &mut TcpStream) -> Result<()> {
	let mut status = [0u8; 1];
	s.read_exact(&mut status)?;
	match status[0] {
		wire::SUCCESS => Ok(()),
		wire::ERROR => {
			let mut code = [0u8; 1];
			s.read_exact(&mut code)?;
			Err(Error::NoRecord)
		}
		other => Err(Error::Corruption(format!("bad response status {:#x}", other))),
	}
}

fn read_blob(s: &mut TcpStream) -> Result<Vec<u8>> {
	let size = wire::read_u32(s)? as usize;
	let mut buf = vec![0u8; size];
	s.read_exact(&mut buf)?;
	Ok(buf)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::adb::Adb;
	use std::sync::Arc;

	#[test]
	fn put_get_round_trip_against_local_server() {
		let adb = Arc::new(Adb::open("*").unwrap());
		let mut server = crate::server::start("127.0.0.1", 18900, adb, Some(2)).unwrap();

		let rdb = Rdb::new();
		rdb.open("127.0.0.1", 18900).unwrap();
		rdb.put(b"k", b"v").unwrap();
		assert_eq!(rdb.get(b"k").unwrap(), Some(b"v".to_vec()));
		assert_eq!(rdb.rnum().unwrap(), 1);
		rdb.close();

		server.kill();
	}

	#[test]
	fn get_of_missing_key_is_none_not_error() {
		let adb = Arc::new(Adb::open("*").unwrap());
		let mut server = crate::server::start("127.0.0.1", 18901, adb, Some(2)).unwrap();

		let rdb = Rdb::new();
		rdb.open("127.0.0.1", 18901).unwrap();
		assert_eq!(rdb.get(b"missing").unwrap(), None);
		rdb.close();

		server.kill();
	}
}
