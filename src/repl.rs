//! Component G: replication client (spec §4.G). Connects to a server's
//! replication port, performs the handshake, and streams logged records
//! forward for the caller to redo against a local `Adb`/`Ulog`.

use crate::error::{Error, Result};
use log::{debug, warn};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const MAGIC_REPL: u8 = 0xC8;
pub const CMD_REPL: u8 = 0xA0;
pub const MAGIC_NOP: u8 = 0xCA;

const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// One streamed record from the replication feed (spec §4.G, same wire
/// shape as `ulog::Record` minus the per-server `mid` width).
#[derive(Debug, Clone)]
pub struct Streamed {
	pub ts: u64,
	pub sid: u32,
	pub body: Vec<u8>,
}

/// A connected replication session. `next()` yields records in order,
/// transparently skipping NOP keep-alives, until the socket errors or
/// the 60-second per-read lifetime elapses without data.
pub struct ReplClient {
	stream: TcpStream,
	mid: u32,
}

impl ReplClient {
	/// Connects to `addr` and performs the handshake: sends
	/// `magic(0xC8) | cmd(0xA0) | ts(64 BE) | sid(32 BE)`, expects back a
	/// `mid(32 BE)` that must be `>= 1` (0 signals the server refused to
	/// admit this replica, e.g. `sid` collision).
	pub fn connect(addr: &str, ts: u64, sid: u32) -> Result<ReplClient> {
		let mut stream = TcpStream::connect(addr)?;
		stream.set_nodelay(true).ok();
		stream.set_read_timeout(Some(READ_TIMEOUT))?;

		let mut req = Vec::with_capacity(14);
		req.push(MAGIC_REPL);
		req.push(CMD_REPL);
		req.extend_from_slice(&ts.to_be_bytes());
		req.extend_from_slice(&sid.to_be_bytes());
		stream.write_all(&req)?;

		let mut mid_buf = [0u8; 4];
		stream.read_exact(&mut mid_buf)?;
		let mid = u32::from_be_bytes(mid_buf);
		if mid == 0 {
			return Err(Error::Invalid(format!("replication handshake refused for sid {}", sid)));
		}
		debug!("repl: connected to {} as sid {} mid {}", addr, sid, mid);
		Ok(ReplClient { stream, mid })
	}

	pub fn mid(&self) -> u32 {
		self.mid
	}

	/// Reads the next frame: `magic | ts(64) | sid(32) | size(32) |
	/// body`. A `NOP` (0xCA) magic carries no further payload and is
	/// surfaced as `Ok(None)` so the caller can loop without treating it
	/// as a stream record.
	pub fn next(&mut self) -> Result<Option<Streamed>> {
		let mut magic = [0u8; 1];
		self.stream.read_exact(&mut magic)?;
		match magic[0] {
			MAGIC_NOP => Ok(None),
			MAGIC_REPL => {
				let mut head = [0u8; 8 + 4 + 4];
				self.stream.read_exact(&mut head)?;
				let ts = u64::from_be_bytes(head[0..8].try_into().unwrap());
				let sid = u32::from_be_bytes(head[8..12].try_into().unwrap());
				let size = u32::from_be_bytes(head[12..16].try_into().unwrap()) as usize;
				let mut body = vec![0u8; size];
				self.stream.read_exact(&mut body)?;
				Ok(Some(Streamed { ts, sid, body }))
			}
			other => Err(Error::Corruption(format!("unexpected replication frame magic {:#x}", other))),
		}
	}

	/// Runs `next()` in a loop, invoking `on_record` for every real
	/// frame, until `on_record` returns `false` or `cancel` is set.
	/// Socket read-timeout errors are treated as idle ticks, not fatal,
	/// so the caller can check `cancel` periodically.
	pub fn run<F: FnMut(Streamed) -> bool>(&mut self, cancel: &AtomicBool, mut on_record: F) -> Result<()> {
		while !cancel.load(Ordering::Relaxed) {
			match self.next() {
				Ok(Some(record)) => {
					if !on_record(record) {
						break;
					}
				}
				Ok(None) => continue,
				Err(Error::Io(e)) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
					continue;
				}
				Err(e) => {
					warn!("repl: stream error: {}", e);
					return Err(e);
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::net::TcpListener;
	use std::thread;

	#[test]
	fn handshake_rejects_non_magic_response() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let handle = thread::spawn(move || {
			let (mut sock, _) = listener.accept().unwrap();
			let mut req = [0u8; 14];
			sock.read_exact(&mut req).unwrap();
			sock.write_all(&0u32.to_be_bytes()).unwrap();
		});
		let result = ReplClient::connect(&addr.to_string(), 0, 7);
		assert!(result.is_err());
		handle.join().unwrap();
	}

	#[test]
	fn handshake_and_single_record_round_trip() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let handle = thread::spawn(move || {
			let (mut sock, _) = listener.accept().unwrap();
			let mut req = [0u8; 14];
			sock.read_exact(&mut req).unwrap();
			sock.write_all(&9u32.to_be_bytes()).unwrap();

			let mut frame = vec![MAGIC_REPL];
			frame.extend_from_slice(&42u64.to_be_bytes());
			frame.extend_from_slice(&9u32.to_be_bytes());
			frame.extend_from_slice(&3u32.to_be_bytes());
			frame.extend_from_slice(b"abc");
			sock.write_all(&frame).unwrap();
		});
		let mut client = ReplClient::connect(&addr.to_string(), 0, 9).unwrap();
		assert_eq!(client.mid(), 9);
		let record = client.next().unwrap().unwrap();
		assert_eq!(record.ts, 42);
		assert_eq!(record.body, b"abc");
		handle.join().unwrap();
	}

	#[test]
	fn nop_frame_yields_none_without_consuming_body() {
		let listener = TcpListener::bind("127.0.0.1:0").unwrap();
		let addr = listener.local_addr().unwrap();
		let handle = thread::spawn(move || {
			let (mut sock, _) = listener.accept().unwrap();
			let mut req = [0u8; 14];
			sock.read_exact(&mut req).unwrap();
			sock.write_all(&1u32.to_be_bytes()).unwrap();
			sock.write_all(&[MAGIC_NOP]).unwrap();
		});
		let mut client = ReplClient::connect(&addr.to_string(), 0, 1).unwrap();
		assert!(client.next().unwrap().is_none());
		handle.join().unwrap();
	}
}
