//! Component H: TCP/UNIX front-end (spec §4.H). A single reactor thread
//! multiplexes connection readiness with `epoll` (edge-triggered,
//! one-shot per connection); a fixed worker pool drains a shared queue
//! of ready file descriptors and runs the one-byte wire protocol
//! dispatch against an `Adb`. Timer threads run periodic housekeeping
//! (`sync`) and a watchdog detects workers stuck past their deadline
//! and replaces them without attempting unsound thread cancellation.

pub mod wire;

use crate::adb::Adb;
use crate::error::{Error, Result};
use crate::mode::WriteMode;
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEFAULT_WORKERS: usize = 5;
const MAX_TIMERS: usize = 8;
const WATCHDOG_DEADLINE: Duration = Duration::from_secs(30);
const WATCHDOG_POLL: Duration = Duration::from_secs(5);

enum Conn {
	Tcp(TcpStream),
	Unix(UnixStream),
}

impl Conn {
	fn as_raw_fd(&self) -> RawFd {
		match self {
			Conn::Tcp(s) => s.as_raw_fd(),
			Conn::Unix(s) => s.as_raw_fd(),
		}
	}
}

impl Read for Conn {
	fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
		match self {
			Conn::Tcp(s) => s.read(buf),
			Conn::Unix(s) => s.read(buf),
		}
	}
}

impl Write for Conn {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		match self {
			Conn::Tcp(s) => s.write(buf),
			Conn::Unix(s) => s.write(buf),
		}
	}
	fn flush(&mut self) -> std::io::Result<()> {
		match self {
			Conn::Tcp(s) => s.flush(),
			Conn::Unix(s) => s.flush(),
		}
	}
}

enum Listener {
	Tcp(TcpListener),
	Unix(UnixListener),
}

impl Listener {
	fn as_raw_fd(&self) -> RawFd {
		match self {
			Listener::Tcp(l) => l.as_raw_fd(),
			Listener::Unix(l) => l.as_raw_fd(),
		}
	}

}

fn epoll_event(fd: RawFd, flags: i32) -> libc::epoll_event {
	let mut ev: libc::epoll_event = unsafe { std::mem::zeroed() };
	ev.events = flags as u32;
	ev.u64 = fd as u64;
	ev
}

fn epoll_add(epoll_fd: RawFd, fd: RawFd, flags: i32) -> Result<()> {
	let mut ev = epoll_event(fd, flags);
	let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
	if rc < 0 {
		return Err(Error::from(std::io::Error::last_os_error()));
	}
	Ok(())
}

fn epoll_mod(epoll_fd: RawFd, fd: RawFd, flags: i32) -> Result<()> {
	let mut ev = epoll_event(fd, flags);
	let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
	if rc < 0 {
		return Err(Error::from(std::io::Error::last_os_error()));
	}
	Ok(())
}

fn epoll_del(epoll_fd: RawFd, fd: RawFd) {
	unsafe {
		libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
	}
}

fn set_nonblocking(fd: RawFd) {
	unsafe {
		let flags = libc::fcntl(fd, libc::F_GETFL, 0);
		libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
	}
}

struct Shared {
	conns: Mutex<HashMap<RawFd, Conn>>,
	queue: Mutex<VecDeque<RawFd>>,
	cond: Condvar,
	epoll_fd: RawFd,
	terminate: AtomicBool,
	adb: Arc<Adb>,
	is_unix: bool,
}

struct WorkerSlot {
	heartbeat: Arc<AtomicU64>,
	handle: Option<JoinHandle<()>>,
}

/// A running server instance. Drop does not implicitly stop it — call
/// [`Server::kill`] explicitly, matching the teacher's explicit-close
/// style for `Hdb`/`Ulog`.
pub struct Server {
	shared: Arc<Shared>,
	listen_fd: RawFd,
	unix_path: Option<PathBuf>,
	_listener: Listener,
	reactor: Option<JoinHandle<()>>,
	workers: Arc<Mutex<Vec<WorkerSlot>>>,
	timers: Vec<JoinHandle<()>>,
	watchdog: Option<JoinHandle<()>>,
	wake_fd: RawFd,
}

/// `port < 1` selects a UNIX domain stream socket at `bind_addr`
/// instead of an IPv4 TCP listener (spec §4.H).
pub fn start(bind_addr: &str, port: i32, adb: Arc<Adb>, worker_count: Option<usize>) -> Result<Server> {
	let listener = if port < 1 {
		std::fs::remove_file(bind_addr).ok();
		Listener::Unix(UnixListener::bind(bind_addr)?)
	} else {
		let listener = TcpListener::bind(format!("{}:{}", bind_addr, port))?;
		Listener::Tcp(listener)
	};
	let listen_fd = listener.as_raw_fd();
	set_nonblocking(listen_fd);

	let epoll_fd = unsafe { libc::epoll_create1(0) };
	if epoll_fd < 0 {
		return Err(Error::from(std::io::Error::last_os_error()));
	}
	epoll_add(epoll_fd, listen_fd, libc::EPOLLIN | libc::EPOLLET)?;

	let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
	if wake_fd < 0 {
		return Err(Error::from(std::io::Error::last_os_error()));
	}
	epoll_add(epoll_fd, wake_fd, libc::EPOLLIN)?;

	let is_unix = matches!(listener, Listener::Unix(_));
	let shared = Arc::new(Shared {
		conns: Mutex::new(HashMap::new()),
		queue: Mutex::new(VecDeque::new()),
		cond: Condvar::new(),
		epoll_fd,
		terminate: AtomicBool::new(false),
		adb,
		is_unix,
	});

	let reactor = {
		let shared = shared.clone();
		std::thread::spawn(move || reactor_loop(shared, listen_fd, wake_fd))
	};

	let worker_count = worker_count.unwrap_or(DEFAULT_WORKERS);
	let mut initial = Vec::with_capacity(worker_count);
	for id in 0..worker_count {
		initial.push(spawn_worker(id, shared.clone()));
	}
	let workers = Arc::new(Mutex::new(initial));

	let timers = (0..1.min(MAX_TIMERS))
		.map(|_| {
			let shared = shared.clone();
			std::thread::spawn(move || timer_loop(shared))
		})
		.collect();

	let unix_path = if port < 1 { Some(PathBuf::from(bind_addr)) } else { None };

	let watchdog = {
		let shared = shared.clone();
		let workers = workers.clone();
		Some(std::thread::spawn(move || watchdog_loop(shared, workers)))
	};

	let server = Server {
		shared,
		listen_fd,
		unix_path,
		_listener: listener,
		reactor: Some(reactor),
		workers,
		timers,
		watchdog,
		wake_fd,
	};
	info!("server: listening on {}{}", bind_addr, if port >= 1 { format!(":{}", port) } else { String::new() });
	Ok(server)
}

fn spawn_worker(id: usize, shared: Arc<Shared>) -> WorkerSlot {
	let heartbeat = Arc::new(AtomicU64::new(now_millis()));
	let hb = heartbeat.clone();
	let handle = std::thread::spawn(move || worker_loop(id, shared, hb));
	WorkerSlot { heartbeat, handle: Some(handle) }
}

fn now_millis() -> u64 {
	Instant::now().elapsed().as_millis() as u64
}

/// Cooperative watchdog: no worker can be forcibly cancelled (there is
/// no sound `pthread_cancel` equivalent in safe Rust), so a stuck
/// worker's `JoinHandle` is simply detached — dropped without joining —
/// and a fresh worker takes its slot. The old thread, if it ever wakes
/// from whatever blocked it, exits on its next deadline check since its
/// id no longer has a live slot pointing back at it.
fn watchdog_loop(shared: Arc<Shared>, workers: Arc<Mutex<Vec<WorkerSlot>>>) {
	loop {
		std::thread::sleep(WATCHDOG_POLL);
		if shared.terminate.load(Ordering::Relaxed) {
			return;
		}
		let now = now_millis();
		let mut guard = workers.lock();
		for (id, slot) in guard.iter_mut().enumerate() {
			let age = now.saturating_sub(slot.heartbeat.load(Ordering::Relaxed));
			if age > WATCHDOG_DEADLINE.as_millis() as u64 {
				warn!("server: worker {} stuck for {}ms, detaching and replacing", id, age);
				if let Some(handle) = slot.handle.take() {
					drop(handle);
				}
				*slot = spawn_worker(id, shared.clone());
			}
		}
	}
}

fn timer_loop(shared: Arc<Shared>) {
	let lock = Mutex::new(());
	loop {
		let mut guard = lock.lock();
		let timed_out = shared.cond.wait_for(&mut guard, Duration::from_secs(10)).timed_out();
		if shared.terminate.load(Ordering::Relaxed) {
			return;
		}
		if timed_out {
			if let Err(e) = shared.adb.sync() {
				warn!("server: periodic sync failed: {}", e);
			}
		}
	}
}

fn reactor_loop(shared: Arc<Shared>, listen_fd: RawFd, wake_fd: RawFd) {
	const MAX_EVENTS: usize = 64;
	let mut events: Vec<libc::epoll_event> = (0..MAX_EVENTS).map(|_| unsafe { std::mem::zeroed() }).collect();
	loop {
		if shared.terminate.load(Ordering::Relaxed) {
			return;
		}
		let n = unsafe { libc::epoll_wait(shared.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, 1000) };
		if n < 0 {
			let err = std::io::Error::last_os_error();
			if err.kind() == std::io::ErrorKind::Interrupted {
				continue;
			}
			error!("server: epoll_wait failed: {}", err);
			return;
		}
		for ev in events.iter().take(n as usize) {
			let fd = ev.u64 as RawFd;
			if fd == listen_fd {
				accept_ready(&shared, listen_fd);
			} else if fd == wake_fd {
				let mut buf = [0u8; 8];
				unsafe {
					libc::read(wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
				}
			} else {
				shared.queue.lock().push_back(fd);
				shared.cond.notify_one();
			}
		}
	}
}

fn accept_ready(shared: &Arc<Shared>, listen_fd: RawFd) {
	loop {
		let fd = unsafe { libc::accept4(listen_fd, std::ptr::null_mut(), std::ptr::null_mut(), libc::SOCK_NONBLOCK) };
		if fd < 0 {
			break;
		}
		let conn = unsafe {
			use std::os::unix::io::FromRawFd;
			if shared.is_unix {
				Conn::Unix(UnixStream::from_raw_fd(fd))
			} else {
				Conn::Tcp(TcpStream::from_raw_fd(fd))
			}
		};
		if epoll_add(shared.epoll_fd, fd, libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT).is_err() {
			continue;
		}
		shared.conns.lock().insert(fd, conn);
	}
}

fn worker_loop(id: usize, shared: Arc<Shared>, heartbeat: Arc<AtomicU64>) {
	loop {
		heartbeat.store(now_millis(), Ordering::Relaxed);
		if shared.terminate.load(Ordering::Relaxed) {
			debug!("server: worker {} exiting", id);
			return;
		}
		let fd = {
			let mut queue = shared.queue.lock();
			loop {
				if let Some(fd) = queue.pop_front() {
					break Some(fd);
				}
				if shared.terminate.load(Ordering::Relaxed) {
					break None;
				}
				shared.cond.wait_for(&mut queue, Duration::from_millis(500));
			}
		};
		let fd = match fd {
			Some(fd) => fd,
			None => continue,
		};
		heartbeat.store(now_millis(), Ordering::Relaxed);
		handle_ready_fd(&shared, fd);
	}
}

fn handle_ready_fd(shared: &Arc<Shared>, fd: RawFd) {
	let mut conn = match shared.conns.lock().remove(&fd) {
		Some(c) => c,
		None => return,
	};
	match dispatch_one(&mut conn, &shared.adb) {
		Ok(true) => {
			shared.conns.lock().insert(fd, conn);
			if epoll_mod(shared.epoll_fd, fd, libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT).is_err() {
				close_conn(shared, fd);
			}
		}
		Ok(false) | Err(_) => close_conn(shared, fd),
	}
}

fn close_conn(shared: &Arc<Shared>, fd: RawFd) {
	epoll_del(shared.epoll_fd, fd);
	unsafe {
		libc::close(fd);
	}
}

/// Reads and handles exactly one wire command from `conn`; returns
/// `Ok(false)` on clean EOF (client closed) so the caller drops the
/// connection instead of re-arming it.
fn dispatch_one(conn: &mut Conn, adb: &Arc<Adb>) -> Result<bool> {
	let mut magic = [0u8; 1];
	match conn.read(&mut magic) {
		Ok(0) => return Ok(false),
		Ok(_) => {}
		Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
		Err(e) => return Err(Error::from(e)),
	}
	if magic[0] != wire::MAGIC {
		return Err(Error::Corruption(format!("bad request magic {:#x}", magic[0])));
	}
	let mut cmd_buf = [0u8; 1];
	conn.read_exact(&mut cmd_buf)?;
	let cmd = cmd_buf[0];

	match cmd {
		wire::PUT | wire::PUTKEEP | wire::PUTCAT | wire::PUTNR => {
			let ksiz = wire::read_u32(conn)? as usize;
			let vsiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			let value = wire::read_blob(conn, vsiz)?;
			let mode = match cmd {
				wire::PUT | wire::PUTNR => WriteMode::Over,
				wire::PUTKEEP => WriteMode::Keep,
				_ => WriteMode::Cat,
			};
			let result = adb.put(&key, &value, mode);
			if cmd != wire::PUTNR {
				wire::write_status(conn, &result)?;
			}
		}
		wire::OUT => {
			let ksiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			let result = adb.out(&key).and_then(|found| if found { Ok(()) } else { Err(Error::NoRecord) });
			wire::write_status(conn, &result)?;
		}
		wire::GET => {
			let ksiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			match adb.get(&key)? {
				Some(v) => {
					conn.write_all(&[wire::SUCCESS])?;
					wire::write_blob(conn, &v)?;
				}
				None => conn.write_all(&[wire::ERROR, 1])?,
			}
		}
		wire::VSIZ => {
			let ksiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			match adb.vsiz(&key)? {
				Some(size) => {
					conn.write_all(&[wire::SUCCESS])?;
					wire::write_u32(conn, size as u32)?;
				}
				None => conn.write_all(&[wire::ERROR, 1])?,
			}
		}
		wire::ITERINIT => {
			let result = adb.iterinit();
			wire::write_status(conn, &result)?;
		}
		wire::FWMKEYS => {
			let psiz = wire::read_u32(conn)? as usize;
			let prefix = wire::read_blob(conn, psiz)?;
			let max = wire::read_i32(conn)?;
			let keys = adb.fwmkeys(&prefix, if max < 0 { None } else { Some(max as usize) })?;
			conn.write_all(&[wire::SUCCESS])?;
			wire::write_u32(conn, keys.len() as u32)?;
			for key in keys {
				wire::write_blob(conn, &key)?;
			}
		}
		wire::ADDINT => {
			let ksiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			let delta = wire::read_i32(conn)? as i64;
			match adb.add_int(&key, delta)? {
				crate::mode::AddOutcome::Value(v) => {
					conn.write_all(&[wire::SUCCESS])?;
					wire::write_u32(conn, v as i32 as u32)?;
				}
				crate::mode::AddOutcome::Mismatch => conn.write_all(&[wire::ERROR, 1])?,
			}
		}
		wire::ADDDOUBLE => {
			let ksiz = wire::read_u32(conn)? as usize;
			let key = wire::read_blob(conn, ksiz)?;
			let delta = wire::read_f64(conn)?;
			match adb.add_double(&key, delta)? {
				crate::mode::AddOutcome::Value(v) => {
					conn.write_all(&[wire::SUCCESS])?;
					conn.write_all(&v.to_be_bytes())?;
				}
				crate::mode::AddOutcome::Mismatch => conn.write_all(&[wire::ERROR, 1])?,
			}
		}
		wire::VANISH => {
			let result = adb.vanish();
			wire::write_status(conn, &result)?;
		}
		wire::RNUM => {
			conn.write_all(&[wire::SUCCESS])?;
			conn.write_all(&adb.rnum().to_be_bytes())?;
		}
		wire::SIZE => {
			conn.write_all(&[wire::SUCCESS])?;
			conn.write_all(&adb.size().to_be_bytes())?;
		}
		wire::STAT => {
			let stat = format!("rnum\t{}\nsize\t{}\n", adb.rnum(), adb.size());
			conn.write_all(&[wire::SUCCESS])?;
			wire::write_blob(conn, stat.as_bytes())?;
		}
		wire::MISC => {
			let nsiz = wire::read_u32(conn)? as usize;
			let name = String::from_utf8(wire::read_blob(conn, nsiz)?).map_err(|_| Error::Corruption("non-utf8 misc name".into()))?;
			let argc = wire::read_u32(conn)? as usize;
			let mut args = Vec::with_capacity(argc);
			for _ in 0..argc {
				let siz = wire::read_u32(conn)? as usize;
				args.push(wire::read_blob(conn, siz)?);
			}
			match adb.misc(&name, &args) {
				Ok(results) => {
					conn.write_all(&[wire::SUCCESS])?;
					wire::write_u32(conn, results.len() as u32)?;
					for r in results {
						wire::write_blob(conn, &r)?;
					}
				}
				Err(_) => conn.write_all(&[wire::ERROR, 1])?,
			}
		}
		other => return Err(wire::err_unknown_command(other)),
	}
	Ok(true)
}

impl Server {
	/// Signals shutdown: sets the termination flag, wakes the reactor
	/// via the eventfd, broadcasts the worker condvar, joins every
	/// thread, and closes the listening socket (unlinking it if it was
	/// a UNIX domain path).
	pub fn kill(&mut self) {
		self.shared.terminate.store(true, Ordering::SeqCst);
		let one: u64 = 1;
		unsafe {
			libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
		}
		self.shared.cond.notify_all();

		if let Some(h) = self.reactor.take() {
			h.join().ok();
		}
		for slot in self.workers.lock().iter_mut() {
			if let Some(h) = slot.handle.take() {
				h.join().ok();
			}
		}
		if let Some(h) = self.watchdog.take() {
			h.join().ok();
		}
		for h in self.timers.drain(..) {
			h.join().ok();
		}

		unsafe {
			libc::close(self.listen_fd);
			libc::close(self.wake_fd);
			libc::close(self.shared.epoll_fd);
		}
		if let Some(path) = &self.unix_path {
			std::fs::remove_file(path).ok();
		}
		info!("server: stopped");
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::adb::Adb;
	use std::io::{Read, Write};

	#[test]
	fn server_starts_and_stops_cleanly_over_tcp() {
		let adb = Arc::new(Adb::open("*").unwrap());
		let mut server = start("127.0.0.1", 18899, adb, Some(2)).unwrap();
		server.kill();
	}

	#[test]
	fn wire_put_request_round_trips_through_dispatch_one() {
		let adb = Arc::new(Adb::open("*").unwrap());
		let (mut client, mut srv) = {
			let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
			(a, b)
		};
		let mut req = vec![wire::MAGIC, wire::PUT];
		req.extend_from_slice(&1u32.to_be_bytes());
		req.extend_from_slice(&1u32.to_be_bytes());
		req.extend_from_slice(b"k");
		req.extend_from_slice(b"v");
		client.write_all(&req).unwrap();
		let mut conn = Conn::Unix(srv);
		let more = dispatch_one(&mut conn, &adb).unwrap();
		assert!(more);
		let mut status = [0u8; 1];
		client.read_exact(&mut status).unwrap();
		assert_eq!(status[0], wire::SUCCESS);
		assert_eq!(adb.get(b"k").unwrap(), Some(b"v".to_vec()));
	}
}
