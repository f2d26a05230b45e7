//! Crate-wide error and thread-local last-error code, mirroring the
//! taxonomy in the specification's error handling design.

use std::cell::Cell;
use std::fmt;

/// One-word classification of the last operation's outcome, kept
/// thread-local so concurrent callers each observe their own history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
	Success,
	Thread,
	Invalid,
	NoFile,
	NoPerm,
	Open,
	Close,
	Trunc,
	Stat,
	Seek,
	Read,
	Write,
	Mmap,
	Lock,
	Unlink,
	Rename,
	Mkdir,
	Rmdir,
	Sync,
	Meta,
	RHead,
	Keep,
	NoRec,
	Misc,
}

impl Code {
	/// Matches spec §5/§7: only these codes leave the database usable;
	/// anything else latches the fatal flag.
	pub fn is_fatal(self) -> bool {
		!matches!(self, Code::Success | Code::Invalid | Code::Keep | Code::NoRec)
	}
}

impl fmt::Display for Code {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

thread_local! {
	static LAST_ERROR: Cell<Code> = Cell::new(Code::Success);
}

pub fn set_last_error(code: Code) {
	LAST_ERROR.with(|c| c.set(code));
}

pub fn last_error() -> Code {
	LAST_ERROR.with(|c| c.get())
}

#[derive(Debug)]
pub enum Error {
	Io(std::io::Error),
	Corruption(String),
	Locked(String),
	InvalidOption(String),
	Keep,
	NoRecord,
	Invalid(String),
	Fatal(String),
	Thread(String),
}

impl Error {
	pub fn code(&self) -> Code {
		match self {
			Error::Io(e) => match e.kind() {
				std::io::ErrorKind::NotFound => Code::NoFile,
				std::io::ErrorKind::PermissionDenied => Code::NoPerm,
				_ => Code::Misc,
			},
			Error::Corruption(_) => Code::RHead,
			Error::Locked(_) => Code::Lock,
			Error::InvalidOption(_) => Code::Invalid,
			Error::Keep => Code::Keep,
			Error::NoRecord => Code::NoRec,
			Error::Invalid(_) => Code::Invalid,
			Error::Fatal(_) => Code::Misc,
			Error::Thread(_) => Code::Thread,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Corruption(s) => write!(f, "corruption: {}", s),
			Error::Locked(s) => write!(f, "locked: {}", s),
			Error::InvalidOption(s) => write!(f, "invalid option: {}", s),
			Error::Keep => write!(f, "keep"),
			Error::NoRecord => write!(f, "no record"),
			Error::Invalid(s) => write!(f, "invalid: {}", s),
			Error::Fatal(s) => write!(f, "fatal: {}", s),
			Error::Thread(s) => write!(f, "thread error: {}", s),
		}
	}
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}

pub type Result<T> = std::result::Result<T, Error>;

/// Records the error's code into the thread-local slot and returns the
/// error unchanged, for use with `.map_err(observe)?`.
pub fn observe(e: Error) -> Error {
	set_last_error(e.code());
	e
}
