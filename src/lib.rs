//! `hashkv`: an embedded mmap-backed hash key-value store with an
//! in-memory tier (Component C), an update log for point-in-time
//! restore (Component F), replication (Component G), a TCP/UNIX
//! front-end (Component H) and a matching remote client (Component I),
//! built over the core record/bucket engine (Component D).

pub mod adb;
pub mod bytes;
pub mod codec;
pub mod error;
pub mod hdb;
pub mod mdb;
pub mod mode;
pub mod osio;
pub mod ospath;
pub mod rdb;
pub mod repl;
pub mod server;
pub mod ulog;

pub use adb::Adb;
pub use error::{Code, Error, Result};
pub use hdb::Hdb;
pub use mdb::Mdb;
pub use mode::{AddOutcome, ProcResult, WriteMode};
pub use rdb::Rdb;
pub use ulog::Ulog;
