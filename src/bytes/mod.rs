//! Component A: byte containers and primitives.
//!
//! These mirror the host library's extensible byte string, ordered
//! sequence of byte strings and insertion-ordered byte map, kept as
//! separate small modules the way the teacher keeps `table`/`column`
//! separate from the shared `display`/`error` helpers.

pub mod pool;
pub mod xlist;
pub mod xmap;
pub mod xstr;

pub use pool::ScopedPool;
pub use xlist::XList;
pub use xmap::{PutMode, XMap};
pub use xstr::XStr;
