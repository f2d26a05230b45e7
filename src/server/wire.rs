//! One-byte wire command IDs and request/response framing for
//! Component H (spec §4.H, §6). All multi-byte integers are big-endian.

pub const MAGIC: u8 = 0xC8;

pub const PUT: u8 = 0x10;
pub const PUTKEEP: u8 = 0x11;
pub const PUTCAT: u8 = 0x12;
pub const PUTNR: u8 = 0x18;
pub const OUT: u8 = 0x20;
pub const GET: u8 = 0x30;
pub const MGET: u8 = 0x31;
pub const VSIZ: u8 = 0x38;
pub const ITERINIT: u8 = 0x50;
pub const ITERNEXT: u8 = 0x51;
pub const FWMKEYS: u8 = 0x58;
pub const ADDINT: u8 = 0x60;
pub const ADDDOUBLE: u8 = 0x61;
pub const VANISH: u8 = 0x72;
pub const RESTORE: u8 = 0x74;
pub const SETMST: u8 = 0x78;
pub const RNUM: u8 = 0x80;
pub const SIZE: u8 = 0x81;
pub const STAT: u8 = 0x88;
pub const MISC: u8 = 0x90;
pub const REPL: u8 = 0xA0;

/// Success byte prefixed to every response that carries a result body.
pub const SUCCESS: u8 = 0x00;
/// Error byte returned in place of `SUCCESS` when the operation failed;
/// the low byte of the failing `error::Code` follows.
pub const ERROR: u8 = 0x01;

use crate::error::{Code, Error, Result};
use std::io::{Read, Write};

pub fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
	let mut b = [0u8; 4];
	r.read_exact(&mut b)?;
	Ok(u32::from_be_bytes(b))
}

pub fn read_i32<R: Read>(r: &mut R) -> Result<i32> {
	Ok(read_u32(r)? as i32)
}

pub fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
	let mut b = [0u8; 8];
	r.read_exact(&mut b)?;
	Ok(u64::from_be_bytes(b))
}

pub fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
	let mut b = [0u8; 8];
	r.read_exact(&mut b)?;
	Ok(f64::from_be_bytes(b))
}

pub fn read_blob<R: Read>(r: &mut R, size: usize) -> Result<Vec<u8>> {
	let mut buf = vec![0u8; size];
	r.read_exact(&mut buf)?;
	Ok(buf)
}

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> Result<()> {
	w.write_all(&v.to_be_bytes())?;
	Ok(())
}

pub fn write_blob<W: Write>(w: &mut W, buf: &[u8]) -> Result<()> {
	write_u32(w, buf.len() as u32)?;
	w.write_all(buf)?;
	Ok(())
}

/// Writes the one-byte success/error prefix shared by every response.
pub fn write_status<W: Write>(w: &mut W, result: &Result<()>) -> Result<()> {
	match result {
		Ok(()) => w.write_all(&[SUCCESS])?,
		Err(e) => w.write_all(&[ERROR, code_byte(e.code())])?,
	}
	Ok(())
}

fn code_byte(code: Code) -> u8 {
	code as u8
}

pub fn err_unknown_command(cmd: u8) -> Error {
	Error::Invalid(format!("unknown wire command {:#x}", cmd))
}
