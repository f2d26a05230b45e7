//! Pluggable payload compressors. Per the specification these are
//! external collaborators specified only by their `encode`/`decode`
//! contract — `BlockSort` is the one concrete implementation shipped
//! here because its gamma/MTF/BWT primitives are explicitly in-scope
//! (Component A); `Deflate` wraps a real compression crate; `Identity`
//! stands in for `BZip`/`Ext` (a user-supplied plug-in) until the host
//! supplies its own.

pub mod blocksort;

use crate::error::{Error, Result};

/// Matches the header's `options` bit flags (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
	None,
	Deflate,
	BZip,
	BlockSort,
	Ext,
}

pub trait Codec: Send + Sync {
	fn encode(&self, buf: &[u8]) -> Result<Vec<u8>>;
	fn decode(&self, buf: &[u8]) -> Result<Vec<u8>>;
}

pub struct Identity;

impl Codec for Identity {
	fn encode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		Ok(buf.to_vec())
	}
	fn decode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		Ok(buf.to_vec())
	}
}

pub struct Deflate {
	pub level: flate2::Compression,
}

impl Default for Deflate {
	fn default() -> Deflate {
		Deflate { level: flate2::Compression::default() }
	}
}

impl Codec for Deflate {
	fn encode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		use std::io::Write;
		let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), self.level);
		enc.write_all(buf)?;
		enc.finish().map_err(Error::from)
	}

	fn decode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		use std::io::Read;
		let mut dec = flate2::read::ZlibDecoder::new(buf);
		let mut out = Vec::new();
		dec.read_to_end(&mut out)?;
		Ok(out)
	}
}

pub struct BlockSort;

impl Codec for BlockSort {
	fn encode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		Ok(blocksort::compress(buf))
	}
	fn decode(&self, buf: &[u8]) -> Result<Vec<u8>> {
		blocksort::decompress(buf).ok_or_else(|| Error::Corruption("block-sort stream truncated".into()))
	}
}

/// Resolves a codec selection (from the header's options byte) to a
/// concrete implementation. `Ext` returns `None`: the host is expected
/// to supply its own via `hdb::Options::ext_codec`.
pub fn resolve(kind: CodecKind) -> Option<Box<dyn Codec>> {
	match kind {
		CodecKind::None => None,
		CodecKind::Deflate => Some(Box::new(Deflate::default())),
		CodecKind::BZip => Some(Box::new(Identity)),
		CodecKind::BlockSort => Some(Box::new(BlockSort)),
		CodecKind::Ext => None,
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn deflate_round_trips() {
		let c = Deflate::default();
		let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
		let enc = c.encode(&data).unwrap();
		let dec = c.decode(&enc).unwrap();
		assert_eq!(dec, data);
	}

	#[test]
	fn blocksort_round_trips() {
		let c = BlockSort;
		let data = b"abracadabra abracadabra banana banana".to_vec();
		let enc = c.encode(&data).unwrap();
		let dec = c.decode(&enc).unwrap();
		assert_eq!(dec, data);
	}
}
