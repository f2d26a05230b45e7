//! Extensible byte string with geometric growth and a formatted-append
//! helper supporting the C-style `%s %d %u %x %e %f` verbs plus two
//! host extensions: `%@` (XML-escape) and `%?` (percent-encode).

#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct XStr(Vec<u8>);

impl XStr {
	pub fn new() -> XStr {
		XStr(Vec::new())
	}

	pub fn with_capacity(cap: usize) -> XStr {
		XStr(Vec::with_capacity(cap))
	}

	pub fn as_bytes(&self) -> &[u8] {
		&self.0
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn clear(&mut self) {
		self.0.clear();
	}

	fn reserve_geometric(&mut self, additional: usize) {
		let need = self.0.len() + additional;
		if need > self.0.capacity() {
			let doubled = (self.0.capacity() * 2).max(need);
			self.0.reserve(doubled - self.0.len());
		}
	}

	pub fn push(&mut self, byte: u8) {
		self.reserve_geometric(1);
		self.0.push(byte);
	}

	pub fn push_slice(&mut self, buf: &[u8]) {
		self.reserve_geometric(buf.len());
		self.0.extend_from_slice(buf);
	}

	pub fn push_str(&mut self, s: &str) {
		self.push_slice(s.as_bytes());
	}

	/// Escapes `<>&'"` for embedding in XML text/attributes.
	pub fn push_xml_escaped(&mut self, buf: &[u8]) {
		for &b in buf {
			match b {
				b'<' => self.push_str("&lt;"),
				b'>' => self.push_str("&gt;"),
				b'&' => self.push_str("&amp;"),
				b'\'' => self.push_str("&apos;"),
				b'"' => self.push_str("&quot;"),
				_ => self.push(b),
			}
		}
	}

	/// Percent-encodes everything outside `[A-Za-z0-9_.~-]`.
	pub fn push_url_escaped(&mut self, buf: &[u8]) {
		const HEX: &[u8] = b"0123456789ABCDEF";
		for &b in buf {
			let safe = b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'~' | b'-');
			if safe {
				self.push(b);
			} else {
				self.push(b'%');
				self.push(HEX[(b >> 4) as usize]);
				self.push(HEX[(b & 0xf) as usize]);
			}
		}
	}

	/// Minimal printf-style formatter. Supported verbs: `%s %d %u %x %e
	/// %f %@ %?`; `%%` is a literal percent.
	pub fn push_fmt(&mut self, fmt: &str, args: &[Arg<'_>]) {
		let mut args = args.iter();
		let mut chars = fmt.chars().peekable();
		while let Some(c) = chars.next() {
			if c != '%' {
				let mut buf = [0u8; 4];
				self.push_slice(c.encode_utf8(&mut buf).as_bytes());
				continue;
			}
			match chars.next() {
				Some('%') => self.push(b'%'),
				Some('s') => {
					if let Some(Arg::Str(s)) = args.next() {
						self.push_str(s);
					}
				}
				Some('d') => {
					if let Some(Arg::Int(v)) = args.next() {
						self.push_str(&v.to_string());
					}
				}
				Some('u') => {
					if let Some(Arg::UInt(v)) = args.next() {
						self.push_str(&v.to_string());
					}
				}
				Some('x') => {
					if let Some(Arg::UInt(v)) = args.next() {
						self.push_str(&format!("{:x}", v));
					}
				}
				Some('e') => {
					if let Some(Arg::Float(v)) = args.next() {
						self.push_str(&format!("{:e}", v));
					}
				}
				Some('f') => {
					if let Some(Arg::Float(v)) = args.next() {
						self.push_str(&format!("{}", v));
					}
				}
				Some('@') => {
					if let Some(Arg::Bytes(b)) = args.next() {
						self.push_xml_escaped(b);
					}
				}
				Some('?') => {
					if let Some(Arg::Bytes(b)) = args.next() {
						self.push_url_escaped(b);
					}
				}
				Some(other) => {
					self.push(b'%');
					let mut buf = [0u8; 4];
					self.push_slice(other.encode_utf8(&mut buf).as_bytes());
				}
				None => self.push(b'%'),
			}
		}
	}
}

pub enum Arg<'a> {
	Str(&'a str),
	Int(i64),
	UInt(u64),
	Float(f64),
	Bytes(&'a [u8]),
}

impl From<Vec<u8>> for XStr {
	fn from(v: Vec<u8>) -> XStr {
		XStr(v)
	}
}

impl From<XStr> for Vec<u8> {
	fn from(s: XStr) -> Vec<u8> {
		s.0
	}
}

impl AsRef<[u8]> for XStr {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn geometric_growth_preserves_bytes() {
		let mut s = XStr::new();
		for i in 0..1000u32 {
			s.push_str(&i.to_string());
		}
		assert!(s.len() > 0);
	}

	#[test]
	fn format_verbs() {
		let mut s = XStr::new();
		s.push_fmt("%s=%d/%u/%x", &[Arg::Str("k"), Arg::Int(-3), Arg::UInt(7), Arg::UInt(255)]);
		assert_eq!(s.as_bytes(), b"k=-3/7/ff");
	}

	#[test]
	fn xml_and_url_escapes() {
		let mut s = XStr::new();
		s.push_fmt("%@", &[Arg::Bytes(b"<a&b>")]);
		assert_eq!(s.as_bytes(), b"&lt;a&amp;b&gt;");

		let mut s = XStr::new();
		s.push_fmt("%?", &[Arg::Bytes(b"a b/c")]);
		assert_eq!(s.as_bytes(), b"a%20b%2Fc");
	}
}
