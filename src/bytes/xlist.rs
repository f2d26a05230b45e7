//! Ordered sequence of byte strings: random access plus push, shift,
//! sort and clear. `shift` advances a base index and only compacts the
//! backing array every 256 operations, matching the host's amortized
//! deque behavior without pulling in a dedicated ring-buffer type.

const COMPACT_INTERVAL: usize = 256;

#[derive(Default)]
pub struct XList {
	items: Vec<Vec<u8>>,
	base: usize,
	shifts_since_compact: usize,
}

impl XList {
	pub fn new() -> XList {
		XList::default()
	}

	pub fn len(&self) -> usize {
		self.items.len() - self.base
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn push(&mut self, item: Vec<u8>) {
		self.items.push(item);
	}

	pub fn get(&self, i: usize) -> Option<&[u8]> {
		self.items.get(self.base + i).map(|v| v.as_slice())
	}

	/// Removes and returns the front item, compacting the backing
	/// storage every `COMPACT_INTERVAL` shifts so the wasted prefix
	/// never grows unbounded.
	pub fn shift(&mut self) -> Option<Vec<u8>> {
		if self.base >= self.items.len() {
			return None;
		}
		let item = std::mem::take(&mut self.items[self.base]);
		self.base += 1;
		self.shifts_since_compact += 1;
		if self.shifts_since_compact >= COMPACT_INTERVAL {
			self.compact();
		}
		Some(item)
	}

	fn compact(&mut self) {
		if self.base == 0 {
			return;
		}
		self.items.drain(0..self.base);
		self.base = 0;
		self.shifts_since_compact = 0;
	}

	pub fn sort(&mut self) {
		self.compact();
		self.items.sort();
	}

	pub fn clear(&mut self) {
		self.items.clear();
		self.base = 0;
		self.shifts_since_compact = 0;
	}

	pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
		self.items[self.base..].iter().map(|v| v.as_slice())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn push_shift_order() {
		let mut l = XList::new();
		for i in 0..10u8 {
			l.push(vec![i]);
		}
		for i in 0..10u8 {
			assert_eq!(l.shift(), Some(vec![i]));
		}
		assert_eq!(l.shift(), None);
	}

	#[test]
	fn compacts_after_threshold() {
		let mut l = XList::new();
		for i in 0..300u32 {
			l.push(i.to_le_bytes().to_vec());
		}
		for _ in 0..300 {
			l.shift();
		}
		assert_eq!(l.base, 0);
		assert!(l.is_empty());
	}

	#[test]
	fn sort_orders_lexicographically() {
		let mut l = XList::new();
		l.push(b"banana".to_vec());
		l.push(b"apple".to_vec());
		l.sort();
		assert_eq!(l.get(0), Some(&b"apple"[..]));
		assert_eq!(l.get(1), Some(&b"banana"[..]));
	}
}
