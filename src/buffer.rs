// Copyright 2015-2020 Parity Technologies (UK) Ltd.
// This file is part of Parity.

// Parity is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Parity is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Parity.  If not, see <http://www.gnu.org/licenses/>.

use parking_lot::{Mutex, MutexGuard};

const INITIAL_CAPACITY: usize = 8 * 1024;

/// The three reusable byte buffers shared by all operations of a database.
/// Execution is single-threaded cooperative, so a buffer is only ever held
/// by the one active operation; the mutexes make the exclusivity explicit.
///
/// GB1 is used by compactors and bulk copies, GB2 by VL read streaming,
/// GB3 by VL write streaming.
pub struct Buffers {
	gb1: Mutex<Vec<u8>>,
	gb2: Mutex<Vec<u8>>,
	gb3: Mutex<Vec<u8>>,
}

impl Buffers {
	pub fn new() -> Buffers {
		Buffers {
			gb1: Mutex::new(vec![0u8; INITIAL_CAPACITY]),
			gb2: Mutex::new(vec![0u8; INITIAL_CAPACITY]),
			gb3: Mutex::new(vec![0u8; INITIAL_CAPACITY]),
		}
	}

	pub fn gb1(&self) -> MutexGuard<'_, Vec<u8>> {
		self.gb1.lock()
	}

	pub fn gb2(&self) -> MutexGuard<'_, Vec<u8>> {
		self.gb2.lock()
	}

	pub fn gb3(&self) -> MutexGuard<'_, Vec<u8>> {
		self.gb3.lock()
	}
}

/// Grows `buf` so that at least `len` bytes are addressable.
pub fn reserve(buf: &mut Vec<u8>, len: usize) {
	if buf.len() < len {
		buf.resize(len, 0);
	}
}

#[cfg(test)]
mod test {
	use super::{Buffers, reserve};

	#[test]
	fn buffers_are_independent() {
		let buffers = Buffers::new();
		let mut a = buffers.gb1();
		let b = buffers.gb2();
		a[0] = 7;
		assert_eq!(b[0], 0);
	}

	#[test]
	fn reserve_grows() {
		let mut buf = vec![0u8; 4];
		reserve(&mut buf, 16);
		assert_eq!(buf.len(), 16);
		reserve(&mut buf, 8);
		assert_eq!(buf.len(), 16);
	}
}
