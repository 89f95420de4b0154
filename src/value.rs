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

/// An opaque 1-based row index. Index 0 denotes the null reference.
///
/// References keep their numeric value across gap creation; only
/// compaction reassigns them.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct RowRef(u64);

impl RowRef {
	pub const NULL: RowRef = RowRef(0);

	pub fn new(index: u64) -> RowRef {
		RowRef(index)
	}

	/// 0-based slot index. Must not be called on the null reference.
	pub fn slot(&self) -> u64 {
		debug_assert!(self.0 > 0);
		self.0 - 1
	}

	pub fn from_slot(slot: u64) -> RowRef {
		RowRef(slot + 1)
	}

	pub fn index(&self) -> u64 {
		self.0
	}

	pub fn is_null(&self) -> bool {
		self.0 == 0
	}
}

impl std::fmt::Display for RowRef {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "row {}", self.0)
	}
}

/// A column value as handed to and from the engine. Simple-type payloads
/// are raw bytes; the type metadata interpreting them lives outside the
/// storage layer.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Value {
	Null,
	Bytes(Vec<u8>),
	Ref(RowRef),
	Array(Vec<Value>),
}

impl Value {
	pub fn is_null(&self) -> bool {
		match self {
			Value::Null => true,
			Value::Ref(r) => r.is_null(),
			_ => false,
		}
	}
}

impl From<RowRef> for Value {
	fn from(r: RowRef) -> Value {
		Value::Ref(r)
	}
}
