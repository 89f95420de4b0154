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

// VL file layout:
//
// Header
// [SIZE: 8][RESERVED: 8]
// SIZE - end of the used region.
//
// Blobs follow at arbitrary offsets; each live blob is referenced by a
// (ptr, length) pair in some FL row. Free holes are not marked on disk:
// they are kept in a treap ordered by ptr and recomputed from the FL
// rows at open. Allocation takes a prefix of the leftmost hole of
// sufficient size, or extends the file. Freed ranges coalesce with
// adjacent or overlapping holes.

use std::convert::TryInto;
use crate::{
	error::{Error, Result},
	file::DbFile,
	layout::VL_HEADER_SIZE,
	unit::Unit,
};

struct Node {
	ptr: u64,
	len: u64,
	prio: u64,
	/// Largest hole length in this subtree.
	max_len: u64,
	left: Option<Box<Node>>,
	right: Option<Box<Node>>,
}

impl Node {
	fn new(ptr: u64, len: u64) -> Box<Node> {
		Box::new(Node {
			ptr,
			len,
			prio: rand::random(),
			max_len: len,
			left: None,
			right: None,
		})
	}

	fn end(&self) -> u64 {
		self.ptr + self.len
	}

	fn refresh(&mut self) {
		let mut max = self.len;
		if let Some(l) = &self.left {
			max = std::cmp::max(max, l.max_len);
		}
		if let Some(r) = &self.right {
			max = std::cmp::max(max, r.max_len);
		}
		self.max_len = max;
	}
}

fn rotate_right(mut node: Box<Node>) -> Box<Node> {
	let mut left = node.left.take().expect("rotate_right needs a left child");
	node.left = left.right.take();
	node.refresh();
	left.right = Some(node);
	left.refresh();
	left
}

fn rotate_left(mut node: Box<Node>) -> Box<Node> {
	let mut right = node.right.take().expect("rotate_left needs a right child");
	node.right = right.left.take();
	node.refresh();
	right.left = Some(node);
	right.refresh();
	right
}

fn insert(node: Option<Box<Node>>, new: Box<Node>) -> Box<Node> {
	match node {
		None => new,
		Some(mut n) => {
			if new.ptr < n.ptr {
				n.left = Some(insert(n.left.take(), new));
				n.refresh();
				if n.left.as_ref().map_or(false, |l| l.prio > n.prio) {
					rotate_right(n)
				} else {
					n
				}
			} else {
				n.right = Some(insert(n.right.take(), new));
				n.refresh();
				if n.right.as_ref().map_or(false, |r| r.prio > n.prio) {
					rotate_left(n)
				} else {
					n
				}
			}
		}
	}
}

/// Joins two subtrees where every key of `a` is below every key of `b`.
fn join(a: Option<Box<Node>>, b: Option<Box<Node>>) -> Option<Box<Node>> {
	match (a, b) {
		(None, b) => b,
		(a, None) => a,
		(Some(mut a), Some(mut b)) => {
			if a.prio > b.prio {
				a.right = join(a.right.take(), Some(b));
				a.refresh();
				Some(a)
			} else {
				b.left = join(Some(a), b.left.take());
				b.refresh();
				Some(b)
			}
		}
	}
}

fn remove(node: Option<Box<Node>>, ptr: u64) -> (Option<Box<Node>>, Option<Box<Node>>) {
	match node {
		None => (None, None),
		Some(mut n) => {
			if ptr < n.ptr {
				let (left, removed) = remove(n.left.take(), ptr);
				n.left = left;
				n.refresh();
				(Some(n), removed)
			} else if ptr > n.ptr {
				let (right, removed) = remove(n.right.take(), ptr);
				n.right = right;
				n.refresh();
				(Some(n), removed)
			} else {
				let rest = join(n.left.take(), n.right.take());
				(rest, Some(n))
			}
		}
	}
}

/// Takes `len` bytes off the front of the leftmost hole that fits.
fn allocate_prefix(node: &mut Option<Box<Node>>, len: u64) -> Option<u64> {
	let n = node.as_mut()?;
	if n.max_len < len {
		return None;
	}
	let result = if n.left.as_ref().map_or(false, |l| l.max_len >= len) {
		allocate_prefix(&mut n.left, len)
	} else if n.len >= len {
		let ptr = n.ptr;
		// Shrinking a prefix keeps the key order: holes are disjoint.
		n.ptr += len;
		n.len -= len;
		Some(ptr)
	} else {
		allocate_prefix(&mut n.right, len)
	};
	if n.len == 0 {
		let n = node.take().unwrap();
		*node = join(n.left, n.right);
	} else {
		n.refresh();
	}
	result
}

/// Finds a hole overlapping or adjacent to `[ptr, end]`. Relies on holes
/// being pairwise disjoint.
fn find_touching(node: &Option<Box<Node>>, ptr: u64, end: u64) -> Option<(u64, u64)> {
	let n = node.as_ref()?;
	if n.ptr <= end && n.end() >= ptr {
		Some((n.ptr, n.len))
	} else if n.end() < ptr {
		find_touching(&n.right, ptr, end)
	} else {
		find_touching(&n.left, ptr, end)
	}
}

fn collect(node: &Option<Box<Node>>, out: &mut Vec<(u64, u64)>) {
	if let Some(n) = node {
		collect(&n.left, out);
		out.push((n.ptr, n.len));
		collect(&n.right, out);
	}
}

/// Free-hole bookkeeping of one VL file. Not persisted hole-by-hole: the
/// tree is authoritative while the database runs and is reconstructed
/// from the FL rows at open.
pub struct VlSpace {
	root: Option<Box<Node>>,
	size: u64,
	deallocated: u64,
}

impl VlSpace {
	/// Opens the space over `file`, creating the header if the file is new.
	/// The caller reconstructs the holes from the FL rows afterwards.
	pub fn open(file: &DbFile) -> Result<VlSpace> {
		if file.len() == 0 {
			let space = VlSpace {
				root: None,
				size: VL_HEADER_SIZE,
				deallocated: 0,
			};
			space.write_header(file, None)?;
			return Ok(space);
		}
		let mut header = [0u8; 8];
		file.read_at(&mut header, 0)?;
		let size = u64::from_be_bytes(header[0..8].try_into().unwrap());
		if size < VL_HEADER_SIZE || size > file.len() {
			return Err(Error::Corruption(
				format!("VL size {} outside [{}, {}]", size, VL_HEADER_SIZE, file.len())));
		}
		Ok(VlSpace { root: None, size, deallocated: 0 })
	}

	fn write_header(&self, file: &DbFile, unit: Option<&mut Unit>) -> Result<()> {
		let header = self.size.to_be_bytes();
		if let Some(unit) = unit {
			let mut old = [0u8; 8];
			if file.len() >= 8 {
				file.read_at(&mut old, 0)?;
			}
			unit.record(file, 0, &old)?;
		}
		if file.len() < VL_HEADER_SIZE {
			file.write_at(&[0u8; VL_HEADER_SIZE as usize], 0)?;
		}
		file.write_at(&header, 0)
	}

	pub fn size(&self) -> u64 {
		self.size
	}

	/// Bytes reclaimed since the last compaction.
	pub fn deallocated(&self) -> u64 {
		self.deallocated
	}

	/// Reserves `len` bytes and returns their position. Reused hole bytes
	/// are recorded as before-images; an extension records a creation
	/// sentinel, so a rollback returns the file to its previous end.
	pub fn allocate(
		&mut self,
		len: u64,
		file: &DbFile,
		mut unit: Option<&mut Unit>,
	) -> Result<u64> {
		debug_assert!(len > 0);
		if let Some(ptr) = allocate_prefix(&mut self.root, len) {
			log::trace!(target: "rowstore", "VL allocated {} bytes at {}", len, ptr);
			if let Some(unit) = unit.as_deref_mut() {
				let mut old = vec![0u8; len as usize];
				file.read_at(&mut old, ptr)?;
				unit.record(file, ptr, &old)?;
			}
			return Ok(ptr);
		}
		let ptr = self.size;
		let new_size = ptr
			.checked_add(len)
			.filter(|s| *s <= i64::MAX as u64)
			.ok_or_else(|| Error::MaximumExceeded("VL file length".into()))?;
		if let Some(unit) = unit.as_deref_mut() {
			unit.record_created(file, self.size)?;
		}
		self.size = new_size;
		log::trace!(target: "rowstore", "VL extended by {} bytes to {}", len, new_size);
		self.write_header(file, unit)?;
		Ok(ptr)
	}

	/// Returns `[ptr, ptr + len)` to the free space, coalescing with
	/// adjacent or overlapping holes. No disk byte changes; the unit is
	/// marked so a rollback rebuilds this tree from the rows.
	pub fn deallocate(&mut self, ptr: u64, len: u64, file: &DbFile, unit: Option<&mut Unit>) {
		if len == 0 {
			return;
		}
		if let Some(unit) = unit {
			unit.mark(file.id());
		}
		let mut start = ptr;
		let mut end = ptr + len;
		while let Some((p, l)) = find_touching(&self.root, start, end) {
			let (rest, _) = remove(self.root.take(), p);
			self.root = rest;
			start = std::cmp::min(start, p);
			end = std::cmp::max(end, p + l);
		}
		self.root = Some(insert(self.root.take(), Node::new(start, end - start)));
		self.deallocated += len;
		log::trace!(target: "rowstore", "VL freed {} bytes at {}", len, ptr);
	}

	/// Empties the tree and truncates the used region to `new_end`. Used
	/// by the VL compactor after the live blobs were shifted down.
	pub fn reset(&mut self, file: &DbFile, new_end: u64) -> Result<()> {
		self.root = None;
		self.size = new_end;
		self.deallocated = 0;
		file.set_len(new_end)?;
		self.write_header(file, None)
	}

	/// Rebuilds the holes as the complement of the live intervals. The
	/// intervals must be sorted by ptr; overlap is corruption.
	pub fn reconstruct(&mut self, file: &DbFile, live: &[(u64, u64)]) -> Result<()> {
		self.root = None;
		self.deallocated = 0;
		self.size = std::cmp::max(file.len(), VL_HEADER_SIZE);
		let mut at = VL_HEADER_SIZE;
		for (ptr, len) in live {
			if *ptr < at {
				return Err(Error::Corruption(
					format!("overlapping VL intervals at {}", ptr)));
			}
			if ptr + len > self.size {
				return Err(Error::Corruption(
					format!("VL interval [{}, {}) outside the file", ptr, ptr + len)));
			}
			if *ptr > at {
				self.root = Some(insert(self.root.take(), Node::new(at, ptr - at)));
				self.deallocated += ptr - at;
			}
			at = ptr + len;
		}
		if at < self.size {
			self.root = Some(insert(self.root.take(), Node::new(at, self.size - at)));
			self.deallocated += self.size - at;
		}
		self.write_header(file, None)?;
		log::debug!(
			target: "rowstore",
			"Reconstructed VL holes: {} free of {} bytes",
			self.deallocated,
			self.size,
		);
		Ok(())
	}

	/// Holes sorted by position. Test and corruption-report helper.
	pub fn holes(&self) -> Vec<(u64, u64)> {
		let mut out = Vec::new();
		collect(&self.root, &mut out);
		out
	}
}
