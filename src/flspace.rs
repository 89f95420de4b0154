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

// FL file layout:
//
// Header
// [GAPS: 8][ROOT: 8]
// GAPS - number of free slots.
// ROOT - slot index of the free-list head, or the total slot count when
// no slot is free.
//
// Slots of n bytes follow at 16 + k * n. A free slot stores
// 0x80... | next in its first 8 bytes, big-endian; the terminal link is
// the total slot count. Occupied slots keep bit 7 of byte 0 clear.

use std::convert::TryInto;
use crate::{
	buffer,
	error::{Error, Result},
	file::DbFile,
	layout::FL_HEADER_SIZE,
	unit::Unit,
};

const GAP_MARK: u64 = 1 << 63;

/// Free-slot bookkeeping of one FL file. The authoritative state is the
/// header plus the chain threaded through the gap slots; this mirror is
/// refreshed from disk after a rollback and rebuilt after a crash.
pub struct FlSpace {
	n: u64,
	gaps: u64,
	root: u64,
}

impl FlSpace {
	/// Opens the space over `file`, creating the header if the file is new.
	pub fn open(file: &DbFile, n: usize) -> Result<FlSpace> {
		let n = n as u64;
		if file.len() == 0 {
			let space = FlSpace { n, gaps: 0, root: 0 };
			space.write_header(file, None)?;
			return Ok(space);
		}
		if file.len() < FL_HEADER_SIZE
			|| (file.len() - FL_HEADER_SIZE) % n != 0
		{
			return Err(Error::Corruption(
				format!("FL file length {} does not fit slot width {}", file.len(), n)));
		}
		let mut space = FlSpace { n, gaps: 0, root: 0 };
		space.read_header(file)?;
		Ok(space)
	}

	pub fn read_header(&mut self, file: &DbFile) -> Result<()> {
		let mut header = [0u8; FL_HEADER_SIZE as usize];
		file.read_at(&mut header, 0)?;
		self.gaps = u64::from_be_bytes(header[0..8].try_into().unwrap());
		self.root = u64::from_be_bytes(header[8..16].try_into().unwrap());
		Ok(())
	}

	fn write_header(&self, file: &DbFile, unit: Option<&mut Unit>) -> Result<()> {
		let mut header = [0u8; FL_HEADER_SIZE as usize];
		header[0..8].copy_from_slice(&self.gaps.to_be_bytes());
		header[8..16].copy_from_slice(&self.root.to_be_bytes());
		if let Some(unit) = unit {
			let mut old = [0u8; FL_HEADER_SIZE as usize];
			if file.len() >= FL_HEADER_SIZE {
				file.read_at(&mut old, 0)?;
			}
			unit.record(file, 0, &old)?;
		}
		file.write_at(&header, 0)
	}

	pub fn slot_count(&self, file: &DbFile) -> u64 {
		(file.len().saturating_sub(FL_HEADER_SIZE)) / self.n
	}

	pub fn gap_count(&self) -> u64 {
		self.gaps
	}

	pub fn pos_of(&self, slot: u64) -> u64 {
		FL_HEADER_SIZE + slot * self.n
	}

	pub fn index_of(&self, pos: u64) -> u64 {
		(pos - FL_HEADER_SIZE) / self.n
	}

	/// Takes a free slot off the chain, or grows the file by one slot.
	/// Returns the slot's file position.
	pub fn allocate(&mut self, file: &DbFile, unit: &mut Unit) -> Result<u64> {
		let slots = self.slot_count(file);
		let pos = if self.root < slots {
			let pos = self.pos_of(self.root);
			let mut link = [0u8; 8];
			file.read_at(&mut link, pos)?;
			let next = u64::from_be_bytes(link);
			if next & GAP_MARK == 0 {
				return Err(Error::Corruption(
					format!("slot {} is linked as free but not marked", self.root)));
			}
			unit.record(file, pos, &link)?;
			log::trace!(
				target: "rowstore",
				"Inserting into removed slot {}",
				self.root,
			);
			self.root = next & !GAP_MARK;
			self.gaps -= 1;
			pos
		} else {
			let new_len = file
				.len()
				.checked_add(self.n)
				.filter(|l| *l <= i64::MAX as u64)
				.ok_or_else(|| Error::MaximumExceeded("FL file length".into()))?;
			log::trace!(
				target: "rowstore",
				"Inserting into new slot {}",
				self.root,
			);
			unit.record_created(file, file.len())?;
			let pos = self.pos_of(self.root);
			file.set_len(new_len)?;
			self.root += 1;
			pos
		};
		self.write_header(file, Some(unit))?;
		Ok(pos)
	}

	/// Enters the slot at `pos` at the head of the chain. The caller must
	/// have recorded the full slot as before-image already.
	pub fn deallocate(&mut self, file: &DbFile, unit: &mut Unit, pos: u64) -> Result<u64> {
		let slot = self.index_of(pos);
		let link = (GAP_MARK | self.root).to_be_bytes();
		file.write_at(&link, pos)?;
		log::trace!(target: "rowstore", "Freeing slot {}", slot);
		self.root = slot;
		self.gaps += 1;
		self.write_header(file, Some(unit))?;
		Ok(slot)
	}

	/// Walks the chain and returns the free slot indices sorted ascending.
	pub fn gaps(&self, file: &DbFile) -> Result<Vec<u64>> {
		if self.gaps > i32::MAX as u64 {
			return Err(Error::ImplementationRestriction(
				format!("{} gaps exceed the sortable maximum", self.gaps)));
		}
		let slots = self.slot_count(file);
		let mut result = Vec::with_capacity(self.gaps as usize);
		let mut at = self.root;
		while at < slots {
			if result.len() as u64 == self.gaps {
				return Err(Error::Corruption("gap chain longer than recorded".into()));
			}
			result.push(at);
			let mut link = [0u8; 8];
			file.read_at(&mut link, self.pos_of(at))?;
			let next = u64::from_be_bytes(link);
			if next & GAP_MARK == 0 {
				return Err(Error::Corruption(
					format!("slot {} is linked as free but not marked", at)));
			}
			at = next & !GAP_MARK;
		}
		if result.len() as u64 != self.gaps {
			return Err(Error::Corruption(
				format!("gap chain has {} entries, header records {}", result.len(), self.gaps)));
		}
		result.sort_unstable();
		Ok(result)
	}

	/// Scans the whole file and relinks every marked slot. Authoritative:
	/// run at open after a crash where the header or chain might be stale.
	pub fn rebuild_chain_of_gaps(&mut self, file: &DbFile, buf: &mut Vec<u8>) -> Result<()> {
		let slots = self.slot_count(file);
		let n = self.n as usize;
		let chunk_slots = std::cmp::max(1, 64 * 1024 / n);
		buffer::reserve(buf, chunk_slots * n);
		let mut marked = Vec::new();
		let mut slot = 0u64;
		while slot < slots {
			let batch = std::cmp::min(chunk_slots as u64, slots - slot);
			let bytes = batch as usize * n;
			file.read_at(&mut buf[0..bytes], self.pos_of(slot))?;
			for k in 0..batch {
				if buf[k as usize * n] & 0x80 != 0 {
					marked.push(slot + k);
				}
			}
			slot += batch;
		}
		for (i, gap) in marked.iter().enumerate() {
			let next = marked.get(i + 1).copied().unwrap_or(slots);
			let link = (GAP_MARK | next).to_be_bytes();
			file.write_at(&link, self.pos_of(*gap))?;
		}
		self.root = marked.first().copied().unwrap_or(slots);
		self.gaps = marked.len() as u64;
		self.write_header(file, None)?;
		log::debug!(
			target: "rowstore",
			"Rebuilt gap chain: {} gaps, root {}",
			self.gaps,
			self.root,
		);
		Ok(())
	}

	/// Truncates to `slots` slots and marks them all occupied. Used by the
	/// FL compactor after the live rows were shifted down.
	pub fn reset(&mut self, file: &DbFile, slots: u64) -> Result<()> {
		file.set_len(FL_HEADER_SIZE + slots * self.n)?;
		self.gaps = 0;
		self.root = slots;
		self.write_header(file, None)
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use super::FlSpace;
	use crate::file::{DbFile, FileId};
	use crate::unit::Unit;

	const N: usize = 16;

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("rowstore-test");
			path.push("flspace");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file(&self, name: &str) -> DbFile {
			DbFile::open(&self.0.join(name), FileId(0)).unwrap()
		}

		fn unit(&self) -> Unit {
			Unit::new(Arc::new(self.file("unit")))
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	#[test]
	fn allocate_grows_then_reuses() {
		let dir = TempDir::new("allocate_grows_then_reuses");
		let file = dir.file("fl");
		let mut unit = dir.unit();
		let mut space = FlSpace::open(&file, N).unwrap();

		let a = space.allocate(&file, &mut unit).unwrap();
		let b = space.allocate(&file, &mut unit).unwrap();
		assert_eq!(a, 16);
		assert_eq!(b, 16 + N as u64);
		assert_eq!(space.slot_count(&file), 2);
		assert_eq!(space.gap_count(), 0);

		// Occupy, then free the first slot.
		file.write_at(&[0u8; N], a).unwrap();
		file.write_at(&[0u8; N], b).unwrap();
		space.deallocate(&file, &mut unit, a).unwrap();
		assert_eq!(space.gap_count(), 1);
		assert_eq!(space.gaps(&file).unwrap(), vec![0]);

		// The gap is reused before the file grows again.
		let c = space.allocate(&file, &mut unit).unwrap();
		assert_eq!(c, a);
		assert_eq!(space.gap_count(), 0);
		assert_eq!(space.slot_count(&file), 2);
	}

	#[test]
	fn chain_orders_last_freed_first() {
		let dir = TempDir::new("chain_orders_last_freed_first");
		let file = dir.file("fl");
		let mut unit = dir.unit();
		let mut space = FlSpace::open(&file, N).unwrap();
		for _ in 0..4 {
			let pos = space.allocate(&file, &mut unit).unwrap();
			file.write_at(&[0u8; N], pos).unwrap();
		}
		space.deallocate(&file, &mut unit, space.pos_of(1)).unwrap();
		space.deallocate(&file, &mut unit, space.pos_of(3)).unwrap();
		// Sorted ascending regardless of free order.
		assert_eq!(space.gaps(&file).unwrap(), vec![1, 3]);
		// Head of the chain is the most recently freed slot.
		let mut unit2 = Unit::new(std::sync::Arc::new(dir.file("unit2")));
		assert_eq!(space.allocate(&file, &mut unit2).unwrap(), space.pos_of(3));
	}

	#[test]
	fn rebuild_is_idempotent_and_authoritative() {
		let dir = TempDir::new("rebuild_is_idempotent_and_authoritative");
		let file = dir.file("fl");
		let mut unit = dir.unit();
		let mut space = FlSpace::open(&file, N).unwrap();
		for _ in 0..5 {
			let pos = space.allocate(&file, &mut unit).unwrap();
			file.write_at(&[0u8; N], pos).unwrap();
		}
		space.deallocate(&file, &mut unit, space.pos_of(4)).unwrap();
		space.deallocate(&file, &mut unit, space.pos_of(1)).unwrap();

		// Clobber the header as a crash would.
		file.write_at(&[0xffu8; 16], 0).unwrap();
		space.read_header(&file).unwrap();
		let mut buf = Vec::new();
		space.rebuild_chain_of_gaps(&file, &mut buf).unwrap();
		assert_eq!(space.gap_count(), 2);
		assert_eq!(space.gaps(&file).unwrap(), vec![1, 4]);
		let (root, gaps) = (space.root, space.gaps);

		space.rebuild_chain_of_gaps(&file, &mut buf).unwrap();
		assert_eq!((space.root, space.gaps), (root, gaps));
		assert_eq!(space.gaps(&file).unwrap(), vec![1, 4]);
	}

	#[test]
	fn reset_clears_gaps() {
		let dir = TempDir::new("reset_clears_gaps");
		let file = dir.file("fl");
		let mut unit = dir.unit();
		let mut space = FlSpace::open(&file, N).unwrap();
		for _ in 0..3 {
			let pos = space.allocate(&file, &mut unit).unwrap();
			file.write_at(&[0u8; N], pos).unwrap();
		}
		space.deallocate(&file, &mut unit, space.pos_of(1)).unwrap();
		space.reset(&file, 2).unwrap();
		assert_eq!(space.gap_count(), 0);
		assert_eq!(space.slot_count(&file), 2);
		assert!(space.gaps(&file).unwrap().is_empty());
	}
}
