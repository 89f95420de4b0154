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

use crate::{
	buffer,
	error::{Error, Result},
	file::DbFile,
	flspace::FlSpace,
	layout::{read_uint, ColLayout, ElemLayout, Schema, TableLayout},
	value::RowRef,
	vlspace::VlSpace,
};

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct StoreId(u16);

impl StoreId {
	pub fn new(index: u16) -> StoreId {
		StoreId(index)
	}

	pub fn fl_name(&self) -> String {
		format!("table_{:02}_fl", self.0)
	}

	pub fn vl_name(&self) -> String {
		format!("table_{:02}_vl", self.0)
	}
}

impl std::fmt::Display for StoreId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "table {:02}", self.0)
	}
}

/// One table: the paired FL and VL files with their space managers and
/// the computed slot layout.
pub struct Store {
	pub id: StoreId,
	pub name: String,
	pub layout: TableLayout,
	pub fl: DbFile,
	pub vl: DbFile,
	pub fl_space: FlSpace,
	pub vl_space: VlSpace,
}

pub fn is_gap(slot: &[u8]) -> bool {
	slot[0] & 0x80 != 0
}

impl Store {
	/// Wraps the already-open file pair. When `rebuild` is set (a crash
	/// was detected) the gap chain is rebuilt from the slots instead of
	/// trusting the header.
	pub fn new(
		index: usize,
		schema: &Schema,
		fl: DbFile,
		vl: DbFile,
		buf: &mut Vec<u8>,
		rebuild: bool,
	) -> Result<Store> {
		let layout = TableLayout::build(schema, index)?;
		let id = StoreId::new(index as u16);
		let mut fl_space = FlSpace::open(&fl, layout.n)?;
		if rebuild {
			fl_space.rebuild_chain_of_gaps(&fl, buf)?;
		}
		let vl_space = VlSpace::open(&vl)?;
		let mut store = Store {
			id,
			name: schema.tables[index].name.clone(),
			layout,
			fl,
			vl,
			fl_space,
			vl_space,
		};
		// Free holes are never persisted; recompute them from the rows.
		store.reconstruct_vl(buf)?;
		log::debug!(
			target: "rowstore",
			"Opened {} with {} slots, {} gaps",
			store.id,
			store.fl_space.slot_count(&store.fl),
			store.fl_space.gap_count(),
		);
		Ok(store)
	}

	pub fn slot_count(&self) -> u64 {
		self.fl_space.slot_count(&self.fl)
	}

	/// Position of the slot a reference addresses, verifying the index is
	/// inside the file.
	pub fn ref_to_pos(&self, r: RowRef) -> Result<u64> {
		if r.is_null() || r.slot() >= self.slot_count() {
			return Err(Error::IllegalReference(r.index()));
		}
		Ok(self.fl_space.pos_of(r.slot()))
	}

	/// Reads the slot a reference addresses into `out`, rejecting gaps.
	pub fn load_slot(&self, r: RowRef, out: &mut Vec<u8>) -> Result<u64> {
		let pos = self.ref_to_pos(r)?;
		buffer::reserve(out, self.layout.n);
		self.fl.read_at(&mut out[0..self.layout.n], pos)?;
		if is_gap(&out[0..self.layout.n]) {
			return Err(Error::IllegalReference(r.index()));
		}
		Ok(pos)
	}

	/// Rebuilds the VL free tree as the complement of the live intervals.
	pub fn reconstruct_vl(&mut self, buf: &mut Vec<u8>) -> Result<()> {
		let live = self.live_intervals(buf)?;
		let Store { vl, vl_space, .. } = self;
		vl_space.reconstruct(vl, &live)
	}

	/// All live `(ptr, length)` pairs of the VL file, sorted by position:
	/// every outrow column field of every live row, the element blobs of
	/// arrays with outrow elements included.
	pub fn live_intervals(&self, buf: &mut Vec<u8>) -> Result<Vec<(u64, u64)>> {
		let mut live = Vec::new();
		let n = self.layout.n;
		let mut scan = SlotScan::new(&self.fl, buf, n, 0, self.slot_count());
		while let Some((_, slot)) = scan.next()? {
			if is_gap(slot) {
				continue;
			}
			for col in &self.layout.cols {
				let range = &slot[col.offset..col.offset + col.len];
				match &col.layout {
					ColLayout::OutrowSt { length_len } => {
						let len = read_uint(&range[0..*length_len]);
						if len > 0 {
							live.push((read_uint(&range[*length_len..]), len));
						}
					}
					ColLayout::OutrowArray { length_len, size_len, elem, .. } => {
						let blob_len = read_uint(&range[0..*length_len]);
						let ptr = read_uint(&range[*length_len..]);
						if blob_len == 0 && ptr == 0 {
							continue;
						}
						live.push((ptr, blob_len));
						if let ElemLayout::OutrowSt { length_len: ell, .. } = elem {
							let mut payload = vec![0u8; blob_len as usize];
							self.vl.read_at(&mut payload, ptr)?;
							elem_blobs(
								&payload, *size_len, *ell,
								self.layout.nobs_outrow_ptr, elem, &mut live,
							);
						}
					}
					ColLayout::InrowArray { size_len, bitmap_len, elem, .. } => {
						if let ElemLayout::OutrowSt { length_len: ell, .. } = elem {
							let width = elem.width(self.layout.nobs_outrow_ptr);
							let size = read_uint(&range[0..*size_len]) as usize;
							let base = size_len + bitmap_len;
							for i in 0..size {
								let at = base + i * width;
								let len = read_uint(&range[at..at + *ell]);
								if len > 0 {
									live.push((read_uint(&range[at + *ell..at + width]), len));
								}
							}
						}
					}
					_ => {}
				}
			}
		}
		live.sort_unstable();
		Ok(live)
	}
}

/// Element blobs referenced from an array payload.
fn elem_blobs(
	payload: &[u8],
	size_len: usize,
	elem_length_len: usize,
	nobs_outrow_ptr: usize,
	elem: &ElemLayout,
	live: &mut Vec<(u64, u64)>,
) {
	let size = read_uint(&payload[0..size_len]) as usize;
	let bm = if elem.has_null_bitmap() {
		(size + 7) / 8
	} else {
		0
	};
	let width = elem_length_len + nobs_outrow_ptr;
	let base = size_len + bm;
	for i in 0..size {
		let at = base + i * width;
		if at + width > payload.len() {
			break;
		}
		let len = read_uint(&payload[at..at + elem_length_len]);
		if len > 0 {
			live.push((read_uint(&payload[at + elem_length_len..at + width]), len));
		}
	}
}

/// Chunked forward scan over a range of slots. Yields every slot, gaps
/// included; callers filter on the gap flag.
pub struct SlotScan<'a> {
	file: &'a DbFile,
	buf: &'a mut Vec<u8>,
	n: usize,
	next: u64,
	end: u64,
	chunk_start: u64,
	chunk_slots: u64,
}

impl<'a> SlotScan<'a> {
	pub fn new(
		file: &'a DbFile,
		buf: &'a mut Vec<u8>,
		n: usize,
		start: u64,
		end: u64,
	) -> SlotScan<'a> {
		SlotScan {
			file,
			buf,
			n,
			next: start,
			end,
			chunk_start: start,
			chunk_slots: 0,
		}
	}

	/// Advances to the next slot, reloading the buffer when exhausted.
	pub fn next(&mut self) -> Result<Option<(u64, &[u8])>> {
		if self.next >= self.end {
			return Ok(None);
		}
		if self.next >= self.chunk_start + self.chunk_slots {
			let per_chunk = std::cmp::max(1, (64 * 1024) / self.n) as u64;
			self.chunk_start = self.next;
			self.chunk_slots = std::cmp::min(per_chunk, self.end - self.next);
			let bytes = self.chunk_slots as usize * self.n;
			buffer::reserve(self.buf, bytes);
			self.file.read_at(
				&mut self.buf[0..bytes],
				crate::layout::FL_HEADER_SIZE + self.chunk_start * self.n as u64,
			)?;
		}
		let at = (self.next - self.chunk_start) as usize * self.n;
		let slot = self.next;
		self.next += 1;
		Ok(Some((slot, &self.buf[at..at + self.n])))
	}
}

#[cfg(test)]
mod test {
	use std::convert::TryInto;
	use super::{SlotScan, StoreId};
	use crate::file::{DbFile, FileId};
	use crate::layout::FL_HEADER_SIZE;

	#[test]
	fn store_file_names() {
		let id = StoreId::new(7);
		assert_eq!(id.fl_name(), "table_07_fl");
		assert_eq!(id.vl_name(), "table_07_vl");
	}

	#[test]
	fn slot_scan_crosses_chunks() {
		let mut path = std::env::temp_dir();
		path.push("rowstore-test-slotscan");
		let _ = std::fs::remove_file(&path);
		let file = DbFile::open(&path, FileId(0)).unwrap();
		// 10000 slots of 40 bytes forces several chunk reloads.
		let n = 40usize;
		let slots = 10_000u64;
		let mut content = vec![0u8; FL_HEADER_SIZE as usize + slots as usize * n];
		for k in 0..slots {
			let at = FL_HEADER_SIZE as usize + k as usize * n;
			content[at..at + 8].copy_from_slice(&k.to_be_bytes());
		}
		file.write_at(&content, 0).unwrap();

		let mut buf = Vec::new();
		let mut scan = SlotScan::new(&file, &mut buf, n, 0, slots);
		let mut seen = 0u64;
		while let Some((slot, bytes)) = scan.next().unwrap() {
			assert_eq!(slot, seen);
			assert_eq!(u64::from_be_bytes(bytes[0..8].try_into().unwrap()), slot);
			seen += 1;
		}
		assert_eq!(seen, slots);
		std::fs::remove_file(&path).unwrap();
	}
}
