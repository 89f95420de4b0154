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

// Compaction. The FL compactor shifts live slots over the gaps and
// renumbers every reference into the table, everywhere. The VL
// compactor slides the live blobs down to the start of the file and
// rewrites the pointers that moved. Both run in an exclusive unlogged
// zone and force only the files they changed.

use crate::{
	db::Database,
	error::{Error, Result},
	file::DbFile,
	layout::{read_uint, write_uint, ColLayout, ElemLayout, FL_HEADER_SIZE, VL_HEADER_SIZE},
	store::{is_gap, SlotScan, Store},
};

/// Renumbers a row index after the given rows (sorted ascending,
/// 1-based) disappeared: the index drops by the count of gaps below it.
pub fn adjust_row_index(r: u64, gaps: &[u64]) -> u64 {
	let below = match gaps.binary_search(&r) {
		Ok(i) => i,
		Err(i) => i,
	};
	r - below as u64
}

/// Chunked copy of `[from, from + len)` to `[to, to + len)` where
/// `to <= from`; forward order never clobbers unread source bytes.
fn copy_down(file: &DbFile, from: u64, to: u64, len: u64, buf: &mut Vec<u8>) -> Result<()> {
	debug_assert!(to <= from);
	crate::buffer::reserve(buf, std::cmp::min(len, 64 * 1024) as usize);
	let chunk = std::cmp::min(len, 64 * 1024);
	let mut at = 0u64;
	while at < len {
		let take = std::cmp::min(chunk, len - at) as usize;
		file.read_at(&mut buf[0..take], from + at)?;
		file.write_at(&buf[0..take], to + at)?;
		at += take as u64;
	}
	Ok(())
}

/// Who holds the pointer to a live blob.
enum BlobOwner {
	/// Pointer bytes live in the FL file at this position.
	Field { ptr_pos: u64 },
	/// Pointer bytes live inside another blob (an outrow array), at this
	/// offset of its payload.
	Elem { array_ptr: u64, ptr_off: usize },
}

struct Blob {
	ptr: u64,
	len: u64,
	owner: BlobOwner,
}

impl Database {
	/// Removes the gaps of a table: live slots shift down, the file
	/// shrinks, and every reference into the table, from any table,
	/// is renumbered. A table without gaps is left untouched.
	pub fn compact_fl(&mut self, table: usize) -> Result<()> {
		self.check_open()?;
		let gaps = {
			let store = &self.stores[table];
			store.fl_space.gaps(&store.fl)?
		};
		if gaps.is_empty() {
			log::debug!(
				target: "rowstore",
				"{}: no gaps, nothing to compact",
				self.stores[table].id,
			);
			return Ok(());
		}
		log::info!(
			target: "rowstore",
			"{}: compacting {} gaps away",
			self.stores[table].id,
			gaps.len(),
		);

		{
			let mut buf = self.buffers.gb1();
			let Store { fl, fl_space, layout, .. } = &mut self.stores[table];
			let slots = fl_space.slot_count(fl);
			let n = layout.n;
			let mut scan = SlotScan::new(fl, &mut buf, n, 0, slots);
			let mut shift = 0u64;
			while let Some((slot, bytes)) = scan.next()? {
				if is_gap(bytes) {
					shift += 1;
					continue;
				}
				if shift > 0 {
					let row = bytes.to_vec();
					fl.write_at(&row, FL_HEADER_SIZE + (slot - shift) * n as u64)?;
				}
			}
			fl_space.reset(fl, slots - gaps.len() as u64)?;
		}

		// Renumber references into this table, wherever they live.
		let gap_rows: Vec<u64> = gaps.iter().map(|g| g + 1).collect();
		for s in 0..self.stores.len() {
			self.renumber_refs(s, table, &gap_rows)?;
		}
		for store in &self.stores {
			store.fl.sync()?;
			store.vl.sync()?;
		}
		Ok(())
	}

	/// Rewrites every reference of store `s` into `target` through
	/// [`adjust_row_index`]. Touches only values that change.
	fn renumber_refs(&mut self, s: usize, target: usize, gap_rows: &[u64]) -> Result<()> {
		let affected = self.stores[s]
			.layout
			.cols
			.iter()
			.any(|c| c.layout.ref_target() == Some(target));
		if !affected {
			return Ok(());
		}
		let mut buf = self.buffers.gb1();
		let Store { fl, vl, fl_space, layout, .. } = &mut self.stores[s];
		let slots = fl_space.slot_count(fl);
		let n = layout.n;
		let mut scan = SlotScan::new(fl, &mut buf, n, 0, slots);
		while let Some((slot, bytes)) = scan.next()? {
			if is_gap(bytes) {
				continue;
			}
			let pos = FL_HEADER_SIZE + slot * n as u64;
			for col in &layout.cols {
				if col.layout.ref_target() != Some(target) {
					continue;
				}
				let range = &bytes[col.offset..col.offset + col.len];
				match &col.layout {
					ColLayout::Ref { nobs, .. } => {
						let r = read_uint(range);
						let adjusted = adjust_row_index(r, gap_rows);
						if r != 0 && adjusted != r {
							let mut field = vec![0u8; *nobs];
							write_uint(&mut field, adjusted);
							fl.write_at(&field, pos + col.offset as u64)?;
						}
					}
					ColLayout::InrowArray { size_len, elem, .. } => {
						let nobs = elem.width(layout.nobs_outrow_ptr);
						let size = read_uint(&range[0..*size_len]) as usize;
						let mut field = range.to_vec();
						let mut changed = false;
						for i in 0..size {
							let at = size_len + i * nobs;
							let r = read_uint(&field[at..at + nobs]);
							let adjusted = adjust_row_index(r, gap_rows);
							if r != 0 && adjusted != r {
								write_uint(&mut field[at..at + nobs], adjusted);
								changed = true;
							}
						}
						if changed {
							fl.write_at(&field, pos + col.offset as u64)?;
						}
					}
					ColLayout::OutrowArray { length_len, size_len, elem, .. } => {
						let blob_len = read_uint(&range[0..*length_len]);
						let ptr = read_uint(&range[*length_len..]);
						if blob_len == 0 && ptr == 0 {
							continue;
						}
						let nobs = elem.width(layout.nobs_outrow_ptr);
						let mut payload = vec![0u8; blob_len as usize];
						vl.read_at(&mut payload, ptr)?;
						let size = read_uint(&payload[0..*size_len]) as usize;
						let mut changed = false;
						for i in 0..size {
							let at = size_len + i * nobs;
							let r = read_uint(&payload[at..at + nobs]);
							let adjusted = adjust_row_index(r, gap_rows);
							if r != 0 && adjusted != r {
								write_uint(&mut payload[at..at + nobs], adjusted);
								changed = true;
							}
						}
						if changed {
							// Same length, same position: rewritten in place.
							vl.write_at(&payload, ptr)?;
						}
					}
					_ => {}
				}
			}
		}
		Ok(())
	}

	/// Slides the live blobs of a table's VL file down so they sit
	/// contiguously behind the header, truncates the file and rewrites
	/// the pointers that moved. A file with nothing reclaimed since the
	/// last compaction is left untouched.
	pub fn compact_vl(&mut self, table: usize) -> Result<()> {
		self.check_open()?;
		if self.stores[table].vl_space.deallocated() == 0 {
			log::debug!(
				target: "rowstore",
				"{}: nothing deallocated, nothing to compact",
				self.stores[table].id,
			);
			return Ok(());
		}

		let mut blobs = Vec::new();
		{
			let mut buf = self.buffers.gb1();
			let Store { fl, vl, fl_space, layout, .. } = &mut self.stores[table];
			let slots = fl_space.slot_count(fl);
			let n = layout.n;
			let mut scan = SlotScan::new(fl, &mut buf, n, 0, slots);
			while let Some((slot, bytes)) = scan.next()? {
				if is_gap(bytes) {
					continue;
				}
				let pos = FL_HEADER_SIZE + slot * n as u64;
				for col in &layout.cols {
					let range = &bytes[col.offset..col.offset + col.len];
					match &col.layout {
						ColLayout::OutrowSt { length_len } => {
							let len = read_uint(&range[0..*length_len]);
							if len > 0 {
								blobs.push(Blob {
									ptr: read_uint(&range[*length_len..]),
									len,
									owner: BlobOwner::Field {
										ptr_pos: pos + (col.offset + length_len) as u64,
									},
								});
							}
						}
						ColLayout::OutrowArray { length_len, size_len, elem, .. } => {
							let blob_len = read_uint(&range[0..*length_len]);
							let ptr = read_uint(&range[*length_len..]);
							if blob_len == 0 && ptr == 0 {
								continue;
							}
							blobs.push(Blob {
								ptr,
								len: blob_len,
								owner: BlobOwner::Field {
									ptr_pos: pos + (col.offset + length_len) as u64,
								},
							});
							if let ElemLayout::OutrowSt { length_len: ell, .. } = elem {
								let width = elem.width(layout.nobs_outrow_ptr);
								let mut payload = vec![0u8; blob_len as usize];
								vl.read_at(&mut payload, ptr)?;
								let size = read_uint(&payload[0..*size_len]) as usize;
								let bm = if elem.has_null_bitmap() {
									(size + 7) / 8
								} else {
									0
								};
								for i in 0..size {
									let at = size_len + bm + i * width;
									let elen = read_uint(&payload[at..at + *ell]);
									if elen > 0 {
										blobs.push(Blob {
											ptr: read_uint(&payload[at + *ell..at + width]),
											len: elen,
											owner: BlobOwner::Elem {
												array_ptr: ptr,
												ptr_off: at + *ell,
											},
										});
									}
								}
							}
						}
						ColLayout::InrowArray { size_len, bitmap_len, elem, .. } => {
							if let ElemLayout::OutrowSt { length_len: ell, .. } = elem {
								let width = elem.width(layout.nobs_outrow_ptr);
								let size = read_uint(&range[0..*size_len]) as usize;
								let base = size_len + bitmap_len;
								for i in 0..size {
									let at = base + i * width;
									let elen = read_uint(&range[at..at + *ell]);
									if elen > 0 {
										blobs.push(Blob {
											ptr: read_uint(&range[at + *ell..at + width]),
											len: elen,
											owner: BlobOwner::Field {
												ptr_pos: pos + (col.offset + at + *ell) as u64,
											},
										});
									}
								}
							}
						}
						_ => {}
					}
				}
			}
		}

		blobs.sort_by_key(|b| b.ptr);
		for pair in blobs.windows(2) {
			if pair[0].ptr + pair[0].len > pair[1].ptr {
				return Err(Error::Corruption(
					format!("overlapping blobs at {} and {}", pair[0].ptr, pair[1].ptr)));
			}
		}
		if let Some(first) = blobs.first() {
			if first.ptr < VL_HEADER_SIZE {
				return Err(Error::Corruption(
					format!("blob at {} inside the header", first.ptr)));
			}
		}

		// Slide everything down, remembering where each blob went.
		let mut moves: Vec<(u64, u64)> = Vec::with_capacity(blobs.len());
		{
			let mut buf = self.buffers.gb1();
			let Store { vl, vl_space, .. } = &mut self.stores[table];
			let mut at = VL_HEADER_SIZE;
			for b in &blobs {
				if b.ptr != at {
					copy_down(vl, b.ptr, at, b.len, &mut buf)?;
				}
				moves.push((b.ptr, at));
				at += b.len;
			}
			vl_space.reset(vl, at)?;
			log::info!(
				target: "rowstore",
				"{}: VL compacted to {} bytes",
				self.stores[table].id,
				at,
			);
		}

		// Rewrite the pointers of the blobs that moved.
		{
			let Store { fl, vl, layout, .. } = &mut self.stores[table];
			let nobs = layout.nobs_outrow_ptr;
			for (b, (old_ptr, new_ptr)) in blobs.iter().zip(&moves) {
				debug_assert_eq!(b.ptr, *old_ptr);
				if new_ptr == old_ptr {
					continue;
				}
				let mut field = vec![0u8; nobs];
				write_uint(&mut field, *new_ptr);
				match &b.owner {
					BlobOwner::Field { ptr_pos } => {
						fl.write_at(&field, *ptr_pos)?;
					}
					BlobOwner::Elem { array_ptr, ptr_off } => {
						let array_new = moves[blobs
							.binary_search_by_key(array_ptr, |x| x.ptr)
							.map_err(|_| Error::Corruption(
								format!("unaccounted blob at {}", array_ptr)))?]
							.1;
						vl.write_at(&field, array_new + *ptr_off as u64)?;
					}
				}
			}
			fl.sync()?;
			vl.sync()?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::adjust_row_index;
	use crate::db::Database;
	use crate::layout::{ColKind, ColumnDef, ElemKind, Schema, TableDef, VL_HEADER_SIZE};
	use crate::value::{RowRef, Value};

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("rowstore-test");
			path.push("compact");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}
	}

	impl Drop for TempDir {
		fn drop(&mut self) {
			if self.0.exists() {
				std::fs::remove_dir_all(&self.0).unwrap();
			}
		}
	}

	fn bytes(b: &[u8]) -> Value {
		Value::Bytes(b.to_vec())
	}

	#[test]
	fn adjusts_by_the_gaps_below() {
		let gaps = [3u64, 135, 389, 390, 391];
		assert_eq!(adjust_row_index(2, &gaps), 2);
		assert_eq!(adjust_row_index(3, &gaps), 3);
		assert_eq!(adjust_row_index(5, &gaps), 4);
		assert_eq!(adjust_row_index(136, &gaps), 134);
		assert_eq!(adjust_row_index(392, &gaps), 387);
		assert_eq!(adjust_row_index(500, &gaps), 495);
	}

	#[test]
	fn no_gaps_is_identity() {
		assert_eq!(adjust_row_index(42, &[]), 42);
	}

	fn cross_table_schema() -> Schema {
		Schema {
			tables: vec![
				TableDef {
					name: "a".into(),
					nobs_row_ref: 2,
					nobs_ref_count: 2,
					nobs_outrow_ptr: 4,
					columns: vec![
						ColumnDef::new("v", ColKind::InrowSt { len: 8, nullable: false }),
					],
				},
				TableDef {
					name: "b".into(),
					nobs_row_ref: 2,
					nobs_ref_count: 0,
					nobs_outrow_ptr: 4,
					columns: vec![
						ColumnDef::new("inrefs", ColKind::InrowArray {
							max_size: 4,
							nullable: true,
							elem: ElemKind::Ref { table: 0 },
						}),
						ColumnDef::new("outrefs", ColKind::OutrowArray {
							max_size: 8,
							length_len: 2,
							elem: ElemKind::Ref { table: 0 },
						}),
					],
				},
			],
		}
	}

	#[test]
	fn fl_compaction_renumbers_references_everywhere() {
		let dir = TempDir::new("fl_compaction_renumbers_references_everywhere");
		let mut db = Database::open(&dir.0, cross_table_schema(), None).unwrap();
		for i in 0..520u64 {
			db.insert(0, &[bytes(&i.to_be_bytes())]).unwrap();
		}
		let refs = |indices: &[u64]| {
			Value::Array(indices.iter().map(|i| Value::Ref(RowRef::new(*i))).collect())
		};
		let b_row = db
			.insert(1, &[refs(&[2, 3, 5, 500]), refs(&[500, 2])])
			.unwrap();

		// Free unreferenced rows so the gaps sit at 4, 135, 389..391.
		for gap in [4u64, 135, 389, 390, 391].iter() {
			db.delete(0, RowRef::new(*gap)).unwrap();
		}
		db.compact_fl(0).unwrap();

		assert_eq!(db.stores[0].fl_space.gap_count(), 0);
		assert_eq!(db.stores[0].slot_count(), 515);
		assert_eq!(
			std::fs::read(dir.0.join("table_00_fl")).unwrap().len() as u64,
			16 + 515 * db.stores[0].layout.n as u64,
		);

		// 2 and 3 sit below every gap, 5 lost one row below it, 500 five.
		assert_eq!(
			db.get(1, b_row, &[0, 1]).unwrap(),
			vec![refs(&[2, 3, 4, 495]), refs(&[495, 2])],
		);
		// The moved rows kept their payloads.
		assert_eq!(
			db.get(0, RowRef::new(495), &[0]).unwrap(),
			vec![bytes(&500u64.to_be_bytes())],
		);
		// The counters still line up: the renumbered targets stay locked.
		assert!(db.delete(0, RowRef::new(495)).is_err());
		db.delete(1, b_row).unwrap();
		db.delete(0, RowRef::new(495)).unwrap();
	}

	#[test]
	fn fl_compaction_without_gaps_is_a_no_op() {
		let dir = TempDir::new("fl_compaction_without_gaps_is_a_no_op");
		let mut db = Database::open(&dir.0, cross_table_schema(), None).unwrap();
		db.insert(0, &[bytes(b"12345678")]).unwrap();
		let before = std::fs::read(dir.0.join("table_00_fl")).unwrap();
		db.compact_fl(0).unwrap();
		assert_eq!(std::fs::read(dir.0.join("table_00_fl")).unwrap(), before);
	}

	fn blob_schema() -> Schema {
		Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 4,
				columns: vec![
					ColumnDef::new("payload", ColKind::OutrowSt { length_len: 2 }),
				],
			}],
		}
	}

	#[test]
	fn vl_compaction_packs_the_live_blobs() {
		let dir = TempDir::new("vl_compaction_packs_the_live_blobs");
		let mut db = Database::open(&dir.0, blob_schema(), None).unwrap();
		// Six 10-byte blobs at 16, 26, .. 66.
		for i in 0..6u8 {
			db.insert(0, &[bytes(&[i; 10])]).unwrap();
		}
		// Punch holes: free the blobs of rows 2, 3 and 5.
		db.update(0, RowRef::new(2), 0, &Value::Null).unwrap();
		db.update(0, RowRef::new(3), 0, &Value::Null).unwrap();
		db.update(0, RowRef::new(5), 0, &Value::Null).unwrap();
		assert_eq!(db.stores[0].vl_space.deallocated(), 30);

		db.compact_vl(0).unwrap();

		// Contiguous from the header, file truncated to fit.
		assert_eq!(db.stores[0].vl_space.size(), VL_HEADER_SIZE + 30);
		assert_eq!(db.stores[0].vl_space.deallocated(), 0);
		assert!(db.stores[0].vl_space.holes().is_empty());
		assert_eq!(
			std::fs::read(dir.0.join("table_00_vl")).unwrap().len() as u64,
			VL_HEADER_SIZE + 30,
		);
		for (i, expect) in [(1u64, 0u8), (4, 3), (6, 5)].iter() {
			assert_eq!(
				db.get(0, RowRef::new(*i), &[0]).unwrap(),
				vec![bytes(&[*expect; 10])],
			);
		}

		// Nothing deallocated since: the second run must not touch the
		// files.
		let before = std::fs::read(dir.0.join("table_00_vl")).unwrap();
		db.compact_vl(0).unwrap();
		assert_eq!(std::fs::read(dir.0.join("table_00_vl")).unwrap(), before);
	}

	#[test]
	fn vl_compaction_follows_element_blobs() {
		let dir = TempDir::new("vl_compaction_follows_element_blobs");
		let schema = Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 4,
				columns: vec![
					ColumnDef::new("spacer", ColKind::OutrowSt { length_len: 2 }),
					ColumnDef::new("names", ColKind::OutrowArray {
						max_size: 4,
						length_len: 2,
						elem: ElemKind::OutrowSt { length_len: 1, nullable: true },
					}),
				],
			}],
		};
		let mut db = Database::open(&dir.0, schema, None).unwrap();
		let names = Value::Array(vec![
			bytes(b"alpha"), Value::Null, bytes(b"beta"),
		]);
		let r1 = db.insert(0, &[bytes(&[7; 64]), names.clone()]).unwrap();
		let r2 = db.insert(0, &[bytes(&[8; 64]), names.clone()]).unwrap();
		// Freeing the spacers leaves holes below the arrays and their
		// element blobs.
		db.update(0, r1, 0, &Value::Null).unwrap();
		db.update(0, r2, 0, &Value::Null).unwrap();

		db.compact_vl(0).unwrap();

		assert!(db.stores[0].vl_space.holes().is_empty());
		assert_eq!(db.get(0, r1, &[1]).unwrap(), vec![names.clone()]);
		assert_eq!(db.get(0, r2, &[1]).unwrap(), vec![names]);
	}
}
