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

// Slot layout, computed once per table at open:
//
// [BITMAP: nBM][RC: nobsRefCount][COLUMN DATA ...]
//
// The bitmap is a big-endian integer of nBM bytes. Its top bit (bit 7 of
// byte 0) is the gap flag; the low bits carry per-column null info,
// allocated LSB-first in schema order over the columns that have one.
// The reference counter is big-endian unsigned and present only on tables
// referenced by some table. Column data follows in ascending offsets.

use crate::error::{Error, Result};

pub const FL_HEADER_SIZE: u64 = 16;
pub const VL_HEADER_SIZE: u64 = 16;

/// Minimal big-endian width for an unsigned value, in [1..8].
pub fn nobs_for(v: u64) -> usize {
	let bits = 64 - v.leading_zeros() as usize;
	std::cmp::max(1, (bits + 7) / 8)
}

/// Reads an unsigned big-endian integer of up to 8 bytes.
pub fn read_uint(bytes: &[u8]) -> u64 {
	let mut v = 0u64;
	for b in bytes {
		v = (v << 8) | *b as u64;
	}
	v
}

/// Writes `v` big-endian into the whole of `bytes`.
pub fn write_uint(bytes: &mut [u8], v: u64) {
	let mut v = v;
	for b in bytes.iter_mut().rev() {
		*b = v as u8;
		v >>= 8;
	}
}

/// Largest value an unsigned big-endian field of `nobs` bytes can hold.
pub fn max_uint(nobs: usize) -> u64 {
	if nobs >= 8 {
		u64::MAX
	} else {
		(1u64 << (nobs * 8)) - 1
	}
}

/// Element type of an array column.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ElemKind {
	InrowSt { len: usize, nullable: bool },
	OutrowSt { length_len: usize, nullable: bool },
	Ref { table: usize },
}

/// Column type as declared by the schema.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ColKind {
	InrowSt { len: usize, nullable: bool },
	OutrowSt { length_len: usize },
	Ref { table: usize },
	InrowArray { max_size: u32, nullable: bool, elem: ElemKind },
	OutrowArray { max_size: u32, length_len: usize, elem: ElemKind },
}

#[derive(Clone, Debug)]
pub struct ColumnDef {
	pub name: String,
	pub kind: ColKind,
}

impl ColumnDef {
	pub fn new(name: &str, kind: ColKind) -> ColumnDef {
		ColumnDef { name: name.into(), kind }
	}
}

#[derive(Clone, Debug)]
pub struct TableDef {
	pub name: String,
	/// Width of references into this table, in [1..8].
	pub nobs_row_ref: usize,
	/// Width of this table's reference counters, in [0..8]. Consulted only
	/// when some table references this one.
	pub nobs_ref_count: usize,
	/// Width of VL pointers stored in this table's slots, in [1..8].
	pub nobs_outrow_ptr: usize,
	pub columns: Vec<ColumnDef>,
}

#[derive(Clone, Debug)]
pub struct Schema {
	pub tables: Vec<TableDef>,
}

/// Element layout with the reference width baked in.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ElemLayout {
	InrowSt { len: usize, nullable: bool },
	OutrowSt { length_len: usize, nullable: bool },
	Ref { store: usize, nobs: usize },
}

impl ElemLayout {
	/// Byte width of one element inside an array payload.
	pub fn width(&self, nobs_outrow_ptr: usize) -> usize {
		match self {
			ElemLayout::InrowSt { len, .. } => *len,
			ElemLayout::OutrowSt { length_len, .. } => length_len + nobs_outrow_ptr,
			ElemLayout::Ref { nobs, .. } => *nobs,
		}
	}

	/// Whether array payloads of this element carry a null bitmap.
	pub fn has_null_bitmap(&self) -> bool {
		match self {
			ElemLayout::InrowSt { nullable, .. } => *nullable,
			ElemLayout::OutrowSt { nullable, .. } => *nullable,
			ElemLayout::Ref { .. } => false,
		}
	}
}

/// Column layout with every width resolved.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum ColLayout {
	InrowSt { len: usize, nullable: bool },
	OutrowSt { length_len: usize },
	Ref { store: usize, nobs: usize },
	InrowArray { size_len: usize, bitmap_len: usize, max_size: u32, elem: ElemLayout },
	OutrowArray { length_len: usize, size_len: usize, max_size: u32, elem: ElemLayout },
}

impl ColLayout {
	/// Arena index of the referenced store, if this column holds references.
	pub fn ref_target(&self) -> Option<usize> {
		match self {
			ColLayout::Ref { store, .. } => Some(*store),
			ColLayout::InrowArray { elem: ElemLayout::Ref { store, .. }, .. } =>
				Some(*store),
			ColLayout::OutrowArray { elem: ElemLayout::Ref { store, .. }, .. } =>
				Some(*store),
			_ => None,
		}
	}

	/// Whether the slot field points into the VL file.
	pub fn is_outrow(&self) -> bool {
		matches!(self, ColLayout::OutrowSt { .. } | ColLayout::OutrowArray { .. })
	}

	/// Whether an inrow array payload contains element blob pointers.
	pub fn has_outrow_elems(&self) -> bool {
		matches!(self,
			ColLayout::InrowArray { elem: ElemLayout::OutrowSt { .. }, .. }
			| ColLayout::OutrowArray { elem: ElemLayout::OutrowSt { .. }, .. })
	}
}

#[derive(Clone, Debug)]
pub struct ColInfo {
	pub name: String,
	/// Byte offset of the column field within the slot.
	pub offset: usize,
	/// Byte width of the column field within the slot.
	pub len: usize,
	/// Bit in the slot bitmap signalling null, or 0 if the column has none.
	pub null_mask: u64,
	pub layout: ColLayout,
}

#[derive(Clone, Debug)]
pub struct TableLayout {
	pub n_bm: usize,
	/// Effective RC width: 0 unless the table is referenced.
	pub nobs_ref_count: usize,
	pub nobs_outrow_ptr: usize,
	/// Width of references into this table.
	pub nobs_row_ref: usize,
	/// Full slot width.
	pub n: usize,
	pub referenced: bool,
	pub cols: Vec<ColInfo>,
}

fn check_width(name: &str, v: usize, min: usize) -> Result<()> {
	if v < min || v > 8 {
		return Err(Error::IllegalArgument(
			format!("{} must be in [{}..8], got {}", name, min, v)));
	}
	Ok(())
}

fn elem_layout(schema: &Schema, elem: &ElemKind) -> Result<ElemLayout> {
	Ok(match elem {
		ElemKind::InrowSt { len, nullable } => {
			if *len == 0 {
				return Err(Error::IllegalArgument("zero-width element type".into()));
			}
			ElemLayout::InrowSt { len: *len, nullable: *nullable }
		}
		ElemKind::OutrowSt { length_len, nullable } => {
			check_width("lengthLen", *length_len, 1)?;
			ElemLayout::OutrowSt { length_len: *length_len, nullable: *nullable }
		}
		ElemKind::Ref { table } => {
			let target = schema.tables.get(*table).ok_or_else(|| {
				Error::IllegalArgument(format!("unknown referenced table {}", table))
			})?;
			check_width("nobsRowRef", target.nobs_row_ref, 1)?;
			ElemLayout::Ref { store: *table, nobs: target.nobs_row_ref }
		}
	})
}

/// Whether any column of any table references table `t`.
pub fn is_referenced(schema: &Schema, t: usize) -> bool {
	schema.tables.iter().any(|table| {
		table.columns.iter().any(|c| match &c.kind {
			ColKind::Ref { table } => *table == t,
			ColKind::InrowArray { elem: ElemKind::Ref { table }, .. } => *table == t,
			ColKind::OutrowArray { elem: ElemKind::Ref { table }, .. } => *table == t,
			_ => false,
		})
	})
}

impl TableLayout {
	pub fn build(schema: &Schema, t: usize) -> Result<TableLayout> {
		let def = &schema.tables[t];
		check_width("nobsRowRef", def.nobs_row_ref, 1)?;
		check_width("nobsOutrowPtr", def.nobs_outrow_ptr, 1)?;
		if def.nobs_ref_count > 8 {
			return Err(Error::IllegalArgument(
				format!("nobsRefCount must be in [0..8], got {}", def.nobs_ref_count)));
		}

		let referenced = is_referenced(schema, t);
		if referenced && def.nobs_ref_count == 0 {
			return Err(Error::IllegalArgument(
				format!("table {} is referenced but has no reference counter", def.name)));
		}
		let rc = if referenced { def.nobs_ref_count } else { 0 };

		// First pass: count null bits and resolve element layouts.
		let mut null_bits = 0usize;
		let mut layouts = Vec::with_capacity(def.columns.len());
		for col in &def.columns {
			let (layout, has_null_bit) = match &col.kind {
				ColKind::InrowSt { len, nullable } => {
					if *len == 0 {
						return Err(Error::IllegalArgument(
							format!("column {} has zero width", col.name)));
					}
					(ColLayout::InrowSt { len: *len, nullable: *nullable }, *nullable)
				}
				ColKind::OutrowSt { length_len } => {
					check_width("lengthLen", *length_len, 1)?;
					(ColLayout::OutrowSt { length_len: *length_len }, false)
				}
				ColKind::Ref { table } => {
					let target = schema.tables.get(*table).ok_or_else(|| {
						Error::IllegalArgument(
							format!("column {} references unknown table", col.name))
					})?;
					(ColLayout::Ref { store: *table, nobs: target.nobs_row_ref }, false)
				}
				ColKind::InrowArray { max_size, nullable, elem } => {
					if *max_size == 0 {
						return Err(Error::IllegalArgument(
							format!("column {} has zero capacity", col.name)));
					}
					let elem = elem_layout(schema, elem)?;
					let size_len = nobs_for(*max_size as u64);
					let bitmap_len = if elem.has_null_bitmap() {
						(*max_size as usize + 7) / 8
					} else {
						0
					};
					(ColLayout::InrowArray {
						size_len, bitmap_len, max_size: *max_size, elem,
					}, *nullable)
				}
				ColKind::OutrowArray { max_size, length_len, elem } => {
					if *max_size == 0 {
						return Err(Error::IllegalArgument(
							format!("column {} has zero capacity", col.name)));
					}
					check_width("lengthLen", *length_len, 1)?;
					let elem = elem_layout(schema, elem)?;
					let size_len = nobs_for(*max_size as u64);
					(ColLayout::OutrowArray {
						length_len: *length_len, size_len, max_size: *max_size, elem,
					}, false)
				}
			};
			if has_null_bit {
				null_bits += 1;
			}
			layouts.push(layout);
		}
		if null_bits > 63 {
			return Err(Error::ImplementationRestriction(
				format!("table {} needs {} null bits, at most 63 fit", def.name, null_bits)));
		}

		// The gap flag needs byte 0's top bit. A table with no null info can
		// drop the bitmap entirely when an RC leads the slot; the RC is then
		// capped below 2^(8w-1) so the top bit stays clear on live rows.
		let n_bm = if null_bits > 0 {
			(null_bits + 1 + 7) / 8
		} else if rc > 0 {
			0
		} else {
			1
		};

		// Second pass: assign offsets and null masks.
		let mut offset = n_bm + rc;
		let mut next_bit = 0u32;
		let mut cols = Vec::with_capacity(def.columns.len());
		for (col, layout) in def.columns.iter().zip(layouts.into_iter()) {
			let has_null_bit = match &layout {
				ColLayout::InrowSt { nullable, .. } => *nullable,
				ColLayout::InrowArray { .. } => match &col.kind {
					ColKind::InrowArray { nullable, .. } => *nullable,
					_ => false,
				},
				_ => false,
			};
			let null_mask = if has_null_bit {
				let mask = 1u64 << next_bit;
				next_bit += 1;
				mask
			} else {
				0
			};
			let len = match &layout {
				ColLayout::InrowSt { len, .. } => *len,
				ColLayout::OutrowSt { length_len } => length_len + def.nobs_outrow_ptr,
				ColLayout::Ref { nobs, .. } => *nobs,
				ColLayout::InrowArray { size_len, bitmap_len, max_size, elem } =>
					size_len + bitmap_len
						+ *max_size as usize * elem.width(def.nobs_outrow_ptr),
				ColLayout::OutrowArray { length_len, .. } =>
					length_len + def.nobs_outrow_ptr,
			};
			cols.push(ColInfo {
				name: col.name.clone(),
				offset,
				len,
				null_mask,
				layout,
			});
			offset += len;
		}

		let n = offset;
		// A gap slot stores its chain link in the first 8 bytes.
		if n < 8 {
			return Err(Error::ImplementationRestriction(
				format!("table {} slot width {} is below the 8 byte minimum", def.name, n)));
		}

		Ok(TableLayout {
			n_bm,
			nobs_ref_count: rc,
			nobs_outrow_ptr: def.nobs_outrow_ptr,
			nobs_row_ref: def.nobs_row_ref,
			n,
			referenced,
			cols,
		})
	}

	/// Gap flag position within the slot bitmap read as a BE integer.
	pub fn gap_flag(&self) -> u64 {
		debug_assert!(self.n_bm > 0);
		1u64 << (self.n_bm * 8 - 1)
	}

	/// Largest reference counter value this table can store. Top bit of the
	/// slot is reserved for the gap flag when there is no bitmap.
	pub fn max_ref_count(&self) -> u64 {
		if self.n_bm == 0 {
			max_uint(self.nobs_ref_count) >> 1
		} else {
			max_uint(self.nobs_ref_count)
		}
	}

	pub fn bitmap(&self, slot: &[u8]) -> u64 {
		read_uint(&slot[0..self.n_bm])
	}

	pub fn set_bitmap(&self, slot: &mut [u8], bitmap: u64) {
		write_uint(&mut slot[0..self.n_bm], bitmap);
	}

	pub fn ref_count(&self, slot: &[u8]) -> u64 {
		read_uint(&slot[self.n_bm..self.n_bm + self.nobs_ref_count])
	}

	pub fn set_ref_count(&self, slot: &mut [u8], rc: u64) {
		write_uint(&mut slot[self.n_bm..self.n_bm + self.nobs_ref_count], rc);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn two_col_table() -> Schema {
		Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 4,
				columns: vec![
					ColumnDef::new("a", ColKind::InrowSt { len: 4, nullable: true }),
					ColumnDef::new("b", ColKind::InrowSt { len: 4, nullable: true }),
				],
			}],
		}
	}

	#[test]
	fn uint_roundtrip() {
		let mut buf = [0u8; 3];
		write_uint(&mut buf, 0x012345);
		assert_eq!(buf, [0x01, 0x23, 0x45]);
		assert_eq!(read_uint(&buf), 0x012345);
		assert_eq!(nobs_for(0), 1);
		assert_eq!(nobs_for(255), 1);
		assert_eq!(nobs_for(256), 2);
		assert_eq!(nobs_for(u64::MAX), 8);
		assert_eq!(max_uint(2), 0xffff);
		assert_eq!(max_uint(8), u64::MAX);
	}

	#[test]
	fn null_masks_in_schema_order() {
		let layout = TableLayout::build(&two_col_table(), 0).unwrap();
		assert_eq!(layout.n_bm, 1);
		assert_eq!(layout.cols[0].null_mask, 0x01);
		assert_eq!(layout.cols[1].null_mask, 0x02);
		assert_eq!(layout.cols[0].offset, 1);
		assert_eq!(layout.cols[1].offset, 5);
		assert_eq!(layout.n, 9);
	}

	#[test]
	fn no_bitmap_with_ref_count() {
		// Referenced table without nullable columns: RC leads the slot.
		let schema = Schema {
			tables: vec![
				TableDef {
					name: "target".into(),
					nobs_row_ref: 2,
					nobs_ref_count: 2,
					nobs_outrow_ptr: 4,
					columns: vec![
						ColumnDef::new("v", ColKind::InrowSt { len: 8, nullable: false }),
					],
				},
				TableDef {
					name: "source".into(),
					nobs_row_ref: 2,
					nobs_ref_count: 0,
					nobs_outrow_ptr: 4,
					columns: vec![
						ColumnDef::new("r", ColKind::Ref { table: 0 }),
						ColumnDef::new("pad", ColKind::InrowSt { len: 8, nullable: false }),
					],
				},
			],
		};
		let layout = TableLayout::build(&schema, 0).unwrap();
		assert_eq!(layout.n_bm, 0);
		assert_eq!(layout.nobs_ref_count, 2);
		assert_eq!(layout.max_ref_count(), 0x7fff);
		assert_eq!(layout.n, 10);
		// Unreferenced table without nullable columns keeps one flag byte.
		let layout = TableLayout::build(&schema, 1).unwrap();
		assert_eq!(layout.n_bm, 1);
		assert_eq!(layout.nobs_ref_count, 0);
		assert_eq!(layout.cols[0].len, 2);
		assert_eq!(layout.n, 11);
	}

	#[test]
	fn inrow_array_width() {
		let schema = Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 4,
				columns: vec![ColumnDef::new("a", ColKind::InrowArray {
					max_size: 10,
					nullable: false,
					elem: ElemKind::InrowSt { len: 3, nullable: true },
				})],
			}],
		};
		let layout = TableLayout::build(&schema, 0).unwrap();
		// 1 size byte + 2 bitmap bytes + 10 * 3 element bytes.
		assert_eq!(layout.cols[0].len, 1 + 2 + 30);
	}

	#[test]
	fn bitmap_spans_up_to_eight_bytes() {
		let mut columns = Vec::new();
		for i in 0..63 {
			columns.push(ColumnDef::new(
				&format!("c{}", i), ColKind::InrowSt { len: 1, nullable: true }));
		}
		let mut schema = Schema {
			tables: vec![TableDef {
				name: "wide".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 1,
				columns,
			}],
		};
		let layout = TableLayout::build(&schema, 0).unwrap();
		assert_eq!(layout.n_bm, 8);
		assert_eq!(layout.cols[0].null_mask, 1);
		assert_eq!(layout.cols[62].null_mask, 1u64 << 62);
		assert_eq!(layout.gap_flag(), 1u64 << 63);
		assert_eq!(layout.n, 8 + 63);

		// A 64th null bit would collide with the gap flag.
		schema.tables[0].columns.push(
			ColumnDef::new("c63", ColKind::InrowSt { len: 1, nullable: true }));
		assert!(matches!(
			TableLayout::build(&schema, 0),
			Err(crate::error::Error::ImplementationRestriction(_))
		));
	}

	#[test]
	fn widest_counter_and_reference_fields() {
		let schema = Schema {
			tables: vec![
				TableDef {
					name: "target".into(),
					nobs_row_ref: 8,
					nobs_ref_count: 8,
					nobs_outrow_ptr: 8,
					columns: vec![
						ColumnDef::new("v", ColKind::InrowSt { len: 4, nullable: true }),
					],
				},
				TableDef {
					name: "source".into(),
					nobs_row_ref: 1,
					nobs_ref_count: 0,
					nobs_outrow_ptr: 8,
					columns: vec![
						ColumnDef::new("r", ColKind::Ref { table: 0 }),
						ColumnDef::new("big", ColKind::OutrowSt { length_len: 8 }),
					],
				},
			],
		};
		let target = TableLayout::build(&schema, 0).unwrap();
		// One null bit keeps a bitmap byte; the counter follows it.
		assert_eq!(target.n_bm, 1);
		assert_eq!(target.nobs_ref_count, 8);
		assert_eq!(target.max_ref_count(), u64::MAX);
		assert_eq!(target.cols[0].offset, 9);

		let source = TableLayout::build(&schema, 1).unwrap();
		assert_eq!(source.cols[0].len, 8);
		// Length and pointer fields at their widest.
		assert_eq!(source.cols[1].len, 16);
	}

	#[test]
	fn rejects_referenced_without_rc() {
		let mut schema = two_col_table();
		schema.tables[0].columns.push(
			ColumnDef::new("r", ColKind::Ref { table: 0 }));
		assert!(matches!(
			TableLayout::build(&schema, 0),
			Err(crate::error::Error::IllegalArgument(_))
		));
	}

	#[test]
	fn rejects_narrow_slot() {
		let schema = Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 1,
				columns: vec![
					ColumnDef::new("a", ColKind::InrowSt { len: 2, nullable: false }),
				],
			}],
		};
		assert!(matches!(
			TableLayout::build(&schema, 0),
			Err(crate::error::Error::ImplementationRestriction(_))
		));
	}
}
