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

// Schema evolution on existing files: inserting a column and changing
// the width of references into a table. Both rewrite every row through
// the accommodation engine and run without a unit; take a file backup
// first and reach for [`Database::recover`] if one fails mid-way.

use crate::{
	accommodate::{accommodate, RowUpdater, Spot, VlAccess},
	codec::{self, ReadCtx},
	db::Database,
	error::{Error, Result},
	flspace::FlSpace,
	layout::{
		max_uint, read_uint, write_uint, ColKind, ColLayout, ColumnDef,
		ElemKind, TableLayout,
	},
	store::{is_gap, Store},
	value::{RowRef, Value},
};

/// Shifts the null bits at and above the inserted position one up and
/// writes the new column's bit.
struct NullBitInsert {
	old_n_bm: usize,
	bit: u32,
	set: bool,
}

impl RowUpdater for NullBitInsert {
	fn update(&mut self, old_row: &[u8], out: &mut [u8], _vl: &mut VlAccess<'_>) -> Result<()> {
		let old = read_uint(&old_row[0..self.old_n_bm]);
		let below = old & ((1u64 << self.bit) - 1);
		let above = (old >> self.bit) << (self.bit + 1);
		let mut bits = below | above;
		if self.set {
			bits |= 1u64 << self.bit;
		}
		write_uint(out, bits);
		Ok(())
	}
}

/// Writes the same encoded initial value into every row.
struct ConstantInit {
	bytes: Vec<u8>,
}

impl RowUpdater for ConstantInit {
	fn update(&mut self, _old_row: &[u8], out: &mut [u8], _vl: &mut VlAccess<'_>) -> Result<()> {
		out.copy_from_slice(&self.bytes);
		Ok(())
	}
}

/// Encodes the initial value per row, allocating that row's own payload
/// blobs. Used when the inserted column stores anything outrow.
struct OutrowInit {
	layout: TableLayout,
	col: usize,
	value: Value,
}

impl RowUpdater for OutrowInit {
	fn update(&mut self, _old_row: &[u8], out: &mut [u8], vl: &mut VlAccess<'_>) -> Result<()> {
		let ctx = ReadCtx {
			layout: &self.layout,
			vl: vl.file,
			cipher: vl.cipher,
		};
		let mut slot = vec![0u8; self.layout.n];
		let mut scratch = Vec::new();
		// Counter credits are applied once for all rows by the caller.
		let mut rc = Vec::new();
		codec::write_value(
			&ctx, &self.layout.cols[self.col], &mut slot, &self.value,
			vl.space, None, &mut scratch, &mut rc,
		)?;
		let ci = &self.layout.cols[self.col];
		out.copy_from_slice(&slot[ci.offset..ci.offset + ci.len]);
		Ok(())
	}
}

/// Rebuilds an inrow array of references element by element at the new
/// reference width.
struct InrowRefArrayResize {
	offset: usize,
	size_len: usize,
	old_nobs: usize,
	new_nobs: usize,
}

impl RowUpdater for InrowRefArrayResize {
	fn update(&mut self, old_row: &[u8], out: &mut [u8], _vl: &mut VlAccess<'_>) -> Result<()> {
		let field = &old_row[self.offset..];
		for b in out.iter_mut() {
			*b = 0;
		}
		let size = read_uint(&field[0..self.size_len]) as usize;
		out[0..self.size_len].copy_from_slice(&field[0..self.size_len]);
		for i in 0..size {
			let from = self.size_len + i * self.old_nobs;
			let to = self.size_len + i * self.new_nobs;
			let value = read_uint(&field[from..from + self.old_nobs]);
			write_uint(&mut out[to..to + self.new_nobs], value);
		}
		Ok(())
	}
}

/// Rewrites an outrow array of references: in place when the blob
/// shrinks, through a fresh allocation when it grows. The slot field
/// keeps its width; length and pointer are updated.
struct OutrowRefArrayResize {
	offset: usize,
	length_len: usize,
	size_len: usize,
	old_nobs: usize,
	new_nobs: usize,
	nobs_outrow_ptr: usize,
}

impl RowUpdater for OutrowRefArrayResize {
	fn update(&mut self, old_row: &[u8], out: &mut [u8], vl: &mut VlAccess<'_>) -> Result<()> {
		let field = &old_row[self.offset..self.offset + out.len()];
		let blob_len = read_uint(&field[0..self.length_len]);
		let ptr = read_uint(&field[self.length_len..]);
		if blob_len == 0 && ptr == 0 {
			for b in out.iter_mut() {
				*b = 0;
			}
			return Ok(());
		}
		let mut old_blob = vec![0u8; blob_len as usize];
		vl.file.read_at(&mut old_blob, ptr)?;
		let size = read_uint(&old_blob[0..self.size_len]) as usize;
		let new_len = (self.size_len + size * self.new_nobs) as u64;
		let mut new_blob = vec![0u8; new_len as usize];
		new_blob[0..self.size_len].copy_from_slice(&old_blob[0..self.size_len]);
		for i in 0..size {
			let from = self.size_len + i * self.old_nobs;
			let to = self.size_len + i * self.new_nobs;
			let value = read_uint(&old_blob[from..from + self.old_nobs]);
			write_uint(&mut new_blob[to..to + self.new_nobs], value);
		}
		let new_ptr = if new_len > blob_len {
			let new_ptr = vl.space.allocate(new_len, vl.file, None)?;
			vl.file.write_at(&new_blob, new_ptr)?;
			vl.space.deallocate(ptr, blob_len, vl.file, None);
			new_ptr
		} else {
			vl.file.write_at(&new_blob, ptr)?;
			if new_len < blob_len {
				vl.space.deallocate(ptr + new_len, blob_len - new_len, vl.file, None);
			}
			ptr
		};
		if new_ptr > max_uint(self.nobs_outrow_ptr) {
			return Err(Error::MaximumExceeded(
				format!("VL pointer {} exceeds its width", new_ptr)));
		}
		write_uint(&mut out[0..self.length_len], new_len);
		write_uint(&mut out[self.length_len..], new_ptr);
		Ok(())
	}
}

/// Distinct reference targets of an initial value, with multiplicity.
fn ref_multiplicities(value: &Value) -> Vec<(RowRef, u64)> {
	let mut refs: Vec<RowRef> = match value {
		Value::Ref(r) if !r.is_null() => vec![*r],
		Value::Array(values) => values
			.iter()
			.filter_map(|v| match v {
				Value::Ref(r) if !r.is_null() => Some(*r),
				_ => None,
			})
			.collect(),
		_ => Vec::new(),
	};
	refs.sort_unstable();
	let mut out: Vec<(RowRef, u64)> = Vec::new();
	for r in refs {
		match out.last_mut() {
			Some((last, count)) if *last == r => *count += 1,
			_ => out.push((r, 1)),
		}
	}
	out
}

impl Database {
	/// Runs one accommodation over a store and reopens its FL space at
	/// the new width.
	fn accommodate_store(&mut self, index: usize, spots: &mut Vec<Spot>) -> Result<()> {
		let cipher = self.cipher.as_deref();
		let mut read_buf = self.buffers.gb1();
		let mut write_buf = self.buffers.gb3();
		let Store { fl, vl, vl_space, layout, fl_space, .. } = &mut self.stores[index];
		let mut vla = VlAccess { file: &*vl, space: vl_space, cipher };
		let new_n = accommodate(
			&*fl, layout.n, spots, &mut vla, &mut read_buf, &mut write_buf)?;
		*fl_space = FlSpace::open(&*fl, new_n)?;
		Ok(())
	}

	/// Adds RC bytes directly, outside any unit. Migration bookkeeping.
	fn credit_rc(&mut self, store: usize, row: RowRef, delta: u64) -> Result<()> {
		let s = &mut self.stores[store];
		let layout = &s.layout;
		let pos = s.ref_to_pos(row)?;
		let head = layout.n_bm + layout.nobs_ref_count;
		let mut slot_head = vec![0u8; head];
		s.fl.read_at(&mut slot_head, pos)?;
		if is_gap(&slot_head) {
			return Err(Error::IllegalReference(row.index()));
		}
		let rc = layout.ref_count(&slot_head);
		let new = rc.checked_add(delta)
			.filter(|v| *v <= layout.max_ref_count())
			.ok_or_else(|| Error::MaximumExceeded(
				format!("reference counter of {} in {}", row, s.name)))?;
		layout.set_ref_count(&mut slot_head, new);
		s.fl.write_at(
			&slot_head[layout.n_bm..layout.n_bm + layout.nobs_ref_count],
			pos + layout.n_bm as u64,
		)
	}

	fn rebuild_layouts(&mut self) -> Result<()> {
		for index in 0..self.stores.len() {
			let layout = TableLayout::build(&self.schema, index)?;
			let store = &mut self.stores[index];
			if layout.n != store.layout.n {
				store.fl_space = FlSpace::open(&store.fl, layout.n)?;
			}
			store.layout = layout;
		}
		Ok(())
	}

	/// Inserts `column` at schema position `index` of `table`; every
	/// existing row receives `initial`. When the column makes its target
	/// table referenced for the first time, that table's rows grow a
	/// reference counter of `nobs_ref_count` bytes.
	///
	/// Runs unlogged: back the files up first. The database must be
	/// otherwise idle and should be closed promptly afterwards.
	pub fn insert_column(
		&mut self,
		table: usize,
		index: usize,
		column: ColumnDef,
		initial: &Value,
		nobs_ref_count: usize,
	) -> Result<()> {
		self.check_open()?;
		let old_layout = self.stores[table].layout.clone();
		if index > old_layout.cols.len() {
			return Err(Error::IllegalArgument(
				format!("column position {} of {}", index, old_layout.cols.len())));
		}

		let mut new_schema = self.schema.clone();
		new_schema.tables[table].columns.insert(index, column.clone());
		let target = match &column.kind {
			ColKind::Ref { table } => Some(*table),
			ColKind::InrowArray { elem: ElemKind::Ref { table }, .. } => Some(*table),
			ColKind::OutrowArray { elem: ElemKind::Ref { table }, .. } => Some(*table),
			_ => None,
		};
		let install_rc = match target {
			Some(t) if !self.stores[t].layout.referenced => {
				new_schema.tables[t].nobs_ref_count = nobs_ref_count;
				Some(t)
			}
			_ => None,
		};

		// Validate every new layout and the initial value's targets before
		// touching any file; the rewrite below cannot be unwound.
		for t in 0..new_schema.tables.len() {
			TableLayout::build(&new_schema, t)?;
		}
		if let Some(t) = target {
			for (row, _) in ref_multiplicities(initial) {
				let s = &self.stores[t];
				let pos = s.ref_to_pos(row)?;
				let mut first = [0u8; 1];
				s.fl.read_at(&mut first, pos)?;
				if first[0] & 0x80 != 0 {
					return Err(Error::IllegalReference(row.index()));
				}
			}
		}
		let new_layout = TableLayout::build(&new_schema, table)?;
		let ci = new_layout.cols[index].clone();
		let outrow_init = ci.layout.is_outrow() || ci.layout.has_outrow_elems();

		// Encode the initial value once up front; this also validates it
		// against the new column before any row is rewritten.
		let const_bytes = {
			let cipher = self.cipher.as_deref();
			let Store { vl, vl_space, .. } = &mut self.stores[table];
			let ctx = ReadCtx { layout: &new_layout, vl: &*vl, cipher };
			let mut slot = vec![0u8; new_layout.n];
			let mut scratch = Vec::new();
			let mut rc = Vec::new();
			if outrow_init {
				// Dry-run on a copy of the space state: allocations here
				// are placeholders, each row allocates its own below.
				let mut probe = slot.clone();
				codec::write_value(
					&ctx, &ci, &mut probe, initial, vl_space, None,
					&mut scratch, &mut rc,
				)?;
				codec::release_value(
					&ctx, &ci, &probe, vl_space, None, &mut rc, &mut scratch)?;
				Vec::new()
			} else {
				codec::write_value(
					&ctx, &ci, &mut slot, initial, vl_space, None,
					&mut scratch, &mut rc,
				)?;
				slot[ci.offset..ci.offset + ci.len].to_vec()
			}
		};

		// Install the reference counter on the target table first, so the
		// credits for the initial value land in real counter bytes.
		if let Some(t) = install_rc {
			if t != table {
				let old_n_bm = self.stores[t].layout.n_bm;
				let new_t = TableLayout::build(&new_schema, t)?;
				let mut spots = Vec::new();
				// A table with no null info sheds its flag byte once the
				// counter leads the slot.
				if new_t.n_bm != old_n_bm {
					spots.push(Spot::resize(0, old_n_bm, new_t.n_bm));
				}
				spots.push(Spot::resize(old_n_bm, 0, nobs_ref_count));
				self.accommodate_store(t, &mut spots)?;
			}
		}

		let mut spots = Vec::new();
		if ci.null_mask != 0 {
			spots.push(Spot::with(
				0,
				old_layout.n_bm,
				new_layout.n_bm,
				Box::new(NullBitInsert {
					old_n_bm: old_layout.n_bm,
					bit: ci.null_mask.trailing_zeros(),
					set: initial.is_null(),
				}),
			));
		} else if new_layout.n_bm != old_layout.n_bm {
			// Installing a counter on a self-referencing table can shed
			// the flag byte without a new null bit being involved.
			spots.push(Spot::resize(0, old_layout.n_bm, new_layout.n_bm));
		}
		if install_rc == Some(table) {
			spots.push(Spot::resize(old_layout.n_bm, 0, nobs_ref_count));
		}
		let value_offset = if index < old_layout.cols.len() {
			old_layout.cols[index].offset
		} else {
			old_layout.n
		};
		if outrow_init {
			spots.push(Spot::with(value_offset, 0, ci.len, Box::new(OutrowInit {
				layout: new_layout.clone(),
				col: index,
				value: initial.clone(),
			})));
		} else {
			spots.push(Spot::with(value_offset, 0, ci.len, Box::new(ConstantInit {
				bytes: const_bytes,
			})));
		}
		self.accommodate_store(table, &mut spots)?;

		self.schema = new_schema;
		self.rebuild_layouts()?;

		// Each existing row now references the initial value's targets.
		if let Some(t) = target {
			let live = self.stores[table].slot_count()
				- self.stores[table].fl_space.gap_count();
			if live > 0 {
				for (row, count) in ref_multiplicities(initial) {
					self.credit_rc(t, row, count * live)?;
				}
			}
		}

		for &s in [table].iter().chain(target.iter()) {
			self.stores[s].fl.sync()?;
			self.stores[s].vl.sync()?;
		}
		log::info!(
			target: "rowstore",
			"Inserted column {} into {} at {}",
			column.name,
			self.stores[table].name,
			index,
		);
		Ok(())
	}

	/// Changes the width of references into `target` to `new_nobs` bytes,
	/// rewriting every referencing column of every table. References keep
	/// their numeric value; narrowing requires the width to still hold
	/// the highest used row index.
	///
	/// Runs unlogged: back the files up first. The database must be
	/// otherwise idle and should be closed promptly afterwards.
	pub fn change_ref_len(&mut self, target: usize, new_nobs: usize) -> Result<()> {
		self.check_open()?;
		if new_nobs < 1 || new_nobs > 8 {
			return Err(Error::IllegalArgument(
				format!("nobsRowRef must be in [1..8], got {}", new_nobs)));
		}
		let old_nobs = self.stores[target].layout.nobs_row_ref;
		if new_nobs == old_nobs {
			return Ok(());
		}
		let highest = self.max_row_index(target);
		if highest > max_uint(new_nobs) {
			return Err(Error::IllegalArgument(format!(
				"row index {} of {} does not fit {} bytes",
				highest, self.stores[target].name, new_nobs)));
		}

		let mut new_schema = self.schema.clone();
		new_schema.tables[target].nobs_row_ref = new_nobs;
		for t in 0..new_schema.tables.len() {
			TableLayout::build(&new_schema, t)?;
		}

		for s in 0..self.stores.len() {
			let mut spots = Vec::new();
			{
				let layout = &self.stores[s].layout;
				for col in &layout.cols {
					if col.layout.ref_target() != Some(target) {
						continue;
					}
					match &col.layout {
						ColLayout::Ref { .. } => {
							spots.push(Spot::resize(col.offset, old_nobs, new_nobs));
						}
						ColLayout::InrowArray { size_len, max_size, .. } => {
							spots.push(Spot::with(
								col.offset,
								col.len,
								size_len + *max_size as usize * new_nobs,
								Box::new(InrowRefArrayResize {
									offset: col.offset,
									size_len: *size_len,
									old_nobs,
									new_nobs,
								}),
							));
						}
						ColLayout::OutrowArray { length_len, size_len, .. } => {
							spots.push(Spot::with(
								col.offset,
								col.len,
								col.len,
								Box::new(OutrowRefArrayResize {
									offset: col.offset,
									length_len: *length_len,
									size_len: *size_len,
									old_nobs,
									new_nobs,
									nobs_outrow_ptr: layout.nobs_outrow_ptr,
								}),
							));
						}
						_ => {}
					}
				}
			}
			if spots.is_empty() {
				continue;
			}
			self.accommodate_store(s, &mut spots)?;
			self.stores[s].fl.sync()?;
			self.stores[s].vl.sync()?;
		}

		self.schema = new_schema;
		self.rebuild_layouts()?;
		log::info!(
			target: "rowstore",
			"References into {} now take {} bytes",
			self.stores[target].name,
			new_nobs,
		);
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use crate::db::Database;
	use crate::error::Error;
	use crate::layout::{ColKind, ColumnDef, ElemKind, Schema, TableDef};
	use crate::value::{RowRef, Value};

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("rowstore-test");
			path.push("schema");
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

	fn ref_schema(nobs_row_ref: usize) -> Schema {
		Schema {
			tables: vec![
				TableDef {
					name: "target".into(),
					nobs_row_ref,
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
						ColumnDef::new("pad", ColKind::InrowSt { len: 4, nullable: true }),
						ColumnDef::new("r", ColKind::Ref { table: 0 }),
						ColumnDef::new("inrefs", ColKind::InrowArray {
							max_size: 3,
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

	fn fill_targets(db: &mut Database, count: u64) -> Vec<RowRef> {
		(0..count)
			.map(|_| db.insert(0, &[bytes(b"12345678")]).unwrap())
			.collect()
	}

	#[test]
	fn narrowing_preserves_reference_values() {
		let dir = TempDir::new("narrowing_preserves_reference_values");
		let mut db = Database::open(&dir.0, ref_schema(4), None).unwrap();
		let targets = fill_targets(&mut db, 42 + 1);
		let t42 = targets[41];
		assert_eq!(t42.index(), 0x2a);
		let s = db
			.insert(1, &[
				bytes(b"pppp"),
				Value::Ref(t42),
				Value::Array(vec![Value::Ref(t42), Value::Ref(targets[0])]),
				Value::Array(vec![Value::Ref(t42); 3]),
			])
			.unwrap();
		let old_n = db.stores[1].layout.n;
		let off = db.stores[1].layout.cols[1].offset;
		let raw = std::fs::read(dir.0.join("table_01_fl")).unwrap();
		assert_eq!(&raw[16 + off..16 + off + 4], &[0, 0, 0, 0x2a]);

		db.change_ref_len(0, 2).unwrap();

		// The row narrowed by 2 for the plain field and 2 per inrow
		// array element.
		assert_eq!(db.stores[1].layout.n, old_n - 2 - 3 * 2);
		let off = db.stores[1].layout.cols[1].offset;
		let raw = std::fs::read(dir.0.join("table_01_fl")).unwrap();
		assert_eq!(&raw[16 + off..16 + off + 2], &[0x00, 0x2a]);
		assert_eq!(
			db.get(1, s, &[1, 2, 3]).unwrap(),
			vec![
				Value::Ref(t42),
				Value::Array(vec![Value::Ref(t42), Value::Ref(targets[0])]),
				Value::Array(vec![Value::Ref(t42); 3]),
			],
		);
		// The counters still guard deletion after the rewrite.
		assert!(matches!(
			db.delete(0, t42),
			Err(Error::DeleteConstraint(_, 5))
		));
	}

	#[test]
	fn narrowing_rejects_unrepresentable_rows() {
		let dir = TempDir::new("narrowing_rejects_unrepresentable_rows");
		let mut db = Database::open(&dir.0, ref_schema(4), None).unwrap();
		fill_targets(&mut db, 300);
		assert!(matches!(
			db.change_ref_len(0, 1),
			Err(Error::IllegalArgument(_))
		));
	}

	#[test]
	fn widening_preserves_reference_values() {
		let dir = TempDir::new("widening_preserves_reference_values");
		let mut db = Database::open(&dir.0, ref_schema(2), None).unwrap();
		let targets = fill_targets(&mut db, 3);
		let s = db
			.insert(1, &[
				Value::Null,
				Value::Ref(targets[2]),
				Value::Array(vec![Value::Ref(targets[1])]),
				Value::Array(vec![Value::Ref(targets[0]), Value::Ref(targets[2])]),
			])
			.unwrap();
		let old_n = db.stores[1].layout.n;

		db.change_ref_len(0, 4).unwrap();
		assert_eq!(db.stores[1].layout.n, old_n + 2 + 3 * 2);
		assert_eq!(
			db.get(1, s, &[0, 1, 2, 3]).unwrap(),
			vec![
				Value::Null,
				Value::Ref(targets[2]),
				Value::Array(vec![Value::Ref(targets[1])]),
				Value::Array(vec![Value::Ref(targets[0]), Value::Ref(targets[2])]),
			],
		);
		// Still updatable at the new width.
		db.update(1, s, 1, &Value::Ref(targets[0])).unwrap();
		assert_eq!(
			db.get(1, s, &[1]).unwrap(),
			vec![Value::Ref(targets[0])],
		);
	}

	#[test]
	fn column_insert_fills_existing_rows() {
		let dir = TempDir::new("column_insert_fills_existing_rows");
		let schema = Schema {
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
		};
		let mut db = Database::open(&dir.0, schema, None).unwrap();
		db.insert(0, &[bytes(b"aaaa"), Value::Null]).unwrap();
		db.insert(0, &[Value::Null, bytes(b"bbbb")]).unwrap();

		// An all-zero non-null initial value must not read back as null.
		db.insert_column(
			0, 1,
			ColumnDef::new("mid", ColKind::InrowSt { len: 2, nullable: true }),
			&bytes(&[0, 0]),
			0,
		).unwrap();

		assert_eq!(
			db.get(0, RowRef::new(1), &[0, 1, 2]).unwrap(),
			vec![bytes(b"aaaa"), bytes(&[0, 0]), Value::Null],
		);
		assert_eq!(
			db.get(0, RowRef::new(2), &[0, 1, 2]).unwrap(),
			vec![Value::Null, bytes(&[0, 0]), bytes(b"bbbb")],
		);
		// New rows use the widened slots.
		let r = db
			.insert(0, &[bytes(b"cccc"), Value::Null, bytes(b"dddd")])
			.unwrap();
		assert_eq!(
			db.get(0, r, &[0, 1, 2]).unwrap(),
			vec![bytes(b"cccc"), Value::Null, bytes(b"dddd")],
		);
	}

	#[test]
	fn column_insert_with_outrow_initial_allocates_per_row() {
		let dir = TempDir::new("column_insert_with_outrow_initial_allocates_per_row");
		let schema = Schema {
			tables: vec![TableDef {
				name: "t".into(),
				nobs_row_ref: 2,
				nobs_ref_count: 0,
				nobs_outrow_ptr: 4,
				columns: vec![
					ColumnDef::new("a", ColKind::InrowSt { len: 4, nullable: true }),
				],
			}],
		};
		let mut db = Database::open(&dir.0, schema, None).unwrap();
		for i in 0..3u8 {
			db.insert(0, &[bytes(&[i; 4])]).unwrap();
		}
		db.insert_column(
			0, 1,
			ColumnDef::new("blob", ColKind::OutrowSt { length_len: 2 }),
			&bytes(b"initial payload"),
			0,
		).unwrap();

		// Every row owns its own copy.
		for i in 1..=3u64 {
			assert_eq!(
				db.get(0, RowRef::new(i), &[1]).unwrap(),
				vec![bytes(b"initial payload")],
			);
		}
		db.update(0, RowRef::new(2), 1, &bytes(b"changed")).unwrap();
		assert_eq!(
			db.get(0, RowRef::new(1), &[1]).unwrap(),
			vec![bytes(b"initial payload")],
		);
		assert_eq!(
			db.get(0, RowRef::new(2), &[1]).unwrap(),
			vec![bytes(b"changed")],
		);
	}

	#[test]
	fn ref_column_insert_installs_the_counter() {
		let dir = TempDir::new("ref_column_insert_installs_the_counter");
		let schema = Schema {
			tables: vec![
				TableDef {
					name: "a".into(),
					nobs_row_ref: 2,
					nobs_ref_count: 0,
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
						ColumnDef::new("w", ColKind::InrowSt { len: 8, nullable: false }),
					],
				},
			],
		};
		let mut db = Database::open(&dir.0, schema, None).unwrap();
		let a1 = db.insert(0, &[bytes(b"12345678")]).unwrap();
		for i in 0..4u8 {
			db.insert(1, &[bytes(&[i; 8])]).unwrap();
		}
		assert!(!db.stores[0].layout.referenced);

		db.insert_column(
			1, 1,
			ColumnDef::new("r", ColKind::Ref { table: 0 }),
			&Value::Ref(a1),
			2,
		).unwrap();

		// Table a grew a counter crediting all four initial references.
		assert!(db.stores[0].layout.referenced);
		assert_eq!(db.stores[0].layout.nobs_ref_count, 2);
		match db.delete(0, a1) {
			Err(Error::DeleteConstraint(_, rc)) => assert_eq!(rc, 4),
			other => panic!("expected a delete constraint, got {:?}", other.err()),
		}
		// Clearing the references one by one frees the target.
		db.update_all(1, 1, |_| Value::Ref(RowRef::NULL)).unwrap();
		db.delete(0, a1).unwrap();
	}

	#[test]
	fn nullable_column_insert_shifts_existing_null_bits() {
		let dir = TempDir::new("nullable_column_insert_shifts_existing_null_bits");
		let schema = Schema {
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
		};
		let mut db = Database::open(&dir.0, schema, None).unwrap();
		db.insert(0, &[Value::Null, bytes(b"bbbb")]).unwrap();
		db.insert(0, &[bytes(b"aaaa"), Value::Null]).unwrap();

		db.insert_column(
			0, 0,
			ColumnDef::new("front", ColKind::InrowSt { len: 4, nullable: true }),
			&Value::Null,
			0,
		).unwrap();

		assert_eq!(
			db.get(0, RowRef::new(1), &[0, 1, 2]).unwrap(),
			vec![Value::Null, Value::Null, bytes(b"bbbb")],
		);
		assert_eq!(
			db.get(0, RowRef::new(2), &[0, 1, 2]).unwrap(),
			vec![Value::Null, bytes(b"aaaa"), Value::Null],
		);
	}
}
