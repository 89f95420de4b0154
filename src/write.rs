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

// The write operations. All share the same skeleton: run inside a unit,
// mutate VL bytes before committing the slot, write the slot ranges that
// actually changed (bitmap first, then columns in ascending offset),
// apply the aggregated reference-counter deltas last.

use crate::{
	codec::{self, ReadCtx},
	db::Database,
	error::{Error, Result},
	file::DbFile,
	layout::FL_HEADER_SIZE,
	store::{is_gap, SlotScan, Store},
	unit::Unit,
	value::{RowRef, Value},
};

/// Records and writes the ranges of the slot that differ: the bitmap
/// first, then each given column range in ascending offset.
fn write_changed(
	fl: &DbFile,
	unit: &mut Unit,
	pos: u64,
	old: &[u8],
	new: &[u8],
	n_bm: usize,
	ranges: &mut Vec<(usize, usize)>,
) -> Result<()> {
	if n_bm > 0 && old[0..n_bm] != new[0..n_bm] {
		unit.record_slice(fl, pos, old, 0, n_bm)?;
		fl.write_at(&new[0..n_bm], pos)?;
	}
	ranges.sort_unstable();
	for (off, len) in ranges.iter() {
		if old[*off..off + len] != new[*off..off + len] {
			unit.record_slice(fl, pos + *off as u64, old, *off, *len)?;
			fl.write_at(&new[*off..off + len], pos + *off as u64)?;
		}
	}
	Ok(())
}

impl Database {
	/// Inserts a row; `values` matches the schema column order. Returns
	/// the new row's reference.
	pub fn insert(&mut self, table: usize, values: &[Value]) -> Result<RowRef> {
		self.run_unit(|db, unit| {
			let (pos, deltas) = {
				let cipher = db.cipher.as_deref();
				let mut scratch = db.buffers.gb3();
				let Store { layout, fl, vl, fl_space, vl_space, .. } =
					&mut db.stores[table];
				if values.len() != layout.cols.len() {
					return Err(Error::IllegalArgument(format!(
						"{} values for {} columns", values.len(), layout.cols.len())));
				}
				let pos = fl_space.allocate(fl, unit)?;
				let ctx = ReadCtx { layout: &*layout, vl: &*vl, cipher };
				let mut slot = vec![0u8; layout.n];
				let mut deltas = Vec::new();
				for (col, value) in layout.cols.iter().zip(values) {
					codec::write_value(
						&ctx, col, &mut slot, value, vl_space, Some(unit),
						&mut scratch, &mut deltas,
					)?;
				}
				// VL payloads are on disk by now; commit the slot.
				fl.write_at(&slot, pos)?;
				(pos, deltas)
			};
			db.apply_rc(deltas, unit)?;
			let r = RowRef::from_slot(db.stores[table].fl_space.index_of(pos));
			log::trace!(target: "rowstore", "{}: inserted {}", db.stores[table].id, r);
			Ok(r)
		})
	}

	/// Deletes a row. Fails while other rows still reference it.
	pub fn delete(&mut self, table: usize, r: RowRef) -> Result<()> {
		self.run_unit(|db, unit| {
			let mut slot = Vec::new();
			let pos = db.stores[table].load_slot(r, &mut slot)?;
			let n = db.stores[table].layout.n;
			let rc = db.stores[table].layout.ref_count(&slot[0..n]);
			if rc > 0 {
				return Err(Error::DeleteConstraint(r.index(), rc));
			}
			let deltas = {
				let cipher = db.cipher.as_deref();
				let mut buf = db.buffers.gb2();
				let Store { layout, fl, fl_space, vl, vl_space, .. } =
					&mut db.stores[table];
				let ctx = ReadCtx { layout: &*layout, vl: &*vl, cipher };
				let mut deltas = Vec::new();
				for col in &layout.cols {
					codec::release_value(
						&ctx, col, &slot[0..n], vl_space, Some(&mut *unit),
						&mut deltas, &mut buf,
					)?;
				}
				unit.record(fl, pos, &slot[0..n])?;
				fl_space.deallocate(fl, unit, pos)?;
				deltas
			};
			db.apply_rc(deltas, unit)?;
			log::trace!(target: "rowstore", "{}: deleted {}", db.stores[table].id, r);
			Ok(())
		})
	}

	/// Replaces the value of one column of one row.
	pub fn update(&mut self, table: usize, r: RowRef, col: usize, value: &Value) -> Result<()> {
		self.run_unit(|db, unit| {
			let mut old = Vec::new();
			let pos = db.stores[table].load_slot(r, &mut old)?;
			let n = db.stores[table].layout.n;
			old.truncate(n);
			let deltas = {
				let cipher = db.cipher.as_deref();
				let mut scratch = db.buffers.gb3();
				let Store { layout, fl, vl, vl_space, .. } = &mut db.stores[table];
				let ci = layout.cols.get(col).ok_or_else(|| {
					Error::IllegalArgument(format!("no column {}", col))
				})?;
				let ctx = ReadCtx { layout: &*layout, vl: &*vl, cipher };
				let mut new = old.clone();
				let mut deltas = Vec::new();
				codec::write_value(
					&ctx, ci, &mut new, value, vl_space, Some(unit),
					&mut scratch, &mut deltas,
				)?;
				let mut ranges = vec![(ci.offset, ci.len)];
				write_changed(fl, unit, pos, &old, &new, layout.n_bm, &mut ranges)?;
				deltas
			};
			db.apply_rc(deltas, unit)
		})
	}

	/// Walks every live row and replaces the selected columns with the
	/// values `f` produces. When `decode_old` is set, `f` receives the
	/// current values of the selection.
	fn update_all_inner<F>(
		&mut self,
		table: usize,
		cols: &[usize],
		decode_old: bool,
		mut f: F,
	) -> Result<()>
	where
		F: FnMut(RowRef, Vec<Value>) -> Result<Vec<Value>>,
	{
		self.run_unit(|db, unit| {
			let deltas = {
				let cipher = db.cipher.as_deref();
				let mut scan_buf = db.buffers.gb1();
				let mut scratch = db.buffers.gb3();
				let mut vbuf = db.buffers.gb2();
				let Store { layout, fl, fl_space, vl, vl_space, .. } =
					&mut db.stores[table];
				for &c in cols {
					if c >= layout.cols.len() {
						return Err(Error::IllegalArgument(format!("no column {}", c)));
					}
				}
				let ctx = ReadCtx { layout: &*layout, vl: &*vl, cipher };
				let n = layout.n;
				let slots = fl_space.slot_count(fl);
				let mut deltas = Vec::new();
				let mut scan = SlotScan::new(fl, &mut scan_buf, n, 0, slots);
				while let Some((slot_index, bytes)) = scan.next()? {
					if is_gap(bytes) {
						continue;
					}
					let old = bytes.to_vec();
					let r = RowRef::from_slot(slot_index);
					let old_values = if decode_old {
						let mut values = Vec::with_capacity(cols.len());
						for &c in cols {
							values.push(codec::read_value(
								&ctx, &layout.cols[c], &old, &mut vbuf)?);
						}
						values
					} else {
						Vec::new()
					};
					let new_values = f(r, old_values)?;
					if new_values.len() != cols.len() {
						return Err(Error::IllegalArgument(format!(
							"{} values for {} columns", new_values.len(), cols.len())));
					}
					let mut new = old.clone();
					for (&c, value) in cols.iter().zip(&new_values) {
						codec::write_value(
							&ctx, &layout.cols[c], &mut new, value, vl_space,
							Some(unit), &mut scratch, &mut deltas,
						)?;
					}
					let pos = FL_HEADER_SIZE + slot_index * n as u64;
					let mut ranges: Vec<(usize, usize)> = cols
						.iter()
						.map(|&c| (layout.cols[c].offset, layout.cols[c].len))
						.collect();
					write_changed(fl, unit, pos, &old, &new, layout.n_bm, &mut ranges)?;
				}
				deltas
			};
			db.apply_rc(deltas, unit)
		})
	}

	/// Replaces one column of every live row with a supplied value.
	pub fn update_all<F>(&mut self, table: usize, col: usize, mut supplier: F) -> Result<()>
	where
		F: FnMut(RowRef) -> Value,
	{
		self.update_all_inner(table, &[col], false, |r, _| Ok(vec![supplier(r)]))
	}

	/// Replaces one column of every live row with a value computed from
	/// the current one. Costs an extra decode per row.
	pub fn update_all_changer<F>(&mut self, table: usize, col: usize, mut changer: F) -> Result<()>
	where
		F: FnMut(RowRef, Value) -> Value,
	{
		self.update_all_inner(table, &[col], true, |r, mut old| {
			let old = old.pop().ok_or_else(|| {
				Error::IllegalArgument("missing current value".into())
			})?;
			Ok(vec![changer(r, old)])
		})
	}

	/// Sets a group of columns of every live row to constant values.
	pub fn update_all_cols(&mut self, table: usize, col_values: &[(usize, Value)]) -> Result<()> {
		let cols: Vec<usize> = col_values.iter().map(|(c, _)| *c).collect();
		let values: Vec<Value> = col_values.iter().map(|(_, v)| v.clone()).collect();
		self.update_all_inner(table, &cols, false, |_, _| Ok(values.clone()))
	}
}
