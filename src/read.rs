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
	codec::{read_value, ReadCtx},
	db::Database,
	error::{Error, Result},
	layout::FL_HEADER_SIZE,
	store::is_gap,
	value::{RowRef, Value},
};

impl Database {
	/// Reads the selected columns of one row.
	pub fn get(&self, table: usize, r: RowRef, cols: &[usize]) -> Result<Vec<Value>> {
		self.check_open()?;
		let store = &self.stores[table];
		let mut slot = Vec::new();
		store.load_slot(r, &mut slot)?;
		let ctx = ReadCtx {
			layout: &store.layout,
			vl: &store.vl,
			cipher: self.cipher.as_deref(),
		};
		let mut buf = self.buffers.gb2();
		let mut out = Vec::with_capacity(cols.len());
		for &c in cols {
			let col = store.layout.cols.get(c).ok_or_else(|| {
				Error::IllegalArgument(format!("no column {} in {}", c, store.name))
			})?;
			out.push(read_value(&ctx, col, &slot[0..store.layout.n], &mut buf)?);
		}
		Ok(out)
	}

	/// Iterates the selected columns of the live rows whose index lies in
	/// `range` (1-based, end exclusive). Gaps are skipped.
	pub fn iterate(
		&self,
		table: usize,
		cols: &[usize],
		range: std::ops::Range<u64>,
	) -> Result<Rows<'_>> {
		self.check_open()?;
		let store = &self.stores[table];
		for &c in cols {
			if c >= store.layout.cols.len() {
				return Err(Error::IllegalArgument(
					format!("no column {} in {}", c, store.name)));
			}
		}
		let slots = store.slot_count();
		let start = range.start.max(1) - 1;
		let end = (range.end.max(1) - 1).min(slots);
		Ok(Rows {
			db: self,
			table,
			cols: cols.to_vec(),
			buf: Vec::new(),
			next: start.min(end),
			end,
			chunk_start: 0,
			chunk_slots: 0,
		})
	}

	/// Iterates every live row of a table.
	pub fn iterate_all(&self, table: usize, cols: &[usize]) -> Result<Rows<'_>> {
		let slots = self.stores[table].slot_count();
		self.iterate(table, cols, 1..slots + 1)
	}
}

/// Sequential row advancer: loads many slots per read through its own
/// reusable buffer, decodes the selection per live slot.
pub struct Rows<'a> {
	db: &'a Database,
	table: usize,
	cols: Vec<usize>,
	buf: Vec<u8>,
	next: u64,
	end: u64,
	chunk_start: u64,
	chunk_slots: u64,
}

impl<'a> Rows<'a> {
	fn advance(&mut self) -> Result<Option<(RowRef, Vec<Value>)>> {
		let store = &self.db.stores[self.table];
		let n = store.layout.n;
		loop {
			if self.next >= self.end {
				return Ok(None);
			}
			if self.next >= self.chunk_start + self.chunk_slots {
				let per_chunk = std::cmp::max(1, (64 * 1024) / n) as u64;
				self.chunk_start = self.next;
				self.chunk_slots = std::cmp::min(per_chunk, self.end - self.next);
				let bytes = self.chunk_slots as usize * n;
				buffer::reserve(&mut self.buf, bytes);
				store.fl.read_at(
					&mut self.buf[0..bytes],
					FL_HEADER_SIZE + self.chunk_start * n as u64,
				)?;
			}
			let at = (self.next - self.chunk_start) as usize * n;
			let slot_index = self.next;
			self.next += 1;
			let slot = &self.buf[at..at + n];
			if is_gap(slot) {
				continue;
			}
			let ctx = ReadCtx {
				layout: &store.layout,
				vl: &store.vl,
				cipher: self.db.cipher.as_deref(),
			};
			let mut vbuf = self.db.buffers.gb2();
			let mut values = Vec::with_capacity(self.cols.len());
			for &c in &self.cols {
				values.push(read_value(&ctx, &store.layout.cols[c], slot, &mut vbuf)?);
			}
			return Ok(Some((RowRef::from_slot(slot_index), values)));
		}
	}
}

impl<'a> Iterator for Rows<'a> {
	type Item = Result<(RowRef, Vec<Value>)>;

	fn next(&mut self) -> Option<Self::Item> {
		match self.advance() {
			Ok(Some(row)) => Some(Ok(row)),
			Ok(None) => None,
			Err(e) => {
				// Fuse after a failure.
				self.next = self.end;
				Some(Err(e))
			}
		}
	}
}
