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

use std::sync::Arc;
use fs2::FileExt;
use crate::{
	buffer::Buffers,
	codec::{aggregate_rc, Cipher, RcDelta},
	error::{Error, Result},
	file::{DbFile, FileId},
	layout::Schema,
	store::{is_gap, Store, StoreId},
	unit::{replay_pending, Unit},
};

const UNIT_LOG_ID: FileId = FileId(u32::MAX);

/// A single-process embedded database: an arena of stores, one per
/// schema table, sharing a before-image log and three reusable buffers.
/// Execution is single-threaded cooperative; callers serialise access.
pub struct Database {
	path: std::path::PathBuf,
	// Held for the lifetime of the database; dropping releases the lock.
	_lock: std::fs::File,
	pub(crate) stores: Vec<Store>,
	pub(crate) schema: Schema,
	pub(crate) unit_log: Arc<DbFile>,
	pub(crate) buffers: Buffers,
	pub(crate) cipher: Option<Box<dyn Cipher>>,
	pub(crate) closed: bool,
}

impl Database {
	pub fn open(
		path: &std::path::Path,
		schema: Schema,
		cipher: Option<Box<dyn Cipher>>,
	) -> Result<Database> {
		std::fs::create_dir_all(path)?;
		let lock = std::fs::OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(path.join("lock"))?;
		lock.try_lock_exclusive()?;

		let unit_log = Arc::new(DbFile::open(&path.join("unit"), UNIT_LOG_ID)?);
		let mut files = Vec::with_capacity(schema.tables.len());
		for index in 0..schema.tables.len() {
			let id = StoreId::new(index as u16);
			files.push((
				DbFile::open(&path.join(id.fl_name()), FileId::fl(index))?,
				DbFile::open(&path.join(id.vl_name()), FileId::vl(index))?,
			));
		}

		// A log left behind means the last operation never finished.
		let crashed = unit_log.len() > 0;
		if crashed {
			replay_pending(&unit_log, |id| {
				let (fl, vl) = &files[id.store()];
				if id.is_vl() { vl } else { fl }
			})?;
		}

		let buffers = Buffers::new();
		let mut stores = Vec::with_capacity(files.len());
		{
			let mut buf = buffers.gb1();
			for (index, (fl, vl)) in files.into_iter().enumerate() {
				stores.push(Store::new(index, &schema, fl, vl, &mut buf, crashed)?);
			}
		}
		log::info!(
			target: "rowstore",
			"Opened database with {} tables at {:?}",
			stores.len(),
			path,
		);
		Ok(Database {
			path: path.into(),
			_lock: lock,
			stores,
			schema,
			unit_log,
			buffers,
			cipher,
			closed: false,
		})
	}

	pub fn path(&self) -> &std::path::Path {
		&self.path
	}

	pub fn table_index(&self, name: &str) -> Option<usize> {
		self.stores.iter().position(|s| s.name == name)
	}

	pub(crate) fn check_open(&self) -> Result<()> {
		if self.closed {
			return Err(Error::Shutdown);
		}
		Ok(())
	}

	pub(crate) fn file(&self, id: FileId) -> &DbFile {
		let (store, vl) = (id.store(), id.is_vl());
		let store = &self.stores[store];
		if vl { &store.vl } else { &store.fl }
	}

	/// Runs `f` under a fresh unit. On success the touched files are
	/// forced and the log discarded; on failure the before-images are
	/// replayed and the touched stores resynchronised from disk.
	pub(crate) fn run_unit<R, F>(&mut self, f: F) -> Result<R>
	where
		F: FnOnce(&mut Database, &mut Unit) -> Result<R>,
	{
		self.check_open()?;
		let mut unit = Unit::new(self.unit_log.clone());
		match f(self, &mut unit) {
			Ok(result) => {
				let forced = unit
					.touched()
					.into_iter()
					.try_for_each(|id| self.file(id).sync())
					.and_then(|_| unit.commit());
				if let Err(e) = forced {
					// Durability is unknown from here on; the log stays
					// for replay at the next open.
					log::error!(target: "rowstore", "Commit failed: {}", e);
					self.closed = true;
					return Err(e);
				}
				Ok(result)
			}
			Err(e) => {
				let rolled = unit.rollback(|id| self.file(id));
				match rolled {
					Ok(touched) => {
						if let Err(re) = self.resync(&touched) {
							log::error!(
								target: "rowstore",
								"State resync after rollback failed: {}",
								re,
							);
							self.closed = true;
						}
					}
					Err(re) => {
						// The on-disk state could not be restored; the
						// database must not accept further operations.
						log::error!(
							target: "rowstore",
							"Rollback failed: {}",
							re,
						);
						self.closed = true;
					}
				}
				Err(e)
			}
		}
	}

	/// Refreshes the in-memory space state of the stores behind `touched`
	/// from their restored files.
	fn resync(&mut self, touched: &[FileId]) -> Result<()> {
		let mut indices: Vec<usize> = touched.iter().map(|id| id.store()).collect();
		indices.sort_unstable();
		indices.dedup();
		let mut buf = self.buffers.gb1();
		for index in indices {
			let store = &mut self.stores[index];
			store.fl_space.read_header(&store.fl)?;
			store.reconstruct_vl(&mut buf)?;
		}
		Ok(())
	}

	/// Applies aggregated reference-counter deltas, recording the old
	/// counter bytes first. Underflow is corruption; overflow exceeds the
	/// configured counter width.
	pub(crate) fn apply_rc(&mut self, deltas: Vec<RcDelta>, unit: &mut Unit) -> Result<()> {
		for d in aggregate_rc(deltas) {
			let store = &mut self.stores[d.store];
			let layout = &store.layout;
			let pos = match store.ref_to_pos(d.row) {
				Ok(pos) => pos,
				Err(_) if d.delta > 0 =>
					return Err(Error::IllegalReference(d.row.index())),
				Err(_) => return Err(Error::Corruption(
					format!("dangling reference to {} in {}", d.row, store.name))),
			};
			let head = layout.n_bm + layout.nobs_ref_count;
			let mut slot_head = vec![0u8; head];
			store.fl.read_at(&mut slot_head, pos)?;
			if is_gap(&slot_head) {
				if d.delta > 0 {
					return Err(Error::IllegalReference(d.row.index()));
				}
				return Err(Error::Corruption(
					format!("dangling reference to {} in {}", d.row, store.name)));
			}
			let rc = layout.ref_count(&slot_head);
			let new = rc as i64 + d.delta;
			if new < 0 {
				return Err(Error::Corruption(
					format!("reference counter of {} in {} under 0", d.row, store.name)));
			}
			if new as u64 > layout.max_ref_count() {
				return Err(Error::MaximumExceeded(
					format!("reference counter of {} in {}", d.row, store.name)));
			}
			let rc_pos = pos + layout.n_bm as u64;
			unit.record_slice(
				&store.fl, rc_pos, &slot_head, layout.n_bm, layout.nobs_ref_count)?;
			layout.set_ref_count(&mut slot_head, new as u64);
			store.fl.write_at(
				&slot_head[layout.n_bm..layout.n_bm + layout.nobs_ref_count], rc_pos)?;
		}
		Ok(())
	}

	/// Explicit repair entry point: replays a pending before-image log,
	/// rebuilds every gap chain from the slots and recomputes every VL
	/// free tree from the rows. Run it after a crashed compaction or
	/// migration before trusting the files again.
	pub fn recover(&mut self) -> Result<()> {
		self.check_open()?;
		let Database { stores, unit_log, .. } = &*self;
		replay_pending(unit_log, |id| {
			let store = &stores[id.store()];
			if id.is_vl() { &store.vl } else { &store.fl }
		})?;
		let mut buf = self.buffers.gb1();
		for store in self.stores.iter_mut() {
			store.fl_space.read_header(&store.fl)?;
			store.fl_space.rebuild_chain_of_gaps(&store.fl, &mut buf)?;
			store.reconstruct_vl(&mut buf)?;
			store.fl.sync()?;
			store.vl.sync()?;
		}
		log::info!(target: "rowstore", "Recovery completed");
		Ok(())
	}

	/// Forces everything out and refuses further operations.
	pub fn close(&mut self) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		for store in &self.stores {
			store.fl.sync()?;
			store.vl.sync()?;
		}
		self.closed = true;
		log::info!(target: "rowstore", "Closed database at {:?}", self.path);
		Ok(())
	}

	/// The number of live rows of a table; walks the file.
	pub fn row_count(&self, table: usize) -> Result<u64> {
		self.check_open()?;
		let store = &self.stores[table];
		Ok(store.slot_count() - store.fl_space.gap_count())
	}

	/// The highest row index a reference into `table` may currently hold.
	pub(crate) fn max_row_index(&self, table: usize) -> u64 {
		self.stores[table].slot_count()
	}
}
