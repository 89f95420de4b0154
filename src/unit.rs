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

// Before-image log.
//
// Record framing:
// [TAG: 1][FILE: 4][POS: 8][LEN: 4][BYTES: LEN]
// TAG 1 - before-image: BYTES at POS were about to be overwritten.
// TAG 2 - creation sentinel: the file grew past POS; rollback truncates
// back to POS. LEN is 0.
//
// Records are appended before the bytes they cover are written. Commit
// forces the data files and then truncates the log; rollback replays the
// records in reverse. A log left behind by a crash is replayed the same
// way at open; a torn tail record covers bytes that were never written
// and is dropped.

use std::convert::TryInto;
use std::sync::Arc;
use crate::{
	error::{Error, Result},
	file::{DbFile, FileId},
};

const TAG_BEFORE: u8 = 1;
const TAG_CREATED: u8 = 2;
const RECORD_HEADER: usize = 1 + 4 + 8 + 4;

#[derive(Debug)]
enum Record {
	Before { file: FileId, pos: u64, old: Vec<u8> },
	Created { file: FileId, pos: u64 },
}

impl Record {
	fn file(&self) -> FileId {
		match self {
			Record::Before { file, .. } => *file,
			Record::Created { file, .. } => *file,
		}
	}
}

fn encode_record(out: &mut Vec<u8>, tag: u8, file: FileId, pos: u64, bytes: &[u8]) {
	out.push(tag);
	out.extend_from_slice(&file.0.to_be_bytes());
	out.extend_from_slice(&pos.to_be_bytes());
	out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
	out.extend_from_slice(bytes);
}

fn decode_records(buf: &[u8]) -> Vec<Record> {
	let mut records = Vec::new();
	let mut at = 0;
	while buf.len() - at >= RECORD_HEADER {
		let tag = buf[at];
		let file = FileId(u32::from_be_bytes(buf[at + 1..at + 5].try_into().unwrap()));
		let pos = u64::from_be_bytes(buf[at + 5..at + 13].try_into().unwrap());
		let len = u32::from_be_bytes(buf[at + 13..at + 17].try_into().unwrap()) as usize;
		at += RECORD_HEADER;
		match tag {
			TAG_BEFORE => {
				if buf.len() - at < len {
					break;
				}
				records.push(Record::Before {
					file,
					pos,
					old: buf[at..at + len].to_vec(),
				});
				at += len;
			}
			TAG_CREATED => {
				records.push(Record::Created { file, pos });
			}
			_ => break,
		}
	}
	records
}

fn apply_reverse<'a, F>(records: &[Record], resolve: F) -> Result<()>
where
	F: Fn(FileId) -> &'a DbFile,
{
	for record in records.iter().rev() {
		match record {
			Record::Before { file, pos, old } => {
				resolve(*file).write_at(old, *pos)?;
			}
			Record::Created { file, pos } => {
				let file = resolve(*file);
				if file.len() > *pos {
					file.set_len(*pos)?;
				}
			}
		}
	}
	Ok(())
}

/// Replays a log left behind by a crash. Returns the ids of the files it
/// restored, empty when the log was clean.
pub fn replay_pending<'a, F>(log: &DbFile, resolve: F) -> Result<Vec<FileId>>
where
	F: Fn(FileId) -> &'a DbFile,
{
	if log.len() == 0 {
		return Ok(Vec::new());
	}
	let mut buf = vec![0u8; log.len() as usize];
	log.read_at(&mut buf, 0)?;
	let records = decode_records(&buf);
	log::info!(
		target: "rowstore",
		"Replaying {} before-images from an interrupted operation",
		records.len(),
	);
	apply_reverse(&records, |id| resolve(id))?;
	let mut touched: Vec<FileId> = records.iter().map(|r| r.file()).collect();
	touched.sort_by_key(|id| id.0);
	touched.dedup();
	for id in &touched {
		resolve(*id).sync()?;
	}
	log.set_len(0)?;
	log.sync()?;
	Ok(touched)
}

/// A scoped write-transaction. Every byte a write operation overwrites in
/// an FL or VL file is recorded here first; newly grown file regions are
/// recorded as creation sentinels. On success the log is discarded after
/// the files are forced; on failure it is replayed in reverse.
pub struct Unit {
	log: Arc<DbFile>,
	records: Vec<Record>,
	marked: Vec<FileId>,
	log_end: u64,
	broken: bool,
}

impl Unit {
	pub fn new(log: Arc<DbFile>) -> Unit {
		debug_assert_eq!(log.len(), 0);
		Unit {
			log,
			records: Vec::new(),
			marked: Vec::new(),
			log_end: 0,
			broken: false,
		}
	}

	pub fn is_broken(&self) -> bool {
		self.broken
	}

	fn append(&mut self, tag: u8, file: FileId, pos: u64, bytes: &[u8]) -> Result<()> {
		if self.broken {
			return Err(Error::UnitBroken);
		}
		let mut encoded = Vec::with_capacity(RECORD_HEADER + bytes.len());
		encode_record(&mut encoded, tag, file, pos, bytes);
		if let Err(e) = self.log.write_at(&encoded, self.log_end) {
			log::warn!(target: "rowstore", "Unit broken: {}", e);
			self.broken = true;
			return Err(Error::UnitBroken);
		}
		self.log_end += encoded.len() as u64;
		Ok(())
	}

	/// Records `old` as the before-image of `[pos, pos + old.len())`.
	pub fn record(&mut self, file: &DbFile, pos: u64, old: &[u8]) -> Result<()> {
		self.append(TAG_BEFORE, file.id(), pos, old)?;
		self.records.push(Record::Before {
			file: file.id(),
			pos,
			old: old.to_vec(),
		});
		Ok(())
	}

	/// Partial variant of [`Unit::record`].
	pub fn record_slice(
		&mut self,
		file: &DbFile,
		pos: u64,
		arr: &[u8],
		off: usize,
		len: usize,
	) -> Result<()> {
		self.record(file, pos, &arr[off..off + len])
	}

	/// Records that `file` is about to grow past `end`; rollback truncates
	/// back to `end`.
	pub fn record_created(&mut self, file: &DbFile, end: u64) -> Result<()> {
		self.append(TAG_CREATED, file.id(), end, &[])?;
		self.records.push(Record::Created { file: file.id(), pos: end });
		Ok(())
	}

	/// Reads the current content of `[pos, pos + new.len())`, records it,
	/// then overwrites it with `new`.
	pub fn overwrite(&mut self, file: &DbFile, pos: u64, new: &[u8]) -> Result<()> {
		let mut old = vec![0u8; new.len()];
		file.read_at(&mut old, pos)?;
		self.record(file, pos, &old)?;
		file.write_at(new, pos)
	}

	/// Registers a file whose in-memory space state changed without a
	/// byte being overwritten. Nothing is logged; rollback resynchronises
	/// the stores behind [`Unit::touched`], and this puts the file there.
	pub fn mark(&mut self, file: FileId) {
		self.marked.push(file);
	}

	/// File ids touched by the recorded writes and the marked releases.
	pub fn touched(&self) -> Vec<FileId> {
		let mut touched: Vec<FileId> = self.records.iter().map(|r| r.file()).collect();
		touched.extend(self.marked.iter().copied());
		touched.sort_by_key(|id| id.0);
		touched.dedup();
		touched
	}

	/// Discards the log. The caller must have forced the data files first.
	pub fn commit(self) -> Result<()> {
		self.log.set_len(0)?;
		self.log.sync()?;
		Ok(())
	}

	/// Replays the before-images in reverse, restoring the byte state the
	/// unit started from. In-memory space state of the touched stores must
	/// be resynchronised by the caller afterwards.
	pub fn rollback<'a, F>(self, resolve: F) -> Result<Vec<FileId>>
	where
		F: Fn(FileId) -> &'a DbFile,
	{
		log::debug!(
			target: "rowstore",
			"Rolling back {} before-images",
			self.records.len(),
		);
		apply_reverse(&self.records, |id| resolve(id))?;
		let touched = self.touched();
		for id in &touched {
			resolve(*id).sync()?;
		}
		self.log.set_len(0)?;
		self.log.sync()?;
		Ok(touched)
	}
}

#[cfg(test)]
mod test {
	use std::sync::Arc;
	use super::{Unit, replay_pending};
	use crate::file::{DbFile, FileId};

	struct TempDir(std::path::PathBuf);

	impl TempDir {
		fn new(name: &'static str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("rowstore-test");
			path.push("unit");
			path.push(name);
			if path.exists() {
				std::fs::remove_dir_all(&path).unwrap();
			}
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}

		fn file(&self, name: &str, id: FileId) -> DbFile {
			DbFile::open(&self.0.join(name), id).unwrap()
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
	fn rollback_restores_bytes() {
		let dir = TempDir::new("rollback_restores_bytes");
		let data = dir.file("data", FileId(0));
		let log = Arc::new(dir.file("unit", FileId(100)));
		data.write_at(&[1, 2, 3, 4], 0).unwrap();

		let mut unit = Unit::new(log.clone());
		unit.overwrite(&data, 0, &[9, 9, 9, 9]).unwrap();
		unit.record_created(&data, 4).unwrap();
		data.write_at(&[5, 5], 4).unwrap();
		assert_eq!(data.len(), 6);

		unit.rollback(|_| &data).unwrap();
		let mut buf = [0u8; 4];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [1, 2, 3, 4]);
		assert_eq!(data.len(), 4);
		assert_eq!(log.len(), 0);
	}

	#[test]
	fn commit_discards_log() {
		let dir = TempDir::new("commit_discards_log");
		let data = dir.file("data", FileId(0));
		let log = Arc::new(dir.file("unit", FileId(100)));
		data.write_at(&[1, 2, 3, 4], 0).unwrap();

		let mut unit = Unit::new(log.clone());
		unit.overwrite(&data, 0, &[9, 9, 9, 9]).unwrap();
		assert!(log.len() > 0);
		data.sync().unwrap();
		unit.commit().unwrap();
		assert_eq!(log.len(), 0);
		let mut buf = [0u8; 4];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [9, 9, 9, 9]);
	}

	#[test]
	fn marked_files_count_as_touched() {
		let dir = TempDir::new("marked_files_count_as_touched");
		let data = dir.file("data", FileId(0));
		let log = Arc::new(dir.file("unit", FileId(100)));
		data.write_at(&[9], 0).unwrap();

		let mut unit = Unit::new(log.clone());
		let logged = log.len();
		unit.mark(FileId(4));
		unit.mark(FileId(4));
		// A mark writes nothing to the log.
		assert_eq!(log.len(), logged);
		unit.overwrite(&data, 0, &[1]).unwrap();
		assert_eq!(unit.touched(), vec![FileId(0), FileId(4)]);

		let touched = unit.rollback(|_| &data).unwrap();
		assert_eq!(touched, vec![FileId(0), FileId(4)]);
		let mut buf = [0u8; 1];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [9]);
	}

	#[test]
	fn replay_after_crash() {
		let dir = TempDir::new("replay_after_crash");
		let data = dir.file("data", FileId(0));
		let log = Arc::new(dir.file("unit", FileId(100)));
		data.write_at(&[1, 2, 3, 4], 0).unwrap();

		// Simulate a crash: records written, unit never finished.
		{
			let mut unit = Unit::new(log.clone());
			unit.overwrite(&data, 0, &[9, 9, 9, 9]).unwrap();
			unit.record_created(&data, 4).unwrap();
			data.write_at(&[5, 5], 4).unwrap();
			std::mem::forget(unit);
		}

		let touched = replay_pending(&log, |_| &data).unwrap();
		assert_eq!(touched, vec![FileId(0)]);
		let mut buf = [0u8; 4];
		data.read_at(&mut buf, 0).unwrap();
		assert_eq!(buf, [1, 2, 3, 4]);
		assert_eq!(data.len(), 4);

		// Idempotent: a clean log replays to nothing.
		assert!(replay_pending(&log, |_| &data).unwrap().is_empty());
	}

	#[test]
	fn torn_tail_is_dropped() {
		let dir = TempDir::new("torn_tail_is_dropped");
		let data = dir.file("data", FileId(0));
		let log = Arc::new(dir.file("unit", FileId(100)));
		data.write_at(&[1, 2, 3, 4], 0).unwrap();

		{
			let mut unit = Unit::new(log.clone());
			unit.overwrite(&data, 0, &[9, 9, 9, 9]).unwrap();
			std::mem::forget(unit);
		}
		// Chop the record's payload: the tail must be ignored.
		let torn = log.len() - 2;
		log.set_len(torn).unwrap();
		replay_pending(&log, |_| &data).unwrap();
		assert_eq!(log.len(), 0);
	}
}
