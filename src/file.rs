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

use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use crate::error::Result;

/// Identifies a file in unit log records. Stable across restarts: each
/// store gets two consecutive ids, FL first.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub struct FileId(pub u32);

impl FileId {
	pub fn fl(store: usize) -> FileId {
		FileId(store as u32 * 2)
	}

	pub fn vl(store: usize) -> FileId {
		FileId(store as u32 * 2 + 1)
	}

	pub fn store(&self) -> usize {
		(self.0 / 2) as usize
	}

	pub fn is_vl(&self) -> bool {
		self.0 % 2 == 1
	}
}

impl std::fmt::Display for FileId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		if self.is_vl() {
			write!(f, "store {:02} vl", self.store())
		} else {
			write!(f, "store {:02} fl", self.store())
		}
	}
}

#[cfg(target_os = "macos")]
fn disable_read_ahead(file: &std::fs::File) -> Result<()> {
	use std::os::unix::io::AsRawFd;
	if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_RDAHEAD, 0) } != 0 {
		Err(std::io::Error::last_os_error())?
	} else {
		Ok(())
	}
}

#[cfg(not(target_os = "macos"))]
fn disable_read_ahead(_file: &std::fs::File) -> Result<()> {
	Ok(())
}

/// A positioned-IO handle over one table file. Tracks the logical length
/// and whether anything was written since the last sync.
pub struct DbFile {
	file: std::fs::File,
	id: FileId,
	len: AtomicU64,
	dirty: AtomicBool,
}

impl DbFile {
	pub fn open(path: &std::path::Path, id: FileId) -> Result<DbFile> {
		let file = std::fs::OpenOptions::new()
			.create(true)
			.read(true)
			.write(true)
			.open(path)?;
		disable_read_ahead(&file)?;
		let len = file.metadata()?.len();
		Ok(DbFile {
			file,
			id,
			len: AtomicU64::new(len),
			dirty: AtomicBool::new(false),
		})
	}

	pub fn id(&self) -> FileId {
		self.id
	}

	pub fn len(&self) -> u64 {
		self.len.load(Ordering::Relaxed)
	}

	#[cfg(unix)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		Ok(self.file.read_exact_at(buf, offset)?)
	}

	#[cfg(unix)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::unix::fs::FileExt;
		self.dirty.store(true, Ordering::Relaxed);
		self.file.write_all_at(buf, offset)?;
		let end = offset + buf.len() as u64;
		if end > self.len() {
			self.len.store(end, Ordering::Relaxed);
		}
		Ok(())
	}

	#[cfg(windows)]
	pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.file.seek_read(buf, offset)?;
		Ok(())
	}

	#[cfg(windows)]
	pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
		use std::os::windows::fs::FileExt;
		self.dirty.store(true, Ordering::Relaxed);
		self.file.seek_write(buf, offset)?;
		let end = offset + buf.len() as u64;
		if end > self.len() {
			self.len.store(end, Ordering::Relaxed);
		}
		Ok(())
	}

	pub fn set_len(&self, new_len: u64) -> Result<()> {
		self.dirty.store(true, Ordering::Relaxed);
		self.file.set_len(new_len)?;
		self.len.store(new_len, Ordering::Relaxed);
		Ok(())
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty.load(Ordering::Relaxed)
	}

	/// Syncs file contents if anything was written since the last sync.
	pub fn sync(&self) -> Result<()> {
		if let Ok(true) = self.dirty.compare_exchange(
			true, false, Ordering::Relaxed, Ordering::Relaxed)
		{
			self.file.sync_data()?;
		}
		Ok(())
	}
}
