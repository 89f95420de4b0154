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
};

const CHUNK: usize = 4 * 1024;

/// A finite, non-restartable sequence of bytes. `pull(k)` yields the next
/// `k` bytes; the returned slice is valid until the next pull. Handlers
/// must consume it before yielding control to another operation.
pub trait Streamer {
	fn pull(&mut self, k: usize) -> Result<&[u8]>;

	/// Bytes not yet pulled.
	fn remaining(&self) -> u64;
}

/// Streams a `[ptr, ptr + len)` region of the VL file through a reusable
/// buffer, reloading a chunk at a time.
pub struct FileStreamer<'a> {
	file: &'a DbFile,
	buf: &'a mut Vec<u8>,
	/// File position of the next unread byte.
	pos: u64,
	remaining: u64,
	/// Window of `buf` holding loaded, not yet pulled bytes.
	start: usize,
	end: usize,
}

impl<'a> FileStreamer<'a> {
	pub fn new(file: &'a DbFile, buf: &'a mut Vec<u8>, ptr: u64, len: u64) -> FileStreamer<'a> {
		FileStreamer {
			file,
			buf,
			pos: ptr,
			remaining: len,
			start: 0,
			end: 0,
		}
	}
}

impl<'a> Streamer for FileStreamer<'a> {
	fn pull(&mut self, k: usize) -> Result<&[u8]> {
		let buffered = self.end - self.start;
		if buffered < k {
			if buffered as u64 + self.remaining < k as u64 {
				return Err(Error::Corruption(
					format!("streamer exhausted pulling {} bytes", k)));
			}
			let load = std::cmp::min(
				self.remaining,
				std::cmp::max(k - buffered, CHUNK) as u64,
			) as usize;
			buffer::reserve(self.buf, buffered + load);
			// Keep the unread tail at the front, then refill behind it.
			self.buf.copy_within(self.start..self.end, 0);
			self.file.read_at(&mut self.buf[buffered..buffered + load], self.pos)?;
			self.pos += load as u64;
			self.remaining -= load as u64;
			self.start = 0;
			self.end = buffered + load;
		}
		let at = self.start;
		self.start += k;
		Ok(&self.buf[at..at + k])
	}

	fn remaining(&self) -> u64 {
		(self.end - self.start) as u64 + self.remaining
	}
}

/// Streams an in-memory byte range.
pub struct ArrayStreamer<'a> {
	bytes: &'a [u8],
	at: usize,
}

impl<'a> ArrayStreamer<'a> {
	pub fn new(bytes: &'a [u8], offset: usize) -> ArrayStreamer<'a> {
		ArrayStreamer { bytes, at: offset }
	}
}

impl<'a> Streamer for ArrayStreamer<'a> {
	fn pull(&mut self, k: usize) -> Result<&[u8]> {
		if self.bytes.len() - self.at < k {
			return Err(Error::Corruption(
				format!("streamer exhausted pulling {} bytes", k)));
		}
		let at = self.at;
		self.at += k;
		Ok(&self.bytes[at..at + k])
	}

	fn remaining(&self) -> u64 {
		(self.bytes.len() - self.at) as u64
	}
}
