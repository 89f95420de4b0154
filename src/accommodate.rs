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

// Rewrites every row of an FL file while its width changes.
//
// A spot requests that the old-row range [offset, offset + old_len)
// becomes new_len bytes, filled by an updater from the full old row, or
// by the default rule: values keep their unsigned numeric meaning, so
// narrowing keeps the tail bytes and widening pads zeroes on the left.
// Bytes between spots are copied verbatim.
//
// Rows are rewritten in place through two reusable buffers, batchwise
// back-to-front when the row grows and front-to-back otherwise, so no
// unread byte is overwritten. Gap slots keep their chain link: slot
// indices survive the width change untouched.
//
// This runs without a unit. A crash mid-way leaves the file half
// converted; callers take a backup first and run recovery tooling on
// failure.

use crate::{
	buffer,
	codec::Cipher,
	error::{Error, Result},
	file::DbFile,
	layout::FL_HEADER_SIZE,
	store::is_gap,
	vlspace::VlSpace,
};

/// VL access handed to updaters that move payload blobs.
pub struct VlAccess<'a> {
	pub file: &'a DbFile,
	pub space: &'a mut VlSpace,
	pub cipher: Option<&'a dyn Cipher>,
}

/// Fills a spot's bytes in the new row, reading whatever it needs from
/// the presented old row.
pub trait RowUpdater {
	fn update(&mut self, old_row: &[u8], out: &mut [u8], vl: &mut VlAccess<'_>) -> Result<()>;
}

/// One byte-range edit of every row.
pub struct Spot {
	pub offset: usize,
	pub old_len: usize,
	pub new_len: usize,
	pub updater: Option<Box<dyn RowUpdater>>,
}

impl Spot {
	pub fn resize(offset: usize, old_len: usize, new_len: usize) -> Spot {
		Spot { offset, old_len, new_len, updater: None }
	}

	pub fn with(
		offset: usize,
		old_len: usize,
		new_len: usize,
		updater: Box<dyn RowUpdater>,
	) -> Spot {
		Spot { offset, old_len, new_len, updater: Some(updater) }
	}
}

fn check_spots(spots: &[Spot], old_n: usize) -> Result<()> {
	let mut at = 0;
	for spot in spots {
		if spot.offset < at || spot.offset + spot.old_len > old_n {
			return Err(Error::IllegalArgument(
				"spots overlap or leave the row".into()));
		}
		at = spot.offset + spot.old_len;
	}
	Ok(())
}

/// Unsigned value-preserving default: tail bytes survive a contraction,
/// widening pads zeroes on the left.
fn resize_uint(old: &[u8], out: &mut [u8]) {
	for b in out.iter_mut() {
		*b = 0;
	}
	if old.len() >= out.len() {
		out.copy_from_slice(&old[old.len() - out.len()..]);
	} else {
		let pad = out.len() - old.len();
		out[pad..].copy_from_slice(old);
	}
}

fn convert_row(
	spots: &mut [Spot],
	old_row: &[u8],
	new_row: &mut [u8],
	vl: &mut VlAccess<'_>,
) -> Result<()> {
	if is_gap(old_row) {
		// Gaps carry only their chain link; indices are unchanged.
		for b in new_row.iter_mut() {
			*b = 0;
		}
		new_row[0..8].copy_from_slice(&old_row[0..8]);
		return Ok(());
	}
	let mut from = 0;
	let mut to = 0;
	for spot in spots.iter_mut() {
		let keep = spot.offset - from;
		new_row[to..to + keep].copy_from_slice(&old_row[from..from + keep]);
		from += keep;
		to += keep;
		let out = &mut new_row[to..to + spot.new_len];
		match &mut spot.updater {
			Some(updater) =>
				updater.update(old_row, out, vl)?,
			None =>
				resize_uint(&old_row[from..from + spot.old_len], out),
		}
		from += spot.old_len;
		to += spot.new_len;
	}
	let keep = old_row.len() - from;
	new_row[to..to + keep].copy_from_slice(&old_row[from..from + keep]);
	Ok(())
}

/// Applies `spots` to every row of `fl`, resizing the file from rows of
/// `old_n` bytes to the new width, which is returned. Runs in an
/// exclusive unlogged zone.
pub fn accommodate(
	fl: &DbFile,
	old_n: usize,
	spots: &mut [Spot],
	vl: &mut VlAccess<'_>,
	read_buf: &mut Vec<u8>,
	write_buf: &mut Vec<u8>,
) -> Result<usize> {
	check_spots(spots, old_n)?;
	let new_n = (old_n as i64
		+ spots.iter().map(|s| s.new_len as i64 - s.old_len as i64).sum::<i64>())
		as usize;
	if new_n < 8 {
		return Err(Error::ImplementationRestriction(
			format!("new slot width {} is below the 8 byte minimum", new_n)));
	}
	let slots = (fl.len() - FL_HEADER_SIZE) / old_n as u64;
	let new_len = FL_HEADER_SIZE + slots * new_n as u64;
	if new_len > i64::MAX as u64 {
		return Err(Error::MaximumExceeded("FL file length".into()));
	}
	log::info!(
		target: "rowstore",
		"Accommodating {} rows from {} to {} bytes",
		slots,
		old_n,
		new_n,
	);

	let batch = std::cmp::max(1, 256 * 1024 / std::cmp::max(old_n, new_n)) as u64;
	buffer::reserve(read_buf, batch as usize * old_n);
	buffer::reserve(write_buf, batch as usize * new_n);

	let mut convert_batch = |first: u64, count: u64| -> Result<()> {
		let old_bytes = count as usize * old_n;
		let new_bytes = count as usize * new_n;
		fl.read_at(
			&mut read_buf[0..old_bytes],
			FL_HEADER_SIZE + first * old_n as u64,
		)?;
		for k in 0..count as usize {
			convert_row(
				spots,
				&read_buf[k * old_n..(k + 1) * old_n],
				&mut write_buf[k * new_n..(k + 1) * new_n],
				vl,
			)?;
		}
		fl.write_at(
			&write_buf[0..new_bytes],
			FL_HEADER_SIZE + first * new_n as u64,
		)
	};

	if new_n > old_n {
		// Growing: highest rows first, so unread rows are never clobbered.
		let mut end = slots;
		while end > 0 {
			let first = end.saturating_sub(batch);
			convert_batch(first, end - first)?;
			end = first;
		}
	} else {
		let mut first = 0;
		while first < slots {
			let count = std::cmp::min(batch, slots - first);
			convert_batch(first, count)?;
			first += count;
		}
	}
	fl.set_len(new_len)?;
	Ok(new_n)
}
