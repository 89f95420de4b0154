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

// Conversion between column values and their slot bytes.
//
// Reading takes the slot and, for outrow schemes, follows the
// (length, ptr) field into the VL file. Writing mutates an in-memory
// copy of the slot, releases the value it replaces (blobs back to the
// VL free space, reference counter decrements for old targets) and
// produces counter increments for the new targets. The caller applies
// the aggregated deltas and writes the slot ranges that changed.
//
// Payload encryption covers inrow simple-type spans and outrow
// simple-type blobs. Pointers, lengths, sizes, bitmaps and reference
// bytes stay plain.

use crate::{
	error::{Error, Result},
	file::DbFile,
	layout::{
		max_uint, read_uint, write_uint, ColInfo, ColLayout, ElemLayout,
		TableLayout, VL_HEADER_SIZE,
	},
	streamer::{FileStreamer, Streamer},
	unit::Unit,
	value::{RowRef, Value},
	vlspace::VlSpace,
};

/// Symmetric payload transform. Must preserve length; the primitive
/// itself lives outside the engine.
pub trait Cipher: Send + Sync {
	fn encrypt(&self, data: &mut [u8]) -> Result<()>;
	fn decrypt(&self, data: &mut [u8]) -> Result<()>;
}

/// A pending reference-counter change of one row.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RcDelta {
	pub store: usize,
	pub row: RowRef,
	pub delta: i64,
}

/// Folds deltas of the same target so each row is touched once.
pub fn aggregate_rc(mut deltas: Vec<RcDelta>) -> Vec<RcDelta> {
	deltas.sort_by_key(|d| (d.store, d.row));
	let mut out: Vec<RcDelta> = Vec::with_capacity(deltas.len());
	for d in deltas {
		match out.last_mut() {
			Some(last) if last.store == d.store && last.row == d.row =>
				last.delta += d.delta,
			_ => out.push(d),
		}
	}
	out.retain(|d| d.delta != 0 && !d.row.is_null());
	out
}

/// Everything a decode needs besides the slot bytes.
pub struct ReadCtx<'a> {
	pub layout: &'a TableLayout,
	pub vl: &'a DbFile,
	pub cipher: Option<&'a dyn Cipher>,
}

fn decrypt(cipher: Option<&dyn Cipher>, data: &mut [u8]) -> Result<()> {
	if let Some(cipher) = cipher {
		cipher.decrypt(data)?;
	}
	Ok(())
}

fn encrypt(cipher: Option<&dyn Cipher>, data: &mut [u8]) -> Result<()> {
	if let Some(cipher) = cipher {
		cipher.encrypt(data)?;
	}
	Ok(())
}

fn elem_bitmap_len(size: usize) -> usize {
	(size + 7) / 8
}

fn elem_null(bitmap: &[u8], i: usize) -> bool {
	bitmap[i / 8] >> (i % 8) & 1 == 1
}

fn set_elem_null(bitmap: &mut [u8], i: usize) {
	bitmap[i / 8] |= 1 << (i % 8);
}

fn read_blob(vl: &DbFile, cipher: Option<&dyn Cipher>, ptr: u64, len: u64) -> Result<Vec<u8>> {
	let mut payload = vec![0u8; len as usize];
	vl.read_at(&mut payload, ptr)?;
	decrypt(cipher, &mut payload)?;
	Ok(payload)
}

fn read_elem(
	ctx: &ReadCtx<'_>,
	elem: &ElemLayout,
	bytes: &[u8],
	is_null: bool,
) -> Result<Value> {
	Ok(match elem {
		ElemLayout::InrowSt { .. } => {
			if is_null {
				Value::Null
			} else {
				let mut v = bytes.to_vec();
				decrypt(ctx.cipher, &mut v)?;
				Value::Bytes(v)
			}
		}
		ElemLayout::OutrowSt { length_len, .. } => {
			if is_null {
				Value::Null
			} else {
				let len = read_uint(&bytes[0..*length_len]);
				if len == 0 {
					Value::Bytes(Vec::new())
				} else {
					let ptr = read_uint(&bytes[*length_len..]);
					Value::Bytes(read_blob(ctx.vl, ctx.cipher, ptr, len)?)
				}
			}
		}
		ElemLayout::Ref { .. } => Value::Ref(RowRef::new(read_uint(bytes))),
	})
}

fn read_array(
	ctx: &ReadCtx<'_>,
	size_len: usize,
	max_size: u32,
	elem: &ElemLayout,
	fixed_bitmap: Option<usize>,
	streamer: &mut dyn Streamer,
) -> Result<Value> {
	let size = read_uint(streamer.pull(size_len)?) as usize;
	if size > max_size as usize {
		return Err(Error::Corruption(
			format!("array size {} exceeds capacity {}", size, max_size)));
	}
	let bitmap = if elem.has_null_bitmap() {
		let len = fixed_bitmap.unwrap_or_else(|| elem_bitmap_len(size));
		streamer.pull(len)?.to_vec()
	} else {
		Vec::new()
	};
	let width = elem.width(ctx.layout.nobs_outrow_ptr);
	let mut values = Vec::with_capacity(size);
	for i in 0..size {
		let is_null = !bitmap.is_empty() && elem_null(&bitmap, i);
		let bytes = streamer.pull(width)?;
		// The spans must not borrow across element blob reads.
		let bytes = bytes.to_vec();
		values.push(read_elem(ctx, elem, &bytes, is_null)?);
	}
	Ok(Value::Array(values))
}

/// Decodes the value of `col` from `slot`. `buf` backs VL streaming.
pub fn read_value(
	ctx: &ReadCtx<'_>,
	col: &ColInfo,
	slot: &[u8],
	buf: &mut Vec<u8>,
) -> Result<Value> {
	let range = &slot[col.offset..col.offset + col.len];
	let bitmap = ctx.layout.bitmap(slot);
	if col.null_mask != 0 && bitmap & col.null_mask != 0 {
		return Ok(Value::Null);
	}
	Ok(match &col.layout {
		ColLayout::InrowSt { .. } => {
			let mut v = range.to_vec();
			decrypt(ctx.cipher, &mut v)?;
			Value::Bytes(v)
		}
		ColLayout::OutrowSt { length_len } => {
			let len = read_uint(&range[0..*length_len]);
			let ptr = read_uint(&range[*length_len..]);
			if len == 0 && ptr == 0 {
				Value::Null
			} else if len == 0 {
				Value::Bytes(Vec::new())
			} else {
				Value::Bytes(read_blob(ctx.vl, ctx.cipher, ptr, len)?)
			}
		}
		ColLayout::Ref { .. } => Value::Ref(RowRef::new(read_uint(range))),
		ColLayout::InrowArray { size_len, bitmap_len, max_size, elem } => {
			let mut streamer = crate::streamer::ArrayStreamer::new(range, 0);
			read_array(ctx, *size_len, *max_size, elem, Some(*bitmap_len), &mut streamer)?
		}
		ColLayout::OutrowArray { length_len, size_len, max_size, elem } => {
			let blob_len = read_uint(&range[0..*length_len]);
			let ptr = read_uint(&range[*length_len..]);
			if blob_len == 0 && ptr == 0 {
				Value::Null
			} else {
				let mut streamer = FileStreamer::new(ctx.vl, buf, ptr, blob_len);
				read_array(ctx, *size_len, *max_size, elem, None, &mut streamer)?
			}
		}
	})
}

fn release_elem(
	ctx: &ReadCtx<'_>,
	elem: &ElemLayout,
	bytes: &[u8],
	vl_space: &mut VlSpace,
	unit: &mut Option<&mut Unit>,
	rc: &mut Vec<RcDelta>,
) {
	match elem {
		ElemLayout::InrowSt { .. } => {}
		ElemLayout::OutrowSt { length_len, .. } => {
			let len = read_uint(&bytes[0..*length_len]);
			if len > 0 {
				let ptr = read_uint(&bytes[*length_len..]);
				vl_space.deallocate(ptr, len, ctx.vl, unit.as_deref_mut());
			}
		}
		ElemLayout::Ref { store, .. } => {
			let row = read_uint(bytes);
			if row != 0 {
				rc.push(RcDelta {
					store: *store,
					row: RowRef::new(row),
					delta: -1,
				});
			}
		}
	}
}

/// Frees whatever `col` currently holds in `slot`: outrow blobs go back
/// to the VL free space, reference targets get a pending decrement.
/// Slot bytes themselves are left untouched; the unit learns about the
/// released regions so a failed operation rebuilds the free tree.
pub fn release_value(
	ctx: &ReadCtx<'_>,
	col: &ColInfo,
	slot: &[u8],
	vl_space: &mut VlSpace,
	mut unit: Option<&mut Unit>,
	rc: &mut Vec<RcDelta>,
	buf: &mut Vec<u8>,
) -> Result<()> {
	let range = &slot[col.offset..col.offset + col.len];
	match &col.layout {
		ColLayout::InrowSt { .. } => {}
		ColLayout::OutrowSt { length_len } => {
			let len = read_uint(&range[0..*length_len]);
			if len > 0 {
				let ptr = read_uint(&range[*length_len..]);
				vl_space.deallocate(ptr, len, ctx.vl, unit.as_deref_mut());
			}
		}
		ColLayout::Ref { store, .. } => {
			let row = read_uint(range);
			if row != 0 {
				rc.push(RcDelta {
					store: *store,
					row: RowRef::new(row),
					delta: -1,
				});
			}
		}
		ColLayout::InrowArray { size_len, bitmap_len, elem, .. } => {
			// A null or absent array reads as size 0; nothing to free.
			let size = read_uint(&range[0..*size_len]) as usize;
			let width = elem.width(ctx.layout.nobs_outrow_ptr);
			let base = size_len + bitmap_len;
			for i in 0..size {
				let at = base + i * width;
				release_elem(ctx, elem, &range[at..at + width], vl_space, &mut unit, rc);
			}
		}
		ColLayout::OutrowArray { length_len, size_len, elem, .. } => {
			let blob_len = read_uint(&range[0..*length_len]);
			let ptr = read_uint(&range[*length_len..]);
			if blob_len == 0 && ptr == 0 {
				return Ok(());
			}
			crate::buffer::reserve(buf, blob_len as usize);
			let payload = &mut buf[0..blob_len as usize];
			ctx.vl.read_at(payload, ptr)?;
			let size = read_uint(&payload[0..*size_len]) as usize;
			let bm = if elem.has_null_bitmap() {
				elem_bitmap_len(size)
			} else {
				0
			};
			let width = elem.width(ctx.layout.nobs_outrow_ptr);
			let base = size_len + bm;
			for i in 0..size {
				let at = base + i * width;
				if at + width <= payload.len() {
					release_elem(ctx, elem, &payload[at..at + width], vl_space, &mut unit, rc);
				}
			}
			vl_space.deallocate(ptr, blob_len, ctx.vl, unit.as_deref_mut());
		}
	}
	Ok(())
}

fn write_elem(
	ctx: &ReadCtx<'_>,
	elem: &ElemLayout,
	value: &Value,
	span: &mut [u8],
	vl_space: &mut VlSpace,
	unit: &mut Option<&mut Unit>,
	rc: &mut Vec<RcDelta>,
) -> Result<bool> {
	for b in span.iter_mut() {
		*b = 0;
	}
	match (elem, value) {
		(ElemLayout::InrowSt { nullable, .. }, Value::Null) => {
			if !*nullable {
				return Err(Error::IllegalArgument(
					"null element in a non nullable array".into()));
			}
			Ok(true)
		}
		(ElemLayout::InrowSt { len, .. }, Value::Bytes(b)) => {
			if b.len() > *len {
				return Err(Error::IllegalArgument(
					format!("element of {} bytes exceeds width {}", b.len(), len)));
			}
			span[0..b.len()].copy_from_slice(b);
			encrypt(ctx.cipher, span)?;
			Ok(false)
		}
		(ElemLayout::OutrowSt { nullable, .. }, Value::Null) => {
			if !*nullable {
				return Err(Error::IllegalArgument(
					"null element in a non nullable array".into()));
			}
			Ok(true)
		}
		(ElemLayout::OutrowSt { length_len, .. }, Value::Bytes(b)) => {
			if b.len() as u64 > max_uint(*length_len) {
				return Err(Error::IllegalArgument(
					format!("element of {} bytes exceeds the length field", b.len())));
			}
			if !b.is_empty() {
				let ptr = vl_space.allocate(
					b.len() as u64, ctx.vl, unit.as_deref_mut())?;
				if ptr > max_uint(ctx.layout.nobs_outrow_ptr) {
					return Err(Error::MaximumExceeded(
						format!("VL pointer {} exceeds its width", ptr)));
				}
				let mut payload = b.clone();
				encrypt(ctx.cipher, &mut payload)?;
				ctx.vl.write_at(&payload, ptr)?;
				write_uint(&mut span[0..*length_len], b.len() as u64);
				write_uint(&mut span[*length_len..], ptr);
			}
			Ok(false)
		}
		(ElemLayout::Ref { nobs, .. }, v) => {
			let row = match v {
				Value::Null => RowRef::NULL,
				Value::Ref(r) => *r,
				_ => return Err(Error::IllegalArgument(
					"array element is not a reference".into())),
			};
			if row.index() > max_uint(*nobs) {
				return Err(Error::IllegalReference(row.index()));
			}
			write_uint(span, row.index());
			if !row.is_null() {
				if let ElemLayout::Ref { store, .. } = elem {
					rc.push(RcDelta { store: *store, row, delta: 1 });
				}
			}
			Ok(false)
		}
		_ => Err(Error::IllegalArgument(
			"value kind does not match the element type".into())),
	}
}

fn write_array(
	ctx: &ReadCtx<'_>,
	size_len: usize,
	max_size: u32,
	elem: &ElemLayout,
	bitmap_len: usize,
	values: &[Value],
	out: &mut [u8],
	vl_space: &mut VlSpace,
	unit: &mut Option<&mut Unit>,
	rc: &mut Vec<RcDelta>,
) -> Result<()> {
	if values.len() > max_size as usize {
		return Err(Error::IllegalArgument(
			format!("array of {} elements exceeds capacity {}", values.len(), max_size)));
	}
	for b in out.iter_mut() {
		*b = 0;
	}
	write_uint(&mut out[0..size_len], values.len() as u64);
	let width = elem.width(ctx.layout.nobs_outrow_ptr);
	let base = size_len + bitmap_len;
	let mut nulls = Vec::new();
	for (i, v) in values.iter().enumerate() {
		let at = base + i * width;
		let is_null = write_elem(
			ctx, elem, v, &mut out[at..at + width], vl_space, unit, rc)?;
		if is_null {
			nulls.push(i);
		}
	}
	if bitmap_len > 0 {
		let bitmap = &mut out[size_len..size_len + bitmap_len];
		for i in nulls {
			set_elem_null(bitmap, i);
		}
	} else if !nulls.is_empty() {
		return Err(Error::IllegalArgument(
			"null element in a non nullable array".into()));
	}
	Ok(())
}

/// Encodes `value` into `slot`, replacing the current content of `col`.
/// The old value is released first (blobs freed, old reference targets
/// decremented); increments for the new targets are appended to `rc`.
/// VL writes happen immediately; slot bytes change only in memory.
pub fn write_value(
	ctx: &ReadCtx<'_>,
	col: &ColInfo,
	slot: &mut [u8],
	value: &Value,
	vl_space: &mut VlSpace,
	mut unit: Option<&mut Unit>,
	scratch: &mut Vec<u8>,
	rc: &mut Vec<RcDelta>,
) -> Result<()> {
	// Release what is being replaced.
	release_value(ctx, col, slot, vl_space, unit.as_deref_mut(), rc, scratch)?;

	let mut bitmap = ctx.layout.bitmap(slot);

	if value.is_null() {
		let nullable = match &col.layout {
			ColLayout::InrowSt { nullable, .. } => *nullable,
			ColLayout::OutrowSt { .. } => true,
			ColLayout::Ref { .. } => true,
			ColLayout::InrowArray { .. } => col.null_mask != 0,
			ColLayout::OutrowArray { .. } => true,
		};
		if !nullable {
			return Err(Error::IllegalArgument(
				format!("column {} is not nullable", col.name)));
		}
		for b in slot[col.offset..col.offset + col.len].iter_mut() {
			*b = 0;
		}
		if col.null_mask != 0 {
			bitmap |= col.null_mask;
		}
		ctx.layout.set_bitmap(slot, bitmap);
		return Ok(());
	}

	if col.null_mask != 0 {
		bitmap &= !col.null_mask;
	}
	ctx.layout.set_bitmap(slot, bitmap);
	let range = &mut slot[col.offset..col.offset + col.len];
	match (&col.layout, value) {
		(ColLayout::InrowSt { len, .. }, Value::Bytes(b)) => {
			if b.len() > *len {
				return Err(Error::IllegalArgument(
					format!("value of {} bytes exceeds column width {}", b.len(), len)));
			}
			for x in range.iter_mut() {
				*x = 0;
			}
			range[0..b.len()].copy_from_slice(b);
			encrypt(ctx.cipher, range)?;
		}
		(ColLayout::OutrowSt { length_len }, Value::Bytes(b)) => {
			if b.len() as u64 > max_uint(*length_len) {
				return Err(Error::IllegalArgument(
					format!("value of {} bytes exceeds the length field", b.len())));
			}
			for x in range.iter_mut() {
				*x = 0;
			}
			if b.is_empty() {
				// Distinguishes an empty value from the all-zero null
				// encoding; no blob is allocated.
				write_uint(&mut range[*length_len..], VL_HEADER_SIZE);
			} else {
				let ptr = vl_space.allocate(
					b.len() as u64, ctx.vl, unit.as_deref_mut())?;
				if ptr > max_uint(ctx.layout.nobs_outrow_ptr) {
					return Err(Error::MaximumExceeded(
						format!("VL pointer {} exceeds its width", ptr)));
				}
				let mut payload = b.clone();
				encrypt(ctx.cipher, &mut payload)?;
				ctx.vl.write_at(&payload, ptr)?;
				write_uint(&mut range[0..*length_len], b.len() as u64);
				write_uint(&mut range[*length_len..], ptr);
			}
		}
		(ColLayout::Ref { store, nobs }, Value::Ref(row)) => {
			if row.index() > max_uint(*nobs) {
				return Err(Error::IllegalReference(row.index()));
			}
			write_uint(range, row.index());
			rc.push(RcDelta { store: *store, row: *row, delta: 1 });
		}
		(ColLayout::InrowArray { size_len, bitmap_len, max_size, elem },
			Value::Array(values)) =>
		{
			write_array(
				ctx, *size_len, *max_size, elem, *bitmap_len, values, range,
				vl_space, &mut unit, rc,
			)?;
		}
		(ColLayout::OutrowArray { length_len, size_len, max_size, elem },
			Value::Array(values)) =>
		{
			let bitmap_len = if elem.has_null_bitmap() {
				elem_bitmap_len(values.len())
			} else {
				0
			};
			let width = elem.width(ctx.layout.nobs_outrow_ptr);
			let blob_len = size_len + bitmap_len + values.len() * width;
			if blob_len as u64 > max_uint(*length_len) {
				return Err(Error::IllegalArgument(
					format!("array payload of {} bytes exceeds the length field", blob_len)));
			}
			crate::buffer::reserve(scratch, blob_len);
			write_array(
				ctx, *size_len, *max_size, elem, bitmap_len, values,
				&mut scratch[0..blob_len], vl_space, &mut unit, rc,
			)?;
			let ptr = vl_space.allocate(
				blob_len as u64, ctx.vl, unit.as_deref_mut())?;
			if ptr > max_uint(ctx.layout.nobs_outrow_ptr) {
				return Err(Error::MaximumExceeded(
					format!("VL pointer {} exceeds its width", ptr)));
			}
			ctx.vl.write_at(&scratch[0..blob_len], ptr)?;
			for x in range.iter_mut() {
				*x = 0;
			}
			write_uint(&mut range[0..*length_len], blob_len as u64);
			write_uint(&mut range[*length_len..], ptr);
		}
		_ => {
			return Err(Error::IllegalArgument(
				format!("value kind does not match column {}", col.name)));
		}
	}
	Ok(())
}
