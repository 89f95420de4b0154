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

// Embedded row storage engine.
//
// Each table persists as a pair of files. The FL file is an array of
// fixed-width slots, one per row, holding a null-info bitmap, an
// optional reference counter and the column data; free slots form a
// chain threaded through the slots themselves. The VL file holds the
// variable-length payloads, addressed by (pointer, length) fields
// inside the slots; its free holes live in an in-memory tree and are
// recomputed from the rows at open.
//
// Write operations run inside a unit: a before-image log that is
// replayed in reverse on failure, and after a crash at the next open.
// Deletion is guarded by per-row reference counters kept in step with
// every reference stored anywhere in the database. Compaction and
// schema changes (inserting a column, resizing references) rewrite the
// files in place and run outside any unit.
//
// The engine is single-threaded cooperative: the caller serialises
// operations, and three reusable buffers are shared between them.

mod accommodate;
mod buffer;
mod codec;
mod compact;
mod db;
mod display;
mod error;
mod file;
mod flspace;
mod layout;
mod read;
mod schema;
mod store;
mod streamer;
mod unit;
mod value;
mod vlspace;
mod write;

pub use crate::codec::Cipher;
pub use crate::db::Database;
pub use crate::error::{Error, Result};
pub use crate::layout::{ColKind, ColumnDef, ElemKind, Schema, TableDef};
pub use crate::read::Rows;
pub use crate::value::{RowRef, Value};
