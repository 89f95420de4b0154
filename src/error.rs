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

/// All the ways a storage operation can fail.
#[derive(Debug)]
pub enum Error {
	/// File I/O failed. The surrounding unit, if any, rolls back.
	Io(std::io::Error),
	/// Recording a before-image failed. The unit is poisoned and the
	/// operation must abort.
	UnitBroken,
	/// En/decryption of a payload failed.
	Crypto(String),
	/// A value does not fit its column, or parameters are out of range.
	IllegalArgument(String),
	/// A row reference points at a gap or outside the file.
	IllegalReference(u64),
	/// The delete target is still referenced by other rows.
	DeleteConstraint(u64, u64),
	/// A file or counter would overflow its configured width.
	MaximumExceeded(String),
	/// An internal limit was hit.
	ImplementationRestriction(String),
	/// The database was closed while the operation was in flight.
	Shutdown,
	/// An on-disk invariant does not hold. The database should be closed.
	Corruption(String),
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Error::Io(e) => write!(f, "IO Error: {}", e),
			Error::UnitBroken => write!(f, "Unit broken"),
			Error::Crypto(e) => write!(f, "Crypto error: {}", e),
			Error::IllegalArgument(e) => write!(f, "Illegal argument: {}", e),
			Error::IllegalReference(r) => write!(f, "Illegal row reference: {}", r),
			Error::DeleteConstraint(r, rc) =>
				write!(f, "Row {} still referenced {} times", r, rc),
			Error::MaximumExceeded(e) => write!(f, "Maximum exceeded: {}", e),
			Error::ImplementationRestriction(e) =>
				write!(f, "Implementation restriction: {}", e),
			Error::Shutdown => write!(f, "Database closed"),
			Error::Corruption(e) => write!(f, "Corruption: {}", e),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e)
	}
}

pub type Result<T> = std::result::Result<T, Error>;
