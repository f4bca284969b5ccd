//! Primary-key fingerprints.
//!
//! A [`Key`] wraps up to [`MAX_KEY_WIDTH`] fields of a single primitive
//! type. Keys order like slices: field by field, with a shorter key
//! sorting before any longer key it prefixes. That makes short keys legal
//! range endpoints, which the routing map relies on.

use std::fmt;

use smallvec::SmallVec;
use thiserror::Error;

/// Field type of a key fingerprint.
///
/// Every deployment so far routes on integer identifiers, so the field
/// type is fixed rather than carried as a type parameter through the
/// whole engine.
pub type KeyField = i64;

/// Maximum number of fields in a key fingerprint.
pub const MAX_KEY_WIDTH: usize = 5;

/// Errors from building or decoding a key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
	#[error("key width {0} exceeds maximum of {MAX_KEY_WIDTH}")]
	TooWide(usize),

	#[error("encoded key length {0} is not a multiple of the field size")]
	Malformed(usize),
}

/// A variable-width key fingerprint.
///
/// Ordered, hashable, and cheap to clone; fields are stored inline.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
	fields: SmallVec<[KeyField; MAX_KEY_WIDTH]>,
}

impl Key {
	/// Creates an empty key. Useful as the minimum range endpoint.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a single-field key.
	pub fn single(field: KeyField) -> Self {
		let mut fields = SmallVec::new();
		fields.push(field);
		Self { fields }
	}

	/// Creates a key from a slice of fields.
	pub fn from_fields(fields: &[KeyField]) -> Result<Self, KeyError> {
		if fields.len() > MAX_KEY_WIDTH {
			return Err(KeyError::TooWide(fields.len()));
		}
		Ok(Self {
			fields: SmallVec::from_slice(fields),
		})
	}

	/// Appends one field.
	pub fn push(&mut self, field: KeyField) -> Result<(), KeyError> {
		if self.fields.len() == MAX_KEY_WIDTH {
			return Err(KeyError::TooWide(self.fields.len() + 1));
		}
		self.fields.push(field);
		Ok(())
	}

	pub fn width(&self) -> usize {
		self.fields.len()
	}

	pub fn is_empty(&self) -> bool {
		self.fields.is_empty()
	}

	pub fn fields(&self) -> &[KeyField] {
		&self.fields
	}

	/// Encodes the key as a big-endian byte vector.
	///
	/// The encoding is reversible via [`Key::decode`] and preserves the
	/// field count; it does not preserve ordering at the byte level.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = Vec::with_capacity(self.fields.len() * size_of::<KeyField>());
		for field in &self.fields {
			out.extend_from_slice(&field.to_be_bytes());
		}
		out
	}

	/// Decodes a key previously produced by [`Key::encode`].
	pub fn decode(bytes: &[u8]) -> Result<Self, KeyError> {
		const FIELD_SZ: usize = size_of::<KeyField>();
		if bytes.len() % FIELD_SZ != 0 {
			return Err(KeyError::Malformed(bytes.len()));
		}
		let width = bytes.len() / FIELD_SZ;
		if width > MAX_KEY_WIDTH {
			return Err(KeyError::TooWide(width));
		}
		let mut fields = SmallVec::new();
		for chunk in bytes.chunks_exact(FIELD_SZ) {
			let mut buf = [0u8; FIELD_SZ];
			buf.copy_from_slice(chunk);
			fields.push(KeyField::from_be_bytes(buf));
		}
		Ok(Self { fields })
	}
}

impl From<KeyField> for Key {
	fn from(field: KeyField) -> Self {
		Self::single(field)
	}
}

impl<const N: usize> From<[KeyField; N]> for Key {
	fn from(fields: [KeyField; N]) -> Self {
		const {
			assert!(N <= MAX_KEY_WIDTH);
		}
		Self {
			fields: SmallVec::from_slice(&fields),
		}
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "(")?;
		for (i, field) in self.fields.iter().enumerate() {
			if i > 0 {
				write!(f, "|")?;
			}
			write!(f, "{field}")?;
		}
		write!(f, ")")
	}
}
