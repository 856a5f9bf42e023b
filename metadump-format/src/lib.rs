//! *metadump* on-disk format.
//!
//! One capture run produces two correlated files:
//!
//! - the **tree file**: the format version followed by a flat stream of
//!   little-endian `u32` values encoding the directory nesting. Value `0`
//!   enters a child scope, value `1` leaves it, and any other value is a
//!   byte offset into the data file, immediately followed by a fixed size
//!   directory entry descriptor (inode, name length, type tag and a 256
//!   byte name field).
//!
//! - the **data file**: the same format version followed by one
//!   self-describing metadata record per visited entry, in visit order
//!   (pre-order, an entry before its children). Record boundaries are not
//!   stored; they are re-derived by decoding each record in sequence, or
//!   skipped entirely by seeking to an offset taken from the tree file.
//!
//! Data offsets start at [`DATA_OFFSET`] so they can never collide with
//! the two marker values; the stored offset of a record is its data file
//! position plus [`DATA_OFFSET`].

pub mod file_formats;
pub mod record;
pub mod tree;

pub use file_formats::{FormatVersion, DATA_OFFSET, MARKER_POP, MARKER_PUSH, METADUMP_FORMAT_VERSION};
