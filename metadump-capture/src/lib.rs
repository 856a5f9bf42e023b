//! Metadata capture for directory trees.
//!
//! A capture session walks a tree depth first and writes two streams:
//! the structural stream mirroring the hierarchy and the bulk data
//! stream holding one metadata record per visited entry. Everything
//! runs single threaded; the session owns the scratch buffer, the
//! digest provider and the device pair guarding against descents
//! across mount points.

pub mod capture;
pub mod digest;
pub mod scratch;
pub mod sys;

pub use capture::{create_snapshot, CaptureError};
pub use digest::{ContentDigester, Sha256Digester};
