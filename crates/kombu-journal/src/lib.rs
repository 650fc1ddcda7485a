//! Durable replay log for the notification stream.
//!
//! The [`Archiver`] consumes a cache instance's notification stream and
//! appends each event as a length-prefixed, CRC-checked record to rotating
//! journal files named `<base>.<seq>.<ext>`. [`restore`] replays those files
//! in sequence order, tolerating a truncated or corrupt tail (the expected
//! residue of a crash mid-append).

pub mod archiver;
pub mod record;
pub mod restorer;

pub use archiver::{ArchiveConfig, Archiver, JournalError};
pub use record::{decode_record, encode_record, RecordError};
pub use restorer::{restore, RestoreReport};
