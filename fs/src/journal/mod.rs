//! Write-ahead log: a small circular region (header block + data slots)
//! that lets a multi-block filesystem operation become crash-atomic.
//!
//! Every block-modifying VFS operation brackets its writes with
//! [`wal::Log::begin_op`]/[`wal::Log::end_op`]; [`recovery::recover`] runs once
//! at mount time and replays (or discards) whatever the previous session
//! left behind.

pub mod recovery;
pub mod wal;

pub use recovery::recover;
pub use wal::{Log, LOGSIZE, MAXOPBLOCKS};
