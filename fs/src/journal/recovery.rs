//! Crash recovery: replay whatever the log's header says was committed.
//!
//! Runs once at mount, before the filesystem is opened for use. A clean
//! unmount leaves `n == 0` in the header and this is a no-op; an unclean
//! one leaves `n > 0` and every one of those blocks is copied from its
//! log slot back to its home location, exactly as [`super::wal::Log::commit`]
//! would have done had the crash not interrupted it.

use super::wal::Log;
use crate::core::error::HfsResult;
use crate::BLOCK_SIZE;

/// Replay the log against its device, then clear the header.
///
/// Idempotent: running it again immediately afterwards is a no-op
/// because the header it just wrote has `n == 0`.
pub fn recover(log: &Log) -> HfsResult<()> {
    let (n, blocks) = log.read_head()?;
    if n == 0 {
        return Ok(());
    }
    log::info!("replaying {} block(s) from write-ahead log", n);

    let mut buf = [0u8; BLOCK_SIZE];
    for i in 0..n as usize {
        let slot = log.data_slot_for_recovery(i);
        log.device().read_block(slot, &mut buf)?;
        let home = crate::core::types::BlockNum::new(blocks[i] as u64);
        log.device().write_block(home, &buf)?;
    }
    log.device().sync()?;
    log.clear_header()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::BlockNum;
    use crate::disk::device::{BlockDevice, MemoryBlockDevice};
    use alloc_crate::sync::Arc;
    use alloc_crate::vec;

    fn make_device(total_blocks: u64) -> (Arc<dyn BlockDevice>, alloc_crate::vec::Vec<u8>) {
        let size = (total_blocks as usize) * BLOCK_SIZE;
        let mut storage = vec![0u8; size];
        let dev: Arc<dyn BlockDevice> = unsafe {
            Arc::new(MemoryBlockDevice::from_buffer(storage.as_mut_ptr(), size, BLOCK_SIZE as u32))
        };
        (dev, storage)
    }

    #[test]
    fn clean_header_is_a_no_op() {
        let (dev, _storage) = make_device(40);
        let log = Log::new(dev, BlockNum::new(0), 30);
        recover(&log).unwrap();
        let (n, _) = log.read_head().unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn replays_a_header_left_by_an_interrupted_commit() {
        let (dev, _storage) = make_device(40);
        let log = Log::new(dev, BlockNum::new(0), 30);

        // Simulate a crash right after the header write in `Log::commit`:
        // the data slot holds the new contents, the header names the
        // target block, but the block itself was never installed.
        let payload = [0x77u8; BLOCK_SIZE];
        log.device().write_block(log.data_slot_for_recovery(0), &payload).unwrap();
        let mut header = [0u8; BLOCK_SIZE];
        header[0..4].copy_from_slice(&1u32.to_ne_bytes());
        header[4..8].copy_from_slice(&20u32.to_ne_bytes());
        log.device().write_block(BlockNum::new(0), &header).unwrap();

        recover(&log).unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        log.device().read_block(BlockNum::new(20), &mut out).unwrap();
        assert_eq!(out, payload);

        let (n, _) = log.read_head().unwrap();
        assert_eq!(n, 0, "recovery must clear the header once replay is done");
    }
}
