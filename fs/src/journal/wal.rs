//! The log itself: `begin_op`/`log_write`/`end_op` and the on-disk header
//! that makes a batch of block writes atomic across a crash.
//!
//! On-disk layout, starting at the log's header block:
//!
//! ```text
//! block 0:           header { n: u32, block[LOGSIZE]: u32 }
//! block 1..=LOGSIZE: data slots, slot i holds a copy of `block[i]`'s contents
//! ```
//!
//! A transaction becomes durable the instant the header with `n > 0` hits
//! disk (`write_head` in [`Log::commit`]); everything before that point is
//! invisible after a crash, everything at or after it is fully replayed by
//! [`super::recovery::recover`].

use crate::core::error::{HfsError, HfsResult};
use crate::core::types::BlockNum;
use crate::disk::device::BlockDevice;
use crate::BLOCK_SIZE;
use alloc_crate::boxed::Box;
use alloc_crate::sync::Arc;
use alloc_crate::vec::Vec;
use core::mem::size_of;
use spin::Mutex;

/// Maximum number of distinct blocks the log can hold across one
/// transaction window.
pub const LOGSIZE: usize = 30;

/// Maximum number of distinct blocks a single filesystem operation
/// (one `begin_op`/`end_op` bracket) may write. Bounds how many
/// concurrently-outstanding operations the log can admit at once.
pub const MAXOPBLOCKS: usize = 10;

/// On-disk log header: how many blocks are logged, and which ones.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct LogHeaderRaw {
    n: u32,
    block: [u32; LOGSIZE],
}

const HEADER_SIZE: usize = size_of::<LogHeaderRaw>();
const _: () = assert!(HEADER_SIZE <= BLOCK_SIZE);

impl LogHeaderRaw {
    fn empty() -> Self {
        Self { n: 0, block: [0; LOGSIZE] }
    }

    fn to_block_bytes(self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        // SAFETY: `LogHeaderRaw` is plain-old-data and `HEADER_SIZE <= BLOCK_SIZE`.
        let bytes = unsafe {
            core::slice::from_raw_parts((&self as *const Self).cast::<u8>(), HEADER_SIZE)
        };
        buf[..HEADER_SIZE].copy_from_slice(bytes);
        buf
    }

    fn from_block_bytes(buf: &[u8; BLOCK_SIZE]) -> Self {
        // SAFETY: every bit pattern of a `u32` array is a valid `LogHeaderRaw`;
        // we only read `HEADER_SIZE` bytes of the block.
        unsafe { core::ptr::read_unaligned(buf.as_ptr().cast()) }
    }

    fn is_sane(&self) -> bool {
        { self.n } as usize <= LOGSIZE
    }
}

type BlockBuf = Box<[u8; BLOCK_SIZE]>;

struct LogState {
    outstanding: u32,
    committing: bool,
    /// Blocks written through `log_write` this transaction window, in
    /// first-write order. A second write to an already-logged block
    /// overwrites its slot in place (log absorption) instead of growing
    /// the list.
    absorbed: Vec<(BlockNum, BlockBuf)>,
}

/// The write-ahead log for one mounted filesystem.
pub struct Log {
    dev: Arc<dyn BlockDevice>,
    /// Header block number.
    start: BlockNum,
    /// Usable data slots, `<= LOGSIZE`.
    size: u32,
    state: Mutex<LogState>,
}

impl Log {
    /// Open the log region `[start, start + 1 + size_blocks)`, `start`
    /// being the header block. Does not run recovery; call
    /// [`super::recovery::recover`] first during mount.
    pub fn new(dev: Arc<dyn BlockDevice>, start: BlockNum, size_blocks: u64) -> Self {
        let size = size_blocks.min(LOGSIZE as u64) as u32;
        Self {
            dev,
            start,
            size,
            state: Mutex::new(LogState { outstanding: 0, committing: false, absorbed: Vec::new() }),
        }
    }

    fn data_slot(&self, index: usize) -> BlockNum {
        self.start.offset(1 + index as u64)
    }

    /// Admit one filesystem operation into the current transaction
    /// window. Spins (bounded) while a commit is in flight or while
    /// admitting would risk overflowing the log; a real scheduler would
    /// park the caller on a wait channel here instead.
    pub fn begin_op(&self) -> HfsResult<()> {
        const MAX_SPINS: u32 = 1_000_000;
        for _ in 0..MAX_SPINS {
            let mut state = self.state.lock();
            let would_overflow = state.absorbed.len() + (state.outstanding as usize + 1) * MAXOPBLOCKS
                > self.size as usize;
            if state.committing || would_overflow {
                drop(state);
                core::hint::spin_loop();
                continue;
            }
            state.outstanding += 1;
            return Ok(());
        }
        Err(HfsError::Busy)
    }

    /// Absorb a write to `blockno` into the current transaction. Must be
    /// called between `begin_op` and `end_op`. `data` must be exactly one
    /// block long.
    pub fn log_write(&self, blockno: BlockNum, data: &[u8; BLOCK_SIZE]) -> HfsResult<()> {
        let mut state = self.state.lock();
        if state.outstanding == 0 {
            return Err(HfsError::Inval);
        }
        if let Some((_, slot)) = state.absorbed.iter_mut().find(|(b, _)| *b == blockno) {
            slot.as_mut().copy_from_slice(data);
            return Ok(());
        }
        if state.absorbed.len() >= self.size as usize {
            return Err(HfsError::NoSpc);
        }
        state.absorbed.push((blockno, Box::new(*data)));
        Ok(())
    }

    /// Release this operation's slot; the last concurrent operation to
    /// call `end_op` commits everything logged since the window opened.
    pub fn end_op(&self) -> HfsResult<()> {
        let absorbed = {
            let mut state = self.state.lock();
            debug_assert!(!state.committing, "end_op racing an in-flight commit");
            state.outstanding -= 1;
            if state.outstanding != 0 {
                return Ok(());
            }
            state.committing = true;
            core::mem::take(&mut state.absorbed)
        };

        let result = self.commit(&absorbed);

        let mut state = self.state.lock();
        state.committing = false;
        result
    }

    /// Write each logged block to its log slot, write the header (the
    /// durable commit point), install every block to its home location,
    /// then clear the header. A crash before the header write loses the
    /// transaction entirely; a crash after it is fully replayed by
    /// [`super::recovery::recover`].
    fn commit(&self, absorbed: &[(BlockNum, BlockBuf)]) -> HfsResult<()> {
        if absorbed.is_empty() {
            return Ok(());
        }
        self.write_log(absorbed)?;
        self.write_head(absorbed)?;
        self.install_trans(absorbed)?;
        self.write_head(&[])
    }

    fn write_log(&self, absorbed: &[(BlockNum, BlockBuf)]) -> HfsResult<()> {
        for (index, (_, data)) in absorbed.iter().enumerate() {
            self.dev.write_block(self.data_slot(index), data.as_ref())?;
        }
        Ok(())
    }

    fn install_trans(&self, absorbed: &[(BlockNum, BlockBuf)]) -> HfsResult<()> {
        for (blockno, data) in absorbed {
            self.dev.write_block(*blockno, data.as_ref())?;
        }
        Ok(())
    }

    fn write_head(&self, absorbed: &[(BlockNum, BlockBuf)]) -> HfsResult<()> {
        let mut header = LogHeaderRaw::empty();
        header.n = absorbed.len() as u32;
        for (i, (blockno, _)) in absorbed.iter().enumerate() {
            header.block[i] = blockno.get() as u32;
        }
        self.dev.write_block(self.start, &header.to_block_bytes())?;
        self.dev.sync()
    }

    pub(super) fn read_head(&self) -> HfsResult<(u32, [u32; LOGSIZE])> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.dev.read_block(self.start, &mut buf)?;
        let header = LogHeaderRaw::from_block_bytes(&buf);
        if !header.is_sane() {
            log::warn!("corrupt log header, treating as zero committed blocks");
            return Ok((0, [0; LOGSIZE]));
        }
        Ok(({ header.n }, { header.block }))
    }

    pub(super) fn data_slot_for_recovery(&self, index: usize) -> BlockNum {
        self.data_slot(index)
    }

    pub(super) fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.dev
    }

    pub(super) fn clear_header(&self) -> HfsResult<()> {
        self.write_head(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::device::MemoryBlockDevice;
    use alloc_crate::vec;

    fn make_log(total_blocks: u64) -> (Log, Vec<u8>) {
        let size = (total_blocks as usize) * BLOCK_SIZE;
        let mut storage = vec![0u8; size];
        let dev: Arc<dyn BlockDevice> = unsafe {
            Arc::new(MemoryBlockDevice::from_buffer(storage.as_mut_ptr(), size, BLOCK_SIZE as u32))
        };
        let log = Log::new(dev, BlockNum::new(0), (LOGSIZE + 1) as u64);
        (log, storage)
    }

    fn block_of(byte: u8) -> [u8; BLOCK_SIZE] {
        [byte; BLOCK_SIZE]
    }

    #[test]
    fn single_op_commits_and_installs() {
        let (log, _storage) = make_log((LOGSIZE + 10) as u64);
        log.begin_op().unwrap();
        log.log_write(BlockNum::new(5), &block_of(0xAB)).unwrap();
        log.end_op().unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        log.device().read_block(BlockNum::new(5), &mut out).unwrap();
        assert_eq!(out, block_of(0xAB));

        let (n, _) = log.read_head().unwrap();
        assert_eq!(n, 0, "header cleared after successful commit");
    }

    #[test]
    fn second_write_to_same_block_absorbs_not_appends() {
        let (log, _storage) = make_log((LOGSIZE + 10) as u64);
        log.begin_op().unwrap();
        log.log_write(BlockNum::new(7), &block_of(1)).unwrap();
        log.log_write(BlockNum::new(3), &block_of(2)).unwrap();
        log.log_write(BlockNum::new(7), &block_of(9)).unwrap();
        {
            let state = log.state.lock();
            assert_eq!(state.absorbed.len(), 2);
        }
        log.end_op().unwrap();

        let mut out = [0u8; BLOCK_SIZE];
        log.device().read_block(BlockNum::new(7), &mut out).unwrap();
        assert_eq!(out, block_of(9), "latest write to block 7 must win");
        log.device().read_block(BlockNum::new(3), &mut out).unwrap();
        assert_eq!(out, block_of(2));
    }

    #[test]
    fn log_write_outside_transaction_is_rejected() {
        let (log, _storage) = make_log((LOGSIZE + 10) as u64);
        assert_eq!(log.log_write(BlockNum::new(1), &block_of(1)), Err(HfsError::Inval));
    }

    #[test]
    fn transaction_over_capacity_is_rejected() {
        let (log, _storage) = make_log(4);
        log.begin_op().unwrap();
        for i in 0..log.size {
            log.log_write(BlockNum::new(100 + i as u64), &block_of(1)).unwrap();
        }
        assert_eq!(log.log_write(BlockNum::new(999), &block_of(1)), Err(HfsError::NoSpc));
        log.end_op().unwrap();
    }
}
