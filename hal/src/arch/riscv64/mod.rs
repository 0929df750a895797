//! # RISC-V 64-bit (Sv39) Architecture Support
//!
//! The reference target for this HAL: a 64-bit RISC-V supervisor running
//! with the Sv39 paging mode.

pub mod sv39;

pub use sv39::{
    DirectMap, PageFrameSource, PteFlags, RawPte, Sv39PageTable, LEVELS, MAXVA, PGSIZE,
};
