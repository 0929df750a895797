//! # Architecture-Specific HAL Modules
//!
//! This module re-exports the appropriate HAL implementation
//! based on the target architecture.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

pub mod riscv64;

// Re-export the current architecture's HAL. riscv64 is the primary target;
// x86_64 stays buildable on host machines for `cargo test`.
#[cfg(target_arch = "riscv64")]
pub use riscv64 as current;

#[cfg(all(target_arch = "x86_64", not(target_arch = "riscv64")))]
pub use x86_64 as current;

// Future architectures
// #[cfg(target_arch = "aarch64")]
// pub mod aarch64;
