//! Concrete filesystem back ends implementing [`crate::vfs::FsOps`].

pub mod simplefs;
