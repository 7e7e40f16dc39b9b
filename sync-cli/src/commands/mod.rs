//! CLI command implementations.

pub mod folders;
pub mod index;
pub mod init;
pub mod scan;
pub mod status;
