//! CLI command implementations for the TDE proxy.

pub mod check;
pub mod keys;
pub mod rewrite;
pub mod serve;
