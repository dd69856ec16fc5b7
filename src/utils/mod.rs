//! Process-level helpers for binaries built on the transport.

pub mod bootstrap;
pub mod retry;
