//! Shared transport integration tests.
//!
//! Exercises client and server together against any log store. Each store
//! module builds a connector and runs these through `run_transport_tests!`.

pub mod transport_tests;
