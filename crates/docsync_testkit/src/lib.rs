//! # docsync Testkit
//!
//! Test utilities for docsync.
//!
//! This crate provides:
//! - Database fixtures, in memory or in a temporary directory
//! - A revision store with injectable faults
//! - Property-based test generators using proptest
//! - Recorders that capture replicator status and document events
//! - Logging setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docsync_testkit::prelude::*;
//!
//! #[test]
//! fn replicates() {
//!     init_logging();
//!     let local = TestDatabase::memory();
//!     save_doc(&local, "doc1", [("v", 1i64)]);
//!     // ... start a replicator and wait with a StatusRecorder
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod logging;
pub mod recorder;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::logging::*;
    pub use crate::recorder::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use logging::*;
pub use recorder::*;
