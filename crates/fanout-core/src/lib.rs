//! Fanout Core - Shared types and traits
//!
//! This crate defines the core abstractions used across:
//! - fanout-orchestrator (library + `fanout` binary)
//! - fanout-test-utils (scripted fakes for tests)
//!
//! Key types:
//! - Seam traits (control-plane transport, secure copy, clock, packager)
//! - Instance, bundle and job types
//! - Error types

pub mod error;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
