//! Nullable infrastructure for deterministic testing.
//!
//! Every external dependency of a node (clock, storage, ledger directory,
//! transport) sits behind a trait. This crate provides test-friendly
//! implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Never touch the filesystem or network
//!
//! Usage: swap real implementations for nullables in tests.

pub mod clock;
pub mod directory;
pub mod network;
pub mod store;

pub use clock::NullClock;
pub use directory::NullDirectory;
pub use network::{NullTransport, SentFrame};
pub use store::NullBackend;
