//! LMDB storage backend for idnet nodes.
//!
//! Implements [`idnet_store::KvBackend`] over the `heed` LMDB bindings. All
//! namespaced collections share one named database inside one environment;
//! the key prefixes keep them apart.

pub mod environment;
pub mod error;

pub use environment::LmdbBackend;
pub use error::LmdbError;
