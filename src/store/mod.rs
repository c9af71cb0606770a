//! State object stores.
//!
//! The [`backend::ObjectStore`] trait abstracts over where state objects
//! physically live.  Implementations include Kubernetes ConfigMaps, an
//! in-memory map and a single-file SQLite database.  None of them offer
//! compare-and-swap; concurrent writers are coordinated by the lock
//! annotations alone.

pub mod backend;
pub mod kubernetes;
pub mod memory;
pub mod sqlite;
