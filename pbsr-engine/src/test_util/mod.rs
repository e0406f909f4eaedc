//! Test utilities for reconciliation tests
//!
//! This module provides an in-memory backup server that behaves like the
//! real API where the engine cares: digests change on every write, some
//! mutations run as tasks, and faults (lock contention, failing or hanging
//! tasks, delayed visibility) can be injected.

pub mod memory_client;

pub use memory_client::{Calls, MemoryClient};
