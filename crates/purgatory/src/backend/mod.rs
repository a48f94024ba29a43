//! Persistence layer for breaker records
//!
//! This module provides:
//! - [`BreakerBackend`] trait, the only way breaker state is read or mutated
//! - [`InMemoryBackend`] for single-process use
//! - [`KvBackend`] over a [`KeyValueStore`], with [`RedisKeyValueStore`] for
//!   multi-process use and [`MemoryKeyValueStore`] as a local stand-in
//! - [`BackendFactory`] to build a backend from a [`BackendKind`]

mod factory;
mod kv;
mod memory;
mod redis;
mod store;

pub use self::redis::RedisKeyValueStore;
pub use factory::{BackendConstructor, BackendFactory, BackendKind};
pub use kv::{KeyValueStore, KvBackend, MemoryKeyValueStore};
pub use memory::InMemoryBackend;
pub use store::{BackendError, BreakerBackend, ExpectedState};
