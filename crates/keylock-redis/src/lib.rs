//! Redis backend for keylock.
//!
//! `RedisStore` implements `keylock_core::LockStore` against a single Redis
//! primary. Plug it into `StoreLockProvider` for fair, multi-key and watchdog
//! locks, or into `SingleNodeLock` for the plain SET-if-absent primitive.

pub mod config;
mod scripts;
mod store;

pub use store::RedisStore;
