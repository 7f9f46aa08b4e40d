//! Core traits and types for method-scoped distributed locking.
//!
//! This crate holds everything that does not depend on a particular store:
//! - `KeyTemplate`: resolves `prefix:#expr:suffix` templates against call arguments
//! - `LockOptions` / `LockPolicy`: declarative lock configuration
//! - `LockStore`: the atomic key-value operations a backend must provide
//! - `SingleNodeLock`: SET-if-absent lock with compare-and-delete release
//! - `LockProvider`: fair, regular and multi-key locks with watchdog leases
//! - `LockOrchestrator` / `Guard`: acquire, run and release around an operation
//!
//! `MemoryStore` is an in-process `LockStore` for tests and single-process use.

mod binding;
mod error;
mod guard;
mod memory;
mod orchestrator;
mod policy;
mod primitive;
mod provider;
mod store;
mod template;

#[cfg(test)]
mod testing;

pub use binding::{Invocation, InvocationMetadata, ParameterBinding};
pub use error::LockError;
pub use guard::Guard;
pub use memory::MemoryStore;
pub use orchestrator::{LockHandle, LockOrchestrator};
pub use policy::{
    Lease, LockOptions, LockPolicy, TimeUnit, Wait, DEFAULT_LEASE_TIME, DEFAULT_WAIT_TIME,
    UNBOUNDED,
};
pub use primitive::{SingleNodeLock, DEFAULT_LOCK_TTL, DEFAULT_RETRY_PAUSE};
pub use provider::{DistributedLock, LockProvider, ProviderConfig, StoreLock, StoreLockProvider};
pub use store::{ttl_millis, AcquireRequest, LockStore};
pub use template::{resolve, resolve_all, KeyTemplate, EXPRESSION_MARKER, KEY_SEPARATOR};
