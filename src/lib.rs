pub mod client;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod keyspace;
pub mod marshal;
pub mod pool;
pub mod protocol;
pub mod row;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use client::Client;
pub use config::{ConnectionConfig, Host, PoolConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionState, PingOutcome, QueryOptions};
pub use discovery::{discover, discover_pool};
pub use error::Error;
pub use keyspace::Keyspace;
pub use marshal::{Marshaller, TypeDescriptor, Value};
pub use pool::{Health, MonitorReport, Pool, PoolEvent, RingChange};
pub use row::{Column, QueryResult, Row};

// Shared state stays usable after a panicking holder; none of it is left
// half-updated across a panic point.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
