pub mod client;
pub mod config;
pub mod error;
pub mod group;
pub mod keyspace;
pub mod lock;
pub mod memory;
pub mod record;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;
pub mod script;
pub mod store;
pub mod token;

pub use client::LockClient;
pub use config::{LockConfig, LockOptions};
pub use error::{LockError, StoreError};
pub use group::{GroupIndex, IndexedLock};
pub use keyspace::KeySpace;
pub use lock::{Lock, LockOutcome};
pub use memory::InMemoryScriptStore;
pub use record::LockRecord;
#[cfg(feature = "redis")]
pub use self::redis::RedisScriptStore;
pub use registry::LockRegistry;
pub use script::{AtomicScriptRunner, Procedure, ScriptRegistry};
pub use store::{ScriptStore, ScriptValue};
pub use token::TokenSequence;

#[cfg(feature = "mock")]
pub use store::MockScriptStore;
