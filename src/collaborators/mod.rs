//! External collaborator traits (§6 "External dependencies").
//!
//! Grounded on the teacher's `connectors::core::{Connector, AsyncConnector}`
//! trait-per-concern split — here each external system gets its own narrow
//! `async_trait`, with an in-memory fake for tests and local runs. Durable
//! implementations live behind the `sled-store` / `redis-store` /
//! `postgres-store` Cargo features.

pub mod audit;
pub mod http_probe;
pub mod kv_store;
pub mod relational_store;

pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink};
pub use http_probe::{HttpProbe, HttpProbeResult, InMemoryHttpProbe};
pub use kv_store::{InMemoryKvStore, KvStore};
#[cfg(feature = "sled-store")]
pub use kv_store::SledKvStore;
#[cfg(feature = "redis-store")]
pub use kv_store::RedisKvStore;
pub use relational_store::{EntityRow, InMemoryRelationalStore, PurgeAuditRow, RelationalStore};
#[cfg(feature = "postgres-store")]
pub use relational_store::PostgresRelationalStore;
