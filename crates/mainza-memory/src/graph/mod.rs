//! Connection and resilience layer for the graph store, plus schema setup.

pub mod breaker;
pub mod client;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod statement;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use breaker::{BreakerMetrics, CircuitBreaker, CircuitState};
pub use client::GraphClient;
pub use pool::{ConnectionPool, PoolStatus, PooledConnection, Priority};
pub use schema::{SchemaManager, SchemaReport, FULLTEXT_INDEX, VECTOR_INDEX};
pub use statement::{QueryResult, Row, Statement};
pub use transport::{
    AccessMode, FailureKind, GraphConnection, GraphConnector, HttpConnector, TransportError,
};
