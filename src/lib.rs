#![forbid(unsafe_code)]

//! Serving and reliability core for a semantic chunk store.
//!
//! This crate owns: the unified chunk data model and its invariants (§3,
//! [`chunk`]); the error taxonomy that drives retry/circuit-breaker/HTTP
//! behavior ([`error`]); the retry engine ([`retry`]) and per-dependency
//! circuit breaker ([`circuit_breaker`], [`breaker_registry`]), composed by
//! [`executor`]; the typed storage gateway client ([`gateway`]); the
//! in-process entity cache ([`cache::entity`]) and the persisted
//! search-result cache logic ([`cache::search`]); the chunk and search
//! services that compose all of the above ([`chunk_service`],
//! [`search_service`]); and the HTTP surface that exposes them ([`http`]).
//!
//! Everything that touches the network goes through [`gateway::StorageGateway`],
//! which is itself always wrapped by [`executor::Executor`] — no other module
//! performs outbound I/O.

pub mod backoff;
pub mod breaker_registry;
pub mod cache;
pub mod chunk;
pub mod chunk_service;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod http;
pub mod jitter;
pub mod retry;
pub mod search_service;
pub mod sleeper;

pub use breaker_registry::BreakerRegistry;
pub use chunk::{Chunk, ChunkDraft, ChunkPatch};
pub use chunk_service::ChunkService;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::Config;
pub use error::{AppError, ErrorKind};
pub use executor::Executor;
pub use gateway::StorageGateway;
pub use retry::RetryPolicy;
pub use search_service::SearchService;
