#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared types for the loadforge benchmarking harness: endpoints, the wire
//! envelope exchanged between coordinator and nodes, and the narrow SQL/KVS
//! capability interfaces that workloads are written against.

pub mod config;
pub mod endpoint;
pub mod kvs;
pub mod sql;
pub mod wire;

pub use config::BenchmarkConfig;
pub use endpoint::Endpoint;
pub use kvs::{KvsBackend, KvsError};
pub use sql::{SqlBackend, SqlError};
pub use wire::{MessageKind, WireMessage};
