//! rpclet: HTTP bridge to a long-lived JSON-RPC worker over stdio.
//!
//! One worker subprocess is spawned at startup. HTTP callers `POST` JSON-RPC
//! requests; each is written to the worker's stdin, and the single stdout
//! reader matches the worker's responses back to the waiting caller by id.

pub mod bridge;
pub mod config;
mod health;
pub mod process;
pub mod proxy;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testing;

pub use bridge::protocol::{ErrorObject, ErrorResponse, Message, Request, RequestId};
pub use health::{WorkerExit, WorkerState};
pub use process::{
    CommandSpawner, ProcessSupervisor, SpawnError, WorkerConfig, WorkerError, WorkerLink,
    WorkerSpawner,
};
pub use proxy::{CorrelationProxy, DispatchHandle, Outcome};
pub use service::BridgeService;
