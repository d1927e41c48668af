//! The Courier operation engine.
//!
//! The [`Engine`] converts request descriptions into
//! [`Operation`](courier_core::Operation)s, deduplicates equivalent
//! in-flight requests, schedules execution against a reachability-aware
//! concurrency budget, applies retry/backoff on network failures, parks
//! operations that need a session refresh, and broadcasts engine-wide
//! lifecycle events.
//!
//! Transport is a seam: the [`Transport`] trait has a production
//! [`HttpTransport`] built on `reqwest`, and tests drive the engine with
//! scripted in-process implementations.

pub mod config;
pub mod engine;
pub mod events;
pub mod retry;
pub mod transport;

pub use config::EngineConfig;
pub use engine::{Engine, EngineBuilder, SessionObserver};
pub use events::{EngineEvent, Reachability};
pub use retry::RetryBackoff;
pub use transport::{
    HttpTransport, ProgressHooks, Transport, TransportBody, TransportError, TransportRequest,
    TransportResponse,
};
