//! Core types for the Courier network-operation engine.
//!
//! This crate defines the [`Operation`] object — a single schedulable HTTP
//! request with its own lifecycle state machine and ordered observer sets —
//! together with the supporting vocabulary: the [`Target`] descriptor that
//! says where to connect and as whom, the [`OperationKey`] identity used for
//! request deduplication, request-body encoding (form, custom, multipart),
//! and response materialization.
//!
//! Scheduling, transport, and retry policy live in `courier-engine`;
//! content-at-rest encryption lives in `courier-crypto`. Both depend on the
//! seams defined here ([`ContentStore`], the operation state machine).

pub mod body;
pub mod error;
pub mod key;
pub mod method;
pub mod operation;
pub mod response;
pub mod state;
pub mod store;
pub mod target;

pub use body::{BodyEncoder, FilePart, OCTET_STREAM};
pub use error::CourierError;
pub use key::OperationKey;
pub use method::{Method, UnknownMethod};
pub use operation::{
    CachePolicy, CancelHandler, CompletionHandler, ErrorHandler, ObserverBundle, Operation,
    OperationDelegate, Priority, ProgressHandler, RequestParts,
};
pub use response::{Response, ResponseBody, detect_logical_error};
pub use state::OperationState;
pub use store::{ContentStore, PlainStore};
pub use target::Target;
