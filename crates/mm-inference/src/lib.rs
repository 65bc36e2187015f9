//! Inference adapters for the MangaMotion compute pipeline.
//!
//! The model itself is opaque. This crate provides one trait,
//! [`InferenceAdapter`], with three runners:
//! - [`SubprocessAdapter`]: a local model process speaking a line protocol
//! - [`HttpAdapter`]: a remote inference service
//! - [`StubAdapter`]: a passthrough used in development and tests

pub mod adapter;
pub mod config;
pub mod error;
pub mod http;
pub mod stub;
pub mod subprocess;
pub mod types;

pub use adapter::{create_adapter, InferenceAdapter};
pub use config::{AdapterKind, InferenceConfig};
pub use error::{InferenceError, InferenceResult};
pub use http::HttpAdapter;
pub use stub::StubAdapter;
pub use subprocess::SubprocessAdapter;
pub use types::{InferenceRequest, InferenceResponse, ProgressTx};
