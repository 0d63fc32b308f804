//! Fragmenta server - a hardened HTTP/HTTPS server foundation
//!
//! Wraps axum and rustls with fixed listener timeouts, two TLS profiles,
//! automatic ACME certificates, a per-request tracing middleware and the
//! development/production configuration loader.

pub mod config;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;

pub use config::{ConfigStore, Environment};
pub use error::*;
pub use crate::http::{Server, ServerArgs};
pub use middleware::{trace, trace_layer, RequestId, Trace};
