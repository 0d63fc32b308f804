//! HTTP server module with TLS support.
//!
//! This module provides the server façade and the pieces it is built from:
//! - **Plain**: HTTP with hardened timeouts
//! - **Static TLS**: user-provided certificate and key, compat or modern profile
//! - **ACME**: automatic certificates via the HTTP-01 challenge, with an
//!   optional port-80 companion listener for challenges and redirects
//!
//! Helpers for 301 redirects and static asset cache headers live here too.

pub mod acme;
pub mod cache_headers;
mod idle;
pub mod redirect;
mod server;
pub mod tls;

pub use acme::{AcmeManager, AcmeOptions, HostWhitelist, WhitelistResolver};
pub use cache_headers::{add_cache_headers, CacheHeaders};
pub use redirect::redirect_all;
pub use server::{Server, ServerArgs};
pub use tls::TlsProfile;
