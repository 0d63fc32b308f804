//! fragmenta-server: a standalone server built on the library.
//!
//! Loads `secrets/fragmenta.json` for the environment selected by `FRAG_ENV`,
//! initializes tracing, and starts one listener chosen from the configuration:
//! ACME when `autocert_domains` is set, static TLS when `tls_cert` and
//! `tls_key` are set, plain HTTP otherwise.

use axum::{routing::get, Router};
use clap::Parser;

use fragmenta_server::logging::{self, LoggingConfig};
use fragmenta_server::{Server, ServerArgs, Trace};

async fn ping(Trace(trace): Trace) -> &'static str {
    tracing::debug!(trace = %trace, "ping");
    "pong"
}

/// Liveness probe.
async fn health() -> &'static str {
    "ok"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = ServerArgs::parse();
    let server = Server::from_args(&args)?;

    logging::init(&LoggingConfig::from_config(
        server.config_store(),
        args.log_level.clone(),
    ))?;

    tracing::info!(
        mode = server.mode(),
        port = server.port(),
        "Loaded configuration"
    );

    let app = Router::new()
        .route("/ping", get(ping))
        .route("/health", get(health));

    if let Some(port) = u16::try_from(server.config_int("redirect_port"))
        .ok()
        .filter(|p| *p > 0)
    {
        let _redirect = server.start_redirect_all(port, server.config("redirect_host"));
    }

    let domains = server.config("autocert_domains");
    let cert = server.config("tls_cert");
    let key = server.config("tls_key");

    if !domains.is_empty() {
        let email = server.config("autocert_email");
        server.start_tls_auto(Some(app), &email, &domains).await?;
    } else if !cert.is_empty() && !key.is_empty() {
        if server.config_bool("tls_modern") {
            server.start_tls_modern(Some(app), &cert, &key).await?;
        } else {
            server.start_tls(Some(app), &cert, &key).await?;
        }
    } else {
        server.start(Some(app)).await?;
    }

    Ok(())
}
