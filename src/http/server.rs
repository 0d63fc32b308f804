//! HTTP/HTTPS server façade.
//!
//! [`Server`] is built once from `FRAG_ENV`, `secrets/fragmenta.json` and the
//! command line, then consumed by one of the `start*` operations:
//! - `start`: plain HTTP
//! - `start_tls` / `start_tls_modern`: certificate and key from PEM files
//! - `start_tls_auto`: ACME certificates plus the port-80 challenge listener
//! - `start_tls_autocert`: ACME certificates, challenge path left to the caller
//!
//! Each `start*` wraps the application in the tracing middleware and blocks
//! until the listener fails. No signal handlers are installed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{middleware, Router};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use clap::Parser;
use http::StatusCode;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;

use crate::config::{
    resolve_port, ConfigError, ConfigStore, Environment, Timeouts, DEFAULT_CONFIG_PATH,
    SECRETS_DIR,
};
use crate::error::ServerError;
use crate::middleware::trace_layer;

use super::acme::{AcmeManager, AcmeOptions, ACME_HTTP_PORT};
use super::idle::IdleAcceptor;
use super::redirect;
use super::tls::{load_pem, TlsProfile};

/// Command line options read at construction.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "fragmenta-server", version, about)]
pub struct ServerArgs {
    /// Port to serve on, overriding the configured port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Log level filter (e.g., "fragmenta_server=debug,tower_http=info")
    #[arg(short, long)]
    pub log_level: Option<String>,
}

/// Listener on all interfaces.
fn any_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

#[derive(Debug, Clone)]
pub struct Server {
    port: u16,
    config: ConfigStore,
    timeouts: Timeouts,
    cache_dir: PathBuf,
}

impl Server {
    /// Construct from the process environment, the default config path and
    /// the process arguments.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_args(&ServerArgs::parse())
    }

    /// Construct from already-parsed arguments.
    pub fn from_args(args: &ServerArgs) -> Result<Self, ConfigError> {
        Self::load(Environment::from_env(), DEFAULT_CONFIG_PATH, args)
    }

    /// Construct with an explicit environment and config file.
    pub fn load<P: AsRef<Path>>(
        environment: Environment,
        path: P,
        args: &ServerArgs,
    ) -> Result<Self, ConfigError> {
        Self::with_config(ConfigStore::load(environment, path)?, args)
    }

    /// Construct from an in-memory store.
    pub fn with_config(config: ConfigStore, args: &ServerArgs) -> Result<Self, ConfigError> {
        let port = resolve_port(config.port()?, args.port);
        Ok(Self {
            port,
            config,
            timeouts: Timeouts::default(),
            cache_dir: PathBuf::from(SECRETS_DIR),
        })
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Directory for the ACME certificate cache (default `secrets`).
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind address in `:<port>` form.
    pub fn port_string(&self) -> String {
        format!(":{}", self.port)
    }

    pub fn addr(&self) -> SocketAddr {
        any_addr(self.port)
    }

    pub fn production(&self) -> bool {
        self.config.production()
    }

    pub fn mode(&self) -> &'static str {
        self.config.mode()
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.config
    }

    pub fn configuration(&self) -> &HashMap<String, String> {
        self.config.configuration()
    }

    pub fn config(&self, key: &str) -> String {
        self.config.config(key)
    }

    pub fn config_int(&self, key: &str) -> i64 {
        self.config.config_int(key)
    }

    pub fn config_bool(&self, key: &str) -> bool {
        self.config.config_bool(key)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Wrap the application with the request timeout and tracing layers.
    ///
    /// A missing application answers every request with 404.
    pub fn prepare(&self, app: Option<Router>) -> Router {
        app.unwrap_or_else(Router::new)
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                self.timeouts.request_budget(),
            ))
            .layer(middleware::from_fn(trace_layer))
    }

    /// Serve plain HTTP on the configured port.
    pub async fn start(&self, app: Option<Router>) -> Result<(), ServerError> {
        let addr = self.addr();
        tracing::info!(%addr, mode = self.mode(), "Starting HTTP server (no TLS)");
        serve_plain(addr, self.prepare(app), self.timeouts).await
    }

    /// Serve HTTPS with the compat profile and certificates from PEM files.
    pub async fn start_tls(
        &self,
        app: Option<Router>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<(), ServerError> {
        self.start_tls_files(app, cert.as_ref(), key.as_ref(), TlsProfile::compat())
            .await
    }

    /// Serve HTTPS with the modern profile and certificates from PEM files.
    pub async fn start_tls_modern(
        &self,
        app: Option<Router>,
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<(), ServerError> {
        self.start_tls_files(app, cert.as_ref(), key.as_ref(), TlsProfile::modern())
            .await
    }

    async fn start_tls_files(
        &self,
        app: Option<Router>,
        cert: &Path,
        key: &Path,
        profile: TlsProfile,
    ) -> Result<(), ServerError> {
        let addr = self.addr();
        tracing::info!(
            %addr,
            profile = profile.name,
            cert = %cert.display(),
            key = %key.display(),
            "Starting HTTPS server (static certificate)"
        );

        let (certs, key) = load_pem(cert, key)?;
        let config = profile.server_config_with_cert(certs, key)?;
        serve_tls(addr, self.prepare(app), config, self.timeouts).await
    }

    /// Serve HTTPS with certificates chosen by the profile's resolver.
    pub async fn start_tls_resolved(
        &self,
        app: Option<Router>,
        profile: TlsProfile,
    ) -> Result<(), ServerError> {
        let addr = self.addr();
        tracing::info!(%addr, profile = profile.name, "Starting HTTPS server (certificate resolver)");

        let config = profile.server_config()?;
        serve_tls(addr, self.prepare(app), config, self.timeouts).await
    }

    /// ACME manager for a space-separated host list, caching under `cache_dir`.
    pub fn acme_manager(&self, email: &str, domains: &str) -> Result<AcmeManager, ServerError> {
        AcmeManager::start(AcmeOptions::new(email, domains).with_cache_dir(&self.cache_dir))
    }

    /// Serve HTTPS with ACME certificates from an existing manager.
    pub async fn start_tls_acme(
        &self,
        app: Option<Router>,
        manager: &AcmeManager,
    ) -> Result<(), ServerError> {
        self.start_tls_resolved(app, TlsProfile::compat().with_resolver(manager.resolver()))
            .await
    }

    /// Serve HTTPS with ACME certificates, plus a port-80 listener answering
    /// HTTP-01 challenges and redirecting other traffic to https.
    ///
    /// Returns when the TLS listener fails. A failure of the port-80 listener
    /// is logged and does not stop the TLS listener.
    pub async fn start_tls_auto(
        &self,
        app: Option<Router>,
        email: &str,
        domains: &str,
    ) -> Result<(), ServerError> {
        let manager = self.acme_manager(email, domains)?;
        spawn_listener(
            "acme-http01",
            any_addr(ACME_HTTP_PORT),
            manager.challenge_router(),
            self.timeouts,
        );
        self.start_tls_acme(app, &manager).await
    }

    /// Serve HTTPS with ACME certificates without the port-80 listener.
    ///
    /// The caller must route `/.well-known/acme-challenge/` to
    /// [`AcmeManager::challenge_router`] itself; use
    /// [`acme_manager`](Self::acme_manager) and
    /// [`start_tls_acme`](Self::start_tls_acme) for that.
    pub async fn start_tls_autocert(
        &self,
        app: Option<Router>,
        email: &str,
        domains: &str,
    ) -> Result<(), ServerError> {
        let manager = self.acme_manager(email, domains)?;
        self.start_tls_acme(app, &manager).await
    }

    /// Start a background listener on `port` that 301-redirects every request
    /// to `<host><request-uri>`. Does not block.
    ///
    /// The listener's error, if any, is logged and also returned through the handle.
    pub fn start_redirect_all(
        &self,
        port: u16,
        host: impl Into<String>,
    ) -> JoinHandle<Result<(), ServerError>> {
        spawn_listener(
            "redirect",
            any_addr(port),
            redirect::redirect_all(host),
            self.timeouts,
        )
    }
}

/// Apply the header-read timeout to the connection builder.
///
/// The read and write budgets are enforced per request by `TimeoutLayer`,
/// the idle timeout by [`IdleAcceptor`].
fn configure_http(builder: &mut HttpBuilder<TokioExecutor>, timeouts: Timeouts) {
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeouts.read_header)
        .keep_alive(true);
    builder.http2().timer(TokioTimer::new());
}

pub(crate) async fn serve_plain(
    addr: SocketAddr,
    app: Router,
    timeouts: Timeouts,
) -> Result<(), ServerError> {
    let mut server = axum_server::bind(addr).acceptor(IdleAcceptor::new(timeouts.idle));
    configure_http(server.http_builder(), timeouts);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

pub(crate) async fn serve_tls(
    addr: SocketAddr,
    app: Router,
    config: rustls::ServerConfig,
    timeouts: Timeouts,
) -> Result<(), ServerError> {
    install_crypto_provider();

    let acceptor = RustlsAcceptor::new(RustlsConfig::from_config(Arc::new(config)))
        .acceptor(IdleAcceptor::new(timeouts.idle));
    let mut server = axum_server::bind(addr).acceptor(acceptor);
    configure_http(server.http_builder(), timeouts);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;
    Ok(())
}

/// Process-wide provider for rustls users that do not pass one explicitly.
fn install_crypto_provider() {
    // Err only means another provider was installed first
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// Run a plaintext listener on a background task.
///
/// Failures are logged here as well as returned through the handle, so a
/// caller that drops the handle still sees them.
pub(crate) fn spawn_listener(
    name: &'static str,
    addr: SocketAddr,
    app: Router,
    timeouts: Timeouts,
) -> JoinHandle<Result<(), ServerError>> {
    tokio::spawn(async move {
        tracing::info!(listener = name, %addr, "Starting background listener");

        let result = serve_plain(addr, app, timeouts).await;
        match &result {
            Ok(()) => {
                tracing::debug!(listener = name, "Background listener stopped");
            }
            Err(e) => {
                tracing::error!(listener = name, %addr, error = %e, "Background listener failed");
            }
        }
        result
    })
}
