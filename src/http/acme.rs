//! ACME certificate manager binding.
//!
//! Certificates are ordered from an ACME directory (Let's Encrypt production
//! by default) using the HTTP-01 challenge, cached under the secrets directory
//! and renewed ahead of expiry by the rustls-acme state stream, which runs on
//! a background task.
//!
//! Handshakes go through [`WhitelistResolver`], so a client asking for a host
//! outside the configured list gets no certificate and the handshake fails.
//! The listener itself keeps running.

use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Path as UrlPath, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_extra::extract::Host;
use const_format::formatcp;
use futures::StreamExt;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_acme::{AccountCache, AcmeConfig, CertCache, ResolvesServerCertAcme, UseChallenge};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::config::SECRETS_DIR;
use crate::error::ServerError;

use super::redirect;

/// Path prefix the ACME server fetches HTTP-01 tokens from
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

const CHALLENGE_ROUTE: &str = formatcp!("{}{{token}}", CHALLENGE_PATH_PREFIX);

/// Plaintext port the ACME server validates HTTP-01 challenges on
pub const ACME_HTTP_PORT: u16 = 80;

/// Permissions for cached certificates and account keys
pub const CACHE_FILE_MODE: u32 = 0o640;

/// Permissions for the cache directory when it is created
pub const CACHE_DIR_MODE: u32 = 0o700;

// =============================================================================
// Host policy
// =============================================================================

/// Set of host names certificates may be issued for.
///
/// Matching ignores ASCII case and a trailing dot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostWhitelist {
    hosts: BTreeSet<String>,
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

impl HostWhitelist {
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hosts = hosts
            .into_iter()
            .map(|h| normalize_host(h.as_ref()))
            .filter(|h| !h.is_empty())
            .collect();
        Self { hosts }
    }

    /// Parse a space-separated host list, e.g. `"example.com www.example.com"`.
    pub fn from_space_separated(domains: &str) -> Self {
        Self::new(domains.split_whitespace())
    }

    pub fn allows(&self, host: &str) -> bool {
        self.hosts.contains(&normalize_host(host))
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect()
    }
}

/// Certificate resolver that only answers for whitelisted SNI names.
#[derive(Debug)]
pub struct WhitelistResolver {
    policy: HostWhitelist,
    inner: Arc<dyn ResolvesServerCert>,
}

impl WhitelistResolver {
    pub fn new(policy: HostWhitelist, inner: Arc<dyn ResolvesServerCert>) -> Self {
        Self { policy, inner }
    }
}

impl ResolvesServerCert for WhitelistResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name().map(str::to_string);
        match sni {
            Some(name) if self.policy.allows(&name) => self.inner.resolve(client_hello),
            Some(name) => {
                tracing::warn!(sni = %name, "Rejecting TLS handshake for host not in whitelist");
                None
            }
            None => {
                tracing::debug!("Rejecting TLS handshake without SNI");
                None
            }
        }
    }
}

// =============================================================================
// Certificate cache
// =============================================================================

/// Filesystem cache for ACME account keys and issued certificates.
///
/// File names are derived from a SHA-256 of the domains (or contacts) and the
/// directory URL, so switching between staging and production never reuses a
/// cached certificate.
#[derive(Debug, Clone)]
pub struct SecretsCache {
    dir: PathBuf,
}

impl SecretsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory if it does not exist yet.
    pub fn ensure_dir(&self) -> io::Result<()> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(CACHE_DIR_MODE);
        }
        builder.create(&self.dir)
    }

    pub fn file_name(kind: &str, names: &[String], directory_url: &str) -> String {
        let mut hasher = Sha256::new();
        for name in names {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(directory_url.as_bytes());
        let digest = hasher.finalize();
        let hex: String = digest.iter().take(16).map(|b| format!("{:02x}", b)).collect();
        format!("acme_{}_{}", kind, hex)
    }

    async fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(CACHE_FILE_MODE);

        let mut file = options.open(self.dir.join(name)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CertCache for SecretsCache {
    type EC = io::Error;

    async fn load_cert(
        &self,
        domains: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EC> {
        self.read(&Self::file_name("cert", domains, directory_url)).await
    }

    async fn store_cert(
        &self,
        domains: &[String],
        directory_url: &str,
        cert: &[u8],
    ) -> Result<(), Self::EC> {
        self.write(&Self::file_name("cert", domains, directory_url), cert)
            .await
    }
}

#[async_trait]
impl AccountCache for SecretsCache {
    type EA = io::Error;

    async fn load_account(
        &self,
        contact: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EA> {
        self.read(&Self::file_name("account", contact, directory_url))
            .await
    }

    async fn store_account(
        &self,
        contact: &[String],
        directory_url: &str,
        account: &[u8],
    ) -> Result<(), Self::EA> {
        self.write(&Self::file_name("account", contact, directory_url), account)
            .await
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Settings for [`AcmeManager`].
#[derive(Debug, Clone)]
pub struct AcmeOptions {
    /// Contact address registered with the ACME account
    pub email: String,
    pub hosts: HostWhitelist,
    pub cache_dir: PathBuf,
    pub directory_url: String,
    /// Whether the provider's terms of service are accepted
    pub accept_tos: bool,
}

impl AcmeOptions {
    pub fn new(email: impl Into<String>, domains: &str) -> Self {
        Self {
            email: email.into(),
            hosts: HostWhitelist::from_space_separated(domains),
            cache_dir: PathBuf::from(SECRETS_DIR),
            directory_url: rustls_acme::acme::LETS_ENCRYPT_PRODUCTION_DIRECTORY.to_string(),
            accept_tos: true,
        }
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_directory(mut self, url: impl Into<String>) -> Self {
        self.directory_url = url.into();
        self
    }
}

/// Source of HTTP-01 key authorizations, looked up by challenge token.
pub trait ChallengeSource: Send + Sync + 'static {
    fn key_authorization(&self, token: &str) -> Option<String>;
}

impl ChallengeSource for ResolvesServerCertAcme {
    fn key_authorization(&self, token: &str) -> Option<String> {
        self.get_http_01_key_auth(token)
    }
}

/// Running ACME state: certificate resolver plus challenge responder.
pub struct AcmeManager {
    options: AcmeOptions,
    resolver: Arc<ResolvesServerCertAcme>,
}

impl fmt::Debug for AcmeManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeManager")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AcmeManager {
    /// Build the ACME state and spawn its event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(options: AcmeOptions) -> Result<Self, ServerError> {
        if !options.accept_tos {
            return Err(ServerError::Acme(
                "ACME terms of service must be accepted".to_string(),
            ));
        }
        if options.hosts.is_empty() {
            return Err(ServerError::Acme("No ACME domains configured".to_string()));
        }

        let cache = SecretsCache::new(&options.cache_dir);
        cache.ensure_dir().map_err(|e| {
            ServerError::Acme(format!(
                "Failed to create ACME cache directory '{}': {}",
                options.cache_dir.display(),
                e
            ))
        })?;

        tracing::info!(
            domains = ?options.hosts.hosts(),
            email = %options.email,
            cache = %options.cache_dir.display(),
            directory = %options.directory_url,
            "Starting ACME certificate manager"
        );

        let mut config = AcmeConfig::new(options.hosts.hosts())
            .cache(cache)
            .directory(&options.directory_url)
            .challenge_type(UseChallenge::Http01);
        if !options.email.is_empty() {
            config = config.contact_push(format!("mailto:{}", options.email));
        }

        let mut state = config.state();
        let resolver = state.resolver();

        // Drives ordering and renewal; the stream ends only when the state is dropped
        tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => {
                        tracing::info!(event = ?event, "ACME event");
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = %err, "ACME error");
                    }
                    None => {
                        tracing::debug!("ACME state stream ended");
                        break;
                    }
                }
            }
        });

        Ok(Self { options, resolver })
    }

    pub fn options(&self) -> &AcmeOptions {
        &self.options
    }

    /// Handshake-time certificate source restricted to the whitelisted hosts.
    pub fn resolver(&self) -> Arc<dyn ResolvesServerCert> {
        Arc::new(WhitelistResolver::new(
            self.options.hosts.clone(),
            self.resolver.clone(),
        ))
    }

    /// Router answering HTTP-01 challenges and redirecting everything else to https.
    pub fn challenge_router(&self) -> Router {
        challenge_router(self.resolver.clone(), self.options.hosts.clone())
    }
}

#[derive(Clone)]
struct ChallengeState {
    challenges: Arc<dyn ChallengeSource>,
    hosts: HostWhitelist,
}

/// HTTP-01 responder for `/.well-known/acme-challenge/{token}`.
///
/// Any other request is handed to the https redirect fallback.
pub fn challenge_router(challenges: Arc<dyn ChallengeSource>, hosts: HostWhitelist) -> Router {
    Router::new()
        .route(CHALLENGE_ROUTE, get(serve_challenge))
        .fallback(redirect::redirect_to_https)
        .with_state(ChallengeState { challenges, hosts })
}

async fn serve_challenge(
    State(state): State<ChallengeState>,
    Host(host): Host,
    UrlPath(token): UrlPath<String>,
) -> Response {
    let host = redirect::strip_port(&host);
    if !state.hosts.allows(host) {
        tracing::warn!(host = %host, "ACME challenge for host not in whitelist");
        return (StatusCode::FORBIDDEN, "host not allowed").into_response();
    }

    match state.challenges.key_authorization(&token) {
        Some(key_auth) => {
            tracing::info!(host = %host, token = %token, "Serving ACME HTTP-01 challenge");
            (StatusCode::OK, [(CONTENT_TYPE, "text/plain")], key_auth).into_response()
        }
        None => {
            tracing::debug!(host = %host, token = %token, "Unknown ACME challenge token");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}
