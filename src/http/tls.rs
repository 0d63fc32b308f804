//! Hardened TLS profiles.
//!
//! Two profiles are provided:
//! - **compat**: broad client support, library default cipher suites
//! - **modern**: TLS 1.2 minimum with an explicit list of AEAD suites
//!
//! A profile records its policy exactly as declared. Lowering it onto a
//! rustls `ServerConfig` keeps only what rustls implements: TLS 1.0/1.1, the
//! P-521 curve and CBC suites are skipped, so the effective floor is TLS 1.2.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::{aws_lc_rs, CryptoProvider, SupportedKxGroup};
use rustls::server::ResolvesServerCert;
use rustls::{ServerConfig, SupportedCipherSuite, SupportedProtocolVersion};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::ServerError;

/// ALPN protocols offered by every profile
pub const ALPN_PROTOCOLS: [&[u8]; 2] = [b"h2", b"http/1.1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    P256,
    P384,
    P521,
    X25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Chacha20Poly1305Sha256,
    Aes256GcmSha384,
    Aes128GcmSha256,
    EcdheEcdsaAes128GcmSha256,
    EcdheRsaAes128GcmSha256,
    EcdheRsaAes256GcmSha384,
    EcdheRsaAes128CbcSha256,
}

/// Suites of the modern profile, in preference order.
pub const MODERN_CIPHER_SUITES: [CipherSuite; 7] = [
    CipherSuite::Chacha20Poly1305Sha256,
    CipherSuite::Aes256GcmSha384,
    CipherSuite::Aes128GcmSha256,
    CipherSuite::EcdheEcdsaAes128GcmSha256,
    CipherSuite::EcdheRsaAes128GcmSha256,
    CipherSuite::EcdheRsaAes256GcmSha384,
    CipherSuite::EcdheRsaAes128CbcSha256,
];

impl TlsVersion {
    fn rustls_versions(self) -> Vec<&'static SupportedProtocolVersion> {
        if self <= TlsVersion::Tls12 {
            vec![&rustls::version::TLS13, &rustls::version::TLS12]
        } else {
            vec![&rustls::version::TLS13]
        }
    }
}

impl Curve {
    fn rustls_group(self) -> Option<&'static dyn SupportedKxGroup> {
        match self {
            Curve::P256 => Some(aws_lc_rs::kx_group::SECP256R1),
            Curve::P384 => Some(aws_lc_rs::kx_group::SECP384R1),
            Curve::X25519 => Some(aws_lc_rs::kx_group::X25519),
            Curve::P521 => None,
        }
    }
}

impl CipherSuite {
    fn rustls_suite(self) -> Option<SupportedCipherSuite> {
        use aws_lc_rs::cipher_suite as cs;
        match self {
            CipherSuite::Chacha20Poly1305Sha256 => Some(cs::TLS13_CHACHA20_POLY1305_SHA256),
            CipherSuite::Aes256GcmSha384 => Some(cs::TLS13_AES_256_GCM_SHA384),
            CipherSuite::Aes128GcmSha256 => Some(cs::TLS13_AES_128_GCM_SHA256),
            CipherSuite::EcdheEcdsaAes128GcmSha256 => {
                Some(cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256)
            }
            CipherSuite::EcdheRsaAes128GcmSha256 => Some(cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256),
            CipherSuite::EcdheRsaAes256GcmSha384 => Some(cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384),
            CipherSuite::EcdheRsaAes128CbcSha256 => None,
        }
    }
}

/// A named TLS policy, optionally carrying a certificate resolver.
#[derive(Clone)]
pub struct TlsProfile {
    pub name: &'static str,
    pub min_version: TlsVersion,
    pub prefer_server_cipher_suites: bool,
    pub curves: Vec<Curve>,
    pub cipher_suites: Option<Vec<CipherSuite>>,
    pub resolver: Option<Arc<dyn ResolvesServerCert>>,
}

impl fmt::Debug for TlsProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsProfile")
            .field("name", &self.name)
            .field("min_version", &self.min_version)
            .field("prefer_server_cipher_suites", &self.prefer_server_cipher_suites)
            .field("curves", &self.curves)
            .field("cipher_suites", &self.cipher_suites)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl Default for TlsProfile {
    fn default() -> Self {
        Self::compat()
    }
}

impl TlsProfile {
    /// Broadly compatible profile: TLS 1.0 floor, P-256 and X25519, default suites.
    pub fn compat() -> Self {
        Self {
            name: "compat",
            min_version: TlsVersion::Tls10,
            prefer_server_cipher_suites: true,
            curves: vec![Curve::P256, Curve::X25519],
            cipher_suites: None,
            resolver: None,
        }
    }

    /// Restricted profile: TLS 1.2 floor, NIST curves, explicit suite list.
    pub fn modern() -> Self {
        Self {
            name: "modern",
            min_version: TlsVersion::Tls12,
            prefer_server_cipher_suites: true,
            curves: vec![Curve::P521, Curve::P384, Curve::P256],
            cipher_suites: Some(MODERN_CIPHER_SUITES.to_vec()),
            resolver: None,
        }
    }

    /// Serve certificates chosen per handshake by `resolver`.
    pub fn with_resolver(mut self, resolver: Arc<dyn ResolvesServerCert>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Crypto provider restricted to the profile's curves and suites.
    pub fn crypto_provider(&self) -> Result<CryptoProvider, ServerError> {
        let mut provider = aws_lc_rs::default_provider();

        let groups: Vec<_> = self
            .curves
            .iter()
            .filter_map(|curve| {
                let group = curve.rustls_group();
                if group.is_none() {
                    tracing::debug!(profile = self.name, curve = ?curve, "Curve not supported, skipping");
                }
                group
            })
            .collect();
        if groups.is_empty() {
            return Err(ServerError::Tls(format!(
                "profile {} has no supported curves",
                self.name
            )));
        }
        provider.kx_groups = groups;

        if let Some(suites) = &self.cipher_suites {
            let selected: Vec<_> = suites
                .iter()
                .filter_map(|suite| {
                    let s = suite.rustls_suite();
                    if s.is_none() {
                        tracing::debug!(profile = self.name, suite = ?suite, "Cipher suite not supported, skipping");
                    }
                    s
                })
                .collect();
            if selected.is_empty() {
                return Err(ServerError::Tls(format!(
                    "profile {} has no supported cipher suites",
                    self.name
                )));
            }
            provider.cipher_suites = selected;
        }

        Ok(provider)
    }

    fn finish(&self, mut config: ServerConfig) -> ServerConfig {
        config.ignore_client_order = self.prefer_server_cipher_suites;
        config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();
        config
    }

    /// Build a server config that resolves certificates through the profile's resolver.
    pub fn server_config(&self) -> Result<ServerConfig, ServerError> {
        let resolver = self.resolver.clone().ok_or_else(|| {
            ServerError::Tls(format!("profile {} has no certificate resolver", self.name))
        })?;

        let config = ServerConfig::builder_with_provider(Arc::new(self.crypto_provider()?))
            .with_protocol_versions(&self.min_version.rustls_versions())?
            .with_no_client_auth()
            .with_cert_resolver(resolver);

        Ok(self.finish(config))
    }

    /// Build a server config serving one static certificate chain.
    pub fn server_config_with_cert(
        &self,
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<ServerConfig, ServerError> {
        let config = ServerConfig::builder_with_provider(Arc::new(self.crypto_provider()?))
            .with_protocol_versions(&self.min_version.rustls_versions())?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

        Ok(self.finish(config))
    }
}

/// Read a PEM certificate chain and private key from disk.
pub fn load_pem<P: AsRef<Path>>(
    cert_path: P,
    key_path: P,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), ServerError> {
    let cert_path = cert_path.as_ref();
    let key_path = key_path.as_ref();

    let certs = CertificateDer::pem_file_iter(cert_path)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .map_err(|e| {
            ServerError::Tls(format!(
                "Failed to load certificates from {}: {}",
                cert_path.display(),
                e
            ))
        })?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!(
            "No certificates found in {}",
            cert_path.display()
        )));
    }

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        ServerError::Tls(format!(
            "Failed to load private key from {}: {}",
            key_path.display(),
            e
        ))
    })?;

    Ok((certs, key))
}
