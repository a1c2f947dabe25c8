//! TLS for both sides of an intercepted connection
//!
//! Clients are served leaf certificates minted per SNI host and signed by the
//! embedded intermediate CA. Origins are reached without verifying their
//! certificates.

mod trust_store;

pub use trust_store::{install_trust_anchors, StoreName, SystemTrustStore, TrustStore};

use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use chrono::{Datelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rcgen::{
    date_time_ymd, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};

pub const ROOT_CA_PEM: &str = include_str!("../../certs/root_ca.pem");
pub const INTERMEDIATE_CA_PEM: &str = include_str!("../../certs/intermediate_ca.pem");
const INTERMEDIATE_KEY_PEM: &str = include_str!("../../certs/intermediate_ca.key");

/// Years of validity granted to a minted leaf after its backdated start
const LEAF_VALIDITY_YEARS: i32 = 20;

const LEAF_KEY_BITS: usize = 2048;

pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Certificate(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Certificate("No certificate in PEM".to_string()));
    }
    Ok(certs)
}

struct LeafKey {
    pair: KeyPair,
    signer: Arc<dyn SigningKey>,
}

/// Mints and caches leaf certificates for intercepted hosts
///
/// Every leaf shares one RSA key pair, generated on the first mint. The
/// cache lives as long as the minter and is keyed by the exact SNI string.
pub struct CertificateMinter {
    issuer: Issuer<'static, KeyPair>,
    intermediate: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
    leaf_key: Mutex<Option<Arc<LeafKey>>>,
    cache: DashMap<String, Arc<CertifiedKey>>,
}

impl fmt::Debug for CertificateMinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMinter")
            .field("cached", &self.cached_count())
            .finish()
    }
}

impl CertificateMinter {
    /// Minter backed by the embedded intermediate CA
    pub fn embedded() -> Result<Self> {
        Self::from_pem(INTERMEDIATE_CA_PEM, INTERMEDIATE_KEY_PEM)
    }

    pub fn from_pem(ca_cert_pem: &str, ca_key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(ca_key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, key)?;
        let intermediate = parse_certificates(ca_cert_pem)?.remove(0);

        Ok(Self {
            issuer,
            intermediate,
            provider: crypto_provider(),
            leaf_key: Mutex::new(None),
            cache: DashMap::new(),
        })
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }

    /// Certificate chain and key for `host`, minting it on a cache miss
    ///
    /// Minting runs without any lock held. When two handshakes race on the
    /// same host, the first certificate stored wins.
    pub fn get_certificate(&self, host: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(hit) = self.cache.get(host) {
            return Ok(hit.value().clone());
        }

        let leaf_key = self.leaf_key()?;
        let minted = Arc::new(self.mint(host, &leaf_key)?);
        let certified = self
            .cache
            .entry(host.to_string())
            .or_insert(minted)
            .value()
            .clone();
        info!(host, cached = self.cache.len(), "Minted leaf certificate");
        Ok(certified)
    }

    /// The shared leaf key; only the first caller pays for generation
    fn leaf_key(&self) -> Result<Arc<LeafKey>> {
        let mut slot = self.leaf_key.lock();
        if let Some(key) = slot.as_ref() {
            return Ok(key.clone());
        }
        let key = Arc::new(self.generate_leaf_key()?);
        *slot = Some(key.clone());
        Ok(key)
    }

    fn generate_leaf_key(&self) -> Result<LeafKey> {
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), LEAF_KEY_BITS)
            .map_err(|e| ProxyError::Certificate(format!("RSA key generation failed: {}", e)))?;
        let der = private
            .to_pkcs8_der()
            .map_err(|e| ProxyError::Certificate(format!("RSA key encoding failed: {}", e)))?;
        let pkcs8 = PrivatePkcs8KeyDer::from(der.as_bytes().to_vec());

        let pair = KeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256)?;
        let signer = self
            .provider
            .key_provider
            .load_private_key(PrivateKeyDer::Pkcs8(pkcs8))?;
        debug!(bits = LEAF_KEY_BITS, "Generated leaf signing key");
        Ok(LeafKey { pair, signer })
    }

    fn mint(&self, host: &str, key: &LeafKey) -> Result<CertifiedKey> {
        let now = Utc::now();
        // Day 28 exists in every month.
        let day = now.day().min(28) as u8;
        let month = now.month() as u8;

        let mut params = CertificateParams::new(vec![host.to_string()])?;
        params.distinguished_name.push(DnType::CommonName, host);
        params.is_ca = IsCa::NoCa;
        params.not_before = date_time_ymd(now.year() - 1, month, day);
        params.not_after = date_time_ymd(now.year() + LEAF_VALIDITY_YEARS, month, day);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;

        let cert = params.signed_by(&key.pair, &self.issuer)?;
        Ok(CertifiedKey::new(
            vec![cert.der().clone(), self.intermediate.clone()],
            key.signer.clone(),
        ))
    }

    /// Server config that mints certificates during the handshake
    pub fn server_config(self: &Arc<Self>) -> Result<Arc<ServerConfig>> {
        let mut config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(self.clone());
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl ResolvesServerCert for CertificateMinter {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(host) = client_hello.server_name() else {
            warn!("TLS client sent no server name");
            return None;
        };

        match self.get_certificate(host) {
            Ok(certified) => Some(certified),
            Err(e) => {
                warn!(host, error = %e, "Failed to mint certificate");
                None
            }
        }
    }
}

/// Accepts any origin certificate while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Client config for origin connections, without certificate verification
pub fn insecure_client_config() -> Result<Arc<ClientConfig>> {
    let provider = crypto_provider();
    let mut config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification { provider }))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
