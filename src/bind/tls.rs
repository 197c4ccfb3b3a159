//! TLS upgrade with ClientHello mimicry
//!
//! The TLS layer here is cover traffic against deep packet inspection, not
//! authentication: the inner WireGuard handshake authenticates the peer, so
//! certificate verification is intentionally disabled.
//!
//! Each upgrade offers a Chrome-like ClientHello profile and a randomly
//! generated SNI. Profiles rotate round-robin through a process-wide index
//! that advances on every failed upgrade, so a middlebox rejecting one
//! fingerprint is retried with the next.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::Resumption;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::error::BindError;

/// TLDs the random SNI draws from.
const SNI_TOP_LEVEL_DOMAINS: &[&str] = &[
    "com", "net", "org", "it", "fr", "me", "ru", "cn", "es", "tr", "top", "xyz", "info",
];

/// ClientHello profiles offered to the server, in rotation order.
pub const HELLO_PROFILES: [HelloProfile; 3] = [
    HelloProfile::ChromeAuto,
    HelloProfile::Chrome120Pq,
    HelloProfile::Chrome115Pq,
];

/// Index of the profile the next upgrade will offer; shared by every bind
/// in the process. Acquire/release is enough: the worst outcome of a race
/// is a duplicated attempt of the same profile.
static NEXT_HELLO_IDX: AtomicUsize = AtomicUsize::new(0);

/// A browser-like ClientHello shape.
///
/// The profile governs what the ClientHello advertises within what the TLS
/// library exposes (ALPN set, session resumption, early data). The PQ
/// variants track the Chrome releases that added post-quantum key-exchange
/// offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloProfile {
    /// Current Chrome.
    ChromeAuto,
    /// Chrome 120 with post-quantum key exchange.
    Chrome120Pq,
    /// Chrome 115 with post-quantum key exchange.
    Chrome115Pq,
}

impl HelloProfile {
    /// Build the rustls client configuration for this profile.
    fn client_config(self) -> Result<ClientConfig, RustlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CoverTrafficVerifier))
            .with_no_client_auth();

        // Browsers offer h2 and http/1.1.
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        match self {
            Self::ChromeAuto => {
                config.resumption = Resumption::in_memory_sessions(32);
            }
            Self::Chrome120Pq => {
                config.resumption = Resumption::in_memory_sessions(32);
                config.enable_early_data = true;
            }
            Self::Chrome115Pq => {
                config.resumption = Resumption::disabled();
            }
        }
        Ok(config)
    }
}

/// Profile the next upgrade attempt will offer.
#[must_use]
pub fn current_hello_profile() -> HelloProfile {
    HELLO_PROFILES[NEXT_HELLO_IDX.load(Ordering::Acquire) % HELLO_PROFILES.len()]
}

/// Move the process-wide rotation to the next profile.
fn advance_hello_profile() {
    let next = (NEXT_HELLO_IDX.load(Ordering::Acquire) + 1) % HELLO_PROFILES.len();
    NEXT_HELLO_IDX.store(next, Ordering::Release);
}

/// Generate a throwaway SNI: a lowercase label of 3-12 characters under a
/// random common TLD.
fn random_server_name() -> String {
    let mut rng = rand::thread_rng();
    let len = rng.gen_range(3..=12);
    let mut name = String::with_capacity(len + 5);
    for _ in 0..len {
        name.push(rng.gen_range(b'a'..=b'z') as char);
    }
    name.push('.');
    name.push_str(SNI_TOP_LEVEL_DOMAINS[rng.gen_range(0..SNI_TOP_LEVEL_DOMAINS.len())]);
    name
}

/// Upgrade an established TCP connection to TLS.
///
/// On failure the profile rotation advances before the error is returned.
/// On success the call sleeps `post_handshake_delay` before handing the
/// stream back: some server/device combinations drop the first WireGuard
/// handshake when it is written immediately after the TLS handshake.
pub(super) async fn upgrade(
    tcp: TcpStream,
    handshake_timeout: Duration,
    post_handshake_delay: Duration,
) -> Result<TlsStream<TcpStream>, BindError> {
    let profile = current_hello_profile();
    let server_name = random_server_name();
    debug!(?profile, server_name, "starting TLS handshake");

    let stream = match handshake(tcp, profile, &server_name, handshake_timeout).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(?profile, error = %e, "TLS handshake failed, rotating profile");
            advance_hello_profile();
            return Err(e);
        }
    };

    debug!(?profile, "TLS handshake complete");
    sleep(post_handshake_delay).await;
    Ok(stream)
}

async fn handshake(
    tcp: TcpStream,
    profile: HelloProfile,
    server_name: &str,
    handshake_timeout: Duration,
) -> Result<TlsStream<TcpStream>, BindError> {
    let config = profile
        .client_config()
        .map_err(|e| BindError::tls_handshake(server_name, e.to_string()))?;
    let dns_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| BindError::tls_handshake(server_name, e.to_string()))?;
    let connector = TlsConnector::from(Arc::new(config));

    timeout(handshake_timeout, connector.connect(dns_name, tcp))
        .await
        .map_err(|_| {
            BindError::tls_handshake(
                server_name,
                format!("timed out after {}s", handshake_timeout.as_secs()),
            )
        })?
        .map_err(|e| BindError::tls_handshake(server_name, e.to_string()))
}

/// Certificate verifier that accepts anything.
///
/// The TLS layer is camouflage; authentication comes from the WireGuard
/// Noise handshake running inside the tunnel. Verifying the throwaway SNI
/// against a real certificate chain is neither possible nor wanted.
#[derive(Debug)]
struct CoverTrafficVerifier;

impl ServerCertVerifier for CoverTrafficVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, RustlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, RustlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}
