//! # Transport Cryptography
//!
//! TLS certificate plumbing for the QUIC RPC transport. Each node
//! self-signs a certificate from its Ed25519 keypair; both sides of every
//! connection verify the other's certificate and bind the connection to
//! the [`NodeId`] derived from the certificate's public key.
//!
//! There is no CA. Trust is "you are whoever holds this key": the client
//! encodes the public key it expects in the SNI and rejects a server
//! presenting any other key; the server demands a client certificate and
//! accepts any valid Ed25519 key, identifying the peer by it.
//!
//! The `dangerous()` rustls APIs are used deliberately — verification
//! binds identity to the key itself, not to a certificate chain.

use std::sync::Arc;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, NodeId};

/// ALPN protocol identifier for all RPC connections.
pub const ALPN: &[u8] = b"dagnet/1";

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// Idle timeout applied to every QUIC connection.
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Build a self-signed certificate whose subject public key is the node's
/// Ed25519 key, DER-wrapped in PKCS#8.
pub fn generate_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let secret_key = keypair.secret_bytes();
    let public_key = keypair.public_bytes();

    // PKCS#8 v1 wrapper around the raw Ed25519 seed.
    const ED25519_OID: [u8; 5] = [0x06, 0x03, 0x2b, 0x65, 0x70];
    const PKCS8_VERSION: [u8; 3] = [0x02, 0x01, 0x00];
    let mut pkcs8 = Vec::with_capacity(48);
    pkcs8.extend_from_slice(&[0x30, 0x2e]);
    pkcs8.extend_from_slice(&PKCS8_VERSION);
    pkcs8.extend_from_slice(&[0x30, 0x05]);
    pkcs8.extend_from_slice(&ED25519_OID);
    pkcs8.extend_from_slice(&[0x04, 0x22, 0x04, 0x20]);
    pkcs8.extend_from_slice(&secret_key);

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to wrap Ed25519 key for certificate generation")?;

    let mut params = rcgen::CertificateParams::new(vec!["dagnet".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(hex::encode(public_key)),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(NodeClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));
    config.migration(true);
    let transport = Arc::get_mut(&mut config.transport)
        .expect("transport config exclusively owned at construction");
    transport.max_idle_timeout(Some(
        IDLE_TIMEOUT.try_into().expect("valid idle timeout"),
    ));
    transport.max_concurrent_bidi_streams(64u32.into());
    Ok(config)
}

pub fn client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NodeServerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

/// Raw Ed25519 public key from a certificate's subject public key info.
pub fn public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    <[u8; 32]>::try_from(key_bytes.as_ref()).ok()
}

/// The authenticated identity on the far end of a QUIC connection:
/// the public key presented during the TLS handshake and the node id
/// derived from it.
pub fn verified_peer(connection: &quinn::Connection) -> Option<(NodeId, [u8; 32])> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let public_key = public_key_from_cert(certs.first()?.as_ref())?;
    Some((NodeId::from_public_key(&public_key), public_key))
}

/// SNI carrying the dialed peer's expected public key. Split into two
/// labels because a DNS label holds at most 63 octets.
pub fn public_key_to_sni(public_key: &[u8; 32]) -> String {
    let hex = hex::encode(public_key);
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn public_key_from_sni(sni: &str) -> Option<[u8; 32]> {
    let hex_str: String = sni.split('.').collect();
    let bytes = hex::decode(&hex_str).ok()?;
    <[u8; 32]>::try_from(bytes.as_slice()).ok()
}

#[derive(Debug)]
struct NodeClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for NodeClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        public_key_from_cert(end_entity.as_ref()).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct NodeServerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NodeServerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let sni = match server_name {
            rustls::pki_types::ServerName::DnsName(name) => name.as_ref(),
            _ => {
                return Err(rustls::Error::InvalidCertificate(
                    rustls::CertificateError::ApplicationVerificationFailure,
                ))
            }
        };
        let expected = public_key_from_sni(sni).ok_or(rustls::Error::InvalidCertificate(
            rustls::CertificateError::BadEncoding,
        ))?;
        let presented = public_key_from_cert(end_entity.as_ref()).ok_or(
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding),
        )?;
        if presented != expected {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_embeds_public_key() {
        let kp = Keypair::generate();
        let (certs, _key) = generate_cert(&kp).unwrap();
        let extracted = public_key_from_cert(certs[0].as_ref()).unwrap();
        assert_eq!(extracted, kp.public_bytes());
    }

    #[test]
    fn sni_roundtrip() {
        let kp = Keypair::generate();
        let sni = public_key_to_sni(&kp.public_bytes());
        assert_eq!(public_key_from_sni(&sni).unwrap(), kp.public_bytes());
        // Each label must fit in a DNS name.
        assert!(sni.split('.').all(|label| label.len() <= 63));
    }

    #[test]
    fn sni_rejects_garbage() {
        assert!(public_key_from_sni("not-hex.at-all").is_none());
        assert!(public_key_from_sni("abcd").is_none());
    }

    #[test]
    fn configs_build() {
        let kp = Keypair::generate();
        let (certs, key) = generate_cert(&kp).unwrap();
        server_config(certs.clone(), key.clone_key()).unwrap();
        client_config(certs, key).unwrap();
    }
}
