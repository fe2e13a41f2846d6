use std::net::SocketAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use quinn::{ClientConfig, Connection, Endpoint, RecvStream, ServerConfig};
use rcgen::generate_simple_self_signed;

use crate::error::TransportError;

/// Name carried in the self-signed certificate and used when dialling
pub const SERVER_NAME: &str = "nearcast-local";

static CRYPTO_PROVIDER: Lazy<()> = Lazy::new(|| {
    // Fails only when a provider is already installed, which is fine
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
});

/// Bind a QUIC endpoint that both accepts and dials. Port 0 picks a free port.
pub fn bind(port: u16) -> Result<Endpoint, TransportError> {
    Lazy::force(&CRYPTO_PROVIDER);

    let (cert_der, key_der) = generate_self_signed_cert()?;
    let server_config = configure_server(cert_der, key_der)?;
    let client_config = configure_client()?;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let mut endpoint = Endpoint::server(server_config, addr)?;
    endpoint.set_default_client_config(client_config);

    Ok(endpoint)
}

pub async fn connect(endpoint: &Endpoint, addr: SocketAddr) -> Result<Connection, TransportError> {
    let connecting = endpoint
        .connect(addr, SERVER_NAME)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    connecting
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))
}

/// One message per unidirectional stream; the stream end delimits it.
pub async fn write_message(conn: &Connection, data: &[u8]) -> Result<(), TransportError> {
    let mut send = conn.open_uni().await.map_err(stream_error)?;
    send.write_all(data).await.map_err(stream_error)?;
    send.finish().map_err(stream_error)?;
    Ok(())
}

pub async fn read_message(mut recv: RecvStream, limit: usize) -> Result<Vec<u8>, TransportError> {
    recv.read_to_end(limit).await.map_err(stream_error)
}

fn stream_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Stream(e.to_string())
}

fn generate_self_signed_cert() -> Result<(Vec<u8>, Vec<u8>), TransportError> {
    let cert = generate_simple_self_signed(vec![SERVER_NAME.into()])
        .map_err(|e| TransportError::Connect(format!("certificate generation failed: {}", e)))?;
    Ok((cert.cert.der().to_vec(), cert.signing_key.serialize_der()))
}

fn configure_server(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<ServerConfig, TransportError> {
    let cert = rustls::pki_types::CertificateDer::from(cert_der);
    let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
        .map_err(|e| TransportError::Connect(format!("invalid private key: {}", e)))?;

    ServerConfig::with_single_cert(vec![cert], key)
        .map_err(|e| TransportError::Connect(e.to_string()))
}

// Peers are anonymous nearby devices with throwaway certificates, so there is
// nothing to verify against.
fn configure_client() -> Result<ClientConfig, TransportError> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    struct SkipServerVerification;
    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let client_config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(client_config)
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    Ok(ClientConfig::new(Arc::new(quic_config)))
}
