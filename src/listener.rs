//! TLS material for the HTTPS listener: disk-loaded chain or an
//! auto-generated self-signed pair, plus client-certificate identity
//! extraction for mTLS-aware matching.

use crate::config::ServerOptions;
use crate::matching::MtlsIdentity;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::DistinguishedName;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Build the HTTPS acceptor from the configured cert/key files, or generate
/// a self-signed pair at first start when none are configured.
pub fn tls_acceptor(options: &ServerOptions) -> anyhow::Result<TlsAcceptor> {
    let (certs, key) = if !options.tls_cert_file.is_empty() && !options.tls_key_file.is_empty() {
        load_cert_chain(&options.tls_cert_file, &options.tls_key_file)?
    } else {
        info!("no TLS material configured, generating a self-signed certificate");
        generate_self_signed()?
    };

    let builder = rustls::ServerConfig::builder();
    let config = if options.mtls {
        builder
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
            .with_single_cert(certs, key)?
    } else {
        builder.with_no_client_auth().with_single_cert(certs, key)?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_cert_chain(
    cert_path: &str,
    key_path: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| anyhow::anyhow!("open cert {cert_path}: {e}"))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("parse certs in {cert_path}: {e}"))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| anyhow::anyhow!("open key {key_path}: {e}"))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| anyhow::anyhow!("parse key in {key_path}: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {key_path}"))?;

    Ok((certs, key))
}

fn generate_self_signed() -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>
{
    let certified = rcgen::generate_simple_self_signed(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
    ])?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::try_from(certified.key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("self-signed key: {e}"))?;
    Ok((vec![cert], key))
}

/// Accepts any client certificate. The point of mTLS here is surfacing the
/// client identity to matchers and templates, not proving trust.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}

/// Extract the subject fields matchers and templates can read.
pub fn identity_from_cert(der: &[u8]) -> Option<MtlsIdentity> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;

    let mut identity = MtlsIdentity {
        verified: true,
        ..Default::default()
    };

    for rdn in cert.subject().iter_common_name() {
        if let Ok(cn) = rdn.as_str() {
            identity.common_name = cn.to_string();
        }
    }
    for o in cert.subject().iter_organization() {
        if let Ok(o) = o.as_str() {
            identity.organization.push(o.to_string());
        }
    }
    for ou in cert.subject().iter_organizational_unit() {
        if let Ok(ou) = ou.as_str() {
            identity.organizational_unit.push(ou.to_string());
        }
    }

    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            match name {
                x509_parser::extensions::GeneralName::DNSName(dns) => {
                    identity.san_dns.push(dns.to_string());
                }
                x509_parser::extensions::GeneralName::IPAddress(ip) => {
                    let rendered = match ip.len() {
                        4 => format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
                        _ => ip.iter().map(|b| format!("{b:02x}")).collect::<String>(),
                    };
                    identity.san_ip.push(rendered);
                }
                x509_parser::extensions::GeneralName::URI(uri) => {
                    identity.san_uri.push(uri.to_string());
                }
                _ => {}
            }
        }
    }

    Some(identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_pair_parses_back() {
        let (certs, _key) = generate_self_signed().unwrap();
        assert_eq!(certs.len(), 1);
        let identity = identity_from_cert(certs[0].as_ref()).unwrap();
        assert!(identity.verified);
        assert!(identity.san_dns.iter().any(|d| d == "localhost"));
    }

    #[test]
    fn acceptor_builds_without_files() {
        let options = ServerOptions::default();
        assert!(tls_acceptor(&options).is_ok());
        let mtls = ServerOptions {
            mtls: true,
            ..Default::default()
        };
        assert!(tls_acceptor(&mtls).is_ok());
    }
}
