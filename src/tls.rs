//! TLS configuration.
//!
//! The server loads a certificate and key; the client loads the server's
//! certificate and pins it by SHA-256 fingerprint. Hostname verification
//! is disabled: deployments are small and the pinned certificate is the
//! trust anchor. Without TLS material the transport stays cleartext and
//! callers log a warning.

use anyhow::{anyhow, bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig> {
    let certs = load_certs(cert_path)?;
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_path.display());
    }
    let key = load_private_key(key_path)?;
    let cfg = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("build server tls config")?;
    Ok(cfg)
}

/// Client config trusting exactly the certificate at `cert_path`.
pub fn load_client_config(cert_path: &Path) -> Result<rustls::ClientConfig> {
    let certs = load_certs(cert_path)?;
    let pinned = certs
        .first()
        .with_context(|| format!("no certificates found in {}", cert_path.display()))?;
    let verifier = PinnedCertVerifier {
        fingerprint: fp_sha256_hex(pinned),
    };
    Ok(rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

pub fn server_name_for(host: &str) -> ServerName<'static> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::try_from("localhost".to_string()).unwrap())
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
    );
    let mut out = Vec::new();
    for cert in rustls_pemfile::certs(&mut rd) {
        out.push(cert.context("read certificate")?);
    }
    Ok(out)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut rd)
        .context("read private key")?
        .with_context(|| format!("no private key found in {}", path.display()))
}

fn fp_sha256_hex(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Accepts exactly the certificate whose fingerprint was pinned at load
/// time; everything else about the presented identity is ignored.
#[derive(Debug)]
struct PinnedCertVerifier {
    fingerprint: String,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if fp_sha256_hex(end_entity) == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the pinned certificate".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ED25519,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PKCS1_SHA256,
        ]
    }
}

/// Generate a self-signed Ed25519 CA plus a leaf certificate
/// (CN=JanusSync) valid for 1000 years. With paths, the PEM chain and
/// leaf key are written there; otherwise everything prints to stdout.
pub fn generate_keys(cert_path: Option<&Path>, key_path: Option<&Path>) -> Result<()> {
    let mut ca_params = rcgen::CertificateParams::new(Vec::new());
    ca_params.alg = &rcgen::PKCS_ED25519;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "JanusSync CA");
    ca_params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(3024, 1, 1);
    let ca = rcgen::Certificate::from_params(ca_params).context("generate CA certificate")?;

    let mut leaf_params = rcgen::CertificateParams::new(vec!["JanusSync".to_string()]);
    leaf_params.alg = &rcgen::PKCS_ED25519;
    leaf_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "JanusSync");
    leaf_params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    leaf_params.not_after = rcgen::date_time_ymd(3024, 1, 1);
    let leaf = rcgen::Certificate::from_params(leaf_params).context("generate certificate")?;

    let leaf_pem = leaf
        .serialize_pem_with_signer(&ca)
        .context("sign certificate")?;
    let ca_pem = ca.serialize_pem().context("serialize CA")?;
    let chain = format!("{leaf_pem}{ca_pem}");
    let key_pem = leaf.serialize_private_key_pem();

    match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            write_pem(cert_path, &chain)?;
            write_pem(key_path, &key_pem)?;
            println!("wrote {} and {}", cert_path.display(), key_path.display());
        }
        (None, None) => {
            print!("{chain}{key_pem}");
        }
        _ => bail!("--ssl-cert and --ssl-key must be given together"),
    }
    Ok(())
}

fn write_pem(path: &Path, pem: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(path, pem).with_context(|| format!("write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| anyhow!("chmod {}: {}", path.display(), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_material_loads_back() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        generate_keys(Some(&cert), Some(&key)).unwrap();

        assert!(load_server_config(&cert, &key).is_ok());
        assert!(load_client_config(&cert).is_ok());
    }

    #[test]
    fn missing_material_is_an_error() {
        let dir = TempDir::new().unwrap();
        let nope = dir.path().join("missing.pem");
        assert!(load_server_config(&nope, &nope).is_err());
        assert!(load_client_config(&nope).is_err());
    }

    #[test]
    fn server_name_handles_ips_and_hostnames() {
        assert!(matches!(
            server_name_for("10.0.0.1"),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            server_name_for("sync.internal"),
            ServerName::DnsName(_)
        ));
    }
}
