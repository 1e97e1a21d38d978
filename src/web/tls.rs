//! Self-signed certificate bootstrap and the rustls server config
//!
//! The certificate and key live in the console's home directory as
//! `ssl.cert` and `ssl.key`. They are generated with `openssl req` the
//! first time the console starts without `--insecure`.

use crate::error::{Error, Result};
use rand::RngExt;
use std::fs::{self, File};
use std::io::BufReader;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{self, CipherSuite, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const CERT_FILE: &str = "ssl.cert";
pub const KEY_FILE: &str = "ssl.key";

/// Subject of generated certificates
const SUBJECT: &str = "/C=IN/ST=Local/L=Local/O=Skiff/OU=Skiff/CN=localhost";
const VALID_DAYS: &str = "3650";

/// Suites matching `ECDHE+AESGCM`, plus their TLS 1.3 counterparts
const ALLOWED_SUITES: [CipherSuite; 6] = [
    CipherSuite::TLS13_AES_256_GCM_SHA384,
    CipherSuite::TLS13_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    CipherSuite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
];

/// Make sure `<home>/ssl.cert` and `<home>/ssl.key` exist
///
/// Existing files are left alone. Any failure to create the directory or
/// the files is reported as [`Error::CertificateBootstrap`] naming `home`.
pub fn ensure_certificate(home: &Path) -> Result<(PathBuf, PathBuf)> {
    let cert = home.join(CERT_FILE);
    let key = home.join(KEY_FILE);

    if cert.is_file() && key.is_file() {
        return Ok((cert, key));
    }

    let bootstrap_error = || Error::CertificateBootstrap(home.to_path_buf());

    fs::create_dir_all(home).map_err(|_| bootstrap_error())?;
    info!(home = %home.display(), "generating certificate and key");

    let serial = rand::rng().random_range(1..999_999u32).to_string();
    let output = Command::new("openssl")
        .args(["req", "-x509", "-newkey", "rsa:2048", "-sha256", "-nodes"])
        .args(["-days", VALID_DAYS, "-set_serial", &serial, "-subj", SUBJECT])
        .arg("-keyout")
        .arg(&key)
        .arg("-out")
        .arg(&cert)
        .output()
        .map_err(|_| bootstrap_error())?;

    if !output.status.success() {
        tracing::error!(
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "openssl req failed"
        );
        return Err(bootstrap_error());
    }

    fs::set_permissions(&key, fs::Permissions::from_mode(0o600)).map_err(|_| bootstrap_error())?;
    Ok((cert, key))
}

/// Build a TLS acceptor from PEM files
pub fn acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(Arc::new(server_config(cert, key)?)))
}

fn server_config(cert: &Path, key: &Path) -> Result<ServerConfig> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| Error::Tls(format!("{}: {}", path.display(), e)))
    };

    let certs = rustls_pemfile::certs(&mut open(cert)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {}", cert.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("{}: no certificates found", cert.display())));
    }

    let private_key = rustls_pemfile::private_key(&mut open(key)?)
        .map_err(|e| Error::Tls(format!("{}: {}", key.display(), e)))?
        .ok_or_else(|| Error::Tls(format!("{}: no private key found", key.display())))?;

    let mut provider = ring::default_provider();
    provider
        .cipher_suites
        .retain(|suite| ALLOWED_SUITES.contains(&suite.suite()));

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| Error::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| Error::Tls(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_existing_files_are_kept() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CERT_FILE), "cert").unwrap();
        fs::write(dir.path().join(KEY_FILE), "key").unwrap();

        let (cert, key) = ensure_certificate(dir.path()).unwrap();
        assert_eq!(fs::read_to_string(cert).unwrap(), "cert");
        assert_eq!(fs::read_to_string(key).unwrap(), "key");
    }

    #[test]
    fn test_unusable_home_names_the_path() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let home = blocker.join("skiff");

        let err = ensure_certificate(&home).unwrap_err();
        assert!(matches!(err, Error::CertificateBootstrap(ref p) if *p == home));
        assert!(err.to_string().contains("check permissions at path"));
    }

    #[test]
    fn test_garbage_pem_is_rejected() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join(CERT_FILE);
        let key = dir.path().join(KEY_FILE);
        fs::write(&cert, "not a certificate").unwrap();
        fs::write(&key, "not a key").unwrap();

        assert!(matches!(acceptor(&cert, &key), Err(Error::Tls(_))));
    }

    #[test]
    #[ignore] // Requires the openssl binary
    fn test_generated_certificate_loads() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = ensure_certificate(dir.path()).unwrap();
        let config = server_config(&cert, &key).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
