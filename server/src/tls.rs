//! TLS material for the HTTPS listener: a local CA plus a server certificate
//! generated on first boot and persisted under the data dir's tls/ folder.
//! The CA cert is what /connect/trust hands to new devices.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

pub struct TlsMaterial {
    /// Server cert followed by the CA cert, PEM.
    pub cert_chain_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

pub fn ca_cert_path(tls_dir: &Path) -> PathBuf {
    tls_dir.join("ca.pem")
}

/// Load the persisted material, generating CA + server cert when absent.
/// `san_names` should cover every name the instance answers to (localhost,
/// the mDNS name, the LAN IP).
pub fn ensure_tls_material(tls_dir: &Path, san_names: &[String]) -> anyhow::Result<TlsMaterial> {
    fs::create_dir_all(tls_dir).context("creating tls dir")?;
    let ca_cert_file = ca_cert_path(tls_dir);
    let ca_key_file = tls_dir.join("ca.key");
    let server_cert_file = tls_dir.join("server.pem");
    let server_key_file = tls_dir.join("server.key");

    if server_cert_file.is_file() && server_key_file.is_file() && ca_cert_file.is_file() {
        let mut chain = fs::read(&server_cert_file).context("reading server cert")?;
        chain.extend_from_slice(&fs::read(&ca_cert_file).context("reading ca cert")?);
        let key_pem = fs::read(&server_key_file).context("reading server key")?;
        return Ok(TlsMaterial { cert_chain_pem: chain, key_pem });
    }

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name.push(DnType::CommonName, "Katulong CA");
    let ca_key = KeyPair::generate().context("generating ca key")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("self-signing ca")?;

    let mut server_params = CertificateParams::new(san_names.to_vec())
        .context("building server cert params")?;
    server_params.distinguished_name.push(DnType::CommonName, "Katulong");
    let server_key = KeyPair::generate().context("generating server key")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("signing server cert")?;

    write_private(&ca_cert_file, ca_cert.pem().as_bytes())?;
    write_private(&ca_key_file, ca_key.serialize_pem().as_bytes())?;
    write_private(&server_cert_file, server_cert.pem().as_bytes())?;
    write_private(&server_key_file, server_key.serialize_pem().as_bytes())?;

    let mut chain = server_cert.pem().into_bytes();
    chain.extend_from_slice(ca_cert.pem().as_bytes());
    Ok(TlsMaterial { cert_chain_pem: chain, key_pem: server_key.serialize_pem().into_bytes() })
}

fn write_private(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(data).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generates_once_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let names = vec!["localhost".to_string(), "katulong.local".to_string()];
        let first = ensure_tls_material(dir.path(), &names).unwrap();
        assert!(String::from_utf8_lossy(&first.cert_chain_pem).contains("BEGIN CERTIFICATE"));
        assert!(String::from_utf8_lossy(&first.key_pem).contains("PRIVATE KEY"));
        assert!(ca_cert_path(dir.path()).is_file());

        let second = ensure_tls_material(dir.path(), &names).unwrap();
        assert_eq!(first.cert_chain_pem, second.cert_chain_pem);
        assert_eq!(first.key_pem, second.key_pem);
    }
}
