use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Build a server-side TLS configuration for STARTTLS.
///
/// When no private key is supplied, a self-signed certificate for
/// `hostname` is generated; that mode is only suitable for testing and
/// opportunistic encryption.
pub fn make_server_config(
    hostname: &str,
    tls_private_key: Option<&Path>,
    tls_certificate: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let mut certificates = vec![];
    let private_key = match tls_private_key {
        Some(path) => {
            let data = std::fs::read(path)
                .with_context(|| format!("reading private key from {path:?}"))?;
            load_private_key(&data).with_context(|| format!("loading private key from {path:?}"))?
        }
        None => {
            let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
            certificates.push(cert.cert.der().clone());
            PrivateKeyDer::from(PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der()))
        }
    };

    if let Some(path) = tls_certificate {
        let data =
            std::fs::read(path).with_context(|| format!("reading certificates from {path:?}"))?;
        certificates =
            load_certs(&data).with_context(|| format!("loading certificates from {path:?}"))?;
    }

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;

    Ok(Arc::new(config))
}

fn load_certs(data: &[u8]) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(data);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .context("reading PEM encoded certificates")
}

fn load_private_key(data: &[u8]) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(data);
    rustls_pemfile::private_key(&mut reader)
        .context("parsing private key PEM data")?
        .ok_or_else(|| anyhow::anyhow!("no keys found in key data (encrypted keys not supported)"))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn self_signed_fallback() {
        make_server_config("mx.example.com", None, None).unwrap();
    }
}
