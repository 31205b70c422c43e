use crate::error::{ResolverError, Result};
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;

/// Build a client TLS config from CA input: a PEM file path, inline PEM, or
/// empty for the platform web trust roots.
pub fn client_config(ca: &str) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();

    if ca.trim().is_empty() {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        let pem = load_pem(ca)?;
        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert =
                cert.map_err(|e| ResolverError::Tls(format!("reading CA certificate: {e}")))?;
            roots
                .add(cert)
                .map_err(|e| ResolverError::Tls(format!("adding CA certificate: {e}")))?;
            added += 1;
        }
        if added == 0 {
            return Err(ResolverError::Tls(
                "CA input contained no certificates".to_string(),
            ));
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Inline PEM is used as-is; anything else is treated as a file path.
fn load_pem(input: &str) -> Result<Vec<u8>> {
    if input.contains("-----BEGIN") {
        return Ok(input.as_bytes().to_vec());
    }
    std::fs::read(input).map_err(|e| ResolverError::Tls(format!("reading CA file '{input}': {e}")))
}
