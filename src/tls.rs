/*! All the stuff necessary to build a TLS listener. */

use std::{net::SocketAddr, sync::Arc};

use hyper::server::conn::AddrIncoming;
use rustls_pemfile::Item;
use tls_listener::TlsListener;
use tokio_rustls::{
    rustls::{server::ServerConfig, Certificate, PrivateKey},
    TlsAcceptor,
};

/// Builds the HTTPS listener from PEM material (inline or file-loaded,
/// the config layer no longer cares which) bound to `addr`. Any failure
/// here is fatal to startup.
pub fn make_listener(
    cert_pem: &[u8],
    key_pem: &[u8],
    addr: &SocketAddr,
) -> Result<TlsListener<AddrIncoming, TlsAcceptor>, String> {
    log::trace!("make_listener( [ {} byte cert ], [ key ], {} ) called.", cert_pem.len(), addr);

    let certs: Vec<Certificate> = {
        let mut cert_reader = cert_pem;
        rustls_pemfile::certs(&mut cert_reader)
            .map_err(|e| format!("error reading TLS certificate: {}", &e))?
            .into_iter()
            .map(Certificate)
            .collect()
    };
    if certs.is_empty() {
        return Err("TLS certificate material contains no certificates.".to_string());
    }

    let key: PrivateKey = {
        let mut key_reader = key_pem;
        match rustls_pemfile::read_one(&mut key_reader)
            .map_err(|e| format!("error reading TLS key: {}", &e))?
        {
            Some(Item::RSAKey(v)) | Some(Item::PKCS8Key(v)) | Some(Item::ECKey(v)) => {
                PrivateKey(v)
            }
            _ => {
                return Err(
                    "TLS key material does not contain a recognizable private key.".to_string(),
                );
            }
        }
    };

    let cfg = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| format!("error generating TLS configuration: {}", &e))?;
    let acceptor: TlsAcceptor = Arc::new(cfg).into();
    let incoming =
        AddrIncoming::bind(addr).map_err(|e| format!("error binding to {}: {}", addr, &e))?;

    Ok(TlsListener::new(acceptor, incoming))
}
