//! TLS contexts: an ALPN-capable client stream and SNI-dispatched
//! server certificates, over rustls.
//!
//! TLS itself is an external dependency; this module exposes exactly
//! what the engines need from it and nothing else.

use std::{collections::HashMap, io, sync::Arc};

use log::{debug, trace};
use tokio_rustls::{
    rustls::{
        self,
        crypto::ring::sign::any_supported_type,
        pki_types::{CertificateDer, PrivateKeyDer, ServerName},
        server::{ClientHello, ResolvesServerCert},
        sign::CertifiedKey,
    },
    TlsAcceptor, TlsConnector,
};

use crate::{Error, Result};

/// Client-side TLS configuration.
#[derive(Clone)]
pub struct TlsClientContext {
    config: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for TlsClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsClientContext").finish()
    }
}

impl TlsClientContext {
    /// A context trusting the given roots, without client authentication.
    pub fn new(roots: rustls::RootCertStore) -> TlsClientContext {
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsClientContext {
            config: Arc::new(config),
        }
    }

    /// Wrap an existing rustls configuration.
    pub fn from_config(config: Arc<rustls::ClientConfig>) -> TlsClientContext {
        TlsClientContext { config }
    }

    /// Handshake with `domain` over `io`, offering the given ALPN
    /// protocols. Returns the stream and the negotiated protocol.
    pub(crate) async fn handshake<T>(
        &self,
        domain: &str,
        io: T,
        alpn: &[String],
    ) -> Result<(tokio_rustls::client::TlsStream<T>, Option<Vec<u8>>)>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut config = (*self.config).clone();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        let connector = TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(domain.to_owned())
            .map_err(|e| Error::tls(format!("invalid server name: {e}")))?;
        let stream = connector.connect(name, io).await.map_err(Error::tls)?;
        let negotiated = stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        trace!(
            "tls handshake with {domain} complete, alpn={:?}",
            negotiated.as_deref().map(String::from_utf8_lossy)
        );
        Ok((stream, negotiated))
    }
}

/// One virtual host's certificate material, in DER form.
#[derive(Debug)]
pub struct Identity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

#[derive(Debug)]
struct SniResolver {
    vhosts: HashMap<String, Arc<CertifiedKey>>,
    fallback: Arc<CertifiedKey>,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        match client_hello.server_name() {
            Some(name) => match self.vhosts.get(&name.to_ascii_lowercase()) {
                Some(key) => Some(key.clone()),
                None => {
                    debug!("no dedicated certificate for sni {name:?}, using default");
                    Some(self.fallback.clone())
                }
            },
            None => Some(self.fallback.clone()),
        }
    }
}

/// Server-side TLS configuration with SNI-based virtual-host dispatch.
#[derive(Clone)]
pub struct TlsServerContext {
    acceptor: TlsAcceptor,
}

impl std::fmt::Debug for TlsServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsServerContext").finish()
    }
}

impl TlsServerContext {
    /// Build a context with a default identity, per-hostname identities,
    /// and the ALPN list to advertise (`["h2", "http/1.1"]` normally,
    /// `["http/1.1"]` when HTTP/2 is disabled).
    pub fn new(
        default_identity: Identity,
        vhosts: Vec<(String, Identity)>,
        alpn: &[&str],
    ) -> Result<TlsServerContext> {
        let fallback = certified(default_identity)?;
        let mut hosts = HashMap::new();
        for (name, identity) in vhosts {
            hosts.insert(name.to_ascii_lowercase(), certified(identity)?);
        }
        let resolver = SniResolver {
            vhosts: hosts,
            fallback,
        };
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(TlsServerContext {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Accept a TLS connection. Returns the stream and the negotiated
    /// ALPN protocol.
    pub(crate) async fn accept<T>(
        &self,
        io: T,
    ) -> io::Result<(tokio_rustls::server::TlsStream<T>, Option<Vec<u8>>)>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let stream = self.acceptor.accept(io).await?;
        let negotiated = stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        Ok((stream, negotiated))
    }
}

fn certified(identity: Identity) -> Result<Arc<CertifiedKey>> {
    let key = any_supported_type(&identity.key)
        .map_err(|e| Error::tls(format!("unsupported private key: {e}")))?;
    Ok(Arc::new(CertifiedKey::new(identity.cert_chain, key)))
}
