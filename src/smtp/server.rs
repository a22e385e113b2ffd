use crate::{
    envelope::TlsInfo,
    smtp::{
        InterfaceContext, TlsConfig,
        connection::{self, ConnectionError, ConnectionOutcome},
    },
};
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::{net::TcpListener, select};
use tokio_rustls::{
    TlsAcceptor,
    rustls::{
        self,
        pki_types::{CertificateDer, PrivateKeyDer},
    },
    server::TlsStream,
};
use tracing::{error, info, trace};

#[derive(Debug, Error)]
pub enum SmtpServerError {
    #[error("failed to load private key: {0}")]
    PrivateKey(io::Error),
    #[error("no private key found in the key material")]
    PrivateKeyNotFound,
    #[error("failed to load certificate: {0}")]
    Certificate(io::Error),
    #[error("failed to listen on address: {0}")]
    Listen(io::Error),
    #[error("failed to configure TLS: {0}")]
    Tls(rustls::Error),
}

/// One SMTP listener. TLS runs implicit (smtps) or via STARTTLS, depending
/// on the interface configuration.
pub struct SmtpServer {
    context: Arc<InterfaceContext>,
    acceptor: Option<TlsAcceptor>,
}

impl SmtpServer {
    pub fn new(context: Arc<InterfaceContext>) -> Result<Self, SmtpServerError> {
        let acceptor = match &context.config.tls {
            Some(tls) => Some(build_tls_acceptor(tls)?),
            None => None,
        };
        Ok(Self { context, acceptor })
    }

    pub async fn serve(self) -> Result<(), SmtpServerError> {
        let config = &self.context.config;
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(SmtpServerError::Listen)?;

        info!(
            interface = config.name,
            addr = %config.listen_addr,
            "smtp server listening"
        );

        loop {
            select! {
                _ = self.context.shutdown.cancelled() => {
                    info!(interface = config.name, "shutting down smtp server");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        info!(
                            code = "CONNECTION",
                            interface = config.name,
                            peer = %peer_addr,
                            "new connection"
                        );

                        let context = self.context.clone();
                        let acceptor = self.acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_socket(stream, context, acceptor, peer_addr).await {
                                if matches!(err, ConnectionError::Dropped) {
                                    trace!("connection ended: {err}");
                                } else {
                                    error!("failed to handle connection: {err}");
                                }
                            }
                        });
                    }
                    Err(err) => {
                        error!("failed to accept connection: {err}");
                    }
                },
            }
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async {
            if let Err(err) = self.serve().await {
                error!("smtp server error: {err:?}");
            }
        })
    }
}

async fn handle_socket(
    mut stream: tokio::net::TcpStream,
    context: Arc<InterfaceContext>,
    acceptor: Option<TlsAcceptor>,
    peer_addr: std::net::SocketAddr,
) -> Result<(), ConnectionError> {
    let implicit = context
        .config
        .tls
        .as_ref()
        .is_some_and(|tls| tls.implicit);

    if implicit {
        let acceptor = acceptor.expect("implicit TLS requires an acceptor");
        let mut tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(ConnectionError::Accept)?;
        let tls_info = extract_tls_info(&tls_stream);
        connection::handle(&mut tls_stream, context, peer_addr, Some(tls_info), true).await?;
        return Ok(());
    }

    match connection::handle(&mut stream, context.clone(), peer_addr, None, true).await? {
        ConnectionOutcome::Done => Ok(()),
        ConnectionOutcome::UpgradeTls => {
            let acceptor = acceptor.expect("STARTTLS was advertised without an acceptor");
            let mut tls_stream = acceptor
                .accept(stream)
                .await
                .map_err(ConnectionError::Accept)?;
            let tls_info = extract_tls_info(&tls_stream);
            // the session starts over; the client must say EHLO again
            connection::handle(&mut tls_stream, context, peer_addr, Some(tls_info), false).await?;
            Ok(())
        }
    }
}

fn extract_tls_info(stream: &TlsStream<tokio::net::TcpStream>) -> TlsInfo {
    let (_, session) = stream.get_ref();
    TlsInfo {
        version: session
            .protocol_version()
            .map(|version| format!("{version:?}").replace('_', "."))
            .unwrap_or_default(),
        name: session
            .negotiated_cipher_suite()
            .map(|suite| format!("{:?}", suite.suite()))
            .unwrap_or_default(),
    }
}

fn build_tls_acceptor(tls: &TlsConfig) -> Result<TlsAcceptor, SmtpServerError> {
    let cert_pem = tls.cert.resolve().map_err(SmtpServerError::Certificate)?;
    let key_pem = tls.key.resolve().map_err(SmtpServerError::PrivateKey)?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<CertificateDer<'static>>, io::Error>>()
        .map_err(SmtpServerError::Certificate)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(SmtpServerError::PrivateKey)?
        .ok_or(SmtpServerError::PrivateKeyNotFound)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(SmtpServerError::Tls)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
