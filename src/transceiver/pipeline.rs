//! Connection initialisation: TCP connect, TLS + ALPN, protocol install.

use std::{
    net::SocketAddr,
    sync::{Arc, Weak},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpSocket, TcpStream},
};
use tokio_rustls::TlsConnector;

use super::{
    channel::{Channel, Proto},
    h1, h2 as h2_glue,
    pool::{ChannelPool, Endpoint, Scheme},
    registry::HandleRegistry,
};
use crate::{
    config::{Http1Options, Http2Options, HttpVersion, NetOptions, SslOptions},
    error::{Error, Result, TimedOut},
};

/// Builds protocol-ready channels for the pools.
pub(crate) struct Connector {
    connect_timeout: Duration,
    net: NetOptions,
    http1: Http1Options,
    http2: Http2Options,
    ssl_handshake_timeout: Option<Duration>,
    version: HttpVersion,
    h2c: bool,
    tls: Arc<rustls::ClientConfig>,
}

impl Connector {
    pub(crate) fn new(
        connect_timeout: Duration,
        net: NetOptions,
        http1: Http1Options,
        http2: Http2Options,
        ssl: SslOptions,
        version: HttpVersion,
        h2c: bool,
    ) -> Result<Connector> {
        let tls = Arc::new(build_tls_config(&ssl, version)?);
        Ok(Connector {
            connect_timeout,
            net,
            http1,
            http2,
            ssl_handshake_timeout: ssl.handshake_timeout,
            version,
            h2c,
            tls,
        })
    }

    /// Kick off a connect to `addr`. The channel is returned immediately;
    /// its handshake future settles when initialisation finishes.
    pub(crate) fn connect(
        self: &Arc<Self>,
        endpoint: Endpoint,
        addr: SocketAddr,
        pool: Weak<ChannelPool>,
    ) -> Arc<Channel> {
        let channel = Channel::new(endpoint, addr);
        let this = self.clone();
        let ch = channel.clone();
        tokio::spawn(async move {
            let result = this.initialize(&ch, pool).await;
            if let Err(ref err) = result {
                log::debug!("channel {} init failed: {err}", ch.id());
                ch.close();
            }
            ch.settle_handshake(result);
        });
        channel
    }

    async fn initialize(&self, channel: &Arc<Channel>, pool: Weak<ChannelPool>) -> Result<()> {
        let addr = channel.remote_addr();
        let stream = tokio::time::timeout(self.connect_timeout, self.tcp_connect(addr))
            .await
            .map_err(|_| Error::connect(TimedOut))?
            .map_err(Error::connect)?;

        match channel.endpoint().scheme {
            Scheme::Https => {
                let host = channel.endpoint().host.clone();
                let server_name = rustls::pki_types::ServerName::try_from(host)
                    .map_err(Error::handshake)?;
                let handshake_timeout = self
                    .ssl_handshake_timeout
                    .unwrap_or(self.connect_timeout);
                let connector = TlsConnector::from(self.tls.clone());
                let tls_stream =
                    tokio::time::timeout(handshake_timeout, connector.connect(server_name, stream))
                        .await
                        .map_err(|_| Error::handshake(TimedOut))?
                        .map_err(Error::handshake)?;

                let negotiated_h2 =
                    tls_stream.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
                if negotiated_h2 {
                    self.install_h2(channel, pool, tls_stream).await
                } else {
                    self.install_h1(channel, pool, tls_stream);
                    Ok(())
                }
            }
            Scheme::Http => {
                // prior-knowledge cleartext h2: the client preface goes
                // straight onto the socket, no Upgrade dance
                if self.version == HttpVersion::Http2 && self.h2c {
                    self.install_h2(channel, pool, stream).await
                } else {
                    self.install_h1(channel, pool, stream);
                    Ok(())
                }
            }
        }
    }

    async fn tcp_connect(&self, addr: SocketAddr) -> std::io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if self.net.no_delay {
            socket.set_nodelay(true)?;
        }
        if self.net.so_keepalive.is_some() {
            socket.set_keepalive(true)?;
        }
        if let Some(ip) = self.net.local_address {
            socket.bind(SocketAddr::new(ip, 0))?;
        }
        socket.connect(addr).await
    }

    fn install_h1<IO>(&self, channel: &Arc<Channel>, pool: Weak<ChannelPool>, io: IO)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(io);
        let registry = Arc::new(HandleRegistry::h1());
        let version = match self.version {
            HttpVersion::Http10 => http::Version::HTTP_10,
            _ => http::Version::HTTP_11,
        };
        channel.install(Proto::H1 {
            write: Arc::new(tokio::sync::Mutex::new(Box::new(write))),
            registry: registry.clone(),
            version,
        });
        tokio::spawn(h1::reader_task(
            read,
            channel.clone(),
            registry,
            pool,
            self.http1.clone(),
        ));
    }

    async fn install_h2<IO>(
        &self,
        channel: &Arc<Channel>,
        pool: Weak<ChannelPool>,
        io: IO,
    ) -> Result<()>
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut builder = h2::client::Builder::new();
        builder.enable_push(false);
        if let Some(size) = self.http2.initial_stream_window_size {
            builder.initial_window_size(size);
        }
        if let Some(size) = self.http2.initial_connection_window_size {
            builder.initial_connection_window_size(size);
        }
        if let Some(size) = self.http2.max_frame_size {
            builder.max_frame_size(size);
        }
        if let Some(size) = self.http2.max_header_list_size {
            builder.max_header_list_size(size);
        }
        if let Some(max) = self.http2.max_concurrent_streams {
            builder.max_concurrent_streams(max);
        }

        // bound the preface + SETTINGS exchange like a connect
        let (send, connection) =
            tokio::time::timeout(self.connect_timeout, builder.handshake::<_, Bytes>(io))
                .await
                .map_err(|_| Error::handshake(TimedOut))?
                .map_err(Error::handshake)?;

        let registry = Arc::new(HandleRegistry::h2());
        channel.install(Proto::H2 {
            send: tokio::sync::Mutex::new(send),
            registry: registry.clone(),
        });
        tokio::spawn(h2_glue::driver_task(connection, channel.clone(), registry, pool));
        Ok(())
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("version", &self.version)
            .field("connect_timeout", &self.connect_timeout)
            .field("h2c", &self.h2c)
            .finish()
    }
}

fn build_tls_config(ssl: &SslOptions, version: HttpVersion) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in &ssl.extra_root_certificates {
        roots.add(cert.clone()).map_err(Error::builder)?;
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !ssl.cert_verification {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerification::new()));
    }

    config.alpn_protocols = match version {
        HttpVersion::Http2 => vec![b"h2".to_vec(), b"http/1.1".to_vec()],
        HttpVersion::Http11 => vec![b"http/1.1".to_vec()],
        HttpVersion::Http10 => Vec::new(),
    };
    Ok(config)
}

mod danger {
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider},
        pki_types::{CertificateDer, ServerName, UnixTime},
        DigitallySignedStruct,
    };

    /// Accepts any server certificate; signatures are still checked so the
    /// session keys are at least consistent.
    #[derive(Debug)]
    pub(super) struct NoVerification(CryptoProvider);

    impl NoVerification {
        pub(super) fn new() -> Self {
            NoVerification(rustls::crypto::ring::default_provider())
        }
    }

    impl ServerCertVerifier for NoVerification {
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
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}
