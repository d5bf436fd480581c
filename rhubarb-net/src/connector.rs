use std::{io, sync::Arc};

use rhubarb_proto::{
    error::ServerError,
    proto::{error::DecoderError, ClientOp, ServerOp},
    Connect, Host, Scheme, ServerAddr, ServerInfo,
};
use rustls_platform_verifier::Verifier;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_rustls::{
    rustls::{
        self, crypto::CryptoProvider, pki_types::InvalidDnsNameError, pki_types::ServerName,
        version::TLS13, ClientConfig,
    },
    TlsConnector,
};

use crate::{
    connection::{StreamingConnection, StreamingReadError},
    dial::dial_tcp,
    security::ConnectionSecurity,
};

/// An error encountered while establishing a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("io error")]
    Io(#[source] io::Error),
    #[error("invalid DNS name")]
    InvalidDnsName(#[source] InvalidDnsNameError),
    #[error("decoder error")]
    Decoder(#[source] DecoderError),
    #[error("unexpected server operation during handshake")]
    UnexpectedServerOp,
    #[error("server requires a TLS connection")]
    SecureConnectionRequired,
    #[error("authentication rejected")]
    Authentication(#[source] ServerError),
    #[error("server rejected the handshake")]
    ServerRejected(#[source] ServerError),
}

impl From<StreamingReadError> for ConnectError {
    fn from(err: StreamingReadError) -> Self {
        match err {
            StreamingReadError::Decoder(err) => Self::Decoder(err),
            StreamingReadError::Io(err) => Self::Io(err),
        }
    }
}

/// An established, handshaken connection over plain or TLS TCP
pub type TcpConnection = StreamingConnection<ConnectionSecurity<TcpStream>>;

/// The established connection together with the server's hello
#[derive(Debug)]
pub struct ConnectOutcome {
    pub conn: TcpConnection,
    pub info: Box<ServerInfo>,
}

/// A reusable factory for established, handshaken connections
///
/// Holds the TLS configuration so repeated reconnect attempts don't
/// rebuild the verifier.
#[derive(Clone)]
pub struct Connector {
    tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").finish_non_exhaustive()
    }
}

impl Connector {
    /// Build a connector with TLS 1.3 and the platform certificate
    /// verifier.
    #[expect(
        clippy::missing_panics_doc,
        reason = "the built-in provider always supports TLS 1.3"
    )]
    #[must_use]
    pub fn new() -> Self {
        let provider = Arc::new(crypto_provider());
        let tls = TlsConnector::from(Arc::new(
            ClientConfig::builder_with_provider(Arc::clone(&provider))
                .with_protocol_versions(&[&TLS13])
                .unwrap()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(
                    Verifier::new().with_provider(provider),
                ))
                .with_no_client_auth(),
        ));
        Self { tls }
    }

    /// Dial `addr`, perform the `INFO` → `CONNECT` → `PING`/`PONG`
    /// handshake and return the established connection.
    ///
    /// `require_tls` upgrades the socket even when the URL scheme is
    /// plain. Callers are expected to wrap this future in their own
    /// deadline; the whole handshake counts against it.
    ///
    /// # Errors
    ///
    /// It returns an error if dialing, the TLS upgrade or the handshake
    /// fails.
    pub async fn connect(
        &self,
        addr: &ServerAddr,
        connect: Connect,
        require_tls: bool,
    ) -> Result<ConnectOutcome, ConnectError> {
        let socket = dial_tcp(addr).await.map_err(ConnectError::Io)?;
        socket.set_nodelay(true).map_err(ConnectError::Io)?;
        let mut socket = ConnectionSecurity::Plain(socket);

        if matches!(addr.scheme(), Scheme::Tls) {
            let domain = server_name(addr)?;
            socket = socket
                .upgrade_tls(&self.tls, domain)
                .await
                .map_err(ConnectError::Io)?;
        }

        let mut conn = StreamingConnection::new(socket);
        let info = match conn.read_next().await {
            Ok(ServerOp::Info { info }) => info,
            Ok(_) => return Err(ConnectError::UnexpectedServerOp),
            Err(err) => return Err(err.into()),
        };

        // The server sends INFO in plaintext; the TLS upgrade for plain
        // URLs happens here, before CONNECT.
        let conn = if conn.socket().is_tls() {
            conn
        } else if require_tls {
            let domain = server_name(addr)?;
            let socket = conn
                .into_inner()
                .upgrade_tls(&self.tls, domain)
                .await
                .map_err(ConnectError::Io)?;
            StreamingConnection::new(socket)
        } else if info.tls_required {
            return Err(ConnectError::SecureConnectionRequired);
        } else {
            conn
        };

        let conn = handshake(conn, connect).await?;
        Ok(ConnectOutcome { conn, info })
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new()
    }
}

/// Send `CONNECT` and a `PING`, then wait for the `PONG` that proves the
/// server accepted us.
///
/// # Errors
///
/// Returns an error if the server rejects the handshake or the
/// connection fails.
pub async fn handshake<S>(
    mut conn: StreamingConnection<S>,
    connect: Connect,
) -> Result<StreamingConnection<S>, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.enqueue_write_op(&ClientOp::Connect {
        connect: Box::new(connect),
    });
    conn.enqueue_write_op(&ClientOp::Ping);
    conn.write_and_flush().await.map_err(ConnectError::Io)?;

    loop {
        match conn.read_next().await {
            Ok(ServerOp::Success) => {
                // Verbose mode acknowledgement; the PONG is still coming
            }
            Ok(ServerOp::Pong) => return Ok(conn),
            Ok(ServerOp::Ping) => {
                conn.enqueue_write_op(&ClientOp::Pong);
                conn.write_and_flush().await.map_err(ConnectError::Io)?;
            }
            Ok(ServerOp::Error { error }) if error.is_auth_violation() => {
                return Err(ConnectError::Authentication(error));
            }
            Ok(ServerOp::Error { error }) => return Err(ConnectError::ServerRejected(error)),
            Ok(ServerOp::Info { .. } | ServerOp::Message { .. }) => {
                return Err(ConnectError::UnexpectedServerOp);
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn server_name(addr: &ServerAddr) -> Result<ServerName<'static>, ConnectError> {
    match addr.host() {
        Host::Ip(ip) => Ok(ServerName::IpAddress((*ip).into())),
        Host::Dns(name) => <_ as AsRef<str>>::as_ref(name)
            .to_owned()
            .try_into()
            .map_err(ConnectError::InvalidDnsName),
    }
}

fn crypto_provider() -> CryptoProvider {
    #[cfg(feature = "aws-lc-rs")]
    return rustls::crypto::aws_lc_rs::default_provider();
    #[cfg(all(not(feature = "aws-lc-rs"), feature = "ring"))]
    return rustls::crypto::ring::default_provider();
    #[cfg(not(any(feature = "aws-lc-rs", feature = "ring")))]
    compile_error!("Please enable the `aws-lc-rs` or the `ring` feature")
}
