//! The abstract bidirectional byte stream the core receives connections on.
//!
//! The core assumes an abstract connection with read/write/shutdown, a
//! security mode, an owned TLS context, and (for client connections) a peer
//! verification name. The event loop and TLS-stream plumbing below this
//! abstraction are out of scope (`spec.md` §1) — here we provide the trait
//! plus two concrete implementations: `TlsConnection`, wrapping any
//! `AsyncRead + AsyncWrite` with an optional `rustls` acceptor/connector so
//! `STARTTLS` can rewrap the same socket in place (grounded on the
//! `start-tls`/`stoptls` crates in the retrieval pack, which exist
//! specifically for mid-session TLS promotion), and `DuplexConnection`, an
//! in-memory pair used by tests.

use std::{fmt, io, sync::Arc};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// The security mode of a connection, carried on every framing endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    /// Plaintext, will never be upgraded to TLS.
    Insecure,
    /// Plaintext now, may be upgraded via `STARTTLS`.
    StartTls,
    /// TLS from the first byte.
    Tls,
}

/// A bidirectional byte stream with read/write/shutdown, matching the I/O
/// collaborator interface of `spec.md` §6. Implementors own the
/// underlying transport and any TLS context; `upgrade_tls` performs the
/// in-place `STARTTLS` rewrap.
#[async_trait]
pub trait Connection: Send {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    async fn shutdown(&mut self) -> io::Result<()>;

    fn security(&self) -> Security;

    /// The peer verification name; required for non-insecure client
    /// connections (`spec.md` §3).
    fn verify_name(&self) -> Option<&str>;

    /// Rewraps the underlying transport with a TLS session, consuming any
    /// bytes already read past the `STARTTLS` command/response as TLS
    /// pre-input. No-op (and an error) if called on a connection that is
    /// already `Tls` or has no TLS context configured.
    async fn upgrade_tls(&mut self) -> io::Result<()>;
}

enum Role {
    Server(TlsAcceptor),
    Client(TlsConnector, rustls_pki_types::ServerName<'static>),
}

enum Stream<S> {
    Plain(S),
    ServerTls(tokio_rustls::server::TlsStream<S>),
    ClientTls(tokio_rustls::client::TlsStream<S>),
}

/// A connection over any `AsyncRead + AsyncWrite` transport, capable of a
/// single in-place TLS upgrade.
pub struct TlsConnection<S> {
    stream: Option<Stream<S>>,
    role: Option<Role>,
    security: Security,
    verify_name: Option<String>,
}

impl<S> fmt::Debug for TlsConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("security", &self.security)
            .field("verify_name", &self.verify_name)
            .finish_non_exhaustive()
    }
}

impl<S> TlsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// A plaintext connection that will never be upgraded.
    pub fn insecure(stream: S) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            role: None,
            security: Security::Insecure,
            verify_name: None,
        }
    }

    /// A plaintext server-side connection that may later receive
    /// `STARTTLS`.
    pub fn starttls_server(stream: S, acceptor: TlsAcceptor) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            role: Some(Role::Server(acceptor)),
            security: Security::StartTls,
            verify_name: None,
        }
    }

    /// A plaintext client-side connection that will issue `STARTTLS`
    /// itself before becoming writable from the owner's perspective.
    pub fn starttls_client(
        stream: S,
        connector: TlsConnector,
        verify_name: rustls_pki_types::ServerName<'static>,
    ) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            role: Some(Role::Client(connector, verify_name.clone())),
            security: Security::StartTls,
            verify_name: Some(server_name_to_string(&verify_name)),
        }
    }

    /// A connection that is TLS from the first byte.
    pub async fn tls_server(stream: S, acceptor: TlsAcceptor) -> io::Result<Self> {
        let tls = acceptor.accept(stream).await?;
        Ok(Self {
            stream: Some(Stream::ServerTls(tls)),
            role: None,
            security: Security::Tls,
            verify_name: None,
        })
    }

    pub async fn tls_client(
        stream: S,
        connector: TlsConnector,
        verify_name: rustls_pki_types::ServerName<'static>,
    ) -> io::Result<Self> {
        let name_str = server_name_to_string(&verify_name);
        let tls = connector.connect(verify_name, stream).await?;
        Ok(Self {
            stream: Some(Stream::ClientTls(tls)),
            role: None,
            security: Security::Tls,
            verify_name: Some(name_str),
        })
    }
}

fn server_name_to_string(name: &rustls_pki_types::ServerName<'static>) -> String {
    match name {
        rustls_pki_types::ServerName::DnsName(dns) => dns.as_ref().to_string(),
        other => format!("{other:?}"),
    }
}

#[async_trait]
impl<S> Connection for TlsConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut().expect("connection already shut down") {
            Stream::Plain(s) => s.read(buf).await,
            Stream::ServerTls(s) => s.read(buf).await,
            Stream::ClientTls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self.stream.as_mut().expect("connection already shut down") {
            Stream::Plain(s) => s.write_all(buf).await,
            Stream::ServerTls(s) => s.write_all(buf).await,
            Stream::ClientTls(s) => s.write_all(buf).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.as_mut().expect("connection already shut down") {
            Stream::Plain(s) => s.shutdown().await,
            Stream::ServerTls(s) => s.shutdown().await,
            Stream::ClientTls(s) => s.shutdown().await,
        }
    }

    fn security(&self) -> Security {
        self.security
    }

    fn verify_name(&self) -> Option<&str> {
        self.verify_name.as_deref()
    }

    async fn upgrade_tls(&mut self) -> io::Result<()> {
        let stream = self.stream.take().expect("connection already shut down");
        let plain = match stream {
            Stream::Plain(s) => s,
            other => {
                self.stream = Some(other);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "connection is not plaintext, cannot upgrade",
                ));
            }
        };

        match self.role.take() {
            Some(Role::Server(acceptor)) => {
                let tls = acceptor.accept(plain).await?;
                self.stream = Some(Stream::ServerTls(tls));
                self.security = Security::Tls;
                Ok(())
            }
            Some(Role::Client(connector, name)) => {
                let tls = connector.connect(name, plain).await?;
                self.stream = Some(Stream::ClientTls(tls));
                self.security = Security::Tls;
                Ok(())
            }
            None => {
                self.stream = Some(Stream::Plain(plain));
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "connection has no TLS context configured",
                ))
            }
        }
    }
}

/// An in-memory connection pair for tests, backed by `tokio::io::DuplexStream`.
pub struct DuplexConnection {
    inner: tokio::io::DuplexStream,
    security: Security,
    verify_name: Option<String>,
}

impl DuplexConnection {
    /// Creates a connected pair with the given buffer size per direction.
    pub fn pair(max_buf: usize, security: Security) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(max_buf);
        let verify_name = if security == Security::Insecure {
            None
        } else {
            Some("localhost".to_string())
        };
        (
            Self {
                inner: a,
                security,
                verify_name: verify_name.clone(),
            },
            Self {
                inner: b,
                security,
                verify_name,
            },
        )
    }
}

#[async_trait]
impl Connection for DuplexConnection {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.inner.write_all(buf).await
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        AsyncWriteExt::shutdown(&mut self.inner).await
    }

    fn security(&self) -> Security {
        self.security
    }

    fn verify_name(&self) -> Option<&str> {
        self.verify_name.as_deref()
    }

    async fn upgrade_tls(&mut self) -> io::Result<()> {
        // Tests exercise STARTTLS at the protocol-classification layer
        // only; the duplex transport has no real TLS context to upgrade
        // to, so this just flips the reported security mode.
        self.security = Security::Tls;
        Ok(())
    }
}

/// A boxed, type-erased connection, the shape stored by stage objects once
/// a concrete transport has been chosen.
pub type BoxConnection = Box<dyn Connection>;

/// A lightweight handle type alias kept for symmetry with the
/// specification's "the core receives connections from an external I/O
/// collaborator and returns them on shutdown" wording — stage objects pass
/// `Arc<tokio::sync::Mutex<BoxConnection>>` around rather than re-deriving
/// this pattern ad hoc at every call site.
pub type SharedConnection = Arc<tokio::sync::Mutex<BoxConnection>>;
