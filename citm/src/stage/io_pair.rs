//! `IoPair` (`spec.md` §4.3): pairs a freshly-accepted downstream
//! connection with a freshly-dialed upstream one.

use std::sync::Arc;

use tracing::warn;

use crate::collaborator::IoCollaborator;
use crate::connection::{BoxConnection, Security};
use crate::error::{Error, Result};
use crate::wire::client::ImapClient;
use crate::wire::server::ImapServer;

/// The outcome of [`IoPair::run`]: a connected downstream/upstream pair,
/// ready to be handed to `Anon`.
pub struct ConnectedPair {
    pub downstream: ImapServer,
    pub upstream: ImapClient,
}

/// Dials an upstream connection for one already-accepted downstream
/// connection, and pairs them.
pub struct IoPair {
    io: Arc<dyn IoCollaborator>,
    downstream_security: Security,
}

impl IoPair {
    pub fn new(io: Arc<dyn IoCollaborator>, downstream_security: Security) -> Self {
        Self {
            io,
            downstream_security,
        }
    }

    /// Drives the connect to completion. On upstream connect failure,
    /// writes `* BYE failed to connect to upstream server` to the
    /// (still-plaintext-eligible) downstream connection before returning
    /// the error, per `spec.md` §4.3's "if the downstream security is
    /// not Tls" carve-out — announcing a plaintext BYE on a connection
    /// that is already running TLS would mean writing it as ciphertext
    /// garbage, so it is skipped there.
    pub async fn run(&self, mut downstream: BoxConnection) -> Result<ConnectedPair> {
        match self.io.connect_imap().await {
            Ok(upstream_conn) => Ok(ConnectedPair {
                downstream: ImapServer::new(downstream),
                upstream: ImapClient::new(upstream_conn),
            }),
            Err(err) => {
                if self.downstream_security != Security::Tls {
                    let _ = downstream
                        .write_all(b"* BYE failed to connect to upstream server\r\n")
                        .await;
                }
                let _ = downstream.shutdown().await;
                warn!(%err, "failed to connect to upstream server");
                Err(Error::Collaborator(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, DuplexConnection};
    use crate::error::{AnyBoxedError, AnyResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct AlwaysFails;

    #[async_trait]
    impl IoCollaborator for AlwaysFails {
        async fn connect_imap(&self) -> AnyResult<BoxConnection> {
            #[derive(Debug, thiserror::Error)]
            #[error("connect refused")]
            struct ConnectRefused;
            Err(Box::new(ConnectRefused) as AnyBoxedError)
        }
    }

    struct AlwaysSucceeds {
        called: AtomicBool,
    }

    #[async_trait]
    impl IoCollaborator for AlwaysSucceeds {
        async fn connect_imap(&self) -> AnyResult<BoxConnection> {
            self.called.store(true, Ordering::SeqCst);
            let (a, _b) = DuplexConnection::pair(4096, Security::Insecure);
            Ok(Box::new(a))
        }
    }

    #[tokio::test]
    async fn failed_connect_writes_bye_on_plaintext_downstream() {
        let io = Arc::new(AlwaysFails);
        let pair = IoPair::new(io, Security::Insecure);
        let (down_a, mut down_b) = DuplexConnection::pair(4096, Security::Insecure);

        let result = pair.run(Box::new(down_a)).await;
        assert!(result.is_err());

        let mut buf = [0u8; 128];
        let n = down_b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"* BYE failed to connect to upstream server\r\n");
    }

    #[tokio::test]
    async fn failed_connect_skips_bye_on_tls_downstream() {
        let io = Arc::new(AlwaysFails);
        let pair = IoPair::new(io, Security::Tls);
        let (down_a, mut down_b) = DuplexConnection::pair(4096, Security::Tls);

        let result = pair.run(Box::new(down_a)).await;
        assert!(result.is_err());

        // Nothing was written before shutdown.
        let mut buf = [0u8; 16];
        let n = down_b.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn successful_connect_yields_connected_pair() {
        let io = Arc::new(AlwaysSucceeds {
            called: AtomicBool::new(false),
        });
        let pair = IoPair::new(io.clone(), Security::Insecure);
        let (down_a, _down_b) = DuplexConnection::pair(4096, Security::Insecure);

        let result = pair.run(Box::new(down_a)).await;
        assert!(result.is_ok());
        assert!(io.called.load(Ordering::SeqCst));
    }
}
