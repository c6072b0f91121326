//! Upstream (server-facing) IMAP framing (`spec.md` §4.2).
//!
//! Symmetric to [`crate::wire::server`] but for the client role: waits for
//! the greeting before becoming writable, and never interprets server
//! responses beyond the tag/keyword classification described in
//! [`crate::wire::raw`] — dispatch on response content is the owning
//! stage object's job (`spec.md` §4.6).

use imap_codec::imap_types::core::Tag;
use thiserror::Error;
use tracing::instrument;

use crate::connection::BoxConnection;
use crate::wire::raw::{self, RawFrame, ResponseHead, ResponseTag};
use crate::wire::WRITE_BUFFER_SIZE;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("upstream transport closed unexpectedly")]
    UnexpectedEof,
    #[error("upstream did not send a greeting")]
    NoGreeting,
    #[error("upstream rejected STARTTLS: {0}")]
    StarttlsRejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One complete response frame read from the upstream server: its parsed
/// tag/keyword head plus the raw bytes (literals included), so the owner
/// can either act on `head` alone or re-serialize `bytes` downstream with
/// only the tag substituted (`spec.md` §4.6's relay path never needs to
/// re-encode response content it isn't actively rewriting).
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub head: ResponseHead,
    pub bytes: Vec<u8>,
}

impl RawResponse {
    /// The frame's bytes with the leading tag (or `*`) replaced by
    /// `new_tag`, used when relaying an untagged response as-is but a
    /// tagged one under the session's own tag.
    pub fn with_tag(&self, new_tag: &str) -> Vec<u8> {
        let old_tag_len = match &self.head.tag {
            ResponseTag::Untagged => 1,
            ResponseTag::Continuation => 1,
            ResponseTag::Tagged(t) => t.len(),
        };
        let mut out = Vec::with_capacity(self.bytes.len());
        out.extend_from_slice(new_tag.as_bytes());
        out.extend_from_slice(&self.bytes[old_tag_len..]);
        out
    }
}

/// One half of an upstream IMAP connection.
pub struct ImapClient {
    conn: BoxConnection,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    greeted: bool,
}

impl ImapClient {
    pub fn new(conn: BoxConnection) -> Self {
        Self {
            conn,
            read_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            write_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            greeted: false,
        }
    }

    /// Blocks until the server's untagged greeting has been read. Must be
    /// called (directly, or via the first [`ImapClient::read_response`])
    /// before any command is written.
    #[instrument(level = "debug", skip(self))]
    pub async fn wait_for_greeting(&mut self) -> Result<RawResponse, ClientError> {
        if self.greeted {
            return Err(ClientError::NoGreeting);
        }
        let resp = self.read_frame().await?;
        if resp.head.tag != ResponseTag::Untagged {
            return Err(ClientError::NoGreeting);
        }
        self.greeted = true;
        Ok(resp)
    }

    /// Writes a fully-serialized command line (the owner builds the exact
    /// text; see `spec.md` §4.4/§4.5/§4.7 for the commands this crate
    /// issues upstream).
    pub async fn write_raw(&mut self, line: &[u8]) -> Result<(), ClientError> {
        self.conn.write_all(line).await?;
        Ok(())
    }

    /// Reads the next complete response frame from the server.
    pub async fn read_response(&mut self) -> Result<RawResponse, ClientError> {
        self.read_frame().await
    }

    async fn read_frame(&mut self) -> Result<RawResponse, ClientError> {
        loop {
            match raw::read_response_frame(&self.read_buf) {
                RawFrame::Complete(n) => {
                    let bytes: Vec<u8> = self.read_buf.drain(..n).collect();
                    let head = raw::classify(&bytes);
                    return Ok(RawResponse { head, bytes });
                }
                RawFrame::Incomplete => {
                    let mut chunk = [0u8; 4096];
                    let n = self.conn.read(&mut chunk).await?;
                    if n == 0 {
                        return Err(ClientError::UnexpectedEof);
                    }
                    self.read_buf.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }

    /// Issues `STARTTLS`, reads the tagged response, and if `OK`, wraps
    /// the transport with a client-side TLS session verified against the
    /// connection's configured `verify_name` (`spec.md` §4.2). The
    /// connector and verification name are fixed at connection
    /// construction time ([`crate::connection::TlsConnection::starttls_client`]).
    pub async fn starttls(&mut self, tag: &Tag<'_>) -> Result<(), ClientError> {
        self.write_raw(format!("{} STARTTLS\r\n", tag.as_ref()).as_bytes()).await?;
        let resp = self.read_frame().await?;
        let is_ok = resp.head.keyword.as_deref() == Some("OK")
            && resp.head.tag == ResponseTag::Tagged(tag.as_ref().to_string());
        if !is_ok {
            return Err(ClientError::StarttlsRejected(
                String::from_utf8_lossy(&resp.bytes).into_owned(),
            ));
        }
        self.conn.upgrade_tls().await?;
        Ok(())
    }

    /// Tears down the connection. Idempotent: errors from an already
    /// closed transport are swallowed.
    pub async fn cancel(&mut self) {
        let _ = self.conn.shutdown().await;
    }
}
