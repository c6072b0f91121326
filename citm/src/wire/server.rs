//! Downstream (client-facing) IMAP framing (`spec.md` §4.1).
//!
//! The specification describes a callback-driven contract (`read(buf, cb)`,
//! `write(resp, cb)`, `await(cb)`). This crate realizes the same contract
//! as plain `async fn`s: a callback that "fires exactly once" is just the
//! future `.await`ed by the caller, and the scheduler seam only reappears
//! at the stage-object layer (`crate::stage`), which is where the
//! specification actually tests draining behavior.

use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::Tag;
use imap_codec::CommandCodec;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::connection::{BoxConnection, Security};
use crate::wire::{self, CommandFrame, WRITE_BUFFER_SIZE};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("downstream transport closed before logout or broken-conn teardown")]
    UnexpectedEof,
    #[error("STARTTLS was not the last command in the read buffer")]
    StarttlsTrailingInput,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What one call to [`ImapServer::read`] produced.
pub enum Inbound {
    /// A command the owner (a stage object) must act on.
    Command(Command<'static>),
    /// `LOGOUT` was handled locally; the connection is draining and will
    /// shut down. The owner should stop reading.
    LoggedOut,
}

/// One half of a downstream IMAP connection.
pub struct ImapServer {
    conn: BoxConnection,
    codec: CommandCodec,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    relay: bool,
    greeted: bool,
}

impl ImapServer {
    pub fn new(conn: BoxConnection) -> Self {
        Self {
            conn,
            codec: CommandCodec::default(),
            read_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            write_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            relay: false,
            greeted: false,
        }
    }

    /// Reads the next command for the owner, transparently sending the
    /// greeting and handling the pre-STARTTLS phase (`spec.md` §4.1)
    /// until relay mode begins.
    #[instrument(level = "debug", skip(self))]
    pub async fn read(&mut self) -> Result<Inbound, ServerError> {
        if !self.greeted {
            self.send_greeting().await?;
            self.greeted = true;
            if self.conn.security() != Security::StartTls {
                self.relay = true;
            }
        }

        loop {
            if self.relay {
                return Ok(Inbound::Command(self.read_command().await?));
            }

            match wire::decode_command(&self.codec, &self.read_buf) {
                CommandFrame::Parsed(cmd, consumed) => {
                    self.read_buf.drain(..consumed);
                    if let Some(inbound) = self.handle_local(cmd).await? {
                        return Ok(inbound);
                    }
                }
                CommandFrame::Incomplete => self.fill_read_buf().await?,
                CommandFrame::LiteralAck => {
                    self.write_raw(b"+ OK\r\n").await?;
                    self.fill_read_buf().await?;
                }
                CommandFrame::ParseError(raw) => {
                    self.read_buf.clear();
                    self.respond_bad_echo(&raw).await?;
                }
            }
        }
    }

    /// Reads the next command once relay mode has begun. Exposed
    /// separately so callers already past the pre-STARTTLS phase (the
    /// common case) can skip the phase check on every call.
    pub async fn read_command(&mut self) -> Result<Command<'static>, ServerError> {
        loop {
            match wire::decode_command(&self.codec, &self.read_buf) {
                CommandFrame::Parsed(cmd, consumed) => {
                    self.read_buf.drain(..consumed);
                    return Ok(cmd);
                }
                CommandFrame::Incomplete => self.fill_read_buf().await?,
                CommandFrame::LiteralAck => {
                    self.write_raw(b"+ OK\r\n").await?;
                    self.fill_read_buf().await?;
                }
                CommandFrame::ParseError(raw) => {
                    self.read_buf.clear();
                    self.respond_bad_echo(&raw).await?;
                }
            }
        }
    }

    /// Queues and immediately flushes a fully-serialized response. In
    /// relay mode every write is flushed immediately, per the
    /// specification; the pre-STARTTLS phase uses the same path since its
    /// traffic is low-volume enough that batching buys nothing.
    pub async fn write_raw(&mut self, resp: &[u8]) -> Result<(), ServerError> {
        if !self.write_buf.is_empty() && self.write_buf.len() + resp.len() > WRITE_BUFFER_SIZE {
            self.flush().await?;
        }
        self.write_buf.extend_from_slice(resp);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        if !self.write_buf.is_empty() {
            self.conn.write_all(&self.write_buf).await?;
            self.write_buf.clear();
        }
        Ok(())
    }

    /// Marks the endpoint as having completed a `LOGOUT` exchange: drains
    /// writes and shuts down the transport.
    pub async fn logged_out(&mut self) -> Result<(), ServerError> {
        self.flush().await?;
        self.conn.shutdown().await?;
        Ok(())
    }

    /// Tears down the connection. If `broken_conn`, announces it first.
    /// Idempotent: errors from an already-closed transport are swallowed.
    pub async fn cancel(&mut self, broken_conn: bool) {
        if broken_conn {
            let _ = self.write_raw(b"* BYE broken connection to upstream server\r\n").await;
        }
        let _ = self.conn.shutdown().await;
    }

    async fn fill_read_buf(&mut self) -> Result<(), ServerError> {
        let mut chunk = [0u8; 4096];
        let n = self.conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::UnexpectedEof);
        }
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    async fn send_greeting(&mut self) -> Result<(), ServerError> {
        let capa = if self.conn.security() == Security::StartTls {
            "IMAP4rev1 IDLE STARTTLS LOGINDISABLED"
        } else {
            "IMAP4rev1 IDLE AUTH=PLAIN LOGIN"
        };
        self.write_raw(format!("* OK [CAPABILITY {capa}] citm ready\r\n").as_bytes())
            .await
    }

    /// Handles one command during the pre-STARTTLS phase. Returns `Some`
    /// when the read loop should stop and hand the result back to the
    /// caller (only `LOGOUT` does); returns `None` to keep reading.
    async fn handle_local(&mut self, cmd: Command<'static>) -> Result<Option<Inbound>, ServerError> {
        let tag = cmd.tag.clone();
        match cmd.body {
            CommandBody::Noop => {
                self.respond_ok(&tag, "NOOP completed").await?;
                Ok(None)
            }
            CommandBody::Capability => {
                let capa = if self.conn.security() == Security::StartTls {
                    "IMAP4rev1 IDLE STARTTLS LOGINDISABLED"
                } else {
                    "IMAP4rev1 IDLE AUTH=PLAIN LOGIN"
                };
                self.write_raw(format!("* CAPABILITY {capa}\r\n").as_bytes()).await?;
                self.respond_ok(&tag, "CAPABILITY completed").await?;
                Ok(None)
            }
            CommandBody::Logout => {
                self.write_raw(b"* BYE logging out\r\n").await?;
                self.respond_ok(&tag, "LOGOUT completed").await?;
                Ok(Some(Inbound::LoggedOut))
            }
            CommandBody::Login { .. } => {
                self.respond_no(
                    &tag,
                    "did you just leak your password on an unencrypted connection?",
                )
                .await?;
                Ok(None)
            }
            CommandBody::StartTLS => {
                self.respond_ok(&tag, "begin TLS negotiation now").await?;
                if !self.read_buf.is_empty() {
                    return Err(ServerError::StarttlsTrailingInput);
                }
                self.conn.upgrade_tls().await?;
                self.relay = true;
                trace!("downstream connection upgraded to TLS");
                Ok(None)
            }
            _ => {
                self.respond_bad(&tag, "it's too early for that").await?;
                Ok(None)
            }
        }
    }

    async fn respond_ok(&mut self, tag: &Tag<'_>, text: &str) -> Result<(), ServerError> {
        self.write_raw(format!("{} OK {text}\r\n", tag.as_ref()).as_bytes()).await
    }

    async fn respond_no(&mut self, tag: &Tag<'_>, text: &str) -> Result<(), ServerError> {
        self.write_raw(format!("{} NO {text}\r\n", tag.as_ref()).as_bytes()).await
    }

    async fn respond_bad(&mut self, tag: &Tag<'_>, text: &str) -> Result<(), ServerError> {
        self.write_raw(format!("{} BAD {text}\r\n", tag.as_ref()).as_bytes()).await
    }

    async fn respond_bad_echo(&mut self, raw: &str) -> Result<(), ServerError> {
        self.write_raw(format!("* BAD invalid command: {}\r\n", raw.trim_end()).as_bytes())
            .await
    }
}
