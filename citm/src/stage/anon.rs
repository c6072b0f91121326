//! `Anon` (`spec.md` §4.4): a tiny IMAP server personality whose only
//! real job is relaying a `LOGIN` upstream and reading its verdict,
//! authenticating the downstream connection before anything else in the
//! core ever sees it. It also answers `NOOP`/`CAPABILITY`/`LOGOUT`
//! locally, since `ImapServer`'s pre-STARTTLS phase only screens those
//! for downstreams that can still negotiate STARTTLS — once relay mode
//! is on (the common case), every command lands here.

use imap_codec::imap_types::command::{Command, CommandBody};
use thiserror::Error;
use tracing::trace;

use crate::tag::TagGenerator;
use crate::wire::client::ImapClient;
use crate::wire::raw::ResponseTag;
use crate::wire::server::{ImapServer, Inbound};

#[derive(Debug, Error)]
pub enum AnonError {
    #[error(transparent)]
    Server(#[from] crate::wire::server::ServerError),
    #[error(transparent)]
    Client(#[from] crate::wire::client::ClientError),
    #[error("upstream sent an unexpected reply to our relayed LOGIN")]
    UnexpectedUpstreamReply,
}

/// Credentials handed, ownership-moved, to the `PreUser` stage on
/// successful login.
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Drives the downstream connection through `Anon`'s state table until
/// either a successful login hands back credentials and the connected
/// pair, or the attempt is abandoned (bad credentials loop back to
/// `PreAuth`, `LOGOUT`/cancellation end the attempt).
pub struct Anon {
    downstream: ImapServer,
    upstream: ImapClient,
    tags: TagGenerator,
}

pub enum AnonOutcome {
    /// The downstream user authenticated; hand the pair, plus their
    /// credentials, to `PreUser`.
    LoggedIn {
        downstream: ImapServer,
        upstream: ImapClient,
        credentials: Credentials,
    },
    /// The downstream connection logged out before authenticating.
    LoggedOut,
}

impl Anon {
    pub fn new(downstream: ImapServer, upstream: ImapClient) -> Self {
        Self {
            downstream,
            upstream,
            tags: TagGenerator::anon(),
        }
    }

    pub async fn run(mut self) -> Result<AnonOutcome, AnonError> {
        self.upstream.wait_for_greeting().await?;

        loop {
            match self.downstream.read().await? {
                Inbound::LoggedOut => return Ok(AnonOutcome::LoggedOut),
                Inbound::Command(cmd) => {
                    if let Some(outcome) = self.handle(cmd).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn handle(&mut self, cmd: Command<'static>) -> Result<Option<AnonOutcome>, AnonError> {
        // ImapServer's pre-STARTTLS phase only runs for downstreams that
        // can still negotiate STARTTLS; an Insecure or already-Tls
        // downstream is in relay mode from its very first read, so NOOP,
        // CAPABILITY and LOGOUT land here same as LOGIN does, and Anon has
        // to answer them itself rather than assume they were screened.
        let (username, password) = match cmd.body {
            CommandBody::Login { username, password } => (username, password),
            CommandBody::Logout => {
                self.downstream
                    .write_raw(b"* BYE logging out\r\n")
                    .await?;
                self.downstream
                    .write_raw(format!("{} OK LOGOUT completed\r\n", cmd.tag.as_ref()).as_bytes())
                    .await?;
                return Ok(Some(AnonOutcome::LoggedOut));
            }
            CommandBody::Noop => {
                self.downstream
                    .write_raw(format!("{} OK NOOP completed\r\n", cmd.tag.as_ref()).as_bytes())
                    .await?;
                return Ok(None);
            }
            CommandBody::Capability => {
                self.downstream
                    .write_raw(b"* CAPABILITY IMAP4rev1 LOGINDISABLED\r\n")
                    .await?;
                self.downstream
                    .write_raw(format!("{} OK CAPABILITY completed\r\n", cmd.tag.as_ref()).as_bytes())
                    .await?;
                return Ok(None);
            }
            _ => {
                self.downstream
                    .write_raw(format!("{} BAD it's too early for that\r\n", cmd.tag.as_ref()).as_bytes())
                    .await?;
                return Ok(None);
            }
        };

        let username = username.to_string();
        let password = password.to_string();
        let downstream_tag = cmd.tag.as_ref().to_string();

        let relay_tag = self.tags.next();
        self.upstream
            .write_raw(format!("{} LOGIN {} {}\r\n", relay_tag.as_ref(), username, password).as_bytes())
            .await?;

        loop {
            let resp = self.upstream.read_response().await?;
            match &resp.head.tag {
                ResponseTag::Tagged(tag) if tag == relay_tag.as_ref() => {
                    return match resp.head.keyword.as_deref() {
                        Some("OK") => {
                            self.downstream
                                .write_raw(format!("{downstream_tag} OK oh hey, I know you!\r\n").as_bytes())
                                .await?;
                            Ok(Some(AnonOutcome::LoggedIn {
                                downstream: std::mem::replace(
                                    &mut self.downstream,
                                    placeholder_server(),
                                ),
                                upstream: std::mem::replace(&mut self.upstream, placeholder_client()),
                                credentials: Credentials { username, password },
                            }))
                        }
                        Some("NO") => {
                            self.downstream
                                .write_raw(format!("{downstream_tag} NO nice try, imposter!\r\n").as_bytes())
                                .await?;
                            Ok(None)
                        }
                        _ => Err(AnonError::UnexpectedUpstreamReply),
                    };
                }
                ResponseTag::Untagged | ResponseTag::Continuation => {
                    trace!(?resp.head, "ignoring untagged chatter during Anon LOGIN");
                    continue;
                }
                ResponseTag::Tagged(_) => return Err(AnonError::UnexpectedUpstreamReply),
            }
        }
    }
}

/// `Anon` moves its endpoints out on a successful login via
/// `mem::replace`; these placeholders are never read back (the struct is
/// dropped immediately after), they only exist to satisfy ownership.
fn placeholder_server() -> ImapServer {
    ImapServer::new(Box::new(crate::connection::DuplexConnection::pair(1, crate::connection::Security::Insecure).0))
}

fn placeholder_client() -> ImapClient {
    ImapClient::new(Box::new(crate::connection::DuplexConnection::pair(1, crate::connection::Security::Insecure).0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, DuplexConnection, Security};
    use crate::wire::raw::{self, RawFrame};

    async fn read_frame(conn: &mut DuplexConnection, buf: &mut Vec<u8>) -> Vec<u8> {
        loop {
            if let RawFrame::Complete(n) = raw::read_response_frame(buf) {
                return buf.drain(..n).collect();
            }
            let mut chunk = [0u8; 4096];
            let n = conn.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-frame");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn login_success_hands_off_credentials() {
        let (down_a, mut down_b) = DuplexConnection::pair(1 << 16, Security::Insecure);
        let (up_a, mut up_b) = DuplexConnection::pair(1 << 16, Security::Insecure);

        let downstream = ImapServer::new(Box::new(down_a));
        let upstream = ImapClient::new(Box::new(up_a));
        let anon = Anon::new(downstream, upstream);
        let handle = tokio::spawn(anon.run());

        let mut down_buf = Vec::new();
        let mut up_buf = Vec::new();

        up_b.write_all(b"* OK [CAPABILITY IMAP4rev1] upstream ready\r\n").await.unwrap();

        // Anon's downstream personality greets like any other ImapServer.
        let greeting = read_frame(&mut down_b, &mut down_buf).await;
        assert!(String::from_utf8_lossy(&greeting).starts_with("* OK"));

        down_b.write_all(b"A1 LOGIN alice secret\r\n").await.unwrap();
        let relayed = read_frame(&mut up_b, &mut up_buf).await;
        assert!(String::from_utf8_lossy(&relayed).contains("LOGIN alice secret"));

        up_b.write_all(b"anon1 OK LOGIN completed\r\n").await.unwrap();
        let reply = read_frame(&mut down_b, &mut down_buf).await;
        assert_eq!(reply, b"A1 OK oh hey, I know you!\r\n");

        match handle.await.unwrap().unwrap() {
            AnonOutcome::LoggedIn { credentials, .. } => {
                assert_eq!(credentials.username, "alice");
                assert_eq!(credentials.password, "secret");
            }
            AnonOutcome::LoggedOut => panic!("expected LoggedIn"),
        }
    }

    #[tokio::test]
    async fn login_rejected_loops_back_to_preauth() {
        let (down_a, mut down_b) = DuplexConnection::pair(1 << 16, Security::Insecure);
        let (up_a, mut up_b) = DuplexConnection::pair(1 << 16, Security::Insecure);

        let downstream = ImapServer::new(Box::new(down_a));
        let upstream = ImapClient::new(Box::new(up_a));
        let anon = Anon::new(downstream, upstream);
        let handle = tokio::spawn(anon.run());

        let mut down_buf = Vec::new();
        let mut up_buf = Vec::new();

        up_b.write_all(b"* OK [CAPABILITY IMAP4rev1] upstream ready\r\n").await.unwrap();
        read_frame(&mut down_b, &mut down_buf).await; // greeting

        down_b.write_all(b"A1 LOGIN alice wrong\r\n").await.unwrap();
        read_frame(&mut up_b, &mut up_buf).await; // relayed LOGIN
        up_b.write_all(b"anon1 NO authentication failed\r\n").await.unwrap();
        let reply = read_frame(&mut down_b, &mut down_buf).await;
        assert_eq!(reply, b"A1 NO nice try, imposter!\r\n");

        // The attempt loops back to PreAuth: a second LOGIN can still
        // succeed on the same connection.
        down_b.write_all(b"A2 LOGIN alice secret\r\n").await.unwrap();
        read_frame(&mut up_b, &mut up_buf).await;
        up_b.write_all(b"anon2 OK LOGIN completed\r\n").await.unwrap();
        let reply = read_frame(&mut down_b, &mut down_buf).await;
        assert_eq!(reply, b"A2 OK oh hey, I know you!\r\n");

        match handle.await.unwrap().unwrap() {
            AnonOutcome::LoggedIn { .. } => {}
            AnonOutcome::LoggedOut => panic!("expected LoggedIn"),
        }
    }

    #[tokio::test]
    async fn logout_before_login_ends_the_attempt() {
        let (down_a, mut down_b) = DuplexConnection::pair(1 << 16, Security::Insecure);
        let (up_a, mut up_b) = DuplexConnection::pair(1 << 16, Security::Insecure);

        let downstream = ImapServer::new(Box::new(down_a));
        let upstream = ImapClient::new(Box::new(up_a));
        let anon = Anon::new(downstream, upstream);
        let handle = tokio::spawn(anon.run());

        let mut down_buf = Vec::new();
        up_b.write_all(b"* OK [CAPABILITY IMAP4rev1] upstream ready\r\n").await.unwrap();
        read_frame(&mut down_b, &mut down_buf).await; // greeting

        down_b.write_all(b"A1 LOGOUT\r\n").await.unwrap();
        read_frame(&mut down_b, &mut down_buf).await; // * BYE
        read_frame(&mut down_b, &mut down_buf).await; // tagged OK

        assert!(matches!(handle.await.unwrap().unwrap(), AnonOutcome::LoggedOut));
    }
}
