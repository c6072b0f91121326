//! `Session` (`spec.md` §4.6/§4.7): the steady state. Classifies every
//! downstream command, forwards passthrus upstream under a session tag,
//! runs the `APPEND` intercept (encrypt-then-relay), rewrites `STATUS`
//! attributes through the mail cache, and handles `SELECT`/`CLOSE`/
//! `LOGOUT`'s disconnect protocol.
//!
//! The downstream/upstream mailbox drivers of `spec.md` §4.6 (`dn_t`/
//! `up_t`) own the full local CONDSTORE/QRESYNC sync engine, which
//! `spec.md` §1 scopes out of this core. What's implemented here for
//! `STORE`/`EXPUNGE`/`COPY`/`FETCH`/`CHECK`/`SEARCH`/`IDLE` is a direct
//! relay to the upstream server under the selected mailbox instead —
//! the driver contract's *shape* (require selected state, forward,
//! relay the reply) without the cache-coherency engine behind it. This
//! is recorded as a simplification in `DESIGN.md`.

use std::sync::Arc;

use chrono::Utc;
use imap_codec::encode::Encoder;
use imap_codec::imap_types::command::{Command, CommandBody};
use imap_codec::imap_types::core::Literal;
use imap_codec::CommandCodec;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::keydir::{crypto, CryptoError, Fingerprint, KeyDir};
use crate::mailcache::{CacheError, MailCache, StatusAttrs};
use crate::stage::io_pair::ConnectedPair;
use crate::stage::preuser::PreUserOutcome;
use crate::tag::TagGenerator;
use crate::wire::client::{ClientError, ImapClient, RawResponse};
use crate::wire::raw::{self, ResponseTag};
use crate::wire::server::{ImapServer, Inbound, ServerError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("upstream violated the session protocol: {0}")]
    Protocol(String),
}

/// Status-response codes `spec.md` §4.6 says the session strips before
/// relaying a tagged reply downstream — codes describing upstream-only
/// bookkeeping the local client never asked about.
const UNSUPPORTED_CODES: &[&str] = &[
    "UIDNOSTICK",
    "APPENDUID",
    "COPYUID",
    "NOMODSEQ",
    "HIMODSEQ",
    "MODIFIED",
    "CLOSED",
];

/// Runs one `(ImapServer, ImapClient)` pair through the steady state.
/// Multiple pairs for the same user (`spec.md` §2) each get their own
/// `Session` instance sharing the same `KeyDir`/`MailCache`; the registry
/// (`citm::registry`) is what ties them together under one user entry.
pub struct Session {
    downstream: ImapServer,
    upstream: ImapClient,
    keydir: Arc<Mutex<KeyDir>>,
    cache: Arc<dyn MailCache>,
    codec: CommandCodec,
    tags: TagGenerator,
    selected: Option<String>,
}

impl Session {
    pub fn new(pair: ConnectedPair, keydir: Arc<Mutex<KeyDir>>, cache: Arc<dyn MailCache>) -> Self {
        Self {
            downstream: pair.downstream,
            upstream: pair.upstream,
            keydir,
            cache,
            codec: CommandCodec::default(),
            tags: TagGenerator::session(),
            selected: None,
        }
    }

    /// A clone of this session's `KeyDir` handle, for a registry routing
    /// a late-arriving pair into its own `Session` sharing the same keys.
    pub fn keydir_handle(&self) -> Arc<Mutex<KeyDir>> {
        self.keydir.clone()
    }

    /// Spawns one `Session` per parked pair from a completed `PreUser`
    /// hand-off (`spec.md` §4.5 step 3).
    pub fn fan_out(outcome: PreUserOutcome, cache: Arc<dyn MailCache>) -> Vec<Self> {
        outcome
            .pairs
            .into_iter()
            .map(|pair| Session::new(pair, outcome.keydir.clone(), cache.clone()))
            .collect()
    }

    #[instrument(level = "debug", skip(self))]
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            match self.downstream.read().await? {
                Inbound::LoggedOut => return Ok(()),
                Inbound::Command(cmd) => {
                    if self.dispatch(cmd).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Returns `true` once the session has fully logged out and the
    /// caller should stop reading.
    async fn dispatch(&mut self, cmd: Command<'static>) -> Result<bool, SessionError> {
        match &cmd.body {
            CommandBody::Logout => {
                self.handle_logout(cmd).await?;
                return Ok(true);
            }
            CommandBody::Noop | CommandBody::Capability => self.handle_local(cmd).await?,
            CommandBody::Create { .. }
            | CommandBody::Subscribe { .. }
            | CommandBody::Unsubscribe { .. }
            | CommandBody::List { .. }
            | CommandBody::Lsub { .. } => self.handle_generic_passthru(cmd).await?,
            CommandBody::Status { .. } => self.handle_status(cmd).await?,
            CommandBody::Delete { .. } => self.handle_delete(cmd).await?,
            CommandBody::Rename { .. } => self.handle_rename(cmd).await?,
            CommandBody::Append { .. } => self.handle_append(cmd).await?,
            CommandBody::Select { .. } => self.handle_select(cmd, false).await?,
            CommandBody::Examine { .. } => self.handle_select(cmd, true).await?,
            CommandBody::Close => self.handle_close(cmd).await?,
            CommandBody::Store { .. }
            | CommandBody::Expunge
            | CommandBody::Copy { .. }
            | CommandBody::Check
            | CommandBody::Search { .. }
            | CommandBody::Idle => self.handle_selected_passthru(cmd).await?,
            CommandBody::Fetch { .. } => self.handle_fetch(cmd).await?,
            CommandBody::StartTLS => {
                self.reject(&cmd, "tls is already active").await?;
            }
            CommandBody::Authenticate { .. } => {
                self.reject(&cmd, "this port was configured as insecure").await?;
            }
            CommandBody::Login { .. } => {
                self.reject(&cmd, "already logged in").await?;
            }
            CommandBody::Enable { .. } | CommandBody::Unselect => {
                self.reject(&cmd, "command not supported").await?;
            }
        }
        Ok(false)
    }

    async fn handle_local(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let tag = cmd.tag.as_ref().to_string();
        match &cmd.body {
            CommandBody::Noop => {
                self.gather_updates(true, false).await?;
                self.downstream
                    .write_raw(format!("{tag} OK completed\r\n").as_bytes())
                    .await?;
            }
            CommandBody::Capability => {
                self.gather_updates(true, false).await?;
                self.downstream.write_raw(b"* CAPABILITY IMAP4rev1 IDLE\r\n").await?;
                self.downstream
                    .write_raw(format!("{tag} OK completed\r\n").as_bytes())
                    .await?;
            }
            _ => unreachable!("dispatch only routes Noop/Capability here"),
        }
        Ok(())
    }

    /// Flushes pending upstream mailbox-state chatter for the selected
    /// mailbox (`spec.md` §4.6(2): `NOOP`/`CAPABILITY` double as a poll
    /// for new `EXISTS`/`EXPUNGE`/`FETCH` updates while no driver object
    /// is independently watching the connection). Relays a real `NOOP`
    /// upstream under a fresh tag when a mailbox is selected and forwards
    /// whatever untagged data comes back, decrypting any `FETCH` literal
    /// bodies along the way; a no-op when nothing is selected, since
    /// there is nothing to poll yet. `allow_expunges` gates whether an
    /// untagged `EXPUNGE` is relayed (a caller mid-`FETCH`/`STORE`
    /// shouldn't have sequence numbers renumbered out from under it);
    /// `uid_mode` is unused until a `UID`-prefixed caller needs it.
    async fn gather_updates(&mut self, allow_expunges: bool, uid_mode: bool) -> Result<(), SessionError> {
        let _ = uid_mode;
        let Some(mailbox) = self.selected.clone() else {
            return Ok(());
        };
        let tag = self.tags.next();
        self.upstream
            .write_raw(format!("{} NOOP\r\n", tag.as_ref()).as_bytes())
            .await?;
        let (untagged, _final) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            if matches!(resp.head.keyword.as_deref(), Some("FLAGS") | Some("RECENT")) {
                continue;
            }
            if !allow_expunges && is_untagged_expunge(&resp.bytes) {
                continue;
            }
            if is_untagged_fetch(&resp.bytes) {
                let rewritten = self.decrypt_fetch_literal(&mailbox, resp).await?;
                self.downstream.write_raw(&rewritten).await?;
            } else {
                self.downstream.write_raw(&resp.bytes).await?;
            }
        }
        Ok(())
    }

    async fn reject(&mut self, cmd: &Command<'static>, text: &str) -> Result<(), SessionError> {
        self.downstream
            .write_raw(format!("{} BAD {text}\r\n", cmd.tag.as_ref()).as_bytes())
            .await?;
        Ok(())
    }

    async fn handle_logout(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        self.disconnect_selection(false).await?;
        self.downstream.write_raw(b"* BYE goodbye, my love...\r\n").await?;
        self.downstream
            .write_raw(format!("{} OK I'm gonna be strong, I can make it through this\r\n", cmd.tag.as_ref()).as_bytes())
            .await?;
        self.downstream.logged_out().await?;
        self.upstream.cancel().await;
        Ok(())
    }

    /// Forwards `cmd` upstream verbatim under a fresh session tag, relays
    /// every untagged reply downstream (dropping `FLAGS`/`RECENT`), and
    /// relays the tagged reply back under the downstream tag with
    /// unsupported status codes stripped.
    async fn handle_generic_passthru(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let final_resp = self.relay_passthru(cmd).await?;
        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    /// Sends `cmd` upstream under a fresh `sc<N>` tag and relays untagged
    /// chatter downstream as it arrives; returns the final tagged reply
    /// (still carrying its original `sc<N>` tag) for the caller to
    /// interpret before relaying.
    async fn relay_passthru(&mut self, cmd: Command<'static>) -> Result<RawResponse, SessionError> {
        let tag = self.tags.next();
        let retagged = Command {
            tag: tag.clone(),
            body: cmd.body,
        };
        let line = self.codec.encode(&retagged).dump();
        self.upstream.write_raw(&line).await?;

        let (untagged, final_resp) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            if matches!(resp.head.keyword.as_deref(), Some("FLAGS") | Some("RECENT")) {
                continue;
            }
            self.downstream.write_raw(&resp.bytes).await?;
        }
        Ok(final_resp)
    }

    async fn handle_status(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let CommandBody::Status { mailbox, .. } = &cmd.body else {
            unreachable!("dispatch only routes Status here")
        };
        let mailbox_name = mailbox.to_string();

        let tag = self.tags.next();
        let retagged = Command {
            tag: tag.clone(),
            body: cmd.body.clone(),
        };
        let line = self.codec.encode(&retagged).dump();
        self.upstream.write_raw(&line).await?;

        let (untagged, final_resp) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            match resp.head.keyword.as_deref() {
                Some("STATUS") => {
                    let rewritten = self.rewrite_status_line(&resp, &mailbox_name).await?;
                    self.downstream.write_raw(&rewritten).await?;
                }
                Some("FLAGS") | Some("RECENT") => continue,
                _ => self.downstream.write_raw(&resp.bytes).await?,
            }
        }
        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    async fn rewrite_status_line(&self, resp: &RawResponse, mailbox: &str) -> Result<Vec<u8>, SessionError> {
        let text = String::from_utf8_lossy(&resp.bytes).into_owned();
        let open = text
            .find('(')
            .ok_or_else(|| SessionError::Protocol("malformed STATUS response".into()))?;
        let close = text
            .rfind(')')
            .ok_or_else(|| SessionError::Protocol("malformed STATUS response".into()))?;

        let mut attrs = StatusAttrs::default();
        let mut words = text[open + 1..close].split_whitespace();
        while let (Some(key), Some(val)) = (words.next(), words.next()) {
            let val: u32 = val.parse().unwrap_or_default();
            match key.to_ascii_uppercase().as_str() {
                "MESSAGES" => attrs.messages = Some(val),
                "RECENT" => attrs.recent = Some(val),
                "UIDNEXT" => attrs.uidnext = Some(val),
                "UIDVALIDITY" => attrs.uidvalidity = Some(val),
                "UNSEEN" => attrs.unseen = Some(val),
                _ => {}
            }
        }

        let rewritten = self.cache.process_status_resp(mailbox, attrs).await;
        let mut parts = Vec::new();
        if let Some(v) = rewritten.messages {
            parts.push(format!("MESSAGES {v}"));
        }
        if let Some(v) = rewritten.recent {
            parts.push(format!("RECENT {v}"));
        }
        if let Some(v) = rewritten.uidnext {
            parts.push(format!("UIDNEXT {v}"));
        }
        if let Some(v) = rewritten.uidvalidity {
            parts.push(format!("UIDVALIDITY {v}"));
        }
        if let Some(v) = rewritten.unseen {
            parts.push(format!("UNSEEN {v}"));
        }

        let mut out = text[..open].to_string();
        out.push('(');
        out.push_str(&parts.join(" "));
        out.push_str(")\r\n");
        Ok(out.into_bytes())
    }

    async fn handle_delete(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let CommandBody::Delete { mailbox } = &cmd.body else {
            unreachable!("dispatch only routes Delete here")
        };
        let name = mailbox.to_string();

        if self.selected.as_deref() == Some(name.as_str()) {
            self.downstream
                .write_raw(format!("{downstream_tag} NO unable to DELETE what is SELECTed\r\n").as_bytes())
                .await?;
            return Ok(());
        }

        let freeze = self.cache.freeze_new(&name).await?;
        let final_resp = self.relay_passthru(cmd).await?;
        if final_resp.head.keyword.as_deref() == Some("OK") {
            self.cache.delete(&freeze).await?;
        }
        self.cache.freeze_free(freeze).await;

        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    async fn handle_rename(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let CommandBody::Rename { mailbox, new_mailbox } = &cmd.body else {
            unreachable!("dispatch only routes Rename here")
        };
        let from = mailbox.to_string();
        let to = new_mailbox.to_string();

        let freeze = self.cache.freeze_new(&from).await?;
        let final_resp = self.relay_passthru(cmd).await?;
        if final_resp.head.keyword.as_deref() == Some("OK") {
            self.cache.rename(&freeze, &to).await?;
        }
        self.cache.freeze_free(freeze).await;

        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    /// The `APPEND` intercept (`spec.md` §4.7): encrypt the literal for
    /// every key in the `KeyDir`, relay the rewritten command upstream,
    /// and on a matching `APPENDUID`, land the plaintext copy locally.
    async fn handle_append(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let CommandBody::Append {
            mailbox,
            flags,
            message,
            ..
        } = &cmd.body
        else {
            unreachable!("dispatch only routes Append here")
        };
        let mailbox_name = mailbox.to_string();
        let flag_strings: Vec<String> = flags.iter().map(|f| f.to_string()).collect();
        let plaintext = message.as_ref().to_vec();
        // The client's own internal-date argument passes through to the
        // upstream command unchanged (the body is cloned below); "now" is
        // used only for this session's own local-landing bookkeeping.
        let intdate = Utc::now();

        let hold = self.cache.hold_new(&mailbox_name).await?;

        let ciphertext = {
            let keydir = self.keydir.lock().await;
            let recipients: Vec<(Fingerprint, &rsa::RsaPublicKey)> =
                keydir.all_keys().map(|kp| (kp.fingerprint(), kp.public_key())).collect();
            crypto::encrypt_for(&plaintext, &recipients, &mut rand::rngs::OsRng)?
        };

        let literal = Literal::try_from(ciphertext.into_bytes())
            .map_err(|_| SessionError::Protocol("encrypted APPEND literal was rejected by the codec".into()))?;
        let mut encrypted_body = cmd.body.clone();
        if let CommandBody::Append { message, .. } = &mut encrypted_body {
            *message = literal;
        }

        let tag = self.tags.next();
        let retagged = Command {
            tag: tag.clone(),
            body: encrypted_body,
        };
        let line = self.codec.encode(&retagged).dump();
        self.upstream.write_raw(&line).await?;

        let (untagged, final_resp) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            self.downstream.write_raw(&resp.bytes).await?;
        }

        if final_resp.head.keyword.as_deref() == Some("OK") {
            match parse_appenduid(&final_resp.bytes) {
                Some((uidvalidity, uid)) => {
                    if self.cache.uidvalidity(&mailbox_name).await == Some(uidvalidity) {
                        self.cache
                            .land_appended(&mailbox_name, uid, &plaintext, &flag_strings, intdate)
                            .await?;
                    }
                }
                None => warn!("upstream APPEND OK carried no APPENDUID; leaving resync to pick it up"),
            }
        }
        self.cache.hold_release(hold).await;

        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    async fn handle_select(&mut self, cmd: Command<'static>, examine: bool) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let mailbox_name = match &cmd.body {
            CommandBody::Select { mailbox } | CommandBody::Examine { mailbox } => mailbox.to_string(),
            _ => unreachable!("dispatch only routes Select/Examine here"),
        };
        let _ = examine;

        if self.selected.is_some() {
            self.disconnect_selection(false).await?;
        }

        let final_resp = self.relay_passthru(cmd).await?;
        let out = final_resp.with_tag(&downstream_tag);
        self.downstream.write_raw(&out).await?;

        if final_resp.head.keyword.as_deref() == Some("OK") {
            self.selected = Some(mailbox_name.clone());
            self.cache.mark_mailbox_synced(&mailbox_name).await;
        } else {
            self.selected = None;
        }
        Ok(())
    }

    async fn handle_close(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        if self.selected.is_none() {
            self.downstream
                .write_raw(format!("{downstream_tag} NO no mailbox selected\r\n").as_bytes())
                .await?;
            return Ok(());
        }
        self.disconnect_selection(true).await?;
        self.downstream
            .write_raw(format!("{downstream_tag} OK get offa my lawn!\r\n").as_bytes())
            .await?;
        Ok(())
    }

    async fn handle_selected_passthru(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        if self.selected.is_none() {
            self.downstream
                .write_raw(format!("{downstream_tag} BAD no mailbox selected\r\n").as_bytes())
                .await?;
            return Ok(());
        }
        self.handle_generic_passthru(cmd).await
    }

    /// `FETCH`'s passthru, special-cased out of [`Self::handle_selected_passthru`]
    /// so every relayed body runs through [`MailCache::process_msg`]
    /// (`spec.md` §4.8: the decryption hook runs "on every body that
    /// crosses the boundary") instead of being forwarded verbatim.
    async fn handle_fetch(&mut self, cmd: Command<'static>) -> Result<(), SessionError> {
        let downstream_tag = cmd.tag.as_ref().to_string();
        let Some(mailbox) = self.selected.clone() else {
            self.downstream
                .write_raw(format!("{downstream_tag} BAD no mailbox selected\r\n").as_bytes())
                .await?;
            return Ok(());
        };

        let tag = self.tags.next();
        let retagged = Command {
            tag: tag.clone(),
            body: cmd.body,
        };
        let line = self.codec.encode(&retagged).dump();
        self.upstream.write_raw(&line).await?;

        let (untagged, final_resp) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            match resp.head.keyword.as_deref() {
                Some("FLAGS") | Some("RECENT") => continue,
                _ if is_untagged_fetch(&resp.bytes) => {
                    let rewritten = self.decrypt_fetch_literal(&mailbox, resp).await?;
                    self.downstream.write_raw(&rewritten).await?;
                }
                _ => self.downstream.write_raw(&resp.bytes).await?,
            }
        }
        let out = strip_unsupported_codes(&final_resp.with_tag(&downstream_tag));
        self.downstream.write_raw(&out).await?;
        Ok(())
    }

    /// Runs the message body carried in `resp`'s literal (if any) through
    /// the decryption hook and rewrites the literal's length prefix to
    /// match, leaving the rest of the `* n FETCH (...)` line untouched.
    /// A `FETCH` response with no literal (e.g. `FLAGS`/`UID`-only data
    /// items) passes through unchanged.
    async fn decrypt_fetch_literal(&self, mailbox: &str, resp: RawResponse) -> Result<Vec<u8>, SessionError> {
        let Some(payload) = raw::literal_payload(&resp.bytes) else {
            return Ok(resp.bytes);
        };
        let line_end = resp
            .bytes
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| SessionError::Protocol("malformed FETCH literal".into()))?;
        let header = &resp.bytes[..line_end];
        let open = header
            .iter()
            .rposition(|&b| b == b'{')
            .ok_or_else(|| SessionError::Protocol("malformed FETCH literal".into()))?;

        let processed = self.cache.process_msg(mailbox, payload).await;
        let body = if processed.not_for_me { Vec::new() } else { processed.bytes };

        let literal_start = line_end + 2;
        let literal_end = literal_start + payload.len();
        let tail = &resp.bytes[literal_end..];

        let mut out = Vec::with_capacity(open + body.len() + tail.len() + 16);
        out.extend_from_slice(&header[..open]);
        out.push(b'{');
        out.extend_from_slice(body.len().to_string().as_bytes());
        out.extend_from_slice(b"}\r\n");
        out.extend_from_slice(&body);
        out.extend_from_slice(tail);
        Ok(out)
    }

    /// The disconnect protocol of `spec.md` §4.6, collapsed to a single
    /// upstream `CLOSE` (`expunge`) or `UNSELECT`-equivalent — the full
    /// `dn_t`/`up_t` multi-step handshake only matters when a real
    /// resynchronizing cache driver sits behind it, which is out of
    /// scope here (see module doc comment).
    async fn disconnect_selection(&mut self, expunge: bool) -> Result<(), SessionError> {
        let Some(_mailbox) = self.selected.take() else {
            return Ok(());
        };
        let tag = self.tags.next();
        let verb = if expunge { "CLOSE" } else { "UNSELECT" };
        self.upstream
            .write_raw(format!("{} {}\r\n", tag.as_ref(), verb).as_bytes())
            .await?;
        let (untagged, _final) = self.collect_until_tagged(tag.as_ref()).await?;
        for resp in untagged {
            if matches!(resp.head.keyword.as_deref(), Some("FLAGS") | Some("RECENT")) {
                continue;
            }
            self.downstream.write_raw(&resp.bytes).await?;
        }
        Ok(())
    }

    /// Reads upstream responses until the tagged reply matching `tag`
    /// arrives, collecting untagged chatter along the way. A stray tagged
    /// reply under a different tag is a protocol violation at this
    /// simplified relay's level of pipelining (`spec.md` §5: "exactly one
    /// passthru ... is in flight at a time").
    async fn collect_until_tagged(&mut self, tag: &str) -> Result<(Vec<RawResponse>, RawResponse), SessionError> {
        let mut untagged = Vec::new();
        loop {
            let resp = self.upstream.read_response().await?;
            match &resp.head.tag {
                ResponseTag::Tagged(t) if t == tag => return Ok((untagged, resp)),
                ResponseTag::Tagged(other) => {
                    return Err(SessionError::Protocol(format!(
                        "expected tagged reply {tag}, got stray tag {other}"
                    )))
                }
                ResponseTag::Untagged | ResponseTag::Continuation => untagged.push(resp),
            }
        }
    }
}

/// Whether an untagged response's first line is `* <n> FETCH ...` —
/// `ResponseHead::keyword` only captures the word right after `*`, which
/// for a numbered response is the sequence number, not `FETCH`.
fn is_untagged_fetch(bytes: &[u8]) -> bool {
    let line_end = bytes.windows(2).position(|w| w == b"\r\n").unwrap_or(bytes.len());
    let line = String::from_utf8_lossy(&bytes[..line_end]);
    let mut words = line.split_whitespace();
    words.next() == Some("*") && words.next().is_some() && words.next().map(|w| w.eq_ignore_ascii_case("FETCH")) == Some(true)
}

/// Whether an untagged response's first line is `* <n> EXPUNGE` — same
/// numbered-response caveat as [`is_untagged_fetch`].
fn is_untagged_expunge(bytes: &[u8]) -> bool {
    let line_end = bytes.windows(2).position(|w| w == b"\r\n").unwrap_or(bytes.len());
    let line = String::from_utf8_lossy(&bytes[..line_end]);
    let mut words = line.split_whitespace();
    words.next() == Some("*") && words.next().is_some() && words.next().map(|w| w.eq_ignore_ascii_case("EXPUNGE")) == Some(true)
}

/// Strips any bracketed response code in `UNSUPPORTED_CODES` from a
/// tagged reply's first line, leaving everything else (including other
/// codes) untouched.
fn strip_unsupported_codes(line: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(line);
    let Some(open) = text.find('[') else {
        return line.to_vec();
    };
    let Some(close_rel) = text[open..].find(']') else {
        return line.to_vec();
    };
    let close = open + close_rel;
    let code = text[open + 1..close].split_whitespace().next().unwrap_or("");
    if UNSUPPORTED_CODES.contains(&code.to_ascii_uppercase().as_str()) {
        let mut out = text[..open].trim_end().to_string();
        out.push(' ');
        out.push_str(text[close + 1..].trim_start());
        out.into_bytes()
    } else {
        line.to_vec()
    }
}

/// Extracts `(uidvalidity, uid)` from an `APPENDUID` response code.
fn parse_appenduid(line: &[u8]) -> Option<(u32, u32)> {
    let text = String::from_utf8_lossy(line);
    let idx = text.find("APPENDUID")?;
    let mut words = text[idx + "APPENDUID".len()..].split_whitespace();
    let uidvalidity = words.next()?.parse().ok()?;
    let uid = words.next()?.parse().ok()?;
    Some((uidvalidity, uid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use chrono::DateTime;
    use rand::{rngs::StdRng, SeedableRng};

    use crate::connection::{Connection, DuplexConnection, Security};
    use crate::mailcache::{Freeze, Hold, ProcessedMsg};
    use crate::wire::raw::{self, RawFrame};

    #[test]
    fn strips_appenduid_code() {
        let line = b"sc1 OK [APPENDUID 7 42] done\r\n";
        let out = strip_unsupported_codes(line);
        assert_eq!(&out, b"sc1 OK done\r\n");
    }

    #[test]
    fn keeps_supported_code() {
        let line = b"sc1 OK [READ-WRITE] done\r\n";
        assert_eq!(strip_unsupported_codes(line), line);
    }

    #[test]
    fn parses_appenduid_numbers() {
        let line = b"sc1 OK [APPENDUID 7 42] done\r\n";
        assert_eq!(parse_appenduid(line), Some((7, 42)));
    }

    #[test]
    fn missing_appenduid_is_none() {
        assert_eq!(parse_appenduid(b"sc1 OK done\r\n"), None);
    }

    /// An in-memory [`MailCache`] double recording every call a test cares
    /// about, freeze/hold backed by a real per-mailbox semaphore so the
    /// serialization contract is exercised for real.
    #[derive(Default)]
    struct FakeCache {
        uidvalidity: Mutex<HashMap<String, u32>>,
        landed: Mutex<Vec<(String, u32, Vec<u8>)>>,
        deleted: Mutex<Vec<String>>,
        renamed: Mutex<Vec<(String, String)>>,
        synced: Mutex<Vec<String>>,
        locks: Mutex<HashMap<String, Arc<tokio::sync::Semaphore>>>,
        processed: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakeCache {
        async fn lock_for(&self, mailbox: &str) -> Arc<tokio::sync::Semaphore> {
            let mut locks = self.locks.lock().await;
            locks
                .entry(mailbox.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(1)))
                .clone()
        }
    }

    #[async_trait]
    impl MailCache for FakeCache {
        async fn freeze_new(&self, mailbox: &str) -> Result<Freeze, CacheError> {
            let sem = self.lock_for(mailbox).await;
            let permit = sem.acquire_owned().await.expect("semaphore never closed");
            Ok(Freeze {
                mailbox: mailbox.to_string(),
                _permit: permit,
            })
        }

        async fn freeze_free(&self, _freeze: Freeze) {}

        async fn delete(&self, freeze: &Freeze) -> Result<(), CacheError> {
            self.deleted.lock().await.push(freeze.mailbox.clone());
            Ok(())
        }

        async fn rename(&self, src: &Freeze, dst_mailbox: &str) -> Result<(), CacheError> {
            self.renamed.lock().await.push((src.mailbox.clone(), dst_mailbox.to_string()));
            Ok(())
        }

        async fn hold_new(&self, mailbox: &str) -> Result<Hold, CacheError> {
            let sem = self.lock_for(mailbox).await;
            let permit = sem.acquire_owned().await.expect("semaphore never closed");
            Ok(Hold {
                mailbox: mailbox.to_string(),
                _permit: permit,
            })
        }

        async fn hold_release(&self, _hold: Hold) {}

        async fn uidvalidity(&self, mailbox: &str) -> Option<u32> {
            self.uidvalidity.lock().await.get(mailbox).copied()
        }

        async fn land_appended(
            &self,
            mailbox: &str,
            uid: u32,
            content: &[u8],
            _flags: &[String],
            _intdate: DateTime<Utc>,
        ) -> Result<(), CacheError> {
            self.landed.lock().await.push((mailbox.to_string(), uid, content.to_vec()));
            Ok(())
        }

        async fn add_local(&self, _mailbox: &str, _content: &[u8], _intdate: DateTime<Utc>) -> Result<(), CacheError> {
            Ok(())
        }

        async fn process_status_resp(&self, _mailbox: &str, attrs: StatusAttrs) -> StatusAttrs {
            // Proves the rewrite actually flows through the cache rather
            // than being a pass-through: bump UNSEEN by one.
            let mut attrs = attrs;
            attrs.unseen = Some(attrs.unseen.unwrap_or(0) + 1);
            attrs
        }

        fn new_tmp_id(&self) -> u64 {
            1
        }

        async fn process_msg(&self, mailbox: &str, content: &[u8]) -> ProcessedMsg {
            self.processed.lock().await.push((mailbox.to_string(), content.to_vec()));
            if content == b"FOR-SOMEONE-ELSE" {
                return ProcessedMsg {
                    bytes: Vec::new(),
                    not_for_me: true,
                };
            }
            // Proves the hook actually ran rather than being bypassed: tag
            // the bytes so a test can tell relayed-verbatim from relayed-
            // through-the-hook.
            let mut bytes = b"DECRYPTED:".to_vec();
            bytes.extend_from_slice(content);
            ProcessedMsg { bytes, not_for_me: false }
        }

        async fn mark_mailbox_synced(&self, mailbox: &str) {
            self.synced.lock().await.push(mailbox.to_string());
        }
    }

    /// Drives a [`Session`] over an in-memory duplex pair on both sides:
    /// `down` plays the real IMAP client, `up` plays the real upstream
    /// server the session relays to.
    struct Harness {
        down: DuplexConnection,
        up: DuplexConnection,
        down_buf: Vec<u8>,
        up_buf: Vec<u8>,
    }

    impl Harness {
        async fn new(cache: Arc<dyn MailCache>, keydir: Arc<Mutex<KeyDir>>) -> (Self, tokio::task::JoinHandle<Result<(), SessionError>>) {
            let (down_a, down_b) = DuplexConnection::pair(1 << 16, Security::Insecure);
            let (up_a, up_b) = DuplexConnection::pair(1 << 16, Security::Insecure);
            let pair = ConnectedPair {
                downstream: ImapServer::new(Box::new(down_a)),
                upstream: ImapClient::new(Box::new(up_a)),
            };
            let session = Session::new(pair, keydir, cache);
            let handle = tokio::spawn(session.run());

            let mut harness = Harness {
                down: down_b,
                up: up_b,
                down_buf: Vec::new(),
                up_buf: Vec::new(),
            };
            let greeting = harness.read_down_line().await;
            assert!(greeting.starts_with("* OK"), "unexpected greeting: {greeting}");
            (harness, handle)
        }

        async fn send_down(&mut self, line: &str) {
            self.down.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_down_line(&mut self) -> String {
            String::from_utf8(Self::read_frame(&mut self.down, &mut self.down_buf).await).unwrap()
        }

        /// Sends a full `APPEND` command whose message argument is a
        /// literal, handling the `+ OK` continuation round-trip.
        async fn send_down_append(&mut self, tag: &str, mailbox: &str, body: &[u8]) {
            self.send_down(&format!("{tag} APPEND {mailbox} {{{}}}\r\n", body.len())).await;
            let ack = self.read_down_line().await;
            assert!(ack.starts_with('+'), "expected literal continuation, got {ack}");
            self.down.write_all(body).await.unwrap();
            self.down.write_all(b"\r\n").await.unwrap();
        }

        async fn read_up_frame(&mut self) -> Vec<u8> {
            Self::read_frame(&mut self.up, &mut self.up_buf).await
        }

        async fn send_up(&mut self, line: &str) {
            self.up.write_all(line.as_bytes()).await.unwrap();
        }

        async fn read_frame(conn: &mut DuplexConnection, buf: &mut Vec<u8>) -> Vec<u8> {
            loop {
                if let RawFrame::Complete(n) = raw::read_response_frame(buf) {
                    return buf.drain(..n).collect();
                }
                let mut chunk = [0u8; 8192];
                let n = conn.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed mid-frame");
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    fn test_keydir(root: &std::path::Path) -> Arc<Mutex<KeyDir>> {
        let mut rng = StdRng::seed_from_u64(100);
        Arc::new(Mutex::new(KeyDir::open(root, &mut rng).unwrap()))
    }

    #[tokio::test]
    async fn append_lands_locally_when_uidvalidity_matches() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        cache.uidvalidity.lock().await.insert("INBOX".to_string(), 7);
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down_append("A1", "INBOX", b"hello").await;
        h.read_up_frame().await; // the re-encrypted APPEND the session relays upstream
        h.send_up("sc1 OK [APPENDUID 7 42] APPEND completed\r\n").await;

        let reply = h.read_down_line().await;
        assert_eq!(reply, "A1 OK APPEND completed\r\n");
        let landed = cache.landed.lock().await;
        assert_eq!(landed.len(), 1);
        assert_eq!(landed[0].0, "INBOX");
        assert_eq!(landed[0].1, 42);
        assert_eq!(landed[0].2, b"hello");
        drop(landed);

        h.send_down("A2 LOGOUT\r\n").await;
        h.read_down_line().await;
        h.read_down_line().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn append_skips_landing_on_uidvalidity_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        // No local UIDVALIDITY recorded for INBOX yet.
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down_append("A1", "INBOX", b"hello").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [APPENDUID 7 1] APPEND completed\r\n").await;

        let reply = h.read_down_line().await;
        assert_eq!(reply, "A1 OK APPEND completed\r\n");
        assert!(cache.landed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn status_rewrite_flows_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 STATUS INBOX (MESSAGES RECENT)\r\n").await;
        h.read_up_frame().await;
        h.send_up("* STATUS INBOX (MESSAGES 5 RECENT 0)\r\n").await;
        h.send_up("sc1 OK STATUS completed\r\n").await;

        let status_line = h.read_down_line().await;
        assert_eq!(status_line, "* STATUS INBOX (MESSAGES 5 RECENT 0 UNSEEN 1)\r\n");
        let final_line = h.read_down_line().await;
        assert_eq!(final_line, "A1 OK STATUS completed\r\n");
    }

    #[tokio::test]
    async fn delete_is_rejected_locally_when_mailbox_selected() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        let select_reply = h.read_down_line().await;
        assert_eq!(select_reply, "A1 OK [READ-WRITE] SELECT completed\r\n");
        assert_eq!(cache.synced.lock().await.as_slice(), ["INBOX".to_string()]);

        h.send_down("A2 DELETE INBOX\r\n").await;
        let reply = h.read_down_line().await;
        assert_eq!(reply, "A2 NO unable to DELETE what is SELECTed\r\n");
        assert!(cache.deleted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn delete_relays_and_updates_cache_on_ok() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 DELETE Foo\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK DELETE completed\r\n").await;

        let reply = h.read_down_line().await;
        assert_eq!(reply, "A1 OK DELETE completed\r\n");
        assert_eq!(cache.deleted.lock().await.as_slice(), ["Foo".to_string()]);
    }

    #[tokio::test]
    async fn generic_passthru_drops_flags_and_recent_chatter() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 CREATE Foo\r\n").await;
        h.read_up_frame().await;
        h.send_up("* FLAGS (\\Answered)\r\n").await;
        h.send_up("sc1 OK CREATE completed\r\n").await;

        // FLAGS chatter is dropped; the very next downstream frame is the
        // final tagged reply, not the untagged line.
        let reply = h.read_down_line().await;
        assert_eq!(reply, "A1 OK CREATE completed\r\n");
    }

    #[tokio::test]
    async fn selected_passthru_rejected_without_a_selection() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 CHECK\r\n").await;
        let reply = h.read_down_line().await;
        assert_eq!(reply, "A1 BAD no mailbox selected\r\n");
    }

    #[tokio::test]
    async fn logout_sends_bye_then_ok_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache: Arc<dyn MailCache> = Arc::new(FakeCache::default());

        let (mut h, handle) = Harness::new(cache, keydir).await;

        h.send_down("A1 LOGOUT\r\n").await;
        let bye = h.read_down_line().await;
        assert_eq!(bye, "* BYE goodbye, my love...\r\n");
        let ok = h.read_down_line().await;
        assert_eq!(ok, "A1 OK I'm gonna be strong, I can make it through this\r\n");
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn logout_with_a_selection_sends_unselect_not_close() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 LOGOUT\r\n").await;
        let disconnect_cmd = h.read_up_frame().await;
        assert_eq!(disconnect_cmd, b"sc2 UNSELECT\r\n");
        h.send_up("sc2 OK UNSELECT completed\r\n").await;

        h.read_down_line().await; // BYE
        h.read_down_line().await; // tagged OK
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn switching_the_selected_mailbox_sends_unselect_not_close() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 SELECT Archive\r\n").await;
        let disconnect_cmd = h.read_up_frame().await;
        assert_eq!(disconnect_cmd, b"sc2 UNSELECT\r\n");
        h.send_up("sc2 OK UNSELECT completed\r\n").await;

        let select_cmd = h.read_up_frame().await;
        assert_eq!(select_cmd, b"sc3 SELECT Archive\r\n");
        h.send_up("sc3 OK [READ-WRITE] SELECT completed\r\n").await;

        let reply = h.read_down_line().await;
        assert_eq!(reply, "A2 OK [READ-WRITE] SELECT completed\r\n");
    }

    #[tokio::test]
    async fn close_still_sends_upstream_close() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 CLOSE\r\n").await;
        let disconnect_cmd = h.read_up_frame().await;
        assert_eq!(disconnect_cmd, b"sc2 CLOSE\r\n");
        h.send_up("sc2 OK CLOSE completed\r\n").await;

        let reply = h.read_down_line().await;
        assert_eq!(reply, "A2 OK get offa my lawn!\r\n");
    }

    #[tokio::test]
    async fn capability_emits_untagged_line_after_login() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 CAPABILITY\r\n").await;
        let capa_line = h.read_down_line().await;
        assert_eq!(capa_line, "* CAPABILITY IMAP4rev1 IDLE\r\n");
        let ok_line = h.read_down_line().await;
        assert_eq!(ok_line, "A1 OK completed\r\n");
    }

    #[tokio::test]
    async fn noop_and_capability_flush_pending_updates_when_selected() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 NOOP\r\n").await;
        let noop_cmd = h.read_up_frame().await;
        assert_eq!(noop_cmd, b"sc2 NOOP\r\n");
        h.send_up("* 3 EXISTS\r\n").await;
        h.send_up("sc2 OK NOOP completed\r\n").await;

        let exists_line = h.read_down_line().await;
        assert_eq!(exists_line, "* 3 EXISTS\r\n");
        let ok_line = h.read_down_line().await;
        assert_eq!(ok_line, "A2 OK completed\r\n");
    }

    #[tokio::test]
    async fn noop_is_a_local_reply_with_nothing_selected() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 NOOP\r\n").await;
        let ok_line = h.read_down_line().await;
        assert_eq!(ok_line, "A1 OK completed\r\n");
    }

    #[tokio::test]
    async fn fetch_relay_decrypts_the_literal_body() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 FETCH 1 BODY[]\r\n").await;
        h.read_up_frame().await;
        h.send_up("* 1 FETCH (BODY[] {5}\r\nhello FLAGS (\\Seen))\r\n").await;
        h.send_up("sc2 OK FETCH completed\r\n").await;

        let fetch_line = h.read_down_line().await;
        assert_eq!(fetch_line, "* 1 FETCH (BODY[] {15}\r\nDECRYPTED:hello FLAGS (\\Seen))\r\n");
        let final_line = h.read_down_line().await;
        assert_eq!(final_line, "A2 OK FETCH completed\r\n");

        let processed = cache.processed.lock().await;
        assert_eq!(processed.as_slice(), [("INBOX".to_string(), b"hello".to_vec())]);
    }

    #[tokio::test]
    async fn fetch_relay_empties_a_body_not_for_this_user() {
        let dir = tempfile::tempdir().unwrap();
        let keydir = test_keydir(dir.path());
        let cache = Arc::new(FakeCache::default());
        let cache_dyn: Arc<dyn MailCache> = cache.clone();

        let (mut h, _handle) = Harness::new(cache_dyn, keydir).await;

        h.send_down("A1 SELECT INBOX\r\n").await;
        h.read_up_frame().await;
        h.send_up("sc1 OK [READ-WRITE] SELECT completed\r\n").await;
        h.read_down_line().await;

        h.send_down("A2 FETCH 1 BODY[]\r\n").await;
        h.read_up_frame().await;
        h.send_up("* 1 FETCH (BODY[] {17}\r\nFOR-SOMEONE-ELSE FLAGS (\\Seen))\r\n").await;
        h.send_up("sc2 OK FETCH completed\r\n").await;

        let fetch_line = h.read_down_line().await;
        assert_eq!(fetch_line, "* 1 FETCH (BODY[] {0}\r\n FLAGS (\\Seen))\r\n");
    }
}
