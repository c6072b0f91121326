//! `PreUser` (`spec.md` §4.5): runs the one-shot `LOGIN` + `XKEYSYNC` +
//! `DONE` protocol for a user's first connection, reconciling the local
//! `KeyDir` against whatever the server's keyring holds, before handing
//! every parked downstream/upstream pair to a `Session`.
//!
//! The protocol only needs to run once, against the first pair's
//! upstream connection (the "xkey-client" of `spec.md` §4.5 is simply
//! that connection, still paired with its own downstream); any further
//! pairs that arrive for the same user while the sync is in flight are
//! parked untouched and handed to `Session` alongside it.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use crate::inject;
use crate::keydir::{Fingerprint, KeyDir, KeyDirError, KeyPair};
use crate::mailcache::{CacheError, MailCache};
use crate::stage::io_pair::ConnectedPair;
use crate::tag::TagGenerator;
use crate::wire::client::ClientError;
use crate::wire::raw::{self, ResponseTag};

#[derive(Debug, Error)]
pub enum PreUserError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    KeyDir(#[from] KeyDirError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("upstream violated the XKEYSYNC protocol: {0}")]
    Protocol(String),
}

/// The outcome of a completed `PreUser`: every parked pair, ready to be
/// adopted by a fresh `Session`, plus the shared `KeyDir` they read.
pub struct PreUserOutcome {
    pub keydir: Arc<Mutex<KeyDir>>,
    pub pairs: Vec<ConnectedPair>,
}

/// Owns the `KeyDir` and the growing list of parked downstream/upstream
/// pairs for one user while the one-shot keyring sync runs. `pairs[0]`'s
/// upstream is the connection the `LOGIN`/`XKEYSYNC` protocol runs on.
pub struct PreUser {
    keydir: Arc<Mutex<KeyDir>>,
    cache: Arc<dyn MailCache>,
    username: String,
    password: String,
    pairs: Vec<ConnectedPair>,
    tags: TagGenerator,
}

impl PreUser {
    pub fn new(
        keydir: Arc<Mutex<KeyDir>>,
        cache: Arc<dyn MailCache>,
        username: String,
        password: String,
        primary: ConnectedPair,
    ) -> Self {
        Self {
            keydir,
            cache,
            username,
            password,
            pairs: vec![primary],
            tags: TagGenerator::preuser(),
        }
    }

    /// Adds another downstream/upstream pair that arrived for this user
    /// while the sync is still running (`spec.md` §4.5).
    pub fn add_pair(&mut self, pair: ConnectedPair) {
        self.pairs.push(pair);
    }

    #[instrument(level = "debug", skip(self), fields(user = %self.username))]
    pub async fn run(mut self) -> Result<PreUserOutcome, PreUserError> {
        let login_tag = self.tags.next();
        let upstream = &mut self.pairs[0].upstream;
        upstream
            .write_raw(format!("{} LOGIN {} {}\r\n", login_tag.as_ref(), self.username, self.password).as_bytes())
            .await?;
        Self::expect_tagged_ok(upstream, login_tag.as_ref()).await?;

        let sync_tag = self.tags.next();
        let fpr_list = self.fingerprint_list().await;
        let upstream = &mut self.pairs[0].upstream;
        upstream
            .write_raw(format!("{} XKEYSYNC {fpr_list}\r\n", sync_tag.as_ref()).as_bytes())
            .await?;

        loop {
            let resp = self.pairs[0].upstream.read_response().await?;
            match &resp.head.tag {
                ResponseTag::Untagged => {
                    let line = first_line(&resp.bytes);
                    let mut words = line.split_whitespace().skip(2);
                    match words.next() {
                        Some("CREATED") => {
                            let pem = raw::literal_payload(&resp.bytes)
                                .ok_or_else(|| PreUserError::Protocol("XKEYSYNC CREATED missing literal".into()))?;
                            let pem = std::str::from_utf8(pem)
                                .map_err(|_| PreUserError::Protocol("XKEYSYNC CREATED PEM is not utf8".into()))?
                                .to_string();
                            self.handle_created(&pem).await?;
                        }
                        Some("DELETED") => {
                            let hex = words
                                .next()
                                .ok_or_else(|| PreUserError::Protocol("XKEYSYNC DELETED missing fingerprint".into()))?
                                .to_string();
                            self.handle_deleted(&hex).await?;
                        }
                        Some("OK") => break,
                        other => {
                            return Err(PreUserError::Protocol(format!(
                                "unexpected XKEYSYNC line: {other:?}"
                            )))
                        }
                    }
                }
                ResponseTag::Continuation => continue,
                ResponseTag::Tagged(_) => {
                    return Err(PreUserError::Protocol(
                        "tagged response arrived before XKEYSYNC terminator".into(),
                    ))
                }
            }
        }

        let upstream = &mut self.pairs[0].upstream;
        upstream.write_raw(b"DONE\r\n").await?;
        Self::expect_tagged_ok(upstream, sync_tag.as_ref()).await?;

        {
            let mut keydir = self.keydir.lock().await;
            keydir.fpr_watcher.mark_xkeysync_completed()?;
        }

        Ok(PreUserOutcome {
            keydir: self.keydir,
            pairs: self.pairs,
        })
    }

    /// The KeyDir's fingerprints, mykey first then peers in lexical hex
    /// order, space-joined (`spec.md` §4.5 step 2).
    async fn fingerprint_list(&self) -> String {
        let keydir = self.keydir.lock().await;
        let mykey = keydir.mykey().fingerprint().to_hex();
        let mut peers: Vec<String> = keydir.peers().iter().map(|kp| kp.fingerprint().to_hex()).collect();
        peers.sort();
        std::iter::once(mykey).chain(peers).collect::<Vec<_>>().join(" ")
    }

    async fn handle_created(&mut self, pem: &str) -> Result<(), PreUserError> {
        let fpr = KeyPair::load_public_pem(pem).map(|kp| kp.fingerprint())?;

        let should_alert = {
            let keydir = self.keydir.lock().await;
            keydir.fpr_watcher.should_alert_on_new_key(&fpr)
        };
        if should_alert {
            let alert = inject::new_device_message(fpr, Utc::now());
            self.cache.add_local("INBOX", &alert, Utc::now()).await?;
        }

        let mut keydir = self.keydir.lock().await;
        keydir.add_peer_key(pem)?;
        keydir.fpr_watcher.record_fpr(fpr)?;
        Ok(())
    }

    async fn handle_deleted(&mut self, hex_fpr: &str) -> Result<(), PreUserError> {
        let fpr = Fingerprint::from_hex(hex_fpr).map_err(KeyDirError::from)?;

        let is_mykey = {
            let keydir = self.keydir.lock().await;
            keydir.mykey().fingerprint() == fpr
        };

        if is_mykey {
            let pem = {
                let keydir = self.keydir.lock().await;
                keydir.mykey().public_to_pem().map_err(KeyDirError::from)?
            };
            let addtag = self.tags.next();
            let upstream = &mut self.pairs[0].upstream;
            upstream
                .write_raw(format!("{} XKEYADD {{{}+}}\r\n", addtag.as_ref(), pem.len()).as_bytes())
                .await?;
            upstream.write_raw(pem.as_bytes()).await?;
            Self::expect_tagged_ok(upstream, addtag.as_ref()).await?;
        } else {
            let mut keydir = self.keydir.lock().await;
            keydir.delete_peer_key(&fpr);
        }
        Ok(())
    }

    async fn expect_tagged_ok(upstream: &mut crate::wire::client::ImapClient, tag: &str) -> Result<(), PreUserError> {
        loop {
            let resp = upstream.read_response().await?;
            match &resp.head.tag {
                ResponseTag::Tagged(t) if t == tag => {
                    return match resp.head.keyword.as_deref() {
                        Some("OK") => Ok(()),
                        other => Err(PreUserError::Protocol(format!("expected {tag} OK, got {other:?}"))),
                    };
                }
                ResponseTag::Untagged | ResponseTag::Continuation => continue,
                ResponseTag::Tagged(other) => {
                    warn!(expected = tag, got = %other, "ignoring stray tagged response while waiting");
                    continue;
                }
            }
        }
    }
}

fn first_line(bytes: &[u8]) -> std::borrow::Cow<'_, str> {
    let end = bytes.windows(2).position(|w| w == b"\r\n").unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
}
