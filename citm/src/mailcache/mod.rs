//! The mail-cache collaborator interface (`spec.md` §6) and its
//! reference implementation backed by the workspace's `maildirpp` crate.
//!
//! `spec.md` §1 scopes the on-disk maildir engine itself out ("only the
//! interface the decryption hook and APPEND path need is specified"),
//! confirmed by `examples/original_source/_INDEX.md` filtering almost
//! all of `libimaildir/` out of the retrieval pack. What's implemented
//! here is exactly that interface: freeze/hold serialization, STATUS
//! attribute rewriting, the decryption hook, and local-add — not a full
//! CONDSTORE/QRESYNC sync engine.

pub mod maildir_cache;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use maildir_cache::MaildirCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Maildir(#[from] maildirpp::Error),
    #[error("mailbox not found: {0}")]
    NoSuchMailbox(String),
    #[error("mailbox is currently frozen for a mutating passthru")]
    Frozen,
}

/// The known IMAP STATUS attributes the session rewrites before relaying
/// a `STATUS` response downstream (`spec.md` §4.6).
#[derive(Debug, Clone, Default)]
pub struct StatusAttrs {
    pub messages: Option<u32>,
    pub recent: Option<u32>,
    pub uidnext: Option<u32>,
    pub uidvalidity: Option<u32>,
    pub unseen: Option<u32>,
}

/// An exclusive lease on a mailbox directory, held across a mutating
/// passthru (`DELETE`/`RENAME`) so concurrent cache activity can't race
/// it. Dropping without calling [`MailCache::freeze_free`] just leaks the
/// permit for the lifetime of the process — callers always release it
/// explicitly in a `finally`-style path.
pub struct Freeze {
    pub(crate) mailbox: String,
    pub(crate) _permit: tokio::sync::OwnedSemaphorePermit,
}

/// A scoped lease on a mailbox taken across an `APPEND` (`spec.md` §4.7),
/// distinct from [`Freeze`] only in name — both serialize against the
/// same per-mailbox semaphore.
pub struct Hold {
    pub(crate) mailbox: String,
    pub(crate) _permit: tokio::sync::OwnedSemaphorePermit,
}

/// The outcome of running the decryption hook over one inbound message
/// body (`spec.md` §4.8).
pub struct ProcessedMsg {
    pub bytes: Vec<u8>,
    pub not_for_me: bool,
}

/// The mail-cache collaborator interface consumed by `PreUser` and
/// `Session` (`spec.md` §6).
#[async_trait]
pub trait MailCache: Send + Sync {
    /// Takes out a freeze on `mailbox` ahead of a mutating passthru.
    async fn freeze_new(&self, mailbox: &str) -> Result<Freeze, CacheError>;
    async fn freeze_free(&self, freeze: Freeze);

    /// Deletes a mailbox's local cache directory (called after the
    /// upstream `DELETE` succeeds, while still holding its freeze).
    async fn delete(&self, freeze: &Freeze) -> Result<(), CacheError>;

    /// Renames a mailbox's local cache directory atomically (called
    /// after the upstream `RENAME` succeeds).
    async fn rename(&self, src: &Freeze, dst_mailbox: &str) -> Result<(), CacheError>;

    /// Takes out a hold on `mailbox` for the duration of an `APPEND`.
    async fn hold_new(&self, mailbox: &str) -> Result<Hold, CacheError>;
    async fn hold_release(&self, hold: Hold);

    /// The mailbox's currently-known UIDVALIDITY, if the mailbox has ever
    /// been synced locally.
    async fn uidvalidity(&self, mailbox: &str) -> Option<u32>;

    /// Lands a message under `mailbox` at the given UID, attributing the
    /// add to the session's own driver so it will not be resynchronized
    /// (the APPEND landing path, `spec.md` §4.7).
    async fn land_appended(
        &self,
        mailbox: &str,
        uid: u32,
        content: &[u8],
        flags: &[String],
        intdate: DateTime<Utc>,
    ) -> Result<(), CacheError>;

    /// Adds a message to `mailbox` with no particular UID expectation —
    /// used for injected alert messages (`spec.md` §4.5, §4.8).
    async fn add_local(
        &self,
        mailbox: &str,
        content: &[u8],
        intdate: DateTime<Utc>,
    ) -> Result<(), CacheError>;

    /// Rewrites `attrs` to reflect locally-unsynced messages before a
    /// `STATUS` response is relayed downstream (`spec.md` §4.6). The
    /// reference implementation is a pass-through since it performs no
    /// background resync of its own.
    async fn process_status_resp(&self, mailbox: &str, attrs: StatusAttrs) -> StatusAttrs {
        let _ = mailbox;
        attrs
    }

    /// A process-wide monotonic counter for temp-file names.
    fn new_tmp_id(&self) -> u64;

    /// The decryption hook installed on every mailbox (`spec.md` §4.8):
    /// given a message about to be stored, either decrypt it (injecting
    /// a new-device alert first for any newly-seen recipient fingerprint)
    /// or annotate it as plaintext.
    async fn process_msg(&self, mailbox: &str, content: &[u8]) -> ProcessedMsg;

    /// Reports that `mailbox` just completed at least one full sync, for
    /// the `FprWatcher`'s decrypt-alert policy (`spec.md` §4.9).
    async fn mark_mailbox_synced(&self, mailbox: &str);
}
