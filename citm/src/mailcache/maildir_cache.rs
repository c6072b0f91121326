//! [`MailCache`] backed by the workspace's `maildirpp` crate: one Maildir
//! directory per mailbox under `<root>/<user>/mail/`, freeze/hold
//! serialized by a per-mailbox `tokio::sync::Semaphore`, and the
//! decryption hook from `spec.md` §4.8 wired to
//! [`crate::keydir::crypto`] and [`crate::inject`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maildirpp::Maildir;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use super::{CacheError, Freeze, Hold, MailCache, ProcessedMsg, StatusAttrs};
use crate::inject;
use crate::keydir::{crypto, Fingerprint, KeyDir};

const UIDVALIDITY_FILE: &str = "UIDVALIDITY";

struct MailboxState {
    maildir: Maildir,
    lock: Arc<Semaphore>,
}

/// A `maildirpp`-backed mail cache for one user. `keydir` is shared with
/// `PreUser`/`Session` (same `Arc<Mutex<_>>` the registry hands out for
/// this user) since the decryption hook needs `mykey` and the
/// `FprWatcher` alert policy.
pub struct MaildirCache {
    mail_root: PathBuf,
    keydir: Arc<Mutex<KeyDir>>,
    mailboxes: Mutex<HashMap<String, MailboxState>>,
    next_tmp_id: AtomicU64,
}

impl MaildirCache {
    pub fn new(mail_root: impl Into<PathBuf>, keydir: Arc<Mutex<KeyDir>>) -> Self {
        Self {
            mail_root: mail_root.into(),
            keydir,
            mailboxes: Mutex::new(HashMap::new()),
            next_tmp_id: AtomicU64::new(1),
        }
    }

    fn path_for(&self, mailbox: &str) -> PathBuf {
        self.mail_root.join(sanitize(mailbox))
    }

    async fn state_for(&self, mailbox: &str) -> Result<Arc<Semaphore>, CacheError> {
        let mut mailboxes = self.mailboxes.lock().await;
        if let Some(state) = mailboxes.get(mailbox) {
            return Ok(state.lock.clone());
        }
        let path = self.path_for(mailbox);
        let maildir = Maildir::from(path);
        maildir.create_dirs().map_err(CacheError::Io)?;
        let lock = Arc::new(Semaphore::new(1));
        mailboxes.insert(
            mailbox.to_string(),
            MailboxState {
                maildir,
                lock: lock.clone(),
            },
        );
        Ok(lock)
    }

    async fn maildir_for(&self, mailbox: &str) -> Result<Maildir, CacheError> {
        self.state_for(mailbox).await?;
        let mailboxes = self.mailboxes.lock().await;
        Ok(mailboxes
            .get(mailbox)
            .expect("state_for just inserted this entry")
            .maildir
            .clone_handle())
    }
}

/// `maildirpp::Maildir` doesn't derive `Clone`, but it's a thin wrapper
/// around a `PathBuf`; reconstructing from the same path is equivalent.
trait CloneHandle {
    fn clone_handle(&self) -> Maildir;
}

impl CloneHandle for Maildir {
    fn clone_handle(&self) -> Maildir {
        Maildir::from(self.path().to_path_buf())
    }
}

fn sanitize(mailbox: &str) -> String {
    mailbox.replace('/', "_")
}

#[async_trait]
impl MailCache for MaildirCache {
    async fn freeze_new(&self, mailbox: &str) -> Result<Freeze, CacheError> {
        let sem = self.state_for(mailbox).await?;
        let permit = sem.acquire_owned().await.expect("semaphore never closed");
        Ok(Freeze {
            mailbox: mailbox.to_string(),
            _permit: permit,
        })
    }

    async fn freeze_free(&self, _freeze: Freeze) {}

    async fn delete(&self, freeze: &Freeze) -> Result<(), CacheError> {
        let path = self.path_for(&freeze.mailbox);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.mailboxes.lock().await.remove(&freeze.mailbox);
        Ok(())
    }

    async fn rename(&self, src: &Freeze, dst_mailbox: &str) -> Result<(), CacheError> {
        let src_path = self.path_for(&src.mailbox);
        let dst_path = self.path_for(dst_mailbox);
        if src_path.exists() {
            std::fs::rename(&src_path, &dst_path)?;
        }
        let mut mailboxes = self.mailboxes.lock().await;
        mailboxes.remove(&src.mailbox);
        Ok(())
    }

    async fn hold_new(&self, mailbox: &str) -> Result<Hold, CacheError> {
        let sem = self.state_for(mailbox).await?;
        let permit = sem.acquire_owned().await.expect("semaphore never closed");
        Ok(Hold {
            mailbox: mailbox.to_string(),
            _permit: permit,
        })
    }

    async fn hold_release(&self, _hold: Hold) {}

    async fn uidvalidity(&self, mailbox: &str) -> Option<u32> {
        let path = self.path_for(mailbox).join(UIDVALIDITY_FILE);
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    async fn land_appended(
        &self,
        mailbox: &str,
        _uid: u32,
        content: &[u8],
        flags: &[String],
        _intdate: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let maildir = self.maildir_for(mailbox).await?;
        let flag_str = maildirpp_flags(flags);
        maildir.store_cur_with_flags(content, &flag_str)?;
        Ok(())
    }

    async fn add_local(
        &self,
        mailbox: &str,
        content: &[u8],
        _intdate: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let maildir = self.maildir_for(mailbox).await?;
        maildir.store_new(content)?;
        Ok(())
    }

    fn new_tmp_id(&self) -> u64 {
        self.next_tmp_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn process_msg(&self, mailbox: &str, content: &[u8]) -> ProcessedMsg {
        let now = Utc::now();

        if content.starts_with(crypto::BEGIN_MARKER.as_bytes()) {
            let armored = String::from_utf8_lossy(content);
            let mut keydir = self.keydir.lock().await;
            match crypto::decrypt_with(&armored, keydir.mykey()) {
                Ok((plaintext, recipients)) => {
                    for fpr in recipients {
                        self.alert_and_record(&mut keydir, mailbox, fpr, now).await;
                    }
                    ProcessedMsg {
                        bytes: plaintext,
                        not_for_me: false,
                    }
                }
                Err(crypto::CryptoError::NotForMe) => ProcessedMsg {
                    bytes: Vec::new(),
                    not_for_me: true,
                },
                Err(err) => {
                    warn!(%err, mailbox, "failed to decrypt message");
                    let mangled = inject::decryption_failure_message(content, now);
                    ProcessedMsg {
                        bytes: mangled,
                        not_for_me: false,
                    }
                }
            }
        } else {
            ProcessedMsg {
                bytes: inject::mangle_unencrypted(content),
                not_for_me: false,
            }
        }
    }

    async fn mark_mailbox_synced(&self, mailbox: &str) {
        let mut keydir = self.keydir.lock().await;
        if let Err(err) = keydir.fpr_watcher.mark_mailbox_synced(mailbox) {
            warn!(%err, mailbox, "failed to persist mailbox-synced state");
        }
    }
}

impl MaildirCache {
    async fn alert_and_record(
        &self,
        keydir: &mut KeyDir,
        mailbox: &str,
        fpr: Fingerprint,
        now: DateTime<Utc>,
    ) {
        if keydir.fpr_watcher.should_alert_on_decrypt(&fpr, mailbox) {
            let alert = inject::new_device_message(fpr, now);
            if let Err(err) = self.add_local("INBOX", &alert, now).await {
                warn!(%err, "failed to inject new-device alert");
            }
        }
        if let Err(err) = keydir.fpr_watcher.record_fpr(fpr) {
            warn!(%err, "failed to persist observed fingerprint");
        }
    }
}

fn maildirpp_flags(flags: &[String]) -> String {
    // maildirpp (and maildir's Dovecot-style flag encoding) takes a
    // pre-sorted, deduplicated string of single-letter flags.
    let mut letters: Vec<char> = flags
        .iter()
        .filter_map(|f| match f.to_ascii_uppercase().as_str() {
            "\\SEEN" => Some('S'),
            "\\ANSWERED" => Some('R'),
            "\\FLAGGED" => Some('F'),
            "\\DELETED" => Some('T'),
            "\\DRAFT" => Some('D'),
            _ => None,
        })
        .collect();
    letters.sort_unstable();
    letters.dedup();
    letters.into_iter().collect()
}
