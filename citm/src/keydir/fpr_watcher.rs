//! Fingerprint/synced-mailbox persistence and new-device alert policy.
//!
//! A direct translation of `examples/original_source/libcitm/fpr_watcher.c`:
//! two sorted sets (`fprs_seen`, `mailboxes_synced`) persisted as
//! line-oriented files via write-temp-then-rename, plus an
//! `xkeysync_completed` marker file whose mere existence is the flag
//! (`spec.md` §4.9). `BTreeSet` stands in for the original's balanced
//! tree (`jsw_atree_t`).

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use tracing::warn;

use super::keypair::Fingerprint;

const FPRS_FILE: &str = "fprs_seen";
const FPRS_TMP: &str = "fprs_seen.tmp";
const SYNCED_FILE: &str = "mailboxes_synced";
const SYNCED_TMP: &str = "mailboxes_synced.tmp";
const XKEYSYNC_MARKER: &str = "xkeysync_completed";

/// Tracks which device fingerprints this user's client has already seen,
/// and which mailboxes have completed at least one full sync, so it can
/// tell a first-ever `XKEYSYNC` (load every key quietly) apart from a
/// fingerprint showing up for the first time thereafter (alert).
pub struct FprWatcher {
    dir: PathBuf,
    fprs: BTreeSet<Fingerprint>,
    synced: BTreeSet<String>,
    xkeysync_completed: bool,
}

impl FprWatcher {
    /// Loads persisted state from `dir`, creating it if necessary. A
    /// corrupt persistence file is dropped with a warning rather than
    /// failing initialization (`spec.md` §4.9).
    pub fn load(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let fprs = match std::fs::read_to_string(dir.join(FPRS_FILE)) {
            Ok(raw) => parse_fprs(&raw).unwrap_or_else(|err| {
                warn!(%err, "dropping corrupt fprs_seen file");
                BTreeSet::new()
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => return Err(err),
        };

        let synced = match std::fs::read_to_string(dir.join(SYNCED_FILE)) {
            Ok(raw) => Some(parse_synced(&raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        }
        .unwrap_or_default();

        let xkeysync_completed = dir.join(XKEYSYNC_MARKER).exists();

        Ok(Self {
            dir,
            fprs,
            synced,
            xkeysync_completed,
        })
    }

    pub fn xkeysync_completed(&self) -> bool {
        self.xkeysync_completed
    }

    /// Creates the marker file (idempotent).
    pub fn mark_xkeysync_completed(&mut self) -> io::Result<()> {
        if self.xkeysync_completed {
            return Ok(());
        }
        std::fs::write(self.dir.join(XKEYSYNC_MARKER), b"")?;
        self.xkeysync_completed = true;
        Ok(())
    }

    pub fn mark_mailbox_synced(&mut self, mailbox: &str) -> io::Result<()> {
        if self.synced.contains(mailbox) {
            return Ok(());
        }
        self.synced.insert(mailbox.to_string());
        self.save_synced()
    }

    pub fn record_fpr(&mut self, fpr: Fingerprint) -> io::Result<()> {
        if self.fprs.contains(&fpr) {
            return Ok(());
        }
        self.fprs.insert(fpr);
        self.save_fprs()
    }

    pub fn has_seen(&self, fpr: &Fingerprint) -> bool {
        self.fprs.contains(fpr)
    }

    /// A fingerprint newly observed via `XKEYSYNC CREATED` should trigger
    /// a "new device detected" injection iff we'd completed at least one
    /// prior `XKEYSYNC` round and have not seen this fingerprint before.
    pub fn should_alert_on_new_key(&self, fpr: &Fingerprint) -> bool {
        !self.has_seen(fpr) && self.xkeysync_completed
    }

    /// A fingerprint observed while decrypting an inbound message should
    /// trigger an alert iff we haven't seen it, *and* this mailbox has
    /// already completed a sync once (so we don't alert retroactively on
    /// a user's very first full download of their own mail).
    pub fn should_alert_on_decrypt(&self, fpr: &Fingerprint, mailbox: &str) -> bool {
        !self.has_seen(fpr) && self.synced.contains(mailbox)
    }

    fn save_fprs(&self) -> io::Result<()> {
        let mut out = String::new();
        for fpr in &self.fprs {
            out.push_str(&fpr.to_hex());
            out.push('\n');
        }
        atomic_write(&self.dir, FPRS_TMP, FPRS_FILE, out.as_bytes())
    }

    fn save_synced(&self) -> io::Result<()> {
        let mut out = String::new();
        for mailbox in &self.synced {
            out.push_str(&escape_mailbox(mailbox));
            out.push('\n');
        }
        atomic_write(&self.dir, SYNCED_TMP, SYNCED_FILE, out.as_bytes())
    }
}

/// Writes `contents` to `dir/tmp_name` then renames it over `dir/name`,
/// the write-temp-then-rename pattern used throughout the original for
/// crash-safe persistence.
pub fn atomic_write(dir: &Path, tmp_name: &str, name: &str, contents: &[u8]) -> io::Result<()> {
    let tmp_path = dir.join(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, dir.join(name))
}

fn parse_fprs(raw: &str) -> Result<BTreeSet<Fingerprint>, String> {
    raw.lines()
        .filter(|line| !line.is_empty())
        .map(|line| Fingerprint::from_hex(line).map_err(|_| format!("bad fingerprint line: {line}")))
        .collect()
}

fn parse_synced(raw: &str) -> BTreeSet<String> {
    raw.lines().filter(|line| !line.is_empty()).map(unescape_mailbox).collect()
}

/// `\` -> `\\`, literal newline -> `\n` (the two characters, not a byte).
fn escape_mailbox(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_mailbox(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('\\') => out.push('\\'),
                Some('n') => out.push('\n'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips() {
        let name = "Inbox\\Sub\nfolder";
        assert_eq!(unescape_mailbox(&escape_mailbox(name)), name);
    }

    #[test]
    fn fresh_watcher_has_no_state() {
        let dir = tempfile::tempdir().unwrap();
        let w = FprWatcher::load(dir.path()).unwrap();
        assert!(!w.xkeysync_completed());
    }

    #[test]
    fn record_fpr_then_reload_persists() {
        let dir = tempfile::tempdir().unwrap();
        let fpr = Fingerprint([3u8; 32]);
        {
            let mut w = FprWatcher::load(dir.path()).unwrap();
            w.record_fpr(fpr).unwrap();
        }
        let w = FprWatcher::load(dir.path()).unwrap();
        assert!(w.has_seen(&fpr));
    }

    #[test]
    fn mark_xkeysync_completed_persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut w = FprWatcher::load(dir.path()).unwrap();
            assert!(!w.xkeysync_completed());
            w.mark_xkeysync_completed().unwrap();
        }
        let w = FprWatcher::load(dir.path()).unwrap();
        assert!(w.xkeysync_completed());
    }

    #[test]
    fn new_key_alerts_only_after_first_xkeysync() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FprWatcher::load(dir.path()).unwrap();
        let fpr = Fingerprint([9u8; 32]);
        assert!(!w.should_alert_on_new_key(&fpr));
        w.mark_xkeysync_completed().unwrap();
        assert!(w.should_alert_on_new_key(&fpr));
        w.record_fpr(fpr).unwrap();
        assert!(!w.should_alert_on_new_key(&fpr));
    }

    #[test]
    fn decrypt_alert_requires_prior_mailbox_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FprWatcher::load(dir.path()).unwrap();
        let fpr = Fingerprint([5u8; 32]);
        assert!(!w.should_alert_on_decrypt(&fpr, "INBOX"));
        w.mark_mailbox_synced("INBOX").unwrap();
        assert!(w.should_alert_on_decrypt(&fpr, "INBOX"));
    }

    #[test]
    fn corrupt_fprs_file_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FPRS_FILE), b"not-hex-data\n").unwrap();
        let w = FprWatcher::load(dir.path()).unwrap();
        assert!(w.fprs.is_empty());
    }
}
