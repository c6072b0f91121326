//! Per-user key directory: this device's own keypair, every peer device's
//! public key, and the [`FprWatcher`] alert policy over them.
//!
//! Grounded on `examples/original_source/libcitm/keydir.c`'s `keydir_t`.
//! Mutation (`add_key`/`delete_key`) happens only from `PreUser`'s
//! `XKEYSYNC` loop or `Session`'s APPEND-encryption path, and only from
//! the single session task owning this `KeyDir` (`spec.md` §5) — so
//! `KeyDir` itself does no internal locking; callers share it behind
//! whatever `Arc<Mutex<_>>` the owning task already holds for the
//! registry entry.

pub mod crypto;
pub mod keypair;

use std::{
    io,
    path::{Path, PathBuf},
};

use rand::RngCore;
use thiserror::Error;
use tracing::warn;

pub use fpr_watcher::FprWatcher;
pub use keypair::{Fingerprint, KeyPair};

mod fpr_watcher;

#[derive(Debug, Error)]
pub enum KeyDirError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Key(#[from] keypair::KeyError),
}

/// Holds this device's own key, every peer's public key, and the
/// fingerprint/sync-state watcher, all backed by `<root>/keys/`.
pub struct KeyDir {
    key_dir: PathBuf,
    mykey: KeyPair,
    peers: Vec<KeyPair>,
    pub fpr_watcher: FprWatcher,
}

impl KeyDir {
    /// Opens (creating if necessary) the key directory under `user_root`.
    /// Generates a fresh device key the first time.
    pub fn open(user_root: impl AsRef<Path>, rng: &mut impl RngCore) -> Result<Self, KeyDirError> {
        let user_root = user_root.as_ref();
        let key_dir = user_root.join("keys");
        std::fs::create_dir_all(&key_dir)?;

        let mykey_path = key_dir.join("mykey.pem");
        let mykey = match std::fs::read_to_string(&mykey_path) {
            Ok(pem) => KeyPair::load_private_pem(&pem)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let kp = KeyPair::generate(rng)?;
                std::fs::write(&mykey_path, kp.private_to_pem()?)?;
                kp
            }
            Err(err) => return Err(err.into()),
        };

        let mut peers = Vec::new();
        for entry in std::fs::read_dir(&key_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path == mykey_path || path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            match std::fs::read_to_string(&path).ok().and_then(|pem| KeyPair::load_public_pem(&pem).ok()) {
                Some(kp) => peers.push(kp),
                None => warn!(path = %path.display(), "dropping unreadable peer key file"),
            }
        }

        let fpr_watcher = FprWatcher::load(user_root.join("fingerprints"))?;

        Ok(Self {
            key_dir,
            mykey,
            peers,
            fpr_watcher,
        })
    }

    pub fn mykey(&self) -> &KeyPair {
        &self.mykey
    }

    pub fn peers(&self) -> &[KeyPair] {
        &self.peers
    }

    /// mykey first, then peers — the fixed ordering `PreUser`'s
    /// `XKEYSYNC` command and the APPEND encryption path both rely on
    /// (`spec.md` §4.5, §4.7).
    pub fn all_keys(&self) -> impl Iterator<Item = &KeyPair> {
        std::iter::once(&self.mykey).chain(self.peers.iter())
    }

    pub fn find(&self, fpr: &Fingerprint) -> Option<&KeyPair> {
        self.all_keys().find(|kp| kp.fingerprint() == *fpr)
    }

    /// Adds a peer's public key, persisting it to `<fpr>.pem` under the
    /// key directory. Returns whether this fingerprint was new (the
    /// caller uses this to decide whether to inject a new-device alert
    /// *before* calling this, per `spec.md` §4.5 — alert, then record).
    pub fn add_peer_key(&mut self, pem: &str) -> Result<Fingerprint, KeyDirError> {
        let kp = KeyPair::load_public_pem(pem)?;
        let fpr = kp.fingerprint();
        std::fs::write(self.key_dir.join(format!("{}.pem", fpr.to_hex())), pem)?;
        self.peers.push(kp);
        Ok(fpr)
    }

    /// Removes a peer's key (used on `XKEYSYNC DELETED`). Logs and
    /// continues if the on-disk file is already gone, matching the
    /// original's "log but don't fail" cleanup policy.
    pub fn delete_peer_key(&mut self, fpr: &Fingerprint) {
        self.peers.retain(|kp| kp.fingerprint() != *fpr);
        let path = self.key_dir.join(format!("{}.pem", fpr.to_hex()));
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(%err, path = %path.display(), "failed to delete obsolete key file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn open_generates_and_persists_mykey() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let fpr = {
            let kd = KeyDir::open(dir.path(), &mut rng).unwrap();
            kd.mykey().fingerprint()
        };
        let kd2 = KeyDir::open(dir.path(), &mut rng).unwrap();
        assert_eq!(kd2.mykey().fingerprint(), fpr);
    }

    #[test]
    fn add_and_delete_peer_key_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let mut kd = KeyDir::open(dir.path(), &mut rng).unwrap();

        let peer = KeyPair::generate(&mut rng).unwrap();
        let pem = peer.public_to_pem().unwrap();
        let fpr = kd.add_peer_key(&pem).unwrap();
        assert!(kd.find(&fpr).is_some());
        assert_eq!(kd.all_keys().count(), 2);

        kd.delete_peer_key(&fpr);
        assert!(kd.find(&fpr).is_none());
        assert_eq!(kd.all_keys().count(), 1);
    }
}
