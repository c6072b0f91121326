//! The `Citm` registry (`spec.md` §2, §5): the object an embedder
//! constructs once per running proxy, owning every live stage object
//! across every user in the cancellation order `spec.md` §5 requires —
//! `IoPair`s, `Anon`s, `PreUser`s, `Session`s, then `Hold`s.
//!
//! Each stage object here runs as a spawned `tokio` task rather than a
//! hand-advanced state machine (`crate::scheduler`'s doc comment explains
//! why); "cancel" is `JoinHandle::abort`. `spec.md` §2's note that
//! multiple downstream connections for the same user "are added as
//! additional downstream/upstream pairs" to an in-flight `PreUser` or
//! `Session` is realized two ways here: a `Session` fan-out shares its
//! `PreUserOutcome`'s pair list directly (`Session::fan_out`); a pair
//! arriving *while* that user's `PreUser` is still mid-`XKEYSYNC` is
//! queued in `joining` and folded in, as its own `Session`, once the
//! sync completes — simpler than threading a live channel into a task
//! already consuming itself by value, at the cost of that pair not
//! observing the sync's `XKEYSYNC` traffic (it gets a fully-synced
//! `KeyDir` regardless, just via its own later `Session`). Recorded as a
//! simplification in `DESIGN.md`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::collaborator::IoCollaborator;
use crate::connection::{BoxConnection, Security};
use crate::keydir::KeyDir;
use crate::mailcache::MailCache;
use crate::session::Session;
use crate::stage::anon::{Anon, AnonOutcome};
use crate::stage::io_pair::{ConnectedPair, IoPair};
use crate::stage::preuser::PreUser;

/// One running proxy instance.
pub struct Citm {
    io: Arc<dyn IoCollaborator>,
    cache: Arc<dyn MailCache>,
    key_root: PathBuf,

    io_pairs: Mutex<Vec<JoinHandle<()>>>,
    anons: Mutex<Vec<JoinHandle<()>>>,
    preusers: Mutex<HashMap<String, JoinHandle<()>>>,
    sessions: Mutex<HashMap<String, Vec<JoinHandle<()>>>>,
    holds: Mutex<HashMap<String, Vec<ConnectedPair>>>,

    /// Pairs for a user whose `PreUser` is currently running; folded into
    /// fresh `Session`s once that `PreUser` completes.
    joining: Mutex<HashMap<String, Vec<ConnectedPair>>>,
    keydirs: Mutex<HashMap<String, Arc<tokio::sync::Mutex<KeyDir>>>>,
}

impl Citm {
    pub fn new(io: Arc<dyn IoCollaborator>, cache: Arc<dyn MailCache>, key_root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            io,
            cache,
            key_root: key_root.into(),
            io_pairs: Mutex::new(Vec::new()),
            anons: Mutex::new(Vec::new()),
            preusers: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            holds: Mutex::new(HashMap::new()),
            joining: Mutex::new(HashMap::new()),
            keydirs: Mutex::new(HashMap::new()),
        })
    }

    /// Accepts one freshly-dialed downstream connection: dials upstream,
    /// then runs it through `Anon`, `PreUser`/`Session` as it authenticates.
    pub async fn accept(self: &Arc<Self>, downstream: BoxConnection, downstream_security: Security) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.drive_io_pair(downstream, downstream_security).await;
        });
        self.io_pairs.lock().await.push(handle);
    }

    async fn drive_io_pair(self: Arc<Self>, downstream: BoxConnection, downstream_security: Security) {
        let io_pair = IoPair::new(self.io.clone(), downstream_security);
        match io_pair.run(downstream).await {
            Ok(pair) => self.spawn_anon(pair).await,
            Err(err) => warn!(%err, "io pair failed to connect upstream"),
        }
    }

    async fn spawn_anon(self: &Arc<Self>, pair: ConnectedPair) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.drive_anon(pair).await;
        });
        self.anons.lock().await.push(handle);
    }

    async fn drive_anon(self: Arc<Self>, pair: ConnectedPair) {
        let anon = Anon::new(pair.downstream, pair.upstream);
        match anon.run().await {
            Ok(AnonOutcome::LoggedIn {
                downstream,
                upstream,
                credentials,
            }) => {
                self.route_authenticated(
                    credentials.username,
                    credentials.password,
                    ConnectedPair { downstream, upstream },
                )
                .await;
            }
            Ok(AnonOutcome::LoggedOut) => {}
            Err(err) => warn!(%err, "anon stage failed"),
        }
    }

    /// Routes a freshly-authenticated pair: joins an in-flight `PreUser`'s
    /// queue if one is running for this user, folds into a held-open
    /// `Session` rotation if the existing one is shutting down, or starts
    /// a fresh `PreUser`.
    async fn route_authenticated(self: &Arc<Self>, username: String, password: String, pair: ConnectedPair) {
        if self.preusers.lock().await.contains_key(&username) {
            self.joining.lock().await.entry(username).or_default().push(pair);
            return;
        }

        if let Some(handles) = self.sessions.lock().await.get(&username) {
            if handles.iter().any(|h| !h.is_finished()) {
                self.holds.lock().await.entry(username).or_default().push(pair);
                return;
            }
        }

        self.spawn_preuser(username, password, pair).await;
    }

    async fn spawn_preuser(self: &Arc<Self>, username: String, password: String, primary: ConnectedPair) {
        let keydir = match self.keydir_for(&username).await {
            Ok(kd) => kd,
            Err(err) => {
                warn!(%err, %username, "failed to open key directory");
                return;
            }
        };

        let this = self.clone();
        let preuser = PreUser::new(keydir, self.cache.clone(), username.clone(), password, primary);
        let handle = {
            let username = username.clone();
            tokio::spawn(async move {
                this.drive_preuser(username, preuser).await;
            })
        };
        self.preusers.lock().await.insert(username, handle);
    }

    async fn drive_preuser(self: Arc<Self>, username: String, preuser: PreUser) {
        let outcome = match preuser.run().await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(%err, %username, "preuser stage failed");
                self.preusers.lock().await.remove(&username);
                return;
            }
        };
        self.preusers.lock().await.remove(&username);

        let joined = self.joining.lock().await.remove(&username).unwrap_or_default();

        let mut sessions = Session::fan_out(outcome, self.cache.clone());
        sessions.extend(joined.into_iter().map(|pair| {
            // These pairs never ran the XKEYSYNC they missed; they share
            // the now-fully-synced KeyDir via the same Session plumbing.
            let keydir = sessions
                .first()
                .expect("fan_out always yields at least the primary pair")
                .keydir_handle();
            Session::new(pair, keydir, self.cache.clone())
        }));

        self.spawn_sessions(username, sessions).await;
    }

    async fn spawn_sessions(self: &Arc<Self>, username: String, sessions: Vec<Session>) {
        let mut handles = Vec::with_capacity(sessions.len());
        for session in sessions {
            let this = self.clone();
            let username_for_task = username.clone();
            handles.push(tokio::spawn(async move {
                if let Err(err) = session.run().await {
                    warn!(%err, user = %username_for_task, "session stage failed");
                }
                this.promote_held(username_for_task).await;
            }));
        }
        self.sessions.lock().await.insert(username, handles);
    }

    /// Once a `Session` task for `username` finishes, any pairs parked in
    /// `holds` while it was shutting down get their own fresh `PreUser`/
    /// `Session` run.
    async fn promote_held(self: Arc<Self>, username: String) {
        let held = self.holds.lock().await.remove(&username).unwrap_or_default();
        for pair in held {
            let keydir = match self.keydir_for(&username).await {
                Ok(kd) => kd,
                Err(err) => {
                    warn!(%err, %username, "failed to reopen key directory for held pair");
                    continue;
                }
            };
            let session = Session::new(pair, keydir, self.cache.clone());
            self.spawn_sessions(username.clone(), vec![session]).await;
        }
    }

    async fn keydir_for(&self, username: &str) -> Result<Arc<tokio::sync::Mutex<KeyDir>>, crate::keydir::KeyDirError> {
        if let Some(kd) = self.keydirs.lock().await.get(username) {
            return Ok(kd.clone());
        }
        let user_root = self.key_root.join(username);
        let keydir = KeyDir::open(&user_root, &mut rand::rngs::OsRng)?;
        let keydir = Arc::new(tokio::sync::Mutex::new(keydir));
        self.keydirs.lock().await.insert(username.to_string(), keydir.clone());
        Ok(keydir)
    }

    /// Cancels every live stage object in the order `spec.md` §5 requires:
    /// `IoPair`s, `Anon`s, `PreUser`s, `Session`s, `Hold`s.
    pub async fn cancel_all(&self) {
        for handle in self.io_pairs.lock().await.drain(..) {
            handle.abort();
        }
        for handle in self.anons.lock().await.drain(..) {
            handle.abort();
        }
        for (_, handle) in self.preusers.lock().await.drain() {
            handle.abort();
        }
        for (_, handles) in self.sessions.lock().await.drain() {
            for handle in handles {
                handle.abort();
            }
        }
        self.holds.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::connection::DuplexConnection;
    use crate::error::{AnyBoxedError, AnyResult};
    use crate::mailcache::{CacheError, Freeze, Hold, ProcessedMsg};

    #[derive(Default)]
    struct FakeCache;

    #[async_trait]
    impl MailCache for FakeCache {
        async fn freeze_new(&self, mailbox: &str) -> Result<Freeze, CacheError> {
            let permit = Arc::new(tokio::sync::Semaphore::new(1)).acquire_owned().await.unwrap();
            Ok(Freeze {
                mailbox: mailbox.to_string(),
                _permit: permit,
            })
        }
        async fn freeze_free(&self, _freeze: Freeze) {}
        async fn delete(&self, _freeze: &Freeze) -> Result<(), CacheError> {
            Ok(())
        }
        async fn rename(&self, _src: &Freeze, _dst_mailbox: &str) -> Result<(), CacheError> {
            Ok(())
        }
        async fn hold_new(&self, mailbox: &str) -> Result<Hold, CacheError> {
            let permit = Arc::new(tokio::sync::Semaphore::new(1)).acquire_owned().await.unwrap();
            Ok(Hold {
                mailbox: mailbox.to_string(),
                _permit: permit,
            })
        }
        async fn hold_release(&self, _hold: Hold) {}
        async fn uidvalidity(&self, _mailbox: &str) -> Option<u32> {
            None
        }
        async fn land_appended(
            &self,
            _mailbox: &str,
            _uid: u32,
            _content: &[u8],
            _flags: &[String],
            _intdate: DateTime<Utc>,
        ) -> Result<(), CacheError> {
            Ok(())
        }
        async fn add_local(&self, _mailbox: &str, _content: &[u8], _intdate: DateTime<Utc>) -> Result<(), CacheError> {
            Ok(())
        }
        fn new_tmp_id(&self) -> u64 {
            1
        }
        async fn process_msg(&self, _mailbox: &str, content: &[u8]) -> ProcessedMsg {
            ProcessedMsg {
                bytes: content.to_vec(),
                not_for_me: false,
            }
        }
        async fn mark_mailbox_synced(&self, _mailbox: &str) {}
    }

    struct NeverConnects;

    #[async_trait]
    impl IoCollaborator for NeverConnects {
        async fn connect_imap(&self) -> AnyResult<BoxConnection> {
            #[derive(Debug, thiserror::Error)]
            #[error("no upstream in this test")]
            struct NoUpstream;
            Err(Box::new(NoUpstream) as AnyBoxedError)
        }
    }

    fn test_citm() -> Arc<Citm> {
        let key_root = tempfile::tempdir().unwrap().into_path();
        Citm::new(Arc::new(NeverConnects), Arc::new(FakeCache), key_root)
    }

    /// A connected pair whose peer ends are deliberately leaked rather
    /// than dropped, so a task driving the returned pair (e.g. a spawned
    /// `PreUser`) blocks on I/O instead of racing a broken-pipe error —
    /// these tests only care about registry-level routing, not protocol
    /// completion.
    fn dummy_pair() -> ConnectedPair {
        let (down_a, down_b) = DuplexConnection::pair(4096, Security::Insecure);
        let (up_a, up_b) = DuplexConnection::pair(4096, Security::Insecure);
        Box::leak(Box::new((down_b, up_b)));
        ConnectedPair {
            downstream: crate::wire::server::ImapServer::new(Box::new(down_a)),
            upstream: crate::wire::client::ImapClient::new(Box::new(up_a)),
        }
    }

    fn forever_pending() -> JoinHandle<()> {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        })
    }

    #[tokio::test]
    async fn pair_joins_in_flight_preuser_for_same_user() {
        let citm = test_citm();
        citm.preusers
            .lock()
            .await
            .insert("alice".to_string(), forever_pending());

        citm.route_authenticated("alice".to_string(), "secret".to_string(), dummy_pair())
            .await;

        assert_eq!(citm.joining.lock().await.get("alice").map(Vec::len), Some(1));
        assert!(!citm.sessions.lock().await.contains_key("alice"));
        citm.cancel_all().await;
    }

    #[tokio::test]
    async fn pair_is_held_while_a_session_is_still_running() {
        let citm = test_citm();
        citm.sessions
            .lock()
            .await
            .insert("alice".to_string(), vec![forever_pending()]);

        citm.route_authenticated("alice".to_string(), "secret".to_string(), dummy_pair())
            .await;

        assert_eq!(citm.holds.lock().await.get("alice").map(Vec::len), Some(1));
        assert!(!citm.preusers.lock().await.contains_key("alice"));
        citm.cancel_all().await;
    }

    #[tokio::test]
    async fn pair_starts_a_fresh_preuser_when_nothing_is_running() {
        let citm = test_citm();

        citm.route_authenticated("alice".to_string(), "secret".to_string(), dummy_pair())
            .await;

        assert!(citm.preusers.lock().await.contains_key("alice"));
        citm.cancel_all().await;
    }

    #[tokio::test]
    async fn cancel_all_aborts_every_tracked_handle() {
        let citm = test_citm();
        citm.io_pairs.lock().await.push(forever_pending());
        citm.anons.lock().await.push(forever_pending());
        citm.preusers.lock().await.insert("alice".to_string(), forever_pending());
        citm.sessions
            .lock()
            .await
            .insert("bob".to_string(), vec![forever_pending()]);
        citm.holds.lock().await.insert("carol".to_string(), vec![dummy_pair()]);

        citm.cancel_all().await;

        assert!(citm.io_pairs.lock().await.is_empty());
        assert!(citm.anons.lock().await.is_empty());
        assert!(citm.preusers.lock().await.is_empty());
        assert!(citm.sessions.lock().await.is_empty());
        assert!(citm.holds.lock().await.is_empty());
    }
}
