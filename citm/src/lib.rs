//! `citm`: the client-in-the-middle IMAP proxy session core.
//!
//! Terminates a downstream IMAP connection and an upstream IMAP connection,
//! relaying traffic while transparently encrypting message bodies
//! end-to-end under per-device keys synced via a custom `XKEYSYNC`/
//! `XKEYADD` extension. This crate is the session core only: accepting
//! TCP connections, running an event loop, and persisting mail to disk
//! beyond the `MailCache` interface are left to an embedder (`spec.md`
//! §1) — see [`registry::Citm`] for the object that embedder constructs.

pub mod collaborator;
pub mod connection;
pub mod error;
pub mod inject;
pub mod keydir;
pub mod mailcache;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod stage;
pub mod tag;
pub mod wire;

pub use registry::Citm;
