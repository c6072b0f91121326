//! The I/O collaborator interface consumed by [`crate::stage::io_pair`]
//! (`spec.md` §6): everything needed to open an upstream connection for a
//! freshly-accepted downstream one. Accepting downstream connections and
//! the host event loop itself remain out of scope (`spec.md` §1) — this
//! crate only defines the seam a caller plugs a concrete dialer into.

use async_trait::async_trait;

use crate::connection::BoxConnection;
use crate::error::AnyResult;

#[async_trait]
pub trait IoCollaborator: Send + Sync {
    /// Opens a new upstream IMAP connection (TCP + optional TLS). A
    /// cancelled in-flight connect must resolve to `Error::Cancelled`
    /// (via [`crate::error::AnyError`]) rather than being silently
    /// dropped, so [`crate::stage::io_pair::IoPair`] can tell a genuine
    /// connect failure apart from its own cancellation.
    async fn connect_imap(&self) -> AnyResult<BoxConnection>;
}
