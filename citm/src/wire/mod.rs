//! Shared framing primitives used by both [`crate::wire::server`] (the
//! downstream, `ImapServer` personality) and [`crate::wire::client`] (the
//! upstream, `ImapClient` personality).
//!
//! Commands arriving from the downstream client are parsed into the typed
//! AST `imap-codec` provides (`Command`) — this is the "pre-existing IMAP
//! grammar parser" the specification assumes exists (`spec.md` §1), and is
//! the one place in this crate where a full 20-odd-command dispatch needs
//! real typed structure. Responses arriving from the upstream *server*,
//! by contrast, only ever need the light classification the specification
//! itself describes as a "serverless classifier" (`spec.md` §4.6): is this
//! tagged or untagged, and if untagged, which of a dozen keywords comes
//! next. That side is handled by [`raw`], a literal-aware line reader —
//! the IMAP response grammar's only structural subtlety for our purposes
//! is that a `{n}` (or `{n+}`) literal count defers the next `n` bytes from
//! line-ending detection, which `raw::read_response_frame` accounts for
//! directly rather than pulling in a second AST layer for it.

pub mod client;
pub mod raw;
pub mod server;

use imap_codec::decode::{CommandDecodeError, Decoder};
pub use imap_codec::imap_types;
use imap_codec::CommandCodec;
use imap_types::command::Command;

bitflags::bitflags! {
    /// The fixed IMAP extension set carried on every framing endpoint
    /// (`spec.md` §3). Downstream advertises `IMAP4REV1 | IDLE` (plus
    /// `STARTTLS`/`AUTH=...` capability strings, which are phase-dependent
    /// rather than members of this fixed set). Upstream requires all of
    /// these; missing any bit is fatal to the session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Extensions: u32 {
        const IMAP4REV1 = 1 << 0;
        const IDLE      = 1 << 1;
        const ENABLE    = 1 << 2;
        const UIDPLUS   = 1 << 3;
        const CONDSTORE = 1 << 4;
        const QRESYNC   = 1 << 5;
        const UNSELECT  = 1 << 6;
    }
}

impl Extensions {
    /// The set `citm` requires of the upstream server.
    pub fn required_upstream() -> Self {
        Extensions::IMAP4REV1
            | Extensions::ENABLE
            | Extensions::UIDPLUS
            | Extensions::CONDSTORE
            | Extensions::QRESYNC
            | Extensions::UNSELECT
            | Extensions::IDLE
    }

    /// The set `citm` advertises to the downstream client.
    pub fn advertised_downstream() -> Self {
        Extensions::IMAP4REV1 | Extensions::IDLE
    }

    /// Parses a `CAPABILITY` response's atoms (already split on whitespace)
    /// into the subset of extensions we care about, ignoring anything we
    /// don't track (`AUTH=...`, `STARTTLS`, vendor extensions).
    pub fn from_capability_atoms<'a>(atoms: impl IntoIterator<Item = &'a str>) -> Self {
        let mut exts = Extensions::empty();
        for atom in atoms {
            match atom.to_ascii_uppercase().as_str() {
                "IMAP4REV1" => exts |= Extensions::IMAP4REV1,
                "IDLE" => exts |= Extensions::IDLE,
                "ENABLE" => exts |= Extensions::ENABLE,
                "UIDPLUS" => exts |= Extensions::UIDPLUS,
                "CONDSTORE" => exts |= Extensions::CONDSTORE,
                "QRESYNC" => exts |= Extensions::QRESYNC,
                "UNSELECT" => exts |= Extensions::UNSELECT,
                _ => {}
            }
        }
        exts
    }
}

/// The fixed size of the outgoing write buffer (`spec.md` §4.1): as many
/// serialized responses as fit are packed into one socket write before one
/// flush; a response too large for the remaining room causes a flush and
/// is resumed into a fresh buffer.
pub const WRITE_BUFFER_SIZE: usize = 4096;

/// Normalized decode outcome for a downstream command.
pub enum CommandFrame<'a> {
    /// A full command was parsed; the caller must advance its read buffer
    /// by the returned number of consumed bytes.
    Parsed(Command<'a>, usize),
    /// Not enough bytes yet; keep reading.
    Incomplete,
    /// A literal was announced; the server must send a `+` continuation
    /// before more bytes will arrive.
    LiteralAck,
    /// The bytes at the front of the buffer do not form a valid command.
    /// The caller echoes the offending input in a `BAD` response
    /// (`spec.md` §4.1) and must still skip past it to resynchronize.
    ParseError(String),
}

/// Feeds `input` through [`CommandCodec`], normalizing the result.
pub fn decode_command(codec: &CommandCodec, input: &[u8]) -> CommandFrame<'static> {
    match codec.decode(input) {
        Ok((rest, command)) => {
            let consumed = input.len() - rest.len();
            CommandFrame::Parsed(command.into_static(), consumed)
        }
        Err(CommandDecodeError::Incomplete) => CommandFrame::Incomplete,
        Err(CommandDecodeError::LiteralFound { .. }) => CommandFrame::LiteralAck,
        Err(CommandDecodeError::Failed) => {
            CommandFrame::ParseError(String::from_utf8_lossy(input).into_owned())
        }
    }
}
