//! IMAP tag generation and ownership.
//!
//! A [`Tag`] is an ASCII atom used to correlate IMAP commands and their
//! tagged responses. The session core generates its own tags with a fixed
//! prefix plus a monotonic counter; tagged responses whose tag begins with
//! that prefix are the session's own and are consumed locally, otherwise
//! they are relayed (`spec.md` §3, §4.6).

use imap_codec::imap_types::core::{Tag, TagRef};

/// Generates tags of the form `<prefix><N>` and recognizes which tags it
/// has handed out.
#[derive(Debug, Clone)]
pub struct TagGenerator {
    prefix: &'static str,
    next: u64,
}

impl TagGenerator {
    pub fn new(prefix: &'static str) -> Self {
        Self { prefix, next: 1 }
    }

    /// Session-originated passthru/select/disconnect tags: `sc<N>`.
    pub fn session() -> Self {
        Self::new("sc")
    }

    /// `Anon`'s relayed-`LOGIN` tags: `anon<N>`.
    pub fn anon() -> Self {
        Self::new("anon")
    }

    /// `PreUser`'s `LOGIN`/`XKEYSYNC`/`XKEYADD` tags: `preuser<N>`.
    pub fn preuser() -> Self {
        Self::new("preuser")
    }

    /// Returns the next tag in the sequence, advancing the counter.
    pub fn next(&mut self) -> Tag<'static> {
        let n = self.next;
        self.next += 1;
        let raw = format!("{}{n}", self.prefix);
        Tag::try_from(raw).expect("generated tag is a valid IMAP atom")
    }

    /// Whether `tag` was (or could have been) handed out by this
    /// generator, i.e. starts with this generator's prefix.
    pub fn owns(&self, tag: &TagRef<'_>) -> bool {
        tag.as_ref().starts_with(self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_monotonic_prefixed_tags() {
        let mut gen = TagGenerator::session();
        assert_eq!(gen.next().as_ref(), "sc1");
        assert_eq!(gen.next().as_ref(), "sc2");
        assert_eq!(gen.next().as_ref(), "sc3");
    }

    #[test]
    fn owns_only_matching_prefix() {
        let gen = TagGenerator::session();
        let sc1 = Tag::try_from("sc1").unwrap();
        let a1 = Tag::try_from("A1").unwrap();
        assert!(gen.owns(sc1.as_ref()));
        assert!(!gen.owns(a1.as_ref()));
    }
}
