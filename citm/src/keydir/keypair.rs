//! RSA device keys and fingerprints.
//!
//! Grounded on `examples/original_source/libcitm/keydir.c`'s `keypair_t`:
//! an RSA keypair (this device's own, or a peer's public key loaded from a
//! synced `XKEYSYNC` record) identified by the SHA-256 fingerprint of its
//! public key, PEM-encoded to and from disk. The wire ciphertext markers
//! (`-----BEGIN/END SPLINTERMAIL MESSAGE-----`) are the original's own,
//! not OpenPGP armor, so this crate uses the RustCrypto `rsa`/`pkcs8`
//! stack — the same family the workspace's `pgp-lib` crate draws its own
//! dependencies from — rather than a PGP implementation.

use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A device's RSA public key, plus the private half when this is `mykey`.
pub struct KeyPair {
    public: RsaPublicKey,
    private: Option<RsaPrivateKey>,
    fpr: Fingerprint,
}

/// The SHA-256 digest of a key's DER-encoded `SubjectPublicKeyInfo`.
///
/// The original scheme fingerprints the DER public key directly; SHA-256
/// of SPKI is the documented resolution of an otherwise-open question
/// (see `DESIGN.md`) since the original's own digest routine is not part
/// of the retrieval pack's filtered C sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(s.trim()).map_err(|_| KeyError::BadFingerprint)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| KeyError::BadFingerprint)?;
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed fingerprint")]
    BadFingerprint,
    #[error("invalid PEM key material")]
    Pkcs8(#[from] pkcs8::Error),
    #[error("invalid PEM key material")]
    Spki(#[from] pkcs8::spki::Error),
    #[error("rsa key generation failed")]
    Rsa(#[from] rsa::Error),
}

const RSA_BITS: usize = 4096;

impl KeyPair {
    /// Generates a fresh device keypair. Used the first time a user logs
    /// in and no local key material exists yet.
    pub fn generate(rng: &mut impl rand::RngCore) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(rng, RSA_BITS)?;
        let public = RsaPublicKey::from(&private);
        let fpr = fingerprint_of(&public)?;
        Ok(Self {
            public,
            private: Some(private),
            fpr,
        })
    }

    /// Loads this device's own keypair (public + private) from a PKCS#8 PEM.
    pub fn load_private_pem(pem: &str) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::from_pkcs8_pem(pem)?;
        let public = RsaPublicKey::from(&private);
        let fpr = fingerprint_of(&public)?;
        Ok(Self {
            public,
            private: Some(private),
            fpr,
        })
    }

    /// Loads a peer's public key from a SubjectPublicKeyInfo PEM, as
    /// received over `XKEYSYNC`.
    pub fn load_public_pem(pem: &str) -> Result<Self, KeyError> {
        let public = RsaPublicKey::from_public_key_pem(pem)?;
        let fpr = fingerprint_of(&public)?;
        Ok(Self {
            public,
            private: None,
            fpr,
        })
    }

    pub fn private_to_pem(&self) -> Result<String, KeyError> {
        let private = self.private.as_ref().ok_or(KeyError::BadFingerprint)?;
        Ok(private.to_pkcs8_pem(LineEnding::CRLF)?.to_string())
    }

    pub fn public_to_pem(&self) -> Result<String, KeyError> {
        Ok(self.public.to_public_key_pem(LineEnding::CRLF)?)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fpr
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private_key(&self) -> Option<&RsaPrivateKey> {
        self.private.as_ref()
    }

    pub fn is_mine(&self) -> bool {
        self.private.is_some()
    }
}

fn fingerprint_of(public: &RsaPublicKey) -> Result<Fingerprint, KeyError> {
    let der = public.to_public_key_der()?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(Fingerprint(digest.into()))
}
