//! Message body encryption under the custom `SPLINTERMAIL MESSAGE` PEM
//! framing, grounded on `examples/original_source/libcitm/keydir.c`'s
//! `encrypt_msg`/`decrypt_msg` and `xkey.c`.
//!
//! Each recipient gets their own RSA-OAEP-wrapped copy of a random
//! per-message AES-256-GCM key; the PEM body is a small self-describing
//! envelope (one `recipient-fingerprint:base64(wrapped key)` line per
//! recipient, a blank line, then the base64 ciphertext) so `decrypt_msg`
//! can find the line addressed to `mykey` without trying every recipient.

use std::fmt::Write as _;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

use super::keypair::{Fingerprint, KeyPair};

pub const BEGIN_MARKER: &str = "-----BEGIN SPLINTERMAIL MESSAGE-----";
pub const END_MARKER: &str = "-----END SPLINTERMAIL MESSAGE-----";

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The ciphertext does not address `mykey` at all.
    #[error("message is not for this device")]
    NotForMe,
    /// The envelope is structurally invalid.
    #[error("malformed ciphertext envelope: {0}")]
    Malformed(String),
    #[error("rsa operation failed")]
    Rsa(#[from] rsa::Error),
    #[error("aead operation failed")]
    Aead,
}

/// Encrypts `plaintext` for every key in `recipients` (mykey first, then
/// peers, per `KeyDir::all_keys` order), producing a PEM-framed envelope.
pub fn encrypt_for(
    plaintext: &[u8],
    recipients: &[(Fingerprint, &RsaPublicKey)],
    rng: &mut impl RngCore,
) -> Result<String, CryptoError> {
    let mut content_key = [0u8; 32];
    rng.fill_bytes(&mut content_key);
    let mut nonce_bytes = [0u8; 12];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&content_key).map_err(|_| CryptoError::Aead)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::Aead)?;

    let mut out = String::new();
    out.push_str(BEGIN_MARKER);
    out.push_str("\r\n");
    writeln!(out, "Nonce: {}", BASE64.encode(nonce_bytes)).ok();
    for (fpr, pubkey) in recipients {
        let padding = Oaep::new::<Sha256>();
        let wrapped = pubkey.encrypt(rng, padding, &content_key)?;
        writeln!(out, "Key: {} {}", fpr.to_hex(), BASE64.encode(wrapped)).ok();
    }
    out.push_str("\r\n");
    out.push_str(&BASE64.encode(&ciphertext));
    out.push_str("\r\n");
    out.push_str(END_MARKER);
    out.push_str("\r\n");
    Ok(out)
}

/// Attempts to decrypt `armored` with `mykey`. Returns the plaintext and
/// the set of fingerprints the envelope was addressed to (used by the
/// caller to run the FprWatcher's decrypt-alert policy over every other
/// recipient listed).
pub fn decrypt_with(armored: &str, mykey: &KeyPair) -> Result<(Vec<u8>, Vec<Fingerprint>), CryptoError> {
    let body = armored
        .strip_prefix(BEGIN_MARKER)
        .ok_or_else(|| CryptoError::Malformed("missing begin marker".into()))?;
    let body = body
        .rsplit_once(END_MARKER)
        .map(|(head, _)| head)
        .ok_or_else(|| CryptoError::Malformed("missing end marker".into()))?;

    let mut nonce: Option<[u8; 12]> = None;
    let mut keys: Vec<(Fingerprint, Vec<u8>)> = Vec::new();
    let mut ciphertext_b64 = String::new();
    let mut in_ciphertext = false;

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            in_ciphertext = true;
            continue;
        }
        if in_ciphertext {
            ciphertext_b64.push_str(line);
            continue;
        }
        if let Some(rest) = line.strip_prefix("Nonce:") {
            let decoded = BASE64
                .decode(rest.trim())
                .map_err(|_| CryptoError::Malformed("bad nonce".into()))?;
            let arr: [u8; 12] = decoded
                .try_into()
                .map_err(|_| CryptoError::Malformed("bad nonce length".into()))?;
            nonce = Some(arr);
        } else if let Some(rest) = line.strip_prefix("Key:") {
            let mut parts = rest.trim().splitn(2, ' ');
            let fpr_hex = parts
                .next()
                .ok_or_else(|| CryptoError::Malformed("missing fingerprint".into()))?;
            let wrapped_b64 = parts
                .next()
                .ok_or_else(|| CryptoError::Malformed("missing wrapped key".into()))?;
            let fpr = Fingerprint::from_hex(fpr_hex)
                .map_err(|_| CryptoError::Malformed("bad fingerprint".into()))?;
            let wrapped = BASE64
                .decode(wrapped_b64)
                .map_err(|_| CryptoError::Malformed("bad wrapped key".into()))?;
            keys.push((fpr, wrapped));
        }
    }

    let nonce_bytes = nonce.ok_or_else(|| CryptoError::Malformed("missing nonce".into()))?;
    let recipient_fprs: Vec<Fingerprint> = keys.iter().map(|(fpr, _)| *fpr).collect();

    let my_fpr = mykey.fingerprint();
    let wrapped = keys
        .iter()
        .find(|(fpr, _)| *fpr == my_fpr)
        .map(|(_, wrapped)| wrapped.clone())
        .ok_or(CryptoError::NotForMe)?;

    let private = mykey.private_key().ok_or(CryptoError::NotForMe)?;
    let padding = Oaep::new::<Sha256>();
    let content_key = private.decrypt(padding, &wrapped)?;

    let ciphertext = BASE64
        .decode(ciphertext_b64.trim())
        .map_err(|_| CryptoError::Malformed("bad ciphertext".into()))?;

    let cipher = Aes256Gcm::new_from_slice(&content_key).map_err(|_| CryptoError::Aead)?;
    let nonce = Nonce::from_slice(&nonce_bytes);
    let plaintext = cipher
        .decrypt(nonce, ciphertext.as_ref())
        .map_err(|_| CryptoError::Aead)?;

    Ok((plaintext, recipient_fprs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let mut rng = StdRng::seed_from_u64(7);
        let mykey = KeyPair::generate(&mut rng).unwrap();
        let peer = KeyPair::generate(&mut rng).unwrap();

        let recipients = [
            (mykey.fingerprint(), mykey.public_key()),
            (peer.fingerprint(), peer.public_key()),
        ];
        let armored = encrypt_for(b"hello, world", &recipients, &mut rng).unwrap();
        assert!(armored.starts_with(BEGIN_MARKER));

        let (plaintext, fprs) = decrypt_with(&armored, &mykey).unwrap();
        assert_eq!(plaintext, b"hello, world");
        assert!(fprs.contains(&mykey.fingerprint()));
        assert!(fprs.contains(&peer.fingerprint()));
    }

    #[test]
    fn decrypt_fails_not_for_me() {
        let mut rng = StdRng::seed_from_u64(8);
        let mykey = KeyPair::generate(&mut rng).unwrap();
        let other = KeyPair::generate(&mut rng).unwrap();
        let stranger = KeyPair::generate(&mut rng).unwrap();

        let recipients = [(other.fingerprint(), other.public_key())];
        let armored = encrypt_for(b"not for you", &recipients, &mut rng).unwrap();

        let err = decrypt_with(&armored, &stranger).unwrap_err();
        assert!(matches!(err, CryptoError::NotForMe));
    }
}
