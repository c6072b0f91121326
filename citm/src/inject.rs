//! Synthetic message construction: the "new device detected" alert and
//! the decryption-failure/not-encrypted annotations applied to inbound
//! mail before it lands in the cache.
//!
//! Bodies and wording are carried over verbatim from
//! `examples/original_source/libcitm/keydir.c` (`inject_new_key_msg`,
//! `mangle_unencrypted`, `mangle_corrupted`) since `spec.md` §4.5/§4.8
//! specify this as a "fixed, human-readable template" without
//! reproducing its exact text.

use chrono::{DateTime, Utc};

use crate::keydir::Fingerprint;

/// Builds the fixed "New Device Detected" message injected into INBOX
/// whenever a previously-unseen device fingerprint shows up, either from
/// `XKEYSYNC` or from a decryption recipient list (`spec.md` §4.5, §4.8).
pub fn new_device_message(fpr: Fingerprint, now: DateTime<Utc>) -> Vec<u8> {
    let mut out = String::new();
    out.push_str("From: CITM <citm@localhost>\r\n");
    out.push_str("To: Local User <email_user@localhost>\r\n");
    out.push_str(&format!("Date: {}\r\n", now.to_rfc2822()));
    out.push_str("Subject: New Device Detected\r\n");
    out.push_str("\r\n");
    out.push_str("The Splintermail software running on your device has detected that a new\r\n");
    out.push_str("device has been added to your account.\r\n");
    out.push_str("\r\n");
    out.push_str("The device which was added has the following fingerprint:\r\n");
    out.push_str("\r\n");
    out.push_str(&format!("    {}\r\n", fpr.to_hex()));
    out.push_str("\r\n");
    out.push_str("If you recently installed Splintermail on a new device or re-installed\r\n");
    out.push_str("it on an old one, no further action is required.\r\n");
    out.push_str("\r\n");
    out.push_str("If you have not recently installed Splintermail on a new device or\r\n");
    out.push_str("re-installed it on an old one, this may mean that your password has been\r\n");
    out.push_str("compromised.  If you believe that to be true, you should take the\r\n");
    out.push_str("following steps to protect your account:\r\n");
    out.push_str("\r\n");
    out.push_str("  1. Visit your account page at https://splintermail.com\r\n");
    out.push_str("\r\n");
    out.push_str("  2. Change your password.  If somebody had your old password, this will\r\n");
    out.push_str("     prevent them from registering new devices to your account.\r\n");
    out.push_str("\r\n");
    out.push_str("  3. Click the \"delete\" button next to each API Token and Device on\r\n");
    out.push_str("     your account page.  If somebody had your old password, this will\r\n");
    out.push_str("     revoke any access they had previously.\r\n");
    out.push_str("\r\n");
    out.push_str("  4. On each of your devices, update your email client with your new\r\n");
    out.push_str("     password and check your email, which will automatically reregister\r\n");
    out.push_str("     each device.\r\n");
    out.push_str("\r\n");
    out.push_str("Thank you,\r\n");
    out.push_str("\r\n");
    out.push_str("    Your local Splintermail software\r\n");
    out.push_str("\r\n");
    out.push_str("Note: this message was generated by the Splintermail software running on\r\n");
    out.push_str("your own device.  This message did not originate from the mail server,\r\n");
    out.push_str("and deleting this message on this device will not delete it on any other\r\n");
    out.push_str("devices.  This is for your protection, as it guarantees that we at\r\n");
    out.push_str("Splintermail cannot be coerced into adding encryption keys to your\r\n");
    out.push_str("account without your knowledge.\r\n");
    out.into_bytes()
}

/// Wraps a ciphertext that failed to decrypt (bad key, corrupt envelope)
/// in a message explaining the failure, with the original ciphertext as
/// the body (`spec.md` §4.8).
pub fn decryption_failure_message(original_ciphertext: &[u8], now: DateTime<Utc>) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"From: CITM <citm@localhost>\r\n");
    out.extend_from_slice(b"To: Local User <email_user@localhost>\r\n");
    out.extend_from_slice(format!("Date: {}\r\n", now.to_rfc2822()).as_bytes());
    out.extend_from_slice(b"Subject: CITM failed to decrypt message\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b"The following message appears to be corrupted and cannot be decrypted:\r\n");
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(original_ciphertext);
    out
}

/// Prefixes a plaintext message's `Subject:` header with ` NOT ENCRYPTED:`,
/// synthesizing a subject line if none is present. Passes the message
/// through unchanged if no header/body boundary is found at all
/// (`spec.md` §4.8).
pub fn mangle_unencrypted(msg: &[u8]) -> Vec<u8> {
    const SYNTHETIC_SUBJECT: &[u8] = b"Subject: NOT ENCRYPTED: (no subject)";

    if let Some(rest) = msg.strip_prefix(b"Subject:") {
        // Subject on the very first line: mangle after the colon.
        let insert_at = msg.len() - rest.len();
        let mut out = Vec::with_capacity(msg.len() + 16);
        out.extend_from_slice(&msg[..insert_at]);
        out.extend_from_slice(b" NOT ENCRYPTED:");
        out.extend_from_slice(&msg[insert_at..]);
        return out;
    }

    if let Some(pos) = find_subsequence(msg, b"\nSubject:") {
        let insert_at = pos + 1 + b"Subject:".len();
        let mut out = Vec::with_capacity(msg.len() + 16);
        out.extend_from_slice(&msg[..insert_at]);
        out.extend_from_slice(b" NOT ENCRYPTED:");
        out.extend_from_slice(&msg[insert_at..]);
        return out;
    }

    for boundary in [b"\r\n\r\n".as_slice(), b"\n\n".as_slice()] {
        if let Some(pos) = find_subsequence(msg, boundary) {
            let headers_end = pos + boundary.len() / 2;
            let mut out = Vec::with_capacity(msg.len() + SYNTHETIC_SUBJECT.len() + 2);
            out.extend_from_slice(&msg[..headers_end]);
            out.extend_from_slice(SYNTHETIC_SUBJECT);
            out.extend_from_slice(&msg[headers_end..]);
            return out;
        }
    }

    // No recognizable header/body boundary; leave the message alone.
    msg.to_vec()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
