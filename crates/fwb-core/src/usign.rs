//! Detached usign signatures over checksum manifests.
//!
//! Public key blob: 2-byte algorithm tag, 8-byte key id, 32-byte Ed25519 key.
//! Signature blob: 2-byte algorithm tag, 8-byte key id, 64-byte signature.
//! Both are base64 on the last non-empty line of their text form; any
//! preceding `untrusted comment:` line is ignored.

use std::{fs, path::Path};

use base64::engine::general_purpose;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use tracing::debug;

use crate::error::SignatureError;
use crate::hashing::hex_encode;

pub const ALGORITHM_ED25519: [u8; 2] = *b"Ed";

const PUBLIC_KEY_LEN: usize = 42;
const SIGNATURE_LEN: usize = 74;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey {
    pub algorithm: [u8; 2],
    pub key_id: [u8; 8],
    pub key: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureBlob {
    pub algorithm: [u8; 2],
    pub key_id: [u8; 8],
    pub signature: [u8; 64],
}

impl PublicKey {
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let bytes = decode_last_line(text)?;
        if bytes.len() != PUBLIC_KEY_LEN {
            return Err(SignatureError::MalformedKey(bytes.len()));
        }
        let mut key = PublicKey {
            algorithm: [0; 2],
            key_id: [0; 8],
            key: [0; 32],
        };
        key.algorithm.copy_from_slice(&bytes[..2]);
        key.key_id.copy_from_slice(&bytes[2..10]);
        key.key.copy_from_slice(&bytes[10..]);
        Ok(key)
    }

    pub fn key_id_hex(&self) -> String {
        hex_encode(&self.key_id)
    }
}

impl SignatureBlob {
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let bytes = decode_last_line(text)?;
        if bytes.len() != SIGNATURE_LEN {
            return Err(SignatureError::MalformedSignature(bytes.len()));
        }
        let mut sig = SignatureBlob {
            algorithm: [0; 2],
            key_id: [0; 8],
            signature: [0; 64],
        };
        sig.algorithm.copy_from_slice(&bytes[..2]);
        sig.key_id.copy_from_slice(&bytes[2..10]);
        sig.signature.copy_from_slice(&bytes[10..]);
        Ok(sig)
    }
}

/// Checks `signature_text` over `message` with `public_key`.
///
/// `Ok(false)` means the blobs were well formed but the signature does not
/// belong to this key or does not cover these bytes. Structural problems are
/// reported as errors.
pub fn check(
    signature_text: &str,
    message: &[u8],
    public_key: &str,
) -> Result<bool, SignatureError> {
    let key = PublicKey::parse(public_key)?;
    let sig = SignatureBlob::parse(signature_text)?;

    if key.algorithm != ALGORITHM_ED25519 {
        return Err(SignatureError::UnsupportedAlgorithm(
            String::from_utf8_lossy(&key.algorithm).into_owned(),
        ));
    }
    if sig.algorithm != ALGORITHM_ED25519 {
        return Err(SignatureError::UnsupportedAlgorithm(
            String::from_utf8_lossy(&sig.algorithm).into_owned(),
        ));
    }
    if sig.key_id != key.key_id {
        debug!(
            "signature key id {} does not match trusted key id {}",
            hex_encode(&sig.key_id),
            key.key_id_hex()
        );
        return Ok(false);
    }

    let verifying_key = VerifyingKey::from_bytes(&key.key)
        .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
    let signature = Signature::from_bytes(&sig.signature);
    Ok(verifying_key.verify_strict(message, &signature).is_ok())
}

/// Same as [`check`] but reads the signature and message from disk.
pub fn check_files(
    signature_file: &Path,
    message_file: &Path,
    public_key: &str,
) -> Result<bool, SignatureError> {
    let signature_text = fs::read_to_string(signature_file).map_err(|e| SignatureError::Io {
        path: signature_file.display().to_string(),
        reason: e.to_string(),
    })?;
    let message = fs::read(message_file).map_err(|e| SignatureError::Io {
        path: message_file.display().to_string(),
        reason: e.to_string(),
    })?;
    check(&signature_text, &message, public_key)
}

/// `true` only for a well-formed signature by `public_key` over the message file.
pub fn verify(signature_file: &Path, message_file: &Path, public_key: &str) -> bool {
    match check_files(signature_file, message_file, public_key) {
        Ok(valid) => valid,
        Err(err) => {
            debug!(
                "signature {} rejected: {err}",
                signature_file.display()
            );
            false
        }
    }
}

fn decode_last_line(text: &str) -> Result<Vec<u8>, SignatureError> {
    let line = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or_default();
    general_purpose::STANDARD
        .decode(line.as_bytes())
        .map_err(|e| SignatureError::Encoding(e.to_string()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    pub(crate) const TEST_KEY_ID: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];

    pub(crate) fn signing_key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    pub(crate) fn public_key_text(key: &SigningKey, key_id: [u8; 8]) -> String {
        let mut blob = Vec::with_capacity(PUBLIC_KEY_LEN);
        blob.extend_from_slice(&ALGORITHM_ED25519);
        blob.extend_from_slice(&key_id);
        blob.extend_from_slice(key.verifying_key().as_bytes());
        format!(
            "untrusted comment: test public key\n{}\n",
            general_purpose::STANDARD.encode(blob)
        )
    }

    pub(crate) fn signature_text(key: &SigningKey, key_id: [u8; 8], message: &[u8]) -> String {
        let mut blob = Vec::with_capacity(SIGNATURE_LEN);
        blob.extend_from_slice(&ALGORITHM_ED25519);
        blob.extend_from_slice(&key_id);
        blob.extend_from_slice(&key.sign(message).to_bytes());
        format!(
            "untrusted comment: signed by test key\n{}\n",
            general_purpose::STANDARD.encode(blob)
        )
    }

    fn truncate_last_line(text: &str, keep_bytes: usize) -> String {
        let line = text.lines().last().unwrap();
        let bytes = general_purpose::STANDARD.decode(line).unwrap();
        general_purpose::STANDARD.encode(&bytes[..keep_bytes])
    }

    fn write_pair(dir: &Path, signature: &str, message: &[u8]) -> (std::path::PathBuf, std::path::PathBuf) {
        let sig_path = dir.join("sha256sums.sig");
        let msg_path = dir.join("sha256sums");
        fs::write(&sig_path, signature).unwrap();
        fs::write(&msg_path, message).unwrap();
        (sig_path, msg_path)
    }

    #[test]
    fn pinned_openwrt_key_parses() {
        let key = PublicKey::parse(crate::config::DEFAULT_UPSTREAM_KEY).unwrap();
        assert_eq!(key.algorithm, ALGORITHM_ED25519);
        assert_eq!(key.key_id_hex().len(), 16);
    }

    #[test]
    fn valid_signature_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let key = signing_key(7);
        let message = b"abc *openwrt-imagebuilder.tar.xz\n";
        let (sig, msg) = write_pair(dir.path(), &signature_text(&key, TEST_KEY_ID, message), message);
        assert!(verify(&sig, &msg, &public_key_text(&key, TEST_KEY_ID)));
    }

    #[test]
    fn altered_message_fails() {
        let dir = tempfile::tempdir().unwrap();
        let key = signing_key(7);
        let sig_text = signature_text(&key, TEST_KEY_ID, b"original");
        let (sig, msg) = write_pair(dir.path(), &sig_text, b"originaL");
        assert!(!verify(&sig, &msg, &public_key_text(&key, TEST_KEY_ID)));
        assert_eq!(
            check(&sig_text, b"originaL", &public_key_text(&key, TEST_KEY_ID)),
            Ok(false)
        );
    }

    #[test]
    fn signature_from_other_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let trusted = signing_key(7);
        let other = signing_key(9);
        let message = b"payload";
        let (sig, msg) = write_pair(dir.path(), &signature_text(&other, TEST_KEY_ID, message), message);
        assert!(!verify(&sig, &msg, &public_key_text(&trusted, TEST_KEY_ID)));
    }

    #[test]
    fn key_id_mismatch_is_a_plain_false() {
        let key = signing_key(7);
        let message = b"payload";
        let sig_text = signature_text(&key, [9; 8], message);
        assert_eq!(check(&sig_text, message, &public_key_text(&key, TEST_KEY_ID)), Ok(false));
    }

    #[test]
    fn truncated_public_key_is_malformed_but_verify_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let key = signing_key(7);
        let message = b"payload";
        let sig_text = signature_text(&key, TEST_KEY_ID, message);
        let short_key = truncate_last_line(&public_key_text(&key, TEST_KEY_ID), 40);
        assert_eq!(
            check(&sig_text, message, &short_key),
            Err(SignatureError::MalformedKey(40))
        );
        let (sig, msg) = write_pair(dir.path(), &sig_text, message);
        assert!(!verify(&sig, &msg, &short_key));
    }

    #[test]
    fn truncated_signature_is_malformed_but_verify_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let key = signing_key(7);
        let message = b"payload";
        let short_sig = truncate_last_line(&signature_text(&key, TEST_KEY_ID, message), 73);
        assert_eq!(
            check(&short_sig, message, &public_key_text(&key, TEST_KEY_ID)),
            Err(SignatureError::MalformedSignature(73))
        );
        let (sig, msg) = write_pair(dir.path(), &short_sig, message);
        assert!(!verify(&sig, &msg, &public_key_text(&key, TEST_KEY_ID)));
    }

    #[test]
    fn foreign_algorithm_tag_is_rejected() {
        let key = signing_key(7);
        let message = b"payload";
        let sig_text = signature_text(&key, TEST_KEY_ID, message);
        let mut blob = general_purpose::STANDARD
            .decode(public_key_text(&key, TEST_KEY_ID).lines().last().unwrap())
            .unwrap();
        blob[0] = b'X';
        let key_text = general_purpose::STANDARD.encode(blob);
        assert!(matches!(
            check(&sig_text, message, &key_text),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn missing_files_verify_false() {
        let dir = tempfile::tempdir().unwrap();
        let key = signing_key(7);
        assert!(!verify(
            &dir.path().join("absent.sig"),
            &dir.path().join("absent"),
            &public_key_text(&key, TEST_KEY_ID)
        ));
    }
}
