use std::collections::BTreeSet;
use std::io::Read;
use std::{fs, io, path::Path};

use sha2::{Digest, Sha256};

/// Length of request fingerprints and packages keys, in hex characters.
pub const SHORT_DIGEST_LEN: usize = 12;

const READ_BLOCK: usize = 8192;

/// SHA-256 of `bytes`, hex encoded and truncated to `length` characters.
pub fn digest(bytes: &[u8], length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut full = hex_encode(&hasher.finalize());
    full.truncate(length);
    full
}

pub fn short_digest(input: &str) -> String {
    digest(input.as_bytes(), SHORT_DIGEST_LEN)
}

/// Full hex SHA-256 of a file, read in fixed-size blocks.
pub fn file_digest(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; READ_BLOCK];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// Digest over the sorted, de-duplicated package strings joined by spaces.
pub fn packages_digest<I, S>(packages: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let set: BTreeSet<String> = packages
        .into_iter()
        .map(|item| item.as_ref().to_string())
        .collect();
    let joined = set.into_iter().collect::<Vec<_>>().join(" ");
    short_digest(&joined)
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(nibble_to_hex(b >> 4));
        out.push(nibble_to_hex(b & 0x0f));
    }
    out
}

pub(crate) fn is_hex_digest(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn nibble_to_hex(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '0',
    }
}
