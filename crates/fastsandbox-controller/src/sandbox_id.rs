//! SandboxID generation (`spec.md` §4.6.2): every Fast-mode create must
//! deterministically regenerate the same ID if retried with the same
//! `(namespace, name, createTimestamp)` triple, so a client retry after a
//! lost response doesn't mint a second sandbox identity.

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const ENCODED_LENGTH: usize = 22;

pub const SANDBOX_PREFIX: &str = "sb_";
pub const AGENT_PREFIX: &str = "ag_";

fn base62_encode(bytes: &[u8; 16]) -> String {
    let mut num = u128::from_be_bytes(*bytes);
    let mut chars = [b'0'; ENCODED_LENGTH];

    for i in (0..ENCODED_LENGTH).rev() {
        chars[i] = ALPHABET[(num % 62) as usize];
        num /= 62;
    }

    String::from_utf8(chars.to_vec()).unwrap()
}

/// Generate a random, time-sortable sandbox ID: `sb_{base62(uuidv7)}`.
pub fn generate_id(prefix: &str) -> String {
    let bytes = *uuid::Uuid::now_v7().as_bytes();
    format!("{prefix}{}", base62_encode(&bytes))
}

/// Deterministically derive a sandbox ID from its name, namespace, and
/// creation timestamp, so a Fast-mode create retried with the same
/// annotation-carried timestamp produces the same ID (`spec.md` §3,
/// `md5(name:namespace:createTimestamp)`, hex digest, no prefix).
pub fn derive_id(namespace: &str, name: &str, create_timestamp_unix_nano: i64) -> String {
    let digest = md5::compute(format!("{name}:{namespace}:{create_timestamp_unix_nano}"));
    format!("{digest:x}")
}
