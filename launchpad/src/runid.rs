//! Opaque, time-sortable identifiers for runs and project directories.
//!
//! Ids are a prefix plus a ULID: 48 bits of milliseconds since the epoch
//! followed by 80 random bits, Crockford base32 encoded (26 chars).

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Tracking id of one workflow run, handed back to submitters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn generate() -> Self {
        RunId(with_prefix("deploy"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        RunId(s)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        RunId(s.to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `<prefix>-<ulid>`.
pub fn with_prefix(prefix: &str) -> String {
    format!("{prefix}-{}", ulid())
}

/// Generate a bare ULID string.
pub fn ulid() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;

    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut buf = [0u8; 26];

    let mut ts = now_ms;
    for slot in buf[..10].iter_mut().rev() {
        *slot = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }

    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for slot in buf[10..].iter_mut().rev() {
        *slot = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    buf.iter().map(|&b| b as char).collect()
}
