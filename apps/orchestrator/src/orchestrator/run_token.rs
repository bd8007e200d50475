use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

const RUN_TOKEN_BYTES: usize = 32;
const MAX_TTL_MINUTES: u64 = 365 * 24 * 60;

/// Bearer credential minted for a single run. Only `hash` and `expires_at` are persisted;
/// `token` is handed to the dispatch target once and then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRunToken {
    pub token: String,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

pub fn issue_run_token(now: DateTime<Utc>, ttl_minutes: u64) -> IssuedRunToken {
    let mut entropy = [0_u8; RUN_TOKEN_BYTES];
    rand::rng().fill_bytes(&mut entropy);
    let token = hex::encode(entropy);
    let hash = hash_run_token(&token);
    let ttl = Duration::minutes(i64::try_from(ttl_minutes.min(MAX_TTL_MINUTES)).unwrap_or(0));
    IssuedRunToken {
        token,
        hash,
        expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}

pub fn hash_run_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Hashes the presented token and compares it to the stored hash in constant time.
pub fn verify_run_token(stored_hash: &str, presented_token: &str) -> bool {
    let presented_hash = hash_run_token(presented_token);
    constant_time_eq(stored_hash.as_bytes(), presented_hash.as_bytes())
}

pub fn is_expired(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at <= now
}

/// Length mismatch rejects immediately. Both sides are fixed-width digests in practice,
/// so the early return only reveals a malformed stored hash.
pub fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }

    let mut diff = 0_u8;
    for (a, b) in left.iter().zip(right.iter()) {
        diff |= *a ^ *b;
    }
    diff == 0
}
