//! Stateless-verifiable persistent-link hashes
//!
//! A hash is 20 lowercase hex characters: an 8-char random salt followed by
//! a 12-char truncation of HMAC-SHA256 over
//! `activityName|hashedTeacherCode|salt` under the server-wide secret.
//! Verification re-derives the HMAC from the embedded salt and the
//! candidate code's SHA-256 digest, so no server-side secret lookup is
//! needed.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Total hash length: salt + truncated HMAC
pub const PERSISTENT_HASH_LEN: usize = 20;

/// Leading salt length in hex characters
const SALT_LEN: usize = 8;

/// Trailing HMAC truncation in hex characters
const MAC_LEN: usize = 12;

/// A freshly minted persistent link hash
#[derive(Debug, Clone)]
pub struct PersistentHash {
    /// salt ‖ truncated HMAC, 20 hex chars
    pub hash: String,
    /// SHA-256 digest of the teacher code, hex
    pub hashed_teacher_code: String,
}

/// Outcome of verifying a candidate teacher code against a hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub valid: bool,
    pub error: Option<&'static str>,
}

impl Verification {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn invalid(error: &'static str) -> Self {
        Self {
            valid: false,
            error: Some(error),
        }
    }
}

/// SHA-256 digest of a teacher code, hex encoded
pub fn hash_teacher_code(teacher_code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(teacher_code.as_bytes());
    hex::encode(hasher.finalize())
}

/// Mint a hash binding an activity name and a teacher code under `secret`
pub fn generate_persistent_hash(
    activity_name: &str,
    teacher_code: &str,
    secret: &[u8],
) -> PersistentHash {
    let hashed_teacher_code = hash_teacher_code(teacher_code);
    let salt = random_salt();
    let mac = derive_mac(activity_name, &hashed_teacher_code, &salt, secret);
    PersistentHash {
        hash: format!("{salt}{mac}"),
        hashed_teacher_code,
    }
}

/// Verify a candidate teacher code against a hash.
///
/// Rejects hashes that are not exactly 20 characters without panicking.
/// The HMAC comparison is constant-time; a length mismatch is itself
/// treated as invalid, not an error.
pub fn verify_teacher_code_with_hash(
    activity_name: &str,
    hash: &str,
    candidate_code: &str,
    secret: &[u8],
) -> Verification {
    if hash.len() != PERSISTENT_HASH_LEN {
        return Verification::invalid("hash must be exactly 20 characters");
    }
    if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Verification::invalid("hash must be lowercase hex");
    }

    let (salt, embedded_mac) = hash.split_at(SALT_LEN);
    let candidate_hashed = hash_teacher_code(candidate_code);
    let expected_mac = derive_mac(activity_name, &candidate_hashed, salt, secret);

    if constant_time_eq(expected_mac.as_bytes(), embedded_mac.as_bytes()) {
        Verification::ok()
    } else {
        Verification::invalid("HMAC mismatch")
    }
}

fn derive_mac(activity_name: &str, hashed_teacher_code: &str, salt: &str, secret: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(format!("{activity_name}|{hashed_teacher_code}|{salt}").as_bytes());
    let digest = hex::encode(mac.finalize().into_bytes());
    digest[..MAC_LEN].to_string()
}

fn random_salt() -> String {
    let mut bytes = [0u8; SALT_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Constant-time byte comparison to prevent timing side-channels.
/// A length mismatch returns false without short-circuiting the scan.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret-key-of-decent-length";

    #[test]
    fn test_hash_shape() {
        let minted = generate_persistent_hash("raffle", "mysecret1", SECRET);
        assert_eq!(minted.hash.len(), PERSISTENT_HASH_LEN);
        assert!(minted.hash.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(minted.hashed_teacher_code.len(), 64);
    }

    #[test]
    fn test_verification_idempotence() {
        let minted = generate_persistent_hash("raffle", "mysecret1", SECRET);
        let v = verify_teacher_code_with_hash("raffle", &minted.hash, "mysecret1", SECRET);
        assert!(v.valid);
        assert!(v.error.is_none());
    }

    #[test]
    fn test_wrong_code_rejected() {
        let minted = generate_persistent_hash("raffle", "mysecret1", SECRET);
        let v = verify_teacher_code_with_hash("raffle", &minted.hash, "nope", SECRET);
        assert!(!v.valid);
    }

    #[test]
    fn test_wrong_activity_rejected() {
        let minted = generate_persistent_hash("raffle", "mysecret1", SECRET);
        let v = verify_teacher_code_with_hash("quiz", &minted.hash, "mysecret1", SECRET);
        assert!(!v.valid);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let minted = generate_persistent_hash("raffle", "mysecret1", SECRET);
        let v = verify_teacher_code_with_hash(
            "raffle",
            &minted.hash,
            "mysecret1",
            b"a-completely-different-server-key",
        );
        assert!(!v.valid);
    }

    #[test]
    fn test_length_guard_never_panics() {
        let bad_hashes = [
            String::new(),
            "short".to_string(),
            "f".repeat(19),
            "f".repeat(21),
            "f".repeat(100),
        ];
        for bad in &bad_hashes {
            let v = verify_teacher_code_with_hash("raffle", bad, "mysecret1", SECRET);
            assert!(!v.valid);
        }
    }

    #[test]
    fn test_non_hex_hash_rejected() {
        let v = verify_teacher_code_with_hash("raffle", &"z".repeat(20), "mysecret1", SECRET);
        assert!(!v.valid);
    }

    #[test]
    fn test_salts_differ_between_mints() {
        let a = generate_persistent_hash("raffle", "mysecret1", SECRET);
        let b = generate_persistent_hash("raffle", "mysecret1", SECRET);
        assert_ne!(a.hash, b.hash);
        // Both still verify against the same code.
        assert!(verify_teacher_code_with_hash("raffle", &a.hash, "mysecret1", SECRET).valid);
        assert!(verify_teacher_code_with_hash("raffle", &b.hash, "mysecret1", SECRET).valid);
    }

    #[test]
    fn test_constant_time_eq_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
    }
}
