//! Password generation and SCRAM-SHA-256 verifiers.
//!
//! Passwords are sent to PostgreSQL pre-hashed as SCRAM verifiers, and the
//! verifier stored in `pg_authid` is checked against the in-memory password
//! so role sync only alters a password when it actually changed.

use crate::error::ControllerError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};

pub const PASSWORD_LENGTH: usize = 64;

const SCRAM_PREFIX: &str = "SCRAM-SHA-256$";
const SCRAM_ITERATIONS: u32 = 4096;
const SCRAM_SALT_LENGTH: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Random alphanumeric password.
pub fn generate_password(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// SCRAM-SHA-256 verifier for `password` with a fresh random salt.
pub fn scram_sha256_verifier(password: &str) -> Result<String, ControllerError> {
    let mut salt = [0u8; SCRAM_SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    scram_sha256_verifier_with(password, &salt, SCRAM_ITERATIONS)
}

/// Verifier in PostgreSQL's format:
/// `SCRAM-SHA-256$<iterations>:<salt>$<StoredKey>:<ServerKey>`.
pub fn scram_sha256_verifier_with(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<String, ControllerError> {
    let salted = salted_password(password, salt, iterations);
    let client_key = hmac_sha256(&salted, b"Client Key")?;
    let stored_key = Sha256::digest(&client_key);
    let server_key = hmac_sha256(&salted, b"Server Key")?;

    Ok(format!(
        "{}{}:{}${}:{}",
        SCRAM_PREFIX,
        iterations,
        STANDARD.encode(salt),
        STANDARD.encode(stored_key),
        STANDARD.encode(server_key)
    ))
}

/// True when `verifier` is a SCRAM-SHA-256 verifier of `password`.
///
/// Absent, MD5 and malformed verifiers never match.
pub fn password_matches(verifier: Option<&str>, password: &str) -> bool {
    let Some(rest) = verifier.and_then(|v| v.strip_prefix(SCRAM_PREFIX)) else {
        return false;
    };
    let Some((params, keys)) = rest.split_once('$') else {
        return false;
    };
    let Some((iterations, salt)) = params.split_once(':') else {
        return false;
    };
    let Some((stored_key, _server_key)) = keys.split_once(':') else {
        return false;
    };

    let (Ok(iterations), Ok(salt), Ok(stored_key)) = (
        iterations.parse::<u32>(),
        STANDARD.decode(salt),
        STANDARD.decode(stored_key),
    ) else {
        return false;
    };

    let salted = salted_password(password, &salt, iterations);
    match hmac_sha256(&salted, b"Client Key") {
        Ok(client_key) => Sha256::digest(&client_key).as_slice() == stored_key.as_slice(),
        Err(_) => false,
    }
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut salted = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted);
    salted
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ControllerError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ControllerError::Validation(format!("invalid HMAC key: {}", e)))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
