//! Session identifier generation.

use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// Unique identifier for a terminal session.
pub type SessionId = String;

/// Number of random bytes behind each identifier.
pub const SESSION_ID_BYTES: usize = 16;

/// Length of the hex-encoded identifier.
pub const SESSION_ID_LEN: usize = SESSION_ID_BYTES * 2;

/// The operating system could not supply random bytes.
#[derive(Error, Debug)]
#[error("entropy source unavailable: {0}")]
pub struct EntropySourceError(String);

/// Generates a fresh session identifier: 32 lowercase hex characters drawn
/// from the OS random source.
pub fn generate_session_id() -> Result<SessionId, EntropySourceError> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| EntropySourceError(e.to_string()))?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_id_format() {
        let id = generate_session_id().unwrap();
        assert_eq!(id.len(), SESSION_ID_LEN);
        assert!(id
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }

    #[test]
    fn test_session_ids_do_not_repeat() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = generate_session_id().unwrap();
            assert_eq!(id.len(), SESSION_ID_LEN);
            assert!(seen.insert(id), "duplicate session id generated");
        }
    }
}
