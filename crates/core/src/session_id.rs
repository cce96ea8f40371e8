use rand_core::{OsRng, RngCore};

use crate::CoreError;

/// Length of a generated session id.
pub const SESSION_ID_LENGTH: usize = 9;

/// Uppercase letters and digits without the look-alikes `0`, `O`, `1` and `I`,
/// so ids survive being read aloud or retyped.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Generates a short, human-shareable session id.
///
/// Uniqueness is not guaranteed here; callers retry until the store accepts
/// the key.
#[must_use]
pub fn generate() -> String {
    let mut bytes = [0u8; SESSION_ID_LENGTH];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|byte| ALPHABET[usize::from(*byte) % ALPHABET.len()] as char)
        .collect()
}

pub fn validate(session_id: &str) -> Result<(), CoreError> {
    if session_id.len() == SESSION_ID_LENGTH
        && session_id.bytes().all(|byte| ALPHABET.contains(&byte))
    {
        Ok(())
    } else {
        Err(CoreError::InvalidSessionId)
    }
}
