//! # connect-id
//!
//! Typed identifiers for workloads managed by the connect worker.
//!
//! ## Design Principles
//!
//! - IDs are generated by the worker, never chosen by the requester
//! - Every ID is a valid DNS-1123 label, so it can name a Kubernetes object
//!   or a Docker container without escaping
//! - IDs are typed to prevent mixing a namespace with a storage claim
//!
//! ## ID Format
//!
//! `{prefix}{body}` where the prefix is a single lowercase letter and the body
//! is random lowercase alphanumerics:
//!
//! - `rk3x0c9q2m7hd1s8w4zt6yn5bf` (local runtime container, 25 char body)
//! - `w0f8d2kq9x3m1c7h5s4b6n2ta` (workspace, namespace or storage, 24 char body)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Alphabet used for ID bodies.
pub const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Generates a random ID body of `len` characters from [`ID_ALPHABET`].
#[doc(hidden)]
pub fn random_body(len: usize) -> String {
    use rand::Rng;

    let mut rng = rand::rng();
    (0..len)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Validates an ID body against [`ID_ALPHABET`].
#[doc(hidden)]
pub fn validate_body(body: &str, expected_len: usize) -> Result<(), IdError> {
    if body.len() != expected_len {
        return Err(IdError::InvalidLength {
            expected: expected_len,
            actual: body.len(),
        });
    }
    match body
        .chars()
        .find(|c| !c.is_ascii() || !ID_ALPHABET.contains(&(*c as u8)))
    {
        Some(c) => Err(IdError::InvalidCharacter(c)),
        None => Ok(()),
    }
}
