//! Signed URL scheme for direct file transfer without a live connection.
//!
//! The signature is deterministic: SHA-256 over
//! `path:operation:user:token[:expiration]`, base64 without padding, with a
//! version prefix. The daemon recomputes and compares it when serving the
//! upload/download endpoint.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use sha2::{Digest, Sha256};

/// Operation a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrlOperation {
    Read,
    Write,
}

impl UrlOperation {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            UrlOperation::Read => "read",
            UrlOperation::Write => "write",
        }
    }
}

/// Compute the signature for a file operation.
///
/// `expiration` is an absolute Unix timestamp in seconds; `None` signs a
/// non-expiring URL.
pub(crate) fn sign(
    path: &str,
    operation: UrlOperation,
    user: &str,
    token: &str,
    expiration: Option<i64>,
) -> String {
    let operation = operation.as_str();
    let raw = match expiration {
        None => format!("{path}:{operation}:{user}:{token}"),
        Some(expiration) => format!("{path}:{operation}:{user}:{token}:{expiration}"),
    };
    let digest = Sha256::digest(raw.as_bytes());
    format!("v1_{}", STANDARD_NO_PAD.encode(digest))
}
