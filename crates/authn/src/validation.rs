//! Header-level checks that run before any key lookup.
//!
//! # Security
//!
//! - Only asymmetric algorithms are accepted, so a public key can never be
//!   reused as an HMAC secret (algorithm substitution).
//! - `none` and the HMAC family are rejected before the accepted list is
//!   consulted, with a distinct message.
//! - Key identifiers are bounded and restricted to printable ASCII so they are
//!   safe to log and to use as cache keys.

use crate::error::AuthError;

/// Algorithms that are never accepted.
///
/// - `none`: no signature at all
/// - `HS256`, `HS384`, `HS512`: symmetric, the verifier would need the secret
pub const FORBIDDEN_ALGORITHMS: &[&str] = &["none", "HS256", "HS384", "HS512"];

/// Algorithms with a complete verification path.
///
/// EdDSA verifies against OKP/Ed25519 keys, the RS family against RSA keys.
/// Anything else is rejected up front (RFC 8725 §3.1).
pub const ACCEPTED_ALGORITHMS: &[&str] = &["EdDSA", "RS256", "RS384", "RS512"];

/// Longest key identifier accepted from a token header, in bytes.
pub const MAX_KID_LEN: usize = 256;

/// Validate a JWT `alg` header value.
///
/// # Errors
///
/// Returns [`AuthError::UnsupportedAlgorithm`] if the algorithm is forbidden
/// or not in [`ACCEPTED_ALGORITHMS`].
///
/// # Examples
///
/// ```
/// use corpdir_authn::validation::validate_algorithm;
///
/// assert!(validate_algorithm("EdDSA").is_ok());
/// assert!(validate_algorithm("RS256").is_ok());
/// assert!(validate_algorithm("HS256").is_err());
/// assert!(validate_algorithm("ES256").is_err());
/// ```
pub fn validate_algorithm(alg: &str) -> Result<(), AuthError> {
    if FORBIDDEN_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not allowed for security reasons"
        )));
    }

    if !ACCEPTED_ALGORITHMS.contains(&alg) {
        return Err(AuthError::unsupported_algorithm(format!(
            "Algorithm '{alg}' is not in accepted list"
        )));
    }

    Ok(())
}

/// Validate a JWT `kid` header value.
///
/// # Errors
///
/// Returns [`AuthError::InvalidTokenFormat`] if the identifier is empty,
/// longer than [`MAX_KID_LEN`] bytes, or contains anything other than
/// printable, non-whitespace ASCII.
pub fn validate_kid(kid: &str) -> Result<(), AuthError> {
    if kid.is_empty() {
        return Err(AuthError::invalid_token_format("kid must not be empty"));
    }
    if kid.len() > MAX_KID_LEN {
        return Err(AuthError::invalid_token_format(format!(
            "kid exceeds {MAX_KID_LEN} bytes"
        )));
    }
    if !kid.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AuthError::invalid_token_format(
            "kid must contain only printable ASCII characters",
        ));
    }
    Ok(())
}
